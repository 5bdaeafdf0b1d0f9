//! API server.

use std::{
    future::{Future, IntoFuture as _},
    net::SocketAddr,
    time::Duration,
};

use axum::Router;
use confd_api::APIHandler;
use confd_error::{ErrorContext as _, GenericError};
use tokio::{net::TcpListener, select, sync::oneshot, time::sleep};
use tracing::{info, warn};

/// An API builder.
///
/// Composes an API server from multiple [`APIHandler`]s.
#[derive(Default)]
pub struct APIBuilder {
    router: Router,
}

impl APIBuilder {
    /// Creates a new `APIBuilder` with an empty router.
    ///
    /// Requests that no handler routes get a 404 Not Found response.
    pub fn new() -> Self {
        Self { router: Router::new() }
    }

    /// Adds the given handler to this builder.
    ///
    /// The initial state and routes provided by the handler will be merged into this builder.
    pub fn with_handler<H>(mut self, handler: H) -> Self
    where
        H: APIHandler,
    {
        let handler_router = handler.generate_routes();
        let handler_state = handler.generate_initial_state();
        self.router = self.router.merge(handler_router.with_state(handler_state));

        self
    }

    /// Consumes the builder, returning the composed router.
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Binds to `listen_address` and serves the API until `shutdown` resolves.
    ///
    /// See [`serve_on`][Self::serve_on] for shutdown behavior.
    ///
    /// ## Errors
    ///
    /// If the address cannot be bound, or the server fails while accepting connections, an error will be returned.
    pub async fn serve<F>(
        self, listen_address: SocketAddr, shutdown: F, grace_period: Duration,
    ) -> Result<(), GenericError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(listen_address)
            .await
            .with_error_context(|| format!("Failed to bind API listener to {}.", listen_address))?;

        self.serve_on(listener, shutdown, grace_period).await
    }

    /// Serves the API on an already-bound listener until `shutdown` resolves.
    ///
    /// Once `shutdown` resolves, no new connections are accepted. In-flight requests are given up to `grace_period`
    /// to complete, after which the server returns regardless.
    ///
    /// ## Errors
    ///
    /// If the server fails while accepting connections, an error will be returned.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F, grace_period: Duration) -> Result<(), GenericError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr().error_context("Failed to get API listener address.")?;
        info!(listen_addr = %local_addr, "Serving API.");

        let (draining_tx, draining_rx) = oneshot::channel();
        let server = axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                let _ = draining_tx.send(());
            })
            .into_future();

        let grace_deadline = async move {
            match draining_rx.await {
                Ok(()) => sleep(grace_period).await,
                Err(_) => std::future::pending().await,
            }
        };

        select! {
            result = server => result.error_context("API server failed.")?,
            _ = grace_deadline => {
                warn!(grace_period_secs = grace_period.as_secs(), "In-flight API requests did not finish within the grace period.");
            }
        }

        info!(listen_addr = %local_addr, "API server stopped.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::routing::get;
    use tokio::{io::AsyncReadExt as _, io::AsyncWriteExt as _, net::TcpStream, sync::Notify};

    use super::*;

    struct HelloHandler;

    impl APIHandler for HelloHandler {
        type State = ();

        fn generate_initial_state(&self) -> Self::State {}

        fn generate_routes(&self) -> Router<Self::State> {
            Router::new().route("/hello", get(|| async { "hello" }))
        }
    }

    async fn raw_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&stop);

        let server = tokio::spawn(APIBuilder::new().with_handler(HelloHandler).serve_on(
            listener,
            async move { stop_signal.notified().await },
            Duration::from_secs(5),
        ));

        let response = raw_get(addr, "/hello").await;
        assert!(response.starts_with("HTTP/1.1 200"), "response: {}", response);
        assert!(response.ends_with("hello"));

        let response = raw_get(addr, "/missing").await;
        assert!(response.starts_with("HTTP/1.1 404"), "response: {}", response);

        stop.notify_one();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn grace_period_bounds_shutdown() {
        struct SlowHandler;

        impl APIHandler for SlowHandler {
            type State = ();

            fn generate_initial_state(&self) -> Self::State {}

            fn generate_routes(&self) -> Router<Self::State> {
                Router::new().route(
                    "/slow",
                    get(|| async {
                        sleep(Duration::from_secs(30)).await;
                        "late"
                    }),
                )
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&stop);

        let server = tokio::spawn(APIBuilder::new().with_handler(SlowHandler).serve_on(
            listener,
            async move { stop_signal.notified().await },
            Duration::from_millis(100),
        ));

        let _client = tokio::spawn(raw_get(addr, "/slow"));
        sleep(Duration::from_millis(100)).await;

        stop.notify_one();
        let finished = tokio::time::timeout(Duration::from_secs(5), server).await;
        assert!(finished.is_ok(), "server did not stop within the grace period");
    }
}
