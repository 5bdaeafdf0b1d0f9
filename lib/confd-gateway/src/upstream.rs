use std::{io, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use snafu::{ResultExt as _, Snafu};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, warn};

use crate::fastcgi::{encode_request, next_record, ProtocolError, ResponseCollector};

const READ_BUFFER_SIZE: usize = 8192;

/// The step of an upstream call that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamStage {
    Connect,
    Protocol,
    Read,
}

impl UpstreamStage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Protocol => "protocol",
            Self::Read => "read",
        }
    }

    /// Human-readable prefix for errors at this stage.
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Connect => "Could not connect to fastcgi upstream",
            Self::Protocol => "Failed fastcgi request",
            Self::Read => "Failed to read fastcgi response",
        }
    }
}

/// An upstream call failed.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum UpstreamError {
    #[snafu(display("{}: {}", target, source))]
    Connect { target: String, source: io::Error },

    #[snafu(display("{}", source))]
    Transmit { source: io::Error },

    #[snafu(display("{}", source))]
    Framing { source: ProtocolError },

    #[snafu(display("{}", source))]
    Receive { source: io::Error },

    #[snafu(display("timed out after {}ms", timeout_ms))]
    TimedOut { stage: UpstreamStage, timeout_ms: u128 },
}

impl UpstreamError {
    pub fn stage(&self) -> UpstreamStage {
        match self {
            Self::Connect { .. } => UpstreamStage::Connect,
            Self::Transmit { .. } | Self::Framing { .. } => UpstreamStage::Protocol,
            Self::Receive { .. } => UpstreamStage::Read,
            Self::TimedOut { stage, .. } => *stage,
        }
    }
}

/// One request to an upstream worker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub params: Vec<(String, String)>,
    pub stdin: Bytes,
}

impl UpstreamRequest {
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<Bytes>) -> Self {
        self.stdin = stdin.into();
        self
    }
}

/// A worker reachable at `host:port` that answers one request with one response body.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn call(&self, host: &str, port: u16, request: UpstreamRequest) -> Result<Bytes, UpstreamError>;
}

/// FastCGI client opening one connection per request.
pub struct FastCgiUpstream {
    timeout: Duration,
}

impl FastCgiUpstream {
    /// Creates a new `FastCgiUpstream`.
    ///
    /// Connecting, sending the request, and reading the response are each bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn timed_out(&self, stage: UpstreamStage) -> UpstreamError {
        UpstreamError::TimedOut {
            stage,
            timeout_ms: self.timeout.as_millis(),
        }
    }

    async fn read_response(stream: &mut TcpStream) -> Result<ResponseCollector, UpstreamError> {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut collector = ResponseCollector::default();
        let mut is_eof = false;

        loop {
            while let Some(record) = next_record(&mut buf, is_eof).context(Framing)? {
                if collector.push(record).context(Framing)? {
                    return Ok(collector);
                }
            }

            if is_eof {
                return Err(UpstreamError::Framing {
                    source: ProtocolError::MissingEndRequest,
                });
            }

            let n = stream.read_buf(&mut buf).await.context(Receive)?;
            is_eof = n == 0;
        }
    }
}

#[async_trait]
impl UpstreamClient for FastCgiUpstream {
    async fn call(&self, host: &str, port: u16, request: UpstreamRequest) -> Result<Bytes, UpstreamError> {
        let target = format!("{}:{}", host, port);

        let mut stream = timeout(self.timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| self.timed_out(UpstreamStage::Connect))?
            .context(Connect { target: target.clone() })?;

        let encoded = encode_request(&request.params, &request.stdin);
        timeout(self.timeout, stream.write_all(&encoded))
            .await
            .map_err(|_| self.timed_out(UpstreamStage::Protocol))?
            .context(Transmit)?;

        let collector = timeout(self.timeout, Self::read_response(&mut stream))
            .await
            .map_err(|_| self.timed_out(UpstreamStage::Read))??;

        if !collector.stderr().is_empty() {
            warn!(
                upstream = %target,
                stderr = %String::from_utf8_lossy(collector.stderr()),
                "FastCGI upstream wrote to its error stream."
            );
        }

        let body = collector.into_body();
        debug!(upstream = %target, body_len = body.len(), "FastCGI request completed.");
        Ok(body)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use bytes::BufMut as _;
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpListener,
    };

    use super::*;
    use crate::fastcgi::Record;

    fn raw_record(record_type: u8, content: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u8(record_type);
        buf.put_u16(1);
        buf.put_u16(content.len() as u16);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_slice(content);
        buf.to_vec()
    }

    /// Reply written by [`spawn_worker`] after it has read a full request.
    pub(crate) fn pong_reply() -> Vec<u8> {
        let mut reply = raw_record(6, b"Content-type: text/plain;charset=UTF-8\r\n\r\npong");
        reply.extend(raw_record(6, b""));
        reply.extend(raw_record(3, &[0, 0, 0, 0, 0, 0, 0, 0]));
        reply
    }

    /// Spawns a one-shot FastCGI worker that returns the records it received and answers with `reply`.
    pub(crate) async fn spawn_worker(reply: Vec<u8>) -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<Record>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let mut received = Vec::new();
            // The request ends with an empty STDIN record.
            loop {
                while let Some(record) = next_record(&mut buf, false).unwrap() {
                    let done = record.record_type == 5 && record.content.is_empty();
                    received.push(record);
                    if done {
                        socket.write_all(&reply).await.unwrap();
                        return received;
                    }
                }
                if socket.read_buf(&mut buf).await.unwrap() == 0 {
                    return received;
                }
            }
        });

        (addr, handle)
    }

    fn upstream() -> FastCgiUpstream {
        FastCgiUpstream::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn returns_body_without_headers() {
        let (addr, worker) = spawn_worker(pong_reply()).await;
        let request = UpstreamRequest::default()
            .with_param("REQUEST_METHOD", "GET")
            .with_param("SCRIPT_NAME", "/web/internal/ping");

        let body = upstream()
            .call(&addr.ip().to_string(), addr.port(), request)
            .await
            .unwrap();
        assert_eq!(body, Bytes::from_static(b"pong"));

        let received = worker.await.unwrap();
        let types = received.iter().map(|r| r.record_type).collect::<Vec<_>>();
        assert_eq!(types, vec![1, 4, 4, 5]);
    }

    #[tokio::test]
    async fn connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = upstream()
            .call(&addr.ip().to_string(), addr.port(), UpstreamRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.stage(), UpstreamStage::Connect);
    }

    #[tokio::test]
    async fn garbage_reply_is_a_protocol_failure() {
        let (addr, _worker) = spawn_worker(b"HTTP/1.1 200 OK\r\n\r\n".to_vec()).await;

        let err = upstream()
            .call(&addr.ip().to_string(), addr.port(), UpstreamRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.stage(), UpstreamStage::Protocol);
    }

    #[tokio::test]
    async fn early_close_is_a_protocol_failure() {
        let (addr, _worker) = spawn_worker(raw_record(6, b"Content-type: text/plain\r\n\r\npo")).await;

        let err = upstream()
            .call(&addr.ip().to_string(), addr.port(), UpstreamRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UpstreamError::Framing {
                source: ProtocolError::MissingEndRequest
            }
        ));
    }

    #[tokio::test]
    async fn silent_worker_times_out_while_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _accepting = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let err = FastCgiUpstream::new(Duration::from_millis(100))
            .call(&addr.ip().to_string(), addr.port(), UpstreamRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.stage(), UpstreamStage::Read);
        assert!(matches!(err, UpstreamError::TimedOut { .. }));
    }
}
