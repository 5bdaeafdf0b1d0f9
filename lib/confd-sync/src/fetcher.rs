use std::{collections::BTreeMap, num::NonZeroUsize, sync::Arc, time::Duration};

use confd_common::{
    cache::{TtlCache, TtlCacheBuilder},
    telemetry::MetricsRegistry,
};
use confd_error::{generic_error, FailureScope, GenericError, ScopedFailure};
use metrics::{counter, Counter};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

const CACHE_CAPACITY: usize = 1024;

/// A remote metadata error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum FetchError {
    /// The peer could not be reached, or answered with a non-success status.
    #[snafu(display("Remote metadata unreachable at {}: {}", url, source))]
    Unreachable { url: String, source: GenericError },

    /// The peer's answer did not match the fragment schema.
    #[snafu(display("Malformed remote metadata from {}: {}", url, source))]
    Malformed { url: String, source: serde_yaml::Error },
}

impl ScopedFailure for FetchError {
    fn scope(&self) -> FailureScope {
        FailureScope::Entry
    }
}

/// One value in a metric mapping.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricField {
    Flag(bool),
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl From<&str> for MetricField {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// A single metric mapping, e.g. `{path: memstats/Alloc, type: gauge}`.
pub type MetricSpec = BTreeMap<String, MetricField>;

/// Check configuration published by a peer for itself.
#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteFragment {
    #[serde(default)]
    pub expvar_url: String,

    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

/// Fetches [`RemoteFragment`]s over HTTP, caching them by URL.
///
/// Every URL is fetched at most once per time-to-live, including when several callers miss at the same time. There is
/// no retry: a failed fetch is returned to the caller and nothing is cached.
pub struct RemoteMetadataFetcher {
    client: reqwest::Client,
    cache: TtlCache<String, Arc<RemoteFragment>>,
    fetch_errors: Counter,
}

impl RemoteMetadataFetcher {
    /// Creates a new `RemoteMetadataFetcher`.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be built, an error is returned.
    pub fn new(time_to_live: Duration, request_timeout: Duration, metrics: &MetricsRegistry) -> Result<Self, GenericError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| generic_error!("Failed to build remote metadata HTTP client: {}", e))?;

        let cache = TtlCacheBuilder::from_identifier("remote_config")?
            .with_time_to_live(time_to_live)
            .with_capacity(NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN))
            .with_metrics(metrics)
            .build();

        let fetch_errors = metrics.scoped(|| counter!("remote_config_fetch_errors_total"));

        Ok(Self {
            client,
            cache,
            fetch_errors,
        })
    }

    /// Returns the fragment published at `url`.
    ///
    /// # Errors
    ///
    /// If the peer cannot be reached, answers with a non-success status, or returns a body that does not parse, an
    /// error is returned.
    pub async fn fetch(&self, url: &str) -> Result<Arc<RemoteFragment>, FetchError> {
        let key = url.to_string();
        let result = self
            .cache
            .get_or_try_insert_with(&key, || async {
                debug!(url, "Fetching remote metadata.");
                self.fetch_uncached(url).await.map(Arc::new)
            })
            .await;

        if result.is_err() {
            self.fetch_errors.increment(1);
        }
        result
    }

    async fn fetch_uncached(&self, url: &str) -> Result<RemoteFragment, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(GenericError::from)
            .context(Unreachable { url })?;
        let body = response
            .bytes()
            .await
            .map_err(GenericError::from)
            .context(Unreachable { url })?;

        serde_yaml::from_slice(&body).context(Malformed { url })
    }
}
