use std::sync::Arc;

use async_trait::async_trait;
use confd_discovery::ServiceRecord;
use snafu::ResultExt as _;
use tracing::debug;

use super::{BuildError, CheckFamily, CheckInstance, Fetch};
use crate::fetcher::{RemoteFragment, RemoteMetadataFetcher};

/// Path under which services publish their own expvar check configuration.
pub const REMOTE_METADATA_PATH: &str = "/datadog/expvar";

impl CheckInstance for RemoteFragment {
    fn primary_url(&self) -> &str {
        &self.expvar_url
    }
}

/// Services named `<project>-go-expvar`.
///
/// Each service describes its own check instance, which is fetched from it and used as-is.
pub struct GoExpvarFamily {
    fetcher: Arc<RemoteMetadataFetcher>,
    node_address: String,
}

impl GoExpvarFamily {
    /// Creates a new `GoExpvarFamily`.
    ///
    /// `node_address` is used to reach services registered without an address of their own.
    pub fn new(fetcher: Arc<RemoteMetadataFetcher>, node_address: impl Into<String>) -> Self {
        Self {
            fetcher,
            node_address: node_address.into(),
        }
    }
}

#[async_trait]
impl CheckFamily for GoExpvarFamily {
    type Instance = RemoteFragment;

    fn name(&self) -> &'static str {
        "go-expvar"
    }

    fn service_suffix(&self) -> &'static str {
        "-go-expvar"
    }

    async fn build_instance(&self, project: &str, record: &ServiceRecord) -> Result<Option<RemoteFragment>, BuildError> {
        let address = if record.address.is_empty() {
            self.node_address.as_str()
        } else {
            record.address.as_str()
        };

        let url = format!("http://{}:{}{}", address, record.port, REMOTE_METADATA_PATH);
        let fragment = self.fetcher.fetch(&url).await.context(Fetch)?;

        if fragment.expvar_url.is_empty() {
            debug!(project, service_id = %record.id, url = %url, "Remote metadata has no expvar URL. Skipping.");
            return Ok(None);
        }

        Ok(Some(RemoteFragment::clone(&fragment)))
    }
}
