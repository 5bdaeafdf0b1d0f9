use async_trait::async_trait;
use confd_error::{FailureScope, GenericError, ScopedFailure};
use snafu::Snafu;

use crate::{NodeIdentity, RegistrySnapshot};

/// A discovery backend error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub))]
pub enum DiscoveryError {
    /// The backend could not be reached, or answered with a non-success status.
    #[snafu(display("Discovery backend unreachable at {}: {}", url, source))]
    Unreachable { url: String, source: GenericError },

    /// The backend answered with a body that could not be decoded.
    #[snafu(display("Malformed response from discovery backend at {}: {}", url, source))]
    Malformed { url: String, source: serde_json::Error },
}

impl ScopedFailure for DiscoveryError {
    fn scope(&self) -> FailureScope {
        FailureScope::Pass
    }
}

/// A source of discovered services.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Lists every service currently known to the backend.
    async fn list_services(&self) -> Result<RegistrySnapshot, DiscoveryError>;

    /// Returns the identity of the local node.
    async fn self_info(&self) -> Result<NodeIdentity, DiscoveryError>;
}
