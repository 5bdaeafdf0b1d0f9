use confd_error::{FailureScope, ScopedFailure};
use serde::Serialize;
use snafu::{ResultExt as _, Snafu};

use crate::family::CheckInstance;

const DOCUMENT_START: &[u8] = b"---\n";

/// A check document could not be serialized.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum EncodingError {
    #[snafu(display("Failed to serialize check document: {}", source))]
    Encode { source: serde_yaml::Error },
}

impl ScopedFailure for EncodingError {
    // Serialization of well-typed instances only fails on a programming error.
    fn scope(&self) -> FailureScope {
        FailureScope::Process
    }
}

/// The contents of one check configuration file.
///
/// Instances are kept sorted by their primary URL, so the same set of services always renders to the same bytes
/// regardless of discovery order.
#[derive(Debug, Serialize)]
pub struct CheckDocument<I> {
    init_config: Vec<String>,
    instances: Vec<I>,
}

impl<I: CheckInstance> CheckDocument<I> {
    pub fn new(mut instances: Vec<I>) -> Self {
        instances.sort_by(|a, b| a.primary_url().cmp(b.primary_url()).then_with(|| a.cmp(b)));

        Self {
            init_config: Vec::new(),
            instances,
        }
    }

    pub fn instances(&self) -> &[I] {
        &self.instances
    }

    /// Renders the document as YAML.
    ///
    /// # Errors
    ///
    /// If an instance fails to serialize, an error is returned.
    pub fn render(&self) -> Result<Vec<u8>, EncodingError> {
        let body = serde_yaml::to_string(self).context(Encode)?;

        let mut rendered = Vec::with_capacity(DOCUMENT_START.len() + body.len());
        rendered.extend_from_slice(DOCUMENT_START);
        rendered.extend_from_slice(body.as_bytes());
        Ok(rendered)
    }
}
