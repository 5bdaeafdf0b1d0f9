//! Reconciliation of discovered services into check configuration files.
//!
//! Each [`Reconciler`] owns one [`CheckFamily`]. On every registry snapshot it selects the family's services, builds one
//! check instance per service, renders the sorted set as a [`CheckDocument`], and hands the bytes to a
//! [`ConfigCommitter`]. The committer writes only when the content changed, and the shared [`ReloadTrigger`] runs only
//! after a write.
#![deny(warnings)]

mod committer;
pub use self::committer::{CommitError, CommitOutcome, ConfigCommitter};

mod document;
pub use self::document::{CheckDocument, EncodingError};

pub mod family;
pub use self::family::{BuildError, CheckFamily, CheckInstance};

mod fetcher;
pub use self::fetcher::{FetchError, MetricField, MetricSpec, RemoteFragment, RemoteMetadataFetcher};

mod reconciler;
pub use self::reconciler::{ReconcileError, Reconciler};

mod reload;
pub use self::reload::{ReloadAction, ReloadError, ReloadOutcome, ReloadTrigger, ServiceCommandReload};
