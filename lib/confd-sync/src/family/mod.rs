//! Check families.
//!
//! A family decides which services it owns (by service-name suffix) and how one owned service becomes one check
//! instance in its configuration file.

use async_trait::async_trait;
use confd_discovery::ServiceRecord;
use confd_error::{FailureScope, ScopedFailure};
use serde::Serialize;
use snafu::Snafu;

use crate::fetcher::FetchError;

mod go_expvar;
pub use self::go_expvar::GoExpvarFamily;

mod php_fpm;
pub use self::php_fpm::{PhpFpmFamily, PhpFpmInstance};

/// An error building a single check instance.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub))]
pub enum BuildError {
    #[snafu(display("Failed to fetch remote check metadata: {}", source))]
    Fetch { source: FetchError },
}

impl ScopedFailure for BuildError {
    fn scope(&self) -> FailureScope {
        FailureScope::Entry
    }
}

/// A single entry of a check configuration file's `instances` list.
pub trait CheckInstance: Serialize + Clone + Ord + Send + Sync + 'static {
    /// The URL that identifies this instance, used as its sort key.
    fn primary_url(&self) -> &str;
}

/// A kind of check whose configuration file is derived from discovered services.
#[async_trait]
pub trait CheckFamily: Send + Sync + 'static {
    type Instance: CheckInstance;

    /// Name of the family, used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Service-name suffix that marks a service as belonging to this family.
    fn service_suffix(&self) -> &'static str;

    /// Returns the project name of `record` if this family owns it.
    fn project_of<'a>(&self, record: &'a ServiceRecord) -> Option<&'a str> {
        project_name(&record.name, self.service_suffix())
    }

    /// Builds the check instance for an owned service.
    ///
    /// `Ok(None)` means the service is owned but produces no instance.
    ///
    /// # Errors
    ///
    /// If the instance cannot be built, an error is returned and the service is left out of the current pass.
    async fn build_instance(&self, project: &str, record: &ServiceRecord) -> Result<Option<Self::Instance>, BuildError>;
}

/// Strips `suffix` from a service name, returning the remaining project name.
///
/// Names without the suffix, or consisting of nothing but the suffix, yield `None`.
pub fn project_name<'a>(service_name: &'a str, suffix: &str) -> Option<&'a str> {
    service_name.strip_suffix(suffix).filter(|project| !project.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_requires_suffix() {
        assert_eq!(project_name("billing-php-fpm", "-php-fpm"), Some("billing"));
        assert_eq!(project_name("billing-php-fpm-php-fpm", "-php-fpm"), Some("billing-php-fpm"));
        assert_eq!(project_name("billing-php", "-php-fpm"), None);
        assert_eq!(project_name("-php-fpm", "-php-fpm"), None);
        assert_eq!(project_name("api-go-expvar", "-php-fpm"), None);
    }

    #[test]
    fn suffix_is_matched_exactly() {
        // Trailing characters of the suffix must not be trimmed one by one.
        assert_eq!(project_name("mfpm", "-php-fpm"), None);
        assert_eq!(project_name("web-PHP-FPM", "-php-fpm"), None);
    }
}
