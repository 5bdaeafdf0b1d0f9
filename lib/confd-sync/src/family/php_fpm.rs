use async_trait::async_trait;
use confd_discovery::ServiceRecord;
use serde::Serialize;

use super::{BuildError, CheckFamily, CheckInstance};

/// One php-fpm pool, checked through this daemon's FastCGI gateway.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PhpFpmInstance {
    pub status_url: String,
    pub ping_url: String,
    pub ping_reply: String,
    pub tags: Vec<String>,
}

impl CheckInstance for PhpFpmInstance {
    fn primary_url(&self) -> &str {
        &self.ping_url
    }
}

/// Services named `<project>-php-fpm`.
pub struct PhpFpmFamily {
    listen_port: u16,
    node_address: String,
}

impl PhpFpmFamily {
    /// Creates a new `PhpFpmFamily`.
    ///
    /// `listen_port` is the port the gateway listens on. `node_address` stands in for services registered without an
    /// address of their own.
    pub fn new(listen_port: u16, node_address: impl Into<String>) -> Self {
        Self {
            listen_port,
            node_address: node_address.into(),
        }
    }

    fn gateway_url(&self, project: &str, address: &str, port: u16, check_type: &str) -> String {
        format!(
            "http://{}:{}/php-fpm/{}/{}/{}/{}",
            address, self.listen_port, project, address, port, check_type
        )
    }
}

#[async_trait]
impl CheckFamily for PhpFpmFamily {
    type Instance = PhpFpmInstance;

    fn name(&self) -> &'static str {
        "php-fpm"
    }

    fn service_suffix(&self) -> &'static str {
        "-php-fpm"
    }

    async fn build_instance(&self, project: &str, record: &ServiceRecord) -> Result<Option<PhpFpmInstance>, BuildError> {
        let address = if record.address.is_empty() {
            self.node_address.as_str()
        } else {
            record.address.as_str()
        };

        Ok(Some(PhpFpmInstance {
            status_url: self.gateway_url(project, address, record.port, "status"),
            ping_url: self.gateway_url(project, address, record.port, "ping"),
            ping_reply: "pong".to_string(),
            tags: vec![format!("project:{}", project)],
        }))
    }
}
