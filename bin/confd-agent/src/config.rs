use std::{collections::BTreeMap, net::IpAddr, path::PathBuf, time::Duration};

use confd_common::deser::{EmptyStringAsNone, LenientFlag};
use confd_config::{ConfigurationError, ConfigurationLoader};
use serde::Deserialize;
use serde_with::serde_as;

const DEFAULT_CONFIG_FILE: &str = "/etc/confd-agent/confd.yaml";
const CONFIG_FILE_ENV_VAR: &str = "CONFD_CONFIG_FILE";
const ENV_PREFIX: &str = "CONFD";

/// Unprefixed variables from earlier deployments, and the keys they set.
const LEGACY_ENV_VARS: &[(&str, &str)] = &[
    ("PHP_FPM_CONFIG_FILE", "php_fpm_config_file"),
    ("GO_EXPR_CONFIG_FILE", "go_expvar_config_file"),
    ("DONT_RELOAD_DATADOG", "dont_reload_agent"),
];

const fn default_listen_port() -> u16 {
    4000
}

fn default_listen_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_consul_address() -> String {
    confd_discovery::consul::DEFAULT_CONSUL_ADDRESS.to_string()
}

const fn default_poll_interval_secs() -> u64 {
    5
}

const fn default_enabled() -> bool {
    true
}

fn default_php_fpm_config_file() -> PathBuf {
    PathBuf::from("/etc/dd-agent/conf.d/php_fpm.yaml")
}

fn default_go_expvar_config_file() -> PathBuf {
    PathBuf::from("/etc/dd-agent/conf.d/go_expvar.yaml")
}

const fn default_remote_config_ttl_secs() -> u64 {
    1800
}

const fn default_remote_fetch_timeout_secs() -> u64 {
    10
}

fn default_reload_command() -> String {
    "/usr/sbin/service".to_string()
}

fn default_reload_args() -> Vec<String> {
    vec!["datadog-agent".to_string(), "reload".to_string()]
}

const fn default_reload_timeout_secs() -> u64 {
    30
}

const fn default_shutdown_grace_period_secs() -> u64 {
    5
}

/// Daemon configuration.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct AgentConfiguration {
    /// Port for the gateway, self-metadata and introspection endpoints.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,

    /// Address written into generated URLs for services registered without one.
    ///
    /// Defaults to the node address reported by the discovery backend.
    #[serde_as(as = "EmptyStringAsNone")]
    #[serde(default)]
    pub advertise_address: Option<String>,

    #[serde(default = "default_consul_address")]
    pub consul_address: String,

    #[serde_as(as = "EmptyStringAsNone")]
    #[serde(default)]
    pub consul_token: Option<String>,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde_as(as = "LenientFlag")]
    #[serde(default = "default_enabled")]
    pub php_fpm_enabled: bool,

    #[serde_as(as = "LenientFlag")]
    #[serde(default = "default_enabled")]
    pub go_expvar_enabled: bool,

    #[serde(default = "default_php_fpm_config_file")]
    pub php_fpm_config_file: PathBuf,

    #[serde(default = "default_go_expvar_config_file")]
    pub go_expvar_config_file: PathBuf,

    #[serde(default = "default_remote_config_ttl_secs")]
    pub remote_config_ttl_secs: u64,

    /// Bound on a single remote metadata request, and on each step of a FastCGI call.
    #[serde(default = "default_remote_fetch_timeout_secs")]
    pub remote_fetch_timeout_secs: u64,

    /// Counts reloads without running the reload command.
    #[serde_as(as = "LenientFlag")]
    #[serde(default)]
    pub dont_reload_agent: bool,

    #[serde(default = "default_reload_command")]
    pub reload_command: String,

    #[serde(default = "default_reload_args")]
    pub reload_args: Vec<String>,

    #[serde(default = "default_reload_timeout_secs")]
    pub reload_timeout_secs: u64,

    #[serde(default = "default_shutdown_grace_period_secs")]
    pub shutdown_grace_period_secs: u64,
}

impl AgentConfiguration {
    /// Loads the configuration from the optional YAML file, legacy environment variables, and `CONFD_`-prefixed
    /// environment variables, in increasing order of precedence.
    ///
    /// # Errors
    ///
    /// If the environment cannot be read, or a value has the wrong type, an error is returned.
    pub fn load() -> Result<Self, ConfigurationError> {
        let config_file = std::env::var(CONFIG_FILE_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        Self::from_loader(
            ConfigurationLoader::default().try_from_yaml(config_file),
            |name| std::env::var(name).ok(),
            ENV_PREFIX,
        )
    }

    fn from_loader<L>(
        loader: ConfigurationLoader, lookup_env: L, env_prefix: &'static str,
    ) -> Result<Self, ConfigurationError>
    where
        L: Fn(&str) -> Option<String>,
    {
        loader
            .with_defaults(legacy_overrides(lookup_env))
            .from_environment(env_prefix)?
            .into_typed()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn remote_config_ttl(&self) -> Duration {
        Duration::from_secs(self.remote_config_ttl_secs)
    }

    pub fn remote_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_fetch_timeout_secs)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

fn legacy_overrides<L>(lookup_env: L) -> BTreeMap<String, String>
where
    L: Fn(&str) -> Option<String>,
{
    LEGACY_ENV_VARS
        .iter()
        .filter_map(|(var, key)| lookup_env(var).map(|value| (key.to_string(), value)))
        .collect()
}
