use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Reported to the registry as the subscribing `app`; hostname when empty
    pub name: String,
    pub env: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            env: "prod".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub worker_num: usize,
    pub task_worker_num: usize,
    /// Push listener port, 0 disables it
    pub udp_port: u16,
    /// Address reported to the registry; resolved from the default route when unset
    pub announce_ip: Option<String>,
    pub ipc_send_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            worker_num: 4,
            task_worker_num: 0,
            udp_port: 0,
            announce_ip: None,
            ipc_send_timeout_ms: 10_000,
        }
    }
}

impl ServerConfig {
    /// Worker slots plus task worker slots
    #[must_use]
    pub const fn total_workers(&self) -> usize {
        self.worker_num + self.task_worker_num
    }

    #[must_use]
    pub const fn ipc_send_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc_send_timeout_ms)
    }

    /// Bind address of the push listener
    #[must_use]
    pub fn udp_address(&self) -> String {
        format!("{}:{}", self.host, self.udp_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Where the poll loop runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// One dedicated fetcher process polls and fans out to every worker
    #[default]
    Process,
    /// Every worker polls on its own
    Coroutine,
}

/// Registry backend a driver talks to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    #[default]
    Nacos,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub kind: DriverKind,
    pub url: String,
    pub group_name: String,
    pub namespace_id: String,
    /// Poll interval in seconds
    pub heartbeat: u64,
    pub ephemeral: bool,
    pub request_timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::Nacos,
            url: "http://127.0.0.1:8848".to_string(),
            group_name: "DEFAULT_GROUP".to_string(),
            namespace_id: "public".to_string(),
            heartbeat: 5,
            ephemeral: true,
            request_timeout_secs: 5,
        }
    }
}

impl DriverConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// An upstream service this process routes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSpec {
    pub name: String,
    pub namespace_id: String,
    pub load_balancer: String,
}

impl ConsumerSpec {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        namespace_id: impl Into<String>,
        load_balancer: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace_id: namespace_id.into(),
            load_balancer: load_balancer.into(),
        }
    }
}

/// A service this server publishes, removed from the registry on shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSpec {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnableConfig {
    pub discovery: bool,
    pub auto_logout: bool,
}

impl Default for EnableConfig {
    fn default() -> Self {
        Self {
            discovery: false,
            auto_logout: true,
        }
    }
}

/// Service governance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub enable: EnableConfig,
    /// Name of the active entry in `drivers`
    pub driver: String,
    pub mode: Mode,
    pub drivers: HashMap<String, DriverConfig>,
    pub consumers: Vec<ConsumerSpec>,
    pub registrations: Vec<RegistrationSpec>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        let mut drivers = HashMap::new();
        drivers.insert("nacos".to_string(), DriverConfig::default());
        Self {
            enable: EnableConfig::default(),
            driver: "nacos".to_string(),
            mode: Mode::Process,
            drivers,
            consumers: Vec::new(),
            registrations: Vec::new(),
        }
    }
}

impl ServicesConfig {
    #[must_use]
    pub fn driver_config(&self, name: &str) -> Option<&DriverConfig> {
        self.drivers.get(name)
    }

    /// Settings of the driver named by `driver`
    #[must_use]
    pub fn active_driver(&self) -> Option<&DriverConfig> {
        self.driver_config(&self.driver)
    }

    /// Name of the driver to run, `None` when discovery is off or no driver is named
    #[must_use]
    pub fn discovery_driver(&self) -> Option<&str> {
        if !self.enable.discovery || self.driver.is_empty() {
            return None;
        }
        Some(self.driver.as_str())
    }

    #[must_use]
    pub fn find_consumer(&self, service_name: &str) -> Option<&ConsumerSpec> {
        self.consumers.iter().find(|c| c.name == service_name)
    }

    fn validate_into(&self, errors: &mut Vec<String>) {
        let Some(driver_name) = self.discovery_driver() else {
            return;
        };

        match self.driver_config(driver_name) {
            None => errors.push(format!("services.driver '{driver_name}' has no entry in services.drivers")),
            Some(driver) => {
                if driver.heartbeat == 0 {
                    errors.push(format!("services.drivers.{driver_name}.heartbeat must be greater than 0"));
                }
                if let Err(e) = url::Url::parse(&driver.url) {
                    errors.push(format!("services.drivers.{driver_name}.url is invalid: {e}"));
                }
            }
        }

        let mut seen = HashSet::new();
        for consumer in &self.consumers {
            if consumer.name.is_empty() {
                errors.push("services.consumers entry with empty name".to_string());
                continue;
            }
            if consumer.load_balancer.is_empty() {
                errors.push(format!("services.consumers '{}' has no load_balancer", consumer.name));
            }
            if !seen.insert(consumer.name.as_str()) {
                errors.push(format!("services.consumers '{}' is listed more than once", consumer.name));
            }
        }

        for registration in &self.registrations {
            if registration.port == 0 {
                errors.push(format!("services.registrations '{}' has no port", registration.name));
            }
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // NODESYNC_SERVICES__ENABLE__DISCOVERY=true etc. Keys contain
        // underscores, so nesting uses a double underscore.
        builder = builder.add_source(
            Environment::with_prefix("NODESYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Collect every configuration problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.total_workers() == 0 {
            errors.push("server.worker_num must be at least 1".to_string());
        }
        if self.server.ipc_send_timeout_ms == 0 {
            errors.push("server.ipc_send_timeout_ms must be greater than 0".to_string());
        }
        self.services.validate_into(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn discovery_config() -> Config {
        let mut config = Config::default();
        config.services.enable.discovery = true;
        config.services.consumers = vec![
            ConsumerSpec::new("order-svc", "ns1", "rr"),
            ConsumerSpec::new("user-svc", "ns1", "random"),
        ];
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.total_workers(), 4);
        assert_eq!(config.services.mode, Mode::Process);
        assert!(!config.services.enable.discovery);
        assert!(config.services.enable.auto_logout);
        assert_eq!(config.services.active_driver().map(|d| d.heartbeat), Some(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_discovery_driver_gating() {
        let mut services = ServicesConfig::default();
        assert_eq!(services.discovery_driver(), None);

        services.enable.discovery = true;
        assert_eq!(services.discovery_driver(), Some("nacos"));

        services.driver = String::new();
        assert_eq!(services.discovery_driver(), None);
    }

    #[test]
    fn test_find_consumer() {
        let config = discovery_config();
        let consumer = config.services.find_consumer("order-svc").unwrap();
        assert_eq!(consumer.namespace_id, "ns1");
        assert_eq!(consumer.load_balancer, "rr");
        assert!(config.services.find_consumer("missing").is_none());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = discovery_config();
        config.server.worker_num = 0;
        config.services.consumers.push(ConsumerSpec::new("order-svc", "ns1", "rr"));
        config.services.consumers.push(ConsumerSpec::new("", "ns1", "rr"));
        if let Some(driver) = config.services.drivers.get_mut("nacos") {
            driver.heartbeat = 0;
            driver.url = "not a url".to_string();
        }

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 5, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("listed more than once")));
        assert!(errors.iter().any(|e| e.contains("heartbeat")));
    }

    #[test]
    fn test_validate_unknown_driver() {
        let mut config = discovery_config();
        config.services.driver = "consul".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("consul"));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
app:
  name: gateway
server:
  worker_num: 2
  udp_port: 9501
services:
  enable:
    discovery: true
  driver: nacos
  mode: coroutine
  drivers:
    nacos:
      url: http://nacos.local:8848
      group_name: api
      heartbeat: 3
  consumers:
    - name: order-svc
      namespace_id: ns1
      load_balancer: rr
"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.app.name, "gateway");
        assert_eq!(config.server.worker_num, 2);
        assert_eq!(config.server.udp_port, 9501);
        assert_eq!(config.services.mode, Mode::Coroutine);
        let driver = config.services.active_driver().unwrap();
        assert_eq!(driver.group_name, "api");
        assert_eq!(driver.interval(), Duration::from_secs(3));
        assert_eq!(driver.request_timeout_secs, 5);
        assert_eq!(config.services.consumers.len(), 1);
        assert!(config.validate().is_ok());
    }
}
