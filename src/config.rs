use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HostConfig {
    pub application: ApplicationConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ApplicationConfig {
    /// Environment (zone) the application is deployed to
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Application name
    #[serde(default = "default_application_name")]
    pub name: String,

    /// Instance name; a random identifier when unset
    #[serde(default = "default_instance")]
    pub instance: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ShutdownConfig {
    /// Total time allowed for a graceful shutdown, in milliseconds
    #[serde(default = "default_shutdown_timeout_ms")]
    pub timeout_ms: u64,

    /// Upper bound for beacon de-registration, in milliseconds
    #[serde(default = "default_beacon_timeout_ms")]
    pub beacon_timeout_ms: u64,

    /// Poll the directory until the instance disappears before signalling the application
    #[serde(default = "default_wait_for_beacon_deregistration")]
    pub wait_for_beacon_deregistration: bool,

    /// Treat SIGINT/SIGTERM/SIGQUIT as stop requests
    #[serde(default = "default_listen_os_signals")]
    pub listen_os_signals: bool,
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn beacon_timeout(&self) -> Duration {
        Duration::from_millis(self.beacon_timeout_ms)
    }
}

impl HostConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("apphost.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("application.environment", default_environment())?
            .set_default("application.name", default_application_name())?
            .set_default("application.instance", default_instance())?
            .set_default("shutdown.timeout_ms", default_shutdown_timeout_ms())?
            .set_default("shutdown.beacon_timeout_ms", default_beacon_timeout_ms())?
            .set_default(
                "shutdown.wait_for_beacon_deregistration",
                default_wait_for_beacon_deregistration(),
            )?
            .set_default("shutdown.listen_os_signals", default_listen_os_signals())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with APPHOST_ prefix, e.g. APPHOST_SHUTDOWN__TIMEOUT_MS
            .add_source(Environment::with_prefix("APPHOST").separator("__"))
            .build()?;

        let config: HostConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application.name.trim().is_empty() {
            return Err(ConfigError::Message(
                "Application name must not be empty".to_string(),
            ));
        }

        if self.application.instance.trim().is_empty() {
            return Err(ConfigError::Message(
                "Application instance must not be empty".to_string(),
            ));
        }

        if self.shutdown.timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Shutdown timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                environment: default_environment(),
                name: default_application_name(),
                instance: default_instance(),
            },
            shutdown: ShutdownConfig {
                timeout_ms: default_shutdown_timeout_ms(),
                beacon_timeout_ms: default_beacon_timeout_ms(),
                wait_for_beacon_deregistration: default_wait_for_beacon_deregistration(),
                listen_os_signals: false,
            },
        }
    }
}

// Default value functions
fn default_environment() -> String {
    "default".to_string()
}
fn default_application_name() -> String {
    "application".to_string()
}
fn default_instance() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}
fn default_beacon_timeout_ms() -> u64 {
    5000
}
fn default_wait_for_beacon_deregistration() -> bool {
    true
}
fn default_listen_os_signals() -> bool {
    true
}
