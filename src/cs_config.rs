// Participant configuration, loaded from YAML

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cs_error::{CsError, Result};
use crate::cs_interface::REGISTRY_PARTICIPANT_NAME;
use crate::cs_io_context::SocketOptions;
use crate::cs_uri::Uri;

// ============================================================================
// Main Configuration
// ============================================================================

/// Everything a participant needs to join a simulation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ParticipantConfiguration {
    /// Unique name within the simulation
    pub participant_name: String,

    /// Where the registry accepts connections
    pub registry_uri: String,

    /// Acceptors opened on join; port 0 picks an ephemeral port
    pub acceptor_uris: Vec<String>,

    pub middleware: MiddlewareConfig,

    pub lifecycle: LifecycleConfig,

    pub time_sync: TimeSyncConfig,
}

impl Default for ParticipantConfiguration {
    fn default() -> Self {
        Self {
            participant_name: String::new(),
            registry_uri: "silkit://localhost:8500".to_string(),
            acceptor_uris: vec!["tcp://0.0.0.0:0".to_string()],
            middleware: MiddlewareConfig::default(),
            lifecycle: LifecycleConfig::default(),
            time_sync: TimeSyncConfig::default(),
        }
    }
}

impl ParticipantConfiguration {
    /// Defaults with the given name.
    pub fn named(participant_name: &str) -> Self {
        Self {
            participant_name: participant_name.to_string(),
            ..Self::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| CsError::configuration(format!("invalid participant configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            CsError::configuration(format!("cannot read configuration '{}': {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.participant_name.is_empty() {
            return Err(CsError::configuration("participant name must not be empty"));
        }
        if self.participant_name == REGISTRY_PARTICIPANT_NAME {
            return Err(CsError::configuration(format!(
                "participant name '{}' is reserved for the registry",
                REGISTRY_PARTICIPANT_NAME
            )));
        }
        let registry = Uri::parse(&self.registry_uri)?;
        if registry.is_local() {
            return Err(CsError::configuration(
                "registry uri must use the silkit:// or tcp:// scheme",
            ));
        }
        for uri in &self.acceptor_uris {
            Uri::parse(uri)?;
        }
        self.middleware.validate()?;
        if self.time_sync.step_period_ns == 0 {
            return Err(CsError::configuration("time sync step period must be positive"));
        }
        Ok(())
    }

    pub fn registry(&self) -> Result<Uri> {
        Uri::parse(&self.registry_uri)
    }

    pub fn step_period(&self) -> Duration {
        Duration::from_nanos(self.time_sync.step_period_ns)
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Connection establishment tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct MiddlewareConfig {
    /// Passes over the candidate list before a connect is reported failed
    pub connect_attempts: usize,

    pub tcp_no_delay: bool,

    pub tcp_quick_ack: bool,

    /// Prefer and advertise local-domain sockets
    pub enable_domain_sockets: bool,

    /// Relay through the registry when no direct link can be made
    pub registry_as_fallback_proxy: bool,

    /// Ask unreachable peers to dial back
    pub experimental_remote_participant_connection: bool,

    pub connect_timeout_seconds: f64,

    pub remote_connect_request_timeout_seconds: f64,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 1,
            tcp_no_delay: true,
            tcp_quick_ack: false,
            enable_domain_sockets: true,
            registry_as_fallback_proxy: true,
            experimental_remote_participant_connection: true,
            connect_timeout_seconds: 5.0,
            remote_connect_request_timeout_seconds: 5.0,
        }
    }
}

impl MiddlewareConfig {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("connectTimeoutSeconds", self.connect_timeout_seconds),
            ("remoteConnectRequestTimeoutSeconds", self.remote_connect_request_timeout_seconds),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(CsError::configuration(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_seconds)
    }

    pub fn remote_connect_request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.remote_connect_request_timeout_seconds)
    }

    /// Attempt count used by negotiators; zero is treated as one pass.
    pub fn connect_passes(&self) -> usize {
        self.connect_attempts.max(1)
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            tcp_no_delay: self.tcp_no_delay,
            tcp_quick_ack: self.tcp_quick_ack,
        }
    }
}

// ============================================================================
// Lifecycle / Time Sync
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    /// Wait for system commands instead of running on our own
    pub coordinated: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { coordinated: true }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeSyncConfig {
    pub step_period_ns: u64,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            step_period_ns: 1_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ParticipantConfiguration::default();
        assert_eq!(config.registry_uri, "silkit://localhost:8500");
        assert_eq!(config.acceptor_uris, vec!["tcp://0.0.0.0:0".to_string()]);
        assert_eq!(config.middleware.connect_attempts, 1);
        assert!(config.middleware.registry_as_fallback_proxy);
        assert!(config.lifecycle.coordinated);
        assert_eq!(config.step_period(), Duration::from_millis(1));

        // defaults are valid except for the missing name
        assert!(config.validate().is_err());
        assert!(ParticipantConfiguration::named("P1").validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
participantName: PubSub1
registryUri: silkit://127.0.0.1:8501
middleware:
  connectAttempts: 3
  tcpQuickAck: true
timeSync:
  stepPeriodNs: 7000000
"#;
        let config = ParticipantConfiguration::from_yaml_str(yaml).unwrap();
        assert_eq!(config.participant_name, "PubSub1");
        assert_eq!(config.registry().unwrap().port(), 8501);
        assert_eq!(config.middleware.connect_passes(), 3);
        assert!(config.middleware.socket_options().tcp_quick_ack);
        assert!(config.middleware.enable_domain_sockets);
        assert_eq!(config.step_period(), Duration::from_millis(7));
    }

    #[test]
    fn test_validation_errors() {
        let reserved = "participantName: SilKitRegistry\n";
        assert!(matches!(
            ParticipantConfiguration::from_yaml_str(reserved),
            Err(CsError::Configuration(_))
        ));

        let bad_uri = "participantName: P1\nregistryUri: localhost\n";
        assert!(matches!(
            ParticipantConfiguration::from_yaml_str(bad_uri),
            Err(CsError::Configuration(_))
        ));

        let bad_timeout = "participantName: P1\nmiddleware:\n  connectTimeoutSeconds: 0\n";
        assert!(matches!(
            ParticipantConfiguration::from_yaml_str(bad_timeout),
            Err(CsError::Configuration(_))
        ));

        let unknown = "participantName: P1\nbogus: 1\n";
        assert!(ParticipantConfiguration::from_yaml_str(unknown).is_err());
    }

    #[test]
    fn test_zero_attempts_is_one_pass() {
        let mut middleware = MiddlewareConfig::default();
        middleware.connect_attempts = 0;
        assert_eq!(middleware.connect_passes(), 1);
    }
}
