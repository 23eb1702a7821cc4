//! Startup configuration
//!
//! Both the relay and the consumers are configured from serde structs with
//! defaults, optionally loaded from a JSON file and then overridden by CLI
//! flags. Anything unusable is rejected here with `InvalidConfig` before a
//! socket is opened.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::calibration::CalibrationConfig;
use crate::error::{FocusError, FocusResult};
use crate::score::SmoothingConfig;
use crate::session::SessionConfig;
use crate::types::{RelayMode, Role, DEFAULT_HISTORY_LEN};

pub const DEFAULT_GAME_PORT: u16 = 5005;
pub const DEFAULT_DASHBOARD_PORT: u16 = 5006;
pub const DEFAULT_THRESHOLD: f64 = 70.0;

/// Default listening port for a role
pub fn default_port(role: Role) -> u16 {
    match role {
        Role::Game => DEFAULT_GAME_PORT,
        Role::Dashboard => DEFAULT_DASHBOARD_PORT,
    }
}

/// Resolve `host:port` to the first matching socket address
pub fn resolve(host: &str, port: u16) -> FocusResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| FocusError::InvalidConfig(format!("cannot resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| FocusError::InvalidConfig(format!("no address for {host}:{port}")))
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> FocusResult<T> {
    let contents = fs::read_to_string(path).map_err(|e| {
        FocusError::InvalidConfig(format!("cannot read config {}: {e}", path.display()))
    })?;
    let config = serde_json::from_str(&contents).map_err(|e| {
        FocusError::InvalidConfig(format!("cannot parse config {}: {e}", path.display()))
    })?;
    info!(path = %path.display(), "loaded configuration");
    Ok(config)
}

fn positive(name: &str, value: f64) -> FocusResult<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(FocusError::InvalidConfig(format!(
            "{name} must be > 0 (got {value})"
        )))
    }
}

/// A positive number of seconds that also fits in a `Duration`
fn seconds(name: &str, value: f64) -> FocusResult<()> {
    positive(name, value)?;
    Duration::try_from_secs_f64(value)
        .map(|_| ())
        .map_err(|e| FocusError::InvalidConfig(format!("{name} out of range ({value} s): {e}")))
}

/// Seconds to `Duration` without panicking on unvalidated input
fn duration(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

/// Relay process configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub mode: RelayMode,
    /// Upstream source spec, see `source::SourceSpec`
    pub source: String,
    pub game_host: String,
    pub game_port: u16,
    pub dashboard_host: String,
    pub dashboard_port: u16,
    /// Registration listener for implicit endpoints; disabled when `None`
    pub listen: Option<SocketAddr>,
    /// Scoring threshold in raw power units
    pub threshold: f64,
    pub penalty_factor: f64,
    /// Seconds of samples averaged into one score
    pub update_interval: f64,
    /// Seconds without a sample before upstream counts as disconnected
    pub connection_timeout: f64,
    /// Seconds an implicit endpoint survives without contact
    pub liveness_window: f64,
    pub send_timeout_ms: u64,
    /// Queued datagrams per endpoint before new ones are dropped
    pub outbox_capacity: usize,
    /// Registered endpoints beyond which new hellos are ignored
    pub max_endpoints: usize,
    pub smoothing: SmoothingConfig,
    /// Score above which the relay raises the ready flag
    pub ready_threshold: f64,
    /// Seconds the score must stay above `ready_threshold`
    pub ready_hold: f64,
    /// Run a calibration window at relay start and report it to dashboards
    pub calibrate: bool,
    pub calibration: CalibrationConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::Both,
            source: "synthetic".to_string(),
            game_host: "127.0.0.1".to_string(),
            game_port: DEFAULT_GAME_PORT,
            dashboard_host: "127.0.0.1".to_string(),
            dashboard_port: DEFAULT_DASHBOARD_PORT,
            listen: None,
            threshold: DEFAULT_THRESHOLD,
            penalty_factor: crate::score::DEFAULT_PENALTY_FACTOR,
            update_interval: 0.1,
            connection_timeout: 2.0,
            liveness_window: 10.0,
            send_timeout_ms: 50,
            outbox_capacity: 64,
            max_endpoints: crate::relay::DEFAULT_MAX_ENDPOINTS,
            smoothing: SmoothingConfig::default(),
            ready_threshold: 0.7,
            ready_hold: 0.0,
            calibrate: false,
            calibration: CalibrationConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> FocusResult<Self> {
        load_json(path.as_ref())
    }

    pub fn game_target(&self) -> FocusResult<SocketAddr> {
        resolve(&self.game_host, self.game_port)
    }

    pub fn dashboard_target(&self) -> FocusResult<SocketAddr> {
        resolve(&self.dashboard_host, self.dashboard_port)
    }

    /// Explicit (pinned) targets for every role the mode serves
    pub fn targets(&self) -> FocusResult<Vec<(Role, SocketAddr)>> {
        self.mode
            .roles()
            .iter()
            .map(|role| {
                let addr = match role {
                    Role::Game => self.game_target()?,
                    Role::Dashboard => self.dashboard_target()?,
                };
                Ok((*role, addr))
            })
            .collect()
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        duration(self.connection_timeout)
    }

    pub fn liveness_window(&self) -> Duration {
        duration(self.liveness_window)
    }

    pub fn validate(&self) -> FocusResult<()> {
        positive("threshold", self.threshold)?;
        if !(self.penalty_factor > 0.0 && self.penalty_factor < 1.0) {
            return Err(FocusError::InvalidConfig(format!(
                "penalty_factor must be in (0, 1) (got {})",
                self.penalty_factor
            )));
        }
        if !(self.smoothing.alpha > 0.0 && self.smoothing.alpha <= 1.0) {
            return Err(FocusError::InvalidConfig(format!(
                "smoothing alpha must be in (0, 1] (got {})",
                self.smoothing.alpha
            )));
        }
        if self.update_interval < 0.0
            || !self.update_interval.is_finite()
            || Duration::try_from_secs_f64(self.update_interval).is_err()
        {
            return Err(FocusError::InvalidConfig(format!(
                "update_interval must be >= 0 (got {})",
                self.update_interval
            )));
        }
        seconds("connection_timeout", self.connection_timeout)?;
        seconds("liveness_window", self.liveness_window)?;
        if self.send_timeout_ms == 0 {
            return Err(FocusError::InvalidConfig(
                "send_timeout_ms must be > 0".into(),
            ));
        }
        if self.outbox_capacity == 0 {
            return Err(FocusError::InvalidConfig(
                "outbox_capacity must be > 0".into(),
            ));
        }
        if self.max_endpoints == 0 {
            return Err(FocusError::InvalidConfig(
                "max_endpoints must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ready_threshold) || self.ready_hold < 0.0 {
            return Err(FocusError::InvalidConfig(format!(
                "ready threshold {} / hold {} out of range",
                self.ready_threshold, self.ready_hold
            )));
        }
        for role in self.mode.roles() {
            let port = match role {
                Role::Game => self.game_port,
                Role::Dashboard => self.dashboard_port,
            };
            if port == 0 {
                return Err(FocusError::InvalidConfig(format!("{role} port must not be 0")));
            }
        }
        if self.mode == RelayMode::Both {
            let game = self.game_target()?;
            let dashboard = self.dashboard_target()?;
            if game == dashboard {
                return Err(FocusError::InvalidConfig(format!(
                    "game and dashboard targets are both {game}"
                )));
            }
        }
        if self.calibrate {
            self.calibration.validate()?;
        }
        Ok(())
    }
}

/// Consumer (subscriber) process configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub role: Role,
    pub bind_host: String,
    /// Defaults to the role's port
    pub port: Option<u16>,
    /// Relay registration address to send hello datagrams to
    pub relay: Option<SocketAddr>,
    /// Seconds between hello datagrams
    pub heartbeat_secs: f64,
    /// Seconds without a message before the link counts as stale
    pub stale_after_secs: f64,
    /// Upper bound on one blocking receive, i.e. the local tick rate
    pub tick_secs: f64,
    /// Start a session as soon as the subscriber comes up
    pub auto_start: bool,
    pub history_len: usize,
    pub session: SessionConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            role: Role::Game,
            bind_host: "0.0.0.0".to_string(),
            port: None,
            relay: None,
            heartbeat_secs: 1.0,
            stale_after_secs: 2.0,
            tick_secs: 0.05,
            auto_start: true,
            history_len: DEFAULT_HISTORY_LEN,
            session: SessionConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> FocusResult<Self> {
        load_json(path.as_ref())
    }

    pub fn bind_addr(&self) -> FocusResult<SocketAddr> {
        resolve(&self.bind_host, self.port.unwrap_or(default_port(self.role)))
    }

    pub fn heartbeat(&self) -> Duration {
        duration(self.heartbeat_secs)
    }

    pub fn stale_after(&self) -> Duration {
        duration(self.stale_after_secs)
    }

    pub fn tick(&self) -> Duration {
        duration(self.tick_secs)
    }

    pub fn validate(&self) -> FocusResult<()> {
        seconds("heartbeat_secs", self.heartbeat_secs)?;
        seconds("stale_after_secs", self.stale_after_secs)?;
        seconds("tick_secs", self.tick_secs)?;
        if self.history_len == 0 {
            return Err(FocusError::InvalidConfig(
                "history_len must be at least 1".into(),
            ));
        }
        self.session.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let relay = RelayConfig::default();
        relay.validate().unwrap();
        assert_eq!(relay.game_port, 5005);
        assert_eq!(relay.dashboard_port, 5006);
        assert_eq!(relay.threshold, 70.0);
        ConsumerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_threshold() {
        for threshold in [0.0, -1.0, f64::NAN] {
            let config = RelayConfig {
                threshold,
                ..RelayConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(FocusError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_rejects_colliding_targets() {
        let config = RelayConfig {
            dashboard_port: 5005,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());

        // fine when only one role is served
        let config = RelayConfig {
            mode: RelayMode::Game,
            dashboard_port: 5005,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_port() {
        let config = RelayConfig {
            game_port: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_targets_follow_mode() {
        let config = RelayConfig {
            mode: RelayMode::Dashboard,
            ..RelayConfig::default()
        };
        let targets = config.targets().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, Role::Dashboard);
        assert_eq!(targets[0].1.port(), 5006);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"mode":"game","threshold":42.0}"#).unwrap();
        assert_eq!(config.mode, RelayMode::Game);
        assert_eq!(config.threshold, 42.0);
        assert_eq!(config.game_port, DEFAULT_GAME_PORT);
        assert_eq!(config.smoothing, SmoothingConfig::default());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = RelayConfig::load_from_file("/nonexistent/focus.json").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_consumer_port_defaults_by_role() {
        let config = ConsumerConfig {
            role: Role::Dashboard,
            ..ConsumerConfig::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 5006);
    }

    #[test]
    fn test_rejects_zero_endpoint_cap() {
        let config = RelayConfig {
            max_endpoints: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FocusError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_durations_that_do_not_fit() {
        let config = RelayConfig {
            connection_timeout: 1e20,
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FocusError::InvalidConfig(_))
        ));
        // accessors saturate instead of panicking
        assert_eq!(config.connection_timeout(), Duration::MAX);

        let consumer = ConsumerConfig {
            stale_after_secs: 1e20,
            ..ConsumerConfig::default()
        };
        assert!(consumer.validate().is_err());
        assert_eq!(consumer.stale_after(), Duration::MAX);
    }
}
