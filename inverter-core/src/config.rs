//! Runtime configuration, loaded from the environment (optionally via a
//! `.env` file) and validated before the coordinator ever starts.

use std::net::{IpAddr, UdpSocket};

use thiserror::Error;

use crate::model::{known_model_names, ModelName};

const MIN_SCAN_INTERVAL_SECS: u64 = 1;
const MAX_SCAN_INTERVAL_SECS: u64 = 3600;
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 30;
const DEFAULT_LOCAL_PORT: u16 = 8899;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid { name: &'static str, value: String, reason: String },
}

/// Everything one [`crate::coordinator::PollCoordinator`] needs to run.
#[derive(Debug, Clone)]
pub struct Config {
    pub inverter_ip: IpAddr,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub model: ModelName,
    pub scan_interval_secs: u64,
    pub log_level: String,
}

impl Config {
    /// Loads configuration from the process environment, having already
    /// merged in a `.env` file if the caller loaded one via `dotenvy`.
    ///
    /// Recognized variables: `INVERTER_IP` (required), `LOCAL_IP`
    /// (default: auto-detected from the route to `INVERTER_IP`), `LOCAL_PORT`
    /// (default 8899), `INVERTER_MODEL` (required), `SCAN_INTERVAL_SECS`
    /// (default 30), `LOG_LEVEL` (default `info`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let inverter_ip: IpAddr = parse_required("INVERTER_IP")?;
        let local_ip = match std::env::var("LOCAL_IP") {
            Ok(raw) => raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                name: "LOCAL_IP",
                value: raw,
                reason: e.to_string(),
            })?,
            Err(_) => detect_local_ip(inverter_ip)?,
        };
        let local_port = parse_optional("LOCAL_PORT", DEFAULT_LOCAL_PORT)?;
        let model = parse_model("INVERTER_MODEL")?;
        let scan_interval_secs = parse_optional("SCAN_INTERVAL_SECS", DEFAULT_SCAN_INTERVAL_SECS)?;
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let config = Self {
            inverter_ip,
            local_ip,
            local_port,
            model,
            scan_interval_secs,
            log_level,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_SCAN_INTERVAL_SECS..=MAX_SCAN_INTERVAL_SECS).contains(&self.scan_interval_secs) {
            return Err(ConfigError::Invalid {
                name: "SCAN_INTERVAL_SECS",
                value: self.scan_interval_secs.to_string(),
                reason: format!("must be between {MIN_SCAN_INTERVAL_SECS} and {MAX_SCAN_INTERVAL_SECS}"),
            });
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scan_interval_secs)
    }
}

/// Finds the local address the OS would use to reach `inverter_ip`, without
/// sending any traffic — the same "connect a UDP socket, read its local
/// address" trick used to auto-detect a LAN-facing interface.
fn detect_local_ip(inverter_ip: IpAddr) -> Result<IpAddr, ConfigError> {
    let bind_addr = if inverter_ip.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).map_err(|e| ConfigError::Invalid {
        name: "LOCAL_IP",
        value: "<auto-detect>".to_string(),
        reason: format!("failed to auto-detect local address: {e}"),
    })?;
    socket.connect((inverter_ip, 80)).map_err(|e| ConfigError::Invalid {
        name: "LOCAL_IP",
        value: "<auto-detect>".to_string(),
        reason: format!("failed to auto-detect local address: {e}"),
    })?;
    socket
        .local_addr()
        .map(|addr| addr.ip())
        .map_err(|e| ConfigError::Invalid {
            name: "LOCAL_IP",
            value: "<auto-detect>".to_string(),
            reason: format!("failed to auto-detect local address: {e}"),
        })
}

fn parse_required<T>(name: &'static str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).map_err(|_| ConfigError::Missing(name))?;
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

fn parse_optional<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_model(name: &'static str) -> Result<ModelName, ConfigError> {
    let raw = std::env::var(name).map_err(|_| ConfigError::Missing(name))?;
    known_model_names()
        .iter()
        .copied()
        .find(|known| *known == raw)
        .ok_or_else(|| ConfigError::Invalid {
            name,
            value: raw,
            reason: format!("must be one of {:?}", known_model_names()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in ["INVERTER_IP", "LOCAL_IP", "LOCAL_PORT", "INVERTER_MODEL", "SCAN_INTERVAL_SECS", "LOG_LEVEL"] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn missing_required_variable_is_reported() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("INVERTER_IP"))));
    }

    #[test]
    fn valid_environment_produces_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("INVERTER_IP", "192.168.1.50");
        std::env::set_var("LOCAL_IP", "192.168.1.10");
        std::env::set_var("INVERTER_MODEL", "ISOLAR_SMG_II_11K");

        let config = Config::from_env().unwrap();
        assert_eq!(config.local_port, DEFAULT_LOCAL_PORT);
        assert_eq!(config.scan_interval_secs, DEFAULT_SCAN_INTERVAL_SECS);
        assert_eq!(config.log_level, "info");
        clear_env();
    }

    #[test]
    fn out_of_range_scan_interval_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("INVERTER_IP", "192.168.1.50");
        std::env::set_var("LOCAL_IP", "192.168.1.10");
        std::env::set_var("INVERTER_MODEL", "ISOLAR_SMG_II_11K");
        std::env::set_var("SCAN_INTERVAL_SECS", "4000");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Invalid { name: "SCAN_INTERVAL_SECS", .. })));
        clear_env();
    }

    #[test]
    fn omitted_local_ip_is_auto_detected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("INVERTER_IP", "127.0.0.1");
        std::env::set_var("INVERTER_MODEL", "ISOLAR_SMG_II_11K");

        let config = Config::from_env().unwrap();
        assert_eq!(config.local_ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        clear_env();
    }

    #[test]
    fn unknown_model_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("INVERTER_IP", "192.168.1.50");
        std::env::set_var("LOCAL_IP", "192.168.1.10");
        std::env::set_var("INVERTER_MODEL", "NOT_A_REAL_MODEL");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Invalid { name: "INVERTER_MODEL", .. })));
        clear_env();
    }
}
