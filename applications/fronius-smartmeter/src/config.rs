use crate::error::{AppError, Result};
use crate::role::Role;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use std::{fs, path::Path};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub meter: MeterConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Meter address, or "test" for the canned fixture. Absent means discover.
    pub ip: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Replaces the built-in canned payload in test mode
    pub fixture_path: Option<String>,
    #[serde(default = "default_single_phase_models")]
    pub single_phase_models: Vec<String>,
    #[serde(default = "default_no_phase_energy_models")]
    pub no_phase_energy_models: Vec<String>,
}

fn default_poll_interval_ms() -> u64 {
    700
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_max_consecutive_failures() -> u32 {
    10
}
fn default_single_phase_models() -> Vec<String> {
    vec!["Smart Meter TS 100A-1".into(), "Smart Meter 63A-1".into()]
}
fn default_no_phase_energy_models() -> Vec<String> {
    vec!["Smart Meter TS 65A-3".into()]
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            ip: None,
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            fixture_path: None,
            single_phase_models: default_single_phase_models(),
            no_phase_energy_models: default_no_phase_energy_models(),
        }
    }
}

impl MeterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: Ipv4Addr,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Name prefix of already-running inverter services on the bus
    #[serde(default = "default_bus_service_prefix")]
    pub bus_service_prefix: String,
    /// How long to collect retained bus entries before reading them
    #[serde(default = "default_bus_settle_ms")]
    pub bus_settle_ms: u64,
}

fn default_local_port() -> u16 {
    50050
}
fn default_remote_port() -> u16 {
    50049
}
fn default_broadcast_address() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_attempts() -> u32 {
    4
}
fn default_bus_service_prefix() -> String {
    "com.victronenergy.pvinverter.".into()
}
fn default_bus_settle_ms() -> u64 {
    1500
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            local_port: default_local_port(),
            remote_port: default_remote_port(),
            broadcast_address: default_broadcast_address(),
            timeout_ms: default_timeout_ms(),
            attempts: default_attempts(),
            bus_service_prefix: default_bus_service_prefix(),
            bus_settle_ms: default_bus_settle_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn bus_settle(&self) -> Duration {
        Duration::from_millis(self.bus_settle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_device_instance")]
    pub device_instance: u32,
    /// Value used by ac_sensor_bridge for AC meters
    #[serde(default = "default_product_id")]
    pub product_id: u32,
    #[serde(default)]
    pub role: Role,
}

fn default_service_name() -> String {
    "com.victronenergy.grid.fronius".into()
}
fn default_device_instance() -> u32 {
    40
}
fn default_product_id() -> u32 {
    16
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            device_instance: default_device_instance(),
            product_id: default_product_id(),
            role: Role::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_topic_prefix() -> String {
    "fronius".into()
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// A missing file yields the built-in defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut cfg = if path.exists() {
            let raw = fs::read_to_string(path)?;
            Self::parse(&raw)?
        } else {
            Self::default()
        };

        if let Ok(ip) = std::env::var("METER_IP") {
            cfg.meter.ip = Some(ip);
        }
        if let Ok(host) = std::env::var("MQTT_HOST") {
            match cfg.mqtt.as_mut() {
                Some(mqtt) => mqtt.host = host,
                None => {
                    cfg.mqtt = Some(MqttConfig {
                        host,
                        port: default_mqtt_port(),
                        client_id: None,
                        username: None,
                        password: None,
                        keep_alive_secs: None,
                        topic_prefix: default_topic_prefix(),
                    })
                }
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let expanded = expand_env_placeholders(raw)?;
        Ok(serde_yaml::from_str(&expanded)?)
    }

    fn validate(&self) -> Result<()> {
        if self.meter.poll_interval_ms == 0 {
            return Err(AppError::Config("meter.poll_interval_ms must be > 0".into()));
        }
        if self.meter.max_consecutive_failures == 0 {
            return Err(AppError::Config(
                "meter.max_consecutive_failures must be > 0".into(),
            ));
        }
        if self.discovery.attempts == 0 {
            return Err(AppError::Config("discovery.attempts must be > 0".into()));
        }
        if let Some(mqtt) = &self.mqtt {
            if mqtt.host.is_empty() {
                return Err(AppError::Config("mqtt.host cannot be empty".into()));
            }
        }
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close).ok_or_else(|| {
            AppError::Config(format!("unterminated env placeholder: missing '{close}'"))
        })?;
        let val = std::env::var(&var)
            .map_err(|_| AppError::Config(format!("missing environment variable: {var}")))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Read characters until we hit `end`, consuming the delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
