use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no meter answered discovery")]
    NotFound,
    #[error("discovery socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bus introspection error: {0}")]
    Bus(String),
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("meter answered with HTTP status {0}")]
    Status(u16),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected response envelope: missing {0}")]
    Envelope(&'static str),
    #[error("fixture error: {0}")]
    Fixture(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("mandatory field missing from payload: {0}")]
    MissingField(&'static str),
    #[error("payload does not match the meter schema: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
#[error("role {0:?} is not one of grid, pvinverter, genset")]
pub struct RoleRejected(pub String);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown path: {0}")]
    UnknownPath(String),
    #[error("path is not writable: {0}")]
    NotWritable(String),
    #[error("write to {0} refused")]
    Refused(String),
    #[error("MQTT error: {0}")]
    Mqtt(String),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("Acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),
    #[error("Normalization failed: {0}")]
    Normalization(#[from] NormalizationError),
    #[error(transparent)]
    Role(#[from] RoleRejected),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("{consecutive} consecutive poll failures, giving up")]
    RetriesExceeded { consecutive: u32 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
