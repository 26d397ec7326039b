//! Locating the meter's datalogger on the LAN.
//!
//! Two strategies run in order: an inverter service already on the bus knows
//! the datalogger address, otherwise a `GetFroniusLoggerInfo` request is
//! broadcast over UDP and the first answer wins.

use crate::bus::{BusDirectory, BusValue};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use serde::Deserialize;
use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const DISCOVERY_REQUEST: &[u8] = br#"{"GetFroniusLoggerInfo":"all"}"#;
pub const CONNECTION_PATH: &str = "/Mgmt/Connection";
pub const FIRMWARE_PATH: &str = "/DataManagerVersion";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverySource {
    /// Taken from the named bus service
    Bus(String),
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredMeter {
    pub address: Ipv4Addr,
    pub firmware: Option<String>,
    pub source: DiscoverySource,
}

/// Resolve the meter address, bus first, then broadcast.
pub async fn resolve(
    cfg: &DiscoveryConfig,
    directory: Option<&dyn BusDirectory>,
) -> Result<DiscoveredMeter, DiscoveryError> {
    if let Some(found) = directory.and_then(|dir| from_bus(dir, &cfg.bus_service_prefix)) {
        return Ok(found);
    }
    broadcast(cfg).await
}

/// Take the address from the first bus service whose name starts with `prefix`.
///
/// The address is the first whitespace-delimited token of the service's
/// connection description. Reachability is not checked.
pub fn from_bus(directory: &dyn BusDirectory, prefix: &str) -> Option<DiscoveredMeter> {
    let service = directory
        .service_names()
        .into_iter()
        .find(|name| name.starts_with(prefix))?;
    info!(service = %service, "getting meter address from bus");

    let connection = directory.read(&service, CONNECTION_PATH)?;
    let firmware = directory
        .read(&service, FIRMWARE_PATH)
        .filter(|v| *v != BusValue::Null)
        .map(|v| v.to_string());
    let token = connection.to_string();
    let token = token.split_whitespace().next()?;
    let address = match token.parse::<Ipv4Addr>() {
        Ok(a) => a,
        Err(_) => {
            warn!(service = %service, connection = %connection, "bus connection info has no IPv4 address");
            return None;
        }
    };

    info!(%address, firmware = ?firmware, "found meter on bus");
    Some(DiscoveredMeter {
        address,
        firmware,
        source: DiscoverySource::Bus(service),
    })
}

/// Broadcast the logger-info request until a datalogger answers.
pub async fn broadcast(cfg: &DiscoveryConfig) -> Result<DiscoveredMeter, DiscoveryError> {
    let socket = bind_socket(cfg.local_port)?;
    let target = SocketAddrV4::new(cfg.broadcast_address, cfg.remote_port);
    let mut buf = [0u8; 1024];

    for attempt in 1..=cfg.attempts {
        info!(attempt, %target, "broadcasting logger info request");
        socket.send_to(DISCOVERY_REQUEST, target).await?;

        let (len, from) = match timeout(cfg.timeout(), socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                warn!(attempt, error = %e, "discovery receive failed");
                continue;
            }
            Err(_) => {
                debug!(attempt, "no discovery reply before timeout");
                continue;
            }
        };
        let address = match from {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => continue,
        };

        let firmware = firmware_from_reply(&buf[..len]);
        info!(%address, firmware = ?firmware, "found device");
        return Ok(DiscoveredMeter {
            address,
            firmware,
            source: DiscoverySource::Broadcast,
        });
    }

    Err(DiscoveryError::NotFound)
}

fn bind_socket(port: u16) -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[derive(Debug, Deserialize)]
struct LoggerInfoReply {
    #[serde(rename = "LoggerInfo")]
    logger_info: Option<LoggerInfo>,
}

#[derive(Debug, Deserialize)]
struct LoggerInfo {
    #[serde(rename = "SoftwareVersion")]
    software_version: Option<SoftwareVersion>,
}

#[derive(Debug, Deserialize)]
struct SoftwareVersion {
    #[serde(rename = "Major")]
    major: Value,
    #[serde(rename = "Minor")]
    minor: Value,
    #[serde(rename = "Release")]
    release: Value,
    #[serde(rename = "Build")]
    build: Value,
}

/// Dotted "Major.Minor.Release.Build" from a logger-info reply, if it carries one.
pub fn firmware_from_reply(reply: &[u8]) -> Option<String> {
    let parsed: LoggerInfoReply = match serde_json::from_slice(reply) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "unreadable discovery reply");
            return None;
        }
    };
    let sw = parsed.logger_info?.software_version?;
    let part = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(
        [&sw.major, &sw.minor, &sw.release, &sw.build]
            .map(part)
            .join("."),
    )
}
