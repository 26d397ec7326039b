//! The entity tree published for the meter.

use crate::bus::{change_callback, BusValue, ObjectTree, PathSpec, TextFormat};
use crate::model::NormalizedSample;
use crate::role::{DeviceIdentity, Role};
use std::sync::Arc;
use tracing::{info, warn};

pub const PROCESS_NAME: &str = env!("CARGO_PKG_NAME");
pub const PROCESS_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_FIRMWARE: &str = "0.1";
pub const ROLE_PATH: &str = "/Role";

const METRICS: &[(&str, TextFormat)] = &[
    ("/Ac/Power", TextFormat::Watt),
    ("/Ac/Current", TextFormat::Ampere),
    ("/Ac/Frequency", TextFormat::Hertz),
    ("/Ac/Energy/Forward", TextFormat::KiloWattHour),
    ("/Ac/Energy/Reverse", TextFormat::KiloWattHour),
    ("/Ac/L1/Voltage", TextFormat::Volt),
    ("/Ac/L1/Current", TextFormat::Ampere),
    ("/Ac/L1/Power", TextFormat::Watt),
    ("/Ac/L1/Energy/Forward", TextFormat::KiloWattHour),
    ("/Ac/L1/Energy/Reverse", TextFormat::KiloWattHour),
    ("/Ac/L2/Voltage", TextFormat::Volt),
    ("/Ac/L2/Current", TextFormat::Ampere),
    ("/Ac/L2/Power", TextFormat::Watt),
    ("/Ac/L2/Energy/Forward", TextFormat::KiloWattHour),
    ("/Ac/L2/Energy/Reverse", TextFormat::KiloWattHour),
    ("/Ac/L3/Voltage", TextFormat::Volt),
    ("/Ac/L3/Current", TextFormat::Ampere),
    ("/Ac/L3/Power", TextFormat::Watt),
    ("/Ac/L3/Energy/Forward", TextFormat::KiloWattHour),
    ("/Ac/L3/Energy/Reverse", TextFormat::KiloWattHour),
    ("/Latency", TextFormat::Millis),
    ("/UpdateIndex", TextFormat::Raw),
];

/// Every metric path with its value in `sample`, in the order of [`METRICS`].
pub fn sample_values(sample: &NormalizedSample) -> Vec<(&'static str, BusValue)> {
    let mut values = vec![
        BusValue::from(sample.power),
        sample.current.into(),
        sample.frequency.into(),
        sample.energy_forward.into(),
        sample.energy_reverse.into(),
    ];
    for phase in &sample.phases {
        values.extend([
            BusValue::from(phase.voltage),
            phase.current.into(),
            phase.power.into(),
            phase.energy_forward.into(),
            phase.energy_reverse.into(),
        ]);
    }
    values.push(sample.latency_ms.into());
    values.push(sample.update_index.into());

    METRICS
        .iter()
        .map(|(path, _)| *path)
        .zip(values)
        .collect()
}

/// Static facts about the meter, known once the first poll has completed.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Meter address, or "test" for the canned payload
    pub connection: String,
    pub product_id: u32,
    pub product_name: String,
    pub firmware: Option<String>,
    pub serial: Option<String>,
}

/// Register the management, identity and metric paths on `tree`.
pub fn register(
    tree: &ObjectTree,
    info: &ServiceInfo,
    identity: Arc<DeviceIdentity>,
    sample: &NormalizedSample,
) {
    tree.add_path(PathSpec::new("/Mgmt/ProcessName", PROCESS_NAME));
    tree.add_path(PathSpec::new("/Mgmt/ProcessVersion", PROCESS_VERSION));
    tree.add_path(PathSpec::new("/Mgmt/Connection", info.connection.as_str()));

    tree.add_path(PathSpec::new("/DeviceInstance", identity.instance()));
    tree.add_path(PathSpec::new("/ProductId", info.product_id));
    tree.add_path(PathSpec::new("/ProductName", info.product_name.as_str()));
    tree.add_path(PathSpec::new(
        "/FirmwareVersion",
        info.firmware.as_deref().unwrap_or(DEFAULT_FIRMWARE),
    ));
    tree.add_path(PathSpec::new(
        "/HardwareVersion",
        info.serial.clone().map(BusValue::from).unwrap_or(BusValue::Null),
    ));
    tree.add_path(PathSpec::new("/Connected", 1u8));
    tree.add_path(PathSpec::new(
        "/AllowedRoles",
        BusValue::List(Role::ALLOWED.iter().map(|r| r.to_string()).collect()),
    ));

    let role_identity = identity.clone();
    tree.add_path(
        PathSpec::new(ROLE_PATH, identity.role().as_str()).writable(change_callback(
            move |_, value| {
                let requested = value.as_str().unwrap_or_default();
                match role_identity.set_role(requested) {
                    Ok(role) => {
                        info!(%role, identity = %role_identity.identity(), "role changed");
                        true
                    }
                    Err(e) => {
                        warn!(value = %value, error = %e, "role change refused");
                        false
                    }
                }
            },
        )),
    );

    let formats = METRICS.iter().map(|(_, format)| *format);
    for ((path, value), format) in sample_values(sample).into_iter().zip(formats) {
        tree.add_path(PathSpec::new(path, value).format(format));
    }
}
