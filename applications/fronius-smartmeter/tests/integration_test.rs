use async_trait::async_trait;
use fronius_smartmeter::acquire::{Acquirer, MeterSource, MeterTarget, RawResponse};
use fronius_smartmeter::bus::{BusValue, ObjectTree, ProcessBus};
use fronius_smartmeter::config::Config;
use fronius_smartmeter::error::{AcquisitionError, BusError};
use fronius_smartmeter::model::ModelCatalog;
use fronius_smartmeter::poller::{Poller, TickOutcome};
use fronius_smartmeter::role::{DeviceIdentity, Role};
use fronius_smartmeter::service::{self, ServiceInfo, ROLE_PATH};
use pretty_assertions::assert_eq;
use serde_json::json;
use serial_test::serial;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn temp_file(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("fronius-smartmeter-{}-{name}", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

/// Test configuration loading
#[test]
#[serial]
fn test_config_loading() {
    std::env::remove_var("METER_IP");
    std::env::remove_var("MQTT_HOST");
    std::env::set_var("FRONIUS_TEST_BROKER_PASSWORD", "s3cret");

    let path = temp_file(
        "config.yaml",
        r#"
meter:
  ip: "192.168.1.20"
  max_consecutive_failures: 5
  single_phase_models:
    - "Smart Meter TS 100A-1"
discovery:
  timeout_ms: 1000
service:
  name: "com.victronenergy.grid.fronius_house"
  device_instance: 41
  role: genset
mqtt:
  host: "broker.lan"
  username: "meter"
  password: "$(FRONIUS_TEST_BROKER_PASSWORD)"
  topic_prefix: "venus"
"#,
    );
    let cfg = Config::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    std::env::remove_var("FRONIUS_TEST_BROKER_PASSWORD");

    assert_eq!(cfg.meter.ip.as_deref(), Some("192.168.1.20"));
    assert_eq!(cfg.meter.max_consecutive_failures, 5);
    assert_eq!(cfg.meter.poll_interval(), Duration::from_millis(700));
    assert_eq!(cfg.meter.single_phase_models, vec!["Smart Meter TS 100A-1"]);
    assert_eq!(cfg.discovery.timeout(), Duration::from_secs(1));
    assert_eq!(cfg.discovery.attempts, 4);
    assert_eq!(cfg.service.device_instance, 41);
    assert_eq!(cfg.service.role, Role::Genset);
    let mqtt = cfg.mqtt.unwrap();
    assert_eq!(mqtt.host, "broker.lan");
    assert_eq!(mqtt.password.as_deref(), Some("s3cret"));
    assert_eq!(mqtt.topic_prefix, "venus");
}

#[test]
#[serial]
fn test_missing_config_file_uses_defaults_and_env_overrides() {
    std::env::set_var("METER_IP", "10.0.0.8");
    std::env::set_var("MQTT_HOST", "mosquitto");
    let cfg = Config::load("/nonexistent/fronius-smartmeter.yaml");
    std::env::remove_var("METER_IP");
    std::env::remove_var("MQTT_HOST");

    let cfg = cfg.unwrap();
    assert_eq!(cfg.meter.ip.as_deref(), Some("10.0.0.8"));
    assert_eq!(cfg.service.name, "com.victronenergy.grid.fronius");
    let mqtt = cfg.mqtt.unwrap();
    assert_eq!(mqtt.host, "mosquitto");
    assert_eq!(mqtt.port, 1883);
}

#[test]
#[serial]
fn test_invalid_config_is_rejected() {
    std::env::remove_var("METER_IP");
    std::env::remove_var("MQTT_HOST");
    let path = temp_file("bad.yaml", "discovery:\n  attempts: 0\n");
    let result = Config::load(&path);
    std::fs::remove_file(&path).ok();
    assert!(result.is_err());
}

fn service_info(connection: &str) -> ServiceInfo {
    ServiceInfo {
        connection: connection.into(),
        product_id: 16,
        product_name: "Fronius Smart Meter 63A".into(),
        firmware: Some("3.14.1-2".into()),
        serial: Some("19480178".into()),
    }
}

/// Fixture payload through prime, registration and one tick, read back from the tree.
#[tokio::test]
async fn test_fixture_mode_publishes_full_tree() {
    let acquirer = Acquirer::for_target(MeterTarget::Fixture, Duration::from_secs(10), None).unwrap();
    let mut poller = Poller::new(acquirer, ModelCatalog::default(), 10);
    let first = poller.prime().await.unwrap();
    assert_eq!(first.product_name().as_deref(), Some("Fronius Smart Meter 63A"));
    assert_eq!(first.details.serial.as_deref(), Some("19480178"));

    let tree = Arc::new(ObjectTree::new("com.victronenergy.grid.fronius"));
    let identity = Arc::new(DeviceIdentity::new(Role::Grid, 40));
    service::register(&tree, &service_info("test"), identity, poller.sample());
    poller.attach(tree.clone());
    let mut updates = tree.subscribe();

    assert_eq!(poller.tick().await, TickOutcome::Published);

    assert_eq!(tree.get("/Mgmt/Connection"), Some(BusValue::from("test")));
    assert_eq!(tree.get("/FirmwareVersion"), Some(BusValue::from("3.14.1-2")));
    assert_eq!(tree.get("/Ac/Power"), Some(BusValue::Float(687.1)));
    assert_eq!(tree.text("/Ac/Power").as_deref(), Some("687.1W"));
    assert_eq!(tree.get("/Ac/Energy/Forward"), Some(BusValue::Float(6546.931)));
    assert_eq!(tree.text("/Ac/Energy/Reverse").as_deref(), Some("3276.35kWh"));
    assert_eq!(tree.text("/Ac/L1/Voltage").as_deref(), Some("233.5V"));
    assert_eq!(tree.get("/Ac/L3/Power"), Some(BusValue::Float(436.6)));
    assert_eq!(tree.get("/Ac/L2/Energy/Forward"), Some(BusValue::Float(1904.21)));
    assert_eq!(tree.text("/Ac/Frequency").as_deref(), Some("50Hz"));
    assert_eq!(tree.get("/Latency"), Some(BusValue::Float(0.0)));
    assert_eq!(tree.get("/UpdateIndex"), Some(BusValue::Int(2)));

    // Same payload again: only the update index changes.
    let changed = updates.try_recv().unwrap();
    assert_eq!(changed.path, "/UpdateIndex");
    assert_eq!(changed.value, BusValue::Int(2));
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn test_fixture_file_single_phase_meter() {
    let path = temp_file(
        "single-phase.json",
        &json!({ "Body": { "Data": {
            "PowerReal_P_Sum": 150.0,
            "EnergyReal_WAC_Sum_Consumed": 12000,
            "EnergyReal_WAC_Sum_Produced": 500,
            "Voltage_AC_Phase_2": 231.0,
            "Details": { "Model": "Smart Meter TS 100A-1", "Manufacturer": "Fronius", "Serial": "X1" }
        } } })
        .to_string(),
    );
    let acquirer = Acquirer::for_target(
        MeterTarget::Fixture,
        Duration::from_secs(10),
        path.to_str(),
    )
    .unwrap();
    std::fs::remove_file(&path).ok();

    let mut poller = Poller::new(acquirer, ModelCatalog::default(), 10);
    poller.prime().await.unwrap();
    let s = poller.sample();
    assert_eq!(s.power, 150.0);
    assert_eq!(s.energy_forward, 12.0);
    assert_eq!(s.energy_reverse, 0.5);

    let values: Vec<_> = service::sample_values(s);
    let get = |p: &str| values.iter().find(|(path, _)| *path == p).map(|(_, v)| v.clone());
    assert_eq!(get("/Ac/L2/Voltage"), Some(BusValue::Float(0.0)));
    assert_eq!(get("/Ac/L3/Current"), Some(BusValue::Float(0.0)));
    assert_eq!(get("/Ac/L2/Energy/Forward"), Some(BusValue::Null));
    assert_eq!(get("/Ac/L3/Energy/Reverse"), Some(BusValue::Null));
}

#[tokio::test]
async fn test_role_write_of_unknown_role_is_refused() {
    let tree = ObjectTree::new("com.victronenergy.grid.fronius");
    let identity = Arc::new(DeviceIdentity::new(Role::Grid, 40));
    service::register(
        &tree,
        &service_info("192.168.1.20"),
        identity.clone(),
        &Default::default(),
    );

    let err = tree.write_external(ROLE_PATH, BusValue::from("solar")).unwrap_err();
    assert!(matches!(err, BusError::Refused(_)));
    assert_eq!(tree.get(ROLE_PATH), Some(BusValue::from("grid")));
    assert_eq!(identity.identity(), "grid:40");

    tree.write_external(ROLE_PATH, BusValue::from("genset")).unwrap();
    assert_eq!(identity.identity(), "genset:40");

    assert!(matches!(
        tree.write_external("/Ac/Power", BusValue::Float(1.0)),
        Err(BusError::NotWritable(_))
    ));
}

/// Fails for the first `failures` fetches, then serves the canned payload.
struct FlakyMeter {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl MeterSource for FlakyMeter {
    async fn fetch(&self) -> Result<RawResponse, AcquisitionError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(AcquisitionError::Status(503));
        }
        Ok(RawResponse {
            body: json!({ "Body": { "Data": {
                "PowerReal_P_Sum": -320.0,
                "EnergyReal_WAC_Sum_Consumed": 1000,
                "EnergyReal_WAC_Sum_Produced": 2000,
                "Details": { "Model": "Smart Meter 63A" }
            } } }),
            elapsed: Duration::from_millis(50),
        })
    }
}

#[tokio::test]
async fn test_poll_loop_survives_outage_below_threshold() {
    let source = FlakyMeter {
        failures: 9,
        calls: AtomicUsize::new(0),
    };
    let mut poller = Poller::new(Acquirer::new(Box::new(source)), ModelCatalog::default(), 10);
    let result = poller
        .run(
            Duration::from_millis(2),
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await;

    assert!(result.is_ok());
    assert_eq!(poller.retries().consecutive, 0);
    assert_eq!(poller.retries().lifetime, 9);
    assert_eq!(poller.sample().power, -320.0);
    assert_eq!(poller.sample().latency_ms, 50.0);
}

#[tokio::test]
async fn test_poll_loop_gives_up_after_ten_failures() {
    let source = FlakyMeter {
        failures: usize::MAX,
        calls: AtomicUsize::new(0),
    };
    let mut poller = Poller::new(Acquirer::new(Box::new(source)), ModelCatalog::default(), 10);
    let err = poller
        .run(Duration::from_millis(1), std::future::pending())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        fronius_smartmeter::AppError::RetriesExceeded { consecutive: 10 }
    ));
    assert_eq!(poller.sample().update_index, 0);
}
