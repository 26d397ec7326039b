/// End-to-end test of the MQTT binding against a real broker.
///
/// Requires an MQTT broker, for example:
///   docker run -d -p 1883:1883 eclipse-mosquitto:2 mosquitto -c /mosquitto-no-auth.conf
///
/// Run with: MQTT_HOST=localhost cargo test --test end_to_end_test -- --ignored --nocapture
use fronius_smartmeter::acquire::{Acquirer, MeterTarget};
use fronius_smartmeter::bus::mqtt::{self, run_binding};
use fronius_smartmeter::bus::{BusValue, ObjectTree, ProcessBus};
use fronius_smartmeter::config::MqttConfig;
use fronius_smartmeter::model::ModelCatalog;
use fronius_smartmeter::poller::Poller;
use fronius_smartmeter::role::{DeviceIdentity, Role};
use fronius_smartmeter::service::{self, ServiceInfo};
use rumqttc::{Event, Incoming, QoS};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn broker() -> MqttConfig {
    MqttConfig {
        host: std::env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: 1883,
        client_id: None,
        username: None,
        password: None,
        keep_alive_secs: Some(10),
        topic_prefix: format!("fronius-test-{}", std::process::id()),
    }
}

#[tokio::test]
#[ignore]
async fn test_tree_is_mirrored_and_role_writes_are_applied() {
    let cfg = broker();
    let service_name = "com.victronenergy.grid.fronius";

    let acquirer = Acquirer::for_target(MeterTarget::Fixture, Duration::from_secs(10), None).unwrap();
    let mut poller = Poller::new(acquirer, ModelCatalog::default(), 10);
    let first = poller.prime().await.unwrap();

    let tree = Arc::new(ObjectTree::new(service_name));
    let identity = Arc::new(DeviceIdentity::new(Role::Grid, 40));
    let info = ServiceInfo {
        connection: "test".into(),
        product_id: 16,
        product_name: first.product_name().unwrap(),
        firmware: None,
        serial: first.details.serial.clone(),
    };
    service::register(&tree, &info, identity.clone(), poller.sample());
    poller.attach(tree.clone());
    tokio::spawn(run_binding(tree.clone(), cfg.clone()));

    let (client, mut eventloop) = mqtt::new(mqtt::build_options(&cfg, "e2e"));
    let power_topic = format!("{}/N/{service_name}/Ac/Power", cfg.topic_prefix);
    client.subscribe(&power_topic, QoS::AtLeastOnce).await.unwrap();

    let payload = timeout(Duration::from_secs(10), async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == power_topic => {
                    return serde_json::from_slice::<Value>(&p.payload).unwrap();
                }
                Ok(_) => continue,
                Err(e) => panic!("MQTT error: {e}"),
            }
        }
    })
    .await
    .expect("power was not published");
    assert_eq!(payload, json!({ "value": 687.1, "text": "687.1W" }));

    let write_topic = format!("{}/W/{service_name}/Role", cfg.topic_prefix);
    client
        .publish(&write_topic, QoS::AtLeastOnce, false, r#"{"value":"solar"}"#)
        .await
        .unwrap();
    client
        .publish(&write_topic, QoS::AtLeastOnce, false, r#"{"value":"pvinverter"}"#)
        .await
        .unwrap();

    timeout(Duration::from_secs(10), async {
        loop {
            if tree.get("/Role") == Some(BusValue::from("pvinverter")) {
                return;
            }
            // Keep our own connection alive while waiting.
            let _ = timeout(Duration::from_millis(100), eventloop.poll()).await;
        }
    })
    .await
    .expect("role write was not applied");
    assert_eq!(identity.identity(), "pvinverter:40");
}
