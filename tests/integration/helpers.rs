//! Helper functions for integration tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sspl_agent::{
    Body, Envelope, ModuleCatalog, Payload, bootstrap,
    broker::memory::MemoryTransport,
    config::{ALWAYS_ENABLED, Config, EnablementTable, GroupModules, SchedulerSettings},
    modules::{Lifecycle, scheduler::SchedulerHandle},
};

pub const VHOST: &str = "SSPL";
pub const OUTBOUND_QUEUE: &str = "ras_status";
pub const INBOUND_EXCHANGE: &str = "sspl-in";
pub const INBOUND_KEY: &str = "actuator-req-key";

pub fn fast_scheduler() -> SchedulerSettings {
    SchedulerSettings {
        re_arm_millis: 10,
        cycle_timeout_secs: 5,
        receive_timeout_millis: 10,
    }
}

/// Config with both adapters pointed at `mq-a` (primary) and `mq-b`
pub fn create_test_config() -> Config {
    Config {
        store: json!({
            "EGRESSPROCESSOR": {
                "primary_broker_host": "mq-a",
                "secondary_broker_host": "mq-b"
            },
            "INGRESSPROCESSOR": {
                "primary_broker_host": "mq-a",
                "secondary_broker_host": "mq-b"
            },
            "DISKSPACESENSOR": { "polling_interval": 3600, "disk_usage_threshold": 101 },
            "SYSTEM_INFORMATION": { "site_id": "s1", "rack_id": "r1", "node_id": "n1" }
        }),
        scheduler: fast_scheduler(),
        ..Config::default()
    }
}

/// Config enabling only the given modules
pub fn create_config_with_modules(modules: &[&str]) -> Config {
    let mut table = EnablementTable::default();
    table.groups.insert(
        ALWAYS_ENABLED.to_string(),
        GroupModules {
            core_processors: modules.iter().map(|name| name.to_string()).collect(),
            ..GroupModules::default()
        },
    );

    Config {
        modules: table,
        ..create_test_config()
    }
}

pub fn start_agent(config: &Config, broker: &MemoryTransport) -> SchedulerHandle {
    bootstrap(config, Arc::new(broker.clone()), &ModuleCatalog::builtin())
        .expect("test config is valid")
        .start()
}

pub async fn wait_until_running(handle: &SchedulerHandle) {
    let names: Vec<String> = handle.statuses().snapshot().into_keys().collect();
    for name in names {
        assert!(
            handle
                .statuses()
                .wait_for(&name, Lifecycle::Running, Duration::from_secs(5))
                .await,
            "{name} never started"
        );
    }
}

pub fn create_sensor_request(sensor_type: &str) -> Envelope {
    Envelope::new(Body::SensorRequest(
        Payload::default().with_field("node_data", json!({ "sensor_type": sensor_type })),
    ))
}

pub fn create_status_request(module_name: &str) -> Envelope {
    Envelope::new(Body::ActuatorRequest(Payload::default().with_field(
        "thread_controller",
        json!({ "module_name": module_name, "thread_request": "status" }),
    )))
}

/// Publish onto the bus as a remote client would
pub fn publish_inbound(broker: &MemoryTransport, raw: &str) {
    let routed = broker
        .publish(VHOST, INBOUND_EXCHANGE, INBOUND_KEY, raw)
        .expect("inbound exchange declared");
    assert_eq!(routed, 1);
}

/// Wait for `count` outbound envelopes matching `predicate`, in publish order
///
/// Outbound envelopes that do not match are discarded. Returns what was
/// collected when the time runs out.
pub async fn collect_outbound<F>(broker: &MemoryTransport, count: usize, predicate: F) -> Vec<Envelope>
where
    F: Fn(&Envelope) -> bool,
{
    let mut collected = vec![];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    while collected.len() < count && tokio::time::Instant::now() < deadline {
        for raw in broker.take_messages(VHOST, OUTBOUND_QUEUE) {
            let envelope = Envelope::from_json(&raw).expect("agent publishes valid envelopes");
            if predicate(&envelope) {
                collected.push(envelope);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    collected
}

pub async fn wait_for_outbound<F>(broker: &MemoryTransport, predicate: F) -> Option<Envelope>
where
    F: Fn(&Envelope) -> bool,
{
    collect_outbound(broker, 1, predicate).await.into_iter().next()
}
