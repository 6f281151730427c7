//! Broker outages and host failover

use std::time::Duration;

use sspl_agent::{broker::memory::MemoryTransport, modules::names};

use crate::helpers::*;

fn alternates(attempts: &[String]) -> bool {
    attempts.windows(2).all(|pair| pair[0] != pair[1])
}

#[tokio::test]
async fn test_egress_alternates_hosts_until_bus_returns() {
    let broker = MemoryTransport::new();
    broker.set_reachable("mq-a", false);
    broker.set_reachable("mq-b", false);

    let config = create_config_with_modules(&[names::EGRESS_PROCESSOR]);
    let handle = start_agent(&config, &broker);
    wait_until_running(&handle).await;

    let alert = create_sensor_request("node:os:disk_space");
    handle
        .registry()
        .send(names::EGRESS_PROCESSOR, alert.clone())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let attempts = broker.connection_attempts();
    assert!(attempts.len() >= 4, "only {attempts:?}");
    // the startup probe leaves the target untouched, every failed send toggles it
    assert_eq!(attempts[0], "mq-a");
    assert!(alternates(&attempts[1..]), "{attempts:?}");
    assert!(attempts.iter().all(|host| host == "mq-a" || host == "mq-b"));

    broker.set_reachable("mq-b", true);
    let delivered = wait_for_outbound(&broker, |envelope| envelope.uuid() == alert.uuid()).await;
    assert!(delivered.is_some(), "held envelope was lost");

    handle.shutdown();
    handle.join().await;
}

#[tokio::test]
async fn test_ingress_fails_over_to_secondary() {
    let broker = MemoryTransport::new();
    broker.set_reachable("mq-a", false);

    let handle = start_agent(&create_test_config(), &broker);
    wait_until_running(&handle).await;

    // give the ingress adapter a cycle to move to the secondary host
    tokio::time::sleep(Duration::from_millis(100)).await;

    let request = create_sensor_request("node:os:cpu_usage");
    publish_inbound(&broker, &request.to_json().unwrap());

    let response = wait_for_outbound(&broker, |envelope| envelope.uuid() == request.uuid()).await;
    assert!(response.is_some());

    handle.shutdown();
    handle.join().await;
}
