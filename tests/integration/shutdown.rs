//! Coordinated shutdown of every module

use std::time::Duration;

use sspl_agent::{
    broker::memory::MemoryTransport,
    modules::{Lifecycle, names},
};

use crate::helpers::*;

#[tokio::test]
async fn test_shutdown_stops_every_module() {
    let broker = MemoryTransport::new();
    let handle = start_agent(&create_test_config(), &broker);
    wait_until_running(&handle).await;

    assert_eq!(handle.shutdown(), 5);

    let board = handle.statuses().clone();
    for name in board.snapshot().keys() {
        assert!(
            board.wait_for(name, Lifecycle::Stopped, Duration::from_secs(5)).await,
            "{name} did not stop"
        );
    }

    let notice = wait_for_outbound(&broker, |envelope| envelope.is_shutdown()).await;
    assert!(notice.is_some(), "shutdown notice not published");

    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("module tasks ended");
}

#[tokio::test]
async fn test_queued_alerts_are_flushed_before_stopping() {
    let broker = MemoryTransport::new();
    let handle = start_agent(&create_test_config(), &broker);
    wait_until_running(&handle).await;

    let alerts: Vec<_> = (0..10)
        .map(|_| create_sensor_request("node:os:disk_space"))
        .collect();
    for alert in &alerts {
        handle
            .registry()
            .send(names::EGRESS_PROCESSOR, alert.clone())
            .unwrap();
    }
    handle.shutdown();
    handle.join().await;

    let published = collect_outbound(&broker, alerts.len() + 1, |_| true).await;
    for alert in &alerts {
        assert!(
            published.iter().any(|envelope| envelope.uuid() == alert.uuid()),
            "alert {:?} dropped during shutdown",
            alert.uuid()
        );
    }
    assert!(published.last().is_some_and(|envelope| envelope.is_shutdown()));
}

#[tokio::test]
async fn test_draining_while_bus_is_down() {
    let broker = MemoryTransport::new();
    let config = create_config_with_modules(&[names::EGRESS_PROCESSOR]);
    let handle = start_agent(&config, &broker);
    wait_until_running(&handle).await;

    broker.set_reachable("mq-a", false);
    broker.set_reachable("mq-b", false);
    handle.shutdown();

    let board = handle.statuses().clone();
    assert!(
        board
            .wait_for(names::EGRESS_PROCESSOR, Lifecycle::Draining, Duration::from_secs(5))
            .await
    );

    broker.set_reachable("mq-a", true);
    assert!(
        board
            .wait_for(names::EGRESS_PROCESSOR, Lifecycle::Stopped, Duration::from_secs(5))
            .await
    );
    handle.join().await;
}
