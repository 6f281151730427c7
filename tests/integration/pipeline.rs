//! Request/response round trips through both broker adapters

use sspl_agent::{BodyKind, broker::memory::MemoryTransport, modules::names};

use crate::helpers::*;

#[tokio::test]
async fn test_disk_space_request_is_answered_on_the_bus() {
    let broker = MemoryTransport::new();
    let handle = start_agent(&create_test_config(), &broker);
    wait_until_running(&handle).await;

    let request = create_sensor_request("node:os:disk_space");
    publish_inbound(&broker, &request.to_json().unwrap());

    let response = wait_for_outbound(&broker, |envelope| envelope.uuid() == request.uuid())
        .await
        .expect("disk space response published");

    assert_eq!(response.kind(), BodyKind::SensorResponse);
    assert_eq!(response.resource_type(), Some("node:os:disk_space"));
    assert_eq!(response.security.username, "sspl-ll");
    assert_ne!(response.security.signature, "N/A");

    let payload = response.body().payload();
    let info = payload.info.as_ref().unwrap();
    assert_eq!(info.site_id, "s1");
    assert_eq!(info.node_id, "n1");
    assert!(payload.fields.contains_key("alert_id"));
    assert!(payload.fields.contains_key("host_id"));

    // a host without readable disks answers with an error record instead
    let specific = payload.specific_info.as_ref().unwrap();
    assert!(specific.get("freeSpace").is_some() || specific.get("ERROR").is_some());

    handle.shutdown();
    handle.join().await;
}

#[tokio::test]
async fn test_thread_controller_status_over_the_bus() {
    let broker = MemoryTransport::new();
    let handle = start_agent(&create_test_config(), &broker);
    wait_until_running(&handle).await;

    let request = create_status_request(names::NODE_DATA_MSG_HANDLER);
    publish_inbound(&broker, &request.to_json().unwrap());

    let response = wait_for_outbound(&broker, |envelope| envelope.uuid() == request.uuid())
        .await
        .expect("status response published");

    assert_eq!(response.kind(), BodyKind::ActuatorResponse);
    let controller = &response.body().payload().fields["thread_controller"];
    assert_eq!(controller["module_name"], names::NODE_DATA_MSG_HANDLER);
    assert_eq!(controller["thread_response"], "running");

    handle.shutdown();
    handle.join().await;
}

#[tokio::test]
async fn test_outbound_order_preserved_per_producer() {
    let broker = MemoryTransport::new();
    let handle = start_agent(&create_test_config(), &broker);
    wait_until_running(&handle).await;

    let requests: Vec<_> = (0..5)
        .map(|_| create_sensor_request("node:os:memory_usage"))
        .collect();
    for request in &requests {
        publish_inbound(&broker, &request.to_json().unwrap());
    }

    let answered: Vec<_> = collect_outbound(&broker, requests.len(), |envelope| {
        envelope.resource_type() == Some("node:os:memory_usage")
    })
    .await
    .iter()
    .map(|response| response.uuid().map(str::to_string))
    .collect();

    let expected: Vec<_> = requests
        .iter()
        .map(|request| request.uuid().map(str::to_string))
        .collect();
    assert_eq!(answered, expected);

    handle.shutdown();
    handle.join().await;
}
