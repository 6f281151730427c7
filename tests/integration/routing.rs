//! Inbound messages that cannot be delivered to any module

use pretty_assertions::assert_eq;
use serde_json::json;
use sspl_agent::{
    Body, Envelope, Payload,
    broker::memory::MemoryTransport,
    modules::{Lifecycle, names},
};

use crate::helpers::*;

fn unknown_variant() -> String {
    json!({
        "title": "SSPL Actuator Request",
        "username": "JohnDoe",
        "signature": "None",
        "time": "2015-05-29 14:28:30.974749",
        "expires": 500,
        "message": {
            "sspl_ll_msg_header": {
                "schema_version": "1.0.0",
                "sspl_version": "1.0.0",
                "msg_version": "1.0.0"
            },
            "enclosure_request_type": { "sensor_type": "node:os:disk_space" }
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_bad_messages_do_not_stop_ingress() {
    let broker = MemoryTransport::new();
    let handle = start_agent(&create_test_config(), &broker);
    wait_until_running(&handle).await;

    publish_inbound(&broker, "{ not json");
    publish_inbound(&broker, &unknown_variant());

    // known variant, but no module serves enclosure sensors
    let unroutable = Envelope::new(Body::SensorRequest(
        Payload::default().with_field("sensor_type", json!("enclosure:fru:psu")),
    ));
    publish_inbound(&broker, &unroutable.to_json().unwrap());

    let request = create_sensor_request("node:os:memory_usage");
    publish_inbound(&broker, &request.to_json().unwrap());

    let response = wait_for_outbound(&broker, |envelope| envelope.uuid() == request.uuid()).await;
    assert!(response.is_some());

    assert_eq!(
        handle.status(names::INGRESS_PROCESSOR),
        Some(Lifecycle::Running)
    );
    assert_eq!(broker.queue_depth(VHOST, "actuator-req"), 0);

    handle.shutdown();
    handle.join().await;
}

#[tokio::test]
async fn test_remote_shutdown_notice_is_not_obeyed() {
    let broker = MemoryTransport::new();
    let handle = start_agent(&create_test_config(), &broker);
    wait_until_running(&handle).await;

    publish_inbound(&broker, &Envelope::shutdown_notice().to_json().unwrap());

    let request = create_status_request(names::EGRESS_PROCESSOR);
    publish_inbound(&broker, &request.to_json().unwrap());
    let response = wait_for_outbound(&broker, |envelope| envelope.uuid() == request.uuid())
        .await
        .expect("agent still answering");

    let controller = &response.body().payload().fields["thread_controller"];
    assert_eq!(controller["thread_response"], "running");
    assert!(
        handle
            .statuses()
            .snapshot()
            .values()
            .all(|state| *state == Lifecycle::Running)
    );

    handle.shutdown();
    handle.join().await;
}
