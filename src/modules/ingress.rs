//! Ingress adapter - consumes the bus and routes envelopes to modules
//!
//! Every cycle pulls up to one batch of messages from the bound queue.
//! Each message is decoded, matched against the routing table (first
//! matching rule wins) and handed to the destination inbox. Messages that
//! fail to decode or match no rule are logged and dropped; they were
//! already acknowledged on the bus and are never redelivered.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use super::{Cycle, Module, ModuleContext, ModuleDescriptor, ModuleGroup, names};
use crate::broker::BrokerLink;
use crate::config::{BrokerSettings, INGRESS_BINDING, RouteRule, get_parsed};
use crate::envelope::Envelope;
use crate::error::{AgentError, AgentResult};
use crate::queue::{Inbox, QueueRegistry};

/// Store section holding the ingress broker settings
pub const SECTION: &str = "INGRESSPROCESSOR";

pub const PRIORITY: u8 = 1;

const DEFAULT_FETCH_BATCH: usize = 32;

/// Ordered routing table of the ingress adapter
#[derive(Debug, Clone, Default)]
pub struct Router {
    rules: Vec<RouteRule>,
}

impl Router {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    /// Module the envelope should be delivered to
    pub fn destination(&self, envelope: &Envelope) -> Option<&str> {
        let payload = envelope.body().payload();
        let resource_type = envelope.resource_type();

        self.rules
            .iter()
            .find(|rule| {
                rule.kind == envelope.kind()
                    && rule
                        .key
                        .as_ref()
                        .is_none_or(|key| payload.fields.contains_key(key))
                    && rule.prefix.as_ref().is_none_or(|prefix| {
                        resource_type.is_some_and(|resource| resource.starts_with(prefix.as_str()))
                    })
            })
            .map(|rule| rule.module.as_str())
    }
}

pub struct IngressProcessor {
    descriptor: ModuleDescriptor,
    inbox: Inbox,
    link: BrokerLink,
    registry: Arc<QueueRegistry>,
    router: Router,
    fetch_batch: usize,
    routed: u64,
    dropped: u64,
}

impl IngressProcessor {
    pub fn new(
        inbox: Inbox,
        link: BrokerLink,
        registry: Arc<QueueRegistry>,
        router: Router,
        fetch_batch: usize,
    ) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(
                names::INGRESS_PROCESSOR,
                PRIORITY,
                ModuleGroup::Processor,
            ),
            inbox,
            link,
            registry,
            router,
            fetch_batch: fetch_batch.max(1),
            routed: 0,
            dropped: 0,
        }
    }

    pub fn from_context(ctx: ModuleContext) -> AgentResult<Self> {
        let store = ctx.store.as_ref();
        let settings = BrokerSettings::from_store(store, SECTION, INGRESS_BINDING)?;
        let fetch_batch = get_parsed(store, SECTION, "fetch_batch", DEFAULT_FETCH_BATCH)?;

        let link = BrokerLink::new(names::INGRESS_PROCESSOR, settings, ctx.transport);
        Ok(Self::new(
            ctx.inbox,
            link,
            ctx.registry,
            Router::new(ctx.routes),
            fetch_batch,
        ))
    }

    pub fn link(&self) -> &BrokerLink {
        &self.link
    }

    /// Envelopes handed to a module inbox since start
    pub fn routed(&self) -> u64 {
        self.routed
    }

    /// Messages dropped as malformed or unroutable since start
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn dispatch(&self, raw: &str) -> AgentResult<String> {
        let envelope = Envelope::from_json(raw)?;

        let Some(destination) = self.router.destination(&envelope) else {
            return Err(AgentError::UnknownDestination(format!(
                "no route for {} {}",
                envelope.kind(),
                envelope.resource_type().unwrap_or("(no resource type)")
            )));
        };

        let destination = destination.to_string();
        self.registry.send(&destination, envelope)?;
        Ok(destination)
    }

    fn route_all(&mut self, messages: Vec<String>) {
        for raw in messages {
            match self.dispatch(&raw) {
                Ok(destination) => {
                    trace!("routed message to {destination}");
                    self.routed += 1;
                }
                Err(e) => {
                    warn!("discarding inbound message: {e}");
                    debug!("discarded message: {raw}");
                    self.dropped += 1;
                }
            }
        }
    }
}

#[async_trait]
impl Module for IngressProcessor {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn initialize(&mut self) -> AgentResult<()> {
        let connected = self.link.connect().await.map(drop);
        if let Err(e) = connected {
            warn!(
                "broker {} not reachable at startup: {e}",
                self.link.current_host()
            );
        }
        Ok(())
    }

    async fn run_once(&mut self) -> AgentResult<Cycle> {
        let control = self.inbox.drain_nonblocking();
        if control.iter().any(Envelope::is_shutdown) {
            info!("shutdown notice received, no longer consuming");
            return Ok(Cycle::Stopped);
        }
        if !control.is_empty() {
            debug!("ignoring {} envelope(s) sent to the ingress inbox", control.len());
        }

        loop {
            match self.link.fetch(self.fetch_batch).await {
                Ok(messages) => {
                    let full = messages.len() >= self.fetch_batch;
                    self.route_all(messages);
                    if !full {
                        return Ok(Cycle::Continue);
                    }
                }
                Err(e) => {
                    warn!("consuming from {} failed: {e}", self.link.current_host());
                    self.link.fail_over().await;
                    return Ok(Cycle::Continue);
                }
            }
        }
    }

    async fn recover(&mut self) -> AgentResult<()> {
        self.link.fail_over().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.link.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryTransport;
    use crate::config::{Config, KvStore};
    use crate::envelope::{Body, BodyKind, Payload};
    use crate::queue::Inbox;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Harness {
        broker: MemoryTransport,
        ingress: IngressProcessor,
        registry: Arc<QueueRegistry>,
        node_data: Inbox,
        thread_controller: Inbox,
    }

    fn harness(batch: usize) -> Harness {
        let broker = MemoryTransport::new();
        let store = KvStore::from_pairs([
            ("INGRESSPROCESSOR/primary_broker_host", "mq-a"),
            ("INGRESSPROCESSOR/secondary_broker_host", "mq-b"),
        ]);
        let settings = BrokerSettings::from_store(&store, SECTION, INGRESS_BINDING).unwrap();

        let mut builder = QueueRegistry::builder();
        let inbox = builder.register(names::INGRESS_PROCESSOR);
        let node_data = builder.register(names::NODE_DATA_MSG_HANDLER);
        let thread_controller = builder.register(names::THREAD_CONTROLLER);
        let registry = builder.build();

        let link = BrokerLink::new("ingress-test", settings, Arc::new(broker.clone()));
        let ingress = IngressProcessor::new(
            inbox,
            link,
            registry.clone(),
            Router::new(Config::default().routing),
            batch,
        );

        Harness {
            broker,
            ingress,
            registry,
            node_data,
            thread_controller,
        }
    }

    fn publish(broker: &MemoryTransport, raw: &str) {
        broker
            .publish("SSPL", "sspl-in", "actuator-req-key", raw)
            .unwrap();
    }

    fn sensor_request(sensor_type: &str) -> String {
        let payload = Payload::default().with_field("node_data", json!({ "sensor_type": sensor_type }));
        Envelope::new(Body::SensorRequest(payload)).to_json().unwrap()
    }

    #[test]
    fn test_router_matches_key_and_prefix() {
        let router = Router::new(Config::default().routing);

        let disk = Envelope::from_json(&sensor_request("node:os:disk_space")).unwrap();
        assert_eq!(router.destination(&disk), Some(names::NODE_DATA_MSG_HANDLER));

        let enclosure = Envelope::from_json(&sensor_request("enclosure:fan")).unwrap();
        assert_eq!(router.destination(&enclosure), None);

        let status = Envelope::new(Body::ActuatorRequest(
            Payload::default().with_field("thread_controller", json!({ "thread_request": "status" })),
        ));
        assert_eq!(router.destination(&status), Some(names::THREAD_CONTROLLER));

        // same key, wrong kind
        let response = Envelope::new(Body::new(
            BodyKind::ActuatorResponse,
            Payload::default().with_field("thread_controller", json!({})),
        ));
        assert_eq!(router.destination(&response), None);
    }

    #[tokio::test]
    async fn test_routes_bus_messages_to_inboxes() {
        let mut h = harness(8);
        h.ingress.initialize().await.unwrap();

        publish(&h.broker, &sensor_request("node:os:disk_space"));
        publish(&h.broker, &sensor_request("node:os:memory_usage"));

        assert_eq!(h.ingress.run_once().await.unwrap(), Cycle::Continue);
        assert_eq!(h.ingress.routed(), 2);

        let first = h.node_data.try_receive().unwrap();
        assert_eq!(first.resource_type(), Some("node:os:disk_space"));
        assert_eq!(h.node_data.len(), 1);
        assert!(h.thread_controller.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unroutable_messages_are_dropped() {
        let mut h = harness(8);
        h.ingress.initialize().await.unwrap();

        publish(&h.broker, "not json");
        publish(
            &h.broker,
            r#"{"message": {"sspl_ll_msg_header": {"schema_version": "1.0.0", "sspl_version": "1.0.0", "msg_version": "1.0.0"}, "bogus_type": {}}}"#,
        );
        publish(&h.broker, &sensor_request("enclosure:fan"));
        publish(&h.broker, &sensor_request("node:os:cpu_usage"));

        h.ingress.run_once().await.unwrap();

        assert_eq!(h.ingress.dropped(), 3);
        assert_eq!(h.ingress.routed(), 1);
        assert_eq!(h.node_data.len(), 1);
    }

    #[tokio::test]
    async fn test_large_backlog_drained_in_one_cycle() {
        let mut h = harness(2);
        h.ingress.initialize().await.unwrap();

        for _ in 0..5 {
            publish(&h.broker, &sensor_request("node:os:disk_space"));
        }

        h.ingress.run_once().await.unwrap();
        assert_eq!(h.node_data.len(), 5);
    }

    #[tokio::test]
    async fn test_fetch_failure_toggles_host() {
        let mut h = harness(8);
        h.broker.set_reachable("mq-a", false);

        assert_eq!(h.ingress.run_once().await.unwrap(), Cycle::Continue);
        assert_eq!(h.ingress.link().current_host(), "mq-b");

        h.ingress.run_once().await.unwrap();
        assert_eq!(h.broker.connection_attempts(), vec!["mq-a", "mq-b"]);
    }

    #[tokio::test]
    async fn test_shutdown_notice_stops_consuming() {
        let mut h = harness(8);
        h.registry
            .send(names::INGRESS_PROCESSOR, Envelope::shutdown_notice())
            .unwrap();

        assert_eq!(h.ingress.run_once().await.unwrap(), Cycle::Stopped);
        assert!(h.broker.connection_attempts().is_empty());
    }
}
