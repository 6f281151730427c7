//! Answers node sensor requests with readings of the local host

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Alert, Cycle, Module, ModuleContext, ModuleDescriptor, ModuleGroup, names, next_batch};
use crate::config::SystemIdentity;
use crate::envelope::{Body, Envelope};
use crate::error::AgentResult;
use crate::monitors::node::{NodeProbe, SysinfoProbe};
use crate::queue::{Inbox, QueueRegistry};

pub const PRIORITY: u8 = 2;

pub const DISK_SPACE: &str = "node:os:disk_space";
pub const MEMORY_USAGE: &str = "node:os:memory_usage";
pub const CPU_USAGE: &str = "node:os:cpu_usage";

pub struct NodeDataMsgHandler {
    descriptor: ModuleDescriptor,
    inbox: Inbox,
    registry: Arc<QueueRegistry>,
    identity: SystemIdentity,
    probe: Box<dyn NodeProbe>,
    receive_timeout: Duration,
}

impl NodeDataMsgHandler {
    pub fn new(
        inbox: Inbox,
        registry: Arc<QueueRegistry>,
        identity: SystemIdentity,
        probe: Box<dyn NodeProbe>,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(
                names::NODE_DATA_MSG_HANDLER,
                PRIORITY,
                ModuleGroup::Handler,
            ),
            inbox,
            registry,
            identity,
            probe,
            receive_timeout,
        }
    }

    pub fn from_context(ctx: ModuleContext) -> AgentResult<Self> {
        Ok(Self::new(
            ctx.inbox,
            ctx.registry,
            ctx.identity,
            Box::new(SysinfoProbe::new()),
            ctx.scheduler.receive_timeout(),
        ))
    }

    /// Reading for `sensor_type`, `None` if the type is not served here
    ///
    /// A failed read is reported in place of the reading as `{"ERROR": ...}`.
    fn read(&mut self, sensor_type: &str) -> Option<Value> {
        let reading = match sensor_type {
            DISK_SPACE => self.probe.disk_space().and_then(|r| Ok(serde_json::to_value(r)?)),
            MEMORY_USAGE => self.probe.memory_usage().and_then(|r| Ok(serde_json::to_value(r)?)),
            CPU_USAGE => self.probe.cpu_usage().and_then(|r| Ok(serde_json::to_value(r)?)),
            _ => return None,
        };

        Some(reading.unwrap_or_else(|e| {
            warn!("reading {sensor_type} failed: {e}");
            json!({ "ERROR": e.to_string() })
        }))
    }

    fn answer(&mut self, request: &Envelope) {
        let Some(sensor_type) = request.resource_type().map(str::to_string) else {
            warn!("sensor request without sensor type, ignoring");
            return;
        };

        let Some(specific_info) = self.read(&sensor_type) else {
            warn!("unsupported node sensor type {sensor_type}");
            return;
        };

        let host_id = self.probe.host_name();
        let alert = Alert {
            alert_type: "get",
            severity: "informational",
            resource_type: &sensor_type,
            resource_id: "*",
            host_id: &host_id,
            specific_info,
        };
        let response = request.reply(Body::SensorResponse(alert.to_payload(&self.identity)));

        match self.registry.send(names::EGRESS_PROCESSOR, response) {
            Ok(()) => debug!("answered {sensor_type} request"),
            Err(e) => warn!("dropping {sensor_type} response: {e}"),
        }
    }
}

#[async_trait]
impl Module for NodeDataMsgHandler {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn run_once(&mut self) -> AgentResult<Cycle> {
        let batch = next_batch(&mut self.inbox, self.receive_timeout).await;

        for request in &batch.envelopes {
            self.answer(request);
        }

        if batch.shutdown {
            info!("shutdown notice received");
            return Ok(Cycle::Stopped);
        }
        Ok(Cycle::Continue)
    }
}
