//! ThreadController - reports the lifecycle state of scheduled modules
//!
//! Answers actuator requests of the form
//! `{"thread_controller": {"module_name": "...", "thread_request": "status"}}`
//! with an actuator response carrying the module's current state in
//! `thread_response`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Cycle, Module, ModuleContext, ModuleDescriptor, ModuleGroup, StatusBoard, names, next_batch};
use crate::envelope::{Body, Envelope, Payload, THREAD_CONTROLLER};
use crate::error::AgentResult;
use crate::queue::{Inbox, QueueRegistry};

pub const PRIORITY: u8 = 2;

#[derive(Debug, Deserialize)]
struct ThreadRequest {
    module_name: String,
    thread_request: String,
}

pub struct ThreadController {
    descriptor: ModuleDescriptor,
    inbox: Inbox,
    registry: Arc<QueueRegistry>,
    statuses: StatusBoard,
    receive_timeout: Duration,
}

impl ThreadController {
    pub fn new(
        inbox: Inbox,
        registry: Arc<QueueRegistry>,
        statuses: StatusBoard,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(
                names::THREAD_CONTROLLER,
                PRIORITY,
                ModuleGroup::Actuator,
            ),
            inbox,
            registry,
            statuses,
            receive_timeout,
        }
    }

    pub fn from_context(ctx: ModuleContext) -> AgentResult<Self> {
        Ok(Self::new(
            ctx.inbox,
            ctx.registry,
            ctx.statuses,
            ctx.scheduler.receive_timeout(),
        ))
    }

    fn thread_response(&self, request: &ThreadRequest) -> String {
        match request.thread_request.as_str() {
            "status" => match self.statuses.get(&request.module_name) {
                Some(state) => state.to_string(),
                None => format!("unknown module {}", request.module_name),
            },
            other => format!("unsupported thread request {other}"),
        }
    }

    fn answer(&self, envelope: &Envelope) {
        let Some(raw) = envelope.body().payload().fields.get(THREAD_CONTROLLER) else {
            warn!("actuator request without {THREAD_CONTROLLER} section, ignoring");
            return;
        };

        let request: ThreadRequest = match serde_json::from_value(raw.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed thread controller request: {e}");
                return;
            }
        };

        let thread_response = self.thread_response(&request);
        debug!(
            "{} {}: {thread_response}",
            request.thread_request, request.module_name
        );

        let payload = Payload::default().with_field(
            THREAD_CONTROLLER,
            json!({
                "module_name": request.module_name,
                "thread_response": thread_response,
            }),
        );
        let response = envelope.reply(Body::ActuatorResponse(payload));

        if let Err(e) = self.registry.send(names::EGRESS_PROCESSOR, response) {
            warn!("dropping thread controller response: {e}");
        }
    }
}

#[async_trait]
impl Module for ThreadController {
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
