//! DiskSpaceSensor - raises an alert when disk usage crosses its limit
//!
//! Disk usage is polled on the sensor's own interval, independent of the
//! scheduler cadence. The limit is only reported as exceeded once the
//! usage stayed above it for `grace` further polls, and the recovery is
//! reported once when usage drops below it again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{Alert, Cycle, Module, ModuleContext, ModuleDescriptor, ModuleGroup, names, next_batch};
use crate::config::{ConfigStore, SystemIdentity, get_parsed};
use crate::envelope::{Body, Envelope};
use crate::error::AgentResult;
use crate::monitors::node::{DiskSpace, NodeProbe, SysinfoProbe};
use crate::monitors::resources::{ResourceEvaluation, Threshold};
use crate::queue::{Inbox, QueueRegistry};

/// Store section holding the sensor settings
pub const SECTION: &str = "DISKSPACESENSOR";

pub const PRIORITY: u8 = 3;

const RESOURCE_TYPE: &str = "node:os:disk_space";

#[derive(Debug, Clone, PartialEq)]
pub struct DiskSpaceSettings {
    /// Used space in percent at which the limit counts as exceeded
    pub usage_threshold: f32,

    /// Additional polls above the threshold before alerting
    pub grace: usize,

    pub polling_interval: Duration,
}

impl DiskSpaceSettings {
    pub fn from_store(store: &dyn ConfigStore) -> AgentResult<Self> {
        Ok(Self {
            usage_threshold: get_parsed(store, SECTION, "disk_usage_threshold", 80.0)?,
            grace: get_parsed(store, SECTION, "grace", 0)?,
            polling_interval: Duration::from_secs(get_parsed(
                store,
                SECTION,
                "polling_interval",
                30,
            )?),
        })
    }
}

pub struct DiskSpaceSensor {
    descriptor: ModuleDescriptor,
    inbox: Inbox,
    registry: Arc<QueueRegistry>,
    identity: SystemIdentity,
    probe: Box<dyn NodeProbe>,
    threshold: Threshold,
    polling_interval: Duration,
    receive_timeout: Duration,
    next_poll: Instant,
}

impl DiskSpaceSensor {
    pub fn new(
        inbox: Inbox,
        registry: Arc<QueueRegistry>,
        identity: SystemIdentity,
        probe: Box<dyn NodeProbe>,
        settings: DiskSpaceSettings,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(
                names::DISK_SPACE_SENSOR,
                PRIORITY,
                ModuleGroup::Sensor,
            ),
            inbox,
            registry,
            identity,
            probe,
            threshold: Threshold::new(
                names::DISK_SPACE_SENSOR,
                settings.usage_threshold,
                settings.grace,
            ),
            polling_interval: settings.polling_interval,
            receive_timeout,
            next_poll: Instant::now(),
        }
    }

    pub fn from_context(ctx: ModuleContext) -> AgentResult<Self> {
        let settings = DiskSpaceSettings::from_store(ctx.store.as_ref())?;
        Ok(Self::new(
            ctx.inbox,
            ctx.registry,
            ctx.identity,
            Box::new(SysinfoProbe::new()),
            settings,
            ctx.scheduler.receive_timeout(),
        ))
    }

    #[instrument(skip(self))]
    fn poll(&mut self) {
        let space = match self.probe.disk_space() {
            Ok(space) => space,
            Err(e) => {
                warn!("reading disk space failed: {e}");
                return;
            }
        };

        let evaluation = self.threshold.observe(space.disk_used_percentage);
        match evaluation {
            ResourceEvaluation::StartsToExceed => {
                debug!("disk usage starts to exceed grace period");
                self.raise("fault", "warning", space);
            }
            ResourceEvaluation::BackToOk => {
                debug!("disk usage is back to normal");
                self.raise("fault_resolved", "informational", space);
            }
            ResourceEvaluation::Ok | ResourceEvaluation::Exceeding => {}
        }
    }

    fn raise(&self, alert_type: &str, severity: &str, space: DiskSpace) {
        let specific_info = match serde_json::to_value(space) {
            Ok(value) => value,
            Err(e) => {
                warn!("cannot encode disk reading: {e}");
                return;
            }
        };

        let host_id = self.probe.host_name();
        let alert = Alert {
            alert_type,
            severity,
            resource_type: RESOURCE_TYPE,
            resource_id: "*",
            host_id: &host_id,
            specific_info,
        };
        let envelope = Envelope::new(Body::SensorResponse(alert.to_payload(&self.identity)));

        info!(
            "disk usage {:.1}% (limit {}%): {alert_type}",
            space.disk_used_percentage,
            self.threshold.limit()
        );
        if let Err(e) = self.registry.send(names::EGRESS_PROCESSOR, envelope) {
            warn!("dropping disk space alert: {e}");
        }
    }
}

#[async_trait]
impl Module for DiskSpaceSensor {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn run_once(&mut self) -> AgentResult<Cycle> {
        let batch = next_batch(&mut self.inbox, self.receive_timeout).await;
        if batch.shutdown {
            info!("shutdown notice received");
            return Ok(Cycle::Stopped);
        }
        if !batch.envelopes.is_empty() {
            debug!("ignoring {} envelope(s) sent to the sensor", batch.envelopes.len());
        }

        let now = Instant::now();
        if now >= self.next_poll {
            self.poll();
            self.next_poll = now + self.polling_interval;
        }
        Ok(Cycle::Continue)
    }
}
