//! Module-based agent runtime
//!
//! Every unit of work (sensor, actuator, message handler, broker adapter) is
//! a [`Module`]. The [`scheduler::Scheduler`] runs each one on its own tokio
//! task and re-enters its work cycle on a fixed cadence. Modules never call
//! each other; they talk only through their inboxes in the
//! [`QueueRegistry`](crate::queue::QueueRegistry).
//!
//! ## Message Flow
//!
//! ```text
//!   DiskSpaceSensor ──┐
//!                     ├──▶ EgressProcessor inbox ──▶ EgressProcessor ──▶ bus
//!   NodeDataMsgHandler┘                                                   │
//!          ▲                                                              │
//!          │ route by body kind / resource type                           ▼
//!   IngressProcessor ◀──────────────────────────────────────────────── bus
//! ```
//!
//! ## Lifecycle
//!
//! `registered → running → draining → stopped`. The only way to stop a
//! module is the shutdown notice envelope (see
//! [`Envelope::shutdown_notice`]), which the scheduler broadcasts to every
//! inbox. Modules finish what is already queued before they stop.

pub mod disk_space;
pub mod egress;
pub mod ingress;
pub mod node_data;
pub mod scheduler;
pub mod thread_controller;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use uuid::Uuid;

use crate::broker::Transport;
use crate::config::{ConfigStore, RouteRule, SchedulerSettings, SystemIdentity};
use crate::envelope::{Envelope, Payload, ResourceInfo};
use crate::error::AgentResult;
use crate::queue::{Inbox, QueueRegistry};

/// Well-known module names, also used as routing keys
pub mod names {
    pub const EGRESS_PROCESSOR: &str = "EgressProcessor";
    pub const INGRESS_PROCESSOR: &str = "IngressProcessor";
    pub const NODE_DATA_MSG_HANDLER: &str = "NodeDataMsgHandler";
    pub const DISK_SPACE_SENSOR: &str = "DiskSpaceSensor";
    pub const THREAD_CONTROLLER: &str = "ThreadController";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleGroup {
    Sensor,
    Actuator,
    Handler,
    Processor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// Unique name, doubles as the key of the module's inbox
    pub name: String,

    /// Lower runs first when modules are started
    pub priority: u8,

    pub group: ModuleGroup,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, priority: u8, group: ModuleGroup) -> Self {
        Self {
            name: name.into(),
            priority,
            group,
        }
    }
}

/// Every module passes through `Draining` while its `shutdown()` runs, also
/// when its last work cycle returned [`Cycle::Stopped`] directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Registered,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Registered => "registered",
            Lifecycle::Running => "running",
            Lifecycle::Draining => "draining",
            Lifecycle::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// What the scheduler should do after a work cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Re-arm after the usual delay
    Continue,

    /// Shutdown seen, in-flight work remains; re-arm until it is done
    Draining,

    /// Nothing left to do; do not re-arm
    Stopped,
}

/// A unit of concurrently scheduled work
///
/// `run_once` processes at most the work queued right now and returns. It is
/// called again after every cycle, so it must cope with being re-entered at
/// any point. An error (or panic, or timeout) is logged by the scheduler,
/// which then calls `recover` before the next cycle.
#[async_trait]
pub trait Module: Send {
    fn descriptor(&self) -> &ModuleDescriptor;

    /// Acquire external resources before the first cycle
    async fn initialize(&mut self) -> AgentResult<()> {
        Ok(())
    }

    async fn run_once(&mut self) -> AgentResult<Cycle>;

    /// Re-establish external resources after a failed cycle
    async fn recover(&mut self) -> AgentResult<()> {
        Ok(())
    }

    /// Release resources once the module stopped
    async fn shutdown(&mut self) {}
}

/// Lifecycle state of every scheduled module
///
/// Entries are only added while modules are being scheduled.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    entries: Arc<RwLock<HashMap<String, watch::Receiver<Lifecycle>>>>,
}

impl StatusBoard {
    pub(crate) fn insert(&self, name: &str, state: watch::Receiver<Lifecycle>) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(name.to_string(), state);
    }

    fn receiver(&self, name: &str) -> Option<watch::Receiver<Lifecycle>> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(name).cloned()
    }

    pub fn get(&self, name: &str) -> Option<Lifecycle> {
        self.receiver(name).map(|state| *state.borrow())
    }

    pub fn snapshot(&self) -> BTreeMap<String, Lifecycle> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .iter()
            .map(|(name, state)| (name.clone(), *state.borrow()))
            .collect()
    }

    /// Wait until the module reaches `wanted`; false on timeout or unknown name
    pub async fn wait_for(&self, name: &str, wanted: Lifecycle, timeout: Duration) -> bool {
        let Some(mut state) = self.receiver(name) else {
            return false;
        };

        matches!(
            tokio::time::timeout(timeout, state.wait_for(|current| *current == wanted)).await,
            Ok(Ok(_))
        )
    }
}

/// Everything a module factory needs to build a module
///
/// Handed out after every inbox has been registered, so a module may look
/// up any peer by name from its first cycle on.
pub struct ModuleContext {
    pub inbox: Inbox,
    pub registry: Arc<QueueRegistry>,
    pub store: Arc<dyn ConfigStore>,
    pub identity: SystemIdentity,
    pub scheduler: SchedulerSettings,
    pub transport: Arc<dyn Transport>,
    pub routes: Vec<RouteRule>,
    pub statuses: StatusBoard,
}

/// Fields of a sensor response raised by this node
#[derive(Debug, Clone, PartialEq)]
pub struct Alert<'a> {
    /// `get`, `fault`, `fault_resolved`, ...
    pub alert_type: &'a str,
    pub severity: &'a str,
    pub resource_type: &'a str,
    pub resource_id: &'a str,
    pub host_id: &'a str,
    pub specific_info: Value,
}

impl Alert<'_> {
    /// Sensor response payload located by `identity`
    pub fn to_payload(&self, identity: &SystemIdentity) -> Payload {
        let info = ResourceInfo {
            site_id: identity.site_id.clone(),
            rack_id: identity.rack_id.clone(),
            node_id: identity.node_id.clone(),
            cluster_id: identity.cluster_id.clone(),
            resource_type: self.resource_type.to_string(),
            resource_id: self.resource_id.to_string(),
            event_time: Utc::now().timestamp().to_string(),
        };

        Payload {
            info: Some(info),
            specific_info: Some(self.specific_info.clone()),
            ..Payload::default()
        }
        .with_field("alert_type", json!(self.alert_type))
        .with_field("severity", json!(self.severity))
        .with_field("alert_id", json!(Uuid::new_v4().simple().to_string()))
        .with_field("host_id", json!(self.host_id))
    }
}

/// Envelopes pulled from an inbox for one cycle
#[derive(Debug, Default)]
pub struct Batch {
    pub envelopes: Vec<Envelope>,

    /// A shutdown notice was among the queued envelopes
    pub shutdown: bool,
}

/// Wait up to `wait` for work, then take everything else already queued
///
/// Shutdown notices are filtered out and reported through [`Batch::shutdown`].
pub async fn next_batch(inbox: &mut Inbox, wait: Duration) -> Batch {
    let mut batch = Batch::default();

    let Some(first) = inbox.receive_blocking(wait).await else {
        return batch;
    };

    for envelope in std::iter::once(first).chain(inbox.drain_nonblocking()) {
        if envelope.is_shutdown() {
            batch.shutdown = true;
        } else {
            batch.envelopes.push(envelope);
        }
    }

    batch
}
