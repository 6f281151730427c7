//! Internal queue registry
//!
//! Every module owns exactly one [`Inbox`]. Other modules reach it by name
//! through the [`QueueRegistry`]. Names are registered while the agent is
//! being wired ([`QueueRegistryBuilder`]); once built the registry is frozen,
//! so lookups need no locking beyond what the channels themselves do.
//!
//! Queues are unbounded: `send` never blocks or fails because a consumer is
//! slow, and a broker outage shows up as growing inbox depth.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::{trace, warn};

use crate::envelope::Envelope;
use crate::error::{AgentError, AgentResult};

/// Collects inboxes while modules are being wired
#[derive(Debug, Default)]
pub struct QueueRegistryBuilder {
    senders: HashMap<String, UnboundedSender<Envelope>>,
}

impl QueueRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module name and hand back the consuming end of its queue
    ///
    /// Registering a name twice replaces the earlier queue; the previous
    /// inbox will never receive anything again.
    pub fn register(&mut self, module_name: impl Into<String>) -> Inbox {
        let name = module_name.into();
        let (tx, rx) = mpsc::unbounded_channel();

        if self.senders.insert(name.clone(), tx).is_some() {
            warn!("module '{name}' registered twice, replacing its queue");
        }

        Inbox { name, rx }
    }

    pub fn build(self) -> Arc<QueueRegistry> {
        Arc::new(QueueRegistry {
            senders: self.senders,
        })
    }
}

/// Name-indexed set of module inboxes
#[derive(Debug)]
pub struct QueueRegistry {
    senders: HashMap<String, UnboundedSender<Envelope>>,
}

impl QueueRegistry {
    pub fn builder() -> QueueRegistryBuilder {
        QueueRegistryBuilder::new()
    }

    /// Enqueue an envelope for the named module
    pub fn send(&self, destination: &str, envelope: Envelope) -> AgentResult<()> {
        let sender = self
            .senders
            .get(destination)
            .ok_or_else(|| AgentError::UnknownDestination(destination.to_string()))?;

        // The inbox of a stopped module is gone; treat it like an unknown name.
        sender
            .send(envelope)
            .map_err(|_| AgentError::UnknownDestination(destination.to_string()))?;

        trace!("enqueued envelope for {destination}");
        Ok(())
    }

    /// Enqueue a copy of the envelope into every registered inbox
    ///
    /// Returns the number of inboxes that accepted it.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        self.senders
            .values()
            .filter(|sender| sender.send(envelope.clone()).is_ok())
            .count()
    }

    pub fn contains(&self, module_name: &str) -> bool {
        self.senders.contains_key(module_name)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.senders.keys().map(String::as_str)
    }
}

/// Consuming end of a module's queue
#[derive(Debug)]
pub struct Inbox {
    name: String,
    rx: UnboundedReceiver<Envelope>,
}

impl Inbox {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `timeout` for the next envelope
    ///
    /// Returns `None` when nothing arrived in time.
    pub async fn receive_blocking(&mut self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next envelope if one is already queued
    pub fn try_receive(&mut self) -> Option<Envelope> {
        match self.rx.try_recv() {
            Ok(envelope) => Some(envelope),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Take everything currently queued without waiting
    pub fn drain_nonblocking(&mut self) -> Vec<Envelope> {
        std::iter::from_fn(|| self.try_receive()).collect()
    }

    /// Current queue depth
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
