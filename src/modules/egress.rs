//! Egress adapter - signs envelopes from its inbox and publishes them
//!
//! Each envelope goes through an explicit send state machine:
//!
//! ```text
//! Idle ──receive──▶ Sending ──ok──▶ Sent ──▶ Idle
//!                      │
//!                      └──error──▶ Failed ──next cycle──▶ Sending (same envelope)
//! ```
//!
//! A failed send toggles the broker host once and ends the cycle, so
//! successive failing cycles alternate between the primary and secondary
//! host. The envelope is held (signed once, never re-signed) until it is
//! delivered or the optional delivery attempt limit is reached.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{Cycle, Module, ModuleContext, ModuleDescriptor, ModuleGroup, names};
use crate::broker::BrokerLink;
use crate::config::{BrokerSettings, EGRESS_BINDING};
use crate::envelope::Envelope;
use crate::error::{AgentError, AgentResult};
use crate::queue::Inbox;
use crate::signing::{Signer, select_signer, sign_envelope};

/// Store section holding the egress broker settings
pub const SECTION: &str = "EGRESSPROCESSOR";

pub const PRIORITY: u8 = 1;

/// An envelope on its way to the bus
#[derive(Debug)]
struct Pending {
    envelope: Envelope,

    /// Signed wire form, present once signing succeeded
    payload: Option<String>,

    /// Failed publish attempts so far
    attempts: u32,
}

impl Pending {
    fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            payload: None,
            attempts: 0,
        }
    }
}

#[derive(Debug)]
enum SendState {
    Idle,

    /// Publish in progress; survives a cancelled cycle
    Sending(Pending),

    Sent,

    /// Last attempt failed, retried on the next cycle
    Failed(Pending),
}

pub struct EgressProcessor {
    descriptor: ModuleDescriptor,
    inbox: Inbox,
    link: BrokerLink,
    signer: Arc<dyn Signer>,
    receive_timeout: Duration,
    state: SendState,
    shutdown_requested: bool,
    published: u64,
}

impl EgressProcessor {
    pub fn new(
        inbox: Inbox,
        link: BrokerLink,
        signer: Arc<dyn Signer>,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(
                names::EGRESS_PROCESSOR,
                PRIORITY,
                ModuleGroup::Processor,
            ),
            inbox,
            link,
            signer,
            receive_timeout,
            state: SendState::Idle,
            shutdown_requested: false,
            published: 0,
        }
    }

    pub fn from_context(ctx: ModuleContext) -> AgentResult<Self> {
        let settings = BrokerSettings::from_store(ctx.store.as_ref(), SECTION, EGRESS_BINDING)?;
        let signer = select_signer(&settings.signing);
        if !signer.is_available() {
            warn!("no signing token configured, envelopes will be sent unsigned");
        }

        let link = BrokerLink::new(names::EGRESS_PROCESSOR, settings, ctx.transport);
        Ok(Self::new(
            ctx.inbox,
            link,
            signer,
            ctx.scheduler.receive_timeout(),
        ))
    }

    pub fn link(&self) -> &BrokerLink {
        &self.link
    }

    /// Whether an envelope is held for another delivery attempt
    pub fn holds_undelivered(&self) -> bool {
        matches!(self.state, SendState::Sending(_) | SendState::Failed(_))
    }

    /// Envelopes published since start
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Move the next envelope into `Sending`; false when there is none
    async fn next_envelope(&mut self, first: bool) -> bool {
        match std::mem::replace(&mut self.state, SendState::Idle) {
            SendState::Sending(pending) | SendState::Failed(pending) => {
                self.state = SendState::Sending(pending);
                return true;
            }
            SendState::Idle | SendState::Sent => {}
        }

        let next = if first {
            self.inbox.receive_blocking(self.receive_timeout).await
        } else {
            self.inbox.try_receive()
        };

        match next {
            Some(envelope) => {
                self.state = SendState::Sending(Pending::new(envelope));
                true
            }
            None => false,
        }
    }

    /// Sign (once) and publish the envelope in `Sending`
    async fn transmit(&mut self) -> AgentResult<()> {
        let Self {
            state,
            link,
            signer,
            shutdown_requested,
            ..
        } = self;

        let SendState::Sending(pending) = state else {
            return Ok(());
        };

        if pending.envelope.is_shutdown() {
            *shutdown_requested = true;
        }

        if pending.payload.is_none() {
            sign_envelope(
                &mut pending.envelope,
                signer.as_ref(),
                &link.settings().signing,
            )?;
            pending.payload = Some(pending.envelope.to_json()?);
        }

        match pending.payload.as_deref() {
            Some(payload) => link.publish(payload).await,
            None => Ok(()),
        }
    }

    /// Record a failed attempt and toggle the broker host
    async fn fail(&mut self, reason: &AgentError) {
        let limit = self.link.settings().delivery_attempts;

        if let SendState::Sending(mut pending) = std::mem::replace(&mut self.state, SendState::Idle)
        {
            pending.attempts += 1;
            warn!(
                "publish to {} failed (attempt {}): {reason}",
                self.link.current_host(),
                pending.attempts
            );

            match limit {
                Some(max) if pending.attempts >= max => error!(
                    "dropping envelope {} after {} failed attempts",
                    pending.envelope.uuid().unwrap_or("-"),
                    pending.attempts
                ),
                _ => self.state = SendState::Failed(pending),
            }
        }

        self.link.fail_over().await;
    }

    fn after_cycle(&self) -> Cycle {
        match (self.shutdown_requested, self.holds_undelivered()) {
            (false, _) => Cycle::Continue,
            (true, true) => Cycle::Draining,
            (true, false) => Cycle::Stopped,
        }
    }
}

#[async_trait]
impl Module for EgressProcessor {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn initialize(&mut self) -> AgentResult<()> {
        // Declare the queue and exchange early; sends reconnect on demand
        let connected = self.link.connect().await.map(drop);
        match connected {
            Ok(()) => self.link.disconnect().await,
            Err(e) => warn!(
                "broker {} not reachable at startup: {e}",
                self.link.current_host()
            ),
        }
        Ok(())
    }

    async fn run_once(&mut self) -> AgentResult<Cycle> {
        let mut first = true;

        while self.next_envelope(first).await {
            first = false;

            match self.transmit().await {
                Ok(()) => {
                    if let SendState::Sending(pending) =
                        std::mem::replace(&mut self.state, SendState::Sent)
                    {
                        debug!(
                            "published {} envelope {}",
                            pending.envelope.kind(),
                            pending.envelope.uuid().unwrap_or("-")
                        );
                    }
                    self.published += 1;
                    self.link.disconnect().await;
                }
                Err(e) => {
                    self.fail(&e).await;
                    return Ok(self.after_cycle());
                }
            }
        }

        let cycle = self.after_cycle();
        if cycle == Cycle::Stopped {
            info!("outbound queue drained after shutdown notice");
        }
        Ok(cycle)
    }

    async fn recover(&mut self) -> AgentResult<()> {
        self.link.fail_over().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.link.disconnect().await;
    }
}
