//! Connection handling towards the alerting bus
//!
//! A [`Transport`] opens a [`Channel`] to one broker host. The
//! [`BrokerLink`] owned by each adapter module drives the connection state
//! machine on top of it:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                        │                  │
//!      └──────── error ─────────┴── fail_over ─────┘   (target host toggles)
//! ```
//!
//! ## Transports
//!
//! - **HTTP** ([`http::HttpTransport`]): broker management API over reqwest
//! - **In-Memory** ([`memory::MemoryTransport`]): in-process broker for tests and loopback runs

pub mod http;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::BrokerSettings;
use crate::error::{AgentError, AgentResult};

/// Opens channels to a broker host
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, host: &str, settings: &BrokerSettings) -> AgentResult<Box<dyn Channel>>;
}

/// An open connection bound to the queue/exchange of one adapter
///
/// Declarations are idempotent: declaring an object that already exists
/// with compatible settings succeeds and changes nothing.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare the durable queue
    async fn declare_queue(&mut self) -> AgentResult<()>;

    /// Declare the durable topic exchange
    async fn declare_exchange(&mut self) -> AgentResult<()>;

    /// Bind the queue to the exchange with the routing key
    async fn bind(&mut self) -> AgentResult<()>;

    /// Publish a JSON document to the exchange with the routing key
    async fn publish(&mut self, payload: &str) -> AgentResult<()>;

    /// Take up to `max` messages from the queue, acknowledging them
    async fn fetch(&mut self, max: usize) -> AgentResult<Vec<String>>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Primary,
    Secondary,
}

impl Target {
    fn toggled(self) -> Self {
        match self {
            Target::Primary => Target::Secondary,
            Target::Secondary => Target::Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Broker connection exclusively owned by one adapter module
pub struct BrokerLink {
    owner: String,
    settings: BrokerSettings,
    transport: Arc<dyn Transport>,
    target: Target,
    state: LinkState,
    channel: Option<Box<dyn Channel>>,
}

impl fmt::Debug for BrokerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerLink")
            .field("owner", &self.owner)
            .field("host", &self.current_host())
            .field("target", &self.target)
            .field("state", &self.state)
            .finish()
    }
}

impl BrokerLink {
    pub fn new(
        owner: impl Into<String>,
        settings: BrokerSettings,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            owner: owner.into(),
            settings,
            transport,
            target: Target::Primary,
            state: LinkState::Disconnected,
            channel: None,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn current_host(&self) -> &str {
        match self.target {
            Target::Primary => &self.settings.primary_host,
            Target::Secondary => &self.settings.secondary_host,
        }
    }

    /// Open a channel to the current target unless one is already open
    ///
    /// Queue and exchange declaration failures are logged only; they usually
    /// mean the objects exist with compatible settings. A failed bind fails
    /// the connection.
    pub async fn connect(&mut self) -> AgentResult<&mut Box<dyn Channel>> {
        if self.channel.is_none() {
            self.state = LinkState::Connecting;
            let host = self.current_host().to_string();
            debug!("{}: connecting to broker {host}", self.owner);

            match self.open(&host).await {
                Ok(channel) => {
                    info!("{}: connected to broker {host}", self.owner);
                    self.channel = Some(channel);
                    self.state = LinkState::Connected;
                }
                Err(e) => {
                    self.state = LinkState::Disconnected;
                    return Err(e);
                }
            }
        }

        self.channel
            .as_mut()
            .ok_or_else(|| AgentError::Connection("channel vanished after connect".to_string()))
    }

    async fn open(&self, host: &str) -> AgentResult<Box<dyn Channel>> {
        let mut channel = self.transport.open(host, &self.settings).await?;

        if let Err(e) = channel.declare_queue().await {
            warn!("{}: queue declaration on {host}: {e}", self.owner);
        }
        if let Err(e) = channel.declare_exchange().await {
            warn!("{}: exchange declaration on {host}: {e}", self.owner);
        }
        if let Err(e) = channel.bind().await {
            channel.close().await;
            return Err(e);
        }

        Ok(channel)
    }

    pub async fn publish(&mut self, payload: &str) -> AgentResult<()> {
        self.connect().await?.publish(payload).await
    }

    pub async fn fetch(&mut self, max: usize) -> AgentResult<Vec<String>> {
        self.connect().await?.fetch(max).await
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.state = LinkState::Disconnected;
    }

    /// Drop the connection and switch to the other broker host
    pub async fn fail_over(&mut self) {
        self.disconnect().await;
        self.target = self.target.toggled();
        info!(
            "{}: switching broker target to {}",
            self.owner,
            self.current_host()
        );
    }
}
