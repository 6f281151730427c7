//! Node health agent
//!
//! Sensors, actuators and message handlers run as independently scheduled
//! [`modules`] that only talk through per-module inboxes. Two broker
//! adapters connect that internal world to the alerting bus: the egress
//! processor signs and publishes outgoing alerts, the ingress processor
//! consumes commands and routes them to the module that serves them.

pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod modules;
pub mod monitors;
pub mod queue;
pub mod signing;
pub mod util;

pub use bootstrap::{ModuleCatalog, bootstrap};
pub use envelope::{Body, BodyKind, Envelope, Payload};
pub use error::{AgentError, AgentResult};
