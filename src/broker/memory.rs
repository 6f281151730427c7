//! In-memory broker (no network)
//!
//! Behaves like a topic-exchange broker living inside the process:
//! durable queues, topic exchanges with `*`/`#` routing and idempotent
//! declarations. Hosts can be switched unreachable to exercise failover,
//! and every connection attempt is recorded.
//!
//! Useful for tests and for running the agent loopback-only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::trace;

use super::{Channel, Transport};
use crate::config::BrokerSettings;
use crate::error::{AgentError, AgentResult};

#[derive(Debug, Default)]
struct BrokerState {
    /// (vhost, queue) -> messages
    queues: HashMap<(String, String), VecDeque<String>>,

    /// (vhost, exchange) -> bindings (queue, pattern)
    exchanges: HashMap<(String, String), Vec<(String, String)>>,

    unreachable: HashSet<String>,
    attempts: Vec<String>,
}

impl BrokerState {
    fn declare_queue(&mut self, vhost: &str, queue: &str) {
        self.queues
            .entry((vhost.to_string(), queue.to_string()))
            .or_default();
    }

    fn declare_exchange(&mut self, vhost: &str, exchange: &str) {
        self.exchanges
            .entry((vhost.to_string(), exchange.to_string()))
            .or_default();
    }

    fn bind(&mut self, vhost: &str, exchange: &str, queue: &str, pattern: &str) -> AgentResult<()> {
        if !self.queues.contains_key(&(vhost.to_string(), queue.to_string())) {
            return Err(AgentError::Connection(format!("no queue '{queue}' in vhost '{vhost}'")));
        }

        let bindings = self
            .exchanges
            .get_mut(&(vhost.to_string(), exchange.to_string()))
            .ok_or_else(|| {
                AgentError::Connection(format!("no exchange '{exchange}' in vhost '{vhost}'"))
            })?;

        let binding = (queue.to_string(), pattern.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    fn publish(&mut self, vhost: &str, exchange: &str, routing_key: &str, payload: &str) -> AgentResult<usize> {
        let bindings = self
            .exchanges
            .get(&(vhost.to_string(), exchange.to_string()))
            .ok_or_else(|| {
                AgentError::Connection(format!("no exchange '{exchange}' in vhost '{vhost}'"))
            })?
            .clone();

        let mut routed = 0;
        for (queue, pattern) in bindings {
            if topic_matches(&pattern, routing_key)
                && let Some(messages) = self.queues.get_mut(&(vhost.to_string(), queue))
            {
                messages.push_back(payload.to_string());
                routed += 1;
            }
        }
        Ok(routed)
    }
}

/// Topic routing: words split on `.`, `*` matches one word, `#` zero or more
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Shared handle to an in-process broker
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panicking test thread must not wedge every other user of the broker.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        let mut state = self.lock();
        if reachable {
            state.unreachable.remove(host);
        } else {
            state.unreachable.insert(host.to_string());
        }
    }

    /// Hosts of every `open` call, in order
    pub fn connection_attempts(&self) -> Vec<String> {
        self.lock().attempts.clone()
    }

    /// Set up a queue bound to an exchange, as an external consumer would
    pub fn bind_queue(&self, vhost: &str, exchange: &str, queue: &str, pattern: &str) {
        let mut state = self.lock();
        state.declare_queue(vhost, queue);
        state.declare_exchange(vhost, exchange);
        // both objects were just declared
        let _ = state.bind(vhost, exchange, queue, pattern);
    }

    /// Publish as an external producer; returns how many queues received it
    pub fn publish(&self, vhost: &str, exchange: &str, routing_key: &str, payload: &str) -> AgentResult<usize> {
        self.lock().publish(vhost, exchange, routing_key, payload)
    }

    /// Remove and return everything queued
    pub fn take_messages(&self, vhost: &str, queue: &str) -> Vec<String> {
        self.lock()
            .queues
            .get_mut(&(vhost.to_string(), queue.to_string()))
            .map(|messages| messages.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, vhost: &str, queue: &str) -> usize {
        self.lock()
            .queues
            .get(&(vhost.to_string(), queue.to_string()))
            .map_or(0, VecDeque::len)
    }

    pub fn binding_count(&self, vhost: &str, exchange: &str) -> usize {
        self.lock()
            .exchanges
            .get(&(vhost.to_string(), exchange.to_string()))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, host: &str, settings: &BrokerSettings) -> AgentResult<Box<dyn Channel>> {
        let mut state = self.lock();
        state.attempts.push(host.to_string());

        if state.unreachable.contains(host) {
            return Err(AgentError::Connection(format!("{host}: connection refused")));
        }

        trace!("memory broker: opened channel on {host}");
        Ok(Box::new(MemoryChannel {
            broker: self.clone(),
            host: host.to_string(),
            settings: settings.clone(),
        }))
    }
}

struct MemoryChannel {
    broker: MemoryTransport,
    host: String,
    settings: BrokerSettings,
}

impl MemoryChannel {
    /// Lock the broker, failing if the host went away since the channel opened
    fn state(&self) -> AgentResult<MutexGuard<'_, BrokerState>> {
        let state = self.broker.lock();
        if state.unreachable.contains(&self.host) {
            return Err(AgentError::Connection(format!("{}: connection reset", self.host)));
        }
        Ok(state)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&mut self) -> AgentResult<()> {
        let s = &self.settings;
        self.state()?.declare_queue(&s.virtual_host, &s.queue_name);
        Ok(())
    }

    async fn declare_exchange(&mut self) -> AgentResult<()> {
        let s = &self.settings;
        self.state()?.declare_exchange(&s.virtual_host, &s.exchange_name);
        Ok(())
    }

    async fn bind(&mut self) -> AgentResult<()> {
        let s = &self.settings;
        self.state()?
            .bind(&s.virtual_host, &s.exchange_name, &s.queue_name, &s.routing_key)
    }

    async fn publish(&mut self, payload: &str) -> AgentResult<()> {
        let s = &self.settings;
        let routed = self.state()?.publish(
            &s.virtual_host,
            &s.exchange_name,
            &s.routing_key,
            payload,
        )?;
        trace!("memory broker: routed to {routed} queue(s)");
        Ok(())
    }

    async fn fetch(&mut self, max: usize) -> AgentResult<Vec<String>> {
        let s = &self.settings;
        let mut state = self.state()?;
        let Some(messages) = state
            .queues
            .get_mut(&(s.virtual_host.clone(), s.queue_name.clone()))
        else {
            return Ok(vec![]);
        };

        let count = max.min(messages.len());
        Ok(messages.drain(..count).collect())
    }

    async fn close(&mut self) {}
}
