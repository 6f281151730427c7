//! Broker transport over the RabbitMQ management HTTP API
//!
//! Every channel operation maps to one request:
//!
//! | operation          | request                                                  |
//! |--------------------|----------------------------------------------------------|
//! | open               | `GET  /api/vhosts/{vhost}`                               |
//! | `declare_queue`    | `PUT  /api/queues/{vhost}/{queue}`                       |
//! | `declare_exchange` | `PUT  /api/exchanges/{vhost}/{exchange}`                 |
//! | `bind`             | `POST /api/bindings/{vhost}/e/{exchange}/q/{queue}`      |
//! | `publish`          | `POST /api/exchanges/{vhost}/{exchange}/publish`         |
//! | `fetch`            | `POST /api/queues/{vhost}/{queue}/get`                   |
//!
//! Fetched messages are acknowledged and removed (`ack_requeue_false`), so an
//! envelope that cannot be routed is never redelivered.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace, warn};

use super::{Channel, Transport};
use crate::config::BrokerSettings;
use crate::error::{AgentError, AgentResult};

/// Port of the management API when the host string does not name one
pub const DEFAULT_MANAGEMENT_PORT: u16 = 15672;

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    /// HTTP client (reused across channels)
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

/// Base URL of the management API for a `host` or `host:port` string
pub fn management_url(host: &str) -> AgentResult<Url> {
    let base = if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}/api/", host.trim_end_matches('/'))
    } else if host.contains(':') {
        format!("http://{host}/api/")
    } else {
        format!("http://{host}:{DEFAULT_MANAGEMENT_PORT}/api/")
    };

    Url::parse(&base)
        .map_err(|e| AgentError::Configuration(format!("invalid broker host '{host}': {e}")))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, host: &str, settings: &BrokerSettings) -> AgentResult<Box<dyn Channel>> {
        let channel = HttpChannel {
            client: self.client.clone(),
            base: management_url(host)?,
            settings: settings.clone(),
        };

        let url = channel.endpoint(&["vhosts", &settings.virtual_host])?;
        channel
            .send(channel.client.get(url), "virtual host probe")
            .await?;

        debug!("management API on {host} reachable");
        Ok(Box::new(channel))
    }
}

struct HttpChannel {
    client: Client,
    base: Url,
    settings: BrokerSettings,
}

#[derive(Debug, Deserialize)]
struct PublishOutcome {
    #[serde(default)]
    routed: bool,
}

#[derive(Debug, Deserialize)]
struct FetchedMessage {
    payload: String,
    #[serde(default)]
    payload_encoding: String,
}

impl HttpChannel {
    fn endpoint(&self, segments: &[&str]) -> AgentResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AgentError::Configuration(format!("broker URL {} has no path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> AgentResult<Response> {
        let response = request
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .timeout(self.settings.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Connection(format!(
                "{what} failed: HTTP {status} {body}"
            )));
        }

        trace!("{what}: HTTP {status}");
        Ok(response)
    }
}

#[async_trait]
impl Channel for HttpChannel {
    async fn declare_queue(&mut self) -> AgentResult<()> {
        let s = &self.settings;
        let url = self.endpoint(&["queues", &s.virtual_host, &s.queue_name])?;
        let body = json!({ "durable": true, "auto_delete": false, "arguments": {} });

        self.send(self.client.put(url).json(&body), "queue declaration")
            .await
            .map(drop)
    }

    async fn declare_exchange(&mut self) -> AgentResult<()> {
        let s = &self.settings;
        let url = self.endpoint(&["exchanges", &s.virtual_host, &s.exchange_name])?;
        let body = json!({
            "type": "topic",
            "durable": true,
            "auto_delete": false,
            "internal": false,
            "arguments": {}
        });

        self.send(self.client.put(url).json(&body), "exchange declaration")
            .await
            .map(drop)
    }

    async fn bind(&mut self) -> AgentResult<()> {
        let s = &self.settings;
        let url = self.endpoint(&[
            "bindings",
            &s.virtual_host,
            "e",
            &s.exchange_name,
            "q",
            &s.queue_name,
        ])?;
        let body = json!({ "routing_key": s.routing_key, "arguments": {} });

        self.send(self.client.post(url).json(&body), "queue binding")
            .await
            .map(drop)
    }

    async fn publish(&mut self, payload: &str) -> AgentResult<()> {
        let s = &self.settings;
        let url = self.endpoint(&["exchanges", &s.virtual_host, &s.exchange_name, "publish"])?;
        let body = json!({
            "properties": { "content_type": "application/json", "delivery_mode": 2 },
            "routing_key": s.routing_key,
            "payload": payload,
            "payload_encoding": "string"
        });

        let outcome: PublishOutcome = self
            .send(self.client.post(url).json(&body), "publish")
            .await?
            .json()
            .await?;

        if !outcome.routed {
            warn!(
                "message published to {} with key {} was not routed to any queue",
                s.exchange_name, s.routing_key
            );
        }
        Ok(())
    }

    async fn fetch(&mut self, max: usize) -> AgentResult<Vec<String>> {
        let s = &self.settings;
        let url = self.endpoint(&["queues", &s.virtual_host, &s.queue_name, "get"])?;
        let body = json!({
            "count": max,
            "ackmode": "ack_requeue_false",
            "encoding": "auto"
        });

        let messages: Vec<FetchedMessage> = self
            .send(self.client.post(url).json(&body), "queue fetch")
            .await?
            .json()
            .await?;

        Ok(messages
            .into_iter()
            .filter_map(|message| {
                if message.payload_encoding == "base64" {
                    warn!("dropping binary message from {}", s.queue_name);
                    None
                } else {
                    Some(message.payload)
                }
            })
            .collect())
    }

    async fn close(&mut self) {}
}
