//! Wire data model for every alert and command
//!
//! An [`Envelope`] is what travels on the alerting bus and between modules.
//! On the wire it looks like this:
//!
//! ```text
//! {
//!   "title": ..., "description": ...,
//!   "username": ..., "signature": ..., "time": ..., "expires": ...,
//!   "message": {
//!     "sspl_ll_msg_header": { "schema_version", "sspl_version", "msg_version", "uuid" },
//!     "sensor_response_type": { "info": {...}, "specific_info": ..., ... }
//!   }
//! }
//! ```
//!
//! Exactly one of the four `*_type` body keys is populated. Anything else
//! found next to it inside `message` (debug flags, request paths) is carried
//! through untouched.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{AgentError, AgentResult};

pub const SCHEMA_VERSION: &str = "1.0.0";
pub const PRODUCT_VERSION: &str = "1.0.0";
pub const MESSAGE_VERSION: &str = "1.0.0";

/// `thread_response` text that marks the global shutdown notice
pub const SHUTDOWN_RESPONSE: &str = "SSPL-LL is shutting down";

/// Payload key of thread controller requests and responses
pub const THREAD_CONTROLLER: &str = "thread_controller";

const DEFAULT_USERNAME: &str = "SSPL-LL";
const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(flatten)]
    pub security: Security,

    pub message: Message,
}

/// Signer identity and signature attached by the egress adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "not_available")]
    pub signature: String,

    /// Human readable issue time
    #[serde(default = "not_available")]
    pub time: String,

    /// Validity in seconds, `-1` while unsigned
    #[serde(default = "default_expires")]
    pub expires: i64,
}

impl Default for Security {
    fn default() -> Self {
        Self {
            username: default_username(),
            signature: not_available(),
            time: not_available(),
            expires: default_expires(),
        }
    }
}

fn default_username() -> String {
    DEFAULT_USERNAME.to_string()
}

fn not_available() -> String {
    NOT_AVAILABLE.to_string()
}

fn default_expires() -> i64 {
    -1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub schema_version: String,

    #[serde(rename = "sspl_version")]
    pub product_version: String,

    #[serde(rename = "msg_version")]
    pub message_version: String,

    /// Correlation id pairing a response with its request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            product_version: PRODUCT_VERSION.to_string(),
            message_version: MESSAGE_VERSION.to_string(),
            uuid: None,
        }
    }
}

/// Identifies the resource an alert or command is about
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    #[serde(default)]
    pub site_id: String,
    #[serde(default)]
    pub rack_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub event_time: String,
}

/// Content of a body variant
///
/// `specific_info` is resource specific. For multi-part resources it is a
/// list of records, each of which may hold an `ERROR` entry instead of its
/// normal fields when the underlying read failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ResourceInfo>,

    /// `Some(Value::Null)` stays distinct from an absent key
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub specific_info: Option<Value>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

const RESOURCE_KEYS: [&str; 3] = ["resource_type", "sensor_type", "node_request"];

impl Payload {
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// The resource type this payload refers to
    ///
    /// Responses carry it in `info`. Requests name it directly
    /// (`{"sensor_type": ...}`) or one level down (`{"node_data": {"sensor_type": ...}}`).
    pub fn resource_type(&self) -> Option<&str> {
        if let Some(info) = &self.info
            && !info.resource_type.is_empty()
        {
            return Some(&info.resource_type);
        }

        find_resource_key(&self.fields).or_else(|| {
            self.fields
                .values()
                .filter_map(Value::as_object)
                .find_map(find_resource_key)
        })
    }
}

fn find_resource_key(fields: &Map<String, Value>) -> Option<&str> {
    RESOURCE_KEYS
        .iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    SensorRequest,
    SensorResponse,
    ActuatorRequest,
    ActuatorResponse,
}

impl BodyKind {
    pub const ALL: [BodyKind; 4] = [
        BodyKind::SensorRequest,
        BodyKind::SensorResponse,
        BodyKind::ActuatorRequest,
        BodyKind::ActuatorResponse,
    ];

    /// Key of this variant inside `message`
    pub fn wire_key(self) -> &'static str {
        match self {
            BodyKind::SensorRequest => "sensor_request_type",
            BodyKind::SensorResponse => "sensor_response_type",
            BodyKind::ActuatorRequest => "actuator_request_type",
            BodyKind::ActuatorResponse => "actuator_response_type",
        }
    }

    fn title(self) -> &'static str {
        match self {
            BodyKind::SensorRequest => "SSPL-LL Sensor Request",
            BodyKind::SensorResponse => "SSPL-LL Sensor Response",
            BodyKind::ActuatorRequest => "SSPL-LL Actuator Request",
            BodyKind::ActuatorResponse => "SSPL-LL Actuator Response",
        }
    }
}

impl fmt::Display for BodyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_key())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    SensorRequest(Payload),
    SensorResponse(Payload),
    ActuatorRequest(Payload),
    ActuatorResponse(Payload),
}

impl Body {
    pub fn new(kind: BodyKind, payload: Payload) -> Self {
        match kind {
            BodyKind::SensorRequest => Body::SensorRequest(payload),
            BodyKind::SensorResponse => Body::SensorResponse(payload),
            BodyKind::ActuatorRequest => Body::ActuatorRequest(payload),
            BodyKind::ActuatorResponse => Body::ActuatorResponse(payload),
        }
    }

    pub fn kind(&self) -> BodyKind {
        match self {
            Body::SensorRequest(_) => BodyKind::SensorRequest,
            Body::SensorResponse(_) => BodyKind::SensorResponse,
            Body::ActuatorRequest(_) => BodyKind::ActuatorRequest,
            Body::ActuatorResponse(_) => BodyKind::ActuatorResponse,
        }
    }

    pub fn payload(&self) -> &Payload {
        match self {
            Body::SensorRequest(p)
            | Body::SensorResponse(p)
            | Body::ActuatorRequest(p)
            | Body::ActuatorResponse(p) => p,
        }
    }

    fn into_payload(self) -> Payload {
        match self {
            Body::SensorRequest(p)
            | Body::SensorResponse(p)
            | Body::ActuatorRequest(p)
            | Body::ActuatorResponse(p) => p,
        }
    }
}

/// The signed part of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub struct Message {
    pub header: Header,
    pub body: Body,

    /// Keys next to the body that are not interpreted by the agent
    pub extras: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct RawMessage {
    sspl_ll_msg_header: Header,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    sensor_request_type: Option<Payload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    sensor_response_type: Option<Payload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    actuator_request_type: Option<Payload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    actuator_response_type: Option<Payload>,

    #[serde(flatten)]
    extras: Map<String, Value>,
}

impl TryFrom<RawMessage> for Message {
    type Error = String;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let mut bodies = [
            raw.sensor_request_type.map(Body::SensorRequest),
            raw.sensor_response_type.map(Body::SensorResponse),
            raw.actuator_request_type.map(Body::ActuatorRequest),
            raw.actuator_response_type.map(Body::ActuatorResponse),
        ]
        .into_iter()
        .flatten();

        let Some(body) = bodies.next() else {
            return Err("message carries no recognized body variant".to_string());
        };

        if let Some(other) = bodies.next() {
            return Err(format!(
                "message carries more than one body variant ({} and {})",
                body.kind(),
                other.kind()
            ));
        }

        Ok(Message {
            header: raw.sspl_ll_msg_header,
            body,
            extras: raw.extras,
        })
    }
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        let kind = message.body.kind();
        let payload = Some(message.body.into_payload());
        let pick = |k: BodyKind| if k == kind { payload.clone() } else { None };

        RawMessage {
            sspl_ll_msg_header: message.header,
            sensor_request_type: pick(BodyKind::SensorRequest),
            sensor_response_type: pick(BodyKind::SensorResponse),
            actuator_request_type: pick(BodyKind::ActuatorRequest),
            actuator_response_type: pick(BodyKind::ActuatorResponse),
            extras: message.extras,
        }
    }
}

impl Envelope {
    /// Create an unsigned envelope with a fresh correlation id
    pub fn new(body: Body) -> Self {
        let kind = body.kind();
        Self {
            title: kind.title().to_string(),
            description: format!("Storage Platform Library - Low Level - {}", kind.title()),
            security: Security::default(),
            message: Message {
                header: Header {
                    uuid: Some(Uuid::new_v4().to_string()),
                    ..Header::default()
                },
                body,
                extras: Map::new(),
            },
        }
    }

    /// Build the response to this envelope, keeping its correlation id
    pub fn reply(&self, body: Body) -> Self {
        let mut response = Envelope::new(body);
        response.message.header.uuid = self.message.header.uuid.clone();
        response
    }

    /// The notice broadcast to every module when the agent stops
    pub fn shutdown_notice() -> Self {
        let payload = Payload::default().with_field(
            THREAD_CONTROLLER,
            serde_json::json!({
                "module_name": "all",
                "thread_response": SHUTDOWN_RESPONSE,
            }),
        );
        Envelope::new(Body::ActuatorResponse(payload))
    }

    pub fn body(&self) -> &Body {
        &self.message.body
    }

    pub fn kind(&self) -> BodyKind {
        self.message.body.kind()
    }

    pub fn uuid(&self) -> Option<&str> {
        self.message.header.uuid.as_deref()
    }

    pub fn resource_type(&self) -> Option<&str> {
        self.message.body.payload().resource_type()
    }

    pub fn is_shutdown(&self) -> bool {
        let Body::ActuatorResponse(payload) = &self.message.body else {
            return false;
        };

        payload
            .fields
            .get(THREAD_CONTROLLER)
            .and_then(|controller| controller.get("thread_response"))
            .and_then(Value::as_str)
            == Some(SHUTDOWN_RESPONSE)
    }

    /// Serialized `message` object, the part covered by the signature
    pub fn message_bytes(&self) -> AgentResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.message)?)
    }

    pub fn to_json(&self) -> AgentResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an envelope received from the bus
    ///
    /// Any shape mismatch, including a missing or duplicated body variant,
    /// is reported as [`AgentError::Validation`].
    pub fn from_json(raw: &str) -> AgentResult<Self> {
        serde_json::from_str(raw).map_err(|e| AgentError::Validation(e.to_string()))
    }
}
