use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use tracing::trace;

use crate::envelope::BodyKind;
use crate::error::{AgentError, AgentResult};
use crate::modules::names;

/// Read-only key/value view of the deployment configuration
///
/// Paths are slash separated (`SECTION/key`). A missing key is `None`, which
/// callers must keep apart from an empty string.
pub trait ConfigStore: Send + Sync {
    fn get(&self, path: &str) -> Option<String>;
}

/// [`ConfigStore`] backed by a flattened JSON document
#[derive(Debug, Clone, Default)]
pub struct KvStore {
    entries: HashMap<String, String>,
}

impl KvStore {
    /// Flatten nested objects and arrays into `a/b/0` style paths
    pub fn from_value(value: &Value) -> Self {
        let mut entries = HashMap::new();
        flatten_into(&mut entries, value, String::new());
        Self { entries }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ConfigStore for KvStore {
    fn get(&self, path: &str) -> Option<String> {
        self.entries.get(path).cloned()
    }
}

fn flatten_into(entries: &mut HashMap<String, String>, value: &Value, prefix: String) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(entries, nested, child_path(&prefix, key));
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                flatten_into(entries, nested, child_path(&prefix, &index.to_string()));
            }
        }
        Value::Null => {}
        Value::String(s) => {
            entries.insert(prefix, s.clone());
        }
        other => {
            entries.insert(prefix, other.to_string());
        }
    }
}

fn child_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

/// Value at `section/key`, or the default when absent
pub fn get_or(store: &dyn ConfigStore, section: &str, key: &str, default: &str) -> String {
    store
        .get(&format!("{section}/{key}"))
        .unwrap_or_else(|| default.to_string())
}

/// Numeric value at `section/key`
///
/// Absent keys fall back to the default. A present value that does not parse
/// is a configuration error rather than silently ignored.
pub fn get_parsed<T: FromStr>(
    store: &dyn ConfigStore,
    section: &str,
    key: &str,
    default: T,
) -> AgentResult<T> {
    match store.get(&format!("{section}/{key}")) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AgentError::Configuration(format!("{section}/{key}: cannot parse '{raw}'"))
        }),
    }
}

/// Connection, binding and signing settings of one broker adapter
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub virtual_host: String,
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub username: String,
    pub password: String,
    pub primary_host: String,
    pub secondary_host: String,
    pub signing: SigningSettings,

    /// Per-request bound on broker I/O
    pub request_timeout: Duration,

    /// Give up on an envelope after this many failed sends (`None` retries forever)
    pub delivery_attempts: Option<u32>,
}

/// Queue, exchange and routing key used when the store names none
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDefaults {
    pub queue_name: &'static str,
    pub exchange_name: &'static str,
    pub routing_key: &'static str,
}

pub const EGRESS_BINDING: BindingDefaults = BindingDefaults {
    queue_name: "ras_status",
    exchange_name: "ras_sspl",
    routing_key: "sspl_ll",
};

pub const INGRESS_BINDING: BindingDefaults = BindingDefaults {
    queue_name: "actuator-req",
    exchange_name: "sspl-in",
    routing_key: "actuator-req-key",
};

#[derive(Debug, Clone, PartialEq)]
pub struct SigningSettings {
    pub username: String,
    pub token: String,
    pub expires_seconds: i64,
}

impl BrokerSettings {
    pub fn from_store(
        store: &dyn ConfigStore,
        section: &str,
        defaults: BindingDefaults,
    ) -> AgentResult<Self> {
        let delivery_attempts = match store.get(&format!("{section}/delivery_attempts")) {
            None => None,
            Some(_) => match get_parsed(store, section, "delivery_attempts", 0u32)? {
                0 => {
                    return Err(AgentError::Configuration(format!(
                        "{section}/delivery_attempts must be at least 1"
                    )));
                }
                attempts => Some(attempts),
            },
        };

        let settings = Self {
            virtual_host: get_or(store, section, "virtual_host", "SSPL"),
            queue_name: get_or(store, section, "queue_name", defaults.queue_name),
            exchange_name: get_or(store, section, "exchange_name", defaults.exchange_name),
            routing_key: get_or(store, section, "routing_key", defaults.routing_key),
            username: get_or(store, section, "username", "sspluser"),
            password: get_or(store, section, "password", "sspl4ever"),
            primary_host: get_or(store, section, "primary_broker_host", "localhost"),
            secondary_host: get_or(store, section, "secondary_broker_host", "localhost"),
            signing: SigningSettings {
                username: get_or(store, section, "signature_username", "sspl-ll"),
                token: get_or(store, section, "signature_token", "FAKETOKEN1234"),
                expires_seconds: get_parsed(store, section, "signature_expires_seconds", 3600)?,
            },
            request_timeout: Duration::from_secs(get_parsed(
                store,
                section,
                "request_timeout_secs",
                10,
            )?),
            delivery_attempts,
        };

        trace!("broker settings for {section}: {settings:?}");
        Ok(settings)
    }
}

/// Cluster location of this node, stamped into every outgoing alert
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemIdentity {
    pub site_id: String,
    pub rack_id: String,
    pub node_id: String,
    pub cluster_id: String,
}

pub const SYSTEM_INFORMATION: &str = "SYSTEM_INFORMATION";

impl SystemIdentity {
    pub fn from_store(store: &dyn ConfigStore) -> Self {
        Self {
            site_id: get_or(store, SYSTEM_INFORMATION, "site_id", "001"),
            rack_id: get_or(store, SYSTEM_INFORMATION, "rack_id", "001"),
            node_id: get_or(store, SYSTEM_INFORMATION, "node_id", "001"),
            cluster_id: get_or(store, SYSTEM_INFORMATION, "cluster_id", ""),
        }
    }
}

/// Name of the group that is active in every deployment profile
pub const ALWAYS_ENABLED: &str = "_ENABLE_ALWAYS";

/// Modules contributed by one enablement group
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct GroupModules {
    #[serde(default)]
    pub sensors: Vec<String>,
    #[serde(default)]
    pub actuators: Vec<String>,
    #[serde(default)]
    pub message_handlers: Vec<String>,
    #[serde(default)]
    pub core_processors: Vec<String>,
}

/// Which module groups are active and what each group contains
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct EnablementTable {
    #[serde(default)]
    pub active_groups: Vec<String>,

    #[serde(default = "default_groups")]
    pub groups: BTreeMap<String, GroupModules>,
}

impl Default for EnablementTable {
    fn default() -> Self {
        Self {
            active_groups: vec![],
            groups: default_groups(),
        }
    }
}

fn default_groups() -> BTreeMap<String, GroupModules> {
    let always = GroupModules {
        sensors: vec![names::DISK_SPACE_SENSOR.to_string()],
        actuators: vec![names::THREAD_CONTROLLER.to_string()],
        message_handlers: vec![names::NODE_DATA_MSG_HANDLER.to_string()],
        core_processors: vec![
            names::EGRESS_PROCESSOR.to_string(),
            names::INGRESS_PROCESSOR.to_string(),
        ],
    };

    BTreeMap::from([(ALWAYS_ENABLED.to_string(), always)])
}

/// Ingress routing rule
///
/// A rule matches when the body kind is equal, the payload carries `key`
/// (if set) and the resource type starts with `prefix` (if set).
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct RouteRule {
    pub kind: BodyKind,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    pub module: String,
}

fn default_routes() -> Vec<RouteRule> {
    vec![
        RouteRule {
            kind: BodyKind::ActuatorRequest,
            key: Some(crate::envelope::THREAD_CONTROLLER.to_string()),
            prefix: None,
            module: names::THREAD_CONTROLLER.to_string(),
        },
        RouteRule {
            kind: BodyKind::SensorRequest,
            key: None,
            prefix: Some("node:".to_string()),
            module: names::NODE_DATA_MSG_HANDLER.to_string(),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct SchedulerSettings {
    /// Delay between two work cycles of the same module
    #[serde(default = "default_re_arm_millis")]
    pub re_arm_millis: u64,

    /// Upper bound of a single work cycle before it counts as stuck
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,

    /// How long a module waits on an empty inbox within one cycle
    #[serde(default = "default_receive_timeout_millis")]
    pub receive_timeout_millis: u64,
}

impl SchedulerSettings {
    pub fn re_arm(&self) -> Duration {
        Duration::from_millis(self.re_arm_millis)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_millis)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            re_arm_millis: default_re_arm_millis(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
            receive_timeout_millis: default_receive_timeout_millis(),
        }
    }
}

fn default_re_arm_millis() -> u64 {
    1000
}

fn default_cycle_timeout_secs() -> u64 {
    60
}

fn default_receive_timeout_millis() -> u64 {
    250
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// Free-form settings served through [`ConfigStore`]
    #[serde(default)]
    pub store: Value,

    #[serde(default)]
    pub modules: EnablementTable,

    #[serde(default = "default_routes")]
    pub routing: Vec<RouteRule>,

    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: Value::Null,
            modules: EnablementTable::default(),
            routing: default_routes(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl Config {
    pub fn kv_store(&self) -> KvStore {
        KvStore::from_value(&self.store)
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> AgentResult<Config> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path).map_err(|e| {
        AgentError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&file_content)
        .map_err(|e| AgentError::Configuration(format!("invalid configuration file: {e}")))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
