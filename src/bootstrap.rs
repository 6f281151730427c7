//! Agent wiring
//!
//! Turns a [`Config`] into a ready-to-start [`Scheduler`]:
//!
//! 1. resolve the active module names from the enablement table
//! 2. register one inbox per module and freeze the queue registry
//! 3. build every module from the catalog and hand it to the scheduler
//!
//! Every inbox exists before the first module is built, so no module can
//! observe a partially populated registry.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::broker::Transport;
use crate::config::{ALWAYS_ENABLED, Config, ConfigStore, EnablementTable, SystemIdentity};
use crate::error::{AgentError, AgentResult};
use crate::modules::disk_space::DiskSpaceSensor;
use crate::modules::egress::EgressProcessor;
use crate::modules::ingress::IngressProcessor;
use crate::modules::node_data::NodeDataMsgHandler;
use crate::modules::scheduler::Scheduler;
use crate::modules::thread_controller::ThreadController;
use crate::modules::{Module, ModuleContext, names};
use crate::queue::QueueRegistry;

type ModuleFactory = Box<dyn Fn(ModuleContext) -> AgentResult<Box<dyn Module>> + Send + Sync>;

/// Module constructors by module name
#[derive(Default)]
pub struct ModuleCatalog {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every module shipped with the agent
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog.register(names::EGRESS_PROCESSOR, |ctx| {
            Ok(Box::new(EgressProcessor::from_context(ctx)?))
        });
        catalog.register(names::INGRESS_PROCESSOR, |ctx| {
            Ok(Box::new(IngressProcessor::from_context(ctx)?))
        });
        catalog.register(names::NODE_DATA_MSG_HANDLER, |ctx| {
            Ok(Box::new(NodeDataMsgHandler::from_context(ctx)?))
        });
        catalog.register(names::DISK_SPACE_SENSOR, |ctx| {
            Ok(Box::new(DiskSpaceSensor::from_context(ctx)?))
        });
        catalog.register(names::THREAD_CONTROLLER, |ctx| {
            Ok(Box::new(ThreadController::from_context(ctx)?))
        });
        catalog
    }

    /// Add or replace the constructor of `name`
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(ModuleContext) -> AgentResult<Box<dyn Module>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

/// Names of the modules to run, in enablement order without duplicates
///
/// The always-enabled group comes first, then the active groups in the
/// order they are listed. Unknown groups are skipped with a warning.
pub fn resolve_modules(table: &EnablementTable) -> Vec<String> {
    let mut resolved: Vec<String> = vec![];

    let groups = std::iter::once(ALWAYS_ENABLED).chain(
        table
            .active_groups
            .iter()
            .map(String::as_str)
            .filter(|group| *group != ALWAYS_ENABLED),
    );

    for group in groups {
        let Some(modules) = table.groups.get(group) else {
            warn!("module group {group} is not defined, skipping");
            continue;
        };

        let members = modules
            .sensors
            .iter()
            .chain(&modules.actuators)
            .chain(&modules.message_handlers)
            .chain(&modules.core_processors);

        for name in members {
            if !resolved.contains(name) {
                resolved.push(name.clone());
            }
        }
    }

    resolved
}

/// Build a scheduler holding every enabled module
///
/// A module that cannot be constructed is a configuration error and fails
/// the whole startup.
#[instrument(skip_all)]
pub fn bootstrap(
    config: &Config,
    transport: Arc<dyn Transport>,
    catalog: &ModuleCatalog,
) -> AgentResult<Scheduler> {
    let enabled: Vec<String> = resolve_modules(&config.modules)
        .into_iter()
        .filter(|name| {
            let known = catalog.contains(name);
            if !known {
                warn!("no module named {name}, skipping");
            }
            known
        })
        .collect();

    if !enabled.iter().any(|name| name == names::EGRESS_PROCESSOR) {
        warn!("{} is not enabled, alerts will not leave this node", names::EGRESS_PROCESSOR);
    }

    let mut builder = QueueRegistry::builder();
    let inboxes: Vec<_> = enabled
        .iter()
        .map(|name| (name.clone(), builder.register(name.clone())))
        .collect();
    let registry = builder.build();

    let mut scheduler = Scheduler::new(config.scheduler.clone(), registry.clone());
    let statuses = scheduler.status_board();
    let store: Arc<dyn ConfigStore> = Arc::new(config.kv_store());
    let identity = SystemIdentity::from_store(store.as_ref());
    debug!("node identity: {identity:?}");

    for (name, inbox) in inboxes {
        let factory = catalog
            .factories
            .get(&name)
            .ok_or_else(|| AgentError::Configuration(format!("no constructor for {name}")))?;

        let module = factory(ModuleContext {
            inbox,
            registry: registry.clone(),
            store: store.clone(),
            identity: identity.clone(),
            scheduler: config.scheduler.clone(),
            transport: transport.clone(),
            routes: config.routing.clone(),
            statuses: statuses.clone(),
        })
        .map_err(|e| AgentError::Configuration(format!("building {name}: {e}")))?;

        if module.descriptor().name != name {
            return Err(AgentError::Configuration(format!(
                "constructor for {name} built module {}",
                module.descriptor().name
            )));
        }
        scheduler.add(module);
    }

    info!("{} module(s) ready", scheduler.len());
    Ok(scheduler)
}
