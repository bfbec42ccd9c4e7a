//! Connection manager: alarm discovery, handle opening and callback routing.
//!
//! Every connection is given a [`ConnectionId`] before it is created, and the id is
//! registered with a [`CallbackRouter`] first. Service callbacks only carry the id, so
//! they are looked up in the registration table rather than pointing back into the
//! engine. A callback for an id that is no longer registered is dropped.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tracing::{debug, debug_span, error, info, trace, warn};

use crate::{
    binding::{AccessMode, AlarmLevel, DeclaredType, Registry, VariableBinding},
    cnv::{CnvData, CnvError, ConnectionId, ConnectionStatus},
    engine::{Engine, Timeouts},
    services::{CallbackSink, NetVarService},
    store::{ParamId, ParamStatus, ParamStore},
    utils,
};

/// What a callback on one connection refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackContext {
    pub binding: String,
    pub path: String,
    pub param_id: Option<ParamId>,
}

#[derive(Default)]
struct Registrations {
    next_id: u64,
    contexts: HashMap<ConnectionId, CallbackContext>,
}

/// Routes service callbacks to the engine by connection id
pub struct CallbackRouter<S: ParamStore> {
    registrations: Mutex<Registrations>,
    engine: Weak<Engine<S>>,
}

impl<S: ParamStore> CallbackRouter<S> {
    fn new(engine: Weak<Engine<S>>) -> Self {
        CallbackRouter {
            registrations: Mutex::new(Registrations::default()),
            engine,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registrations> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id that no callback will be routed for
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(utils::wrapping_inplace_add(&mut self.lock().next_id))
    }

    /// Allocate an id and route its callbacks to `binding`
    pub fn register(&self, binding: &VariableBinding) -> ConnectionId {
        let mut registrations = self.lock();
        let id = ConnectionId(utils::wrapping_inplace_add(&mut registrations.next_id));
        registrations.contexts.insert(
            id,
            CallbackContext {
                binding: binding.name().to_string(),
                path: binding.path().to_string(),
                param_id: binding.param_id(),
            },
        );
        id
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.lock().contexts.remove(&id);
    }

    pub fn context(&self, id: ConnectionId) -> Option<CallbackContext> {
        self.lock().contexts.get(&id).cloned()
    }

    /// Number of connections with callbacks routed
    pub fn len(&self) -> usize {
        self.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `handler` for the binding behind `id`. Panics are caught so that they
    /// never unwind into the service.
    fn dispatch(
        &self,
        id: ConnectionId,
        what: &str,
        handler: impl FnOnce(&Engine<S>, &VariableBinding, &CallbackContext),
    ) {
        let Some(context) = self.context(id) else {
            trace!("Dropping {what} callback for unregistered connection {id}");
            return;
        };
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let Some(binding) = engine.registry.get(&context.binding) else {
            return;
        };
        let result = catch_unwind(AssertUnwindSafe(|| handler(&engine, binding, &context)));
        if result.is_err() {
            error!(
                "Panic handling {what} callback for '{}' ({})",
                context.binding, context.path
            );
        }
    }
}

impl<S: ParamStore> CallbackSink for CallbackRouter<S> {
    fn data(&self, connection: ConnectionId, data: CnvData) {
        self.dispatch(connection, "data", |engine, binding, context| {
            if let Err(e) = engine.on_data(binding, &data) {
                error!(
                    "Unable to update '{}' from '{}': {e}",
                    context.binding, context.path
                );
            }
        });
    }

    fn status(&self, connection: ConnectionId, status: ConnectionStatus, error: Option<CnvError>) {
        self.dispatch(connection, "status", |engine, binding, _| {
            engine.status_changed(binding, status, error.as_ref())
        });
    }

    fn transferred(&self, connection: ConnectionId, error: Option<CnvError>) {
        self.dispatch(connection, "transfer", |engine, binding, _| {
            engine.data_transferred(binding, error.as_ref())
        });
    }
}

/// Property, declared type and access of each synthesized alarm binding. The
/// property doubles as the binding name suffix.
const ALARM_FIELDS: [(&str, DeclaredType, AccessMode); 6] = [
    ("Enable", DeclaredType::Boolean, AccessMode::READ.union(AccessMode::WRITE)),
    ("Set", DeclaredType::Boolean, AccessMode::READ),
    ("Ack", DeclaredType::Boolean, AccessMode::READ),
    ("AckType", DeclaredType::Int32, AccessMode::READ.union(AccessMode::WRITE)),
    ("level", DeclaredType::Float64, AccessMode::READ.union(AccessMode::WRITE)),
    ("deadband", DeclaredType::Float64, AccessMode::READ.union(AccessMode::WRITE)),
];

fn log_service_state(service: &dyn NetVarService) {
    match service.engine_is_running() {
        Ok(true) => debug!("Variable engine is running"),
        Ok(false) => warn!("Variable engine is not running"),
        Err(e) => warn!("Unable to query the variable engine: {e}"),
    }
    match service.processes() {
        Ok(processes) => {
            for process in processes {
                debug!(
                    "Process '{}' is {}",
                    process.name,
                    if process.running { "running" } else { "stopped" }
                );
            }
        }
        Err(e) => warn!("Unable to list variable engine processes: {e}"),
    }
}

/// Add bindings for the alarm properties of every variable that has them
fn discover_alarms(registry: &mut Registry, service: &dyn NetVarService) {
    let mut discovered = Vec::new();
    for binding in registry.iter() {
        if binding.field().is_some() {
            continue;
        }
        match service.path_exists(binding.path()) {
            Ok(true) => {}
            Ok(false) => {
                debug!("'{}' does not exist, not probing for alarms", binding.path());
                continue;
            }
            Err(e) => {
                warn!("Unable to check whether '{}' exists: {e}", binding.path());
                continue;
            }
        }
        for level in AlarmLevel::ALL {
            let enable = level.property_path(binding.path(), "Enable");
            if !service.path_exists(&enable).unwrap_or(false) {
                continue;
            }
            info!(
                "Found {} alarm for '{}' ({})",
                level.name(),
                binding.name(),
                binding.path()
            );
            discovered.push((binding.name().to_string(), binding.path().to_string(), level));
        }
    }

    for (owner, path, level) in discovered {
        for (property, declared_type, access) in ALARM_FIELDS {
            let name = format!("{owner}_{}_{property}", level.name());
            if registry.contains(&name) {
                debug!("'{name}' already configured, not synthesizing");
                continue;
            }
            registry.insert(VariableBinding::new(
                &name,
                &level.property_path(&path, property),
                declared_type,
                access,
                None,
                None,
            ));
        }
        if let Some(binding) = registry.get_mut(&owner) {
            binding.set_connected_alarm();
        }
    }
}

/// Discover alarms, create store parameters and open every connection.
///
/// Connection failures are logged and leave the affected binding without that
/// connection; this never fails as a whole.
pub fn connect_all<S: ParamStore>(
    mut registry: Registry,
    service: Arc<dyn NetVarService>,
    store: Arc<Mutex<S>>,
    timeouts: Timeouts,
) -> Arc<Engine<S>> {
    log_service_state(&*service);
    discover_alarms(&mut registry, &*service);
    {
        let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
        store.reserve(registry.len());
        registry.assign_parameter_ids(&mut *store);
    }
    let engine = Arc::new_cyclic(|weak| Engine {
        service,
        store,
        registry,
        router: Arc::new(CallbackRouter::new(weak.clone())),
        timeouts,
    });
    engine.open_connections();
    engine
}

impl<S: ParamStore> Engine<S> {
    fn open_connections(&self) {
        let sink: Arc<dyn CallbackSink> = self.router.clone();
        let timeouts = self.timeouts;
        for binding in self.registry.iter() {
            if binding.param_id().is_none() {
                continue;
            }
            let _span = debug_span!("connect", param = binding.name()).entered();
            let path = binding.path();
            let access = binding.access();

            if let Some(reader) = access.reader() {
                let opened = if reader == AccessMode::READ {
                    self.open(binding, "subscriber", |id| {
                        self.service
                            .create_subscriber(id, path, sink.clone(), timeouts.connect)
                    })
                    .map(|id| binding.state().handles.subscriber = Some(id))
                } else if reader == AccessMode::BUFFERED_READ {
                    self.open(binding, "buffered subscriber", |id| {
                        self.service.create_buffered_subscriber(
                            id,
                            path,
                            sink.clone(),
                            timeouts.client_buffer_items,
                            timeouts.connect,
                        )
                    })
                    .map(|id| binding.state().handles.buffered_subscriber = Some(id))
                } else {
                    self.open(binding, "reader", |id| {
                        self.service
                            .create_reader(id, path, Some(sink.clone()), timeouts.connect)
                    })
                    .map(|id| binding.state().handles.reader = Some(id))
                };
                if opened.is_none() {
                    continue;
                }
                if reader != AccessMode::SINGLE_READ {
                    self.initial_read(binding);
                }
            }

            if let Some(writer) = access.writer() {
                if writer == AccessMode::WRITE {
                    if let Some(id) = self.open(binding, "writer", |id| {
                        self.service
                            .create_writer(id, path, sink.clone(), timeouts.connect)
                    }) {
                        binding.state().handles.writer = Some(id);
                    }
                } else if let Some(id) = self.open(binding, "buffered writer", |id| {
                    self.service.create_buffered_writer(
                        id,
                        path,
                        sink.clone(),
                        timeouts.client_buffer_items,
                        timeouts.connect,
                    )
                }) {
                    binding.state().handles.buffered_writer = Some(id);
                }
            }
        }
        debug!("{} connections open", self.router.len());
    }

    /// Register an id for `binding` and create a connection with it
    fn open(
        &self,
        binding: &VariableBinding,
        kind: &str,
        create: impl FnOnce(ConnectionId) -> Result<(), CnvError>,
    ) -> Option<ConnectionId> {
        let id = self.router.register(binding);
        match create(id) {
            Ok(()) => {
                debug!("Opened {kind} {id} for '{}' ({})", binding.name(), binding.path());
                Some(id)
            }
            Err(e) => {
                self.router.unregister(id);
                error!(
                    "Unable to create {kind} for '{}' ({}): {e}",
                    binding.name(),
                    binding.path()
                );
                None
            }
        }
    }

    /// Read the current value once through a short-lived reader
    fn initial_read(&self, binding: &VariableBinding) {
        let id = self.router.next_connection_id();
        let result = self
            .service
            .create_reader(id, binding.path(), None, self.timeouts.connect)
            .and_then(|()| {
                let value = self.service.read(id, self.timeouts.initial_read);
                self.service.dispose(id);
                value
            });
        match result {
            Ok(Some(data)) => {
                if let Err(e) = self.on_data(binding, &data) {
                    error!(
                        "Unable to apply initial value of '{}' from '{}': {e}",
                        binding.name(),
                        binding.path()
                    );
                }
            }
            Ok(None) => trace!("No initial value for '{}'", binding.name()),
            Err(e) => {
                error!(
                    "Initial read of '{}' from '{}' failed: {e}",
                    binding.name(),
                    binding.path()
                );
                self.set_status(binding, ParamStatus::error());
            }
        }
    }
}
