//! The update engine: applies values from the service to the parameter store.
//!
//! Every value delivered for a binding, whether pushed by a subscription, drained
//! from a buffer by [`Engine::poll_once`] or fetched by [`Engine::read_on_demand`],
//! goes through [`Engine::on_data`]. The value is decoded once, its quality is
//! mirrored into the parameter status and alarm, and then it is converted into the
//! local representation of the binding's declared type and stored.
//!
//! The store lock is only ever held while the store is being touched. Service calls
//! are always made without it, since the service may deliver callbacks (which take the
//! lock) on the calling thread.
//!
//! Failures are isolated per binding: a value that cannot be decoded or converted is
//! reported and dropped, and the store entry is left as it was.

use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use thiserror::Error;
use tracing::{debug, debug_span, error, info, trace, warn};

use crate::{
    binding::{AccessMode, AlarmLevel, DeclaredType, Registry, VariableBinding},
    cnv::{
        BufferDataStatus, CnvArray, CnvData, CnvError, CnvScalar, ConnectionStatus,
        DataQuality, DecodeError, DecodedValue, WaitMode,
    },
    connection::CallbackRouter,
    convert::{ArrayKind, ConvertError, FromCnvScalar, LocalValue},
    services::NetVarService,
    store::{
        AlarmCondition, AlarmSeverity, AsynStatus, ParamError, ParamId, ParamKind, ParamStatus,
        ParamStore,
    },
    timestamp::{ServiceTimestamp, epics_seconds, format_report_time, format_timestamp},
    utils,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No param named '{0}'")]
    NoSuchBinding(String),
    #[error("Param '{0}' has no store parameter")]
    Unassigned(String),
    #[error("Param '{0}' is a structure field and cannot be written")]
    StructProjection(String),
    #[error("Param '{name}' has no writer for '{path}'")]
    NoWriter { name: String, path: String },
    #[error("Param '{name}' has no reader for '{path}'")]
    NoReader { name: String, path: String },
    #[error("Param '{name}' of type '{declared}' does not hold {requested} arrays")]
    WrongArrayKind {
        name: String,
        declared: DeclaredType,
        requested: ArrayKind,
    },
    #[error("Param '{name}' of type '{declared}' cannot be written as {requested:?}")]
    WrongKind {
        name: String,
        declared: DeclaredType,
        requested: ParamKind,
    },
    #[error("Driver has been stopped")]
    Stopped,
    #[error(transparent)]
    Service(#[from] CnvError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Limits on blocking service calls, and the size of client-side buffers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Creating subscribers, readers and writers
    pub connect: WaitMode,
    /// The first read after subscribing
    pub initial_read: WaitMode,
    /// On-demand reads of single-read bindings
    pub read: WaitMode,
    pub write: WaitMode,
    pub buffered_write: WaitMode,
    /// Capacity of buffered subscribers and writers
    pub client_buffer_items: usize,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: WaitMode::from_millis(utils::get_default_connect_timeout_ms() as i64),
            initial_read: WaitMode::from_millis(10),
            read: WaitMode::from_millis(10),
            write: WaitMode::from_millis(utils::get_default_write_timeout_ms() as i64),
            buffered_write: WaitMode::DoNotWait,
            client_buffer_items: utils::get_default_client_buffer_items(),
        }
    }
}

/// Links a registry of bindings to a service and a parameter store
pub struct Engine<S: ParamStore> {
    pub(crate) service: Arc<dyn NetVarService>,
    pub(crate) store: Arc<Mutex<S>>,
    pub(crate) registry: Registry,
    pub(crate) router: Arc<CallbackRouter<S>>,
    pub(crate) timeouts: Timeouts,
}

impl<S: ParamStore> Engine<S> {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<Mutex<S>> {
        &self.store
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub(crate) fn lock_store(&self) -> MutexGuard<'_, S> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a binding that has a store parameter
    pub fn binding(&self, name: &str) -> Result<(&VariableBinding, ParamId), EngineError> {
        let binding = self
            .registry
            .get(name)
            .ok_or_else(|| EngineError::NoSuchBinding(name.to_string()))?;
        let id = binding
            .param_id()
            .ok_or_else(|| EngineError::Unassigned(name.to_string()))?;
        Ok((binding, id))
    }

    /// Apply a value received for `binding`
    pub fn on_data(&self, binding: &VariableBinding, data: &CnvData) -> Result<(), EngineError> {
        let _span = debug_span!("update", param = binding.name()).entered();
        self.update(binding, data, None).map(|_| ())
    }

    /// Apply `data`, returning the time it was stored with
    fn update(
        &self,
        binding: &VariableBinding,
        data: &CnvData,
        timestamp: Option<SystemTime>,
    ) -> Result<SystemTime, EngineError> {
        let id = binding
            .param_id()
            .ok_or_else(|| EngineError::Unassigned(binding.name().to_string()))?;
        let timestamp = timestamp.unwrap_or_else(|| self.resolve_timestamp(binding, data));
        let decoded = data.decode()?;
        if let DecodedValue::Struct(fields) = decoded {
            return self.update_struct(binding, fields, timestamp);
        }

        self.apply_quality(binding, id, data.quality)?;
        let stored = match decoded {
            DecodedValue::Scalar(value) => self.apply_scalar(binding, id, &value, timestamp)?,
            DecodedValue::Array { values, .. } => self.apply_array(binding, id, values, timestamp)?,
            DecodedValue::Empty | DecodedValue::Struct(_) => {
                trace!("Empty value for '{}'", binding.name());
                timestamp
            }
        };
        if data.server_error != 0 {
            warn!(
                "Server error {:#x} reported for '{}' ({})",
                data.server_error,
                binding.name(),
                binding.path()
            );
        }
        Ok(stored)
    }

    /// Time for an update: the `ts_param` binding's last update, else the time the
    /// service attached, else now
    fn resolve_timestamp(&self, binding: &VariableBinding, data: &CnvData) -> SystemTime {
        binding
            .ts_param()
            .and_then(|name| self.registry.get(name))
            .and_then(VariableBinding::last_update)
            .or(data.timestamp)
            .unwrap_or_else(SystemTime::now)
    }

    fn update_struct(
        &self,
        binding: &VariableBinding,
        fields: &[CnvData],
        timestamp: SystemTime,
    ) -> Result<SystemTime, EngineError> {
        match binding.field() {
            Some(index) if index < fields.len() => {}
            index => {
                return Err(DecodeError::FieldIndex {
                    index,
                    count: fields.len(),
                }
                .into());
            }
        }
        let (stamps, values): (Vec<&VariableBinding>, Vec<&VariableBinding>) = self
            .registry
            .bindings_for_path(binding.path())
            .filter(|b| b.field().is_some())
            .partition(|b| b.declared_type().is_timestamp());

        let mut shared = timestamp;
        for sibling in stamps {
            if let Some(t) = self.update_field(sibling, fields, None) {
                shared = t;
            }
        }
        for sibling in values {
            self.update_field(sibling, fields, Some(shared));
        }
        Ok(shared)
    }

    fn update_field(
        &self,
        binding: &VariableBinding,
        fields: &[CnvData],
        timestamp: Option<SystemTime>,
    ) -> Option<SystemTime> {
        let result = match binding.field().and_then(|i| fields.get(i)) {
            None => Err(DecodeError::FieldIndex {
                index: binding.field(),
                count: fields.len(),
            }
            .into()),
            Some(field) if field.is_struct() => Err(DecodeError::NestedStruct.into()),
            Some(field) => self.update(binding, field, timestamp),
        };
        match result {
            Ok(t) => Some(t),
            Err(e) => {
                error!(
                    "Unable to update '{}' from field {:?} of '{}': {e}",
                    binding.name(),
                    binding.field(),
                    binding.path()
                );
                None
            }
        }
    }

    /// Mirror the service's view of the value into the parameter status
    fn apply_quality(
        &self,
        binding: &VariableBinding,
        id: ParamId,
        quality: DataQuality,
    ) -> Result<(), EngineError> {
        let mut store = self.lock_store();
        let previous = store.param_status(id)?;
        if quality.is_good() && previous.status != AsynStatus::Success {
            info!("Data quality of '{}' is good again", binding.name());
            store.set_param_status(id, ParamStatus::success())?;
        }
        if !quality.is_good() {
            warn!(
                "Data quality of '{}' is not good: {}",
                binding.name(),
                quality.description()
            );
            store.set_param_status(id, ParamStatus::error())?;
        } else if quality.is_limited() {
            if previous.is_default() {
                warn!(
                    "Data quality of '{}' is limited: {}",
                    binding.name(),
                    quality.description()
                );
                store.set_param_status(
                    id,
                    ParamStatus::alarmed(AlarmCondition::HwLimit, AlarmSeverity::Minor),
                )?;
            }
        } else if quality.contains(DataQuality::IN_ALARM) {
            if !binding.has_connected_alarm() && previous.is_default() {
                warn!("'{}' is in alarm", binding.name());
                store.set_param_status(
                    id,
                    ParamStatus::alarmed(AlarmCondition::HwLimit, AlarmSeverity::Minor),
                )?;
            }
        } else if previous.status == AsynStatus::Success && previous.alarm == AlarmCondition::HwLimit
        {
            info!("Clearing limit alarm on '{}'", binding.name());
            store.set_param_status(id, ParamStatus::success())?;
        }
        Ok(())
    }

    fn apply_scalar(
        &self,
        binding: &VariableBinding,
        id: ParamId,
        value: &CnvScalar,
        timestamp: SystemTime,
    ) -> Result<SystemTime, EngineError> {
        let local = match binding.declared_type() {
            DeclaredType::Float64 | DeclaredType::FTimestamp => {
                LocalValue::Float64(f64::from_cnv(value)?)
            }
            DeclaredType::Int32 | DeclaredType::Boolean => LocalValue::Int32(i32::from_cnv(value)?),
            DeclaredType::String | DeclaredType::Timestamp => {
                LocalValue::String(String::from_cnv(value)?)
            }
            other => {
                return Err(ConvertError::UnsupportedType {
                    declared: other.to_string(),
                    value: format!("scalar {}", value.data_type()),
                }
                .into());
            }
        };
        self.store_value(binding, id, &local, timestamp)?;
        Ok(timestamp)
    }

    fn apply_array(
        &self,
        binding: &VariableBinding,
        id: ParamId,
        values: CnvArray,
        timestamp: SystemTime,
    ) -> Result<SystemTime, EngineError> {
        if values.is_empty() {
            debug!("Ignoring empty array for '{}'", binding.name());
            return Ok(timestamp);
        }
        let declared = binding.declared_type();
        if declared.is_timestamp() {
            let pair = values.as_timestamp_pair()?;
            let out_of_range = || ConvertError::TimestampRange(pair[0]);
            let time = ServiceTimestamp::from_pair(pair)
                .to_system_time()
                .ok_or_else(out_of_range)?;
            let local = match declared {
                DeclaredType::Timestamp => {
                    LocalValue::String(format_timestamp(time).ok_or_else(out_of_range)?)
                }
                _ => LocalValue::Float64(epics_seconds(time)),
            };
            self.store_value(binding, id, &local, time)?;
            return Ok(time);
        }
        let kind = declared
            .array_kind()
            .ok_or_else(|| ConvertError::UnsupportedType {
                declared: declared.to_string(),
                value: format!("{} array", values.data_type()),
            })?;
        let local = values.into_local(kind)?;
        self.store_value(binding, id, &LocalValue::Array(local), timestamp)?;
        Ok(timestamp)
    }

    /// Store a converted value and notify consumers
    fn store_value(
        &self,
        binding: &VariableBinding,
        id: ParamId,
        value: &LocalValue,
        timestamp: SystemTime,
    ) -> Result<(), EngineError> {
        let mut store = self.lock_store();
        store.set_timestamp(timestamp);
        binding.state().last_update = Some(timestamp);
        match value {
            LocalValue::Float64(v) => store.set_double(id, *v)?,
            LocalValue::Int32(v) => {
                store.set_integer(id, *v)?;
                self.propagate_alarm(&mut *store, binding, *v);
            }
            LocalValue::String(v) => store.set_string(id, v)?,
            LocalValue::Array(v) => {
                binding.state().cached_array = v.to_ne_bytes();
                store.array_changed(id, v)?;
            }
        }
        trace!("'{}' = {value}", binding.name());
        store.call_param_callbacks();
        Ok(())
    }

    /// Store a value written by a consumer, without touching its timestamp
    pub(crate) fn write_through(
        &self,
        binding: &VariableBinding,
        id: ParamId,
        value: &LocalValue,
    ) -> Result<(), EngineError> {
        let mut store = self.lock_store();
        match value {
            LocalValue::Float64(v) => store.set_double(id, *v)?,
            LocalValue::Int32(v) => store.set_integer(id, *v)?,
            LocalValue::String(v) => store.set_string(id, v)?,
            LocalValue::Array(v) => {
                binding.state().cached_array = v.to_ne_bytes();
                store.array_changed(id, v)?;
            }
        }
        store.call_param_callbacks();
        Ok(())
    }

    /// A `<base>_<level>_Set` binding changed: raise or clear the alarm on `<base>`
    fn propagate_alarm(&self, store: &mut S, binding: &VariableBinding, value: i32) {
        for level in AlarmLevel::ALL {
            let Some(base) = binding.name().strip_suffix(level.set_suffix().as_str()) else {
                continue;
            };
            let Some(base_id) = self.registry.get(base).and_then(VariableBinding::param_id) else {
                continue;
            };
            let Ok(current) = store.param_status(base_id) else {
                continue;
            };
            if current.status != AsynStatus::Success {
                continue;
            }
            let result = if value != 0 {
                info!("{} alarm raised on '{base}'", level.name());
                store.set_param_status(
                    base_id,
                    ParamStatus::alarmed(level.condition(), level.severity()),
                )
            } else if current.alarm == level.condition() {
                info!("{} alarm cleared on '{base}'", level.name());
                store.set_param_status(base_id, ParamStatus::success())
            } else {
                Ok(())
            };
            if let Err(e) = result {
                error!("Unable to set alarm on '{base}': {e}");
            }
        }
    }

    /// Set the status of a binding's parameter and notify consumers
    pub(crate) fn set_status(&self, binding: &VariableBinding, status: ParamStatus) {
        let Some(id) = binding.param_id() else {
            return;
        };
        let mut store = self.lock_store();
        match store.set_param_status(id, status) {
            Ok(()) => store.call_param_callbacks(),
            Err(e) => error!("Unable to set status of '{}': {e}", binding.name()),
        }
    }

    /// The connection state of one of the binding's handles changed
    pub fn status_changed(
        &self,
        binding: &VariableBinding,
        status: ConnectionStatus,
        error: Option<&CnvError>,
    ) {
        let Some(id) = binding.param_id() else {
            return;
        };
        let new_status = if let Some(e) = error {
            warn!("Connection error for '{}' ({}): {e}", binding.name(), binding.path());
            Some(ParamStatus::error())
        } else if status != ConnectionStatus::Connected {
            warn!("'{}' ({}) is {status}", binding.name(), binding.path());
            Some(ParamStatus::disconnected())
        } else {
            None
        };
        let mut store = self.lock_store();
        let result = match new_status {
            Some(s) => store.set_param_status(id, s),
            None => match store.param_status(id) {
                Ok(current) if current.status != AsynStatus::Success => {
                    info!("'{}' ({}) is connected", binding.name(), binding.path());
                    store.set_param_status(id, ParamStatus::success())
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            },
        };
        match result {
            Ok(()) => store.call_param_callbacks(),
            Err(e) => error!("Unable to set status of '{}': {e}", binding.name()),
        }
    }

    /// A buffered write of the binding completed
    pub fn data_transferred(&self, binding: &VariableBinding, error: Option<&CnvError>) {
        match error {
            None => {
                trace!("Buffered write of '{}' complete", binding.name());
                let Some(id) = binding.param_id() else {
                    return;
                };
                let mut store = self.lock_store();
                if store
                    .param_status(id)
                    .is_ok_and(|status| status.status == AsynStatus::Error)
                {
                    info!("Buffered writes of '{}' are succeeding again", binding.name());
                    match store.set_param_status(id, ParamStatus::success()) {
                        Ok(()) => store.call_param_callbacks(),
                        Err(e) => error!("Unable to set status of '{}': {e}", binding.name()),
                    }
                }
            }
            Some(e) => {
                error!(
                    "Buffered write of '{}' to '{}' failed: {e}",
                    binding.name(),
                    binding.path()
                );
                self.set_status(binding, ParamStatus::error());
            }
        }
    }

    /// Drain at most one item from the buffer of every buffered-read binding
    pub fn poll_once(&self) {
        for binding in self.registry.iter() {
            if binding.access().reader() != Some(AccessMode::BUFFERED_READ) {
                continue;
            }
            let Some(connection) = binding.handles().buffered_subscriber else {
                continue;
            };
            let (status, data) = match self.service.get_data_from_buffer(connection) {
                Ok(item) => item,
                Err(e) => {
                    error!("Unable to read buffer of '{}': {e}", binding.name());
                    self.set_status(binding, ParamStatus::error());
                    continue;
                }
            };
            if status == BufferDataStatus::DataWasLost {
                warn!(
                    "Data was lost for '{}' ({}), is the poll interval too long?",
                    binding.name(),
                    binding.path()
                );
            }
            if status == BufferDataStatus::StaleData {
                continue;
            }
            if let Some(data) = data
                && let Err(e) = self.on_data(binding, &data)
            {
                error!(
                    "Unable to update '{}' from '{}': {e}",
                    binding.name(),
                    binding.path()
                );
            }
        }
    }

    /// For single-read bindings, fetch the current value from the service
    pub fn read_on_demand(&self, binding: &VariableBinding) -> Result<(), EngineError> {
        if binding.access().reader() != Some(AccessMode::SINGLE_READ) {
            return Ok(());
        }
        let connection = binding.handles().reader.ok_or_else(|| EngineError::NoReader {
            name: binding.name().to_string(),
            path: binding.path().to_string(),
        })?;
        let value = self.service.read(connection, self.timeouts.read)?;
        match value {
            Some(data) => self.on_data(binding, &data)?,
            None => trace!("No new value for '{}'", binding.name()),
        }
        if let Some(t) = binding.last_update() {
            self.lock_store().set_timestamp(t);
        }
        Ok(())
    }

    /// Send a value to the binding's writer
    pub fn write(&self, binding: &VariableBinding, data: &CnvData) -> Result<(), EngineError> {
        if binding.field().is_some() {
            return Err(EngineError::StructProjection(binding.name().to_string()));
        }
        let no_writer = || EngineError::NoWriter {
            name: binding.name().to_string(),
            path: binding.path().to_string(),
        };
        let handles = binding.handles();
        match binding.access().writer() {
            Some(AccessMode::WRITE) => {
                let connection = handles.writer.ok_or_else(no_writer)?;
                self.service.write(connection, data, self.timeouts.write)?;
            }
            Some(AccessMode::BUFFERED_WRITE) => {
                let connection = handles.buffered_writer.ok_or_else(no_writer)?;
                self.service
                    .put_data_in_buffer(connection, data, self.timeouts.buffered_write)?;
            }
            _ => return Err(no_writer()),
        }
        debug!("Wrote '{}' to '{}'", binding.name(), binding.path());
        Ok(())
    }

    /// Describe every binding and its connections
    pub fn report(&self, out: &mut dyn io::Write) -> io::Result<()> {
        for binding in self.registry.iter() {
            writeln!(
                out,
                "  \"{}\" type={} access={} path=\"{}\"",
                binding.name(),
                binding.declared_type(),
                binding.access(),
                binding.path()
            )?;
            writeln!(
                out,
                "    field={} ts_param={} array bytes={} last update={}",
                binding.field().map_or("-".to_string(), |f| f.to_string()),
                binding.ts_param().unwrap_or("-"),
                binding.cached_array_bytes(),
                format_report_time(binding.last_update())
            )?;
            let handles = binding.handles();
            let labelled = [
                ("subscriber", handles.subscriber),
                ("buffered subscriber", handles.buffered_subscriber),
                ("reader", handles.reader),
                ("writer", handles.writer),
                ("buffered writer", handles.buffered_writer),
            ];
            for (label, connection) in labelled {
                let Some(connection) = connection else {
                    continue;
                };
                match self.service.connection_info(connection) {
                    Ok(info) => {
                        write!(out, "    {label} {connection}: {}", info.status)?;
                        if let Some(e) = info.error {
                            write!(out, " error=\"{e}\"")?;
                        }
                        if let Some((items, max_items)) = info.buffer {
                            write!(out, " buffer={items}/{max_items}")?;
                        }
                        writeln!(out)?;
                    }
                    Err(e) => writeln!(out, "    {label} {connection}: <status unavailable: {e}>")?,
                }
            }
        }
        Ok(())
    }

    /// Close every connection. Callbacks arriving afterwards are ignored.
    pub(crate) fn close_connections(&self) {
        for binding in self.registry.iter() {
            let handles = std::mem::take(&mut binding.state().handles);
            for connection in handles.all() {
                self.router.unregister(connection);
                self.service.dispose(connection);
            }
        }
        debug!("Closed all connections");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{MacroEnvironment, NetVarConfig},
        connection::connect_all,
        services::LoopbackService,
        store::{ParamTable, ParamValue},
    };
    use std::time::{Duration, UNIX_EPOCH};
    use tracing_test::traced_test;

    struct Fixture {
        engine: Arc<Engine<ParamTable>>,
        service: Arc<LoopbackService>,
        store: Arc<Mutex<ParamTable>>,
    }

    impl Fixture {
        fn new(params: &str, setup: impl FnOnce(&LoopbackService)) -> Self {
            let document = format!("<netvar><section name=\"s\">{params}</section></netvar>");
            let config =
                NetVarConfig::from_document(&document, "inline.xml", MacroEnvironment::default())
                    .unwrap();
            let service = Arc::new(LoopbackService::new());
            setup(&service);
            let store = Arc::new(Mutex::new(ParamTable::new()));
            let engine = connect_all(
                config.bindings("s"),
                service.clone(),
                store.clone(),
                Timeouts::default(),
            );
            Fixture {
                engine,
                service,
                store,
            }
        }

        fn id(&self, name: &str) -> ParamId {
            self.engine.binding(name).unwrap().1
        }

        fn value(&self, name: &str) -> ParamValue {
            let id = self.id(name);
            self.store.lock().unwrap().value(id).unwrap().clone()
        }

        fn status(&self, name: &str) -> ParamStatus {
            let id = self.id(name);
            self.store.lock().unwrap().param_status(id).unwrap()
        }
    }

    /// Service encoding of `secs` seconds after 1990-01-01
    fn service_time(secs: u64) -> CnvData {
        CnvData::array(&[2_713_996_800u64 + secs, 0])
    }

    #[test]
    fn struct_timestamp_applies_first() {
        let f = Fixture::new(
            r#"<param name="ts" type="ftimestamp" access="R" netvar="\\h\rec" field="0"/>
               <param name="volts" type="float64" access="R" netvar="\\h\rec" field="1" ts_param="ts"/>"#,
            |s| s.define(r"\\h\rec"),
        );
        let now_ish = SystemTime::now();
        f.service.publish(
            r"\\h\rec",
            CnvData::structure(vec![service_time(1000), CnvData::scalar(2.5f64)]),
        );
        assert_eq!(f.value("ts"), ParamValue::Float64(1000.0));
        assert_eq!(f.value("volts"), ParamValue::Float64(2.5));
        let volts = f.engine.registry().get("volts").unwrap();
        let ts = f.engine.registry().get("ts").unwrap();
        assert_eq!(volts.last_update(), ts.last_update());
        let stamped = volts.last_update().unwrap();
        assert!(stamped < now_ish);
        assert_eq!(epics_seconds(stamped), 1000.0);
    }

    #[test]
    fn struct_field_out_of_range_is_isolated() {
        let f = Fixture::new(
            r#"<param name="a" type="float64" access="R" netvar="\\h\rec" field="0"/>
               <param name="b" type="float64" access="R" netvar="\\h\rec" field="5"/>"#,
            |s| s.define(r"\\h\rec"),
        );
        let data = CnvData::structure(vec![CnvData::scalar(1.0f64)]);
        let a = f.engine.registry().get("a").unwrap();
        let b = f.engine.registry().get("b").unwrap();
        assert!(f.engine.on_data(a, &data).is_ok());
        assert!(matches!(
            f.engine.on_data(b, &data),
            Err(EngineError::Decode(DecodeError::FieldIndex { .. }))
        ));
        assert_eq!(f.value("a"), ParamValue::Float64(1.0));
        assert_eq!(f.value("b"), ParamValue::Undefined);
    }

    #[test]
    fn alarm_set_raises_and_clears_base_alarm() {
        let f = Fixture::new(
            r#"<param name="P" type="int32" access="R" netvar="\\h\p"/>"#,
            |s| {
                s.define(r"\\h\p");
                for property in ["Enable", "Set", "Ack", "AckType", "level", "deadband"] {
                    s.define(&AlarmLevel::Hi.property_path(r"\\h\p", property));
                }
            },
        );
        let registry = f.engine.registry();
        assert!(registry.get("P").unwrap().has_connected_alarm());
        for suffix in ["Enable", "Set", "Ack", "AckType", "level", "deadband"] {
            assert!(registry.contains(&format!("P_Hi_{suffix}")), "{suffix}");
        }
        assert!(!registry.contains("P_HiHi_Set"));
        assert!(f.status("P").is_default());

        f.service
            .publish(r"\\h\p\Alarms\Hi\Set", CnvData::scalar(true));
        assert_eq!(
            f.status("P"),
            ParamStatus::alarmed(AlarmCondition::High, AlarmSeverity::Minor)
        );
        assert_eq!(f.value("P_Hi_Set"), ParamValue::Int32(1));

        f.service
            .publish(r"\\h\p\Alarms\Hi\Set", CnvData::scalar(false));
        assert!(f.status("P").is_default());
    }

    #[test]
    fn quality_drives_status() {
        let f = Fixture::new(
            r#"<param name="v" type="float64" access="R" netvar="\\h\v"/>"#,
            |s| s.define(r"\\h\v"),
        );
        f.service.publish(
            r"\\h\v",
            CnvData::scalar(1.0f64).with_quality(DataQuality::COMM_FAILURE),
        );
        assert_eq!(f.status("v").status, AsynStatus::Error);

        // Recovery and limit in one update: only the recovery applies
        f.service.publish(
            r"\\h\v",
            CnvData::scalar(2.0f64).with_quality(DataQuality::HIGH_LIMITED),
        );
        assert!(f.status("v").is_default());

        f.service.publish(
            r"\\h\v",
            CnvData::scalar(3.0f64).with_quality(DataQuality::HIGH_LIMITED),
        );
        assert_eq!(
            f.status("v"),
            ParamStatus::alarmed(AlarmCondition::HwLimit, AlarmSeverity::Minor)
        );

        f.service.publish(r"\\h\v", CnvData::scalar(4.0f64));
        assert!(f.status("v").is_default());
        assert_eq!(f.value("v"), ParamValue::Float64(4.0));
    }

    #[test]
    fn in_alarm_without_connected_alarm() {
        let f = Fixture::new(
            r#"<param name="v" type="int32" access="R" netvar="\\h\v"/>"#,
            |s| s.define(r"\\h\v"),
        );
        f.service.publish(
            r"\\h\v",
            CnvData::scalar(1i32).with_quality(DataQuality::IN_ALARM),
        );
        assert_eq!(f.status("v").alarm, AlarmCondition::HwLimit);
    }

    #[test]
    fn incompatible_array_leaves_store_untouched() {
        let f = Fixture::new(
            r#"<param name="arr" type="float64array" access="R" netvar="\\h\arr"/>"#,
            |s| s.define(r"\\h\arr"),
        );
        let arr = f.engine.registry().get("arr").unwrap();
        f.service.publish(r"\\h\arr", CnvData::array(&[1.0f64, 2.0]));
        assert_eq!(arr.cached_array_bytes(), 16);

        let result = f.engine.on_data(arr, &CnvData::array(&[1.0f32, 2.0, 3.0]));
        assert!(matches!(
            result,
            Err(EngineError::Convert(ConvertError::ArrayTypeMismatch { .. }))
        ));
        assert_eq!(arr.cached_array_bytes(), 16);
        assert_eq!(
            f.value("arr"),
            ParamValue::Array(crate::convert::LocalArray::Float64(vec![1.0, 2.0]))
        );
    }

    #[test]
    fn unsigned_arrays_reinterpret() {
        let f = Fixture::new(
            r#"<param name="arr" type="int16array" access="R" netvar="\\h\arr"/>"#,
            |s| s.define(r"\\h\arr"),
        );
        f.service.publish(r"\\h\arr", CnvData::array(&[0xFFFFu16, 2]));
        assert_eq!(
            f.value("arr"),
            ParamValue::Array(crate::convert::LocalArray::Int16(vec![-1, 2]))
        );
    }

    #[test]
    fn timestamp_text_and_explicit_times() {
        let f = Fixture::new(
            r#"<param name="t" type="timestamp" access="R" netvar="\\h\t"/>
               <param name="v" type="int32" access="R" netvar="\\h\v"/>"#,
            |s| {
                s.define(r"\\h\t");
                s.define(r"\\h\v");
            },
        );
        // 2000-01-01T00:00:00Z
        f.service
            .publish(r"\\h\t", CnvData::array(&[3_029_529_600u64, 0]));
        assert_eq!(
            f.value("t"),
            ParamValue::Octet("2000-01-01T00:00:00.000000".into())
        );
        let stamp = UNIX_EPOCH + Duration::from_secs(12345);
        f.service
            .publish(r"\\h\v", CnvData::scalar(7i32).with_timestamp(stamp));
        let v = f.engine.registry().get("v").unwrap();
        assert_eq!(v.last_update(), Some(stamp));
        assert_eq!(f.store.lock().unwrap().timestamp(), stamp);
    }

    #[test]
    fn string_to_number_is_rejected() {
        let f = Fixture::new(
            r#"<param name="v" type="float64" access="R" netvar="\\h\v"/>"#,
            |s| s.define(r"\\h\v"),
        );
        let v = f.engine.registry().get("v").unwrap();
        let result = f.engine.on_data(v, &CnvData::string("1.5"));
        assert!(matches!(
            result,
            Err(EngineError::Convert(ConvertError::StringToNumber))
        ));
        assert_eq!(f.value("v"), ParamValue::Undefined);
    }

    #[test]
    fn status_changes_mirror_into_params() {
        let f = Fixture::new(
            r#"<param name="v" type="float64" access="R" netvar="\\h\v"/>"#,
            |s| s.define(r"\\h\v"),
        );
        f.service
            .set_connection_status(r"\\h\v", ConnectionStatus::Disconnected, None);
        assert_eq!(f.status("v").status, AsynStatus::Disconnected);
        f.service
            .set_connection_status(r"\\h\v", ConnectionStatus::Connected, None);
        assert!(f.status("v").is_default());
        f.service.set_connection_status(
            r"\\h\v",
            ConnectionStatus::Connected,
            Some(CnvError::new("test", -1, "injected")),
        );
        assert_eq!(f.status("v").status, AsynStatus::Error);
    }

    #[test]
    #[traced_test]
    fn failed_buffered_transfer_marks_error_until_success() {
        let f = Fixture::new(
            r#"<param name="bw" type="int32" access="BW" netvar="\\h\bw"/>"#,
            |s| s.define(r"\\h\bw"),
        );
        let (binding, _) = f.engine.binding("bw").unwrap();
        f.service.set_transfer_error(
            r"\\h\bw",
            Some(CnvError::new("CNVPutDataInBuffer", -1, "queue full")),
        );
        f.engine.write(binding, &CnvData::scalar(1i32)).unwrap();
        assert_eq!(f.status("bw").status, AsynStatus::Error);
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|l| l.contains("Buffered write of 'bw'") && l.contains("queue full"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("Expected one transfer failure, saw {n}")),
            }
        });

        f.service.set_transfer_error(r"\\h\bw", None);
        f.engine.write(binding, &CnvData::scalar(2i32)).unwrap();
        assert!(f.status("bw").is_default());
        assert_eq!(f.service.writes(r"\\h\bw").len(), 2);
    }

    #[test]
    #[traced_test]
    fn lost_buffered_data_is_applied_and_warned_once() {
        let f = Fixture::new(
            r#"<param name="q" type="int32" access="BR" netvar="\\h\q"/>"#,
            |s| s.define(r"\\h\q"),
        );
        let capacity = f.engine.timeouts().client_buffer_items;
        for i in 0..=capacity as i32 {
            f.service.publish(r"\\h\q", CnvData::scalar(i));
        }
        f.engine.poll_once();
        assert_eq!(f.value("q"), ParamValue::Int32(1));
        f.engine.poll_once();
        assert_eq!(f.value("q"), ParamValue::Int32(2));
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|l| l.contains("Data was lost for 'q'"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("Expected one data loss warning, saw {n}")),
            }
        });
    }
}
