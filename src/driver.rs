//! The driver facade: start-up, on-demand reads and writes by parameter name, and
//! shutdown.
//!
//! A [`DriverBuilder`] loads the configuration, connects every binding and starts the
//! poll task that drains buffered subscriptions. The resulting [`DriverHandle`] is
//! what a parameter-store consumer talks to.
//!
//! ```no_run
//! # use std::sync::{Arc, Mutex};
//! # use std::time::Duration;
//! use netshrvar::{DriverBuilder, services::LoopbackService, store::ParamTable};
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = Arc::new(LoopbackService::new());
//!     let store = Arc::new(Mutex::new(ParamTable::new()));
//!     let mut driver = DriverBuilder::new("${TOP}/netvar.xml", "main")
//!         .poll_interval(Duration::from_millis(50))
//!         .start(service, store)
//!         .await
//!         .unwrap();
//!     driver.write_f64("setpoint", 2.5).unwrap();
//!     driver.stop().await;
//! }
//! ```

use std::{
    fmt, io,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use bitflags::bitflags;
use thiserror::Error;
use tokio::{
    select,
    task::{JoinError, JoinHandle},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    binding::VariableBinding,
    config::{ConfigError, MacroEnvironment, NetVarConfig},
    connection::connect_all,
    convert::{ArrayElement, ArrayKind, LocalValue, copy_cached},
    engine::{Engine, EngineError, Timeouts},
    services::NetVarService,
    store::{ParamError, ParamId, ParamKind, ParamStore},
};

/// A failed read or write, in the form reported back to the consumer
#[derive(Error, Debug)]
#[error("{function}: name={name}, value={value}, error={source}")]
pub struct DriverError {
    pub function: &'static str,
    pub name: String,
    pub value: String,
    #[source]
    pub source: EngineError,
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Connecting the bindings failed: {0}")]
    Join(#[from] JoinError),
}

bitflags! {
    /// Why a string read ended
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EomReason: u8 {
        /// The value did not fit and was truncated
        const COUNT = 0x01;
        const EOS = 0x02;
        const END = 0x04;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringRead {
    pub value: String,
    pub eom: EomReason,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayRead {
    /// Number of elements copied into the caller's buffer
    pub n_in: usize,
    pub timestamp: SystemTime,
}

enum ConfigSource {
    File(String),
    Document(String),
}

pub struct DriverBuilder {
    source: ConfigSource,
    section: String,
    env: Option<MacroEnvironment>,
    poll_interval: Duration,
    options: u32,
    timeouts: Timeouts,
    stop_token: CancellationToken,
}

impl DriverBuilder {
    /// Load bindings from `section` of `config_file`. The file name may contain
    /// environment macros.
    pub fn new(config_file: &str, section: &str) -> Self {
        Self::with_source(ConfigSource::File(config_file.to_string()), section)
    }

    /// Load bindings from an in-memory configuration document
    pub fn from_document(document: &str, section: &str) -> Self {
        Self::with_source(ConfigSource::Document(document.to_string()), section)
    }

    fn with_source(source: ConfigSource, section: &str) -> Self {
        DriverBuilder {
            source,
            section: section.to_string(),
            env: None,
            poll_interval: Duration::from_millis(100),
            options: 0,
            timeouts: Timeouts::default(),
            stop_token: CancellationToken::new(),
        }
    }

    /// Expand macros against `env` instead of a snapshot of the process environment
    pub fn environment(mut self, env: MacroEnvironment) -> Self {
        self.env = Some(env);
        self
    }
    /// How often buffered subscriptions are drained. Zero disables polling.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
    pub fn options(mut self, options: u32) -> Self {
        self.options = options;
        self
    }
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
    /// Stop the driver when `token` is cancelled
    pub fn stop_token(mut self, token: CancellationToken) -> Self {
        self.stop_token = token.child_token();
        self
    }

    pub async fn start<S: ParamStore>(
        self,
        service: Arc<dyn NetVarService>,
        store: Arc<Mutex<S>>,
    ) -> Result<DriverHandle<S>, StartError> {
        let env = self.env.unwrap_or_else(MacroEnvironment::snapshot);
        let (config_file, config) = match self.source {
            ConfigSource::File(file) => {
                let config = NetVarConfig::load_with_env(&file, env)?;
                (file, config)
            }
            ConfigSource::Document(document) => {
                let config = NetVarConfig::from_document(&document, "<inline>", env)?;
                ("<inline>".to_string(), config)
            }
        };
        let lifecycle = ServiceLifecycle::new(service.clone(), self.stop_token.clone());
        let section = self.section;
        info!(
            "Starting driver for section '{section}' of '{}' with {} params",
            config.path().display(),
            config.count_params(&section)
        );
        let registry = config.bindings(&section);
        let timeouts = self.timeouts;
        let engine = tokio::task::spawn_blocking(move || {
            connect_all(registry, service, store, timeouts)
        })
        .await?;
        let poll_task = spawn_poll_task(engine.clone(), self.poll_interval, self.stop_token);

        Ok(DriverHandle {
            engine: Some(engine),
            lifecycle,
            poll_task,
            config_file,
            expanded_path: config.path().to_path_buf(),
            section,
            options: self.options,
            poll_interval: self.poll_interval,
        })
    }
}

fn spawn_poll_task<S: ParamStore>(
    engine: Arc<Engine<S>>,
    interval: Duration,
    stop: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        warn!("Poll interval is zero: buffered reads will never be processed");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let engine = engine.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || engine.poll_once()).await {
                        error!("Polling buffered reads failed: {e}");
                    }
                }
            }
        }
        debug!("Poll task stopped");
    }))
}

/// Finalizes the service exactly once, on shutdown or drop
pub struct ServiceLifecycle {
    service: Arc<dyn NetVarService>,
    stop: CancellationToken,
    finished: AtomicBool,
}

impl ServiceLifecycle {
    pub fn new(service: Arc<dyn NetVarService>, stop: CancellationToken) -> Self {
        ServiceLifecycle {
            service,
            stop,
            finished: AtomicBool::new(false),
        }
    }

    pub fn shutdown(&self) {
        self.stop.cancel();
        if !self.finished.swap(true, Ordering::SeqCst) {
            info!("Finalizing network variable service");
            self.service.finish();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Drop for ServiceLifecycle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A running driver
pub struct DriverHandle<S: ParamStore> {
    engine: Option<Arc<Engine<S>>>,
    lifecycle: ServiceLifecycle,
    poll_task: Option<JoinHandle<()>>,
    config_file: String,
    expanded_path: PathBuf,
    section: String,
    options: u32,
    poll_interval: Duration,
}

impl<S: ParamStore> DriverHandle<S> {
    /// The engine, until the driver is stopped
    pub fn engine(&self) -> Option<&Arc<Engine<S>>> {
        self.engine.as_ref()
    }

    fn running(&self) -> Result<&Arc<Engine<S>>, EngineError> {
        self.engine.as_ref().ok_or(EngineError::Stopped)
    }

    pub fn is_stopped(&self) -> bool {
        self.lifecycle.is_shut_down()
    }

    pub fn write_f64(&self, name: &str, value: f64) -> Result<(), DriverError> {
        self.write_value("writeFloat64", name, LocalValue::Float64(value))
    }

    pub fn write_i32(&self, name: &str, value: i32) -> Result<(), DriverError> {
        self.write_value("writeInt32", name, LocalValue::Int32(value))
    }

    /// Write a string, returning the number of bytes written
    pub fn write_string(&self, name: &str, value: &str) -> Result<usize, DriverError> {
        self.write_value("writeOctet", name, LocalValue::String(value.to_string()))
            .map(|()| value.len())
    }

    pub fn write_array<T: ArrayElement>(&self, name: &str, values: &[T]) -> Result<(), DriverError> {
        let value = LocalValue::Array(T::into_local(values.to_vec()));
        self.try_write(name, &value).map_err(|source| DriverError {
            function: T::WRITE_FUNCTION,
            name: name.to_string(),
            value: format!("{} elements", values.len()),
            source,
        })
    }

    fn write_value(
        &self,
        function: &'static str,
        name: &str,
        value: LocalValue,
    ) -> Result<(), DriverError> {
        self.try_write(name, &value).map_err(|source| DriverError {
            function,
            name: name.to_string(),
            value: value.to_string(),
            source,
        })
    }

    fn try_write(&self, name: &str, value: &LocalValue) -> Result<(), EngineError> {
        let engine = self.running()?;
        let (binding, id) = engine.binding(name)?;
        check_value_kind(binding, value)?;
        engine.write(binding, &value.to_cnv())?;
        engine.write_through(binding, id, value)?;
        debug!("{name} = {value}");
        Ok(())
    }

    /// Read a float parameter with the time it was last updated
    pub fn read_f64(&self, name: &str) -> Result<(f64, SystemTime), DriverError> {
        self.read_scalar("readFloat64", name, |store, id| store.get_double(id))
    }

    pub fn read_i32(&self, name: &str) -> Result<(i32, SystemTime), DriverError> {
        self.read_scalar("readInt32", name, |store, id| store.get_integer(id))
    }

    /// Read at most `max_chars` characters of a string parameter
    pub fn read_string(&self, name: &str, max_chars: usize) -> Result<StringRead, DriverError> {
        let (value, timestamp) =
            self.read_scalar("readOctet", name, |store, id| store.get_string(id))?;
        if value.chars().count() > max_chars {
            debug!("'{name}' truncated to {max_chars} characters");
            Ok(StringRead {
                value: value.chars().take(max_chars).collect(),
                eom: EomReason::COUNT | EomReason::END,
                timestamp,
            })
        } else {
            Ok(StringRead {
                value,
                eom: EomReason::END,
                timestamp,
            })
        }
    }

    fn read_scalar<T>(
        &self,
        function: &'static str,
        name: &str,
        get: impl FnOnce(&S, ParamId) -> Result<T, ParamError>,
    ) -> Result<(T, SystemTime), DriverError> {
        let read = || -> Result<(T, SystemTime), EngineError> {
            let engine = self.running()?;
            let (binding, id) = engine.binding(name)?;
            engine.read_on_demand(binding)?;
            let store = engine.lock_store();
            let value = get(&*store, id)?;
            let timestamp = binding.last_update().unwrap_or_else(|| store.timestamp());
            Ok((value, timestamp))
        };
        read().map_err(|source| DriverError {
            function,
            name: name.to_string(),
            value: String::new(),
            source,
        })
    }

    /// Copy the last array received for `name` into `out`
    pub fn read_array<T: ArrayElement>(
        &self,
        name: &str,
        out: &mut [T],
    ) -> Result<ArrayRead, DriverError> {
        let capacity = out.len();
        let mut read = || -> Result<ArrayRead, EngineError> {
            let engine = self.running()?;
            let (binding, _) = engine.binding(name)?;
            check_array_kind(binding, T::KIND)?;
            engine.read_on_demand(binding)?;
            let store = engine.lock_store();
            let state = binding.state();
            let n_in = copy_cached(&state.cached_array, out);
            let timestamp = state.last_update.unwrap_or_else(|| store.timestamp());
            Ok(ArrayRead { n_in, timestamp })
        };
        read().map_err(|source| DriverError {
            function: T::READ_FUNCTION,
            name: name.to_string(),
            value: format!("{capacity} elements"),
            source,
        })
    }

    /// Drain buffered subscriptions once, outside the poll task
    pub fn poll_once(&self) {
        if let Some(engine) = &self.engine {
            engine.poll_once();
        }
    }

    pub fn report(&self, out: &mut impl io::Write) -> io::Result<()> {
        writeln!(out, "Config file: {}", self.config_file)?;
        writeln!(out, "Expanded config file: {}", self.expanded_path.display())?;
        writeln!(out, "Section: {}", self.section)?;
        writeln!(out, "Options: {:#x}", self.options)?;
        writeln!(out, "Poll interval: {:?}", self.poll_interval)?;
        match &self.engine {
            Some(engine) => engine.report(out),
            None => writeln!(out, "  <driver stopped, no bindings available>"),
        }
    }

    /// Stop polling, close every connection and finalize the service
    pub async fn stop(&mut self) {
        self.lifecycle.stop.cancel();
        if let Some(task) = self.poll_task.take()
            && let Err(e) = task.await
        {
            error!("Poll task failed: {e}");
        }
        if let Some(engine) = self.engine.take() {
            engine.close_connections();
        }
        self.lifecycle.shutdown();
    }
}

impl<S: ParamStore> Drop for DriverHandle<S> {
    fn drop(&mut self) {
        self.lifecycle.shutdown();
    }
}

impl<S: ParamStore> fmt::Debug for DriverHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle")
            .field("config_file", &self.config_file)
            .field("section", &self.section)
            .field("options", &self.options)
            .field("poll_interval", &self.poll_interval)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn check_array_kind(binding: &VariableBinding, requested: ArrayKind) -> Result<(), EngineError> {
    if binding.declared_type().array_kind() == Some(requested) {
        Ok(())
    } else {
        Err(EngineError::WrongArrayKind {
            name: binding.name().to_string(),
            declared: binding.declared_type().clone(),
            requested,
        })
    }
}

/// Only values of the parameter's own type are sent to the service
fn check_value_kind(binding: &VariableBinding, value: &LocalValue) -> Result<(), EngineError> {
    let requested = match value {
        LocalValue::Array(values) => return check_array_kind(binding, values.kind()),
        LocalValue::Float64(_) => ParamKind::Float64,
        LocalValue::Int32(_) => ParamKind::Int32,
        LocalValue::String(_) => ParamKind::Octet,
    };
    if binding.declared_type().param_kind() == Some(requested) {
        Ok(())
    } else {
        Err(EngineError::WrongKind {
            name: binding.name().to_string(),
            declared: binding.declared_type().clone(),
            requested,
        })
    }
}
