//! An in-process network variable service.
//!
//! Variables live in memory, keyed by their path. Publishing a value, or writing it
//! through a writer, delivers it to every subscriber of that path on the calling
//! thread, after the internal lock has been released. Buffered subscribers hold up to
//! `max_items` values; when full, the oldest value is dropped and the next drain
//! reports [`BufferDataStatus::DataWasLost`].
//!
//! Besides serving the driver, this is used by the `check_netvar` tool and by tests,
//! which can refuse connections to a path or inject connection status changes.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use tracing::{debug, trace};

use super::{CallbackSink, NetVarService, ProcessInfo};
use crate::{
    binding::normalize_path,
    cnv::{
        BufferDataStatus, CnvData, CnvError, ConnectionId, ConnectionInfo, ConnectionStatus,
        WaitMode,
    },
};

pub const ERR_NOT_FOUND: i32 = -6001;
pub const ERR_BAD_CONNECTION: i32 = -6002;
pub const ERR_WRONG_KIND: i32 = -6003;
pub const ERR_FINISHED: i32 = -6004;
pub const ERR_REFUSED: i32 = -6005;
pub const ERR_DUPLICATE: i32 = -6006;

/// Number of writes remembered by [`LoopbackService::writes`], across all paths
pub const WRITE_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionKind {
    Subscriber,
    BufferedSubscriber,
    Reader,
    Writer,
    BufferedWriter,
}

struct Connection {
    path: String,
    kind: ConnectionKind,
    sink: Option<Arc<dyn CallbackSink>>,
    status: ConnectionStatus,
    buffer: VecDeque<CnvData>,
    max_items: usize,
    lost: bool,
    /// Version of the variable last returned by a read
    seen_version: u64,
}

#[derive(Default)]
struct Variable {
    value: Option<CnvData>,
    version: u64,
}

#[derive(Default)]
struct LoopbackState {
    variables: BTreeMap<String, Variable>,
    connections: HashMap<ConnectionId, Connection>,
    refused: HashSet<String>,
    writes: VecDeque<(String, CnvData)>,
    transfer_errors: HashMap<String, CnvError>,
    finished: bool,
}

type Deliveries = Vec<(Arc<dyn CallbackSink>, ConnectionId)>;

#[derive(Default)]
pub struct LoopbackService {
    state: Mutex<LoopbackState>,
    stopped: AtomicBool,
    finish_count: AtomicUsize,
}

impl LoopbackService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a variable with no value
    pub fn define(&self, path: &str) {
        self.lock().variables.entry(normalize_path(path)).or_default();
    }

    /// Declare a variable holding `value`, without notifying anyone
    pub fn define_with(&self, path: &str, value: CnvData) {
        let mut state = self.lock();
        let variable = state.variables.entry(normalize_path(path)).or_default();
        variable.value = Some(value);
        variable.version += 1;
    }

    /// Set the value of a variable, declaring it if needed, and notify subscribers.
    ///
    /// Returns the number of subscribers notified directly.
    pub fn publish(&self, path: &str, value: CnvData) -> usize {
        let path = normalize_path(path);
        let deliveries = self.store_value(&path, &value);
        let notified = deliveries.len();
        for (sink, id) in deliveries {
            sink.data(id, value.clone());
        }
        notified
    }

    fn store_value(&self, path: &str, value: &CnvData) -> Deliveries {
        let mut guard = self.lock();
        let state = &mut *guard;
        let variable = state.variables.entry(path.to_string()).or_default();
        variable.value = Some(value.clone());
        variable.version += 1;
        trace!("{path} is now version {}", variable.version);

        let mut deliveries = Vec::new();
        for (id, connection) in state.connections.iter_mut() {
            if connection.path != path {
                continue;
            }
            match connection.kind {
                ConnectionKind::Subscriber => {
                    if let Some(sink) = &connection.sink {
                        deliveries.push((sink.clone(), *id));
                    }
                }
                ConnectionKind::BufferedSubscriber => {
                    if connection.buffer.len() >= connection.max_items {
                        connection.buffer.pop_front();
                        connection.lost = true;
                    }
                    connection.buffer.push_back(value.clone());
                }
                _ => {}
            }
        }
        deliveries
    }

    /// The current value of a variable
    pub fn value(&self, path: &str) -> Option<CnvData> {
        self.lock()
            .variables
            .get(&normalize_path(path))
            .and_then(|v| v.value.clone())
    }

    /// Values recently written to `path` through a writer, oldest first.
    ///
    /// Only the last [`WRITE_LOG_CAPACITY`] writes to any path are kept.
    pub fn writes(&self, path: &str) -> Vec<CnvData> {
        let path = normalize_path(path);
        self.lock()
            .writes
            .iter()
            .filter(|(p, _)| *p == path)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Complete future buffered writes to `path` with `error`, or successfully for `None`
    pub fn set_transfer_error(&self, path: &str, error: Option<CnvError>) {
        let path = normalize_path(path);
        let mut state = self.lock();
        match error {
            Some(e) => state.transfer_errors.insert(path, e),
            None => state.transfer_errors.remove(&path),
        };
    }

    /// Make every future connection attempt to `path` fail
    pub fn refuse_connections(&self, path: &str) {
        self.lock().refused.insert(normalize_path(path));
    }

    /// Change the state of every connection to `path`, notifying their sinks
    pub fn set_connection_status(
        &self,
        path: &str,
        status: ConnectionStatus,
        error: Option<CnvError>,
    ) {
        let path = normalize_path(path);
        let deliveries: Deliveries = {
            let mut state = self.lock();
            state
                .connections
                .iter_mut()
                .filter(|(_, c)| c.path == path)
                .filter_map(|(id, c)| {
                    c.status = status;
                    c.sink.clone().map(|s| (s, *id))
                })
                .collect()
        };
        for (sink, id) in deliveries {
            sink.status(id, status, error.clone());
        }
    }

    /// Pretend the service process has stopped
    pub fn set_running(&self, running: bool) {
        self.stopped.store(!running, Ordering::SeqCst);
    }

    /// Number of open connections to `path`
    pub fn connection_count(&self, path: &str) -> usize {
        let path = normalize_path(path);
        self.lock()
            .connections
            .values()
            .filter(|c| c.path == path)
            .count()
    }

    /// How many times [`NetVarService::finish`] has been called
    pub fn finish_count(&self) -> usize {
        self.finish_count.load(Ordering::SeqCst)
    }

    fn open(
        &self,
        function: &'static str,
        id: ConnectionId,
        path: &str,
        kind: ConnectionKind,
        sink: Option<Arc<dyn CallbackSink>>,
        max_items: usize,
    ) -> Result<(), CnvError> {
        let path = normalize_path(path);
        {
            let mut state = self.lock();
            if state.finished {
                return Err(CnvError::new(function, ERR_FINISHED, "Service has finished"));
            }
            if state.refused.contains(&path) {
                return Err(CnvError::new(
                    function,
                    ERR_REFUSED,
                    format!("Connection to '{path}' refused"),
                ));
            }
            if !state.variables.contains_key(&path) {
                return Err(CnvError::new(
                    function,
                    ERR_NOT_FOUND,
                    format!("Variable '{path}' does not exist"),
                ));
            }
            if state.connections.contains_key(&id) {
                return Err(CnvError::new(
                    function,
                    ERR_DUPLICATE,
                    format!("Connection {id} already open"),
                ));
            }
            debug!("Opened {kind:?} {id} to {path}");
            state.connections.insert(
                id,
                Connection {
                    path,
                    kind,
                    sink: sink.clone(),
                    status: ConnectionStatus::Connected,
                    buffer: VecDeque::new(),
                    max_items: max_items.max(1),
                    lost: false,
                    seen_version: 0,
                },
            );
        }
        if let Some(sink) = sink {
            sink.status(id, ConnectionStatus::Connected, None);
        }
        Ok(())
    }

    /// Run `f` on a connection of the expected kind
    fn with_connection<T>(
        &self,
        function: &'static str,
        id: ConnectionId,
        kind: ConnectionKind,
        f: impl FnOnce(&mut Connection, &BTreeMap<String, Variable>) -> T,
    ) -> Result<T, CnvError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let connection = state.connections.get_mut(&id).ok_or_else(|| {
            CnvError::new(function, ERR_BAD_CONNECTION, format!("No connection {id}"))
        })?;
        if connection.kind != kind {
            return Err(CnvError::new(
                function,
                ERR_WRONG_KIND,
                format!("Connection {id} is a {:?}", connection.kind),
            ));
        }
        Ok(f(connection, &state.variables))
    }

    fn write_through(
        &self,
        function: &'static str,
        id: ConnectionId,
        kind: ConnectionKind,
        data: &CnvData,
    ) -> Result<(String, Option<Arc<dyn CallbackSink>>), CnvError> {
        let (path, sink) =
            self.with_connection(function, id, kind, |c, _| (c.path.clone(), c.sink.clone()))?;
        {
            let mut state = self.lock();
            if state.writes.len() >= WRITE_LOG_CAPACITY {
                state.writes.pop_front();
            }
            state.writes.push_back((path.clone(), data.clone()));
        }
        self.publish(&path, data.clone());
        Ok((path, sink))
    }
}

impl NetVarService for LoopbackService {
    fn engine_is_running(&self) -> Result<bool, CnvError> {
        Ok(!self.stopped.load(Ordering::SeqCst))
    }

    fn processes(&self) -> Result<Vec<ProcessInfo>, CnvError> {
        Ok(vec![ProcessInfo {
            name: "loopback".to_string(),
            running: !self.stopped.load(Ordering::SeqCst),
        }])
    }

    fn path_exists(&self, path: &str) -> Result<bool, CnvError> {
        let path = normalize_path(path);
        let folder = format!("{path}\\");
        let state = self.lock();
        Ok(state.variables.contains_key(&path)
            || state.variables.keys().any(|k| k.starts_with(&folder)))
    }

    fn create_subscriber(
        &self,
        id: ConnectionId,
        path: &str,
        sink: Arc<dyn CallbackSink>,
        _timeout: WaitMode,
    ) -> Result<(), CnvError> {
        self.open("CNVCreateSubscriber", id, path, ConnectionKind::Subscriber, Some(sink), 0)
    }

    fn create_buffered_subscriber(
        &self,
        id: ConnectionId,
        path: &str,
        sink: Arc<dyn CallbackSink>,
        max_items: usize,
        _timeout: WaitMode,
    ) -> Result<(), CnvError> {
        self.open(
            "CNVCreateBufferedSubscriber",
            id,
            path,
            ConnectionKind::BufferedSubscriber,
            Some(sink),
            max_items,
        )
    }

    fn create_reader(
        &self,
        id: ConnectionId,
        path: &str,
        sink: Option<Arc<dyn CallbackSink>>,
        _timeout: WaitMode,
    ) -> Result<(), CnvError> {
        self.open("CNVCreateReader", id, path, ConnectionKind::Reader, sink, 0)
    }

    fn create_writer(
        &self,
        id: ConnectionId,
        path: &str,
        sink: Arc<dyn CallbackSink>,
        _timeout: WaitMode,
    ) -> Result<(), CnvError> {
        self.open("CNVCreateWriter", id, path, ConnectionKind::Writer, Some(sink), 0)
    }

    fn create_buffered_writer(
        &self,
        id: ConnectionId,
        path: &str,
        sink: Arc<dyn CallbackSink>,
        max_items: usize,
        _timeout: WaitMode,
    ) -> Result<(), CnvError> {
        self.open(
            "CNVCreateBufferedWriter",
            id,
            path,
            ConnectionKind::BufferedWriter,
            Some(sink),
            max_items,
        )
    }

    fn read(&self, id: ConnectionId, _timeout: WaitMode) -> Result<Option<CnvData>, CnvError> {
        self.with_connection("CNVRead", id, ConnectionKind::Reader, |c, variables| {
            let variable = variables.get(&c.path)?;
            if variable.version > c.seen_version {
                c.seen_version = variable.version;
                variable.value.clone()
            } else {
                None
            }
        })
    }

    fn get_data_from_buffer(
        &self,
        id: ConnectionId,
    ) -> Result<(BufferDataStatus, Option<CnvData>), CnvError> {
        self.with_connection(
            "CNVGetDataFromBuffer",
            id,
            ConnectionKind::BufferedSubscriber,
            |c, _| match c.buffer.pop_front() {
                Some(data) if c.lost => {
                    c.lost = false;
                    (BufferDataStatus::DataWasLost, Some(data))
                }
                Some(data) => (BufferDataStatus::NewData, Some(data)),
                None => (BufferDataStatus::StaleData, None),
            },
        )
    }

    fn write(&self, id: ConnectionId, data: &CnvData, _timeout: WaitMode) -> Result<(), CnvError> {
        self.write_through("CNVWrite", id, ConnectionKind::Writer, data)
            .map(|_| ())
    }

    fn put_data_in_buffer(
        &self,
        id: ConnectionId,
        data: &CnvData,
        _timeout: WaitMode,
    ) -> Result<(), CnvError> {
        let (path, sink) = self.write_through(
            "CNVPutDataInBuffer",
            id,
            ConnectionKind::BufferedWriter,
            data,
        )?;
        if let Some(sink) = sink {
            let error = self.lock().transfer_errors.get(&path).cloned();
            sink.transferred(id, error);
        }
        Ok(())
    }

    fn connection_info(&self, id: ConnectionId) -> Result<ConnectionInfo, CnvError> {
        let state = self.lock();
        let connection = state.connections.get(&id).ok_or_else(|| {
            CnvError::new("CNVGetConnectionAttribute", ERR_BAD_CONNECTION, format!("No connection {id}"))
        })?;
        let buffer = match connection.kind {
            ConnectionKind::BufferedSubscriber => {
                Some((connection.buffer.len(), connection.max_items))
            }
            ConnectionKind::BufferedWriter => Some((0, connection.max_items)),
            _ => None,
        };
        Ok(ConnectionInfo {
            status: connection.status,
            error: None,
            buffer,
        })
    }

    fn dispose(&self, id: ConnectionId) {
        if self.lock().connections.remove(&id).is_some() {
            trace!("Disposed connection {id}");
        }
    }

    fn finish(&self) {
        let mut state = self.lock();
        state.finished = true;
        state.connections.clear();
        self.finish_count.fetch_add(1, Ordering::SeqCst);
        debug!("Loopback service finished");
    }
}
