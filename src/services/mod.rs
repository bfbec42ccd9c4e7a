//! The network variable service: the engine that actually owns the shared variables.
//!
//! The update engine talks to the service only through [`NetVarService`], and the
//! service talks back only through [`CallbackSink`]. Every connection is named by a
//! [`ConnectionId`] chosen by the caller before the connection is created, so the
//! callback context can be registered before the first callback can possibly arrive.
//!
//! Service calls may block for up to their [`WaitMode`], and callbacks may arrive on
//! any thread, including the thread making a service call.

pub mod loopback;

pub use loopback::LoopbackService;

use crate::cnv::{
    BufferDataStatus, CnvData, CnvError, ConnectionId, ConnectionInfo, ConnectionStatus,
    WaitMode,
};
use std::sync::Arc;

/// Receives asynchronous notifications for a connection
pub trait CallbackSink: Send + Sync {
    /// A subscriber received a new value
    fn data(&self, connection: ConnectionId, data: CnvData);
    /// The connection state changed, or failed with `error`
    fn status(&self, connection: ConnectionId, status: ConnectionStatus, error: Option<CnvError>);
    /// A buffered write completed
    fn transferred(&self, connection: ConnectionId, error: Option<CnvError>);
}

/// A process hosted by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    pub running: bool,
}

/// Operations on the network variable service
pub trait NetVarService: Send + Sync + 'static {
    /// Is the service running on this machine?
    fn engine_is_running(&self) -> Result<bool, CnvError> {
        Ok(true)
    }

    /// Processes hosted by the service, for diagnostics
    fn processes(&self) -> Result<Vec<ProcessInfo>, CnvError> {
        Ok(Vec::new())
    }

    /// Does a variable, or a folder, exist at `path`?
    fn path_exists(&self, path: &str) -> Result<bool, CnvError>;

    fn create_subscriber(
        &self,
        id: ConnectionId,
        path: &str,
        sink: Arc<dyn CallbackSink>,
        timeout: WaitMode,
    ) -> Result<(), CnvError>;

    fn create_buffered_subscriber(
        &self,
        id: ConnectionId,
        path: &str,
        sink: Arc<dyn CallbackSink>,
        max_items: usize,
        timeout: WaitMode,
    ) -> Result<(), CnvError>;

    /// Create a reader. `sink`, if given, only receives status changes.
    fn create_reader(
        &self,
        id: ConnectionId,
        path: &str,
        sink: Option<Arc<dyn CallbackSink>>,
        timeout: WaitMode,
    ) -> Result<(), CnvError>;

    fn create_writer(
        &self,
        id: ConnectionId,
        path: &str,
        sink: Arc<dyn CallbackSink>,
        timeout: WaitMode,
    ) -> Result<(), CnvError>;

    fn create_buffered_writer(
        &self,
        id: ConnectionId,
        path: &str,
        sink: Arc<dyn CallbackSink>,
        max_items: usize,
        timeout: WaitMode,
    ) -> Result<(), CnvError>;

    /// Read through a reader, returning `None` if no new value is available
    fn read(&self, id: ConnectionId, timeout: WaitMode) -> Result<Option<CnvData>, CnvError>;

    /// Take the oldest item from a buffered subscriber
    fn get_data_from_buffer(
        &self,
        id: ConnectionId,
    ) -> Result<(BufferDataStatus, Option<CnvData>), CnvError>;

    fn write(&self, id: ConnectionId, data: &CnvData, timeout: WaitMode) -> Result<(), CnvError>;

    /// Queue a value on a buffered writer
    fn put_data_in_buffer(
        &self,
        id: ConnectionId,
        data: &CnvData,
        timeout: WaitMode,
    ) -> Result<(), CnvError>;

    fn connection_info(&self, id: ConnectionId) -> Result<ConnectionInfo, CnvError>;

    /// Close a connection. No callbacks arrive for it afterwards.
    fn dispose(&self, id: ConnectionId);

    /// Release every resource held by the service
    fn finish(&self);
}
