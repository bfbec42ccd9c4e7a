//! The parameter store: the asyn-style table of named, typed parameters that
//! consumers read from and that the update engine writes into.
//!
//! The store is always held behind a `Mutex` by the engine; holding the lock is what
//! makes a sequence of updates (set value, set status, set timestamp, flush callbacks)
//! appear atomic to consumers.

mod table;

pub use table::{ParamTable, ParamUpdate, ParamValue};

use crate::convert::LocalArray;
use std::{fmt, time::SystemTime};
use thiserror::Error;

/// Index of a parameter in its store
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub usize);

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage type of a parameter
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Float64,
    Int32,
    Octet,
    Float64Array,
    Float32Array,
    Int32Array,
    Int16Array,
    Int8Array,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AsynStatus {
    #[default]
    Success,
    Timeout,
    Overflow,
    Error,
    Disconnected,
    Disabled,
}

/// EPICS alarm conditions, in their record-support order
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AlarmCondition {
    #[default]
    None,
    Read,
    Write,
    HiHi,
    High,
    LoLo,
    Low,
    State,
    Cos,
    Comm,
    Timeout,
    HwLimit,
    Calc,
    Scan,
    Link,
    Soft,
    BadSub,
    Udf,
    Disable,
    Simm,
    ReadAccess,
    WriteAccess,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AlarmSeverity {
    #[default]
    None,
    Minor,
    Major,
    Invalid,
}

/// Status, alarm condition and severity of one parameter
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ParamStatus {
    pub status: AsynStatus,
    pub alarm: AlarmCondition,
    pub severity: AlarmSeverity,
}

impl ParamStatus {
    /// Success with no alarm
    pub fn success() -> Self {
        Self::default()
    }

    pub fn error() -> Self {
        Self::with_status(AsynStatus::Error)
    }

    pub fn disconnected() -> Self {
        Self::with_status(AsynStatus::Disconnected)
    }

    /// A status with no alarm attached
    pub fn with_status(status: AsynStatus) -> Self {
        ParamStatus {
            status,
            ..Default::default()
        }
    }

    /// Success, carrying an alarm
    pub fn alarmed(alarm: AlarmCondition, severity: AlarmSeverity) -> Self {
        ParamStatus {
            status: AsynStatus::Success,
            alarm,
            severity,
        }
    }

    /// Success with no alarm raised
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("Param '{0}' already exists")]
    AlreadyExists(String),
    #[error("No param with index {0}")]
    NoSuchParam(ParamId),
    #[error("Param {id} holds {actual:?}, not {requested:?}")]
    WrongKind {
        id: ParamId,
        actual: ParamKind,
        requested: ParamKind,
    },
    #[error("Param {0} has never been set")]
    Undefined(ParamId),
}

/// Operations the update engine needs from a parameter store
pub trait ParamStore: Send + 'static {
    fn create_param(&mut self, name: &str, kind: ParamKind) -> Result<ParamId, ParamError>;
    fn find_param(&self, name: &str) -> Option<ParamId>;
    fn param_name(&self, id: ParamId) -> Option<&str>;

    /// Hint at how many parameters are about to be created
    #[allow(unused_variables)]
    fn reserve(&mut self, additional: usize) {}

    fn set_double(&mut self, id: ParamId, value: f64) -> Result<(), ParamError>;
    fn set_integer(&mut self, id: ParamId, value: i32) -> Result<(), ParamError>;
    fn set_string(&mut self, id: ParamId, value: &str) -> Result<(), ParamError>;
    fn get_double(&self, id: ParamId) -> Result<f64, ParamError>;
    fn get_integer(&self, id: ParamId) -> Result<i32, ParamError>;
    fn get_string(&self, id: ParamId) -> Result<String, ParamError>;

    /// Publish a new array value to consumers, immediately
    fn array_changed(&mut self, id: ParamId, values: &LocalArray) -> Result<(), ParamError>;

    fn param_status(&self, id: ParamId) -> Result<ParamStatus, ParamError>;
    fn set_param_status(&mut self, id: ParamId, status: ParamStatus) -> Result<(), ParamError>;

    /// Set the time attached to subsequent callbacks
    fn set_timestamp(&mut self, time: SystemTime);
    fn timestamp(&self) -> SystemTime;

    /// Notify consumers of every scalar parameter changed since the last call
    fn call_param_callbacks(&mut self);
}
