use std::{collections::HashMap, time::SystemTime};

use tokio::sync::broadcast;
use tracing::trace;

use super::{ParamError, ParamId, ParamKind, ParamStatus, ParamStore};
use crate::convert::LocalArray;

const UPDATE_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Undefined,
    Float64(f64),
    Int32(i32),
    Octet(String),
    Array(LocalArray),
}

/// A notification sent to subscribers of a [`ParamTable`]
#[derive(Debug, Clone, PartialEq)]
pub struct ParamUpdate {
    pub id: ParamId,
    pub name: String,
    pub value: ParamValue,
    pub status: ParamStatus,
    pub timestamp: SystemTime,
}

#[derive(Debug)]
struct Param {
    name: String,
    kind: ParamKind,
    value: ParamValue,
    status: ParamStatus,
    /// Changed since the last flush
    dirty: bool,
}

/// An in-memory parameter store.
///
/// Scalar changes are held until [`ParamStore::call_param_callbacks`], then broadcast to
/// every receiver from [`ParamTable::subscribe`]. Array changes are broadcast at once.
#[derive(Debug)]
pub struct ParamTable {
    params: Vec<Param>,
    by_name: HashMap<String, ParamId>,
    timestamp: SystemTime,
    sender: broadcast::Sender<ParamUpdate>,
}

impl Default for ParamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamTable {
    pub fn new() -> Self {
        ParamTable {
            params: Vec::new(),
            by_name: HashMap::new(),
            timestamp: SystemTime::now(),
            sender: broadcast::channel(UPDATE_CHANNEL_CAPACITY).0,
        }
    }

    /// Receive every update published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ParamUpdate> {
        self.sender.subscribe()
    }

    pub fn value(&self, id: ParamId) -> Option<&ParamValue> {
        self.params.get(id.0).map(|p| &p.value)
    }

    pub fn kind(&self, id: ParamId) -> Option<ParamKind> {
        self.params.get(id.0).map(|p| p.kind)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn param(&self, id: ParamId) -> Result<&Param, ParamError> {
        self.params.get(id.0).ok_or(ParamError::NoSuchParam(id))
    }

    fn param_of_kind(&mut self, id: ParamId, requested: ParamKind) -> Result<&mut Param, ParamError> {
        let param = self.params.get_mut(id.0).ok_or(ParamError::NoSuchParam(id))?;
        if param.kind != requested {
            return Err(ParamError::WrongKind {
                id,
                actual: param.kind,
                requested,
            });
        }
        Ok(param)
    }

    fn set(&mut self, id: ParamId, kind: ParamKind, value: ParamValue) -> Result<(), ParamError> {
        let param = self.param_of_kind(id, kind)?;
        if param.value != value {
            param.value = value;
            param.dirty = true;
        }
        Ok(())
    }

    fn publish(&self, id: ParamId, param: &Param) {
        // No receivers is not an error
        let _ = self.sender.send(ParamUpdate {
            id,
            name: param.name.clone(),
            value: param.value.clone(),
            status: param.status,
            timestamp: self.timestamp,
        });
    }
}

impl ParamStore for ParamTable {
    fn create_param(&mut self, name: &str, kind: ParamKind) -> Result<ParamId, ParamError> {
        if self.by_name.contains_key(name) {
            return Err(ParamError::AlreadyExists(name.to_string()));
        }
        let id = ParamId(self.params.len());
        self.params.push(Param {
            name: name.to_string(),
            kind,
            value: ParamValue::Undefined,
            status: ParamStatus::default(),
            dirty: false,
        });
        self.by_name.insert(name.to_string(), id);
        trace!("Created param {id} '{name}' as {kind:?}");
        Ok(id)
    }

    fn find_param(&self, name: &str) -> Option<ParamId> {
        self.by_name.get(name).copied()
    }

    fn param_name(&self, id: ParamId) -> Option<&str> {
        self.params.get(id.0).map(|p| p.name.as_str())
    }

    fn reserve(&mut self, additional: usize) {
        self.params.reserve(additional);
        self.by_name.reserve(additional);
    }

    fn set_double(&mut self, id: ParamId, value: f64) -> Result<(), ParamError> {
        self.set(id, ParamKind::Float64, ParamValue::Float64(value))
    }

    fn set_integer(&mut self, id: ParamId, value: i32) -> Result<(), ParamError> {
        self.set(id, ParamKind::Int32, ParamValue::Int32(value))
    }

    fn set_string(&mut self, id: ParamId, value: &str) -> Result<(), ParamError> {
        self.set(id, ParamKind::Octet, ParamValue::Octet(value.to_string()))
    }

    fn get_double(&self, id: ParamId) -> Result<f64, ParamError> {
        match &self.param(id)?.value {
            ParamValue::Float64(v) => Ok(*v),
            ParamValue::Undefined => Err(ParamError::Undefined(id)),
            _ => Err(self.wrong_kind(id, ParamKind::Float64)),
        }
    }

    fn get_integer(&self, id: ParamId) -> Result<i32, ParamError> {
        match &self.param(id)?.value {
            ParamValue::Int32(v) => Ok(*v),
            ParamValue::Undefined => Err(ParamError::Undefined(id)),
            _ => Err(self.wrong_kind(id, ParamKind::Int32)),
        }
    }

    fn get_string(&self, id: ParamId) -> Result<String, ParamError> {
        match &self.param(id)?.value {
            ParamValue::Octet(v) => Ok(v.clone()),
            ParamValue::Undefined => Err(ParamError::Undefined(id)),
            _ => Err(self.wrong_kind(id, ParamKind::Octet)),
        }
    }

    fn array_changed(&mut self, id: ParamId, values: &LocalArray) -> Result<(), ParamError> {
        let kind = match values {
            LocalArray::Float64(_) => ParamKind::Float64Array,
            LocalArray::Float32(_) => ParamKind::Float32Array,
            LocalArray::Int32(_) => ParamKind::Int32Array,
            LocalArray::Int16(_) => ParamKind::Int16Array,
            LocalArray::Int8(_) => ParamKind::Int8Array,
        };
        let param = self.param_of_kind(id, kind)?;
        param.value = ParamValue::Array(values.clone());
        let param = self.param(id)?;
        self.publish(id, param);
        Ok(())
    }

    fn param_status(&self, id: ParamId) -> Result<ParamStatus, ParamError> {
        Ok(self.param(id)?.status)
    }

    fn set_param_status(&mut self, id: ParamId, status: ParamStatus) -> Result<(), ParamError> {
        let param = self.params.get_mut(id.0).ok_or(ParamError::NoSuchParam(id))?;
        if param.status != status {
            param.status = status;
            param.dirty = true;
        }
        Ok(())
    }

    fn set_timestamp(&mut self, time: SystemTime) {
        self.timestamp = time;
    }

    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn call_param_callbacks(&mut self) {
        for index in 0..self.params.len() {
            if !self.params[index].dirty {
                continue;
            }
            self.params[index].dirty = false;
            self.publish(ParamId(index), &self.params[index]);
        }
    }
}

impl ParamTable {
    fn wrong_kind(&self, id: ParamId, requested: ParamKind) -> ParamError {
        ParamError::WrongKind {
            id,
            actual: self.params[id.0].kind,
            requested,
        }
    }
}
