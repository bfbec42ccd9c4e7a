//! Variable bindings: the link between one store parameter and one shared variable.

use crate::{
    cnv::ConnectionId,
    convert::ArrayKind,
    store::{AlarmCondition, AlarmSeverity, ParamId, ParamKind, ParamStore},
};
use bitflags::bitflags;
use std::{
    collections::{BTreeMap, HashMap},
    convert::Infallible,
    fmt,
    str::FromStr,
    sync::{Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};
use tracing::{error, warn};

bitflags! {
    /// How a binding talks to its variable.
    ///
    /// At most one of the read flags is honoured, in the order `READ`,
    /// `BUFFERED_READ`, `SINGLE_READ`, and at most one of the write flags, in the order
    /// `WRITE`, `BUFFERED_WRITE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessMode: u8 {
        /// Subscribe, receiving every update as it is published
        const READ = 0x01;
        /// Plain unbuffered writes
        const WRITE = 0x02;
        /// Subscribe through a client-side buffer, drained by polling
        const BUFFERED_READ = 0x04;
        /// Writes queued through a client-side buffer
        const BUFFERED_WRITE = 0x08;
        /// No subscription; the variable is read when the parameter is read
        const SINGLE_READ = 0x10;
    }
}

impl AccessMode {
    const READERS: [AccessMode; 3] = [
        AccessMode::READ,
        AccessMode::BUFFERED_READ,
        AccessMode::SINGLE_READ,
    ];
    const WRITERS: [AccessMode; 2] = [AccessMode::WRITE, AccessMode::BUFFERED_WRITE];

    /// Parse a comma separated list of `R`, `BR`, `SR`, `W` and `BW`.
    ///
    /// Tokens are case-sensitive. Unknown tokens are reported and ignored.
    pub fn parse(tokens: &str, param: &str) -> Self {
        let mut mode = AccessMode::empty();
        for token in tokens.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            mode |= match token {
                "R" => AccessMode::READ,
                "BR" => AccessMode::BUFFERED_READ,
                "SR" => AccessMode::SINGLE_READ,
                "W" => AccessMode::WRITE,
                "BW" => AccessMode::BUFFERED_WRITE,
                other => {
                    warn!("Param '{param}': unknown access mode '{other}' ignored");
                    continue;
                }
            };
        }
        mode
    }

    /// The read flag in effect, if any
    pub fn reader(&self) -> Option<AccessMode> {
        Self::READERS.into_iter().find(|r| self.contains(*r))
    }

    /// The write flag in effect, if any
    pub fn writer(&self) -> Option<AccessMode> {
        Self::WRITERS.into_iter().find(|w| self.contains(*w))
    }

    /// Keep only the read and write flags in effect
    pub fn normalized(&self) -> AccessMode {
        self.reader().unwrap_or_default() | self.writer().unwrap_or_default()
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const TOKENS: [(AccessMode, &str); 5] = [
            (AccessMode::READ, "R"),
            (AccessMode::WRITE, "W"),
            (AccessMode::BUFFERED_READ, "BR"),
            (AccessMode::BUFFERED_WRITE, "BW"),
            (AccessMode::SINGLE_READ, "SR"),
        ];
        let names: Vec<&str> = TOKENS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, token)| *token)
            .collect();
        if names.is_empty() {
            f.write_str("-")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

/// The `type` attribute of a binding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeclaredType {
    Float64,
    Int32,
    Boolean,
    String,
    /// Service time, presented as text
    Timestamp,
    /// Service time, presented as seconds since the EPICS epoch
    FTimestamp,
    Float64Array,
    Float32Array,
    Int32Array,
    Int16Array,
    Int8Array,
    Unknown(String),
}

impl DeclaredType {
    /// The kind of store parameter backing this type
    pub fn param_kind(&self) -> Option<ParamKind> {
        Some(match self {
            DeclaredType::Float64 | DeclaredType::FTimestamp => ParamKind::Float64,
            DeclaredType::Int32 | DeclaredType::Boolean => ParamKind::Int32,
            DeclaredType::String | DeclaredType::Timestamp => ParamKind::Octet,
            DeclaredType::Float64Array => ParamKind::Float64Array,
            DeclaredType::Float32Array => ParamKind::Float32Array,
            DeclaredType::Int32Array => ParamKind::Int32Array,
            DeclaredType::Int16Array => ParamKind::Int16Array,
            DeclaredType::Int8Array => ParamKind::Int8Array,
            DeclaredType::Unknown(_) => return None,
        })
    }

    pub fn array_kind(&self) -> Option<ArrayKind> {
        match self {
            DeclaredType::Float64Array => Some(ArrayKind::Float64),
            DeclaredType::Float32Array => Some(ArrayKind::Float32),
            DeclaredType::Int32Array => Some(ArrayKind::Int32),
            DeclaredType::Int16Array => Some(ArrayKind::Int16),
            DeclaredType::Int8Array => Some(ArrayKind::Int8),
            _ => None,
        }
    }

    pub fn is_timestamp(&self) -> bool {
        matches!(self, DeclaredType::Timestamp | DeclaredType::FTimestamp)
    }
}

impl FromStr for DeclaredType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "float64" => DeclaredType::Float64,
            "int32" => DeclaredType::Int32,
            "boolean" => DeclaredType::Boolean,
            "string" => DeclaredType::String,
            "timestamp" => DeclaredType::Timestamp,
            "ftimestamp" => DeclaredType::FTimestamp,
            "float64array" => DeclaredType::Float64Array,
            "float32array" => DeclaredType::Float32Array,
            "int32array" => DeclaredType::Int32Array,
            "int16array" => DeclaredType::Int16Array,
            "int8array" => DeclaredType::Int8Array,
            other => DeclaredType::Unknown(other.to_string()),
        })
    }
}

impl fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeclaredType::Float64 => "float64",
            DeclaredType::Int32 => "int32",
            DeclaredType::Boolean => "boolean",
            DeclaredType::String => "string",
            DeclaredType::Timestamp => "timestamp",
            DeclaredType::FTimestamp => "ftimestamp",
            DeclaredType::Float64Array => "float64array",
            DeclaredType::Float32Array => "float32array",
            DeclaredType::Int32Array => "int32array",
            DeclaredType::Int16Array => "int16array",
            DeclaredType::Int8Array => "int8array",
            DeclaredType::Unknown(s) => s,
        })
    }
}

/// The four alarm levels a variable may carry
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AlarmLevel {
    Hi,
    HiHi,
    Lo,
    LoLo,
}

impl AlarmLevel {
    pub const ALL: [AlarmLevel; 4] = [
        AlarmLevel::Hi,
        AlarmLevel::HiHi,
        AlarmLevel::Lo,
        AlarmLevel::LoLo,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AlarmLevel::Hi => "Hi",
            AlarmLevel::HiHi => "HiHi",
            AlarmLevel::Lo => "Lo",
            AlarmLevel::LoLo => "LoLo",
        }
    }

    pub fn condition(&self) -> AlarmCondition {
        match self {
            AlarmLevel::Hi => AlarmCondition::High,
            AlarmLevel::HiHi => AlarmCondition::HiHi,
            AlarmLevel::Lo => AlarmCondition::Low,
            AlarmLevel::LoLo => AlarmCondition::LoLo,
        }
    }

    pub fn severity(&self) -> AlarmSeverity {
        match self {
            AlarmLevel::Hi | AlarmLevel::Lo => AlarmSeverity::Minor,
            AlarmLevel::HiHi | AlarmLevel::LoLo => AlarmSeverity::Major,
        }
    }

    /// Name suffix of the binding tracking whether this alarm is raised
    pub fn set_suffix(&self) -> String {
        format!("_{}_Set", self.name())
    }

    /// Path of the variable for one property of this alarm on `path`
    pub fn property_path(&self, path: &str, property: &str) -> String {
        format!("{path}\\Alarms\\{}\\{property}", self.name())
    }
}

/// Connections opened for a binding
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Handles {
    pub subscriber: Option<ConnectionId>,
    pub buffered_subscriber: Option<ConnectionId>,
    pub reader: Option<ConnectionId>,
    pub writer: Option<ConnectionId>,
    pub buffered_writer: Option<ConnectionId>,
}

impl Handles {
    pub fn all(&self) -> impl Iterator<Item = ConnectionId> {
        [
            self.subscriber,
            self.buffered_subscriber,
            self.reader,
            self.writer,
            self.buffered_writer,
        ]
        .into_iter()
        .flatten()
    }
}

/// Mutable state of a binding, updated from service callbacks
#[derive(Debug, Default)]
pub(crate) struct BindingState {
    pub handles: Handles,
    /// Native-endian bytes of the last array received
    pub cached_array: Vec<u8>,
    pub last_update: Option<SystemTime>,
}

/// One configured link between a parameter and a shared variable
#[derive(Debug)]
pub struct VariableBinding {
    name: String,
    path: String,
    declared_type: DeclaredType,
    access: AccessMode,
    field: Option<usize>,
    ts_param: Option<String>,
    param_id: Option<ParamId>,
    connected_alarm: bool,
    state: Mutex<BindingState>,
}

/// Use the native separator for variable paths
pub fn normalize_path(path: &str) -> String {
    path.replace('/', "\\")
}

impl VariableBinding {
    pub fn new(
        name: &str,
        path: &str,
        declared_type: DeclaredType,
        access: AccessMode,
        field: Option<usize>,
        ts_param: Option<String>,
    ) -> Self {
        let normalized = access.normalized();
        if normalized != access {
            warn!(
                "Param '{name}': access '{access}' has conflicting modes, using '{normalized}'"
            );
        }
        VariableBinding {
            name: name.to_string(),
            path: normalize_path(path),
            declared_type,
            access: normalized,
            field,
            ts_param,
            param_id: None,
            connected_alarm: false,
            state: Mutex::new(BindingState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn path(&self) -> &str {
        &self.path
    }
    pub fn declared_type(&self) -> &DeclaredType {
        &self.declared_type
    }
    pub fn access(&self) -> AccessMode {
        self.access
    }
    /// Index into the structure fields, for struct projections
    pub fn field(&self) -> Option<usize> {
        self.field
    }
    pub fn ts_param(&self) -> Option<&str> {
        self.ts_param.as_deref()
    }
    pub fn param_id(&self) -> Option<ParamId> {
        self.param_id
    }
    /// Alarm bindings were discovered and attached for this variable
    pub fn has_connected_alarm(&self) -> bool {
        self.connected_alarm
    }

    pub(crate) fn set_connected_alarm(&mut self) {
        self.connected_alarm = true;
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, BindingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn handles(&self) -> Handles {
        self.state().handles
    }

    pub fn last_update(&self) -> Option<SystemTime> {
        self.state().last_update
    }

    /// Number of bytes held from the last array update
    pub fn cached_array_bytes(&self) -> usize {
        self.state().cached_array.len()
    }
}

/// All bindings of a driver, keyed by parameter name
#[derive(Debug, Default)]
pub struct Registry {
    bindings: BTreeMap<String, VariableBinding>,
    by_param: HashMap<ParamId, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding, returning any binding it replaced
    pub fn insert(&mut self, binding: VariableBinding) -> Option<VariableBinding> {
        self.bindings.insert(binding.name.clone(), binding)
    }

    pub fn get(&self, name: &str) -> Option<&VariableBinding> {
        self.bindings.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut VariableBinding> {
        self.bindings.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn by_param_id(&self, id: ParamId) -> Option<&VariableBinding> {
        self.by_param.get(&id).and_then(|name| self.bindings.get(name))
    }

    /// Bindings in name order
    pub fn iter(&self) -> impl Iterator<Item = &VariableBinding> {
        self.bindings.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }

    /// Every binding on the variable at `path`
    pub fn bindings_for_path<'a>(
        &'a self,
        path: &'a str,
    ) -> impl Iterator<Item = &'a VariableBinding> {
        self.bindings.values().filter(move |b| b.path == path)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Create a store parameter for every binding that does not have one yet.
    ///
    /// Bindings with an unknown type, or whose parameter cannot be created, are left
    /// without an id and so are never updated.
    pub fn assign_parameter_ids<S: ParamStore + ?Sized>(&mut self, store: &mut S) {
        for binding in self.bindings.values_mut() {
            if binding.param_id.is_some() {
                continue;
            }
            let Some(kind) = binding.declared_type.param_kind() else {
                error!(
                    "Param '{}' has unknown type '{}'",
                    binding.name, binding.declared_type
                );
                continue;
            };
            match store.create_param(&binding.name, kind) {
                Ok(id) => {
                    binding.param_id = Some(id);
                    self.by_param.insert(id, binding.name.clone());
                }
                Err(e) => error!("Unable to create param '{}': {e}", binding.name),
            }
        }
    }
}
