//! Values exchanged with the network shared variable service.
//!
//! Every value the service hands over is a [`CnvData`]: a type tag, a list of
//! dimensions (empty for scalars), the payload itself and the metadata the service
//! attaches to it (quality, UTC timestamp and an optional server error).
//!
//! Numeric payloads are carried as flat little-endian buffers, exactly as they would be
//! handed across by the service, and are decoded on demand with [`CnvData::decode`].
//! Strings are carried as a list of owned strings and structures as a list of field
//! values, each of which is itself a [`CnvData`].
//!
//! The basic types are enumerated in [`CnvDataType`]. The signed and unsigned integer
//! variants are kept distinct here; folding them together is the job of
//! [`crate::convert`].

use bitflags::bitflags;
use nom::{
    Finish, Parser,
    combinator::{all_consuming, map},
    multi::count,
    number::complete::{
        le_f32, le_f64, le_i8, le_i16, le_i32, le_i64, le_u8, le_u16, le_u32, le_u64,
    },
};
use std::{
    fmt,
    time::{Duration, SystemTime},
};
use thiserror::Error;

/// Largest number of dimensions an array value may carry
pub const MAX_DIMENSIONS: usize = 10;

/// Basic type tag of a [`CnvData`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CnvDataType {
    Empty,
    Bool,
    String,
    Single,
    Double,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Struct,
}

impl CnvDataType {
    /// Size in bytes of a single element in a flat buffer, if fixed-width
    pub fn element_size(&self) -> Option<usize> {
        match self {
            CnvDataType::Bool | CnvDataType::Int8 | CnvDataType::UInt8 => Some(1),
            CnvDataType::Int16 | CnvDataType::UInt16 => Some(2),
            CnvDataType::Single | CnvDataType::Int32 | CnvDataType::UInt32 => Some(4),
            CnvDataType::Double | CnvDataType::Int64 | CnvDataType::UInt64 => Some(8),
            CnvDataType::Empty | CnvDataType::String | CnvDataType::Struct => None,
        }
    }
}

impl fmt::Display for CnvDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CnvDataType::Empty => "Empty",
            CnvDataType::Bool => "Bool",
            CnvDataType::String => "String",
            CnvDataType::Single => "Single",
            CnvDataType::Double => "Double",
            CnvDataType::Int8 => "Int8",
            CnvDataType::UInt8 => "UInt8",
            CnvDataType::Int16 => "Int16",
            CnvDataType::UInt16 => "UInt16",
            CnvDataType::Int32 => "Int32",
            CnvDataType::UInt32 => "UInt32",
            CnvDataType::Int64 => "Int64",
            CnvDataType::UInt64 => "UInt64",
            CnvDataType::Struct => "Struct",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Quality flags attached to every value by the service.
    ///
    /// An empty set means the value is good.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DataQuality: u32 {
        const BAD = 0x0001;
        const UNCERTAIN = 0x0002;
        const NO_CONNECTION = 0x0004;
        const COMM_FAILURE = 0x0008;
        const DEVICE_FAILURE = 0x0010;
        const SENSOR_FAILURE = 0x0020;
        const OUT_OF_SERVICE = 0x0040;
        const TYPE_MISMATCH = 0x0080;
        const TIMEOUT = 0x0100;
        const LOW_LIMITED = 0x0200;
        const HIGH_LIMITED = 0x0400;
        const IN_ALARM = 0x0800;
        const INACCURATE = 0x1000;
    }
}

impl DataQuality {
    /// Flags that make a value unusable
    const NOT_GOOD: DataQuality = DataQuality::BAD
        .union(DataQuality::UNCERTAIN)
        .union(DataQuality::NO_CONNECTION)
        .union(DataQuality::COMM_FAILURE)
        .union(DataQuality::DEVICE_FAILURE)
        .union(DataQuality::SENSOR_FAILURE)
        .union(DataQuality::OUT_OF_SERVICE)
        .union(DataQuality::TYPE_MISMATCH)
        .union(DataQuality::TIMEOUT);

    pub fn is_good(&self) -> bool {
        !self.intersects(Self::NOT_GOOD)
    }

    /// Either of the limit flags is raised
    pub fn is_limited(&self) -> bool {
        self.intersects(DataQuality::LOW_LIMITED | DataQuality::HIGH_LIMITED)
    }

    /// Human readable list of the raised flags, joined by `;`
    pub fn description(&self) -> String {
        if self.is_empty() {
            return "Good".to_string();
        }
        self.iter_names()
            .map(|(name, _)| name)
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Connection state reported through the status callback
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnected => "Disconnected",
        })
    }
}

/// Result of draining one item from a client-side buffer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferDataStatus {
    NewData,
    StaleData,
    DataWasLost,
}

impl fmt::Display for BufferDataStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BufferDataStatus::NewData => "NewData",
            BufferDataStatus::StaleData => "StaleData",
            BufferDataStatus::DataWasLost => "DataWasLost",
        })
    }
}

/// How long a blocking service call may wait
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitMode {
    Forever,
    DoNotWait,
    Timeout(Duration),
}

impl WaitMode {
    /// Convert a millisecond count, negative meaning forever
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ..0 => WaitMode::Forever,
            0 => WaitMode::DoNotWait,
            ms => WaitMode::Timeout(Duration::from_millis(ms as u64)),
        }
    }
}

/// Identifier the engine hands to the service for every connection it opens
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Failure reported by the service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{function}: {description} (code {code})")]
pub struct CnvError {
    pub function: &'static str,
    pub code: i32,
    pub description: String,
}

impl CnvError {
    pub fn new(function: &'static str, code: i32, description: impl Into<String>) -> Self {
        CnvError {
            function,
            code,
            description: description.into(),
        }
    }
}

/// Connection details as the service sees them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub status: ConnectionStatus,
    pub error: Option<CnvError>,
    /// Items held and capacity of the client-side buffer, for buffered connections
    pub buffer: Option<(usize, usize)>,
}

/// Raw contents of a [`CnvData`]
#[derive(Debug, Clone, PartialEq)]
pub enum CnvPayload {
    Empty,
    /// Fixed-width elements, little-endian, in row-major order
    Buffer(Vec<u8>),
    Strings(Vec<String>),
    Fields(Vec<CnvData>),
}

/// A typed value as delivered by, or handed to, the service
#[derive(Debug, Clone, PartialEq)]
pub struct CnvData {
    pub data_type: CnvDataType,
    /// Empty for scalars
    pub dimensions: Vec<usize>,
    pub payload: CnvPayload,
    pub quality: DataQuality,
    pub timestamp: Option<SystemTime>,
    pub server_error: u32,
}

/// Fixed-width element types that can be carried in a flat buffer
pub trait CnvElement: Copy {
    const DATA_TYPE: CnvDataType;
    fn put_le(&self, buffer: &mut Vec<u8>);
}

macro_rules! impl_cnv_element {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl CnvElement for $t {
                const DATA_TYPE: CnvDataType = CnvDataType::$variant;
                fn put_le(&self, buffer: &mut Vec<u8>) {
                    buffer.extend_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_cnv_element!(
    f32 => Single,
    f64 => Double,
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
);

impl CnvElement for bool {
    const DATA_TYPE: CnvDataType = CnvDataType::Bool;
    fn put_le(&self, buffer: &mut Vec<u8>) {
        buffer.push(u8::from(*self));
    }
}

impl CnvData {
    fn with_payload(data_type: CnvDataType, dimensions: Vec<usize>, payload: CnvPayload) -> Self {
        CnvData {
            data_type,
            dimensions,
            payload,
            quality: DataQuality::empty(),
            timestamp: None,
            server_error: 0,
        }
    }

    pub fn empty() -> Self {
        Self::with_payload(CnvDataType::Empty, Vec::new(), CnvPayload::Empty)
    }

    pub fn scalar<T: CnvElement>(value: T) -> Self {
        let mut buffer = Vec::new();
        value.put_le(&mut buffer);
        Self::with_payload(T::DATA_TYPE, Vec::new(), CnvPayload::Buffer(buffer))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::with_payload(
            CnvDataType::String,
            Vec::new(),
            CnvPayload::Strings(vec![value.into()]),
        )
    }

    /// A one-dimensional array
    pub fn array<T: CnvElement>(values: &[T]) -> Self {
        Self::array_with_dimensions(values, vec![values.len()])
    }

    /// An array of any shape. The element count must match the dimension product.
    pub fn array_with_dimensions<T: CnvElement>(values: &[T], dimensions: Vec<usize>) -> Self {
        let mut buffer = Vec::with_capacity(values.len() * size_of::<T>());
        for value in values {
            value.put_le(&mut buffer);
        }
        Self::with_payload(T::DATA_TYPE, dimensions, CnvPayload::Buffer(buffer))
    }

    pub fn string_array(values: Vec<String>) -> Self {
        let dimensions = vec![values.len()];
        Self::with_payload(CnvDataType::String, dimensions, CnvPayload::Strings(values))
    }

    pub fn structure(fields: Vec<CnvData>) -> Self {
        Self::with_payload(CnvDataType::Struct, Vec::new(), CnvPayload::Fields(fields))
    }

    pub fn with_quality(mut self, quality: DataQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_server_error(mut self, error: u32) -> Self {
        self.server_error = error;
        self
    }

    pub fn is_struct(&self) -> bool {
        self.data_type == CnvDataType::Struct
    }

    /// Number of elements implied by the dimensions, `None` if it overflows
    pub fn element_count(&self) -> Option<usize> {
        self.dimensions
            .iter()
            .try_fold(1usize, |total, &d| total.checked_mul(d))
    }

    /// Normalize the value into a scalar, array, structure or empty value
    pub fn decode(&self) -> Result<DecodedValue<'_>, DecodeError> {
        if self.dimensions.len() > MAX_DIMENSIONS {
            return Err(DecodeError::TooManyDimensions(self.dimensions.len()));
        }
        match (self.data_type, &self.payload) {
            (CnvDataType::Empty, _) => Ok(DecodedValue::Empty),
            (CnvDataType::Struct, CnvPayload::Fields(fields)) => {
                if fields.is_empty() {
                    Err(DecodeError::NoFields)
                } else {
                    Ok(DecodedValue::Struct(fields))
                }
            }
            (CnvDataType::String, CnvPayload::Strings(strings)) => {
                if self.dimensions.is_empty() {
                    match strings.as_slice() {
                        [single] => Ok(DecodedValue::Scalar(CnvScalar::String(single.clone()))),
                        _ => Err(DecodeError::ElementCount {
                            expected: 1,
                            actual: strings.len(),
                        }),
                    }
                } else {
                    let expected = self.element_count().ok_or(DecodeError::SizeOverflow)?;
                    if strings.len() != expected {
                        return Err(DecodeError::ElementCount {
                            expected,
                            actual: strings.len(),
                        });
                    }
                    Ok(DecodedValue::Array {
                        dimensions: self.dimensions.clone(),
                        values: CnvArray::String(strings.clone()),
                    })
                }
            }
            (data_type, CnvPayload::Buffer(buffer)) if data_type.element_size().is_some() => {
                let scalar = self.dimensions.is_empty();
                let items = if scalar {
                    1
                } else {
                    self.element_count().ok_or(DecodeError::SizeOverflow)?
                };
                let values = decode_buffer(data_type, items, buffer)?;
                if scalar {
                    values
                        .into_scalar()
                        .map(DecodedValue::Scalar)
                        .ok_or(DecodeError::ElementCount {
                            expected: 1,
                            actual: 0,
                        })
                } else {
                    Ok(DecodedValue::Array {
                        dimensions: self.dimensions.clone(),
                        values,
                    })
                }
            }
            (data_type, _) => Err(DecodeError::PayloadMismatch(data_type)),
        }
    }
}

fn decode_buffer(
    data_type: CnvDataType,
    items: usize,
    data: &[u8],
) -> Result<CnvArray, DecodeError> {
    let size = data_type
        .element_size()
        .ok_or(DecodeError::PayloadMismatch(data_type))?;
    let expected = items.checked_mul(size).ok_or(DecodeError::SizeOverflow)?;
    if data.len() != expected {
        return Err(DecodeError::BufferLength {
            expected,
            actual: data.len(),
        });
    }
    macro_rules! parse_all {
        ($parser:expr, $variant:ident) => {
            all_consuming(count($parser, items))
                .parse(data)
                .finish()
                .map(|(_, v)| CnvArray::$variant(v))
                .map_err(|_: nom::error::Error<&[u8]>| DecodeError::BufferLength {
                    expected,
                    actual: data.len(),
                })
        };
    }
    match data_type {
        CnvDataType::Bool => parse_all!(map(le_u8, |b| b != 0), Bool),
        CnvDataType::Single => parse_all!(le_f32, Single),
        CnvDataType::Double => parse_all!(le_f64, Double),
        CnvDataType::Int8 => parse_all!(le_i8, Int8),
        CnvDataType::UInt8 => parse_all!(le_u8, UInt8),
        CnvDataType::Int16 => parse_all!(le_i16, Int16),
        CnvDataType::UInt16 => parse_all!(le_u16, UInt16),
        CnvDataType::Int32 => parse_all!(le_i32, Int32),
        CnvDataType::UInt32 => parse_all!(le_u32, UInt32),
        CnvDataType::Int64 => parse_all!(le_i64, Int64),
        CnvDataType::UInt64 => parse_all!(le_u64, UInt64),
        other => Err(DecodeError::PayloadMismatch(other)),
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{0} dimensions exceeds the maximum of {MAX_DIMENSIONS}")]
    TooManyDimensions(usize),
    #[error("Dimensions describe more elements than can be addressed")]
    SizeOverflow,
    #[error("Buffer holds {actual} bytes but {expected} were expected")]
    BufferLength { expected: usize, actual: usize },
    #[error("Value holds {actual} elements but {expected} were expected")]
    ElementCount { expected: usize, actual: usize },
    #[error("Payload does not match data type {0}")]
    PayloadMismatch(CnvDataType),
    #[error("Structure has no fields")]
    NoFields,
    #[error("Field index {index:?} out of range for a structure of {count} fields")]
    FieldIndex { index: Option<usize>, count: usize },
    #[error("Nested structures are not supported")]
    NestedStruct,
}

/// A decoded single value
#[derive(Debug, Clone, PartialEq)]
pub enum CnvScalar {
    Bool(bool),
    String(String),
    Single(f32),
    Double(f64),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
}

/// Decoded array elements, flattened in row-major order
#[derive(Debug, Clone, PartialEq)]
pub enum CnvArray {
    Bool(Vec<bool>),
    String(Vec<String>),
    Single(Vec<f32>),
    Double(Vec<f64>),
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
}

macro_rules! cnv_array_dispatch {
    ($value:expr, $v:ident => $body:expr) => {
        match $value {
            CnvArray::Bool($v) => $body,
            CnvArray::String($v) => $body,
            CnvArray::Single($v) => $body,
            CnvArray::Double($v) => $body,
            CnvArray::Int8($v) => $body,
            CnvArray::UInt8($v) => $body,
            CnvArray::Int16($v) => $body,
            CnvArray::UInt16($v) => $body,
            CnvArray::Int32($v) => $body,
            CnvArray::UInt32($v) => $body,
            CnvArray::Int64($v) => $body,
            CnvArray::UInt64($v) => $body,
        }
    };
}

impl CnvArray {
    pub fn len(&self) -> usize {
        cnv_array_dispatch!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> CnvDataType {
        match self {
            CnvArray::Bool(_) => CnvDataType::Bool,
            CnvArray::String(_) => CnvDataType::String,
            CnvArray::Single(_) => CnvDataType::Single,
            CnvArray::Double(_) => CnvDataType::Double,
            CnvArray::Int8(_) => CnvDataType::Int8,
            CnvArray::UInt8(_) => CnvDataType::UInt8,
            CnvArray::Int16(_) => CnvDataType::Int16,
            CnvArray::UInt16(_) => CnvDataType::UInt16,
            CnvArray::Int32(_) => CnvDataType::Int32,
            CnvArray::UInt32(_) => CnvDataType::UInt32,
            CnvArray::Int64(_) => CnvDataType::Int64,
            CnvArray::UInt64(_) => CnvDataType::UInt64,
        }
    }

    fn into_scalar(self) -> Option<CnvScalar> {
        Some(match self {
            CnvArray::Bool(v) => CnvScalar::Bool(*v.first()?),
            CnvArray::String(mut v) => CnvScalar::String(v.pop()?),
            CnvArray::Single(v) => CnvScalar::Single(*v.first()?),
            CnvArray::Double(v) => CnvScalar::Double(*v.first()?),
            CnvArray::Int8(v) => CnvScalar::Int8(*v.first()?),
            CnvArray::UInt8(v) => CnvScalar::UInt8(*v.first()?),
            CnvArray::Int16(v) => CnvScalar::Int16(*v.first()?),
            CnvArray::UInt16(v) => CnvScalar::UInt16(*v.first()?),
            CnvArray::Int32(v) => CnvScalar::Int32(*v.first()?),
            CnvArray::UInt32(v) => CnvScalar::UInt32(*v.first()?),
            CnvArray::Int64(v) => CnvScalar::Int64(*v.first()?),
            CnvArray::UInt64(v) => CnvScalar::UInt64(*v.first()?),
        })
    }
}

/// A [`CnvData`] normalized into its shape
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue<'a> {
    Empty,
    Scalar(CnvScalar),
    Array {
        dimensions: Vec<usize>,
        values: CnvArray,
    },
    Struct(&'a [CnvData]),
}
