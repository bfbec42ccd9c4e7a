//! Conversion between service values and parameter store values.
//!
//! The parameter store only knows about a handful of local types: 64-bit floats,
//! 32-bit integers, strings and arrays of `f64`/`f32`/`i32`/`i16`/`i8`. Values coming
//! from the service are converted to these with two different rules:
//!
//! - Scalars are converted numerically (the equivalent of an `as` cast), with the one
//!   exception that strings never convert to or from numbers.
//! - Arrays are only ever reinterpreted, never converted element by element. An array
//!   is accepted when its element type has the same width and kind as the requested
//!   local type, ignoring signedness, so a `u16` array lands in an `i16` parameter with
//!   its bits unchanged but an `f32` array never lands in an `f64` parameter.

use crate::cnv::{CnvArray, CnvData, CnvDataType, CnvScalar};
use num::cast::AsPrimitive;
use std::{any::Any, fmt};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Cannot convert a string value to a number")]
    StringToNumber,
    #[error("Cannot convert a numeric {0} value to a string")]
    NumberToString(CnvDataType),
    #[error("Cannot reinterpret a {from} array as {to}")]
    ArrayTypeMismatch { from: CnvDataType, to: ArrayKind },
    #[error("Timestamp must be a pair of 64-bit integers, got {0}")]
    TimestampShape(String),
    #[error("Timestamp of {0} seconds is out of range")]
    TimestampRange(u64),
    #[error("Type '{declared}' cannot hold a {value} value")]
    UnsupportedType { declared: String, value: String },
}

/// Element types the parameter store can hold arrays of
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    Float64,
    Float32,
    Int32,
    Int16,
    Int8,
}

impl fmt::Display for ArrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArrayKind::Float64 => "float64",
            ArrayKind::Float32 => "float32",
            ArrayKind::Int32 => "int32",
            ArrayKind::Int16 => "int16",
            ArrayKind::Int8 => "int8",
        })
    }
}

/// An array held by the parameter store
#[derive(Debug, Clone, PartialEq)]
pub enum LocalArray {
    Float64(Vec<f64>),
    Float32(Vec<f32>),
    Int32(Vec<i32>),
    Int16(Vec<i16>),
    Int8(Vec<i8>),
}

impl LocalArray {
    pub fn kind(&self) -> ArrayKind {
        match self {
            LocalArray::Float64(_) => ArrayKind::Float64,
            LocalArray::Float32(_) => ArrayKind::Float32,
            LocalArray::Int32(_) => ArrayKind::Int32,
            LocalArray::Int16(_) => ArrayKind::Int16,
            LocalArray::Int8(_) => ArrayKind::Int8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            LocalArray::Float64(v) => v.len(),
            LocalArray::Float32(v) => v.len(),
            LocalArray::Int32(v) => v.len(),
            LocalArray::Int16(v) => v.len(),
            LocalArray::Int8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Native-endian bytes of the elements, as cached per binding
    pub fn to_ne_bytes(&self) -> Vec<u8> {
        fn flatten<T: ArrayElement>(values: &[T]) -> Vec<u8> {
            let mut bytes = Vec::with_capacity(values.len() * size_of::<T>());
            for v in values {
                v.put_ne(&mut bytes);
            }
            bytes
        }
        match self {
            LocalArray::Float64(v) => flatten(v),
            LocalArray::Float32(v) => flatten(v),
            LocalArray::Int32(v) => flatten(v),
            LocalArray::Int16(v) => flatten(v),
            LocalArray::Int8(v) => flatten(v),
        }
    }

    /// Encode as a one-dimensional service array
    pub fn to_cnv(&self) -> CnvData {
        match self {
            LocalArray::Float64(v) => CnvData::array(v),
            LocalArray::Float32(v) => CnvData::array(v),
            LocalArray::Int32(v) => CnvData::array(v),
            LocalArray::Int16(v) => CnvData::array(v),
            LocalArray::Int8(v) => CnvData::array(v),
        }
    }
}

/// Element types of [`LocalArray`]
pub trait ArrayElement: Copy + Default + fmt::Debug + Send + 'static {
    const KIND: ArrayKind;
    /// Name of the write operation, for error reporting
    const WRITE_FUNCTION: &'static str;
    /// Name of the read operation, for error reporting
    const READ_FUNCTION: &'static str;

    fn put_ne(&self, bytes: &mut Vec<u8>);
    fn from_ne_chunk(chunk: &[u8]) -> Self;
    fn into_local(values: Vec<Self>) -> LocalArray;
}

macro_rules! impl_array_element {
    ($t:ty, $kind:ident, $write:literal, $read:literal) => {
        impl ArrayElement for $t {
            const KIND: ArrayKind = ArrayKind::$kind;
            const WRITE_FUNCTION: &'static str = $write;
            const READ_FUNCTION: &'static str = $read;

            fn put_ne(&self, bytes: &mut Vec<u8>) {
                bytes.extend_from_slice(&self.to_ne_bytes());
            }
            fn from_ne_chunk(chunk: &[u8]) -> Self {
                let mut raw = [0u8; size_of::<$t>()];
                raw.copy_from_slice(&chunk[..size_of::<$t>()]);
                <$t>::from_ne_bytes(raw)
            }
            fn into_local(values: Vec<Self>) -> LocalArray {
                LocalArray::$kind(values)
            }
        }
    };
}

impl_array_element!(f64, Float64, "writeFloat64Array", "readFloat64Array");
impl_array_element!(f32, Float32, "writeFloat32Array", "readFloat32Array");
impl_array_element!(i32, Int32, "writeInt32Array", "readInt32Array");
impl_array_element!(i16, Int16, "writeInt16Array", "readInt16Array");
impl_array_element!(i8, Int8, "writeInt8Array", "readInt8Array");

/// Copy cached native-endian bytes into `out`, returning the number of elements copied
pub fn copy_cached<T: ArrayElement>(cached: &[u8], out: &mut [T]) -> usize {
    let n = (cached.len() / size_of::<T>()).min(out.len());
    for (slot, chunk) in out
        .iter_mut()
        .zip(cached.chunks_exact(size_of::<T>()))
        .take(n)
    {
        *slot = T::from_ne_chunk(chunk);
    }
    n
}

/// Identity of an element type with its signedness ignored.
///
/// Two element types are reinterpretable exactly when their `Canonical` types are the
/// same. `bool` is its own kind and is never folded into the 8-bit integers.
pub trait SignInsensitive: Copy + 'static {
    type Canonical: Copy + 'static;
    fn to_canonical(self) -> Self::Canonical;
}

macro_rules! impl_sign_insensitive {
    ($($t:ty => $canonical:ty),* $(,)?) => {
        $(
            impl SignInsensitive for $t {
                type Canonical = $canonical;
                fn to_canonical(self) -> $canonical {
                    self as $canonical
                }
            }
        )*
    };
}

impl_sign_insensitive!(
    i8 => i8,
    u8 => i8,
    i16 => i16,
    u16 => i16,
    i32 => i32,
    u32 => i32,
    i64 => i64,
    u64 => i64,
    f32 => f32,
    f64 => f64,
);

impl SignInsensitive for bool {
    type Canonical = bool;
    fn to_canonical(self) -> bool {
        self
    }
}

/// Whether `U` elements may be reinterpreted as `T` elements
pub fn reinterpretable<T: 'static, U: SignInsensitive>() -> bool {
    std::any::TypeId::of::<U::Canonical>() == std::any::TypeId::of::<T>()
}

/// Reinterpret `values` as `T`, keeping every bit, if the types are compatible
pub fn reinterpret<T: 'static, U: SignInsensitive>(values: Vec<U>) -> Option<Vec<T>> {
    if !reinterpretable::<T, U>() {
        return None;
    }
    let canonical: Vec<U::Canonical> = values.into_iter().map(U::to_canonical).collect();
    let boxed: Box<dyn Any> = Box::new(canonical);
    boxed.downcast::<Vec<T>>().ok().map(|v| *v)
}

fn reinterpret_as(kind: ArrayKind, values: Vec<impl SignInsensitive>) -> Option<LocalArray> {
    match kind {
        ArrayKind::Float64 => reinterpret(values).map(LocalArray::Float64),
        ArrayKind::Float32 => reinterpret(values).map(LocalArray::Float32),
        ArrayKind::Int32 => reinterpret(values).map(LocalArray::Int32),
        ArrayKind::Int16 => reinterpret(values).map(LocalArray::Int16),
        ArrayKind::Int8 => reinterpret(values).map(LocalArray::Int8),
    }
}

impl CnvArray {
    /// Reinterpret into a store array of the requested kind
    pub fn into_local(self, kind: ArrayKind) -> Result<LocalArray, ConvertError> {
        let from = self.data_type();
        let converted = match self {
            CnvArray::Bool(v) => reinterpret_as(kind, v),
            CnvArray::String(_) => None,
            CnvArray::Single(v) => reinterpret_as(kind, v),
            CnvArray::Double(v) => reinterpret_as(kind, v),
            CnvArray::Int8(v) => reinterpret_as(kind, v),
            CnvArray::UInt8(v) => reinterpret_as(kind, v),
            CnvArray::Int16(v) => reinterpret_as(kind, v),
            CnvArray::UInt16(v) => reinterpret_as(kind, v),
            CnvArray::Int32(v) => reinterpret_as(kind, v),
            CnvArray::UInt32(v) => reinterpret_as(kind, v),
            CnvArray::Int64(v) => reinterpret_as(kind, v),
            CnvArray::UInt64(v) => reinterpret_as(kind, v),
        };
        converted.ok_or(ConvertError::ArrayTypeMismatch { from, to: kind })
    }

    /// The raw 64-bit words of a two element integer array
    pub fn as_timestamp_pair(&self) -> Result<[u64; 2], ConvertError> {
        match self {
            CnvArray::UInt64(v) if v.len() == 2 => Ok([v[0], v[1]]),
            CnvArray::Int64(v) if v.len() == 2 => Ok([v[0] as u64, v[1] as u64]),
            other => Err(ConvertError::TimestampShape(format!(
                "{}[{}]",
                other.data_type(),
                other.len()
            ))),
        }
    }
}

/// Local scalar types a service scalar can be converted into
pub trait FromCnvScalar: Sized {
    fn from_cnv(value: &CnvScalar) -> Result<Self, ConvertError>;
}

macro_rules! impl_from_cnv_numeric {
    ($($t:ty),*) => {
        $(
            impl FromCnvScalar for $t {
                fn from_cnv(value: &CnvScalar) -> Result<Self, ConvertError> {
                    Ok(match value {
                        CnvScalar::Bool(v) => u8::from(*v).as_(),
                        CnvScalar::Single(v) => v.as_(),
                        CnvScalar::Double(v) => v.as_(),
                        CnvScalar::Int8(v) => v.as_(),
                        CnvScalar::UInt8(v) => v.as_(),
                        CnvScalar::Int16(v) => v.as_(),
                        CnvScalar::UInt16(v) => v.as_(),
                        CnvScalar::Int32(v) => v.as_(),
                        CnvScalar::UInt32(v) => v.as_(),
                        CnvScalar::Int64(v) => v.as_(),
                        CnvScalar::UInt64(v) => v.as_(),
                        CnvScalar::String(_) => return Err(ConvertError::StringToNumber),
                    })
                }
            }
        )*
    };
}

impl_from_cnv_numeric!(f64, i32);

impl FromCnvScalar for String {
    fn from_cnv(value: &CnvScalar) -> Result<Self, ConvertError> {
        match value {
            CnvScalar::String(s) => Ok(s.clone()),
            other => Err(ConvertError::NumberToString(other.data_type())),
        }
    }
}

impl CnvScalar {
    pub fn data_type(&self) -> CnvDataType {
        match self {
            CnvScalar::Bool(_) => CnvDataType::Bool,
            CnvScalar::String(_) => CnvDataType::String,
            CnvScalar::Single(_) => CnvDataType::Single,
            CnvScalar::Double(_) => CnvDataType::Double,
            CnvScalar::Int8(_) => CnvDataType::Int8,
            CnvScalar::UInt8(_) => CnvDataType::UInt8,
            CnvScalar::Int16(_) => CnvDataType::Int16,
            CnvScalar::UInt16(_) => CnvDataType::UInt16,
            CnvScalar::Int32(_) => CnvDataType::Int32,
            CnvScalar::UInt32(_) => CnvDataType::UInt32,
            CnvScalar::Int64(_) => CnvDataType::Int64,
            CnvScalar::UInt64(_) => CnvDataType::UInt64,
        }
    }
}

/// A value written by a consumer, before it is handed to the service
#[derive(Debug, Clone, PartialEq)]
pub enum LocalValue {
    Float64(f64),
    Int32(i32),
    String(String),
    Array(LocalArray),
}

impl LocalValue {
    pub fn to_cnv(&self) -> CnvData {
        match self {
            LocalValue::Float64(v) => CnvData::scalar(*v),
            LocalValue::Int32(v) => CnvData::scalar(*v),
            LocalValue::String(v) => CnvData::string(v.as_str()),
            LocalValue::Array(v) => v.to_cnv(),
        }
    }
}

impl fmt::Display for LocalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalValue::Float64(v) => write!(f, "{v:.6}"),
            LocalValue::Int32(v) => write!(f, "{v}"),
            LocalValue::String(v) => f.write_str(v),
            LocalValue::Array(v) => write!(f, "[{} x {}]", v.len(), v.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reinterpret_ignores_sign() {
        let values: Vec<u16> = vec![0xFFFF, 1];
        let local = CnvArray::UInt16(values).into_local(ArrayKind::Int16).unwrap();
        assert_eq!(local, LocalArray::Int16(vec![-1, 1]));

        let local = CnvArray::UInt8(vec![200]).into_local(ArrayKind::Int8).unwrap();
        assert_eq!(local, LocalArray::Int8(vec![200u8 as i8]));
    }

    #[test]
    fn reinterpret_refuses_width_or_kind_changes() {
        assert_eq!(
            CnvArray::Single(vec![1.0]).into_local(ArrayKind::Float64),
            Err(ConvertError::ArrayTypeMismatch {
                from: CnvDataType::Single,
                to: ArrayKind::Float64
            })
        );
        assert!(CnvArray::Int32(vec![1]).into_local(ArrayKind::Int16).is_err());
        assert!(CnvArray::Int32(vec![1]).into_local(ArrayKind::Float32).is_err());
        assert!(CnvArray::Bool(vec![true]).into_local(ArrayKind::Int8).is_err());
        assert!(
            CnvArray::String(vec!["a".into()])
                .into_local(ArrayKind::Int8)
                .is_err()
        );
        assert!(reinterpretable::<i64, u64>());
        assert!(!reinterpretable::<i8, bool>());
    }

    #[test]
    fn scalars_cast_numerically() {
        assert_eq!(f64::from_cnv(&CnvScalar::Int16(-4)), Ok(-4.0));
        assert_eq!(i32::from_cnv(&CnvScalar::Double(2.9)), Ok(2));
        assert_eq!(i32::from_cnv(&CnvScalar::Bool(true)), Ok(1));
        assert_eq!(i32::from_cnv(&CnvScalar::UInt32(u32::MAX)), Ok(-1));
    }

    #[test]
    fn strings_never_convert_to_numbers() {
        assert_eq!(
            f64::from_cnv(&CnvScalar::String("1.0".into())),
            Err(ConvertError::StringToNumber)
        );
        assert_eq!(
            String::from_cnv(&CnvScalar::Int32(1)),
            Err(ConvertError::NumberToString(CnvDataType::Int32))
        );
        assert_eq!(
            String::from_cnv(&CnvScalar::String("abc".into())),
            Ok("abc".to_string())
        );
    }

    #[test]
    fn cached_bytes_round_trip() {
        let array = LocalArray::Int16(vec![1, -2, 3]);
        let bytes = array.to_ne_bytes();
        let mut out = [0i16; 5];
        assert_eq!(copy_cached(&bytes, &mut out), 3);
        assert_eq!(out, [1, -2, 3, 0, 0]);
        let mut short = [0i16; 2];
        assert_eq!(copy_cached(&bytes, &mut short), 2);
        assert_eq!(short, [1, -2]);
    }

    #[test]
    fn timestamp_pair() {
        assert_eq!(
            CnvArray::UInt64(vec![5, 6]).as_timestamp_pair(),
            Ok([5, 6])
        );
        assert!(CnvArray::UInt64(vec![5]).as_timestamp_pair().is_err());
        assert!(CnvArray::Double(vec![5.0, 6.0]).as_timestamp_pair().is_err());
    }
}
