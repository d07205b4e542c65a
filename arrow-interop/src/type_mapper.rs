//! Leaf type mapping between column types and Arrow types.

use arrow_schema::{DataType as ArrowType, TimeUnit};

use crate::column::{DataType, TypeId};
use crate::error::{InteropError, Result};

/// Arrow precision recorded for each decimal storage width. All decimals are
/// exported as 128-bit values.
pub const DECIMAL32_PRECISION: u8 = 9;
pub const DECIMAL64_PRECISION: u8 = 18;
pub const DECIMAL128_PRECISION: u8 = 38;

/// Map a leaf column type to its Arrow type.
///
/// Nested types are built by the schema builder and rejected here.
pub fn to_arrow_type(dtype: &DataType) -> Result<ArrowType> {
    let arrow = match dtype.id() {
        TypeId::Empty => ArrowType::Null,
        TypeId::Int8 => ArrowType::Int8,
        TypeId::Int16 => ArrowType::Int16,
        TypeId::Int32 => ArrowType::Int32,
        TypeId::Int64 => ArrowType::Int64,
        TypeId::UInt8 => ArrowType::UInt8,
        TypeId::UInt16 => ArrowType::UInt16,
        TypeId::UInt32 => ArrowType::UInt32,
        TypeId::UInt64 => ArrowType::UInt64,
        TypeId::Float32 => ArrowType::Float32,
        TypeId::Float64 => ArrowType::Float64,
        TypeId::Bool8 => ArrowType::Boolean,
        TypeId::String => ArrowType::Utf8,
        TypeId::TimestampDays => ArrowType::Date32,
        TypeId::TimestampSeconds => ArrowType::Timestamp(TimeUnit::Second, None),
        TypeId::TimestampMilliseconds => ArrowType::Timestamp(TimeUnit::Millisecond, None),
        TypeId::TimestampMicroseconds => ArrowType::Timestamp(TimeUnit::Microsecond, None),
        TypeId::TimestampNanoseconds => ArrowType::Timestamp(TimeUnit::Nanosecond, None),
        TypeId::DurationSeconds => ArrowType::Duration(TimeUnit::Second),
        TypeId::DurationMilliseconds => ArrowType::Duration(TimeUnit::Millisecond),
        TypeId::DurationMicroseconds => ArrowType::Duration(TimeUnit::Microsecond),
        TypeId::DurationNanoseconds => ArrowType::Duration(TimeUnit::Nanosecond),
        TypeId::Decimal32 => ArrowType::Decimal128(DECIMAL32_PRECISION, arrow_scale(dtype)?),
        TypeId::Decimal64 => ArrowType::Decimal128(DECIMAL64_PRECISION, arrow_scale(dtype)?),
        TypeId::Decimal128 => ArrowType::Decimal128(DECIMAL128_PRECISION, arrow_scale(dtype)?),
        TypeId::DurationDays => {
            return Err(InteropError::UnsupportedType(
                "duration in days has no Arrow equivalent".into(),
            ))
        }
        id @ (TypeId::List | TypeId::Struct | TypeId::Dictionary32) => {
            return Err(InteropError::UnsupportedType(format!(
                "{:?} is nested, not a leaf type",
                id
            )))
        }
    };
    Ok(arrow)
}

/// Arrow counts fractional digits where the column scale is an exponent.
fn arrow_scale(dtype: &DataType) -> Result<i8> {
    dtype
        .scale()
        .checked_neg()
        .and_then(|s| i8::try_from(s).ok())
        .ok_or_else(|| {
            InteropError::UnsupportedType(format!(
                "decimal scale {} does not fit an Arrow scale",
                dtype.scale()
            ))
        })
}

/// Inverse of [`to_arrow_type`] for leaf types. Decimal storage width is
/// recovered from the recorded precision.
pub fn from_arrow_type(arrow: &ArrowType) -> Result<DataType> {
    let id = match arrow {
        ArrowType::Null => TypeId::Empty,
        ArrowType::Int8 => TypeId::Int8,
        ArrowType::Int16 => TypeId::Int16,
        ArrowType::Int32 => TypeId::Int32,
        ArrowType::Int64 => TypeId::Int64,
        ArrowType::UInt8 => TypeId::UInt8,
        ArrowType::UInt16 => TypeId::UInt16,
        ArrowType::UInt32 => TypeId::UInt32,
        ArrowType::UInt64 => TypeId::UInt64,
        ArrowType::Float32 => TypeId::Float32,
        ArrowType::Float64 => TypeId::Float64,
        ArrowType::Boolean => TypeId::Bool8,
        ArrowType::Utf8 => TypeId::String,
        ArrowType::Date32 => TypeId::TimestampDays,
        ArrowType::Timestamp(unit, None) => match unit {
            TimeUnit::Second => TypeId::TimestampSeconds,
            TimeUnit::Millisecond => TypeId::TimestampMilliseconds,
            TimeUnit::Microsecond => TypeId::TimestampMicroseconds,
            TimeUnit::Nanosecond => TypeId::TimestampNanoseconds,
        },
        ArrowType::Duration(unit) => match unit {
            TimeUnit::Second => TypeId::DurationSeconds,
            TimeUnit::Millisecond => TypeId::DurationMilliseconds,
            TimeUnit::Microsecond => TypeId::DurationMicroseconds,
            TimeUnit::Nanosecond => TypeId::DurationNanoseconds,
        },
        ArrowType::Decimal128(precision, scale) => {
            let id = match *precision {
                DECIMAL32_PRECISION => TypeId::Decimal32,
                DECIMAL64_PRECISION => TypeId::Decimal64,
                _ => TypeId::Decimal128,
            };
            return Ok(DataType::decimal(id, -(*scale as i32)));
        }
        ArrowType::List(_) => TypeId::List,
        ArrowType::Struct(_) => TypeId::Struct,
        ArrowType::Dictionary(_, _) => TypeId::Dictionary32,
        other => {
            return Err(InteropError::UnsupportedType(format!(
                "Arrow type {} has no column equivalent",
                other
            )))
        }
    };
    Ok(DataType::new(id))
}
