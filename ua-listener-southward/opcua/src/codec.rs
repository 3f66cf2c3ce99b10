use crate::status::StatusCode;
use chrono::{
    format::{Item, StrftimeItems},
    DateTime, SecondsFormat, Utc,
};
use std::fmt::Write as _;
use ua_listener_sdk::{FieldValue, ListenerError, ListenerResult};

/// Decoded value of a data-change notification.
///
/// Transport-neutral mirror of the OPC UA built-in types that can appear
/// in a monitored value.
#[derive(Debug, Clone, PartialEq)]
pub enum UaValue {
    Null,
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Guid(String),
    ByteString(Vec<u8>),
    StatusCode(StatusCode),
    Array(Vec<UaValue>),
    /// Any other built-in type, carrying its type name
    Unsupported(&'static str),
}

impl UaValue {
    /// OPC UA built-in type name, as reported in the `DataType` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            UaValue::Null => "Null",
            UaValue::Boolean(_) => "Boolean",
            UaValue::SByte(_) => "SByte",
            UaValue::Byte(_) => "Byte",
            UaValue::Int16(_) => "Int16",
            UaValue::UInt16(_) => "UInt16",
            UaValue::Int32(_) => "Int32",
            UaValue::UInt32(_) => "UInt32",
            UaValue::Int64(_) => "Int64",
            UaValue::UInt64(_) => "UInt64",
            UaValue::Float(_) => "Float",
            UaValue::Double(_) => "Double",
            UaValue::String(_) => "String",
            UaValue::DateTime(_) => "DateTime",
            UaValue::Guid(_) => "Guid",
            UaValue::ByteString(_) => "ByteString",
            UaValue::StatusCode(_) => "StatusCode",
            UaValue::Array(_) => "Array",
            UaValue::Unsupported(name) => *name,
        }
    }
}

/// Converts decoded values into metric fields.
#[derive(Debug, Clone, Default)]
pub struct ValueCodec {
    /// chrono strftime pattern; empty renders RFC 3339
    timestamp_format: String,
}

impl ValueCodec {
    /// Fails when `timestamp_format` contains an invalid strftime specifier.
    pub fn new(timestamp_format: impl Into<String>) -> ListenerResult<Self> {
        let timestamp_format = timestamp_format.into();
        if StrftimeItems::new(&timestamp_format).any(|item| matches!(item, Item::Error)) {
            return Err(ListenerError::ConfigurationError(format!(
                "invalid timestamp_format '{timestamp_format}'"
            )));
        }
        Ok(Self { timestamp_format })
    }

    /// Render a DateTime the way it appears in a string field.
    pub fn format_datetime(&self, dt: &DateTime<Utc>) -> String {
        if self.timestamp_format.is_empty() {
            dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        } else {
            dt.format(&self.timestamp_format).to_string()
        }
    }

    /// Field value for `value`, or `None` when the value has no scalar
    /// representation (null, arrays, unsupported types).
    pub fn to_field(&self, value: &UaValue) -> Option<FieldValue> {
        let field = match value {
            UaValue::Null | UaValue::Array(_) | UaValue::Unsupported(_) => return None,
            UaValue::Boolean(v) => FieldValue::Bool(*v),
            UaValue::SByte(v) => (*v).into(),
            UaValue::Byte(v) => (*v).into(),
            UaValue::Int16(v) => (*v).into(),
            UaValue::UInt16(v) => (*v).into(),
            UaValue::Int32(v) => (*v).into(),
            UaValue::UInt32(v) => (*v).into(),
            UaValue::Int64(v) => (*v).into(),
            UaValue::UInt64(v) => (*v).into(),
            UaValue::Float(v) => (*v).into(),
            UaValue::Double(v) => (*v).into(),
            UaValue::String(v) => FieldValue::String(v.clone()),
            UaValue::DateTime(dt) => FieldValue::String(self.format_datetime(dt)),
            UaValue::Guid(v) => FieldValue::String(v.clone()),
            UaValue::ByteString(bytes) => FieldValue::String(hex(bytes)),
            UaValue::StatusCode(code) => FieldValue::UInt(code.bits() as u64),
        };
        Some(field)
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
