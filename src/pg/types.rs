//! PostgreSQL type identifiers and value encoding/decoding.
//!
//! Values travel either in text or binary format; the format is chosen per
//! parameter and per result column at bind time.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use super::error::{PgError, PgResult};
use super::escape;
use super::protocol::Format;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL object identifier.
///
/// Used for column/parameter types and for large objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub u32);

impl Oid {
    /// Let the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // OID type
    pub const OID_TYPE: Oid = Oid(26);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    pub const UNKNOWN: Oid = Oid(705);

    // Money
    pub const MONEY: Oid = Oid(790);

    // String types
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);

    // UUID
    pub const UUID: Oid = Oid(2950);

    // JSON types
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);

    // Numeric
    pub const NUMERIC: Oid = Oid(1700);

    pub const VOID: Oid = Oid(2278);

    /// Create from the raw wire value
    #[inline]
    pub fn from_u32(oid: u32) -> Self {
        Oid(oid)
    }

    /// Get the raw wire value
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID_TYPE)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Oid(Oid),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    // Binary date/time values: microseconds since 2000-01-01 / days since 2000-01-01
    Timestamp(i64),
    Date(i32),
    Time(i64),
    // For types we don't handle specially - store raw bytes
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Borrow the value as a string if it is textual.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Encode this value to binary format.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            PgValue::Null => vec![],
            PgValue::Bool(v) => vec![u8::from(*v)],
            PgValue::Int2(v) => v.to_be_bytes().to_vec(),
            PgValue::Int4(v) => v.to_be_bytes().to_vec(),
            PgValue::Int8(v) => v.to_be_bytes().to_vec(),
            PgValue::Oid(v) => v.0.to_be_bytes().to_vec(),
            PgValue::Float4(v) => v.to_be_bytes().to_vec(),
            PgValue::Float8(v) => v.to_be_bytes().to_vec(),
            PgValue::Text(v) => v.as_bytes().to_vec(),
            PgValue::Bytea(v) => v.clone(),
            PgValue::Timestamp(v) => v.to_be_bytes().to_vec(),
            PgValue::Date(v) => v.to_be_bytes().to_vec(),
            PgValue::Time(v) => v.to_be_bytes().to_vec(),
            PgValue::Raw { data, .. } => data.clone(),
        }
    }

    /// Encode this value to text format.
    pub fn encode_text(&self) -> Vec<u8> {
        match self {
            PgValue::Null => vec![],
            PgValue::Bool(v) => if *v { b"t".to_vec() } else { b"f".to_vec() },
            PgValue::Int2(v) => v.to_string().into_bytes(),
            PgValue::Int4(v) => v.to_string().into_bytes(),
            PgValue::Int8(v) => v.to_string().into_bytes(),
            PgValue::Oid(v) => v.0.to_string().into_bytes(),
            PgValue::Float4(v) => float_text(f64::from(*v)).into_bytes(),
            PgValue::Float8(v) => float_text(*v).into_bytes(),
            PgValue::Text(v) => v.as_bytes().to_vec(),
            PgValue::Bytea(v) => escape::hex_bytea(v).into_bytes(),
            // No calendar support: these only ever come from binary results
            PgValue::Timestamp(v) | PgValue::Time(v) => v.to_string().into_bytes(),
            PgValue::Date(v) => v.to_string().into_bytes(),
            PgValue::Raw { data, .. } => data.clone(),
        }
    }

    /// Encode as a Bind parameter: (format, bytes or None for NULL).
    ///
    /// Byte arrays go binary so they never need escaping. Date/time values
    /// hold raw epoch offsets, which only the binary input functions accept.
    /// Everything else goes as text and is parsed against the inferred type.
    pub fn to_param(&self) -> (Format, Option<Vec<u8>>) {
        match self {
            PgValue::Null => (Format::Text, None),
            PgValue::Bytea(_)
            | PgValue::Raw { .. }
            | PgValue::Timestamp(_)
            | PgValue::Date(_)
            | PgValue::Time(_) => (Format::Binary, Some(self.encode_binary())),
            _ => (Format::Text, Some(self.encode_text())),
        }
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNKNOWN,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Oid(_) => Oid::OID_TYPE,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Parameter type sent in Parse. NULL and text let the server decide.
    pub fn param_type(&self) -> Oid {
        match self {
            PgValue::Null | PgValue::Text(_) => Oid::UNSPECIFIED,
            other => other.type_oid(),
        }
    }

    /// Decode a value in the given wire format.
    pub fn decode(oid: Oid, format: Format, data: &[u8]) -> PgResult<Self> {
        match format {
            Format::Text => Self::decode_text(oid, data),
            Format::Binary => Self::decode_binary(oid, data),
        }
    }

    /// Decode a value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<Self> {
        match oid {
            Oid::BOOL => {
                if data.is_empty() {
                    return Err(PgError::Type("Empty data for BOOL".to_string()));
                }
                Ok(PgValue::Bool(data[0] != 0))
            }

            Oid::INT2 => Ok(PgValue::Int2(i16::from_be_bytes(fixed(data, "INT2")?))),
            Oid::INT4 => Ok(PgValue::Int4(i32::from_be_bytes(fixed(data, "INT4")?))),
            Oid::INT8 => Ok(PgValue::Int8(i64::from_be_bytes(fixed(data, "INT8")?))),
            Oid::OID_TYPE => Ok(PgValue::Oid(Oid(u32::from_be_bytes(fixed(data, "OID")?)))),
            Oid::FLOAT4 => Ok(PgValue::Float4(f32::from_be_bytes(fixed(data, "FLOAT4")?))),
            Oid::FLOAT8 => Ok(PgValue::Float8(f64::from_be_bytes(fixed(data, "FLOAT8")?))),

            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN => {
                String::from_utf8(data.to_vec())
                    .map(PgValue::Text)
                    .map_err(|e| PgError::Type(format!("Invalid UTF-8 in TEXT: {}", e)))
            }

            Oid::BYTEA => Ok(PgValue::Bytea(data.to_vec())),

            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => Ok(PgValue::Timestamp(i64::from_be_bytes(
                fixed(data, "TIMESTAMP")?,
            ))),

            Oid::DATE => Ok(PgValue::Date(i32::from_be_bytes(fixed(data, "DATE")?))),

            Oid::TIME | Oid::TIMETZ => {
                if data.len() < 8 {
                    return Err(PgError::Type(format!(
                        "Invalid TIME length: {}",
                        data.len()
                    )));
                }
                Ok(PgValue::Time(i64::from_be_bytes(fixed(&data[..8], "TIME")?)))
            }

            // For unknown types, store raw bytes
            _ => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode from text format (the default result format)
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        if oid == Oid::BYTEA {
            return Ok(PgValue::Bytea(escape::unescape_bytea(data)));
        }

        let text = String::from_utf8(data.to_vec())
            .map_err(|e| PgError::Type(format!("Invalid UTF-8 in text value: {}", e)))?;

        match oid {
            Oid::BOOL => Ok(PgValue::Bool(text == "t" || text == "true")),

            Oid::INT2 => text
                .parse::<i16>()
                .map(PgValue::Int2)
                .map_err(|e| PgError::Type(format!("Invalid INT2: {}", e))),

            Oid::INT4 => text
                .parse::<i32>()
                .map(PgValue::Int4)
                .map_err(|e| PgError::Type(format!("Invalid INT4: {}", e))),

            Oid::INT8 => text
                .parse::<i64>()
                .map(PgValue::Int8)
                .map_err(|e| PgError::Type(format!("Invalid INT8: {}", e))),

            Oid::OID_TYPE => text
                .parse::<u32>()
                .map(|v| PgValue::Oid(Oid(v)))
                .map_err(|e| PgError::Type(format!("Invalid OID: {}", e))),

            Oid::FLOAT4 => parse_float(&text)
                .map(|v| PgValue::Float4(v as f32))
                .ok_or_else(|| PgError::Type(format!("Invalid FLOAT4: {}", text))),

            Oid::FLOAT8 => parse_float(&text)
                .map(PgValue::Float8)
                .ok_or_else(|| PgError::Type(format!("Invalid FLOAT8: {}", text))),

            // Everything else (numeric, money, dates, json, ...) stays textual
            _ => Ok(PgValue::Text(text)),
        }
    }
}

fn fixed<const N: usize>(data: &[u8], name: &str) -> PgResult<[u8; N]> {
    data.try_into()
        .map_err(|_| PgError::Type(format!("Invalid {} length: {}", name, data.len())))
}

/// Text form accepted by the float input functions.
fn float_text(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        v.to_string()
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => text.parse().ok(),
    }
}
