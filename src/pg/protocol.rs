//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// SSLRequest code, sent in place of a protocol version
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// CancelRequest code, sent in place of a protocol version
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Largest backend frame accepted (length field included)
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Most parameters, parameter types or function arguments one message carries
pub const MAX_PARAMS: usize = u16::MAX as usize;

/// Largest frontend frame the Int32 length word can describe
pub const MAX_FRONTEND_LEN: usize = i32::MAX as usize;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i16)]
pub enum Format {
    #[default]
    Text = 0,
    Binary = 1,
}

impl Format {
    fn from_code(code: i16) -> Self {
        if code == 0 {
            Format::Text
        } else {
            Format::Binary
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
    /// Connection is closed or no ReadyForQuery has been seen
    Unknown,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Unknown,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;

    /// Reject contents the message's count fields cannot describe.
    fn validate(&self) -> PgResult<()> {
        Ok(())
    }
}

fn check_count(what: &str, count: usize) -> PgResult<()> {
    if count > MAX_PARAMS {
        return Err(PgError::Resource(format!(
            "too many {}: {} (at most {})",
            what, count, MAX_PARAMS
        )));
    }
    Ok(())
}

/// Encode a message, refusing any that would not fit the protocol's fields.
pub fn encode_checked<M: FrontendMessage + ?Sized>(msg: &M) -> PgResult<BytesMut> {
    msg.validate()?;
    let buf = msg.encode();
    // Tag byte excluded; untagged messages are a few bytes long
    if buf.len().saturating_sub(1) > MAX_FRONTEND_LEN {
        return Err(PgError::Resource(format!(
            "message too large: {} bytes (at most {})",
            buf.len(),
            MAX_FRONTEND_LEN
        )));
    }
    Ok(buf)
}

/// Write `tag`, a length placeholder, the body, then patch the length.
fn framed(tag: u8, body: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(tag);
    buf.put_i32(0);
    body(&mut buf);
    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Write a parameter or argument value: -1 length for NULL.
fn put_value(buf: &mut BytesMut, value: &Option<Vec<u8>>) {
    match value {
        None => buf.put_i32(-1),
        Some(data) => {
            buf.put_i32(data.len() as i32);
            buf.put_slice(data);
        }
    }
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();

        // Placeholder for length (will be filled in at the end)
        buf.put_i32(0);

        // Protocol version
        buf.put_i32(PROTOCOL_VERSION);

        // Parameters
        put_cstring(&mut buf, "user");
        put_cstring(&mut buf, &self.user);

        if let Some(ref db) = self.database {
            put_cstring(&mut buf, "database");
            put_cstring(&mut buf, db);
        }

        for (key, value) in &self.options {
            put_cstring(&mut buf, key);
            put_cstring(&mut buf, value);
        }

        // Terminator
        buf.put_u8(0);

        // Fill in length (includes length field itself)
        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());

        buf
    }
}

/// SSLRequest, answered by a single 'S' or 'N' byte
#[derive(Debug, Clone, Copy)]
pub struct SslRequest;

impl FrontendMessage for SslRequest {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
        buf
    }
}

/// CancelRequest, sent on a fresh connection with the target's key data
#[derive(Debug, Clone, Copy)]
pub struct CancelRequest {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequest {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
        buf
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        framed(b'p', |buf| put_cstring(buf, &self.password))
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self) -> BytesMut {
        framed(b'Q', |buf| put_cstring(buf, &self.query))
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self) -> BytesMut {
        framed(b'P', |body| {
            put_cstring(body, &self.name);
            put_cstring(body, &self.query);

            body.put_u16(self.param_types.len() as u16);
            for oid in &self.param_types {
                body.put_u32(oid.as_u32());
            }
        })
    }

    fn validate(&self) -> PgResult<()> {
        check_count("parameter types", self.param_types.len())
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement
#[derive(Debug, Clone)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<Format>,
    /// Encoded parameter values; `None` is SQL NULL.
    pub params: Vec<Option<Vec<u8>>>,
    pub result_formats: Vec<Format>,
}

impl FrontendMessage for BindMessage {
    fn encode(&self) -> BytesMut {
        framed(b'B', |body| {
            put_cstring(body, &self.portal);
            put_cstring(body, &self.statement);

            body.put_u16(self.param_formats.len() as u16);
            for fmt in &self.param_formats {
                body.put_i16(*fmt as i16);
            }

            body.put_u16(self.params.len() as u16);
            for param in &self.params {
                put_value(body, param);
            }

            body.put_u16(self.result_formats.len() as u16);
            for fmt in &self.result_formats {
                body.put_i16(*fmt as i16);
            }
        })
    }

    fn validate(&self) -> PgResult<()> {
        check_count("parameter formats", self.param_formats.len())?;
        check_count("parameters", self.params.len())?;
        check_count("result formats", self.result_formats.len())
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage {
    fn encode(&self) -> BytesMut {
        framed(b'E', |body| {
            put_cstring(body, &self.portal);
            // 0 = no limit
            body.put_i32(self.max_rows);
        })
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    fn encode(&self) -> BytesMut {
        framed(b'D', |body| {
            body.put_u8(self.kind);
            put_cstring(body, &self.name);
        })
    }
}

/// Close message ('C') - Release a statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for CloseMessage {
    fn encode(&self) -> BytesMut {
        framed(b'C', |body| {
            body.put_u8(self.kind);
            put_cstring(body, &self.name);
        })
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        framed(b'S', |_| {})
    }
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode(&self) -> BytesMut {
        framed(b'H', |_| {})
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        framed(b'X', |_| {})
    }
}

/// CopyData message ('d') - One chunk of COPY FROM STDIN data
#[derive(Debug, Clone)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn encode(&self) -> BytesMut {
        framed(b'd', |body| body.put_slice(self.data))
    }
}

/// CopyDone message ('c') - End of COPY FROM STDIN data
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn encode(&self) -> BytesMut {
        framed(b'c', |_| {})
    }
}

/// CopyFail message ('f') - Abort COPY FROM STDIN with an error message
#[derive(Debug, Clone)]
pub struct CopyFailMessage {
    pub message: String,
}

impl FrontendMessage for CopyFailMessage {
    fn encode(&self) -> BytesMut {
        framed(b'f', |body| put_cstring(body, &self.message))
    }
}

/// FunctionCall message ('F') - Fast-path function call
///
/// Arguments and the result are always exchanged in binary format.
#[derive(Debug, Clone)]
pub struct FunctionCallMessage {
    pub function: Oid,
    pub args: Vec<Option<Vec<u8>>>,
}

impl FrontendMessage for FunctionCallMessage {
    fn encode(&self) -> BytesMut {
        framed(b'F', |body| {
            body.put_u32(self.function.as_u32());

            // One format code applying to every argument
            body.put_i16(1);
            body.put_i16(Format::Binary as i16);

            body.put_u16(self.args.len() as u16);
            for arg in &self.args {
                put_value(body, arg);
            }

            body.put_i16(Format::Binary as i16);
        })
    }

    fn validate(&self) -> PgResult<()> {
        check_count("function arguments", self.args.len())
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        framed(b'p', |body| {
            put_cstring(body, &self.mechanism);
            body.put_i32(self.data.len() as i32);
            body.put_slice(&self.data);
        })
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    /// SASL response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        framed(b'p', |body| body.put_slice(&self.data))
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: Oid,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },
    /// Kerberos, SCM, GSS or SSPI: recognised but not implemented
    AuthenticationUnsupported {
        code: i32,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    // COPY sub-protocol
    CopyInResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyOutResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyBothResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyData {
        data: Bytes,
    },
    CopyDone,

    // Function call sub-protocol
    FunctionCallResponse {
        value: Option<Bytes>,
    },

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription {
        type_oids: Vec<Oid>,
    },
}

impl BackendMessage {
    /// Decode one frame from a streaming read buffer.
    ///
    /// Returns `Ok(None)` and leaves the buffer untouched while the frame is
    /// incomplete. A complete frame is removed from the buffer and decoded.
    pub fn try_decode(buf: &mut BytesMut) -> PgResult<Option<Self>> {
        if buf.len() < 5 {
            return Ok(None);
        }

        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 || len as usize > MAX_MESSAGE_LEN {
            return Err(PgError::Protocol(format!(
                "Invalid message length {} for message type {}",
                len, buf[0] as char
            )));
        }

        let total = 1 + len as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(total).freeze();
        Self::decode(&mut frame).map(Some)
    }

    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();

        if len < 4 || buf.remaining() < (len - 4) as usize {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        let body = buf.split_to((len - 4) as usize);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Self::decode_command_complete(body),
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Self::decode_error_response(body),
            b'N' => Self::decode_notice_response(body),
            b'S' => Self::decode_parameter_status(body),
            b'K' => Self::decode_backend_key_data(body),
            b'G' => {
                let (format, column_formats) = Self::decode_copy_formats(body)?;
                Ok(BackendMessage::CopyInResponse {
                    format,
                    column_formats,
                })
            }
            b'H' => {
                let (format, column_formats) = Self::decode_copy_formats(body)?;
                Ok(BackendMessage::CopyOutResponse {
                    format,
                    column_formats,
                })
            }
            b'W' => {
                let (format, column_formats) = Self::decode_copy_formats(body)?;
                Ok(BackendMessage::CopyBothResponse {
                    format,
                    column_formats,
                })
            }
            b'd' => Ok(BackendMessage::CopyData { data: body }),
            b'c' => Ok(BackendMessage::CopyDone),
            b'V' => Self::decode_function_call_response(body),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => Self::decode_notification_response(body),
            _ => Err(PgError::Protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_auth(mut body: Bytes) -> PgResult<Self> {
        let auth_type = get_i32(&mut body)?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                need(&body, 4)?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            // KerberosV5, SCM credential, GSS, GSS continue, SSPI
            2 | 6 | 7 | 8 | 9 => Ok(BackendMessage::AuthenticationUnsupported { code: auth_type }),
            10 => {
                // SASL
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            _ => Err(PgError::Protocol(format!(
                "Unknown authentication type: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> PgResult<Self> {
        let num_fields = get_i16(&mut body)?.max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            need(&body, 18)?;
            let table_oid = Oid(body.get_u32());
            let column_attr = body.get_i16();
            let type_oid = Oid(body.get_u32());
            let type_size = body.get_i16();
            let type_modifier = body.get_i32();
            let format = Format::from_code(body.get_i16());

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> PgResult<Self> {
        let num_cols = get_i16(&mut body)?.max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            values.push(read_value(&mut body)?);
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_command_complete(mut body: Bytes) -> PgResult<Self> {
        let tag = read_cstring(&mut body)?;
        Ok(BackendMessage::CommandComplete { tag })
    }

    fn decode_ready_for_query(mut body: Bytes) -> PgResult<Self> {
        need(&body, 1)?;
        let status = TransactionStatus::from(body.get_u8());
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_error_response(body: Bytes) -> PgResult<Self> {
        let fields = read_error_fields(body)?;
        Ok(BackendMessage::ErrorResponse { fields })
    }

    fn decode_notice_response(body: Bytes) -> PgResult<Self> {
        let fields = read_error_fields(body)?;
        Ok(BackendMessage::NoticeResponse { fields })
    }

    fn decode_parameter_status(mut body: Bytes) -> PgResult<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> PgResult<Self> {
        let process_id = get_i32(&mut body)?;
        let secret_key = get_i32(&mut body)?;
        Ok(BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        })
    }

    fn decode_copy_formats(mut body: Bytes) -> PgResult<(Format, Vec<Format>)> {
        need(&body, 1)?;
        let format = Format::from_code(i16::from(body.get_u8()));
        let count = get_i16(&mut body)?.max(0) as usize;
        let mut column_formats = Vec::with_capacity(count);
        for _ in 0..count {
            column_formats.push(Format::from_code(get_i16(&mut body)?));
        }
        Ok((format, column_formats))
    }

    fn decode_function_call_response(mut body: Bytes) -> PgResult<Self> {
        let value = read_value(&mut body)?;
        Ok(BackendMessage::FunctionCallResponse { value })
    }

    fn decode_parameter_description(mut body: Bytes) -> PgResult<Self> {
        let num_params = get_i16(&mut body)?.max(0) as usize;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(Oid(get_i32(&mut body)? as u32));
        }

        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_notification_response(mut body: Bytes) -> PgResult<Self> {
        let process_id = get_i32(&mut body)?;
        let channel = read_cstring(&mut body)?;
        let payload = read_cstring(&mut body)?;

        Ok(BackendMessage::NotificationResponse {
            process_id,
            channel,
            payload,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn need(buf: &Bytes, n: usize) -> PgResult<()> {
    if buf.remaining() < n {
        return Err(PgError::Protocol(format!(
            "Truncated message body: need {} bytes, have {}",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_i16(buf: &mut Bytes) -> PgResult<i16> {
    need(buf, 2)?;
    Ok(buf.get_i16())
}

fn get_i32(buf: &mut Bytes) -> PgResult<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

/// Read a length-prefixed value; a negative length is NULL.
fn read_value(buf: &mut Bytes) -> PgResult<Option<Bytes>> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    need(buf, len as usize)?;
    Ok(Some(buf.split_to(len as usize)))
}

/// Read a null-terminated string from the buffer.
/// Tries direct UTF-8 first, falls back to lossy only if invalid.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1); // Skip the null terminator
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.remaining() > 0 {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}
