//! Scripted backend for driving the connection state machine in tests.
//!
//! Each test binds a listener, spawns a task that plays the server side of
//! the conversation frame by frame, and points a client at it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::config::{PgConfig, SslMode};
use super::types::Oid;

pub(crate) const BACKEND_PID: i32 = 4242;
pub(crate) const SECRET_KEY: i32 = 777;

/// Bind a local listener and a client configuration pointing at it.
pub(crate) async fn listen() -> (TcpListener, PgConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = PgConfig::new()
        .host("127.0.0.1")
        .port(port)
        .user("tester")
        .database("testdb")
        .sslmode(SslMode::Disable);
    (listener, config)
}

/// Server end of one client connection.
pub(crate) struct Backend {
    stream: TcpStream,
    buf: BytesMut,
}

impl Backend {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn fill(&mut self, n: usize) -> bool {
        while self.buf.len() < n {
            if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                return false;
            }
        }
        true
    }

    /// Read an untagged packet (startup, SSL or cancel request): its body.
    pub async fn read_untagged(&mut self) -> Bytes {
        assert!(self.fill(4).await, "client hung up");
        let len = i32::from_be_bytes(self.buf[..4].try_into().unwrap()) as usize;
        assert!(self.fill(len).await, "client hung up");
        let mut packet = self.buf.split_to(len).freeze();
        packet.advance(4);
        packet
    }

    /// Read the next tagged frontend message, or `None` on disconnect.
    pub async fn try_read(&mut self) -> Option<(u8, Bytes)> {
        if !self.fill(5).await {
            return None;
        }
        let tag = self.buf[0];
        let len = i32::from_be_bytes(self.buf[1..5].try_into().unwrap()) as usize;
        if !self.fill(len + 1).await {
            return None;
        }
        let mut frame = self.buf.split_to(len + 1).freeze();
        frame.advance(5);
        Some((tag, frame))
    }

    /// Read the next message and assert its tag.
    pub async fn expect(&mut self, tag: u8) -> Bytes {
        let (got, body) = self.try_read().await.expect("client hung up");
        assert_eq!(got as char, tag as char, "unexpected frontend message");
        body
    }

    /// Read messages through the next Sync, returning their tags.
    pub async fn read_until_sync(&mut self) -> Vec<u8> {
        let mut tags = Vec::new();
        loop {
            let (tag, _) = self.try_read().await.expect("client hung up");
            tags.push(tag);
            if tag == b'S' {
                return tags;
            }
        }
    }

    pub async fn send(&mut self, frames: &[BytesMut]) {
        for frame in frames {
            self.stream.write_all(frame).await.unwrap();
        }
        self.stream.flush().await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Consume the startup packet without authenticating.
    pub async fn read_startup(&mut self) -> Bytes {
        let body = self.read_untagged().await;
        assert_eq!(&body[..4], &196608i32.to_be_bytes());
        body
    }

    /// Trust authentication followed by the usual startup parameters.
    pub async fn handshake(&mut self) {
        self.read_startup().await;
        self.send(&[auth_ok()]).await;
        self.finish_startup().await;
    }

    /// Everything after AuthenticationOk.
    pub async fn finish_startup(&mut self) {
        self.send(&[
            parameter_status("server_version", "16.2"),
            parameter_status("client_encoding", "UTF8"),
            backend_key(BACKEND_PID, SECRET_KEY),
            ready(b'I'),
        ])
        .await;
    }

    /// Wait for the client to hang up.
    pub async fn closed(&mut self) {
        while self.try_read().await.is_some() {}
    }
}

// ============================================================================
// Backend message builders
// ============================================================================

fn frame(tag: u8, body: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(tag);
    buf.put_i32(0);
    body(&mut buf);
    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

fn cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

pub(crate) fn auth_code(code: i32) -> BytesMut {
    frame(b'R', |b| b.put_i32(code))
}

pub(crate) fn auth_ok() -> BytesMut {
    auth_code(0)
}

pub(crate) fn auth_md5(salt: [u8; 4]) -> BytesMut {
    frame(b'R', |b| {
        b.put_i32(5);
        b.put_slice(&salt);
    })
}

pub(crate) fn auth_sasl(mechanisms: &[&str]) -> BytesMut {
    frame(b'R', |b| {
        b.put_i32(10);
        for mechanism in mechanisms {
            cstring(b, mechanism);
        }
        b.put_u8(0);
    })
}

pub(crate) fn auth_sasl_continue(data: &[u8]) -> BytesMut {
    frame(b'R', |b| {
        b.put_i32(11);
        b.put_slice(data);
    })
}

pub(crate) fn auth_sasl_final(data: &[u8]) -> BytesMut {
    frame(b'R', |b| {
        b.put_i32(12);
        b.put_slice(data);
    })
}

pub(crate) fn parameter_status(name: &str, value: &str) -> BytesMut {
    frame(b'S', |b| {
        cstring(b, name);
        cstring(b, value);
    })
}

pub(crate) fn backend_key(pid: i32, key: i32) -> BytesMut {
    frame(b'K', |b| {
        b.put_i32(pid);
        b.put_i32(key);
    })
}

pub(crate) fn ready(status: u8) -> BytesMut {
    frame(b'Z', |b| b.put_u8(status))
}

/// Text-format RowDescription.
pub(crate) fn row_description(columns: &[(&str, Oid)]) -> BytesMut {
    frame(b'T', |b| {
        b.put_i16(columns.len() as i16);
        for (i, (name, oid)) in columns.iter().enumerate() {
            cstring(b, name);
            b.put_u32(16384);
            b.put_i16(i as i16 + 1);
            b.put_u32(oid.as_u32());
            b.put_i16(-1);
            b.put_i32(-1);
            b.put_i16(0);
        }
    })
}

pub(crate) fn data_row(values: &[Option<&str>]) -> BytesMut {
    frame(b'D', |b| {
        b.put_i16(values.len() as i16);
        for value in values {
            match value {
                Some(v) => {
                    b.put_i32(v.len() as i32);
                    b.put_slice(v.as_bytes());
                }
                None => b.put_i32(-1),
            }
        }
    })
}

pub(crate) fn command_complete(tag: &str) -> BytesMut {
    frame(b'C', |b| cstring(b, tag))
}

pub(crate) fn empty_query() -> BytesMut {
    frame(b'I', |_| {})
}

fn fields(tag: u8, severity: &str, code: &str, message: &str) -> BytesMut {
    frame(tag, |b| {
        for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
            b.put_u8(field);
            cstring(b, value);
        }
        b.put_u8(0);
    })
}

pub(crate) fn error(severity: &str, code: &str, message: &str) -> BytesMut {
    fields(b'E', severity, code, message)
}

pub(crate) fn notice(severity: &str, code: &str, message: &str) -> BytesMut {
    fields(b'N', severity, code, message)
}

pub(crate) fn notification(pid: i32, channel: &str, payload: &str) -> BytesMut {
    frame(b'A', |b| {
        b.put_i32(pid);
        cstring(b, channel);
        cstring(b, payload);
    })
}

pub(crate) fn parse_complete() -> BytesMut {
    frame(b'1', |_| {})
}

pub(crate) fn bind_complete() -> BytesMut {
    frame(b'2', |_| {})
}

pub(crate) fn close_complete() -> BytesMut {
    frame(b'3', |_| {})
}

pub(crate) fn no_data() -> BytesMut {
    frame(b'n', |_| {})
}

pub(crate) fn parameter_description(types: &[Oid]) -> BytesMut {
    frame(b't', |b| {
        b.put_i16(types.len() as i16);
        for oid in types {
            b.put_u32(oid.as_u32());
        }
    })
}

fn copy_response(tag: u8, columns: usize) -> BytesMut {
    frame(tag, |b| {
        b.put_u8(0);
        b.put_i16(columns as i16);
        for _ in 0..columns {
            b.put_i16(0);
        }
    })
}

pub(crate) fn copy_in(columns: usize) -> BytesMut {
    copy_response(b'G', columns)
}

pub(crate) fn copy_out(columns: usize) -> BytesMut {
    copy_response(b'H', columns)
}

pub(crate) fn copy_both() -> BytesMut {
    copy_response(b'W', 0)
}

pub(crate) fn copy_data(data: &[u8]) -> BytesMut {
    frame(b'd', |b| b.put_slice(data))
}

pub(crate) fn copy_done() -> BytesMut {
    frame(b'c', |_| {})
}

pub(crate) fn function_result(value: Option<&[u8]>) -> BytesMut {
    frame(b'V', |b| match value {
        Some(v) => {
            b.put_i32(v.len() as i32);
            b.put_slice(v);
        }
        None => b.put_i32(-1),
    })
}

// ============================================================================
// Frontend message inspection
// ============================================================================

/// Split a body into its NUL-terminated strings.
pub(crate) fn cstrings(body: &[u8]) -> Vec<String> {
    body.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// Query text of a 'Q' message body.
pub(crate) fn query_text(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len() - 1]).into_owned()
}

/// Function OID and binary arguments of an 'F' message body.
pub(crate) fn function_call_args(body: &[u8]) -> (u32, Vec<Option<Vec<u8>>>) {
    let mut body = Bytes::copy_from_slice(body);
    let oid = body.get_u32();
    let nformats = body.get_i16();
    for _ in 0..nformats {
        assert_eq!(body.get_i16(), 1, "function arguments are sent binary");
    }
    let nargs = body.get_i16();
    let mut args = Vec::new();
    for _ in 0..nargs {
        let len = body.get_i32();
        if len < 0 {
            args.push(None);
        } else {
            args.push(Some(body.split_to(len as usize).to_vec()));
        }
    }
    (oid, args)
}
