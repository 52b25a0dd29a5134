//! Transport: TCP, TLS over TCP, or a Unix-domain socket.
//!
//! [`PgStream`] gives the connection one `AsyncRead + AsyncWrite` type
//! regardless of how it was opened.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use super::config::{PgConfig, SslMode};
use super::error::{PgError, PgResult};
use super::protocol::{FrontendMessage, SslRequest};
use super::tls;

/// A PostgreSQL connection stream (TCP, TLS, or Unix).
#[allow(clippy::large_enum_variant)]
pub enum PgStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
    /// Unix domain socket connection
    #[cfg(unix)]
    Unix(UnixStream),
}

impl PgStream {
    /// Open the transport described by `config`, negotiating TLS per its sslmode.
    ///
    /// Nothing but the SSLRequest is written before the TLS decision, so
    /// credentials never travel in clear text when TLS is required.
    pub async fn open(config: &PgConfig) -> PgResult<Self> {
        #[cfg(unix)]
        {
            if config.is_unix_socket() {
                let path = config.socket_path();
                debug!(path = %path.display(), "connecting over unix socket");
                let stream = UnixStream::connect(&path).await.map_err(|e| {
                    PgError::Connection(format!(
                        "could not connect to server on socket \"{}\": {}",
                        path.display(),
                        e
                    ))
                })?;
                return Ok(PgStream::Unix(stream));
            }
        }

        debug!(host = %config.host, port = config.port, "connecting over tcp");
        let mut tcp = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| {
                PgError::Connection(format!(
                    "could not connect to server at \"{}\" port {}: {}",
                    config.host, config.port, e
                ))
            })?;
        tcp.set_nodelay(true)?;

        if config.sslmode == SslMode::Disable {
            return Ok(PgStream::Tcp(tcp));
        }

        tcp.write_all(&SslRequest.encode()).await?;
        let mut response = [0u8; 1];
        tcp.read_exact(&mut response).await?;

        match response[0] {
            b'S' => {
                let stream = tls::handshake(tcp, &config.host, config.sslmode).await?;
                debug!("TLS established");
                Ok(PgStream::Tls(stream))
            }
            b'N' if config.sslmode == SslMode::Prefer => {
                debug!("server refused TLS, continuing in clear text");
                Ok(PgStream::Tcp(tcp))
            }
            b'N' => Err(PgError::Tls(
                "server does not support SSL, but SSL was required".to_string(),
            )),
            other => Err(PgError::Protocol(format!(
                "received invalid response to SSL negotiation: {}",
                other as char
            ))),
        }
    }

    /// Whether the transport is encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, PgStream::Tls(_))
    }
}

impl AsyncRead for PgStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PgStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            PgStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            PgStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PgStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PgStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            PgStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            PgStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PgStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            PgStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            PgStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PgStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            PgStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            PgStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
