//! Query cancellation.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::config::PgConfig;
use super::connection::PgConnection;
use super::error::{PgError, PgResult};
use super::protocol::{CancelRequest, FrontendMessage};
use super::stream::PgStream;

/// Everything needed to cancel the command running on a connection.
///
/// The handle is independent of the connection, so it can be moved to another
/// task while the connection itself is waiting for results.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    config: PgConfig,
    process_id: i32,
    secret_key: i32,
}

impl CancelHandle {
    /// Ask the server to cancel the backend's current command.
    ///
    /// Opens a separate connection, sends a CancelRequest and waits for the
    /// server to hang up. Success only means the request was delivered: the
    /// interrupted command reports its own error (SQLSTATE 57014), and a
    /// command that already finished is unaffected.
    pub async fn cancel(&self) -> PgResult<()> {
        match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, self.send_request())
                .await
                .map_err(|_| PgError::Timeout)?,
            None => self.send_request().await,
        }
    }

    async fn send_request(&self) -> PgResult<()> {
        let mut stream = PgStream::open(&self.config).await?;

        let request = CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        };
        stream.write_all(&request.encode()).await?;
        stream.flush().await?;

        // Server will close connection after processing the request
        let mut buf = [0u8; 1];
        let _ = stream.read(&mut buf).await;
        debug!(backend_pid = self.process_id, "cancel request sent");
        Ok(())
    }

    /// PID of the backend this handle cancels.
    pub fn process_id(&self) -> i32 {
        self.process_id
    }
}

impl PgConnection {
    /// A handle that can cancel this connection's commands from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        let (process_id, secret_key) = self.cancel_key();
        CancelHandle {
            config: self.config().clone(),
            process_id,
            secret_key,
        }
    }

    /// Request cancellation of the command in flight.
    pub async fn cancel(&self) -> PgResult<()> {
        self.cancel_handle().cancel().await
    }
}
