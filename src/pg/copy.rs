//! COPY FROM STDIN / COPY TO STDOUT.
//!
//! A COPY starts like any command: `exec("COPY t FROM STDIN")` returns a
//! result with status `CopyIn` and leaves the connection in the COPY IN
//! state. Rows are then streamed with [`PgConnection::put_copy_data`] and the
//! stream ended with [`PgConnection::put_copy_end`]; the command's final
//! result comes from [`PgConnection::get_result`].
//!
//! COPY OUT mirrors it: after a `CopyOut` result, call
//! [`PgConnection::get_copy_data`] until it returns [`CopyOutChunk::Done`].

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use super::connection::{AsyncStatus, PgConnection, QueryClass};
use super::error::{PgError, PgResult};
use super::protocol::{
    BackendMessage, CopyDataMessage, CopyDoneMessage, CopyFailMessage, SyncMessage,
};

/// One step of a COPY OUT stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutChunk {
    /// One data message, normally one row.
    Data(Bytes),
    /// Non-blocking read found no complete message yet.
    Pending,
    /// The server finished sending; collect the final result with `get_result`.
    Done,
}

impl PgConnection {
    /// Send one chunk of COPY IN data.
    pub async fn put_copy_data(&mut self, data: &[u8]) -> PgResult<()> {
        self.ensure_open()?;
        if self.async_status != AsyncStatus::CopyIn {
            return Err(PgError::Resource("no COPY IN in progress".to_string()));
        }
        trace!(len = data.len(), "copy data");
        self.send_message(&CopyDataMessage { data }).await
    }

    /// End COPY IN. With `error`, the server aborts the COPY with that message.
    pub async fn put_copy_end(&mut self, error: Option<&str>) -> PgResult<()> {
        self.ensure_open()?;
        if self.async_status != AsyncStatus::CopyIn {
            return Err(PgError::Resource("no COPY IN in progress".to_string()));
        }

        match error {
            Some(message) => {
                debug!(%message, "aborting COPY IN");
                self.buffer_message(&CopyFailMessage {
                    message: message.to_string(),
                })?;
            }
            None => self.buffer_message(&CopyDoneMessage)?,
        }
        // An extended-protocol COPY still needs its Sync
        if self.query_class != QueryClass::Simple {
            self.buffer_message(&SyncMessage)?;
        }

        self.async_status = AsyncStatus::Busy;
        self.flush().await
    }

    /// Receive the next chunk of COPY OUT data.
    ///
    /// With `nonblocking`, returns [`CopyOutChunk::Pending`] instead of
    /// waiting when no complete message has arrived.
    pub async fn get_copy_data(&mut self, nonblocking: bool) -> PgResult<CopyOutChunk> {
        self.ensure_open()?;
        if self.async_status != AsyncStatus::CopyOut {
            return Err(PgError::Resource("no COPY OUT in progress".to_string()));
        }

        let mut polled = false;
        loop {
            let decoded = match BackendMessage::try_decode(&mut self.read_buffer) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.mark_closed();
                    return Err(e);
                }
            };

            match decoded {
                Some(msg) => {
                    let Some(msg) = self.handle_async_message(msg) else {
                        continue;
                    };
                    match msg {
                        BackendMessage::CopyData { data } => return Ok(CopyOutChunk::Data(data)),
                        BackendMessage::CopyDone => {
                            self.async_status = AsyncStatus::Busy;
                            return Ok(CopyOutChunk::Done);
                        }
                        other => {
                            // ErrorResponse ends the COPY without CopyDone
                            self.async_status = AsyncStatus::Busy;
                            self.process_response(other)?;
                            return Ok(CopyOutChunk::Done);
                        }
                    }
                }
                None if nonblocking => {
                    if polled {
                        return Ok(CopyOutChunk::Pending);
                    }
                    polled = true;
                    match tokio::time::timeout(Duration::ZERO, self.fill_buffer()).await {
                        Ok(read) => read?,
                        Err(_) => return Ok(CopyOutChunk::Pending),
                    }
                }
                None => self.fill_buffer().await?,
            }
        }
    }
}
