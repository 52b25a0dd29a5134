//! Large-object client over the function-call sub-protocol.
//!
//! The server-side `lo_*` functions are called by OID; the OIDs are looked up
//! in `pg_proc` on first use and kept for the life of the connection.
//! Large-object descriptors are only valid inside a transaction block.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::connection::PgConnection;
use super::error::{DbError, PgError, PgResult};
use super::protocol::{BackendMessage, FunctionCallMessage};
use super::types::Oid;

/// Open for writing.
pub const INV_WRITE: i32 = 0x0002_0000;
/// Open for reading.
pub const INV_READ: i32 = 0x0004_0000;

/// Chunk size for import and export.
const LO_BUFSIZE: usize = 8192;

const LO_FUNCTIONS_QUERY: &str = "select proname, oid from pg_catalog.pg_proc \
     where proname in ('lo_open', 'lo_close', 'lo_creat', 'lo_create', 'lo_unlink', \
     'lo_lseek', 'lo_lseek64', 'lo_tell', 'lo_tell64', 'lo_truncate', 'lo_truncate64', \
     'loread', 'lowrite') \
     and pronamespace = (select oid from pg_catalog.pg_namespace where nspname = 'pg_catalog')";

/// OIDs of the server's large-object functions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoFunctions {
    open: Oid,
    close: Oid,
    creat: Oid,
    create: Option<Oid>,
    unlink: Oid,
    lseek: Oid,
    lseek64: Option<Oid>,
    tell: Oid,
    tell64: Option<Oid>,
    truncate: Option<Oid>,
    truncate64: Option<Oid>,
    read: Oid,
    write: Oid,
}

impl LoFunctions {
    fn from_catalog(found: &HashMap<String, Oid>) -> PgResult<Self> {
        let required = |name: &str| {
            found.get(name).copied().ok_or_else(|| {
                PgError::Resource(format!("cannot determine OID of function {}", name))
            })
        };
        let optional = |name: &str| found.get(name).copied();

        Ok(Self {
            open: required("lo_open")?,
            close: required("lo_close")?,
            creat: required("lo_creat")?,
            create: optional("lo_create"),
            unlink: required("lo_unlink")?,
            lseek: required("lo_lseek")?,
            lseek64: optional("lo_lseek64"),
            tell: required("lo_tell")?,
            tell64: optional("lo_tell64"),
            truncate: optional("lo_truncate"),
            truncate64: optional("lo_truncate64"),
            read: required("loread")?,
            write: required("lowrite")?,
        })
    }
}

fn int4(value: i32) -> Option<Vec<u8>> {
    Some(value.to_be_bytes().to_vec())
}

fn int8(value: i64) -> Option<Vec<u8>> {
    Some(value.to_be_bytes().to_vec())
}

fn oid_arg(oid: Oid) -> Option<Vec<u8>> {
    Some(oid.as_u32().to_be_bytes().to_vec())
}

fn int4_result(value: Option<Bytes>) -> PgResult<i32> {
    let data = value.ok_or_else(|| PgError::Protocol("function returned NULL".to_string()))?;
    <[u8; 4]>::try_from(&data[..])
        .map(i32::from_be_bytes)
        .map_err(|_| PgError::Protocol(format!("expected 4-byte result, got {} bytes", data.len())))
}

fn int8_result(value: Option<Bytes>) -> PgResult<i64> {
    let data = value.ok_or_else(|| PgError::Protocol("function returned NULL".to_string()))?;
    <[u8; 8]>::try_from(&data[..])
        .map(i64::from_be_bytes)
        .map_err(|_| PgError::Protocol(format!("expected 8-byte result, got {} bytes", data.len())))
}

fn non_negative(value: i32, operation: &str) -> PgResult<i32> {
    if value < 0 {
        return Err(PgError::Resource(format!("{} failed", operation)));
    }
    Ok(value)
}

fn seek_args(pos: SeekFrom) -> (i64, i32) {
    match pos {
        SeekFrom::Start(offset) => (offset as i64, 0),
        SeekFrom::Current(offset) => (offset, 1),
        SeekFrom::End(offset) => (offset, 2),
    }
}

impl PgConnection {
    async fn lo_functions(&mut self) -> PgResult<LoFunctions> {
        if let Some(functions) = self.lo_functions {
            return Ok(functions);
        }

        let result = self.exec(LO_FUNCTIONS_QUERY).await?;
        let mut found = HashMap::new();
        for row in 0..result.ntuples() {
            let name = result.get_str(row, 0);
            let oid = result.get_str(row, 1).and_then(|s| s.parse::<u32>().ok());
            if let (Some(name), Some(oid)) = (name, oid) {
                found.insert(name.to_string(), Oid::from_u32(oid));
            }
        }

        let functions = LoFunctions::from_catalog(&found)?;
        debug!(count = found.len(), "large-object functions resolved");
        self.lo_functions = Some(functions);
        Ok(functions)
    }

    /// Call a server function by OID with binary arguments.
    ///
    /// A server error is returned as [`PgError::LargeObject`].
    pub(crate) async fn function_call(
        &mut self,
        function: Oid,
        args: Vec<Option<Vec<u8>>>,
    ) -> PgResult<Option<Bytes>> {
        self.check_ready_to_send()?;
        self.send_message(&FunctionCallMessage { function, args }).await?;

        let mut value = None;
        let mut error: Option<DbError> = None;
        loop {
            let msg = self.receive_message().await?;
            let Some(msg) = self.handle_async_message(msg) else {
                continue;
            };
            match msg {
                BackendMessage::FunctionCallResponse { value: v } => value = Some(v),
                BackendMessage::ErrorResponse { fields } => {
                    let db_error = DbError::from_fields(fields);
                    if db_error.is_fatal() {
                        self.mark_closed();
                        return Err(PgError::LargeObject(Box::new(db_error)));
                    }
                    error = Some(db_error);
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    break;
                }
                other => {
                    self.mark_closed();
                    return Err(PgError::Protocol(format!(
                        "unexpected message in function call: {:?}",
                        other
                    )));
                }
            }
        }

        if let Some(db_error) = error {
            return Err(PgError::LargeObject(Box::new(db_error)));
        }
        value.ok_or_else(|| PgError::Protocol("function call returned no result".to_string()))
    }

    /// Create a large object, letting the server pick its OID.
    pub async fn lo_creat(&mut self, mode: i32) -> PgResult<Oid> {
        let f = self.lo_functions().await?;
        let value = self.function_call(f.creat, vec![int4(mode)]).await?;
        let oid = int4_result(value)? as u32;
        if oid == 0 {
            return Err(PgError::Resource("lo_creat failed".to_string()));
        }
        Ok(Oid::from_u32(oid))
    }

    /// Create a large object with a chosen OID; `Oid::UNSPECIFIED` lets the server pick.
    pub async fn lo_create(&mut self, oid: Oid) -> PgResult<Oid> {
        let f = self.lo_functions().await?;
        let create = f
            .create
            .ok_or_else(|| PgError::Resource("server does not support lo_create".to_string()))?;
        let value = self.function_call(create, vec![oid_arg(oid)]).await?;
        let created = int4_result(value)? as u32;
        if created == 0 {
            return Err(PgError::Resource("lo_create failed".to_string()));
        }
        Ok(Oid::from_u32(created))
    }

    /// Open a large object, returning a descriptor valid until the transaction ends.
    pub async fn lo_open(&mut self, oid: Oid, mode: i32) -> PgResult<i32> {
        let f = self.lo_functions().await?;
        let value = self.function_call(f.open, vec![oid_arg(oid), int4(mode)]).await?;
        non_negative(int4_result(value)?, "lo_open")
    }

    /// Write bytes at the current position, returning how many were written.
    pub async fn lo_write(&mut self, fd: i32, data: &[u8]) -> PgResult<usize> {
        let f = self.lo_functions().await?;
        let value = self
            .function_call(f.write, vec![int4(fd), Some(data.to_vec())])
            .await?;
        Ok(non_negative(int4_result(value)?, "lo_write")? as usize)
    }

    /// Read up to `len` bytes. Returns `None` at end of object.
    pub async fn lo_read(&mut self, fd: i32, len: usize) -> PgResult<Option<Bytes>> {
        let len = i32::try_from(len)
            .map_err(|_| PgError::Resource(format!("read length {} too large", len)))?;
        let f = self.lo_functions().await?;
        let value = self.function_call(f.read, vec![int4(fd), int4(len)]).await?;
        Ok(value.filter(|data| !data.is_empty()))
    }

    /// Move the position, returning the new position.
    pub async fn lo_lseek(&mut self, fd: i32, pos: SeekFrom) -> PgResult<i64> {
        let f = self.lo_functions().await?;
        let (offset, whence) = seek_args(pos);

        if let Some(lseek64) = f.lseek64 {
            let value = self
                .function_call(lseek64, vec![int4(fd), int8(offset), int4(whence)])
                .await?;
            return int8_result(value);
        }

        let offset = i32::try_from(offset).map_err(|_| {
            PgError::Resource("offset exceeds 2GB; server lacks lo_lseek64".to_string())
        })?;
        let value = self
            .function_call(f.lseek, vec![int4(fd), int4(offset), int4(whence)])
            .await?;
        Ok(non_negative(int4_result(value)?, "lo_lseek")? as i64)
    }

    /// Current position.
    pub async fn lo_tell(&mut self, fd: i32) -> PgResult<i64> {
        let f = self.lo_functions().await?;
        if let Some(tell64) = f.tell64 {
            let value = self.function_call(tell64, vec![int4(fd)]).await?;
            return int8_result(value);
        }
        let value = self.function_call(f.tell, vec![int4(fd)]).await?;
        Ok(non_negative(int4_result(value)?, "lo_tell")? as i64)
    }

    /// Truncate or extend the object to `len` bytes.
    pub async fn lo_truncate(&mut self, fd: i32, len: i64) -> PgResult<()> {
        let f = self.lo_functions().await?;
        let value = match (f.truncate64, f.truncate) {
            (Some(truncate64), _) => self.function_call(truncate64, vec![int4(fd), int8(len)]).await?,
            (None, Some(truncate)) => {
                let len = i32::try_from(len).map_err(|_| {
                    PgError::Resource("length exceeds 2GB; server lacks lo_truncate64".to_string())
                })?;
                self.function_call(truncate, vec![int4(fd), int4(len)]).await?
            }
            (None, None) => {
                return Err(PgError::Resource(
                    "server does not support lo_truncate".to_string(),
                ))
            }
        };
        non_negative(int4_result(value)?, "lo_truncate")?;
        Ok(())
    }

    /// Close a descriptor.
    pub async fn lo_close(&mut self, fd: i32) -> PgResult<()> {
        let f = self.lo_functions().await?;
        let value = self.function_call(f.close, vec![int4(fd)]).await?;
        non_negative(int4_result(value)?, "lo_close")?;
        Ok(())
    }

    /// Delete a large object.
    pub async fn lo_unlink(&mut self, oid: Oid) -> PgResult<()> {
        let f = self.lo_functions().await?;
        let value = self.function_call(f.unlink, vec![oid_arg(oid)]).await?;
        non_negative(int4_result(value)?, "lo_unlink")?;
        Ok(())
    }

    /// Create a large object from a local file.
    pub async fn lo_import(&mut self, path: impl AsRef<Path>) -> PgResult<Oid> {
        let path = path.as_ref();
        let contents = tokio::fs::read(path).await.map_err(|e| {
            PgError::Resource(format!("could not open file \"{}\": {}", path.display(), e))
        })?;

        let oid = self.lo_creat(INV_READ | INV_WRITE).await?;
        let fd = self.lo_open(oid, INV_WRITE).await?;
        for chunk in contents.chunks(LO_BUFSIZE) {
            let written = self.lo_write(fd, chunk).await?;
            if written != chunk.len() {
                return Err(PgError::Resource(format!(
                    "short write to large object {}",
                    oid
                )));
            }
        }
        self.lo_close(fd).await?;

        debug!(%oid, bytes = contents.len(), "large object imported");
        Ok(oid)
    }

    /// Write a large object to a local file.
    pub async fn lo_export(&mut self, oid: Oid, path: impl AsRef<Path>) -> PgResult<()> {
        let path = path.as_ref();
        let fd = self.lo_open(oid, INV_READ).await?;
        let mut file = tokio::fs::File::create(path).await.map_err(|e| {
            PgError::Resource(format!("could not open file \"{}\": {}", path.display(), e))
        })?;

        while let Some(chunk) = self.lo_read(fd, LO_BUFSIZE).await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        self.lo_close(fd).await?;

        debug!(%oid, path = %path.display(), "large object exported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_requires_core_functions() {
        let mut found = HashMap::new();
        for (i, name) in ["lo_open", "lo_close", "lo_creat", "lo_unlink", "lo_lseek", "lo_tell", "loread"]
            .iter()
            .enumerate()
        {
            found.insert(name.to_string(), Oid::from_u32(900 + i as u32));
        }
        let err = LoFunctions::from_catalog(&found).unwrap_err();
        assert!(err.to_string().contains("lowrite"));

        found.insert("lowrite".to_string(), Oid::from_u32(955));
        let functions = LoFunctions::from_catalog(&found).unwrap();
        assert!(functions.lseek64.is_none());
        assert!(functions.truncate.is_none());
        assert_eq!(functions.write, Oid::from_u32(955));
    }

    #[test]
    fn test_seek_args() {
        assert_eq!(seek_args(SeekFrom::Start(10)), (10, 0));
        assert_eq!(seek_args(SeekFrom::Current(-3)), (-3, 1));
        assert_eq!(seek_args(SeekFrom::End(0)), (0, 2));
    }

    #[test]
    fn test_int_results() {
        assert_eq!(int4_result(Some(Bytes::from_static(&[0, 0, 1, 0]))).unwrap(), 256);
        assert_eq!(int8_result(Some(Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 7]))).unwrap(), 7);
        assert!(int4_result(None).is_err());
        assert!(int4_result(Some(Bytes::from_static(&[1, 2]))).is_err());
    }
}
