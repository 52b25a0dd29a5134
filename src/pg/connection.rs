//! PostgreSQL connection implementation.
//!
//! This module provides the main connection type that handles:
//! - Transport establishment (TCP, TLS, Unix socket)
//! - Startup and authentication
//! - Simple and extended query protocols, synchronous and asynchronous
//! - Prepared statement bookkeeping
//!
//! All I/O happens inside the awaited method that needs it; nothing runs in
//! the background. Asynchronous commands are sent with a `send_*` method and
//! their results collected with [`PgConnection::get_result`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::auth::md5_password;
use super::config::PgConfig;
use super::error::{DbError, PgError, PgResult};
use super::escape;
use super::large_object::LoFunctions;
use super::protocol::*;
use super::result::{QueryResult, ResultBuilder, ResultStatus};
use super::scram::{ScramClient, SCRAM_SHA_256};
use super::statement::{PreparedStatement, StatementCache};
use super::stream::PgStream;
use super::types::{Oid, PgValue};

/// Callback receiving server notices (NOTICE, WARNING, INFO, ...).
pub type NoticeReceiver = Box<dyn FnMut(&DbError) + Send>;

const READ_CHUNK: usize = 8192;

// ============================================================================
// Connection State
// ============================================================================

/// Where the connection is in the command cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    /// No command in flight; a new one may be sent.
    Idle,
    /// A command was sent and its results are still arriving.
    Busy,
    /// The server is waiting for COPY data.
    CopyIn,
    /// The server is sending COPY data.
    CopyOut,
}

/// Which kind of command is in flight; decides how responses are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryClass {
    Simple,
    Extended,
    Prepare,
    Describe,
    Close,
}

/// An asynchronous notification from LISTEN/NOTIFY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// PID of the notifying backend
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
pub struct PgConnection {
    /// Transport
    pub(crate) stream: PgStream,
    /// Connection configuration
    config: PgConfig,
    /// Bytes received but not yet decoded
    pub(crate) read_buffer: BytesMut,
    /// Encoded messages not yet written
    write_buffer: BytesMut,
    /// Prepared statements known on this connection
    statement_cache: StatementCache,
    /// Current transaction status
    pub(crate) transaction_status: TransactionStatus,
    /// Backend process ID
    backend_pid: i32,
    /// Backend secret key (for cancellation)
    backend_secret_key: i32,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    /// Numeric server version, libpq style
    server_version: i32,
    /// This session's standard_conforming_strings
    std_strings: bool,
    /// Whether the connection is closed
    closed: bool,
    pub(crate) async_status: AsyncStatus,
    pub(crate) query_class: QueryClass,
    /// Statement being prepared, recorded once the server describes it
    pending_statement: Option<PreparedStatement>,
    /// Name of the statement being closed
    pending_close: Option<String>,
    builder: ResultBuilder,
    /// Completed results not yet handed to the caller
    ready: VecDeque<QueryResult>,
    notifications: VecDeque<Notification>,
    notice_receiver: Option<NoticeReceiver>,
    /// Large-object function OIDs, looked up on first use
    pub(crate) lo_functions: Option<LoFunctions>,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("user", &self.config.user)
            .field("backend_pid", &self.backend_pid)
            .field("transaction_status", &self.transaction_status)
            .field("async_status", &self.async_status)
            .field("closed", &self.closed)
            .finish()
    }
}

impl PgConnection {
    /// Connect using a URL or keyword/value connection string.
    pub async fn connect(conninfo: &str) -> PgResult<Self> {
        let config = PgConfig::parse(conninfo)?;
        Self::connect_with_config(config).await
    }

    /// Connect with explicit configuration.
    pub async fn connect_with_config(config: PgConfig) -> PgResult<Self> {
        match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, Self::establish(config))
                .await
                .map_err(|_| PgError::Timeout)?,
            None => Self::establish(config).await,
        }
    }

    async fn establish(config: PgConfig) -> PgResult<Self> {
        let stream = PgStream::open(&config).await?;

        let mut conn = Self {
            stream,
            config,
            read_buffer: BytesMut::with_capacity(32768),
            write_buffer: BytesMut::with_capacity(READ_CHUNK),
            statement_cache: StatementCache::new(),
            transaction_status: TransactionStatus::Unknown,
            backend_pid: 0,
            backend_secret_key: 0,
            parameters: HashMap::new(),
            server_version: 0,
            std_strings: false,
            closed: false,
            async_status: AsyncStatus::Idle,
            query_class: QueryClass::Simple,
            pending_statement: None,
            pending_close: None,
            builder: ResultBuilder::new(),
            ready: VecDeque::new(),
            notifications: VecDeque::new(),
            notice_receiver: None,
            lo_functions: None,
        };

        conn.startup().await?;
        debug!(
            backend_pid = conn.backend_pid,
            server_version = conn.server_version,
            tls = conn.stream.is_tls(),
            "connection established"
        );

        Ok(conn)
    }

    /// Perform the startup handshake (authentication).
    async fn startup(&mut self) -> PgResult<()> {
        let startup = StartupMessage {
            user: self.config.user.clone(),
            database: self.config.database.clone(),
            options: self.config.startup_options(),
        };
        self.send_message(&startup).await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationOk => {
                    debug!("authenticated");
                }
                BackendMessage::AuthenticationCleartextPassword => {
                    debug!(method = "password", "authentication requested");
                    let password = self.require_password()?;
                    self.send_message(&PasswordMessage { password }).await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    debug!(method = "md5", "authentication requested");
                    let password = self.require_password()?;
                    let hash = md5_password(&self.config.user, &password, &salt);
                    self.send_message(&PasswordMessage { password: hash }).await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    debug!(method = "scram-sha-256", ?mechanisms, "authentication requested");
                    self.authenticate_scram(&mechanisms).await?;
                }
                BackendMessage::AuthenticationUnsupported { code } => {
                    return Err(PgError::Auth(format!(
                        "authentication method {} not supported",
                        code
                    )));
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.set_parameter(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.backend_pid = process_id;
                    self.backend_secret_key = secret_key;
                }
                BackendMessage::NoticeResponse { fields } => {
                    self.handle_notice(fields);
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(startup_error(DbError::from_fields(fields)));
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message during startup: {:?}",
                        other
                    )));
                }
            }
        }
    }

    fn require_password(&self) -> PgResult<String> {
        self.config
            .password
            .clone()
            .ok_or_else(|| PgError::Auth("password required but none supplied".to_string()))
    }

    async fn authenticate_scram(&mut self, mechanisms: &[String]) -> PgResult<()> {
        if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
            return Err(PgError::Auth(format!(
                "server requires unsupported SASL mechanisms: {:?}",
                mechanisms
            )));
        }

        let password = self.require_password()?;
        let mut scram = ScramClient::new(&self.config.user, &password);

        let sasl_initial = SaslInitialResponseMessage {
            mechanism: SCRAM_SHA_256.to_string(),
            data: scram.client_first_message(),
        };
        self.send_message(&sasl_initial).await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client_final = scram
                        .process_server_first(&data)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    self.send_message(&SaslResponseMessage { data: client_final })
                        .await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    scram
                        .verify_server_final(&data)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    return Ok(());
                }
                BackendMessage::NoticeResponse { fields } => self.handle_notice(fields),
                BackendMessage::ErrorResponse { fields } => {
                    return Err(startup_error(DbError::from_fields(fields)));
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message during SASL exchange: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Close the current connection and open a new one with the same configuration.
    ///
    /// The notice receiver is carried over; statements, large-object handles
    /// and pending notifications are not.
    pub async fn reset(&mut self) -> PgResult<()> {
        let mut fresh = Self::connect_with_config(self.config.clone()).await?;
        fresh.notice_receiver = self.notice_receiver.take();
        let mut old = std::mem::replace(self, fresh);
        old.close().await;
        Ok(())
    }

    /// Send Terminate and close the socket. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.write_buffer.extend_from_slice(&TerminateMessage.encode());
        let _ = self.stream.write_all(&self.write_buffer).await;
        let _ = self.stream.shutdown().await;
        self.write_buffer.clear();
        self.mark_closed();
        debug!(backend_pid = self.backend_pid, "connection closed");
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Whether the connection has been closed or lost.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The configuration this connection was opened with.
    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    /// Transaction status as of the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        if self.closed {
            TransactionStatus::Unknown
        } else {
            self.transaction_status
        }
    }

    /// Command-cycle state.
    pub fn async_status(&self) -> AsyncStatus {
        self.async_status
    }

    /// Check if in a transaction.
    pub fn in_transaction(&self) -> bool {
        matches!(
            self.transaction_status(),
            TransactionStatus::InTransaction | TransactionStatus::Failed
        )
    }

    /// Get the backend process ID.
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// A server parameter as last reported (e.g. `server_version`, `TimeZone`).
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Server version as an integer: `16.2` is 160002, `9.6.3` is 90603.
    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    /// Frontend/backend protocol major version.
    pub fn protocol_version(&self) -> i32 {
        3
    }

    /// The session's client encoding.
    pub fn client_encoding(&self) -> Option<&str> {
        self.parameter_status("client_encoding")
    }

    /// Whether this session has `standard_conforming_strings` on.
    pub fn standard_conforming_strings(&self) -> bool {
        self.std_strings
    }

    /// Whether the transport is TLS.
    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Backend key data for cancel requests.
    pub(crate) fn cancel_key(&self) -> (i32, i32) {
        (self.backend_pid, self.backend_secret_key)
    }

    /// Prepared statements known on this connection.
    pub fn statements(&self) -> &StatementCache {
        &self.statement_cache
    }

    /// Install a receiver for server notices, returning the previous one.
    ///
    /// Without a receiver, notices are logged.
    pub fn set_notice_receiver(&mut self, receiver: Option<NoticeReceiver>) -> Option<NoticeReceiver> {
        std::mem::replace(&mut self.notice_receiver, receiver)
    }

    // ========================================================================
    // Escaping
    // ========================================================================

    /// Escape a string literal body for this session.
    pub fn escape_string(&self, s: &str) -> String {
        escape::escape_string_with(s, self.std_strings)
    }

    /// Quote a string as a SQL literal.
    pub fn escape_literal(&self, s: &str) -> String {
        escape::escape_literal(s)
    }

    /// Quote an identifier.
    pub fn escape_identifier(&self, s: &str) -> String {
        escape::escape_identifier(s)
    }

    /// Escape binary data for a bytea literal.
    ///
    /// Uses the hex format (`\x...`) when the server is 9.0 or newer, as
    /// libpq's `PQescapeByteaConn` does, and the backslash-octal escape
    /// format for older servers. Backslashes are doubled unless this
    /// session reports `standard_conforming_strings = on`. The free
    /// [`escape::escape_bytea`] always uses the escape format.
    pub fn escape_bytea(&self, data: &[u8]) -> String {
        escape::escape_bytea_with(data, self.std_strings, self.server_version >= 90000)
    }

    // ========================================================================
    // Synchronous commands
    // ========================================================================

    /// Run a query string with the simple query protocol and wait for it.
    ///
    /// The string may hold several statements; the result of the last one is
    /// returned. A server error becomes `Err(PgError::Query)` carrying the
    /// error result.
    pub async fn exec(&mut self, sql: &str) -> PgResult<QueryResult> {
        self.discard_results().await?;
        self.send_query(sql).await?;
        self.exec_finish().await
    }

    /// Run a single statement with parameters through the unnamed statement.
    pub async fn exec_params(
        &mut self,
        sql: &str,
        params: &[PgValue],
        result_format: Format,
    ) -> PgResult<QueryResult> {
        self.discard_results().await?;
        self.send_query_params(sql, params, result_format).await?;
        self.exec_finish().await
    }

    /// Create a prepared statement. An empty name redefines the unnamed statement.
    pub async fn prepare(
        &mut self,
        name: &str,
        sql: &str,
        param_types: &[Oid],
    ) -> PgResult<QueryResult> {
        self.discard_results().await?;
        self.send_prepare(name, sql, param_types).await?;
        self.exec_finish().await
    }

    /// Execute a statement created by [`PgConnection::prepare`].
    pub async fn exec_prepared(
        &mut self,
        name: &str,
        params: &[PgValue],
        result_format: Format,
    ) -> PgResult<QueryResult> {
        self.discard_results().await?;
        self.send_query_prepared(name, params, result_format).await?;
        self.exec_finish().await
    }

    /// Parameter types and result fields of a prepared statement.
    pub async fn describe_prepared(&mut self, name: &str) -> PgResult<QueryResult> {
        self.discard_results().await?;
        self.send_describe_prepared(name).await?;
        self.exec_finish().await
    }

    /// Result fields of a portal.
    pub async fn describe_portal(&mut self, name: &str) -> PgResult<QueryResult> {
        self.discard_results().await?;
        self.send_describe_portal(name).await?;
        self.exec_finish().await
    }

    /// Release a prepared statement on the server.
    pub async fn close_prepared(&mut self, name: &str) -> PgResult<QueryResult> {
        self.discard_results().await?;
        self.send_close(b'S', name).await?;
        self.exec_finish().await
    }

    /// Release a portal on the server.
    pub async fn close_portal(&mut self, name: &str) -> PgResult<QueryResult> {
        self.discard_results().await?;
        self.send_close(b'P', name).await?;
        self.exec_finish().await
    }

    /// Execute BEGIN.
    pub async fn begin(&mut self) -> PgResult<()> {
        self.exec("BEGIN").await.map(|_| ())
    }

    /// Execute COMMIT.
    pub async fn commit(&mut self) -> PgResult<()> {
        self.exec("COMMIT").await.map(|_| ())
    }

    /// Execute ROLLBACK.
    pub async fn rollback(&mut self) -> PgResult<()> {
        self.exec("ROLLBACK").await.map(|_| ())
    }

    /// Change the session's client encoding.
    pub async fn set_client_encoding(&mut self, encoding: &str) -> PgResult<()> {
        let sql = format!(
            "SET client_encoding TO {}",
            escape::escape_literal(encoding)
        );
        self.exec(&sql).await.map(|_| ())
    }

    /// Drop results left over from an earlier asynchronous command.
    async fn discard_results(&mut self) -> PgResult<()> {
        self.ensure_open()?;
        loop {
            if matches!(self.async_status, AsyncStatus::CopyIn | AsyncStatus::CopyOut) {
                return Err(PgError::Resource(
                    "cannot run a command while COPY is in progress".to_string(),
                ));
            }
            match self.get_result().await? {
                Some(result) => trace!(status = %result.status(), "discarding unread result"),
                None => return Ok(()),
            }
        }
    }

    /// Collect the results of the command just sent, keeping the last one.
    ///
    /// Stops early at a COPY result so the caller can run the COPY.
    async fn exec_finish(&mut self) -> PgResult<QueryResult> {
        let mut last = None;
        while let Some(result) = self.get_result().await? {
            let copy = matches!(
                result.status(),
                ResultStatus::CopyIn | ResultStatus::CopyOut
            );
            last = Some(result);
            if copy || self.closed {
                break;
            }
        }
        last.ok_or_else(|| PgError::Protocol("command completed without a result".to_string()))?
            .check()
    }

    // ========================================================================
    // Asynchronous commands
    // ========================================================================

    /// Send a query string without waiting for its results.
    pub async fn send_query(&mut self, sql: &str) -> PgResult<()> {
        self.check_ready_to_send()?;
        self.buffer_message(&QueryMessage {
            query: sql.to_string(),
        })?;
        self.start_command(QueryClass::Simple).await
    }

    /// Send a parameterized statement without waiting for its results.
    pub async fn send_query_params(
        &mut self,
        sql: &str,
        params: &[PgValue],
        result_format: Format,
    ) -> PgResult<()> {
        self.check_ready_to_send()?;

        self.buffer_message(&ParseMessage {
            name: String::new(),
            query: sql.to_string(),
            param_types: params.iter().map(PgValue::param_type).collect(),
        })?;
        self.buffer_bind_execute("", params, result_format)?;
        // The unnamed statement now holds this query
        self.statement_cache.remove("");

        self.start_command(QueryClass::Extended).await
    }

    /// Send Parse for a named statement without waiting for the outcome.
    pub async fn send_prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> PgResult<()> {
        self.check_ready_to_send()?;

        self.buffer_message(&ParseMessage {
            name: name.to_string(),
            query: sql.to_string(),
            param_types: param_types.to_vec(),
        })?;
        self.buffer_message(&DescribeMessage {
            kind: b'S',
            name: name.to_string(),
        })?;
        self.buffer_message(&SyncMessage)?;
        self.pending_statement = Some(PreparedStatement::new(name.to_string(), sql.to_string()));

        self.start_command(QueryClass::Prepare).await
    }

    /// Execute a prepared statement without waiting for its results.
    pub async fn send_query_prepared(
        &mut self,
        name: &str,
        params: &[PgValue],
        result_format: Format,
    ) -> PgResult<()> {
        self.check_ready_to_send()?;
        self.buffer_bind_execute(name, params, result_format)?;
        self.start_command(QueryClass::Extended).await
    }

    /// Request a prepared statement's description without waiting for it.
    pub async fn send_describe_prepared(&mut self, name: &str) -> PgResult<()> {
        self.send_describe(b'S', name).await
    }

    /// Request a portal's description without waiting for it.
    pub async fn send_describe_portal(&mut self, name: &str) -> PgResult<()> {
        self.send_describe(b'P', name).await
    }

    async fn send_describe(&mut self, kind: u8, name: &str) -> PgResult<()> {
        self.check_ready_to_send()?;
        self.buffer_message(&DescribeMessage {
            kind,
            name: name.to_string(),
        })?;
        self.buffer_message(&SyncMessage)?;
        self.start_command(QueryClass::Describe).await
    }

    async fn send_close(&mut self, kind: u8, name: &str) -> PgResult<()> {
        self.check_ready_to_send()?;
        self.buffer_message(&CloseMessage {
            kind,
            name: name.to_string(),
        })?;
        self.buffer_message(&SyncMessage)?;
        if kind == b'S' {
            self.pending_close = Some(name.to_string());
        }
        self.start_command(QueryClass::Close).await
    }

    fn buffer_bind_execute(
        &mut self,
        statement: &str,
        params: &[PgValue],
        result_format: Format,
    ) -> PgResult<()> {
        let (param_formats, values): (Vec<Format>, Vec<Option<Vec<u8>>>) =
            params.iter().map(PgValue::to_param).unzip();

        self.buffer_message(&BindMessage {
            portal: String::new(),
            statement: statement.to_string(),
            param_formats,
            params: values,
            result_formats: vec![result_format],
        })?;
        self.buffer_message(&DescribeMessage {
            kind: b'P',
            name: String::new(),
        })?;
        self.buffer_message(&ExecuteMessage {
            portal: String::new(),
            max_rows: 0,
        })?;
        self.buffer_message(&SyncMessage)
    }

    pub(crate) fn check_ready_to_send(&self) -> PgResult<()> {
        self.ensure_open()?;
        if self.async_status != AsyncStatus::Idle || !self.ready.is_empty() {
            return Err(PgError::Resource(
                "another command is already in progress".to_string(),
            ));
        }
        Ok(())
    }

    async fn start_command(&mut self, class: QueryClass) -> PgResult<()> {
        self.query_class = class;
        self.async_status = AsyncStatus::Busy;
        self.builder = ResultBuilder::new();
        if let Err(e) = self.flush().await {
            self.pending_statement = None;
            self.pending_close = None;
            return Err(e);
        }
        Ok(())
    }

    /// Next result of the command in flight, waiting for it if necessary.
    ///
    /// Returns `None` once the command has completed, and while a COPY is in
    /// progress after its COPY result has been returned.
    pub async fn get_result(&mut self) -> PgResult<Option<QueryResult>> {
        loop {
            if let Some(result) = self.ready.pop_front() {
                return Ok(Some(result));
            }
            if self.async_status != AsyncStatus::Busy {
                return Ok(None);
            }
            self.fill_buffer().await?;
            self.parse_input()?;
        }
    }

    /// Wait for all results of the command in flight and return the last.
    ///
    /// An error result becomes `Err(PgError::Query)`.
    pub async fn get_last_result(&mut self) -> PgResult<Option<QueryResult>> {
        let mut last = None;
        while let Some(result) = self.get_result().await? {
            let copy = matches!(
                result.status(),
                ResultStatus::CopyIn | ResultStatus::CopyOut
            );
            last = Some(result);
            if copy {
                break;
            }
        }
        last.map(QueryResult::check).transpose()
    }

    /// Whether [`PgConnection::get_result`] would have to wait for the server.
    ///
    /// Decodes any input already received but does not read the socket.
    pub fn is_busy(&mut self) -> PgResult<bool> {
        self.parse_input()?;
        Ok(self.async_status == AsyncStatus::Busy && self.ready.is_empty())
    }

    /// Read whatever the server has already sent, without waiting.
    pub async fn consume_input(&mut self) -> PgResult<()> {
        self.ensure_open()?;
        if let Ok(read) = tokio::time::timeout(Duration::ZERO, self.fill_buffer()).await {
            read?;
        }
        self.parse_input()
    }

    /// Wait until a result is available without consuming it.
    ///
    /// Returns `false` if `timeout` elapsed first; the command is still in
    /// flight and may be waited on again. `None` waits indefinitely.
    pub async fn block(&mut self, timeout: Option<Duration>) -> PgResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if !self.is_busy()? {
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.fill_buffer()).await {
                        Ok(read) => read?,
                        Err(_) => return Ok(false),
                    }
                }
                None => self.fill_buffer().await?,
            }
        }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Next received notification, if any. Does not read the socket.
    pub fn notifies(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    /// Wait for a notification. Returns `None` if `timeout` elapsed first.
    pub async fn wait_for_notify(
        &mut self,
        timeout: Option<Duration>,
    ) -> PgResult<Option<Notification>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.parse_input()?;
            if let Some(notification) = self.notifications.pop_front() {
                return Ok(Some(notification));
            }
            self.ensure_open()?;
            match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.fill_buffer()).await {
                        Ok(read) => read?,
                        Err(_) => return Ok(None),
                    }
                }
                None => self.fill_buffer().await?,
            }
        }
    }

    // ========================================================================
    // Input processing
    // ========================================================================

    /// Decode every complete frame in the read buffer.
    ///
    /// Stops at the start of COPY OUT data, which belongs to `get_copy_data`.
    pub(crate) fn parse_input(&mut self) -> PgResult<()> {
        let outcome = self.parse_frames();
        if let Err(e) = &outcome {
            if e.is_fatal() {
                warn!(error = %e, "closing connection after fatal error");
                self.mark_closed();
            }
        }
        outcome
    }

    fn parse_frames(&mut self) -> PgResult<()> {
        while self.async_status != AsyncStatus::CopyOut {
            let Some(msg) = BackendMessage::try_decode(&mut self.read_buffer)? else {
                break;
            };
            trace!(?msg, "received");
            if let Some(msg) = self.handle_async_message(msg) {
                self.process_response(msg)?;
            }
        }
        Ok(())
    }

    /// Handle messages the server may send at any time.
    ///
    /// Returns the message back if it belongs to the command cycle.
    pub(crate) fn handle_async_message(&mut self, msg: BackendMessage) -> Option<BackendMessage> {
        match msg {
            BackendMessage::ParameterStatus { name, value } => {
                self.set_parameter(name, value);
                None
            }
            BackendMessage::NoticeResponse { fields } => {
                self.handle_notice(fields);
                None
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                self.notifications.push_back(Notification {
                    process_id,
                    channel,
                    payload,
                });
                None
            }
            other => Some(other),
        }
    }

    pub(crate) fn process_response(&mut self, msg: BackendMessage) -> PgResult<()> {
        if self.async_status == AsyncStatus::Idle {
            return self.process_unsolicited(msg);
        }

        match msg {
            BackendMessage::RowDescription { fields } => {
                self.builder.set_columns(Arc::new(fields));
                if self.is_describing() {
                    self.finish_description();
                }
            }
            BackendMessage::NoData => {
                if self.is_describing() {
                    self.finish_description();
                }
            }
            BackendMessage::ParameterDescription { type_oids } => {
                self.builder.set_param_types(type_oids);
            }
            BackendMessage::DataRow { values } => {
                self.builder.push_row(values)?;
            }
            BackendMessage::CommandComplete { tag } => {
                let result = self.builder.finish(tag);
                self.ready.push_back(result);
            }
            BackendMessage::PortalSuspended => {
                let result = self.builder.finish(String::new());
                self.ready.push_back(result);
            }
            BackendMessage::EmptyQueryResponse => {
                let result = self.builder.finish_empty();
                self.ready.push_back(result);
            }
            BackendMessage::ErrorResponse { fields } => {
                let error = DbError::from_fields(fields);
                let fatal = error.is_fatal();
                self.pending_statement = None;
                self.pending_close = None;
                let result = self.builder.finish_error(error);
                self.ready.push_back(result);
                if fatal {
                    // The backend exits after a FATAL error; no ReadyForQuery follows
                    warn!("server terminated the session");
                    self.mark_closed();
                }
            }
            BackendMessage::ParseComplete | BackendMessage::BindComplete => {}
            BackendMessage::CloseComplete => {
                if let Some(name) = self.pending_close.take() {
                    self.statement_cache.remove(&name);
                }
                let result = self.builder.finish_description();
                self.ready.push_back(result);
            }
            BackendMessage::CopyInResponse { column_formats, .. } => {
                let result = self.builder.finish_copy(ResultStatus::CopyIn, &column_formats);
                self.ready.push_back(result);
                self.async_status = AsyncStatus::CopyIn;
            }
            BackendMessage::CopyOutResponse { column_formats, .. } => {
                let result = self.builder.finish_copy(ResultStatus::CopyOut, &column_formats);
                self.ready.push_back(result);
                self.async_status = AsyncStatus::CopyOut;
            }
            BackendMessage::CopyBothResponse { .. } => {
                return Err(PgError::Protocol(
                    "COPY BOTH (replication) is not supported".to_string(),
                ));
            }
            BackendMessage::CopyData { .. } | BackendMessage::CopyDone => {
                // Trailing COPY OUT data after the caller stopped reading
                trace!("ignoring COPY data outside COPY OUT");
            }
            BackendMessage::ReadyForQuery { status } => {
                self.transaction_status = status;
                self.async_status = AsyncStatus::Idle;
                self.pending_statement = None;
                self.pending_close = None;
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "unexpected message while processing a command: {:?}",
                    other
                )));
            }
        }
        Ok(())
    }

    fn process_unsolicited(&mut self, msg: BackendMessage) -> PgResult<()> {
        match msg {
            BackendMessage::ErrorResponse { fields } => {
                let error = DbError::from_fields(fields);
                warn!(error = %error, "error received while idle");
                if error.is_fatal() {
                    self.mark_closed();
                }
                Ok(())
            }
            // Sync after a COPY the server had already ended
            BackendMessage::ReadyForQuery { status } => {
                self.transaction_status = status;
                Ok(())
            }
            other => Err(PgError::Protocol(format!(
                "unexpected message while idle: {:?}",
                other
            ))),
        }
    }

    fn is_describing(&self) -> bool {
        matches!(self.query_class, QueryClass::Prepare | QueryClass::Describe)
    }

    fn finish_description(&mut self) {
        if self.query_class == QueryClass::Prepare {
            if let Some(mut statement) = self.pending_statement.take() {
                if let Some(columns) = self.builder.columns() {
                    statement.set_columns(Arc::clone(columns));
                }
                statement.set_param_types(self.builder.param_types().to_vec());
                self.statement_cache.insert(statement);
            }
        }
        let result = self.builder.finish_description();
        self.ready.push_back(result);
    }

    fn set_parameter(&mut self, name: String, value: String) {
        match name.as_str() {
            "standard_conforming_strings" => {
                self.std_strings = value == "on";
                escape::observe_standard_conforming_strings(&value);
            }
            "server_version" => self.server_version = parse_server_version(&value),
            _ => {}
        }
        trace!(%name, %value, "parameter status");
        self.parameters.insert(name, value);
    }

    pub(crate) fn handle_notice(&mut self, fields: HashMap<u8, String>) {
        let notice = DbError::from_fields(fields);
        match self.notice_receiver.as_mut() {
            Some(receiver) => receiver(&notice),
            None if notice.severity == "WARNING" => {
                warn!(code = %notice.code, "{}", notice.message)
            }
            None => info!(severity = %notice.severity, code = %notice.code, "{}", notice.message),
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
        self.async_status = AsyncStatus::Idle;
        self.transaction_status = TransactionStatus::Unknown;
        self.statement_cache.clear();
        self.lo_functions = None;
    }

    pub(crate) fn ensure_open(&self) -> PgResult<()> {
        if self.closed {
            return Err(PgError::ConnectionClosed);
        }
        Ok(())
    }

    // ========================================================================
    // Low-level I/O
    // ========================================================================

    /// Encode a frontend message into the write buffer.
    #[inline]
    ///
    /// A message the protocol cannot carry drops the partly built command.
    pub(crate) fn buffer_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        match encode_checked(msg) {
            Ok(frame) => {
                self.write_buffer.extend_from_slice(&frame);
                Ok(())
            }
            Err(e) => {
                self.write_buffer.clear();
                Err(e)
            }
        }
    }

    /// Encode and send a message immediately.
    pub(crate) async fn send_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        self.buffer_message(msg)?;
        self.flush().await
    }

    /// Write buffered messages to the server.
    pub async fn flush(&mut self) -> PgResult<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        let written = match self.stream.write_all(&self.write_buffer).await {
            Ok(()) => self.stream.flush().await,
            Err(e) => Err(e),
        };
        self.write_buffer.clear();
        if let Err(e) = written {
            warn!(error = %e, "write failed, closing connection");
            self.mark_closed();
            return Err(PgError::Io(e));
        }
        Ok(())
    }

    /// Read more bytes from the server into the read buffer.
    ///
    /// Cancel-safe: dropping the future loses no data.
    pub(crate) async fn fill_buffer(&mut self) -> PgResult<()> {
        self.read_buffer.reserve(READ_CHUNK);
        match self.stream.read_buf(&mut self.read_buffer).await {
            Ok(0) => {
                warn!("server closed the connection unexpectedly");
                self.mark_closed();
                Err(PgError::Connection(
                    "server closed the connection unexpectedly".to_string(),
                ))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "read failed, closing connection");
                self.mark_closed();
                Err(PgError::Io(e))
            }
        }
    }

    /// Receive the next backend message, reading the socket as needed.
    pub(crate) async fn receive_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            match BackendMessage::try_decode(&mut self.read_buffer) {
                Ok(Some(msg)) => {
                    trace!(?msg, "received");
                    return Ok(msg);
                }
                Ok(None) => self.fill_buffer().await?,
                Err(e) => {
                    self.mark_closed();
                    return Err(e);
                }
            }
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Map a startup ErrorResponse: SQLSTATE class 28 is an authentication failure.
fn startup_error(error: DbError) -> PgError {
    if error.code.starts_with("28") {
        PgError::Auth(error.to_string())
    } else {
        PgError::Connection(error.to_string())
    }
}

/// Convert a `server_version` report to the `PG_VERSION_NUM` integer form.
pub(crate) fn parse_server_version(version: &str) -> i32 {
    let numeric = version.split_whitespace().next().unwrap_or_default();
    let mut parts = numeric.split('.').map(|part| {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        digits.parse::<i32>().ok()
    });

    let Some(Some(major)) = parts.next() else {
        return 0;
    };
    let minor = parts.next().flatten().unwrap_or(0);
    if major >= 10 {
        major * 10000 + minor
    } else {
        let patch = parts.next().flatten().unwrap_or(0);
        major * 10000 + minor * 100 + patch
    }
}
