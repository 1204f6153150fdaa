use crate::config::TransferConfig;
use crate::data_transfer::errors::{TransferError, TransferResult, TransferSide};
use crate::data_transfer::external_table::{
    self, ExternalTableHandle, ExternalTableSide, StreamingLocation,
};
use crate::data_transfer::guard::{self, ProducerHandle, TimeoutGuard};
use crate::data_transfer::models::{TransferOutcome, TransferRequest};
use crate::data_transfer::pipe::{FifoFilesystem, PipeFilesystem, PipeIdentity};
use crate::data_transfer::schema::{self, TableDefinition};
use crate::data_transfer::session::{self, ConnectionFactory, EngineSession};
use crate::db_types::{ColumnDefinition, ConnectionConfig, QueryResult, TableRef};
use crate::postgres::PostgresConnectionFactory;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Validating,
    CheckingEmpty,
    FastCreate,
    Staging,
    Streaming,
    CleaningUp,
    Succeeded,
    Failed,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Idle => "idle",
            TransferState::Validating => "validating",
            TransferState::CheckingEmpty => "checking empty",
            TransferState::FastCreate => "fast create",
            TransferState::Staging => "staging",
            TransferState::Streaming => "streaming",
            TransferState::CleaningUp => "cleaning up",
            TransferState::Succeeded => "succeeded",
            TransferState::Failed => "failed",
        }
    }
}

/// Copies one table between engine instances through a gpfdist named pipe.
pub struct PipeTransfer {
    config: TransferConfig,
    guard: TimeoutGuard,
    factory: Arc<dyn ConnectionFactory>,
    filesystem: Arc<dyn PipeFilesystem>,
}

impl PipeTransfer {
    pub fn new(
        config: TransferConfig,
        factory: Arc<dyn ConnectionFactory>,
        filesystem: Arc<dyn PipeFilesystem>,
    ) -> Self {
        Self {
            guard: TimeoutGuard::from_config(&config),
            config,
            factory,
            filesystem,
        }
    }

    pub fn with_postgres(config: TransferConfig) -> Self {
        Self::new(
            config,
            Arc::new(PostgresConnectionFactory),
            Arc::new(FifoFilesystem),
        )
    }

    /// Runs the transfer to a terminal outcome. Cleanup always runs, after
    /// the deadline if necessary, and never replaces the original error.
    pub async fn run(&self, request: &TransferRequest) -> TransferOutcome {
        let mut run = TransferRun::new(self, request);
        let result = self.guard.within_deadline(run.drive()).await;
        run.finish(result).await
    }
}

pub fn producer_statement(
    writable: &ExternalTableHandle,
    source: &TableRef,
    sample_count: Option<u64>,
) -> String {
    let limit = sample_count
        .map(|count| format!(" LIMIT {}", count))
        .unwrap_or_default();
    format!(
        "INSERT INTO {} (SELECT * FROM {}{})",
        writable.qualified_name(),
        schema::qualified_table_name(source),
        limit
    )
}

pub fn consumer_statement(destination: &TableRef, readable: &ExternalTableHandle) -> String {
    format!(
        "INSERT INTO {} (SELECT * FROM {})",
        schema::qualified_table_name(destination),
        readable.qualified_name()
    )
}

struct StagedPipe {
    identity: PipeIdentity,
    fifo_path: PathBuf,
    writable: ExternalTableHandle,
    readable: ExternalTableHandle,
}

/// An orchestrator-owned session that remembers a statement cut off before
/// it returned. Such a connection still owes the server's reply, so nothing
/// else can run on it.
struct TrackedSession {
    inner: Box<dyn EngineSession>,
    interrupted: bool,
}

impl TrackedSession {
    fn new(inner: Box<dyn EngineSession>) -> Self {
        Self {
            inner,
            interrupted: false,
        }
    }
}

#[async_trait::async_trait]
impl EngineSession for TrackedSession {
    async fn query(&mut self, sql: &str) -> Result<Vec<QueryResult>, String> {
        self.interrupted = true;
        let results = self.inner.query(sql).await;
        self.interrupted = false;
        results
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, String> {
        self.interrupted = true;
        let affected = self.inner.execute(sql).await;
        self.interrupted = false;
        affected
    }

    async fn close(self: Box<Self>) -> Result<(), String> {
        self.inner.close().await
    }
}

/// State of one `run` call. Everything cleanup needs lives here, outside the
/// future that the deadline may drop.
struct TransferRun<'a> {
    engine: &'a PipeTransfer,
    request: &'a TransferRequest,
    label: String,
    state: TransferState,
    source: Option<TrackedSession>,
    destination: Option<TrackedSession>,
    pipe: Option<StagedPipe>,
    producer: Option<ProducerHandle>,
    created_destination: bool,
    fast_path: bool,
}

impl<'a> TransferRun<'a> {
    fn new(engine: &'a PipeTransfer, request: &'a TransferRequest) -> Self {
        Self {
            engine,
            request,
            label: format!("{} -> {}", request.source, request.destination),
            state: TransferState::Idle,
            source: None,
            destination: None,
            pipe: None,
            producer: None,
            created_destination: false,
            fast_path: false,
        }
    }

    fn transition(&mut self, next: TransferState) {
        log::debug!(
            "Transfer {}: {} -> {}",
            self.label,
            self.state.as_str(),
            next.as_str()
        );
        self.state = next;
    }

    fn source(&mut self) -> TransferResult<&mut TrackedSession> {
        let stage = self.state.as_str();
        self.source
            .as_mut()
            .ok_or_else(|| TransferError::failed(stage, "source session is not open"))
    }

    fn destination(&mut self) -> TransferResult<&mut TrackedSession> {
        let stage = self.state.as_str();
        self.destination
            .as_mut()
            .ok_or_else(|| TransferError::failed(stage, "destination session is not open"))
    }

    async fn drive(&mut self) -> TransferResult<u64> {
        let request = self.request;

        self.transition(TransferState::Validating);
        request.validate()?;
        let source = self.open(TransferSide::Source, &request.source_connection).await?;
        self.source = Some(TrackedSession::new(source));
        let destination = self
            .open(TransferSide::Destination, &request.destination_connection)
            .await?;
        self.destination = Some(TrackedSession::new(destination));

        self.transition(TransferState::CheckingEmpty);
        let source_rows = self.count_source_rows().await?;
        let rows_to_move = request.options.effective_row_count(source_rows);
        if rows_to_move == 0 {
            // Nothing would ever open the pipe for writing; skip streaming.
            self.transition(TransferState::FastCreate);
            self.fast_path = true;
            self.prepare_destination(None).await?;
            return Ok(0);
        }

        self.transition(TransferState::Staging);
        let columns = self.introspect_source().await?;
        self.prepare_destination(Some(&columns)).await?;
        self.stage_pipe(&columns).await?;

        self.transition(TransferState::Streaming);
        let rows = self.stream().await?;
        if rows != rows_to_move {
            log::warn!(
                "Transfer {} moved {} rows but the source reported {}",
                self.label,
                rows,
                rows_to_move
            );
        }
        Ok(rows)
    }

    async fn open(
        &self,
        side: TransferSide,
        config: &ConnectionConfig,
    ) -> TransferResult<Box<dyn EngineSession>> {
        self.engine
            .factory
            .open(config)
            .await
            .map_err(|e| TransferError::connection(side, e))
    }

    async fn count_source_rows(&mut self) -> TransferResult<u64> {
        let request = self.request;
        let sql = schema::row_count_query(&request.source);
        session::query_count(self.source()?, &sql)
            .await
            .map_err(|e| {
                if e.to_ascii_lowercase().contains("does not exist") {
                    TransferError::SchemaIntrospection {
                        table: request.source.to_string(),
                        reason: e,
                    }
                } else {
                    TransferError::failed("checking source row count", e)
                }
            })
    }

    async fn introspect_source(&mut self) -> TransferResult<Vec<ColumnDefinition>> {
        let request = self.request;
        let sql = schema::column_metadata_query(&request.source);
        let results = self.source()?.query(&sql).await.map_err(|e| {
            TransferError::SchemaIntrospection {
                table: request.source.to_string(),
                reason: e,
            }
        })?;
        schema::column_definitions_from_results(&request.source, &results)
    }

    async fn destination_exists(&mut self) -> TransferResult<bool> {
        let sql = schema::table_exists_query(&self.request.destination);
        let stage = self.state.as_str();
        session::query_count(self.destination()?, &sql)
            .await
            .map(|count| count > 0)
            .map_err(|e| TransferError::failed(stage, e))
    }

    /// Creates the destination when it is missing or a new table was asked
    /// for; otherwise truncates it on request.
    async fn prepare_destination(
        &mut self,
        known_columns: Option<&[ColumnDefinition]>,
    ) -> TransferResult<()> {
        let request = self.request;
        let options = &request.options;
        let stage = self.state.as_str();

        if options.new_table || !self.destination_exists().await? {
            let columns = match known_columns {
                Some(columns) => columns.to_vec(),
                None => self.introspect_source().await?,
            };
            let definition =
                TableDefinition::new(columns, &options.primary_key, &options.distribution_key);
            let ddl = schema::create_table_statement(
                &request.destination,
                &definition,
                self.engine.config.distribution_key_arity,
            );
            self.destination()?
                .execute(&ddl)
                .await
                .map_err(|e| TransferError::failed(stage, e))?;
            self.created_destination = true;
            log::info!("Created destination table {}", request.destination);
        } else if options.truncate {
            let sql = schema::truncate_table_statement(&request.destination);
            self.destination()?
                .execute(&sql)
                .await
                .map_err(|e| TransferError::failed(stage, e))?;
            log::info!("Truncated destination table {}", request.destination);
        }
        Ok(())
    }

    async fn stage_pipe(&mut self, columns: &[ColumnDefinition]) -> TransferResult<()> {
        let engine = self.engine;
        let request = self.request;
        let streaming = &engine.config.streaming;
        let staging_error = |e: String| TransferError::failed("staging", e);

        let write_location = StreamingLocation::for_side(streaming, ExternalTableSide::Writable)
            .map_err(staging_error)?;
        let read_location = StreamingLocation::for_side(streaming, ExternalTableSide::Readable)
            .map_err(staging_error)?;

        let identity = PipeIdentity::allocate();
        let staged = StagedPipe {
            fifo_path: identity.fifo_path(&streaming.data_dir),
            writable: ExternalTableHandle::for_identity(
                &identity,
                &request.source.schema,
                ExternalTableSide::Writable,
            ),
            readable: ExternalTableHandle::for_identity(
                &identity,
                &request.destination.schema,
                ExternalTableSide::Readable,
            ),
            identity: identity.clone(),
        };
        let fifo_path = staged.fifo_path.clone();
        // Recorded before anything is created so cleanup covers partial staging.
        self.pipe = Some(staged);
        log::debug!("Transfer {} staging pipe {}", self.label, identity);

        engine
            .filesystem
            .create_fifo(&fifo_path)
            .await
            .map_err(staging_error)?;
        external_table::create_writable(
            self.source()?,
            &identity,
            &request.source.schema,
            columns,
            &write_location,
        )
        .await
        .map_err(staging_error)?;
        external_table::create_readable(
            self.destination()?,
            &identity,
            &request.destination.schema,
            columns,
            &read_location,
        )
        .await
        .map_err(staging_error)?;
        Ok(())
    }

    async fn stream(&mut self) -> TransferResult<u64> {
        let engine = self.engine;
        let request = self.request;
        let guard = engine.guard;
        let (producer_sql, consumer_sql) = match &self.pipe {
            Some(pipe) => (
                producer_statement(&pipe.writable, &request.source, request.options.sample_count),
                consumer_statement(&request.destination, &pipe.readable),
            ),
            None => return Err(TransferError::failed("streaming", "pipe was not staged")),
        };

        // Started before the consumer statement so a writer is attached
        // before the reader opens the pipe.
        let factory = Arc::clone(&engine.factory);
        let source_config = request.source_connection.clone();
        self.producer = Some(tokio::spawn(async move {
            let mut session = factory
                .open(&source_config)
                .await
                .map_err(|e| format!("Producer connection failed: {}", e))?;
            let written = session.execute(&producer_sql).await;
            if let Err(e) = session.close().await {
                log::warn!("Failed to close producer session: {}", e);
            }
            written
        }));

        let destination = self
            .destination
            .as_mut()
            .ok_or_else(|| TransferError::failed("streaming", "destination session is not open"))?;
        let producer = self
            .producer
            .as_mut()
            .ok_or_else(|| TransferError::failed("streaming", "producer was not started"))?;

        let consumer = destination.execute(&consumer_sql);
        tokio::pin!(consumer);

        tokio::select! {
            consumed = &mut consumer => {
                let rows = consumed
                    .map_err(|e| TransferError::failed("streaming (consumer)", e))?;
                let produced = guard.join_producer(producer).await?;
                log::debug!("Producer wrote {} rows, consumer read {}", produced, rows);
                Ok(rows)
            }
            joined = &mut *producer => {
                // A failed producer would leave the reader waiting on the pipe.
                let produced = guard::producer_result(joined)?;
                let rows = consumer
                    .await
                    .map_err(|e| TransferError::failed("streaming (consumer)", e))?;
                log::debug!("Producer wrote {} rows, consumer read {}", produced, rows);
                Ok(rows)
            }
        }
    }

    async fn finish(mut self, result: TransferResult<u64>) -> TransferOutcome {
        if let Err(error) = &result {
            log::error!(
                "Transfer {} failed during {}: {}",
                self.label,
                self.state.as_str(),
                error
            );
            if error.is_timeout() {
                log::warn!(
                    "Transfer {} abandoned its in-flight statements; their sessions are replaced for cleanup",
                    self.label
                );
            }
        }

        self.transition(TransferState::CleaningUp);
        let cleanup_warnings = self.cleanup(result.is_ok()).await;

        match result {
            Ok(rows_transferred) => {
                self.transition(TransferState::Succeeded);
                log::info!(
                    "Transfer {} succeeded: {} rows{}",
                    self.label,
                    rows_transferred,
                    if self.fast_path { " (empty source)" } else { "" }
                );
                TransferOutcome::Succeeded {
                    rows_transferred,
                    destination: self.request.destination.clone(),
                    fast_path: self.fast_path,
                    cleanup_warnings,
                }
            }
            Err(error) => {
                self.transition(TransferState::Failed);
                TransferOutcome::Failed {
                    error,
                    created_destination: self.created_destination,
                    cleanup_warnings,
                }
            }
        }
    }

    /// Best-effort teardown. Each step is bounded and independent of the
    /// producer; failures become warnings.
    async fn cleanup(&mut self, succeeded: bool) -> Vec<String> {
        let guard = self.engine.guard;
        let filesystem = Arc::clone(&self.engine.filesystem);
        let mut warnings = Vec::new();
        let mut record = |result: TransferResult<()>| {
            if let Err(error) = result {
                log::warn!("{}", error);
                warnings.push(error.to_string());
            }
        };

        // Dropping the producer's session releases its hold on the writable table.
        if let Some(handle) = self.producer.take() {
            if !handle.is_finished() {
                log::warn!("Abandoning unfinished producer for {}", self.label);
                handle.abort();
            }
        }

        for side in [TransferSide::Source, TransferSide::Destination] {
            record(self.replace_interrupted_session(side).await);
        }

        if let Some(pipe) = self.pipe.take() {
            if let Some(source) = self.source.as_mut() {
                record(
                    guard
                        .bounded_cleanup(
                            "drop writable external table",
                            external_table::drop_if_exists(source, &pipe.writable),
                        )
                        .await,
                );
            }
            if let Some(destination) = self.destination.as_mut() {
                record(
                    guard
                        .bounded_cleanup(
                            "drop readable external table",
                            external_table::drop_if_exists(destination, &pipe.readable),
                        )
                        .await,
                );
            }
            record(
                guard
                    .bounded_cleanup("remove pipe", filesystem.remove_if_exists(&pipe.fifo_path))
                    .await
                    .map(|removed| {
                        if removed {
                            log::debug!("Removed pipe {}", pipe.identity);
                        }
                    }),
            );
        }

        if !succeeded && self.created_destination {
            let sql = schema::drop_table_statement(&self.request.destination);
            match self.destination.as_mut() {
                Some(destination) => {
                    let dropped = guard
                        .bounded_cleanup("drop destination table", destination.execute(&sql))
                        .await;
                    if dropped.is_ok() {
                        log::info!(
                            "Dropped destination table {} created by the failed run",
                            self.request.destination
                        );
                    }
                    record(dropped.map(|_| ()));
                }
                None => record(Err(TransferError::cleanup(
                    "drop destination table",
                    "destination session is not open",
                ))),
            }
        }

        for (step, session) in [
            ("close source session", self.source.take()),
            ("close destination session", self.destination.take()),
        ] {
            if let Some(session) = session {
                record(guard.bounded_cleanup(step, Box::new(session).close()).await);
            }
        }

        warnings
    }

    /// Disconnects a session left mid-statement by the deadline or by a lost
    /// `select!` race, and opens a fresh one from the same descriptor so the
    /// remaining cleanup statements are not queued behind the dead one.
    async fn replace_interrupted_session(&mut self, side: TransferSide) -> TransferResult<()> {
        let engine = self.engine;
        let request = self.request;
        let (slot, config) = match side {
            TransferSide::Source => (&mut self.source, &request.source_connection),
            TransferSide::Destination => (&mut self.destination, &request.destination_connection),
        };
        if !slot.as_ref().is_some_and(|session| session.interrupted) {
            return Ok(());
        }

        if let Some(interrupted) = slot.take() {
            log::warn!(
                "Disconnecting {} session of {} interrupted mid-statement",
                side,
                self.label
            );
            drop(interrupted);
        }
        let fresh = engine
            .guard
            .bounded_cleanup(
                &format!("reopen {} session", side),
                engine.factory.open(config),
            )
            .await?;
        *slot = Some(TrackedSession::new(fresh));
        Ok(())
    }
}
