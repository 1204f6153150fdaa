//! In-memory engines, streaming service and filesystem for exercising the
//! transfer engine without a database cluster.

use crate::data_transfer::pipe::PipeFilesystem;
use crate::data_transfer::session::{ConnectionFactory, EngineSession};
use crate::db_types::{ColumnDefinition, ConnectionConfig, QueryResult};
use regex::{Captures, Regex};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const IDENT: &str = r#""((?:[^"]|"")*)""#;
const LITERAL: &str = r"'((?:[^']|'')*)'";

struct Grammar {
    count: Regex,
    columns: Regex,
    exists: Regex,
    create_table: Regex,
    column_def: Regex,
    create_external: Regex,
    drop_external: Regex,
    truncate: Regex,
    drop_table: Regex,
    insert_select: Regex,
}

fn grammar() -> &'static Grammar {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| {
        let table = format!(r"{}\.{}", IDENT, IDENT);
        let compile = |pattern: String| Regex::new(&pattern).unwrap();
        Grammar {
            count: compile(format!(r"^SELECT count\(\*\) AS cnt FROM {}$", table)),
            columns: compile(format!(
                r"nspname = {} AND c\.relname = {}",
                LITERAL, LITERAL
            )),
            exists: compile(format!(
                r"pg_tables WHERE schemaname = {} AND tablename = {}$",
                LITERAL, LITERAL
            )),
            create_table: compile(format!(
                r"^CREATE TABLE {} \((.*?)\)(?: DISTRIBUTED BY \([^)]*\))?$",
                table
            )),
            column_def: compile(format!(r#"{} ([^,"]+?)(?:, |$)"#, IDENT)),
            create_external: compile(format!(
                r"^CREATE (WRITABLE )?EXTERNAL TABLE {} \((.*)\) LOCATION \({}\) FORMAT 'TEXT'$",
                table, LITERAL
            )),
            drop_external: compile(format!(r"^DROP EXTERNAL TABLE IF EXISTS {}$", table)),
            truncate: compile(format!(r"^TRUNCATE TABLE {}$", table)),
            drop_table: compile(format!(r"^DROP TABLE IF EXISTS {}$", table)),
            insert_select: compile(format!(
                r"^INSERT INTO {} \(SELECT \* FROM {}(?: LIMIT (\d+))?\)$",
                table, table
            )),
        }
    })
}

fn ident(caps: &Captures, index: usize) -> String {
    caps[index].replace("\"\"", "\"")
}

fn literal(caps: &Captures, index: usize) -> String {
    caps[index].replace("''", "'")
}

type TableKey = (String, String);

#[derive(Debug, Clone)]
struct FakeExternal {
    writable: bool,
    pipe: String,
}

#[derive(Debug, Clone, Default)]
struct FakeTable {
    columns: Vec<ColumnDefinition>,
    rows: Vec<Vec<String>>,
    external: Option<FakeExternal>,
}

#[derive(Debug, Default)]
struct FakeInstance {
    tables: HashMap<TableKey, FakeTable>,
}

#[derive(Debug, Default)]
struct FakePipe {
    rows: Vec<Vec<String>>,
    writer_closed: bool,
}

#[derive(Default)]
struct ClusterState {
    instances: HashMap<String, FakeInstance>,
    pipes: HashMap<String, FakePipe>,
}

#[derive(Default)]
struct Knobs {
    stall_producer: bool,
    detach_consumer: bool,
    stall_matching: Option<Regex>,
    fail_matching: Option<Regex>,
    refused_hosts: HashSet<String>,
}

enum Reply {
    Rows(Vec<QueryResult>),
    Affected(u64),
}

enum InsertKind {
    Produce(String),
    Consume(String),
    Copy,
}

/// Engine instances keyed by host, plus the streaming service between them.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    knobs: Mutex<Knobs>,
    pipe_ready: Notify,
    open_sessions: AtomicUsize,
    opened: Mutex<Vec<String>>,
    statements: Mutex<Vec<(String, String)>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn ConnectionFactory> {
        Arc::new(FakeConnectionFactory {
            cluster: Arc::clone(self),
        })
    }

    // --- Seeding ---

    pub fn create_table(&self, host: &str, schema: &str, table: &str, rows: usize) {
        let columns = vec![
            ColumnDefinition::new("id", "integer"),
            ColumnDefinition::new("name", "text"),
        ];
        let rows = (0..rows)
            .map(|i| vec![i.to_string(), format!("row-{}", i)])
            .collect();
        let mut state = self.state.lock().unwrap();
        state.instances.entry(host.to_string()).or_default().tables.insert(
            (schema.to_string(), table.to_string()),
            FakeTable {
                columns,
                rows,
                external: None,
            },
        );
    }

    // --- Knobs ---

    /// The producer statement attaches to the pipe and never returns.
    pub fn stall_producer(&self) {
        self.knobs.lock().unwrap().stall_producer = true;
    }

    /// The consumer drains whatever is buffered instead of waiting for the writer.
    pub fn detach_consumer(&self) {
        self.knobs.lock().unwrap().detach_consumer = true;
    }

    pub fn stall_matching(&self, pattern: &str) {
        self.knobs.lock().unwrap().stall_matching = Some(Regex::new(pattern).unwrap());
    }

    pub fn fail_matching(&self, pattern: &str) {
        self.knobs.lock().unwrap().fail_matching = Some(Regex::new(pattern).unwrap());
    }

    pub fn refuse_connections(&self, host: &str) {
        self.knobs.lock().unwrap().refused_hosts.insert(host.to_string());
    }

    // --- Inspection ---

    pub fn row_count(&self, host: &str, schema: &str, table: &str) -> Option<usize> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .get(host)
            .and_then(|instance| instance.tables.get(&(schema.to_string(), table.to_string())))
            .map(|table| table.rows.len())
    }

    pub fn table_exists(&self, host: &str, schema: &str, table: &str) -> bool {
        self.row_count(host, schema, table).is_some()
    }

    pub fn columns(&self, host: &str, schema: &str, table: &str) -> Vec<ColumnDefinition> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .get(host)
            .and_then(|instance| instance.tables.get(&(schema.to_string(), table.to_string())))
            .map(|table| table.columns.clone())
            .unwrap_or_default()
    }

    pub fn external_table_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .instances
            .values()
            .flat_map(|instance| instance.tables.values())
            .filter(|table| table.external.is_some())
            .count()
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Sessions ever opened against `host`, including producer sessions.
    pub fn sessions_opened(&self, host: &str) -> usize {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|opened| opened.as_str() == host)
            .count()
    }

    /// Waits briefly for aborted tasks to release their sessions.
    pub async fn wait_for_sessions_closed(&self) -> usize {
        let started = Instant::now();
        while self.open_sessions() > 0 && started.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.open_sessions()
    }

    pub fn statements(&self, host: &str) -> Vec<String> {
        self.statements
            .lock()
            .unwrap()
            .iter()
            .filter(|(statement_host, _)| statement_host == host)
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    pub fn executed(&self, host: &str, prefix: &str) -> bool {
        self.statements(host).iter().any(|sql| sql.starts_with(prefix))
    }

    // --- Statement Handling ---

    async fn handle(&self, host: &str, sql: &str) -> Result<Reply, String> {
        self.statements
            .lock()
            .unwrap()
            .push((host.to_string(), sql.to_string()));

        let (stall, fail) = {
            let knobs = self.knobs.lock().unwrap();
            (
                knobs.stall_matching.as_ref().is_some_and(|re| re.is_match(sql)),
                knobs.fail_matching.as_ref().is_some_and(|re| re.is_match(sql)),
            )
        };
        if stall {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(format!("simulated failure: {}", sql));
        }

        let g = grammar();
        if let Some(caps) = g.insert_select.captures(sql) {
            let target = (ident(&caps, 1), ident(&caps, 2));
            let source = (ident(&caps, 3), ident(&caps, 4));
            let limit = caps.get(5).and_then(|m| m.as_str().parse::<usize>().ok());
            return self.insert_select(host, target, source, limit).await;
        }
        self.handle_sync(host, sql, g)
    }

    fn handle_sync(&self, host: &str, sql: &str, g: &Grammar) -> Result<Reply, String> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instances.entry(host.to_string()).or_default();

        if let Some(caps) = g.count.captures(sql) {
            let key = (ident(&caps, 1), ident(&caps, 2));
            let table = instance
                .tables
                .get(&key)
                .ok_or_else(|| format!("relation \"{}.{}\" does not exist", key.0, key.1))?;
            return Ok(count_reply(table.rows.len()));
        }
        if let Some(caps) = g.columns.captures(sql) {
            let key = (literal(&caps, 1), literal(&caps, 2));
            let rows = instance
                .tables
                .get(&key)
                .map(|table| {
                    table
                        .columns
                        .iter()
                        .map(|c| vec![json!(c.name), json!(c.data_type)])
                        .collect()
                })
                .unwrap_or_default();
            return Ok(Reply::Rows(vec![QueryResult {
                columns: vec!["column_name".to_string(), "data_type".to_string()],
                rows,
            }]));
        }
        if let Some(caps) = g.exists.captures(sql) {
            let key = (literal(&caps, 1), literal(&caps, 2));
            let exists = instance
                .tables
                .get(&key)
                .is_some_and(|table| table.external.is_none());
            return Ok(count_reply(usize::from(exists)));
        }
        if let Some(caps) = g.create_table.captures(sql) {
            let key = (ident(&caps, 1), ident(&caps, 2));
            if instance.tables.contains_key(&key) {
                return Err(format!("relation \"{}\" already exists", key.1));
            }
            let columns = parse_columns(&caps[3], g);
            instance.tables.insert(
                key,
                FakeTable {
                    columns,
                    ..FakeTable::default()
                },
            );
            return Ok(Reply::Affected(0));
        }
        if let Some(caps) = g.create_external.captures(sql) {
            let key = (ident(&caps, 2), ident(&caps, 3));
            let url = literal(&caps, 5);
            if !(url.starts_with("gpfdist://") || url.starts_with("gpfdists://")) {
                return Err(format!("unsupported external location '{}'", url));
            }
            if instance.tables.contains_key(&key) {
                return Err(format!("relation \"{}\" already exists", key.1));
            }
            let pipe = url.rsplit('/').next().unwrap_or_default().to_string();
            instance.tables.insert(
                key,
                FakeTable {
                    columns: parse_columns(&caps[4], g),
                    rows: Vec::new(),
                    external: Some(FakeExternal {
                        writable: caps.get(1).is_some(),
                        pipe,
                    }),
                },
            );
            return Ok(Reply::Affected(0));
        }
        if let Some(caps) = g.drop_external.captures(sql) {
            let key = (ident(&caps, 1), ident(&caps, 2));
            if instance.tables.get(&key).is_some_and(|t| t.external.is_some()) {
                instance.tables.remove(&key);
            }
            return Ok(Reply::Affected(0));
        }
        if let Some(caps) = g.truncate.captures(sql) {
            let key = (ident(&caps, 1), ident(&caps, 2));
            let table = instance
                .tables
                .get_mut(&key)
                .ok_or_else(|| format!("relation \"{}.{}\" does not exist", key.0, key.1))?;
            table.rows.clear();
            return Ok(Reply::Affected(0));
        }
        if let Some(caps) = g.drop_table.captures(sql) {
            let key = (ident(&caps, 1), ident(&caps, 2));
            instance.tables.remove(&key);
            return Ok(Reply::Affected(0));
        }
        Err(format!("syntax error: unrecognised statement '{}'", sql))
    }

    async fn insert_select(
        &self,
        host: &str,
        target: TableKey,
        source: TableKey,
        limit: Option<usize>,
    ) -> Result<Reply, String> {
        let kind = {
            let state = self.state.lock().unwrap();
            let instance = state
                .instances
                .get(host)
                .ok_or_else(|| format!("unknown instance {}", host))?;
            let lookup = |key: &TableKey| {
                instance
                    .tables
                    .get(key)
                    .ok_or_else(|| format!("relation \"{}.{}\" does not exist", key.0, key.1))
            };
            let target_table = lookup(&target)?;
            let source_table = lookup(&source)?;
            match (&target_table.external, &source_table.external) {
                (Some(external), None) if external.writable => InsertKind::Produce(external.pipe.clone()),
                (None, Some(external)) if !external.writable => InsertKind::Consume(external.pipe.clone()),
                (None, None) => InsertKind::Copy,
                _ => return Err("cannot insert between these relations".to_string()),
            }
        };

        match kind {
            InsertKind::Produce(pipe) => {
                if self.knobs.lock().unwrap().stall_producer {
                    std::future::pending::<()>().await;
                }
                let written = {
                    let mut state = self.state.lock().unwrap();
                    let rows = source_rows(&state, host, &source, limit);
                    let written = rows.len();
                    let buffer = state.pipes.entry(pipe).or_default();
                    buffer.rows.extend(rows);
                    buffer.writer_closed = true;
                    written
                };
                self.pipe_ready.notify_waiters();
                Ok(Reply::Affected(written as u64))
            }
            InsertKind::Consume(pipe) => loop {
                let notified = self.pipe_ready.notified();
                {
                    let detached = self.knobs.lock().unwrap().detach_consumer;
                    let mut state = self.state.lock().unwrap();
                    let buffer = state.pipes.entry(pipe.clone()).or_default();
                    if buffer.writer_closed || detached {
                        let rows = std::mem::take(&mut buffer.rows);
                        let read = rows.len();
                        append_rows(&mut state, host, &target, rows)?;
                        return Ok(Reply::Affected(read as u64));
                    }
                }
                notified.await;
            },
            InsertKind::Copy => {
                let mut state = self.state.lock().unwrap();
                let rows = source_rows(&state, host, &source, limit);
                let copied = rows.len();
                append_rows(&mut state, host, &target, rows)?;
                Ok(Reply::Affected(copied as u64))
            }
        }
    }
}

fn count_reply(count: usize) -> Reply {
    Reply::Rows(vec![QueryResult {
        columns: vec!["cnt".to_string()],
        rows: vec![vec![json!(count)]],
    }])
}

fn parse_columns(clause: &str, g: &Grammar) -> Vec<ColumnDefinition> {
    g.column_def
        .captures_iter(clause)
        .map(|caps| ColumnDefinition::new(ident(&caps, 1), caps[2].trim()))
        .collect()
}

fn source_rows(
    state: &ClusterState,
    host: &str,
    source: &TableKey,
    limit: Option<usize>,
) -> Vec<Vec<String>> {
    let rows = state
        .instances
        .get(host)
        .and_then(|instance| instance.tables.get(source))
        .map(|table| table.rows.clone())
        .unwrap_or_default();
    match limit {
        Some(limit) => rows.into_iter().take(limit).collect(),
        None => rows,
    }
}

fn append_rows(
    state: &mut ClusterState,
    host: &str,
    target: &TableKey,
    rows: Vec<Vec<String>>,
) -> Result<(), String> {
    state
        .instances
        .get_mut(host)
        .and_then(|instance| instance.tables.get_mut(target))
        .map(|table| table.rows.extend(rows))
        .ok_or_else(|| format!("relation \"{}.{}\" does not exist", target.0, target.1))
}

// --- Sessions ---

pub struct FakeConnectionFactory {
    cluster: Arc<FakeCluster>,
}

#[async_trait::async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn EngineSession>, String> {
        if self.cluster.knobs.lock().unwrap().refused_hosts.contains(&config.host) {
            return Err(format!("Connection Refused ({}:{})", config.host, config.port));
        }
        self.cluster.open_sessions.fetch_add(1, Ordering::SeqCst);
        self.cluster.opened.lock().unwrap().push(config.host.clone());
        Ok(Box::new(FakeSession {
            cluster: Arc::clone(&self.cluster),
            host: config.host.clone(),
            awaiting_reply: false,
        }))
    }
}

/// Like a real connection, a session whose statement future was dropped
/// still owes that statement's reply and never answers again.
pub struct FakeSession {
    cluster: Arc<FakeCluster>,
    host: String,
    awaiting_reply: bool,
}

impl FakeSession {
    async fn send(&mut self, sql: &str) -> Result<Reply, String> {
        if self.awaiting_reply {
            std::future::pending::<()>().await;
        }
        self.awaiting_reply = true;
        let reply = self.cluster.handle(&self.host, sql).await;
        self.awaiting_reply = false;
        reply
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.cluster.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl EngineSession for FakeSession {
    async fn query(&mut self, sql: &str) -> Result<Vec<QueryResult>, String> {
        match self.send(sql).await? {
            Reply::Rows(results) => Ok(results),
            Reply::Affected(_) => Ok(Vec::new()),
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, String> {
        match self.send(sql).await? {
            Reply::Rows(results) => Ok(results.iter().map(|r| r.rows.len() as u64).sum()),
            Reply::Affected(rows) => Ok(rows),
        }
    }

    async fn close(self: Box<Self>) -> Result<(), String> {
        Ok(())
    }
}

// --- Filesystem ---

#[derive(Default)]
pub struct FakeFilesystem {
    fifos: Mutex<HashSet<PathBuf>>,
    created: AtomicUsize,
}

impl FakeFilesystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fifo_count(&self) -> usize {
        self.fifos.lock().unwrap().len()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PipeFilesystem for FakeFilesystem {
    async fn create_fifo(&self, path: &Path) -> Result<(), String> {
        if !self.fifos.lock().unwrap().insert(path.to_path_buf()) {
            return Err(format!("mkfifo: '{}': File exists", path.display()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_if_exists(&self, path: &Path) -> Result<bool, String> {
        Ok(self.fifos.lock().unwrap().remove(path))
    }
}
