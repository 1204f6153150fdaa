use crate::config::StreamingConfig;
use crate::data_transfer::pipe::PipeIdentity;
use crate::data_transfer::schema::{column_clause, qualified_table_name, quote_literal};
use crate::data_transfer::session::EngineSession;
use crate::db_types::{ColumnDefinition, TableRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalTableSide {
    Writable,
    Readable,
}

impl ExternalTableSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalTableSide::Writable => "writable",
            ExternalTableSide::Readable => "readable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingProtocol {
    Gpfdist,
    Gpfdists,
}

impl StreamingProtocol {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gpfdist" => Ok(StreamingProtocol::Gpfdist),
            "gpfdists" => Ok(StreamingProtocol::Gpfdists),
            other => Err(format!("Unsupported streaming protocol '{}'", other)),
        }
    }

    pub fn for_ssl(ssl_enabled: bool) -> Self {
        if ssl_enabled {
            StreamingProtocol::Gpfdists
        } else {
            StreamingProtocol::Gpfdist
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            StreamingProtocol::Gpfdist => "gpfdist",
            StreamingProtocol::Gpfdists => "gpfdists",
        }
    }
}

/// The gpfdist endpoint one external table talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingLocation {
    pub protocol: StreamingProtocol,
    pub host: String,
    pub port: u16,
}

impl StreamingLocation {
    /// Fails on an unknown protocol override, before any statement is issued.
    pub fn for_side(config: &StreamingConfig, side: ExternalTableSide) -> Result<Self, String> {
        let (port, override_protocol) = match side {
            ExternalTableSide::Writable => (config.write_port, config.write_protocol.as_deref()),
            ExternalTableSide::Readable => (config.read_port, config.read_protocol.as_deref()),
        };
        let protocol = match override_protocol {
            Some(raw) => StreamingProtocol::parse(raw)?,
            None => StreamingProtocol::for_ssl(config.ssl_enabled),
        };
        Ok(Self {
            protocol,
            host: config.host.clone(),
            port,
        })
    }

    pub fn url(&self, identity: &PipeIdentity) -> String {
        format!(
            "{}://{}:{}/{}",
            self.protocol.scheme(),
            self.host,
            self.port,
            identity.name()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTableHandle {
    pub table: TableRef,
    pub side: ExternalTableSide,
}

impl ExternalTableHandle {
    /// Catalog name of the external table for `identity` inside `schema`.
    pub fn for_identity(identity: &PipeIdentity, schema: &str, side: ExternalTableSide) -> Self {
        let name = match side {
            ExternalTableSide::Writable => identity.writable_table_name(),
            ExternalTableSide::Readable => identity.readable_table_name(),
        };
        Self {
            table: TableRef::new(schema, name),
            side,
        }
    }

    pub fn qualified_name(&self) -> String {
        qualified_table_name(&self.table)
    }
}

pub fn create_statement(
    handle: &ExternalTableHandle,
    columns: &[ColumnDefinition],
    location_url: &str,
) -> String {
    let kind = match handle.side {
        ExternalTableSide::Writable => "CREATE WRITABLE EXTERNAL TABLE",
        ExternalTableSide::Readable => "CREATE EXTERNAL TABLE",
    };
    format!(
        "{} {} ({}) LOCATION ({}) FORMAT 'TEXT'",
        kind,
        handle.qualified_name(),
        column_clause(columns),
        quote_literal(location_url)
    )
}

pub fn drop_statement(handle: &ExternalTableHandle) -> String {
    format!("DROP EXTERNAL TABLE IF EXISTS {}", handle.qualified_name())
}

pub async fn create_writable(
    session: &mut dyn EngineSession,
    identity: &PipeIdentity,
    schema: &str,
    columns: &[ColumnDefinition],
    location: &StreamingLocation,
) -> Result<ExternalTableHandle, String> {
    let handle = ExternalTableHandle::for_identity(identity, schema, ExternalTableSide::Writable);
    create(session, &handle, columns, &location.url(identity)).await?;
    Ok(handle)
}

pub async fn create_readable(
    session: &mut dyn EngineSession,
    identity: &PipeIdentity,
    schema: &str,
    columns: &[ColumnDefinition],
    location: &StreamingLocation,
) -> Result<ExternalTableHandle, String> {
    let handle = ExternalTableHandle::for_identity(identity, schema, ExternalTableSide::Readable);
    create(session, &handle, columns, &location.url(identity)).await?;
    Ok(handle)
}

async fn create(
    session: &mut dyn EngineSession,
    handle: &ExternalTableHandle,
    columns: &[ColumnDefinition],
    location_url: &str,
) -> Result<(), String> {
    log::debug!(
        "Creating {} external table {} at {}",
        handle.side.as_str(),
        handle.table,
        location_url
    );
    session
        .execute(&create_statement(handle, columns, location_url))
        .await
        .map(|_| ())
        .map_err(|e| {
            format!(
                "Failed to create {} external table {}: {}",
                handle.side.as_str(),
                handle.table,
                e
            )
        })
}

/// Drops the external table; an already absent table is not an error.
pub async fn drop_if_exists(
    session: &mut dyn EngineSession,
    handle: &ExternalTableHandle,
) -> Result<(), String> {
    match session.execute(&drop_statement(handle)).await {
        Ok(_) => Ok(()),
        Err(e) if is_missing_object_error(&e) => {
            log::debug!("External table {} already absent: {}", handle.table, e);
            Ok(())
        }
        Err(e) => Err(format!(
            "Failed to drop {} external table {}: {}",
            handle.side.as_str(),
            handle.table,
            e
        )),
    }
}

fn is_missing_object_error(error: &str) -> bool {
    let normalized = error.to_ascii_lowercase();
    normalized.contains("does not exist") || normalized.contains("42p01")
}
