use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{statement_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};

pub struct CampsiteHandler {
    engine: Arc<Engine>,
    query_parser: Arc<CampsiteQueryParser>,
}

impl CampsiteHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CampsiteQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement. Statements that
    /// fail to parse are counted too.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let started = Instant::now();
        let parsed = sql::parse_sql(query);
        let label = statement_label(&parsed);
        let result = match parsed {
            Ok(cmd) => self.execute_command(cmd).await,
            Err(e) => Err(sql_err(e)),
        };
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::SelectReservations { start_date, days } => {
                let found = engine
                    .list_within_range(start_date, days)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_rows(&found)?])
            }
            Command::SelectReservation { id } => {
                let found = engine.get(id).await.map_err(engine_err)?;
                Ok(vec![reservation_rows(found.as_slice())?])
            }
            Command::InsertReservation {
                start_date,
                end_date,
                first_name,
                last_name,
                email,
            } => {
                let owner = User::new(first_name, last_name, email);
                let created = engine
                    .create(owner, start_date, end_date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_rows(&[created])?])
            }
            Command::UpdateReservation { id, version, changes } => {
                let current = self.current(id, version).await?;
                let updated = engine
                    .update(changes.apply(current, version))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_rows(&[updated])?])
            }
            Command::DeleteReservation { id, version } => {
                let current = self.current(id, version).await?;
                let target = Reservation {
                    version: Some(version),
                    ..current
                };
                engine.delete(&target).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
        }
    }

    /// The stored reservation `id`; a missing one is a stale `version`.
    async fn current(&self, id: Ulid, version: Version) -> PgWireResult<Reservation> {
        self.engine
            .get(id)
            .await
            .map_err(engine_err)?
            .ok_or_else(|| {
                engine_err(EngineError::StaleVersion {
                    id,
                    expected: version,
                    actual: None,
                })
            })
    }
}

fn reservation_schema() -> Vec<FieldInfo> {
    let text = |name: &str| FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text);
    vec![
        text("id"),
        FieldInfo::new("version".into(), None, None, Type::INT8, FieldFormat::Text),
        text("start_date"),
        text("end_date"),
        text("user_id"),
        text("first_name"),
        text("last_name"),
        text("email"),
    ]
}

fn reservation_rows(reservations: &[Reservation]) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.map(|id| id.to_string()))?;
            encoder.encode_field(&r.version.map(|v| v as i64))?;
            encoder.encode_field(&r.start_date.to_string())?;
            encoder.encode_field(&r.end_date.to_string())?;
            encoder.encode_field(&r.owner.id.map(|id| id.to_string()))?;
            encoder.encode_field(&r.owner.first_name)?;
            encoder.encode_field(&r.owner.last_name)?;
            encoder.encode_field(&r.owner.email)?;
            Ok(encoder.take_row())
        })
        .collect();

    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns for a statement, judged from its leading keyword.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("INSERT") || upper.starts_with("UPDATE") {
        reservation_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for CampsiteHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CampsiteQueryParser;

#[async_trait]
impl QueryParser for CampsiteQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CampsiteHandler {
    type Statement = String;
    type QueryParser = CampsiteQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Byte range and index of every `$N` placeholder outside quoted literals
/// and quoted identifiers.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves it quoted.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace each `$N` with the text of parameter N as a quoted literal, in one
/// pass over the original statement. Bound values are never rescanned.
/// Placeholders with no matching parameter are left as written.
fn bind_params<T: AsRef<[u8]>>(sql: &str, params: &[Option<T>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters[..])
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CampsiteFactory {
    handler: Arc<CampsiteHandler>,
    noop: Arc<NoopHandler>,
}

impl CampsiteFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(CampsiteHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CampsiteFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> std::io::Result<()> {
    let factory = Arc::new(CampsiteFactory::new(engine));
    pgwire::tokio::process_socket(socket, None, factory).await
}

/// SQLSTATE for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidArgument(_) => "22023",
        EngineError::PolicyViolation(_) => "23514",
        EngineError::Conflict(_) => "23P01",
        EngineError::StaleVersion { .. } => "40001",
        EngineError::StoreUnavailable(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
