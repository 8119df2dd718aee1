use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::{Credentials, VivatAuthSource};
use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS, SCHEDULING_CONFLICTS_TOTAL};
use crate::record::{self, Record};
use crate::sql::{self, Command, Fields, Literal, SqlError, Table};
use crate::tenant::TenantManager;

pub struct VivatHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<VivatQueryParser>,
}

impl VivatHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(VivatQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("database error: {e}"),
            )))
        })
    }

    /// Parse and run one statement, recording its outcome in the query metrics.
    async fn run(&self, engine: &Engine, sql: &str, format: &Format) -> PgWireResult<Response> {
        let started = Instant::now();
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(SqlError::Empty) => return Ok(Response::EmptyQuery),
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "invalid", "status" => "error").increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let result = self.execute_command(engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::Insert { table, fields } => {
                insert(engine, table, &fields).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Update { table, id, fields } => {
                update(engine, table, id, &fields).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::Delete { table, id } => {
                match table {
                    Table::Students => engine.delete_student(id).await,
                    Table::Professors => engine.delete_professor(id).await,
                    Table::Theses => engine.delete_thesis(id).await,
                    Table::Juries => engine.delete_jury(id).await,
                    Table::Defenses => engine.delete_defense(id).await,
                }
                .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::Select { table, query } => {
                let rows = match table {
                    Table::Students => rows_of(&engine.list_students()),
                    Table::Professors => rows_of(&engine.list_professors()),
                    Table::Theses => rows_of(&engine.list_theses()),
                    Table::Juries => rows_of(&engine.list_juries()),
                    Table::Defenses => rows_of(&engine.list_defenses().await),
                };
                let rows = record::select_rows(table, rows, &query);
                query_response(table_columns(table), format, rows)
            }
            Command::SlotAvailability {
                room,
                start,
                duration_minutes,
                exclude_id,
            } => {
                let available = engine
                    .is_slot_available(&room, start, duration_minutes, exclude_id)
                    .await
                    .map_err(engine_err)?;
                let row = vec![
                    Literal::Text(room),
                    Literal::Int(start),
                    Literal::Int(i64::from(duration_minutes)),
                    Literal::Bool(available),
                ];
                query_response(slot_columns(), format, vec![row])
            }
            Command::Stats => {
                let dashboard = engine.dashboard().await;
                query_response(stats_columns(), format, stats_rows(&dashboard))
            }
        }
    }
}

async fn insert(engine: &Engine, table: Table, fields: &Fields) -> PgWireResult<()> {
    let now = now_ms();
    match table {
        Table::Students => engine.create_student(build(fields, now)?).await,
        Table::Professors => engine.create_professor(build(fields, now)?).await,
        Table::Theses => engine.create_thesis(build(fields, now)?).await,
        Table::Juries => engine.create_jury(build(fields, now)?).await,
        Table::Defenses => engine.create_defense(build(fields, now)?).await,
    }
    .map_err(engine_err)
}

fn build<R: Record>(fields: &Fields, now: Ms) -> PgWireResult<R> {
    record::from_fields(fields, now).map_err(sql_err)
}

/// Merge the assignments into the stored record, then route to the narrowest
/// engine operation that covers them.
async fn update(engine: &Engine, table: Table, id: Ulid, fields: &Fields) -> PgWireResult<()> {
    let sets_only = |columns: &[&str]| {
        fields.len() == columns.len() && fields.iter().all(|(c, _)| columns.contains(&c.as_str()))
    };
    let result = match table {
        Table::Students => {
            let student = merged(engine.get_student(&id), id, fields)?;
            engine.update_student(student).await
        }
        Table::Professors => {
            let professor = merged(engine.get_professor(&id), id, fields)?;
            engine.update_professor(professor).await
        }
        Table::Theses => {
            let thesis = merged(engine.get_thesis(&id), id, fields)?;
            if sets_only(&["status"]) {
                engine.set_thesis_status(id, thesis.status).await.map(drop)
            } else {
                engine.update_thesis(thesis).await
            }
        }
        Table::Juries => {
            let jury = merged(engine.get_jury(&id), id, fields)?;
            engine.update_jury(jury).await
        }
        Table::Defenses => {
            let defense = merged(engine.get_defense(&id).await, id, fields)?;
            if sets_only(&["status"]) {
                engine.set_defense_status(id, defense.status).await.map(drop)
            } else if sets_only(&["final_grade", "honor"])
                && let (Some(grade), Some(honor)) = (defense.final_grade, defense.honor)
            {
                engine.record_grade(id, grade, honor).await.map(drop)
            } else {
                engine.update_defense(defense).await
            }
        }
    };
    result.map_err(engine_err)
}

fn merged<R: Record>(current: Option<R>, id: Ulid, fields: &Fields) -> PgWireResult<R> {
    let mut record = current.ok_or_else(|| engine_err(EngineError::NotFound(id)))?;
    record::merge(&mut record, fields).map_err(sql_err)?;
    Ok(record)
}

fn rows_of<R: Record>(records: &[R]) -> Vec<Vec<Literal>> {
    records.iter().map(Record::row).collect()
}

fn stats_rows(d: &Dashboard) -> Vec<Vec<Literal>> {
    let row = |metric: &str, label: String, value: usize| {
        vec![
            Literal::Text(metric.into()),
            Literal::Text(label),
            Literal::Int(value as i64),
        ]
    };
    let mut rows = vec![
        row("total", "students".into(), d.students),
        row("total", "professors".into(), d.professors),
        row("total", "theses".into(), d.theses),
        row("total", "juries".into(), d.juries),
        row("total", "defenses".into(), d.defenses),
    ];
    rows.extend(d.theses_by_status.iter().map(|(s, n)| row("theses_by_status", s.to_string(), *n)));
    rows.extend(d.defenses_by_status.iter().map(|(s, n)| row("defenses_by_status", s.to_string(), *n)));
    rows.extend(
        d.students_per_program
            .iter()
            .map(|(program, n)| row("students_per_program", program.clone(), *n)),
    );
    rows.extend(d.upcoming.iter().map(|defense| {
        vec![
            Literal::Text("upcoming_defense".into()),
            Literal::Text(defense.id.to_string()),
            Literal::Int(defense.start),
        ]
    }));
    rows
}

// ── Result schemas ───────────────────────────────────────────────

fn column_type(column: &str) -> Type {
    match column {
        "birth_date" | "created_at" | "submitted_at" | "start" | "duration_minutes" => Type::INT8,
        "final_grade" => Type::FLOAT8,
        _ => Type::VARCHAR,
    }
}

type Columns = Vec<(&'static str, Type)>;

fn fields(columns: &Columns, format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

fn table_columns(table: Table) -> Columns {
    table.columns().iter().map(|c| (*c, column_type(c))).collect()
}

fn slot_columns() -> Columns {
    vec![
        ("room", Type::VARCHAR),
        ("start", Type::INT8),
        ("duration_minutes", Type::INT8),
        ("available", Type::BOOL),
    ]
}

fn stats_columns() -> Columns {
    vec![("metric", Type::VARCHAR), ("label", Type::VARCHAR), ("value", Type::INT8)]
}

/// Row description for a statement, without running it.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let lower = sql.to_ascii_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let Some(source) = lower.split_whitespace().skip_while(|w| *w != "from").nth(1) else {
        return vec![];
    };
    let columns = match source.trim_end_matches(';') {
        "slot_availability" => slot_columns(),
        "stats" => stats_columns(),
        name => Table::from_name(name).map_or_else(Vec::new, table_columns),
    };
    fields(&columns, format)
}

fn query_response(columns: Columns, format: &Format, rows: Vec<Vec<Literal>>) -> PgWireResult<Response> {
    let schema = Arc::new(fields(&columns, format));
    let rows: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for (cell, (_, ty)) in row.iter().zip(&columns) {
                match cell {
                    Literal::Null if *ty == Type::INT8 => encoder.encode_field(&None::<i64>)?,
                    Literal::Null if *ty == Type::FLOAT8 => encoder.encode_field(&None::<f64>)?,
                    Literal::Null => encoder.encode_field(&None::<String>)?,
                    Literal::Bool(b) => encoder.encode_field(b)?,
                    Literal::Int(n) => encoder.encode_field(n)?,
                    Literal::Float(x) => encoder.encode_field(x)?,
                    Literal::Text(s) => encoder.encode_field(s)?,
                }
            }
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for VivatHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let response = self.run(&engine, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct VivatQueryParser;

#[async_trait]
impl QueryParser for VivatQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for VivatHandler {
    type Statement = String;
    type QueryParser = VivatQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let params: Vec<Option<&[u8]>> = portal.parameters.iter().map(|p| p.as_deref()).collect();
        let sql = substitute_params(&portal.statement.statement, &params);
        self.run(&engine, &sql, &portal.result_column_format).await
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
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement, &Format::UnifiedText),
        ))
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// `$N` placeholders outside string literals, as (byte range, N).
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b'$' if !in_string => {
                let start = i;
                while i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..=i].parse::<usize>()
                    && n > 0
                {
                    found.push((start..i + 1, n));
                }
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound parameters (text format) as quoted literals.
fn substitute_params(sql: &str, params: &[Option<&[u8]>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = params.get(n - 1) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
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

// ── Factory ──────────────────────────────────────────────────────

pub struct VivatFactory {
    handler: Arc<VivatHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<VivatAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl VivatFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, credentials: Arc<Credentials>) -> Self {
        let auth_source = VivatAuthSource::new(credentials);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(VivatHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for VivatFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    credentials: Arc<Credentials>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(VivatFactory::new(tenant_manager, credentials));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    if matches!(e, EngineError::Conflict(_)) {
        metrics::counter!(SCHEDULING_CONFLICTS_TOTAL).increment(1);
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
