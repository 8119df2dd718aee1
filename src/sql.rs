use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, LimitClause, ObjectNamePart, OrderByKind, SetExpr,
    Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::Ms;

/// Registry tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Students,
    Professors,
    Theses,
    Juries,
    Defenses,
}

impl Table {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "students" => Some(Table::Students),
            "professors" => Some(Table::Professors),
            "theses" => Some(Table::Theses),
            "juries" => Some(Table::Juries),
            "defenses" => Some(Table::Defenses),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Table::Students => "students",
            Table::Professors => "professors",
            Table::Theses => "theses",
            Table::Juries => "juries",
            Table::Defenses => "defenses",
        }
    }

    /// Declared column order, used for positional INSERTs and `SELECT *`.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::Students => &[
                "id", "last_name", "first_name", "email", "student_number", "birth_date",
                "program", "level",
            ],
            Table::Professors => &[
                "id", "last_name", "first_name", "email", "department", "specialty", "rank",
            ],
            Table::Theses => &[
                "id", "title", "summary", "keywords", "kind", "status", "student_id",
                "director_id", "co_director_id", "created_at", "submitted_at",
            ],
            Table::Juries => &["id", "president_id", "member_ids", "created_at"],
            Table::Defenses => &[
                "id", "thesis_id", "jury_id", "room", "start", "duration_minutes", "status",
                "final_grade", "honor", "observations",
            ],
        }
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns().iter().position(|c| *c == column)
    }
}

/// A SQL constant, also used as the cell type of result rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// `(column, value)` pairs in statement order.
pub type Fields = Vec<(String, Literal)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    ILike,
    GtEq,
    Lt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Literal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub filters: Vec<Filter>,
    /// `(column, descending)`
    pub order_by: Option<(String, bool)>,
    pub limit: Option<usize>,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    Insert {
        table: Table,
        fields: Fields,
    },
    Update {
        table: Table,
        id: Ulid,
        fields: Fields,
    },
    Delete {
        table: Table,
        id: Ulid,
    },
    Select {
        table: Table,
        query: SelectQuery,
    },
    SlotAvailability {
        room: String,
        start: Ms,
        duration_minutes: u32,
        exclude_id: Option<Ulid>,
    },
    Stats,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn registry_table(name: String) -> Result<Table, SqlError> {
    Table::from_name(&name).ok_or(SqlError::UnknownTable(name))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = registry_table(insert_table_name(insert)?)?;
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        let declared = table.columns();
        if values.len() > declared.len() {
            return Err(SqlError::WrongArity(table.name(), declared.len(), values.len()));
        }
        declared.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(table.name(), insert.columns.len(), values.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };

    let mut fields = Fields::with_capacity(values.len());
    for (column, expr) in columns.into_iter().zip(values.iter()) {
        check_column(table, &column)?;
        fields.push((column, parse_literal(expr)?));
    }
    Ok(Command::Insert { table, fields })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = registry_table(table_factor_name(&table.relation)?)?;
    let id = extract_where_id(selection)?;

    let mut fields = Fields::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        check_column(table, &column)?;
        if column == "id" {
            return Err(SqlError::Unsupported("changing a record id".into()));
        }
        fields.push((column, parse_literal(&assignment.value)?));
    }
    if fields.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }
    Ok(Command::Update { table, id, fields })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = registry_table(delete_table_name(delete)?)?;
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::Delete { table, id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let name = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match name.as_str() {
        "slot_availability" => parse_slot_availability(&filters),
        "stats" => Ok(Command::Stats),
        _ => {
            let table = registry_table(name)?;
            for f in &filters {
                check_column(table, &f.column)?;
            }
            let order_by = extract_order_by(query)?;
            if let Some((column, _)) = &order_by {
                check_column(table, column)?;
            }
            Ok(Command::Select {
                table,
                query: SelectQuery {
                    filters,
                    order_by,
                    limit: extract_limit(query)?,
                },
            })
        }
    }
}

fn parse_slot_availability(filters: &[Filter]) -> Result<Command, SqlError> {
    let find = |column: &'static str| {
        filters
            .iter()
            .find(|f| f.column == column && f.op == FilterOp::Eq)
            .map(|f| &f.value)
    };

    let room = match find("room") {
        Some(Literal::Text(room)) => room.clone(),
        Some(other) => return Err(SqlError::Parse(format!("room must be text, got {other:?}"))),
        None => return Err(SqlError::MissingFilter("room")),
    };
    let start = literal_i64(find("start").ok_or(SqlError::MissingFilter("start"))?)?;
    let duration = literal_i64(find("duration").ok_or(SqlError::MissingFilter("duration"))?)?;
    let duration_minutes =
        u32::try_from(duration).map_err(|_| SqlError::Parse(format!("{duration} out of u32 range")))?;
    let exclude_id = match find("exclude_id") {
        None | Some(Literal::Null) => None,
        Some(value) => Some(literal_ulid(value)?),
    };

    Ok(Command::SlotAvailability {
        room,
        start,
        duration_minutes,
        exclude_id,
    })
}

/// Flatten `a AND b AND ...` into simple column comparisons.
fn extract_filters(expr: &Expr, filters: &mut Vec<Filter>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    extract_filters(left, filters)?;
                    return extract_filters(right, filters);
                }
                ast::BinaryOperator::Eq => FilterOp::Eq,
                ast::BinaryOperator::GtEq => FilterOp::GtEq,
                ast::BinaryOperator::Lt => FilterOp::Lt,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            filters.push(Filter {
                column: expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?,
                op,
                value: parse_literal(right)?,
            });
            Ok(())
        }
        Expr::ILike {
            negated: false,
            expr,
            pattern,
            ..
        } => {
            filters.push(Filter {
                column: expr_column_name(expr).ok_or_else(|| SqlError::Parse(format!("expected column, got {expr}")))?,
                op: FilterOp::ILike,
                value: parse_literal(pattern)?,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn extract_order_by(query: &ast::Query) -> Result<Option<(String, bool)>, SqlError> {
    let Some(order_by) = &query.order_by else {
        return Ok(None);
    };
    let exprs = match &order_by.kind {
        OrderByKind::Expressions(exprs) => exprs,
        OrderByKind::All(_) => return Err(SqlError::Unsupported("ORDER BY ALL".into())),
    };
    match exprs.as_slice() {
        [] => Ok(None),
        [single] => {
            let column = expr_column_name(&single.expr)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {}", single.expr)))?;
            Ok(Some((column, single.options.asc == Some(false))))
        }
        _ => Err(SqlError::Unsupported("ORDER BY on several columns".into())),
    }
}

fn extract_limit(query: &ast::Query) -> Result<Option<usize>, SqlError> {
    let limit = match &query.limit_clause {
        None => return Ok(None),
        Some(LimitClause::LimitOffset { limit, offset: None, .. }) => limit.as_ref(),
        Some(_) => return Err(SqlError::Unsupported("OFFSET".into())),
    };
    match limit {
        None => Ok(None),
        Some(expr) => {
            let n = literal_i64(&parse_literal(expr)?)?;
            usize::try_from(n)
                .map(Some)
                .map_err(|_| SqlError::Parse(format!("bad LIMIT {n}")))
        }
    }
}

fn check_column(table: Table, column: &str) -> Result<(), SqlError> {
    match table.column_index(column) {
        Some(_) => Ok(()),
        None => Err(SqlError::UnknownColumn(table.name(), column.to_string())),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => literal_ulid(&parse_literal(right)?),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn parse_literal(expr: &Expr) -> Result<Literal, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(Literal::Null),
            Value::Boolean(b) => Ok(Literal::Bool(*b)),
            Value::Number(s, _) => match s.parse::<i64>() {
                Ok(n) => Ok(Literal::Int(n)),
                Err(_) => s
                    .parse::<f64>()
                    .map(Literal::Float)
                    .map_err(|e| SqlError::Parse(format!("bad number {s}: {e}"))),
            },
            Value::SingleQuotedString(s) => Ok(Literal::Text(s.clone())),
            _ => Err(SqlError::Parse(format!("unsupported literal {value}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match parse_literal(expr)? {
            Literal::Int(n) => Ok(Literal::Int(-n)),
            Literal::Float(x) => Ok(Literal::Float(-x)),
            other => Err(SqlError::Parse(format!("cannot negate {other:?}"))),
        },
        Expr::Nested(inner) => parse_literal(inner),
        _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

pub fn literal_i64(value: &Literal) -> Result<i64, SqlError> {
    match value {
        Literal::Int(n) => Ok(*n),
        Literal::Text(s) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        other => Err(SqlError::Parse(format!("expected integer, got {other:?}"))),
    }
}

pub fn literal_ulid(value: &Literal) -> Result<Ulid, SqlError> {
    match value {
        Literal::Text(s) => {
            Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        other => Err(SqlError::Parse(format!("expected ULID string, got {other:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str, &'static str),
    BadValue(&'static str, String),
}

impl SqlError {
    /// SQLSTATE reported to pgwire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(..) => "42703",
            SqlError::Unsupported(_) => "0A000",
            SqlError::MissingColumn(..) => "23502",
            SqlError::BadValue(..) => "22P02",
            SqlError::Parse(_) | SqlError::Empty | SqlError::WrongArity(..) | SqlError::MissingFilter(_) => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {c} in {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: column {c} is required"),
            SqlError::BadValue(c, msg) => write!(f, "bad value for {c}: {msg}"),
        }
    }
}

impl std::error::Error for SqlError {}
