use chrono::{DateTime, NaiveDate, Utc};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

const TABLE: &str = "reservations";

/// Columns an UPDATE may set. `None` leaves the stored value alone; for the
/// optional names, `Some(None)` clears it.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReservationChanges {
    pub start_date: Option<Day>,
    pub end_date: Option<Day>,
    pub first_name: Option<Option<String>>,
    pub last_name: Option<Option<String>>,
    pub email: Option<String>,
}

impl ReservationChanges {
    /// Overlay the changes onto `current`, keeping its id and the given version.
    pub fn apply(self, mut current: Reservation, version: Version) -> Reservation {
        current.version = Some(version);
        if let Some(d) = self.start_date {
            current.start_date = d;
        }
        if let Some(d) = self.end_date {
            current.end_date = d;
        }
        if let Some(n) = self.first_name {
            current.owner.first_name = n;
        }
        if let Some(n) = self.last_name {
            current.owner.last_name = n;
        }
        if let Some(e) = self.email {
            current.owner.email = e;
        }
        current
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectReservations {
        start_date: Day,
        days: Option<u32>,
    },
    SelectReservation {
        id: Ulid,
    },
    InsertReservation {
        start_date: Day,
        end_date: Day,
        first_name: Option<String>,
        last_name: Option<String>,
        email: String,
    },
    UpdateReservation {
        id: Ulid,
        version: Version,
        changes: ReservationChanges,
    },
    DeleteReservation {
        id: Ulid,
        version: Version,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
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

const INSERT_COLUMNS: [&str; 5] = ["start_date", "end_date", "first_name", "last_name", "email"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    expect_table(table)?;
    let values = extract_insert_values(insert)?;

    // Named columns may come in any order; without a column list the values
    // are positional in INSERT_COLUMNS order.
    let columns: Vec<String> = if insert.columns.is_empty() {
        INSERT_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(TABLE, columns.len(), values.len()));
    }

    let (mut start_date, mut end_date, mut first_name, mut last_name, mut email) = (None, None, None, None, None);
    for (col, value) in columns.iter().zip(values.iter()) {
        match col.as_str() {
            "start_date" => start_date = Some(parse_day(value)?),
            "end_date" => end_date = Some(parse_day(value)?),
            "first_name" => first_name = parse_string_or_null(value)?,
            "last_name" => last_name = parse_string_or_null(value)?,
            "email" => email = parse_string_or_null(value)?,
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    Ok(Command::InsertReservation {
        start_date: start_date.ok_or(SqlError::MissingColumn("start_date"))?,
        end_date: end_date.ok_or(SqlError::MissingColumn("end_date"))?,
        first_name,
        last_name,
        email: email.ok_or(SqlError::MissingColumn("email"))?,
    })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    expect_table(table_factor_name(&table.relation)?)?;
    let (id, version) = extract_id_and_version(selection)?;

    let mut changes = ReservationChanges::default();
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        let value = &assignment.value;
        match col.as_str() {
            "start_date" => changes.start_date = Some(parse_day(value)?),
            "end_date" => changes.end_date = Some(parse_day(value)?),
            "first_name" => changes.first_name = Some(parse_string_or_null(value)?),
            "last_name" => changes.last_name = Some(parse_string_or_null(value)?),
            "email" => changes.email = Some(parse_string(value)?),
            "id" | "version" | "user_id" => return Err(SqlError::ReadOnlyColumn(col)),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    if changes == ReservationChanges::default() {
        return Err(SqlError::Parse("UPDATE without SET columns".into()));
    }

    Ok(Command::UpdateReservation { id, version, changes })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    expect_table(delete_table_name(delete)?)?;
    let (id, version) = extract_id_and_version(&delete.selection)?;
    Ok(Command::DeleteReservation { id, version })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    expect_table(table_factor_name(&from.relation)?)?;

    let filters = match &select.selection {
        Some(selection) => equality_filters(selection)?,
        None => Vec::new(),
    };

    let (mut id, mut start_date, mut days) = (None, None, None);
    for (col, value) in filters {
        match col.as_str() {
            "id" => id = Some(parse_ulid(value)?),
            "start_date" => start_date = Some(parse_day(value)?),
            "days" => days = Some(parse_u32(value)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    if let Some(id) = id {
        return Ok(Command::SelectReservation { id });
    }
    Ok(Command::SelectReservations {
        start_date: start_date.ok_or(SqlError::MissingFilter("start_date"))?,
        days,
    })
}

// ── Helpers ───────────────────────────────────────────────────

fn expect_table(table: String) -> Result<(), SqlError> {
    if table == TABLE {
        Ok(())
    } else {
        Err(SqlError::UnknownTable(table))
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn equality_filters(expr: &Expr) -> Result<Vec<(String, &Expr)>, SqlError> {
    let mut out = Vec::new();
    collect_equalities(expr, &mut out)?;
    Ok(out)
}

fn collect_equalities<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn extract_id_and_version(selection: &Option<Expr>) -> Result<(Ulid, Version), SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let (mut id, mut version) = (None, None);
    for (col, value) in equality_filters(sel)? {
        match col.as_str() {
            "id" => id = Some(parse_ulid(value)?),
            "version" => version = Some(parse_version(value)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    Ok((
        id.ok_or(SqlError::MissingFilter("id"))?,
        version.ok_or(SqlError::MissingFilter("version"))?,
    ))
}

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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

/// `'YYYY-MM-DD'`, or an RFC 3339 instant truncated to its UTC day.
pub fn parse_day_str(s: &str) -> Result<Day, SqlError> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc).date_naive())
        .map_err(|_| SqlError::Parse(format!("bad date: {s:?}")))
}

fn parse_day(expr: &Expr) -> Result<Day, SqlError> {
    parse_day_str(&parse_string(expr)?)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => {
            s.parse().map_err(|e| SqlError::Parse(format!("bad integer: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_version(expr: &Expr) -> Result<Version, SqlError> {
    let v = parse_i64(expr)?;
    Version::try_from(v).map_err(|_| SqlError::Parse(format!("bad version: {v}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    ReadOnlyColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::ReadOnlyColumn(c) => write!(f, "column {c} cannot be set"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
