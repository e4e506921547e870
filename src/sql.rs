use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterBusiness {
        id: Ulid,
        name: Option<String>,
    },
    RegisterService {
        id: Ulid,
        business_id: Ulid,
        duration_minutes: u32,
        price_cents: i64,
        active: bool,
    },
    RetireService {
        id: Ulid,
    },
    SetWorkingHours {
        business_id: Ulid,
        weekday: u8,
        start_minute: u16,
        end_minute: u16,
        active: bool,
    },
    ReplaceWorkingHours {
        business_id: Ulid,
        week: Vec<DaySchedule>,
    },
    ClearWorkingHours {
        business_id: Ulid,
        weekday: u8,
    },
    CreateBooking {
        id: Ulid,
        business_id: Ulid,
        service_id: Ulid,
        customer_id: Option<Ulid>,
        start: Ms,
        end: Ms,
        notes: Option<String>,
    },
    SetBookingStatus {
        id: Ulid,
        status: BookingStatus,
        customer_id: Option<Ulid>,
    },
    ConfirmPayment {
        id: Ulid,
        method: String,
        reference: String,
    },
    SelectSlots {
        business_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    },
    SelectServices {
        business_id: Ulid,
    },
    SelectBookings {
        business_id: Ulid,
        date: Option<NaiveDate>,
    },
    SelectWorkingHours {
        business_id: Ulid,
    },
    SelectSubscription {
        business_id: Ulid,
    },
    CancelSubscription {
        business_id: Ulid,
    },
    ReactivateSubscription {
        business_id: Ulid,
    },
    ActivateSubscription {
        business_id: Ulid,
        billing_ref: Option<String>,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let all_rows = extract_all_insert_rows(insert)?;

    match table.as_str() {
        "businesses" => {
            let values = &all_rows[0];
            if values.is_empty() {
                return Err(SqlError::WrongArity("businesses", 1, 0));
            }
            let id = parse_ulid(&values[0])?;
            let name = if values.len() >= 2 {
                parse_string_or_null(&values[1])?
            } else {
                None
            };
            Ok(Command::RegisterBusiness { id, name })
        }
        "services" => {
            let values = &all_rows[0];
            if values.len() < 4 {
                return Err(SqlError::WrongArity("services", 4, values.len()));
            }
            let active = if values.len() >= 5 {
                parse_bool(&values[4])?
            } else {
                true
            };
            Ok(Command::RegisterService {
                id: parse_ulid(&values[0])?,
                business_id: parse_ulid(&values[1])?,
                duration_minutes: parse_u32(&values[2])?,
                price_cents: parse_i64(&values[3])?,
                active,
            })
        }
        "working_hours" => {
            // One row upserts a weekday; several rows replace the week.
            let mut days = Vec::with_capacity(all_rows.len());
            let mut business_id = None;
            for (i, row) in all_rows.iter().enumerate() {
                if row.len() < 5 {
                    return Err(SqlError::WrongArity("working_hours row", 5, row.len()));
                }
                let row_err = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                let bid = parse_ulid(&row[0]).map_err(row_err)?;
                match business_id {
                    None => business_id = Some(bid),
                    Some(prev) if prev != bid => {
                        return Err(SqlError::Parse(
                            "working_hours rows must share one business_id".into(),
                        ));
                    }
                    Some(_) => {}
                }
                days.push(DaySchedule {
                    weekday: parse_u8(&row[1]).map_err(row_err)?,
                    start_minute: parse_u16(&row[2]).map_err(row_err)?,
                    end_minute: parse_u16(&row[3]).map_err(row_err)?,
                    active: parse_bool(&row[4]).map_err(row_err)?,
                });
            }
            let business_id =
                business_id.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
            if days.len() == 1 {
                let day = days[0];
                Ok(Command::SetWorkingHours {
                    business_id,
                    weekday: day.weekday,
                    start_minute: day.start_minute,
                    end_minute: day.end_minute,
                    active: day.active,
                })
            } else {
                Ok(Command::ReplaceWorkingHours {
                    business_id,
                    week: days,
                })
            }
        }
        "bookings" => {
            let values = &all_rows[0];
            if values.len() < 6 {
                return Err(SqlError::WrongArity("bookings", 6, values.len()));
            }
            let notes = if values.len() >= 7 {
                parse_string_or_null(&values[6])?
            } else {
                None
            };
            Ok(Command::CreateBooking {
                id: parse_ulid(&values[0])?,
                business_id: parse_ulid(&values[1])?,
                service_id: parse_ulid(&values[2])?,
                customer_id: parse_ulid_or_null(&values[3])?,
                start: parse_i64(&values[4])?,
                end: parse_i64(&values[5])?,
                notes,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "working_hours" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = collect_eq_filters(&delete.selection);
    let business_id =
        filter_ulid(&filters, "business_id")?.ok_or(SqlError::MissingFilter("business_id"))?;
    let weekday = filter_u8(&filters, "weekday")?.ok_or(SqlError::MissingFilter("weekday"))?;
    Ok(Command::ClearWorkingHours {
        business_id,
        weekday,
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let sets = collect_assignments(assignments)?;
    let filters = collect_eq_filters(selection);

    match table.as_str() {
        "services" => {
            let id = filter_ulid(&filters, "id")?.ok_or(SqlError::MissingFilter("id"))?;
            match assignment(&sets, "active") {
                Some(expr) => {
                    if parse_bool(expr)? {
                        Err(SqlError::Unsupported("reinstating a retired service".into()))
                    } else {
                        Ok(Command::RetireService { id })
                    }
                }
                None => Err(SqlError::MissingAssignment("active")),
            }
        }
        "bookings" => {
            let id = filter_ulid(&filters, "id")?.ok_or(SqlError::MissingFilter("id"))?;
            if let Some(expr) = assignment(&sets, "status") {
                let status = parse_status(expr)?;
                let customer_id = filter_ulid(&filters, "customer_id")?;
                return Ok(Command::SetBookingStatus {
                    id,
                    status,
                    customer_id,
                });
            }
            if let Some(expr) = assignment(&sets, "is_paid") {
                if !parse_bool(expr)? {
                    return Err(SqlError::Unsupported("clearing is_paid".into()));
                }
                let method = assignment(&sets, "payment_method")
                    .map(parse_string)
                    .transpose()?
                    .ok_or(SqlError::MissingAssignment("payment_method"))?;
                let reference = assignment(&sets, "payment_ref")
                    .map(parse_string)
                    .transpose()?
                    .ok_or(SqlError::MissingAssignment("payment_ref"))?;
                return Ok(Command::ConfirmPayment {
                    id,
                    method,
                    reference,
                });
            }
            Err(SqlError::MissingAssignment("status or is_paid"))
        }
        "subscriptions" => {
            let business_id = filter_ulid(&filters, "business_id")?
                .ok_or(SqlError::MissingFilter("business_id"))?;
            if let Some(expr) = assignment(&sets, "cancel_at_period_end") {
                return Ok(if parse_bool(expr)? {
                    Command::CancelSubscription { business_id }
                } else {
                    Command::ReactivateSubscription { business_id }
                });
            }
            if let Some(expr) = assignment(&sets, "status") {
                let status = parse_string(expr)?;
                if status == "active" {
                    let billing_ref = assignment(&sets, "billing_ref")
                        .map(parse_string)
                        .transpose()?;
                    return Ok(Command::ActivateSubscription {
                        business_id,
                        billing_ref,
                    });
                }
                return Err(SqlError::Unsupported(format!(
                    "subscription status assignment '{status}'"
                )));
            }
            Err(SqlError::MissingAssignment("cancel_at_period_end or status"))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = collect_eq_filters(&select.selection);

    let business_id = filter_ulid(&filters, "business_id")?
        .ok_or(SqlError::MissingFilter("business_id"))?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            business_id,
            service_id: filter_ulid(&filters, "service_id")?
                .ok_or(SqlError::MissingFilter("service_id"))?,
            date: filter_date(&filters, "date")?.ok_or(SqlError::MissingFilter("date"))?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            business_id,
            date: filter_date(&filters, "date")?,
        }),
        "services" => Ok(Command::SelectServices { business_id }),
        "working_hours" => Ok(Command::SelectWorkingHours { business_id }),
        "subscriptions" => Ok(Command::SelectSubscription { business_id }),
        _ => Err(SqlError::UnknownTable(table)),
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Flatten an AND-tree of `column = value` predicates into pairs.
fn collect_eq_filters(selection: &Option<Expr>) -> Vec<(String, Expr)> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk_eq_filters(expr, &mut out);
    }
    out
}

fn walk_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                walk_eq_filters(left, out);
                walk_eq_filters(right, out);
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, (**right).clone()));
                }
            }
            _ => {}
        }
    }
}

fn collect_assignments(assignments: &[ast::Assignment]) -> Result<Vec<(String, Expr)>, SqlError> {
    let mut out = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty assignment target".into()))?,
            _ => return Err(SqlError::Parse("unsupported assignment target".into())),
        };
        out.push((col, a.value.clone()));
    }
    Ok(out)
}

fn assignment<'a>(sets: &'a [(String, Expr)], col: &str) -> Option<&'a Expr> {
    sets.iter().find(|(name, _)| name == col).map(|(_, e)| e)
}

fn filter<'a>(filters: &'a [(String, Expr)], col: &str) -> Option<&'a Expr> {
    filters.iter().find(|(name, _)| name == col).map(|(_, e)| e)
}

fn filter_ulid(filters: &[(String, Expr)], col: &str) -> Result<Option<Ulid>, SqlError> {
    filter(filters, col).map(parse_ulid).transpose()
}

fn filter_u8(filters: &[(String, Expr)], col: &str) -> Result<Option<u8>, SqlError> {
    filter(filters, col).map(parse_u8).transpose()
}

fn filter_date(filters: &[(String, Expr)], col: &str) -> Result<Option<NaiveDate>, SqlError> {
    filter(filters, col).map(parse_date).transpose()
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?,
            )),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u16 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = parse_string(expr)?;
    BookingStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingAssignment(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingAssignment(col) => write!(f, "missing assignment: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
