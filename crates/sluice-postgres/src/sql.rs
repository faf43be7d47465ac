//! Statement building, value binding and error classification for Postgres

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;
use sluice::error::{DbContext, DbOp, IngestError, Result};
use sluice::identifier::IdentifierPolicy;
use sluice::table::{SqlColumn, Table};
use sluice::DataType;
use tokio_postgres::types::ToSql;

/// Boxed bind parameter.
pub(crate) type PgValue = Box<dyn ToSql + Sync + Send>;

pub(crate) fn as_param(value: &PgValue) -> &(dyn ToSql + Sync) {
    value.as_ref()
}

/// Words that cannot appear bare as identifiers.
pub(crate) const RESERVED_WORDS: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "both", "case", "cast",
    "check", "collate", "column", "constraint", "create", "current_date", "default", "desc",
    "distinct", "do", "else", "end", "false", "for", "foreign", "from", "grant", "group",
    "having", "in", "initially", "intersect", "into", "leading", "limit", "localtime", "not",
    "null", "offset", "on", "only", "or", "order", "placing", "primary", "references",
    "returning", "select", "session_user", "some", "symmetric", "table", "then", "to",
    "trailing", "true", "union", "unique", "user", "using", "when", "where", "window", "with",
];

pub(crate) fn identifier_policy() -> IdentifierPolicy {
    IdentifierPolicy {
        max_length: 63,
        reserved_words: RESERVED_WORDS,
        quote_char: '"',
        lowercase: true,
    }
}

/// Column list of a live table, `pg_catalog`-backed so dropped columns and
/// materialized artifacts stay invisible.
pub(crate) const TABLE_SCHEMA_QUERY: &str = "\
SELECT pg_attribute.attname AS name,
       pg_catalog.format_type(pg_attribute.atttypid, pg_attribute.atttypmod) AS column_type
FROM pg_attribute
         JOIN pg_class ON pg_class.oid = pg_attribute.attrelid
         LEFT JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace
WHERE pg_class.relkind = 'r'::char
  AND pg_namespace.nspname = $1
  AND pg_class.relname = $2
  AND pg_attribute.attnum > 0
  AND NOT pg_attribute.attisdropped
ORDER BY pg_attribute.attnum";

pub(crate) const PRIMARY_KEY_QUERY: &str = "\
SELECT tco.constraint_name AS constraint_name,
       kcu.column_name     AS key_column
FROM information_schema.table_constraints tco
         JOIN information_schema.key_column_usage kcu
              ON kcu.constraint_name = tco.constraint_name
                  AND kcu.constraint_schema = tco.constraint_schema
WHERE tco.constraint_type = 'PRIMARY KEY'
  AND kcu.table_schema = $1
  AND kcu.table_name = $2
ORDER BY kcu.ordinal_position";

pub(crate) fn sql_type_for(data_type: DataType) -> &'static str {
    match data_type {
        DataType::String | DataType::Unknown => "text",
        DataType::Int64 => "bigint",
        DataType::Float64 => "double precision",
        DataType::Timestamp => "timestamp",
        DataType::Bool => "boolean",
        DataType::Json => "jsonb",
    }
}

pub(crate) fn data_type_for(sql_type: &str) -> DataType {
    let lower = sql_type.to_ascii_lowercase();
    if lower.starts_with("bigint")
        || lower.starts_with("integer")
        || lower.starts_with("smallint")
    {
        DataType::Int64
    } else if lower.starts_with("double")
        || lower.starts_with("real")
        || lower.starts_with("numeric")
        || lower.starts_with("decimal")
    {
        DataType::Float64
    } else if lower.starts_with("timestamp") || lower.starts_with("date") {
        DataType::Timestamp
    } else if lower.starts_with("bool") {
        DataType::Bool
    } else if lower.starts_with("json") {
        DataType::Json
    } else {
        DataType::String
    }
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn full_table_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote(schema), quote(table))
}

/// Default value clause for primary key columns, which are created NOT NULL.
fn default_value_clause(sql_type: &str) -> &'static str {
    if sql_type.contains("var") || sql_type.contains("text") {
        "default ''"
    } else {
        "default 0"
    }
}

/// Column DDL fragment: quoted name, type, NOT NULL plus a default when the
/// column is part of the primary key.
pub(crate) fn column_ddl(name: &str, column: &SqlColumn, table: &Table) -> String {
    let mut ddl = format!("{} {}", quote(name), column.sql_type);
    if table.pk_fields.contains(name) {
        ddl.push_str(" not null ");
        ddl.push_str(default_value_clause(&column.sql_type));
    }
    ddl
}

pub(crate) fn create_table_sql(schema: &str, table: &Table) -> String {
    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|(name, column)| column_ddl(name, column, table))
        .collect();
    if let Some(pk_name) = &table.primary_key_name {
        let pk_columns: Vec<String> = table.pk_fields.iter().map(|c| quote(c)).collect();
        parts.push(format!(
            "CONSTRAINT {} PRIMARY KEY ({})",
            quote(pk_name),
            pk_columns.join(", ")
        ));
    }
    format!(
        "CREATE TABLE {} ({})",
        full_table_name(schema, &table.name),
        parts.join(", ")
    )
}

/// Placeholder for one bind position, carrying the cast chain for overridden
/// columns (bound as text, cast server-side).
fn placeholder(position: usize, column: &SqlColumn) -> String {
    if column.is_override {
        format!("${}::text::{}", position, column.sql_type)
    } else {
        format!("${position}")
    }
}

/// Multi-row INSERT statement; with `merge`, an upsert keyed by the table's
/// primary key constraint.
pub(crate) fn insert_sql(schema: &str, table: &Table, rows: usize, merge: bool) -> String {
    let column_names: Vec<&String> = table.columns.keys().collect();
    let quoted: Vec<String> = column_names.iter().map(|c| quote(c)).collect();

    let mut tuples = Vec::with_capacity(rows);
    let mut position = 0usize;
    for _ in 0..rows {
        let tuple: Vec<String> = table
            .columns
            .values()
            .map(|column| {
                position += 1;
                placeholder(position, column)
            })
            .collect();
        tuples.push(format!("({})", tuple.join(", ")));
    }

    let mut statement = format!(
        "INSERT INTO {} ({}) VALUES {}",
        full_table_name(schema, &table.name),
        quoted.join(", "),
        tuples.join(", ")
    );
    if merge {
        statement.push_str(&merge_clause(table));
    }
    statement
}

/// Bulk append-or-merge from one table into another.
pub(crate) fn copy_sql(schema: &str, target: &Table, source: &Table, merge: bool) -> String {
    let quoted: Vec<String> = target.columns.keys().map(|c| quote(c)).collect();
    let columns = quoted.join(", ");
    let mut statement = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        full_table_name(schema, &target.name),
        columns,
        columns,
        full_table_name(schema, &source.name)
    );
    if merge {
        statement.push_str(&merge_clause(target));
    }
    statement
}

fn merge_clause(table: &Table) -> String {
    let pk_name = table
        .primary_key_name
        .clone()
        .unwrap_or_else(|| Table::constraint_name(&table.name));
    let updates: Vec<String> = table
        .columns
        .keys()
        .filter(|c| !table.pk_fields.contains(c.as_str()))
        .map(|c| format!("{} = excluded.{}", quote(c), quote(c)))
        .collect();
    if updates.is_empty() {
        format!(" ON CONFLICT ON CONSTRAINT {} DO NOTHING", quote(&pk_name))
    } else {
        format!(
            " ON CONFLICT ON CONSTRAINT {} DO UPDATE SET {}",
            quote(&pk_name),
            updates.join(", ")
        )
    }
}

/// Map a driver error onto the engine's error kinds via SQLSTATE.
pub(crate) fn classify(op: DbOp, ctx: DbContext, err: tokio_postgres::Error) -> IngestError {
    use tokio_postgres::error::SqlState;

    if let Some(code) = err.code() {
        if *code == SqlState::UNDEFINED_TABLE {
            return IngestError::TableNotExist(ctx.table.unwrap_or_default());
        }
        if *code == SqlState::DUPLICATE_TABLE
            || *code == SqlState::DUPLICATE_COLUMN
            || *code == SqlState::UNDEFINED_COLUMN
            || *code == SqlState::DUPLICATE_OBJECT
        {
            return IngestError::SchemaDrift(err.to_string());
        }
        if *code == SqlState::QUERY_CANCELED {
            return IngestError::Canceled;
        }
        if *code == SqlState::INVALID_PASSWORD
            || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
        {
            return IngestError::Connect(err.to_string());
        }
    }
    IngestError::db(op, err.to_string(), ctx)
}

/// Strip zero bytes; text columns cannot store them.
fn clean_text(s: &str) -> String {
    if s.contains('\u{0000}') {
        s.replace('\u{0000}', "")
    } else {
        s.to_string()
    }
}

fn render_text(value: &Value) -> String {
    match value {
        Value::String(s) => clean_text(s),
        other => other.to_string(),
    }
}

fn parse_naive_timestamp(s: &str) -> Result<NaiveDateTime> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.naive_utc())
        .map_err(|err| IngestError::config(format!("invalid timestamp {s:?}: {err}")))
}

/// Bind one JSON value for a column of the given shape.
pub(crate) fn bind_json(value: Option<&Value>, column: &SqlColumn) -> Result<PgValue> {
    let value = match value {
        None | Some(Value::Null) => return Ok(null_for(column)),
        Some(v) => v,
    };

    // Overridden columns bind as text and cast server-side.
    if column.is_override {
        return Ok(Box::new(Some(render_text(value))));
    }

    match column.data_type {
        DataType::Int64 => match value {
            Value::Number(n) if n.is_i64() => Ok(Box::new(n.as_i64())),
            Value::Number(n) => Ok(Box::new(n.as_f64().map(|f| f as i64))),
            Value::Bool(b) => Ok(Box::new(Some(i64::from(*b)))),
            other => Err(bind_error(other, column)),
        },
        DataType::Float64 => match value {
            Value::Number(n) => Ok(Box::new(n.as_f64())),
            Value::Bool(b) => Ok(Box::new(Some(f64::from(u8::from(*b))))),
            other => Err(bind_error(other, column)),
        },
        DataType::Bool => match value {
            Value::Bool(b) => Ok(Box::new(Some(*b))),
            other => Err(bind_error(other, column)),
        },
        DataType::Timestamp => match value {
            Value::String(s) => Ok(Box::new(Some(parse_naive_timestamp(s)?))),
            other => Err(bind_error(other, column)),
        },
        DataType::Json => Ok(Box::new(Some(value.clone()))),
        DataType::String | DataType::Unknown => Ok(Box::new(Some(render_text(value)))),
    }
}

/// Bind one CSV field (already unescaped; `None` is the `\N` null marker).
pub(crate) fn bind_csv(raw: Option<&str>, column: &SqlColumn) -> Result<PgValue> {
    let raw = match raw {
        None => return Ok(null_for(column)),
        Some(r) => r,
    };

    if column.is_override {
        return Ok(Box::new(Some(clean_text(raw))));
    }

    match column.data_type {
        DataType::Int64 => raw
            .parse::<i64>()
            .map(|v| Box::new(Some(v)) as PgValue)
            .map_err(|err| IngestError::config(format!("invalid bigint {raw:?}: {err}"))),
        DataType::Float64 => raw
            .parse::<f64>()
            .map(|v| Box::new(Some(v)) as PgValue)
            .map_err(|err| IngestError::config(format!("invalid float {raw:?}: {err}"))),
        DataType::Bool => match raw {
            "true" | "t" | "1" => Ok(Box::new(Some(true))),
            "false" | "f" | "0" => Ok(Box::new(Some(false))),
            other => Err(IngestError::config(format!("invalid boolean {other:?}"))),
        },
        DataType::Timestamp => Ok(Box::new(Some(parse_naive_timestamp(raw)?))),
        DataType::Json => serde_json::from_str::<Value>(raw)
            .map(|v| Box::new(Some(v)) as PgValue)
            .map_err(|err| IngestError::config(format!("invalid json {raw:?}: {err}"))),
        DataType::String | DataType::Unknown => Ok(Box::new(Some(clean_text(raw)))),
    }
}

fn null_for(column: &SqlColumn) -> PgValue {
    if column.is_override {
        return Box::new(None::<String>);
    }
    match column.data_type {
        DataType::Int64 => Box::new(None::<i64>),
        DataType::Float64 => Box::new(None::<f64>),
        DataType::Bool => Box::new(None::<bool>),
        DataType::Timestamp => Box::new(None::<NaiveDateTime>),
        DataType::Json => Box::new(None::<Value>),
        DataType::String | DataType::Unknown => Box::new(None::<String>),
    }
}

fn bind_error(value: &Value, column: &SqlColumn) -> IngestError {
    IngestError::config(format!(
        "cannot bind {value} to a {} column",
        column.sql_type
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> Table {
        let mut t = Table::named("events");
        t.columns
            .insert("id".into(), SqlColumn::new("bigint", DataType::Int64));
        t.columns
            .insert("name".into(), SqlColumn::new("text", DataType::String));
        t
    }

    fn keyed_table() -> Table {
        let mut t = table();
        t.pk_fields.insert("id".into());
        t.primary_key_name = Some(Table::constraint_name("events"));
        t
    }

    #[test]
    fn test_type_mapping_roundtrip() {
        for dt in [
            DataType::String,
            DataType::Int64,
            DataType::Float64,
            DataType::Timestamp,
            DataType::Bool,
            DataType::Json,
        ] {
            assert_eq!(data_type_for(sql_type_for(dt)), dt);
        }
        assert_eq!(sql_type_for(DataType::Unknown), "text");
        assert_eq!(data_type_for("character varying(255)"), DataType::String);
        assert_eq!(data_type_for("timestamp without time zone"), DataType::Timestamp);
        assert_eq!(data_type_for("numeric(10,2)"), DataType::Float64);
    }

    #[test]
    fn test_full_table_name() {
        assert_eq!(full_table_name("public", "events"), "\"public\".\"events\"");
    }

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql("public", &keyed_table());
        assert!(sql.starts_with("CREATE TABLE \"public\".\"events\""));
        assert!(sql.contains("\"id\" bigint not null default 0"));
        assert!(sql.contains("\"name\" text"));
        assert!(sql.contains("PRIMARY KEY (\"id\")"));
        assert!(sql.contains("CONSTRAINT \"sluice_pk_"));
    }

    #[test]
    fn test_insert_sql_plain() {
        let sql = insert_sql("public", &table(), 2, false);
        assert!(sql.contains("VALUES ($1, $2), ($3, $4)"));
        assert!(!sql.contains("ON CONFLICT"));
    }

    #[test]
    fn test_insert_sql_merge() {
        let sql = insert_sql("public", &keyed_table(), 1, true);
        assert!(sql.contains("ON CONFLICT ON CONSTRAINT \"sluice_pk_"));
        assert!(sql.contains("DO UPDATE SET \"name\" = excluded.\"name\""));
        // PK columns are not rewritten
        assert!(!sql.contains("\"id\" = excluded"));
    }

    #[test]
    fn test_insert_sql_override_cast() {
        let mut t = table();
        t.columns.insert(
            "d".into(),
            SqlColumn::with_override("date", DataType::Timestamp),
        );
        let sql = insert_sql("public", &t, 1, false);
        assert!(sql.contains("$3::text::date"));
    }

    #[test]
    fn test_copy_sql() {
        let sql = copy_sql("public", &keyed_table(), &Table::named("events_tmp_1"), true);
        assert!(sql.contains("INSERT INTO \"public\".\"events\""));
        assert!(sql.contains("SELECT \"id\", \"name\" FROM \"public\".\"events_tmp_1\""));
        assert!(sql.contains("ON CONFLICT"));
    }

    #[test]
    fn test_merge_clause_without_non_pk_columns() {
        let mut t = Table::named("only_pk");
        t.columns
            .insert("id".into(), SqlColumn::new("bigint", DataType::Int64));
        t.pk_fields.insert("id".into());
        assert!(merge_clause(&t).contains("DO NOTHING"));
    }

    #[test]
    fn test_identifier_policy_lowercases() {
        let policy = identifier_policy();
        assert_eq!(policy.normalize("UserEvents"), "userevents");
        let reserved = policy.normalize("select");
        assert!(reserved.starts_with("select_"));
    }

    #[test]
    fn test_bind_json_types() {
        let int_col = SqlColumn::new("bigint", DataType::Int64);
        assert!(bind_json(Some(&json!(7)), &int_col).is_ok());
        assert!(bind_json(Some(&json!(true)), &int_col).is_ok());
        assert!(bind_json(Some(&json!("seven")), &int_col).is_err());
        assert!(bind_json(None, &int_col).is_ok());

        let ts_col = SqlColumn::new("timestamp", DataType::Timestamp);
        assert!(bind_json(Some(&json!("2023-01-01T00:00:00Z")), &ts_col).is_ok());
        assert!(bind_json(Some(&json!("yesterday")), &ts_col).is_err());
    }

    #[test]
    fn test_bind_csv_values() {
        let int_col = SqlColumn::new("bigint", DataType::Int64);
        assert!(bind_csv(Some("42"), &int_col).is_ok());
        assert!(bind_csv(Some("x"), &int_col).is_err());
        assert!(bind_csv(None, &int_col).is_ok());

        let bool_col = SqlColumn::new("boolean", DataType::Bool);
        assert!(bind_csv(Some("true"), &bool_col).is_ok());
        assert!(bind_csv(Some("0"), &bool_col).is_ok());
        assert!(bind_csv(Some("yes"), &bool_col).is_err());
    }

    #[test]
    fn test_clean_text_strips_zero_bytes() {
        assert_eq!(clean_text("a\u{0000}b"), "ab");
        assert_eq!(clean_text("plain"), "plain");
    }
}
