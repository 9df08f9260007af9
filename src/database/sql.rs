//! SQL construction for dynamic tables
//!
//! Row payloads arrive as JSON objects for tables that are only known at
//! runtime, so statements are rendered as strings: identifiers are
//! backtick-quoted and values become escaped literals.

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;
use sqlx::mysql::MySqlRow;
use sqlx::{Column, Row as _};

use crate::protocol::{EpochMillis, Row};

/// DDL for the trigger-written change log.
pub const CREATE_TABLE_CHANGES: &str = "CREATE TABLE IF NOT EXISTS table_changes(\
  id INT AUTO_INCREMENT PRIMARY KEY,\
  table_name VARCHAR(255) NOT NULL,\
  primary_key VARCHAR(255) NOT NULL,\
  date DATETIME NOT NULL)";

/// DDL for the per-(table, id, peer) replication outcome log.
pub const CREATE_SYNC_STATUS: &str = "CREATE TABLE IF NOT EXISTS sync_status(\
  id VARCHAR(32) PRIMARY KEY,\
  table_name VARCHAR(255) NOT NULL,\
  primary_key VARCHAR(255) NOT NULL,\
  remote VARCHAR(32) NOT NULL,\
  date DATETIME NOT NULL,\
  status ENUM('successful','pending','error') NOT NULL,\
  message VARCHAR(255) NULL)";

/// Prefix shared by every trigger this daemon installs.
pub const TRIGGER_PREFIX: &str = "mysqlSync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Insert,
    Update,
    Delete,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 3] = [TriggerKind::Insert, TriggerKind::Update, TriggerKind::Delete];

    fn event(&self) -> &'static str {
        match self {
            TriggerKind::Insert => "INSERT",
            TriggerKind::Update => "UPDATE",
            TriggerKind::Delete => "DELETE",
        }
    }

    /// Row alias carrying the primary key inside the trigger body.
    fn row_alias(&self) -> &'static str {
        match self {
            TriggerKind::Delete => "OLD",
            _ => "NEW",
        }
    }

    fn name_part(&self) -> &'static str {
        match self {
            TriggerKind::Insert => "Insert",
            TriggerKind::Update => "Update",
            TriggerKind::Delete => "Delete",
        }
    }
}

/// Name of one capture trigger, e.g. `mysqlSyncInsert_users`.
pub fn trigger_name(kind: TriggerKind, table: &str) -> String {
    format!("{TRIGGER_PREFIX}{}_{table}", kind.name_part())
}

/// Quote an identifier with backticks.
pub fn ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a string as a SQL literal.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
}

/// Render a JSON value as a SQL literal. Arrays and objects are stored as
/// their JSON text.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

/// The string form of a primary-key value taken from an entity.
pub fn value_as_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Epoch milliseconds as a `DATETIME` value.
pub fn datetime_value(millis: EpochMillis) -> NaiveDateTime {
    DateTime::from_timestamp_millis(millis as i64)
        .unwrap_or(DateTime::UNIX_EPOCH)
        .naive_utc()
}

pub fn insert_statement(table: &str, entity: &Row) -> String {
    let columns: Vec<String> = entity.keys().map(|k| ident(k)).collect();
    let values: Vec<String> = entity.values().map(literal).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        ident(table),
        columns.join(", "),
        values.join(", ")
    )
}

pub fn update_statement(table: &str, pk: &str, id: &str, entity: &Row) -> String {
    let assignments: Vec<String> = entity
        .iter()
        .map(|(column, value)| format!("{} = {}", ident(column), literal(value)))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {} = {}",
        ident(table),
        assignments.join(", "),
        ident(pk),
        quote(id)
    )
}

pub fn delete_statement(table: &str, pk: &str, id: &str) -> String {
    format!("DELETE FROM {} WHERE {} = {}", ident(table), ident(pk), quote(id))
}

pub fn count_statement(table: &str, pk: &str, id: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM {} WHERE {} = {}",
        ident(table),
        ident(pk),
        quote(id)
    )
}

pub fn select_statement(table: &str, pk: &str, id: &str) -> String {
    format!("SELECT * FROM {} WHERE {} = {}", ident(table), ident(pk), quote(id))
}

pub fn create_trigger(kind: TriggerKind, table: &str, pk: &str) -> String {
    format!(
        "CREATE TRIGGER {} AFTER {} ON {} FOR EACH ROW \
         INSERT INTO table_changes (table_name, primary_key, date) VALUES ({}, {}.{}, NOW())",
        ident(&trigger_name(kind, table)),
        kind.event(),
        ident(table),
        quote(table),
        kind.row_alias(),
        ident(pk)
    )
}

pub fn drop_trigger(name: &str) -> String {
    format!("DROP TRIGGER IF EXISTS {}", ident(name))
}

/// Decode a dynamically-typed result row into a JSON object.
pub fn decode_row(row: &MySqlRow) -> Row {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), decode_column(row, index));
    }
    out
}

fn decode_column(row: &MySqlRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(index) {
        return v
            .map(|d| Value::String(d.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
        return v
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map(|b| Value::String(hex::encode(b))).unwrap_or(Value::Null);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_literal_rendering() {
        assert_eq!(literal(&Value::Null), "NULL");
        assert_eq!(literal(&json!(true)), "1");
        assert_eq!(literal(&json!(false)), "0");
        assert_eq!(literal(&json!(42)), "42");
        assert_eq!(literal(&json!(1.5)), "1.5");
        assert_eq!(literal(&json!("it's")), "'it''s'");
        assert_eq!(literal(&json!("a\\b")), "'a\\\\b'");
        assert_eq!(literal(&json!(["x"])), "'[\"x\"]'");
    }

    #[test]
    fn test_ident_quoting() {
        assert_eq!(ident("users"), "`users`");
        assert_eq!(ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_insert_statement() {
        let stmt = insert_statement("users", &entity(json!({"id": "u1", "name": "x"})));
        assert_eq!(stmt, "INSERT INTO `users` (`id`, `name`) VALUES ('u1', 'x')");
    }

    #[test]
    fn test_update_statement() {
        let stmt = update_statement("users", "id", "u1", &entity(json!({"id": "u1", "name": "x"})));
        assert_eq!(
            stmt,
            "UPDATE `users` SET `id` = 'u1', `name` = 'x' WHERE `id` = 'u1'"
        );
    }

    #[test]
    fn test_delete_statement() {
        assert_eq!(
            delete_statement("users", "id", "u1"),
            "DELETE FROM `users` WHERE `id` = 'u1'"
        );
    }

    #[test]
    fn test_trigger_names() {
        assert_eq!(trigger_name(TriggerKind::Insert, "users"), "mysqlSyncInsert_users");
        assert_eq!(trigger_name(TriggerKind::Update, "users"), "mysqlSyncUpdate_users");
        assert_eq!(trigger_name(TriggerKind::Delete, "users"), "mysqlSyncDelete_users");
    }

    #[test]
    fn test_create_trigger_statements() {
        let insert = create_trigger(TriggerKind::Insert, "users", "id");
        assert!(insert.contains("CREATE TRIGGER `mysqlSyncInsert_users` AFTER INSERT ON `users`"));
        assert!(insert.contains("NEW.`id`"));

        let delete = create_trigger(TriggerKind::Delete, "users", "id");
        assert!(delete.contains("AFTER DELETE"));
        assert!(delete.contains("OLD.`id`"));
    }

    #[test]
    fn test_value_as_id() {
        assert_eq!(value_as_id(&json!("u1")), "u1");
        assert_eq!(value_as_id(&json!(5)), "5");
    }

    #[test]
    fn test_datetime_value() {
        let dt = datetime_value(1700000000000);
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2023-11-14 22:13:20");
    }
}
