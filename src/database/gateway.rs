//! Database gateway
//!
//! Owns the MySQL connection. Constructed disconnected; every scheduler tick
//! verifies connectivity, reconnects and reinstalls the capture triggers when
//! needed, then polls one trigger-captured change. Incoming peer changes are
//! applied here, with writes deferred to a durable queue while the database
//! is unreachable.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Row as _;

use super::sql;
use crate::config::{MysqlConfig, SyncConfig};
use crate::error::{Error, Result};
use crate::hub::Event;
use crate::protocol::{
    status_id, Change, ChangeError, ChangeInfo, Row, StatusChange,
};
use crate::queue::DurableQueue;

/// Envelope for writes deferred while the database is unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuedWrite {
    Change(Change),
    Status(StatusChange),
}

pub struct DatabaseGateway {
    config: MysqlConfig,
    sync_tables: Vec<String>,
    receive_tables: Vec<String>,
    pool: Option<MySqlPool>,
    /// Table name to primary-key column; the schema is considered stable for
    /// the process lifetime.
    pk_cache: HashMap<String, String>,
    queue: DurableQueue<QueuedWrite>,
}

impl DatabaseGateway {
    /// Create the gateway in a disconnected state.
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let queue = DurableQueue::open(config.queue_directory.join("database.json"))?;
        Ok(Self {
            config: config.mysql_config.clone(),
            sync_tables: config.sync_tables.clone(),
            receive_tables: config.receive_tables.clone(),
            pool: None,
            pk_cache: HashMap::new(),
            queue,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.pool.is_some()
    }

    /// Connection handle for transformer lookups; `None` while disconnected.
    pub fn pool(&self) -> Option<&MySqlPool> {
        self.pool.as_ref()
    }

    /// One scheduler tick: verify connectivity (reconnecting and running
    /// setup when needed), then poll one captured change.
    pub async fn tick(&mut self) -> Vec<Event> {
        let mut events = Vec::new();

        if !self.ping().await {
            if self.pool.take().is_some() {
                events.push(Event::DatabaseDisconnect);
            }
            match self.connect().await {
                Ok(()) => events.push(Event::DatabaseConnect),
                Err(e) => {
                    events.push(Event::DatabaseError(e));
                    return events;
                }
            }
        }

        match self.poll_change().await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => events.push(Event::DatabaseError(e)),
        }

        events
    }

    async fn ping(&self) -> bool {
        match &self.pool {
            Some(pool) => sqlx::query("SELECT 'connected'").execute(pool).await.is_ok(),
            None => false,
        }
    }

    async fn connect(&mut self) -> Result<()> {
        let pool = MySqlPoolOptions::new()
            .max_connections(self.config.pool_size)
            .acquire_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .connect(&self.config.url())
            .await?;
        self.pool = Some(pool);

        if let Err(e) = self.setup_database().await {
            // stay disconnected so setup is retried on the next tick
            self.pool = None;
            return Err(e);
        }

        tracing::info!(host = %self.config.host, database = %self.config.database, "database connected");
        Ok(())
    }

    fn require_pool(&self) -> Result<&MySqlPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| Error::QueryExecution("no database connection".into()))
    }

    /// Idempotently create the capture tables, drop every previously
    /// installed `mysqlSync*` trigger and reinstall three triggers per table
    /// in the sync set.
    pub async fn setup_database(&mut self) -> Result<()> {
        {
            let pool = self.require_pool()?;
            sqlx::query(sql::CREATE_TABLE_CHANGES).execute(pool).await?;
            sqlx::query(sql::CREATE_SYNC_STATUS).execute(pool).await?;

            let rows = sqlx::query(
                "SELECT trigger_name FROM information_schema.triggers \
                 WHERE trigger_schema = DATABASE() AND trigger_name LIKE 'mysqlSync%'",
            )
            .fetch_all(pool)
            .await?;
            for row in rows {
                let name: String = row.try_get(0)?;
                sqlx::query(&sql::drop_trigger(&name)).execute(pool).await?;
            }
        }

        for table in self.sync_tables.clone() {
            let pk = self.primary_key(&table).await?;
            let pool = self.require_pool()?;
            for kind in sql::TriggerKind::ALL {
                sqlx::query(&sql::create_trigger(kind, &table, &pk))
                    .execute(pool)
                    .await?;
            }
            tracing::debug!(table = %table, pk = %pk, "capture triggers installed");
        }

        Ok(())
    }

    /// Resolve the primary-key column of a table, cached on first use.
    async fn primary_key(&mut self, table: &str) -> Result<String> {
        if let Some(pk) = self.pk_cache.get(table) {
            return Ok(pk.clone());
        }

        let pk = {
            let pool = self.require_pool()?;
            let rows = sqlx::query(&format!("DESCRIBE {}", sql::ident(table)))
                .fetch_all(pool)
                .await?;
            rows.into_iter()
                .find_map(|row| {
                    let key: String = row.try_get("Key").ok()?;
                    if key == "PRI" {
                        row.try_get::<String, _>("Field").ok()
                    } else {
                        None
                    }
                })
                .ok_or_else(|| Error::Schema(format!("table {table} has no primary key")))?
        };

        self.pk_cache.insert(table.to_string(), pk.clone());
        Ok(pk)
    }

    /// Take the oldest captured change, if any, and turn it into a
    /// `local-change` event.
    async fn poll_change(&mut self) -> Result<Option<Event>> {
        if self.pool.is_none() {
            return Ok(None);
        }

        let row = {
            let pool = self.require_pool()?;
            sqlx::query(
                "SELECT id, table_name, primary_key FROM table_changes \
                 ORDER BY date ASC, id ASC LIMIT 1",
            )
            .fetch_optional(pool)
            .await?
        };
        let Some(row) = row else { return Ok(None) };

        let change_id: i32 = row.try_get("id")?;
        let table: String = row.try_get("table_name")?;
        let id: String = row.try_get("primary_key")?;

        {
            let pool = self.require_pool()?;
            sqlx::query("DELETE FROM table_changes WHERE id = ?")
                .bind(change_id)
                .execute(pool)
                .await?;
        }

        let entity = self.fetch_entity(&table, &id).await?;
        Ok(Some(Event::LocalChange {
            table,
            id,
            entity,
            except: None,
        }))
    }

    /// Fetch the current row by primary key; absence signals a delete.
    async fn fetch_entity(&mut self, table: &str, id: &str) -> Result<Option<Row>> {
        let pk = self.primary_key(table).await?;
        let pool = self.require_pool()?;
        let row = sqlx::query(&sql::select_statement(table, &pk, id))
            .fetch_optional(pool)
            .await?;
        Ok(row.map(|r| sql::decode_row(&r)))
    }

    /// Apply an incoming peer change (the `local-save-change` listener).
    pub async fn apply_change(&mut self, change: Change) -> Vec<Event> {
        if self.pool.is_none() {
            if let Err(e) = self.queue.push(QueuedWrite::Change(change.clone())) {
                tracing::error!(error = %e, "failed to defer change while disconnected");
            }
            return vec![Event::LocalSaveFailed(ChangeError {
                sender: change.sender,
                table: change.table,
                id: change.id,
                date: change.date,
                message: "Could not connect to database".into(),
            })];
        }

        match self.try_apply(&change).await {
            Ok(mut events) => {
                events.push(Event::LocalSaveSuccessful(ChangeInfo {
                    sender: change.sender,
                    table: change.table,
                    id: change.id,
                    date: change.date,
                }));
                events
            }
            Err(e) => vec![Event::LocalSaveFailed(ChangeError {
                sender: change.sender,
                table: change.table,
                id: change.id,
                date: change.date,
                message: e.to_string(),
            })],
        }
    }

    async fn try_apply(&mut self, change: &Change) -> Result<Vec<Event>> {
        let pk = self.primary_key(&change.table).await?;
        check_entity_id(&pk, change)?;

        let pool = self.require_pool()?;
        match &change.entity {
            Some(entity) => {
                let count: i64 =
                    sqlx::query_scalar(&sql::count_statement(&change.table, &pk, &change.id))
                        .fetch_one(pool)
                        .await?;
                let stmt = if count == 0 {
                    sql::insert_statement(&change.table, entity)
                } else {
                    sql::update_statement(&change.table, &pk, &change.id, entity)
                };
                sqlx::query(&stmt).execute(pool).await?;
            }
            None => {
                sqlx::query(&sql::delete_statement(&change.table, &pk, &change.id))
                    .execute(pool)
                    .await?;
            }
        }

        let mut events = Vec::new();
        if self.is_bidirectional(&change.table) {
            // the apply itself fired the capture triggers; remove those rows
            // so the change is not processed a second time
            sqlx::query("DELETE FROM table_changes WHERE table_name = ? AND primary_key = ?")
                .bind(&change.table)
                .bind(&change.id)
                .execute(pool)
                .await?;
            events.push(Event::LocalChange {
                table: change.table.clone(),
                id: change.id.clone(),
                entity: change.entity.clone(),
                except: Some(change.sender.clone()),
            });
        }

        Ok(events)
    }

    fn is_bidirectional(&self, table: &str) -> bool {
        self.sync_tables.iter().any(|t| t == table)
            && self.receive_tables.iter().any(|t| t == table)
    }

    /// Apply a status report (the `remote-status-change` listener).
    pub async fn apply_status(&mut self, status: StatusChange) -> Vec<Event> {
        if self.pool.is_none() {
            if let Err(e) = self.queue.push(QueuedWrite::Status(status)) {
                tracing::error!(error = %e, "failed to defer status while disconnected");
            }
            return Vec::new();
        }

        if let Err(e) = self.try_apply_status(&status).await {
            return vec![Event::DatabaseError(e)];
        }
        Vec::new()
    }

    async fn try_apply_status(&self, status: &StatusChange) -> Result<()> {
        let key = status_id(&status.table, &status.id, &status.sender);
        let pool = self.require_pool()?;

        let stored: Option<chrono::NaiveDateTime> =
            sqlx::query_scalar("SELECT date FROM sync_status WHERE id = ?")
                .bind(&key)
                .fetch_optional(pool)
                .await?;

        match stored {
            Some(stored) => {
                if status_superseded(stored, status.date) {
                    return Ok(());
                }
                sqlx::query("UPDATE sync_status SET date = ?, status = ?, message = ? WHERE id = ?")
                    .bind(sql::datetime_value(status.date))
                    .bind(status.status.as_str())
                    .bind(&status.message)
                    .bind(&key)
                    .execute(pool)
                    .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO sync_status (id, table_name, primary_key, remote, date, status, message) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&key)
                .bind(&status.table)
                .bind(&status.id)
                .bind(&status.sender)
                .bind(sql::datetime_value(status.date))
                .bind(status.status.as_str())
                .bind(&status.message)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Replay one deferred write. Returns `None` once the queue is empty or
    /// the connection is gone again.
    pub async fn drain_step(&mut self) -> Result<Option<Vec<Event>>> {
        if self.pool.is_none() {
            return Ok(None);
        }
        let Some(item) = self.queue.poll()? else {
            return Ok(None);
        };
        let events = match item {
            QueuedWrite::Change(change) => self.apply_change(change).await,
            QueuedWrite::Status(status) => self.apply_status(status).await,
        };
        Ok(Some(events))
    }

    #[cfg(test)]
    pub fn queued_writes(&self) -> Vec<QueuedWrite> {
        self.queue.snapshot()
    }
}

/// The stored `sync_status` date wins unless the incoming report is newer.
fn status_superseded(stored: chrono::NaiveDateTime, incoming: crate::protocol::EpochMillis) -> bool {
    stored.and_utc().timestamp_millis() >= incoming as i64
}

/// A change's `id` must be the string form of its entity's primary-key value.
fn check_entity_id(pk: &str, change: &Change) -> Result<()> {
    if let Some(entity) = &change.entity {
        let entity_id = entity.get(pk).map(sql::value_as_id).unwrap_or_default();
        if entity_id != change.id {
            return Err(Error::Apply("Sent id does not match entity id!".into()));
        }
    }
    Ok(())
}
