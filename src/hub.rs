//! Typed application event hub
//!
//! The only coupling between the pipeline stages. Each listener handles one
//! event and returns its follow-up events; `emit` dispatches those
//! depth-first, so a listener and everything it emitted complete before the
//! next event runs.

use futures::future::BoxFuture;

use crate::bus::{BusGateway, BusNotice};
use crate::database::DatabaseGateway;
use crate::error::{Error, Result};
use crate::protocol::{Change, ChangeError, ChangeInfo, Row, StatusChange, SyncOutcome};
use crate::transform::TransformerStage;

/// Application events exchanged between the stages.
#[derive(Debug)]
pub enum Event {
    DatabaseConnect,
    DatabaseDisconnect,
    DatabaseError(Error),
    /// A row of a sync-set table changed locally (or was just applied on a
    /// bidirectional table, in which case `except` names the origin).
    LocalChange {
        table: String,
        id: String,
        entity: Option<Row>,
        except: Option<String>,
    },
    /// A transformed inbound change, ready to be written.
    LocalSaveChange(Change),
    LocalSaveSuccessful(ChangeInfo),
    LocalSaveFailed(ChangeError),
    /// A validated inbound change, not yet transformed.
    RemoteChange(Change),
    /// A transformed outbound change addressed to one peer.
    RemoteSendChange {
        table: String,
        id: String,
        entity: Option<Row>,
        peer: String,
    },
    /// Feedback from a peer about one of our changes.
    RemoteStatusChange(StatusChange),
}

impl Event {
    /// Get the event name (for logging)
    pub fn name(&self) -> &'static str {
        match self {
            Event::DatabaseConnect => "database-connect",
            Event::DatabaseDisconnect => "database-disconnect",
            Event::DatabaseError(_) => "database-error",
            Event::LocalChange { .. } => "local-change",
            Event::LocalSaveChange(_) => "local-save-change",
            Event::LocalSaveSuccessful(_) => "local-save-successful",
            Event::LocalSaveFailed(_) => "local-save-failed",
            Event::RemoteChange(_) => "remote-change",
            Event::RemoteSendChange { .. } => "remote-send-change",
            Event::RemoteStatusChange(_) => "remote-status-change",
        }
    }
}

pub struct EventHub {
    database: DatabaseGateway,
    bus: BusGateway,
    transform: TransformerStage,
}

impl EventHub {
    pub fn new(database: DatabaseGateway, bus: BusGateway, transform: TransformerStage) -> Self {
        Self {
            database,
            bus,
            transform,
        }
    }

    /// Drive the periodic work of both gateways.
    pub async fn tick(&mut self) -> Result<()> {
        for event in self.database.tick().await {
            self.emit(event).await?;
        }
        self.bus.tick().await?;
        Ok(())
    }

    /// Handle a transport notice from the bus event-loop task.
    pub async fn handle_notice(&mut self, notice: BusNotice) -> Result<()> {
        match notice {
            BusNotice::SessionUp => {
                let events = self.bus.session_up().await?;
                self.emit_all(events).await?;
            }
            BusNotice::PublishAcked => self.bus.publish_acked(),
            BusNotice::Frame { topic, payload } => {
                self.bus.store_incoming(&topic, &payload)?;
                let events = self.bus.decode_frame(&topic, &payload).await?;
                self.emit_all(events).await?;
                self.bus.ack_incoming()?;
            }
        }
        Ok(())
    }

    /// Dispatch one event to its listeners, then its follow-ups depth-first.
    pub fn emit(&mut self, event: Event) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tracing::trace!(event = event.name(), "emit");
            match event {
                Event::LocalChange {
                    table,
                    id,
                    entity,
                    except,
                } => {
                    let events = self
                        .transform
                        .on_local_change(
                            &table,
                            &id,
                            entity.as_ref(),
                            except.as_deref(),
                            self.database.pool(),
                            Some(self.bus.client()),
                        )
                        .await?;
                    self.emit_all(events).await
                }
                Event::RemoteChange(change) => {
                    let events = self
                        .transform
                        .on_remote_change(change, self.database.pool(), Some(self.bus.client()))
                        .await?;
                    self.emit_all(events).await
                }
                Event::LocalSaveChange(change) => {
                    let events = self.database.apply_change(change).await;
                    self.emit_all(events).await
                }
                Event::RemoteStatusChange(status) => {
                    let events = self.database.apply_status(status).await;
                    self.emit_all(events).await
                }
                Event::LocalSaveSuccessful(info) => {
                    self.bus.report_success(info.clone()).await?;
                    let events = self
                        .database
                        .apply_status(StatusChange {
                            sender: info.sender,
                            table: info.table,
                            id: info.id,
                            date: info.date,
                            status: SyncOutcome::Successful,
                            message: None,
                        })
                        .await;
                    self.emit_all(events).await
                }
                Event::LocalSaveFailed(error) => {
                    tracing::warn!(
                        table = %error.table,
                        id = %error.id,
                        message = %error.message,
                        "change could not be applied"
                    );
                    self.bus.report_failure(error.clone()).await?;
                    let events = self
                        .database
                        .apply_status(StatusChange {
                            sender: error.sender,
                            table: error.table,
                            id: error.id,
                            date: error.date,
                            status: SyncOutcome::Error,
                            message: Some(error.message),
                        })
                        .await;
                    self.emit_all(events).await
                }
                Event::RemoteSendChange {
                    table,
                    id,
                    entity,
                    peer,
                } => self.bus.send_change(table, id, entity, peer).await,
                Event::DatabaseConnect => {
                    tracing::info!("database connected, draining deferred writes");
                    while let Some(events) = self.database.drain_step().await? {
                        self.emit_all(events).await?;
                    }
                    Ok(())
                }
                Event::DatabaseDisconnect => {
                    tracing::warn!("database connection lost");
                    Ok(())
                }
                Event::DatabaseError(error) => {
                    tracing::error!(%error, "database error");
                    Ok(())
                }
            }
        })
    }

    async fn emit_all(&mut self, events: Vec<Event>) -> Result<()> {
        for event in events {
            self.emit(event).await?;
        }
        Ok(())
    }

    /// End the bus session gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.bus.disconnect().await
    }

    #[cfg(test)]
    pub fn database_mut(&mut self) -> &mut DatabaseGateway {
        &mut self.database
    }

    #[cfg(test)]
    pub fn bus_mut(&mut self) -> &mut BusGateway {
        &mut self.bus
    }
}
