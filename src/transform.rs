//! Per-table transformer stage
//!
//! A transformer rewrites an entity once per replication direction: outbound
//! before a change is sent to a peer, inbound before a received change is
//! applied. Transformers are compiled plug-ins registered by table name; the
//! stage caches lookups per table, including the absence of a transformer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use sqlx::MySqlPool;

use crate::error::Result;
use crate::hub::Event;
use crate::protocol::{Change, Row};

/// Everything a transformer may inspect while rewriting an entity.
pub struct TransformContext<'a> {
    /// The untransformed entity; `None` for deletes.
    pub entity: Option<&'a Row>,
    /// Node the change originates from.
    pub source: &'a str,
    /// Node the transformed entity is destined for.
    pub target: &'a str,
    /// Local database handle for lookups, when connected.
    pub db: Option<&'a MySqlPool>,
    /// Publish-only bus handle for side-channel traffic.
    pub bus: Option<&'a AsyncClient>,
}

/// A pure per-table rewrite. Returning `None` turns the change into a
/// delete for the target.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, ctx: TransformContext<'_>) -> Result<Option<Row>>;
}

/// Compiled transformer plug-ins, keyed by table name.
#[derive(Default)]
pub struct TransformerRegistry {
    transformers: HashMap<String, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, table: impl Into<String>, transformer: Arc<dyn Transformer>) {
        self.transformers.insert(table.into(), transformer);
    }

    fn get(&self, table: &str) -> Option<Arc<dyn Transformer>> {
        self.transformers.get(table).cloned()
    }
}

pub struct TransformerStage {
    node: String,
    peers: Vec<String>,
    registry: TransformerRegistry,
    /// `None` is a legitimate cached value: the table has no transformer.
    cache: HashMap<String, Option<Arc<dyn Transformer>>>,
}

impl TransformerStage {
    pub fn new(node: String, peers: Vec<String>, registry: TransformerRegistry) -> Self {
        Self {
            node,
            peers,
            registry,
            cache: HashMap::new(),
        }
    }

    fn lookup(&mut self, table: &str) -> Option<Arc<dyn Transformer>> {
        if let Some(cached) = self.cache.get(table) {
            return cached.clone();
        }
        let found = self.registry.get(table);
        self.cache.insert(table.to_string(), found.clone());
        found
    }

    /// Fan a local change out to every configured peer except `except` (the
    /// `local-change` listener).
    pub async fn on_local_change(
        &mut self,
        table: &str,
        id: &str,
        entity: Option<&Row>,
        except: Option<&str>,
        db: Option<&MySqlPool>,
        bus: Option<&AsyncClient>,
    ) -> Result<Vec<Event>> {
        let transformer = self.lookup(table);
        let mut events = Vec::new();
        for peer in &self.peers {
            if except == Some(peer.as_str()) {
                continue;
            }
            let transformed = match &transformer {
                Some(transformer) => {
                    transformer
                        .transform(TransformContext {
                            entity,
                            source: &self.node,
                            target: peer,
                            db,
                            bus,
                        })
                        .await?
                }
                None => entity.cloned(),
            };
            events.push(Event::RemoteSendChange {
                table: table.to_string(),
                id: id.to_string(),
                entity: transformed,
                peer: peer.clone(),
            });
        }
        Ok(events)
    }

    /// Rewrite an inbound change before it is applied locally (the
    /// `remote-change` listener).
    pub async fn on_remote_change(
        &mut self,
        change: Change,
        db: Option<&MySqlPool>,
        bus: Option<&AsyncClient>,
    ) -> Result<Vec<Event>> {
        let entity = match self.lookup(&change.table) {
            Some(transformer) => {
                transformer
                    .transform(TransformContext {
                        entity: change.entity.as_ref(),
                        source: &change.sender,
                        target: &self.node,
                        db,
                        bus,
                    })
                    .await?
            }
            None => change.entity.clone(),
        };
        Ok(vec![Event::LocalSaveChange(Change { entity, ..change })])
    }
}
