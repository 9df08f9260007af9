//! MQTT bus gateway
//!
//! Owns the broker session: subscriptions, presence broadcasts, per-peer
//! offline queues and the persistent in-flight stores. The rumqttc event
//! loop runs on its own task and forwards transport notices over a channel;
//! all decoding and dispatch happens on the dispatcher task, in arrival
//! order.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use rumqttc::{
    AsyncClient, Event as MqttEvent, EventLoop, LastWill, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use super::presence::PresenceMap;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::hub::Event;
use crate::protocol::{
    change_topic, info_topic, now_millis, Change, ChangeError, ChangeInfo, ConnectedArgs,
    FeedbackArgs, InfoKind, InfoMessage, Row, StatusChange, SyncOutcome, INFO_TOPIC,
};
use crate::queue::DurableQueue;

/// A publish buffered for an offline peer or awaiting broker acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: String,
}

/// Transport-level notices forwarded from the MQTT event-loop task.
#[derive(Debug)]
pub enum BusNotice {
    /// An application frame arrived.
    Frame { topic: String, payload: Vec<u8> },
    /// The broker session was (re)established.
    SessionUp,
    /// The broker acknowledged our oldest in-flight publish.
    PublishAcked,
}

pub struct BusGateway {
    node: String,
    client: AsyncClient,
    presence: PresenceMap,
    queue_dir: PathBuf,
    peer_queues: HashMap<String, DurableQueue<StoredMessage>>,
    incoming_store: DurableQueue<StoredMessage>,
    outgoing_store: DurableQueue<StoredMessage>,
    receive_tables: Vec<String>,
    check_interval_ms: u64,
}

impl BusGateway {
    /// Open the broker session. Returns the gateway and the notice stream fed
    /// by the spawned event-loop task; frames only start flowing once
    /// `session_up` has subscribed.
    pub fn connect(config: &SyncConfig) -> Result<(Self, mpsc::Receiver<BusNotice>)> {
        let node = config.client_name.clone();
        let mqtt = &config.mqtt_config;

        let mut options = MqttOptions::new(node.clone(), mqtt.host.clone(), mqtt.port);
        options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&mqtt.username, &mqtt.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        // announced by the broker if this session dies ungracefully
        let will = InfoMessage {
            sender: node.clone(),
            message: InfoKind::ConnectionLost,
            args: json!({}),
        };
        options.set_last_will(LastWill::new(
            INFO_TOPIC,
            serde_json::to_vec(&will)?,
            QoS::AtLeastOnce,
            false,
        ));

        if let Some(tls) = mqtt.load_tls()? {
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: tls.ca,
                alpn: None,
                client_auth: tls.client_auth,
            }));
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_event_loop(event_loop, tx));

        let incoming_store = DurableQueue::open(config.queue_directory.join("mqtt-incoming.json"))?;
        let outgoing_store = DurableQueue::open(config.queue_directory.join("mqtt-outgoing.json"))?;

        Ok((
            Self {
                node,
                client,
                presence: PresenceMap::new(),
                queue_dir: config.queue_directory.clone(),
                peer_queues: HashMap::new(),
                incoming_store,
                outgoing_store,
                receive_tables: config.receive_tables.clone(),
                check_interval_ms: config.check_interval,
            },
            rx,
        ))
    }

    /// Publish-only handle for transformer side channels.
    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    /// One scheduler tick: broadcast our presence when the active update is
    /// due.
    pub async fn tick(&mut self) -> Result<()> {
        let now = now_millis();
        if self.presence.active_update_due(now) {
            let until = self.presence.advertise_window(now, self.check_interval_ms);
            let message = InfoMessage {
                sender: self.node.clone(),
                message: InfoKind::Connected,
                args: serde_json::to_value(ConnectedArgs { until })?,
            };
            let payload = serde_json::to_string(&message)?;
            self.publish(INFO_TOPIC.to_string(), payload, None).await?;
        }
        Ok(())
    }

    /// Re-issue subscriptions and replay persisted in-flight messages after a
    /// session handshake. rumqttc does not resubscribe on its own.
    pub async fn session_up(&mut self) -> Result<Vec<Event>> {
        self.client.subscribe(INFO_TOPIC, QoS::AtLeastOnce).await?;
        self.client
            .subscribe(info_topic(&self.node), QoS::AtLeastOnce)
            .await?;
        self.client
            .subscribe(change_topic(&self.node), QoS::AtLeastOnce)
            .await?;
        tracing::info!("bus session established");

        // unacknowledged publishes from a previous session go out again
        for pending in self.outgoing_store.snapshot() {
            self.client
                .publish(pending.topic, QoS::AtLeastOnce, false, pending.payload)
                .await?;
        }

        // frames that were received but never dispatched are replayed
        let mut events = Vec::new();
        while let Some(frame) = self.incoming_store.poll()? {
            events.extend(
                self.decode_frame(&frame.topic, frame.payload.as_bytes())
                    .await?,
            );
        }
        Ok(events)
    }

    /// Persist an inbound frame until its dispatch completes.
    pub fn store_incoming(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.incoming_store.push(StoredMessage {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        })
    }

    /// Drop the oldest persisted inbound frame after dispatch.
    pub fn ack_incoming(&self) -> Result<()> {
        self.incoming_store.poll().map(|_| ())
    }

    /// Drop the oldest in-flight publish once the broker acknowledged it.
    pub fn publish_acked(&self) {
        if let Err(e) = self.outgoing_store.poll() {
            tracing::error!(error = %e, "failed to clear acknowledged publish");
        }
    }

    /// Publish to a topic, or buffer in the peer's offline queue when the
    /// addressed peer is not present.
    pub async fn publish(
        &mut self,
        topic: String,
        payload: String,
        remote_peer: Option<&str>,
    ) -> Result<()> {
        if let Some(peer) = remote_peer {
            if !self.presence.is_connected(peer, now_millis()) {
                tracing::debug!(peer, topic = %topic, "peer offline, buffering message");
                self.peer_queue(peer)?.push(StoredMessage { topic, payload })?;
                return Ok(());
            }
        }
        self.outgoing_store.push(StoredMessage {
            topic: topic.clone(),
            payload: payload.clone(),
        })?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    fn peer_queue(&mut self, peer: &str) -> Result<&DurableQueue<StoredMessage>> {
        match self.peer_queues.entry(peer.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let queue =
                    DurableQueue::open(self.queue_dir.join(format!("remote-{peer}.json")))?;
                Ok(entry.insert(queue))
            }
        }
    }

    /// Forward a transformed change to one peer (the `remote-send-change`
    /// listener).
    pub async fn send_change(
        &mut self,
        table: String,
        id: String,
        entity: Option<Row>,
        peer: String,
    ) -> Result<()> {
        let change = Change {
            sender: self.node.clone(),
            table,
            id,
            date: now_millis(),
            entity,
        };
        let payload = serde_json::to_string(&change)?;
        self.publish(change_topic(&peer), payload, Some(&peer)).await
    }

    /// Acknowledge a successfully applied change to its origin (the
    /// `local-save-successful` listener).
    pub async fn report_success(&mut self, info: ChangeInfo) -> Result<()> {
        let peer = info.sender.clone();
        self.send_feedback(
            &peer,
            InfoKind::DataReceived,
            FeedbackArgs {
                table: info.table,
                id: info.id,
                date: info.date,
                message: None,
            },
        )
        .await
    }

    /// Report a failed apply back to its origin (the `local-save-failed`
    /// listener).
    pub async fn report_failure(&mut self, error: ChangeError) -> Result<()> {
        let peer = error.sender.clone();
        self.send_feedback(
            &peer,
            InfoKind::Error,
            FeedbackArgs {
                table: error.table,
                id: error.id,
                date: error.date,
                message: Some(error.message),
            },
        )
        .await
    }

    async fn send_feedback(&mut self, peer: &str, kind: InfoKind, args: FeedbackArgs) -> Result<()> {
        let message = InfoMessage {
            sender: self.node.clone(),
            message: kind,
            args: serde_json::to_value(args)?,
        };
        let payload = serde_json::to_string(&message)?;
        self.publish(info_topic(peer), payload, Some(peer)).await
    }

    /// Decode and validate one inbound frame, producing hub events. Invalid
    /// payloads are logged and dropped without feedback, as the sender may be
    /// untrusted.
    pub async fn decode_frame(&mut self, topic: &str, payload: &[u8]) -> Result<Vec<Event>> {
        if topic == change_topic(&self.node) {
            let change: Change = match serde_json::from_slice(payload) {
                Ok(change) => change,
                Err(e) => {
                    tracing::warn!(topic, error = %e, "dropping malformed change");
                    return Ok(Vec::new());
                }
            };
            if change.sender == self.node {
                return Ok(Vec::new());
            }
            if !self.receive_tables.iter().any(|t| t == &change.table) {
                tracing::warn!(
                    table = %change.table,
                    sender = %change.sender,
                    "rejecting change for unconfigured receive table"
                );
                let message = format!("Table {} is not configured for receiving", change.table);
                let sender = change.sender.clone();
                self.send_feedback(
                    &sender,
                    InfoKind::Error,
                    FeedbackArgs {
                        table: change.table,
                        id: change.id,
                        date: change.date,
                        message: Some(message),
                    },
                )
                .await?;
                return Ok(Vec::new());
            }
            return Ok(vec![Event::RemoteChange(change)]);
        }

        if topic == INFO_TOPIC || topic == info_topic(&self.node) {
            let info: InfoMessage = match serde_json::from_slice(payload) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(topic, error = %e, "dropping malformed info message");
                    return Ok(Vec::new());
                }
            };
            if info.sender == self.node {
                return Ok(Vec::new());
            }
            return self.handle_info(info).await;
        }

        tracing::debug!(topic, "ignoring frame on unexpected topic");
        Ok(Vec::new())
    }

    async fn handle_info(&mut self, info: InfoMessage) -> Result<Vec<Event>> {
        match info.message {
            InfoKind::Connected => {
                let args: ConnectedArgs = match serde_json::from_value(info.args) {
                    Ok(args) => args,
                    Err(e) => {
                        tracing::warn!(sender = %info.sender, error = %e, "dropping malformed connected args");
                        return Ok(Vec::new());
                    }
                };
                tracing::debug!(peer = %info.sender, until = args.until, "peer present");
                self.presence.record(&info.sender, args.until);
                self.drain_peer_queue(&info.sender).await?;
                Ok(Vec::new())
            }
            InfoKind::ConnectionLost => {
                tracing::info!(peer = %info.sender, "peer connection lost");
                self.presence.remove(&info.sender);
                Ok(Vec::new())
            }
            InfoKind::DataReceived | InfoKind::Error => {
                let args: FeedbackArgs = match serde_json::from_value(info.args) {
                    Ok(args) => args,
                    Err(e) => {
                        tracing::warn!(sender = %info.sender, error = %e, "dropping malformed feedback args");
                        return Ok(Vec::new());
                    }
                };
                let status = if info.message == InfoKind::DataReceived {
                    SyncOutcome::Successful
                } else {
                    SyncOutcome::Error
                };
                Ok(vec![Event::RemoteStatusChange(StatusChange {
                    sender: info.sender,
                    table: args.table,
                    id: args.id,
                    date: args.date,
                    status,
                    message: args.message,
                })])
            }
        }
    }

    /// Replay a peer's buffered messages in order while it stays present.
    async fn drain_peer_queue(&mut self, peer: &str) -> Result<()> {
        loop {
            if !self.presence.is_connected(peer, now_millis()) {
                return Ok(());
            }
            let Some(message) = self.peer_queue(peer)?.poll()? else {
                return Ok(());
            };
            self.outgoing_store.push(message.clone())?;
            self.client
                .publish(message.topic, QoS::AtLeastOnce, false, message.payload)
                .await?;
        }
    }

    /// End the session gracefully so the broker does not fire the will.
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }

    #[cfg(test)]
    pub fn peer_queue_snapshot(&mut self, peer: &str) -> Vec<StoredMessage> {
        self.peer_queue(peer).unwrap().snapshot()
    }

    #[cfg(test)]
    pub fn outgoing_snapshot(&self) -> Vec<StoredMessage> {
        self.outgoing_store.snapshot()
    }

    #[cfg(test)]
    pub fn incoming_snapshot(&self) -> Vec<StoredMessage> {
        self.incoming_store.snapshot()
    }

    #[cfg(test)]
    pub fn record_presence(&mut self, peer: &str, until: crate::protocol::EpochMillis) {
        self.presence.record(peer, until);
    }
}

async fn run_event_loop(mut event_loop: EventLoop, tx: mpsc::Sender<BusNotice>) {
    loop {
        match event_loop.poll().await {
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                let notice = BusNotice::Frame {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if tx.send(notice).await.is_err() {
                    return;
                }
            }
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                if tx.send(BusNotice::SessionUp).await.is_err() {
                    return;
                }
            }
            Ok(MqttEvent::Incoming(Packet::PubAck(_))) => {
                if tx.send(BusNotice::PublishAcked).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "bus connection error, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_config(queue_dir: &std::path::Path) -> SyncConfig {
        SyncConfig::from_str(&format!(
            r#"{{
                "mqttConfig": {{"host": "127.0.0.1", "port": 1}},
                "mysqlConfig": {{"host": "localhost", "user": "sync", "password": "x", "database": "app"}},
                "syncTables": ["users"],
                "receiveTables": ["users"],
                "clientName": "node-a",
                "remoteClients": ["node-b"],
                "queueDirectory": "{}",
                "checkInterval": 100
            }}"#,
            queue_dir.display()
        ))
        .unwrap()
    }

    fn change_payload(sender: &str, table: &str) -> Vec<u8> {
        serde_json::to_vec(&Change {
            sender: sender.to_string(),
            table: table.to_string(),
            id: "u1".to_string(),
            date: 1700000000000,
            entity: Some(json!({"id": "u1"}).as_object().cloned().unwrap()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_offline_peer_message_is_buffered() {
        let dir = tempdir().unwrap();
        let (mut bus, _rx) = BusGateway::connect(&test_config(dir.path())).unwrap();

        bus.send_change("users".to_string(), "u1".to_string(), None, "node-b".to_string())
            .await
            .unwrap();

        let buffered = bus.peer_queue_snapshot("node-b");
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].topic, "/change/node-b");
        assert!(bus.outgoing_snapshot().is_empty());

        // the buffer is a durable file under the queue directory
        assert!(dir.path().join("remote-node-b.json").exists());
    }

    #[tokio::test]
    async fn test_present_peer_message_is_published() {
        let dir = tempdir().unwrap();
        let (mut bus, _rx) = BusGateway::connect(&test_config(dir.path())).unwrap();
        bus.record_presence("node-b", now_millis() + 60_000);

        bus.send_change("users".to_string(), "u1".to_string(), None, "node-b".to_string())
            .await
            .unwrap();

        assert!(bus.peer_queue_snapshot("node-b").is_empty());
        assert_eq!(bus.outgoing_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_connected_info_drains_peer_queue() {
        let dir = tempdir().unwrap();
        let (mut bus, _rx) = BusGateway::connect(&test_config(dir.path())).unwrap();

        bus.send_change("users".to_string(), "u1".to_string(), None, "node-b".to_string())
            .await
            .unwrap();
        assert_eq!(bus.peer_queue_snapshot("node-b").len(), 1);

        let info = serde_json::to_vec(&InfoMessage {
            sender: "node-b".to_string(),
            message: InfoKind::Connected,
            args: json!({"until": now_millis() + 60_000}),
        })
        .unwrap();
        let events = bus.decode_frame("/info", &info).await.unwrap();
        assert!(events.is_empty());

        assert!(bus.peer_queue_snapshot("node-b").is_empty());
        assert_eq!(bus.outgoing_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_change_for_receive_table_is_accepted() {
        let dir = tempdir().unwrap();
        let (mut bus, _rx) = BusGateway::connect(&test_config(dir.path())).unwrap();

        let events = bus
            .decode_frame("/change/node-a", &change_payload("node-b", "users"))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::RemoteChange(c) if c.table == "users"));
    }

    #[tokio::test]
    async fn test_change_for_unconfigured_table_is_rejected_with_feedback() {
        let dir = tempdir().unwrap();
        let (mut bus, _rx) = BusGateway::connect(&test_config(dir.path())).unwrap();

        let events = bus
            .decode_frame("/change/node-a", &change_payload("node-b", "orders"))
            .await
            .unwrap();
        assert!(events.is_empty());

        // node-b is offline, so the error feedback sits in its queue
        let buffered = bus.peer_queue_snapshot("node-b");
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].topic, "/info/node-b");
        let info: InfoMessage = serde_json::from_str(&buffered[0].payload).unwrap();
        assert_eq!(info.message, InfoKind::Error);
    }

    #[tokio::test]
    async fn test_own_messages_are_ignored() {
        let dir = tempdir().unwrap();
        let (mut bus, _rx) = BusGateway::connect(&test_config(dir.path())).unwrap();

        let events = bus
            .decode_frame("/change/node-a", &change_payload("node-a", "users"))
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let dir = tempdir().unwrap();
        let (mut bus, _rx) = BusGateway::connect(&test_config(dir.path())).unwrap();

        let events = bus.decode_frame("/change/node-a", b"not json").await.unwrap();
        assert!(events.is_empty());

        let events = bus.decode_frame("/info", b"{\"sender\":1}").await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_feedback_becomes_status_change() {
        let dir = tempdir().unwrap();
        let (mut bus, _rx) = BusGateway::connect(&test_config(dir.path())).unwrap();

        let payload = serde_json::to_vec(&InfoMessage {
            sender: "node-b".to_string(),
            message: InfoKind::DataReceived,
            args: json!({"table": "users", "id": "u1", "date": 1234}),
        })
        .unwrap();
        let events = bus.decode_frame("/info/node-a", &payload).await.unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::RemoteStatusChange(status) => {
                assert_eq!(status.sender, "node-b");
                assert_eq!(status.status, SyncOutcome::Successful);
                assert_eq!(status.date, 1234);
            }
            other => panic!("unexpected event {}", other.name()),
        }

        let payload = serde_json::to_vec(&InfoMessage {
            sender: "node-b".to_string(),
            message: InfoKind::Error,
            args: json!({"table": "users", "id": "u1", "date": 1235, "message": "boom"}),
        })
        .unwrap();
        let events = bus.decode_frame("/info/node-a", &payload).await.unwrap();
        match &events[0] {
            Event::RemoteStatusChange(status) => {
                assert_eq!(status.status, SyncOutcome::Error);
                assert_eq!(status.message.as_deref(), Some("boom"));
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_connection_lost_removes_presence() {
        let dir = tempdir().unwrap();
        let (mut bus, _rx) = BusGateway::connect(&test_config(dir.path())).unwrap();
        bus.record_presence("node-b", now_millis() + 60_000);

        let payload = serde_json::to_vec(&InfoMessage {
            sender: "node-b".to_string(),
            message: InfoKind::ConnectionLost,
            args: json!({}),
        })
        .unwrap();
        bus.decode_frame("/info", &payload).await.unwrap();

        // messages for node-b are buffered again
        bus.send_change("users".to_string(), "u1".to_string(), None, "node-b".to_string())
            .await
            .unwrap();
        assert_eq!(bus.peer_queue_snapshot("node-b").len(), 1);
    }

    #[tokio::test]
    async fn test_tick_broadcasts_presence() {
        let dir = tempdir().unwrap();
        let (mut bus, _rx) = BusGateway::connect(&test_config(dir.path())).unwrap();

        bus.tick().await.unwrap();

        let outgoing = bus.outgoing_snapshot();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].topic, "/info");
        let info: InfoMessage = serde_json::from_str(&outgoing[0].payload).unwrap();
        assert_eq!(info.message, InfoKind::Connected);
        let args: ConnectedArgs = serde_json::from_value(info.args).unwrap();
        assert!(args.until > now_millis());

        // not due again immediately
        bus.tick().await.unwrap();
        assert_eq!(bus.outgoing_snapshot().len(), 1);
    }
}
