use crate::error::{Result, RoomError};
use crate::freeze::FrozenUpdates;
use crate::protocol::{
    ClientId, DataKind, DataMessage, EntityState, MediaKind, MediaStream, Moderation, OutboundData,
    RoomEvent, RoomIdentity, SubscribeSpec,
};
use crate::session::{ConnectionManager, SessionConfig};
use crate::subscribe::{Renegotiator, SubscribeConfig};
use crate::sync::{SyncConfig, Synchronizer};
use crate::transport::{ChannelKind, Connector, Handle, LinkEvent};
use ahash::AHashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub identity: RoomIdentity,
    pub session: SessionConfig,
    pub sync: SyncConfig,
    pub subscribe: SubscribeConfig,
}

impl RoomConfig {
    pub fn new(room: impl Into<String>, client_id: impl Into<ClientId>) -> Self {
        Self {
            identity: RoomIdentity::new(room, client_id),
            session: SessionConfig::default(),
            sync: SyncConfig::default(),
            subscribe: SubscribeConfig::default(),
        }
    }

    pub fn with_join_token(mut self, token: impl Into<String>) -> Self {
        self.identity = self.identity.with_join_token(token);
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_subscribe(mut self, subscribe: SubscribeConfig) -> Self {
        self.subscribe = subscribe;
        self
    }
}

/// The consumer-facing adapter: session lifecycle, occupant sync, freeze
/// controls and data send paths, reporting through a typed event stream.
#[derive(Clone)]
pub struct RoomClient {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    identity: RoomIdentity,
    manager: ConnectionManager,
    synchronizer: Synchronizer,
    freeze: Mutex<FrozenUpdates>,
    blocked: Mutex<AHashSet<ClientId>>,
    publisher: Mutex<Option<Arc<dyn Handle>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<RoomEvent>,
}

impl RoomClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: RoomConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(connector, config.session, events.clone());
        let synchronizer = Synchronizer::new(
            config.identity.clone(),
            manager.clone(),
            config.sync,
            config.subscribe,
            events.clone(),
        );
        let client = Self {
            shared: Arc::new(ClientShared {
                identity: config.identity,
                manager,
                synchronizer,
                freeze: Mutex::new(FrozenUpdates::new()),
                blocked: Mutex::new(AHashSet::new()),
                publisher: Mutex::new(None),
                driver: Mutex::new(None),
                events,
            }),
        };
        (client, receiver)
    }

    /// Connect the signaling session and establish the publisher link.
    /// Resolves once the room is joined and occupant sync can begin.
    pub async fn connect(&self) -> Result<()> {
        self.shared.manager.connect().await?;
        setup_publisher(&self.shared).await?;
        self.spawn_driver();
        Ok(())
    }

    pub async fn disconnect(&self) {
        teardown_room(&self.shared).await;
        if let Some(driver) = self.shared.driver.lock().unwrap().take() {
            driver.abort();
        }
        self.shared.manager.disconnect().await;
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.manager.is_disconnected()
    }

    pub fn is_frozen(&self) -> bool {
        self.shared.freeze.lock().unwrap().is_frozen()
    }

    pub fn freeze(&self) {
        self.shared.freeze.lock().unwrap().freeze();
    }

    /// Resume live delivery and flush the buffered, conflict-resolved
    /// updates. Owner and block state are evaluated now, not at buffer time.
    pub fn unfreeze(&self) {
        let established: AHashSet<ClientId> =
            self.shared.synchronizer.established_ids().into_iter().collect();
        let blocked = self.shared.blocked.lock().unwrap().clone();
        let flushed = {
            let mut freeze = self.shared.freeze.lock().unwrap();
            freeze.unfreeze();
            freeze.flush(|owner| established.contains(owner) && !blocked.contains(owner))
        };
        for message in flushed {
            let _ = self.shared.events.send(RoomEvent::Message(message));
        }
    }

    pub fn toggle_freeze(&self) {
        if self.is_frozen() {
            self.unfreeze();
        } else {
            self.freeze();
        }
    }

    /// Reconcile the requested occupant set; `None` re-runs reconciliation
    /// with the previous request.
    pub async fn sync_occupants(&self, requested: Option<Vec<ClientId>>) {
        self.shared.synchronizer.sync_occupants(requested).await;
    }

    pub fn occupants(&self) -> Vec<ClientId> {
        self.shared.synchronizer.established_ids()
    }

    pub fn is_connected_to(&self, id: &str) -> bool {
        self.shared.synchronizer.is_established(id)
    }

    pub async fn media_stream(&self, id: &str, kind: MediaKind) -> Result<MediaStream> {
        self.shared.synchronizer.media_stream(id, kind).await
    }

    /// Buffered state for one entity while frozen, with flush-time owner
    /// filtering applied.
    pub fn pending_update(&self, network_id: &str) -> Option<EntityState> {
        let established: AHashSet<ClientId> =
            self.shared.synchronizer.established_ids().into_iter().collect();
        let blocked = self.shared.blocked.lock().unwrap().clone();
        self.shared
            .freeze
            .lock()
            .unwrap()
            .pending_update(network_id, |owner| {
                established.contains(owner) && !blocked.contains(owner)
            })
    }

    pub async fn send_data(
        &self,
        to: ClientId,
        data_type: DataKind,
        data: serde_json::Value,
    ) -> Result<()> {
        self.send(ChannelKind::Unreliable, Some(to), data_type, data).await
    }

    pub async fn send_data_guaranteed(
        &self,
        to: ClientId,
        data_type: DataKind,
        data: serde_json::Value,
    ) -> Result<()> {
        self.send(ChannelKind::Reliable, Some(to), data_type, data).await
    }

    pub async fn broadcast_data(&self, data_type: DataKind, data: serde_json::Value) -> Result<()> {
        self.send(ChannelKind::Unreliable, None, data_type, data).await
    }

    pub async fn broadcast_data_guaranteed(
        &self,
        data_type: DataKind,
        data: serde_json::Value,
    ) -> Result<()> {
        self.send(ChannelKind::Reliable, None, data_type, data).await
    }

    async fn send(
        &self,
        channel: ChannelKind,
        to: Option<ClientId>,
        data_type: DataKind,
        data: serde_json::Value,
    ) -> Result<()> {
        let publisher = self
            .shared
            .publisher
            .lock()
            .unwrap()
            .clone()
            .ok_or(RoomError::NotConnected)?;
        publisher
            .send_data(channel, OutboundData { to, data_type, data })
            .await
    }

    pub async fn block(&self, id: ClientId) -> Result<()> {
        let publisher = self.publisher()?;
        publisher.moderate(Moderation::Block { whom: id.clone() }).await?;
        self.shared.blocked.lock().unwrap().insert(id.clone());
        let _ = self.shared.events.send(RoomEvent::Blocked { by: id });
        Ok(())
    }

    pub async fn unblock(&self, id: ClientId) -> Result<()> {
        let publisher = self.publisher()?;
        publisher.moderate(Moderation::Unblock { whom: id.clone() }).await?;
        self.shared.blocked.lock().unwrap().remove(&id);
        let _ = self.shared.events.send(RoomEvent::Unblocked { by: id });
        Ok(())
    }

    pub async fn kick(&self, id: ClientId, token: impl Into<String>) -> Result<()> {
        let publisher = self.publisher()?;
        publisher
            .moderate(Moderation::Kick { whom: id.clone(), token: token.into() })
            .await?;
        let _ = self.shared.events.send(RoomEvent::Kicked { client_id: id });
        Ok(())
    }

    fn publisher(&self) -> Result<Arc<dyn Handle>> {
        self.shared
            .publisher
            .lock()
            .unwrap()
            .clone()
            .ok_or(RoomError::NotConnected)
    }

    fn spawn_driver(&self) {
        let shared = self.shared.clone();
        let mut epoch = self.shared.manager.epoch();
        epoch.borrow_and_update();
        let mut shutdown = self.shared.manager.closed();
        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = epoch.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        // a reconnect produced a fresh session, rebuild the
                        // publisher and the per-occupant links
                        teardown_room(&shared).await;
                        if let Err(err) = setup_publisher(&shared).await {
                            warn!(error = %err, "failed to reestablish publisher after reconnect");
                        }
                    }
                    _ = shutdown.wait_for(|stop| *stop) => return,
                }
            }
        });
        let previous = self.shared.driver.lock().unwrap().replace(driver);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

async fn setup_publisher(shared: &Arc<ClientShared>) -> Result<()> {
    let handle: Arc<dyn Handle> = Arc::from(shared.manager.attach().await?);

    debug!("publisher waiting for link");
    loop {
        match handle.event().await {
            Some(LinkEvent::LinkReady) => break,
            Some(LinkEvent::IceCandidate(candidate)) => {
                if let Err(err) = handle.send_trickle(candidate).await {
                    warn!(error = %err, "error trickling ICE");
                }
            }
            Some(_) => {}
            None => return Err(RoomError::ConnectionClosed),
        }
    }

    debug!("publisher waiting for join");
    let request = shared
        .identity
        .join_request(SubscribeSpec::Publisher { notifications: true, data: true });
    let reply = handle.join(request).await?;
    if !reply.success {
        let reason = reply.error.unwrap_or_else(|| "join refused".to_string());
        warn!(error = %reason, "publisher join rejected");
        return Err(RoomError::JoinRejected(reason));
    }

    if reply
        .initial_occupants
        .iter()
        .any(|id| *id == shared.identity.client_id)
    {
        // the server still has a previous session for this client
        warn!("zombie session detected, scheduling delayed reconnect");
        shared.manager.schedule_delayed_reconnect();
    }

    *shared.publisher.lock().unwrap() = Some(handle.clone());
    spawn_publisher_pump(shared.clone(), handle);
    debug!("publisher ready");

    let _ = shared.events.send(RoomEvent::Connected {
        client_id: shared.identity.client_id.clone(),
    });

    for id in reply.initial_occupants {
        if id == shared.identity.client_id {
            continue;
        }
        shared.synchronizer.add_available(id);
    }
    shared.synchronizer.sync_occupants(None).await;
    Ok(())
}

fn spawn_publisher_pump(shared: Arc<ClientShared>, handle: Arc<dyn Handle>) {
    let renegotiator = Renegotiator::new(handle.clone());
    tokio::spawn(async move {
        while let Some(event) = handle.event().await {
            match event {
                LinkEvent::PeerJoined(id) => {
                    shared.synchronizer.add_available(id);
                    shared.synchronizer.sync_occupants(None).await;
                }
                LinkEvent::PeerLeft(id) => {
                    shared.synchronizer.remove_available(&id);
                    shared.synchronizer.remove_occupant(&id).await;
                }
                LinkEvent::Blocked { by } => {
                    let _ = shared.events.send(RoomEvent::Blocked { by });
                }
                LinkEvent::Unblocked { by } => {
                    let _ = shared.events.send(RoomEvent::Unblocked { by });
                }
                LinkEvent::Data(message) => deliver(&shared, message),
                LinkEvent::RenegotiationNeeded => renegotiator.trigger(),
                LinkEvent::IceCandidate(candidate) => {
                    if let Err(err) = handle.send_trickle(candidate).await {
                        warn!(error = %err, "error trickling ICE");
                    }
                }
                LinkEvent::IceFailure => {
                    warn!("ICE failure detected, scheduling delayed reconnect");
                    shared.manager.schedule_delayed_reconnect();
                }
                LinkEvent::LinkReady => {}
            }
        }
    });
}

fn deliver(shared: &Arc<ClientShared>, message: DataMessage) {
    if message.data_type.is_entity() {
        // routing is decided under the buffer lock so a message lands in
        // exactly one of live delivery or the buffer
        let mut freeze = shared.freeze.lock().unwrap();
        if freeze.is_frozen() {
            freeze.store(message);
            return;
        }
    }
    let _ = shared.events.send(RoomEvent::Message(message));
}

async fn teardown_room(shared: &Arc<ClientShared>) {
    shared.synchronizer.remove_all().await;
    let publisher = shared.publisher.lock().unwrap().take();
    if let Some(handle) = publisher {
        handle.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MediaTrack, UpdateData};
    use crate::transport::memory::{MemoryBackend, MemoryConnector};
    use std::time::Duration;

    fn client(
        backend: &Arc<MemoryBackend>,
    ) -> (RoomClient, mpsc::UnboundedReceiver<RoomEvent>) {
        RoomClient::new(
            Arc::new(MemoryConnector::new(backend.clone())),
            RoomConfig::new("lobby", "me"),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RoomEvent>) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn update_from(owner: &str, network_id: &str, time: i64) -> DataMessage {
        DataMessage::update(EntityState::new(network_id).with_owner(owner, time))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_emits_connected_and_seeds_occupants() {
        let backend = MemoryBackend::new();
        backend.set_initial_occupants(vec!["alice".to_string()]);
        let (client, mut rx) = client(&backend);

        client.connect().await.unwrap();
        client.sync_occupants(Some(vec!["alice".to_string()])).await;
        settle().await;

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, RoomEvent::Connected { client_id } if client_id == "me")));
        assert!(events
            .iter()
            .any(|event| matches!(event, RoomEvent::OccupantConnected(id) if id == "alice")));
        assert!(client.is_connected_to("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_events_drive_occupancy() {
        let backend = MemoryBackend::new();
        let (client, mut rx) = client(&backend);

        client.connect().await.unwrap();
        client.sync_occupants(Some(vec!["bob".to_string()])).await;
        settle().await;
        assert!(!client.is_connected_to("bob"));

        backend.peer_join("bob");
        settle().await;
        assert!(client.is_connected_to("bob"));

        backend.peer_leave("bob");
        backend.peer_leave("bob");
        settle().await;
        assert!(!client.is_connected_to("bob"));

        let disconnects = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, RoomEvent::OccupantDisconnected(id) if id == "bob"))
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(backend.attach_count(), backend.close_count() + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_paths_pick_channels() {
        let backend = MemoryBackend::new();
        let (client, _rx) = client(&backend);
        client.connect().await.unwrap();

        client
            .send_data("bob".to_string(), DataKind::Other("chat".into()), serde_json::json!("hi"))
            .await
            .unwrap();
        client
            .send_data_guaranteed("bob".to_string(), DataKind::Update, serde_json::json!({}))
            .await
            .unwrap();
        client
            .broadcast_data(DataKind::Other("ping".into()), serde_json::json!(1))
            .await
            .unwrap();
        client
            .broadcast_data_guaranteed(DataKind::Remove, serde_json::json!({}))
            .await
            .unwrap();

        let sent = backend.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0].0, ChannelKind::Unreliable);
        assert_eq!(sent[0].1.to.as_deref(), Some("bob"));
        assert_eq!(sent[1].0, ChannelKind::Reliable);
        assert_eq!(sent[2].0, ChannelKind::Unreliable);
        assert!(sent[2].1.to.is_none());
        assert_eq!(sent[3].0, ChannelKind::Reliable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_connect_fails() {
        let backend = MemoryBackend::new();
        let (client, _rx) = client(&backend);

        let result = client
            .broadcast_data(DataKind::Other("chat".into()), serde_json::json!("hi"))
            .await;
        assert!(matches!(result, Err(RoomError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_buffers_and_flush_filters() {
        let backend = MemoryBackend::new();
        let (client, mut rx) = client(&backend);
        client.connect().await.unwrap();

        backend.peer_join("alice");
        client.sync_occupants(Some(vec!["alice".to_string()])).await;
        settle().await;
        drain(&mut rx);

        client.freeze();
        backend.push_data(update_from("alice", "net-1", 1));
        backend.push_data(update_from("ghost", "net-2", 1));
        settle().await;

        // nothing delivered while frozen
        assert!(drain(&mut rx).is_empty());
        assert!(client.pending_update("net-1").is_some());
        assert!(client.pending_update("net-2").is_none());

        client.unfreeze();
        let messages: Vec<DataMessage> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                RoomEvent::Message(message) => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(messages.len(), 1);
        match &messages[0].data {
            UpdateData::Entity(state) => assert_eq!(state.network_id, "net-1"),
            other => panic!("expected entity data, got {:?}", other),
        }
        assert!(!client.is_frozen());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_owner_filtered_at_flush_time() {
        let backend = MemoryBackend::new();
        let (client, mut rx) = client(&backend);
        client.connect().await.unwrap();

        backend.peer_join("alice");
        client.sync_occupants(Some(vec!["alice".to_string()])).await;
        settle().await;
        drain(&mut rx);

        client.freeze();
        backend.push_data(update_from("alice", "net-1", 1));
        settle().await;

        // alice was not blocked at buffer time, but is at flush time
        client.block("alice".to_string()).await.unwrap();
        client.unfreeze();

        let messages = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, RoomEvent::Message(_)))
            .count();
        assert_eq!(messages, 0);
        assert!(backend
            .moderations()
            .iter()
            .any(|action| matches!(action, Moderation::Block { whom } if whom == "alice")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_entity_messages_stay_live_while_frozen() {
        let backend = MemoryBackend::new();
        let (client, mut rx) = client(&backend);
        client.connect().await.unwrap();
        drain(&mut rx);

        client.freeze();
        backend.push_data(DataMessage::other("chat", serde_json::json!("hello")));
        settle().await;

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, RoomEvent::Message(message)
                if message.data_type == DataKind::Other("chat".to_string()))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_freeze_flushes_on_resume() {
        let backend = MemoryBackend::new();
        let (client, _rx) = client(&backend);
        client.connect().await.unwrap();

        client.toggle_freeze();
        assert!(client.is_frozen());
        client.toggle_freeze();
        assert!(!client.is_frozen());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_rebuilds_publisher_and_occupants() {
        let backend = MemoryBackend::new();
        let (client, mut rx) = client(&backend);
        client.connect().await.unwrap();

        backend.peer_join("alice");
        client.sync_occupants(Some(vec!["alice".to_string()])).await;
        settle().await;
        assert!(client.is_connected_to("alice"));
        drain(&mut rx);

        backend.drop_sessions(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;

        let events = drain(&mut rx);
        assert!(events.iter().any(|event| matches!(event, RoomEvent::Reconnected)));
        assert!(events
            .iter()
            .any(|event| matches!(event, RoomEvent::Connected { .. })));
        // the publisher was rebuilt on the new session
        assert!(client
            .broadcast_data(DataKind::Other("chat".into()), serde_json::json!("hi"))
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zombie_session_schedules_delayed_reconnect() {
        let backend = MemoryBackend::new();
        backend.set_initial_occupants(vec!["me".to_string()]);
        let (client, _rx) = client(&backend);

        client.connect().await.unwrap();
        backend.set_initial_occupants(vec![]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;

        // the delayed reconnect replaced the zombie session
        assert!(!client.is_disconnected());
        assert!(client
            .broadcast_data(DataKind::Other("chat".into()), serde_json::json!("hi"))
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_stream_via_client() {
        let backend = MemoryBackend::new();
        backend.set_remote_tracks(vec![MediaTrack::audio("a0"), MediaTrack::video("v0")]);
        let (client, _rx) = client(&backend);
        client.connect().await.unwrap();

        backend.peer_join("alice");
        client.sync_occupants(Some(vec!["alice".to_string()])).await;
        settle().await;

        let audio = client.media_stream("alice", MediaKind::Audio).await.unwrap();
        assert_eq!(audio.tracks.len(), 1);
        assert_eq!(audio.tracks[0].kind, MediaKind::Audio);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_tears_everything_down() {
        let backend = MemoryBackend::new();
        let (client, mut rx) = client(&backend);
        client.connect().await.unwrap();

        backend.peer_join("alice");
        client.sync_occupants(Some(vec!["alice".to_string()])).await;
        settle().await;
        drain(&mut rx);

        client.disconnect().await;
        settle().await;

        assert!(client.is_disconnected());
        assert!(client.occupants().is_empty());
        assert_eq!(backend.attach_count(), backend.close_count());
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, RoomEvent::OccupantDisconnected(id) if id == "alice")));
    }
}
