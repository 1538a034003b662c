use crate::error::{Result, RoomError};
use crate::protocol::{ClientId, MediaKind, MediaStream, MediaTrack, RoomEvent, RoomIdentity};
use crate::session::ConnectionManager;
use crate::subscribe::{subscribe_occupant, Renegotiator, SubscribeConfig, SubscribeOutcome};
use crate::transport::{Handle, LinkEvent};
use ahash::{AHashMap, AHashSet};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub available_threshold: usize,
    pub max_subscribe_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            available_threshold: 5,
            max_subscribe_delay: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_available_threshold(mut self, threshold: usize) -> Self {
        self.available_threshold = threshold;
        self
    }

    pub fn with_max_subscribe_delay(mut self, delay: Duration) -> Self {
        self.max_subscribe_delay = delay;
        self
    }
}

/// Membership state for every known occupant. An occupant is in at most one
/// of pending/established at a time; the synchronizer is the single writer.
#[derive(Default)]
pub struct Roster {
    available: Vec<ClientId>,
    pending: AHashSet<ClientId>,
    established: AHashMap<ClientId, Arc<dyn Handle>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_available(&self, id: &str) -> bool {
        self.available.iter().any(|occupant| occupant == id)
    }

    pub fn add_available(&mut self, id: ClientId) -> bool {
        if self.is_available(&id) {
            return false;
        }
        self.available.push(id);
        true
    }

    pub fn remove_available(&mut self, id: &str) -> bool {
        match self.available.iter().position(|occupant| occupant == id) {
            Some(index) => {
                self.available.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains(id)
    }

    pub fn mark_pending(&mut self, id: ClientId) -> bool {
        self.pending.insert(id)
    }

    pub fn unmark_pending(&mut self, id: &str) -> bool {
        self.pending.remove(id)
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn is_established(&self, id: &str) -> bool {
        self.established.contains_key(id)
    }

    pub fn established_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.established.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn insert_established(&mut self, id: ClientId, handle: Arc<dyn Handle>) {
        self.established.insert(id, handle);
    }

    fn remove_established(&mut self, id: &str) -> Option<Arc<dyn Handle>> {
        self.established.remove(id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OccupantMedia {
    pub audio: MediaStream,
    pub video: MediaStream,
}

impl OccupantMedia {
    fn from_tracks(tracks: Vec<MediaTrack>) -> Self {
        let mut media = Self::default();
        for track in tracks {
            match track.kind {
                MediaKind::Audio => media.audio.tracks.push(track),
                MediaKind::Video => media.video.tracks.push(track),
            }
        }
        media
    }

    fn stream(&self, kind: MediaKind) -> MediaStream {
        match kind {
            MediaKind::Audio => self.audio.clone(),
            MediaKind::Video => self.video.clone(),
        }
    }
}

#[derive(Default)]
struct PendingMedia {
    audio: Vec<oneshot::Sender<Result<MediaStream>>>,
    video: Vec<oneshot::Sender<Result<MediaStream>>>,
}

#[derive(Default)]
struct MediaRegistry {
    streams: AHashMap<ClientId, OccupantMedia>,
    pending: AHashMap<ClientId, PendingMedia>,
}

impl MediaRegistry {
    fn set(&mut self, id: &ClientId, tracks: Vec<MediaTrack>) {
        let media = OccupantMedia::from_tracks(tracks);
        if let Some(pending) = self.pending.remove(id) {
            for waiter in pending.audio {
                let _ = waiter.send(Ok(media.audio.clone()));
            }
            for waiter in pending.video {
                let _ = waiter.send(Ok(media.video.clone()));
            }
        }
        self.streams.insert(id.clone(), media);
    }

    fn remove(&mut self, id: &str) {
        self.streams.remove(id);
        if let Some(pending) = self.pending.remove(id) {
            for waiter in pending.audio.into_iter().chain(pending.video) {
                let _ = waiter.send(Err(RoomError::PeerDisconnected));
            }
        }
    }
}

/// Reconciles the requested occupant set against available, pending and
/// established occupants, starting and cancelling subscription attempts.
#[derive(Clone)]
pub struct Synchronizer {
    shared: Arc<SyncShared>,
}

struct SyncShared {
    identity: RoomIdentity,
    manager: ConnectionManager,
    config: SyncConfig,
    subscribe: SubscribeConfig,
    roster: Mutex<Roster>,
    requested: Mutex<AHashSet<ClientId>>,
    media: Mutex<MediaRegistry>,
    events: mpsc::UnboundedSender<RoomEvent>,
}

impl Synchronizer {
    pub fn new(
        identity: RoomIdentity,
        manager: ConnectionManager,
        config: SyncConfig,
        subscribe: SubscribeConfig,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(SyncShared {
                identity,
                manager,
                config,
                subscribe,
                roster: Mutex::new(Roster::new()),
                requested: Mutex::new(AHashSet::new()),
                media: Mutex::new(MediaRegistry::default()),
                events,
            }),
        }
    }

    pub fn add_available(&self, id: ClientId) {
        if self.shared.roster.lock().unwrap().add_available(id.clone()) {
            debug!(occupant = %id, "occupant available");
        }
    }

    pub fn remove_available(&self, id: &str) {
        self.shared.roster.lock().unwrap().remove_available(id);
    }

    pub fn is_established(&self, id: &str) -> bool {
        self.shared.roster.lock().unwrap().is_established(id)
    }

    pub fn established_ids(&self) -> Vec<ClientId> {
        self.shared.roster.lock().unwrap().established_ids()
    }

    /// Reconcile requested occupants: start a subscription for every
    /// requested, available occupant that is neither pending nor
    /// established; tear down established occupants no longer requested.
    pub async fn sync_occupants(&self, requested: Option<Vec<ClientId>>) {
        if let Some(list) = requested {
            *self.shared.requested.lock().unwrap() = list.into_iter().collect();
        }
        let wanted = self.shared.requested.lock().unwrap().clone();

        let (to_add, to_remove) = {
            let roster = self.shared.roster.lock().unwrap();
            let to_add: Vec<ClientId> = wanted
                .iter()
                .filter(|id| {
                    roster.is_available(id) && !roster.is_pending(id) && !roster.is_established(id)
                })
                .cloned()
                .collect();
            let to_remove: Vec<ClientId> = roster
                .established_ids()
                .into_iter()
                .filter(|id| !wanted.contains(id))
                .collect();
            (to_add, to_remove)
        };

        for id in to_add {
            self.spawn_subscribe(id);
        }
        for id in to_remove {
            self.remove_occupant(&id).await;
        }
        self.emit_occupants_changed();
    }

    fn spawn_subscribe(&self, id: ClientId) {
        if !self.shared.roster.lock().unwrap().mark_pending(id.clone()) {
            return;
        }
        debug!(occupant = %id, "subscribing");
        let shared = self.shared.clone();
        tokio::spawn(async move {
            // smooth out bursts of simultaneous joins
            let available_count = shared.roster.lock().unwrap().available_len();
            if available_count > shared.config.available_threshold {
                let jitter = shared
                    .config
                    .max_subscribe_delay
                    .mul_f64(rand::thread_rng().gen::<f64>());
                tokio::time::sleep(jitter).await;
            }

            let outcome = subscribe_occupant(
                &shared.manager,
                &shared.roster,
                &shared.identity,
                &id,
                &shared.subscribe,
            )
            .await;

            match outcome {
                SubscribeOutcome::Ready { handle, media, renegotiator } => {
                    let promoted = {
                        let mut roster = shared.roster.lock().unwrap();
                        if roster.unmark_pending(&id) {
                            roster.insert_established(id.clone(), handle.clone());
                            true
                        } else {
                            false
                        }
                    };
                    if !promoted {
                        // the occupant was removed while the link came up
                        debug!(occupant = %id, "discarding link, occupant no longer requested");
                        handle.close().await;
                        return;
                    }
                    spawn_link_pump(shared.clone(), handle, renegotiator);
                    shared.media.lock().unwrap().set(&id, media);
                    let _ = shared.events.send(RoomEvent::OccupantConnected(id));
                }
                SubscribeOutcome::Cancelled | SubscribeOutcome::Failed => {
                    shared.roster.lock().unwrap().unmark_pending(&id);
                }
            }
        });
    }

    /// Idempotent: pending and established entries are cleared, the link is
    /// released, outstanding media waiters fail, and the consumer is
    /// notified exactly once.
    pub async fn remove_occupant(&self, id: &str) {
        let (was_pending, handle) = {
            let mut roster = self.shared.roster.lock().unwrap();
            (roster.unmark_pending(id), roster.remove_established(id))
        };
        let was_established = handle.is_some();
        if let Some(handle) = handle {
            handle.close().await;
        }
        self.shared.media.lock().unwrap().remove(id);
        if was_established {
            debug!(occupant = %id, "occupant removed");
            let _ = self
                .shared
                .events
                .send(RoomEvent::OccupantDisconnected(id.to_string()));
        } else if was_pending {
            debug!(occupant = %id, "pending subscription cancelled");
        }
    }

    pub async fn remove_all(&self) {
        let ids = {
            let mut roster = self.shared.roster.lock().unwrap();
            roster.clear_pending();
            roster.established_ids()
        };
        for id in ids {
            self.remove_occupant(&id).await;
        }
    }

    /// Resolves immediately if the occupant's media is captured, otherwise
    /// waits for capture. Fails with `PeerDisconnected` if the occupant is
    /// removed first.
    pub async fn media_stream(&self, id: &str, kind: MediaKind) -> Result<MediaStream> {
        let waiter = {
            let mut media = self.shared.media.lock().unwrap();
            if let Some(captured) = media.streams.get(id) {
                return Ok(captured.stream(kind));
            }
            let (tx, rx) = oneshot::channel();
            let pending = media.pending.entry(id.to_string()).or_default();
            match kind {
                MediaKind::Audio => pending.audio.push(tx),
                MediaKind::Video => pending.video.push(tx),
            }
            rx
        };
        match waiter.await {
            Ok(result) => result,
            Err(_) => Err(RoomError::PeerDisconnected),
        }
    }

    fn emit_occupants_changed(&self) {
        let ids = self.shared.roster.lock().unwrap().established_ids();
        let _ = self.shared.events.send(RoomEvent::OccupantsChanged(ids));
    }
}

fn spawn_link_pump(shared: Arc<SyncShared>, handle: Arc<dyn Handle>, renegotiator: Renegotiator) {
    tokio::spawn(async move {
        while let Some(event) = handle.event().await {
            match event {
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
                _ => {}
            }
        }
    });
}
