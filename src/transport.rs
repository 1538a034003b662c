use crate::error::Result;
use crate::protocol::{
    ClientId, DataMessage, JoinReply, JoinRequest, MediaTrack, Moderation, OutboundData,
};
use async_trait::async_trait;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect {
    pub normal: bool,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    LinkReady,
    IceCandidate(Option<String>),
    RenegotiationNeeded,
    IceFailure,
    PeerJoined(ClientId),
    PeerLeft(ClientId),
    Blocked { by: ClientId },
    Unblocked { by: ClientId },
    Data(DataMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Reliable,
    Unreliable,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> Result<Box<dyn Session>>;
}

/// One logical signaling session. `dispose` releases resources without
/// firing the `closed` watch; the watch reports transport-initiated
/// closures only.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    async fn create(&self) -> Result<()>;
    async fn attach(&self) -> Result<Box<dyn Handle>>;
    fn closed(&self) -> watch::Receiver<Option<Disconnect>>;
    async fn dispose(&self);
}

#[async_trait]
pub trait Handle: Send + Sync + 'static {
    async fn join(&self, request: JoinRequest) -> Result<JoinReply>;
    /// Next event from the link; `None` once the handle is closed.
    async fn event(&self) -> Option<LinkEvent>;
    async fn send_trickle(&self, candidate: Option<String>) -> Result<()>;
    async fn renegotiate(&self) -> Result<()>;
    async fn send_data(&self, channel: ChannelKind, data: OutboundData) -> Result<()>;
    fn remote_media(&self) -> Vec<MediaTrack>;
    async fn moderate(&self, action: Moderation) -> Result<()>;
    async fn close(&self);
}

pub mod memory {
    use super::*;
    use crate::error::RoomError;
    use crate::protocol::SubscribeSpec;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::{mpsc, Mutex as AsyncMutex};

    /// Scriptable in-memory backend standing in for a signaling server and
    /// its per-occupant links. Tests drive membership events and failure
    /// injection through it and assert on the recorded traffic.
    pub struct MemoryBackend {
        state: Mutex<BackendState>,
        next_handle_id: AtomicU64,
        attach_count: AtomicU64,
        close_count: AtomicU64,
        renegotiate_count: AtomicU64,
        auto_link_ready: AtomicBool,
        open_failures: AtomicU64,
        fail_create: AtomicBool,
        fail_attach: AtomicBool,
    }

    #[derive(Default)]
    struct BackendState {
        link_ready_delay: Duration,
        renegotiate_delay: Duration,
        remote_tracks: Vec<MediaTrack>,
        join_error: Option<String>,
        initial_occupants: Vec<ClientId>,
        handles: Vec<HandleHooks>,
        sessions: Vec<watch::Sender<Option<Disconnect>>>,
        sent: Vec<(ChannelKind, OutboundData)>,
        moderations: Vec<Moderation>,
    }

    struct HandleHooks {
        id: u64,
        events: mpsc::UnboundedSender<LinkEvent>,
        publisher: bool,
        target: Option<ClientId>,
    }

    impl MemoryBackend {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(BackendState::default()),
                next_handle_id: AtomicU64::new(0),
                attach_count: AtomicU64::new(0),
                close_count: AtomicU64::new(0),
                renegotiate_count: AtomicU64::new(0),
                auto_link_ready: AtomicBool::new(true),
                open_failures: AtomicU64::new(0),
                fail_create: AtomicBool::new(false),
                fail_attach: AtomicBool::new(false),
            })
        }

        pub fn set_auto_link_ready(&self, auto: bool) {
            self.auto_link_ready.store(auto, Ordering::SeqCst);
        }

        pub fn set_link_ready_delay(&self, delay: Duration) {
            self.state.lock().unwrap().link_ready_delay = delay;
        }

        pub fn set_renegotiate_delay(&self, delay: Duration) {
            self.state.lock().unwrap().renegotiate_delay = delay;
        }

        pub fn set_remote_tracks(&self, tracks: Vec<MediaTrack>) {
            self.state.lock().unwrap().remote_tracks = tracks;
        }

        pub fn set_join_error(&self, error: Option<String>) {
            self.state.lock().unwrap().join_error = error;
        }

        pub fn set_initial_occupants(&self, occupants: Vec<ClientId>) {
            self.state.lock().unwrap().initial_occupants = occupants;
        }

        /// The next `count` connection opens fail with a transport error.
        pub fn set_open_failures(&self, count: u64) {
            self.open_failures.store(count, Ordering::SeqCst);
        }

        pub fn set_fail_create(&self, fail: bool) {
            self.fail_create.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_attach(&self, fail: bool) {
            self.fail_attach.store(fail, Ordering::SeqCst);
        }

        pub fn attach_count(&self) -> u64 {
            self.attach_count.load(Ordering::SeqCst)
        }

        pub fn close_count(&self) -> u64 {
            self.close_count.load(Ordering::SeqCst)
        }

        pub fn renegotiate_count(&self) -> u64 {
            self.renegotiate_count.load(Ordering::SeqCst)
        }

        pub fn sent(&self) -> Vec<(ChannelKind, OutboundData)> {
            self.state.lock().unwrap().sent.clone()
        }

        pub fn moderations(&self) -> Vec<Moderation> {
            self.state.lock().unwrap().moderations.clone()
        }

        pub fn peer_join(&self, id: impl Into<ClientId>) {
            self.send_to_publishers(LinkEvent::PeerJoined(id.into()));
        }

        pub fn peer_leave(&self, id: impl Into<ClientId>) {
            self.send_to_publishers(LinkEvent::PeerLeft(id.into()));
        }

        pub fn push_data(&self, message: DataMessage) {
            self.send_to_publishers(LinkEvent::Data(message));
        }

        /// Fire link-ready for the handle subscribed to `target`.
        pub fn link_ready_for(&self, target: &str) {
            let state = self.state.lock().unwrap();
            for hooks in &state.handles {
                if hooks.target.as_deref() == Some(target) {
                    let _ = hooks.events.send(LinkEvent::LinkReady);
                }
            }
        }

        /// Close every live session from the server side.
        pub fn drop_sessions(&self, normal: bool) {
            let mut state = self.state.lock().unwrap();
            for session in state.sessions.drain(..) {
                session.send_replace(Some(Disconnect { normal }));
            }
        }

        fn send_to_publishers(&self, event: LinkEvent) {
            let state = self.state.lock().unwrap();
            for hooks in &state.handles {
                if hooks.publisher {
                    let _ = hooks.events.send(event.clone());
                }
            }
        }

        fn register_handle(self: &Arc<Self>) -> MemoryHandle {
            let id = self.next_handle_id.fetch_add(1, Ordering::SeqCst) + 1;
            let (tx, rx) = mpsc::unbounded_channel();
            let delay = {
                let mut state = self.state.lock().unwrap();
                state.handles.push(HandleHooks {
                    id,
                    events: tx.clone(),
                    publisher: false,
                    target: None,
                });
                state.link_ready_delay
            };
            self.attach_count.fetch_add(1, Ordering::SeqCst);
            if self.auto_link_ready.load(Ordering::SeqCst) {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(LinkEvent::LinkReady);
                });
            }
            MemoryHandle {
                backend: Arc::clone(self),
                id,
                events: AsyncMutex::new(rx),
                closed: AtomicBool::new(false),
            }
        }

        fn note_join(&self, handle_id: u64, request: &JoinRequest) -> JoinReply {
            let mut state = self.state.lock().unwrap();
            if let Some(error) = state.join_error.clone() {
                return JoinReply {
                    success: false,
                    initial_occupants: Vec::new(),
                    error: Some(error),
                };
            }
            let initial = match &request.subscribe {
                SubscribeSpec::Publisher { .. } => state.initial_occupants.clone(),
                SubscribeSpec::Media { .. } => Vec::new(),
            };
            if let Some(hooks) = state.handles.iter_mut().find(|h| h.id == handle_id) {
                match &request.subscribe {
                    SubscribeSpec::Publisher { .. } => hooks.publisher = true,
                    SubscribeSpec::Media { target } => hooks.target = Some(target.clone()),
                }
            }
            JoinReply {
                success: true,
                initial_occupants: initial,
                error: None,
            }
        }

        fn unregister_handle(&self, handle_id: u64) {
            let mut state = self.state.lock().unwrap();
            state.handles.retain(|h| h.id != handle_id);
        }
    }

    pub struct MemoryConnector {
        backend: Arc<MemoryBackend>,
    }

    impl MemoryConnector {
        pub fn new(backend: Arc<MemoryBackend>) -> Self {
            Self { backend }
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn open(&self) -> Result<Box<dyn Session>> {
            let failed = self
                .backend
                .open_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(RoomError::Transport("connection refused".to_string()));
            }
            let (closed_tx, closed_rx) = watch::channel(None);
            self.backend.state.lock().unwrap().sessions.push(closed_tx);
            Ok(Box::new(MemorySession {
                backend: Arc::clone(&self.backend),
                closed: closed_rx,
            }))
        }
    }

    pub struct MemorySession {
        backend: Arc<MemoryBackend>,
        closed: watch::Receiver<Option<Disconnect>>,
    }

    #[async_trait]
    impl Session for MemorySession {
        async fn create(&self) -> Result<()> {
            if self.backend.fail_create.load(Ordering::SeqCst) {
                return Err(RoomError::Session("session create failed".to_string()));
            }
            Ok(())
        }

        async fn attach(&self) -> Result<Box<dyn Handle>> {
            if self.backend.fail_attach.load(Ordering::SeqCst) {
                return Err(RoomError::Transport("attach refused".to_string()));
            }
            Ok(Box::new(self.backend.register_handle()))
        }

        fn closed(&self) -> watch::Receiver<Option<Disconnect>> {
            self.closed.clone()
        }

        async fn dispose(&self) {}
    }

    pub struct MemoryHandle {
        backend: Arc<MemoryBackend>,
        id: u64,
        events: AsyncMutex<mpsc::UnboundedReceiver<LinkEvent>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Handle for MemoryHandle {
        async fn join(&self, request: JoinRequest) -> Result<JoinReply> {
            Ok(self.backend.note_join(self.id, &request))
        }

        async fn event(&self) -> Option<LinkEvent> {
            self.events.lock().await.recv().await
        }

        async fn send_trickle(&self, _candidate: Option<String>) -> Result<()> {
            Ok(())
        }

        async fn renegotiate(&self) -> Result<()> {
            let delay = self.backend.state.lock().unwrap().renegotiate_delay;
            tokio::time::sleep(delay).await;
            self.backend.renegotiate_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_data(&self, channel: ChannelKind, data: OutboundData) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(RoomError::ConnectionClosed);
            }
            self.backend.state.lock().unwrap().sent.push((channel, data));
            Ok(())
        }

        fn remote_media(&self) -> Vec<MediaTrack> {
            self.backend.state.lock().unwrap().remote_tracks.clone()
        }

        async fn moderate(&self, action: Moderation) -> Result<()> {
            self.backend.state.lock().unwrap().moderations.push(action);
            Ok(())
        }

        async fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.backend.close_count.fetch_add(1, Ordering::SeqCst);
                self.backend.unregister_handle(self.id);
            }
        }
    }
}
