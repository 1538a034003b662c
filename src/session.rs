use crate::error::{Result, RoomError};
use crate::protocol::RoomEvent;
use crate::transport::{Connector, Disconnect, Handle, Session};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub initial_delay_max: Duration,
    pub reconnect_increment: Duration,
    pub max_reconnect_delay: Option<Duration>,
    pub max_reconnect_attempts: u32,
    pub delayed_reconnect: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_delay_max: Duration::from_secs(1),
            reconnect_increment: Duration::from_secs(1),
            max_reconnect_delay: Some(Duration::from_secs(30)),
            max_reconnect_attempts: 10,
            delayed_reconnect: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reconnect_increment(mut self, increment: Duration) -> Self {
        self.reconnect_increment = increment;
        self
    }

    pub fn with_max_reconnect_delay(mut self, cap: Option<Duration>) -> Self {
        self.max_reconnect_delay = cap;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_delayed_reconnect(mut self, delay: Duration) -> Self {
        self.delayed_reconnect = delay;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Active,
}

#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<ConnShared>,
}

struct ConnShared {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    initial_delay: Duration,
    state: watch::Sender<SessionState>,
    epoch: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    session: RwLock<Option<Arc<dyn Session>>>,
    backoff: Mutex<Backoff>,
    delayed_generation: AtomicU64,
    events: mpsc::UnboundedSender<RoomEvent>,
}

struct Backoff {
    delay: Duration,
    attempts: u32,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Self {
        // randomized so a server-wide outage does not produce a thundering
        // herd of simultaneous reconnects
        let initial_delay = config.initial_delay_max.mul_f64(rand::thread_rng().gen::<f64>());
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (epoch, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(ConnShared {
                connector,
                config,
                initial_delay,
                state,
                epoch,
                shutdown,
                session: RwLock::new(None),
                backoff: Mutex::new(Backoff { delay: initial_delay, attempts: 0 }),
                delayed_generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Resolves once the session is active. Network-level open failures are
    /// retried with backoff; a session-create protocol failure propagates.
    pub async fn connect(&self) -> Result<()> {
        self.shared.shutdown.send_replace(false);
        match try_connect(&self.shared).await {
            Ok(()) => Ok(()),
            Err(RoomError::Session(reason)) => {
                self.shared.state.send_replace(SessionState::Disconnected);
                Err(RoomError::Session(reason))
            }
            Err(err) => {
                debug!(error = %err, "connect failed, scheduling reconnect");
                run_reconnect(self.shared.clone(), false).await
            }
        }
    }

    pub async fn disconnect(&self) {
        debug!("disconnecting");
        self.shared.shutdown.send_replace(true);
        self.shared.delayed_generation.fetch_add(1, Ordering::SeqCst);
        teardown_session(&self.shared).await;
        self.shared.state.send_replace(SessionState::Disconnected);
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == SessionState::Disconnected
    }

    /// Resolves immediately if the session is already active, otherwise once
    /// it becomes active. Errors if the manager shut down first.
    pub async fn wait_active(&self) -> Result<()> {
        let mut state = self.shared.state.subscribe();
        let mut shutdown = self.shared.shutdown.subscribe();
        loop {
            if *state.borrow_and_update() == SessionState::Active {
                return Ok(());
            }
            if *shutdown.borrow() {
                return Err(RoomError::ConnectionClosed);
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(RoomError::ConnectionClosed);
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => return Err(RoomError::ConnectionClosed),
            }
        }
    }

    pub async fn attach(&self) -> Result<Box<dyn Handle>> {
        self.wait_active().await?;
        let session = self
            .shared
            .session
            .read()
            .unwrap()
            .clone()
            .ok_or(RoomError::ConnectionClosed)?;
        session.attach().await
    }

    /// Bumped on every successful (re)connection so dependents can rebuild
    /// per-session resources.
    pub fn epoch(&self) -> watch::Receiver<u64> {
        self.shared.epoch.subscribe()
    }

    pub fn current_epoch(&self) -> u64 {
        *self.shared.epoch.borrow()
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    /// Tear the session down and reconnect after a fixed delay. Used for
    /// ICE failures and zombie sessions; rescheduling replaces any pending
    /// delayed reconnect.
    pub fn schedule_delayed_reconnect(&self) {
        let generation = self.shared.delayed_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = self.shared.clone();
        debug!("delayed reconnect scheduled");
        tokio::spawn(async move {
            if !sleep_unless_shutdown(&shared, shared.config.delayed_reconnect).await {
                return;
            }
            if shared.delayed_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            teardown_session(&shared).await;
            shared.state.send_replace(SessionState::Disconnected);
            match try_connect(&shared).await {
                Ok(()) => {
                    reset_backoff(&shared);
                    let _ = shared.events.send(RoomEvent::Reconnected);
                }
                Err(_) => {
                    let _ = run_reconnect(shared, true).await;
                }
            }
        });
    }
}

async fn try_connect(shared: &Arc<ConnShared>) -> Result<()> {
    shared.state.send_replace(SessionState::Connecting);
    let session: Arc<dyn Session> = Arc::from(shared.connector.open().await?);
    session.create().await?;
    let closed = session.closed();
    *shared.session.write().unwrap() = Some(session);
    shared.state.send_replace(SessionState::Active);
    let mut epoch = 0;
    shared.epoch.send_modify(|value| {
        *value += 1;
        epoch = *value;
    });
    spawn_close_watcher(shared.clone(), closed, epoch);
    debug!(epoch, "session active");
    Ok(())
}

fn spawn_close_watcher(
    shared: Arc<ConnShared>,
    mut closed: watch::Receiver<Option<Disconnect>>,
    epoch: u64,
) {
    tokio::spawn(async move {
        let disconnect = loop {
            if let Some(disconnect) = *closed.borrow_and_update() {
                break disconnect;
            }
            if closed.changed().await.is_err() {
                return;
            }
        };
        if *shared.shutdown.borrow() {
            return;
        }
        // a newer session has already replaced this one
        if *shared.epoch.borrow() != epoch {
            return;
        }
        shared.state.send_replace(SessionState::Disconnected);
        if disconnect.normal {
            // intentional closure, no reconnect
            shared.shutdown.send_replace(true);
            return;
        }
        warn!("session closed abnormally, reconnecting");
        let _ = run_reconnect(shared, true).await;
    });
}

async fn run_reconnect(shared: Arc<ConnShared>, was_active: bool) -> Result<()> {
    loop {
        let delay = shared.backoff.lock().unwrap().delay;
        let _ = shared.events.send(RoomEvent::Reconnecting { delay });
        if !sleep_unless_shutdown(&shared, delay).await {
            return Err(RoomError::ConnectionClosed);
        }
        teardown_session(&shared).await;
        match try_connect(&shared).await {
            Ok(()) => {
                reset_backoff(&shared);
                if was_active {
                    let _ = shared.events.send(RoomEvent::Reconnected);
                }
                return Ok(());
            }
            Err(err) => {
                let attempts = bump_backoff(&shared);
                if attempts > shared.config.max_reconnect_attempts {
                    warn!(error = %err, attempts, "reconnection attempts exhausted");
                    shared.state.send_replace(SessionState::Disconnected);
                    shared.shutdown.send_replace(true);
                    let _ = shared.events.send(RoomEvent::ReconnectionError(
                        RoomError::ReconnectExhausted.to_string(),
                    ));
                    return Err(RoomError::ReconnectExhausted);
                }
                warn!(error = %err, attempts, "error during reconnect, retrying");
            }
        }
    }
}

async fn sleep_unless_shutdown(shared: &Arc<ConnShared>, delay: Duration) -> bool {
    let mut shutdown = shared.shutdown.subscribe();
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.wait_for(|stop| *stop) => false,
    }
}

async fn teardown_session(shared: &Arc<ConnShared>) {
    let session = shared.session.write().unwrap().take();
    if let Some(session) = session {
        session.dispose().await;
    }
}

fn bump_backoff(shared: &Arc<ConnShared>) -> u32 {
    let mut backoff = shared.backoff.lock().unwrap();
    backoff.delay += shared.config.reconnect_increment;
    if let Some(cap) = shared.config.max_reconnect_delay {
        backoff.delay = backoff.delay.min(cap);
    }
    backoff.attempts += 1;
    backoff.attempts
}

fn reset_backoff(shared: &Arc<ConnShared>) {
    let mut backoff = shared.backoff.lock().unwrap();
    backoff.delay = shared.initial_delay;
    backoff.attempts = 0;
}
