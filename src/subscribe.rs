use crate::protocol::{ClientId, MediaTrack, RoomIdentity, SubscribeSpec};
use crate::session::ConnectionManager;
use crate::sync::Roster;
use crate::transport::{Handle, LinkEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SubscribeConfig {
    pub link_timeout: Duration,
    pub max_retries: u32,
    pub availability_poll: Duration,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            link_timeout: Duration::from_secs(15),
            max_retries: 5,
            availability_poll: Duration::from_secs(1),
        }
    }
}

impl SubscribeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_link_timeout(mut self, timeout: Duration) -> Self {
        self.link_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

pub enum SubscribeOutcome {
    Ready {
        handle: Arc<dyn Handle>,
        media: Vec<MediaTrack>,
        renegotiator: Renegotiator,
    },
    Cancelled,
    Failed,
}

enum Attempt {
    Ready {
        handle: Arc<dyn Handle>,
        media: Vec<MediaTrack>,
        renegotiator: Renegotiator,
    },
    Cancelled,
    Retry,
    Fatal,
}

enum Race {
    Ready,
    Left,
    TimedOut,
    Lost,
}

/// Drive one occupant's link from request to ready. A timeout restarts the
/// whole machine up to the retry budget; cancellation (the occupant left)
/// never retries.
pub async fn subscribe_occupant(
    manager: &ConnectionManager,
    roster: &Mutex<Roster>,
    identity: &RoomIdentity,
    target: &ClientId,
    config: &SubscribeConfig,
) -> SubscribeOutcome {
    let mut retries = config.max_retries;
    loop {
        match attempt(manager, roster, identity, target, config).await {
            Attempt::Ready { handle, media, renegotiator } => {
                return SubscribeOutcome::Ready { handle, media, renegotiator };
            }
            Attempt::Cancelled => return SubscribeOutcome::Cancelled,
            Attempt::Fatal => return SubscribeOutcome::Failed,
            Attempt::Retry => {
                if retries == 0 {
                    warn!(occupant = %target, "no link established");
                    return SubscribeOutcome::Failed;
                }
                retries -= 1;
                debug!(occupant = %target, retries, "link negotiation failed, retrying");
            }
        }
    }
}

async fn attempt(
    manager: &ConnectionManager,
    roster: &Mutex<Roster>,
    identity: &RoomIdentity,
    target: &ClientId,
    config: &SubscribeConfig,
) -> Attempt {
    let available = || roster.lock().unwrap().is_available(target);

    if !available() {
        debug!(occupant = %target, "cancelled occupant connection, occupant left before subscription negotiation");
        return Attempt::Cancelled;
    }

    if manager.wait_active().await.is_err() {
        return Attempt::Fatal;
    }

    let handle: Arc<dyn Handle> = match manager.attach().await {
        Ok(handle) => Arc::from(handle),
        Err(err) => {
            warn!(occupant = %target, error = %err, "transport attach failed");
            return Attempt::Retry;
        }
    };
    let renegotiator = Renegotiator::new(handle.clone());

    if !available() {
        debug!(occupant = %target, "cancelled occupant connection, occupant left after attach");
        handle.close().await;
        return Attempt::Cancelled;
    }

    let request = identity.join_request(SubscribeSpec::Media { target: target.clone() });
    let reply = match handle.join(request).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!(occupant = %target, error = %err, "join failed");
            handle.close().await;
            return Attempt::Retry;
        }
    };
    if !reply.success {
        warn!(occupant = %target, error = reply.error.as_deref().unwrap_or("rejected"), "join rejected");
        handle.close().await;
        return Attempt::Fatal;
    }

    if !available() {
        debug!(occupant = %target, "cancelled occupant connection, occupant left after join");
        handle.close().await;
        return Attempt::Cancelled;
    }

    // three-way race: link ready vs. occupant departure vs. deadline
    debug!(occupant = %target, "waiting for link");
    let deadline = tokio::time::sleep(config.link_timeout);
    tokio::pin!(deadline);
    let mut poll = tokio::time::interval(config.availability_poll);
    let raced = loop {
        tokio::select! {
            event = handle.event() => match event {
                Some(LinkEvent::LinkReady) => break Race::Ready,
                Some(LinkEvent::IceCandidate(candidate)) => {
                    if let Err(err) = handle.send_trickle(candidate).await {
                        warn!(occupant = %target, error = %err, "error trickling ICE");
                    }
                }
                Some(LinkEvent::RenegotiationNeeded) => renegotiator.trigger(),
                Some(LinkEvent::IceFailure) => {
                    warn!(occupant = %target, "ICE failure detected during negotiation");
                    manager.schedule_delayed_reconnect();
                }
                Some(_) => {}
                None => break Race::Lost,
            },
            _ = poll.tick() => {
                if !available() {
                    break Race::Left;
                }
            }
            _ = &mut deadline => break Race::TimedOut,
        }
    };

    match raced {
        Race::Ready => {
            if !available() {
                debug!(occupant = %target, "cancelled occupant connection, occupant left during negotiation");
                handle.close().await;
                return Attempt::Cancelled;
            }
            // an empty capture is valid, the occupant just has no media
            let media = handle.remote_media();
            debug!(occupant = %target, tracks = media.len(), "subscriber ready");
            Attempt::Ready { handle, media, renegotiator }
        }
        Race::Left => {
            debug!(occupant = %target, "cancelled occupant connection, occupant left while waiting for link");
            handle.close().await;
            Attempt::Cancelled
        }
        Race::TimedOut => {
            handle.close().await;
            Attempt::Retry
        }
        Race::Lost => {
            handle.close().await;
            Attempt::Retry
        }
    }
}

/// Serializes renegotiation on one link. A new offer must not be issued
/// while a previous one is outstanding; triggers during a cycle coalesce
/// into a single follow-up cycle.
#[derive(Clone)]
pub struct Renegotiator {
    inner: Arc<RenegotiatorInner>,
}

struct RenegotiatorInner {
    handle: Arc<dyn Handle>,
    state: Mutex<RenegotiateState>,
}

#[derive(Default)]
struct RenegotiateState {
    in_flight: bool,
    pending: bool,
}

impl Renegotiator {
    pub fn new(handle: Arc<dyn Handle>) -> Self {
        Self {
            inner: Arc::new(RenegotiatorInner {
                handle,
                state: Mutex::new(RenegotiateState::default()),
            }),
        }
    }

    pub fn trigger(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.in_flight {
                state.pending = true;
                return;
            }
            state.in_flight = true;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = inner.handle.renegotiate().await {
                    warn!(error = %err, "error negotiating offer");
                }
                let again = {
                    let mut state = inner.state.lock().unwrap();
                    if state.pending {
                        state.pending = false;
                        true
                    } else {
                        state.in_flight = false;
                        false
                    }
                };
                if !again {
                    break;
                }
            }
        });
    }
}
