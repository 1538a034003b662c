use crate::protocol::{ClientId, DataKind, DataMessage, EntityState, MessageSource, NetworkId, UpdateData};
use ahash::AHashMap;

#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub kind: DataKind,
    pub state: EntityState,
    pub source: MessageSource,
    pub from_relay: bool,
}

/// Absorbs inbound entity messages while synchronization is suspended and
/// replays only the latest consistent state per entity on resume. At most
/// one entry exists per entity identifier.
#[derive(Debug, Default)]
pub struct FrozenUpdates {
    frozen: bool,
    updates: AHashMap<NetworkId, PendingUpdate>,
}

impl FrozenUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn store(&mut self, message: DataMessage) {
        let DataMessage { data_type, data, from_relay, source } = message;
        match (data_type, data) {
            (DataKind::UpdateMulti, UpdateData::Multi { d }) => {
                // batch framing is not preserved, each entity resolves
                // independently
                for state in d {
                    self.store_single(DataKind::Update, state, source, from_relay);
                }
            }
            (DataKind::Update, UpdateData::Entity(state)) => {
                self.store_single(DataKind::Update, state, source, from_relay);
            }
            (DataKind::Remove, UpdateData::Entity(state)) => {
                self.store_single(DataKind::Remove, state, source, from_relay);
            }
            _ => {}
        }
    }

    fn store_single(
        &mut self,
        kind: DataKind,
        state: EntityState,
        source: MessageSource,
        from_relay: bool,
    ) {
        use std::collections::hash_map::Entry;

        match self.updates.entry(state.network_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(PendingUpdate { kind, state, source, from_relay });
            }
            Entry::Occupied(mut slot) => {
                // ordering on (lastOwnerTime, owner): the greater time wins,
                // the lower owner id wins a tie; both sides resolve this
                // identically without coordination
                let (loses, created_in_window, stored_removed) = {
                    let stored = slot.get();
                    let outdated = state.last_owner_time < stored.state.last_owner_time;
                    let contemporaneous = state.last_owner_time == stored.state.last_owner_time;
                    (
                        outdated || (contemporaneous && state.owner > stored.state.owner),
                        stored.state.is_first_sync,
                        stored.kind == DataKind::Remove,
                    )
                };
                if loses {
                    return;
                }

                if kind == DataKind::Remove {
                    if created_in_window {
                        // created and deleted entirely inside the suspension
                        // window, nothing to replay
                        slot.remove();
                    } else {
                        slot.insert(PendingUpdate { kind, state, source, from_relay });
                    }
                    return;
                }

                // a queued delete outlives later updates for the entity
                if stored_removed {
                    return;
                }

                let stored = slot.get_mut();
                let mut merged = state;
                let mut components = std::mem::take(&mut stored.state.components);
                components.extend(merged.components);
                merged.components = components;
                merged.is_first_sync = stored.state.is_first_sync || merged.is_first_sync;
                *stored = PendingUpdate { kind, state: merged, source, from_relay };
            }
        }
    }

    /// Deliver surviving entries in unspecified order, then clear. Entries
    /// whose owner fails `owner_ok` are dropped; ownerless entries pass.
    pub fn flush<F>(&mut self, owner_ok: F) -> Vec<DataMessage>
    where
        F: Fn(&ClientId) -> bool,
    {
        let drained = std::mem::take(&mut self.updates);
        let mut flushed = Vec::with_capacity(drained.len());
        for (_, update) in drained {
            if let Some(owner) = &update.state.owner {
                if !owner_ok(owner) {
                    continue;
                }
            }
            flushed.push(DataMessage {
                data_type: update.kind,
                data: UpdateData::Entity(update.state),
                from_relay: update.from_relay,
                source: update.source,
            });
        }
        flushed
    }

    /// The buffered state for one entity, subject to the same owner
    /// filtering as `flush`.
    pub fn pending_update<F>(&self, network_id: &str, owner_ok: F) -> Option<EntityState>
    where
        F: Fn(&ClientId) -> bool,
    {
        let update = self.updates.get(network_id)?;
        if let Some(owner) = &update.state.owner {
            if !owner_ok(owner) {
                return None;
            }
        }
        Some(update.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(network_id: &str, owner: &str, time: i64) -> DataMessage {
        DataMessage::update(EntityState::new(network_id).with_owner(owner, time))
    }

    fn flush_all(buffer: &mut FrozenUpdates) -> Vec<DataMessage> {
        buffer.flush(|_| true)
    }

    fn owner_of(message: &DataMessage) -> Option<String> {
        match &message.data {
            UpdateData::Entity(state) => state.owner.clone(),
            _ => None,
        }
    }

    #[test]
    fn test_newer_owner_time_wins() {
        let mut buffer = FrozenUpdates::new();
        buffer.freeze();

        buffer.store(update("net-1", "alice", 3));
        buffer.store(update("net-1", "bob", 7));

        let flushed = flush_all(&mut buffer);
        assert_eq!(flushed.len(), 1);
        assert_eq!(owner_of(&flushed[0]).as_deref(), Some("bob"));
    }

    #[test]
    fn test_tie_break_is_deterministic_regardless_of_order() {
        let mut forward = FrozenUpdates::new();
        forward.freeze();
        forward.store(update("net-1", "b", 5));
        forward.store(update("net-1", "a", 5));

        let mut reverse = FrozenUpdates::new();
        reverse.freeze();
        reverse.store(update("net-1", "a", 5));
        reverse.store(update("net-1", "b", 5));

        for buffer in [&mut forward, &mut reverse] {
            let flushed = flush_all(buffer);
            assert_eq!(flushed.len(), 1);
            assert_eq!(owner_of(&flushed[0]).as_deref(), Some("a"));
        }
    }

    #[test]
    fn test_delete_dominates_queued_update() {
        let mut buffer = FrozenUpdates::new();
        buffer.freeze();

        buffer.store(update("net-1", "alice", 5));
        buffer.store(DataMessage::remove(
            EntityState::new("net-1").with_owner("alice", 5),
        ));

        let flushed = flush_all(&mut buffer);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].data_type, DataKind::Remove);
    }

    #[test]
    fn test_update_after_delete_is_discarded() {
        let mut buffer = FrozenUpdates::new();
        buffer.freeze();

        buffer.store(update("net-1", "alice", 5));
        buffer.store(DataMessage::remove(
            EntityState::new("net-1").with_owner("alice", 6),
        ));
        buffer.store(update("net-1", "alice", 7));

        let flushed = flush_all(&mut buffer);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].data_type, DataKind::Remove);
    }

    #[test]
    fn test_create_then_delete_within_window_replays_nothing() {
        let mut buffer = FrozenUpdates::new();
        buffer.freeze();

        buffer.store(DataMessage::update(
            EntityState::new("net-1")
                .with_owner("alice", 5)
                .with_first_sync(true),
        ));
        buffer.store(DataMessage::remove(
            EntityState::new("net-1").with_owner("alice", 6),
        ));

        assert!(buffer.is_empty());
        assert!(flush_all(&mut buffer).is_empty());
    }

    #[test]
    fn test_multi_message_expands_into_independent_entries() {
        let mut buffer = FrozenUpdates::new();
        buffer.freeze();

        buffer.store(DataMessage::update_multi(vec![
            EntityState::new("net-1").with_owner("alice", 1),
            EntityState::new("net-2").with_owner("bob", 1),
        ]));

        assert_eq!(buffer.len(), 2);
        let flushed = flush_all(&mut buffer);
        assert_eq!(flushed.len(), 2);
        // batch framing is gone, entries come out as plain updates
        assert!(flushed.iter().all(|m| m.data_type == DataKind::Update));
    }

    #[test]
    fn test_component_updates_merge() {
        let mut buffer = FrozenUpdates::new();
        buffer.freeze();

        buffer.store(DataMessage::update(
            EntityState::new("net-1")
                .with_owner("alice", 1)
                .with_component("position", serde_json::json!({"x": 1}))
                .with_component("color", serde_json::json!("red")),
        ));
        buffer.store(DataMessage::update(
            EntityState::new("net-1")
                .with_owner("alice", 2)
                .with_component("position", serde_json::json!({"x": 9})),
        ));

        let flushed = flush_all(&mut buffer);
        assert_eq!(flushed.len(), 1);
        match &flushed[0].data {
            UpdateData::Entity(state) => {
                assert_eq!(state.last_owner_time, 2);
                assert_eq!(state.components["position"], serde_json::json!({"x": 9}));
                assert_eq!(state.components["color"], serde_json::json!("red"));
            }
            other => panic!("expected entity data, got {:?}", other),
        }
    }

    #[test]
    fn test_flush_filters_by_owner() {
        let mut buffer = FrozenUpdates::new();
        buffer.freeze();

        buffer.store(update("net-1", "alice", 1));
        buffer.store(update("net-2", "ghost", 1));
        buffer.store(DataMessage::update(EntityState::new("net-3")));

        let flushed = buffer.flush(|owner| owner == "alice");
        let ids: Vec<&str> = flushed
            .iter()
            .filter_map(|m| match &m.data {
                UpdateData::Entity(state) => Some(state.network_id.as_str()),
                _ => None,
            })
            .collect();
        // net-2's owner fails the filter; ownerless net-3 passes
        assert_eq!(flushed.len(), 2);
        assert!(ids.contains(&"net-1"));
        assert!(ids.contains(&"net-3"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pending_update_accessor_applies_filter() {
        let mut buffer = FrozenUpdates::new();
        buffer.freeze();
        buffer.store(update("net-1", "alice", 1));

        assert!(buffer.pending_update("net-1", |_| true).is_some());
        assert!(buffer.pending_update("net-1", |_| false).is_none());
        assert!(buffer.pending_update("net-2", |_| true).is_none());
    }

    #[test]
    fn test_older_message_is_discarded() {
        let mut buffer = FrozenUpdates::new();
        buffer.freeze();

        buffer.store(update("net-1", "bob", 9));
        buffer.store(update("net-1", "alice", 3));

        let flushed = flush_all(&mut buffer);
        assert_eq!(owner_of(&flushed[0]).as_deref(), Some("bob"));
    }
}
