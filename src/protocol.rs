use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type ClientId = String;
pub type NetworkId = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "um")]
    UpdateMulti,
    #[serde(rename = "r")]
    Remove,
    #[serde(untagged)]
    Other(String),
}

impl DataKind {
    pub fn is_entity(&self) -> bool {
        matches!(self, DataKind::Update | DataKind::UpdateMulti | DataKind::Remove)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub network_id: NetworkId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ClientId>,
    #[serde(default)]
    pub last_owner_time: i64,
    #[serde(default)]
    pub is_first_sync: bool,
    #[serde(default)]
    pub components: AHashMap<String, serde_json::Value>,
}

impl EntityState {
    pub fn new(network_id: impl Into<NetworkId>) -> Self {
        Self {
            network_id: network_id.into(),
            owner: None,
            last_owner_time: 0,
            is_first_sync: false,
            components: AHashMap::new(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<ClientId>, last_owner_time: i64) -> Self {
        self.owner = Some(owner.into());
        self.last_owner_time = last_owner_time;
        self
    }

    pub fn with_first_sync(mut self, first_sync: bool) -> Self {
        self.is_first_sync = first_sync;
        self
    }

    pub fn with_component(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.components.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpdateData {
    Multi { d: Vec<EntityState> },
    Entity(EntityState),
    Raw(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    #[default]
    Reliable,
    Unreliable,
    Signaling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    pub data_type: DataKind,
    pub data: UpdateData,
    #[serde(default)]
    pub from_relay: bool,
    #[serde(skip)]
    pub source: MessageSource,
}

impl DataMessage {
    pub fn update(state: EntityState) -> Self {
        Self {
            data_type: DataKind::Update,
            data: UpdateData::Entity(state),
            from_relay: false,
            source: MessageSource::default(),
        }
    }

    pub fn update_multi(states: Vec<EntityState>) -> Self {
        Self {
            data_type: DataKind::UpdateMulti,
            data: UpdateData::Multi { d: states },
            from_relay: false,
            source: MessageSource::default(),
        }
    }

    pub fn remove(state: EntityState) -> Self {
        Self {
            data_type: DataKind::Remove,
            data: UpdateData::Entity(state),
            from_relay: false,
            source: MessageSource::default(),
        }
    }

    pub fn other(data_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            data_type: DataKind::Other(data_type.into()),
            data: UpdateData::Raw(data),
            from_relay: false,
            source: MessageSource::default(),
        }
    }

    pub fn with_source(mut self, source: MessageSource) -> Self {
        self.source = source;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeSpec {
    Publisher { notifications: bool, data: bool },
    Media { target: ClientId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room: String,
    pub client_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub subscribe: SubscribeSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReply {
    pub success: bool,
    #[serde(default)]
    pub initial_occupants: Vec<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RoomIdentity {
    pub room: String,
    pub client_id: ClientId,
    pub join_token: Option<String>,
}

impl RoomIdentity {
    pub fn new(room: impl Into<String>, client_id: impl Into<ClientId>) -> Self {
        Self {
            room: room.into(),
            client_id: client_id.into(),
            join_token: None,
        }
    }

    pub fn with_join_token(mut self, token: impl Into<String>) -> Self {
        self.join_token = Some(token.into());
        self
    }

    pub fn join_request(&self, subscribe: SubscribeSpec) -> JoinRequest {
        JoinRequest {
            room: self.room.clone(),
            client_id: self.client_id.clone(),
            token: self.join_token.clone(),
            subscribe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub kind: MediaKind,
    pub id: String,
}

impl MediaTrack {
    pub fn audio(id: impl Into<String>) -> Self {
        Self { kind: MediaKind::Audio, id: id.into() }
    }

    pub fn video(id: impl Into<String>) -> Self {
        Self { kind: MediaKind::Video, id: id.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStream {
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Moderation {
    Kick { whom: ClientId, token: String },
    Block { whom: ClientId },
    Unblock { whom: ClientId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ClientId>,
    pub data_type: DataKind,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    Connected { client_id: ClientId },
    OccupantConnected(ClientId),
    OccupantDisconnected(ClientId),
    OccupantsChanged(Vec<ClientId>),
    Message(DataMessage),
    Reconnecting { delay: Duration },
    Reconnected,
    ReconnectionError(String),
    Blocked { by: ClientId },
    Unblocked { by: ClientId },
    Kicked { client_id: ClientId },
}
