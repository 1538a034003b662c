pub mod client;
pub mod error;
pub mod freeze;
pub mod protocol;
pub mod session;
pub mod subscribe;
pub mod sync;
pub mod transport;

pub use protocol::{
    ClientId, NetworkId,
    DataKind, DataMessage, EntityState, MessageSource, UpdateData,
    JoinReply, JoinRequest, RoomIdentity, SubscribeSpec,
    MediaKind, MediaStream, MediaTrack,
    Moderation, OutboundData, RoomEvent,
};

pub use transport::{
    ChannelKind, Connector, Disconnect, Handle, LinkEvent, Session,
};

pub use session::{
    ConnectionManager, SessionConfig, SessionState,
};

pub use subscribe::{
    Renegotiator, SubscribeConfig, SubscribeOutcome,
};

pub use sync::{
    OccupantMedia, Roster, SyncConfig, Synchronizer,
};

pub use freeze::{
    FrozenUpdates, PendingUpdate,
};

pub use client::{
    RoomClient, RoomConfig,
};

pub use error::{
    Result, RoomError,
};
