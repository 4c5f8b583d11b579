pub mod agent;
pub mod config;
pub mod device_manager;
pub mod error;
pub mod frame;
pub mod id_types;
pub mod logging;
pub mod media;
pub mod media_setup;
pub mod metrics;
pub mod peer_manager;
pub mod peer_session;
pub mod policy;
pub mod protocol;
pub mod room;
pub mod rpc;
pub mod transport;
pub mod types;

pub use device_manager::DeviceManager;
pub use error::{MediaError, RoomError, RpcError, SessionError, TransportError};
pub use id_types::{DeviceId, PeerId, RoomId};
pub use media_setup::MediaSetup;
pub use peer_manager::{Peer, PeerRegistry};
pub use peer_session::PeerSession;
pub use policy::{AcceptAll, AgentRoomPolicy, PeerPolicy};
pub use room::{Room, RoomEvent, RoomOptions, RoomState};
pub use rpc::RpcPeer;
pub use types::PeerMap;
