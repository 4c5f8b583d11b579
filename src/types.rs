use crate::id_types::PeerId;
use crate::peer_manager::Peer;
use crate::room::{RoomEvent, RoomState};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Thread-safe map of registered peers
pub type PeerMap = Arc<DashMap<PeerId, Peer>>;

/// Announces every peer id inserted into the registry
pub type ArrivalSender = broadcast::Sender<PeerId>;

/// Orchestration events fanned out to observers
pub type EventSender = broadcast::Sender<RoomEvent>;

pub type StateSender = watch::Sender<RoomState>;
