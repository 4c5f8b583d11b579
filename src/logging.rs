use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::id_types::RoomId;

/// Initialize the tracing subscriber with JSON formatter for production
pub fn init(rust_log: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(rust_log));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Span carrying the room id, so every event logged inside it is tagged with
/// the room. A random session id tells apart two runs against the same room.
pub fn room_span(room_id: &RoomId) -> Span {
    tracing::info_span!(
        "room",
        room_id = %room_id,
        session_id = %uuid::Uuid::new_v4()
    )
}
