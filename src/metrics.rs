use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use tracing::{error, info};
use warp::Filter;

lazy_static! {
    pub static ref ROOM_ACTIVE_PEERS: IntGauge = register_int_gauge!(
        "room_active_peers",
        "Number of currently registered peer sessions"
    )
    .unwrap();
    pub static ref ROOM_PEER_CONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        "room_peer_connections_total",
        "Total number of peer sessions that completed an offer/answer exchange"
    )
    .unwrap();
    pub static ref ROOM_RPC_CALLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "room_rpc_calls_total",
        "Total number of outbound RPC calls that expect a response",
        &["method"]
    )
    .unwrap();
    pub static ref ROOM_RPC_TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "room_rpc_timeouts_total",
        "Total number of outbound RPC calls that hit their deadline",
        &["method"]
    )
    .unwrap();
    pub static ref ROOM_RPC_UNMATCHED_RESPONSES_TOTAL: IntCounter = register_int_counter!(
        "room_rpc_unmatched_responses_total",
        "Total number of responses that arrived with no pending call"
    )
    .unwrap();
    pub static ref ROOM_NEGOTIATION_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "room_negotiation_failures_total",
        "Total number of peer negotiations that were discarded",
        &["reason"] // "timeout", "declined", "session", "cancelled", ...
    )
    .unwrap();
    pub static ref ROOM_ICE_CANDIDATES_DROPPED_TOTAL: IntCounter = register_int_counter!(
        "room_ice_candidates_dropped_total",
        "Total number of remote ICE candidates dropped because the peer never registered"
    )
    .unwrap();
}

pub fn register_metrics() {
    // Force initialization of lazy_statics
    let _ = ROOM_ACTIVE_PEERS.get();
    let _ = ROOM_PEER_CONNECTIONS_TOTAL.get();
    let _ = ROOM_RPC_CALLS_TOTAL.with_label_values(&["join"]).get();
    let _ = ROOM_RPC_TIMEOUTS_TOTAL.with_label_values(&["join"]).get();
    let _ = ROOM_RPC_UNMATCHED_RESPONSES_TOTAL.get();
    let _ = ROOM_NEGOTIATION_FAILURES_TOTAL
        .with_label_values(&["timeout"])
        .get();
    let _ = ROOM_ICE_CANDIDATES_DROPPED_TOTAL.get();
}

/// Renders the default registry in the Prometheus text format.
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Serves `GET /metrics` on all interfaces until the process exits.
pub async fn serve(port: u16) {
    let route = warp::path("metrics").and(warp::get()).map(|| {
        warp::reply::with_header(gather_text(), "content-type", "text/plain; version=0.0.4")
    });
    match warp::serve(route).try_bind_ephemeral(([0, 0, 0, 0], port)) {
        Ok((addr, server)) => {
            info!(%addr, "Serving metrics");
            server.await;
        }
        Err(e) => error!(port, error = %e, "Failed to bind metrics server"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        register_metrics();
        let before = ROOM_ICE_CANDIDATES_DROPPED_TOTAL.get();
        ROOM_ICE_CANDIDATES_DROPPED_TOTAL.inc();
        assert!(ROOM_ICE_CANDIDATES_DROPPED_TOTAL.get() > before);
    }

    #[tokio::test]
    async fn test_serve_reports_busy_port_without_panicking() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        tokio::time::timeout(std::time::Duration::from_secs(2), serve(port))
            .await
            .expect("serve should give up on a busy port");
    }

    #[test]
    fn test_gather_text_lists_room_metrics() {
        register_metrics();
        let text = gather_text();
        assert!(text.contains("room_rpc_calls_total"));
        assert!(text.contains("room_active_peers"));
    }
}
