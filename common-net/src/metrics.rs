use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use once_cell::sync::OnceCell;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use tracing::error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Metric set for the connection gateway.
pub struct GatewayMetrics {
    pub connections_open: IntGauge,
    pub players_online: IntGauge,
    pub auth_total: IntCounter,
    pub duplicate_evictions_total: IntCounter,
    pub commands_total: IntCounterVec,
    pub rejected_total: IntCounterVec,
}

impl GatewayMetrics {
    pub fn on_startup(&self) {
        self.connections_open.set(0);
        self.players_online.set(0);
        self.auth_total.inc_by(0);
        self.duplicate_evictions_total.inc_by(0);
    }

    pub fn inc_command(&self, kind: &str) {
        self.commands_total.with_label_values(&[kind]).inc();
    }

    pub fn inc_rejected(&self, reason: &str) {
        self.rejected_total.with_label_values(&[reason]).inc();
    }
}

/// Metric set for the broker bridge.
pub struct BrokerMetrics {
    pub published_total: IntCounter,
    pub publish_failures_total: IntCounter,
    pub received_total: IntCounter,
    pub echo_suppressed_total: IntCounter,
    pub subscribed_channels: IntGauge,
    pub subscriber_disconnects_total: IntCounter,
}

/// Metric set for the state replication service.
pub struct ReplicationMetrics {
    pub leaderboard_cache_hits_total: IntCounter,
    pub leaderboard_cache_misses_total: IntCounter,
    pub leaderboard_recompute_seconds: Histogram,
    pub stale_sessions_closed_total: IntCounter,
    pub sync_log_failures_total: IntCounter,
}

static GATEWAY_METRICS: OnceCell<GatewayMetrics> = OnceCell::new();
static BROKER_METRICS: OnceCell<BrokerMetrics> = OnceCell::new();
static REPLICATION_METRICS: OnceCell<ReplicationMetrics> = OnceCell::new();

pub fn gateway_metrics() -> &'static GatewayMetrics {
    GATEWAY_METRICS.get_or_init(|| GatewayMetrics {
        connections_open: register_int_gauge!(
            "gateway_connections_open",
            "Open client sockets, authenticated or not"
        )
        .expect("register gateway_connections_open"),
        players_online: register_int_gauge!(
            "gateway_players_online",
            "Authenticated players on this node"
        )
        .expect("register gateway_players_online"),
        auth_total: register_int_counter!(
            "gateway_auth_total",
            "Successful authentications"
        )
        .expect("register gateway_auth_total"),
        duplicate_evictions_total: register_int_counter!(
            "gateway_duplicate_evictions_total",
            "Connections closed because the same player authenticated again"
        )
        .expect("register gateway_duplicate_evictions_total"),
        commands_total: register_int_counter_vec!(
            "gateway_commands_total",
            "Client commands routed, by kind",
            &["kind"]
        )
        .expect("register gateway_commands_total"),
        rejected_total: register_int_counter_vec!(
            "gateway_rejected_total",
            "Client frames rejected, by reason",
            &["reason"]
        )
        .expect("register gateway_rejected_total"),
    })
}

pub fn broker_metrics() -> &'static BrokerMetrics {
    BROKER_METRICS.get_or_init(|| BrokerMetrics {
        published_total: register_int_counter!(
            "broker_published_total",
            "Envelopes published to the broker"
        )
        .expect("register broker_published_total"),
        publish_failures_total: register_int_counter!(
            "broker_publish_failures_total",
            "Broker publishes that failed"
        )
        .expect("register broker_publish_failures_total"),
        received_total: register_int_counter!(
            "broker_received_total",
            "Envelopes received from peer nodes and dispatched"
        )
        .expect("register broker_received_total"),
        echo_suppressed_total: register_int_counter!(
            "broker_echo_suppressed_total",
            "Inbound envelopes dropped because this node published them"
        )
        .expect("register broker_echo_suppressed_total"),
        subscribed_channels: register_int_gauge!(
            "broker_subscribed_channels",
            "Channels currently subscribed on this node"
        )
        .expect("register broker_subscribed_channels"),
        subscriber_disconnects_total: register_int_counter!(
            "broker_subscriber_disconnects_total",
            "Times the subscriber connection dropped and had to be re-established"
        )
        .expect("register broker_subscriber_disconnects_total"),
    })
}

pub fn replication_metrics() -> &'static ReplicationMetrics {
    REPLICATION_METRICS.get_or_init(|| ReplicationMetrics {
        leaderboard_cache_hits_total: register_int_counter!(
            "replication_leaderboard_cache_hits_total",
            "Leaderboard reads served from cache"
        )
        .expect("register replication_leaderboard_cache_hits_total"),
        leaderboard_cache_misses_total: register_int_counter!(
            "replication_leaderboard_cache_misses_total",
            "Leaderboard reads that recomputed from stored rows"
        )
        .expect("register replication_leaderboard_cache_misses_total"),
        leaderboard_recompute_seconds: register_histogram!(
            "replication_leaderboard_recompute_seconds",
            "Time spent recomputing a leaderboard snapshot",
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0]
        )
        .expect("register replication_leaderboard_recompute_seconds"),
        stale_sessions_closed_total: register_int_counter!(
            "replication_stale_sessions_closed_total",
            "Online sessions closed by stale-session cleanup"
        )
        .expect("register replication_stale_sessions_closed_total"),
        sync_log_failures_total: register_int_counter!(
            "replication_sync_log_failures_total",
            "Sync-event audit writes that failed"
        )
        .expect("register replication_sync_log_failures_total"),
    })
}

/// Renders the default registry in prometheus text format.
pub fn render() -> Result<String, BoxError> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub async fn metrics_handler() -> Response {
    match render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(%err, "metrics: encode failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_sets() {
        gateway_metrics().on_startup();
        broker_metrics().echo_suppressed_total.inc_by(0);
        broker_metrics().subscriber_disconnects_total.inc_by(0);
        replication_metrics().stale_sessions_closed_total.inc_by(0);

        let text = render().expect("render");
        assert!(text.contains("gateway_connections_open"));
        assert!(text.contains("broker_echo_suppressed_total"));
        assert!(text.contains("broker_subscriber_disconnects_total"));
        assert!(text.contains("replication_stale_sessions_closed_total"));
    }
}
