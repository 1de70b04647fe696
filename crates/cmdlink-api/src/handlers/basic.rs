//! Basic handlers - health and liveness.

use axum::{Json, extract::State};
use serde::Serialize;
use serde_json::json;

use cmdlink_commands::CycleReport;
use cmdlink_transport::{ConnectionState, Transport};

use super::{ConsumerState, ServerState};

#[derive(Debug, Clone, Serialize)]
pub struct MqttHealth {
    pub state: ConnectionState,
    pub connected: bool,
}

impl MqttHealth {
    fn from_transport(transport: &dyn Transport) -> Self {
        let state = transport.connection_state();
        Self {
            state,
            connected: state.is_connected(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PollingHealth {
    pub enabled: bool,
    pub running: bool,
    pub cycle_in_progress: bool,
    pub last_cycle: Option<CycleReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupHealth {
    pub entries: usize,
    pub cooldown_secs: u64,
}

/// Health report. `status` is `degraded` while the broker is not connected.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub mqtt: MqttHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling: Option<PollingHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup: Option<DedupHealth>,
    pub uptime_secs: u64,
    pub version: &'static str,
}

fn overall(mqtt: &MqttHealth) -> &'static str {
    if mqtt.connected { "ok" } else { "degraded" }
}

/// Trigger process health.
pub async fn health_handler(State(state): State<ServerState>) -> Json<HealthStatus> {
    let mqtt = MqttHealth::from_transport(state.transport().as_ref());
    let polling = match &state.reconciler {
        Some(reconciler) => PollingHealth {
            enabled: true,
            running: reconciler.is_running(),
            cycle_in_progress: reconciler.cycle_in_progress(),
            last_cycle: reconciler.last_cycle(),
        },
        None => PollingHealth {
            enabled: false,
            running: false,
            cycle_in_progress: false,
            last_cycle: None,
        },
    };

    Json(HealthStatus {
        status: overall(&mqtt),
        mqtt,
        polling: Some(polling),
        dedup: Some(DedupHealth {
            entries: state.dedup.len(),
            cooldown_secs: state.dedup.cooldown().as_secs(),
        }),
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Status consumer health.
pub async fn consumer_health_handler(State(state): State<ConsumerState>) -> Json<HealthStatus> {
    let mqtt = MqttHealth::from_transport(state.transport.as_ref());
    Json(HealthStatus {
        status: overall(&mqtt),
        mqtt,
        polling: None,
        dedup: None,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Liveness probe.
pub async fn liveness_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "alive",
    }))
}
