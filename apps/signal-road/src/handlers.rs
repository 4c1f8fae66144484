use axum::{extract::State, http::header, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use signal_core::{RelayRouter, SessionSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub router: RelayRouter,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(router: RelayRouter, metrics: Option<PrometheusHandle>) -> Self {
        Self { router, metrics }
    }

    fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }

    fn stats(&self) -> StatsResponse {
        let sessions: Vec<SessionStatsEntry> = self
            .router
            .registry()
            .snapshot()
            .into_iter()
            .map(SessionStatsEntry::from)
            .collect();
        StatsResponse {
            active_sessions: sessions.len(),
            active_peers: sessions.iter().map(|entry| entry.peers.len()).sum(),
            sessions,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_sessions: usize,
    pub active_peers: usize,
    pub sessions: Vec<SessionStatsEntry>,
}

#[derive(Debug, Serialize)]
pub struct SessionStatsEntry {
    pub session_id: String,
    pub peers: Vec<PeerStatsEntry>,
    pub negotiations: usize,
    pub idle_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct PeerStatsEntry {
    pub peer_id: String,
    pub role: &'static str,
    pub joined_at: DateTime<Utc>,
}

impl From<SessionSnapshot> for SessionStatsEntry {
    fn from(snapshot: SessionSnapshot) -> Self {
        SessionStatsEntry {
            session_id: snapshot.session_id,
            peers: snapshot
                .members
                .into_iter()
                .map(|member| PeerStatsEntry {
                    peer_id: member.peer_id,
                    role: member.role.as_str(),
                    joined_at: member.joined_at,
                })
                .collect(),
            negotiations: snapshot.negotiations,
            idle_ms: snapshot.idle_millis,
        }
    }
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats())
}

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}
