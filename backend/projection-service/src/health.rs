//! Liveness, readiness and metrics endpoints

use std::sync::Arc;
use std::time::Duration;

use actix_web::{dev::Server, web, App, HttpResponse, HttpServer};
use serde_json::json;
use tokio::sync::watch;

use crate::consumer::LaneState;
use crate::metrics::serve_metrics;
use crate::services::IndexStore;

/// Upper bound on the index ping behind `/health/ready`
pub const INDEX_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct HealthState {
    lanes: Vec<watch::Receiver<LaneState>>,
    index: Arc<dyn IndexStore>,
    index_timeout: Duration,
}

impl HealthState {
    pub fn new(lanes: Vec<watch::Receiver<LaneState>>, index: Arc<dyn IndexStore>) -> Self {
        Self {
            lanes,
            index,
            index_timeout: INDEX_CHECK_TIMEOUT,
        }
    }

    pub fn with_index_timeout(mut self, index_timeout: Duration) -> Self {
        self.index_timeout = index_timeout;
        self
    }

    /// A ping that outlives the timeout counts as unavailable
    pub async fn index_available(&self) -> bool {
        match resilience::with_timeout(self.index_timeout, self.index.health_check()).await {
            Ok(result) => result.is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Index health check timed out");
                false
            }
        }
    }

    pub fn lane_states(&self) -> Vec<LaneState> {
        self.lanes.iter().map(|rx| rx.borrow().clone()).collect()
    }

    /// Every lane is pulling events
    pub fn lanes_running(&self) -> bool {
        !self.lanes.is_empty()
            && self
                .lanes
                .iter()
                .all(|rx| *rx.borrow() == LaneState::Running)
    }
}

async fn liveness() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

async fn readiness(state: web::Data<HealthState>) -> HttpResponse {
    let lanes: Vec<_> = state
        .lane_states()
        .iter()
        .enumerate()
        .map(|(lane, s)| json!({ "lane": lane, "state": s.as_str() }))
        .collect();

    let index_ok = state.index_available().await;
    let ready = index_ok && state.lanes_running();

    let body = json!({
        "status": if ready { "ready" } else { "not_ready" },
        "index": if index_ok { "ok" } else { "unavailable" },
        "lanes": lanes,
    });

    if ready {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health/live", web::get().to(liveness))
        .route("/health/ready", web::get().to(readiness))
        .route("/metrics", web::get().to(serve_metrics));
}

/// Bind the health server; the caller drives the returned future
pub fn build_server(state: HealthState, addr: &str) -> std::io::Result<Server> {
    let data = web::Data::new(state);
    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
        .workers(1)
        .disable_signals()
        .bind(addr)?
        .run();
    Ok(server)
}
