use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedAdminState;

pub async fn queue_stats(State(state): State<SharedAdminState>) -> Json<Value> {
    let stats: Vec<Value> = state
        .concurrency
        .stats()
        .into_iter()
        .map(|(name, s)| {
            json!({
                "name": name,
                "queueLength": s.queue_length,
                "activeWorkers": s.active_workers,
                "maxWorkers": s.max_workers,
                "totalProcessed": s.total_processed,
                "totalFailed": s.total_failed,
                "avgWaitTimeMs": s.avg_wait_time_ms,
                "avgProcessTimeMs": s.avg_process_time_ms,
            })
        })
        .collect();
    Json(json!({ "queues": stats }))
}

pub async fn clear_queue(State(state): State<SharedAdminState>) -> Json<Value> {
    let cleared = state.concurrency.clear_all_queues();
    Json(json!({ "status": "ok", "cleared": cleared }))
}
