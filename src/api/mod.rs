mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Config;
use crate::db::Database;
use crate::dispatch::NotificationDispatcher;
use crate::jobs::UrgentTaskJob;
use crate::notifier::StatusNotifier;
use crate::urgency::Thresholds;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub notifier: Arc<StatusNotifier>,
    pub job: Arc<UrgentTaskJob>,
    pub thresholds: Thresholds,
}

impl AppState {
    pub fn new(db: Database, dispatcher: Arc<dyn NotificationDispatcher>, config: &Config) -> Self {
        let notifier = StatusNotifier::new(
            db.clone(),
            dispatcher.clone(),
            config.status_routes.clone(),
            config.io_timeout,
        )
        .with_zone(config.zone);
        let job = UrgentTaskJob::new(db.clone(), dispatcher, config);
        Self {
            db,
            notifier: Arc::new(notifier),
            job: Arc::new(job),
            thresholds: config.thresholds,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Matters
        .route("/matters", get(handlers::list_matters).post(handlers::create_matter))
        .route("/matters/{id}", get(handlers::get_matter).delete(handlers::delete_matter))
        .route("/matters/{id}/status", put(handlers::change_matter_status))
        .route("/matters/{id}/history", get(handlers::get_status_history))
        .route(
            "/matters/{id}/tasks",
            get(handlers::list_matter_tasks).post(handlers::create_task),
        )
        // Tasks
        .route("/tasks/{id}", get(handlers::get_task).put(handlers::reschedule_task))
        .route("/tasks/{id}/complete", post(handlers::complete_task))
        .route("/tasks/{id}/notifications", get(handlers::get_task_notifications))
        // Jobs
        .route("/runs", get(handlers::list_runs))
        .route("/jobs/urgent-notifications/run", post(handlers::run_urgent_job))
        // Health
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
