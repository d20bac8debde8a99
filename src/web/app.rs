use super::handlers::{
    add_user_to_backup, backup_protection_audit, create_backup, create_user, deletion_audit,
    destroy_keys, get_user, issue_key, list_all_active_holds, list_backups,
    list_backups_for_user, list_holds_for_user, list_keys, list_users, ping, place_hold,
    release_hold, restore_users, truncate_users,
};
use crate::Client;
use axum::Router;
use axum::http::Method;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub client: Client,
}

impl AppState {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/ping", get(ping))
        .route("/api/users", post(create_user).get(list_users))
        .route("/api/users/:id", get(get_user))
        .route("/api/users/:id/keys", get(list_keys).post(issue_key))
        .route("/api/users/:id/destroy-keys", post(destroy_keys))
        .route("/api/admin/truncate-users", post(truncate_users))
        .route("/api/admin/restore-users", post(restore_users))
        .route("/api/admin/backups", post(create_backup).get(list_backups))
        .route("/api/admin/backups/:id/users", post(add_user_to_backup))
        .route("/api/admin/users/:id/backups", get(list_backups_for_user))
        .route(
            "/api/admin/users/:id/holds",
            post(place_hold).get(list_holds_for_user),
        )
        .route("/api/admin/holds", get(list_all_active_holds))
        .route("/api/admin/holds/:id/release", post(release_hold))
        .route("/api/admin/audit/deletion", get(deletion_audit))
        .route(
            "/api/admin/audit/backup-protection",
            get(backup_protection_audit),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
