use super::{ApiResponse, AppState, WebError, WebResult};
use crate::compliance::{clamp_limit, DestructionResult, UserBackup};
use crate::core::{
    BackupMembership, BackupRun, DbError, DeletionAudit, KeyId, KeyRecord, LegalHold,
    ProtectionAudit, Timestamp, User, UserId,
};
use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

type Created<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse::ok(data))
}

fn created<T: Serialize>(data: T) -> Created<T> {
    (StatusCode::CREATED, ok(data))
}

type IdPath = Result<Path<i64>, PathRejection>;
type Limit = Result<Query<LimitQuery>, QueryRejection>;

// ============================================================================
// Request and response bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IssueKeyRequest {
    #[serde(default)]
    pub purpose: String,
    pub bucket_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBackupRequest {
    pub backup_type: Option<String>,
    #[serde(default)]
    pub protected_by_hold: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddUserToBackupRequest {
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct PlaceHoldRequest {
    #[serde(default)]
    pub reason: String,
}

/// A key without its material.
#[derive(Debug, Serialize)]
pub struct KeyView {
    pub key_id: KeyId,
    pub user_id: UserId,
    pub purpose: String,
    pub bucket_date: NaiveDate,
    pub destroyed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub live: bool,
}

impl From<KeyRecord> for KeyView {
    fn from(key: KeyRecord) -> Self {
        Self {
            live: key.is_live(),
            key_id: key.key_id,
            user_id: key.user_id,
            purpose: key.purpose,
            bucket_date: key.bucket_date,
            destroyed_at: key.destroyed_at,
            created_at: key.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub limit: usize,
    pub rows: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct UserKeys {
    pub user_id: i64,
    pub keys: Vec<KeyView>,
}

#[derive(Debug, Serialize)]
pub struct UserHolds {
    pub user_id: i64,
    pub active_holds: Vec<LegalHold>,
}

#[derive(Debug, Serialize)]
pub struct ActiveHolds {
    pub active_holds: Vec<LegalHold>,
}

#[derive(Debug, Serialize)]
pub struct UserBackups {
    pub user_id: i64,
    pub backups: Vec<UserBackup>,
}

#[derive(Debug, Serialize)]
pub struct UsersRemoved {
    pub users_removed: u64,
}

#[derive(Debug, Serialize)]
pub struct RowsRestored {
    pub rows_restored: u64,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn ping() -> Json<ApiResponse<&'static str>> {
    ok("pong")
}

pub async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> WebResult<Created<User>> {
    let Json(req) = payload?;
    let user = state
        .client
        .create_user(&req.full_name, &req.email, req.phone.as_deref())
        .await?;
    Ok(created(user))
}

pub async fn list_users(
    State(state): State<AppState>,
    limit: Limit,
) -> WebResult<Json<ApiResponse<Page<User>>>> {
    let Query(query) = limit?;
    let limit = clamp_limit(query.limit);
    let rows = state.client.list_users(Some(limit as i64)).await;
    Ok(ok(Page { limit, rows }))
}

pub async fn get_user(
    State(state): State<AppState>,
    path: IdPath,
) -> WebResult<Json<ApiResponse<User>>> {
    let Path(user_id) = path?;
    Ok(ok(state.client.get_user(user_id).await?))
}

pub async fn list_keys(
    State(state): State<AppState>,
    path: IdPath,
) -> WebResult<Json<ApiResponse<UserKeys>>> {
    let Path(user_id) = path?;
    let keys = state.client.list_keys(user_id).await?;
    Ok(ok(UserKeys {
        user_id,
        keys: keys.into_iter().map(KeyView::from).collect(),
    }))
}

pub async fn issue_key(
    State(state): State<AppState>,
    path: IdPath,
    payload: Result<Json<IssueKeyRequest>, JsonRejection>,
) -> WebResult<Created<KeyView>> {
    let Path(user_id) = path?;
    let Json(req) = payload?;
    let key = state
        .client
        .issue_key(user_id, &req.purpose, req.bucket_date, None)
        .await?;
    Ok(created(KeyView::from(key)))
}

pub async fn destroy_keys(
    State(state): State<AppState>,
    path: IdPath,
) -> WebResult<Json<ApiResponse<DestructionResult>>> {
    let Path(user_id) = path?;
    let result = state.client.destroy_keys(user_id).await?;
    if !result.allowed {
        return Err(WebError::Blocked(result));
    }
    Ok(ok(result))
}

pub async fn truncate_users(
    State(state): State<AppState>,
) -> WebResult<Json<ApiResponse<UsersRemoved>>> {
    let users_removed = state.client.truncate_users().await?;
    Ok(ok(UsersRemoved { users_removed }))
}

pub async fn restore_users(
    State(state): State<AppState>,
) -> WebResult<Json<ApiResponse<RowsRestored>>> {
    let rows_restored = state.client.restore_users_from_shadow().await?;
    Ok(ok(RowsRestored { rows_restored }))
}

pub async fn create_backup(
    State(state): State<AppState>,
    payload: Result<Json<CreateBackupRequest>, JsonRejection>,
) -> WebResult<Created<BackupRun>> {
    let Json(req) = payload?;
    let backup_type = req
        .backup_type
        .filter(|backup_type| !backup_type.trim().is_empty())
        .ok_or_else(|| DbError::validation("backup_type is required"))?;
    let backup = state
        .client
        .create_backup(&backup_type, req.protected_by_hold)
        .await?;
    Ok(created(backup))
}

pub async fn list_backups(
    State(state): State<AppState>,
    limit: Limit,
) -> WebResult<Json<ApiResponse<Page<BackupRun>>>> {
    let Query(query) = limit?;
    let limit = clamp_limit(query.limit);
    let rows = state.client.list_backups(Some(limit as i64)).await;
    Ok(ok(Page { limit, rows }))
}

pub async fn add_user_to_backup(
    State(state): State<AppState>,
    path: IdPath,
    payload: Result<Json<AddUserToBackupRequest>, JsonRejection>,
) -> WebResult<Json<ApiResponse<BackupMembership>>> {
    let Path(backup_id) = path?;
    let Json(req) = payload?;
    let membership = state
        .client
        .add_user_to_backup(backup_id, req.user_id)
        .await?;
    Ok(ok(membership))
}

pub async fn list_backups_for_user(
    State(state): State<AppState>,
    path: IdPath,
) -> WebResult<Json<ApiResponse<UserBackups>>> {
    let Path(user_id) = path?;
    let backups = state.client.list_backups_for_user(user_id).await?;
    Ok(ok(UserBackups { user_id, backups }))
}

pub async fn place_hold(
    State(state): State<AppState>,
    path: IdPath,
    payload: Result<Json<PlaceHoldRequest>, JsonRejection>,
) -> WebResult<Created<LegalHold>> {
    let Path(user_id) = path?;
    let Json(req) = payload?;
    let hold = state.client.create_hold(user_id, &req.reason).await?;
    Ok(created(hold))
}

pub async fn list_holds_for_user(
    State(state): State<AppState>,
    path: IdPath,
) -> WebResult<Json<ApiResponse<UserHolds>>> {
    let Path(user_id) = path?;
    let active_holds = state.client.list_active_holds(user_id).await?;
    Ok(ok(UserHolds {
        user_id,
        active_holds,
    }))
}

pub async fn list_all_active_holds(State(state): State<AppState>) -> Json<ApiResponse<ActiveHolds>> {
    let active_holds = state.client.list_all_active_holds().await;
    ok(ActiveHolds { active_holds })
}

pub async fn release_hold(
    State(state): State<AppState>,
    path: IdPath,
) -> WebResult<Json<ApiResponse<LegalHold>>> {
    let Path(hold_id) = path?;
    Ok(ok(state.client.release_hold(hold_id).await?))
}

pub async fn deletion_audit(
    State(state): State<AppState>,
    limit: Limit,
) -> WebResult<Json<ApiResponse<Page<DeletionAudit>>>> {
    let Query(query) = limit?;
    let limit = clamp_limit(query.limit);
    let rows = state.client.list_deletion_audit(Some(limit as i64)).await;
    Ok(ok(Page { limit, rows }))
}

pub async fn backup_protection_audit(
    State(state): State<AppState>,
    limit: Limit,
) -> WebResult<Json<ApiResponse<Page<ProtectionAudit>>>> {
    let Query(query) = limit?;
    let limit = clamp_limit(query.limit);
    let rows = state
        .client
        .list_backup_protection_audit(Some(limit as i64))
        .await;
    Ok(ok(Page { limit, rows }))
}
