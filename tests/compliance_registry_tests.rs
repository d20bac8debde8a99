//! Hold registry, backup index, audit log and user directory through the
//! public client
//!
//! Run with: cargo test --test compliance_registry_tests

use retentiondb::{BackupType, Client, DeletionOutcome, ErrorKind};

async fn client_with_user() -> (Client, i64) {
    let client = Client::in_memory();
    let user = client
        .create_user("Ada Lovelace", "ada@example.com", None)
        .await
        .unwrap();
    (client, user.user_id.as_i64())
}

// ============================================================================
// Hold registry
// ============================================================================

#[tokio::test]
async fn test_hold_lifecycle() {
    let (client, user) = client_with_user().await;

    let first = client.create_hold(user, "  litigation  ").await.unwrap();
    let second = client.create_hold(user, "regulator").await.unwrap();
    assert_eq!(first.hold_reason, "litigation");
    assert!(first.is_active());

    let active = client.list_active_holds(user).await.unwrap();
    assert_eq!(active.len(), 2);
    assert_eq!(active[0].hold_id, second.hold_id, "newest first");

    let released = client.release_hold(first.hold_id.as_i64()).await.unwrap();
    assert!(released.released_at.is_some());
    assert_eq!(client.list_active_holds(user).await.unwrap().len(), 1);
    assert_eq!(client.list_all_active_holds().await.len(), 1);
}

#[tokio::test]
async fn test_release_twice_is_not_found() {
    let (client, user) = client_with_user().await;
    let hold = client.create_hold(user, "litigation").await.unwrap();
    let hold_id = hold.hold_id.as_i64();

    client.release_hold(hold_id).await.unwrap();
    let err = client.release_hold(hold_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = client.release_hold(999).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_hold_validation() {
    let (client, user) = client_with_user().await;

    let err = client.create_hold(user, "   ").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = client.create_hold(-3, "litigation").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = client.create_hold(user + 100, "litigation").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(client.list_all_active_holds().await.is_empty());
}

#[tokio::test]
async fn test_holds_of_unknown_user_are_empty() {
    let client = Client::in_memory();
    assert!(client.list_active_holds(77).await.unwrap().is_empty());
}

// ============================================================================
// Backup protection index
// ============================================================================

#[tokio::test]
async fn test_backup_creation_and_listing() {
    let client = Client::in_memory();

    let full = client.create_backup("full", false).await.unwrap();
    let incr = client.create_backup("INCR", true).await.unwrap();
    assert_eq!(full.backup_type, BackupType::Full);
    assert_eq!(incr.backup_type, BackupType::Incremental);
    assert!(full.protected_reason.is_none());
    assert_eq!(incr.protected_reason.as_deref(), Some("protected at creation"));

    let listed = client.list_backups(None).await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].backup_id, incr.backup_id);

    assert_eq!(client.list_backups(Some(1)).await.len(), 1);
    assert_eq!(client.list_backups(Some(0)).await.len(), 1, "limit clamps to 1");

    let err = client.create_backup("daily", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_membership_is_upserted() {
    let (client, user) = client_with_user().await;
    let backup = client.create_backup("FULL", false).await.unwrap();
    let backup_id = backup.backup_id.as_i64();

    let first = client.add_user_to_backup(backup_id, user).await.unwrap();
    let again = client.add_user_to_backup(backup_id, user).await.unwrap();
    assert_eq!(first.first_seen, again.first_seen);
    assert!(again.last_seen >= first.last_seen);

    let backups = client.list_backups_for_user(user).await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].backup_type, BackupType::Full);
}

#[tokio::test]
async fn test_membership_requires_backup_and_user() {
    let (client, user) = client_with_user().await;
    let backup = client.create_backup("FULL", false).await.unwrap();

    let err = client.add_user_to_backup(404, user).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = client
        .add_user_to_backup(backup.backup_id.as_i64(), user + 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(client.list_backups_for_user(user).await.unwrap().is_empty());
}

// ============================================================================
// Compliance audit log
// ============================================================================

#[tokio::test]
async fn test_protection_audit_on_new_protected_membership_only() {
    let (client, user) = client_with_user().await;
    let protected = client.create_backup("FULL", true).await.unwrap();
    let plain = client.create_backup("FULL", false).await.unwrap();

    client
        .add_user_to_backup(protected.backup_id.as_i64(), user)
        .await
        .unwrap();
    client
        .add_user_to_backup(protected.backup_id.as_i64(), user)
        .await
        .unwrap();
    client
        .add_user_to_backup(plain.backup_id.as_i64(), user)
        .await
        .unwrap();

    let audit = client.list_backup_protection_audit(None).await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].backup_id, protected.backup_id);
    assert_eq!(audit[0].user_id.as_i64(), user);
    assert!(audit[0].protected);
}

#[tokio::test]
async fn test_deletion_audit_is_newest_first_and_limited() {
    let (client, user) = client_with_user().await;
    let hold = client.create_hold(user, "litigation").await.unwrap();
    client.destroy_keys(user).await.unwrap();
    client.release_hold(hold.hold_id.as_i64()).await.unwrap();
    client.destroy_keys(user).await.unwrap();

    let newest = client.list_deletion_audit(Some(1)).await;
    assert_eq!(newest.len(), 1);
    assert_eq!(newest[0].outcome, DeletionOutcome::Allowed);

    let all = client.list_deletion_audit(Some(10_000)).await;
    assert_eq!(all.len(), 2);
    assert!(all[0].audit_id > all[1].audit_id);
}

#[tokio::test]
async fn test_audit_survives_truncate() {
    let (client, user) = client_with_user().await;
    client.destroy_keys(user).await.unwrap();

    assert_eq!(client.truncate_users().await.unwrap(), 1);
    assert_eq!(client.list_deletion_audit(None).await.len(), 1);
}

// ============================================================================
// User directory
// ============================================================================

#[tokio::test]
async fn test_user_validation() {
    let client = Client::in_memory();
    let err = client
        .create_user("", "nobody@example.com", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = client.get_user(12).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = client.list_keys(12).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_issue_key_with_bucket_date() {
    let (client, user) = client_with_user().await;
    let bucket = chrono::NaiveDate::from_ymd_opt(2020, 1, 31).unwrap();

    let key = client
        .issue_key(user, "archive", Some(bucket), Some(vec![7; 32]))
        .await
        .unwrap();
    assert_eq!(key.bucket_date, bucket);
    assert_eq!(key.key_material.as_deref(), Some(&[7u8; 32][..]));

    let keys = client.list_keys(user).await.unwrap();
    assert_eq!(keys.len(), 3);
    assert_eq!(keys.last().unwrap().key_id, key.key_id, "oldest bucket last");

    let err = client.issue_key(user, " ", None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_truncate_and_restore_from_shadow() {
    let (client, user) = client_with_user().await;
    client
        .create_user("Alan Turing", "alan@example.com", Some("555"))
        .await
        .unwrap();
    client.create_hold(user, "litigation").await.unwrap();
    let backup = client.create_backup("FULL", false).await.unwrap();
    client
        .add_user_to_backup(backup.backup_id.as_i64(), user)
        .await
        .unwrap();

    assert_eq!(client.truncate_users().await.unwrap(), 2);
    assert!(client.list_users(None).await.is_empty());
    assert!(client.list_all_active_holds().await.is_empty());
    assert!(client.list_backups_for_user(user).await.unwrap().is_empty());
    assert_eq!(client.list_backups(None).await.len(), 1, "backups are kept");

    assert_eq!(client.restore_users_from_shadow().await.unwrap(), 2);
    assert_eq!(client.restore_users_from_shadow().await.unwrap(), 0);

    let restored = client.get_user(user).await.unwrap();
    assert_eq!(restored.email, "ada@example.com");
    assert!(client.list_keys(user).await.unwrap().is_empty(), "keys are not restored");
}
