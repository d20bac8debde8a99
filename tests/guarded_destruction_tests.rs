//! Guarded destruction: guard order, audit trail, idempotence
//!
//! Run with: cargo test --test guarded_destruction_tests

use retentiondb::{Client, DeletionOutcome, ErrorKind, User};

async fn user_with_phone(client: &Client) -> User {
    client
        .create_user("Grace Hopper", "grace@example.com", Some("+1-555-0100"))
        .await
        .unwrap()
}

fn live_keys(keys: &[retentiondb::KeyRecord]) -> usize {
    keys.iter().filter(|key| key.is_live()).count()
}

#[tokio::test]
async fn test_destroy_without_guards_destroys_every_live_key() {
    let client = Client::in_memory();
    let user = user_with_phone(&client).await;
    let id = user.user_id.as_i64();

    let result = client.destroy_keys(id).await.unwrap();
    assert!(result.allowed);
    assert_eq!(result.reason, "no active holds or protections");
    assert_eq!(result.keys_destroyed, 3);

    let keys = client.list_keys(id).await.unwrap();
    assert_eq!(keys.len(), 3, "destroyed keys stay listed");
    assert_eq!(live_keys(&keys), 0);
    for key in &keys {
        assert!(key.destroyed_at.is_some());
        assert!(key.key_material.is_none(), "material must be wiped");
    }
}

#[tokio::test]
async fn test_active_hold_blocks_and_leaves_keys_intact() {
    let client = Client::in_memory();
    let user = user_with_phone(&client).await;
    let id = user.user_id.as_i64();
    client.create_hold(id, "litigation 2024-17").await.unwrap();

    let result = client.destroy_keys(id).await.unwrap();
    assert!(!result.allowed);
    assert_eq!(result.reason, "active legal hold");
    assert_eq!(result.keys_destroyed, 0);

    let keys = client.list_keys(id).await.unwrap();
    assert_eq!(live_keys(&keys), 3);
    assert!(keys.iter().all(|key| key.key_material.is_some()));
}

#[tokio::test]
async fn test_protected_backup_blocks() {
    let client = Client::in_memory();
    let user = user_with_phone(&client).await;
    let id = user.user_id.as_i64();

    let backup = client.create_backup("FULL", true).await.unwrap();
    client
        .add_user_to_backup(backup.backup_id.as_i64(), id)
        .await
        .unwrap();

    let result = client.destroy_keys(id).await.unwrap();
    assert!(!result.allowed);
    assert_eq!(result.reason, "referenced by protected backup");
    assert_eq!(live_keys(&client.list_keys(id).await.unwrap()), 3);
}

#[tokio::test]
async fn test_unprotected_backup_does_not_block() {
    let client = Client::in_memory();
    let user = user_with_phone(&client).await;
    let id = user.user_id.as_i64();

    let backup = client.create_backup("INCREMENTAL", false).await.unwrap();
    client
        .add_user_to_backup(backup.backup_id.as_i64(), id)
        .await
        .unwrap();

    let result = client.destroy_keys(id).await.unwrap();
    assert!(result.allowed);
    assert_eq!(result.keys_destroyed, 3);
}

#[tokio::test]
async fn test_hold_is_checked_before_backup_protection() {
    let client = Client::in_memory();
    let user = user_with_phone(&client).await;
    let id = user.user_id.as_i64();

    let backup = client.create_backup("FULL", true).await.unwrap();
    client
        .add_user_to_backup(backup.backup_id.as_i64(), id)
        .await
        .unwrap();
    client.create_hold(id, "regulator request").await.unwrap();

    let result = client.destroy_keys(id).await.unwrap();
    assert!(!result.allowed);
    assert_eq!(result.reason, "active legal hold");
}

#[tokio::test]
async fn test_release_then_destroy_is_allowed() {
    let client = Client::in_memory();
    let user = user_with_phone(&client).await;
    let id = user.user_id.as_i64();
    let hold = client.create_hold(id, "litigation").await.unwrap();

    assert!(!client.destroy_keys(id).await.unwrap().allowed);

    client.release_hold(hold.hold_id.as_i64()).await.unwrap();
    let result = client.destroy_keys(id).await.unwrap();
    assert!(result.allowed);
    assert_eq!(result.keys_destroyed, 3);

    let audit = client.list_deletion_audit(None).await;
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[0].outcome, DeletionOutcome::Allowed);
    assert_eq!(audit[0].keys_affected, 3);
    assert_eq!(audit[1].outcome, DeletionOutcome::Blocked);
    assert_eq!(audit[1].keys_affected, 0);
}

#[tokio::test]
async fn test_second_destroy_is_idempotent() {
    let client = Client::in_memory();
    let user = user_with_phone(&client).await;
    let id = user.user_id.as_i64();

    let first = client.destroy_keys(id).await.unwrap();
    let first_keys = client.list_keys(id).await.unwrap();
    let second = client.destroy_keys(id).await.unwrap();

    assert_eq!(first.keys_destroyed, 3);
    assert!(second.allowed);
    assert_eq!(second.keys_destroyed, 0);

    let second_keys = client.list_keys(id).await.unwrap();
    for (before, after) in first_keys.iter().zip(&second_keys) {
        assert_eq!(before.destroyed_at, after.destroyed_at, "timestamps must not move");
    }
}

#[tokio::test]
async fn test_every_call_writes_exactly_one_audit_row() {
    let client = Client::in_memory();
    let user = user_with_phone(&client).await;
    let id = user.user_id.as_i64();
    let hold = client.create_hold(id, "audit").await.unwrap();

    for _ in 0..3 {
        client.destroy_keys(id).await.unwrap();
    }
    client.release_hold(hold.hold_id.as_i64()).await.unwrap();
    for _ in 0..2 {
        client.destroy_keys(id).await.unwrap();
    }

    let audit = client.list_deletion_audit(None).await;
    assert_eq!(audit.len(), 5);
    assert!(audit.iter().all(|row| row.user_id == user.user_id));
    let blocked = audit
        .iter()
        .filter(|row| row.outcome == DeletionOutcome::Blocked)
        .count();
    assert_eq!(blocked, 3);
}

#[tokio::test]
async fn test_unknown_user_is_not_found_and_not_audited() {
    let client = Client::in_memory();

    let err = client.destroy_keys(4242).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(client.list_deletion_audit(None).await.is_empty());

    let err = client.destroy_keys(0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_destroy_only_touches_the_target_user() {
    let client = Client::in_memory();
    let target = user_with_phone(&client).await;
    let bystander = client
        .create_user("Alan Turing", "alan@example.com", None)
        .await
        .unwrap();

    client.destroy_keys(target.user_id.as_i64()).await.unwrap();

    let keys = client
        .list_keys(bystander.user_id.as_i64())
        .await
        .unwrap();
    assert_eq!(live_keys(&keys), 2);
}

#[tokio::test]
async fn test_keys_issued_after_destruction_are_live() {
    let client = Client::in_memory();
    let user = user_with_phone(&client).await;
    let id = user.user_id.as_i64();

    client.destroy_keys(id).await.unwrap();
    let fresh = client.issue_key(id, "address", None, None).await.unwrap();
    assert!(fresh.is_live());

    let result = client.destroy_keys(id).await.unwrap();
    assert_eq!(result.keys_destroyed, 1);
}
