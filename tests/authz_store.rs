//! Store-level authorization invariants: lockout accounting, atomic
//! claims, single-use recovery codes, soft-delete denial.

mod common;

use common::{FakeBackend, Harness};
use chrono::Duration;
use dns_gateway::store::{AuditEntry, NewRealm, Operation, RealmType};
use dns_gateway::Error;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn lockout_triggers_exactly_at_threshold() {
    // GIVEN: an account and a threshold of 3
    let harness = Harness::start_default().await;
    let store = &harness.app.store;
    let hash = harness.app.secrets.hash_password("some-password-1").await.unwrap();
    let account = store
        .create_account("carol", "carol@example.net", &hash, false, false)
        .await
        .unwrap();

    let window = Duration::minutes(15);
    let lockout = Duration::minutes(15);

    // WHEN: two failures
    for _ in 0..2 {
        let locked = store
            .record_login_failure(account.id, 3, window, lockout)
            .await
            .unwrap();
        // THEN: still below the threshold
        assert!(locked.is_none());
    }

    // AND: the third failure locks
    let locked = store
        .record_login_failure(account.id, 3, window, lockout)
        .await
        .unwrap();
    assert!(locked.is_some());
    let account = store.account_by_id(account.id).await.unwrap();
    assert!(account.is_locked(chrono::Utc::now()));

    // AND: a reset clears the state
    store.reset_login_failures(account.id).await.unwrap();
    let account = store.account_by_id(account.id).await.unwrap();
    assert!(!account.is_locked(chrono::Utc::now()));
    assert_eq!(account.failed_login_count, 0);
}

#[tokio::test]
async fn recovery_code_is_single_use() {
    // GIVEN: an account with recovery codes
    let harness = Harness::start_default().await;
    let store = &harness.app.store;
    let hash = harness.app.secrets.hash_password("some-password-1").await.unwrap();
    let account = store
        .create_account("dave", "dave@example.net", &hash, false, false)
        .await
        .unwrap();
    store.set_totp_secret(account.id, "JBSWY3DPEHPK3PXP").await.unwrap();
    let (_, hashes) = harness.app.secrets.generate_recovery_codes().await.unwrap();
    store.enable_totp(account.id, &hashes).await.unwrap();

    let account = store.account_by_id(account.id).await.unwrap();
    assert_eq!(account.recovery_codes.len(), 10);

    // WHEN: consuming code 0
    let remaining = store
        .consume_recovery_code(account.id, &account.recovery_codes, 0)
        .await
        .unwrap();
    assert_eq!(remaining, Some(9));

    // THEN: replaying the same compare-and-swap loses
    let replay = store
        .consume_recovery_code(account.id, &account.recovery_codes, 0)
        .await
        .unwrap();
    assert_eq!(replay, None);
}

#[tokio::test]
async fn double_claim_is_an_atomic_conflict() {
    // GIVEN: a root with one claimed realm
    let harness = Harness::start_default().await;
    let _ = harness
        .seed_platform_token(
            "example.com",
            "home",
            RealmType::Host,
            vec![Operation::Read],
            vec![],
            vec![],
            FakeBackend::with_records(vec![]),
        )
        .await;
    let store = &harness.app.store;
    let admin = store.account_by_username("admin").await.unwrap().unwrap();
    let realm = &store.realms_for_account(admin.id).await.unwrap()[0];
    let root_id = realm.domain_root_id.unwrap();

    // WHEN: a second account claims the same value
    let hash = harness.app.secrets.hash_password("some-password-1").await.unwrap();
    let other = store
        .create_account("erin", "erin@example.net", &hash, false, false)
        .await
        .unwrap();
    let result = store
        .claim_realm(
            &NewRealm {
                account_id: other.id,
                realm_value: "home".into(),
                realm_type: RealmType::Host,
                domain: None,
                domain_root_id: Some(root_id),
                user_backend_id: None,
            },
            AuditEntry::success("realm_claim", "local"),
        )
        .await;

    // THEN: the first committer won
    assert!(matches!(result, Err(Error::Conflict(_))));
}

#[tokio::test]
async fn deactivated_service_denies_dependents_without_schema_changes() {
    // GIVEN: a working token
    let harness = Harness::start_default().await;
    let token = harness
        .seed_platform_token(
            "example.com",
            "home",
            RealmType::Host,
            vec![Operation::Read],
            vec![],
            vec![],
            FakeBackend::with_records(vec![]),
        )
        .await;
    let (status, _) = harness
        .api(&token, "infoDnsZone", json!({"domainname": "home.example.com"}))
        .await;
    assert_eq!(status, 200);

    // WHEN: the backing service is soft-deleted
    let store = &harness.app.store;
    let services = store.list_backend_services(None).await.unwrap();
    let service = services.last().unwrap();
    store
        .set_service_active(service.id, false, AuditEntry::success("service_set_active", "local"))
        .await
        .unwrap();

    // THEN: the same token immediately gets backend_unavailable
    let (status, body) = harness
        .api(&token, "infoDnsZone", json!({"domainname": "home.example.com"}))
        .await;
    assert_eq!(status, 503);
    assert_eq!(body["reason"], "backend_unavailable");
}

#[tokio::test]
async fn revoked_token_is_opaquely_invalid() {
    // GIVEN: a working token
    let harness = Harness::start_default().await;
    let token = harness
        .seed_platform_token(
            "example.com",
            "home",
            RealmType::Host,
            vec![Operation::Read],
            vec![],
            vec![],
            FakeBackend::with_records(vec![]),
        )
        .await;

    // WHEN: revoking it
    let store = &harness.app.store;
    let admin = store.account_by_username("admin").await.unwrap().unwrap();
    let realm = &store.realms_for_account(admin.id).await.unwrap()[0];
    let stored = &store.tokens_for_realm(realm.id).await.unwrap()[0];
    store
        .revoke_token(stored.id, AuditEntry::success("token_revoke", "local"))
        .await
        .unwrap();

    // THEN: authentication still succeeds at the hash layer but the token
    // gate reports the opaque invalid_token
    let (status, body) = harness
        .api(&token, "infoDnsZone", json!({"domainname": "home.example.com"}))
        .await;
    assert_eq!(status, 401);
    assert_eq!(body["reason"], "invalid_token");
}

#[tokio::test]
async fn account_deletion_is_refused_while_dependents_exist() {
    // GIVEN: the admin owning the seeded realm chain
    let harness = Harness::start_default().await;
    let _ = harness
        .seed_platform_token(
            "example.com",
            "home",
            RealmType::Host,
            vec![Operation::Read],
            vec![],
            vec![],
            FakeBackend::with_records(vec![]),
        )
        .await;
    let store = &harness.app.store;
    let admin = store.account_by_username("admin").await.unwrap().unwrap();

    // WHEN/THEN: deletion is a conflict while realms and tokens remain
    assert!(matches!(
        store.delete_account(admin.id).await,
        Err(Error::Conflict(_))
    ));

    // AND: with the realm cascaded away, the last-active-admin guard
    // still refuses (platform services have owner_id NULL and don't block)
    let realm = &store.realms_for_account(admin.id).await.unwrap()[0];
    store
        .delete_realm(realm.id, AuditEntry::success("realm_delete", "local"))
        .await
        .unwrap();
    assert!(matches!(
        store.delete_account(admin.id).await,
        Err(Error::Conflict(_))
    ));

    // AND: once another active admin exists, the deletion goes through
    let hash = harness.app.secrets.hash_password("some-password-1").await.unwrap();
    store
        .create_account("second-admin", "ops@example.net", &hash, true, false)
        .await
        .unwrap();
    store.delete_account(admin.id).await.unwrap();
}

#[tokio::test]
async fn at_least_one_active_admin_survives_every_write() {
    // GIVEN: exactly two active admins
    let harness = Harness::start_default().await;
    let store = &harness.app.store;
    let first = store.account_by_username("admin").await.unwrap().unwrap();
    let hash = harness.app.secrets.hash_password("some-password-1").await.unwrap();
    let second = store
        .create_account("admin2", "admin2@example.net", &hash, true, false)
        .await
        .unwrap();
    assert_eq!(store.active_admin_count().await.unwrap(), 2);

    // WHEN: disabling one
    store.set_account_active(second.id, false).await.unwrap();

    // THEN: the guarded write refuses to disable the remaining one
    assert!(matches!(
        store.set_account_active(first.id, false).await,
        Err(Error::Conflict(_))
    ));
    assert_eq!(store.active_admin_count().await.unwrap(), 1);

    // AND: re-disabling the already-inactive admin is a harmless no-op
    store.set_account_active(second.id, false).await.unwrap();

    // AND: deleting the disabled admin is allowed, deleting the last
    // active one is not
    store.delete_account(second.id).await.unwrap();
    assert!(matches!(
        store.delete_account(first.id).await,
        Err(Error::Conflict(_))
    ));
    assert_eq!(store.active_admin_count().await.unwrap(), 1);
}
