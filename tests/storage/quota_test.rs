//! Tests for package quota and the attempt ledger.

use chrono::{Duration, Utc};

use tryout::storage::{AccessAction, AccessLogEntry, AuditSink, QuotaStore};

use crate::support;

#[tokio::test]
async fn consume_stops_at_quota() {
    let store = support::sqlite().await;
    let holding = store
        .grant_package(42, 1, 2, 0, Utc::now() + Duration::days(30))
        .await
        .expect("grant");

    let now = Utc::now();
    assert_eq!(store.consume_quota(42, None, now).await.expect("consume"), Some(holding));
    assert_eq!(store.consume_quota(42, None, now).await.expect("consume"), Some(holding));
    assert_eq!(store.consume_quota(42, None, now).await.expect("consume"), None);

    let packages = store.user_packages(42).await.expect("packages");
    assert_eq!(packages[0].tryout_used, 2);
    assert_eq!(packages[0].tryout_quota, 2);
}

#[tokio::test]
async fn consume_prefers_earliest_expiring_live_package() {
    let store = support::sqlite().await;
    let now = Utc::now();
    store
        .grant_package(42, 1, 5, 0, now - Duration::days(1))
        .await
        .expect("expired grant");
    let late = store
        .grant_package(42, 2, 5, 0, now + Duration::days(60))
        .await
        .expect("late grant");
    let soon = store
        .grant_package(42, 3, 5, 0, now + Duration::days(7))
        .await
        .expect("soon grant");

    assert_eq!(store.consume_quota(42, None, now).await.expect("consume"), Some(soon));
    assert_eq!(store.consume_quota(42, Some(2), now).await.expect("consume"), Some(late));
    assert_eq!(store.consume_quota(42, Some(9), now).await.expect("consume"), None);
}

#[tokio::test]
async fn concurrent_consumes_never_exceed_quota() {
    let store = support::sqlite().await;
    store
        .grant_package(42, 1, 3, 0, Utc::now() + Duration::days(30))
        .await
        .expect("grant");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.consume_quota(42, None, Utc::now()).await
        }));
    }
    let mut granted = 0;
    for handle in handles {
        if handle.await.expect("join").expect("consume").is_some() {
            granted += 1;
        }
    }

    assert_eq!(granted, 3);
    let packages = store.user_packages(42).await.expect("packages");
    assert_eq!(packages[0].tryout_used, 3);
}

#[tokio::test]
async fn attempt_numbers_are_sequential_per_tryout() {
    let store = support::sqlite().await;
    let holding = store
        .grant_package(42, 1, 5, 0, Utc::now() + Duration::days(30))
        .await
        .expect("grant");

    let now = Utc::now();
    assert_eq!(store.record_attempt(42, 7, Some(holding), now).await.expect("record"), 1);
    assert_eq!(store.record_attempt(42, 7, None, now).await.expect("record"), 2);
    assert_eq!(store.record_attempt(42, 8, None, now).await.expect("record"), 1);
    assert_eq!(store.count_attempts(42, 7).await.expect("count"), 2);

    let ledger = store.attempts(42, 7).await.expect("ledger");
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[0].user_package_id, Some(holding));
    assert_eq!(ledger[1].user_package_id, None);
}

#[tokio::test]
async fn access_log_round_trips_through_sink() {
    let store = support::sqlite().await;
    store
        .append(&AccessLogEntry::denied(42, 7, AccessAction::Start, "quota_exhausted"))
        .await
        .expect("append");
    store
        .append(&AccessLogEntry::allowed(42, 7, AccessAction::Access))
        .await
        .expect("append");

    let log = store.access_log_for_user(42).await.expect("log");
    assert_eq!(log.len(), 2);
    assert!(!log[0].success);
    assert_eq!(log[0].reason.as_deref(), Some("quota_exhausted"));
    assert_eq!(log[1].action, AccessAction::Access);
}

#[tokio::test]
async fn charge_commits_quota_and_ledger_together() {
    let store = support::sqlite().await;
    let holding = store
        .grant_package(42, 1, 1, 0, Utc::now() + Duration::days(30))
        .await
        .expect("grant");

    let now = Utc::now();
    let record = store
        .charge_attempt(42, 7, None, now)
        .await
        .expect("charge")
        .expect("one unit is left");
    assert_eq!(record.attempt_number, 1);
    assert_eq!(record.user_package_id, Some(holding));

    assert!(store.charge_attempt(42, 7, None, now).await.expect("charge").is_none());
    assert_eq!(store.count_attempts(42, 7).await.expect("count"), 1);
    assert_eq!(store.user_packages(42).await.expect("packages")[0].tryout_used, 1);
}

#[tokio::test]
async fn failed_ledger_write_rolls_back_the_charge() {
    let store = support::sqlite().await;
    store
        .grant_package(42, 1, 1, 0, Utc::now() + Duration::days(30))
        .await
        .expect("grant");
    sqlx::raw_sql(
        "CREATE TRIGGER reject_attempts BEFORE INSERT ON attempts \
         BEGIN SELECT RAISE(ABORT, 'ledger unavailable'); END;",
    )
    .execute(store.pool())
    .await
    .expect("trigger");

    assert!(store.charge_attempt(42, 7, None, Utc::now()).await.is_err());
    assert_eq!(store.user_packages(42).await.expect("packages")[0].tryout_used, 0);
    assert_eq!(store.count_attempts(42, 7).await.expect("count"), 0);
}

#[tokio::test]
async fn voiding_an_attempt_refunds_its_holding() {
    let store = support::sqlite().await;
    store
        .grant_package(42, 1, 2, 0, Utc::now() + Duration::days(30))
        .await
        .expect("grant");

    let record = store
        .charge_attempt(42, 7, None, Utc::now())
        .await
        .expect("charge")
        .expect("quota left");
    assert_eq!(store.user_packages(42).await.expect("packages")[0].tryout_used, 1);

    assert!(store.void_attempt(42, 7, record.attempt_number).await.expect("void"));
    assert_eq!(store.user_packages(42).await.expect("packages")[0].tryout_used, 0);
    assert_eq!(store.count_attempts(42, 7).await.expect("count"), 0);

    assert!(!store.void_attempt(42, 7, record.attempt_number).await.expect("void"));
    assert_eq!(store.user_packages(42).await.expect("packages")[0].tryout_used, 0);
}
