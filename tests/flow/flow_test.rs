//! End-to-end tests of the attempt stage machine.

use std::sync::Arc;

use chrono::{Duration, Utc};

use tryout::access::{AccessError, DenialReason};
use tryout::config::RuntimeConfig;
use tryout::flow::{AttemptFlow, FlowError, Stage};
use tryout::runtime::Phase;
use tryout::storage::sqlite::SqliteStore;
use tryout::storage::AccessAction;
use tryout::token::TokenError;

use crate::support::{self, TRYOUT, USER};

struct Fixture {
    store: Arc<SqliteStore>,
    writer: tokio::task::JoinHandle<()>,
    flow: AttemptFlow,
}

async fn fixture(is_free: bool) -> Fixture {
    let store = support::sqlite().await;
    support::seed_tryout(&store, &support::tryout(TRYOUT, is_free, 30), 3).await;
    support::seed_tryout(&store, &support::tryout(8, true, 30), 1).await;
    let (audit, writer) = support::audit(store.clone());
    let gate = Arc::new(support::gate(&store, audit.clone()));
    let sessions = support::sessions(store.clone(), audit.clone());
    let flow = AttemptFlow::new(gate, sessions, audit, USER);
    Fixture {
        store,
        writer,
        flow,
    }
}

impl Fixture {
    async fn access_log(self) -> Vec<tryout::storage::AccessLogEntry> {
        let Self {
            store,
            writer,
            flow,
        } = self;
        drop(flow);
        support::flush(writer).await;
        store.access_log_for_user(USER).await.expect("log")
    }
}

#[tokio::test]
async fn happy_path_reaches_verified_result() {
    let mut fx = fixture(false).await;
    fx.store
        .grant_package(USER, 1, 2, 0, Utc::now() + Duration::days(30))
        .await
        .expect("grant");

    let grant = fx.flow.enter(TRYOUT).await.expect("enter");
    assert_eq!(fx.flow.stage(), Stage::TokenIssued);
    assert_eq!(fx.flow.token(), Some(grant.token.as_str()));

    let claims = fx.flow.open_intro(&grant.token, TRYOUT).expect("intro");
    assert_eq!(claims.attempt_number, 1);
    assert_eq!(fx.flow.stage(), Stage::AccessVerified);

    let session = fx
        .flow
        .begin(&grant.token, TRYOUT, None)
        .await
        .expect("begin");
    assert_eq!(session.time_remaining_seconds, 1800);
    assert_eq!(fx.flow.stage(), Stage::SessionCreated);

    let runtime = fx.flow.runtime(&RuntimeConfig::default()).expect("runtime");
    runtime.load().await.expect("load");
    let first = runtime.questions()[0].question_id;
    runtime.save_answer(first, "C").expect("answer");
    runtime.settle().await;
    let result = runtime.submit_exam().await.expect("submit");
    assert_eq!(runtime.phase(), Phase::Submitted);

    fx.flow.record_submission(result.clone()).expect("record");
    assert_eq!(fx.flow.stage(), Stage::Submitted);

    let verified = fx
        .flow
        .open_result(&result.submission_token, TRYOUT)
        .expect("result");
    assert_eq!(fx.flow.stage(), Stage::ResultVerified);
    assert_eq!(verified.session_id, session.session_id);
    assert_eq!(verified.answers.get(&first).map(String::as_str), Some("C"));

    // The runtime holds an audit handle too.
    drop(runtime);
    let log = fx.access_log().await;
    let actions: Vec<(AccessAction, bool)> = log.iter().map(|e| (e.action, e.success)).collect();
    assert_eq!(
        actions,
        vec![
            (AccessAction::Start, true),
            (AccessAction::Access, true),
            (AccessAction::Submit, true),
            (AccessAction::Access, true),
        ]
    );
}

#[tokio::test]
async fn denied_entry_stays_at_no_token() {
    let mut fx = fixture(false).await;
    fx.store
        .grant_package(USER, 1, 5, 5, Utc::now() + Duration::days(30))
        .await
        .expect("grant");

    let err = fx.flow.enter(TRYOUT).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::Access(AccessError::Denied(DenialReason::QuotaExhausted))
    ));
    assert_eq!(err.reason(), "quota_exhausted");
    assert_eq!(fx.flow.stage(), Stage::NoToken);
    assert!(fx.flow.token().is_none());
}

#[tokio::test]
async fn token_for_other_route_resets_flow() {
    let mut fx = fixture(true).await;
    let grant = fx.flow.enter(TRYOUT).await.expect("enter");

    let err = fx.flow.open_intro(&grant.token, 8).unwrap_err();
    assert!(matches!(
        err,
        FlowError::Token(TokenError::TryoutMismatch {
            expected: 8,
            found: TRYOUT
        })
    ));
    assert_eq!(fx.flow.stage(), Stage::NoToken);
    assert!(fx.flow.token().is_none());

    let log = fx.access_log().await;
    let denial = log
        .iter()
        .find(|e| e.action == AccessAction::Access)
        .expect("denial logged");
    assert!(!denial.success);
    assert_eq!(denial.tryout_id, 8);
    assert_eq!(denial.reason.as_deref(), Some("token_tryout_mismatch"));
}

#[tokio::test]
async fn token_of_another_user_is_refused() {
    let mut fx = fixture(true).await;
    let foreign = support::signer()
        .generate_access_token(TRYOUT, USER + 1, 1)
        .expect("mint");

    let err = fx.flow.open_intro(&foreign, TRYOUT).unwrap_err();
    assert!(matches!(
        err,
        FlowError::UserMismatch {
            expected: USER,
            found
        } if found == USER + 1
    ));
    assert_eq!(fx.flow.stage(), Stage::NoToken);
}

#[tokio::test]
async fn tampered_token_fails_at_begin() {
    let mut fx = fixture(true).await;
    let grant = fx.flow.enter(TRYOUT).await.expect("enter");
    fx.flow.open_intro(&grant.token, TRYOUT).expect("intro");

    let mut tampered = grant.token.clone();
    tampered.push('x');
    let err = fx.flow.begin(&tampered, TRYOUT, None).await.unwrap_err();
    assert!(matches!(err, FlowError::Token(_)));
    assert_eq!(fx.flow.stage(), Stage::NoToken);
    assert!(fx.flow.session().is_none());
}

#[tokio::test]
async fn stages_cannot_be_skipped() {
    let mut fx = fixture(true).await;

    assert!(matches!(
        fx.flow.begin("anything", TRYOUT, None).await,
        Err(FlowError::InvalidTransition {
            from: Stage::NoToken,
            ..
        })
    ));
    assert!(fx.flow.runtime(&RuntimeConfig::default()).is_err());
    assert!(matches!(
        fx.flow.open_result("anything", TRYOUT),
        Err(FlowError::InvalidTransition { .. })
    ));

    let grant = fx.flow.enter(TRYOUT).await.expect("enter");
    assert!(matches!(
        fx.flow.enter(TRYOUT).await,
        Err(FlowError::InvalidTransition {
            from: Stage::TokenIssued,
            ..
        })
    ));
    // Invalid transitions do not reset the flow.
    assert_eq!(fx.flow.stage(), Stage::TokenIssued);
    assert_eq!(fx.flow.token(), Some(grant.token.as_str()));
}

#[tokio::test]
async fn access_token_is_not_a_submission_token() {
    let mut fx = fixture(true).await;
    let grant = fx.flow.enter(TRYOUT).await.expect("enter");
    fx.flow.open_intro(&grant.token, TRYOUT).expect("intro");
    let session = fx
        .flow
        .begin(&grant.token, TRYOUT, None)
        .await
        .expect("begin");

    fx.flow
        .record_submission(tryout::runtime::ResultStage {
            session_id: session.session_id.clone(),
            tryout_id: TRYOUT,
            submission_token: grant.token.clone(),
        })
        .expect("record");
    let err = fx.flow.open_result(&grant.token, TRYOUT).unwrap_err();
    assert_eq!(err.reason(), "token_wrong_kind");
    assert_eq!(fx.flow.stage(), Stage::NoToken);
}

#[tokio::test]
async fn result_for_other_session_is_rejected() {
    let mut fx = fixture(true).await;
    let grant = fx.flow.enter(TRYOUT).await.expect("enter");
    fx.flow.open_intro(&grant.token, TRYOUT).expect("intro");
    fx.flow
        .begin(&grant.token, TRYOUT, None)
        .await
        .expect("begin");

    let err = fx
        .flow
        .record_submission(tryout::runtime::ResultStage {
            session_id: "someone-else".to_owned(),
            tryout_id: TRYOUT,
            submission_token: String::new(),
        })
        .unwrap_err();
    assert!(matches!(err, FlowError::SessionMismatch { .. }));
    assert_eq!(fx.flow.stage(), Stage::SessionCreated);
}

#[tokio::test]
async fn new_attempt_after_verified_result() {
    let mut fx = fixture(true).await;
    let grant = fx.flow.enter(TRYOUT).await.expect("enter");
    fx.flow.open_intro(&grant.token, TRYOUT).expect("intro");
    fx.flow
        .begin(&grant.token, TRYOUT, None)
        .await
        .expect("begin");
    let runtime = fx.flow.runtime(&RuntimeConfig::default()).expect("runtime");
    runtime.load().await.expect("load");
    let result = runtime.submit_exam().await.expect("submit");
    fx.flow.record_submission(result.clone()).expect("record");
    fx.flow
        .open_result(&result.submission_token, TRYOUT)
        .expect("result");

    let again = fx.flow.enter(TRYOUT).await.expect("second attempt");
    assert_eq!(again.attempt_number, 2);
    assert_eq!(fx.flow.stage(), Stage::TokenIssued);
    assert!(fx.flow.session().is_none());
}
