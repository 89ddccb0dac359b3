//! Admission behaviour as seen by dispatcher clients

mod common;

use bgremove_service::{
    AdmissionGate, AdmissionRejection, Clock, PassthroughSegmenter, RequestDispatcher, ServiceError,
};
use chrono::NaiveDate;
use common::{png_bytes, registry_with, ScriptedCodec, TestEnv};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

struct ManualClock(Mutex<NaiveDate>);

impl ManualClock {
    fn advance_day(&self) {
        let mut day = self.0.lock().unwrap();
        *day = day.succ_opt().unwrap();
    }
}

impl Clock for ManualClock {
    fn today(&self) -> NaiveDate {
        *self.0.lock().unwrap()
    }
}

fn dispatcher_with_clock(env: &TestEnv) -> (RequestDispatcher, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock(Mutex::new(
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
    )));
    let gate = Arc::new(AdmissionGate::with_clock(
        &env.config.admission,
        Arc::clone(&clock) as Arc<dyn Clock>,
    ));
    let dispatcher = RequestDispatcher::with_admission(
        env.config.clone(),
        gate,
        registry_with(vec![Arc::new(PassthroughSegmenter::new())]),
        Arc::new(ScriptedCodec::with_frames(1)),
    )
    .unwrap();
    (dispatcher, clock)
}

async fn request(dispatcher: &RequestDispatcher, client: &str) -> Result<(), ServiceError> {
    dispatcher
        .remove_background(client, "passthrough", png_bytes(2, 2), &CancellationToken::new())
        .await
        .map(|_| ())
}

#[tokio::test]
async fn test_limit_resets_at_day_rollover() {
    let env = TestEnv::new(3);
    let (dispatcher, clock) = dispatcher_with_clock(&env);

    for _ in 0..3 {
        request(&dispatcher, "192.0.2.1").await.unwrap();
    }
    assert!(matches!(
        request(&dispatcher, "192.0.2.1").await,
        Err(ServiceError::AdmissionRejected(
            AdmissionRejection::DailyLimitExceeded { limit: 3 }
        ))
    ));
    // Other clients are unaffected
    request(&dispatcher, "192.0.2.2").await.unwrap();

    clock.advance_day();
    request(&dispatcher, "192.0.2.1").await.unwrap();
    assert_eq!(dispatcher.admission().count("192.0.2.1"), 1);
}

#[tokio::test]
async fn test_abusive_client_stays_blocked_until_unblocked() {
    // Limit 3, abuse threshold 6
    let env = TestEnv::new(3);
    let (dispatcher, clock) = dispatcher_with_clock(&env);

    let mut outcomes = Vec::new();
    for _ in 0..7 {
        outcomes.push(request(&dispatcher, "192.0.2.66").await);
    }
    assert!(outcomes[..3].iter().all(Result::is_ok));
    assert!(outcomes[3..6].iter().all(|r| matches!(
        r,
        Err(ServiceError::AdmissionRejected(
            AdmissionRejection::DailyLimitExceeded { .. }
        ))
    )));
    assert!(matches!(
        outcomes[6],
        Err(ServiceError::AdmissionRejected(AdmissionRejection::Blocked { threshold: 6 }))
    ));
    assert_eq!(dispatcher.health().blocked_clients, 1);

    clock.advance_day();
    assert!(matches!(
        request(&dispatcher, "192.0.2.66").await,
        Err(ServiceError::AdmissionRejected(AdmissionRejection::Blocked { .. }))
    ));
    // Refusals of a blocked client are not counted
    assert_eq!(dispatcher.admission().count("192.0.2.66"), 0);

    assert!(dispatcher.admission().unblock("192.0.2.66"));
    request(&dispatcher, "192.0.2.66").await.unwrap();
}

#[tokio::test]
async fn test_rejected_requests_consume_no_work() {
    let env = TestEnv::new(1);
    let (dispatcher, _clock) = dispatcher_with_clock(&env);

    request(&dispatcher, "192.0.2.7").await.unwrap();
    let err = dispatcher
        .submit_video("192.0.2.7", "passthrough", "clip.mp4", common::fake_video())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AdmissionRejected(_)));
    assert!(dispatcher.jobs().is_empty());
    assert_eq!(env.scratch_entries(), 0);
    assert_eq!(dispatcher.arbiter().leases_granted(), 0);
}
