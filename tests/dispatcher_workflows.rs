//! End-to-end request workflows through the dispatcher
//!
//! Video jobs run against a scripted codec so no external tools are needed.

mod common;

use bgremove_service::{
    AdmissionRejection, ArtifactSweeper, JobState, PassthroughSegmenter, RequestDispatcher,
    Segmenter, ServiceError,
};
use common::{fake_video, png_bytes, registry_with, OverlapCounter, ScriptedCodec, TestEnv};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn dispatcher(env: &TestEnv, codec: ScriptedCodec, segmenters: Vec<Arc<dyn Segmenter>>) -> RequestDispatcher {
    RequestDispatcher::new(env.config.clone(), registry_with(segmenters), Arc::new(codec)).unwrap()
}

#[tokio::test]
async fn test_video_job_completes_and_artifact_is_fetchable() {
    let env = TestEnv::new(10);
    let dispatcher = dispatcher(
        &env,
        ScriptedCodec::with_frames(5),
        vec![Arc::new(PassthroughSegmenter::new())],
    );

    let job = dispatcher
        .submit_video("198.51.100.4", "passthrough", "clip.mp4", fake_video())
        .await
        .unwrap();
    let state = dispatcher.wait_for_job(job).await.unwrap();

    let JobState::Completed { output } = state else {
        panic!("expected completion, got {state:?}");
    };
    assert_eq!(output, env.config.storage.output_dir.join(format!("{job}.webm")));
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "5 frames");
    assert_eq!(dispatcher.fetch_artifact(job).unwrap(), output);

    // Workspace is gone and the task deregistered itself
    assert_eq!(env.scratch_entries(), 0);
    assert_eq!(dispatcher.running_jobs(), 0);
    assert!(!dispatcher.cancel_job(job));
}

#[tokio::test]
async fn test_three_frame_video_walks_every_stage_until_swept() {
    let env = TestEnv::new(10);
    let dispatcher = dispatcher(
        &env,
        ScriptedCodec::with_frames(3),
        vec![Arc::new(PassthroughSegmenter::new())],
    );
    let mut events = dispatcher.jobs().subscribe();

    let job = dispatcher
        .submit_video("198.51.100.5", "passthrough", "clip.mp4", fake_video())
        .await
        .unwrap();
    let state = dispatcher.wait_for_job(job).await.unwrap();
    let JobState::Completed { output } = state else {
        panic!("expected completion, got {state:?}");
    };

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.id == job {
            seen.push(event.state);
        }
    }
    // Batches of 2 over 3 frames
    assert_eq!(
        seen,
        vec![
            JobState::Queued,
            JobState::Extracting,
            JobState::Processing { progress: 0 },
            JobState::Processing { progress: 66 },
            JobState::Processing { progress: 100 },
            JobState::Encoding,
            JobState::Completed {
                output: output.clone()
            },
        ]
    );
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "3 frames");
    assert_eq!(env.scratch_entries(), 0);

    let sweeper = ArtifactSweeper::new(
        env.config.storage.output_dir.clone(),
        Duration::ZERO,
        Arc::clone(dispatcher.jobs()),
    );
    assert_eq!(sweeper.sweep().await, 1);
    assert!(!output.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_never_overlap_on_the_accelerator() {
    let env = TestEnv::new(50);
    let counter = Arc::new(OverlapCounter::new("isnet-general-use", Duration::from_millis(5)));
    let dispatcher = Arc::new(dispatcher(
        &env,
        ScriptedCodec::with_frames(6),
        vec![counter.clone() as Arc<dyn Segmenter>],
    ));

    let mut jobs = Vec::new();
    for client in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        jobs.push(
            dispatcher
                .submit_video(client, "isnet-general-use", "clip.mov", fake_video())
                .await
                .unwrap(),
        );
    }

    let images: Vec<_> = (0..4)
        .map(|i| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .remove_background(
                        &format!("10.0.1.{i}"),
                        "isnet-general-use",
                        png_bytes(16, 16),
                        &CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    for handle in images {
        let response = handle.await.unwrap().unwrap();
        assert_eq!((response.width, response.height), (16, 16));
    }
    for job in jobs {
        assert!(matches!(
            dispatcher.wait_for_job(job).await.unwrap(),
            JobState::Completed { .. }
        ));
    }

    assert_eq!(counter.max_in_flight(), 1);
    assert_eq!(counter.calls(), 3 * 6 + 4);
    assert_eq!(counter.activations(), counter.deactivations());
    assert!(!dispatcher.arbiter().is_held());
    assert_eq!(dispatcher.arbiter().leases_granted(), 3 + 4);
}

#[tokio::test]
async fn test_cancelled_job_fails_and_cleans_up() {
    let env = TestEnv::new(10);
    let gate = Arc::new(Notify::new());
    let codec = ScriptedCodec {
        frames: 3,
        extract_gate: Some(gate),
        fail_encode: false,
    };
    let dispatcher = dispatcher(&env, codec, vec![Arc::new(PassthroughSegmenter::new())]);

    let job = dispatcher
        .submit_video("198.51.100.9", "passthrough", "clip.mkv", fake_video())
        .await
        .unwrap();
    assert!(matches!(
        dispatcher.status(job).unwrap(),
        JobState::Queued | JobState::Extracting
    ));
    assert!(matches!(
        dispatcher.fetch_artifact(job),
        Err(ServiceError::JobNotReady(_))
    ));

    assert!(dispatcher.cancel_job(job));
    let state = dispatcher.wait_for_job(job).await.unwrap();
    assert_eq!(
        state,
        JobState::Failed {
            reason: "cancelled".to_string()
        }
    );
    assert_eq!(env.scratch_entries(), 0);
    assert!(matches!(
        dispatcher.fetch_artifact(job),
        Err(ServiceError::JobNotReady(_))
    ));
}

#[tokio::test]
async fn test_encode_failure_is_reported_and_lease_returned() {
    let env = TestEnv::new(10);
    let codec = ScriptedCodec {
        frames: 2,
        extract_gate: None,
        fail_encode: true,
    };
    let counter = Arc::new(OverlapCounter::new("u2net", Duration::ZERO));
    let dispatcher = dispatcher(&env, codec, vec![counter.clone() as Arc<dyn Segmenter>]);

    let job = dispatcher
        .submit_video("198.51.100.10", "u2net", "clip.avi", fake_video())
        .await
        .unwrap();
    let JobState::Failed { reason } = dispatcher.wait_for_job(job).await.unwrap() else {
        panic!("expected failure");
    };
    assert!(reason.contains("libvpx-vp9"), "reason was {reason}");

    assert!(!dispatcher.arbiter().is_held());
    assert_eq!(counter.activations(), 1);
    assert_eq!(counter.deactivations(), 1);
    assert!(!env
        .config
        .storage
        .output_dir
        .join(format!("{job}.webm"))
        .exists());
}

#[tokio::test]
async fn test_swept_artifact_becomes_not_found() {
    let env = TestEnv::new(10);
    let dispatcher = dispatcher(
        &env,
        ScriptedCodec::with_frames(1),
        vec![Arc::new(PassthroughSegmenter::new())],
    );
    let job = dispatcher
        .submit_video("198.51.100.11", "passthrough", "clip.webm", fake_video())
        .await
        .unwrap();
    dispatcher.wait_for_job(job).await.unwrap();
    assert!(dispatcher.fetch_artifact(job).is_ok());

    let sweeper = ArtifactSweeper::new(
        env.config.storage.output_dir.clone(),
        Duration::ZERO,
        Arc::clone(dispatcher.jobs()),
    );
    assert_eq!(sweeper.sweep().await, 1);

    assert!(matches!(
        dispatcher.fetch_artifact(job),
        Err(ServiceError::JobNotFound(_))
    ));
    assert!(matches!(dispatcher.status(job), Err(ServiceError::JobNotFound(_))));
}

#[tokio::test]
async fn test_video_and_image_requests_share_the_daily_limit() {
    let env = TestEnv::new(2);
    let dispatcher = dispatcher(
        &env,
        ScriptedCodec::with_frames(1),
        vec![Arc::new(PassthroughSegmenter::new())],
    );
    let cancel = CancellationToken::new();

    dispatcher
        .remove_background("203.0.113.5", "passthrough", png_bytes(4, 4), &cancel)
        .await
        .unwrap();
    let job = dispatcher
        .submit_video("203.0.113.5", "passthrough", "clip.mp4", fake_video())
        .await
        .unwrap();

    let err = dispatcher
        .submit_video("203.0.113.5", "passthrough", "clip.mp4", fake_video())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::AdmissionRejected(AdmissionRejection::DailyLimitExceeded { limit: 2 })
    ));

    dispatcher.wait_for_job(job).await.unwrap();
    assert_eq!(dispatcher.jobs().len(), 1);
}

#[tokio::test]
async fn test_shutdown_cancels_running_jobs() {
    let env = TestEnv::new(10);
    let codec = ScriptedCodec {
        frames: 2,
        extract_gate: Some(Arc::new(Notify::new())),
        fail_encode: false,
    };
    let dispatcher = dispatcher(&env, codec, vec![Arc::new(PassthroughSegmenter::new())]);
    dispatcher.spawn_maintenance();

    let job = dispatcher
        .submit_video("198.51.100.12", "passthrough", "clip.mp4", fake_video())
        .await
        .unwrap();
    assert_eq!(dispatcher.running_jobs(), 1);

    dispatcher.shutdown().await;

    assert_eq!(dispatcher.running_jobs(), 0);
    assert!(matches!(
        dispatcher.status(job).unwrap(),
        JobState::Failed { .. }
    ));
    assert_eq!(env.scratch_entries(), 0);
}

#[tokio::test]
async fn test_health_reflects_load() {
    let env = TestEnv::new(10);
    let dispatcher = dispatcher(
        &env,
        ScriptedCodec::with_frames(1),
        vec![Arc::new(PassthroughSegmenter::new())],
    );
    let job = dispatcher
        .submit_video("198.51.100.13", "passthrough", "clip.mp4", fake_video())
        .await
        .unwrap();
    dispatcher.wait_for_job(job).await.unwrap();

    let health = dispatcher.health();
    assert_eq!(health.status, "ok");
    assert_eq!(health.jobs, 1);
    assert_eq!(health.running_jobs, 0);
    assert!(!health.accelerator_held);

    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["methods"][0], "passthrough");
}
