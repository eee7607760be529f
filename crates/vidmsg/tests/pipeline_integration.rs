//! End-to-end pipeline scenarios against the assembled service, with
//! scripted engines and a temporary storage root.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;

use vidmsg::config::Config;
use vidmsg::engines::EngineSet;
use vidmsg::engines::testing::{ScriptedDetector, ScriptedRemover, ScriptedSynthesizer};
use vidmsg::errors::EngineError;
use vidmsg::models::{ProgressEventKind, Request, Stage};
use vidmsg::service::VideoMessageService;

const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];
const WAV_BYTES: &[u8] = &[
    b'R', b'I', b'F', b'F', 0, 0, 0, 0, b'W', b'A', b'V', b'E',
];

fn sample_request() -> Request {
    Request {
        image_bytes: Bytes::from_static(PNG_BYTES),
        image_content_type: "image/png".to_string(),
        audio_bytes: Bytes::from_static(WAV_BYTES),
        audio_content_type: "audio/x-wav".to_string(),
        overrides: Default::default(),
    }
}

fn fast_config(root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.storage.root = root.to_path_buf();
    config.pipeline.poll_initial_delay = Duration::from_millis(2);
    config.pipeline.poll_max_delay = Duration::from_millis(10);
    config.pipeline.poll_deadline = Duration::from_secs(3);
    config.pipeline.detection_timeout = Duration::from_secs(2);
    config.pipeline.segmentation_timeout = Duration::from_secs(2);
    config.pipeline.submit_timeout = Duration::from_secs(2);
    config.pipeline.finalize_timeout = Duration::from_secs(2);
    config
}

fn default_engines() -> EngineSet {
    EngineSet {
        detector: Arc::new(ScriptedDetector::succeeding()),
        remover: Arc::new(ScriptedRemover::succeeding()),
        synthesizer: Arc::new(ScriptedSynthesizer::completing()),
    }
}

async fn service_with(
    engines: EngineSet,
    tweak: impl FnOnce(&mut Config),
) -> (VideoMessageService, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    let mut config = fast_config(root.path());
    tweak(&mut config);
    let service = VideoMessageService::new(config, engines).await.unwrap();
    (service, root)
}

// Scenario 1: happy path, no subscribers.
#[tokio::test]
async fn happy_path_completes_with_artifacts_in_every_tier() {
    let (service, _root) = service_with(default_engines(), |_| {}).await;

    let task_id = service.execute_request(sample_request()).unwrap();
    let record = service
        .await_task(task_id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(record.stage, Stage::Completed);
    assert_eq!(record.progress_percent, 100);
    assert!(record.error.is_none());

    let tiers: Vec<&str> = record
        .artifact_paths
        .iter()
        .map(|p| p.split('/').next().unwrap())
        .collect();
    assert_eq!(tiers, vec!["uploads", "uploads", "processed", "processed", "videos"]);

    // Status endpoint sees the same terminal record
    let status = service.get_task_status(task_id).unwrap();
    assert_eq!(status.stage, Stage::Completed);
    assert!(status.finished_at.is_some());
}

// Scenario 2: cancel before the detection slot is acquired.
#[tokio::test]
async fn cancel_while_queued_for_detector_slot() {
    let engines = EngineSet {
        detector: Arc::new(
            ScriptedDetector::succeeding().with_delay(Duration::from_millis(400)),
        ),
        remover: Arc::new(ScriptedRemover::succeeding()),
        synthesizer: Arc::new(ScriptedSynthesizer::completing()),
    };
    let (service, _root) = service_with(engines, |_| {}).await;

    // Saturate both detector slots with long-running tasks
    let blocker_a = service.execute_request(sample_request()).unwrap();
    let blocker_b = service.execute_request(sample_request()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.gpu_snapshot().detector.in_use, 2);

    // The victim queues behind them
    let victim = service.execute_request(sample_request()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(service.gpu_snapshot().detector.queued >= 1);

    assert!(service.cancel_task(victim));
    let record = service
        .await_task(victim, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(record.stage, Stage::Failed);
    assert_eq!(record.error.unwrap().error_kind, "canceled");
    assert!(record.artifact_paths.is_empty());
    assert!(service.storage().artifacts_owned_by(victim).is_empty());
    // The blockers' slots were untouched by the canceled waiter
    assert_eq!(service.gpu_snapshot().detector.in_use, 2);

    for blocker in [blocker_a, blocker_b] {
        let record = service
            .await_task(blocker, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(record.stage, Stage::Completed);
    }
}

// Scenario 3: detector reports an empty person set.
#[tokio::test]
async fn no_person_rolls_back_every_artifact() {
    let engines = EngineSet {
        detector: Arc::new(ScriptedDetector::no_person()),
        remover: Arc::new(ScriptedRemover::succeeding()),
        synthesizer: Arc::new(ScriptedSynthesizer::completing()),
    };
    let (service, _root) = service_with(engines, |_| {}).await;

    let task_id = service.execute_request(sample_request()).unwrap();
    let record = service
        .await_task(task_id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(record.stage, Stage::Failed);
    let failure = record.error.unwrap();
    assert_eq!(failure.error_kind, "no_person");
    assert_eq!(failure.stage_at_failure, Stage::Detection);

    // Uploads for this task removed; nothing in processed or videos
    assert!(service.storage().artifacts_owned_by(task_id).is_empty());
    let stats = service.get_storage_stats();
    assert_eq!(stats.per_tier["uploads"].count, 0);
    assert_eq!(stats.per_tier["processed"].count, 0);
    assert_eq!(stats.per_tier["videos"].count, 0);
}

// Scenario 4: transient submit failure, then success; two running polls
// before done.
#[tokio::test]
async fn transient_engine_failure_recovers_and_completes() {
    let synthesizer = Arc::new(
        ScriptedSynthesizer::completing()
            .with_result_url("https://synth.invalid/results/u-42")
            .push_submit(Err(EngineError::Transport {
                engine: "video_synthesizer".to_string(),
                message: "connection reset".to_string(),
            }))
            .running_polls(2),
    );
    let engines = EngineSet {
        detector: Arc::new(ScriptedDetector::succeeding()),
        remover: Arc::new(ScriptedRemover::succeeding()),
        synthesizer: synthesizer.clone(),
    };
    let (service, _root) = service_with(engines, |_| {}).await;

    let task_id = service.execute_request(sample_request()).unwrap();
    let mut subscription = service.subscribe_progress(task_id, None).unwrap();

    let mut progresses = Vec::new();
    while let Some(event) = subscription.next_event().await {
        if event.kind != ProgressEventKind::Gap {
            progresses.push(event.progress);
        }
    }

    assert!(progresses.iter().any(|p| (70..=80).contains(p)));
    assert_eq!(*progresses.last().unwrap(), 100);

    let record = service
        .await_task(task_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(record.stage, Stage::Completed);
    assert_eq!(synthesizer.submits(), 2);
    assert_eq!(synthesizer.polls(), 3);

    // The final artifact is the local copy of the engine's result
    let video_path = record
        .artifact_paths
        .iter()
        .find(|p| p.starts_with("videos/"))
        .unwrap();
    let bytes = service.storage().get(video_path).await.unwrap();
    assert_eq!(Bytes::from(bytes), synthesizer.result_bytes());
}

// Scenario 5: two concurrent requests, one segmenter slot.
#[tokio::test]
async fn concurrent_requests_never_cohold_the_segmenter_slot() {
    let engines = EngineSet {
        detector: Arc::new(ScriptedDetector::succeeding()),
        remover: Arc::new(
            ScriptedRemover::succeeding().with_delay(Duration::from_millis(120)),
        ),
        synthesizer: Arc::new(ScriptedSynthesizer::completing()),
    };
    let (service, _root) = service_with(engines, |_| {}).await;
    let service = Arc::new(service);

    let a = service.execute_request(sample_request()).unwrap();
    let b = service.execute_request(sample_request()).unwrap();

    // Observe the segmenter continuously while both tasks run
    let max_in_use = Arc::new(AtomicUsize::new(0));
    let observer = {
        let service = service.clone();
        let max_in_use = max_in_use.clone();
        tokio::spawn(async move {
            loop {
                let in_use = service.gpu_snapshot().segmenter.in_use;
                max_in_use.fetch_max(in_use, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
        })
    };

    for task_id in [a, b] {
        let record = service
            .await_task(task_id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(record.stage, Stage::Completed);
    }
    observer.abort();

    assert_eq!(service.gpu_snapshot().segmenter.capacity, 1);
    assert!(max_in_use.load(Ordering::SeqCst) <= 1);
    assert_eq!(service.gpu_snapshot().segmenter.in_use, 0);
}

// Scenario 6: subscriber reconnect with a cursor.
#[tokio::test]
async fn reconnecting_subscriber_resumes_without_duplicates() {
    let engines = EngineSet {
        detector: Arc::new(ScriptedDetector::succeeding()),
        remover: Arc::new(ScriptedRemover::succeeding()),
        synthesizer: Arc::new(ScriptedSynthesizer::completing().running_polls(3)),
    };
    let (service, _root) = service_with(engines, |_| {}).await;

    let task_id = service.execute_request(sample_request()).unwrap();

    // First connection: read a prefix, then drop (disconnect)
    let mut first = service.subscribe_progress(task_id, None).unwrap();
    let mut cursor = 0;
    for _ in 0..5 {
        let event = first.next_event().await.unwrap();
        cursor = event.sequence;
    }
    drop(first);

    let record = service
        .await_task(task_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(record.stage, Stage::Completed);

    // Reconnect with the cursor: strictly later events, in order, no dups
    let mut resumed = service.subscribe_progress(task_id, Some(cursor)).unwrap();
    let mut sequences = Vec::new();
    while let Some(event) = resumed.next_event().await {
        sequences.push(event.sequence);
    }

    assert!(!sequences.is_empty());
    assert_eq!(sequences[0], cursor + 1);
    for pair in sequences.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
}

// Boundary: admission cap rejects, then recovers after a completion.
#[tokio::test]
async fn admission_cap_rejects_then_recovers() {
    let engines = EngineSet {
        detector: Arc::new(
            ScriptedDetector::succeeding().with_delay(Duration::from_millis(150)),
        ),
        remover: Arc::new(ScriptedRemover::succeeding()),
        synthesizer: Arc::new(ScriptedSynthesizer::completing()),
    };
    let (service, _root) = service_with(engines, |config| {
        config.registry.max_active_tasks = 1;
    })
    .await;

    let running = service.execute_request(sample_request()).unwrap();

    let rejected = service.execute_request(sample_request()).unwrap_err();
    assert_eq!(rejected.kind(), "overloaded");

    let record = service
        .await_task(running, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(record.stage, Stage::Completed);

    // One more is admitted now that the cap has room
    let next = service.execute_request(sample_request()).unwrap();
    let record = service
        .await_task(next, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(record.stage, Stage::Completed);
}

// Subscribers of a canceled task observe a failed event with kind canceled.
#[tokio::test]
async fn subscriber_sees_canceled_failure_event() {
    let engines = EngineSet {
        detector: Arc::new(
            ScriptedDetector::succeeding().with_delay(Duration::from_millis(300)),
        ),
        remover: Arc::new(ScriptedRemover::succeeding()),
        synthesizer: Arc::new(ScriptedSynthesizer::completing()),
    };
    let (service, _root) = service_with(engines, |_| {}).await;

    let task_id = service.execute_request(sample_request()).unwrap();
    let mut subscription = service.subscribe_progress(task_id, None).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(service.cancel_task(task_id));

    let mut last = None;
    while let Some(event) = subscription.next_event().await {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.kind, ProgressEventKind::Failed);
    assert!(last.message.starts_with("canceled"));
}

// Restart recovery: the storage index is rebuilt from index.log and completed
// artifacts survive a service restart.
#[tokio::test]
async fn storage_index_survives_service_restart() {
    let root = tempfile::tempdir().unwrap();

    let (task_id, video_path) = {
        let config = fast_config(root.path());
        let service = VideoMessageService::new(config, default_engines())
            .await
            .unwrap();
        let task_id = service.execute_request(sample_request()).unwrap();
        let record = service
            .await_task(task_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(record.stage, Stage::Completed);
        let video = record
            .artifact_paths
            .iter()
            .find(|p| p.starts_with("videos/"))
            .unwrap()
            .clone();
        (task_id, video)
    };

    let config = fast_config(root.path());
    let service = VideoMessageService::new(config, default_engines())
        .await
        .unwrap();
    let artifacts = service.storage().artifacts_owned_by(task_id);
    assert_eq!(artifacts.len(), 5);
    assert!(artifacts.contains(&video_path));
    assert!(service.storage().get(&video_path).await.is_ok());
}
