use std::sync::Arc;
use std::time::{Duration, Instant};

use gatewatch::config::{CameraSource, MetricKind, Thresholds, TransportKind};
use gatewatch::detect::{
    metric_for, FaceDetector, FixedEmbedder, FixedLiveness, PipelineSettings, SharedThresholds,
    StaticDetector,
};
use gatewatch::identity::InMemoryIdentitySource;
use gatewatch::stream::shared_thresholds;
use gatewatch::{
    BoundingBox, DetectionPipeline, EventDeduplicator, EventSink, EventStore, Frame,
    FrameProcessor, IdentityCache, IdentityRecord, InMemoryBlobStore, InMemoryEventStore,
    ModelError, ModelSet,
};

const BASE_TS: u64 = 1_772_374_953_500;
const ALICE: [f32; 4] = [0.9, 0.1, 0.3, 0.2];

struct Harness {
    processor: FrameProcessor,
    events: Arc<InMemoryEventStore>,
    blobs: Arc<InMemoryBlobStore>,
    thresholds: SharedThresholds,
}

fn camera(id: &str, location: &str) -> CameraSource {
    CameraSource {
        id: id.to_string(),
        location: location.to_string(),
        transport: TransportKind::Mjpeg,
        uri: format!("stub://{}", id),
        enabled: true,
        target_fps: 5,
    }
}

fn alice() -> IdentityRecord {
    IdentityRecord {
        person_id: "p-alice".to_string(),
        display_name: "Alice".to_string(),
        embeddings: vec![ALICE.to_vec()],
        active: true,
    }
}

fn face_box() -> BoundingBox {
    BoundingBox::new(100, 60, 120, 120, 0.95)
}

fn harness_with(detector: Arc<dyn FaceDetector>, probe: Vec<f32>, liveness: f32) -> Harness {
    let thresholds = shared_thresholds(Thresholds::default());
    let identities = Arc::new(
        IdentityCache::load(Arc::new(InMemoryIdentitySource::new(vec![alice()])))
            .expect("load identities"),
    );
    let models = ModelSet::new(
        detector,
        Arc::new(FixedEmbedder::new(probe)),
        Arc::new(FixedLiveness::new(liveness)),
    );
    let pipeline = DetectionPipeline::new(
        models,
        identities,
        thresholds.clone(),
        metric_for(MetricKind::Cosine),
        PipelineSettings::default(),
    );
    let events = Arc::new(InMemoryEventStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());
    let sink = EventSink::new(events.clone(), blobs.clone()).expect("sink");
    let processor = FrameProcessor::new(
        pipeline,
        EventDeduplicator::new(thresholds.clone()),
        sink,
    );
    Harness {
        processor,
        events,
        blobs,
        thresholds,
    }
}

fn harness(probe: Vec<f32>, liveness: f32) -> Harness {
    harness_with(
        Arc::new(StaticDetector::new(vec![face_box()])),
        probe,
        liveness,
    )
}

fn frame_at(sequence: u64, captured_at_ms: u64) -> Frame {
    Frame::from_rgb(vec![128; 320 * 240 * 3], 320, 240, sequence)
        .expect("frame")
        .with_capture_time(captured_at_ms, Instant::now())
}

#[test]
fn known_person_is_recorded_once_per_cooldown() {
    let h = harness(ALICE.to_vec(), 0.95);
    let cam = camera("front-door", "Main Entrance");

    // 10 frames over 3 seconds at 5 fps.
    let mut committed = Vec::new();
    for i in 0..10u64 {
        committed.extend(h.processor.process(&cam, &frame_at(i, BASE_TS + i * 300)));
    }
    assert_eq!(committed.len(), 1);

    let event = &committed[0];
    assert_eq!(event.camera_id, "front-door");
    assert_eq!(event.location, "Main Entrance");
    assert_eq!(event.person_id.as_deref(), Some("p-alice"));
    assert_eq!(event.display_name.as_deref(), Some("Alice"));
    assert!(!event.is_unknown);
    assert!(!event.spoofing_detected);
    assert!(event.embedding_distance.unwrap() < 1e-4);
    assert!(event.confidence.unwrap() > 0.99);
    assert!(!event.snapshot_missing);
    assert_eq!(event.timestamp_ms, BASE_TS);
    assert_eq!(event.request_source, "webcam");

    let stats = h.processor.stats();
    assert_eq!(stats.frames, 10);
    assert_eq!(stats.candidates, 10);
    assert_eq!(stats.suppressed, 9);
    assert_eq!(stats.committed, 1);

    // Just past the window the same person is recorded again.
    let later = h.processor.process(&cam, &frame_at(10, BASE_TS + 30_001));
    assert_eq!(later.len(), 1);
    assert_eq!(h.events.events().len(), 2);
    assert!(later[0].id > committed[0].id);
}

#[test]
fn low_liveness_records_spoof_without_identity() {
    let h = harness(ALICE.to_vec(), 0.062);
    let cam = camera("front-door", "Main Entrance");

    let events = h.processor.process(&cam, &frame_at(1, BASE_TS));
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert!(event.spoofing_detected);
    assert_eq!(event.person_id, None);
    assert_eq!(event.display_name, None);
    assert_eq!(event.confidence, None);
    assert_eq!(event.embedding_distance, None);
    assert!(!event.is_unknown);
    assert_eq!(event.spoofing_reason.as_deref(), Some("liveness check failed"));
    assert_eq!(event.spoofing_type.as_deref(), Some("print_or_screen"));
    assert!((event.liveness_score - 0.062).abs() < 1e-6);

    let keys = h.blobs.keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("spoofing/2026-03-01/front-door/"));

    // Repeated spoof attempts share one cooldown bucket.
    assert!(h
        .processor
        .process(&cam, &frame_at(2, BASE_TS + 1_000))
        .is_empty());
}

#[test]
fn unmatched_face_is_recorded_as_unknown() {
    let h = harness(vec![-0.1, 0.9, -0.4, 0.1], 0.95);
    let cam = camera("side-gate", "Side Gate");

    let events = h.processor.process(&cam, &frame_at(1, BASE_TS));
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert!(event.is_unknown);
    assert!(!event.spoofing_detected);
    assert_eq!(event.person_id, None);
    assert_eq!(event.confidence, None);
    let distance = event.embedding_distance.expect("nearest distance reported");
    assert!(distance >= 0.4);

    let keys = h.blobs.keys();
    assert!(keys[0].starts_with("events/2026-03-01/side-gate/unknown/"));
}

#[test]
fn cooldown_is_tracked_per_camera() {
    let h = harness(ALICE.to_vec(), 0.95);
    let front = camera("front-door", "Main Entrance");
    let back = camera("back-door", "Back Entrance");

    assert_eq!(h.processor.process(&front, &frame_at(1, BASE_TS)).len(), 1);
    assert_eq!(h.processor.process(&back, &frame_at(1, BASE_TS + 200)).len(), 1);
    assert!(h
        .processor
        .process(&front, &frame_at(2, BASE_TS + 400))
        .is_empty());

    let recorded = h.events.recent_events(10).unwrap();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].camera_id, "back-door");
    assert_eq!(recorded[1].camera_id, "front-door");
}

#[test]
fn raised_liveness_threshold_applies_to_next_frame() {
    let h = harness(ALICE.to_vec(), 0.75);
    let cam = camera("front-door", "Main Entrance");

    let first = h.processor.process(&cam, &frame_at(1, BASE_TS));
    assert!(!first[0].spoofing_detected);

    {
        let mut guard = h.thresholds.write().unwrap();
        guard.liveness_threshold = 0.9;
    }
    let second = h.processor.process(&cam, &frame_at(2, BASE_TS + 100));
    assert_eq!(second.len(), 1);
    assert!(second[0].spoofing_detected);
}

#[test]
fn undersized_or_unconfident_faces_are_ignored() {
    let detector = Arc::new(StaticDetector::new(vec![
        BoundingBox::new(10, 10, 30, 30, 0.99),
        BoundingBox::new(150, 60, 120, 120, 0.2),
    ]));
    let h = harness_with(detector, ALICE.to_vec(), 0.95);
    let cam = camera("front-door", "Main Entrance");

    assert!(h.processor.process(&cam, &frame_at(1, BASE_TS)).is_empty());
    assert_eq!(h.processor.stats().candidates, 0);
}

struct BrokenDetector;

impl FaceDetector for BrokenDetector {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn detect_faces(&self, _frame: &Frame) -> Result<Vec<BoundingBox>, ModelError> {
        Err(ModelError::new("detector", "inference session lost"))
    }
}

#[test]
fn model_failure_skips_frame_and_keeps_going() {
    let h = harness_with(Arc::new(BrokenDetector), ALICE.to_vec(), 0.95);
    let cam = camera("front-door", "Main Entrance");

    for i in 0..3 {
        assert!(h.processor.process(&cam, &frame_at(i, BASE_TS + i * 200)).is_empty());
    }
    let stats = h.processor.stats();
    assert_eq!(stats.frames, 3);
    assert_eq!(stats.model_errors, 3);
    assert!(h.events.events().is_empty());
}

#[test]
fn cooldown_window_follows_threshold_updates() {
    let h = harness(ALICE.to_vec(), 0.95);
    let cam = camera("front-door", "Main Entrance");

    assert_eq!(h.processor.process(&cam, &frame_at(1, BASE_TS)).len(), 1);
    {
        let mut guard = h.thresholds.write().unwrap();
        guard.cooldown = Duration::from_secs(2);
    }
    assert_eq!(
        h.processor
            .process(&cam, &frame_at(2, BASE_TS + 2_500))
            .len(),
        1
    );
}
