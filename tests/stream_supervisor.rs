use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gatewatch::config::{CameraSource, MetricKind, StreamTiming, Thresholds, TransportKind};
use gatewatch::detect::{metric_for, FixedEmbedder, FixedLiveness, PipelineSettings, StaticDetector};
use gatewatch::identity::InMemoryIdentitySource;
use gatewatch::ingest::{FrameSource, SourceFactory};
use gatewatch::stream::shared_thresholds;
use gatewatch::{
    ConnectionState, DetectionPipeline, EventDeduplicator, EventSink, Frame, FrameProcessor,
    GatewatchError, IdentityCache, IdentityRecord, InMemoryBlobStore, InMemoryEventStore,
    ModelSet, StreamError, StreamSupervisor,
};

/// Camera ids pick the behaviour: `dead*` refuses, `boom*` panics on read,
/// `slow*` takes 200 ms per frame, `drops-after-N` ends its stream after N
/// frames, anything else streams small frames every 10 ms.
#[derive(Default)]
struct ScriptedFactory {
    opens: Mutex<HashMap<String, Vec<Instant>>>,
    sessions: Arc<SessionCount>,
}

impl ScriptedFactory {
    fn opens(&self, camera_id: &str) -> Vec<Instant> {
        self.opens
            .lock()
            .unwrap()
            .get(camera_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl SourceFactory for ScriptedFactory {
    fn open(
        &self,
        camera: &CameraSource,
        _timing: &StreamTiming,
    ) -> Result<Box<dyn FrameSource>, StreamError> {
        self.opens
            .lock()
            .unwrap()
            .entry(camera.id.clone())
            .or_default()
            .push(Instant::now());
        if camera.id.starts_with("dead") {
            return Err(StreamError::connection("connection refused"));
        }
        let read_delay = if camera.id.starts_with("slow") {
            Duration::from_millis(200)
        } else {
            Duration::from_millis(10)
        };
        Ok(Box::new(TickingSource {
            sequence: 0,
            panics: camera.id.starts_with("boom"),
            read_delay,
            ends_after: camera
                .id
                .strip_prefix("drops-after-")
                .and_then(|n| n.parse().ok()),
            _session: self.sessions.opened(),
        }))
    }
}

/// Counts sources that are open at the same time.
#[derive(Default)]
struct SessionCount {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl SessionCount {
    fn opened(self: &Arc<Self>) -> SessionGuard {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        SessionGuard(Arc::clone(self))
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct SessionGuard(Arc<SessionCount>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TickingSource {
    sequence: u64,
    panics: bool,
    read_delay: Duration,
    ends_after: Option<u64>,
    _session: SessionGuard,
}

impl FrameSource for TickingSource {
    fn connect(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, StreamError> {
        if self.panics {
            panic!("decoder state corrupted");
        }
        if self.ends_after == Some(self.sequence) {
            return Err(StreamError::EndOfStream);
        }
        thread::sleep(self.read_delay);
        self.sequence += 1;
        Ok(Frame::from_rgb(vec![100; 32 * 24 * 3], 32, 24, self.sequence)?)
    }
}

fn camera(id: &str) -> CameraSource {
    CameraSource {
        id: id.to_string(),
        location: format!("{} location", id),
        transport: TransportKind::Mjpeg,
        uri: format!("http://10.0.0.9/{}", id),
        enabled: true,
        target_fps: 5,
    }
}

fn timing() -> StreamTiming {
    StreamTiming {
        stall_timeout: Duration::from_millis(300),
        backoff_min: Duration::from_millis(20),
        backoff_max: Duration::from_millis(400),
        stable_after: Duration::from_secs(60),
    }
}

fn record(id: &str) -> IdentityRecord {
    IdentityRecord {
        person_id: id.to_string(),
        display_name: id.to_uppercase(),
        embeddings: vec![vec![1.0, 0.0, 0.0]],
        active: true,
    }
}

fn supervisor(
    cameras: Vec<CameraSource>,
    factory: Arc<ScriptedFactory>,
    identities: Arc<InMemoryIdentitySource>,
) -> StreamSupervisor {
    supervisor_with(cameras, factory, identities, timing())
}

fn supervisor_with(
    cameras: Vec<CameraSource>,
    factory: Arc<ScriptedFactory>,
    identities: Arc<InMemoryIdentitySource>,
    timing: StreamTiming,
) -> StreamSupervisor {
    let thresholds = shared_thresholds(Thresholds::default());
    let cache = Arc::new(IdentityCache::load(identities).unwrap());
    let models = ModelSet::new(
        Arc::new(StaticDetector::new(Vec::new())),
        Arc::new(FixedEmbedder::new(vec![1.0, 0.0, 0.0])),
        Arc::new(FixedLiveness::new(1.0)),
    );
    let pipeline = DetectionPipeline::new(
        models,
        cache,
        thresholds.clone(),
        metric_for(MetricKind::Cosine),
        PipelineSettings::default(),
    );
    let sink = EventSink::new(
        Arc::new(InMemoryEventStore::new()),
        Arc::new(InMemoryBlobStore::new()),
    )
    .unwrap();
    let processor = Arc::new(FrameProcessor::new(
        pipeline,
        EventDeduplicator::new(thresholds.clone()),
        sink,
    ));
    StreamSupervisor::new(cameras, timing, factory, processor, thresholds, 2).unwrap()
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn failing_camera_backs_off_while_others_stream() {
    let factory = Arc::new(ScriptedFactory::default());
    let sup = supervisor(
        vec![camera("dead-gate"), camera("lobby")],
        factory.clone(),
        Arc::new(InMemoryIdentitySource::default()),
    );
    sup.start().unwrap();

    assert!(wait_for(Duration::from_secs(5), || factory.opens("dead-gate").len() >= 5));
    let opens = factory.opens("dead-gate");
    let gaps: Vec<Duration> = opens.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= Duration::from_millis(20));
    assert!(gaps[1] >= Duration::from_millis(40));
    assert!(gaps[2] >= Duration::from_millis(80));
    assert!(gaps[3] >= Duration::from_millis(160));

    let dead = sup.stream_status("dead-gate").unwrap();
    assert!(dead.consecutive_failures >= 4);
    assert!(matches!(
        dead.state,
        ConnectionState::Backoff | ConnectionState::Connecting
    ));
    assert!(dead.last_error.unwrap().contains("connection refused"));
    assert!(dead.reconnects >= 4);
    assert_eq!(dead.frames_received, 0);

    assert!(wait_for(Duration::from_secs(2), || {
        sup.stream_status("lobby").unwrap().frames_received > 0
    }));
    let lobby = sup.stream_status("lobby").unwrap();
    assert_eq!(lobby.state, ConnectionState::Streaming);
    assert_eq!(lobby.consecutive_failures, 0);
    assert_eq!(factory.opens("lobby").len(), 1);

    sup.shutdown();
    for status in sup.get_stream_status() {
        assert_eq!(status.state, ConnectionState::Disconnected);
    }
}

#[test]
fn frames_beyond_target_rate_are_shed() {
    let factory = Arc::new(ScriptedFactory::default());
    let sup = supervisor(
        vec![camera("lobby")],
        factory,
        Arc::new(InMemoryIdentitySource::default()),
    );
    sup.start().unwrap();

    assert!(wait_for(Duration::from_secs(3), || {
        sup.stream_status("lobby").unwrap().frames_received >= 60
    }));
    let status = sup.stream_status("lobby").unwrap();
    // ~100 fps in, 5 fps admitted.
    assert!(status.frames_dropped > status.frames_admitted);
    assert!(status.frames_admitted >= 1);
    sup.shutdown();
}

#[test]
fn disable_tears_down_and_enable_reconnects() {
    let factory = Arc::new(ScriptedFactory::default());
    let sup = supervisor(
        vec![camera("lobby"), camera("dead-gate")],
        factory.clone(),
        Arc::new(InMemoryIdentitySource::default()),
    );
    sup.start().unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        sup.stream_status("lobby").unwrap().frames_received > 0
    }));

    sup.disable("lobby").unwrap();
    sup.disable("dead-gate").unwrap();
    let lobby = sup.stream_status("lobby").unwrap();
    assert!(!lobby.enabled);
    assert_eq!(lobby.state, ConnectionState::Disconnected);
    assert_eq!(sup.stream_status("dead-gate").unwrap().state, ConnectionState::Disconnected);

    let received = lobby.frames_received;
    thread::sleep(Duration::from_millis(100));
    assert_eq!(sup.stream_status("lobby").unwrap().frames_received, received);

    sup.enable("lobby").unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        sup.stream_status("lobby").unwrap().frames_received > received
    }));
    assert_eq!(factory.opens("lobby").len(), 2);
    assert!(sup.stream_status("lobby").unwrap().enabled);
}

#[test]
fn unknown_camera_is_a_configuration_error() {
    let sup = supervisor(
        vec![camera("lobby")],
        Arc::new(ScriptedFactory::default()),
        Arc::new(InMemoryIdentitySource::default()),
    );
    assert!(matches!(
        sup.enable("garage"),
        Err(GatewatchError::Configuration(_))
    ));
    assert!(matches!(
        sup.disable("garage"),
        Err(GatewatchError::Configuration(_))
    ));
    assert!(sup.stream_status("garage").is_none());
}

#[test]
fn disabled_camera_is_not_started() {
    let factory = Arc::new(ScriptedFactory::default());
    let mut parked = camera("parked");
    parked.enabled = false;
    let sup = supervisor(
        vec![parked, camera("lobby")],
        factory.clone(),
        Arc::new(InMemoryIdentitySource::default()),
    );
    sup.start().unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        sup.stream_status("lobby").unwrap().frames_received > 0
    }));
    assert!(factory.opens("parked").is_empty());
    assert_eq!(sup.stream_status("parked").unwrap().state, ConnectionState::Disconnected);
    assert!(sup.restart_failed().unwrap().is_empty());
}

#[test]
fn threshold_updates_are_validated() {
    let sup = supervisor(
        vec![camera("lobby")],
        Arc::new(ScriptedFactory::default()),
        Arc::new(InMemoryIdentitySource::default()),
    );
    let before = sup.thresholds();

    let invalid = Thresholds {
        liveness_threshold: 1.5,
        ..before
    };
    let err = sup.update_thresholds(invalid).unwrap_err();
    assert!(err.to_string().contains("liveness_threshold"));
    assert_eq!(sup.thresholds(), before);

    let zero_cooldown = Thresholds {
        cooldown: Duration::ZERO,
        ..before
    };
    assert!(sup.update_thresholds(zero_cooldown).is_err());

    let updated = Thresholds {
        recognition_threshold: 0.3,
        liveness_threshold: 0.85,
        cooldown: Duration::from_secs(90),
    };
    sup.update_thresholds(updated).unwrap();
    assert_eq!(sup.thresholds(), updated);

    let status = sup.system_status();
    assert!((status.recognition_threshold - 0.3).abs() < 1e-6);
    assert!((status.liveness_threshold - 0.85).abs() < 1e-6);
    assert_eq!(status.cooldown_secs, 90);
}

#[test]
fn identity_reload_is_atomic_for_readers() {
    let small = vec![record("ada"), record("grace")];
    let large = vec![record("ada"), record("grace"), record("linus")];
    let source = Arc::new(InMemoryIdentitySource::new(small.clone()));
    let sup = Arc::new(supervisor(
        vec![camera("lobby")],
        Arc::new(ScriptedFactory::default()),
        source.clone(),
    ));
    assert_eq!(sup.system_status().identity_generation, 1);

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let sup = Arc::clone(&sup);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last_generation = 0;
                let mut reads = 0u64;
                while !done.load(Ordering::SeqCst) {
                    let status = sup.system_status();
                    let expected = if status.identity_generation % 2 == 0 { 3 } else { 2 };
                    assert_eq!(status.identities, expected);
                    assert!(status.identity_generation >= last_generation);
                    last_generation = status.identity_generation;
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for generation in 2..=40u64 {
        let next = if generation % 2 == 0 { &large } else { &small };
        source.replace(next.clone());
        let loaded = sup.reload_identity_cache().unwrap();
        assert_eq!(loaded, next.len());
    }
    done.store(true, Ordering::SeqCst);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }

    let status = sup.system_status();
    assert_eq!(status.identity_generation, 40);
    assert_eq!(status.identities, 3);
}

#[test]
fn ended_worker_is_restarted() {
    let factory = Arc::new(ScriptedFactory::default());
    let sup = supervisor(
        vec![camera("boom-cam"), camera("lobby")],
        factory.clone(),
        Arc::new(InMemoryIdentitySource::default()),
    );
    sup.start().unwrap();

    let mut restarted = Vec::new();
    assert!(wait_for(Duration::from_secs(3), || {
        restarted = sup.restart_failed().unwrap();
        !restarted.is_empty()
    }));
    assert_eq!(restarted, vec!["boom-cam".to_string()]);
    assert!(wait_for(Duration::from_secs(2), || factory.opens("boom-cam").len() >= 2));
    assert_eq!(factory.opens("lobby").len(), 1);
}

#[test]
fn overlapping_disable_and_enable_keep_one_session() {
    let factory = Arc::new(ScriptedFactory::default());
    let sup = Arc::new(supervisor(
        vec![camera("slow-lobby")],
        factory.clone(),
        Arc::new(InMemoryIdentitySource::default()),
    ));
    sup.start().unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        sup.stream_status("slow-lobby").unwrap().frames_received > 0
    }));

    // The disable blocks on a 200 ms read while the enable arrives.
    let disabler = {
        let sup = Arc::clone(&sup);
        thread::spawn(move || sup.disable("slow-lobby").unwrap())
    };
    thread::sleep(Duration::from_millis(30));
    sup.enable("slow-lobby").unwrap();
    disabler.join().unwrap();
    sup.enable("slow-lobby").unwrap();

    let admitted = sup.stream_status("slow-lobby").unwrap().frames_admitted;
    assert!(wait_for(Duration::from_secs(3), || {
        sup.stream_status("slow-lobby").unwrap().frames_admitted >= admitted + 2
    }));
    let status = sup.stream_status("slow-lobby").unwrap();
    assert!(status.enabled);
    assert_eq!(status.state, ConnectionState::Streaming);
    assert_eq!(factory.sessions.peak(), 1);
    assert!(factory.opens("slow-lobby").len() >= 2);
    sup.shutdown();
}

#[test]
fn dropped_stream_reconnects_with_capped_backoff() {
    let factory = Arc::new(ScriptedFactory::default());
    let sup = supervisor(
        vec![camera("drops-after-3"), camera("lobby")],
        factory.clone(),
        Arc::new(InMemoryIdentitySource::default()),
    );
    sup.start().unwrap();

    // Backoff runs 20, 40, 80, 160, 320, then holds at 400 ms.
    assert!(wait_for(Duration::from_secs(6), || factory.opens("drops-after-3").len() >= 8));
    let opens = factory.opens("drops-after-3");
    let gaps: Vec<Duration> = opens.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, floor_ms) in gaps.iter().zip([20u64, 40, 80, 160, 320, 400, 400]) {
        assert!(*gap >= Duration::from_millis(floor_ms), "{:?} < {} ms", gap, floor_ms);
    }
    assert!(gaps[6] < Duration::from_millis(1_000));

    let flaky = sup.stream_status("drops-after-3").unwrap();
    assert!(flaky.frames_received >= 3 * 7);
    assert!(flaky.consecutive_failures >= 7);
    assert!(flaky.reconnects >= 7);
    assert_eq!(flaky.last_error.as_deref(), Some("stream ended"));
    assert!(matches!(
        flaky.state,
        ConnectionState::Streaming | ConnectionState::Backoff | ConnectionState::Connecting
    ));

    let lobby = sup.stream_status("lobby").unwrap();
    assert_eq!(lobby.state, ConnectionState::Streaming);
    assert_eq!(lobby.consecutive_failures, 0);
    assert_eq!(factory.opens("lobby").len(), 1);
    sup.shutdown();
}

#[test]
fn stable_session_resets_backoff() {
    let factory = Arc::new(ScriptedFactory::default());
    let sup = supervisor_with(
        vec![camera("drops-after-20")],
        factory.clone(),
        Arc::new(InMemoryIdentitySource::default()),
        StreamTiming {
            backoff_min: Duration::from_millis(50),
            backoff_max: Duration::from_secs(2),
            stable_after: Duration::from_millis(100),
            ..timing()
        },
    );
    sup.start().unwrap();

    // Each ~200 ms session outlives stable_after, so every retry waits the
    // minimum 50 ms instead of climbing to 400 ms by the fourth.
    assert!(wait_for(Duration::from_secs(5), || factory.opens("drops-after-20").len() >= 5));
    let opens = factory.opens("drops-after-20");
    let gaps: Vec<Duration> = opens.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[3] < gaps[0] + Duration::from_millis(200));

    let status = sup.stream_status("drops-after-20").unwrap();
    assert!(status.consecutive_failures <= 1);
    assert!(status.reconnects >= 4);
    assert!(status.frames_received >= 20 * 4);
    sup.shutdown();
}
