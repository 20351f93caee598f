//! Wires configuration and collaborators into a ready supervisor.

use std::sync::Arc;

use anyhow::Result;

use crate::config::GatewatchConfig;
use crate::dedup::EventDeduplicator;
use crate::detect::{metric_for, DetectionPipeline, ModelSet, PipelineSettings};
use crate::identity::{IdentityCache, IdentitySource};
use crate::ingest::SourceFactory;
use crate::processor::FrameProcessor;
use crate::sink::EventSink;
use crate::snapshots::BlobStore;
use crate::storage::EventStore;
use crate::stream::{shared_thresholds, StreamSupervisor};

/// External pieces the core depends on.
pub struct Collaborators {
    pub models: ModelSet,
    pub identities: Arc<dyn IdentitySource>,
    pub events: Arc<dyn EventStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub sources: Arc<dyn SourceFactory>,
}

/// Builds the supervisor without starting any camera.
///
/// An identity source that fails here leaves the cache empty: every face is
/// reported as unknown until a reload succeeds.
pub fn build_supervisor(config: &GatewatchConfig, parts: Collaborators) -> Result<StreamSupervisor> {
    let thresholds = shared_thresholds(config.thresholds);
    let identities = Arc::new(IdentityCache::new(parts.identities));
    if let Err(err) = identities.reload() {
        log::error!("identity cache load failed; starting empty: {:#}", err);
    }

    log::info!("models: {}", parts.models.describe());
    let pipeline = DetectionPipeline::new(
        parts.models,
        identities,
        thresholds.clone(),
        metric_for(config.detection.metric),
        PipelineSettings::from(&config.detection),
    );
    let dedup = EventDeduplicator::new(thresholds.clone());
    let sink = EventSink::new(parts.events, parts.blobs)?;
    let processor = Arc::new(FrameProcessor::new(pipeline, dedup, sink));

    StreamSupervisor::new(
        config.cameras.clone(),
        config.timing,
        parts.sources,
        processor,
        thresholds,
        config.pipeline_workers,
    )
}
