//! Geography overlay orchestrator.
//!
//! ```text
//! Initializing ──► ProcessingLayer(0) ──► … ──► ProcessingLayer(n-1) ──► Classifying ──► Done
//!      │                  │                            │                      │
//!      └──────────────────┴────────────► Failed ◄──────┴──────────────────────┘
//! ```
//!
//! Initializing validates the request, opens the base source and loads every
//! base feature into the working set. Each layer is then applied in order
//! with [`clipping::apply`](crate::clipping::apply), and the remaining
//! geometry is classified.

use std::fmt;
use std::sync::Mutex;

use fgb_source::SourceCache;
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::classify::{class_key, classify, OverlayOutput};
use crate::clipping::{self, WorkingFeature, WorkingSet};
use crate::error::{OverlayError, Result};
use crate::geography::{consolidate, ClippingLayerOption, SourceFormat};
use crate::geometry::WorkingGeometry;
use crate::hooks::OverlayHooks;

/// Stage of an overlay computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    Initializing,
    ProcessingLayer(usize),
    Classifying,
    Done,
    Failed,
}

impl OverlayState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for OverlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => f.write_str("initializing"),
            Self::ProcessingLayer(i) => write!(f, "processing layer {}", i),
            Self::Classifying => f.write_str("classifying"),
            Self::Done => f.write_str("done"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Optional settings of an overlay computation.
#[derive(Debug, Clone)]
pub struct OverlayOptions {
    /// Attributes of the base source to summarise per class.
    pub stats_columns: Vec<String>,
    /// Checked before every layer and before classification.
    pub cancellation: CancellationToken,
    /// Merge adjacent DIFFERENCE layers of the same source.
    pub consolidate: bool,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            stats_columns: Vec::new(),
            cancellation: CancellationToken::new(),
            consolidate: true,
        }
    }
}

/// Reports progress, never decreasing and never reaching 100 before the
/// computation completes.
struct ProgressTracker<'a> {
    hooks: &'a dyn OverlayHooks,
    steps: usize,
    last: Mutex<f64>,
}

impl<'a> ProgressTracker<'a> {
    fn new(hooks: &'a dyn OverlayHooks, steps: usize) -> Self {
        Self {
            hooks,
            steps: steps.max(1),
            last: Mutex::new(0.0),
        }
    }

    /// Report that `completed` of the steps are done. The final step is
    /// reported with [`complete`](Self::complete).
    fn step(&self, completed: usize, message: &str) {
        let percent = (100.0 * completed as f64 / (self.steps + 1) as f64).min(99.0);
        self.report(percent, message);
    }

    fn complete(&self) {
        self.report(100.0, "complete");
    }

    fn report(&self, percent: f64, message: &str) {
        let percent = match self.last.lock() {
            Ok(mut last) => {
                *last = last.max(percent);
                *last
            }
            Err(_) => percent,
        };
        self.hooks.progress(percent, message);
    }
}

/// Compute the overlap of the features of `source_url` with `geography`.
///
/// `group_by` names the attribute used to classify base features; without
/// it only the `"*"` total is reported.
pub async fn calculate_geography_overlap(
    geography: &[ClippingLayerOption],
    cache: &SourceCache,
    source_url: &str,
    source_format: &str,
    group_by: Option<&str>,
    hooks: &dyn OverlayHooks,
) -> Result<OverlayOutput> {
    calculate_geography_overlap_with_options(
        geography,
        cache,
        source_url,
        source_format,
        group_by,
        hooks,
        &OverlayOptions::default(),
    )
    .await
}

/// [`calculate_geography_overlap`] with explicit [`OverlayOptions`].
#[instrument(skip_all, fields(source = %source_url, layers = geography.len()))]
pub async fn calculate_geography_overlap_with_options(
    geography: &[ClippingLayerOption],
    cache: &SourceCache,
    source_url: &str,
    source_format: &str,
    group_by: Option<&str>,
    hooks: &dyn OverlayHooks,
    options: &OverlayOptions,
) -> Result<OverlayOutput> {
    let mut state = OverlayState::Initializing;
    let result = run(
        &mut state,
        geography,
        cache,
        source_url,
        source_format,
        group_by,
        hooks,
        options,
    )
    .await;

    match &result {
        Ok(output) => {
            transition(&mut state, OverlayState::Done);
            info!(
                classes = output.classes.len(),
                area_sq_km = output.total().area_sq_km,
                "Overlay complete"
            );
        }
        Err(e) => {
            warn!(state = %state, error = %e, "Overlay failed");
            transition(&mut state, OverlayState::Failed);
        }
    }

    result
}

#[allow(clippy::too_many_arguments)]
async fn run(
    state: &mut OverlayState,
    geography: &[ClippingLayerOption],
    cache: &SourceCache,
    source_url: &str,
    source_format: &str,
    group_by: Option<&str>,
    hooks: &dyn OverlayHooks,
    options: &OverlayOptions,
) -> Result<OverlayOutput> {
    match source_format.parse::<SourceFormat>()? {
        SourceFormat::FlatGeobuf => {}
    }

    let layers = if options.consolidate {
        consolidate(geography)
    } else {
        geography.to_vec()
    };
    if layers.len() != geography.len() {
        debug!(before = geography.len(), after = layers.len(), "Consolidated clipping layers");
    }

    // load, each layer, classify
    let progress = ProgressTracker::new(hooks, layers.len() + 2);
    progress.report(0.0, "Initializing");

    check_cancelled(options)?;
    let mut working = load_base_features(cache, source_url, group_by, hooks).await?;
    progress.step(1, &format!("Loaded {} base features", working.len()));

    for (index, layer) in layers.iter().enumerate() {
        check_cancelled(options)?;
        transition(state, OverlayState::ProcessingLayer(index));

        working = clipping::apply(working, layer, index, cache, hooks).await?;
        progress.step(
            index + 2,
            &format!(
                "Applied layer {}/{} ({} {}): {} features remain",
                index + 1,
                layers.len(),
                layer.op,
                layer.source,
                working.len()
            ),
        );
    }

    check_cancelled(options)?;
    transition(state, OverlayState::Classifying);
    let output = classify(&working, group_by, &options.stats_columns);
    progress.complete();

    Ok(output)
}

async fn load_base_features(
    cache: &SourceCache,
    source_url: &str,
    group_by: Option<&str>,
    hooks: &dyn OverlayHooks,
) -> Result<WorkingSet> {
    let source = cache.get(source_url).await?;
    let mut working = WorkingSet::new();

    let bounds = source.bounds();
    if bounds.is_empty() {
        hooks.log("Base source has no features");
        return Ok(working);
    }

    let estimate = source.estimate(&[bounds]);
    hooks.log(&format!(
        "Base source estimate: {} features, {} bytes in {} requests",
        estimate.features, estimate.requested_bytes, estimate.requests
    ));

    let mut features = source.query(&[bounds]);
    while let Some(feature) = features.try_next().await? {
        let key = class_key(group_by, &feature.properties);
        let geometry = WorkingGeometry::from_geometry(feature.geometry)?;
        let envelope = geometry.envelope().unwrap_or(feature.envelope);
        working.push(WorkingFeature {
            id: feature.id,
            class_key: key,
            properties: feature.properties,
            geometry,
            envelope,
        });
    }

    debug!(features = working.len(), classes = working.class_keys().len(), "Base features loaded");
    Ok(working)
}

fn check_cancelled(options: &OverlayOptions) -> Result<()> {
    if options.cancellation.is_cancelled() {
        return Err(OverlayError::Cancelled);
    }
    Ok(())
}

fn transition(state: &mut OverlayState, next: OverlayState) {
    debug!(from = %state, to = %next, "Overlay state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Mutex<Vec<f64>>);

    impl OverlayHooks for Recorder {
        fn progress(&self, percent: f64, _message: &str) {
            self.0.lock().unwrap().push(percent);
        }
    }

    #[test]
    fn test_progress_is_monotonic() {
        let recorder = Recorder(Mutex::new(Vec::new()));
        let progress = ProgressTracker::new(&recorder, 3);
        progress.report(0.0, "start");
        progress.step(2, "two");
        progress.step(1, "one again");
        progress.step(3, "three");
        progress.complete();

        let values = recorder.0.lock().unwrap().clone();
        assert_eq!(values.len(), 5);
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert!(values[..4].iter().all(|p| *p < 100.0));
        assert_eq!(values[4], 100.0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(OverlayState::ProcessingLayer(2).to_string(), "processing layer 2");
        assert!(OverlayState::Failed.is_terminal());
        assert!(!OverlayState::Classifying.is_terminal());
    }

    #[test]
    fn test_default_options() {
        let options = OverlayOptions::default();
        assert!(options.consolidate);
        assert!(!options.cancellation.is_cancelled());
    }
}
