//! One overlay job and its result records.

use fgb_source::SourceCache;
use overlay_engine::{
    calculate_geography_overlap_with_options, Geography, Metric, MetricSubject, OverlayError,
    OverlayHooks, OverlayOptions,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything needed to compute the metrics of one geography.
#[derive(Debug, Clone)]
pub struct OverlayJob {
    pub geography: Geography,
    pub source_url: String,
    pub source_format: String,
    pub group_by: Option<String>,
    pub stats_columns: Vec<String>,
    pub subject: MetricSubject,
}

impl OverlayJob {
    pub async fn run(
        &self,
        cache: &SourceCache,
        hooks: &dyn OverlayHooks,
        cancellation: CancellationToken,
    ) -> Result<Vec<Metric>, OverlayError> {
        let options = OverlayOptions {
            stats_columns: self.stats_columns.clone(),
            cancellation,
            ..OverlayOptions::default()
        };

        let output = calculate_geography_overlap_with_options(
            &self.geography,
            cache,
            &self.source_url,
            &self.source_format,
            self.group_by.as_deref(),
            hooks,
            &options,
        )
        .await?;

        let metrics = output.to_metrics(self.subject.clone(), &self.source_url);
        info!(metrics = metrics.len(), classes = output.classes.len(), "Job complete");
        Ok(metrics)
    }
}

/// Printed in place of metrics when a job fails.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub error: String,
    pub kind: &'static str,
    pub retryable: bool,
}

impl From<&OverlayError> for JobFailure {
    fn from(err: &OverlayError) -> Self {
        Self {
            error: err.to_string(),
            kind: err.kind(),
            retryable: err.is_retryable(),
        }
    }
}
