use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    EnhancedPipeline, PipelineDescriptor, PipelineError, PipelinesConfig, StandardPipeline,
    VisionPipeline,
};

/// Result of warming up one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupOutcome {
    pub pipeline_id: String,
    pub loaded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmupReport {
    pub results: Vec<WarmupOutcome>,
}

impl WarmupReport {
    pub fn all_loaded(&self) -> bool {
        self.results.iter().all(|r| r.loaded)
    }

    pub fn failures(&self) -> impl Iterator<Item = &WarmupOutcome> {
        self.results.iter().filter(|r| !r.loaded)
    }
}

/// Process-wide table of pipelines keyed by id.
///
/// Cheap to share behind an `Arc`; lookups take a read lock and clone the
/// pipeline handle so no lock is held during inference.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: RwLock<BTreeMap<String, Arc<dyn VisionPipeline>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the standard and enhanced pipelines.
    pub fn with_defaults(cfg: &PipelinesConfig) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(StandardPipeline::new(&cfg.standard)));
        registry.register(Arc::new(EnhancedPipeline::new(&cfg.enhanced)));
        registry
    }

    /// Adds a pipeline under its descriptor id, replacing any previous entry.
    pub fn register(&self, pipeline: Arc<dyn VisionPipeline>) {
        let id = pipeline.descriptor().id;
        let mut guard = self
            .pipelines
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.insert(id.clone(), pipeline).is_some() {
            warn!(pipeline = %id, "replaced previously registered pipeline");
        } else {
            info!(pipeline = %id, "registered pipeline");
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn VisionPipeline>, PipelineError> {
        let guard = self
            .pipelines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownPipeline {
                requested: id.to_string(),
                available: guard.keys().cloned().collect(),
            })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pipelines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(id)
    }

    /// Sorted pipeline ids.
    pub fn ids(&self) -> Vec<String> {
        self.pipelines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Descriptors of every registered pipeline, loaded or not, sorted by id.
    pub fn list(&self) -> Vec<PipelineDescriptor> {
        self.handles().iter().map(|p| p.descriptor()).collect()
    }

    /// Loads the requested pipelines (all when `ids` is `None`) in parallel.
    ///
    /// Each pipeline is reported independently. Unknown ids show up as failures.
    pub fn warmup(&self, ids: Option<&[String]>) -> WarmupReport {
        let targets: Vec<(String, Result<Arc<dyn VisionPipeline>, PipelineError>)> = match ids {
            Some(ids) => ids.iter().map(|id| (id.clone(), self.get(id))).collect(),
            None => self
                .handles()
                .into_iter()
                .map(|p| (p.descriptor().id, Ok(p)))
                .collect(),
        };

        let results = targets
            .into_par_iter()
            .map(|(pipeline_id, handle)| {
                let outcome = handle.and_then(|p| p.warmup());
                match outcome {
                    Ok(()) => WarmupOutcome {
                        pipeline_id,
                        loaded: true,
                        error: None,
                    },
                    Err(err) => {
                        warn!(pipeline = %pipeline_id, error = %err, "warm-up failed");
                        WarmupOutcome {
                            pipeline_id,
                            loaded: false,
                            error: Some(err.to_string()),
                        }
                    }
                }
            })
            .collect();
        WarmupReport { results }
    }

    fn handles(&self) -> Vec<Arc<dyn VisionPipeline>> {
        self.pipelines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }
}
