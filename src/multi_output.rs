//! Multi-output management
//!
//! Builds one [`Pipeline`] per configured output. All pipelines share a
//! single channel arbiter, fence registry, and recovery manager, so a
//! channel latched on one output is never handed to another.

use log::{info, warn};
use std::collections::BTreeMap;

use crate::arbiter::GlobalResourceMap;
use crate::config::DisplayConfig;
use crate::error::{PipelineError, PipelineId, Result};
use crate::pipeline::{Collaborators, Pipeline, PipelineStats};
use crate::power::PowerState;

pub struct MultiOutputManager {
    pipelines: BTreeMap<PipelineId, Pipeline>,
    deps: Collaborators,
}

impl MultiOutputManager {
    /// Start every pipeline in `config`. Pipelines started before a failure
    /// are shut down again.
    pub fn new(config: &DisplayConfig, deps: Collaborators) -> Result<Self> {
        let mut pipelines = BTreeMap::new();
        for pipeline_config in &config.pipelines {
            let pipeline = Pipeline::new(pipeline_config, config, deps.clone())?;
            pipelines.insert(pipeline_config.id, pipeline);
        }
        info!("{} output pipelines running", pipelines.len());
        Ok(Self { pipelines, deps })
    }

    pub fn get(&self, id: PipelineId) -> Result<&Pipeline> {
        self.pipelines
            .get(&id)
            .ok_or(PipelineError::UnknownPipeline(id))
    }

    pub fn ids(&self) -> Vec<PipelineId> {
        self.pipelines.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pipeline> {
        self.pipelines.values()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.deps
    }

    /// Copy of the shared channel ownership map
    pub fn resource_map(&self) -> GlobalResourceMap {
        self.deps.arbiter.snapshot()
    }

    pub fn stats(&self) -> BTreeMap<PipelineId, PipelineStats> {
        self.pipelines
            .iter()
            .map(|(id, p)| (*id, p.stats()))
            .collect()
    }

    /// Apply `state` to every pipeline. Every pipeline is attempted; the
    /// first error is returned.
    pub fn set_power_all(&self, state: PowerState) -> Result<()> {
        let mut first_error = None;
        for pipeline in self.pipelines.values() {
            if let Err(e) = pipeline.set_power(state) {
                warn!("pipeline {} refused {:?}: {}", pipeline.id(), state, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Re-initialize every pipeline left in the fatal state
    pub fn recover_fatal(&self) -> Vec<(PipelineId, Result<()>)> {
        self.pipelines
            .values()
            .filter(|p| p.is_fatal())
            .map(|p| (p.id(), p.reinit()))
            .collect()
    }

    pub fn shutdown_all(&self) {
        for pipeline in self.pipelines.values() {
            pipeline.shutdown();
        }
    }
}

impl Drop for MultiOutputManager {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}
