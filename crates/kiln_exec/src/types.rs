//! Shared types for build execution

use crate::graph::StepId;
use kiln_core::ResultStatus;
use kiln_utils::{CacheError, HashError, StoreError};
use std::collections::HashMap;
use thiserror::Error;

/**
 * Errors that can occur while assembling or preparing a build
 */
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Cache error: {0}")]
    CacheError(#[from] CacheError),

    #[error("Hash error: {0}")]
    HashError(#[from] HashError),

    #[error("Failed to access build directory: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to serialize index file: {0}")]
    SerializeError(#[from] serde_json::Error),

    #[error("Failed to create worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Step {0} was not found in the build graph")]
    StepNotFound(StepId),

    #[error("Step {0} is not a list step and cannot hold children")]
    NotAList(StepId),

    #[error("Step {0} cannot depend on itself")]
    SelfDependency(StepId),
}

/// What a builder run does with its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Execute every step, reusing cached results where possible
    Build,
    /// Forget the cached results of the graph's commands
    Clean,
    /// Forget the cached results and delete every output object
    CleanAndDelete,
}

/**
 * Number of command steps that reached each terminal status in a run
 */
#[derive(Debug, Clone, Default)]
pub struct StepCounter {
    counts: HashMap<ResultStatus, usize>,
}

impl StepCounter {
    pub fn add(&mut self, status: ResultStatus) {
        *self.counts.entry(status).or_default() += 1;
    }

    pub fn get(&self, status: ResultStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }

    pub fn built_count(&self) -> usize {
        self.get(ResultStatus::Successful)
    }

    pub fn up_to_date_count(&self) -> usize {
        self.get(ResultStatus::NotTriggeredWasSuccessful)
    }

    pub fn failed_count(&self) -> usize {
        self.get(ResultStatus::Failed) + self.get(ResultStatus::NotTriggeredPrerequisiteFailed)
    }

    pub fn success(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "Build finished in {} steps. Command results: {} succeeded, {} up-to-date, {} failed, {} not triggered due to previous failure.",
            self.total(),
            self.get(ResultStatus::Successful),
            self.get(ResultStatus::NotTriggeredWasSuccessful),
            self.get(ResultStatus::Failed),
            self.get(ResultStatus::NotTriggeredPrerequisiteFailed),
        )
    }
}
