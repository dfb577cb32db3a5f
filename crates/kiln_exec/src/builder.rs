use crate::command::Command;
use crate::context::CancellationToken;
use crate::graph::{BuildGraph, StepId};
use crate::monitor::{IoConflict, IoMonitor};
use crate::scheduler::{Scheduler, compute_cache_key};
use crate::types::{ExecError, Mode, StepCounter};
use kiln_core::{BuildResultCode, BuilderConfig, CommandResult, ObjectId, ResultStatus};
use kiln_utils::{FileObjectDatabase, FileVersionTracker, ObjectDatabase, ResultCache, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Version of the on-disk layout; a build directory with another version is erased
pub const EXPECTED_VERSION: u32 = 1;

const VERSION_FILE: &str = "version";

/**
 * Owns a build graph and runs it against an object database.
 */
pub struct Builder {
    config: BuilderConfig,
    graph: BuildGraph,
    store: Arc<dyn ObjectDatabase>,
    results: Mutex<ResultCache>,
    versions: FileVersionTracker,
    monitor: IoMonitor,
    cancellation: CancellationToken,
    counter: StepCounter,
    thread_count: usize,
}

impl Builder {
    /**
     * Create a builder storing objects under the configured build path
     */
    pub fn new(config: BuilderConfig) -> Result<Self, ExecError> {
        let store = FileObjectDatabase::open(&config.build_path)?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /**
     * Create a builder on top of an existing object database. Cached
     * results still live under the configured build path.
     */
    pub fn with_store(config: BuilderConfig, store: Arc<dyn ObjectDatabase>) -> Self {
        let results = ResultCache::new(&config.build_path);
        let thread_count = config.effective_thread_count();
        Self {
            config,
            graph: BuildGraph::new(),
            store,
            results: Mutex::new(results),
            versions: FileVersionTracker::new(),
            monitor: IoMonitor::new(),
            cancellation: CancellationToken::new(),
            counter: StepCounter::default(),
            thread_count,
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Number of worker threads of the next run; at least one
    pub fn set_thread_count(&mut self, thread_count: usize) {
        self.thread_count = thread_count.max(1);
    }

    pub fn root(&self) -> StepId {
        self.graph.root()
    }

    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut BuildGraph {
        &mut self.graph
    }

    /**
     * Add a command build step to the root list
     */
    pub fn add_command<C: Command + 'static>(&mut self, command: C) -> StepId {
        let root = self.graph.root();
        self.graph.push_command(root, Arc::new(command), false)
    }

    pub fn link(&mut self, prerequisite: StepId, dependent: StepId) -> Result<(), ExecError> {
        self.graph.link(prerequisite, dependent)
    }

    pub fn status(&self, step: StepId) -> ResultStatus {
        self.graph.status(step)
    }

    pub fn result(&self, step: StepId) -> Option<&CommandResult> {
        self.graph.result(step)
    }

    pub fn store(&self) -> &dyn ObjectDatabase {
        self.store.as_ref()
    }

    /// Counts of the last run
    pub fn step_counter(&self) -> &StepCounter {
        &self.counter
    }

    /// Concurrent accesses seen during the last run
    pub fn io_conflicts(&self) -> Vec<IoConflict> {
        self.monitor.conflicts()
    }

    /**
     * Token cancelling the current run; clone it before calling `run` to
     * cancel from another thread.
     */
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel_build(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /**
     * Evict every cached result that read one of the modified inputs
     * (matched against the url path). Returns the number evicted.
     */
    pub fn reset_cache(&mut self, modified: &BTreeSet<String>) -> Result<usize, ExecError> {
        for path in modified {
            self.versions.forget(Path::new(path));
        }
        let evicted = self.lock_results().evict_referencing(modified)?;
        debug!(evicted, "reset cached results of modified inputs");
        Ok(evicted)
    }

    /// Remove every step and start over with an empty root
    pub fn reset(&mut self) {
        self.graph = BuildGraph::new();
        self.counter.clear();
        self.monitor.clear();
    }

    /**
     * Write the content outputs of the last run as a JSON map from url
     * path to object id. With `merge`, entries of an existing file are kept
     * unless overwritten.
     */
    pub fn write_index_file(&self, merge: bool) -> Result<PathBuf, ExecError> {
        let path = self.config.build_path.join(&self.config.index_name);

        let mut entries: BTreeMap<String, ObjectId> = BTreeMap::new();
        if merge && path.exists() {
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str(&content) {
                Ok(existing) => entries = existing,
                Err(e) => warn!(path = %path.display(), error = %e, "replacing unreadable index file"),
            }
        }

        for (url, id) in self.graph.output_objects() {
            if url.is_content() {
                entries.insert(url.path, id);
            }
        }

        fs::create_dir_all(&self.config.build_path)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(&entries)?)?;
        fs::rename(&tmp_path, &path)?;

        info!(path = %path.display(), entries = entries.len(), "wrote index file");
        Ok(path)
    }

    /**
     * Run the graph. Errors never escape: anything that prevents the run
     * is logged and reported as `Failed`.
     */
    pub fn run(&mut self, mode: Mode) -> BuildResultCode {
        self.cancellation.reset();
        self.counter.clear();
        self.monitor.clear();

        if let Err(e) = self.prepare_build_dir() {
            error!(build_path = %self.config.build_path.display(), error = %e, "failed to prepare the build directory");
            return BuildResultCode::Failed;
        }

        self.graph.reset_for_run();

        match mode {
            Mode::Build => self.build(),
            Mode::Clean => self.clean(false),
            Mode::CleanAndDelete => self.clean(true),
        }
    }

    fn build(&mut self) -> BuildResultCode {
        let start = Instant::now();

        for (step, url) in self.graph.link_content_references() {
            if self.store.index_get(&url.path).is_none() {
                warn!(step = %self.graph.title(step), input = %url, "content input is not produced by any step and is missing from the index map");
            }
        }

        let name = self.config.builder_name.clone();
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.thread_count)
            .thread_name(move |index| format!("{name}-{index}"))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                error!(error = %ExecError::from(e), "failed to start the build");
                return BuildResultCode::Failed;
            }
        };

        info!(steps = self.graph.len(), threads = self.thread_count, "starting build");

        let graph = std::mem::take(&mut self.graph);
        let scheduler = Scheduler::new(
            graph,
            self.store.as_ref(),
            &self.versions,
            &self.results,
            &self.monitor,
            &self.cancellation,
        );
        scheduler.run(&pool);
        let (graph, counter) = scheduler.finish();
        self.graph = graph;
        self.counter = counter;

        let summary = self.counter.summary();
        let code = if self.cancellation.is_cancelled() || self.counter.get(ResultStatus::Cancelled) > 0 {
            BuildResultCode::Cancelled
        } else if self.counter.success() {
            BuildResultCode::Successful
        } else {
            BuildResultCode::Failed
        };

        match code {
            BuildResultCode::Successful => info!(elapsed = ?start.elapsed(), "{}", summary),
            BuildResultCode::Cancelled => warn!(elapsed = ?start.elapsed(), "Build cancelled. {}", summary),
            BuildResultCode::Failed => error!(elapsed = ?start.elapsed(), "{}", summary),
        }
        code
    }

    /**
     * Forget the cached results of every command; with `delete` also
     * remove their content outputs from the object database and the index.
     */
    fn clean(&self, delete: bool) -> BuildResultCode {
        let mut cleaned = 0;
        let steps: Vec<StepId> = self.graph.command_steps().collect();

        for step in steps {
            let Some(command) = self.graph.node(step).command().cloned() else {
                continue;
            };
            let key = match compute_cache_key(command.as_ref(), self.store.as_ref(), &self.versions) {
                Ok((key, _)) => key,
                Err(e) => {
                    warn!(step = %self.graph.title(step), error = %e, "cannot compute the cache key; skipping");
                    continue;
                }
            };

            let mut results = self.lock_results();
            if delete {
                match results.get(&key) {
                    Ok(Some(result)) => self.delete_outputs(&result),
                    Ok(None) => {}
                    Err(e) => warn!(step = %self.graph.title(step), error = %e, "cannot read cached result"),
                }
            }
            match results.invalidate(&key) {
                Ok(()) => cleaned += 1,
                Err(e) => warn!(step = %self.graph.title(step), error = %e, "failed to remove cached result"),
            }
        }

        info!(cleaned, delete, "cleaned build results");
        BuildResultCode::Successful
    }

    fn delete_outputs(&self, result: &CommandResult) {
        for (url, id) in result.output_objects.iter().filter(|(url, _)| url.is_content()) {
            if self.store.index_get(&url.path) == Some(*id)
                && let Err(e) = self.store.index_remove(&url.path)
            {
                warn!(output = %url, error = %e, "failed to remove index entry");
            }
            match self.store.delete(id) {
                Ok(()) | Err(StoreError::MissingObject(_)) => {}
                Err(e) => warn!(output = %url, error = %e, "failed to delete output object"),
            }
        }
    }

    /**
     * Erase the object database and cached results when they were written
     * by another version of the layout, then stamp the current version.
     */
    fn prepare_build_dir(&self) -> Result<(), ExecError> {
        let build_path = &self.config.build_path;
        fs::create_dir_all(build_path)?;

        let version_path = build_path.join(VERSION_FILE);
        let found = fs::read_to_string(&version_path)
            .ok()
            .and_then(|content| content.trim().parse::<u32>().ok());

        let stale = match found {
            Some(version) => version != EXPECTED_VERSION,
            None => {
                !self.store.objects()?.is_empty()
                    || !self.store.index_entries().is_empty()
                    || !self.lock_results().cached_keys()?.is_empty()
            }
        };

        if stale {
            warn!(found = ?found, expected = EXPECTED_VERSION, "build database version mismatch; erasing it");
            for id in self.store.objects()? {
                self.store.delete(&id)?;
            }
            for path in self.store.index_entries().into_keys() {
                self.store.index_remove(&path)?;
            }
            self.lock_results().clear()?;
        }

        if found != Some(EXPECTED_VERSION) {
            fs::write(&version_path, EXPECTED_VERSION.to_string())?;
        }
        Ok(())
    }

    fn lock_results(&self) -> MutexGuard<'_, ResultCache> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
