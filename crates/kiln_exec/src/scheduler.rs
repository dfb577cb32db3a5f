//! Event-driven execution of a build graph on a rayon pool.
//!
//! All graph bookkeeping happens under one lock: workers only hold it to
//! turn the outcome of a job into status changes and follow-up jobs.
//! Command bodies run with the lock released.

use crate::command::{Command, CommandOutcome, SharedCommand, compute_parameter_hash};
use crate::context::{CancellationToken, ExecuteContext, compute_input_hash};
use crate::graph::{BuildGraph, StepId};
use crate::monitor::IoMonitor;
use crate::types::StepCounter;
use kiln_core::{CommandResult, LogEntry, LogLevel, ObjectId, ObjectUrl, ResultStatus, UrlType};
use kiln_utils::{FileVersionTracker, HashError, ObjectDatabase, ParameterWriter, ResultCache, StoreError};
use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

/**
 * Cache key of a command: its parameter hash followed by the current
 * version of every static input. Also returns those versions.
 */
pub(crate) fn compute_cache_key(
    command: &dyn Command,
    store: &dyn ObjectDatabase,
    versions: &FileVersionTracker,
) -> Result<(ObjectId, BTreeMap<ObjectUrl, ObjectId>), HashError> {
    let parameter_hash = compute_parameter_hash(command)?;
    let input_versions: BTreeMap<ObjectUrl, ObjectId> = command
        .input_dependencies()
        .into_iter()
        .map(|url| {
            let version = compute_input_hash(store, versions, &url);
            (url, version)
        })
        .collect();

    let mut writer = ParameterWriter::new();
    writer.write_id(&parameter_hash);
    for (url, version) in &input_versions {
        writer.write_str(&url.to_string());
        writer.write_id(version);
    }
    Ok((writer.finish(), input_versions))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Command type and declared urls of a failed command
fn failure_context(command: &dyn Command) -> String {
    let join = |urls: Vec<ObjectUrl>| {
        urls.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "{} failed (inputs: [{}], outputs: [{}])",
        command.type_name(),
        join(command.input_dependencies()),
        join(command.output_urls())
    )
}

/// Status of a step that reused the outcome of an identical command
fn follower_status(owner: ResultStatus) -> ResultStatus {
    if owner.is_success() {
        ResultStatus::NotTriggeredWasSuccessful
    } else {
        owner
    }
}

/// Status of a list or spawner once every child is terminal
fn aggregate<I: IntoIterator<Item = ResultStatus>>(children: I) -> ResultStatus {
    let mut status = ResultStatus::Successful;
    for child in children {
        if child == ResultStatus::Cancelled {
            return ResultStatus::Cancelled;
        }
        if child.is_failure() {
            status = ResultStatus::Failed;
        }
    }
    status
}

enum Event {
    Ready(StepId),
    Finished(StepId, ResultStatus, Option<CommandResult>),
}

enum Job {
    Execute(StepId, SharedCommand),
    CompleteSpawner(StepId),
}

struct InFlight {
    owner: StepId,
    followers: Vec<StepId>,
}

struct SchedState {
    graph: BuildGraph,
    /// Unfinished prerequisites, plus one until the parent has started
    blockers: Vec<usize>,
    /// Unfinished children of a running list or spawner
    pending_children: Vec<usize>,
    owned_keys: HashMap<StepId, ObjectId>,
    in_flight: HashMap<ObjectId, InFlight>,
    finished_keys: HashMap<ObjectId, (ResultStatus, Option<CommandResult>)>,
    counter: StepCounter,
}

impl SchedState {
    fn new(graph: BuildGraph) -> Self {
        let len = graph.capacity_len();
        let mut blockers = vec![0; len];
        for id in graph.step_ids() {
            blockers[id.index()] =
                graph.prerequisites(id).count() + usize::from(graph.parent(id).is_some());
        }

        Self {
            graph,
            blockers,
            pending_children: vec![0; len],
            owned_keys: HashMap::new(),
            in_flight: HashMap::new(),
            finished_keys: HashMap::new(),
            counter: StepCounter::default(),
        }
    }

    fn grow(&mut self) {
        let len = self.graph.capacity_len();
        self.blockers.resize(len, 0);
        self.pending_children.resize(len, 0);
    }

    /// Release one blocker of a step; returns whether it became ready
    fn unblock(&mut self, id: StepId) -> bool {
        let blockers = &mut self.blockers[id.index()];
        *blockers = blockers.saturating_sub(1);
        *blockers == 0
    }

    fn subtree(&self, id: StepId) -> Vec<StepId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if self.graph.status(next).is_terminal() {
                continue;
            }
            order.push(next);
            stack.extend(self.graph.children(next).iter().rev().copied());
        }
        order
    }
}

pub(crate) struct Scheduler<'a> {
    state: Mutex<SchedState>,
    store: &'a dyn ObjectDatabase,
    versions: &'a FileVersionTracker,
    results: &'a Mutex<ResultCache>,
    monitor: &'a IoMonitor,
    cancellation: &'a CancellationToken,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(
        graph: BuildGraph,
        store: &'a dyn ObjectDatabase,
        versions: &'a FileVersionTracker,
        results: &'a Mutex<ResultCache>,
        monitor: &'a IoMonitor,
        cancellation: &'a CancellationToken,
    ) -> Self {
        Self {
            state: Mutex::new(SchedState::new(graph)),
            store,
            versions,
            results,
            monitor,
            cancellation,
        }
    }

    /**
     * Run the whole graph on the pool. Returns once no job is left.
     */
    pub(crate) fn run(&self, pool: &rayon::ThreadPool) {
        let root = self.lock().graph.root();
        let jobs = self.process([Event::Ready(root)]);
        pool.scope(|scope| self.dispatch(scope, jobs));
    }

    /**
     * Hand back the graph and the counts of the run. Steps that never
     * became ready are failed here.
     */
    pub(crate) fn finish(self) -> (BuildGraph, StepCounter) {
        let mut state = self.state.into_inner().unwrap_or_else(PoisonError::into_inner);
        let stuck: Vec<StepId> = state
            .graph
            .step_ids()
            .filter(|id| !state.graph.status(*id).is_terminal())
            .collect();

        for id in stuck {
            error!(step = %state.graph.title(id), "step never became ready; the build graph contains a dependency cycle");
            let node = state.graph.node_mut(id);
            node.status = ResultStatus::Failed;
            if node.command().is_some() {
                state.counter.add(ResultStatus::Failed);
            }
        }

        (state.graph, state.counter)
    }

    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch<'s>(&'s self, scope: &rayon::Scope<'s>, jobs: Vec<Job>) {
        for job in jobs {
            scope.spawn(move |scope| {
                let next = match job {
                    Job::Execute(id, command) => self.execute(id, command),
                    Job::CompleteSpawner(id) => self.complete_spawner(id),
                };
                self.dispatch(scope, next);
            });
        }
    }

    fn process<I: IntoIterator<Item = Event>>(&self, events: I) -> Vec<Job> {
        let mut state = self.lock();
        self.drain(&mut state, events)
    }

    /**
     * Apply events until none are left, collecting the jobs they unlock.
     */
    fn drain<I: IntoIterator<Item = Event>>(&self, state: &mut SchedState, events: I) -> Vec<Job> {
        let mut queue: VecDeque<Event> = events.into_iter().collect();
        let mut jobs = Vec::new();

        while let Some(event) = queue.pop_front() {
            match event {
                Event::Ready(id) => self.on_ready(state, id, &mut queue, &mut jobs),
                Event::Finished(id, status, result) => {
                    Self::on_finished(state, id, status, result, &mut queue, &mut jobs)
                }
            }
        }

        jobs
    }

    fn on_ready(&self, state: &mut SchedState, id: StepId, queue: &mut VecDeque<Event>, jobs: &mut Vec<Job>) {
        if state.graph.status(id).is_terminal() {
            return;
        }

        let not_triggered = if self.cancellation.is_cancelled() {
            Some(ResultStatus::Cancelled)
        } else if state
            .graph
            .prerequisites(id)
            .any(|prerequisite| state.graph.status(prerequisite).is_failure())
        {
            Some(ResultStatus::NotTriggeredPrerequisiteFailed)
        } else {
            None
        };

        if let Some(status) = not_triggered {
            // Parents first so a list takes this status instead of aggregating
            for step in state.subtree(id) {
                queue.push_back(Event::Finished(step, status, None));
            }
            return;
        }

        state.graph.node_mut(id).status = ResultStatus::Running;
        match state.graph.node(id).command().cloned() {
            Some(command) => jobs.push(Job::Execute(id, command)),
            None => {
                let children = state.graph.children(id).to_vec();
                if children.is_empty() {
                    queue.push_back(Event::Finished(id, ResultStatus::Successful, None));
                    return;
                }
                state.pending_children[id.index()] = children.len();
                for child in children {
                    if state.unblock(child) {
                        queue.push_back(Event::Ready(child));
                    }
                }
            }
        }
    }

    fn on_finished(
        state: &mut SchedState,
        id: StepId,
        status: ResultStatus,
        result: Option<CommandResult>,
        queue: &mut VecDeque<Event>,
        jobs: &mut Vec<Job>,
    ) {
        if state.graph.status(id).is_terminal() {
            return;
        }

        let is_command = state.graph.node(id).command().is_some();
        {
            let node = state.graph.node_mut(id);
            node.status = status;
            // A failed spawner keeps the log of its own execution
            node.result = result.clone().or_else(|| {
                node.result.take().map(|mut previous| {
                    previous.status = status;
                    previous
                })
            });
        }
        if is_command {
            state.counter.add(status);
        }

        let context = match state.graph.node(id).command() {
            Some(command) if status == ResultStatus::Failed => Some(failure_context(command.as_ref())),
            _ => None,
        };
        if let Some(context) = &context
            && let Some(result) = state.graph.node_mut(id).result.as_mut()
        {
            result.log.push(LogEntry {
                level: LogLevel::Error,
                message: context.clone(),
            });
        }

        let title = state.graph.title(id);
        match status {
            ResultStatus::Failed => match &context {
                Some(context) => error!(step = %title, "{}", context),
                None => error!(step = %title, "step failed"),
            },
            ResultStatus::NotTriggeredWasSuccessful => debug!(step = %title, "step is up-to-date"),
            _ => debug!(step = %title, status = %status, "step finished"),
        }

        let successors: Vec<StepId> = state.graph.successors(id).collect();
        for successor in successors {
            if state.unblock(successor) {
                queue.push_back(Event::Ready(successor));
            }
        }

        if let Some(parent) = state.graph.parent(id)
            && !state.graph.status(parent).is_terminal()
        {
            let pending = &mut state.pending_children[parent.index()];
            *pending = pending.saturating_sub(1);
            if *pending == 0 {
                let children_status = aggregate(
                    state
                        .graph
                        .children(parent)
                        .iter()
                        .map(|child| state.graph.status(*child)),
                );
                if state.graph.node(parent).is_list() || !children_status.is_success() {
                    queue.push_back(Event::Finished(parent, children_status, None));
                } else {
                    jobs.push(Job::CompleteSpawner(parent));
                }
            }
        }

        if let Some(key) = state.owned_keys.remove(&id) {
            let followers = state
                .in_flight
                .remove(&key)
                .map(|in_flight| in_flight.followers)
                .unwrap_or_default();
            for follower in followers {
                queue.push_back(Event::Finished(follower, follower_status(status), result.clone()));
            }
            state.finished_keys.insert(key, (status, result));
        }
    }

    fn execute(&self, id: StepId, command: SharedCommand) -> Vec<Job> {
        if self.cancellation.is_cancelled() {
            return self.process([Event::Finished(id, ResultStatus::Cancelled, None)]);
        }

        let title = command.title();
        let (key, input_versions) = match compute_cache_key(command.as_ref(), self.store, self.versions) {
            Ok(key) => key,
            Err(e) => {
                error!(step = %title, error = %e, "failed to compute the command hash");
                let mut result = CommandResult::new(ResultStatus::Failed);
                result.log.push(LogEntry {
                    level: LogLevel::Error,
                    message: e.to_string(),
                });
                return self.process([Event::Finished(id, ResultStatus::Failed, Some(result))]);
            }
        };

        {
            let mut state = self.lock();
            if let Some((status, result)) = state.finished_keys.get(&key).cloned() {
                debug!(step = %title, key = %key, "reusing the result of an identical command");
                return self.drain(&mut state, [Event::Finished(id, follower_status(status), result)]);
            }
            if let Some(in_flight) = state.in_flight.get_mut(&key) {
                debug!(step = %title, key = %key, owner = %in_flight.owner, "waiting for an identical command");
                in_flight.followers.push(id);
                return Vec::new();
            }
            state.in_flight.insert(
                key,
                InFlight {
                    owner: id,
                    followers: Vec::new(),
                },
            );
            state.owned_keys.insert(id, key);
        }

        if let Some(result) = self.try_reuse(&title, &key) {
            return self.process([Event::Finished(id, ResultStatus::NotTriggeredWasSuccessful, Some(result))]);
        }

        debug!(step = %title, key = %key, "executing command");
        self.monitor
            .command_started(id, &title, input_versions.keys().cloned(), command.output_urls());

        let mut ctx = ExecuteContext::new(&title, self.store, self.versions, self.cancellation);
        for (url, version) in &input_versions {
            ctx.record_input_version(url.clone(), *version);
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| command.execute(&mut ctx)));
        let record = ctx.finish();
        self.monitor.command_ended(id, &record.reads, &record.writes);

        let mut result = record.result;
        let mut status = match outcome {
            Ok(Ok(CommandOutcome::Succeeded)) => ResultStatus::Successful,
            Ok(Ok(CommandOutcome::Failed)) => ResultStatus::Failed,
            Ok(Ok(CommandOutcome::Cancelled)) => ResultStatus::Cancelled,
            Ok(Err(e)) => {
                error!(step = %title, error = %e, "command returned an error");
                result.log.push(LogEntry {
                    level: LogLevel::Error,
                    message: e.to_string(),
                });
                ResultStatus::Failed
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(step = %title, panic = %message, "command panicked");
                result.log.push(LogEntry {
                    level: LogLevel::Error,
                    message: format!("command panicked: {message}"),
                });
                ResultStatus::Failed
            }
        };

        if status.is_success() && self.cancellation.is_cancelled() {
            status = ResultStatus::Cancelled;
        }
        result.status = status;

        if status == ResultStatus::Successful {
            // Spawned commands may read what their spawner wrote
            if let Err(e) = self.publish_outputs(&result) {
                return self.fail_publish(id, &title, result, e);
            }
            if !record.spawned.is_empty() {
                return self.spawn_children(id, &title, result, record.spawned);
            }
            self.record_result(&title, key, &result);
        }

        self.process([Event::Finished(id, status, Some(result))])
    }

    /**
     * Look for a cached result whose inputs and outputs are still current.
     * Publishes its content outputs on a hit.
     */
    fn try_reuse(&self, title: &str, key: &ObjectId) -> Option<CommandResult> {
        let cached = {
            let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
            match results.get(key) {
                Ok(cached) => cached?,
                Err(e) => {
                    warn!(step = %title, error = %e, "ignoring unreadable cached result");
                    return None;
                }
            }
        };

        let stale_input = cached
            .input_dependency_versions
            .iter()
            .find(|(url, version)| compute_input_hash(self.store, self.versions, url) != **version);
        if let Some((url, _)) = stale_input {
            debug!(step = %title, input = %url, "cached result is stale");
            return None;
        }

        for (url, id) in &cached.output_objects {
            let present = match url.url_type {
                UrlType::Content => self.store.exists(id),
                UrlType::File => self
                    .versions
                    .compute_file_hash(Path::new(&url.path))
                    .is_ok_and(|current| current == *id),
            };
            if !present {
                debug!(step = %title, output = %url, "output of cached result is missing");
                return None;
            }
        }

        if let Err(e) = self.publish_outputs(&cached) {
            warn!(step = %title, error = %e, "failed to publish cached outputs");
            return None;
        }

        let mut result = cached;
        result.status = ResultStatus::NotTriggeredWasSuccessful;
        Some(result)
    }

    /// Make content outputs visible through the index map
    fn publish_outputs(&self, result: &CommandResult) -> Result<(), StoreError> {
        for (url, id) in result.output_objects.iter().filter(|(url, _)| url.is_content()) {
            self.store.index_set(&url.path, *id)?;
        }
        Ok(())
    }

    fn record_result(&self, title: &str, key: ObjectId, result: &CommandResult) {
        let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = results.record(key, result.clone()) {
            warn!(step = %title, error = %e, "failed to cache command result");
        }
    }

    fn fail_publish(&self, id: StepId, title: &str, mut result: CommandResult, e: StoreError) -> Vec<Job> {
        error!(step = %title, error = %e, "failed to publish command outputs");
        result.status = ResultStatus::Failed;
        result.log.push(LogEntry {
            level: LogLevel::Error,
            message: e.to_string(),
        });
        self.process([Event::Finished(id, ResultStatus::Failed, Some(result))])
    }

    fn spawn_children(
        &self,
        id: StepId,
        title: &str,
        result: CommandResult,
        spawned: Vec<SharedCommand>,
    ) -> Vec<Job> {
        debug!(step = %title, count = spawned.len(), "command spawned follow-up commands");

        let mut state = self.lock();
        state.graph.node_mut(id).result = Some(result);
        let children: Vec<StepId> = spawned
            .into_iter()
            .map(|command| state.graph.push_command(id, command, true))
            .collect();
        state.grow();
        state.pending_children[id.index()] = children.len();

        self.drain(&mut state, children.into_iter().map(Event::Ready))
    }

    /**
     * Every spawned child of a step succeeded: fold their results into the
     * spawner's and cache it so a later hit republishes everything.
     */
    fn complete_spawner(&self, id: StepId) -> Vec<Job> {
        let (key, title, result) = {
            let mut state = self.lock();
            let mut result = state.graph.node_mut(id).result.take().unwrap_or_default();
            for child in state.graph.children(id) {
                if let Some(child_result) = state.graph.result(*child) {
                    result.merge(child_result);
                }
            }
            result.status = ResultStatus::Successful;
            (state.owned_keys.get(&id).copied(), state.graph.title(id).to_string(), result)
        };

        if let Some(key) = key {
            self.record_result(&title, key, &result);
        }
        self.process([Event::Finished(id, ResultStatus::Successful, Some(result))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_children() {
        use ResultStatus::*;

        assert_eq!(aggregate(Vec::new()), Successful);
        assert_eq!(aggregate([Successful, NotTriggeredWasSuccessful]), Successful);
        assert_eq!(aggregate([Successful, NotTriggeredPrerequisiteFailed]), Failed);
        assert_eq!(aggregate([Failed, Cancelled]), Cancelled);
    }

    #[test]
    fn test_follower_status() {
        assert_eq!(
            follower_status(ResultStatus::Successful),
            ResultStatus::NotTriggeredWasSuccessful
        );
        assert_eq!(follower_status(ResultStatus::Failed), ResultStatus::Failed);
    }

    #[test]
    fn test_panic_message() {
        let formatted: Box<dyn Any + Send> = Box::new(format!("boom {}", 42));
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let other: Box<dyn Any + Send> = Box::new(42u32);

        assert_eq!(panic_message(formatted.as_ref()), "boom 42");
        assert_eq!(panic_message(literal.as_ref()), "boom");
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }
}
