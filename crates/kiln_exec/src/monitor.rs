use crate::graph::StepId;
use kiln_core::ObjectUrl;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// One command read an url another was writing
    ReadWhileWrite,
    /// Two commands wrote the same url
    ConcurrentWrite,
}

/**
 * Two overlapping executions touched the same url with at least one write
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoConflict {
    pub url: ObjectUrl,
    pub writer: StepId,
    pub other: StepId,
    pub kind: ConflictKind,
}

impl fmt::Display for IoConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = match self.kind {
            ConflictKind::ReadWhileWrite => "reading",
            ConflictKind::ConcurrentWrite => "writing",
        };
        write!(
            f,
            "step {} is writing {} while step {} is {} it",
            self.writer, self.url, self.other, access
        )
    }
}

struct Execution {
    step: StepId,
    title: String,
    start: u64,
    end: Option<u64>,
    reads: BTreeSet<ObjectUrl>,
    writes: BTreeSet<ObjectUrl>,
}

impl Execution {
    fn overlaps(&self, other: &Execution) -> bool {
        let self_end = self.end.unwrap_or(u64::MAX);
        let other_end = other.end.unwrap_or(u64::MAX);
        self.start < other_end && other.start < self_end
    }
}

#[derive(Default)]
struct MonitorState {
    clock: u64,
    executions: Vec<Execution>,
    conflicts: Vec<IoConflict>,
}

/**
 * Records which urls each running command reads and writes and reports
 * overlapping executions that touch the same url.
 *
 * Conflicts are only detected after the fact and logged as warnings; they
 * never stop the build.
 */
#[derive(Default)]
pub struct IoMonitor {
    state: Mutex<MonitorState>,
}

impl IoMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command about to run with its declared inputs and outputs
    pub fn command_started(
        &self,
        step: StepId,
        title: &str,
        reads: impl IntoIterator<Item = ObjectUrl>,
        writes: impl IntoIterator<Item = ObjectUrl>,
    ) {
        let mut state = self.lock();
        state.clock += 1;
        let start = state.clock;
        state.executions.push(Execution {
            step,
            title: title.to_string(),
            start,
            end: None,
            reads: reads.into_iter().collect(),
            writes: writes.into_iter().collect(),
        });
    }

    /**
     * Close the execution of a command, adding what it actually touched,
     * and report conflicts with every execution it overlapped.
     */
    pub fn command_ended(&self, step: StepId, reads: &BTreeSet<ObjectUrl>, writes: &BTreeSet<ObjectUrl>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.clock += 1;
        let end = state.clock;

        let Some(position) = state
            .executions
            .iter()
            .position(|e| e.step == step && e.end.is_none())
        else {
            return;
        };

        {
            let execution = &mut state.executions[position];
            execution.end = Some(end);
            execution.reads.extend(reads.iter().cloned());
            execution.writes.extend(writes.iter().cloned());
        }

        let mut found = Vec::new();
        let current = &state.executions[position];
        for other in &state.executions {
            if other.step == step || !current.overlaps(other) {
                continue;
            }
            for url in &current.writes {
                if other.writes.contains(url) {
                    let (writer, second) = if current.step < other.step {
                        (current, other)
                    } else {
                        (other, current)
                    };
                    found.push((url.clone(), writer, second, ConflictKind::ConcurrentWrite));
                } else if other.reads.contains(url) {
                    found.push((url.clone(), current, other, ConflictKind::ReadWhileWrite));
                }
            }
            for url in current.reads.iter().filter(|url| !current.writes.contains(*url)) {
                if other.writes.contains(url) {
                    found.push((url.clone(), other, current, ConflictKind::ReadWhileWrite));
                }
            }
        }

        let mut fresh = Vec::new();
        for (url, writer, other, kind) in found {
            let conflict = IoConflict {
                url,
                writer: writer.step,
                other: other.step,
                kind,
            };
            if state.conflicts.contains(&conflict) || fresh.contains(&conflict) {
                continue;
            }
            let access = match kind {
                ConflictKind::ReadWhileWrite => "reading",
                ConflictKind::ConcurrentWrite => "writing",
            };
            warn!(
                "Command {} is writing {} while command {} is {} it",
                writer.title, conflict.url, other.title, access
            );
            fresh.push(conflict);
        }
        state.conflicts.extend(fresh);

        // An ended execution can only overlap commands already running
        let oldest_running = state
            .executions
            .iter()
            .filter(|e| e.end.is_none())
            .map(|e| e.start)
            .min()
            .unwrap_or(u64::MAX);
        state
            .executions
            .retain(|e| e.end.is_none_or(|end| end > oldest_running));
    }

    pub fn conflicts(&self) -> Vec<IoConflict> {
        self.lock().conflicts.clone()
    }

    pub fn clear(&self) {
        *self.lock() = MonitorState::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
