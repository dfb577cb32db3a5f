use crate::command::{Command, CommandError, SharedCommand};
use kiln_core::{CommandResult, LogEntry, LogLevel, ObjectId, ObjectUrl, ResultStatus, UrlType};
use kiln_utils::{FileVersionTracker, ObjectDatabase, hash_bytes, write_content};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/**
 * Cooperative cancellation flag shared between the builder, its workers
 * and anyone holding a clone.
 */
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/**
 * Current version of an input: the hash of a file's content, or the id the
 * index map holds for a content url. Missing inputs hash to
 * [`ObjectId::EMPTY`].
 */
pub(crate) fn compute_input_hash(
    store: &dyn ObjectDatabase,
    versions: &FileVersionTracker,
    url: &ObjectUrl,
) -> ObjectId {
    match url.url_type {
        UrlType::File => match versions.compute_file_hash(Path::new(&url.path)) {
            Ok(id) => id,
            Err(e) => {
                warn!(input = %url, error = %e, "input file cannot be hashed; the build cache will not work for this command");
                ObjectId::EMPTY
            }
        },
        UrlType::Content => store.index_get(&url.path).unwrap_or_else(|| {
            warn!(input = %url, "location does not exist currently and is required to compute the command hash; the build cache will not work for this command");
            ObjectId::EMPTY
        }),
    }
}

/// What an execution produced, handed back to the scheduler
pub(crate) struct ExecutionRecord {
    pub(crate) result: CommandResult,
    pub(crate) spawned: Vec<SharedCommand>,
    pub(crate) reads: BTreeSet<ObjectUrl>,
    pub(crate) writes: BTreeSet<ObjectUrl>,
}

/**
 * Per-execution view of the build handed to [`Command::execute`].
 *
 * Reads and writes go through the context so the versions of inputs and
 * the hashes of outputs land in the command's result.
 */
pub struct ExecuteContext<'a> {
    title: &'a str,
    store: &'a dyn ObjectDatabase,
    versions: &'a FileVersionTracker,
    cancellation: &'a CancellationToken,
    result: CommandResult,
    spawned: Vec<SharedCommand>,
    reads: BTreeSet<ObjectUrl>,
    writes: BTreeSet<ObjectUrl>,
}

impl<'a> ExecuteContext<'a> {
    pub(crate) fn new(
        title: &'a str,
        store: &'a dyn ObjectDatabase,
        versions: &'a FileVersionTracker,
        cancellation: &'a CancellationToken,
    ) -> Self {
        Self {
            title,
            store,
            versions,
            cancellation,
            result: CommandResult::new(ResultStatus::Running),
            spawned: Vec::new(),
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
        }
    }

    pub fn title(&self) -> &str {
        self.title
    }

    /// Long-running commands should poll this and return `Cancelled`
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn store(&self) -> &dyn ObjectDatabase {
        self.store
    }

    pub fn compute_input_hash(&self, url: &ObjectUrl) -> ObjectId {
        compute_input_hash(self.store, self.versions, url)
    }

    /**
     * Read an input and record the version that was observed.
     */
    pub fn read_input(&mut self, url: &ObjectUrl) -> Result<Vec<u8>, CommandError> {
        let data = match url.url_type {
            UrlType::File => std::fs::read(&url.path)
                .map_err(|e| CommandError::IoError(url.path.clone(), e))?,
            UrlType::Content => {
                let id = self
                    .store
                    .index_get(&url.path)
                    .ok_or_else(|| CommandError::MissingInput(url.clone()))?;
                self.store.read(&id)?
            }
        };

        self.result
            .input_dependency_versions
            .insert(url.clone(), hash_bytes(&data));
        self.reads.insert(url.clone());
        Ok(data)
    }

    /**
     * Write an output. Content outputs go to the object database under
     * their hash; they become visible through the index map only once the
     * command has succeeded. File outputs are written to disk directly.
     */
    pub fn write_output(&mut self, url: &ObjectUrl, data: &[u8]) -> Result<ObjectId, CommandError> {
        let id = match url.url_type {
            UrlType::Content => write_content(self.store, data)?,
            UrlType::File => {
                let path = Path::new(&url.path);
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| CommandError::IoError(url.path.clone(), e))?;
                }
                std::fs::write(path, data).map_err(|e| CommandError::IoError(url.path.clone(), e))?;
                self.versions.forget(path);
                hash_bytes(data)
            }
        };

        self.result.output_objects.insert(url.clone(), id);
        self.writes.insert(url.clone());
        Ok(id)
    }

    pub fn add_tag(&mut self, url: &ObjectUrl, tag: impl Into<String>) {
        self.result
            .tags
            .entry(url.clone())
            .or_default()
            .insert(tag.into());
    }

    /**
     * Schedule follow-up work. Spawned commands run as children of this
     * step, which completes only after all of them have.
     */
    pub fn spawn<C: Command + 'static>(&mut self, command: C) {
        self.spawned.push(Arc::new(command));
    }

    pub fn spawn_shared(&mut self, command: SharedCommand) {
        self.spawned.push(command);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(step = %self.title, "{}", message);
        self.push_log(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(step = %self.title, "{}", message);
        self.push_log(LogLevel::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(step = %self.title, "{}", message);
        self.push_log(LogLevel::Error, message);
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        self.result.log.push(LogEntry { level, message });
    }

    pub(crate) fn record_input_version(&mut self, url: ObjectUrl, id: ObjectId) {
        self.result.input_dependency_versions.insert(url, id);
    }

    pub(crate) fn finish(self) -> ExecutionRecord {
        ExecutionRecord {
            result: self.result,
            spawned: self.spawned,
            reads: self.reads,
            writes: self.writes,
        }
    }
}
