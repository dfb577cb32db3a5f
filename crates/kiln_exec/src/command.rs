use crate::context::ExecuteContext;
use kiln_core::{ObjectId, ObjectUrl};
use kiln_utils::{HashError, ParameterWriter, StoreError};
use std::sync::Arc;
use thiserror::Error;

/**
 * Errors a command may return from `execute`; the step is marked failed
 */
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Hash error: {0}")]
    HashError(#[from] HashError),

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Failed to access '{0}': {1}")]
    IoError(String, std::io::Error),

    #[error("Input '{0}' is not available")]
    MissingInput(ObjectUrl),

    #[error("{0}")]
    Message(String),
}

/// How a command's execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/**
 * A unit of work wrapped by a command build step.
 *
 * The parameter hash (type name plus everything `hash_parameters` writes)
 * together with the versions of `input_dependencies` forms the cache key:
 * two commands with the same key are assumed to produce the same result.
 */
pub trait Command: Send + Sync {
    /// Stable name of the command type, mixed into the parameter hash
    fn type_name(&self) -> &str;

    fn title(&self) -> String {
        self.type_name().to_string()
    }

    /// Write every parameter that influences the command's output
    fn hash_parameters(&self, writer: &mut ParameterWriter) -> Result<(), HashError>;

    /// Inputs whose version must be checked before reusing a cached result
    fn input_dependencies(&self) -> Vec<ObjectUrl> {
        Vec::new()
    }

    /// Outputs this command is known to write
    fn output_urls(&self) -> Vec<ObjectUrl> {
        Vec::new()
    }

    fn execute(&self, ctx: &mut ExecuteContext<'_>) -> Result<CommandOutcome, CommandError>;
}

pub type SharedCommand = Arc<dyn Command>;

/**
 * Hash of the command type and its parameters
 */
pub fn compute_parameter_hash(command: &dyn Command) -> Result<ObjectId, HashError> {
    let mut writer = ParameterWriter::new();
    writer.write_str(command.type_name());
    command.hash_parameters(&mut writer)?;
    Ok(writer.finish())
}
