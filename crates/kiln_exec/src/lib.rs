//! Build execution for kiln
//!
//! Commands are wrapped into steps of a [`BuildGraph`]; a [`Builder`] runs
//! the graph on a bounded worker pool, reusing cached results of commands
//! whose parameters and inputs did not change.

mod builder;
mod command;
mod context;
mod graph;
mod monitor;
mod scheduler;
mod types;

pub use builder::{Builder, EXPECTED_VERSION};
pub use command::{Command, CommandError, CommandOutcome, SharedCommand, compute_parameter_hash};
pub use context::{CancellationToken, ExecuteContext};
pub use graph::{BuildGraph, StepId, StepKind};
pub use monitor::{ConflictKind, IoConflict, IoMonitor};
pub use types::{ExecError, Mode, StepCounter};

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{BuildResultCode, BuilderConfig, ObjectUrl, ResultStatus};
    use kiln_utils::{HashError, ParameterWriter};
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kiln_exec_test_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct WriteBlob {
        url: &'static str,
        data: &'static str,
    }

    impl Command for WriteBlob {
        fn type_name(&self) -> &str {
            "Write"
        }

        fn hash_parameters(&self, writer: &mut ParameterWriter) -> Result<(), HashError> {
            writer.write(self.url)?;
            writer.write(self.data)
        }

        fn output_urls(&self) -> Vec<ObjectUrl> {
            vec![ObjectUrl::content(self.url)]
        }

        fn execute(&self, ctx: &mut ExecuteContext<'_>) -> Result<CommandOutcome, CommandError> {
            ctx.write_output(&ObjectUrl::content(self.url), self.data.as_bytes())?;
            Ok(CommandOutcome::Succeeded)
        }
    }

    #[test]
    fn test_step_counter_summary() {
        let mut counter = StepCounter::default();
        counter.add(ResultStatus::Successful);
        counter.add(ResultStatus::NotTriggeredWasSuccessful);
        counter.add(ResultStatus::NotTriggeredWasSuccessful);
        counter.add(ResultStatus::NotTriggeredPrerequisiteFailed);

        assert_eq!(counter.total(), 4);
        assert_eq!(counter.built_count(), 1);
        assert_eq!(counter.up_to_date_count(), 2);
        assert_eq!(counter.failed_count(), 1);
        assert!(!counter.success());
        assert_eq!(
            counter.summary(),
            "Build finished in 4 steps. Command results: 1 succeeded, 2 up-to-date, 0 failed, 1 not triggered due to previous failure."
        );
    }

    #[test]
    fn test_empty_graph_succeeds() {
        let dir = temp_dir("empty");
        let mut builder = Builder::new(BuilderConfig::new(&dir)).unwrap();

        assert_eq!(builder.run(Mode::Build), BuildResultCode::Successful);
        assert_eq!(builder.status(builder.root()), ResultStatus::Successful);
        assert_eq!(builder.step_counter().total(), 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_simple_build_publishes_outputs() {
        let dir = temp_dir("simple");
        let mut builder = Builder::new(BuilderConfig::new(&dir)).unwrap();
        let step = builder.add_command(WriteBlob {
            url: "textures/grass",
            data: "green",
        });

        assert_eq!(builder.run(Mode::Build), BuildResultCode::Successful);
        assert_eq!(builder.status(step), ResultStatus::Successful);

        let id = builder.result(step).unwrap().output_objects[&ObjectUrl::content("textures/grass")];
        assert_eq!(builder.store().index_get("textures/grass"), Some(id));
        assert_eq!(builder.store().read(&id).unwrap(), b"green");
        assert_eq!(builder.step_counter().built_count(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_lists_group_steps() {
        let dir = temp_dir("lists");
        let mut builder = Builder::new(BuilderConfig::new(&dir)).unwrap();
        let root = builder.root();
        let textures = builder.graph_mut().add_list(root, "textures").unwrap();
        let grass = builder
            .graph_mut()
            .add_command(textures, WriteBlob { url: "grass", data: "green" })
            .unwrap();
        let after = builder.add_command(WriteBlob { url: "level", data: "map" });
        builder.link(textures, after).unwrap();

        assert_eq!(builder.run(Mode::Build), BuildResultCode::Successful);
        assert_eq!(builder.status(grass), ResultStatus::Successful);
        assert_eq!(builder.status(textures), ResultStatus::Successful);
        assert_eq!(builder.status(after), ResultStatus::Successful);

        std::fs::remove_dir_all(&dir).ok();
    }
}
