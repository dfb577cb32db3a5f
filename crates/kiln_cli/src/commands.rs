use kiln_core::ObjectUrl;
use kiln_exec::{Command, CommandError, CommandOutcome, ExecuteContext};
use kiln_utils::{HashError, ParameterWriter};
use std::path::PathBuf;

/**
 * Copies a source file into the object database under a content url
 */
pub struct ImportFileCommand {
    pub source: PathBuf,
    pub url: String,
}

impl ImportFileCommand {
    fn source_url(&self) -> ObjectUrl {
        ObjectUrl::file(self.source.to_string_lossy())
    }
}

impl Command for ImportFileCommand {
    fn type_name(&self) -> &str {
        "ImportFile"
    }

    fn title(&self) -> String {
        format!("Import {} -> {}", self.source.display(), self.url)
    }

    fn hash_parameters(&self, writer: &mut ParameterWriter) -> Result<(), HashError> {
        writer.write(&self.source)?;
        writer.write(&self.url)
    }

    fn input_dependencies(&self) -> Vec<ObjectUrl> {
        vec![self.source_url()]
    }

    fn output_urls(&self) -> Vec<ObjectUrl> {
        vec![ObjectUrl::content(self.url.as_str())]
    }

    fn execute(&self, ctx: &mut ExecuteContext<'_>) -> Result<CommandOutcome, CommandError> {
        let data = ctx.read_input(&self.source_url())?;
        let id = ctx.write_output(&ObjectUrl::content(self.url.as_str()), &data)?;
        ctx.info(format!("imported {} bytes as {}", data.len(), id));
        Ok(CommandOutcome::Succeeded)
    }
}

/**
 * Concatenates content objects into one. Every input is preceded by its
 * url and length so the bundle can be split again.
 */
pub struct BundleCommand {
    pub output: String,
    pub inputs: Vec<String>,
}

impl Command for BundleCommand {
    fn type_name(&self) -> &str {
        "Bundle"
    }

    fn title(&self) -> String {
        format!("Bundle {}", self.output)
    }

    fn hash_parameters(&self, writer: &mut ParameterWriter) -> Result<(), HashError> {
        writer.write(&self.output)?;
        writer.write(&self.inputs)
    }

    fn input_dependencies(&self) -> Vec<ObjectUrl> {
        self.inputs
            .iter()
            .map(|input| ObjectUrl::content(input.as_str()))
            .collect()
    }

    fn output_urls(&self) -> Vec<ObjectUrl> {
        vec![ObjectUrl::content(self.output.as_str())]
    }

    fn execute(&self, ctx: &mut ExecuteContext<'_>) -> Result<CommandOutcome, CommandError> {
        let mut bundle = Vec::new();
        for input in &self.inputs {
            if ctx.is_cancelled() {
                return Ok(CommandOutcome::Cancelled);
            }
            let data = ctx.read_input(&ObjectUrl::content(input.as_str()))?;
            bundle.extend_from_slice(&(input.len() as u64).to_le_bytes());
            bundle.extend_from_slice(input.as_bytes());
            bundle.extend_from_slice(&(data.len() as u64).to_le_bytes());
            bundle.extend_from_slice(&data);
        }

        ctx.write_output(&ObjectUrl::content(self.output.as_str()), &bundle)?;
        ctx.info(format!("bundled {} objects", self.inputs.len()));
        Ok(CommandOutcome::Succeeded)
    }
}
