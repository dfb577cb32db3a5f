mod commands;
mod manifest;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::{BundleCommand, ImportFileCommand};
use kiln_core::BuildResultCode;
use kiln_exec::{Builder, Mode};
use kiln_utils::expand_globs;
use manifest::Manifest;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// kiln - Incremental content build engine
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the build manifest
    #[arg(short, long, global = true, default_value = "Kiln.toml")]
    manifest: PathBuf,

    /// Number of worker threads (default: from the manifest, else the core count)
    #[arg(short = 'j', long, global = true)]
    jobs: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import and bundle everything the manifest lists
    Build {
        /// Source files changed outside of kiln; cached results reading them are dropped
        #[arg(long)]
        modified: Vec<String>,

        /// Replace the index file instead of merging into it
        #[arg(long)]
        replace_index: bool,
    },

    /// Forget the cached results of the manifest's commands
    Clean {
        /// Also delete their output objects
        #[arg(long)]
        delete: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .without_time()
        .init();

    if !cli.manifest.exists() {
        eprintln!("No {} found", cli.manifest.display());
        eprintln!();
        eprintln!("Example:");
        eprintln!("```toml");
        eprintln!("[builder]");
        eprintln!("build_path = \".kiln\"");
        eprintln!();
        eprintln!("[[import]]");
        eprintln!("source = \"textures/*.png\"");
        eprintln!("url = \"textures\"");
        eprintln!();
        eprintln!("[[bundle]]");
        eprintln!("output = \"packs/textures\"");
        eprintln!("inputs = [\"textures/grass.png\"]");
        eprintln!("```");
        std::process::exit(1);
    }

    let (manifest, base_dir) = Manifest::from_file(&cli.manifest)?;
    let mut builder = Builder::new(manifest.builder.clone())
        .with_context(|| format!("failed to open {}", manifest.builder.build_path.display()))?;
    if let Some(jobs) = cli.jobs {
        builder.set_thread_count(jobs);
    }
    populate(&mut builder, &manifest, &base_dir)?;

    let code = match cli.command {
        Commands::Build {
            modified,
            replace_index,
        } => cmd_build(&mut builder, &base_dir, modified, replace_index)?,
        Commands::Clean { delete } => {
            let mode = if delete { Mode::CleanAndDelete } else { Mode::Clean };
            builder.run(mode)
        }
    };

    match code {
        BuildResultCode::Successful => {
            println!("✓ Done");
            Ok(())
        }
        BuildResultCode::Failed => {
            eprintln!("✗ Build failed");
            std::process::exit(1);
        }
        BuildResultCode::Cancelled => {
            eprintln!("✗ Build cancelled");
            std::process::exit(2);
        }
    }
}

/**
 * Add one import step per matched source file and one step per bundle.
 * Bundles are ordered after the imports they read by content url.
 */
fn populate(builder: &mut Builder, manifest: &Manifest, base_dir: &Path) -> Result<()> {
    for entry in &manifest.imports {
        let files = expand_globs(std::slice::from_ref(&entry.source), base_dir)
            .with_context(|| format!("failed to expand '{}'", entry.source))?;

        for file in files.into_iter().filter(|file| file.is_file()) {
            let Some(name) = file.file_name().map(|name| name.to_string_lossy().into_owned()) else {
                continue;
            };
            let url = format!("{}/{}", entry.url.trim_end_matches('/'), name);
            debug!(source = %file.display(), url = %url, "adding import");
            builder.add_command(ImportFileCommand { source: file, url });
        }
    }

    for bundle in &manifest.bundles {
        builder.add_command(BundleCommand {
            output: bundle.output.clone(),
            inputs: bundle.inputs.clone(),
        });
    }

    Ok(())
}

fn cmd_build(
    builder: &mut Builder,
    base_dir: &Path,
    modified: Vec<String>,
    replace_index: bool,
) -> Result<BuildResultCode> {
    if !modified.is_empty() {
        let modified: BTreeSet<String> = modified
            .iter()
            .map(|path| base_dir.join(path).to_string_lossy().into_owned())
            .collect();
        builder.reset_cache(&modified)?;
    }

    let code = builder.run(Mode::Build);
    let counter = builder.step_counter();
    println!(
        "{} built, {} up-to-date, {} failed",
        counter.built_count(),
        counter.up_to_date_count(),
        counter.failed_count()
    );

    let index = builder.write_index_file(!replace_index)?;
    println!("Index written to {}", index.display());

    Ok(code)
}
