use anyhow::{Context, Result, bail};
use kiln_core::BuilderConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Files matching `source` are imported under the content url prefix `url`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ImportEntry {
    pub source: String,
    pub url: String,
}

/// Content urls `inputs` are concatenated into the content url `output`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BundleEntry {
    pub output: String,
    pub inputs: Vec<String>,
}

/**
 * Parsed `Kiln.toml`
 */
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub builder: BuilderConfig,

    #[serde(default, rename = "import")]
    pub imports: Vec<ImportEntry>,

    #[serde(default, rename = "bundle")]
    pub bundles: Vec<BundleEntry>,
}

impl Manifest {
    /**
     * Load a manifest; relative paths in it are resolved against the
     * manifest's directory.
     */
    pub fn from_file(path: &Path) -> Result<(Self, PathBuf)> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut manifest = Self::from_toml(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        let base_dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if manifest.builder.build_path.is_relative() {
            manifest.builder.build_path = base_dir.join(&manifest.builder.build_path);
        }

        Ok((manifest, base_dir))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(content)?;
        manifest.builder.validate()?;

        for bundle in &manifest.bundles {
            if bundle.inputs.is_empty() {
                bail!("bundle '{}' has no inputs", bundle.output);
            }
        }
        Ok(manifest)
    }
}
