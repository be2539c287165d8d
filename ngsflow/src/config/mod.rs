//! Run configuration.
//!
//! The YAML configuration file is parsed into [`ConfigFile`] and resolved,
//! together with the command line and the environment, into one immutable
//! [`RunConfig`] that every stage receives by reference.
//!
//! ```yaml
//! reference: /apps/data/src/bundle/hg19.fasta
//! known_sites: /apps/data/src/bundle/dbsnp_138.hg19.vcf
//! tools:
//!   aligner: /usr/local/bin/bwa
//!   snpeff: /opt/snpEff/snpEff
//! panels:
//!   cardiac:
//!     targets: /apps/data/src/BED/cardiac.bed
//!     windows: /apps/data/src/BED/cardiac_windows.bed
//! ```

use crate::discovery::{compile_read_pattern, DEFAULT_READ_PATTERN};
use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// External tools the pipeline can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Short-read aligner (BWA).
    Aligner,
    /// SAM/BAM toolkit.
    Samtools,
    /// Picard toolkit.
    Picard,
    /// Variant-analysis toolkit, current generation (GATK4).
    Gatk,
    /// Variant-analysis toolkit, previous generation (GATK3).
    Gatk3,
    /// FreeBayes variant caller.
    Freebayes,
    /// Octopus variant caller.
    Octopus,
    /// snpEff annotation tool.
    Snpeff,
    /// Copy-number caller.
    Cnv,
}

impl ToolKind {
    /// Every tool, in configuration order.
    pub const ALL: [ToolKind; 9] = [
        Self::Aligner,
        Self::Samtools,
        Self::Picard,
        Self::Gatk,
        Self::Gatk3,
        Self::Freebayes,
        Self::Octopus,
        Self::Snpeff,
        Self::Cnv,
    ];

    /// Returns the key used under `tools:` in the configuration file.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Self::Aligner => "aligner",
            Self::Samtools => "samtools",
            Self::Picard => "picard",
            Self::Gatk => "gatk",
            Self::Gatk3 => "gatk3",
            Self::Freebayes => "freebayes",
            Self::Octopus => "octopus",
            Self::Snpeff => "snpeff",
            Self::Cnv => "cnv",
        }
    }

    /// Returns the environment variable consulted when the file omits the tool.
    #[must_use]
    pub fn env_var(&self) -> &'static str {
        match self {
            Self::Aligner => "BWA",
            Self::Samtools => "SAMTOOLS",
            Self::Picard => "PICARD",
            Self::Gatk => "GATK",
            Self::Gatk3 => "GATK3",
            Self::Freebayes => "FREEBAYES",
            Self::Octopus => "OCTOPUS",
            Self::Snpeff => "SNPEFF",
            Self::Cnv => "CNV",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Panel section of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PanelFile {
    /// Target regions (BED).
    pub targets: Option<PathBuf>,
    /// Bait regions; defaults to the targets.
    pub baits: Option<PathBuf>,
    /// Copy-number windows (BED).
    pub windows: Option<PathBuf>,
}

/// The configuration file as written on disk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Reference genome FASTA.
    pub reference: Option<PathBuf>,
    /// Known variant sites used for base recalibration.
    pub known_sites: Option<PathBuf>,
    /// Positions used for sample identity extraction.
    pub identity_sites: Option<PathBuf>,
    /// Genome database name passed to the annotation tool.
    pub genome_build: Option<String>,
    /// Tool executables.
    #[serde(default)]
    pub tools: HashMap<ToolKind, PathBuf>,
    /// Panels by name.
    #[serde(default)]
    pub panels: HashMap<String, PanelFile>,
    /// Threads passed to multi-threaded tools.
    pub threads: Option<usize>,
    /// Maximum concurrent tool processes.
    pub workers: Option<usize>,
    /// Maximum samples driven at once.
    pub max_parallel_samples: Option<usize>,
    /// Seconds to wait for a stage lock held by another run.
    pub lock_timeout_secs: Option<u64>,
    /// Seconds after which a lock is considered abandoned.
    pub stale_lock_secs: Option<u64>,
    /// Minimum artifact size accepted by the probe.
    pub min_artifact_bytes: Option<u64>,
    /// Regex used to recognise read files.
    pub read_pattern: Option<String>,
}

impl ConfigFile {
    /// Parses a configuration file from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(text)
            .map_err(|e| ConfigurationError::new(format!("invalid configuration file: {e}")))
    }

    /// Reads and parses a configuration file.
    pub fn read(path: &Path) -> Result<Self, ConfigurationError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::new(format!("cannot read {}: {e}", path.display()))
                .with_source_path(path)
        })?;
        Self::from_yaml(&text).map_err(|e| e.with_source_path(path))
    }
}

/// The panel selected for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanelConfig {
    /// Panel name.
    pub name: String,
    /// Target regions.
    pub targets: PathBuf,
    /// Bait regions.
    pub baits: PathBuf,
    /// Copy-number windows, when the panel defines them.
    pub windows: Option<PathBuf>,
}

/// Immutable configuration shared by every sample and stage.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    /// Reference genome FASTA.
    pub reference: PathBuf,
    /// Known variant sites.
    pub known_sites: PathBuf,
    /// Identity extraction positions; the panel targets when unset.
    pub identity_sites: PathBuf,
    /// Annotation genome database.
    pub genome_build: String,
    /// Resolved tool executables.
    pub tools: BTreeMap<ToolKind, PathBuf>,
    /// The selected panel.
    pub panel: PanelConfig,
    /// Run directory.
    pub datadir: PathBuf,
    /// Threads passed to multi-threaded tools.
    pub threads: usize,
    /// Maximum concurrent tool processes.
    pub workers: usize,
    /// Maximum samples driven at once.
    pub max_parallel_samples: usize,
    /// How long to wait for a stage lock.
    pub lock_timeout: Duration,
    /// Age after which a lock is broken.
    pub stale_lock_after: Duration,
    /// Minimum artifact size accepted by the probe.
    pub min_artifact_bytes: u64,
    /// Regex used to recognise read files.
    pub read_pattern: String,
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

impl RunConfig {
    /// Loads the configuration, falling back to the process environment for tools.
    pub fn load(
        path: &Path,
        datadir: impl Into<PathBuf>,
        panel: &str,
    ) -> Result<Self, ConfigurationError> {
        Self::load_with_env(path, datadir, panel, |key| std::env::var(key).ok())
    }

    /// Loads the configuration with an explicit environment lookup.
    pub fn load_with_env<E>(
        path: &Path,
        datadir: impl Into<PathBuf>,
        panel: &str,
        env: E,
    ) -> Result<Self, ConfigurationError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let file = ConfigFile::read(path)?;
        Self::resolve(file, datadir, panel, env).map_err(|e| e.with_source_path(path))
    }

    /// Resolves a parsed file into a run configuration.
    ///
    /// Every missing required key is reported in a single error.
    pub fn resolve<E>(
        file: ConfigFile,
        datadir: impl Into<PathBuf>,
        panel: &str,
        env: E,
    ) -> Result<Self, ConfigurationError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();

        if file.reference.is_none() {
            missing.push("reference".to_string());
        }
        if file.known_sites.is_none() {
            missing.push("known_sites".to_string());
        }

        let mut panels = file.panels;
        let Some(panel_file) = panels.remove(panel) else {
            let mut known: Vec<_> = panels.keys().cloned().collect();
            known.sort();
            return Err(ConfigurationError {
                message: format!(
                    "panel '{panel}' is not configured (known panels: {})",
                    if known.is_empty() { "none".to_string() } else { known.join(", ") }
                ),
                keys: vec![format!("panels.{panel}")],
                source_path: None,
            });
        };
        if panel_file.targets.is_none() {
            missing.push(format!("panels.{panel}.targets"));
        }

        if !missing.is_empty() {
            return Err(ConfigurationError::missing_keys(missing));
        }

        let mut tools = BTreeMap::new();
        for kind in ToolKind::ALL {
            let path = file
                .tools
                .get(&kind)
                .cloned()
                .or_else(|| env(kind.env_var()).filter(|v| !v.is_empty()).map(PathBuf::from));
            if let Some(path) = path {
                tools.insert(kind, path);
            }
        }

        let read_pattern = file
            .read_pattern
            .unwrap_or_else(|| DEFAULT_READ_PATTERN.to_string());
        compile_read_pattern(&read_pattern)?;

        let (Some(reference), Some(known_sites), Some(targets)) =
            (file.reference, file.known_sites, panel_file.targets)
        else {
            return Err(ConfigurationError::new("required keys vanished during resolution"));
        };

        let workers = file.workers.unwrap_or_else(default_workers).max(1);

        Ok(Self {
            reference,
            known_sites,
            identity_sites: file.identity_sites.unwrap_or_else(|| targets.clone()),
            genome_build: file.genome_build.unwrap_or_else(|| "hg19".to_string()),
            tools,
            panel: PanelConfig {
                name: panel.to_string(),
                baits: panel_file.baits.unwrap_or_else(|| targets.clone()),
                targets,
                windows: panel_file.windows,
            },
            datadir: datadir.into(),
            threads: file.threads.unwrap_or(4).max(1),
            workers,
            max_parallel_samples: file.max_parallel_samples.unwrap_or(workers).max(1),
            lock_timeout: Duration::from_secs(file.lock_timeout_secs.unwrap_or(3600)),
            stale_lock_after: Duration::from_secs(file.stale_lock_secs.unwrap_or(86_400)),
            min_artifact_bytes: file.min_artifact_bytes.unwrap_or(1),
            read_pattern,
        })
    }

    /// Returns the executable for a tool, if resolved.
    #[must_use]
    pub fn tool(&self, kind: ToolKind) -> Option<&Path> {
        self.tools.get(&kind).map(PathBuf::as_path)
    }

    /// Fails with every tool in `required` that did not resolve.
    pub fn require_tools(&self, required: &BTreeSet<ToolKind>) -> Result<(), ConfigurationError> {
        let missing: Vec<String> = required
            .iter()
            .filter(|kind| !self.tools.contains_key(kind))
            .map(|kind| format!("tools.{} (or ${})", kind.key(), kind.env_var()))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::missing_keys(missing))
        }
    }

    /// Overrides the tool worker pool size.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}
