//! Fixtures for pipeline tests.

use std::path::{Path, PathBuf};

use crate::config::{ConfigFile, RunConfig};
use crate::errors::ConfigurationError;
use crate::pipeline::{artifact_path, StageGraph};

/// Panel configured by [`TEST_CONFIG_YAML`].
pub const TEST_PANEL: &str = "cardiac";

/// A complete configuration naming every tool; nothing it names needs to exist
/// when tools are run through [`super::ScriptedInvoker`].
pub const TEST_CONFIG_YAML: &str = "\
reference: /ref/hg19.fasta
known_sites: /ref/dbsnp_138.hg19.vcf
genome_build: hg19
threads: 2
workers: 4
lock_timeout_secs: 5
tools:
  aligner: /opt/ngsflow-test/bin/bwa
  samtools: /opt/ngsflow-test/bin/samtools
  picard: /opt/ngsflow-test/bin/picard
  gatk: /opt/ngsflow-test/bin/gatk
  gatk3: /opt/ngsflow-test/bin/gatk3
  freebayes: /opt/ngsflow-test/bin/freebayes
  octopus: /opt/ngsflow-test/bin/octopus
  snpeff: /opt/ngsflow-test/bin/snpeff
  cnv: /opt/ngsflow-test/bin/cnv
panels:
  cardiac:
    targets: /ref/BED/cardiac.bed
    windows: /ref/BED/cardiac_windows.bed
  hereditary:
    targets: /ref/BED/hereditary.bed
";

/// Parses [`TEST_CONFIG_YAML`].
pub fn test_config_file() -> Result<ConfigFile, ConfigurationError> {
    ConfigFile::from_yaml(TEST_CONFIG_YAML)
}

/// Resolves the test configuration for a run directory, without environment fallback.
pub fn test_config(datadir: &Path) -> Result<RunConfig, ConfigurationError> {
    RunConfig::resolve(test_config_file()?, datadir, TEST_PANEL, |_| None)
}

/// Writes an R1/R2 pair of small gzip-named read files for a sample.
pub fn write_paired_reads(datadir: &Path, sample: &str) -> std::io::Result<[PathBuf; 2]> {
    let r1 = datadir.join(format!("{sample}_S1_L001_R1_001.fastq.gz"));
    let r2 = datadir.join(format!("{sample}_S1_L001_R2_001.fastq.gz"));
    std::fs::create_dir_all(datadir)?;
    std::fs::write(&r1, b"@r1\nACGT\n+\nIIII\n")?;
    std::fs::write(&r2, b"@r2\nTGCA\n+\nIIII\n")?;
    Ok([r1, r2])
}

/// Writes a stage artifact as a previous run would have left it.
///
/// Returns `None` if the graph has no such stage.
pub fn write_artifact(
    config: &RunConfig,
    graph: &StageGraph,
    sample: &str,
    stage: &str,
) -> std::io::Result<Option<PathBuf>> {
    let Some(path) = artifact_path(config, graph, sample, stage) else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, format!("{stage} {sample} previous run\n"))?;
    Ok(Some(path))
}
