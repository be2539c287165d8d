//! Sample discovery and directory provisioning.
//!
//! Read files live flat in the run directory and are named
//! `<sample>_..._R<1|2>[_NNN].fastq.gz`. Files are grouped by the `sample`
//! capture of the read pattern, and mates are paired by the file name with
//! the read digit blanked out, so lane-split inputs pair lane by lane.

mod provision;

pub use provision::DirectoryProvisioner;

use crate::core::Sample;
use crate::errors::{ConfigurationError, DiscoveryError};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default read file pattern; `sample` and `read` groups are required.
pub const DEFAULT_READ_PATTERN: &str =
    r"^(?P<sample>[^_]+)_(?:.*_)?R(?P<read>[12])(?:_\d+)?\.f(?:ast)?q\.gz$";

/// Compiles a read pattern, checking it has the capture groups discovery needs.
pub fn compile_read_pattern(pattern: &str) -> Result<Regex, ConfigurationError> {
    let invalid = |message: String| ConfigurationError {
        message,
        keys: vec!["read_pattern".to_string()],
        source_path: None,
    };
    let regex = Regex::new(pattern)
        .map_err(|e| invalid(format!("read_pattern is not a valid regex: {e}")))?;
    let names: HashSet<&str> = regex.capture_names().flatten().collect();
    for group in ["sample", "read"] {
        if !names.contains(group) {
            return Err(invalid(format!(
                "read_pattern must define a (?P<{group}>...) group"
            )));
        }
    }
    Ok(regex)
}

/// The outcome of scanning a run directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Accepted samples, in first-seen order.
    pub samples: Vec<Sample>,
    /// Per-sample failures; these samples are not processed.
    pub rejected: Vec<DiscoveryError>,
}

/// One read file matched by the pattern.
#[derive(Debug)]
struct ReadFile {
    name: String,
    path: PathBuf,
    mate_key: String,
    read: u8,
}

/// Groups read files in a run directory into samples.
#[derive(Debug, Clone)]
pub struct SampleDiscovery {
    pattern: Regex,
}

impl SampleDiscovery {
    /// Creates a discovery using the given read pattern.
    pub fn new(pattern: &str) -> Result<Self, ConfigurationError> {
        Ok(Self {
            pattern: compile_read_pattern(pattern)?,
        })
    }

    /// Scans `datadir` and returns the samples to process.
    ///
    /// With `explicit` empty, every sample found is returned in first-seen
    /// order over the sorted directory listing. Otherwise only the requested
    /// identifiers are returned, in the order requested; those with no reads
    /// are rejected with [`DiscoveryError::UnknownSample`].
    ///
    /// # Errors
    ///
    /// Fails only when the run directory itself cannot be read.
    pub fn discover(&self, datadir: &Path, explicit: &[String]) -> Result<Discovery, DiscoveryError> {
        let (order, mut groups) = self.scan(datadir)?;

        let requested: Vec<String> = if explicit.is_empty() {
            order
        } else {
            let mut seen = HashSet::new();
            explicit
                .iter()
                .filter(|id| seen.insert(id.as_str()))
                .cloned()
                .collect()
        };

        let mut discovery = Discovery::default();
        for id in requested {
            let Some(files) = groups.remove(&id) else {
                warn!(sample = %id, "Requested sample has no reads");
                discovery.rejected.push(DiscoveryError::UnknownSample {
                    sample: id,
                    datadir: datadir.to_path_buf(),
                });
                continue;
            };
            match pair(&id, files) {
                Ok(reads) => {
                    debug!(sample = %id, reads = reads.len(), "Discovered sample");
                    discovery.samples.push(Sample::new(id, reads));
                }
                Err(e) => {
                    warn!(sample = %id, error = %e, "Rejected sample");
                    discovery.rejected.push(e);
                }
            }
        }

        info!(
            datadir = %datadir.display(),
            samples = discovery.samples.len(),
            rejected = discovery.rejected.len(),
            "Sample discovery finished"
        );
        Ok(discovery)
    }

    fn scan(
        &self,
        datadir: &Path,
    ) -> Result<(Vec<String>, HashMap<String, Vec<ReadFile>>), DiscoveryError> {
        let io_err = |e: std::io::Error| DiscoveryError::Io {
            path: datadir.to_path_buf(),
            message: e.to_string(),
        };

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(datadir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                entries.push((name.to_string(), path));
            }
        }
        entries.sort();

        let mut order = Vec::new();
        let mut groups: HashMap<String, Vec<ReadFile>> = HashMap::new();
        for (name, path) in entries {
            let Some(caps) = self.pattern.captures(&name) else {
                continue;
            };
            let (Some(sample), Some(read)) = (caps.name("sample"), caps.name("read")) else {
                continue;
            };
            let read_no = match read.as_str() {
                "1" => 1,
                "2" => 2,
                other => {
                    debug!(file = %name, read = other, "Ignoring file with unknown read number");
                    continue;
                }
            };
            let mate_key = format!("{}?{}", &name[..read.start()], &name[read.end()..]);
            let id = sample.as_str().to_string();
            if !groups.contains_key(&id) {
                order.push(id.clone());
            }
            groups.entry(id).or_default().push(ReadFile {
                name,
                path,
                mate_key,
                read: read_no,
            });
        }
        Ok((order, groups))
    }
}

/// Orders a sample's reads as mate pairs (R1, R2, R1, R2, ...).
fn pair(sample: &str, files: Vec<ReadFile>) -> Result<Vec<PathBuf>, DiscoveryError> {
    let r1 = files.iter().filter(|f| f.read == 1).count();
    let r2 = files.len() - r1;

    let mut mates: BTreeMap<String, [Option<ReadFile>; 2]> = BTreeMap::new();
    for file in files {
        let slot = usize::from(file.read - 1);
        let key = file.mate_key.clone();
        mates.entry(key).or_default()[slot] = Some(file);
    }

    let mut reads = Vec::with_capacity(r1 + r2);
    let mut unmatched = Vec::new();
    for mate in mates.into_values() {
        match mate {
            [Some(first), Some(second)] => {
                reads.push(first.path);
                reads.push(second.path);
            }
            [Some(only), None] | [None, Some(only)] => unmatched.push(only.name),
            [None, None] => {}
        }
    }

    if unmatched.is_empty() && !reads.is_empty() {
        Ok(reads)
    } else {
        Err(DiscoveryError::UnpairedInput {
            sample: sample.to_string(),
            r1,
            r2,
            unmatched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), b"@read\nACGT\n+\nIIII\n").unwrap();
        }
    }

    fn default_discovery() -> SampleDiscovery {
        SampleDiscovery::new(DEFAULT_READ_PATTERN).unwrap()
    }

    fn ids(discovery: &Discovery) -> Vec<&str> {
        discovery.samples.iter().map(Sample::id).collect()
    }

    fn names(sample: &Sample) -> Vec<String> {
        sample
            .reads()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_discovers_paired_samples() {
        let dir = TempDir::new().unwrap();
        touch(
            dir.path(),
            &[
                "NA12878_S2_L001_R2_001.fastq.gz",
                "NA12877_S1_L001_R1_001.fastq.gz",
                "NA12878_S2_L001_R1_001.fastq.gz",
                "NA12877_S1_L001_R2_001.fastq.gz",
                "SampleSheet.csv",
            ],
        );
        std::fs::create_dir(dir.path().join("NA12877")).unwrap();

        let discovery = default_discovery().discover(dir.path(), &[]).unwrap();
        assert_eq!(ids(&discovery), vec!["NA12877", "NA12878"]);
        assert!(discovery.rejected.is_empty());
        assert_eq!(
            names(&discovery.samples[0]),
            vec![
                "NA12877_S1_L001_R1_001.fastq.gz",
                "NA12877_S1_L001_R2_001.fastq.gz"
            ]
        );
    }

    #[test]
    fn test_lane_split_reads_pair_by_lane() {
        let dir = TempDir::new().unwrap();
        touch(
            dir.path(),
            &[
                "S1_L002_R1_001.fastq.gz",
                "S1_L001_R2_001.fastq.gz",
                "S1_L001_R1_001.fastq.gz",
                "S1_L002_R2_001.fastq.gz",
            ],
        );

        let discovery = default_discovery().discover(dir.path(), &[]).unwrap();
        assert_eq!(
            names(&discovery.samples[0]),
            vec![
                "S1_L001_R1_001.fastq.gz",
                "S1_L001_R2_001.fastq.gz",
                "S1_L002_R1_001.fastq.gz",
                "S1_L002_R2_001.fastq.gz"
            ]
        );
    }

    #[test]
    fn test_explicit_samples_keep_request_order() {
        let dir = TempDir::new().unwrap();
        touch(
            dir.path(),
            &["S1_R1.fastq.gz", "S1_R2.fastq.gz", "S2_R1.fastq.gz", "S2_R2.fastq.gz"],
        );

        let explicit = vec!["S2".to_string(), "S1".to_string(), "S2".to_string()];
        let discovery = default_discovery()
            .discover(dir.path(), &explicit)
            .unwrap();
        assert_eq!(ids(&discovery), vec!["S2", "S1"]);
    }

    #[test]
    fn test_unknown_sample_rejected() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), &["S1_R1.fastq.gz", "S1_R2.fastq.gz"]);

        let explicit = vec!["S1".to_string(), "S9".to_string()];
        let discovery = default_discovery()
            .discover(dir.path(), &explicit)
            .unwrap();
        assert_eq!(ids(&discovery), vec!["S1"]);
        assert_eq!(
            discovery.rejected,
            vec![DiscoveryError::UnknownSample {
                sample: "S9".to_string(),
                datadir: dir.path().to_path_buf(),
            }]
        );
    }

    #[test]
    fn test_unpaired_sample_rejected_others_kept() {
        let dir = TempDir::new().unwrap();
        touch(
            dir.path(),
            &[
                "S1_R1.fastq.gz",
                "S1_R2.fastq.gz",
                "S2_L001_R1_001.fastq.gz",
                "S2_L001_R2_001.fastq.gz",
                "S2_L002_R1_001.fastq.gz",
            ],
        );

        let discovery = default_discovery().discover(dir.path(), &[]).unwrap();
        assert_eq!(ids(&discovery), vec!["S1"]);
        assert_eq!(
            discovery.rejected,
            vec![DiscoveryError::UnpairedInput {
                sample: "S2".to_string(),
                r1: 2,
                r2: 1,
                unmatched: vec!["S2_L002_R1_001.fastq.gz".to_string()],
            }]
        );
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = default_discovery()
            .discover(&dir.path().join("missing"), &[])
            .unwrap_err();
        assert_eq!(err.kind(), "DiscoveryIoError");
    }

    #[test]
    fn test_custom_pattern() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), &["run7-S1.read1.fq.gz", "run7-S1.read2.fq.gz"]);

        let discovery = SampleDiscovery::new(r"^run\d+-(?P<sample>\w+)\.read(?P<read>[12])\.fq\.gz$")
            .unwrap()
            .discover(dir.path(), &[])
            .unwrap();
        assert_eq!(ids(&discovery), vec!["S1"]);
    }

    #[test]
    fn test_pattern_requires_groups() {
        let err = SampleDiscovery::new(r"^(?P<sample>\w+)\.fq\.gz$").unwrap_err();
        assert!(err.message.contains("read"));
        assert_eq!(err.keys, vec!["read_pattern".to_string()]);
    }
}
