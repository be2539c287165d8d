//! Compilation of per-sample artifacts into one run file.

use crate::tools::partial_path;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Suffix of the file listing the samples a run artifact was built from.
pub const MEMBERS_SUFFIX: &str = "members";

/// Returns the member list path kept next to a run artifact.
#[must_use]
pub fn members_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(MEMBERS_SUFFIX);
    artifact.with_file_name(name)
}

/// Returns true if the member list next to `artifact` names exactly `members`.
///
/// A missing or unreadable list never matches.
#[must_use]
pub fn members_match(artifact: &Path, members: &[String]) -> bool {
    let Ok(text) = std::fs::read_to_string(members_path(artifact)) else {
        return false;
    };
    let recorded: BTreeSet<&str> = text.lines().filter(|l| !l.is_empty()).collect();
    let current: BTreeSet<&str> = members.iter().map(String::as_str).collect();
    recorded == current
}

/// Records `members`, sorted, next to `artifact`.
///
/// # Errors
///
/// Returns the first I/O error.
pub fn write_members(artifact: &Path, members: &[String]) -> std::io::Result<()> {
    let dest = members_path(artifact);
    let partial = partial_path(&dest);
    let sorted: BTreeSet<&str> = members.iter().map(String::as_str).collect();
    let mut text = String::new();
    for member in sorted {
        text.push_str(member);
        text.push('\n');
    }
    std::fs::write(&partial, text)?;
    std::fs::rename(&partial, &dest)
}

fn scratch_path(dest: &Path) -> PathBuf {
    let mut partial = partial_path(dest).into_os_string();
    partial.push(".");
    partial.push(Uuid::new_v4().simple().to_string());
    PathBuf::from(partial)
}

/// One per-sample file taking part in a compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatherInput {
    /// The sample identifier.
    pub sample: String,
    /// The sample's artifact.
    pub path: PathBuf,
}

impl GatherInput {
    /// Creates a gather input.
    #[must_use]
    pub fn new(sample: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            sample: sample.into(),
            path: path.into(),
        }
    }
}

/// Concatenates `inputs` into `dest`, each preceded by a `## sample=<id>` line.
///
/// The file is written to a uniquely named scratch file next to `dest` and
/// renamed into place, so readers never observe a partial compilation and
/// concurrent compilations of the same file do not interleave.
///
/// # Errors
///
/// Returns the first I/O error; `dest` is left untouched in that case.
pub fn compile(inputs: &[GatherInput], dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let partial = scratch_path(dest);

    let result = (|| -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(&partial)?);
        for input in inputs {
            writeln!(out, "## sample={}", input.sample)?;
            let mut src = File::open(&input.path)?;
            std::io::copy(&mut src, &mut out)?;
            out.flush()?;
        }
        out.into_inner().map_err(std::io::IntoInnerError::into_error)?.sync_all()?;
        std::fs::rename(&partial, dest)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&partial);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_compile_in_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("S2.nucl.out");
        let b = dir.path().join("S1.nucl.out");
        std::fs::write(&a, "chr1\t10\n").unwrap();
        std::fs::write(&b, "chr1\t20\n").unwrap();

        let dest = dir.path().join("_run/cardiac.windows.tsv");
        compile(
            &[GatherInput::new("S2", &a), GatherInput::new("S1", &b)],
            &dest,
        )
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(&dest).unwrap(),
            "## sample=S2\nchr1\t10\n## sample=S1\nchr1\t20\n"
        );
        assert_eq!(std::fs::read_dir(dir.path().join("_run")).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_input_leaves_no_output() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out/identity.txt");

        let err = compile(&[GatherInput::new("S1", dir.path().join("nope"))], &dest);
        assert!(err.is_err());
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path().join("out")).unwrap().count(), 0);
    }

    #[test]
    fn test_concurrent_compilations_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let inputs: Vec<GatherInput> = (1..=4)
            .map(|i| {
                let path = dir.path().join(format!("S{i}.identity.mpileup"));
                std::fs::write(&path, "chr1\t100\tA\n".repeat(2000)).unwrap();
                GatherInput::new(format!("S{i}"), path)
            })
            .collect();
        let dest = dir.path().join("identity.txt");

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| compile(&inputs, &dest).unwrap());
            }
        });

        let expected: String = (1..=4)
            .map(|i| format!("## sample=S{i}\n{}", "chr1\t100\tA\n".repeat(2000)))
            .collect();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), expected);
    }

    #[test]
    fn test_member_list_matches_regardless_of_order() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("cardiac.cnv.tsv");
        let members = vec!["S2".to_string(), "S1".to_string()];

        assert!(!members_match(&artifact, &members));
        write_members(&artifact, &members).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("cardiac.cnv.tsv.members")).unwrap(),
            "S1\nS2\n"
        );
        assert!(members_match(&artifact, &["S1".to_string(), "S2".to_string()]));
        assert!(!members_match(&artifact, &["S1".to_string()]));
        assert!(!members_match(
            &artifact,
            &["S1".to_string(), "S2".to_string(), "S3".to_string()]
        ));
    }
}
