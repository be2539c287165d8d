//! In-process rewrites of upstream artifacts.

use crate::pipeline::TransformKind;
use crate::tools::partial_path;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// VCF header lines dropped by [`TransformKind::StripContigHeaders`].
const CONTIG_HEADER: &str = "##contig=<ID";

/// Bases counted by [`TransformKind::BaseCounts`], in output column order.
const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];

/// Applies `kind` to `input` and writes the result to `dest`.
///
/// Output goes to a `.partial` file renamed into place on success.
///
/// # Errors
///
/// Returns the first I/O error; `dest` is left untouched in that case.
pub fn apply(kind: TransformKind, input: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let partial = partial_path(dest);

    let result = (|| -> std::io::Result<()> {
        let reader = BufReader::new(File::open(input)?);
        let mut out = BufWriter::new(File::create(&partial)?);
        for line in reader.lines() {
            let line = line?;
            match kind {
                TransformKind::StripContigHeaders => {
                    if !line.starts_with(CONTIG_HEADER) {
                        writeln!(out, "{line}")?;
                    }
                }
                TransformKind::BaseCounts => {
                    if let Some(row) = base_counts(&line) {
                        writeln!(out, "{row}")?;
                    }
                }
            }
        }
        out.into_inner().map_err(std::io::IntoInnerError::into_error)?.sync_all()?;
        std::fs::rename(&partial, dest)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&partial);
    }
    result
}

/// Counts A, C, G and T in the read-bases column of one pileup line.
///
/// Both strands count. Lines with fewer than five columns yield nothing.
fn base_counts(line: &str) -> Option<String> {
    let mut fields = line.split_whitespace();
    let chrom = fields.next()?;
    let pos = fields.next()?;
    let bases = fields.nth(2)?;

    let mut counts = [0usize; 4];
    for b in bases.bytes().map(|b| b.to_ascii_uppercase()) {
        if let Some(i) = BASES.iter().position(|base| *base == b) {
            counts[i] += 1;
        }
    }
    Some(format!(
        "{chrom}\t{pos}\t{}\t{}\t{}\t{}",
        counts[0], counts[1], counts[2], counts[3]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_strip_contig_headers() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("S1_freebayes.sorted.vcf");
        std::fs::write(
            &input,
            "##fileformat=VCFv4.2\n##contig=<ID=chr1,length=249250621>\n#CHROM\tPOS\nchr1\t100\n",
        )
        .unwrap();
        let dest = dir.path().join("VCF/S1_freebayes.final.vcf");

        apply(TransformKind::StripContigHeaders, &input, &dest).unwrap();

        assert_eq!(
            std::fs::read_to_string(&dest).unwrap(),
            "##fileformat=VCFv4.2\n#CHROM\tPOS\nchr1\t100\n"
        );
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn test_base_counts_from_pileup() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("S1.identity.mpileup");
        std::fs::write(
            &input,
            "chr1\t1000\tN\t6\tAAcg^]T$t\tIIIIII\nchr2\t50\tN\t0\t*\t*\nshort\tline\n",
        )
        .unwrap();
        let dest = dir.path().join("S1.identity.txt");

        apply(TransformKind::BaseCounts, &input, &dest).unwrap();

        assert_eq!(
            std::fs::read_to_string(&dest).unwrap(),
            "chr1\t1000\t2\t1\t1\t2\nchr2\t50\t0\t0\t0\t0\n"
        );
    }

    #[test]
    fn test_missing_input_leaves_no_output() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.vcf");

        assert!(apply(TransformKind::StripContigHeaders, &dir.path().join("nope"), &dest).is_err());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }
}
