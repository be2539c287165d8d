//! The standard NGS panel stage graph.
//!
//! ```text
//! alignment -> duplicate_removal -> recalibration_table -> recalibration
//!   recalibration -> {variants_gatk, variants_gatk3, variants_freebayes, variants_octopus}
//!   variants_freebayes -> variants_freebayes_sorted -> variants_freebayes_final
//!   {variants_gatk, variants_gatk3, variants_freebayes_final, variants_octopus} -> vcf_merge
//!   vcf_merge -> annotation -> {coverage, coverage_panel, identity}
//!   identity -> identity_table
//!   recalibration -> {alignment_metrics, yield_metrics, hs_metrics, hs_metrics_panel}
//!   coverage (every sample) -> copy_number (once per run)
//! ```

use super::{StageDescriptor, StageGraph, Transform, TransformKind};
use crate::config::ToolKind;
use crate::errors::GraphValidationError;
use crate::tools::CommandTemplate;

/// Alignment of raw reads against the reference.
pub const ALIGNMENT: &str = "alignment";
/// Duplicate marking and removal.
pub const DUPLICATE_REMOVAL: &str = "duplicate_removal";
/// Base quality recalibration model.
pub const RECALIBRATION_TABLE: &str = "recalibration_table";
/// Base quality recalibration.
pub const RECALIBRATION: &str = "recalibration";
/// HaplotypeCaller, current generation.
pub const VARIANTS_GATK: &str = "variants_gatk";
/// HaplotypeCaller, previous generation.
pub const VARIANTS_GATK3: &str = "variants_gatk3";
/// FreeBayes caller.
pub const VARIANTS_FREEBAYES: &str = "variants_freebayes";
/// Octopus caller.
pub const VARIANTS_OCTOPUS: &str = "variants_octopus";
/// Coordinate sort of the FreeBayes VCF against the sequence dictionary.
pub const VARIANTS_FREEBAYES_SORTED: &str = "variants_freebayes_sorted";
/// Sorted FreeBayes VCF without contig header lines.
pub const VARIANTS_FREEBAYES_FINAL: &str = "variants_freebayes_final";
/// Merge of every caller's VCF.
pub const VCF_MERGE: &str = "vcf_merge";
/// Functional annotation of the merged VCF.
pub const ANNOTATION: &str = "annotation";
/// Per-target coverage and hybrid-selection metrics.
pub const COVERAGE: &str = "coverage";
/// Per-base coverage over the panel's own interval list.
pub const COVERAGE_PANEL: &str = "coverage_panel";
/// Pileup at identity sites.
pub const IDENTITY: &str = "identity";
/// Base counts per identity site.
pub const IDENTITY_TABLE: &str = "identity_table";
/// Alignment summary metrics.
pub const ALIGNMENT_METRICS: &str = "alignment_metrics";
/// Quality yield metrics.
pub const YIELD_METRICS: &str = "yield_metrics";
/// Hybrid-selection metrics over the bait intervals.
pub const HS_METRICS: &str = "hs_metrics";
/// Hybrid-selection metrics over the panel's interval list.
pub const HS_METRICS_PANEL: &str = "hs_metrics_panel";
/// Copy-number analysis across every sample of the run.
pub const COPY_NUMBER: &str = "copy_number";

/// The independent variant callers, in declaration order.
pub const VARIANT_CALLERS: [&str; 4] = [
    VARIANTS_GATK,
    VARIANTS_GATK3,
    VARIANTS_FREEBAYES,
    VARIANTS_OCTOPUS,
];

/// The VCFs combined by `vcf_merge`, one per caller.
pub const MERGE_INPUTS: [&str; 4] = [
    VARIANTS_GATK,
    VARIANTS_GATK3,
    VARIANTS_FREEBAYES_FINAL,
    VARIANTS_OCTOPUS,
];

const RECAL_BAM: &str = "{sample_dir}/BAM/{sample}.recal_reads.bam";

fn vcf(suffix: &str) -> String {
    format!("{{sample_dir}}/VCF/{{sample}}_{suffix}.vcf")
}

/// Returns the standard stage descriptors in declaration order.
#[must_use]
pub fn standard_stages() -> Vec<StageDescriptor> {
    vec![
        StageDescriptor::new(
            ALIGNMENT,
            "{sample_dir}/BAM/{sample}.aligned.sam",
            CommandTemplate::new(ToolKind::Aligner)
                .args(["mem", "-t", "{threads}", "-R"])
                .arg(r"@RG\tID:{sample}\tLB:{panel}\tPL:Illumina\tSM:{sample}\tPU:None")
                .args(["{reference}", "{reads}"])
                .stdout_to("{sample_dir}/BAM/{sample}.aligned.sam"),
        ),
        StageDescriptor::new(
            DUPLICATE_REMOVAL,
            "{sample_dir}/BAM/{sample}.dedup.bam",
            CommandTemplate::new(ToolKind::Picard).args([
                "MarkDuplicates",
                "INPUT={sample_dir}/BAM/{sample}.aligned.sam",
                "OUTPUT={sample_dir}/BAM/{sample}.dedup.bam",
                "METRICS_FILE={sample_dir}/Metrics/{sample}.dedup_metrics.txt",
                "ASSUME_SORT_ORDER=queryname",
                "QUIET=true",
            ]),
        )
        .with_dependency(ALIGNMENT),
        StageDescriptor::new(
            RECALIBRATION_TABLE,
            "{sample_dir}/BAM/{sample}.recal_data.table",
            CommandTemplate::new(ToolKind::Gatk).args([
                "BaseRecalibrator",
                "-R",
                "{reference}",
                "-I",
                "{sample_dir}/BAM/{sample}.dedup.bam",
                "--known-sites",
                "{known_sites}",
                "-L",
                "{targets}",
                "-O",
                "{sample_dir}/BAM/{sample}.recal_data.table",
            ]),
        )
        .with_dependency(DUPLICATE_REMOVAL),
        StageDescriptor::new(
            RECALIBRATION,
            RECAL_BAM,
            CommandTemplate::new(ToolKind::Gatk).args([
                "ApplyBQSR",
                "-R",
                "{reference}",
                "-I",
                "{sample_dir}/BAM/{sample}.dedup.bam",
                "--bqsr-recal-file",
                "{sample_dir}/BAM/{sample}.recal_data.table",
                "-O",
                RECAL_BAM,
            ]),
        )
        .with_dependencies([DUPLICATE_REMOVAL, RECALIBRATION_TABLE]),
        StageDescriptor::new(
            VARIANTS_GATK,
            vcf("GATK"),
            CommandTemplate::new(ToolKind::Gatk)
                .args(["HaplotypeCaller", "-R", "{reference}", "-I", RECAL_BAM, "-O"])
                .arg(vcf("GATK"))
                .args(["-L", "{targets}", "-ip", "2", "-A", "StrandBiasBySample"]),
        )
        .with_dependency(RECALIBRATION),
        StageDescriptor::new(
            VARIANTS_GATK3,
            vcf("GATK3"),
            CommandTemplate::new(ToolKind::Gatk3)
                .args(["-T", "HaplotypeCaller", "-R", "{reference}", "-I", RECAL_BAM])
                .args(["--genotyping_mode", "DISCOVERY", "-ip", "10", "-stand_call_conf", "30"])
                .arg("-o")
                .arg(vcf("GATK3"))
                .args(["-L", "{targets}", "-nct", "{threads}", "-A", "StrandBiasBySample"]),
        )
        .with_dependency(RECALIBRATION),
        StageDescriptor::new(
            VARIANTS_FREEBAYES,
            vcf("freebayes"),
            CommandTemplate::new(ToolKind::Freebayes)
                .args(["-f", "{reference}", "-v"])
                .arg(vcf("freebayes"))
                .args(["-t", "{targets}", "-P", "1", RECAL_BAM]),
        )
        .with_dependency(RECALIBRATION),
        StageDescriptor::new(
            VARIANTS_OCTOPUS,
            vcf("octopus"),
            CommandTemplate::new(ToolKind::Octopus)
                .args(["-R", "{reference}", "-I", RECAL_BAM, "-t", "{targets}", "-o"])
                .arg(vcf("octopus")),
        )
        .with_dependency(RECALIBRATION),
        StageDescriptor::new(
            VARIANTS_FREEBAYES_SORTED,
            vcf("freebayes.sorted"),
            CommandTemplate::new(ToolKind::Picard)
                .arg("SortVcf")
                .arg(format!("I={}", vcf("freebayes")))
                .arg(format!("O={}", vcf("freebayes.sorted")))
                .args(["SEQUENCE_DICTIONARY={sequence_dictionary}", "QUIET=true"]),
        )
        .with_dependency(VARIANTS_FREEBAYES),
        StageDescriptor::new(
            VARIANTS_FREEBAYES_FINAL,
            vcf("freebayes.final"),
            Transform::new(TransformKind::StripContigHeaders, vcf("freebayes.sorted")),
        )
        .with_dependency(VARIANTS_FREEBAYES_SORTED),
        StageDescriptor::new(
            VCF_MERGE,
            vcf("merged"),
            CommandTemplate::new(ToolKind::Gatk3)
                .args(["-T", "CombineVariants", "-R", "{reference}"])
                .args(["--variant:gatk".to_string(), vcf("GATK")])
                .args(["--variant:gatk3".to_string(), vcf("GATK3")])
                .args(["--variant:freebayes".to_string(), vcf("freebayes.final")])
                .args(["--variant:octopus".to_string(), vcf("octopus")])
                .arg("-o")
                .arg(vcf("merged"))
                .args(["--genotypemergeoption", "UNSORTED", "--mergeInfoWithMaxAC", "--minimumN", "2"]),
        )
        .with_dependencies(MERGE_INPUTS),
        StageDescriptor::new(
            ANNOTATION,
            vcf("merged.ann"),
            CommandTemplate::new(ToolKind::Snpeff)
                .arg("{genome_build}")
                .arg(vcf("merged"))
                .stdout_to(vcf("merged.ann")),
        )
        .with_dependency(VCF_MERGE),
        StageDescriptor::new(
            COVERAGE,
            "{sample_dir}/QC/{sample}.nucl.out",
            CommandTemplate::new(ToolKind::Picard)
                .args(["CollectHsMetrics", "BI={baits}", "TARGET_INTERVALS={targets}"])
                .arg(format!("I={RECAL_BAM}"))
                .args([
                    "R={reference}",
                    "PER_BASE_COVERAGE={sample_dir}/QC/{sample}.nucl.out",
                    "OUTPUT={sample_dir}/QC/{sample}.hs_metrics.txt",
                    "MINIMUM_MAPPING_QUALITY=0",
                    "MINIMUM_BASE_QUALITY=0",
                    "QUIET=true",
                ]),
        )
        .with_dependency(ANNOTATION),
        StageDescriptor::new(
            COVERAGE_PANEL,
            "{sample_dir}/QC/{sample}.nucl.panel.out",
            CommandTemplate::new(ToolKind::Picard)
                .args([
                    "CollectHsMetrics",
                    "BI={target_intervals}",
                    "TARGET_INTERVALS={target_intervals}",
                ])
                .arg(format!("I={RECAL_BAM}"))
                .args([
                    "R={reference}",
                    "PER_BASE_COVERAGE={sample_dir}/QC/{sample}.nucl.panel.out",
                    "OUTPUT={sample_dir}/QC/{sample}.panel.out",
                    "MINIMUM_MAPPING_QUALITY=0",
                    "MINIMUM_BASE_QUALITY=0",
                    "QUIET=true",
                ]),
        )
        .with_dependency(ANNOTATION),
        StageDescriptor::new(
            IDENTITY,
            "{sample_dir}/QC/{sample}.identity.mpileup",
            CommandTemplate::new(ToolKind::Samtools)
                .args(["mpileup", "-l", "{identity_sites}", RECAL_BAM])
                .stdout_to("{sample_dir}/QC/{sample}.identity.mpileup"),
        )
        .with_dependency(ANNOTATION),
        StageDescriptor::new(
            IDENTITY_TABLE,
            "{sample_dir}/QC/{sample}.identity.txt",
            Transform::new(TransformKind::BaseCounts, "{sample_dir}/QC/{sample}.identity.mpileup"),
        )
        .with_dependency(IDENTITY),
        StageDescriptor::new(
            ALIGNMENT_METRICS,
            "{sample_dir}/Metrics/{sample}.alignment_summary.txt",
            CommandTemplate::new(ToolKind::Picard)
                .args(["CollectAlignmentSummaryMetrics", "R={reference}"])
                .arg(format!("I={RECAL_BAM}"))
                .args([
                    "O={sample_dir}/Metrics/{sample}.alignment_summary.txt",
                    "QUIET=true",
                ]),
        )
        .with_dependency(RECALIBRATION),
        StageDescriptor::new(
            YIELD_METRICS,
            "{sample_dir}/Metrics/{sample}.yield.out",
            CommandTemplate::new(ToolKind::Picard)
                .arg("CollectQualityYieldMetrics")
                .arg(format!("I={RECAL_BAM}"))
                .args(["O={sample_dir}/Metrics/{sample}.yield.out", "QUIET=true"]),
        )
        .with_dependency(RECALIBRATION),
        StageDescriptor::new(
            HS_METRICS,
            "{sample_dir}/Metrics/{sample}.hs_metrics.out",
            CommandTemplate::new(ToolKind::Picard)
                .arg("CollectHsMetrics")
                .arg(format!("I={RECAL_BAM}"))
                .args([
                    "O={sample_dir}/Metrics/{sample}.hs_metrics.out",
                    "R={reference}",
                    "BAIT_INTERVALS={baits}",
                    "TARGET_INTERVALS={baits}",
                    "QUIET=true",
                ]),
        )
        .with_dependency(RECALIBRATION),
        StageDescriptor::new(
            HS_METRICS_PANEL,
            "{sample_dir}/Metrics/{sample}.hs_metrics.panel.out",
            CommandTemplate::new(ToolKind::Picard)
                .arg("CollectHsMetrics")
                .arg(format!("I={RECAL_BAM}"))
                .args([
                    "O={sample_dir}/Metrics/{sample}.hs_metrics.panel.out",
                    "R={reference}",
                    "BAIT_INTERVALS={target_intervals}",
                    "TARGET_INTERVALS={target_intervals}",
                    "QUIET=true",
                ]),
        )
        .with_dependency(RECALIBRATION),
        StageDescriptor::new(
            COPY_NUMBER,
            "{run_dir}/{panel}.cnv.tsv",
            CommandTemplate::new(ToolKind::Cnv).args([
                "--windows",
                "{windows}",
                "--input",
                "{gathered}",
                "--output",
                "{run_dir}/{panel}.cnv.tsv",
            ]),
        )
        .with_dependency(COVERAGE)
        .run_scoped()
        .with_gather(COVERAGE, "{run_dir}/{panel}.windows.tsv"),
    ]
}

/// Builds the standard stage graph.
///
/// # Errors
///
/// Never fails for the built-in descriptors; the result is kept fallible so
/// callers handle it like any other graph.
pub fn standard_graph() -> Result<StageGraph, GraphValidationError> {
    StageGraph::new(standard_stages())
}
