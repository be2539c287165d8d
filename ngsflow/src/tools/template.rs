//! Command and artifact path templates.
//!
//! Templates use `{name}` placeholders. `{{` and `}}` produce literal braces.
//! `{reads}` expands to one argument per input read file and must therefore
//! make up a whole argument on its own.

use crate::config::{RunConfig, ToolKind};
use crate::core::{RunLayout, StageTarget};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Placeholders holding a single value.
pub const SCALAR_PLACEHOLDERS: [&str; 16] = [
    "sample",
    "sample_dir",
    "datadir",
    "run_dir",
    "reference",
    "sequence_dictionary",
    "known_sites",
    "targets",
    "target_intervals",
    "baits",
    "windows",
    "identity_sites",
    "panel",
    "threads",
    "genome_build",
    "gathered",
];

/// Placeholder expanding to the input read files.
pub const READS_PLACEHOLDER: &str = "reads";

/// Errors raised while parsing or rendering a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// The placeholder name is not recognised.
    #[error("unknown placeholder {{{0}}}")]
    Unknown(String),

    /// The placeholder is known but has no value for this run.
    #[error("placeholder {{{0}}} has no configured value")]
    Unset(String),

    /// A list placeholder was embedded in surrounding text.
    #[error("placeholder {{{0}}} must be a whole argument")]
    ListInText(String),

    /// Unbalanced braces.
    #[error("malformed template '{0}'")]
    Malformed(String),
}

enum Piece<'a> {
    Text(&'a str),
    Brace(char),
    Placeholder(&'a str),
}

fn parse(template: &str) -> Result<Vec<Piece<'_>>, TemplateError> {
    let mut pieces = Vec::new();
    let mut rest = template;

    while !rest.is_empty() {
        let Some(pos) = rest.find(['{', '}']) else {
            pieces.push(Piece::Text(rest));
            break;
        };
        if pos > 0 {
            pieces.push(Piece::Text(&rest[..pos]));
        }
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            pieces.push(Piece::Brace('{'));
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            pieces.push(Piece::Brace('}'));
            rest = &tail[2..];
        } else if tail.starts_with('}') {
            return Err(TemplateError::Malformed(template.to_string()));
        } else {
            let close = tail
                .find('}')
                .ok_or_else(|| TemplateError::Malformed(template.to_string()))?;
            let name = &tail[1..close];
            if name.is_empty() || name.contains('{') {
                return Err(TemplateError::Malformed(template.to_string()));
            }
            pieces.push(Piece::Placeholder(name));
            rest = &tail[close + 1..];
        }
    }

    Ok(pieces)
}

/// Returns every placeholder named in `template`, validating that each is known.
pub fn placeholders(template: &str) -> Result<BTreeSet<String>, TemplateError> {
    let pieces = parse(template)?;
    let mut names = BTreeSet::new();
    for piece in &pieces {
        if let Piece::Placeholder(name) = piece {
            if *name == READS_PLACEHOLDER {
                if pieces.len() != 1 {
                    return Err(TemplateError::ListInText((*name).to_string()));
                }
            } else if !SCALAR_PLACEHOLDERS.contains(name) {
                return Err(TemplateError::Unknown((*name).to_string()));
            }
            names.insert((*name).to_string());
        }
    }
    Ok(names)
}

/// Returns the Picard interval list kept next to a BED file: `x.bed` becomes `x.picard.bed`.
#[must_use]
fn interval_list(bed: &Path) -> PathBuf {
    match bed.extension() {
        Some(ext) if ext == "bed" => bed.with_extension("picard.bed"),
        _ => bed.to_path_buf(),
    }
}

/// Values available to templates for one stage target.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: HashMap<&'static str, String>,
    reads: Vec<String>,
}

impl TemplateContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the context for a target under the given configuration.
    #[must_use]
    pub fn for_target(config: &RunConfig, target: &StageTarget) -> Self {
        let layout = RunLayout::new(&config.datadir);
        let mut ctx = Self::new()
            .with("sample", &target.id)
            .with_path("sample_dir", target.dir())
            .with_path("datadir", &config.datadir)
            .with_path("run_dir", &layout.run_dir())
            .with_path("reference", &config.reference)
            .with_path("sequence_dictionary", &config.reference.with_extension("dict"))
            .with_path("known_sites", &config.known_sites)
            .with_path("targets", &config.panel.targets)
            .with_path("target_intervals", &interval_list(&config.panel.targets))
            .with_path("baits", &config.panel.baits)
            .with_path("identity_sites", &config.identity_sites)
            .with("panel", &config.panel.name)
            .with("threads", config.threads.to_string())
            .with("genome_build", &config.genome_build)
            .with_reads(target.reads.iter().map(|p| p.display().to_string()).collect());
        if let Some(windows) = &config.panel.windows {
            ctx = ctx.with_path("windows", windows);
        }
        ctx
    }

    /// Sets a scalar value. Names outside [`SCALAR_PLACEHOLDERS`] are ignored.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        if let Some(key) = SCALAR_PLACEHOLDERS.iter().find(|k| **k == name) {
            self.values.insert(*key, value.into());
        }
        self
    }

    /// Sets a scalar value from a path.
    #[must_use]
    pub fn with_path(self, name: &str, path: &Path) -> Self {
        self.with(name, path.display().to_string())
    }

    /// Sets the read files.
    #[must_use]
    pub fn with_reads(mut self, reads: Vec<String>) -> Self {
        self.reads = reads;
        self
    }

    /// Returns a scalar value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    fn lookup(&self, name: &str) -> Result<&str, TemplateError> {
        if name == READS_PLACEHOLDER {
            return Err(TemplateError::ListInText(name.to_string()));
        }
        if !SCALAR_PLACEHOLDERS.contains(&name) {
            return Err(TemplateError::Unknown(name.to_string()));
        }
        self.get(name)
            .ok_or_else(|| TemplateError::Unset(name.to_string()))
    }

    /// Renders a single-valued template.
    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        for piece in parse(template)? {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Brace(c) => out.push(c),
                Piece::Placeholder(name) => out.push_str(self.lookup(name)?),
            }
        }
        Ok(out)
    }

    /// Renders a path template.
    pub fn render_path(&self, template: &str) -> Result<PathBuf, TemplateError> {
        self.render(template).map(PathBuf::from)
    }

    /// Renders one argument template into zero or more arguments.
    pub fn render_arg(&self, template: &str) -> Result<Vec<String>, TemplateError> {
        if template == format!("{{{READS_PLACEHOLDER}}}") {
            return Ok(self.reads.clone());
        }
        self.render(template).map(|arg| vec![arg])
    }
}

/// A command line rendered for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    /// The tool to run.
    pub tool: ToolKind,
    /// Rendered arguments.
    pub args: Vec<String>,
    /// Where stdout is captured, if anywhere.
    pub stdout: Option<PathBuf>,
}

/// The external command a stage runs when its artifact is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    tool: ToolKind,
    args: Vec<String>,
    stdout: Option<String>,
}

impl CommandTemplate {
    /// Creates a template for a tool with no arguments.
    #[must_use]
    pub fn new(tool: ToolKind) -> Self {
        Self {
            tool,
            args: Vec::new(),
            stdout: None,
        }
    }

    /// Appends one argument template.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several argument templates.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Captures the tool's stdout into the rendered path.
    #[must_use]
    pub fn stdout_to(mut self, path: impl Into<String>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    /// Returns the tool.
    #[must_use]
    pub fn tool(&self) -> ToolKind {
        self.tool
    }

    /// Returns the argument templates.
    #[must_use]
    pub fn arg_templates(&self) -> &[String] {
        &self.args
    }

    /// Returns the stdout path template.
    #[must_use]
    pub fn stdout_template(&self) -> Option<&str> {
        self.stdout.as_deref()
    }

    /// Returns every placeholder used, validating each.
    pub fn placeholders(&self) -> Result<BTreeSet<String>, TemplateError> {
        let mut names = BTreeSet::new();
        for arg in &self.args {
            names.extend(placeholders(arg)?);
        }
        if let Some(stdout) = &self.stdout {
            let used = placeholders(stdout)?;
            if used.contains(READS_PLACEHOLDER) {
                return Err(TemplateError::ListInText(READS_PLACEHOLDER.to_string()));
            }
            names.extend(used);
        }
        Ok(names)
    }

    /// Renders the command for a context.
    pub fn render(&self, ctx: &TemplateContext) -> Result<RenderedCommand, TemplateError> {
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            args.extend(ctx.render_arg(arg)?);
        }
        let stdout = self
            .stdout
            .as_deref()
            .map(|t| ctx.render_path(t))
            .transpose()?;

        Ok(RenderedCommand {
            tool: self.tool,
            args,
            stdout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx() -> TemplateContext {
        TemplateContext::new()
            .with("sample", "S1")
            .with("sample_dir", "/runs/r1/S1")
            .with("threads", "4")
            .with_reads(vec![
                "/runs/r1/S1_R1.fastq.gz".to_string(),
                "/runs/r1/S1_R2.fastq.gz".to_string(),
            ])
    }

    #[test]
    fn test_render_scalar() {
        assert_eq!(
            ctx().render("{sample_dir}/BAM/{sample}.dedup.bam").unwrap(),
            "/runs/r1/S1/BAM/S1.dedup.bam"
        );
    }

    #[test]
    fn test_escaped_braces() {
        assert_eq!(ctx().render("{{x}} {sample}").unwrap(), "{x} S1");
    }

    #[test]
    fn test_unknown_and_unset() {
        assert_eq!(
            ctx().render("{nope}"),
            Err(TemplateError::Unknown("nope".to_string()))
        );
        assert_eq!(
            ctx().render("{windows}"),
            Err(TemplateError::Unset("windows".to_string()))
        );
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(ctx().render("{sample"), Err(TemplateError::Malformed(_))));
        assert!(matches!(ctx().render("a}b"), Err(TemplateError::Malformed(_))));
        assert!(matches!(ctx().render("{}"), Err(TemplateError::Malformed(_))));
    }

    #[test]
    fn test_reads_expand_to_arguments() {
        let cmd = CommandTemplate::new(ToolKind::Aligner)
            .args(["mem", "-t", "{threads}", "{reads}"])
            .stdout_to("{sample_dir}/BAM/{sample}.aligned.sam");
        let rendered = cmd.render(&ctx()).unwrap();

        assert_eq!(
            rendered.args,
            vec![
                "mem",
                "-t",
                "4",
                "/runs/r1/S1_R1.fastq.gz",
                "/runs/r1/S1_R2.fastq.gz"
            ]
        );
        assert_eq!(
            rendered.stdout,
            Some(PathBuf::from("/runs/r1/S1/BAM/S1.aligned.sam"))
        );
    }

    #[test]
    fn test_reads_in_text_rejected() {
        assert_eq!(
            placeholders("--in={reads}"),
            Err(TemplateError::ListInText("reads".to_string()))
        );
        assert!(ctx().render("--in={reads}").is_err());
    }

    #[test]
    fn test_placeholders_collected() {
        let cmd = CommandTemplate::new(ToolKind::Picard)
            .args(["I={sample_dir}/BAM/{sample}.bam", "BI={baits}"])
            .stdout_to("{run_dir}/x");
        let names: Vec<_> = cmd.placeholders().unwrap().into_iter().collect();
        assert_eq!(names, vec!["baits", "run_dir", "sample", "sample_dir"]);

        let bad = CommandTemplate::new(ToolKind::Picard).arg("{bait}");
        assert_eq!(
            bad.placeholders(),
            Err(TemplateError::Unknown("bait".to_string()))
        );
    }

    #[test]
    fn test_interval_list_next_to_bed() {
        assert_eq!(
            interval_list(Path::new("/ref/BED/cardiac.bed")),
            PathBuf::from("/ref/BED/cardiac.picard.bed")
        );
        assert_eq!(
            interval_list(Path::new("/ref/cardiac.interval_list")),
            PathBuf::from("/ref/cardiac.interval_list")
        );
    }

    #[test]
    fn test_unknown_names_ignored_by_with() {
        let ctx = TemplateContext::new().with("bogus", "x");
        assert!(ctx.get("bogus").is_none());
    }
}
