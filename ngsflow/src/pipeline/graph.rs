//! Validated stage dependency graph.
//!
//! Ordering, fan-out, fan-in and the cross-sample barrier are all expressed as
//! data here; the orchestrator only follows the edges.

use super::{StageAction, StageDescriptor, StageScope};
use crate::config::ToolKind;
use crate::errors::{CycleDetectedError, GraphValidationError};
use crate::tools::{placeholders, TemplateError, READS_PLACEHOLDER};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A directed acyclic graph of stage descriptors.
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// Stage descriptors by name.
    stages: HashMap<String, StageDescriptor>,
    /// Declaration order.
    stage_order: Vec<String>,
    /// Execution order (topologically sorted, ties broken by declaration order).
    execution_order: Vec<String>,
}

impl StageGraph {
    /// Validates the descriptors and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty graph, duplicate names, self or unknown
    /// dependencies, scope violations, invalid templates, or cycles.
    pub fn new(descriptors: Vec<StageDescriptor>) -> Result<Self, GraphValidationError> {
        if descriptors.is_empty() {
            return Err(GraphValidationError::empty());
        }

        let mut stages = HashMap::with_capacity(descriptors.len());
        let mut stage_order = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if stages.contains_key(&descriptor.name) {
                return Err(GraphValidationError::duplicate_stage(&descriptor.name));
            }
            stage_order.push(descriptor.name.clone());
            stages.insert(descriptor.name.clone(), descriptor);
        }

        for name in &stage_order {
            let spec = &stages[name];
            validate_edges(spec, &stages)?;
            validate_templates(spec)?;
        }

        detect_cycles(&stages, &stage_order)?;
        let execution_order = topological_sort(&stages, &stage_order);

        Ok(Self {
            stages,
            stage_order,
            execution_order,
        })
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns the stage names in declaration order.
    #[must_use]
    pub fn declaration_order(&self) -> &[String] {
        &self.stage_order
    }

    /// Returns the execution order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Returns a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.get(name)
    }

    /// Returns every stage in execution order.
    pub fn stages(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.execution_order.iter().filter_map(|n| self.stages.get(n))
    }

    /// Returns the per-sample stages in execution order.
    #[must_use]
    pub fn sample_stages(&self) -> Vec<&StageDescriptor> {
        self.stages().filter(|s| s.scope == StageScope::Sample).collect()
    }

    /// Returns the per-run stages in execution order.
    #[must_use]
    pub fn run_stages(&self) -> Vec<&StageDescriptor> {
        self.stages().filter(|s| s.scope == StageScope::Run).collect()
    }

    /// Returns the stages that directly depend on `name`, in declaration order.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.stage_order
            .iter()
            .filter(|n| self.stages[*n].dependencies.iter().any(|d| d == name))
            .map(String::as_str)
            .collect()
    }

    /// Returns the position of a stage in execution order.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.execution_order.iter().position(|n| n == name)
    }

    /// Returns every tool the graph can invoke.
    #[must_use]
    pub fn required_tools(&self) -> BTreeSet<ToolKind> {
        self.stages.values().filter_map(|s| s.action.tool()).collect()
    }
}

fn validate_edges(
    spec: &StageDescriptor,
    stages: &HashMap<String, StageDescriptor>,
) -> Result<(), GraphValidationError> {
    let mut seen = HashSet::new();
    for dep in &spec.dependencies {
        if dep == &spec.name {
            return Err(GraphValidationError::self_dependency(&spec.name));
        }
        let Some(upstream) = stages.get(dep) else {
            return Err(GraphValidationError::unknown_dependency(&spec.name, dep));
        };
        if spec.scope == StageScope::Sample && upstream.scope == StageScope::Run {
            return Err(GraphValidationError::scope_violation(&spec.name, dep));
        }
        if !seen.insert(dep.as_str()) {
            return Err(GraphValidationError::new(
                "GRAPH-DUPLICATE",
                format!("Stage '{}' lists dependency '{dep}' more than once", spec.name),
            )
            .with_stages(vec![spec.name.clone(), dep.clone()]));
        }
    }

    if let Some(gather) = &spec.gather {
        if spec.scope != StageScope::Run {
            return Err(GraphValidationError::new(
                "GRAPH-SCOPE",
                format!("Stage '{}' gathers but is not run-scoped", spec.name),
            )
            .with_stages(vec![spec.name.clone()]));
        }
        let gathers_sample_dependency = spec.dependencies.contains(&gather.stage)
            && stages
                .get(&gather.stage)
                .is_some_and(|s| s.scope == StageScope::Sample);
        if !gathers_sample_dependency {
            return Err(GraphValidationError::scope_violation(&spec.name, &gather.stage));
        }
    }

    Ok(())
}

fn template_error(stage: &str, err: &TemplateError) -> GraphValidationError {
    GraphValidationError::new("GRAPH-TEMPLATE", format!("Stage '{stage}': {err}"))
        .with_stages(vec![stage.to_string()])
}

fn validate_templates(spec: &StageDescriptor) -> Result<(), GraphValidationError> {
    let mut path_templates = vec![spec.artifact.as_str()];
    let mut used = match &spec.action {
        StageAction::Tool(command) => command
            .placeholders()
            .map_err(|e| template_error(&spec.name, &e))?,
        StageAction::Transform(transform) => {
            path_templates.push(transform.input.as_str());
            BTreeSet::new()
        }
    };

    if let Some(gather) = &spec.gather {
        path_templates.push(gather.into.as_str());
    }
    for template in path_templates {
        let names = placeholders(template).map_err(|e| template_error(&spec.name, &e))?;
        if names.contains(READS_PLACEHOLDER) {
            return Err(template_error(
                &spec.name,
                &TemplateError::ListInText(READS_PLACEHOLDER.to_string()),
            ));
        }
        used.extend(names);
    }

    if used.contains("gathered") && spec.gather.is_none() {
        return Err(GraphValidationError::new(
            "GRAPH-TEMPLATE",
            format!("Stage '{}' uses {{gathered}} without a gather step", spec.name),
        )
        .with_stages(vec![spec.name.clone()]));
    }
    if used.contains(READS_PLACEHOLDER) && spec.scope == StageScope::Run {
        return Err(GraphValidationError::new(
            "GRAPH-TEMPLATE",
            format!("Run-scoped stage '{}' cannot use {{reads}}", spec.name),
        )
        .with_stages(vec![spec.name.clone()]));
    }

    Ok(())
}

fn detect_cycles(
    stages: &HashMap<String, StageDescriptor>,
    stage_order: &[String],
) -> Result<(), CycleDetectedError> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for name in stage_order {
        if !visited.contains(name.as_str()) {
            if let Some(cycle) = dfs_cycle(name, stages, &mut visited, &mut rec_stack, &mut path) {
                return Err(CycleDetectedError::new(cycle));
            }
        }
    }

    Ok(())
}

fn dfs_cycle<'a>(
    node: &'a str,
    stages: &'a HashMap<String, StageDescriptor>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(spec) = stages.get(node) {
        for dep in &spec.dependencies {
            if !visited.contains(dep.as_str()) {
                if let Some(cycle) = dfs_cycle(dep, stages, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep.as_str()) {
                let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
                cycle.push(dep.clone());
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

/// Depth-first topological sort, visiting roots and dependencies in
/// declaration order so fan-out branches keep their declared order.
fn topological_sort(stages: &HashMap<String, StageDescriptor>, stage_order: &[String]) -> Vec<String> {
    fn visit<'a>(
        node: &'a str,
        stages: &'a HashMap<String, StageDescriptor>,
        visited: &mut HashSet<&'a str>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(node) {
            return;
        }
        if let Some(spec) = stages.get(node) {
            for dep in &spec.dependencies {
                visit(dep, stages, visited, result);
            }
        }
        result.push(node.to_string());
    }

    let mut result = Vec::with_capacity(stages.len());
    let mut visited = HashSet::new();
    for name in stage_order {
        visit(name, stages, &mut visited, &mut result);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Transform, TransformKind};
    use crate::tools::CommandTemplate;
    use pretty_assertions::assert_eq;

    fn stage(name: &str, deps: &[&str]) -> StageDescriptor {
        StageDescriptor::new(
            name,
            format!("{{sample_dir}}/{name}.out"),
            CommandTemplate::new(ToolKind::Samtools).arg("{sample}"),
        )
        .with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_fan_out_keeps_declaration_order() {
        let graph = StageGraph::new(vec![
            stage("align", &[]),
            stage("call_b", &["align"]),
            stage("call_a", &["align"]),
            stage("merge", &["call_b", "call_a"]),
        ])
        .unwrap();

        assert_eq!(
            graph.execution_order(),
            &["align", "call_b", "call_a", "merge"]
        );
        assert_eq!(graph.dependents("align"), vec!["call_b", "call_a"]);
    }

    #[test]
    fn test_out_of_order_declaration_is_sorted() {
        let graph = StageGraph::new(vec![stage("b", &["a"]), stage("a", &[])]).unwrap();
        assert_eq!(graph.execution_order(), &["a", "b"]);
        assert_eq!(graph.declaration_order(), &["b", "a"]);
    }

    #[test]
    fn test_empty_graph() {
        assert_eq!(StageGraph::new(Vec::new()).unwrap_err().code, "GRAPH-EMPTY");
    }

    #[test]
    fn test_duplicate_stage() {
        let err = StageGraph::new(vec![stage("a", &[]), stage("a", &[])]).unwrap_err();
        assert_eq!(err.code, "GRAPH-DUPLICATE");
    }

    #[test]
    fn test_self_and_unknown_dependency() {
        let err = StageGraph::new(vec![stage("a", &["a"])]).unwrap_err();
        assert_eq!(err.code, "GRAPH-SELF-DEP");

        let err = StageGraph::new(vec![stage("a", &["ghost"])]).unwrap_err();
        assert_eq!(err.code, "GRAPH-MISSING-DEP");
        assert_eq!(err.stages, vec!["a".to_string(), "ghost".to_string()]);
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let err = StageGraph::new(vec![
            stage("a", &["c"]),
            stage("b", &["a"]),
            stage("c", &["b"]),
        ])
        .unwrap_err();

        assert_eq!(err.code, "GRAPH-CYCLE");
        assert_eq!(err.stages, vec!["a", "c", "b", "a"]);
    }

    #[test]
    fn test_sample_stage_cannot_depend_on_run_stage() {
        let err = StageGraph::new(vec![
            stage("coverage", &[]),
            stage("cnv", &["coverage"]).run_scoped(),
            stage("report", &["cnv"]),
        ])
        .unwrap_err();
        assert_eq!(err.code, "GRAPH-SCOPE");
    }

    #[test]
    fn test_gather_must_name_sample_dependency() {
        let err = StageGraph::new(vec![
            stage("coverage", &[]),
            stage("cnv", &[]).run_scoped().with_gather("coverage", "{run_dir}/w.tsv"),
        ])
        .unwrap_err();
        assert_eq!(err.code, "GRAPH-SCOPE");

        let err = StageGraph::new(vec![
            stage("coverage", &[]),
            stage("cnv", &["coverage"]).with_gather("coverage", "{run_dir}/w.tsv"),
        ])
        .unwrap_err();
        assert_eq!(err.code, "GRAPH-SCOPE");
    }

    #[test]
    fn test_template_validation() {
        let bad = StageDescriptor::new(
            "a",
            "{sample_dir}/a.out",
            CommandTemplate::new(ToolKind::Gatk).arg("{refrence}"),
        );
        let err = StageGraph::new(vec![bad]).unwrap_err();
        assert_eq!(err.code, "GRAPH-TEMPLATE");
        assert!(err.message.contains("refrence"));

        let gathered = StageDescriptor::new(
            "a",
            "{sample_dir}/a.out",
            CommandTemplate::new(ToolKind::Cnv).arg("{gathered}"),
        );
        assert_eq!(StageGraph::new(vec![gathered]).unwrap_err().code, "GRAPH-TEMPLATE");

        let reads_path = StageDescriptor::new("a", "{reads}", CommandTemplate::new(ToolKind::Cnv));
        assert_eq!(StageGraph::new(vec![reads_path]).unwrap_err().code, "GRAPH-TEMPLATE");
    }

    #[test]
    fn test_scope_partition_and_tools() {
        let graph = StageGraph::new(vec![
            stage("coverage", &[]),
            StageDescriptor::new(
                "cnv",
                "{run_dir}/cnv.tsv",
                CommandTemplate::new(ToolKind::Cnv).arg("{gathered}"),
            )
            .with_dependency("coverage")
            .run_scoped()
            .with_gather("coverage", "{run_dir}/w.tsv"),
        ])
        .unwrap();

        assert_eq!(graph.sample_stages().len(), 1);
        assert_eq!(graph.run_stages()[0].name, "cnv");
        assert_eq!(
            graph.required_tools().into_iter().collect::<Vec<_>>(),
            vec![ToolKind::Samtools, ToolKind::Cnv]
        );
        assert_eq!(graph.position("cnv"), Some(1));
    }

    #[test]
    fn test_transform_input_is_validated_and_needs_no_tool() {
        let bad = StageDescriptor::new(
            "edit",
            "{sample_dir}/a.vcf",
            Transform::new(TransformKind::StripContigHeaders, "{sampel_dir}/b.vcf"),
        );
        let err = StageGraph::new(vec![bad]).unwrap_err();
        assert_eq!(err.code, "GRAPH-TEMPLATE");
        assert!(err.message.contains("sampel_dir"));

        let graph = StageGraph::new(vec![
            stage("identity", &[]),
            StageDescriptor::new(
                "identity_table",
                "{sample_dir}/identity.txt",
                Transform::new(TransformKind::BaseCounts, "{sample_dir}/identity.mpileup"),
            )
            .with_dependency("identity"),
        ])
        .unwrap();
        assert_eq!(
            graph.required_tools().into_iter().collect::<Vec<_>>(),
            vec![ToolKind::Samtools]
        );
    }
}
