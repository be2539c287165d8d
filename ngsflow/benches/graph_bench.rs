//! Benchmarks for stage graph construction.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ngsflow::config::ToolKind;
use ngsflow::pipeline::{catalog, StageDescriptor, StageGraph};
use ngsflow::tools::CommandTemplate;

/// A chain of `width`-wide fan-out layers joined by merge stages.
fn layered(layers: usize, width: usize) -> Vec<StageDescriptor> {
    let mut stages = vec![StageDescriptor::new(
        "root",
        "{sample_dir}/root.out",
        CommandTemplate::new(ToolKind::Samtools).arg("{sample}"),
    )];
    let mut join = "root".to_string();
    for layer in 0..layers {
        let branches: Vec<String> = (0..width).map(|i| format!("l{layer}_b{i}")).collect();
        for name in &branches {
            stages.push(
                StageDescriptor::new(
                    name.clone(),
                    format!("{{sample_dir}}/{name}.out"),
                    CommandTemplate::new(ToolKind::Gatk).arg("{sample}"),
                )
                .with_dependency(join.clone()),
            );
        }
        join = format!("l{layer}_merge");
        stages.push(
            StageDescriptor::new(
                join.clone(),
                format!("{{sample_dir}}/{join}.out"),
                CommandTemplate::new(ToolKind::Gatk3).arg("{sample}"),
            )
            .with_dependencies(branches),
        );
    }
    stages
}

fn graph_benchmark(c: &mut Criterion) {
    c.bench_function("standard_graph", |b| {
        b.iter(|| black_box(catalog::standard_graph()))
    });

    let descriptors = layered(20, 8);
    c.bench_function("layered_graph_20x8", |b| {
        b.iter(|| black_box(StageGraph::new(black_box(descriptors.clone()))))
    });

    let graph = catalog::standard_graph().ok();
    c.bench_function("dependents_lookup", |b| {
        b.iter(|| {
            graph
                .as_ref()
                .map(|g| g.dependents(black_box(catalog::RECALIBRATION)).len())
        })
    });
}

criterion_group!(benches, graph_benchmark);
criterion_main!(benches);
