//! Benchmarks for aingle_synthesis
//!
//! Run with: cargo bench -p aingle_synthesis

use aingle_synthesis::{
    EditDistanceSimilarity, EntityCategory, EntityMapping, EntityResolver, NameSimilarity,
    RawSource, ResolverConfig, StandardizedAnalysis, SynthesisConfig, Synthesizer, SystemEntity,
    SystemModel,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

fn model(size: usize) -> SystemModel {
    SystemModel::new(
        (0..size)
            .map(|i| {
                SystemEntity::new(
                    format!("ent-{}", i),
                    format!("Service {} Gateway", i),
                    EntityCategory::Software,
                )
            })
            .collect(),
    )
}

fn analysis(size: usize) -> StandardizedAnalysis {
    let mut analysis = StandardizedAnalysis::new("bench", "generic", "stride", 0.9);
    for i in 0..size {
        analysis.entities.push(
            EntityMapping::new("bench", format!("e{}", i), format!("Svc {} Gateway", i))
                .with_category(Some(EntityCategory::Software)),
        );
    }
    analysis
}

fn bench_similarity(c: &mut Criterion) {
    let similarity = EditDistanceSimilarity;
    c.bench_function("edit_distance_similarity", |b| {
        b.iter(|| {
            similarity.similarity(
                black_box("Auth Service"),
                black_box("Authentication Service"),
            )
        });
    });
}

fn bench_resolve(c: &mut Criterion) {
    let resolver = EntityResolver::new(ResolverConfig::default());
    let mut group = c.benchmark_group("resolve");

    for size in [10, 100, 500].iter() {
        let model = model(*size);
        let analysis = analysis(*size);
        group.bench_with_input(BenchmarkId::new("entities", size), size, |b, _| {
            b.iter(|| resolver.resolve(black_box(&analysis), &model));
        });
    }

    group.finish();
}

fn bench_synthesize(c: &mut Criterion) {
    let synthesizer = Synthesizer::new(SynthesisConfig::default()).unwrap();
    let model = model(50);
    let sources: Vec<RawSource> = (0..4)
        .map(|s| {
            let elements: Vec<_> = (0..50)
                .map(|i| {
                    json!({"id": format!("p{}", i),
                           "name": format!("Service {} Gateway", i),
                           "type": "process"})
                })
                .collect();
            let threats: Vec<_> = (0..50)
                .map(|i| {
                    json!({"id": format!("t{}", i), "target": format!("p{}", i),
                           "title": "Spoofing", "severity": "high"})
                })
                .collect();
            let format = if s % 2 == 0 {
                "dfd-threat-catalog"
            } else {
                "privacy-threat-catalog"
            };
            RawSource::new(
                format!("src-{}", s),
                json!({"format": format, "elements": elements, "threats": threats}),
            )
        })
        .collect();

    c.bench_function("synthesize_four_catalogs", |b| {
        b.iter(|| synthesizer.synthesize(black_box(&sources), &model).unwrap());
    });
}

criterion_group!(benches, bench_similarity, bench_resolve, bench_synthesize);
criterion_main!(benches);
