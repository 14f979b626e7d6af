//! Benchmarks for semantic context packing.
//!
//! Packing runs once per SQL generation, so it sits on the latency path of
//! every turn. These benchmarks measure `pack` with realistic schema-sized
//! module texts under a generous budget (everything fits) and a tight budget
//! (truncation and skipping kick in).

use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use nlq_core::tokens::HeuristicCounter;
use nlq_semantic::{pack, ModuleCandidate, ModuleContent, ModuleKind, Priority, TokenBudget};

/// A DDL-like table description with `columns` columns.
fn table_block(index: usize, columns: usize) -> String {
    let cols: Vec<String> = (0..columns)
        .map(|c| format!("  col_{c} VARCHAR(64) COMMENT 'attribute {c} of table {index}'"))
        .collect();
    format!("CREATE TABLE fact_{index} (\n{}\n);", cols.join(",\n"))
}

fn generate_candidates(tables: usize) -> Vec<ModuleCandidate> {
    let structure = (0..tables)
        .map(|i| table_block(i, 12))
        .collect::<Vec<_>>()
        .join("\n");
    let relations = (1..tables)
        .map(|i| format!("fact_{i}.col_0 -> fact_{}.col_0", i - 1))
        .collect::<Vec<_>>()
        .join("\n");
    let dictionary = (0..tables * 4)
        .map(|i| format!("term_{i}: business meaning of metric {i} in reporting"))
        .collect::<Vec<_>>()
        .join("\n");
    let knowledge = "Fiscal year starts in April. Revenue excludes refunds. ".repeat(tables);

    vec![
        ModuleCandidate::new(
            ModuleKind::DataSource,
            Priority::High,
            ModuleContent::new("mysql 8.0 warehouse, schema analytics", 0.4),
        ),
        ModuleCandidate::new(
            ModuleKind::TableStructure,
            Priority::Critical,
            ModuleContent::new(structure, 0.9),
        ),
        ModuleCandidate::new(
            ModuleKind::TableRelation,
            Priority::Medium,
            ModuleContent::new(relations, 0.6),
        ),
        ModuleCandidate::new(
            ModuleKind::Dictionary,
            Priority::High,
            ModuleContent::new(dictionary, 0.7),
        ),
        ModuleCandidate::new(
            ModuleKind::Knowledge,
            Priority::Medium,
            ModuleContent::new(knowledge, 0.3),
        ),
    ]
}

fn bench_pack(c: &mut Criterion) {
    let counter = HeuristicCounter::default();
    let small = generate_candidates(5);
    let large = generate_candidates(40);

    let roomy = TokenBudget::new(200_000, 4_000).unwrap();
    let tight = TokenBudget::new(3_000, 1_000).unwrap();

    let mut group = c.benchmark_group("context_packing");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("small_schema_fits", |b| {
        b.iter(|| pack(&small, &roomy, &counter, 32))
    });

    group.bench_function("large_schema_fits", |b| {
        b.iter(|| pack(&large, &roomy, &counter, 32))
    });

    // Truncation binary-searches the critical section, the expensive path.
    group.bench_function("large_schema_truncated", |b| {
        b.iter(|| pack(&large, &tight, &counter, 32))
    });

    group.finish();
}

criterion_group!(benches, bench_pack);
criterion_main!(benches);
