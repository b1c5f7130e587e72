use core_inputs::{ExclusionTree, OracleVerdict};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn token_sequences(count: usize, length: usize) -> Vec<Vec<String>> {
    let alphabet = ["push", "pop", "peek", "clear", "dup", "swap", "rot", "drop"];
    (0..count)
        .map(|i| {
            (0..length)
                .map(|j| alphabet[(i * 31 + j * 7) % alphabet.len()].to_string())
                .collect()
        })
        .collect()
}

fn bench_add_input(c: &mut Criterion) {
    let sequences = token_sequences(2_000, 12);
    c.bench_function("exclusion_add_2k_len12", |b| {
        b.iter(|| {
            let mut tree = ExclusionTree::new();
            for (i, sequence) in sequences.iter().enumerate() {
                let verdict = if i % 5 == 0 {
                    OracleVerdict::Failing
                } else {
                    OracleVerdict::Passing
                };
                black_box(tree.add_input(sequence, verdict, i as u64 + 1));
            }
            tree
        })
    });
}

fn bench_has_prefix(c: &mut Criterion) {
    let sequences = token_sequences(2_000, 12);
    let mut tree = ExclusionTree::new();
    for (i, sequence) in sequences.iter().enumerate() {
        tree.add_input(sequence, OracleVerdict::Passing, i as u64 + 1);
    }
    let probes = token_sequences(500, 16);
    c.bench_function("exclusion_probe_500_len16", |b| {
        b.iter(|| {
            for probe in &probes {
                black_box(tree.has_prefix(probe));
            }
        })
    });
}

criterion_group!(benches, bench_add_input, bench_has_prefix);
criterion_main!(benches);
