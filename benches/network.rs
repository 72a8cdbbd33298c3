//! Criterion benchmarks comparing graph walking with the flat program.
//!
//! Run with:
//!   cargo bench
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gatenet::layer::{GateKind, LayerRef};
use gatenet::{ExecutionMode, Network, NetworkConfig};

fn make_perceptron(hidden: usize, mode: ExecutionMode) -> Network {
    let cfg = NetworkConfig::default().with_seed(42).with_mode(mode);
    Network::perceptron(8, &[hidden, hidden], 4, cfg).expect("valid perceptron")
}

/// Hidden layer with gated self-connections.
fn make_memory(size: usize, mode: ExecutionMode) -> Network {
    let cfg = NetworkConfig::default().with_seed(42).with_mode(mode);
    let mut net = Network::perceptron(4, &[size, size], 2, cfg).expect("valid perceptron");
    let (gate, cell) = (LayerRef::Hidden(0), LayerRef::Hidden(1));
    let memory = net.project(cell, cell, None, None).expect("self projection");
    net.gate(gate, &memory, GateKind::OneToOne).expect("gate sizes match");
    net
}

fn input(n: usize) -> Vec<f64> {
    (0..n).map(|i| (i as f64 * 0.37).sin()).collect()
}

/// One activate + propagate step for growing hidden sizes.
fn bench_step_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_size");

    for size in [8usize, 16, 32, 64].iter() {
        group.throughput(Throughput::Elements(*size as u64));

        for (name, mode) in [("graph", ExecutionMode::Graph), ("flat", ExecutionMode::Flat)] {
            group.bench_with_input(BenchmarkId::new(name, size), size, |b, &size| {
                let mut net = make_perceptron(size, mode);
                let x = input(8);
                let target = [1.0, 0.0, 1.0, 0.0];
                b.iter(|| {
                    let out = net.activate(black_box(&x)).expect("activate");
                    net.propagate(0.1, &target).expect("propagate");
                    black_box(out)
                });
            });
        }
    }

    group.finish();
}

/// Activation only, with gated memory cells.
fn bench_memory_activate(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_activate");
    let size = 32;

    for (name, mode) in [("graph", ExecutionMode::Graph), ("flat", ExecutionMode::Flat)] {
        group.bench_function(name, |b| {
            let mut net = make_memory(size, mode);
            let x = input(4);
            b.iter(|| black_box(net.activate(black_box(&x)).expect("activate")));
        });
    }

    group.finish();
}

/// Cost of flattening itself.
fn bench_compile(c: &mut Criterion) {
    let mut net = make_perceptron(32, ExecutionMode::Flat);
    c.bench_function("compile_perceptron_32", |b| {
        b.iter(|| black_box(net.optimize().expect("compile").instruction_count()));
    });
}

criterion_group!(benches, bench_step_sizes, bench_memory_activate, bench_compile);
criterion_main!(benches);
