//! vm_hotpath.rs — micro-benchs « hot path » de la VM Kombi
//!
//! Lancer :
//!   cargo bench -p kombi-benches --bench vm_hotpath
//!   cargo bench -p kombi-benches --bench vm_hotpath -- --save-baseline hot
//!   cargo bench -p kombi-benches --bench vm_hotpath -- --baseline hot
//!
//! Tout est en mémoire : les listings sont assemblés une fois, puis exécutés.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kombi_benches::{image, Budget, CONTINUATION_TWICE, TAIL_LOOP};
use kombi_vm::{Vm, VmError, VmOptions};

fn bench_tail_loop(c: &mut Criterion) {
    let bytes = image(TAIL_LOOP).expect("assemble tail loop");
    let mut vm = Vm::load(&bytes, &VmOptions::default()).expect("load tail loop");

    let mut group = c.benchmark_group("vm/hotpath/tail-loop");
    group.sample_size(30);
    group.warm_up_time(Duration::from_millis(400));
    group.measurement_time(Duration::from_secs(6));

    for rounds in [1_000usize, 10_000, 100_000] {
        group.throughput(Throughput::Elements(rounds as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rounds), &rounds, |b, &n| {
            b.iter(|| {
                let r = vm.execute(&mut &b""[..], &mut Budget(black_box(n)));
                assert!(matches!(r, Err(VmError::Io(_))));
            });
        });
    }

    group.finish();
}

fn bench_continuation(c: &mut Criterion) {
    let bytes = image(CONTINUATION_TWICE).expect("assemble continuation");

    let mut group = c.benchmark_group("vm/hotpath/continuation");
    group.sample_size(50);
    group.warm_up_time(Duration::from_millis(300));

    for segment in [1u32, 4, 256] {
        let opts = VmOptions { stack_segment_size: segment, ..VmOptions::default() };
        let mut vm = Vm::load(&bytes, &opts).expect("load continuation");
        group.bench_with_input(BenchmarkId::new("segment", segment), &segment, |b, _| {
            b.iter(|| {
                let mut out = Vec::with_capacity(2);
                let v = vm.execute(&mut &b""[..], &mut out).expect("halts");
                vm.release(black_box(v)).expect("release");
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_tail_loop, bench_continuation);
criterion_main!(benches);
