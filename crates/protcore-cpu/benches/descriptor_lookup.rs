#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use protcore_cpu::descriptor::{kind, Descriptor};
#[cfg(not(target_arch = "wasm32"))]
use protcore_cpu::{Cpu, CpuConfig, FlatTestBus, SegReg};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("PROTCORE_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            // Keep PR runtime low.
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
const GDT_BASE: u32 = 0x1000;

/// Flat ring-0 protected mode with a GDT of code and data pairs.
#[cfg(not(target_arch = "wasm32"))]
fn setup() -> (Cpu, FlatTestBus) {
    let mut bus = FlatTestBus::new(0x1_0000);
    let entries = 32u32;
    for i in 1..entries {
        let kind = if i % 2 == 1 { kind::CODE_XR_NC_A } else { kind::DATA_EU_RW_A };
        Descriptor::segment(0, 0xfffff, kind, 0, true, true)
            .save(&mut bus, GDT_BASE + i * 8)
            .unwrap();
    }
    let mut cpu = Cpu::new(&CpuConfig::default());
    cpu.lgdt((entries * 8 - 1) as u16, GDT_BASE).unwrap();
    cpu.write_cr0(&mut bus, 1);
    cpu.jmp_far(&mut bus, true, 0x08, 0, 0).unwrap();
    (cpu, bus)
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_descriptor_lookup(c: &mut Criterion) {
    let (mut cpu, mut bus) = setup();

    let mut group = c.benchmark_group("descriptor_lookup");
    group.throughput(Throughput::Elements(1));
    group.bench_function("gdt_fetch", |b| {
        b.iter(|| {
            let desc = cpu.gdt.descriptor(&mut bus, black_box(0x10)).unwrap();
            black_box(desc)
        })
    });
    group.bench_function("load_data_segment", |b| {
        b.iter(|| {
            cpu.set_seg_general(&mut bus, SegReg::Ds, black_box(0x10)).unwrap();
            black_box(cpu.seg_base(SegReg::Ds))
        })
    });
    group.bench_function("decode_raw", |b| {
        let raw =
            Descriptor::segment(0x0012_3456, 0xabcde, kind::DATA_EU_RW_A, 3, true, true).raw();
        b.iter(|| {
            let d = Descriptor::from_raw(black_box(raw));
            black_box((d.base(), d.limit(), d.dpl()))
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_descriptor_lookup
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
