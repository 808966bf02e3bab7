//! Criterion benchmarks for the ViT forward pass, the contrastive losses and
//! the KNN vote, all on the CPU device.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{DType, Device, ModuleT, Tensor};
use candle_nn::{VarBuilder, VarMap};
use mvit_core::config::{Arch, VitConfig};
use mvit_core::knn::{FeatureBank, KnnClassifier};
use mvit_core::loss::{cross_batch_info_nce, self_similarity_info_nce};
use mvit_core::models::VisionTransformer;

// ---------------------------------------------------------------------------
// Backbone
// ---------------------------------------------------------------------------

fn bench_vit_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("vit_forward");
    group.sample_size(10);

    for &image_size in &[32, 96] {
        let cfg = VitConfig {
            depth: 4,
            ..Arch::VitSmall.config(16, image_size)
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = VisionTransformer::new(&cfg, vb).expect("model construction failed");
        let x = Tensor::randn(0f32, 1.0, (8, 3, image_size, image_size), &Device::Cpu)
            .expect("input failed");

        group.bench_with_input(BenchmarkId::new("image", image_size), &x, |b, x| {
            b.iter(|| model.forward_t(black_box(x), false).expect("forward failed"));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Losses
// ---------------------------------------------------------------------------

fn bench_info_nce(c: &mut Criterion) {
    let mut group = c.benchmark_group("info_nce");

    for &batch in &[64, 256] {
        let s = Tensor::randn(0f32, 1.0, (batch, 512), &Device::Cpu).expect("student failed");
        let t = Tensor::randn(0f32, 1.0, (batch, 512), &Device::Cpu).expect("teacher failed");
        let both = Tensor::cat(&[&s, &t], 0).expect("cat failed");

        group.bench_with_input(BenchmarkId::new("cross_batch", batch), &batch, |b, _| {
            b.iter(|| cross_batch_info_nce(black_box(&s), black_box(&t), 0.2, 0).expect("loss"));
        });
        group.bench_with_input(BenchmarkId::new("self_similarity", batch), &batch, |b, _| {
            b.iter(|| self_similarity_info_nce(black_box(&both), 0.1).expect("loss"));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// KNN
// ---------------------------------------------------------------------------

fn bench_knn(c: &mut Criterion) {
    let mut group = c.benchmark_group("knn_rank_classes");

    for &bank_size in &[1000, 5000] {
        let features =
            Tensor::randn(0f32, 1.0, (bank_size, 384), &Device::Cpu).expect("bank failed");
        let labels = (0..bank_size as u32).map(|i| i % 10).collect();
        let bank = FeatureBank::new(&features, labels).expect("bank failed");
        let queries = Tensor::randn(0f32, 1.0, (128, 384), &Device::Cpu).expect("queries");
        let knn = KnnClassifier::default();

        group.bench_with_input(BenchmarkId::new("bank", bank_size), &bank_size, |b, _| {
            b.iter(|| knn.rank_classes(&bank, black_box(&queries)).expect("knn failed"));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_vit_forward, bench_info_nce, bench_knn);
criterion_main!(benches);
