//! Feed-forward, embedding, output and mask stages.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use stratum_attention::{
    ComputeDevice, CpuKernels, EmbeddingWeights, MlpWeights, ModelShape, OutputWeights,
};
use stratum_core::{DType, Device, NativeTensor, StratumError};
use stratum_offload::{
    AcceleratorBackend, CodecConfig, DiskConfig, EncodedBackend, OffloadContext,
    TensorHandle,
};

mod common;
use common::PassThroughCodec;

const HIDDEN: usize = 4;

struct Fixture {
    _dir: tempfile::TempDir,
    ctx: OffloadContext,
    device: ComputeDevice,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = DiskConfig::with_root(dir.path());
    cfg.num_copy_threads = 1;
    let ctx = OffloadContext::from_config(&cfg)
        .unwrap()
        .with_accelerator(Arc::new(AcceleratorBackend::new(0)));
    let device = ComputeDevice::new(ctx.host(), Arc::new(CpuKernels)).unwrap();
    Fixture {
        _dir: dir,
        ctx,
        device,
    }
}

fn model() -> ModelShape {
    ModelShape {
        n_head: 2,
        hidden: HIDDEN,
        vocab_size: 16,
        max_seq_len: 16,
        pad_token_id: 0,
        layer_norm_eps: 1e-5,
    }
}

impl Fixture {
    fn f32(&self, data: &[f32], dims: &[usize]) -> TensorHandle {
        self.device
            .wrap(NativeTensor::from_f32(data, dims, Device::Host).unwrap())
            .unwrap()
    }

    fn ids(&self, data: &[i64], dims: &[usize]) -> TensorHandle {
        self.device
            .wrap(NativeTensor::from_i64(data, dims, Device::Host).unwrap())
            .unwrap()
    }
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "index {i}: {x} vs {y}");
    }
}

fn layer_norm_rows(x: &[f32], h: usize) -> Vec<f32> {
    x.chunks(h)
        .flat_map(|row| {
            let mean = row.iter().sum::<f32>() / h as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / h as f32;
            let inv = 1.0 / (var + 1e-5).sqrt();
            row.iter().map(move |v| (v - mean) * inv).collect::<Vec<_>>()
        })
        .collect()
}

// =========================================================================
// Feed-forward
// =========================================================================

/// `wi = [I; -I]` and `wo = [I, -I]`, so the block reduces to
/// `layer_norm(x) + bo + x`.
fn identity_mlp(f: &Fixture, bo: &[f32]) -> MlpWeights {
    let mut wi = vec![0.0; 2 * HIDDEN * HIDDEN];
    let mut wo = vec![0.0; 2 * HIDDEN * HIDDEN];
    for i in 0..HIDDEN {
        wi[i * HIDDEN + i] = 1.0;
        wi[(HIDDEN + i) * HIDDEN + i] = -1.0;
        wo[i * 2 * HIDDEN + i] = 1.0;
        wo[i * 2 * HIDDEN + HIDDEN + i] = -1.0;
    }
    MlpWeights {
        wi: f.f32(&wi, &[2 * HIDDEN, HIDDEN]),
        bi: f.f32(&[0.0; 2 * HIDDEN], &[2 * HIDDEN]),
        wo: f.f32(&wo, &[HIDDEN, 2 * HIDDEN]),
        bo: f.f32(bo, &[HIDDEN]),
        w_ln: f.f32(&[1.0; HIDDEN], &[HIDDEN]),
        b_ln: f.f32(&[0.0; HIDDEN], &[HIDDEN]),
    }
}

#[test]
fn test_mlp_residual() {
    let f = fixture();
    let x = [0.5, -1.0, 2.0, 0.0, 3.0, 1.0, -2.0, 4.0];
    let bo = [0.1, 0.2, 0.3, 0.4];
    let weights = identity_mlp(&f, &bo);
    let input = f.f32(&x, &[1, 2, HIDDEN]);

    let out = f.device.mlp(&f.ctx, &input, &weights, 1e-5, false).unwrap();
    assert_eq!(out.dims(), &[1, 2, HIDDEN]);
    let expected: Vec<f32> = layer_norm_rows(&x, HIDDEN)
        .iter()
        .zip(x.iter())
        .enumerate()
        .map(|(i, (n, v))| n + bo[i % HIDDEN] + v)
        .collect();
    assert_close(&out.native().unwrap().to_f32_vec(), &expected, 1e-4);
    assert!(!input.is_deleted());

    f.device.mlp(&f.ctx, &input, &weights, 1e-5, true).unwrap();
    assert!(input.is_deleted());
}

#[test]
fn test_mlp_with_encoded_weights() {
    let f = fixture();
    let plain = identity_mlp(&f, &[0.0; HIDDEN]);
    let codec = Arc::new(EncodedBackend::new(
        f.ctx.host(),
        Arc::new(PassThroughCodec),
        CodecConfig::default(),
    ));
    let encode = |h: &TensorHandle| codec.compress(&h.native().unwrap()).unwrap();
    let encoded = MlpWeights {
        wi: encode(&plain.wi),
        wo: encode(&plain.wo),
        ..plain.clone()
    };
    assert_eq!(encoded.wi.tier(), stratum_offload::Tier::Encoded);

    let x = [1.0, 2.0, 3.0, 4.0];
    let input = f.f32(&x, &[1, 1, HIDDEN]);
    let a = f.device.mlp(&f.ctx, &input, &plain, 1e-5, false).unwrap();
    let b = f.device.mlp(&f.ctx, &input, &encoded, 1e-5, false).unwrap();
    assert_eq!(a.native().unwrap().to_f32_vec(), b.native().unwrap().to_f32_vec());
}

#[test]
fn test_operand_on_another_device_is_rejected() {
    let f = fixture();
    let weights = identity_mlp(&f, &[0.0; HIDDEN]);
    let acc = f.ctx.accelerator(0).unwrap();
    let input = TensorHandle::from_native(
        &acc,
        NativeTensor::zeros([1, 1, HIDDEN], DType::F32, Device::Accelerator(0)),
    )
    .unwrap();
    let err = f.device.mlp(&f.ctx, &input, &weights, 1e-5, false).unwrap_err();
    assert!(matches!(err, StratumError::DeviceMismatch(_)));
}

// =========================================================================
// Masks and embeddings
// =========================================================================

#[test]
fn test_attention_mask_helpers() {
    let f = fixture();
    let ids = f.ids(&[0, 5, 6, 3, 4, 7], &[2, 3]);
    let mask = f.device.gen_attention_mask(&ids, 0, false).unwrap();
    assert_eq!(mask.dtype(), DType::Bool);
    assert_eq!(
        mask.native().unwrap().to_bool_vec(),
        vec![false, true, true, true, true, true]
    );

    let extended = f.device.extend_attention_mask(&mask, true).unwrap();
    assert!(mask.is_deleted());
    assert_eq!(extended.dims(), &[2, 4]);
    assert_eq!(
        extended.native().unwrap().to_bool_vec(),
        vec![false, true, true, true, true, true, true, true]
    );

    f.device.gen_attention_mask(&ids, 0, true).unwrap();
    assert!(ids.is_deleted());
}

/// Token row `i` is `[i; HIDDEN]`, position row `p` is `[100 p; HIDDEN]`.
fn embedding_weights(f: &Fixture) -> EmbeddingWeights {
    let tokens: Vec<f32> = (0..16).flat_map(|i| [i as f32; HIDDEN]).collect();
    let positions: Vec<f32> = (0..20).flat_map(|p| [100.0 * p as f32; HIDDEN]).collect();
    EmbeddingWeights {
        w_token: f.f32(&tokens, &[16, HIDDEN]),
        w_pos: f.f32(&positions, &[20, HIDDEN]),
    }
}

fn first_features(t: &TensorHandle) -> Vec<f32> {
    t.native()
        .unwrap()
        .to_f32_vec()
        .chunks(HIDDEN)
        .map(|row| row[0])
        .collect()
}

#[test]
fn test_input_embed_prompt() {
    let f = fixture();
    let weights = embedding_weights(&f);
    let ids = f.ids(&[0, 5, 6, 3, 4, 7], &[2, 3]);
    let mask = f.device.gen_attention_mask(&ids, 0, false).unwrap();

    let out = f
        .device
        .input_embed(&f.ctx, &ids, &mask, &weights, &model(), [false, false])
        .unwrap();
    assert_eq!(out.dims(), &[2, 3, HIDDEN]);
    // The pad token embeds to zero and sits at position 1.
    assert_eq!(
        first_features(&out),
        vec![100.0, 205.0, 306.0, 203.0, 304.0, 407.0]
    );
}

#[test]
fn test_input_embed_decode_step() {
    let f = fixture();
    let weights = embedding_weights(&f);
    let prompt = f.ids(&[0, 5, 6, 3, 4, 7], &[2, 3]);
    let mask = f.device.gen_attention_mask(&prompt, 0, false).unwrap();
    let mask = f.device.extend_attention_mask(&mask, true).unwrap();

    let step = f.ids(&[9, 1], &[2, 1]);
    let out = f
        .device
        .input_embed(&f.ctx, &step, &mask, &weights, &model(), [true, true])
        .unwrap();
    assert_eq!(out.dims(), &[2, 1, HIDDEN]);
    assert_eq!(first_features(&out), vec![409.0, 501.0]);
    assert!(step.is_deleted());
    assert!(mask.is_deleted());
}

#[test]
fn test_input_embed_rejects_batch_mismatch() {
    let f = fixture();
    let weights = embedding_weights(&f);
    let ids = f.ids(&[1, 2], &[2, 1]);
    let mask = f.device.gen_attention_mask(&f.ids(&[1, 2], &[1, 2]), 0, false).unwrap();
    let err = f
        .device
        .input_embed(&f.ctx, &ids, &mask, &weights, &model(), [false, false])
        .unwrap_err();
    assert!(matches!(err, StratumError::ShapeMismatch(_)));
}

// =========================================================================
// Output head
// =========================================================================

/// Layer norm collapses every position to `[1, 0, 0, 0]`, so the logit of
/// token `i` is `logit(i)`.
fn output_weights(f: &Fixture, logit: impl Fn(usize) -> f32) -> OutputWeights {
    let table: Vec<f32> = (0..16)
        .flat_map(|i| [logit(i), 0.0, 0.0, 0.0])
        .collect();
    OutputWeights {
        w_ln: f.f32(&[0.0; HIDDEN], &[HIDDEN]),
        b_ln: f.f32(&[1.0, 0.0, 0.0, 0.0], &[HIDDEN]),
        w_token: f.f32(&table, &[16, HIDDEN]),
    }
}

#[test]
fn test_output_embed_greedy() {
    let f = fixture();
    let weights = output_weights(&f, |i| -((i as f32 - 5.0).powi(2)));
    let hidden = f.f32(&[0.3; 2 * 3 * HIDDEN], &[2, 3, HIDDEN]);
    let mut rng = StdRng::seed_from_u64(1);

    let ids = f
        .device
        .output_embed(&f.ctx, &hidden, &weights, &model(), false, false, 1.0, &mut rng)
        .unwrap();
    assert_eq!(ids.dims(), &[2, 1]);
    assert_eq!(ids.dtype(), DType::I64);
    assert_eq!(ids.native().unwrap().to_i64_vec(), vec![5, 5]);

    // A negligible temperature falls back to arg-max even when sampling.
    let ids = f
        .device
        .output_embed(&f.ctx, &hidden, &weights, &model(), true, true, 0.0, &mut rng)
        .unwrap();
    assert_eq!(ids.native().unwrap().to_i64_vec(), vec![5, 5]);
    assert!(hidden.is_deleted());
}

#[test]
fn test_output_embed_sampling() {
    let f = fixture();
    let weights = output_weights(&f, |i| if i == 7 { 60.0 } else { 0.0 });
    let hidden = f.f32(&[0.0; 3 * HIDDEN], &[3, 1, HIDDEN]);
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..5 {
        let ids = f
            .device
            .output_embed(&f.ctx, &hidden, &weights, &model(), false, true, 1.0, &mut rng)
            .unwrap();
        assert_eq!(ids.native().unwrap().to_i64_vec(), vec![7, 7, 7]);
    }
}

#[test]
fn test_output_embed_needs_positions() {
    let f = fixture();
    let weights = output_weights(&f, |_| 0.0);
    let hidden = f.f32(&[], &[2, 0, HIDDEN]);
    let mut rng = StdRng::seed_from_u64(0);
    let err = f
        .device
        .output_embed(&f.ctx, &hidden, &weights, &model(), false, false, 1.0, &mut rng)
        .unwrap_err();
    assert!(matches!(err, StratumError::ShapeMismatch(_)));
}
