//! Cross-tier copy tests: dispatch cases, the worker queue and segmented recursion.

use std::sync::Arc;

use stratum_core::{DType, Device, GatherIndex, NativeTensor, Region, StratumError};
use stratum_offload::{
    general_copy, AcceleratorBackend, AllocOptions, Backend, CacheSpec, DiskConfig,
    OffloadContext, SegmentPolicy, SegmentedBackend, Tier,
};

struct Fixture {
    _dir: tempfile::TempDir,
    ctx: OffloadContext,
    acc: Backend,
}

fn fixture_with(config: impl FnOnce(&mut DiskConfig)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = DiskConfig::with_root(dir.path());
    cfg.num_copy_threads = 2;
    config(&mut cfg);
    let acc = Arc::new(AcceleratorBackend::new(0));
    let ctx = OffloadContext::from_config(&cfg)
        .unwrap()
        .with_accelerator(acc.clone());
    Fixture {
        _dir: dir,
        ctx,
        acc: Backend::Accelerator(acc),
    }
}

fn fixture() -> Fixture {
    fixture_with(|_| {})
}

fn arange(dims: &[usize]) -> NativeTensor {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|v| v as f32).collect();
    NativeTensor::from_f32(&data, dims, Device::Host).unwrap()
}

fn host_handle(f: &Fixture, data: &NativeTensor) -> stratum_offload::TensorHandle {
    let h = f
        .ctx
        .host()
        .allocate(data.dims(), data.dtype(), &AllocOptions::default())
        .unwrap();
    h.load_from_buffer(&f.ctx, data).unwrap();
    h
}

#[test]
fn test_round_trip_through_every_plain_tier() {
    let f = fixture();
    let data = arange(&[6, 4, 3]);
    let src = host_handle(&f, &data);
    for tier in [f.acc.clone(), f.ctx.disk_tier(), f.ctx.host()] {
        let there = src.copy(&f.ctx, &tier, None).unwrap();
        f.ctx.synchronize().unwrap();
        let back = there.copy(&f.ctx, &f.ctx.host(), None).unwrap();
        f.ctx.synchronize().unwrap();
        assert_eq!(there.tier(), tier.tier());
        assert_eq!(back.native().unwrap().to_bytes(), data.to_bytes());
    }
}

#[test]
fn test_disk_copies_are_queued() {
    let f = fixture();
    let data = arange(&[8, 2]);
    let src = host_handle(&f, &data);
    let dst = f
        .ctx
        .disk_tier()
        .allocate(&[8, 2], DType::F32, &AllocOptions::default())
        .unwrap();
    let outcome = general_copy(&f.ctx, &dst, None, &src, None).unwrap();
    assert_eq!(outcome.queued_len(), 1);
    f.ctx.synchronize().unwrap();
    assert_eq!(dst.materialize(&f.ctx).unwrap().to_f32_vec(), data.to_f32_vec());
}

#[test]
fn test_accelerator_to_unpinned_host_uses_relay() {
    let f = fixture();
    let data = arange(&[4, 3]);
    let on_acc = host_handle(&f, &data).copy(&f.ctx, &f.acc, None).unwrap();

    let unpinned = f
        .ctx
        .host()
        .allocate(&[4, 3], DType::F32, &AllocOptions::default().pinned(false))
        .unwrap();
    let outcome = general_copy(&f.ctx, &unpinned, None, &on_acc, None).unwrap();
    assert_eq!(outcome.queued_len(), 1);
    outcome.wait().unwrap();
    assert_eq!(unpinned.native().unwrap().to_f32_vec(), data.to_f32_vec());

    // One outer row, or a pinned destination, is copied directly.
    let row = f
        .ctx
        .host()
        .allocate(&[1, 3], DType::F32, &AllocOptions::default().pinned(false))
        .unwrap();
    let region = Region::span([2..3]);
    let outcome = general_copy(&f.ctx, &row, None, &on_acc, Some(&region)).unwrap();
    assert!(outcome.is_complete());
    assert_eq!(row.native().unwrap().to_f32_vec(), vec![6.0, 7.0, 8.0]);

    let pinned = f
        .ctx
        .host()
        .allocate(&[4, 3], DType::F32, &AllocOptions::default())
        .unwrap();
    assert!(general_copy(&f.ctx, &pinned, None, &on_acc, None)
        .unwrap()
        .is_complete());
}

#[test]
fn test_unpinned_host_to_accelerator_is_immediate() {
    let f = fixture();
    let data = arange(&[3, 2]);
    let src = f
        .ctx
        .host()
        .allocate(&[3, 2], DType::F32, &AllocOptions::default().pinned(false))
        .unwrap();
    src.load_from_buffer(&f.ctx, &data).unwrap();
    let dst = f.acc.allocate(&[2, 2], DType::F32, &AllocOptions::default()).unwrap();
    let region = Region::span([1..3]);
    let outcome = general_copy(&f.ctx, &dst, None, &src, Some(&region)).unwrap();
    assert!(outcome.is_complete());
    let out = dst.native().unwrap();
    assert_eq!(out.device(), Device::Accelerator(0));
    assert_eq!(out.to_f32_vec(), vec![2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn test_segmented_split_scenario() {
    let f = fixture();
    let seg = Arc::new(
        SegmentedBackend::new(
            vec![f.acc.clone(), f.ctx.host(), f.ctx.disk_tier()],
            SegmentPolicy::new(vec![50.0, 30.0, 20.0], 1),
        )
        .unwrap(),
    );
    let h = Backend::Segmented(seg)
        .allocate(&[2, 100, 4], DType::F16, &AllocOptions::default())
        .unwrap();
    let stratum_offload::Payload::Segmented(parts) = h.payload().unwrap() else {
        panic!("expected segmented payload");
    };
    assert_eq!(parts.bounds, vec![0, 50, 80, 100]);
    let extents: Vec<usize> = parts.iter().map(|(_, _, p)| p.dims()[1]).collect();
    assert_eq!(extents, vec![50, 30, 20]);
    let tiers: Vec<Tier> = parts.iter().map(|(_, _, p)| p.tier()).collect();
    assert_eq!(tiers, vec![Tier::Accelerator, Tier::Host, Tier::Disk]);
}

#[test]
fn test_segmented_copy_matches_per_part_slices() {
    let f = fixture();
    let seg = Backend::Segmented(Arc::new(
        SegmentedBackend::new(
            vec![f.acc.clone(), f.ctx.host(), f.ctx.disk_tier()],
            SegmentPolicy::new(vec![40.0, 40.0, 20.0], 1),
        )
        .unwrap(),
    ));
    let data = arange(&[3, 10, 2]);
    let src = host_handle(&f, &data);
    let h = seg.allocate(&[3, 10, 2], DType::F32, &AllocOptions::default()).unwrap();
    general_copy(&f.ctx, &h, None, &src, None).unwrap();
    f.ctx.synchronize().unwrap();

    let stratum_offload::Payload::Segmented(parts) = h.payload().unwrap() else {
        panic!("expected segmented payload");
    };
    for (start, stop, part) in parts.iter() {
        let expected = data.narrow(1, start, stop - start).unwrap();
        assert_eq!(
            part.materialize(&f.ctx).unwrap().to_f32_vec(),
            expected.to_f32_vec()
        );
    }
    assert_eq!(h.materialize(&f.ctx).unwrap().to_f32_vec(), data.to_f32_vec());

    // A window straddling two segments, read back out.
    let window = Region::span([0..3, 3..7]);
    let out = f
        .ctx
        .host()
        .allocate(&[3, 4, 2], DType::F32, &AllocOptions::default())
        .unwrap();
    general_copy(&f.ctx, &out, None, &h, Some(&window)).unwrap();
    f.ctx.synchronize().unwrap();
    assert_eq!(
        out.native().unwrap().to_f32_vec(),
        data.narrow(1, 3, 4).unwrap().to_f32_vec()
    );
}

#[test]
fn test_segmented_to_segmented_is_rejected() {
    let f = fixture();
    let seg = Backend::Segmented(Arc::new(
        SegmentedBackend::new(
            vec![f.ctx.host(), f.ctx.host()],
            SegmentPolicy::new(vec![50.0, 50.0], 1),
        )
        .unwrap(),
    ));
    let a = seg.allocate(&[1, 4], DType::F32, &AllocOptions::default()).unwrap();
    let b = seg.allocate(&[1, 4], DType::F32, &AllocOptions::default()).unwrap();
    assert!(matches!(
        general_copy(&f.ctx, &a, None, &b, None),
        Err(StratumError::UnsupportedTierCombination(_))
    ));
}

#[test]
fn test_segment_lengths_must_cover_axis() {
    let f = fixture();
    let seg = Backend::Segmented(Arc::new(
        SegmentedBackend::new(
            vec![f.acc.clone(), f.ctx.host()],
            SegmentPolicy::new(vec![50.0, 50.0], 1),
        )
        .unwrap(),
    ));
    let opts = AllocOptions::default().with_segment_lengths(vec![3, 3]);
    assert!(matches!(
        seg.allocate(&[2, 8], DType::F32, &opts),
        Err(StratumError::ShapeMismatch(_))
    ));
    let opts = AllocOptions::default().with_segment_lengths(vec![0, 8]);
    let h = seg.allocate(&[2, 8], DType::F32, &opts).unwrap();
    let stratum_offload::Payload::Segmented(parts) = h.payload().unwrap() else {
        panic!("expected segmented payload");
    };
    assert!(parts.parts[0].is_none());
    assert_eq!(parts.bounds, vec![0, 0, 8]);
}

#[test]
fn test_segmented_cache_rounds_to_heads() {
    let f = fixture();
    let seg = Backend::Segmented(Arc::new(
        SegmentedBackend::new(
            vec![f.acc.clone(), f.ctx.host(), f.ctx.disk_tier()],
            SegmentPolicy::new(vec![30.0, 70.0, 0.0], 1),
        )
        .unwrap(),
    ));
    let spec = CacheSpec {
        prompt_len: 4,
        gen_len: 2,
        batch_size: 3,
        n_head: 4,
        hidden: 16,
        dtype: DType::F16,
    };
    let (k, v) = seg.init_cache_one_batch(&spec).unwrap();
    assert_eq!(k.dims(), &[5, 12, 4]);
    let stratum_offload::Payload::Segmented(parts) = v.payload().unwrap() else {
        panic!("expected segmented payload");
    };
    // 12 * 0.3 = 3 -> 0 whole heads on the accelerator; the host takes the rest.
    assert_eq!(parts.bounds, vec![0, 0, 12, 12]);
}

#[test]
fn test_failed_task_does_not_block_queue() {
    let f = fixture_with(|cfg| cfg.relay_bytes = 16);
    let data = arange(&[8, 4]);
    let disk_src = f
        .ctx
        .disk_tier()
        .allocate(&[8, 4], DType::F32, &AllocOptions::default())
        .unwrap();
    disk_src.load_from_buffer(&f.ctx, &data).unwrap();

    // 128 bytes cannot pass a 16-byte relay.
    let acc_dst = f.acc.allocate(&[8, 4], DType::F32, &AllocOptions::default()).unwrap();
    general_copy(&f.ctx, &acc_dst, None, &disk_src, None).unwrap();

    let host_dst = f
        .ctx
        .host()
        .allocate(&[8, 4], DType::F32, &AllocOptions::default())
        .unwrap();
    general_copy(&f.ctx, &host_dst, None, &disk_src, None).unwrap();

    match f.ctx.synchronize() {
        Err(StratumError::WorkerTaskFailure { count, first }) => {
            assert_eq!(count, 1);
            assert!(first.contains("relay"));
        }
        other => panic!("expected a worker failure, got {other:?}"),
    }
    assert_eq!(host_dst.native().unwrap().to_f32_vec(), data.to_f32_vec());
    // Failures are reported once.
    f.ctx.synchronize().unwrap();
}

#[test]
fn test_gather_rows_from_disk() {
    let f = fixture();
    let data = arange(&[6, 2, 3]);
    let home = f
        .ctx
        .disk_tier()
        .allocate(&[6, 2, 3], DType::F32, &AllocOptions::default())
        .unwrap();
    home.load_from_buffer(&f.ctx, &data).unwrap();
    let staging = f
        .ctx
        .host()
        .allocate(&[3, 2, 3], DType::F32, &AllocOptions::default())
        .unwrap();

    let idx = GatherIndex::new(vec![5, 0, 2, 2], 2, 2).unwrap();
    general_copy(
        &f.ctx,
        &staging,
        Some(&Region::span([0..2, 0..2])),
        &home,
        Some(&Region::gather(idx)),
    )
    .unwrap();
    f.ctx.synchronize().unwrap();

    let got = staging.native().unwrap().to_f32_vec();
    // out[0,0] = src[5,0], out[0,1] = src[0,1], out[1,0] = src[2,0], out[1,1] = src[2,1]
    assert_eq!(&got[0..3], &[30.0, 31.0, 32.0]);
    assert_eq!(&got[3..6], &[3.0, 4.0, 5.0]);
    assert_eq!(&got[6..9], &[12.0, 13.0, 14.0]);
    assert_eq!(&got[9..12], &[15.0, 16.0, 17.0]);
    assert_eq!(&got[12..18], &[0.0; 6]);
}

#[test]
fn test_closed_queue_rejects_disk_copies() {
    let f = fixture();
    let src = host_handle(&f, &arange(&[2]));
    let dst = f
        .ctx
        .disk_tier()
        .allocate(&[2], DType::F32, &AllocOptions::default())
        .unwrap();
    f.ctx.disk().close_copy_threads().unwrap();
    assert!(matches!(
        general_copy(&f.ctx, &dst, None, &src, None),
        Err(StratumError::QueueClosed)
    ));
}
