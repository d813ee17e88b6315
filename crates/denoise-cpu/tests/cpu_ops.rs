// CPU Operator Tests — end-to-end runs of every operator on the CPU device
//
// Every test creates its own CpuDevice, binds tensors/images allocated by the
// device, runs the operator through the full lifecycle and compares against a
// straightforward reference computed on the host.

use std::sync::mpsc;
use std::sync::Arc;

use denoise_core::tensor::{read_tensor, write_tensor};
use denoise_core::{
    Activation, Buffer, ConvDesc, DataType, Device, DeviceConfig, Error, ErrorCode, Image,
    ImageDesc, ImageFormat, InputProcessDesc, Op, OpState, OutputProcessDesc, PoolDesc, Storage,
    Tensor, TensorDesc, TensorLayout, Tile, TransferFunction, TransferKind, UpsampleDesc,
};
use denoise_cpu::CpuDevice;
use half::f16;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn device() -> CpuDevice {
    CpuDevice::new(DeviceConfig::default().num_threads(2)).unwrap()
}

fn approx(a: f32, b: f32, tol: f32) -> bool {
    (a - b).abs() <= tol
}

fn assert_approx_vec(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(approx(*a, *e, tol), "index {i}: {a} != {e} (tol={tol})");
    }
}

fn random_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn tensor_with(dev: &CpuDevice, desc: TensorDesc, data: &[f32]) -> Arc<dyn Tensor> {
    let t = dev.new_tensor(desc, Storage::Host).unwrap();
    write_tensor(dev.allocator().as_ref(), t.as_ref(), data).unwrap();
    t
}

fn read(dev: &CpuDevice, t: &Arc<dyn Tensor>) -> Vec<f32> {
    read_tensor::<f32>(dev.allocator().as_ref(), t.as_ref()).unwrap()
}

/// Scatter planar NCHW values into an activation tensor of any layout.
fn pack_activation(desc: &TensorDesc, planar: &[f32]) -> Vec<f32> {
    let (n, c, h, w) = (desc.n(), desc.c(), desc.h(), desc.w());
    let mut out = vec![0.0; desc.num_elements()];
    for b in 0..n {
        for ch in 0..c {
            for y in 0..h {
                for x in 0..w {
                    out[desc.activation_offset(b, ch, y, x)] =
                        planar[((b * c + ch) * h + y) * w + x];
                }
            }
        }
    }
    out
}

fn unpack_activation(desc: &TensorDesc, packed: &[f32]) -> Vec<f32> {
    let (n, c, h, w) = (desc.n(), desc.c(), desc.h(), desc.w());
    let mut out = vec![0.0; desc.num_elements()];
    for b in 0..n {
        for ch in 0..c {
            for y in 0..h {
                for x in 0..w {
                    out[((b * c + ch) * h + y) * w + x] = packed[desc.activation_offset(b, ch, y, x)];
                }
            }
        }
    }
    out
}

fn pack_weight(desc: &TensorDesc, planar: &[f32]) -> Vec<f32> {
    let [o, i, kh, kw] = desc.oihw_dims();
    let mut out = vec![0.0; desc.num_elements()];
    for a in 0..o {
        for b in 0..i {
            for y in 0..kh {
                for x in 0..kw {
                    out[desc.weight_offset(a, b, y, x)] = planar[((a * i + b) * kh + y) * kw + x];
                }
            }
        }
    }
    out
}

/// Planar "same" convolution with bias and optional ReLU.
#[allow(clippy::too_many_arguments)]
fn reference_conv(
    src: &[f32],
    weight: &[f32],
    bias: &[f32],
    [n, c, h, w]: [usize; 4],
    [o, kh, kw]: [usize; 3],
    relu: bool,
) -> Vec<f32> {
    let (ph, pw) = (kh / 2, kw / 2);
    let mut out = vec![0.0f32; n * o * h * w];
    for b in 0..n {
        for oc in 0..o {
            for y in 0..h {
                for x in 0..w {
                    let mut acc = bias[oc];
                    for ic in 0..c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let (sy, sx) = (y + ky, x + kx);
                                if sy < ph || sx < pw || sy - ph >= h || sx - pw >= w {
                                    continue;
                                }
                                acc += src[((b * c + ic) * h + sy - ph) * w + sx - pw]
                                    * weight[((oc * c + ic) * kh + ky) * kw + kx];
                            }
                        }
                    }
                    out[((b * o + oc) * h + y) * w + x] = if relu { acc.max(0.0) } else { acc };
                }
            }
        }
    }
    out
}

fn image_with(dev: &CpuDevice, desc: ImageDesc, values: &[f32]) -> Arc<Image> {
    let buffer = dev.new_buffer(desc.byte_size(), Storage::Host).unwrap();
    let bytes: Vec<u8> = match desc.format.channel_type() {
        DataType::Float16 => values
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_ne_bytes())
            .collect(),
        _ => values.iter().flat_map(|v| v.to_ne_bytes()).collect(),
    };
    buffer.write(0, &bytes).unwrap();
    Arc::new(Image::from_buffer(buffer, desc, 0).unwrap())
}

fn read_image(image: &Image) -> Vec<f32> {
    let buffer = image.buffer().unwrap();
    let mut bytes = vec![0u8; image.desc().byte_size()];
    buffer.read(0, &mut bytes).unwrap();
    match image.format().channel_type() {
        DataType::Float16 => bytes
            .chunks_exact(2)
            .map(|b| f16::from_ne_bytes([b[0], b[1]]).to_f32())
            .collect(),
        _ => bytes
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Convolution
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_conv_relu_matches_reference() {
    let dev = device();
    let mut rng = StdRng::seed_from_u64(7);
    let (c, h, w, o) = (3, 32, 32, 5);
    let src_desc = TensorDesc::new(vec![1, c, h, w], TensorLayout::Chw, DataType::Float32).unwrap();
    let weight_desc =
        TensorDesc::new(vec![o, c, 3, 3], TensorLayout::Oihw, DataType::Float32).unwrap();
    let bias_desc = TensorDesc::new(vec![o], TensorLayout::X, DataType::Float32).unwrap();
    let desc = ConvDesc::new(src_desc.clone(), weight_desc.clone(), bias_desc.clone(), Activation::ReLU)
        .unwrap();

    let src = random_vec(&mut rng, c * h * w);
    let weight = random_vec(&mut rng, o * c * 9);
    let bias = random_vec(&mut rng, o);

    let mut conv = dev.new_conv(desc.clone()).unwrap();
    assert!(conv.is_supported());
    let scratch = dev.new_scratch_tensor(conv.scratch_byte_size().unwrap()).unwrap();
    conv.set_scratch(scratch).unwrap();
    conv.set_src(tensor_with(&dev, src_desc, &src)).unwrap();
    conv.set_weight(tensor_with(&dev, weight_desc, &weight)).unwrap();
    conv.set_bias(tensor_with(&dev, bias_desc, &bias)).unwrap();
    let dst = dev.new_tensor(desc.dst().clone(), Storage::Host).unwrap();
    conv.set_dst(dst.clone()).unwrap();
    conv.finalize().unwrap();
    assert_eq!(conv.state(), OpState::Finalized);

    conv.run().unwrap();
    dev.wait().unwrap();

    let expected = reference_conv(&src, &weight, &bias, [1, c, h, w], [o, 3, 3], true);
    let actual = read(&dev, &dst);
    assert_approx_vec(&actual, &expected, 1e-4);
    assert!(actual.iter().all(|v| *v >= 0.0));
}

#[test]
fn test_conv_blocked_layout_without_scratch() {
    let dev = device();
    let mut rng = StdRng::seed_from_u64(11);
    let (c, h, w, o) = (8, 6, 5, 16);
    let src_desc = TensorDesc::chw(c, h, w, TensorLayout::Chw8c, DataType::Float32).unwrap();
    let weight_desc =
        TensorDesc::new(vec![o, c, 3, 3], TensorLayout::OIhw8i8o, DataType::Float32).unwrap();
    let bias_desc = TensorDesc::new(vec![o], TensorLayout::X, DataType::Float32).unwrap();
    let desc = ConvDesc::new(src_desc.clone(), weight_desc.clone(), bias_desc.clone(), Activation::None)
        .unwrap();

    let src = random_vec(&mut rng, c * h * w);
    let weight = random_vec(&mut rng, o * c * 9);
    let bias = random_vec(&mut rng, o);

    let mut conv = dev.new_conv(desc.clone()).unwrap();
    conv.set_src(tensor_with(&dev, src_desc.clone(), &pack_activation(&src_desc, &src)))
        .unwrap();
    conv.set_weight(tensor_with(&dev, weight_desc.clone(), &pack_weight(&weight_desc, &weight)))
        .unwrap();
    conv.set_bias(tensor_with(&dev, bias_desc, &bias)).unwrap();
    let dst = dev.new_tensor(desc.dst().clone(), Storage::Host).unwrap();
    conv.set_dst(dst.clone()).unwrap();
    conv.finalize().unwrap();
    conv.run().unwrap();
    dev.wait().unwrap();

    let expected = reference_conv(&src, &weight, &bias, [1, c, h, w], [o, 3, 3], false);
    let actual = unpack_activation(desc.dst(), &read(&dev, &dst));
    assert_approx_vec(&actual, &expected, 1e-4);
}

fn small_conv_desc(dtype: DataType) -> ConvDesc {
    ConvDesc::new(
        TensorDesc::chw(8, 4, 4, TensorLayout::Chw8c, dtype).unwrap(),
        TensorDesc::new(vec![8, 8, 3, 3], TensorLayout::OIhw8i8o, dtype).unwrap(),
        TensorDesc::new(vec![8], TensorLayout::X, dtype).unwrap(),
        Activation::ReLU,
    )
    .unwrap()
}

/// Occupy the queue worker until the returned sender is used (or dropped).
fn block_queue(dev: &CpuDevice) -> mpsc::Sender<()> {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    dev.run_host_func_async(Box::new(move || {
        let _ = started_tx.send(());
        let _ = release_rx.recv();
    }))
    .unwrap();
    started_rx.recv().unwrap();
    release_tx
}

#[test]
fn test_run_before_finalize_enqueues_nothing() {
    let dev = device();
    let conv = dev.new_conv(small_conv_desc(DataType::Float32)).unwrap();
    let release = block_queue(&dev);
    assert_eq!(dev.engine().pending(), 0);

    let err = conv.run().unwrap_err();
    assert!(matches!(err, Error::Logic(_)));
    assert_eq!(err.code(), ErrorCode::InvalidOperation);
    assert_eq!(conv.state(), OpState::Configured);
    assert_eq!(dev.engine().pending(), 0);

    release.send(()).unwrap();
    dev.wait().unwrap();
}

#[test]
fn test_finalize_does_not_require_bias() {
    let dev = device();
    let mut rng = StdRng::seed_from_u64(11);
    let desc = small_conv_desc(DataType::Float32);
    let mut conv = dev.new_conv(desc.clone()).unwrap();
    let src = random_vec(&mut rng, desc.src.num_elements());
    let weight = random_vec(&mut rng, desc.weight.num_elements());
    conv.set_src(tensor_with(&dev, desc.src.clone(), &src)).unwrap();
    conv.set_weight(tensor_with(&dev, desc.weight.clone(), &weight)).unwrap();
    let dst = dev.new_tensor(desc.dst().clone(), Storage::Host).unwrap();
    conv.set_dst(dst.clone()).unwrap();
    conv.finalize().unwrap();

    // Running without a bias is refused and nothing is queued.
    assert!(matches!(conv.run(), Err(Error::Logic(_))));
    dev.wait().unwrap();

    // A bias bound for the first time after finalize is accepted; replacing
    // it is not.
    let bias = tensor_with(&dev, desc.bias.clone(), &[0.5; 8]);
    conv.set_bias(bias.clone()).unwrap();
    assert!(matches!(conv.set_bias(bias), Err(Error::Logic(_))));
    conv.run().unwrap();
    dev.wait().unwrap();
    assert!(read(&dev, &dst).iter().all(|v| *v >= 0.0));
}

#[test]
fn test_finalize_waits_for_queued_work() {
    let dev = device();
    let desc = small_conv_desc(DataType::Float32);
    let mut conv = dev.new_conv(desc.clone()).unwrap();
    let n = desc.src.num_elements();
    conv.set_src(tensor_with(&dev, desc.src.clone(), &vec![1.0; n])).unwrap();
    conv.set_weight(tensor_with(&dev, desc.weight.clone(), &vec![1.0; desc.weight.num_elements()]))
        .unwrap();
    conv.set_bias(tensor_with(&dev, desc.bias.clone(), &[0.0; 8])).unwrap();
    let dst = tensor_with(&dev, desc.dst().clone(), &vec![7.0; desc.dst().num_elements()]);
    conv.set_dst(dst.clone()).unwrap();
    let scratch = dev.new_scratch_tensor(conv.scratch_byte_size().unwrap()).unwrap();
    conv.set_scratch(scratch).unwrap();

    // Work queued before finalize must observe the destination untouched by
    // the algorithm search.
    let seen = Arc::new(Mutex::new(None));
    let seen_by_job = seen.clone();
    let dst_ptr = dst.data() as usize;
    dev.run_host_func_async(Box::new(move || {
        std::thread::sleep(std::time::Duration::from_millis(100));
        // SAFETY: dst is kept alive by the test until after wait().
        let first = unsafe { *(dst_ptr as *const f32) };
        *seen_by_job.lock() = Some(first);
    }))
    .unwrap();
    conv.finalize().unwrap();
    assert_eq!(*seen.lock(), Some(7.0));
    dev.wait().unwrap();
}

#[test]
fn test_finalize_requires_operands_and_happens_once() {
    let dev = device();
    let desc = small_conv_desc(DataType::Float32);
    let mut conv = dev.new_conv(desc.clone()).unwrap();
    conv.set_src(dev.new_tensor(desc.src.clone(), Storage::Host).unwrap())
        .unwrap();
    let err = conv.finalize().unwrap_err();
    assert_eq!(
        err.to_string(),
        "logic error: conv weight/destination not set before finalization"
    );
    assert_eq!(conv.state(), OpState::Configured);

    conv.set_weight(dev.new_tensor(desc.weight.clone(), Storage::Host).unwrap())
        .unwrap();
    conv.set_bias(dev.new_tensor(desc.bias.clone(), Storage::Host).unwrap())
        .unwrap();
    let dst = dev.new_tensor(desc.dst().clone(), Storage::Host).unwrap();
    conv.set_dst(dst.clone()).unwrap();
    conv.finalize().unwrap();

    assert!(matches!(conv.finalize(), Err(Error::Logic(_))));
    assert!(matches!(conv.set_dst(dst), Err(Error::Logic(_))));
    assert_eq!(conv.state(), OpState::Finalized);
}

#[test]
fn test_operand_descriptor_mismatch() {
    let dev = device();
    let desc = small_conv_desc(DataType::Float32);
    let mut conv = dev.new_conv(desc.clone()).unwrap();
    let wrong = dev.new_tensor(desc.dst().with_dims(vec![8, 4, 5]).unwrap(), Storage::Host).unwrap();
    let err = conv.set_src(wrong).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
}

#[test]
fn test_half_conv_is_unsupported() {
    let dev = device();
    let mut conv = dev.new_conv(small_conv_desc(DataType::Float16)).unwrap();
    assert!(!conv.is_supported());
    assert_eq!(conv.state(), OpState::Unsupported);
    assert!(matches!(conv.finalize(), Err(Error::Logic(_))));
    assert_eq!(conv.state(), OpState::Unsupported);
}

#[test]
fn test_scratch_size_is_a_function_of_the_descriptor() {
    let dev = device();
    let desc = small_conv_desc(DataType::Float32);
    let a = dev.new_conv(desc.clone()).unwrap();
    let b = dev.new_conv(desc).unwrap();
    let size = a.scratch_byte_size().unwrap();
    assert_eq!(size, a.scratch_byte_size().unwrap());
    assert_eq!(size, b.scratch_byte_size().unwrap());
    assert_eq!(size, 8 * 9 * 4 * 4 * 4);
}

#[test]
fn test_conv_on_deferred_memory_needs_update_ptr() {
    let dev = device();
    let desc = small_conv_desc(DataType::Float32);
    let arena = dev
        .new_deferred_buffer(
            desc.src.byte_size() + desc.dst().byte_size(),
            Storage::Host,
        )
        .unwrap();
    let src = dev.new_tensor_view(arena.clone(), desc.src.clone(), 0).unwrap();
    let dst = dev
        .new_tensor_view(arena.clone(), desc.dst().clone(), desc.src.byte_size())
        .unwrap();
    assert!(src.data().is_null());

    let mut conv = dev.new_conv(desc.clone()).unwrap();
    conv.set_src(src.clone()).unwrap();
    conv.set_weight(tensor_with(&dev, desc.weight.clone(), &vec![0.0; desc.weight.num_elements()]))
        .unwrap();
    conv.set_bias(tensor_with(&dev, desc.bias.clone(), &[1.0; 8])).unwrap();
    conv.set_dst(dst.clone()).unwrap();
    conv.finalize().unwrap();
    assert!(matches!(conv.run(), Err(Error::Logic(_))));

    arena.commit().unwrap();
    src.update_ptr().unwrap();
    dst.update_ptr().unwrap();
    conv.run().unwrap();
    dev.wait().unwrap();
    assert!(read(&dev, &dst).iter().all(|v| *v == 1.0));
}

// ─────────────────────────────────────────────────────────────────────────
// Tensors and buffers
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_view_bounds_and_realloc() {
    let dev = device();
    let desc = TensorDesc::chw(8, 2, 2, TensorLayout::Chw8c, DataType::Float32).unwrap();
    let buffer = dev.new_buffer(256, Storage::Host).unwrap();
    assert!(dev.new_tensor_view(buffer.clone(), desc.clone(), 128).is_ok());
    assert!(matches!(
        dev.new_tensor_view(buffer.clone(), desc.clone(), 129),
        Err(Error::InvalidArgument(_))
    ));

    let view = dev.new_tensor_view(buffer.clone(), desc, 64).unwrap();
    buffer.realloc(1024).unwrap();
    view.update_ptr().unwrap();
    assert_eq!(view.data(), unsafe { buffer.data().add(64) });
    buffer.realloc(128).unwrap();
    assert!(matches!(view.update_ptr(), Err(Error::Range(_))));
}

#[test]
fn test_allocations_are_released() {
    let dev = device();
    {
        let _a = dev.new_buffer(1000, Storage::Host).unwrap();
        let _t = dev
            .new_tensor(TensorDesc::bytes(64).unwrap(), Storage::Host)
            .unwrap();
        assert_eq!(dev.alloc_stats().live_blocks, 2);
    }
    let stats = dev.alloc_stats();
    assert_eq!(stats.live_blocks, 0);
    assert_eq!(stats.live_bytes, 0);
    assert!(stats.peak_bytes >= 1064);
}

#[test]
fn test_pointer_storage_and_wrap() {
    let dev = device();
    let buffer = dev.new_buffer(32, Storage::Host).unwrap();
    assert_eq!(dev.pointer_storage(buffer.data()), Storage::Host);
    assert_eq!(dev.pointer_storage(std::ptr::null()), Storage::Undefined);

    let mut mem = vec![0u8; 16];
    let wrapped: Arc<Buffer> = dev.wrap_buffer(mem.as_mut_ptr(), mem.len()).unwrap();
    assert!(!wrapped.is_owned());
    wrapped.write(0, &[9; 16]).unwrap();
    drop(wrapped);
    assert_eq!(mem, vec![9u8; 16]);
}

// ─────────────────────────────────────────────────────────────────────────
// Pooling / upsampling
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_pool_takes_window_max() {
    let dev = device();
    let src_desc = TensorDesc::chw(8, 4, 6, TensorLayout::Chw8c, DataType::Float32).unwrap();
    let desc = PoolDesc::new(src_desc.clone()).unwrap();
    let planar: Vec<f32> = (0..src_desc.num_elements()).map(|i| (i % 13) as f32).collect();

    let mut pool = dev.new_pool(desc.clone()).unwrap();
    pool.set_src(tensor_with(&dev, src_desc.clone(), &pack_activation(&src_desc, &planar)))
        .unwrap();
    let dst = dev.new_tensor(desc.dst().clone(), Storage::Host).unwrap();
    pool.set_dst(dst.clone()).unwrap();
    pool.finalize().unwrap();
    pool.run().unwrap();
    dev.wait().unwrap();

    let out = unpack_activation(desc.dst(), &read(&dev, &dst));
    let (h, w) = (4, 6);
    for c in 0..8 {
        for y in 0..2 {
            for x in 0..3 {
                let at = |yy: usize, xx: usize| planar[(c * h + yy) * w + xx];
                let m = at(2 * y, 2 * x)
                    .max(at(2 * y, 2 * x + 1))
                    .max(at(2 * y + 1, 2 * x))
                    .max(at(2 * y + 1, 2 * x + 1));
                assert_eq!(out[(c * 2 + y) * 3 + x], m);
            }
        }
    }
}

#[test]
fn test_upsample_repeats_each_pixel() {
    let dev = device();
    let src_desc = TensorDesc::chw(16, 2, 3, TensorLayout::Chw16c, DataType::Float32).unwrap();
    let desc = UpsampleDesc::new(src_desc.clone()).unwrap();
    let planar: Vec<f32> = (0..src_desc.num_elements()).map(|i| i as f32).collect();

    let mut up = dev.new_upsample(desc.clone()).unwrap();
    up.set_src(tensor_with(&dev, src_desc.clone(), &pack_activation(&src_desc, &planar)))
        .unwrap();
    let dst = dev.new_tensor(desc.dst().clone(), Storage::Host).unwrap();
    up.set_dst(dst.clone()).unwrap();
    up.finalize().unwrap();
    up.run().unwrap();
    dev.wait().unwrap();

    let out = unpack_activation(desc.dst(), &read(&dev, &dst));
    for c in 0..16 {
        for y in 0..4 {
            for x in 0..6 {
                assert_eq!(out[(c * 4 + y) * 6 + x], planar[(c * 2 + y / 2) * 3 + x / 2]);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Image operators
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_input_process_layout_and_padding() {
    let dev = device();
    let tensor_desc = TensorDesc::chw(16, 4, 5, TensorLayout::Chw8c, DataType::Float32).unwrap();
    let desc = InputProcessDesc::new(
        tensor_desc.clone(),
        TransferFunction::new(TransferKind::Linear),
        false,
        false,
    )
    .unwrap();
    let image_desc = ImageDesc::new(ImageFormat::Float3, 3, 2);
    let color = image_with(&dev, image_desc, &[2.0; 18]);
    let normal = image_with(&dev, image_desc, &[-1.0; 18]);

    let mut op = dev.new_input_process(desc).unwrap();
    op.set_src(Some(color), None, Some(normal)).unwrap();
    let dst = dev.new_tensor(tensor_desc.clone(), Storage::Host).unwrap();
    write_tensor(dev.allocator().as_ref(), dst.as_ref(), &vec![7.0f32; tensor_desc.num_elements()])
        .unwrap();
    op.set_dst(dst.clone()).unwrap();
    op.set_input_scale(0.25);
    op.set_tile(Tile {
        h_src: 0,
        w_src: 0,
        h_dst: 1,
        w_dst: 1,
        h: 2,
        w: 3,
    })
    .unwrap();
    op.finalize().unwrap();
    op.run().unwrap();
    dev.wait().unwrap();

    let out = unpack_activation(&tensor_desc, &read(&dev, &dst));
    let at = |c: usize, y: usize, x: usize| out[(c * 4 + y) * 5 + x];
    // color 2.0 x 0.25, normal -1 -> 0, the rest zero
    assert_eq!(at(0, 1, 1), 0.5);
    assert_eq!(at(2, 2, 3), 0.5);
    assert_eq!(at(3, 1, 1), 0.0);
    assert_eq!(at(5, 2, 2), 0.0);
    assert_eq!(at(6, 1, 1), 0.0);
    assert_eq!(at(15, 1, 1), 0.0);
    // outside the tile
    assert_eq!(at(0, 0, 0), 0.0);
    assert_eq!(at(1, 3, 4), 0.0);
    assert!(out.iter().all(|v| *v != 7.0));
}

#[test]
fn test_input_process_rejects_bad_sources() {
    let dev = device();
    let tensor_desc = TensorDesc::chw(3, 4, 4, TensorLayout::Chw, DataType::Float32).unwrap();
    let desc = InputProcessDesc::new(
        tensor_desc,
        TransferFunction::new(TransferKind::Linear),
        true,
        false,
    )
    .unwrap();
    let mut op = dev.new_input_process(desc).unwrap();
    assert!(matches!(op.set_src(None, None, None), Err(Error::InvalidArgument(_))));
    let a = image_with(&dev, ImageDesc::new(ImageFormat::Float3, 4, 4), &[0.0; 48]);
    let b = image_with(&dev, ImageDesc::new(ImageFormat::Float3, 4, 4), &[0.0; 48]);
    // two images need six channels
    assert!(matches!(op.set_src(Some(a), Some(b), None), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_input_output_round_trip() {
    let dev = device();
    let (h, w) = (5, 7);
    let tensor_desc = TensorDesc::chw(8, h, w, TensorLayout::Chw8c, DataType::Float32).unwrap();
    let image_desc = ImageDesc::new(ImageFormat::Float3, w, h);
    let mut rng = StdRng::seed_from_u64(3);
    let values: Vec<f32> = (0..3 * h * w).map(|_| rng.gen_range(0.0f32..4.0)).collect();
    let color = image_with(&dev, image_desc, &values);
    let out_image = image_with(&dev, image_desc, &vec![0.0; 3 * h * w]);

    let transfer = TransferFunction::new(TransferKind::Pu);
    let mut input = dev
        .new_input_process(InputProcessDesc::new(tensor_desc.clone(), transfer, true, false).unwrap())
        .unwrap();
    let mut output = dev
        .new_output_process(OutputProcessDesc::new(tensor_desc.clone(), transfer, true, false).unwrap())
        .unwrap();
    let tensor = dev.new_tensor(tensor_desc, Storage::Host).unwrap();

    input.set_src(Some(color), None, None).unwrap();
    input.set_dst(tensor.clone()).unwrap();
    input.set_input_scale(0.5);
    input.finalize().unwrap();
    output.set_src(tensor).unwrap();
    output.set_dst(out_image.clone()).unwrap();
    output.set_input_scale(0.5);
    output.finalize().unwrap();

    input.run().unwrap();
    output.run().unwrap();
    dev.wait().unwrap();

    let back = read_image(&out_image);
    for (a, e) in back.iter().zip(values.iter()) {
        assert!(approx(*a, *e, 1e-3 * (1.0 + e)), "{a} != {e}");
    }
}

#[test]
fn test_output_process_clamps_ldr_and_tiles() {
    let dev = device();
    let tensor_desc = TensorDesc::chw(3, 2, 2, TensorLayout::Chw, DataType::Float32).unwrap();
    let src = tensor_with(
        &dev,
        tensor_desc.clone(),
        &[
            2.0, -1.0, f32::NAN, 0.5, // channel 0
            0.25, 0.25, 0.25, 0.25, // channel 1
            1.0, 1.0, 1.0, 1.0, // channel 2
        ],
    );
    let image = image_with(&dev, ImageDesc::new(ImageFormat::Float3, 3, 3), &[9.0; 27]);
    let mut op = dev
        .new_output_process(
            OutputProcessDesc::new(tensor_desc, TransferFunction::new(TransferKind::Linear), false, false)
                .unwrap(),
        )
        .unwrap();
    op.set_src(src).unwrap();
    op.set_dst(image.clone()).unwrap();
    op.set_tile(Tile {
        h_src: 0,
        w_src: 0,
        h_dst: 1,
        w_dst: 1,
        h: 2,
        w: 2,
    })
    .unwrap();
    op.finalize().unwrap();
    op.run().unwrap();
    dev.wait().unwrap();

    let px = read_image(&image);
    let pixel = |y: usize, x: usize| &px[(y * 3 + x) * 3..(y * 3 + x) * 3 + 3];
    assert_eq!(pixel(0, 0), &[9.0, 9.0, 9.0]);
    assert_eq!(pixel(1, 1), &[1.0, 0.25, 1.0]);
    assert_eq!(pixel(1, 2), &[0.0, 0.25, 1.0]);
    assert_eq!(pixel(2, 1), &[0.0, 0.25, 1.0]);
    assert_eq!(pixel(2, 2), &[0.5, 0.25, 1.0]);

    op.set_tile(Tile {
        h_src: 0,
        w_src: 0,
        h_dst: 2,
        w_dst: 2,
        h: 2,
        w: 2,
    })
    .unwrap();
    assert!(matches!(op.run(), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_autoexposure() {
    let dev = device();
    let desc = ImageDesc::new(ImageFormat::Float3, 40, 20);
    let mut op = dev.new_autoexposure(desc).unwrap();
    assert!(matches!(op.result(), Err(Error::Logic(_))));
    op.set_src(image_with(&dev, desc, &vec![0.5; 3 * 40 * 20])).unwrap();
    op.finalize().unwrap();
    op.run().unwrap();
    dev.wait().unwrap();
    assert!(approx(op.result().unwrap(), 0.36, 1e-4));

    let mut black = dev.new_autoexposure(desc).unwrap();
    black.set_src(image_with(&dev, desc, &vec![0.0; 3 * 40 * 20])).unwrap();
    black.finalize().unwrap();
    black.run().unwrap();
    dev.wait().unwrap();
    assert_eq!(black.result().unwrap(), 1.0);
}

#[test]
fn test_image_copy_converts_format() {
    let dev = device();
    let src = image_with(
        &dev,
        ImageDesc::new(ImageFormat::Float3, 2, 1),
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
    );
    let dst = image_with(&dev, ImageDesc::new(ImageFormat::Half4, 2, 1), &[8.0; 8]);
    let mut copy = dev.new_image_copy().unwrap();
    copy.set_src(src).unwrap();
    copy.set_dst(dst.clone()).unwrap();
    copy.finalize().unwrap();
    copy.run().unwrap();
    dev.wait().unwrap();
    assert_eq!(read_image(&dst), vec![1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0]);

    let small = image_with(&dev, ImageDesc::new(ImageFormat::Float, 1, 1), &[0.0]);
    let mut other = dev.new_image_copy().unwrap();
    other.set_dst(dst).unwrap();
    assert!(matches!(other.set_src(small), Err(Error::InvalidArgument(_))));
}

// ─────────────────────────────────────────────────────────────────────────
// Queue
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_host_functions_run_in_order() {
    let dev = device();
    let log = Arc::new(Mutex::new(Vec::new()));
    for i in 0..16 {
        let log = log.clone();
        dev.run_host_func_async(Box::new(move || log.lock().push(i)))
            .unwrap();
    }
    dev.wait().unwrap();
    assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
}

#[test]
fn test_kernel_then_host_function() {
    let dev = device();
    let t = dev
        .new_tensor(TensorDesc::new(vec![1000], TensorLayout::X, DataType::Float32).unwrap(), Storage::Host)
        .unwrap();
    let ptr = denoise_cpu::SyncPtr::<f32>::new(t.data());
    let keep = t.clone();
    dev.run_kernel_async(denoise_core::WorkDim([1000]), move |[i]| {
        let _alive = &keep;
        unsafe { ptr.set(i, i as f32) };
    })
    .unwrap();
    let sum = Arc::new(Mutex::new(0.0f32));
    let (s, keep) = (sum.clone(), t.clone());
    dev.run_host_func_async(Box::new(move || {
        let _alive = &keep;
        *s.lock() = (0..1000).map(|i| unsafe { ptr.get(i) }).sum();
    }))
    .unwrap();
    dev.wait().unwrap();
    assert_eq!(*sum.lock(), 499_500.0);
}
