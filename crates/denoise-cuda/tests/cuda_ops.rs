// CUDA Operator Tests — end-to-end runs on the first GPU
//
// Every test opens its own CudaDevice and returns early when no usable CUDA
// driver, cuDNN or NVRTC is installed, so the suite passes on CPU-only
// machines. Tensors live in device memory and are filled and read back with
// the allocator's memcpy; images use pinned host memory, which kernels can
// address directly.

use std::sync::Arc;

use denoise_core::tensor::{read_tensor, write_tensor};
use denoise_core::{
    Activation, ConvDesc, DataType, Device, DeviceConfig, Error, Image, ImageDesc, ImageFormat,
    InputProcessDesc, OpState, OutputProcessDesc, PoolDesc, Storage, Tensor, TensorDesc,
    TensorLayout, TransferFunction, TransferKind, UpsampleDesc,
};
use denoise_cuda::CudaDevice;
use half::f16;
use parking_lot::Mutex;

fn device() -> Option<CudaDevice> {
    match CudaDevice::new(DeviceConfig::default()) {
        Ok(dev) => Some(dev),
        Err(e) => {
            eprintln!("skipping: {e}");
            None
        }
    }
}

fn tensor_with(dev: &CudaDevice, desc: TensorDesc, data: &[f32]) -> Arc<dyn Tensor> {
    let t = dev.new_tensor(desc, Storage::Device).unwrap();
    write_tensor(dev.allocator().as_ref(), t.as_ref(), data).unwrap();
    t
}

fn read(dev: &CudaDevice, t: &Arc<dyn Tensor>) -> Vec<f32> {
    read_tensor::<f32>(dev.allocator().as_ref(), t.as_ref()).unwrap()
}

fn image_with(dev: &CudaDevice, desc: ImageDesc, values: &[f32]) -> Arc<Image> {
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

fn pattern(n: usize, modulo: usize) -> Vec<f32> {
    (0..n).map(|i| ((i % modulo) as f32 - modulo as f32 / 2.0) / modulo as f32).collect()
}

#[allow(clippy::too_many_arguments)]
fn reference_conv(
    src: &[f32],
    weight: &[f32],
    bias: &[f32],
    [c, h, w]: [usize; 3],
    o: usize,
    relu: bool,
) -> Vec<f32> {
    let mut out = vec![0.0f32; o * h * w];
    for oc in 0..o {
        for y in 0..h {
            for x in 0..w {
                let mut acc = bias[oc];
                for ic in 0..c {
                    for ky in 0..3 {
                        for kx in 0..3 {
                            let (sy, sx) = (y + ky, x + kx);
                            if sy < 1 || sx < 1 || sy - 1 >= h || sx - 1 >= w {
                                continue;
                            }
                            acc += src[(ic * h + sy - 1) * w + sx - 1]
                                * weight[((oc * c + ic) * 3 + ky) * 3 + kx];
                        }
                    }
                }
                out[(oc * h + y) * w + x] = if relu { acc.max(0.0) } else { acc };
            }
        }
    }
    out
}

#[test]
fn test_device_properties() {
    let Some(dev) = device() else { return };
    assert_eq!(dev.name(), "cuda:0");
    assert_eq!(dev.default_storage(), Storage::Device);
    assert_eq!(dev.tensor_layout(), TensorLayout::Chw);
    assert_eq!(dev.weight_layout(), TensorLayout::Oihw);
    let expected = if dev.engine().has_tensor_cores() {
        DataType::Float16
    } else {
        DataType::Float32
    };
    assert_eq!(dev.tensor_data_type(), expected);
}

#[test]
fn test_pointer_storage() {
    let Some(dev) = device() else { return };
    for storage in [Storage::Host, Storage::Device, Storage::Managed] {
        let buffer = dev.new_buffer(256, storage).unwrap();
        assert_eq!(dev.pointer_storage(buffer.data()), storage);
    }
    assert_eq!(dev.pointer_storage(std::ptr::null()), Storage::Undefined);
}

#[test]
fn test_conv_relu_matches_reference() {
    let Some(dev) = device() else { return };
    let (c, h, w, o) = (4, 9, 11, 6);
    let src_desc = TensorDesc::chw(c, h, w, TensorLayout::Chw, DataType::Float32).unwrap();
    let weight_desc =
        TensorDesc::new(vec![o, c, 3, 3], TensorLayout::Oihw, DataType::Float32).unwrap();
    let bias_desc = TensorDesc::new(vec![o], TensorLayout::X, DataType::Float32).unwrap();
    let desc = ConvDesc::new(src_desc.clone(), weight_desc.clone(), bias_desc.clone(), Activation::ReLU)
        .unwrap();

    let src = pattern(c * h * w, 17);
    let weight = pattern(o * c * 9, 7);
    let bias = pattern(o, 3);

    let mut conv = dev.new_conv(desc.clone()).unwrap();
    assert!(conv.is_supported());
    let scratch = dev.new_scratch_tensor(conv.scratch_byte_size().unwrap()).unwrap();
    conv.set_scratch(scratch).unwrap();
    conv.set_src(tensor_with(&dev, src_desc, &src)).unwrap();
    conv.set_weight(tensor_with(&dev, weight_desc, &weight)).unwrap();
    conv.set_bias(tensor_with(&dev, bias_desc, &bias)).unwrap();
    let dst = dev.new_tensor(desc.dst().clone(), Storage::Device).unwrap();
    conv.set_dst(dst.clone()).unwrap();
    conv.finalize().unwrap();
    assert_eq!(conv.state(), OpState::Finalized);

    conv.run().unwrap();
    dev.wait().unwrap();

    let expected = reference_conv(&src, &weight, &bias, [c, h, w], o, true);
    let actual = read(&dev, &dst);
    // cuDNN may use TF32 for f32 convolutions on recent GPUs.
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!((a - e).abs() <= 2e-2, "index {i}: {a} != {e}");
    }
}

#[test]
fn test_conv_without_scratch_or_memory() {
    let Some(dev) = device() else { return };
    let src_desc = TensorDesc::chw(8, 4, 4, TensorLayout::Chw, DataType::Float32).unwrap();
    let weight_desc =
        TensorDesc::new(vec![8, 8, 3, 3], TensorLayout::Oihw, DataType::Float32).unwrap();
    let bias_desc = TensorDesc::new(vec![8], TensorLayout::X, DataType::Float32).unwrap();
    let desc = ConvDesc::new(src_desc.clone(), weight_desc.clone(), bias_desc.clone(), Activation::None)
        .unwrap();

    // Operands without memory: the algorithm is chosen without a trial run.
    let mut conv = dev.new_conv(desc.clone()).unwrap();
    conv.set_src(dev.new_tensor_from_ptr(src_desc, std::ptr::null_mut()).unwrap())
        .unwrap();
    conv.set_weight(dev.new_tensor_from_ptr(weight_desc, std::ptr::null_mut()).unwrap())
        .unwrap();
    conv.set_bias(dev.new_tensor_from_ptr(bias_desc, std::ptr::null_mut()).unwrap())
        .unwrap();
    conv.set_dst(dev.new_tensor_from_ptr(desc.dst().clone(), std::ptr::null_mut()).unwrap())
        .unwrap();
    conv.finalize().unwrap();
    assert!(matches!(conv.run(), Err(Error::Logic(_))));
    dev.wait().unwrap();
}

#[test]
fn test_bias_can_be_bound_after_finalize() {
    let Some(dev) = device() else { return };
    let src_desc = TensorDesc::chw(2, 3, 3, TensorLayout::Chw, DataType::Float32).unwrap();
    let weight_desc =
        TensorDesc::new(vec![2, 2, 3, 3], TensorLayout::Oihw, DataType::Float32).unwrap();
    let bias_desc = TensorDesc::new(vec![2], TensorLayout::X, DataType::Float32).unwrap();
    let desc = ConvDesc::new(src_desc.clone(), weight_desc.clone(), bias_desc.clone(), Activation::None)
        .unwrap();

    let mut conv = dev.new_conv(desc.clone()).unwrap();
    conv.set_src(tensor_with(&dev, src_desc, &[0.0; 18])).unwrap();
    conv.set_weight(tensor_with(&dev, weight_desc, &[0.0; 36])).unwrap();
    let dst = dev.new_tensor(desc.dst().clone(), Storage::Device).unwrap();
    conv.set_dst(dst.clone()).unwrap();
    conv.finalize().unwrap();
    assert!(matches!(conv.run(), Err(Error::Logic(_))));

    conv.set_bias(tensor_with(&dev, bias_desc, &[1.5, -2.0])).unwrap();
    conv.run().unwrap();
    dev.wait().unwrap();
    let out = read(&dev, &dst);
    assert!(out[..9].iter().all(|v| *v == 1.5));
    assert!(out[9..].iter().all(|v| *v == -2.0));
}

#[test]
fn test_blocked_layout_is_unsupported() {
    let Some(dev) = device() else { return };
    let desc = ConvDesc::new(
        TensorDesc::chw(8, 4, 4, TensorLayout::Chw8c, DataType::Float32).unwrap(),
        TensorDesc::new(vec![8, 8, 3, 3], TensorLayout::OIhw8i8o, DataType::Float32).unwrap(),
        TensorDesc::new(vec![8], TensorLayout::X, DataType::Float32).unwrap(),
        Activation::ReLU,
    )
    .unwrap();
    let mut conv = dev.new_conv(desc).unwrap();
    assert!(!conv.is_supported());
    assert_eq!(conv.state(), OpState::Unsupported);
    assert!(conv.scratch_byte_size().is_err());
    assert!(conv.finalize().is_err());
}

#[test]
fn test_pool_takes_window_max() {
    let Some(dev) = device() else { return };
    let (c, h, w) = (3, 4, 6);
    let src_desc = TensorDesc::chw(c, h, w, TensorLayout::Chw, DataType::Float32).unwrap();
    let desc = PoolDesc::new(src_desc.clone()).unwrap();
    let values: Vec<f32> = (0..c * h * w).map(|i| (i % 13) as f32).collect();

    let mut pool = dev.new_pool(desc.clone()).unwrap();
    assert!(pool.is_supported());
    pool.set_src(tensor_with(&dev, src_desc, &values)).unwrap();
    let dst = dev.new_tensor(desc.dst().clone(), Storage::Device).unwrap();
    pool.set_dst(dst.clone()).unwrap();
    pool.finalize().unwrap();
    pool.run().unwrap();
    dev.wait().unwrap();

    let out = read(&dev, &dst);
    for ch in 0..c {
        for y in 0..2 {
            for x in 0..3 {
                let at = |yy: usize, xx: usize| values[(ch * h + yy) * w + xx];
                let m = at(2 * y, 2 * x)
                    .max(at(2 * y, 2 * x + 1))
                    .max(at(2 * y + 1, 2 * x))
                    .max(at(2 * y + 1, 2 * x + 1));
                assert_eq!(out[(ch * 2 + y) * 3 + x], m);
            }
        }
    }
}

#[test]
fn test_upsample_half_repeats_each_pixel() {
    let Some(dev) = device() else { return };
    let (c, h, w) = (5, 3, 4);
    let src_desc = TensorDesc::chw(c, h, w, TensorLayout::Chw, DataType::Float16).unwrap();
    let desc = UpsampleDesc::new(src_desc.clone()).unwrap();
    let values: Vec<f16> = (0..c * h * w).map(|i| f16::from_f32(i as f32)).collect();

    let src = dev.new_tensor(src_desc, Storage::Device).unwrap();
    write_tensor(dev.allocator().as_ref(), src.as_ref(), &values).unwrap();
    let dst = dev.new_tensor(desc.dst().clone(), Storage::Device).unwrap();
    let mut up = dev.new_upsample(desc).unwrap();
    up.set_src(src).unwrap();
    up.set_dst(dst.clone()).unwrap();
    up.finalize().unwrap();
    up.run().unwrap();
    dev.wait().unwrap();

    let out = read_tensor::<f16>(dev.allocator().as_ref(), dst.as_ref()).unwrap();
    for ch in 0..c {
        for y in 0..2 * h {
            for x in 0..2 * w {
                assert_eq!(out[(ch * 2 * h + y) * 2 * w + x], values[(ch * h + y / 2) * w + x / 2]);
            }
        }
    }
}

#[test]
fn test_input_output_round_trip() {
    let Some(dev) = device() else { return };
    let (h, w) = (5, 7);
    let tensor_desc = TensorDesc::chw(3, h, w, TensorLayout::Chw, DataType::Float32).unwrap();
    let image_desc = ImageDesc::new(ImageFormat::Float3, w, h);
    let values: Vec<f32> = (0..3 * h * w).map(|i| (i % 23) as f32 / 6.0).collect();
    let color = image_with(&dev, image_desc, &values);
    let out_image = image_with(&dev, image_desc, &vec![0.0; 3 * h * w]);

    let transfer = TransferFunction::new(TransferKind::Pu);
    let mut input = dev
        .new_input_process(InputProcessDesc::new(tensor_desc.clone(), transfer, true, false).unwrap())
        .unwrap();
    let mut output = dev
        .new_output_process(OutputProcessDesc::new(tensor_desc.clone(), transfer, true, false).unwrap())
        .unwrap();
    let tensor = dev.new_tensor(tensor_desc, Storage::Device).unwrap();

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
        assert!((a - e).abs() <= 1e-3 * (1.0 + e), "{a} != {e}");
    }
}

#[test]
fn test_input_process_pads_outside_tile() {
    let Some(dev) = device() else { return };
    let tensor_desc = TensorDesc::chw(6, 3, 3, TensorLayout::Chw, DataType::Float32).unwrap();
    let albedo = image_with(&dev, ImageDesc::new(ImageFormat::Float3, 2, 2), &[2.0; 12]);
    let mut op = dev
        .new_input_process(
            InputProcessDesc::new(tensor_desc.clone(), TransferFunction::new(TransferKind::Linear), false, false)
                .unwrap(),
        )
        .unwrap();
    let dst = tensor_with(&dev, tensor_desc, &[7.0; 54]);
    op.set_src(None, Some(albedo), None).unwrap();
    op.set_dst(dst.clone()).unwrap();
    op.finalize().unwrap();
    op.run().unwrap();
    dev.wait().unwrap();

    let out = read(&dev, &dst);
    for c in 0..6 {
        for y in 0..3 {
            for x in 0..3 {
                let expected = if c < 3 && y < 2 && x < 2 { 1.0 } else { 0.0 };
                assert_eq!(out[(c * 3 + y) * 3 + x], expected, "c={c} y={y} x={x}");
            }
        }
    }
}

#[test]
fn test_autoexposure() {
    let Some(dev) = device() else { return };
    let desc = ImageDesc::new(ImageFormat::Float3, 40, 20);
    let mut op = dev.new_autoexposure(desc).unwrap();
    assert!(matches!(op.result(), Err(Error::Logic(_))));
    op.set_src(image_with(&dev, desc, &vec![0.5; 3 * 40 * 20])).unwrap();
    op.finalize().unwrap();
    op.run().unwrap();
    dev.wait().unwrap();
    assert!((op.result().unwrap() - 0.36).abs() <= 1e-4);

    let wrong = image_with(&dev, ImageDesc::new(ImageFormat::Float3, 4, 4), &[0.0; 48]);
    let mut other = dev.new_autoexposure(desc).unwrap();
    assert!(matches!(other.set_src(wrong), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_image_copy_converts_format() {
    let Some(dev) = device() else { return };
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
}

#[test]
fn test_host_functions_run_in_order() {
    let Some(dev) = device() else { return };
    let log = Arc::new(Mutex::new(Vec::new()));
    for i in 0..8 {
        let log = log.clone();
        dev.run_host_func_async(Box::new(move || log.lock().push(i)))
            .unwrap();
    }
    dev.wait().unwrap();
    assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
}

#[test]
fn test_host_function_panic_is_reported_once() {
    let Some(dev) = device() else { return };
    dev.run_host_func_async(Box::new(|| panic!("boom"))).unwrap();
    let err = dev.wait().unwrap_err();
    assert!(err.to_string().contains("boom"));
    dev.wait().unwrap();
}
