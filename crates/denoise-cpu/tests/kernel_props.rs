//! Property tests for the CPU element kernels.

use std::sync::Arc;

use denoise_core::tensor::{read_tensor, write_tensor};
use denoise_core::{
    DataType, Device, DeviceConfig, Op, PoolDesc, Storage, Tensor, TensorDesc, TensorLayout,
    UpsampleDesc,
};
use denoise_cpu::CpuDevice;
use proptest::prelude::*;

fn arb_layout() -> impl Strategy<Value = TensorLayout> {
    prop_oneof![
        Just(TensorLayout::Chw),
        Just(TensorLayout::Chw8c),
        Just(TensorLayout::Chw16c),
    ]
}

fn arb_activation() -> impl Strategy<Value = TensorDesc> {
    (arb_layout(), 1usize..3, 1usize..7, 1usize..7).prop_map(|(layout, cb, h, w)| {
        TensorDesc::chw(cb * layout.block_size(), h, w, layout, DataType::Float32).unwrap()
    })
}

fn upsample_then_pool(dev: &CpuDevice, desc: &TensorDesc, data: &[f32]) -> Vec<f32> {
    let up_desc = UpsampleDesc::new(desc.clone()).unwrap();
    let pool_desc = PoolDesc::new(up_desc.dst().clone()).unwrap();

    let src = dev.new_tensor(desc.clone(), Storage::Host).unwrap();
    write_tensor(dev.allocator().as_ref(), src.as_ref(), data).unwrap();
    let mid = dev.new_tensor(up_desc.dst().clone(), Storage::Host).unwrap();
    let dst: Arc<dyn Tensor> = dev.new_tensor(pool_desc.dst().clone(), Storage::Host).unwrap();

    let mut up = dev.new_upsample(up_desc).unwrap();
    up.set_src(src).unwrap();
    up.set_dst(mid.clone()).unwrap();
    up.finalize().unwrap();
    let mut pool = dev.new_pool(pool_desc).unwrap();
    pool.set_src(mid).unwrap();
    pool.set_dst(dst.clone()).unwrap();
    pool.finalize().unwrap();

    up.run().unwrap();
    pool.run().unwrap();
    dev.wait().unwrap();
    read_tensor::<f32>(dev.allocator().as_ref(), dst.as_ref()).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_pool_inverts_upsample(desc in arb_activation(), seed in any::<u32>()) {
        let dev = CpuDevice::new(DeviceConfig::default().num_threads(2)).unwrap();
        let data: Vec<f32> = (0..desc.num_elements())
            .map(|i| ((i as u32).wrapping_mul(2_654_435_761) ^ seed) as f32 / u32::MAX as f32)
            .collect();
        let out = upsample_then_pool(&dev, &desc, &data);
        prop_assert_eq!(out, data);
    }
}
