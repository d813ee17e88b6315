use std::ffi::c_void;
use std::sync::Arc;

use denoise_core::op::Lifecycle;
use denoise_core::{
    Activation, Conv, ConvDesc, DataType, Op, OpState, Result, Tensor, TensorLayout,
};

use crate::cudnn::{
    activation_dims, ConvProblem, Descriptor, Handle, CONV_FWD_ALGO_IMPLICIT_GEMM,
    CONV_FWD_ALGO_IMPLICIT_PRECOMP_GEMM,
};
use crate::device::CudaEngine;
use crate::tensor::{bind_operand, bind_optional_operand, cuda_tensor, device_ptr};

// CudaConv — convolution operator of the CUDA device (cuDNN)
//
// All descriptors are created with the operator and released with it; a
// descriptor cuDNN cannot build (blocked layouts, mixed types) makes the
// operator unsupported.
//
// FINALIZE:
//
//   With every operand allocated, cudnnFindConvolutionForwardAlgorithmEx
//   benchmarks the algorithms that fit the bound scratch and the fastest is
//   kept. Otherwise the precomputed implicit GEMM is used if its workspace
//   fits, else the workspace-free implicit GEMM.
//
// RUN enqueues three cuDNN calls: convolution, bias (AddTensor broadcast over
// a 1 x O x 1 x 1 tensor) and, for ReLU, an in-place activation.

struct ConvNative {
    src: Descriptor,
    weight: Descriptor,
    bias: Descriptor,
    dst: Descriptor,
    conv: Descriptor,
    relu: Option<Descriptor>,
}

impl ConvNative {
    fn new(engine: &CudaEngine, desc: &ConvDesc) -> Result<Self> {
        let dtype = desc.src.dtype();
        let (Some(src_dims), Some(dst_dims)) = (activation_dims(&desc.src), activation_dims(desc.dst()))
        else {
            denoise_core::bail!(
                InvalidArgument,
                "cuda convolution requires planar f32/f16 activations, got {}",
                desc.src
            );
        };
        if desc.weight.layout() != TensorLayout::Oihw
            || desc.weight.dtype() != dtype
            || desc.bias.dtype() != dtype
        {
            denoise_core::bail!(
                InvalidArgument,
                "cuda convolution requires {dtype} Oihw weights and bias, got {} / {}",
                desc.weight,
                desc.bias
            );
        }
        let lib = engine.cudnn_lib();
        let tensor_ops = engine.has_tensor_cores() && dtype == DataType::Float16;
        let relu = match desc.activation {
            Activation::ReLU => Some(lib.relu()?),
            Activation::None => None,
        };
        Ok(ConvNative {
            src: lib.tensor_4d(src_dims, dtype)?,
            weight: lib.filter_4d(desc.weight.oihw_dims(), dtype)?,
            bias: lib.tensor_4d([1, desc.weight.o(), 1, 1], dtype)?,
            dst: lib.tensor_4d(dst_dims, dtype)?,
            conv: lib.convolution_2d(desc.padding(), tensor_ops)?,
            relu,
        })
    }

    fn problem(&self) -> ConvProblem<'_> {
        ConvProblem {
            src: &self.src,
            weight: &self.weight,
            conv: &self.conv,
            dst: &self.dst,
        }
    }
}

pub struct CudaConv {
    engine: Arc<CudaEngine>,
    lifecycle: Lifecycle,
    desc: ConvDesc,
    native: Option<ConvNative>,
    max_workspace: usize,
    algo: Option<i32>,
    src: Option<Arc<dyn Tensor>>,
    weight: Option<Arc<dyn Tensor>>,
    bias: Option<Arc<dyn Tensor>>,
    dst: Option<Arc<dyn Tensor>>,
    scratch: Option<Arc<dyn Tensor>>,
}

impl CudaConv {
    pub fn new(engine: Arc<CudaEngine>, desc: ConvDesc) -> Self {
        let native = ConvNative::new(&engine, &desc).and_then(|native| {
            let handle = engine.cudnn()?;
            let max_workspace = handle.max_conv_workspace_size(&native.problem());
            Ok((native, max_workspace))
        });
        let (native, max_workspace) = match native {
            Ok((native, max_workspace)) => {
                tracing::debug!(target: "denoise::cuda", scratch = max_workspace, "created convolution");
                (Some(native), max_workspace)
            }
            Err(e) => {
                tracing::debug!(target: "denoise::cuda", error = %e, "convolution unsupported");
                (None, 0)
            }
        };
        CudaConv {
            engine,
            lifecycle: Lifecycle::new("conv", native.is_some()),
            desc,
            native,
            max_workspace,
            algo: None,
            src: None,
            weight: None,
            bias: None,
            dst: None,
            scratch: None,
        }
    }

    fn workspace(&self) -> (*mut c_void, usize) {
        match &self.scratch {
            Some(s) if !s.data().is_null() => (s.data() as *mut c_void, s.byte_size()),
            _ => (std::ptr::null_mut(), 0),
        }
    }

    fn operand_ptrs(&self) -> Option<[*mut c_void; 3]> {
        let ptrs = [
            self.src.as_ref()?.data(),
            self.weight.as_ref()?.data(),
            self.dst.as_ref()?.data(),
        ];
        ptrs.iter()
            .all(|p| !p.is_null())
            .then(|| ptrs.map(|p| p as *mut c_void))
    }

    fn select_without_trial(handle: &Handle, problem: &ConvProblem<'_>, workspace_size: usize) -> i32 {
        [CONV_FWD_ALGO_IMPLICIT_PRECOMP_GEMM, CONV_FWD_ALGO_IMPLICIT_GEMM]
            .into_iter()
            .find(|&algo| {
                handle
                    .conv_workspace_size(problem, algo)
                    .is_some_and(|size| size <= workspace_size)
            })
            .unwrap_or(CONV_FWD_ALGO_IMPLICIT_GEMM)
    }
}

impl Op for CudaConv {
    fn name(&self) -> &'static str {
        "conv"
    }

    fn state(&self) -> OpState {
        self.lifecycle.state()
    }

    fn scratch_byte_size(&self) -> Result<usize> {
        self.lifecycle.check_supported()?;
        Ok(self.max_workspace)
    }

    fn set_scratch(&mut self, scratch: Arc<dyn Tensor>) -> Result<()> {
        self.lifecycle.check_configurable()?;
        cuda_tensor(scratch.as_ref())?;
        self.scratch = Some(scratch);
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.lifecycle.check_finalizable(&[
            ("source", self.src.is_some()),
            ("weight", self.weight.is_some()),
            ("destination", self.dst.is_some()),
        ])?;
        let Some(native) = &self.native else {
            return self.lifecycle.check_supported();
        };
        let (workspace, workspace_size) = self.workspace();
        let problem = native.problem();
        let handle = self.engine.cudnn()?;
        let algo = match self.operand_ptrs() {
            Some([src, weight, dst]) => {
                // SAFETY: the operands are allocated and match the descriptors.
                let results = unsafe {
                    handle.find_conv_algorithms(&problem, src, weight, dst, workspace, workspace_size)?
                };
                match results.first() {
                    Some(best) => {
                        tracing::debug!(
                            target: "denoise::cuda",
                            algorithm = best.algo,
                            time_ms = best.time,
                            memory = best.memory,
                            workspace = workspace_size,
                            "selected convolution algorithm"
                        );
                        best.algo
                    }
                    None => Self::select_without_trial(&handle, &problem, workspace_size),
                }
            }
            None => {
                let algo = Self::select_without_trial(&handle, &problem, workspace_size);
                tracing::debug!(
                    target: "denoise::cuda",
                    algorithm = algo,
                    workspace = workspace_size,
                    "selected convolution algorithm without trial"
                );
                algo
            }
        };
        drop(handle);
        self.algo = Some(algo);
        self.lifecycle.mark_finalized();
        Ok(())
    }

    fn run(&self) -> Result<()> {
        self.lifecycle.check_finalized()?;
        let (Some(native), Some(algo), Some(src), Some(weight), Some(dst)) = (
            self.native.as_ref(),
            self.algo,
            self.src.as_ref(),
            self.weight.as_ref(),
            self.dst.as_ref(),
        ) else {
            return self.lifecycle.check_finalized();
        };
        let Some(bias) = self.bias.as_ref() else {
            denoise_core::bail!(Logic, "conv bias not set");
        };
        let src_ptr = device_ptr("conv", "source", src.as_ref())?;
        let weight_ptr = device_ptr("conv", "weight", weight.as_ref())?;
        let bias_ptr = device_ptr("conv", "bias", bias.as_ref())?;
        let dst_ptr = device_ptr("conv", "destination", dst.as_ref())?;
        let (workspace, workspace_size) = self.workspace();

        let handle = self.engine.cudnn()?;
        // SAFETY: every pointer is bound to memory matching its descriptor; the
        // operator keeps the operands alive.
        unsafe {
            handle.convolution_forward(
                &native.problem(),
                algo,
                src_ptr,
                weight_ptr,
                dst_ptr,
                workspace,
                workspace_size,
            )?;
            handle.add_tensor(&native.bias, bias_ptr, &native.dst, dst_ptr)?;
            if let Some(relu) = &native.relu {
                handle.activation_forward(relu, &native.dst, dst_ptr)?;
            }
        }
        Ok(())
    }
}

impl Conv for CudaConv {
    fn desc(&self) -> &ConvDesc {
        &self.desc
    }

    fn set_src(&mut self, src: Arc<dyn Tensor>) -> Result<()> {
        self.src = Some(bind_operand(&self.lifecycle, "source", &self.desc.src, src)?);
        Ok(())
    }

    fn set_weight(&mut self, weight: Arc<dyn Tensor>) -> Result<()> {
        self.weight = Some(bind_operand(&self.lifecycle, "weight", &self.desc.weight, weight)?);
        Ok(())
    }

    fn set_bias(&mut self, bias: Arc<dyn Tensor>) -> Result<()> {
        let bound = self.bias.is_some();
        self.bias = Some(bind_optional_operand(
            &self.lifecycle,
            "bias",
            &self.desc.bias,
            bound,
            bias,
        )?);
        Ok(())
    }

    fn set_dst(&mut self, dst: Arc<dyn Tensor>) -> Result<()> {
        self.dst = Some(bind_operand(&self.lifecycle, "destination", self.desc.dst(), dst)?);
        Ok(())
    }
}
