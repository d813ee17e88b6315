use std::sync::mpsc;
use std::sync::Arc;

use denoise_core::op::Lifecycle;
use denoise_core::{
    Activation, Conv, ConvDesc, DataType, Error, Op, OpState, Result, Tensor, WorkDim,
};

use crate::device::CpuEngine;
use crate::dnn::{ConvAlgorithm, ConvArgs, ConvPrimitive, MemoryDesc};
use crate::tensor::{bind_operand, bind_optional_operand, bound_ptr, cpu_tensor};

// CpuConv — convolution operator of the CPU device
//
// The primitive is created with the operator; failure to create it (f16
// operands, incompatible weight blocking) makes the operator unsupported.
//
// FINALIZE:
//
//   Every algorithm that fits the bound scratch is executed once on the
//   bound operands, as a job on the device queue, and the fastest one is
//   kept. finalize() blocks until that job has run. The bias is only needed
//   by run(). If an operand is not
//   allocated yet, no trial is possible and the workspace algorithm is
//   picked whenever it fits.
//
// RUN enqueues three steps: convolution, bias, activation (skipped for
// Activation::None).

pub struct CpuConv {
    engine: Arc<CpuEngine>,
    lifecycle: Lifecycle,
    desc: ConvDesc,
    primitive: Option<ConvPrimitive>,
    finalized: Option<Arc<ConvPrimitive>>,
    src: Option<Arc<dyn Tensor>>,
    weight: Option<Arc<dyn Tensor>>,
    bias: Option<Arc<dyn Tensor>>,
    dst: Option<Arc<dyn Tensor>>,
    scratch: Option<Arc<dyn Tensor>>,
}

fn create_primitive(desc: &ConvDesc) -> Result<ConvPrimitive> {
    if desc.bias.dtype() != DataType::Float32 {
        denoise_core::bail!(InvalidArgument, "cpu convolution requires an f32 bias");
    }
    ConvPrimitive::new(
        MemoryDesc::new(&desc.src)?,
        MemoryDesc::new(&desc.weight)?,
        MemoryDesc::new(desc.dst())?,
        desc.padding(),
    )
}

impl CpuConv {
    pub fn new(engine: Arc<CpuEngine>, desc: ConvDesc) -> Self {
        let primitive = match create_primitive(&desc) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::debug!(target: "denoise::cpu", error = %e, "convolution unsupported");
                None
            }
        };
        CpuConv {
            engine,
            lifecycle: Lifecycle::new("conv", primitive.is_some()),
            desc,
            primitive,
            finalized: None,
            src: None,
            weight: None,
            bias: None,
            dst: None,
            scratch: None,
        }
    }

    fn workspace(&self) -> (*mut u8, usize) {
        match &self.scratch {
            Some(s) if !s.data().is_null() => (s.data(), s.byte_size()),
            _ => (std::ptr::null_mut(), 0),
        }
    }

    fn operand_ptrs(&self) -> Option<ConvArgs> {
        let (src, weight, dst) = (self.src.as_ref()?, self.weight.as_ref()?, self.dst.as_ref()?);
        let (workspace, workspace_byte_size) = self.workspace();
        let args = ConvArgs {
            src: src.data(),
            weight: weight.data(),
            dst: dst.data(),
            workspace,
            workspace_byte_size,
        };
        (!args.src.is_null() && !args.weight.is_null() && !args.dst.is_null()).then_some(args)
    }
}

impl Op for CpuConv {
    fn name(&self) -> &'static str {
        "conv"
    }

    fn state(&self) -> OpState {
        self.lifecycle.state()
    }

    fn scratch_byte_size(&self) -> Result<usize> {
        self.lifecycle.check_supported()?;
        Ok(self
            .primitive
            .as_ref()
            .map_or(0, |p| p.max_workspace_byte_size()))
    }

    fn set_scratch(&mut self, scratch: Arc<dyn Tensor>) -> Result<()> {
        self.lifecycle.check_configurable()?;
        cpu_tensor(scratch.as_ref())?;
        self.scratch = Some(scratch);
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.lifecycle.check_finalizable(&[
            ("source", self.src.is_some()),
            ("weight", self.weight.is_some()),
            ("destination", self.dst.is_some()),
        ])?;
        let Some(mut primitive) = self.primitive.clone() else {
            return self.lifecycle.check_supported();
        };
        let (_, workspace_byte_size) = self.workspace();
        match self.operand_ptrs() {
            Some(args) => {
                // The trial writes the destination and the scratch, so it runs
                // on the queue behind every job submitted before it.
                let (tx, rx) = mpsc::sync_channel(1);
                let pool = self.engine.pool().clone();
                self.engine.submit(Box::new(move || {
                    let outcome = primitive.find_fastest(&pool, &args).map(|t| (primitive, t));
                    let _ = tx.send(outcome);
                    Ok(())
                }))?;
                let (searched, elapsed) = rx
                    .recv()
                    .map_err(|_| Error::msg("convolution algorithm search did not complete"))??;
                primitive = searched;
                tracing::debug!(
                    target: "denoise::cpu",
                    algorithm = %primitive.algorithm(),
                    elapsed_us = elapsed.as_micros() as u64,
                    workspace = workspace_byte_size,
                    "selected convolution algorithm"
                );
            }
            None => {
                let algorithm = primitive
                    .candidates(workspace_byte_size)
                    .into_iter()
                    .last()
                    .unwrap_or(ConvAlgorithm::Direct);
                primitive.set_algorithm(algorithm);
                tracing::debug!(
                    target: "denoise::cpu",
                    %algorithm,
                    workspace = workspace_byte_size,
                    "selected convolution algorithm without trial"
                );
            }
        }
        self.finalized = Some(Arc::new(primitive));
        self.lifecycle.mark_finalized();
        Ok(())
    }

    fn run(&self) -> Result<()> {
        self.lifecycle.check_finalized()?;
        let (Some(primitive), Some(src), Some(weight), Some(dst)) = (
            self.finalized.clone(),
            self.src.clone(),
            self.weight.clone(),
            self.dst.clone(),
        ) else {
            return self.lifecycle.check_finalized();
        };
        let Some(bias) = self.bias.clone() else {
            denoise_core::bail!(Logic, "conv bias not set");
        };

        bound_ptr::<f32>("conv", "source", src.as_ref())?;
        bound_ptr::<f32>("conv", "weight", weight.as_ref())?;
        let bias_ptr = bound_ptr::<f32>("conv", "bias", bias.as_ref())?;
        let dst_ptr = bound_ptr::<f32>("conv", "destination", dst.as_ref())?;
        let (workspace, workspace_byte_size) = self.workspace();
        let args = ConvArgs {
            src: src.data(),
            weight: weight.data(),
            dst: dst.data(),
            workspace,
            workspace_byte_size,
        };

        // 1. convolution
        let pool = self.engine.pool().clone();
        let scratch = self.scratch.clone();
        let (keep_src, keep_weight, keep_dst) = (src, weight, dst.clone());
        self.engine.submit(Box::new(move || {
            let _alive = (&keep_src, &keep_weight, &keep_dst, &scratch);
            primitive.execute(&pool, &args)
        }))?;

        // 2. bias
        let dst_desc = self.desc.dst().clone();
        let [n, c, h, w] = [dst_desc.n(), dst_desc.c(), dst_desc.h(), dst_desc.w()];
        let out_desc = dst_desc.clone();
        let keep = (bias, dst.clone());
        self.engine.run_kernel_async(WorkDim([n * c, h, w]), move |[nc, y, x]| {
            let _alive = &keep;
            let (b, o) = (nc / c, nc % c);
            let off = out_desc.activation_offset(b, o, y, x);
            // SAFETY: offsets are inside the destination and bias tensors.
            unsafe { dst_ptr.set(off, dst_ptr.get(off) + bias_ptr.get(o)) };
        })?;

        // 3. activation
        if self.desc.activation == Activation::ReLU {
            let count = dst_desc.num_elements();
            self.engine.run_kernel_async(WorkDim([count]), move |[i]| {
                let _alive = &dst;
                // SAFETY: i < num_elements of the destination.
                unsafe { dst_ptr.set(i, dst_ptr.get(i).max(0.0)) };
            })?;
        }
        Ok(())
    }
}

impl Conv for CpuConv {
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
