// Scratch planning — one workspace shared by a group of operators
//
// Operators of a network run one after another on the same queue, so their
// scratch memory can overlap. The planner collects the requirement of every
// supported operator, allocates a single scratch tensor of the largest size
// and binds it to each of them:
//
//   let mut plan = ScratchPlan::new();
//   plan.require(conv1.as_ref())?;
//   plan.require(conv2.as_ref())?;
//   let scratch = plan.allocate(device.as_ref())?;
//   plan.bind(&scratch, conv1.as_mut())?;
//
// Unsupported operators are skipped; they will fail at finalize anyway.

use std::sync::Arc;

use denoise_core::{Device, Op, Result, Tensor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScratchPlan {
    byte_size: usize,
    operators: usize,
}

impl ScratchPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for the scratch requirement of `op`.
    pub fn require<O: Op + ?Sized>(&mut self, op: &O) -> Result<()> {
        if !op.is_supported() {
            return Ok(());
        }
        let size = op.scratch_byte_size()?;
        tracing::debug!(target: "denoise", op = op.name(), bytes = size, "scratch requirement");
        self.byte_size = self.byte_size.max(size);
        self.operators += 1;
        Ok(())
    }

    /// Largest requirement seen so far.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Number of supported operators accounted for.
    pub fn num_operators(&self) -> usize {
        self.operators
    }

    /// The shared scratch tensor, or None when no operator needs scratch.
    pub fn allocate(&self, device: &dyn Device) -> Result<Option<Arc<dyn Tensor>>> {
        if self.byte_size == 0 {
            return Ok(None);
        }
        tracing::debug!(target: "denoise", bytes = self.byte_size, "allocating shared scratch");
        device.new_scratch_tensor(self.byte_size).map(Some)
    }

    /// Bind the shared scratch (if any) to a supported operator.
    pub fn bind<O: Op + ?Sized>(&self, scratch: &Option<Arc<dyn Tensor>>, op: &mut O) -> Result<()> {
        match scratch {
            Some(s) if op.is_supported() => op.set_scratch(s.clone()),
            _ => Ok(()),
        }
    }
}
