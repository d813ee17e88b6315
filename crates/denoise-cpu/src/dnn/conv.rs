use std::fmt;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::ThreadPool;

use denoise_core::{DataType, Error, Result};

use super::memory::{Format, MemoryDesc};
use crate::kernels::SyncPtr;

// Convolution primitive — "same" 2-D convolution, stride 1, no bias
//
// Two algorithms compute the same result:
//
//   Direct   loops over (n, o, h) rows and accumulates the I x KH x KW
//            window for every output pixel. Needs no workspace.
//   Im2col   unfolds one image into a [I*KH*KW, H*W] column matrix in the
//            workspace, then computes every output row as a dot product
//            against the filter matrix. Faster for wide filters, needs
//            I*KH*KW*H*W floats of workspace.
//
// The primitive only knows memory descriptors and raw handles. Bias and
// activation are separate steps of the operator.

/// Algorithm used to execute a convolution primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvAlgorithm {
    Direct,
    Im2col,
}

impl fmt::Display for ConvAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvAlgorithm::Direct => write!(f, "direct"),
            ConvAlgorithm::Im2col => write!(f, "im2col"),
        }
    }
}

/// Raw handles for one execution.
#[derive(Debug, Clone, Copy)]
pub struct ConvArgs {
    pub src: *const u8,
    pub weight: *const u8,
    pub dst: *mut u8,
    pub workspace: *mut u8,
    pub workspace_byte_size: usize,
}

// SAFETY: handles are addresses of memory kept alive by the tensors the
// operator holds for as long as the queued execution exists.
unsafe impl Send for ConvArgs {}

/// A convolution between fixed memory descriptors.
#[derive(Debug, Clone)]
pub struct ConvPrimitive {
    src: MemoryDesc,
    weight: MemoryDesc,
    dst: MemoryDesc,
    padding: [usize; 2],
    algorithm: ConvAlgorithm,
}

fn is_activation(format: Format) -> bool {
    matches!(format, Format::Nchw | Format::NChw8c | Format::NChw16c)
}

impl ConvPrimitive {
    /// Create the primitive. Fails if the formats or types are not supported.
    pub fn new(
        src: MemoryDesc,
        weight: MemoryDesc,
        dst: MemoryDesc,
        padding: [usize; 2],
    ) -> Result<Self> {
        for md in [&src, &weight, &dst] {
            if md.dtype() != DataType::Float32 {
                return Err(Error::invalid_argument(format!(
                    "cpu convolution requires f32 memory, got {}",
                    md.dtype()
                )));
            }
        }
        if !is_activation(src.format()) || src.format() != dst.format() {
            return Err(Error::invalid_argument(format!(
                "cpu convolution requires matching activation formats, got {:?} -> {:?}",
                src.format(),
                dst.format()
            )));
        }
        let expected_weight = src.format().layout().matching_weight_layout();
        let weight_layout = weight.format().layout();
        if Some(weight_layout) != expected_weight && weight.format() != Format::Oihw {
            return Err(Error::invalid_argument(format!(
                "cpu convolution cannot combine {:?} activations with {:?} weights",
                src.format(),
                weight.format()
            )));
        }
        Ok(ConvPrimitive {
            src,
            weight,
            dst,
            padding,
            algorithm: ConvAlgorithm::Direct,
        })
    }

    pub fn algorithm(&self) -> ConvAlgorithm {
        self.algorithm
    }

    pub fn set_algorithm(&mut self, algorithm: ConvAlgorithm) {
        self.algorithm = algorithm;
    }

    /// Workspace the given algorithm needs.
    pub fn workspace_byte_size(&self, algorithm: ConvAlgorithm) -> usize {
        match algorithm {
            ConvAlgorithm::Direct => 0,
            ConvAlgorithm::Im2col => {
                let [_, c, h, w] = self.src.nchw();
                let [_, _, kh, kw] = self.weight.nchw();
                c * kh * kw * h * w * std::mem::size_of::<f32>()
            }
        }
    }

    /// The largest workspace any algorithm could use.
    pub fn max_workspace_byte_size(&self) -> usize {
        self.workspace_byte_size(ConvAlgorithm::Im2col)
    }

    /// Algorithms that fit in `workspace_byte_size` bytes.
    pub fn candidates(&self, workspace_byte_size: usize) -> Vec<ConvAlgorithm> {
        [ConvAlgorithm::Direct, ConvAlgorithm::Im2col]
            .into_iter()
            .filter(|&a| self.workspace_byte_size(a) <= workspace_byte_size)
            .collect()
    }

    /// Time one execution of each candidate and keep the fastest.
    ///
    /// `args` must point to valid memory; the destination is overwritten.
    pub fn find_fastest(&mut self, pool: &ThreadPool, args: &ConvArgs) -> Result<Duration> {
        let mut best: Option<(ConvAlgorithm, Duration)> = None;
        for algorithm in self.candidates(args.workspace_byte_size) {
            self.algorithm = algorithm;
            let start = Instant::now();
            self.execute(pool, args)?;
            let elapsed = start.elapsed();
            tracing::trace!(
                target: "denoise::cpu",
                %algorithm,
                elapsed_us = elapsed.as_micros() as u64,
                "convolution trial"
            );
            if best.map_or(true, |(_, t)| elapsed < t) {
                best = Some((algorithm, elapsed));
            }
        }
        let (algorithm, elapsed) = best.unwrap_or((ConvAlgorithm::Direct, Duration::ZERO));
        self.algorithm = algorithm;
        Ok(elapsed)
    }

    /// Execute with the selected algorithm, blocking until done.
    pub fn execute(&self, pool: &ThreadPool, args: &ConvArgs) -> Result<()> {
        if args.src.is_null() || args.weight.is_null() || args.dst.is_null() {
            return Err(Error::logic("convolution memory is not bound"));
        }
        match self.algorithm {
            ConvAlgorithm::Direct => {
                self.execute_direct(pool, args);
                Ok(())
            }
            ConvAlgorithm::Im2col => {
                let needed = self.workspace_byte_size(ConvAlgorithm::Im2col);
                if args.workspace.is_null() || args.workspace_byte_size < needed {
                    return Err(Error::logic(format!(
                        "im2col convolution needs {needed} bytes of workspace, got {}",
                        args.workspace_byte_size
                    )));
                }
                self.execute_im2col(pool, args);
                Ok(())
            }
        }
    }

    #[inline]
    fn src_at(&self, src: SyncPtr<f32>, n: usize, c: usize, y: isize, x: isize) -> f32 {
        let [_, _, h, w] = self.src.nchw();
        if y < 0 || x < 0 || y as usize >= h || x as usize >= w {
            return 0.0;
        }
        // SAFETY: (n, c, y, x) is inside the source dims.
        unsafe { src.get(self.src.offset(n, c, y as usize, x as usize)) }
    }

    fn execute_direct(&self, pool: &ThreadPool, args: &ConvArgs) {
        let [n_batch, ic, _, _] = self.src.nchw();
        let [_, oc, oh, ow] = self.dst.nchw();
        let [_, _, kh, kw] = self.weight.nchw();
        let [ph, pw] = self.padding;
        let src = SyncPtr::<f32>::new(args.src as *mut u8);
        let weight = SyncPtr::<f32>::new(args.weight as *mut u8);
        let dst = SyncPtr::<f32>::new(args.dst);
        pool.install(|| {
            (0..n_batch * oc * oh).into_par_iter().for_each(|row| {
                let y = row % oh;
                let o = (row / oh) % oc;
                let n = row / (oh * oc);
                for x in 0..ow {
                    let mut acc = 0.0f32;
                    for i in 0..ic {
                        for ky in 0..kh {
                            let sy = (y + ky) as isize - ph as isize;
                            for kx in 0..kw {
                                let sx = (x + kx) as isize - pw as isize;
                                let v = self.src_at(src, n, i, sy, sx);
                                // SAFETY: (o, i, ky, kx) is inside the weight dims.
                                let wv = unsafe { weight.get(self.weight.weight_offset(o, i, ky, kx)) };
                                acc += v * wv;
                            }
                        }
                    }
                    // SAFETY: each (n, o, y, x) is written by this row only.
                    unsafe { dst.set(self.dst.offset(n, o, y, x), acc) };
                }
            })
        });
    }

    fn execute_im2col(&self, pool: &ThreadPool, args: &ConvArgs) {
        let [n_batch, ic, h, w] = self.src.nchw();
        let [_, oc, _, _] = self.dst.nchw();
        let [_, _, kh, kw] = self.weight.nchw();
        let [ph, pw] = self.padding;
        let hw = h * w;
        let k_dim = ic * kh * kw;
        let src = SyncPtr::<f32>::new(args.src as *mut u8);
        let weight = SyncPtr::<f32>::new(args.weight as *mut u8);
        let dst = SyncPtr::<f32>::new(args.dst);
        let col = SyncPtr::<f32>::new(args.workspace);

        pool.install(|| {
            for n in 0..n_batch {
                // Unfold: row k = (i, ky, kx) of the column matrix.
                (0..k_dim).into_par_iter().for_each(|k| {
                    let kx = k % kw;
                    let ky = (k / kw) % kh;
                    let i = k / (kw * kh);
                    for y in 0..h {
                        let sy = (y + ky) as isize - ph as isize;
                        for x in 0..w {
                            let sx = (x + kx) as isize - pw as isize;
                            let v = self.src_at(src, n, i, sy, sx);
                            // SAFETY: k < k_dim and y * w + x < hw.
                            unsafe { col.set(k * hw + y * w + x, v) };
                        }
                    }
                });

                // Multiply: dst[o, y, :] = sum_k weight[o, k] * col[k, y, :].
                (0..oc * h).into_par_iter().for_each(|row| {
                    let y = row % h;
                    let o = row / h;
                    let mut acc = vec![0.0f32; w];
                    for k in 0..k_dim {
                        let kx = k % kw;
                        let ky = (k / kw) % kh;
                        let i = k / (kw * kh);
                        // SAFETY: indices are inside the weight and column matrix.
                        let wv = unsafe { weight.get(self.weight.weight_offset(o, i, ky, kx)) };
                        let base = k * hw + y * w;
                        for (x, a) in acc.iter_mut().enumerate() {
                            *a += wv * unsafe { col.get(base + x) };
                        }
                    }
                    for (x, a) in acc.into_iter().enumerate() {
                        // SAFETY: each (n, o, y, x) is written by this row only.
                        unsafe { dst.set(self.dst.offset(n, o, y, x), a) };
                    }
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use denoise_core::{TensorDesc, TensorLayout};

    fn md(dims: &[usize], layout: TensorLayout) -> MemoryDesc {
        MemoryDesc::new(&TensorDesc::new(dims.to_vec(), layout, DataType::Float32).unwrap()).unwrap()
    }

    fn pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn run(prim: &ConvPrimitive, src: &[f32], weight: &[f32], dst: &mut [f32], ws: &mut [f32]) {
        let args = ConvArgs {
            src: src.as_ptr() as *const u8,
            weight: weight.as_ptr() as *const u8,
            dst: dst.as_mut_ptr() as *mut u8,
            workspace: ws.as_mut_ptr() as *mut u8,
            workspace_byte_size: std::mem::size_of_val(ws),
        };
        prim.execute(&pool(), &args).unwrap();
    }

    #[test]
    fn test_identity_kernel() {
        let mut prim = ConvPrimitive::new(
            md(&[1, 4, 4], TensorLayout::Chw),
            md(&[1, 1, 3, 3], TensorLayout::Oihw),
            md(&[1, 4, 4], TensorLayout::Chw),
            [1, 1],
        )
        .unwrap();
        let src: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let mut weight = vec![0.0f32; 9];
        weight[4] = 1.0;
        for alg in [ConvAlgorithm::Direct, ConvAlgorithm::Im2col] {
            prim.set_algorithm(alg);
            let mut dst = vec![0.0f32; 16];
            let mut ws = vec![0.0f32; 9 * 16];
            run(&prim, &src, &weight, &mut dst, &mut ws);
            assert_eq!(dst, src, "{alg}");
        }
    }

    #[test]
    fn test_box_filter_pads_with_zero() {
        let prim = ConvPrimitive::new(
            md(&[1, 3, 3], TensorLayout::Chw),
            md(&[1, 1, 3, 3], TensorLayout::Oihw),
            md(&[1, 3, 3], TensorLayout::Chw),
            [1, 1],
        )
        .unwrap();
        let src = vec![1.0f32; 9];
        let weight = vec![1.0f32; 9];
        let mut dst = vec![0.0f32; 9];
        run(&prim, &src, &weight, &mut dst, &mut []);
        assert_eq!(dst, vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn test_workspace_limits_candidates() {
        let prim = ConvPrimitive::new(
            md(&[8, 5, 5], TensorLayout::Chw8c),
            md(&[8, 8, 3, 3], TensorLayout::OIhw8i8o),
            md(&[8, 5, 5], TensorLayout::Chw8c),
            [1, 1],
        )
        .unwrap();
        let full = prim.max_workspace_byte_size();
        assert_eq!(full, 8 * 9 * 25 * 4);
        assert_eq!(prim.candidates(full - 1), vec![ConvAlgorithm::Direct]);
        assert_eq!(prim.candidates(full).len(), 2);
    }

    #[test]
    fn test_rejects_mixed_formats() {
        let result = ConvPrimitive::new(
            md(&[16, 5, 5], TensorLayout::Chw8c),
            md(&[16, 16, 3, 3], TensorLayout::OIhw16i16o),
            md(&[16, 5, 5], TensorLayout::Chw8c),
            [1, 1],
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_im2col_without_workspace_fails() {
        let mut prim = ConvPrimitive::new(
            md(&[1, 2, 2], TensorLayout::Chw),
            md(&[1, 1, 1, 1], TensorLayout::Oihw),
            md(&[1, 2, 2], TensorLayout::Chw),
            [0, 0],
        )
        .unwrap();
        prim.set_algorithm(ConvAlgorithm::Im2col);
        let src = [1.0f32; 4];
        let weight = [2.0f32];
        let mut dst = [0.0f32; 4];
        let args = ConvArgs {
            src: src.as_ptr() as *const u8,
            weight: weight.as_ptr() as *const u8,
            dst: dst.as_mut_ptr() as *mut u8,
            workspace: std::ptr::null_mut(),
            workspace_byte_size: 0,
        };
        assert!(matches!(prim.execute(&pool(), &args), Err(Error::Logic(_))));
    }
}
