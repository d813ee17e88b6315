use crate::kernel::ceil_div;

// Autoexposure reduction
//
// The exposure of a color image is estimated in two passes:
//
//   1. The image is split into a grid of bins of at most MAX_BIN_SIZE x
//      MAX_BIN_SIZE pixels; each bin yields its average luminance.
//   2. The geometric mean of the bin luminances above EPS is mapped to the
//      middle grey KEY: exposure = KEY / mean. An image without any such bin
//      (e.g. all black) gets exposure 1.
//
// Backends run pass 1 as a kernel (one work item per bin) and pass 2 on the
// host, which keeps the result deterministic across backends.

pub const KEY: f32 = 0.18;
pub const EPS: f32 = 1e-8;
pub const MAX_BIN_SIZE: usize = 16;

/// Number of bins along (height, width).
pub fn num_bins(height: usize, width: usize) -> (usize, usize) {
    (
        ceil_div(height, MAX_BIN_SIZE),
        ceil_div(width, MAX_BIN_SIZE),
    )
}

/// Pixel range `[begin, end)` covered by bin `i` of `n` along an axis of
/// `size` pixels. Bins partition the axis evenly.
#[inline]
pub fn bin_range(i: usize, n: usize, size: usize) -> (usize, usize) {
    (i * size / n, (i + 1) * size / n)
}

/// Rec. 709 luminance.
#[inline]
pub fn luminance(rgb: [f32; 3]) -> f32 {
    0.212_671 * rgb[0] + 0.715_160 * rgb[1] + 0.072_169 * rgb[2]
}

/// Reduce per-bin average luminances to the exposure.
pub fn exposure_from_bins(bins: &[f32]) -> f32 {
    let (sum, count) = bins
        .iter()
        .filter(|&&l| l > EPS)
        .fold((0.0f64, 0usize), |(s, n), &l| (s + (l as f64).log2(), n + 1));
    if count == 0 {
        1.0
    } else {
        KEY / (sum / count as f64).exp2() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bins_partition_axis() {
        let (nh, nw) = num_bins(33, 16);
        assert_eq!((nh, nw), (3, 1));
        let mut covered = 0;
        for i in 0..nh {
            let (b, e) = bin_range(i, nh, 33);
            assert_eq!(b, covered);
            assert!(e - b <= MAX_BIN_SIZE);
            covered = e;
        }
        assert_eq!(covered, 33);
    }

    #[test]
    fn test_exposure_of_uniform_image() {
        let e = exposure_from_bins(&[0.5; 6]);
        assert!((e - 0.36).abs() < 1e-5);
    }

    #[test]
    fn test_black_image_has_unit_exposure() {
        assert_eq!(exposure_from_bins(&[0.0; 4]), 1.0);
        assert_eq!(exposure_from_bins(&[]), 1.0);
    }

    #[test]
    fn test_luminance_of_white() {
        assert!((luminance([1.0; 3]) - 1.0).abs() < 1e-5);
    }
}
