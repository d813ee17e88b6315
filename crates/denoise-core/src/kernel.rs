use std::fmt;

// Kernel dispatch geometry
//
// Element-wise kernels that no native library provides (image conversion,
// upsampling, reductions) are written against an N-dimensional iteration
// domain, N in {1, 2, 3}. Devices split the domain into work groups of a
// suggested size and enqueue one group per work item batch:
//
//   N = 1 → groups of 1024
//   N = 2 → groups of 32 x 32
//   N = 3 → groups of 1 x 32 x 32
//
// The last dimension is the fastest varying one.

/// Size of an N-dimensional iteration domain.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkDim<const N: usize>(pub [usize; N]);

impl<const N: usize> WorkDim<N> {
    pub fn new(dims: [usize; N]) -> Self {
        WorkDim(dims)
    }

    pub fn dims(&self) -> [usize; N] {
        self.0
    }

    /// Number of work items in the domain.
    pub fn num_items(&self) -> usize {
        self.0.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.num_items() == 0
    }

    /// The group size devices use for a domain of this rank.
    pub fn suggested_group_size() -> WorkDim<N> {
        let mut g = [1usize; N];
        if N == 1 {
            g[0] = 1024;
        } else {
            for slot in g.iter_mut().rev().take(2) {
                *slot = 32;
            }
        }
        WorkDim(g)
    }

    /// Number of groups of `group` needed to cover this domain.
    pub fn num_groups(&self, group: &WorkDim<N>) -> WorkDim<N> {
        let mut n = [0usize; N];
        for (i, slot) in n.iter_mut().enumerate() {
            *slot = ceil_div(self.0[i], group.0[i]);
        }
        WorkDim(n)
    }
}

impl<const N: usize> fmt::Debug for WorkDim<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkDim{:?}", self.0)
    }
}

impl<const N: usize> From<[usize; N]> for WorkDim<N> {
    fn from(dims: [usize; N]) -> Self {
        WorkDim(dims)
    }
}

/// Integer division rounding up.
#[inline]
pub fn ceil_div(a: usize, b: usize) -> usize {
    if b == 0 {
        0
    } else {
        a.div_ceil(b)
    }
}

/// Iterate over every index of the group `group_id` of size `group`,
/// clipped to `global`.
pub fn for_each_in_group<const N: usize, F: FnMut([usize; N])>(
    global: &WorkDim<N>,
    group: &WorkDim<N>,
    group_id: [usize; N],
    mut f: F,
) {
    let mut begin = [0usize; N];
    let mut end = [0usize; N];
    for i in 0..N {
        begin[i] = group_id[i] * group.0[i];
        end[i] = (begin[i] + group.0[i]).min(global.0[i]);
        if begin[i] >= end[i] {
            return;
        }
    }
    let mut idx = begin;
    loop {
        f(idx);
        // Odometer increment, last dim fastest.
        let mut d = N;
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < end[d] {
                break;
            }
            idx[d] = begin[d];
        }
    }
}

/// Unflatten a linear group number into an N-dimensional group id.
pub fn group_id_from_linear<const N: usize>(num_groups: &WorkDim<N>, mut linear: usize) -> [usize; N] {
    let mut id = [0usize; N];
    for d in (0..N).rev() {
        let n = num_groups.0[d].max(1);
        id[d] = linear % n;
        linear /= n;
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggested_sizes() {
        assert_eq!(WorkDim::<1>::suggested_group_size().dims(), [1024]);
        assert_eq!(WorkDim::<2>::suggested_group_size().dims(), [32, 32]);
        assert_eq!(WorkDim::<3>::suggested_group_size().dims(), [1, 32, 32]);
    }

    #[test]
    fn test_num_groups() {
        let g = WorkDim([70, 33]).num_groups(&WorkDim([32, 32]));
        assert_eq!(g.dims(), [3, 2]);
        assert_eq!(ceil_div(0, 32), 0);
    }

    #[test]
    fn test_groups_cover_domain_exactly_once() {
        let global = WorkDim([3, 40, 37]);
        let group = WorkDim::<3>::suggested_group_size();
        let groups = global.num_groups(&group);
        let mut hits = vec![0u8; global.num_items()];
        for linear in 0..groups.num_items() {
            let id = group_id_from_linear(&groups, linear);
            for_each_in_group(&global, &group, id, |[a, b, c]| {
                hits[(a * 40 + b) * 37 + c] += 1;
            });
        }
        assert!(hits.iter().all(|&h| h == 1));
    }
}
