// Host kernel dispatch
//
// A kernel is a closure over an N-dimensional index. The domain is cut into
// work groups of the suggested size and the groups are spread over the
// device's rayon pool; within a group, indices are visited in row-major
// order so neighbouring items touch neighbouring memory.
//
// Kernels write through SyncPtr, a raw pointer that may cross threads.
// Every kernel in this crate writes each output element from exactly one
// work item, which is what makes the shared pointer sound.

use rayon::prelude::*;
use rayon::ThreadPool;

use denoise_core::kernel::{for_each_in_group, group_id_from_linear};
use denoise_core::WorkDim;

/// Raw pointer shared between kernel work items.
#[derive(Debug)]
pub struct SyncPtr<T>(pub *mut T);

impl<T> Clone for SyncPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SyncPtr<T> {}

// SAFETY: work items only touch disjoint elements (see module comment) and
// the queue orders kernels, so no two threads access the same element
// concurrently.
unsafe impl<T> Send for SyncPtr<T> {}
unsafe impl<T> Sync for SyncPtr<T> {}

impl<T: Copy> SyncPtr<T> {
    pub fn new(ptr: *mut u8) -> Self {
        SyncPtr(ptr as *mut T)
    }

    /// # Safety
    /// `i` must be inside the allocation.
    #[inline]
    pub unsafe fn get(&self, i: usize) -> T {
        self.0.add(i).read()
    }

    /// # Safety
    /// `i` must be inside the allocation and written by one work item only.
    #[inline]
    pub unsafe fn set(&self, i: usize, v: T) {
        self.0.add(i).write(v)
    }

    pub fn as_u8(&self) -> *mut u8 {
        self.0 as *mut u8
    }
}

/// Run `f` for every index of `global` on `pool`, blocking until done.
pub fn parallel_for<const N: usize, F>(pool: &ThreadPool, global: WorkDim<N>, f: F)
where
    F: Fn([usize; N]) + Send + Sync,
{
    if global.is_empty() {
        return;
    }
    let group = WorkDim::<N>::suggested_group_size();
    let groups = global.num_groups(&group);
    pool.install(|| {
        (0..groups.num_items()).into_par_iter().for_each(|linear| {
            let id = group_id_from_linear(&groups, linear);
            for_each_in_group(&global, &group, id, &f);
        })
    });
}
