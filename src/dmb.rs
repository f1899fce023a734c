use std::sync::atomic::compiler_fence;
use std::sync::atomic::Ordering;

#[link(name = "dmb")]
extern "C" {
    fn __dmb();
}

/// Full data memory barrier.
///
/// Orders CPU writes to block memory and descriptors before the DMA engine
/// is told to fetch them.
#[inline(always)]
pub fn dmb() {
    compiler_fence(Ordering::SeqCst);
    unsafe {
        __dmb();
    }
    compiler_fence(Ordering::SeqCst);
}
