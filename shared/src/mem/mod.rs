use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// Top of the user stack; the stack grows down from the first kernel address.
pub const USER_STACK_TOP: usize = OFFSET;

/// Upper bound on how far the user stack may grow.
pub const USER_STACK_MAX_SIZE: usize = 8 * MB;

/// Accesses up to this many bytes below the stack pointer count as stack
/// growth (`pusha` writes 32 bytes before moving `esp`).
pub const STACK_FAULT_SLACK: usize = 32;

/// Number of frames handed to the user pool when none is configured.
pub const DEFAULT_USER_FRAMES: usize = 256;
/// Number of frames reserved for kernel-internal allocations.
pub const DEFAULT_KERNEL_FRAMES: usize = 64;

#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    pg_round_down(addr + PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_ofs(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

/// Number of pages needed to hold `len` bytes.
#[inline]
pub const fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_FRAME_SIZE)
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}
