use kidneyos_shared::mem::{
    DEFAULT_KERNEL_FRAMES, DEFAULT_USER_FRAMES, OFFSET, PAGE_FRAME_SIZE, STACK_FAULT_SLACK,
    USER_STACK_MAX_SIZE, USER_STACK_TOP,
};

/// Boot-time parameters of the virtual memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Frames in the user pool; the only frames eviction ever reclaims.
    pub user_frames: usize,
    /// Frames in the kernel pool. Running out of these is fatal.
    pub kernel_frames: usize,
    /// First address above the user stack.
    pub stack_top: usize,
    pub stack_max_pages: usize,
    /// How far below the stack pointer a fault still counts as stack growth.
    pub stack_slack: usize,
    /// First address that belongs to the kernel.
    pub user_limit: usize,
}

impl VmConfig {
    /// Lowest address the stack may grow down to.
    pub const fn stack_bottom(&self) -> usize {
        self.stack_top - self.stack_max_pages * PAGE_FRAME_SIZE
    }

    pub const fn with_user_frames(self, user_frames: usize) -> Self {
        Self {
            user_frames,
            ..self
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: DEFAULT_USER_FRAMES,
            kernel_frames: DEFAULT_KERNEL_FRAMES,
            stack_top: USER_STACK_TOP,
            stack_max_pages: USER_STACK_MAX_SIZE / PAGE_FRAME_SIZE,
            stack_slack: STACK_FAULT_SLACK,
            user_limit: OFFSET,
        }
    }
}
