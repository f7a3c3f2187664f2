//! In-memory stand-ins for the file system, the MMU and the scheduler.

use super::fault::{FaultOutcome, KillReason, PageFault};
use super::frame_allocator::PhysFrame;
use super::user::ProcessMemory;
use super::VirtualMemory;
use crate::block::{BlockDevice, BlockSector, RamDisk, BLOCK_SECTOR_SIZE};
use crate::config::VmConfig;
use crate::fs::{File, InodeId};
use crate::process::{AddressSpace, Pid, ProcessTable};
use crate::sync::Mutex;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use arbitrary_int::{u20, Number};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;
use kidneyos_shared::mem::{pg_ofs, pg_round_down, PAGE_FRAME_SIZE};
use kidneyos_shared::paging::PageTableEntry;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A file held in memory that counts its writes. Reads can be slowed down
/// and writes made to fail.
pub struct MemFile {
    inode: InodeId,
    data: Mutex<Vec<u8>>,
    writes: AtomicUsize,
    read_delay_ms: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemFile {
    pub fn new(inode: InodeId, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            inode,
            data: Mutex::new(data),
            writes: AtomicUsize::new(0),
            read_delay_ms: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// A file of `len` bytes where byte `i` is `i % 251`.
    pub fn patterned(inode: InodeId, len: usize) -> Arc<Self> {
        Self::new(inode, (0..len).map(|i| (i % 251) as u8).collect())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn truncate(&self, len: usize) {
        self.data.lock().truncate(len);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).expect("short delay");
        self.read_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// While set, every write stores nothing and returns 0.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl File for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let data = self.data.lock();
        let Some(available) = data.get(offset..) else {
            return 0;
        };
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return 0;
        }
        let mut data = self.data.lock();
        let Some(available) = data.get_mut(offset..) else {
            return 0;
        };
        let n = buf.len().min(available.len());
        available[..n].copy_from_slice(&buf[..n]);
        n
    }

    fn length(&self) -> usize {
        self.data.lock().len()
    }

    fn inode(&self) -> InodeId {
        self.inode
    }
}

pub enum Access {
    Mapped(PhysFrame),
    NotPresent,
    ReadOnly,
}

/// A page directory kept in software. `touch` sets the accessed and dirty
/// bits the way the MMU does on a real access.
#[derive(Default)]
pub struct SoftPageDirectory {
    entries: Mutex<BTreeMap<usize, PageTableEntry>>,
}

impl SoftPageDirectory {
    pub fn touch(&self, vaddr: usize, write: bool) -> Access {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&pg_round_down(vaddr)) else {
            return Access::NotPresent;
        };
        if write && !entry.read_write() {
            return Access::ReadOnly;
        }
        *entry = entry.with_accessed(true).with_dirty(entry.dirty() || write);
        Access::Mapped(PhysFrame::new(entry.frame_number()))
    }

    pub fn translate(&self, vaddr: usize) -> Option<PhysFrame> {
        self.entries
            .lock()
            .get(&pg_round_down(vaddr))
            .map(|entry| PhysFrame::new(entry.frame_number()))
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }

    fn with_entry(&self, vaddr: usize, f: impl FnOnce(&mut PageTableEntry)) {
        if let Some(entry) = self.entries.lock().get_mut(&vaddr) {
            f(entry);
        }
    }
}

impl AddressSpace for SoftPageDirectory {
    fn install(&self, vaddr: usize, frame: PhysFrame, writable: bool) -> bool {
        assert_eq!(pg_ofs(vaddr), 0);
        let Ok(number) = u32::try_from(frame.number()) else {
            return false;
        };
        if number > u20::MAX.value() {
            return false;
        }
        self.entries
            .lock()
            .insert(vaddr, PageTableEntry::user_mapping(frame.number(), writable));
        true
    }

    fn clear(&self, vaddr: usize) {
        self.entries.lock().remove(&vaddr);
    }

    fn is_dirty(&self, vaddr: usize) -> bool {
        self.entries
            .lock()
            .get(&vaddr)
            .is_some_and(|entry| entry.dirty())
    }

    fn is_accessed(&self, vaddr: usize) -> bool {
        self.entries
            .lock()
            .get(&vaddr)
            .is_some_and(|entry| entry.accessed())
    }

    fn clear_accessed(&self, vaddr: usize) {
        self.with_entry(vaddr, |entry| *entry = entry.with_accessed(false));
    }
}

#[derive(Default)]
pub struct TestProcesses {
    live: Mutex<BTreeMap<Pid, Arc<SoftPageDirectory>>>,
}

impl TestProcesses {
    pub fn exit(&self, pid: Pid) {
        self.live.lock().remove(&pid);
    }
}

impl ProcessTable for TestProcesses {
    fn address_space(&self, pid: Pid) -> Option<Arc<dyn AddressSpace>> {
        self.live
            .lock()
            .get(&pid)
            .map(|dir| dir.clone() as Arc<dyn AddressSpace>)
    }
}

pub struct Machine {
    pub vm: VirtualMemory,
    pub processes: Arc<TestProcesses>,
}

impl Machine {
    /// A machine with `user_frames` user frames and, if given, a swap device
    /// with room for `swap_pages` pages.
    pub fn new(user_frames: usize, swap_pages: Option<usize>) -> Self {
        Self::with_config(VmConfig::default().with_user_frames(user_frames), swap_pages)
    }

    pub fn with_config(config: VmConfig, swap_pages: Option<usize>) -> Self {
        init_logging();
        let processes = Arc::new(TestProcesses::default());
        let swap = swap_pages.map(|pages| {
            let sectors = BlockSector::try_from(pages * PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE)
                .expect("swap fits in a sector index");
            Box::new(RamDisk::new(sectors)) as Box<dyn BlockDevice>
        });
        Self {
            vm: VirtualMemory::new(config, swap, processes.clone()),
            processes,
        }
    }

    pub fn spawn(&self, pid: Pid) -> TestProcess {
        let dir = Arc::new(SoftPageDirectory::default());
        self.processes.live.lock().insert(pid, dir.clone());
        TestProcess {
            memory: ProcessMemory::new(pid),
            dir,
        }
    }
}

pub struct TestProcess {
    pub memory: ProcessMemory,
    pub dir: Arc<SoftPageDirectory>,
}

impl TestProcess {
    /// Stack pointer used for accesses that are not stack growth.
    pub const ESP: usize = 0x7fff_f000;

    pub fn read(&self, vm: &VirtualMemory, vaddr: usize) -> Result<u8, KillReason> {
        let phys = self.access(vm, vaddr, false, Self::ESP)?;
        Ok(vm.frames().memory().page(phys)[pg_ofs(vaddr)])
    }

    pub fn write(&self, vm: &VirtualMemory, vaddr: usize, byte: u8) -> Result<(), KillReason> {
        self.write_with_esp(vm, vaddr, byte, Self::ESP)
    }

    pub fn write_with_esp(
        &self,
        vm: &VirtualMemory,
        vaddr: usize,
        byte: u8,
        esp: usize,
    ) -> Result<(), KillReason> {
        let phys = self.access(vm, vaddr, true, esp)?;
        vm.frames().memory().page(phys)[pg_ofs(vaddr)] = byte;
        Ok(())
    }

    /// Copies the whole page at `vaddr` as the process sees it.
    pub fn read_page(&self, vm: &VirtualMemory, vaddr: usize) -> Result<Vec<u8>, KillReason> {
        let phys = self.access(vm, vaddr, false, Self::ESP)?;
        Ok(vm.frames().memory().page(phys).to_vec())
    }

    fn access(
        &self,
        vm: &VirtualMemory,
        vaddr: usize,
        write: bool,
        esp: usize,
    ) -> Result<PhysFrame, KillReason> {
        for _ in 0..2 {
            let present = match self.dir.touch(vaddr, write) {
                Access::Mapped(phys) => return Ok(phys),
                Access::ReadOnly => true,
                Access::NotPresent => false,
            };
            let fault = PageFault {
                addr: vaddr,
                present,
                write,
                user: true,
                esp,
            };
            if let FaultOutcome::Kill(reason) = self.memory.handle_page_fault(vm, &fault) {
                return Err(reason);
            }
        }
        panic!("{vaddr:#x} still not mapped after a resolved fault");
    }
}
