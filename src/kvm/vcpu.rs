//! Virtual CPU management and execution.
//!
//! A vCPU is a KVM file descriptor plus a shared mapping of its `kvm_run`
//! structure. KVM writes the exit reason and payload into that mapping before
//! `KVM_RUN` returns, and reads back anything we leave there (such as the
//! result of an IN instruction) on the next run.
//!
//! # vCPU Execution Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      VMM (User Space)                   │
//! │  ┌──────────┐         ┌──────────────┐                  │
//! │  │ run_once │◄────────│ ExitInfo     │◄──┐              │
//! │  └────┬─────┘         │ (decode)     │   │ shared       │
//! │       │ KVM_RUN       └──────────────┘   │ kvm_run      │
//! ├───────┼──────────────────────────────────┼──────────────┤
//! │       ▼          KVM (Kernel)            │              │
//! │  ┌─────────┐  Guest   ┌───────────┐      │              │
//! │  │ VMENTER │─────────►│  VMEXIT   │──────┘              │
//! │  └─────────┘  Runs    └───────────┘                     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! `run_once` blocks the calling thread until the guest exits. There is no
//! timeout and no cancellation.

use super::exit::{write_io_data, ExitInfo, VcpuExit};
use super::KvmError;
use kvm_bindings::kvm_regs;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use tracing::{debug, trace};

/// Reserved bit 1 of RFLAGS, which must always be set.
const RFLAGS_RESERVED: u64 = 0x2;

/// Shared `MAP_SHARED` mapping of a vCPU's `kvm_run` area.
struct ExitRegion {
    ptr: NonNull<c_void>,
    size: usize,
}

// SAFETY: the mapping is owned exclusively by one `Vcpu` and only accessed
// through it; it stays valid until `drop`.
unsafe impl Send for ExitRegion {}

impl ExitRegion {
    fn map(vcpu: &kvm_ioctls::VcpuFd, size: usize) -> nix::Result<Self> {
        let len = NonZeroUsize::new(size).ok_or(nix::Error::EINVAL)?;
        // SAFETY: the vCPU fd is open for the duration of this call.
        let fd = unsafe { BorrowedFd::borrow_raw(vcpu.as_raw_fd()) };
        // SAFETY: a fresh mapping chosen by the kernel does not alias any Rust
        // object.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )?
        };
        Ok(Self { ptr, size })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is a live mapping of `size` bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.size) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.size) }
    }
}

impl Drop for ExitRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `map` and is unmapped only here.
        if let Err(e) = unsafe { munmap(self.ptr, self.size) } {
            debug!("munmap of kvm_run failed: {}", e);
        }
    }
}

/// A virtual CPU and its shared exit region.
pub struct Vcpu {
    index: u32,
    /// Unmapped before the fd is closed.
    exit_region: ExitRegion,
    fd: kvm_ioctls::VcpuFd,
}

impl Vcpu {
    /// Create vCPU `index` on `vm` and map `run_size` bytes of its `kvm_run`.
    ///
    /// If the mapping fails the vCPU fd is closed again before returning.
    pub(super) fn create(
        vm: &kvm_ioctls::VmFd,
        index: u32,
        run_size: usize,
    ) -> Result<Self, KvmError> {
        let fd = vm
            .create_vcpu(u64::from(index))
            .map_err(|source| KvmError::CreateVcpu { index, source })?;

        let exit_region = ExitRegion::map(&fd, run_size)
            .map_err(|source| KvmError::SharedMapping { index, source })?;
        ExitInfo::new(exit_region.as_slice())?;

        debug!(
            "Created vCPU {}: fd={}, kvm_run at {:p} ({} bytes)",
            index,
            fd.as_raw_fd(),
            exit_region.ptr,
            run_size
        );

        Ok(Self {
            index,
            exit_region,
            fd,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// View of the shared exit region as of the last exit.
    pub fn exit_info(&self) -> ExitInfo<'_> {
        ExitInfo::trusted(self.exit_region.as_slice())
    }

    /// Enter the guest and block until it exits.
    ///
    /// # Errors
    ///
    /// [`KvmError::Run`] if `KVM_RUN` itself fails (for example on invalid
    /// vCPU state or a signal). The vCPU and the rest of the VM stay usable.
    pub fn run_once(&mut self) -> Result<VcpuExit, KvmError> {
        let index = self.index;
        self.fd
            .run()
            .map_err(|source| KvmError::Run { index, source })?;

        let exit = self.exit_info().decode();
        trace!("vCPU {} exit: {:?}", index, exit);
        Ok(exit)
    }

    /// Port number of the last I/O exit. Only meaningful after an I/O exit.
    pub fn io_port(&self) -> u16 {
        self.exit_info().io_port()
    }

    /// 32-bit value at the last I/O exit's data offset.
    pub fn io_data(&self) -> Result<u32, KvmError> {
        self.exit_info().io_data()
    }

    /// Provide the result of an IN instruction before the next `run_once`.
    pub fn set_io_data(&mut self, value: u32) -> Result<(), KvmError> {
        write_io_data(self.exit_region.as_mut_slice(), value)
    }

    /// Get the current general-purpose registers.
    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.fd.get_regs().map_err(KvmError::GetRegisters)
    }

    /// Start executing in real mode at guest physical address `addr`.
    ///
    /// The address is split into a 64K-aligned code segment base and an
    /// offset, so `0xffff0` becomes the reset-style `F000:FFF0`.
    pub fn set_real_mode_entry(&self, addr: u64) -> Result<(), KvmError> {
        let base = addr & !0xffff;

        let mut sregs = self.fd.get_sregs().map_err(KvmError::GetRegisters)?;
        sregs.cs.base = base;
        sregs.cs.selector = (base >> 4) as u16;
        self.fd.set_sregs(&sregs).map_err(KvmError::SetRegisters)?;

        let regs = kvm_regs {
            rip: addr & 0xffff,
            rflags: RFLAGS_RESERVED,
            ..Default::default()
        };
        self.fd.set_regs(&regs).map_err(KvmError::SetRegisters)?;

        debug!(
            "vCPU {} entry: {:04x}:{:04x}",
            self.index, sregs.cs.selector, regs.rip
        );
        Ok(())
    }
}
