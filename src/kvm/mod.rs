//! KVM (Kernel-based Virtual Machine) control plane.
//!
//! This module provides a small, safe Rust interface to Linux KVM: open the
//! facility, create a VM, attach vCPUs, map guest physical memory onto host
//! memory, and drive the run/exit loop.
//!
//! # KVM Architecture
//!
//! The VMM (us) talks to KVM through ioctls on three kinds of file descriptor:
//!
//! - `/dev/kvm` - System-level operations (API version, vCPU mmap size, create VMs)
//! - VM file descriptor - VM-level operations (create vCPUs, set memory slots)
//! - vCPU file descriptor - vCPU-level operations (run, get/set registers)
//!
//! ```text
//! User Space (VMM)                     Kernel Space (KVM)
//! ┌───────────────┐                   ┌──────────────────┐
//! │ Facility ─────┼──── ioctl() ─────►│  /dev/kvm        │
//! │               │                   │                  │
//! │ Vm ───────────┼──── ioctl() ─────►│  VM state        │
//! │  ├ SlotTable  │  (memory slots)   │  (memslots)      │
//! │  └ Vcpu ──────┼──── ioctl() ─────►│  vCPU state      │
//! │     └ ExitInfo│◄═══ mmap ════════►│  struct kvm_run  │
//! └───────────────┘                   └──────────────────┘
//! ```
//!
//! # Ownership
//!
//! A [`Vm`] borrows the [`Facility`] it was created from, so it cannot outlive
//! the `/dev/kvm` handle. The VM owns its vCPUs and memory slots; each vCPU
//! owns its shared `kvm_run` mapping and each slot owns its host memory. All
//! of them are released when the VM is dropped.
//!
//! # Example Usage
//!
//! ```ignore
//! let facility = kvm::Facility::open()?;
//! let mut vm = facility.create_vm()?;
//! let cpu = vm.create_vcpu()?;
//! vm.register_memory(0x0, 0x1000)?;
//! vm.load_content(0x100, &guest_code)?;
//! vm.vcpu(cpu)?.set_real_mode_entry(0x100)?;
//!
//! loop {
//!     match vm.run_once(cpu)? {
//!         VcpuExit::Io(io) => {
//!             let vcpu = vm.vcpu(cpu)?;
//!             println!("port {:#x} data {:#x}", vcpu.io_port(), vcpu.io_data()?);
//!         }
//!         _ => break,
//!     }
//! }
//! ```

mod exit;
mod facility;
mod memory;
mod vcpu;
mod vm;

pub use exit::{exit_reason_name, ExitInfo, IoDirection, IoExit, VcpuExit};
pub use facility::{Facility, KVM_API_VERSION};
pub use memory::{host_page_size, MemorySlot, SlotTable};
pub use vcpu::Vcpu;
pub use vm::Vm;

use thiserror::Error;

/// Maximum number of vCPUs per VM.
pub const MAX_VCPUS: usize = 16;

/// Maximum number of memory slots per VM.
pub const MAX_SLOTS: usize = 16;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open /dev/kvm device.
    ///
    /// This usually means:
    /// - KVM is not available (not running on Linux, or KVM module not loaded)
    /// - Insufficient permissions (user not in kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("Failed to open /dev/kvm: {0}")]
    FacilityUnavailable(#[source] kvm_ioctls::Error),

    /// KVM_GET_API_VERSION failed or reported an unsupported version.
    #[error("Failed to query KVM API version: {0}")]
    ProtocolQuery(#[source] kvm_ioctls::Error),

    /// KVM_GET_VCPU_MMAP_SIZE failed.
    #[error("Failed to query vCPU mmap size: {0}")]
    MappingSizeQuery(#[source] kvm_ioctls::Error),

    /// Failed to create a new VM.
    #[error("Failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    /// Failed to create a vCPU.
    #[error("Failed to create vCPU {index}: {source}")]
    CreateVcpu {
        index: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    /// Failed to mmap the vCPU's `kvm_run` structure.
    #[error("Failed to map kvm_run for vCPU {index}: {source}")]
    SharedMapping {
        index: u32,
        #[source]
        source: nix::Error,
    },

    #[error("No more than {max} vCPUs per VM")]
    VcpuLimit { max: usize },

    #[error("vCPU {0} does not exist")]
    NoSuchVcpu(u32),

    /// Failed to allocate host memory backing a slot.
    #[error("Failed to allocate {len:#x} bytes of guest memory: {source}")]
    HostAllocation {
        len: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Memory length {len:#x} is not a non-zero multiple of the page size ({page_size:#x})")]
    UnalignedLength { len: u64, page_size: u64 },

    #[error("No more than {max} memory slots per VM")]
    SlotLimit { max: usize },

    /// KVM rejected the memory region, typically because it overlaps an
    /// existing slot.
    #[error("Failed to set user memory region (slot {slot}, {guest_addr:#x}+{len:#x}): {source}")]
    SetMemoryRegion {
        slot: u32,
        guest_addr: u64,
        len: u64,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Guest address {0:#x} is not backed by any memory slot")]
    AddressNotMapped(u64),

    #[error("{addr:#x}+{len:#x} runs past slot {slot} ({slot_start:#x}+{slot_len:#x})")]
    ContentOutOfBounds {
        addr: u64,
        len: u64,
        slot: u32,
        slot_start: u64,
        slot_len: u64,
    },

    /// Failed to run vCPU.
    #[error("Failed to run vCPU {index}: {source}")]
    Run {
        index: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Shared exit region of {size} bytes is smaller than struct kvm_run")]
    ExitInfoTooSmall { size: usize },

    /// The facility-supplied I/O data offset points outside the shared region.
    #[error("I/O data at offset {offset:#x} (+{width}) is outside the {size:#x}-byte exit region")]
    IoDataOutOfBounds {
        offset: u64,
        width: usize,
        size: usize,
    },

    /// Failed to set CPU registers.
    #[error("Failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to get CPU registers.
    #[error("Failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),
}
