//! Virtual Machine creation and memory management.
//!
//! A [`Vm`] owns the KVM VM file descriptor, its vCPUs and its memory slots.
//! Both collections are append-only and bounded: at most [`MAX_VCPUS`] vCPUs
//! and [`MAX_SLOTS`](super::MAX_SLOTS) memory slots, numbered from 0 in creation order.
//!
//! # Memory Regions
//!
//! Guest memory is registered one slot at a time. `register_memory`
//! allocates a fresh host mapping, hands it to KVM with
//! `KVM_SET_USER_MEMORY_REGION`, and only then records the slot, so a
//! rejected registration (overlap, bad size) leaves the VM unchanged and
//! frees the allocation.
//!
//! KVM uses EPT (Extended Page Tables) or NPT (Nested Page Tables) to translate
//! guest physical addresses to host physical addresses through the host's MMU.

use super::{host_page_size, Facility, KvmError, MemorySlot, SlotTable, Vcpu, VcpuExit, MAX_VCPUS};
use std::os::unix::io::AsRawFd;
use tracing::{debug, info, warn};

/// A virtual machine.
///
/// Fields are dropped in declaration order: vCPUs first, then the VM fd,
/// then guest memory.
pub struct Vm<'f> {
    vcpus: Vec<Vcpu>,
    fd: kvm_ioctls::VmFd,
    slots: SlotTable,
    facility: &'f Facility,
}

impl<'f> Vm<'f> {
    pub(super) fn new(facility: &'f Facility, fd: kvm_ioctls::VmFd) -> Self {
        Self {
            vcpus: Vec::with_capacity(MAX_VCPUS),
            fd,
            slots: SlotTable::new(),
            facility,
        }
    }

    /// The facility this VM was created from.
    pub fn facility(&self) -> &'f Facility {
        self.facility
    }

    /// Create the next vCPU and map its shared exit region.
    ///
    /// Returns the new vCPU's index (0, 1, ...).
    ///
    /// # Errors
    ///
    /// - [`KvmError::VcpuLimit`] once [`MAX_VCPUS`] vCPUs exist
    /// - [`KvmError::CreateVcpu`] if KVM refuses to create it
    /// - [`KvmError::SharedMapping`] if `kvm_run` cannot be mapped
    pub fn create_vcpu(&mut self) -> Result<u32, KvmError> {
        if self.vcpus.len() >= MAX_VCPUS {
            warn!("vCPU limit reached ({})", MAX_VCPUS);
            return Err(KvmError::VcpuLimit { max: MAX_VCPUS });
        }

        let index = self.vcpus.len() as u32;
        let vcpu = Vcpu::create(&self.fd, index, self.facility.run_size())?;
        self.vcpus.push(vcpu);

        info!("Created vCPU {} on VM fd={}", index, self.fd.as_raw_fd());
        Ok(index)
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub fn vcpu(&self, index: u32) -> Result<&Vcpu, KvmError> {
        self.vcpus
            .get(index as usize)
            .ok_or(KvmError::NoSuchVcpu(index))
    }

    pub fn vcpu_mut(&mut self, index: u32) -> Result<&mut Vcpu, KvmError> {
        self.vcpus
            .get_mut(index as usize)
            .ok_or(KvmError::NoSuchVcpu(index))
    }

    /// Back `[guest_start, guest_start + len)` with fresh, zeroed host memory.
    ///
    /// Returns the new slot's index. `len` must be a non-zero multiple of the
    /// host page size. Overlapping an existing slot is rejected by KVM.
    ///
    /// # Errors
    ///
    /// - [`KvmError::SlotLimit`] once [`MAX_SLOTS`](super::MAX_SLOTS) slots exist
    /// - [`KvmError::UnalignedLength`] for a bad `len`
    /// - [`KvmError::HostAllocation`] if host memory cannot be mapped
    /// - [`KvmError::SetMemoryRegion`] if KVM rejects the region
    pub fn register_memory(&mut self, guest_start: u64, len: u64) -> Result<u32, KvmError> {
        let index = self.slots.next_index()?;

        let page_size = host_page_size();
        if len == 0 || len % page_size != 0 {
            return Err(KvmError::UnalignedLength { len, page_size });
        }

        let slot = MemorySlot::allocate(index, guest_start, len)?;

        // SAFETY: the host mapping belongs to `slot`, which is stored in
        // `self.slots` below and dropped only after the VM fd is closed.
        unsafe { self.fd.set_user_memory_region(slot.as_kvm_region()) }.map_err(|source| {
            warn!(
                "KVM rejected slot {} at {:#x}+{:#x}: {}",
                index, guest_start, len, source
            );
            KvmError::SetMemoryRegion {
                slot: index,
                guest_addr: guest_start,
                len,
                source,
            }
        })?;

        debug!("Registered {:?}", slot);
        self.slots.push(slot)
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    /// Index of the slot containing guest address `addr`, if any.
    pub fn find_slot(&self, addr: u64) -> Option<u32> {
        self.slots.find(addr).map(MemorySlot::index)
    }

    /// Copy `data` into guest memory at `addr`.
    ///
    /// # Errors
    ///
    /// - [`KvmError::AddressNotMapped`] if no slot contains `addr`
    /// - [`KvmError::ContentOutOfBounds`] if `data` runs past that slot's end
    pub fn load_content(&self, addr: u64, data: &[u8]) -> Result<(), KvmError> {
        let slot = self.slots.load(addr, data)?;
        debug!(
            "Loaded {} bytes at {:#x} (slot {})",
            data.len(),
            addr,
            slot
        );
        Ok(())
    }

    /// Copy guest memory at `addr` into `data`.
    pub fn read_content(&self, addr: u64, data: &mut [u8]) -> Result<(), KvmError> {
        self.slots.read(addr, data).map(|_| ())
    }

    /// Run vCPU `index` until its next exit.
    pub fn run_once(&mut self, index: u32) -> Result<VcpuExit, KvmError> {
        self.vcpu_mut(index)?.run_once()
    }
}
