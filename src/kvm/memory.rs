//! Guest memory slots.
//!
//! Each slot maps a range of guest physical addresses onto a private,
//! zero-filled, page-aligned host mapping owned by the slot:
//!
//! ```text
//! Guest Physical            Host Virtual
//! ┌──────────────┐         ┌──────────────┐
//! │ slot 0       │ ──────► │ MmapRegion 0 │
//! │ 0x0 +0x1000  │         └──────────────┘
//! ├──────────────┤
//! │   (hole)     │
//! ├──────────────┤         ┌──────────────┐
//! │ slot 1       │ ──────► │ MmapRegion 1 │
//! │ 0xff000 +... │         └──────────────┘
//! └──────────────┘
//! ```
//!
//! Slots are append-only and numbered in registration order, which is also
//! the KVM slot number. Overlap between slots is detected by KVM when the
//! region is registered; this module only looks slots up and copies bytes
//! in and out of them.

use super::{KvmError, MAX_SLOTS};
use kvm_bindings::kvm_userspace_memory_region;
use vm_memory::{Bytes, MmapRegion, VolatileMemory};

/// Host page size in bytes.
pub fn host_page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// A guest physical range backed by host memory.
pub struct MemorySlot {
    index: u32,
    guest_start: u64,
    /// Anonymous private mapping; unmapped when the slot is dropped.
    region: MmapRegion,
}

impl MemorySlot {
    /// Allocate zeroed host memory for a slot of `len` bytes at `guest_start`.
    ///
    /// The mapping is created with `MAP_PRIVATE | MAP_ANONYMOUS`, so it is
    /// page-aligned and zero-filled.
    pub fn allocate(index: u32, guest_start: u64, len: u64) -> Result<Self, KvmError> {
        let region = MmapRegion::<()>::new(len as usize).map_err(|e| KvmError::HostAllocation {
            len,
            source: std::io::Error::other(e.to_string()),
        })?;

        Ok(Self {
            index,
            guest_start,
            region,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn guest_start(&self) -> u64 {
        self.guest_start
    }

    pub fn len(&self) -> u64 {
        self.region.size() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First guest address past the end of the slot.
    pub fn guest_end(&self) -> u64 {
        self.guest_start.saturating_add(self.len())
    }

    /// Whether `addr` lies in `[guest_start, guest_end)`.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_start && addr < self.guest_end()
    }

    /// Host virtual address of the first byte of the slot.
    pub fn host_addr(&self) -> u64 {
        self.region.as_ptr() as u64
    }

    /// The `KVM_SET_USER_MEMORY_REGION` argument describing this slot.
    pub fn as_kvm_region(&self) -> kvm_userspace_memory_region {
        kvm_userspace_memory_region {
            slot: self.index,
            guest_phys_addr: self.guest_start,
            memory_size: self.len(),
            userspace_addr: self.host_addr(),
            flags: 0,
        }
    }

    fn out_of_bounds(&self, addr: u64, len: usize) -> KvmError {
        KvmError::ContentOutOfBounds {
            addr,
            len: len as u64,
            slot: self.index,
            slot_start: self.guest_start,
            slot_len: self.len(),
        }
    }

    /// Check that `[addr, addr + len)` lies inside the slot and return the
    /// offset of `addr` within it.
    fn offset_of(&self, addr: u64, len: usize) -> Result<usize, KvmError> {
        if !self.contains(addr) {
            return Err(self.out_of_bounds(addr, len));
        }
        match addr.checked_add(len as u64) {
            Some(end) if end <= self.guest_end() => Ok((addr - self.guest_start) as usize),
            _ => Err(self.out_of_bounds(addr, len)),
        }
    }

    /// Copy `data` into the slot at guest address `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), KvmError> {
        let offset = self.offset_of(addr, data.len())?;
        self.region
            .as_volatile_slice()
            .write_slice(data, offset)
            .map_err(|_| self.out_of_bounds(addr, data.len()))
    }

    /// Copy bytes out of the slot at guest address `addr` into `data`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), KvmError> {
        let offset = self.offset_of(addr, data.len())?;
        self.region
            .as_volatile_slice()
            .read_slice(data, offset)
            .map_err(|_| self.out_of_bounds(addr, data.len()))
    }
}

impl std::fmt::Debug for MemorySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySlot")
            .field("index", &self.index)
            .field("guest_start", &format_args!("{:#x}", self.guest_start))
            .field("len", &format_args!("{:#x}", self.len()))
            .field("host_addr", &format_args!("{:#x}", self.host_addr()))
            .finish()
    }
}

/// Append-only table of a VM's memory slots, bounded by [`MAX_SLOTS`].
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: Vec<MemorySlot>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(MAX_SLOTS),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&MemorySlot> {
        self.slots.get(index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemorySlot> {
        self.slots.iter()
    }

    /// Index the next slot will receive, or [`KvmError::SlotLimit`] if the
    /// table is full.
    pub fn next_index(&self) -> Result<u32, KvmError> {
        if self.slots.len() >= MAX_SLOTS {
            return Err(KvmError::SlotLimit { max: MAX_SLOTS });
        }
        Ok(self.slots.len() as u32)
    }

    /// Append a slot allocated for [`next_index`](Self::next_index).
    pub fn push(&mut self, slot: MemorySlot) -> Result<u32, KvmError> {
        let index = self.next_index()?;
        debug_assert_eq!(slot.index, index);
        self.slots.push(slot);
        Ok(index)
    }

    /// First slot, in registration order, containing `addr`.
    pub fn find(&self, addr: u64) -> Option<&MemorySlot> {
        self.slots.iter().find(|slot| slot.contains(addr))
    }

    fn resolve(&self, addr: u64) -> Result<&MemorySlot, KvmError> {
        self.find(addr).ok_or(KvmError::AddressNotMapped(addr))
    }

    /// Copy `data` into guest memory at `addr`.
    ///
    /// The whole buffer must fit in the slot containing `addr`; writes never
    /// span two slots. Returns the index of the slot written.
    pub fn load(&self, addr: u64, data: &[u8]) -> Result<u32, KvmError> {
        let slot = self.resolve(addr)?;
        slot.write(addr, data)?;
        Ok(slot.index)
    }

    /// Copy guest memory at `addr` into `data`, with the same rules as
    /// [`load`](Self::load).
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<u32, KvmError> {
        let slot = self.resolve(addr)?;
        slot.read(addr, data)?;
        Ok(slot.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 0x1000;

    /// Build a table the way `Vm::register_memory` does, minus the ioctl.
    fn table(ranges: &[(u64, u64)]) -> SlotTable {
        let mut table = SlotTable::new();
        for &(start, len) in ranges {
            let index = table.next_index().unwrap();
            table
                .push(MemorySlot::allocate(index, start, len).unwrap())
                .unwrap();
        }
        table
    }

    fn read_vec(table: &SlotTable, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        table.read(addr, &mut data).unwrap();
        data
    }

    #[test]
    fn test_find_slot() {
        let table = table(&[(0x0, PAGE), (0xff000, PAGE)]);
        assert_eq!(table.find(0xfff00).map(MemorySlot::index), Some(1));
        assert_eq!(table.find(0x23).map(MemorySlot::index), Some(0));
        assert!(table.find(0x12345).is_none());
    }

    #[test]
    fn test_find_slot_boundaries() {
        let table = table(&[(0xff000, PAGE)]);
        assert!(table.find(0xfefff).is_none());
        assert_eq!(table.find(0xff000).map(MemorySlot::index), Some(0));
        assert_eq!(table.find(0xfffff).map(MemorySlot::index), Some(0));
    }

    /// Lookups use a half-open range: the first byte after a slot is not part
    /// of it, so an address exactly at `start + len` is unmapped.
    #[test]
    fn test_find_slot_excludes_end() {
        let table = table(&[(0x0, PAGE)]);
        assert!(table.find(PAGE).is_none());
        assert!(matches!(
            table.load(PAGE, &[1]),
            Err(KvmError::AddressNotMapped(PAGE))
        ));
    }

    #[test]
    fn test_find_slot_adjacent() {
        let table = table(&[(0x0, PAGE), (PAGE, PAGE)]);
        assert_eq!(table.find(PAGE - 1).map(MemorySlot::index), Some(0));
        assert_eq!(table.find(PAGE).map(MemorySlot::index), Some(1));
    }

    #[test]
    fn test_load_read_back() {
        let table = table(&[(0x0, PAGE), (0xff000, PAGE)]);
        let code = [0xea, 0x5b, 0xe0, 0x00, 0xf0, 0x01, 0x02];
        assert_eq!(table.load(0xffff0, &code).unwrap(), 1);
        assert_eq!(read_vec(&table, 0xffff0, code.len()), code);

        let slot = table.get(1).unwrap();
        let mut raw = [0u8; 7];
        slot.read(slot.guest_start() + 0xff0, &mut raw).unwrap();
        assert_eq!(raw, code);
    }

    #[test]
    fn test_fresh_slot_is_zeroed() {
        let table = table(&[(0x0, PAGE)]);
        assert!(read_vec(&table, 0x0, PAGE as usize).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_load_fills_slot_exactly() {
        let table = table(&[(0xff000, PAGE)]);
        let tail = [0xaa; 16];
        table.load(0x100000 - 16, &tail).unwrap();
        assert_eq!(read_vec(&table, 0x100000 - 16, 16), tail);
    }

    #[test]
    fn test_load_unmapped() {
        let table = table(&[(0xff000, PAGE)]);
        assert!(matches!(
            table.load(0xfffff0, &[0; 7]),
            Err(KvmError::AddressNotMapped(0xfffff0))
        ));
    }

    #[test]
    fn test_load_out_of_bounds() {
        let table = table(&[(0xff000, PAGE)]);
        let err = table.load(0xffffc, &[0; 8]).unwrap_err();
        match err {
            KvmError::ContentOutOfBounds {
                addr,
                len,
                slot,
                slot_start,
                slot_len,
            } => {
                assert_eq!(addr, 0xffffc);
                assert_eq!(len, 8);
                assert_eq!(slot, 0);
                assert_eq!(slot_start, 0xff000);
                assert_eq!(slot_len, PAGE);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Nothing was written.
        assert_eq!(read_vec(&table, 0xffffc, 4), [0; 4]);
    }

    #[test]
    fn test_load_does_not_span_adjacent_slots() {
        let table = table(&[(0x0, PAGE), (PAGE, PAGE)]);
        assert!(matches!(
            table.load(PAGE - 2, &[1, 2, 3, 4]),
            Err(KvmError::ContentOutOfBounds { slot: 0, .. })
        ));
    }

    #[test]
    fn test_slot_limit() {
        let ranges: Vec<(u64, u64)> = (0..MAX_SLOTS as u64).map(|i| (i * PAGE, PAGE)).collect();
        let table = table(&ranges);
        assert_eq!(table.len(), MAX_SLOTS);
        assert!(matches!(
            table.next_index(),
            Err(KvmError::SlotLimit { max: MAX_SLOTS })
        ));
    }

    #[test]
    fn test_kvm_region() {
        let slot = MemorySlot::allocate(3, 0xff000, PAGE).unwrap();
        let region = slot.as_kvm_region();
        assert_eq!(region.slot, 3);
        assert_eq!(region.guest_phys_addr, 0xff000);
        assert_eq!(region.memory_size, PAGE);
        assert_eq!(region.userspace_addr, slot.host_addr());
        assert_eq!(slot.host_addr() % host_page_size(), 0);
    }
}
