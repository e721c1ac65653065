//! Decoding of the shared `kvm_run` exit structure.
//!
//! Every vCPU has a `kvm_run` structure mapped into our address space. KVM
//! fills it in before `KVM_RUN` returns, so after each run we can read the
//! exit reason and its payload without another system call.
//!
//! # Layout
//!
//! Only the parts of `struct kvm_run` this crate reads are described here
//! (offsets are identical on every architecture KVM supports):
//!
//! ```text
//! offset  field
//! 0x08    exit_reason: u32
//! 0x20    union {
//!           io:           direction: u8, size: u8, port: u16,
//!                         count: u32, data_offset: u64
//!           mmio:         phys_addr: u64, ...
//!           fail_entry:   hardware_entry_failure_reason: u64
//!           internal:     suberror: u32
//!           system_event: type: u32
//!         }
//! ```
//!
//! Port I/O data is not stored inline. `io.data_offset` is a byte offset from
//! the start of the mapping to the data buffer (normally the page after
//! `kvm_run` itself). The offset comes from the kernel and is checked against
//! the mapping size before it is dereferenced.

use super::KvmError;
use kvm_bindings::{
    kvm_run, KVM_EXIT_DEBUG, KVM_EXIT_EXCEPTION, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT,
    KVM_EXIT_HYPERCALL, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT,
    KVM_EXIT_IRQ_WINDOW_OPEN, KVM_EXIT_MMIO, KVM_EXIT_SHUTDOWN, KVM_EXIT_SYSTEM_EVENT,
    KVM_EXIT_UNKNOWN,
};

/// Byte offsets into `struct kvm_run`.
mod offset {
    pub const EXIT_REASON: usize = 0x08;

    /// Start of the per-reason union.
    const UNION: usize = 0x20;

    pub const IO_DIRECTION: usize = UNION;
    pub const IO_SIZE: usize = UNION + 0x01;
    pub const IO_PORT: usize = UNION + 0x02;
    pub const IO_COUNT: usize = UNION + 0x04;
    pub const IO_DATA_OFFSET: usize = UNION + 0x08;

    pub const MMIO_PHYS_ADDR: usize = UNION;
    pub const FAIL_ENTRY_REASON: usize = UNION;
    pub const INTERNAL_SUBERROR: usize = UNION;
    pub const SYSTEM_EVENT_TYPE: usize = UNION;
}

/// Width of the value returned by [`ExitInfo::io_data`].
const IO_DATA_WIDTH: usize = std::mem::size_of::<u32>();

/// Direction of a port I/O access, from the guest's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// IN instruction: the guest reads from the port.
    In,
    /// OUT instruction: the guest writes to the port.
    Out,
}

/// Port I/O exit payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoExit {
    pub direction: IoDirection,
    pub port: u16,
    /// Access width in bytes (1, 2 or 4).
    pub size: u8,
    /// Number of accesses (greater than 1 for string instructions).
    pub count: u32,
    /// Offset of the data buffer from the start of the `kvm_run` mapping.
    pub data_offset: u64,
}

/// Why the vCPU returned to the VMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuExit {
    /// Guest executed IN or OUT.
    Io(IoExit),

    /// Guest executed HLT.
    Hlt,

    /// Guest touched a physical address no slot backs.
    Mmio(u64),

    /// Triple fault or explicit shutdown.
    Shutdown,

    /// Failed to enter guest mode.
    ///
    /// Contains the hardware-specific failure reason code.
    FailEntry(u64),

    /// KVM internal error, with its suberror code.
    InternalError(u32),

    /// System event (e.g., reset, crash), with the event type code.
    SystemEvent(u32),

    /// Any other exit reason, left for the caller to interpret.
    Other(u32),
}

impl VcpuExit {
    /// Exits after which the guest cannot make progress.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            VcpuExit::Shutdown | VcpuExit::FailEntry(_) | VcpuExit::InternalError(_)
        )
    }
}

/// Human-readable name of a raw KVM exit reason.
pub fn exit_reason_name(reason: u32) -> &'static str {
    match reason {
        KVM_EXIT_UNKNOWN => "UNKNOWN",
        KVM_EXIT_EXCEPTION => "EXCEPTION",
        KVM_EXIT_IO => "IO",
        KVM_EXIT_HYPERCALL => "HYPERCALL",
        KVM_EXIT_DEBUG => "DEBUG",
        KVM_EXIT_HLT => "HLT",
        KVM_EXIT_MMIO => "MMIO",
        KVM_EXIT_IRQ_WINDOW_OPEN => "IRQ_WINDOW_OPEN",
        KVM_EXIT_SHUTDOWN => "SHUTDOWN",
        KVM_EXIT_FAIL_ENTRY => "FAIL_ENTRY",
        KVM_EXIT_INTERNAL_ERROR => "INTERNAL_ERROR",
        KVM_EXIT_SYSTEM_EVENT => "SYSTEM_EVENT",
        _ => "OTHER",
    }
}

/// Read-only view of a vCPU's shared exit region.
///
/// The view covers the whole mapping (`run_size` bytes), not just
/// `struct kvm_run`, so that data offsets into the trailing pages resolve.
#[derive(Clone, Copy)]
pub struct ExitInfo<'a> {
    bytes: &'a [u8],
}

impl<'a> ExitInfo<'a> {
    /// Wrap a shared region. It must be at least as large as `struct kvm_run`.
    pub fn new(bytes: &'a [u8]) -> Result<Self, KvmError> {
        check_size(bytes.len())?;
        Ok(Self { bytes })
    }

    /// Wrap a region whose size was already checked with [`ExitInfo::new`].
    pub(crate) fn trusted(bytes: &'a [u8]) -> Self {
        debug_assert!(check_size(bytes.len()).is_ok());
        Self { bytes }
    }

    /// Size of the underlying region in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn read<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[at..at + N]);
        out
    }

    /// Raw `exit_reason` field.
    pub fn reason(&self) -> u32 {
        u32::from_ne_bytes(self.read(offset::EXIT_REASON))
    }

    /// Port number of the last I/O exit.
    ///
    /// This is a plain field read; it is only meaningful when
    /// [`reason`](Self::reason) is `KVM_EXIT_IO`.
    pub fn io_port(&self) -> u16 {
        u16::from_ne_bytes(self.read(offset::IO_PORT))
    }

    pub fn io_data_offset(&self) -> u64 {
        u64::from_ne_bytes(self.read(offset::IO_DATA_OFFSET))
    }

    /// The 32-bit value at `io.data_offset` within the region.
    ///
    /// Like [`io_port`](Self::io_port) this does not look at the exit reason,
    /// but the offset is bounds-checked against the region.
    pub fn io_data(&self) -> Result<u32, KvmError> {
        let at = data_range(self.io_data_offset(), self.size())?;
        Ok(u32::from_ne_bytes(self.read(at)))
    }

    /// The full port I/O payload, if the last exit was port I/O.
    pub fn io(&self) -> Option<IoExit> {
        if self.reason() != KVM_EXIT_IO {
            return None;
        }
        let direction = match u8::from_ne_bytes(self.read(offset::IO_DIRECTION)) as u32 {
            KVM_EXIT_IO_IN => IoDirection::In,
            KVM_EXIT_IO_OUT => IoDirection::Out,
            _ => return None,
        };
        Some(IoExit {
            direction,
            port: self.io_port(),
            size: u8::from_ne_bytes(self.read(offset::IO_SIZE)),
            count: u32::from_ne_bytes(self.read(offset::IO_COUNT)),
            data_offset: self.io_data_offset(),
        })
    }

    /// Decode the exit reason and its payload.
    pub fn decode(&self) -> VcpuExit {
        let reason = self.reason();
        match reason {
            KVM_EXIT_IO => match self.io() {
                Some(io) => VcpuExit::Io(io),
                None => VcpuExit::Other(reason),
            },
            KVM_EXIT_HLT => VcpuExit::Hlt,
            KVM_EXIT_MMIO => VcpuExit::Mmio(u64::from_ne_bytes(self.read(offset::MMIO_PHYS_ADDR))),
            KVM_EXIT_SHUTDOWN => VcpuExit::Shutdown,
            KVM_EXIT_FAIL_ENTRY => {
                VcpuExit::FailEntry(u64::from_ne_bytes(self.read(offset::FAIL_ENTRY_REASON)))
            }
            KVM_EXIT_INTERNAL_ERROR => {
                VcpuExit::InternalError(u32::from_ne_bytes(self.read(offset::INTERNAL_SUBERROR)))
            }
            KVM_EXIT_SYSTEM_EVENT => {
                VcpuExit::SystemEvent(u32::from_ne_bytes(self.read(offset::SYSTEM_EVENT_TYPE)))
            }
            _ => VcpuExit::Other(reason),
        }
    }
}

impl std::fmt::Debug for ExitInfo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitInfo")
            .field("size", &self.size())
            .field("reason", &exit_reason_name(self.reason()))
            .finish()
    }
}

fn check_size(size: usize) -> Result<(), KvmError> {
    if size < std::mem::size_of::<kvm_run>() {
        return Err(KvmError::ExitInfoTooSmall { size });
    }
    Ok(())
}

/// Validate a facility-supplied data offset and return it as an index.
fn data_range(offset: u64, size: usize) -> Result<usize, KvmError> {
    usize::try_from(offset)
        .ok()
        .filter(|start| {
            start
                .checked_add(IO_DATA_WIDTH)
                .is_some_and(|end| end <= size)
        })
        .ok_or(KvmError::IoDataOutOfBounds {
            offset,
            width: IO_DATA_WIDTH,
            size,
        })
}

/// Store `value` at the I/O data offset of a writable exit region, so that
/// the next `KVM_RUN` completes the guest's IN instruction with it.
pub(crate) fn write_io_data(region: &mut [u8], value: u32) -> Result<(), KvmError> {
    let start = {
        let info = ExitInfo::new(region)?;
        data_range(info.io_data_offset(), info.size())?
    };
    region[start..start + IO_DATA_WIDTH].copy_from_slice(&value.to_ne_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Size of a typical vCPU mapping: `kvm_run`, the PIO page and the coalesced MMIO ring.
    const RUN_SIZE: usize = 0x3000;

    /// Where KVM puts port I/O data (the page after `kvm_run`).
    const PIO_OFFSET: u64 = 0x1000;

    fn region(run: &kvm_run) -> Vec<u8> {
        // SAFETY: kvm_run is plain old data.
        let raw = unsafe {
            std::slice::from_raw_parts(
                run as *const kvm_run as *const u8,
                std::mem::size_of::<kvm_run>(),
            )
        };
        let mut bytes = vec![0u8; RUN_SIZE];
        bytes[..raw.len()].copy_from_slice(raw);
        bytes
    }

    fn io_run(direction: u32, port: u16, size: u8, data_offset: u64) -> kvm_run {
        // SAFETY: an all-zero kvm_run is valid.
        let mut run: kvm_run = unsafe { std::mem::zeroed() };
        run.exit_reason = KVM_EXIT_IO;
        unsafe {
            run.__bindgen_anon_1.io.direction = direction as u8;
            run.__bindgen_anon_1.io.size = size;
            run.__bindgen_anon_1.io.port = port;
            run.__bindgen_anon_1.io.count = 1;
            run.__bindgen_anon_1.io.data_offset = data_offset;
        }
        run
    }

    #[test]
    fn test_decode_io_out() {
        let mut bytes = region(&io_run(KVM_EXIT_IO_OUT, 0x3f8, 4, PIO_OFFSET));
        let at = PIO_OFFSET as usize;
        bytes[at..at + 4].copy_from_slice(&0x2au32.to_ne_bytes());

        let info = ExitInfo::new(&bytes).unwrap();
        assert_eq!(info.reason(), KVM_EXIT_IO);
        assert_eq!(info.io_port(), 0x3f8);
        assert_eq!(info.io_data().unwrap(), 0x2a);
        assert_eq!(
            info.decode(),
            VcpuExit::Io(IoExit {
                direction: IoDirection::Out,
                port: 0x3f8,
                size: 4,
                count: 1,
                data_offset: PIO_OFFSET,
            })
        );
    }

    #[test]
    fn test_decode_io_in() {
        let bytes = region(&io_run(KVM_EXIT_IO_IN, 0x60, 1, PIO_OFFSET));
        let io = ExitInfo::new(&bytes).unwrap().io().unwrap();
        assert_eq!(io.direction, IoDirection::In);
        assert_eq!(io.port, 0x60);
        assert_eq!(io.size, 1);
    }

    #[test]
    fn test_io_data_follows_offset() {
        let mut bytes = region(&io_run(KVM_EXIT_IO_OUT, 0x80, 4, 0x2000));
        bytes[0x1000..0x1004].copy_from_slice(&1u32.to_ne_bytes());
        bytes[0x2000..0x2004].copy_from_slice(&0xdead_beefu32.to_ne_bytes());
        assert_eq!(ExitInfo::new(&bytes).unwrap().io_data().unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_io_data_offset_out_of_bounds() {
        for offset in [RUN_SIZE as u64, RUN_SIZE as u64 - 3, u64::MAX] {
            let bytes = region(&io_run(KVM_EXIT_IO_OUT, 0x80, 4, offset));
            let err = ExitInfo::new(&bytes).unwrap().io_data().unwrap_err();
            assert!(
                matches!(err, KvmError::IoDataOutOfBounds { offset: o, width: 4, size: RUN_SIZE } if o == offset),
                "offset {offset:#x}: {err}"
            );
        }
    }

    #[test]
    fn test_io_data_last_word() {
        let offset = RUN_SIZE as u64 - 4;
        let mut bytes = region(&io_run(KVM_EXIT_IO_OUT, 0x80, 4, offset));
        bytes[RUN_SIZE - 4..].copy_from_slice(&7u32.to_ne_bytes());
        assert_eq!(ExitInfo::new(&bytes).unwrap().io_data().unwrap(), 7);
    }

    #[test]
    fn test_write_io_data() {
        let mut bytes = region(&io_run(KVM_EXIT_IO_IN, 0x71, 1, PIO_OFFSET));
        write_io_data(&mut bytes, 0x55).unwrap();
        assert_eq!(ExitInfo::new(&bytes).unwrap().io_data().unwrap(), 0x55);
    }

    #[test]
    fn test_write_io_data_out_of_bounds() {
        let mut bytes = region(&io_run(KVM_EXIT_IO_IN, 0x71, 1, u64::MAX - 1));
        let before = bytes.clone();
        assert!(write_io_data(&mut bytes, 0x55).is_err());
        assert_eq!(bytes, before);
    }

    #[test]
    fn test_io_on_non_io_exit() {
        let mut run: kvm_run = unsafe { std::mem::zeroed() };
        run.exit_reason = KVM_EXIT_HLT;
        let bytes = region(&run);
        let info = ExitInfo::new(&bytes).unwrap();
        assert!(info.io().is_none());
        assert_eq!(info.decode(), VcpuExit::Hlt);
    }

    #[test]
    fn test_decode_fault_exits() {
        let mut run: kvm_run = unsafe { std::mem::zeroed() };
        run.exit_reason = KVM_EXIT_FAIL_ENTRY;
        unsafe {
            run.__bindgen_anon_1.fail_entry.hardware_entry_failure_reason = 0x21;
        }
        let exit = ExitInfo::new(&region(&run)).unwrap().decode();
        assert_eq!(exit, VcpuExit::FailEntry(0x21));
        assert!(exit.is_fault());

        run.exit_reason = KVM_EXIT_INTERNAL_ERROR;
        unsafe {
            run.__bindgen_anon_1.internal.suberror = 1;
        }
        assert_eq!(
            ExitInfo::new(&region(&run)).unwrap().decode(),
            VcpuExit::InternalError(1)
        );

        run.exit_reason = KVM_EXIT_SHUTDOWN;
        assert!(ExitInfo::new(&region(&run)).unwrap().decode().is_fault());
    }

    #[test]
    fn test_decode_mmio() {
        let mut run: kvm_run = unsafe { std::mem::zeroed() };
        run.exit_reason = KVM_EXIT_MMIO;
        unsafe {
            run.__bindgen_anon_1.mmio.phys_addr = 0xffff_fff0;
        }
        let exit = ExitInfo::new(&region(&run)).unwrap().decode();
        assert_eq!(exit, VcpuExit::Mmio(0xffff_fff0));
        assert!(!exit.is_fault());
    }

    #[test]
    fn test_decode_other_reason() {
        let mut run: kvm_run = unsafe { std::mem::zeroed() };
        run.exit_reason = KVM_EXIT_IRQ_WINDOW_OPEN;
        let exit = ExitInfo::new(&region(&run)).unwrap().decode();
        assert_eq!(exit, VcpuExit::Other(KVM_EXIT_IRQ_WINDOW_OPEN));
        assert_eq!(exit_reason_name(KVM_EXIT_IRQ_WINDOW_OPEN), "IRQ_WINDOW_OPEN");
    }

    #[test]
    fn test_region_too_small() {
        let bytes = [0u8; 16];
        assert!(matches!(
            ExitInfo::new(&bytes),
            Err(KvmError::ExitInfoTooSmall { size: 16 })
        ));
    }
}
