//! The opened `/dev/kvm` device.
//!
//! A [`Facility`] is constructed once by the caller and passed by reference to
//! everything that needs it. It records the two values the rest of the crate
//! depends on: the KVM API version and the size of the per-vCPU `kvm_run`
//! mapping.

use super::{KvmError, Vm};
use kvm_ioctls::Kvm;
use std::os::unix::io::AsRawFd;
use tracing::{info, warn};

/// The only KVM API version the kernel has ever shipped (stable ABI).
pub const KVM_API_VERSION: i32 = 12;

/// Handle to the KVM device.
///
/// Dropping the facility closes `/dev/kvm`. VMs borrow the facility, so they
/// are always dropped first.
pub struct Facility {
    kvm: Kvm,
    api_version: i32,
    run_size: usize,
}

impl Facility {
    /// Open `/dev/kvm` and query the API version and vCPU mmap size.
    ///
    /// # Errors
    ///
    /// - [`KvmError::FacilityUnavailable`] if the device cannot be opened
    /// - [`KvmError::ProtocolQuery`] if the version query fails or reports
    ///   something other than [`KVM_API_VERSION`]
    /// - [`KvmError::MappingSizeQuery`] if the mmap size query fails
    pub fn open() -> Result<Self, KvmError> {
        let kvm = Kvm::new().map_err(KvmError::FacilityUnavailable)?;

        let api_version = kvm.get_api_version();
        if api_version < 0 {
            return Err(KvmError::ProtocolQuery(kvm_ioctls::Error::last()));
        }
        if api_version != KVM_API_VERSION {
            warn!(
                "Unsupported KVM API version {} (expected {})",
                api_version, KVM_API_VERSION
            );
            return Err(KvmError::ProtocolQuery(kvm_ioctls::Error::new(
                libc::EPROTONOSUPPORT,
            )));
        }

        let run_size = kvm
            .get_vcpu_mmap_size()
            .map_err(KvmError::MappingSizeQuery)?;

        info!(
            "KVM opened: fd={}, api_version={}, run_size={}",
            kvm.as_raw_fd(),
            api_version,
            run_size
        );

        Ok(Self {
            kvm,
            api_version,
            run_size,
        })
    }

    /// KVM API version reported by the kernel.
    pub fn api_version(&self) -> i32 {
        self.api_version
    }

    /// Size in bytes of each vCPU's shared `kvm_run` mapping.
    pub fn run_size(&self) -> usize {
        self.run_size
    }

    /// Create a new, empty virtual machine.
    ///
    /// The VM starts with no vCPUs and no memory slots.
    pub fn create_vm(&self) -> Result<Vm<'_>, KvmError> {
        let fd = self.kvm.create_vm().map_err(KvmError::CreateVm)?;
        info!("Created VM: fd={}", fd.as_raw_fd());
        Ok(Vm::new(self, fd))
    }
}
