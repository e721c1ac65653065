//! kvmlite - a minimal KVM control plane.
//!
//! Opens `/dev/kvm`, creates VMs, attaches vCPUs, maps guest physical memory
//! onto host memory and drives the run/exit loop, decoding port I/O exits
//! from each vCPU's shared `kvm_run` region.
//!
//! This crate requires Linux with KVM support. On other platforms it is empty.

#[cfg(target_os = "linux")]
pub mod kvm;
