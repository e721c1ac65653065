//! kvmlite runner - load a raw guest binary and report its port I/O.
//!
//! This runner requires Linux with KVM support. It will not run on other platforms.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kvmlite")]
#[command(about = "Run a raw real-mode guest binary and report its port I/O")]
struct Args {
    /// Path to the raw guest binary
    guest: PathBuf,

    /// Guest physical address to load the binary at
    #[arg(short, long, default_value = "0xffff0", value_parser = parse_u64)]
    load_addr: u64,

    /// Entry point (defaults to the load address)
    #[arg(short, long, value_parser = parse_u64)]
    entry: Option<u64>,

    /// Guest memory slot as ADDR:LEN (repeatable)
    #[arg(
        short,
        long = "slot",
        value_parser = parse_slot,
        default_values = ["0x0:0x1000", "0xff000:0x1000"]
    )]
    slots: Vec<(u64, u64)>,

    /// Stop after this many vCPU exits
    #[arg(long)]
    max_exits: Option<u64>,
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn parse_slot(s: &str) -> Result<(u64, u64), String> {
    let (addr, len) = s
        .split_once(':')
        .ok_or_else(|| format!("expected ADDR:LEN, got {s:?}"))?;
    Ok((parse_u64(addr)?, parse_u64(len)?))
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use kvmlite::kvm::{exit_reason_name, Facility, IoDirection, VcpuExit};
    use tracing::{info, warn};

    let guest = std::fs::read(&args.guest)?;
    info!("Guest: {} ({} bytes)", args.guest.display(), guest.len());

    let facility = Facility::open()?;
    let mut vm = facility.create_vm()?;
    let cpu = vm.create_vcpu()?;

    for &(addr, len) in &args.slots {
        let slot = vm.register_memory(addr, len)?;
        info!("Slot {}: {:#x}+{:#x}", slot, addr, len);
    }

    vm.load_content(args.load_addr, &guest)?;
    let entry = args.entry.unwrap_or(args.load_addr);
    vm.vcpu(cpu)?.set_real_mode_entry(entry)?;
    info!("Starting vCPU {} at {:#x}", cpu, entry);

    let mut exits = 0u64;
    loop {
        let exit = vm.run_once(cpu)?;
        exits += 1;

        match exit {
            VcpuExit::Io(io) => {
                let vcpu = vm.vcpu_mut(cpu)?;
                match io.direction {
                    IoDirection::Out => {
                        info!(
                            "Exit IO, port: {:#x} data: {:#x}",
                            vcpu.io_port(),
                            vcpu.io_data()?
                        );
                    }
                    IoDirection::In => {
                        // No devices: every port reads as all ones.
                        vcpu.set_io_data(u32::MAX)?;
                        info!("Exit IO, port: {:#x} (in, size {})", io.port, io.size);
                    }
                }
            }
            VcpuExit::Hlt => {
                info!("Guest halted after {} exits", exits);
                break;
            }
            other => {
                let reason = vm.vcpu(cpu)?.exit_info().reason();
                warn!(
                    "Guest stopped after {} exits: {} ({:?})",
                    exits,
                    exit_reason_name(reason),
                    other
                );
                if let Ok(regs) = vm.vcpu(cpu)?.get_regs() {
                    info!("Final RIP: {:#x}", regs.rip);
                }
                break;
            }
        }

        if args.max_exits.is_some_and(|max| exits >= max) {
            info!("Stopping after {} exits", exits);
            break;
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("kvmlite requires Linux with KVM support. This platform is not supported.".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64("0xffff0"), Ok(0xffff0));
        assert_eq!(parse_u64("4096"), Ok(4096));
        assert!(parse_u64("0xzz").is_err());
    }

    #[test]
    fn test_parse_slot() {
        assert_eq!(parse_slot("0xff000:0x1000"), Ok((0xff000, 0x1000)));
        assert!(parse_slot("0xff000").is_err());
    }

    #[test]
    fn test_default_layout() {
        let args = Args::try_parse_from(["kvmlite", "guest.bin"]).unwrap();
        assert_eq!(args.load_addr, 0xffff0);
        assert_eq!(args.entry, None);
        assert_eq!(args.slots, vec![(0x0, 0x1000), (0xff000, 0x1000)]);
    }

    #[test]
    fn test_slot_override() {
        let args =
            Args::try_parse_from(["kvmlite", "guest.bin", "-s", "0x0:0x2000", "-l", "0x100"])
                .unwrap();
        assert_eq!(args.slots, vec![(0x0, 0x2000)]);
        assert_eq!(args.load_addr, 0x100);
    }
}
