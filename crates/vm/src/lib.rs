//! Wires the bus, MMU and execution engine into a running virtual machine:
//! a shared physical address space, a dedicated execution thread and timer
//! companion per CPU, ELF boot-image loading and NVRAM configuration blobs.

mod cpu;
mod elf_loader;
mod error;
mod nvram;
mod vm;

pub use bus::{AccessKind, Device, DeviceError, DeviceId, RegionFlags, RegionId, RegionKind};
pub use cpu::{Arch, Cpu};
pub use engine::{RunState, Stats};
pub use elf_loader::load_elf;
pub use error::{LoadError, NvramError};
pub use nvram::{extract_config, inject_config};
pub use vm::Vm;
