//! The effective machine configuration, derived from [`crate::CliArgs`].
//! Kept as its own `serde`-derived type (rather than using the `clap`
//! struct directly) so it can be logged or persisted independently of how
//! it was supplied.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub ram_mb: u32,
    pub nvram_kb: u32,
    pub rom_mb: u32,
    pub idle_pc: Option<u32>,
    pub timer_hz: u32,
    pub config_register: u32,
    pub boot_elf: PathBuf,
    pub rom_override: Option<PathBuf>,
}

impl From<&crate::CliArgs> for Config {
    fn from(args: &crate::CliArgs) -> Self {
        Self {
            ram_mb: args.ram_mb,
            nvram_kb: args.nvram_kb,
            rom_mb: args.rom_mb,
            idle_pc: args.idle_pc,
            timer_hz: args.timer_hz,
            config_register: args.config_register,
            boot_elf: args.boot_elf.clone(),
            rom_override: args.rom.clone(),
        }
    }
}
