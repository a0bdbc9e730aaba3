mod config;

use clap::Parser;
use config::Config;
use gekko::{Address, PhysAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use vm::{Arch, Cpu, RunState, Vm};

/// Conventional physical layout for a platform with no device-specific
/// memory map of its own: RAM from zero, NVRAM just under the top of the
/// address space, ROM at the reset vector a `MSR[IP]`-prefixed fetch lands
/// on.
const RAM_BASE: u32 = 0x0000_0000;
const NVRAM_BASE: u32 = 0x1FE0_0000;
const ROM_BASE: u32 = 0xFFF0_0000;
const NVRAM_ROM_SPACE: u32 = 0;

fn parse_hex(text: &str) -> Result<u32, String> {
    let trimmed = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
    u32::from_str_radix(trimmed, 16).map_err(|err| err.to_string())
}

/// Boots a single-CPU PowerPC-32 virtual machine from an ELF image.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct CliArgs {
    /// ELF32 PowerPC image to load and execute.
    boot_elf: PathBuf,

    /// RAM size, in megabytes.
    #[arg(long, default_value_t = 64)]
    ram_mb: u32,

    /// NVRAM size, in kilobytes.
    #[arg(long, default_value_t = 224)]
    nvram_kb: u32,

    /// ROM window size, in megabytes.
    #[arg(long, default_value_t = 4)]
    rom_mb: u32,

    /// Address the idle loop spins on; once execution sits there long
    /// enough the CPU thread sleeps between steps instead of busy-polling.
    #[arg(long, value_parser = parse_hex)]
    idle_pc: Option<u32>,

    /// Frequency, in Hz, the companion timer thread raises the external
    /// interrupt at.
    #[arg(long, default_value_t = 250)]
    timer_hz: u32,

    /// Enables the just-in-time compiler. Accepted for compatibility;
    /// this implementation always interprets.
    #[allow(dead_code)]
    #[arg(long, default_value_t = false)]
    jit: bool,

    /// Router configuration register, written into NVRAM alongside the
    /// boot configuration.
    #[arg(long, value_parser = parse_hex, default_value = "0x2102")]
    config_register: u32,

    /// Overrides the boot ROM image (defaults to a blank ROM window).
    #[arg(long)]
    rom: Option<PathBuf>,
}

fn setup_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cli=info,vm=info,engine=info,mmu=info,bus=info"));

    tracing_subscriber::registry().with(fmt::layer()).with(env_filter).init();
}

fn run(args: CliArgs) -> Result<(), String> {
    let config = Config::from(&args);
    tracing::info!(?config, "effective configuration");

    let vm = Vm::new("generic-ppc32");

    let ram_len = config.ram_mb as u64 * bytesize::MIB;
    let nvram_len = config.nvram_kb as u64 * bytesize::KIB;
    let rom_len = config.rom_mb as u64 * bytesize::MIB;
    tracing::info!(
        ram = %bytesize::ByteSize(ram_len),
        nvram = %bytesize::ByteSize(nvram_len),
        rom = %bytesize::ByteSize(rom_len),
        "sizing memory map"
    );

    vm.add_ram("ram", PhysAddr::from(RAM_BASE), ram_len).map_err(|err| err.to_string())?;
    vm.add_nvram("nvram", PhysAddr::from(NVRAM_BASE), nvram_len).map_err(|err| err.to_string())?;
    vm.add_rom("rom", PhysAddr::from(ROM_BASE), rom_len).map_err(|err| err.to_string())?;

    if let Some(rom_path) = &config.rom_override {
        let bytes = std::fs::read(rom_path).map_err(|err| format!("reading {rom_path:?}: {err}"))?;
        vm.load_bytes(PhysAddr::from(ROM_BASE), &bytes).map_err(|err| err.to_string())?;
    }

    let entry = ::vm::load_elf(&vm, &config.boot_elf).map_err(|err| err.to_string())?;
    tracing::info!(entry = %format!("{entry:#010x}"), "loaded boot image");

    let nvram_config = format!("! config-register 0x{:x}\n", config.config_register);
    ::vm::inject_config(&vm, PhysAddr::from(NVRAM_BASE), NVRAM_ROM_SPACE, nvram_config.as_bytes())
        .map_err(|err| err.to_string())?;

    let mut cpu = Cpu::new(&vm, Arch::PowerPc32, 0);
    cpu.set_pc(Address(entry));
    if let Some(idle_pc) = config.idle_pc {
        cpu.set_idle_pc(Some(Address(idle_pc)));
    }
    cpu.set_timer_frequency(config.timer_hz);

    cpu.start();
    loop {
        std::thread::sleep(Duration::from_millis(50));
        if cpu.run_state() == RunState::Halted {
            break;
        }
        if let Some(bp) = cpu.breakpoint_hit() {
            tracing::info!(pc = %bp, "breakpoint hit, stopping");
            break;
        }
    }
    cpu.stop();

    let stats = cpu.stats();
    tracing::info!(
        instructions = stats.instructions,
        external_irqs = stats.external_irqs,
        timer_irqs = stats.timer_irqs,
        "cpu stopped"
    );

    Ok(())
}

fn main() -> ExitCode {
    setup_tracing();
    let args = CliArgs::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            tracing::error!("{message}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_accepts_an_0x_prefix() {
        assert_eq!(parse_hex("0x2102"), Ok(0x2102));
        assert_eq!(parse_hex("2102"), Ok(0x2102));
        assert_eq!(parse_hex("0XFF"), Ok(0xFF));
    }

    #[test]
    fn parse_hex_rejects_garbage() {
        assert!(parse_hex("not-hex").is_err());
    }

    #[test]
    fn defaults_match_the_documented_cli_surface() {
        let args = CliArgs::parse_from(["dynarpc", "image.elf"]);
        assert_eq!(args.ram_mb, 64);
        assert_eq!(args.nvram_kb, 224);
        assert_eq!(args.rom_mb, 4);
        assert_eq!(args.timer_hz, 250);
        assert_eq!(args.config_register, 0x2102);
        assert_eq!(args.idle_pc, None);
        assert!(!args.jit);
    }

    #[test]
    fn idle_pc_is_parsed_as_hex() {
        let args = CliArgs::parse_from(["dynarpc", "image.elf", "--idle-pc", "0x80001234"]);
        assert_eq!(args.idle_pc, Some(0x8000_1234));
    }

    #[test]
    fn config_carries_fields_from_args() {
        let args = CliArgs::parse_from(["dynarpc", "image.elf", "--ram-mb", "128"]);
        let config = Config::from(&args);
        assert_eq!(config.ram_mb, 128);
        assert_eq!(config.boot_elf, PathBuf::from("image.elf"));
    }
}
