//! Loads a PowerPC ELF32 executable's `PT_LOAD` segments directly into
//! guest-physical memory, the way a real router's boot ROM would hand a
//! decompressed IOS image to the core.

use crate::{LoadError, Vm};
use elf::{ElfBytes, abi::PT_LOAD, endian::AnyEndian};
use gekko::PhysAddr;
use std::path::Path;

/// Copies every loadable segment of the ELF image at `path` into the VM's
/// physical memory at its program-header-specified address, zero-filling
/// any `.bss`-style tail beyond the file's own bytes. Returns the entry
/// point from the ELF header.
pub fn load_elf(vm: &Vm, path: &Path) -> Result<u32, LoadError> {
    let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_owned(),
        source,
    })?;

    let image = ElfBytes::<AnyEndian>::minimal_parse(&bytes).map_err(|err| LoadError::Malformed {
        path: path.to_owned(),
        message: err.to_string(),
    })?;

    let segments = image.segments().ok_or_else(|| LoadError::Malformed {
        path: path.to_owned(),
        message: "no program headers".to_owned(),
    })?;

    for phdr in segments.iter().filter(|p| p.p_type == PT_LOAD) {
        let file_start = phdr.p_offset as usize;
        let file_end = file_start + phdr.p_filesz as usize;
        let file_bytes = bytes.get(file_start..file_end).ok_or_else(|| LoadError::Malformed {
            path: path.to_owned(),
            message: format!("segment file range {file_start:#x}..{file_end:#x} out of bounds"),
        })?;

        tracing::debug!(
            paddr = phdr.p_paddr,
            filesz = phdr.p_filesz,
            memsz = phdr.p_memsz,
            "loading PT_LOAD segment"
        );
        vm.load_bytes(PhysAddr::from(phdr.p_paddr as u32), file_bytes)?;

        let bss_len = (phdr.p_memsz - phdr.p_filesz) as usize;
        if bss_len > 0 {
            let bss_base = phdr.p_paddr + phdr.p_filesz;
            vm.load_bytes(PhysAddr::from(bss_base as u32), &vec![0u8; bss_len])?;
        }
    }

    Ok(image.ehdr.e_entry as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assembles a minimal big-endian ELF32/PowerPC image with one
    /// `PT_LOAD` segment whose memory size exceeds its file size, so the
    /// loader's bss zero-fill path is exercised too.
    fn write_test_elf(path: &Path, payload: &[u8], vaddr: u32, memsz: u32, entry: u32) {
        let ehdr_size = 52u32;
        let phdr_size = 32u32;
        let data_offset = ehdr_size + phdr_size;

        let mut bytes = Vec::new();
        // e_ident
        bytes.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 2, 1, 0]);
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.extend_from_slice(&2u16.to_be_bytes()); // e_type = ET_EXEC
        bytes.extend_from_slice(&20u16.to_be_bytes()); // e_machine = EM_PPC
        bytes.extend_from_slice(&1u32.to_be_bytes()); // e_version
        bytes.extend_from_slice(&entry.to_be_bytes()); // e_entry
        bytes.extend_from_slice(&ehdr_size.to_be_bytes()); // e_phoff
        bytes.extend_from_slice(&0u32.to_be_bytes()); // e_shoff
        bytes.extend_from_slice(&0u32.to_be_bytes()); // e_flags
        bytes.extend_from_slice(&(ehdr_size as u16).to_be_bytes()); // e_ehsize
        bytes.extend_from_slice(&(phdr_size as u16).to_be_bytes()); // e_phentsize
        bytes.extend_from_slice(&1u16.to_be_bytes()); // e_phnum
        bytes.extend_from_slice(&0u16.to_be_bytes()); // e_shentsize
        bytes.extend_from_slice(&0u16.to_be_bytes()); // e_shnum
        bytes.extend_from_slice(&0u16.to_be_bytes()); // e_shstrndx
        assert_eq!(bytes.len(), ehdr_size as usize);

        // Elf32_Phdr
        bytes.extend_from_slice(&1u32.to_be_bytes()); // p_type = PT_LOAD
        bytes.extend_from_slice(&data_offset.to_be_bytes()); // p_offset
        bytes.extend_from_slice(&vaddr.to_be_bytes()); // p_vaddr
        bytes.extend_from_slice(&vaddr.to_be_bytes()); // p_paddr
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes()); // p_filesz
        bytes.extend_from_slice(&memsz.to_be_bytes()); // p_memsz
        bytes.extend_from_slice(&7u32.to_be_bytes()); // p_flags = RWX
        bytes.extend_from_slice(&4u32.to_be_bytes()); // p_align
        assert_eq!(bytes.len(), data_offset as usize);

        bytes.extend_from_slice(payload);
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn load_elf_copies_segment_bytes_and_zero_fills_bss() {
        let vm = Vm::new("test");
        let region = vm.add_ram("ram", PhysAddr::from(0u32), 0x10000).unwrap();

        let path = std::env::temp_dir().join(format!("vm-elf-loader-test-{:x}.elf", std::process::id()));
        write_test_elf(&path, &[0xDE, 0xAD, 0xBE, 0xEF], 0x1000, 8, 0x1000);

        let entry = load_elf(&vm, &path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(entry, 0x1000);

        let bus = vm.bus().lock();
        let bytes = bus.region(region).bytes();
        assert_eq!(&bytes[0x1000..0x1004], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&bytes[0x1004..0x1008], &[0, 0, 0, 0]);
    }

    #[test]
    fn load_elf_reports_a_missing_file() {
        let vm = Vm::new("test");
        vm.add_ram("ram", PhysAddr::from(0u32), 0x1000).unwrap();
        let err = load_elf(&vm, Path::new("/nonexistent/path/to.elf")).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
