use std::path::PathBuf;

/// Configuration-time failures: malformed boot images or a platform that
/// wired a load at an address with no backing region. Never surfaced once
/// a CPU has started running.
#[derive(Debug, easyerr::Error)]
pub enum LoadError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path:?} is not a loadable ELF32 PowerPC image: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("a {length:#x}-byte segment at guest-physical {paddr:#010x} has no backing region")]
    Unmapped { paddr: u32, length: u64 },
}

/// Failures decoding or rebuilding an NVRAM configuration blob.
#[derive(Debug, easyerr::Error)]
pub enum NvramError {
    #[error("nvram region is too small to hold a configuration header")]
    TooSmall,
    #[error("bad IOS magic numbers ({first:#06x}, {second:#06x})")]
    BadMagic { first: u16, second: u16 },
    #[error("nvram checksum mismatch: header says {expected:#06x}, computed {actual:#06x}")]
    BadChecksum { expected: u16, actual: u16 },
    #[error("stored configuration ({stored} bytes) does not fit in the nvram region")]
    ConfigTooLarge { stored: usize },
}
