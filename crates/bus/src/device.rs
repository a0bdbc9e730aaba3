use crate::Bus;
use gekko::AccessSize;
use std::any::Any;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Debug, easyerr::Error)]
pub enum DeviceError {
    #[error("offset {offset:#x} is not a recognized register on this device")]
    UnknownOffset { offset: u64 },
    #[error("device-specific failure: {message}")]
    Failed { message: String },
}

/// A memory-mapped device. `access` is called with the data slot holding the
/// value to write (on a write) or the slot to fill (on a read); an unknown
/// offset on read MAY leave the slot zeroed rather than returning an error —
/// only a genuinely broken device should surface [`DeviceError`].
pub trait Device: Send {
    fn name(&self) -> &str;

    fn access(
        &mut self,
        bus: &mut Bus,
        cpu: &mut dyn Any,
        offset: u64,
        size: AccessSize,
        kind: AccessKind,
        data: &mut u64,
    ) -> Result<(), DeviceError>;

    /// Invoked once at VM teardown, in reverse registration order.
    fn shutdown(&mut self) {}
}

/// Placeholder used to temporarily vacate a device's slot in the registry
/// while its real handler is invoked re-entrantly; never observes a real
/// access.
pub struct NullDevice;

impl Device for NullDevice {
    fn name(&self) -> &str {
        "null"
    }

    fn access(
        &mut self,
        _bus: &mut Bus,
        _cpu: &mut dyn Any,
        _offset: u64,
        _size: AccessSize,
        _kind: AccessKind,
        _data: &mut u64,
    ) -> Result<(), DeviceError> {
        Ok(())
    }
}
