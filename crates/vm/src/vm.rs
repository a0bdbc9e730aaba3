use crate::LoadError;
use bus::{Bus, Device, DeviceId, RegionFlags, RegionId, RegionKind, Target};
use gekko::PhysAddr;
use parking_lot::Mutex;
use std::sync::Arc;

/// Owns the physical bus shared by every CPU in the machine: memory
/// regions, device registrations, and the single lock every device
/// handler and cross-thread mutator acquires.
///
/// Cheap to clone; every [`Cpu`](crate::Cpu) keeps its own handle.
#[derive(Clone)]
pub struct Vm {
    platform: Arc<str>,
    bus: Arc<Mutex<Bus>>,
}

impl Vm {
    pub fn new(platform_tag: impl Into<Arc<str>>) -> Self {
        let platform = platform_tag.into();
        tracing::info!(platform = %platform, "bringing up virtual machine");
        Self {
            platform,
            bus: Arc::new(Mutex::new(Bus::new())),
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub(crate) fn bus(&self) -> &Arc<Mutex<Bus>> {
        &self.bus
    }

    pub fn add_ram(&self, name: impl Into<String>, base: PhysAddr, length: u64) -> bus::Result<RegionId> {
        self.bus
            .lock()
            .add_region(name, base, length, RegionKind::Ram, RegionFlags { cacheable: true })
    }

    pub fn add_rom(&self, name: impl Into<String>, base: PhysAddr, length: u64) -> bus::Result<RegionId> {
        self.bus
            .lock()
            .add_region(name, base, length, RegionKind::Rom, RegionFlags { cacheable: true })
    }

    pub fn add_nvram(&self, name: impl Into<String>, base: PhysAddr, length: u64) -> bus::Result<RegionId> {
        self.bus
            .lock()
            .add_region(name, base, length, RegionKind::Nvram, RegionFlags { cacheable: false })
    }

    pub fn add_device(
        &self,
        name: impl Into<String>,
        base: PhysAddr,
        length: u64,
        device: Box<dyn Device>,
    ) -> bus::Result<DeviceId> {
        self.bus.lock().add_device(name, base, length, device)
    }

    pub fn remove_device(&self, id: DeviceId) {
        self.bus.lock().remove_device(id);
    }

    /// Copies `bytes` into the region backing `base`, for ROM images and
    /// other bulk loads that happen before any CPU starts running.
    pub fn load_bytes(&self, base: PhysAddr, bytes: &[u8]) -> Result<(), LoadError> {
        let mut bus = self.bus.lock();
        let Some(Target::Region(id, offset)) = bus.lookup(base) else {
            return Err(LoadError::Unmapped {
                paddr: base.value() as u32,
                length: bytes.len() as u64,
            });
        };

        let region = bus.region_mut(id);
        let dest = region.bytes_mut();
        let offset = offset as usize;
        if offset + bytes.len() > dest.len() {
            return Err(LoadError::Unmapped {
                paddr: base.value() as u32,
                length: bytes.len() as u64,
            });
        }

        dest[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_bytes_writes_into_the_owning_region() {
        let vm = Vm::new("test");
        vm.add_ram("ram", PhysAddr::from(0x1000u32), 0x1000).unwrap();

        vm.load_bytes(PhysAddr::from(0x1004u32), &[1, 2, 3, 4]).unwrap();

        let bus = vm.bus().lock();
        let region = bus.regions().first().unwrap();
        assert_eq!(&region.bytes()[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn load_bytes_into_an_unmapped_address_is_an_error() {
        let vm = Vm::new("test");
        let err = vm.load_bytes(PhysAddr::from(0u32), &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, LoadError::Unmapped { .. }));
    }

    #[test]
    fn load_bytes_past_the_region_end_is_an_error() {
        let vm = Vm::new("test");
        vm.add_ram("ram", PhysAddr::from(0u32), 0x10).unwrap();
        let err = vm.load_bytes(PhysAddr::from(0xCu32), &[1, 2, 3, 4, 5, 6]).unwrap_err();
        assert!(matches!(err, LoadError::Unmapped { .. }));
    }

    #[test]
    fn adding_an_overlapping_region_fails() {
        let vm = Vm::new("test");
        vm.add_ram("ram", PhysAddr::from(0u32), 0x1000).unwrap();
        let err = vm.add_rom("rom", PhysAddr::from(0x800u32), 0x1000).unwrap_err();
        assert!(matches!(err, bus::BusError::Overlap { .. }));
    }
}
