//! The flat guest-physical address space: memory regions and the
//! memory-mapped device registry, range-dispatched on every access.

mod device;
mod region;

pub use device::{AccessKind, Device, DeviceError, DeviceId, NullDevice};
pub use region::{Region, RegionFlags, RegionId, RegionKind};

use gekko::{AccessSize, PhysAddr, Primitive};
use std::any::Any;

#[derive(Debug, easyerr::Error)]
pub enum BusError {
    #[error("address {addr} is not backed by any region or device")]
    Unmapped { addr: PhysAddr },
    #[error("device {id:?} faulted servicing an access")]
    Device { id: DeviceId, source: DeviceError },
    #[error("region {name:?} at {base}..+{length:#x} overlaps an existing region or device")]
    Overlap {
        name: String,
        base: PhysAddr,
        length: u64,
    },
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Where a guest-physical address resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Region(RegionId, u64),
    Device(DeviceId, u64),
}

struct DeviceSlot {
    id: DeviceId,
    name: String,
    base: PhysAddr,
    length: u64,
    device: Box<dyn Device>,
}

/// The physical bus: owns every memory region and every registered device,
/// and dispatches loads/stores to whichever one covers the address.
pub struct Bus {
    regions: Vec<Region>,
    devices: Vec<DeviceSlot>,
    next_region: u32,
    next_device: u32,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            devices: Vec::new(),
            next_region: 0,
            next_device: 0,
        }
    }

    fn overlaps(&self, base: PhysAddr, length: u64) -> bool {
        let end = base.value() + length;
        let region_hit = self
            .regions
            .iter()
            .any(|r| base.value() < r.base.value() + r.length && r.base.value() < end);
        let device_hit = self
            .devices
            .iter()
            .any(|d| base.value() < d.base.value() + d.length && d.base.value() < end);
        region_hit || device_hit
    }

    /// Registers a backing memory region. Fatal (returns `Err`) if it
    /// overlaps an existing region or device, since that is always a
    /// platform-wiring bug.
    pub fn add_region(
        &mut self,
        name: impl Into<String>,
        base: PhysAddr,
        length: u64,
        kind: RegionKind,
        flags: RegionFlags,
    ) -> Result<RegionId> {
        let name = name.into();
        if self.overlaps(base, length) {
            return Err(BusError::Overlap { name, base, length });
        }

        let id = RegionId(self.next_region);
        self.next_region += 1;

        tracing::debug!(%base, length, ?kind, region = ?id, "registering memory region {name:?}");
        self.regions
            .push(Region::new(id, name, base, length, kind, flags));
        Ok(id)
    }

    /// Registers a device handler. Fatal if it overlaps an existing region
    /// or device.
    pub fn add_device(
        &mut self,
        name: impl Into<String>,
        base: PhysAddr,
        length: u64,
        device: Box<dyn Device>,
    ) -> Result<DeviceId> {
        let name = name.into();
        if self.overlaps(base, length) {
            return Err(BusError::Overlap { name, base, length });
        }

        let id = DeviceId(self.next_device);
        self.next_device += 1;

        tracing::debug!(%base, length, device = ?id, "registering device {name:?}");
        self.devices.push(DeviceSlot {
            id,
            name,
            base,
            length,
            device,
        });
        Ok(id)
    }

    /// Removes a device, invoking its shutdown hook. Devices are shut down
    /// in reverse registration order when the bus itself is dropped.
    pub fn remove_device(&mut self, id: DeviceId) {
        if let Some(idx) = self.devices.iter().position(|d| d.id == id) {
            let mut slot = self.devices.remove(idx);
            slot.device.shutdown();
        }
    }

    pub fn region(&self, id: RegionId) -> &Region {
        &self.regions[id.0 as usize]
    }

    pub fn region_mut(&mut self, id: RegionId) -> &mut Region {
        &mut self.regions[id.0 as usize]
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn lookup(&self, addr: PhysAddr) -> Option<Target> {
        if let Some(region) = self.regions.iter().find(|r| r.contains(addr)) {
            return Some(Target::Region(region.id, addr.value() - region.base.value()));
        }

        if let Some(device) = self.devices.iter().find(|d| {
            addr.value() >= d.base.value() && addr.value() < d.base.value() + d.length
        }) {
            return Some(Target::Device(device.id, addr.value() - device.base.value()));
        }

        None
    }

    /// Reads a big-endian primitive from the bus, dispatching through a
    /// device handler if the address falls in a device's range.
    pub fn read<T: Primitive>(&mut self, addr: PhysAddr, cpu: &mut dyn Any) -> Result<T> {
        let target = self.lookup(addr).ok_or(BusError::Unmapped { addr })?;
        self.read_at(target, cpu)
    }

    /// Writes a big-endian primitive to the bus.
    pub fn write<T: Primitive>(&mut self, addr: PhysAddr, value: T, cpu: &mut dyn Any) -> Result<()> {
        let target = self.lookup(addr).ok_or(BusError::Unmapped { addr })?;
        self.write_at(target, value, cpu)
    }

    /// Reads through an already-resolved [`Target`], skipping the range
    /// dispatch. Used by the MMU's VTLB fast path, which caches the target a
    /// virtual page resolved to on a previous access.
    pub fn read_at<T: Primitive>(&mut self, target: Target, cpu: &mut dyn Any) -> Result<T> {
        match target {
            Target::Region(id, offset) => Ok(self.region(id).read(offset)),
            Target::Device(id, offset) => {
                let size = access_size_of::<T>();
                let mut data = 0u64;
                self.dispatch_device(id, cpu, offset, size, AccessKind::Read, &mut data)?;
                Ok(T::read_be_bytes(&data.to_be_bytes()[8 - size.bytes() as usize..]))
            }
        }
    }

    /// Writes through an already-resolved [`Target`].
    pub fn write_at<T: Primitive>(&mut self, target: Target, value: T, cpu: &mut dyn Any) -> Result<()> {
        match target {
            Target::Region(id, offset) => {
                self.region_mut(id).write(offset, value);
                Ok(())
            }
            Target::Device(id, offset) => {
                let size = access_size_of::<T>();
                let mut bytes = [0u8; 8];
                value.write_be_bytes(&mut bytes[8 - size.bytes() as usize..]);
                let mut data = u64::from_be_bytes(bytes);
                self.dispatch_device(id, cpu, offset, size, AccessKind::Write, &mut data)
            }
        }
    }

    /// Bulk copy between two guest-physical ranges, used by DMA-style
    /// devices. Takes a direct byte-slice path when both ends land in plain
    /// memory regions; falls back to a byte-by-byte copy through
    /// `read`/`write` whenever either endpoint touches a device, so device
    /// side effects are still observed in address order.
    pub fn copy(&mut self, src: PhysAddr, dst: PhysAddr, length: u64, cpu: &mut dyn Any) -> Result<()> {
        let src_region = match self.lookup(src) {
            Some(Target::Region(id, offset)) => Some((id, offset)),
            _ => None,
        };
        let dst_region = match self.lookup(dst) {
            Some(Target::Region(id, offset)) => Some((id, offset)),
            _ => None,
        };

        match (src_region, dst_region) {
            (Some((src_id, src_off)), Some((dst_id, dst_off))) => {
                let length = length as usize;
                let src_off = src_off as usize;
                let dst_off = dst_off as usize;
                if src_id == dst_id {
                    let region = self.region_mut(src_id);
                    if region.kind != RegionKind::Rom {
                        region.bytes_mut().copy_within(src_off..src_off + length, dst_off);
                    }
                } else {
                    let (src_region, dst_region) = self.two_regions_mut(src_id, dst_id);
                    if dst_region.kind != RegionKind::Rom {
                        let chunk = src_region.bytes()[src_off..src_off + length].to_vec();
                        dst_region.bytes_mut()[dst_off..dst_off + length].copy_from_slice(&chunk);
                    }
                }
            }
            _ => {
                for i in 0..length {
                    let byte: u8 = self.read(src + i, cpu)?;
                    self.write(dst + i, byte, cpu)?;
                }
            }
        }

        Ok(())
    }

    /// Borrows two distinct regions simultaneously, one read-only and one
    /// mutable, for the plain-memory fast path in [`Self::copy`].
    fn two_regions_mut(&mut self, a: RegionId, b: RegionId) -> (&Region, &mut Region) {
        debug_assert_ne!(a, b);
        let (ai, bi) = (a.0 as usize, b.0 as usize);
        if ai < bi {
            let (left, right) = self.regions.split_at_mut(bi);
            (&left[ai], &mut right[0])
        } else {
            let (left, right) = self.regions.split_at_mut(ai);
            (&right[0], &mut left[bi])
        }
    }

    /// Invokes a device's handler, temporarily taking the device out of the
    /// registry so the handler may recursively call back into the bus (a
    /// DMA controller copying into RAM, for instance) without aliasing.
    fn dispatch_device(
        &mut self,
        id: DeviceId,
        cpu: &mut dyn Any,
        offset: u64,
        size: AccessSize,
        kind: AccessKind,
        data: &mut u64,
    ) -> Result<()> {
        let idx = self
            .devices
            .iter()
            .position(|d| d.id == id)
            .expect("device id came from a successful lookup on self");

        let mut device = std::mem::replace(&mut self.devices[idx].device, Box::new(NullDevice));
        let result = device.access(self, cpu, offset, size, kind, data);
        self.devices[idx].device = device;

        result.map_err(|source| BusError::Device { id, source })
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        while let Some(mut slot) = self.devices.pop() {
            slot.device.shutdown();
        }
    }
}

fn access_size_of<T>() -> AccessSize {
    match size_of::<T>() {
        1 => AccessSize::Byte,
        2 => AccessSize::Half,
        4 => AccessSize::Word,
        8 => AccessSize::Double,
        _ => unreachable!("Primitive is only implemented for 1/2/4/8-byte types"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scratch;

    struct CountingDevice {
        reads: u32,
        writes: u32,
        last_write: u32,
    }

    impl Device for CountingDevice {
        fn name(&self) -> &str {
            "counting"
        }

        fn access(
            &mut self,
            _bus: &mut Bus,
            _cpu: &mut dyn Any,
            offset: u64,
            _size: AccessSize,
            kind: AccessKind,
            data: &mut u64,
        ) -> std::result::Result<(), DeviceError> {
            if offset >= 4 {
                return Err(DeviceError::UnknownOffset { offset });
            }
            match kind {
                AccessKind::Read => {
                    self.reads += 1;
                    *data = 0x2A;
                }
                AccessKind::Write => {
                    self.writes += 1;
                    self.last_write = *data as u32;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn ram_round_trips_a_big_endian_word() {
        let mut bus = Bus::new();
        bus.add_region("ram", PhysAddr::from(0u32), 0x1000, RegionKind::Ram, RegionFlags::default())
            .unwrap();

        let mut cpu = Scratch;
        bus.write::<u32>(PhysAddr::from(0x10u32), 0xDEAD_BEEF, &mut cpu).unwrap();
        let value: u32 = bus.read(PhysAddr::from(0x10u32), &mut cpu).unwrap();
        assert_eq!(value, 0xDEAD_BEEF);

        // Big-endian on the wire: the high byte lands at the lowest address.
        let region = bus.region(RegionId(0));
        assert_eq!(&region.bytes()[0x10..0x14], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn rom_writes_are_silently_dropped() {
        let mut bus = Bus::new();
        bus.add_region("rom", PhysAddr::from(0u32), 0x1000, RegionKind::Rom, RegionFlags::default())
            .unwrap();

        let mut cpu = Scratch;
        bus.write::<u32>(PhysAddr::from(0x4u32), 0x1111_2222, &mut cpu).unwrap();
        let value: u32 = bus.read(PhysAddr::from(0x4u32), &mut cpu).unwrap();
        assert_eq!(value, 0);
    }

    #[test]
    fn unmapped_address_is_an_error() {
        let mut bus = Bus::new();
        let mut cpu = Scratch;
        let err = bus.read::<u32>(PhysAddr::from(0x1000u32), &mut cpu).unwrap_err();
        assert!(matches!(err, BusError::Unmapped { .. }));
    }

    #[test]
    fn overlapping_region_registration_is_rejected() {
        let mut bus = Bus::new();
        bus.add_region("a", PhysAddr::from(0u32), 0x1000, RegionKind::Ram, RegionFlags::default())
            .unwrap();
        let err = bus
            .add_region("b", PhysAddr::from(0x800u32), 0x1000, RegionKind::Ram, RegionFlags::default())
            .unwrap_err();
        assert!(matches!(err, BusError::Overlap { .. }));
    }

    #[test]
    fn device_access_is_dispatched_by_range() {
        let mut bus = Bus::new();
        let device = CountingDevice { reads: 0, writes: 0, last_write: 0 };
        bus.add_device("counter", PhysAddr::from(0x1000u32), 0x10, Box::new(device)).unwrap();

        let mut cpu = Scratch;
        bus.write::<u32>(PhysAddr::from(0x1000u32), 7, &mut cpu).unwrap();
        let value: u32 = bus.read(PhysAddr::from(0x1000u32), &mut cpu).unwrap();
        assert_eq!(value, 0x2A);
    }

    #[test]
    fn device_unknown_offset_surfaces_as_bus_error() {
        let mut bus = Bus::new();
        let device = CountingDevice { reads: 0, writes: 0, last_write: 0 };
        let id = bus.add_device("counter", PhysAddr::from(0x1000u32), 0x10, Box::new(device)).unwrap();

        let mut cpu = Scratch;
        let err = bus.read::<u32>(PhysAddr::from(0x1008u32), &mut cpu).unwrap_err();
        assert!(matches!(err, BusError::Device { id: got, .. } if got == id));
    }

    #[test]
    fn copy_moves_bytes_between_regions_in_order() {
        let mut bus = Bus::new();
        bus.add_region("ram", PhysAddr::from(0u32), 0x100, RegionKind::Ram, RegionFlags::default())
            .unwrap();

        let mut cpu = Scratch;
        for (i, byte) in [1u8, 2, 3, 4].into_iter().enumerate() {
            bus.write::<u8>(PhysAddr::from(i as u32), byte, &mut cpu).unwrap();
        }
        bus.copy(PhysAddr::from(0u32), PhysAddr::from(0x10u32), 4, &mut cpu).unwrap();

        let region = bus.region(RegionId(0));
        assert_eq!(&region.bytes()[0x10..0x14], &[1, 2, 3, 4]);
    }
}
