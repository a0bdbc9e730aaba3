//! Virtual-to-physical address translation: BAT lookup, the segmented
//! hashed page-table walk, and the software VTLB cache that short-circuits
//! both on the next access to the same page.

mod vtlb;

pub use vtlb::{Vtlb, VtlbEntry};

use bus::{Bus, Target};
use gekko::{
    Address, PhysAddr,
    regs::{DSISR_NOT_FOUND, DSISR_PROTECTION, DSISR_STORE, MemoryManagement, Pte},
};

/// Why the access is being made. Selects the BAT array consulted (fetches
/// use the IBATs, loads and stores the DBATs) and which direction of
/// page-protection is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Fetch,
    Load,
    Store,
}

#[derive(Debug, easyerr::Error)]
pub enum MmuError {
    #[error("no valid translation for {addr} ({access:?})")]
    NotFound { addr: Address, access: Access },
    #[error("translation for {addr} forbids this access ({access:?})")]
    Protection { addr: Address, access: Access },
}

impl MmuError {
    pub fn addr(&self) -> Address {
        match *self {
            Self::NotFound { addr, .. } | Self::Protection { addr, .. } => addr,
        }
    }

    /// The DSISR bits (or the equivalent SRR1 bits, for an instruction
    /// fetch) a caller should latch alongside this fault.
    pub fn status_bits(&self) -> u32 {
        let (base, access) = match *self {
            Self::NotFound { access, .. } => (DSISR_NOT_FOUND, access),
            Self::Protection { access, .. } => (DSISR_PROTECTION, access),
        };
        if access == Access::Store { base | DSISR_STORE } else { base }
    }
}

pub type Result<T> = std::result::Result<T, MmuError>;

const PAGE_SHIFT: u32 = 12;
const PAGE_MASK: u32 = (1 << PAGE_SHIFT) - 1;
const PTE_SIZE: u64 = 8;
const PTES_PER_GROUP: u32 = 8;

/// Per-CPU translation state. The architectural BAT/segment/SDR1 registers
/// live in [`gekko::regs::MemoryManagement`] and are borrowed for each call;
/// this type owns only the VTLB.
#[derive(Default)]
pub struct Mmu {
    vtlb: Vtlb,
}

impl Mmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must run after any write to SDR1, a segment register, a BAT, or an
    /// MSR bit affecting translation or privilege, and after `tlbie`/`tlbia`.
    pub fn invalidate_all(&mut self) {
        tracing::trace!("invalidating VTLB");
        self.vtlb.invalidate_all();
    }

    /// Must run when a region is unmapped from the bus, so no cached target
    /// outlives it.
    pub fn invalidate_region(&mut self, region: bus::RegionId) {
        self.vtlb.invalidate_region(region);
    }

    /// Translates a virtual address for `access`, consulting the VTLB, then
    /// the BAT array, then the segmented hashed page table. `user` reflects
    /// `MSR[PR]`; `translation_enabled` reflects `MSR[IR]` for a fetch or
    /// `MSR[DR]` for a load/store.
    ///
    /// On success, returns the physical address and, when it resolved to a
    /// plain memory region, a pre-resolved [`Target`] the caller may pass to
    /// [`Bus::read_at`]/[`Bus::write_at`] to skip the bus's own range
    /// dispatch on the next access to the same page.
    pub fn translate(
        &mut self,
        addr: Address,
        access: Access,
        translation_enabled: bool,
        user: bool,
        mem: &MemoryManagement,
        bus: &mut Bus,
    ) -> Result<(PhysAddr, Option<Target>)> {
        if !translation_enabled {
            let phys = PhysAddr::from(addr.value());
            return Ok((phys, bus.lookup(phys)));
        }

        let page = addr.value() >> PAGE_SHIFT;
        if let Some(entry) = self.vtlb.lookup(page, access) {
            return Ok((self.resolve(entry.physical_page, addr), entry.target));
        }

        let bats = match access {
            Access::Fetch => &mem.ibat,
            Access::Load | Access::Store => &mem.dbat,
        };

        if let Some(bat) = bats.iter().find(|bat| bat.enabled(user) && bat.contains(addr)) {
            if access == Access::Store && !bat.writable() {
                return Err(MmuError::Protection { addr, access });
            }
            let physical_page = bat.translate(addr).value() >> PAGE_SHIFT;
            return Ok(self.cache_and_resolve(addr, access, physical_page, bus));
        }

        let physical_page = self.walk_page_table(addr, access, mem, bus)?;
        Ok(self.cache_and_resolve(addr, access, physical_page, bus))
    }

    fn resolve(&self, physical_page: u32, addr: Address) -> PhysAddr {
        PhysAddr::from((physical_page << PAGE_SHIFT) | (addr.value() & PAGE_MASK))
    }

    fn cache_and_resolve(
        &mut self,
        addr: Address,
        access: Access,
        physical_page: u32,
        bus: &mut Bus,
    ) -> (PhysAddr, Option<Target>) {
        let target = bus.lookup(PhysAddr::from(physical_page << PAGE_SHIFT));
        self.vtlb.insert(addr.value() >> PAGE_SHIFT, access, VtlbEntry { physical_page, target });
        (self.resolve(physical_page, addr), target)
    }

    /// Walks the segmented hashed page table, checking both the primary and
    /// secondary PTE groups. Sets the matching PTE's changed bit in place
    /// for a store. Returns the matching PTE's real page number.
    fn walk_page_table(
        &self,
        addr: Address,
        access: Access,
        mem: &MemoryManagement,
        bus: &mut Bus,
    ) -> Result<u32> {
        let sr = mem.sr[(addr.value() >> 28) as usize & 0xF];
        if sr & 0x8000_0000 != 0 {
            // T=1: direct-store segment, no page table backs it.
            return Err(MmuError::NotFound { addr, access });
        }

        let vsid = sr & 0x00FF_FFFF;
        let page_index = (addr.value() >> PAGE_SHIFT) & 0xFFFF;
        let api = (page_index >> 10) & 0x3F;
        let primary_hash = vsid ^ page_index;

        let htab_base = (mem.sdr1 & 0xFFFF_0000) as u64;
        let htab_mask = (((mem.sdr1 & 0x1FF) << 16) | 0xFFC0) as u64;

        for (secondary, hash) in [(false, primary_hash), (true, !primary_hash)] {
            let pteg_addr = htab_base | (((hash as u64) << 6) & htab_mask);

            for i in 0..PTES_PER_GROUP {
                let entry_addr = PhysAddr::from(pteg_addr + i as u64 * PTE_SIZE);
                let mut scratch = ();
                let hi: u32 = bus
                    .read(entry_addr, &mut scratch)
                    .map_err(|_| MmuError::NotFound { addr, access })?;
                let lo: u32 = bus
                    .read(entry_addr + 4, &mut scratch)
                    .map_err(|_| MmuError::NotFound { addr, access })?;
                let pte = Pte { hi, lo };

                if !pte.valid() || pte.vsid() != vsid || pte.api() != api || pte.hash_secondary() != secondary {
                    continue;
                }

                if access == Access::Store {
                    if !pte.writable() {
                        return Err(MmuError::Protection { addr, access });
                    }
                    if !pte.changed() {
                        let mut updated = pte;
                        updated.set_changed(true);
                        let _ = bus.write(entry_addr + 4, updated.lo, &mut scratch);
                    }
                }

                return Ok(pte.rpn());
            }
        }

        tracing::trace!(%addr, ?access, "page table miss");
        Err(MmuError::NotFound { addr, access })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus::{RegionFlags, RegionKind};
    use gekko::regs::Bat;

    /// Packs a BAT's two words directly, matching the bit layout declared on
    /// [`Bat`] (protection@0..2, physical region@17..32, user@32,
    /// supervisor@33, length mask@34..45, effective region@49..64).
    fn bat(ea_region: u32, len_mask: u32, pa_region: u32, user: bool, supervisor: bool, rw: bool) -> Bat {
        let mut raw: u64 = if rw { 2 } else { 0 };
        raw |= (pa_region as u64 & 0x7FFF) << 17;
        raw |= (user as u64) << 32;
        raw |= (supervisor as u64) << 33;
        raw |= (len_mask as u64 & 0x7FF) << 34;
        raw |= (ea_region as u64 & 0x7FFF) << 49;
        Bat::from_bits(raw)
    }

    #[test]
    fn bat_translation_hits_without_touching_page_table() {
        let mut bus = Bus::new();
        bus.add_region("ram", PhysAddr::from(0u32), 0x10000, RegionKind::Ram, RegionFlags::default())
            .unwrap();

        let mut mem = MemoryManagement::default();
        mem.dbat[0] = bat(0, 0, 0, true, true, true);

        let mut mmu = Mmu::new();
        let (phys, target) = mmu
            .translate(Address(0x1234), Access::Load, true, true, &mem, &mut bus)
            .unwrap();
        assert_eq!(phys, PhysAddr::from(0x1234u32));
        assert!(matches!(target, Some(Target::Region(_, 0x1234))));
    }

    #[test]
    fn store_through_a_read_only_bat_is_rejected() {
        let mut bus = Bus::new();
        bus.add_region("ram", PhysAddr::from(0u32), 0x10000, RegionKind::Ram, RegionFlags::default())
            .unwrap();

        let mut mem = MemoryManagement::default();
        mem.dbat[0] = bat(0, 0, 0, true, true, false);

        let mut mmu = Mmu::new();
        let err = mmu
            .translate(Address(0x10), Access::Store, true, true, &mem, &mut bus)
            .unwrap_err();
        assert!(matches!(err, MmuError::Protection { .. }));
    }

    #[test]
    fn real_mode_is_identity_mapped() {
        let mut bus = Bus::new();
        bus.add_region("ram", PhysAddr::from(0u32), 0x10000, RegionKind::Ram, RegionFlags::default())
            .unwrap();

        let mem = MemoryManagement::default();
        let mut mmu = Mmu::new();
        let (phys, _) = mmu
            .translate(Address(0x4000), Access::Fetch, false, false, &mem, &mut bus)
            .unwrap();
        assert_eq!(phys, PhysAddr::from(0x4000u32));
    }

    #[test]
    fn page_table_miss_is_reported() {
        let mut bus = Bus::new();
        bus.add_region("ram", PhysAddr::from(0u32), 0x10000, RegionKind::Ram, RegionFlags::default())
            .unwrap();

        let mem = MemoryManagement::default();
        let mut mmu = Mmu::new();
        let err = mmu
            .translate(Address(0x8000), Access::Load, true, true, &mem, &mut bus)
            .unwrap_err();
        assert!(matches!(err, MmuError::NotFound { .. }));
    }

    #[test]
    fn invalidate_all_clears_cached_entries() {
        let mut bus = Bus::new();
        bus.add_region("ram", PhysAddr::from(0u32), 0x10000, RegionKind::Ram, RegionFlags::default())
            .unwrap();

        let mut mem = MemoryManagement::default();
        mem.dbat[0] = bat(0, 0, 0, true, true, true);

        let mut mmu = Mmu::new();
        mmu.translate(Address(0x10), Access::Load, true, true, &mem, &mut bus).unwrap();
        assert!(mmu.vtlb.lookup(0, Access::Load).is_some());
        mmu.invalidate_all();
        assert!(mmu.vtlb.lookup(0, Access::Load).is_none());
    }
}
