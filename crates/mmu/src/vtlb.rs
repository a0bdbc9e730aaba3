use crate::Access;
use bus::{RegionId, Target};

/// Number of direct-mapped slots per access mode. A virtual page number hits
/// the same slot as any other page number congruent to it mod this size;
/// the newer insert wins, the older entry is simply gone.
const CACHE_SIZE: usize = 256;

/// One cached translation: a virtual page that currently maps to a physical
/// page, plus (when the destination is a plain region, not a device) the
/// resolved bus target for its first byte so a hit can skip the bus's range
/// dispatch entirely.
/// The access-mode that keys a lookup already encodes which permission was
/// checked when this entry was inserted, so a hit never needs a fresh
/// protection check.
#[derive(Debug, Clone, Copy)]
pub struct VtlbEntry {
    pub physical_page: u32,
    pub target: Option<Target>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    page: u32,
    entry: VtlbEntry,
}

/// Software translation cache: a direct-mapped table indexed by
/// (virtual-page-number mod [`CACHE_SIZE`], access-mode). Every BAT, segment
/// register, SDR1 or MSR translation/privilege-bit mutation must invalidate
/// this en masse; there is no per-entry staleness check beyond the tag
/// comparison a collision naturally forces on the next lookup.
pub struct Vtlb {
    slots: [[Option<Slot>; CACHE_SIZE]; 3],
}

impl Default for Vtlb {
    fn default() -> Self {
        Self {
            slots: [[None; CACHE_SIZE]; 3],
        }
    }
}

impl Vtlb {
    fn index(page: u32, access: Access) -> (usize, usize) {
        (access as usize, page as usize % CACHE_SIZE)
    }

    pub fn lookup(&self, page: u32, access: Access) -> Option<VtlbEntry> {
        let (mode, slot) = Self::index(page, access);
        match &self.slots[mode][slot] {
            Some(Slot { page: tag, entry }) if *tag == page => Some(*entry),
            _ => None,
        }
    }

    pub fn insert(&mut self, page: u32, access: Access, entry: VtlbEntry) {
        let (mode, slot) = Self::index(page, access);
        self.slots[mode][slot] = Some(Slot { page, entry });
    }

    pub fn invalidate_all(&mut self) {
        self.slots = [[None; CACHE_SIZE]; 3];
    }

    /// Drops every entry whose cached target points into `region` — called
    /// when the owning VM unmaps that region.
    pub fn invalidate_region(&mut self, region: RegionId) {
        for mode in &mut self.slots {
            for slot in mode.iter_mut() {
                if matches!(slot, Some(Slot { entry, .. }) if matches!(entry.target, Some(Target::Region(id, _)) if id == region))
                {
                    *slot = None;
                }
            }
        }
    }
}
