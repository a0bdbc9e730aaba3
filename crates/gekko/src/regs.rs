//! The PowerPC-32 register file: general-purpose and floating-point
//! registers, the condition and exception registers, the MSR, the BAT/
//! segment/SDR1 translation state, and the special-purpose register
//! enumeration.

use crate::Address;
use bitos::{
    BitUtils, bitos,
    integer::{u2, u4, u7, u11, u15},
};
use std::{fmt::Debug, mem::offset_of};
use strum::{FromRepr, VariantArray};

/// One 4-bit condition-register field (LT, GT, EQ, SO).
#[bitos(4)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cond {
    /// Summary overflow copied in from XER at the time of the comparison.
    #[bits(0)]
    pub so: bool,
    /// Operands equal (or result == 0).
    #[bits(1)]
    pub eq: bool,
    /// First operand greater than second (or result > 0).
    #[bits(2)]
    pub gt: bool,
    /// First operand less than second (or result < 0).
    #[bits(3)]
    pub lt: bool,
}

/// The condition register: 8 fields, CR0-CR7. CR0 is implicitly set by any
/// "dot" form integer instruction; CR1 by any "dot" form floating instruction.
#[bitos(32)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CondReg {
    // NOTE: CR0 is fields[7] — PPC numbers CR fields big-endian (CR0 is the
    // most-significant nibble of the 32-bit register).
    #[bits(..)]
    pub fields: [Cond; 8],
}

impl CondReg {
    #[inline(always)]
    pub fn field(&self, index: u8) -> Cond {
        self.fields()[7 - index as usize]
    }

    #[inline(always)]
    pub fn set_field(&mut self, index: u8, value: Cond) {
        let mut fields = self.fields();
        fields[7 - index as usize] = value;
        self.set_fields(fields);
    }

    #[inline(always)]
    pub fn cr0(&self) -> Cond {
        self.field(0)
    }

    #[inline(always)]
    pub fn set_cr0(&mut self, value: Cond) {
        self.set_field(0, value);
    }
}

/// The machine state register. Bit offsets match the real architecture so a
/// raw `mfmsr`/`mtmsr` round-trips bit for bit.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachineState {
    #[bits(0)]
    pub little_endian: bool,
    #[bits(1)]
    pub recoverable_exception: bool,
    #[bits(3)]
    pub data_addr_translation: bool,
    #[bits(4)]
    pub instr_addr_translation: bool,
    #[bits(6)]
    pub exception_prefix: bool,
    #[bits(8)]
    pub float_exception_mode_1: bool,
    #[bits(9)]
    pub single_step_trace: bool,
    #[bits(10)]
    pub branch_trace: bool,
    #[bits(11)]
    pub float_exception_mode_0: bool,
    #[bits(12)]
    pub machine_check: bool,
    #[bits(13)]
    pub float_available: bool,
    #[bits(14)]
    pub user_mode: bool,
    #[bits(15)]
    pub external_interrupts: bool,
    #[bits(16)]
    pub exception_little_endian: bool,
    #[bits(18)]
    pub power_management: bool,
}

/// The fixed-point exception register.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XerReg {
    /// Number of bytes to be transferred by `lswx`/`stswx`.
    #[bits(0..7)]
    pub byte_count: u7,
    /// Carry produced by an add/subtract-carrying instruction, or by a
    /// shift-right-algebraic that shifted a 1 out.
    #[bits(29)]
    pub carry: bool,
    /// Set by an "O" form instruction when the result overflowed.
    #[bits(30)]
    pub overflow: bool,
    /// Sticky summary-overflow: set whenever `overflow` is set, cleared only
    /// by explicit instructions (`mcrxr`, `mtspr`).
    #[bits(31)]
    pub summary_overflow: bool,
}

/// General-purpose integer register index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, VariantArray)]
#[repr(u8)]
#[rustfmt::skip]
pub enum Gpr {
    R0, R1, R2, R3, R4, R5, R6, R7,
    R8, R9, R10, R11, R12, R13, R14, R15,
    R16, R17, R18, R19, R20, R21, R22, R23,
    R24, R25, R26, R27, R28, R29, R30, R31,
}

impl Gpr {
    /// # Panics
    /// Panics if `index` is out of range (callers only ever pass a 5-bit
    /// instruction field, so this never fires).
    #[inline(always)]
    pub fn new(index: u8) -> Self {
        Self::from_repr(index).expect("5-bit GPR field is always in range")
    }

    #[inline(always)]
    pub fn offset(self) -> usize {
        offset_of!(User, gpr) + size_of::<u32>() * (self as usize)
    }
}

/// Floating-point register index. Only opaque 8-byte loads/stores are
/// specified; arithmetic on these is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, VariantArray)]
#[repr(u8)]
#[rustfmt::skip]
pub enum Fpr {
    R0, R1, R2, R3, R4, R5, R6, R7,
    R8, R9, R10, R11, R12, R13, R14, R15,
    R16, R17, R18, R19, R20, R21, R22, R23,
    R24, R25, R26, R27, R28, R29, R30, R31,
}

impl Fpr {
    #[inline(always)]
    pub fn new(index: u8) -> Self {
        Self::from_repr(index).expect("5-bit FPR field is always in range")
    }

    #[inline(always)]
    pub fn offset(self) -> usize {
        offset_of!(User, fpr) + size_of::<u64>() * (self as usize)
    }
}

/// User-level register file.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct User {
    pub gpr: [u32; 32],
    /// Opaque 64-bit payloads; no arithmetic is performed on these.
    pub fpr: [u64; 32],
    pub cr: CondReg,
    pub fpscr: u32,
    pub xer: XerReg,
    pub lr: u32,
    pub ctr: u32,
}

/// A block-address-translation entry (either an IBAT or a DBAT slot).
#[bitos(64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bat {
    // lower word
    #[bits(0..2)]
    pub protection: u2,
    #[bits(3..7)]
    pub wimg: u4,
    #[bits(17..32)]
    pub physical_address_region: u15,

    // upper word
    #[bits(32)]
    pub user_mode: bool,
    #[bits(33)]
    pub supervisor_mode: bool,
    #[bits(34..45)]
    pub block_length_mask: u11,
    #[bits(49..64)]
    pub effective_address_region: u15,
}

impl Bat {
    /// Length of the mapped region, in bytes. The granularity is 128 KiB.
    #[inline(always)]
    pub fn block_length(&self) -> u32 {
        (128 * 1024) << self.block_length_mask().value().count_ones()
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        Address(
            ((self.effective_address_region().value() as u32) << 17)
                & !((self.block_length_mask().value() as u32) << 17),
        )
    }

    #[inline(always)]
    pub fn physical_start(&self) -> Address {
        Address(
            ((self.physical_address_region().value() as u32) << 17)
                & !((self.block_length_mask().value() as u32) << 17),
        )
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.start() + (self.block_length() - 1)
    }

    /// Whether `valid` for the given privilege level (user iff `user`).
    #[inline(always)]
    pub fn enabled(&self, user: bool) -> bool {
        if user { self.user_mode() } else { self.supervisor_mode() }
    }

    /// Whether the protection bits permit a store. Protection semantics
    /// follow the architecture: 0 = no access, 1/2/3 = read-write (only
    /// read-only distinctions matter for BATs, value 3 being unused/reserved
    /// treated as read-write here as in the reference implementation).
    #[inline(always)]
    pub fn writable(&self) -> bool {
        self.protection().value() != 0
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        (self.start()..=self.end()).contains(&addr)
    }

    #[inline(always)]
    pub fn translate(&self, addr: Address) -> Address {
        let offset = addr.value().bits(0, 17);
        let region = ((addr.value().bits(17, 28) << 17)
            & ((self.block_length_mask().value() as u32) << 17))
            | ((self.physical_address_region().value() as u32) << 17);

        Address(region | offset)
    }
}

/// One page-table entry, as laid out in the segmented hashed page table.
/// Modeled as the architecture's two 32-bit words rather than a bitfield
/// struct, since its fields don't split cleanly on byte boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte {
    /// valid(1) | vsid(24) | hash_secondary(1) | api(6)
    pub hi: u32,
    /// rpn(20) | reserved(3) | referenced(1) | changed(1) | wimg(4) | reserved(1) | pp(2)
    pub lo: u32,
}

impl Pte {
    #[inline(always)]
    pub fn valid(&self) -> bool {
        self.hi & 0x8000_0000 != 0
    }

    #[inline(always)]
    pub fn vsid(&self) -> u32 {
        (self.hi >> 7) & 0x00FF_FFFF
    }

    #[inline(always)]
    pub fn hash_secondary(&self) -> bool {
        self.hi & 0x40 != 0
    }

    #[inline(always)]
    pub fn api(&self) -> u32 {
        self.hi & 0x3F
    }

    #[inline(always)]
    pub fn rpn(&self) -> u32 {
        self.lo >> 12
    }

    #[inline(always)]
    pub fn referenced(&self) -> bool {
        self.lo & 0x100 != 0
    }

    #[inline(always)]
    pub fn changed(&self) -> bool {
        self.lo & 0x80 != 0
    }

    #[inline(always)]
    pub fn set_changed(&mut self, value: bool) {
        if value {
            self.lo |= 0x80;
        } else {
            self.lo &= !0x80;
        }
    }

    #[inline(always)]
    pub fn wimg(&self) -> u32 {
        (self.lo >> 3) & 0xF
    }

    /// Page-protection bits: 0/1 = read-only, 2/3 = read-write (bit 0 of PP
    /// is ignored by this implementation, matching the common subset used
    /// by guest operating systems).
    #[inline(always)]
    pub fn page_protection(&self) -> u32 {
        self.lo & 0x3
    }

    #[inline(always)]
    pub fn writable(&self) -> bool {
        self.page_protection() & 0x2 != 0
    }

    pub fn pack(vsid: u32, hash_secondary: bool, api: u32, rpn: u32, wimg: u32, pp: u32) -> Self {
        let hi = 0x8000_0000 | ((vsid & 0x00FF_FFFF) << 7) | ((hash_secondary as u32) << 6) | (api & 0x3F);
        let lo = (rpn << 12) | ((wimg & 0xF) << 3) | (pp & 0x3);
        Self { hi, lo }
    }
}

/// BAT registers, segment registers and the page-table-base register.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MemoryManagement {
    pub ibat: [Bat; 4],
    pub dbat: [Bat; 4],
    pub sr: [u32; 16],
    pub sdr1: u32,
}

/// Save/restore and fault-reporting registers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExceptionHandling {
    /// Data Address Register: faulting address of the last data exception.
    pub dar: u32,
    /// Data Storage Interrupt Status Register.
    pub dsisr: u32,
    pub sprg: [u32; 4],
    /// `[srr0, srr1]`.
    pub srr: [u32; 2],
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Miscellaneous {
    pub timebase: u64,
    pub decrementer: u32,
}

/// Supervisor-level register file.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Supervisor {
    pub msr: MachineState,
    pub memory: MemoryManagement,
    pub exception: ExceptionHandling,
    pub misc: Miscellaneous,
    pub pvr: u32,
    pub hid: [u32; 2],
}

/// The full architectural register file for one CPU.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Registers {
    pub pc: Address,
    pub user: User,
    pub supervisor: Supervisor,
}

/// Special-purpose register numbers reachable through `mfspr`/`mtspr`.
/// Values match the real architecture so guest code decoding its own SPR
/// field constants behaves identically to real hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, VariantArray)]
#[repr(u16)]
pub enum Spr {
    Xer = 1,
    Lr = 8,
    Ctr = 9,
    Dsisr = 18,
    Dar = 19,
    Dec = 22,
    Sdr1 = 25,
    Srr0 = 26,
    Srr1 = 27,
    Sprg0 = 272,
    Sprg1 = 273,
    Sprg2 = 274,
    Sprg3 = 275,
    Pvr = 287,
    Ibat0U = 528,
    Ibat0L = 529,
    Ibat1U = 530,
    Ibat1L = 531,
    Ibat2U = 532,
    Ibat2L = 533,
    Ibat3U = 534,
    Ibat3L = 535,
    Dbat0U = 536,
    Dbat0L = 537,
    Dbat1U = 538,
    Dbat1L = 539,
    Dbat2U = 540,
    Dbat2L = 541,
    Dbat3U = 542,
    Dbat3L = 543,
    Hid0 = 1008,
    Hid1 = 1009,
}

impl Spr {
    /// Decodes the 10-bit SPR field as encoded in `mfspr`/`mtspr`: the
    /// instruction stores it as two 5-bit halves, low half first.
    #[inline(always)]
    pub fn decode_field(field: u16) -> u16 {
        ((field & 0x1F) << 5) | (field >> 5)
    }

    /// # Errors
    /// Returns `None` for any SPR number this implementation doesn't model;
    /// callers raise a program exception in that case, matching the
    /// architecture's "privileged/illegal instruction" behavior for unknown
    /// SPRs.
    #[inline(always)]
    pub fn new(number: u16) -> Option<Self> {
        Self::from_repr(number)
    }

    pub fn is_privileged(self) -> bool {
        !matches!(self, Spr::Xer | Spr::Lr | Spr::Ctr)
    }
}

/// Any architectural register, used by the debugger-facing register
/// enumeration/inspection surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Gpr(Gpr),
    Fpr(Fpr),
    Spr(Spr),
    Pc,
    Msr,
    Cr,
    Fpscr,
}

impl Reg {
    pub fn iter() -> impl Iterator<Item = Self> {
        let gpr = Gpr::VARIANTS.iter().copied().map(Self::Gpr);
        let fpr = Fpr::VARIANTS.iter().copied().map(Self::Fpr);
        let spr = Spr::VARIANTS.iter().copied().map(Self::Spr);
        let others = [Self::Pc, Self::Msr, Self::Cr, Self::Fpscr].into_iter();
        others.chain(gpr).chain(spr).chain(fpr)
    }
}

impl From<Gpr> for Reg {
    fn from(value: Gpr) -> Self {
        Self::Gpr(value)
    }
}

impl From<Fpr> for Reg {
    fn from(value: Fpr) -> Self {
        Self::Fpr(value)
    }
}

impl From<Spr> for Reg {
    fn from(value: Spr) -> Self {
        Self::Spr(value)
    }
}

/// DSISR bit set on a page-fault-class data exception (bit 30 — "no page
/// table entry found").
pub const DSISR_NOT_FOUND: u32 = 1 << 30;
/// DSISR bit set when a store failed protection checks.
pub const DSISR_PROTECTION: u32 = 1 << 3;
/// DSISR bit distinguishing store (set) from load (clear).
pub const DSISR_STORE: u32 = 1 << 25;

static_assertions::assert_eq_size!(Bat, u64);
static_assertions::assert_eq_size!(Pte, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_pack_round_trips_every_field() {
        let pte = Pte::pack(0x00AB_CDEF, true, 0x2A, 0x1234, 0b1010, 0b10);

        assert!(pte.valid());
        assert_eq!(pte.vsid(), 0x00AB_CDEF);
        assert!(pte.hash_secondary());
        assert_eq!(pte.api(), 0x2A);
        assert_eq!(pte.rpn(), 0x1234);
        assert_eq!(pte.wimg(), 0b1010);
        assert_eq!(pte.page_protection(), 0b10);
        assert!(pte.writable());
    }

    #[test]
    fn pte_set_changed_toggles_only_its_own_bit() {
        let mut pte = Pte::pack(1, false, 0, 0, 0, 0b11);
        assert!(!pte.changed());

        pte.set_changed(true);
        assert!(pte.changed());
        assert_eq!(pte.page_protection(), 0b11, "unrelated field must survive the set");

        pte.set_changed(false);
        assert!(!pte.changed());
    }

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
    fn bat_block_length_grows_with_the_mask_popcount() {
        assert_eq!(bat(0, 0, 0, true, true, true).block_length(), 128 * 1024);
        // Four bits set in the length mask doubles the block four times.
        assert_eq!(bat(0, 0b1111, 0, true, true, true).block_length(), 128 * 1024 * 16);
    }

    #[test]
    fn bat_translate_substitutes_only_the_masked_region_bits() {
        let entry = bat(0, 0, 0x10, true, true, true);
        // Effective region 0, physical region 0x10 => physical base 0x10 << 17.
        let translated = entry.translate(Address(0x1234));
        assert_eq!(translated, Address((0x10 << 17) | 0x1234));
    }

    #[test]
    fn bat_enabled_checks_the_matching_privilege_bit() {
        let user_only = bat(0, 0, 0, true, false, true);
        assert!(user_only.enabled(true));
        assert!(!user_only.enabled(false));
    }

    #[test]
    fn bat_writable_follows_protection_field() {
        assert!(bat(0, 0, 0, true, true, true).writable());
        assert!(!bat(0, 0, 0, true, true, false).writable());
    }

    #[test]
    fn spr_decode_field_swaps_the_two_five_bit_halves() {
        // mflr encodes SPR 8 (LR) as field 0x100: low 5 bits (0) go first,
        // high 5 bits (0b00001) land in the top half after decoding.
        assert_eq!(Spr::decode_field(0x100), 8);
        // mtspr CTR: SPR 9 encodes as field 0x120.
        assert_eq!(Spr::decode_field(0x120), 9);
    }

    #[test]
    fn spr_new_rejects_unmodeled_numbers() {
        assert_eq!(Spr::new(0xFFFF), None);
        assert_eq!(Spr::new(8), Some(Spr::Lr));
    }

    #[test]
    fn spr_is_privileged_excludes_the_user_readable_set() {
        assert!(!Spr::Xer.is_privileged());
        assert!(!Spr::Lr.is_privileged());
        assert!(!Spr::Ctr.is_privileged());
        assert!(Spr::Hid0.is_privileged());
    }
}
