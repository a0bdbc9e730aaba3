//! Raw 32-bit PowerPC instruction decoding: bit-field extraction and the
//! mask/value lookup table that turns an encoding into an [`Op`].

use gekko::regs::Spr;

/// One decoded instruction, operands already pulled out of the raw word.
/// Variants are grouped to mirror the instruction families called out by
/// name in the architecture: arithmetic (dot/O forms), compares, branches,
/// loads/stores, rotates/shifts, SPR moves, and the handful of
/// supervisor-only translation-control ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Illegal { word: u32 },

    // --- arithmetic, XO-form: rt = ra op rb, with O (overflow) and Rc (CR0) ---
    Add { rt: u8, ra: u8, rb: u8, oe: bool, rc: bool },
    Addc { rt: u8, ra: u8, rb: u8, oe: bool, rc: bool },
    Adde { rt: u8, ra: u8, rb: u8, oe: bool, rc: bool },
    Subf { rt: u8, ra: u8, rb: u8, oe: bool, rc: bool },
    Subfc { rt: u8, ra: u8, rb: u8, oe: bool, rc: bool },
    Subfe { rt: u8, ra: u8, rb: u8, oe: bool, rc: bool },
    Neg { rt: u8, ra: u8, oe: bool, rc: bool },
    Mullw { rt: u8, ra: u8, rb: u8, oe: bool, rc: bool },
    Divw { rt: u8, ra: u8, rb: u8, oe: bool, rc: bool },
    Divwu { rt: u8, ra: u8, rb: u8, oe: bool, rc: bool },

    // --- arithmetic, D-form immediates ---
    Addi { rt: u8, ra: u8, simm: i32 },
    Addis { rt: u8, ra: u8, simm: i32 },
    Addic { rt: u8, ra: u8, simm: i32, rc: bool },
    Subfic { rt: u8, ra: u8, simm: i32 },
    Mulli { rt: u8, ra: u8, simm: i32 },

    // --- logical ---
    Ori { ra: u8, rs: u8, uimm: u32 },
    Oris { ra: u8, rs: u8, uimm: u32 },
    Xori { ra: u8, rs: u8, uimm: u32 },
    Xoris { ra: u8, rs: u8, uimm: u32 },
    Andi { ra: u8, rs: u8, uimm: u32 },
    Andis { ra: u8, rs: u8, uimm: u32 },
    And { ra: u8, rs: u8, rb: u8, rc: bool },
    Or { ra: u8, rs: u8, rb: u8, rc: bool },
    Xor { ra: u8, rs: u8, rb: u8, rc: bool },
    Nand { ra: u8, rs: u8, rb: u8, rc: bool },
    Nor { ra: u8, rs: u8, rb: u8, rc: bool },

    // --- compares ---
    Cmpi { crf: u8, ra: u8, simm: i32 },
    Cmpli { crf: u8, ra: u8, uimm: u32 },
    Cmp { crf: u8, ra: u8, rb: u8 },
    Cmpl { crf: u8, ra: u8, rb: u8 },

    // --- rotate / shift ---
    Rlwinm { ra: u8, rs: u8, sh: u8, mb: u8, me: u8, rc: bool },
    Rlwimi { ra: u8, rs: u8, sh: u8, mb: u8, me: u8, rc: bool },
    Rlwnm { ra: u8, rs: u8, rb: u8, mb: u8, me: u8, rc: bool },
    Slw { ra: u8, rs: u8, rb: u8, rc: bool },
    Srw { ra: u8, rs: u8, rb: u8, rc: bool },
    Sraw { ra: u8, rs: u8, rb: u8, rc: bool },
    Srawi { ra: u8, rs: u8, sh: u8, rc: bool },

    // --- branches ---
    B { li: i32, aa: bool, lk: bool },
    Bc { bo: u8, bi: u8, bd: i32, aa: bool, lk: bool },
    Bclr { bo: u8, bi: u8, lk: bool },
    Bcctr { bo: u8, bi: u8, lk: bool },

    // --- condition/link/count register moves ---
    Mfcr { rt: u8 },
    Mtcrf { fxm: u8, rs: u8 },

    // --- loads/stores, D-form ---
    Lwz { rt: u8, ra: u8, d: i32 },
    Lwzu { rt: u8, ra: u8, d: i32 },
    Lhz { rt: u8, ra: u8, d: i32 },
    Lhzu { rt: u8, ra: u8, d: i32 },
    Lha { rt: u8, ra: u8, d: i32 },
    Lbz { rt: u8, ra: u8, d: i32 },
    Lbzu { rt: u8, ra: u8, d: i32 },
    Stw { rs: u8, ra: u8, d: i32 },
    Stwu { rs: u8, ra: u8, d: i32 },
    Sth { rs: u8, ra: u8, d: i32 },
    Sthu { rs: u8, ra: u8, d: i32 },
    Stb { rs: u8, ra: u8, d: i32 },
    Stbu { rs: u8, ra: u8, d: i32 },
    Lfd { ft: u8, ra: u8, d: i32 },
    Lfdu { ft: u8, ra: u8, d: i32 },
    Stfd { fs: u8, ra: u8, d: i32 },
    Stfdu { fs: u8, ra: u8, d: i32 },

    // --- loads/stores, X-form indexed ---
    Lwzx { rt: u8, ra: u8, rb: u8 },
    Lwzux { rt: u8, ra: u8, rb: u8 },
    Lhzx { rt: u8, ra: u8, rb: u8 },
    Lbzx { rt: u8, ra: u8, rb: u8 },
    Stwx { rs: u8, ra: u8, rb: u8 },
    Stwux { rs: u8, ra: u8, rb: u8 },
    Sthx { rs: u8, ra: u8, rb: u8 },
    Stbx { rs: u8, ra: u8, rb: u8 },
    Lfdx { ft: u8, ra: u8, rb: u8 },
    Stfdx { fs: u8, ra: u8, rb: u8 },

    // --- multiple/string ---
    Lmw { rt: u8, ra: u8, d: i32 },
    Stmw { rs: u8, ra: u8, d: i32 },
    Lswi { rt: u8, ra: u8, nb: u8 },
    Stswi { rs: u8, ra: u8, nb: u8 },
    Lswx { rt: u8, ra: u8, rb: u8 },
    Stswx { rs: u8, ra: u8, rb: u8 },

    // --- reservation ---
    Lwarx { rt: u8, ra: u8, rb: u8 },
    Stwcx { rs: u8, ra: u8, rb: u8 },

    // --- system ---
    Sc,
    Rfi,
    Tw { to: u8, ra: u8, rb: u8 },
    Twi { to: u8, ra: u8, simm: i32 },
    Sync,
    Isync,
    Eieio,

    // --- SPR / supervisor register moves ---
    Mfmsr { rt: u8 },
    Mtmsr { rs: u8 },
    Mfspr { rt: u8, spr: Option<Spr> },
    Mtspr { rs: u8, spr: Option<Spr> },
    Mfsr { rt: u8, sr: u8 },
    Mtsr { rs: u8, sr: u8 },
    Mfsrin { rt: u8, rb: u8 },
    Mtsrin { rs: u8, rb: u8 },
    Tlbie { rb: u8 },
}

#[inline(always)]
fn opcode(word: u32) -> u32 {
    word >> 26
}

#[inline(always)]
fn field(word: u32, shift: u32) -> u8 {
    ((word >> shift) & 0x1F) as u8
}

#[inline(always)]
fn rt(word: u32) -> u8 {
    field(word, 21)
}
#[inline(always)]
fn rs(word: u32) -> u8 {
    field(word, 21)
}
#[inline(always)]
fn ra(word: u32) -> u8 {
    field(word, 16)
}
#[inline(always)]
fn rb(word: u32) -> u8 {
    field(word, 11)
}
#[inline(always)]
fn rc(word: u32) -> bool {
    word & 1 != 0
}
#[inline(always)]
fn oe(word: u32) -> bool {
    word & (1 << 10) != 0
}
#[inline(always)]
fn xo(word: u32) -> u32 {
    (word >> 1) & 0x3FF
}
#[inline(always)]
fn simm(word: u32) -> i32 {
    (word & 0xFFFF) as i16 as i32
}
#[inline(always)]
fn uimm(word: u32) -> u32 {
    word & 0xFFFF
}
#[inline(always)]
fn sh(word: u32) -> u8 {
    field(word, 11)
}
#[inline(always)]
fn mb(word: u32) -> u8 {
    field(word, 6)
}
#[inline(always)]
fn me(word: u32) -> u8 {
    field(word, 1)
}
#[inline(always)]
fn crf_dest(word: u32) -> u8 {
    ((word >> 23) & 0x7) as u8
}
#[inline(always)]
fn fxm(word: u32) -> u8 {
    ((word >> 12) & 0xFF) as u8
}
#[inline(always)]
fn spr_field(word: u32) -> u16 {
    Spr::decode_field(((word >> 11) & 0x3FF) as u16)
}

/// Sign-extends the 24-bit `LI` field of an I-form branch, pre-shifted left
/// two bits (branch targets are word-aligned).
#[inline(always)]
fn li(word: u32) -> i32 {
    let raw = (word & 0x03FF_FFFC) as i32;
    (raw << 6) >> 6
}

/// Sign-extends the 14-bit `BD` field of a B-form branch, pre-shifted.
#[inline(always)]
fn bd(word: u32) -> i32 {
    let raw = (word & 0x0000_FFFC) as i32;
    (raw << 16) >> 16
}

fn decode_x31(word: u32) -> Op {
    match xo(word) {
        0 => Op::Cmp { crf: crf_dest(word), ra: ra(word), rb: rb(word) },
        32 => Op::Cmpl { crf: crf_dest(word), ra: ra(word), rb: rb(word) },
        4 => Op::Tw { to: rt(word), ra: ra(word), rb: rb(word) },
        8 | 520 => Op::Subfc { rt: rt(word), ra: ra(word), rb: rb(word), oe: oe(word), rc: rc(word) },
        10 | 522 => Op::Addc { rt: rt(word), ra: ra(word), rb: rb(word), oe: oe(word), rc: rc(word) },
        104 | 616 => Op::Neg { rt: rt(word), ra: ra(word), oe: oe(word), rc: rc(word) },
        136 | 648 => Op::Subfe { rt: rt(word), ra: ra(word), rb: rb(word), oe: oe(word), rc: rc(word) },
        138 | 650 => Op::Adde { rt: rt(word), ra: ra(word), rb: rb(word), oe: oe(word), rc: rc(word) },
        40 | 552 => Op::Subf { rt: rt(word), ra: ra(word), rb: rb(word), oe: oe(word), rc: rc(word) },
        266 | 778 => Op::Add { rt: rt(word), ra: ra(word), rb: rb(word), oe: oe(word), rc: rc(word) },
        235 | 747 => Op::Mullw { rt: rt(word), ra: ra(word), rb: rb(word), oe: oe(word), rc: rc(word) },
        491 | 1003 => Op::Divw { rt: rt(word), ra: ra(word), rb: rb(word), oe: oe(word), rc: rc(word) },
        459 | 971 => Op::Divwu { rt: rt(word), ra: ra(word), rb: rb(word), oe: oe(word), rc: rc(word) },
        28 => Op::And { ra: ra(word), rs: rs(word), rb: rb(word), rc: rc(word) },
        444 => Op::Or { ra: ra(word), rs: rs(word), rb: rb(word), rc: rc(word) },
        316 => Op::Xor { ra: ra(word), rs: rs(word), rb: rb(word), rc: rc(word) },
        476 => Op::Nand { ra: ra(word), rs: rs(word), rb: rb(word), rc: rc(word) },
        124 => Op::Nor { ra: ra(word), rs: rs(word), rb: rb(word), rc: rc(word) },
        24 => Op::Slw { ra: ra(word), rs: rs(word), rb: rb(word), rc: rc(word) },
        536 => Op::Srw { ra: ra(word), rs: rs(word), rb: rb(word), rc: rc(word) },
        792 => Op::Sraw { ra: ra(word), rs: rs(word), rb: rb(word), rc: rc(word) },
        824 => Op::Srawi { ra: ra(word), rs: rs(word), sh: rb(word), rc: rc(word) },
        83 => Op::Mfmsr { rt: rt(word) },
        146 => Op::Mtmsr { rs: rs(word) },
        339 => Op::Mfspr { rt: rt(word), spr: Spr::new(spr_field(word)) },
        467 => Op::Mtspr { rs: rs(word), spr: Spr::new(spr_field(word)) },
        595 => Op::Mfsr { rt: rt(word), sr: ra(word) & 0xF },
        210 => Op::Mtsr { rs: rs(word), sr: ra(word) & 0xF },
        659 => Op::Mfsrin { rt: rt(word), rb: rb(word) },
        242 => Op::Mtsrin { rs: rs(word), rb: rb(word) },
        306 => Op::Tlbie { rb: rb(word) },
        19 => Op::Mfcr { rt: rt(word) },
        144 => Op::Mtcrf { fxm: fxm(word), rs: rs(word) },
        23 => Op::Lwzx { rt: rt(word), ra: ra(word), rb: rb(word) },
        55 => Op::Lwzux { rt: rt(word), ra: ra(word), rb: rb(word) },
        87 => Op::Lbzx { rt: rt(word), ra: ra(word), rb: rb(word) },
        279 => Op::Lhzx { rt: rt(word), ra: ra(word), rb: rb(word) },
        151 => Op::Stwx { rs: rs(word), ra: ra(word), rb: rb(word) },
        183 => Op::Stwux { rs: rs(word), ra: ra(word), rb: rb(word) },
        215 => Op::Stbx { rs: rs(word), ra: ra(word), rb: rb(word) },
        407 => Op::Sthx { rs: rs(word), ra: ra(word), rb: rb(word) },
        599 => Op::Lfdx { ft: rt(word), ra: ra(word), rb: rb(word) },
        727 => Op::Stfdx { fs: rs(word), ra: ra(word), rb: rb(word) },
        20 => Op::Lwarx { rt: rt(word), ra: ra(word), rb: rb(word) },
        150 => Op::Stwcx { rs: rs(word), ra: ra(word), rb: rb(word) },
        533 => Op::Lswx { rt: rt(word), ra: ra(word), rb: rb(word) },
        661 => Op::Stswx { rs: rs(word), ra: ra(word), rb: rb(word) },
        597 => Op::Lswi { rt: rt(word), ra: ra(word), nb: rb(word) },
        725 => Op::Stswi { rs: rs(word), ra: ra(word), nb: rb(word) },
        598 => Op::Sync,
        854 => Op::Eieio,
        _ => Op::Illegal { word },
    }
}

fn decode_x19(word: u32) -> Op {
    match xo(word) {
        16 => Op::Bclr { bo: field(word, 21), bi: field(word, 16), lk: rc(word) },
        528 => Op::Bcctr { bo: field(word, 21), bi: field(word, 16), lk: rc(word) },
        50 => Op::Rfi,
        150 => Op::Isync,
        _ => Op::Illegal { word },
    }
}

fn decode_one(word: u32) -> Op {
    match opcode(word) {
        18 => Op::B { li: li(word), aa: word & 2 != 0, lk: rc(word) },
        16 => Op::Bc { bo: field(word, 21), bi: field(word, 16), bd: bd(word), aa: word & 2 != 0, lk: rc(word) },
        19 => decode_x19(word),
        31 => decode_x31(word),
        11 => Op::Cmpi { crf: crf_dest(word), ra: ra(word), simm: simm(word) },
        10 => Op::Cmpli { crf: crf_dest(word), ra: ra(word), uimm: uimm(word) },
        14 => Op::Addi { rt: rt(word), ra: ra(word), simm: simm(word) },
        15 => Op::Addis { rt: rt(word), ra: ra(word), simm: simm(word) },
        12 => Op::Addic { rt: rt(word), ra: ra(word), simm: simm(word), rc: false },
        13 => Op::Addic { rt: rt(word), ra: ra(word), simm: simm(word), rc: true },
        8 => Op::Subfic { rt: rt(word), ra: ra(word), simm: simm(word) },
        7 => Op::Mulli { rt: rt(word), ra: ra(word), simm: simm(word) },
        24 => Op::Ori { ra: ra(word), rs: rs(word), uimm: uimm(word) },
        25 => Op::Oris { ra: ra(word), rs: rs(word), uimm: uimm(word) },
        26 => Op::Xori { ra: ra(word), rs: rs(word), uimm: uimm(word) },
        27 => Op::Xoris { ra: ra(word), rs: rs(word), uimm: uimm(word) },
        28 => Op::Andi { ra: ra(word), rs: rs(word), uimm: uimm(word) },
        29 => Op::Andis { ra: ra(word), rs: rs(word), uimm: uimm(word) },
        21 => Op::Rlwinm { ra: ra(word), rs: rs(word), sh: sh(word), mb: mb(word), me: me(word), rc: rc(word) },
        20 => Op::Rlwimi { ra: ra(word), rs: rs(word), sh: sh(word), mb: mb(word), me: me(word), rc: rc(word) },
        23 => Op::Rlwnm { ra: ra(word), rs: rs(word), rb: rb(word), mb: mb(word), me: me(word), rc: rc(word) },
        32 => Op::Lwz { rt: rt(word), ra: ra(word), d: simm(word) },
        33 => Op::Lwzu { rt: rt(word), ra: ra(word), d: simm(word) },
        34 => Op::Lbz { rt: rt(word), ra: ra(word), d: simm(word) },
        35 => Op::Lbzu { rt: rt(word), ra: ra(word), d: simm(word) },
        40 => Op::Lhz { rt: rt(word), ra: ra(word), d: simm(word) },
        41 => Op::Lhzu { rt: rt(word), ra: ra(word), d: simm(word) },
        42 => Op::Lha { rt: rt(word), ra: ra(word), d: simm(word) },
        36 => Op::Stw { rs: rs(word), ra: ra(word), d: simm(word) },
        37 => Op::Stwu { rs: rs(word), ra: ra(word), d: simm(word) },
        38 => Op::Stb { rs: rs(word), ra: ra(word), d: simm(word) },
        39 => Op::Stbu { rs: rs(word), ra: ra(word), d: simm(word) },
        44 => Op::Sth { rs: rs(word), ra: ra(word), d: simm(word) },
        45 => Op::Sthu { rs: rs(word), ra: ra(word), d: simm(word) },
        46 => Op::Lmw { rt: rt(word), ra: ra(word), d: simm(word) },
        47 => Op::Stmw { rs: rs(word), ra: ra(word), d: simm(word) },
        48 => Op::Lfd { ft: rt(word), ra: ra(word), d: simm(word) },
        49 => Op::Lfdu { ft: rt(word), ra: ra(word), d: simm(word) },
        54 => Op::Stfd { fs: rs(word), ra: ra(word), d: simm(word) },
        55 => Op::Stfdu { fs: rs(word), ra: ra(word), d: simm(word) },
        17 => Op::Sc,
        3 => Op::Twi { to: rt(word), ra: ra(word), simm: simm(word) },
        _ => Op::Illegal { word },
    }
}

/// A mask/value/decode-function entry, grouped by primary opcode at build
/// time. Entries with a sub-opcode field are tried in declaration order
/// inside `decode_x19`/`decode_x31`; the outer table only needs to bucket
/// on the 6-bit primary opcode since this implementation decodes each
/// bucket directly instead of scanning a flat list.
pub struct Decoder;

impl Decoder {
    pub fn new() -> Self {
        Self
    }

    #[inline]
    pub fn decode(&self, word: u32) -> Op {
        decode_one(word)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
