//! Software walker for guest paging structures.
//!
//! Translates a guest-linear address to a guest-physical address across all
//! four IA-32/Intel 64 paging modes without any hardware assistance: this is
//! what lets the vTLB shadow engine and the linear-memory gateway work on
//! hosts that lack EPT, and what validates accesses the MMU would otherwise
//! have validated for us.
//!
//! The guest-physical side of a walk goes through [`PagingMemory`], a tiny
//! trait that the vTLB engine and the memory gateway each implement over
//! their own view of guest RAM; this module never touches guest memory
//! directly.

/// One level's worth of the permission/accounting bits that are laid out
/// identically across every x86 paging-entry format (PML4E, PDPTE, PDE,
/// PTE): present, writable, user, accessed, dirty, page-size, global,
/// execute-disable. 32-bit (non-PAE) entries are stored zero-extended into
/// the same `u64`, which makes `xd()` naturally false for them since bit 63
/// never exists in a 4-byte entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestEntry(pub u64);

impl GuestEntry {
    const P: u64 = 1 << 0;
    const RW: u64 = 1 << 1;
    const US: u64 = 1 << 2;
    const PWT: u64 = 1 << 3;
    const PCD: u64 = 1 << 4;
    const A: u64 = 1 << 5;
    const D: u64 = 1 << 6;
    const PS: u64 = 1 << 7;
    const G: u64 = 1 << 8;
    const XD: u64 = 1 << 63;

    /// Whether the P bit is set.
    pub fn present(self) -> bool {
        self.0 & Self::P != 0
    }
    /// Whether the R/W bit is set.
    pub fn writable(self) -> bool {
        self.0 & Self::RW != 0
    }
    /// Whether the U/S bit is set.
    pub fn user(self) -> bool {
        self.0 & Self::US != 0
    }
    /// Whether the accessed bit is set.
    pub fn accessed(self) -> bool {
        self.0 & Self::A != 0
    }
    /// Whether the dirty bit is set. Only meaningful on a leaf entry.
    pub fn dirty(self) -> bool {
        self.0 & Self::D != 0
    }
    /// Whether this entry maps a large page rather than pointing at the
    /// next table level.
    pub fn ps(self) -> bool {
        self.0 & Self::PS != 0
    }
    /// Whether the page-level write-through bit is set.
    pub fn pwt(self) -> bool {
        self.0 & Self::PWT != 0
    }
    /// Whether the page-level cache-disable bit is set.
    pub fn pcd(self) -> bool {
        self.0 & Self::PCD != 0
    }
    /// The PAT bit. On a 4K PTE this is bit 7 (aliases [`Self::ps`] in the
    /// raw layout, since a PTE has no page-size bit of its own); on a 2M/1G
    /// leaf PDE/PDPTE it is bit 12. Callers that already know the entry is
    /// a 4K PTE can read this directly; large-page PAT lives above the
    /// frame mask and isn't modeled here since the shadow engine never
    /// forwards large-page memory typing as-is.
    pub fn pat_4k(self) -> bool {
        self.0 & Self::PS != 0
    }
    /// Whether the global bit is set. Only meaningful on a leaf entry.
    pub fn global(self) -> bool {
        self.0 & Self::G != 0
    }
    /// Whether the execute-disable bit is set.
    pub fn xd(self) -> bool {
        self.0 & Self::XD != 0
    }
    /// Extract the frame/next-table address under `mask`.
    pub fn frame(self, mask: u64) -> u64 {
        self.0 & mask
    }
    fn with_a(self) -> u64 {
        self.0 | Self::A
    }
    fn with_ad(self) -> u64 {
        self.0 | Self::A | Self::D
    }
}

bitflags::bitflags! {
    /// Translation-access descriptor: what kind of access is being
    /// validated.
    pub struct Access: u32 {
        /// The access is a write.
        const WRITE = 1 << 0;
        /// The access originates from CPL 3.
        const USER = 1 << 1;
        /// The access is an instruction fetch.
        const EXEC = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Architectural page-fault error code bits (SDM Vol. 3A, 4.7).
    pub struct Pfec: u32 {
        /// Fault occurred on a present entry (permission violation) rather
        /// than a not-present one.
        const P = 1 << 0;
        /// Fault occurred on a write.
        const W = 1 << 1;
        /// Fault occurred in user mode.
        const U = 1 << 2;
        /// Fault was caused by reserved bits set to 1 in a paging entry.
        const RSVD = 1 << 3;
        /// Fault occurred on an instruction fetch.
        const ID = 1 << 4;
    }
}

bitflags::bitflags! {
    /// The three EFER bits the walker cares about.
    pub struct Efer: u64 {
        /// Long-mode enable.
        const LME = 1 << 8;
        /// Long-mode active (CR0.PG=1 && CR4.PAE=1 && LME=1).
        const LMA = 1 << 10;
        /// No-execute enable.
        const NXE = 1 << 11;
    }
}

const CR0_PG: u64 = 1 << 31;
const CR0_WP: u64 = 1 << 16;
const CR4_PSE: u64 = 1 << 4;
const CR4_PAE: u64 = 1 << 5;

/// CR0/CR3/CR4/EFER as cached on the vCPU. Everything the walker needs to
/// pick a paging mode and enforce supervisor/NX semantics.
#[derive(Clone, Copy, Debug)]
pub struct GuestPagingState {
    /// Guest CR0.
    pub cr0: u64,
    /// Guest CR3.
    pub cr3: u64,
    /// Guest CR4.
    pub cr4: u64,
    /// Guest EFER.
    pub efer: Efer,
}

/// Paging-mode tag, derived solely from `(CR0.PG, CR4.PAE, EFER.LMA)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// CR0.PG=0: guest-linear == guest-physical.
    Flat,
    /// CR0.PG=1, CR4.PAE=0: classic 32-bit two-level paging.
    TwoLevel,
    /// CR0.PG=1, CR4.PAE=1, EFER.LMA=0: PAE (3-level) paging.
    Pae,
    /// CR0.PG=1, CR4.PAE=1, EFER.LMA=1: IA-32e four-level paging.
    Pml4,
}

impl PagingMode {
    /// Classify `state` into one of the four paging modes.
    pub fn from_state(state: &GuestPagingState) -> Self {
        if state.cr0 & CR0_PG == 0 {
            PagingMode::Flat
        } else if state.cr4 & CR4_PAE == 0 {
            PagingMode::TwoLevel
        } else if state.efer.contains(Efer::LMA) {
            PagingMode::Pml4
        } else {
            PagingMode::Pae
        }
    }
}

/// Outcome of a walk, carrying enough to reconstruct the spec's packed
/// result code via [`TranslateResult::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateResult {
    /// Translation succeeded.
    Ok {
        /// Resulting guest-physical address.
        gpa: u64,
        /// log2 of the translation unit: 12, 21, 22 or 30.
        order: u32,
        /// The leaf entry the translation terminated on, permission bits
        /// and all. Callers that need to derive a shadow mapping (the
        /// vTLB engine) read W/D/G/XD/PWT/PCD off this instead of
        /// re-walking. For `PagingMode::Flat`, a synthetic fully
        /// permissive entry (P|W|U, no XD) since there is nothing to read.
        leaf: GuestEntry,
    },
    /// Translation failed with an architectural page fault; the error code
    /// is already fully formed (P/W/U/RSVD/ID).
    Fault(Pfec),
    /// The resolved GPA has no host backing. Not a page fault: the caller
    /// decides whether this is fatal.
    Gp2Hp,
}

impl TranslateResult {
    /// Marker bit for any page-fault result.
    pub const FAULT_MARKER: u32 = 0x8000_0000;
    /// Marker bit for a GPA-with-no-host-backing result.
    pub const GP2HP_MARKER: u32 = 0x4000_0000;

    /// Pack this result into the spec's wire-format result code.
    pub fn code(self) -> u32 {
        match self {
            TranslateResult::Ok { .. } => 0,
            TranslateResult::Gp2Hp => Self::GP2HP_MARKER,
            TranslateResult::Fault(pfec) => Self::FAULT_MARKER | pfec.bits(),
        }
    }
}

/// Guest-physical-address-indexed access to paging structures, as seen by
/// the walker. Implemented by the vTLB engine and the memory gateway over
/// whatever mapping of guest RAM they already maintain.
///
/// `cas32`/`cas64` implement the compare-and-swap used to set A/D bits
/// without silently clobbering a concurrent guest write to the same entry;
/// a CAS failure means the walk must restart from CR3.
pub trait PagingMemory {
    /// Read a 4-byte paging entry at `gpa`. `None` if the GPA has no host
    /// backing.
    fn read32(&self, gpa: u64) -> Option<u32>;
    /// Read an 8-byte paging entry at `gpa`. `None` if the GPA has no host
    /// backing.
    fn read64(&self, gpa: u64) -> Option<u64>;
    /// Compare-and-swap a 4-byte entry.
    fn cas32(&self, gpa: u64, old: u32, new: u32) -> bool;
    /// Compare-and-swap an 8-byte entry.
    fn cas64(&self, gpa: u64, old: u64, new: u64) -> bool;
}

const fn bits_range(lo: u32, hi: u32) -> u64 {
    if hi >= 63 {
        !((1u64 << lo) - 1)
    } else {
        ((1u64 << (hi + 1)) - 1) & !((1u64 << lo) - 1)
    }
}

// Bits 52..62 are reserved in every 8-byte paging entry under the
// conservative assumption of a 52-bit MAXPHYADDR; bit 63 (XD) is checked
// separately against EFER.NXE.
const RESERVED_PHYS_HIGH: u64 = bits_range(52, 62);
const FRAME_MASK_4K: u64 = bits_range(12, 51);
const FRAME_MASK_2M: u64 = bits_range(21, 51);
const FRAME_MASK_1G: u64 = bits_range(30, 51);

// Legacy (non-IA32e) PAE PDPTE: bits 1-2 and 5-8 must be zero, and since
// EFER.LME=0 here, bit 63 (XD) must be zero regardless of NXE.
const PAE_PDPTE_RESERVED_MASK: u64 =
    bits_range(1, 2) | bits_range(5, 8) | bits_range(63, 63) | RESERVED_PHYS_HIGH;
// 2 MiB leaf PDE: bit 12 is PAT, bits 13-20 must be zero.
const RESERVED_2M_MASK: u64 = bits_range(13, 20) | RESERVED_PHYS_HIGH;
// 1 GiB leaf PDPTE (IA-32e only): bit 12 is PAT, bits 13-29 must be zero.
const RESERVED_1G_MASK: u64 = bits_range(13, 29) | RESERVED_PHYS_HIGH;

/// Translate `gva` under `state`'s paging mode. `update_ad=true` sets A on
/// every traversed entry and D on the leaf (if the access is a write),
/// restarting the walk on CAS loss.
pub fn translate<M: PagingMemory>(
    mem: &M,
    state: &GuestPagingState,
    gva: u64,
    access: Access,
    update_ad: bool,
    is_fetch: bool,
) -> TranslateResult {
    match PagingMode::from_state(state) {
        PagingMode::Flat => TranslateResult::Ok {
            gpa: gva,
            order: 12,
            leaf: GuestEntry(GuestEntry::P | GuestEntry::RW | GuestEntry::US),
        },
        PagingMode::TwoLevel => walk_two_level(mem, state, gva, access, update_ad, is_fetch),
        PagingMode::Pae => walk_pae(mem, state, gva, access, update_ad, is_fetch),
        PagingMode::Pml4 => walk_pml4(mem, state, gva, access, update_ad, is_fetch),
    }
}

fn not_present(access: Access, is_fetch: bool) -> TranslateResult {
    TranslateResult::Fault(pfec(false, false, access, is_fetch))
}

fn reserved(access: Access, is_fetch: bool) -> TranslateResult {
    TranslateResult::Fault(pfec(true, true, access, is_fetch))
}

/// XD (bit 63) is reserved, not merely a fetch-permission bit, whenever
/// `EFER.NXE=0` — the processor faults on any access, not just fetches.
fn xd_reserved(entry: GuestEntry, state: &GuestPagingState) -> bool {
    entry.xd() && !state.efer.contains(Efer::NXE)
}

fn pfec(present: bool, rsvd: bool, access: Access, is_fetch: bool) -> Pfec {
    let mut f = Pfec::empty();
    if present {
        f |= Pfec::P;
    }
    if access.contains(Access::WRITE) {
        f |= Pfec::W;
    }
    if access.contains(Access::USER) {
        f |= Pfec::U;
    }
    if rsvd {
        f |= Pfec::RSVD;
    }
    if is_fetch {
        f |= Pfec::ID;
    }
    f
}

/// Root-to-leaf W/U/XD check (§4.2 point 4). `None` means permission
/// granted.
fn check_permissions(
    entries: &[GuestEntry],
    access: Access,
    state: &GuestPagingState,
    is_fetch: bool,
) -> Option<TranslateResult> {
    if access.contains(Access::WRITE) && !entries.iter().all(|e| e.writable()) {
        let supervisor_write_ok = !access.contains(Access::USER) && state.cr0 & CR0_WP == 0;
        if !supervisor_write_ok {
            return Some(TranslateResult::Fault(pfec(true, false, access, is_fetch)));
        }
    }
    if access.contains(Access::USER) && !entries.iter().all(|e| e.user()) {
        return Some(TranslateResult::Fault(pfec(true, false, access, is_fetch)));
    }
    if is_fetch && state.efer.contains(Efer::NXE) && entries.iter().any(|e| e.xd()) {
        return Some(TranslateResult::Fault(pfec(true, false, access, is_fetch)));
    }
    None
}

/// Set A (and D, if `dirty`) on the entry at `gpa` via CAS. Returns `false`
/// on CAS loss, meaning the caller must restart the whole walk.
fn cas_set_ad32<M: PagingMemory>(mem: &M, gpa: u64, entry: GuestEntry, dirty: bool) -> bool {
    let old = entry.0 as u32;
    let new = if dirty { entry.with_ad() } else { entry.with_a() } as u32;
    new == old || mem.cas32(gpa, old, new)
}

fn cas_set_ad64<M: PagingMemory>(mem: &M, gpa: u64, entry: GuestEntry, dirty: bool) -> bool {
    let old = entry.0;
    let new = if dirty { entry.with_ad() } else { entry.with_a() };
    new == old || mem.cas64(gpa, old, new)
}

fn walk_two_level<M: PagingMemory>(
    mem: &M,
    state: &GuestPagingState,
    gva: u64,
    access: Access,
    update_ad: bool,
    is_fetch: bool,
) -> TranslateResult {
    let pse = state.cr4 & CR4_PSE != 0;
    let pd_base = state.cr3 & 0xFFFF_F000;
    let pde_gpa = pd_base + ((gva >> 22) & 0x3FF) * 4;
    let pde_raw = match mem.read32(pde_gpa) {
        Some(v) => v,
        None => return TranslateResult::Gp2Hp,
    };
    let pde = GuestEntry(pde_raw as u64);
    if !pde.present() {
        return not_present(access, is_fetch);
    }

    if pde.ps() && pse {
        // 4 MiB page: bits 13-20 reserved, bit 12 is PAT.
        if pde_raw & 0x003F_E000 != 0 {
            return reserved(access, is_fetch);
        }
        if let Some(fault) = check_permissions(&[pde], access, state, is_fetch) {
            return fault;
        }
        if update_ad && !cas_set_ad32(mem, pde_gpa, pde, access.contains(Access::WRITE)) {
            return walk_two_level(mem, state, gva, access, update_ad, is_fetch);
        }
        let frame = (pde_raw as u64) & 0xFFC0_0000;
        return TranslateResult::Ok {
            gpa: frame | (gva & 0x003F_FFFF),
            order: 22,
            leaf: pde,
        };
    }

    let pt_base = (pde_raw as u64) & 0xFFFF_F000;
    let pte_gpa = pt_base + ((gva >> 12) & 0x3FF) * 4;
    let pte_raw = match mem.read32(pte_gpa) {
        Some(v) => v,
        None => return TranslateResult::Gp2Hp,
    };
    let pte = GuestEntry(pte_raw as u64);
    if !pte.present() {
        return not_present(access, is_fetch);
    }
    if let Some(fault) = check_permissions(&[pde, pte], access, state, is_fetch) {
        return fault;
    }
    if update_ad {
        if !cas_set_ad32(mem, pde_gpa, pde, false) {
            return walk_two_level(mem, state, gva, access, update_ad, is_fetch);
        }
        if !cas_set_ad32(mem, pte_gpa, pte, access.contains(Access::WRITE)) {
            return walk_two_level(mem, state, gva, access, update_ad, is_fetch);
        }
    }
    TranslateResult::Ok {
        gpa: ((pte_raw as u64) & 0xFFFF_F000) | (gva & 0xFFF),
        order: 12,
        leaf: pte,
    }
}

fn walk_pae<M: PagingMemory>(
    mem: &M,
    state: &GuestPagingState,
    gva: u64,
    access: Access,
    update_ad: bool,
    is_fetch: bool,
) -> TranslateResult {
    let pdpt_base = state.cr3 & 0xFFFF_FFE0;
    let pdpte_gpa = pdpt_base + ((gva >> 30) & 0x3) * 8;
    let pdpte_raw = match mem.read64(pdpte_gpa) {
        Some(v) => v,
        None => return TranslateResult::Gp2Hp,
    };
    let pdpte = GuestEntry(pdpte_raw);
    if !pdpte.present() {
        return not_present(access, is_fetch);
    }
    if pdpte_raw & PAE_PDPTE_RESERVED_MASK != 0 {
        return reserved(access, is_fetch);
    }

    let pd_base = pdpte.frame(FRAME_MASK_4K);
    let pde_gpa = pd_base + ((gva >> 21) & 0x1FF) * 8;
    let pde_raw = match mem.read64(pde_gpa) {
        Some(v) => v,
        None => return TranslateResult::Gp2Hp,
    };
    let pde = GuestEntry(pde_raw);
    if !pde.present() {
        return not_present(access, is_fetch);
    }

    if pde.ps() {
        if pde_raw & RESERVED_2M_MASK != 0 || xd_reserved(pde, state) {
            return reserved(access, is_fetch);
        }
        if let Some(fault) = check_permissions(&[pdpte, pde], access, state, is_fetch) {
            return fault;
        }
        if update_ad && !cas_set_ad64(mem, pde_gpa, pde, access.contains(Access::WRITE)) {
            return walk_pae(mem, state, gva, access, update_ad, is_fetch);
        }
        return TranslateResult::Ok {
            gpa: pde.frame(FRAME_MASK_2M) | (gva & 0x1F_FFFF),
            order: 21,
            leaf: pde,
        };
    }
    if pde_raw & RESERVED_PHYS_HIGH != 0 || xd_reserved(pde, state) {
        return reserved(access, is_fetch);
    }

    let pt_base = pde.frame(FRAME_MASK_4K);
    let pte_gpa = pt_base + ((gva >> 12) & 0x1FF) * 8;
    let pte_raw = match mem.read64(pte_gpa) {
        Some(v) => v,
        None => return TranslateResult::Gp2Hp,
    };
    let pte = GuestEntry(pte_raw);
    if !pte.present() {
        return not_present(access, is_fetch);
    }
    if pte_raw & RESERVED_PHYS_HIGH != 0 || xd_reserved(pte, state) {
        return reserved(access, is_fetch);
    }
    if let Some(fault) = check_permissions(&[pdpte, pde, pte], access, state, is_fetch) {
        return fault;
    }
    if update_ad {
        if !cas_set_ad64(mem, pde_gpa, pde, false) {
            return walk_pae(mem, state, gva, access, update_ad, is_fetch);
        }
        if !cas_set_ad64(mem, pte_gpa, pte, access.contains(Access::WRITE)) {
            return walk_pae(mem, state, gva, access, update_ad, is_fetch);
        }
    }
    TranslateResult::Ok {
        gpa: pte.frame(FRAME_MASK_4K) | (gva & 0xFFF),
        order: 12,
        leaf: pte,
    }
}

fn walk_pml4<M: PagingMemory>(
    mem: &M,
    state: &GuestPagingState,
    gva: u64,
    access: Access,
    update_ad: bool,
    is_fetch: bool,
) -> TranslateResult {
    let pml4_base = state.cr3 & FRAME_MASK_4K;
    let pml4e_gpa = pml4_base + ((gva >> 39) & 0x1FF) * 8;
    let pml4e_raw = match mem.read64(pml4e_gpa) {
        Some(v) => v,
        None => return TranslateResult::Gp2Hp,
    };
    let pml4e = GuestEntry(pml4e_raw);
    if !pml4e.present() {
        return not_present(access, is_fetch);
    }
    if pml4e_raw & (bits_range(7, 7) | RESERVED_PHYS_HIGH) != 0 || xd_reserved(pml4e, state) {
        return reserved(access, is_fetch);
    }

    let pdpt_base = pml4e.frame(FRAME_MASK_4K);
    let pdpte_gpa = pdpt_base + ((gva >> 30) & 0x1FF) * 8;
    let pdpte_raw = match mem.read64(pdpte_gpa) {
        Some(v) => v,
        None => return TranslateResult::Gp2Hp,
    };
    let pdpte = GuestEntry(pdpte_raw);
    if !pdpte.present() {
        return not_present(access, is_fetch);
    }

    if pdpte.ps() {
        if pdpte_raw & RESERVED_1G_MASK != 0 || xd_reserved(pdpte, state) {
            return reserved(access, is_fetch);
        }
        if let Some(fault) = check_permissions(&[pml4e, pdpte], access, state, is_fetch) {
            return fault;
        }
        if update_ad {
            if !cas_set_ad64(mem, pml4e_gpa, pml4e, false) {
                return walk_pml4(mem, state, gva, access, update_ad, is_fetch);
            }
            if !cas_set_ad64(mem, pdpte_gpa, pdpte, access.contains(Access::WRITE)) {
                return walk_pml4(mem, state, gva, access, update_ad, is_fetch);
            }
        }
        return TranslateResult::Ok {
            gpa: pdpte.frame(FRAME_MASK_1G) | (gva & 0x3FFF_FFFF),
            order: 30,
            leaf: pdpte,
        };
    }
    if pdpte_raw & RESERVED_PHYS_HIGH != 0 || xd_reserved(pdpte, state) {
        return reserved(access, is_fetch);
    }

    let pd_base = pdpte.frame(FRAME_MASK_4K);
    let pde_gpa = pd_base + ((gva >> 21) & 0x1FF) * 8;
    let pde_raw = match mem.read64(pde_gpa) {
        Some(v) => v,
        None => return TranslateResult::Gp2Hp,
    };
    let pde = GuestEntry(pde_raw);
    if !pde.present() {
        return not_present(access, is_fetch);
    }

    if pde.ps() {
        if pde_raw & RESERVED_2M_MASK != 0 || xd_reserved(pde, state) {
            return reserved(access, is_fetch);
        }
        if let Some(fault) = check_permissions(&[pml4e, pdpte, pde], access, state, is_fetch) {
            return fault;
        }
        if update_ad {
            if !cas_set_ad64(mem, pml4e_gpa, pml4e, false) {
                return walk_pml4(mem, state, gva, access, update_ad, is_fetch);
            }
            if !cas_set_ad64(mem, pdpte_gpa, pdpte, false) {
                return walk_pml4(mem, state, gva, access, update_ad, is_fetch);
            }
            if !cas_set_ad64(mem, pde_gpa, pde, access.contains(Access::WRITE)) {
                return walk_pml4(mem, state, gva, access, update_ad, is_fetch);
            }
        }
        return TranslateResult::Ok {
            gpa: pde.frame(FRAME_MASK_2M) | (gva & 0x1F_FFFF),
            order: 21,
            leaf: pde,
        };
    }
    if pde_raw & RESERVED_PHYS_HIGH != 0 || xd_reserved(pde, state) {
        return reserved(access, is_fetch);
    }

    let pt_base = pde.frame(FRAME_MASK_4K);
    let pte_gpa = pt_base + ((gva >> 12) & 0x1FF) * 8;
    let pte_raw = match mem.read64(pte_gpa) {
        Some(v) => v,
        None => return TranslateResult::Gp2Hp,
    };
    let pte = GuestEntry(pte_raw);
    if !pte.present() {
        return not_present(access, is_fetch);
    }
    if pte_raw & RESERVED_PHYS_HIGH != 0 || xd_reserved(pte, state) {
        return reserved(access, is_fetch);
    }
    if let Some(fault) = check_permissions(&[pml4e, pdpte, pde, pte], access, state, is_fetch) {
        return fault;
    }
    if update_ad {
        if !cas_set_ad64(mem, pml4e_gpa, pml4e, false) {
            return walk_pml4(mem, state, gva, access, update_ad, is_fetch);
        }
        if !cas_set_ad64(mem, pdpte_gpa, pdpte, false) {
            return walk_pml4(mem, state, gva, access, update_ad, is_fetch);
        }
        if !cas_set_ad64(mem, pde_gpa, pde, false) {
            return walk_pml4(mem, state, gva, access, update_ad, is_fetch);
        }
        if !cas_set_ad64(mem, pte_gpa, pte, access.contains(Access::WRITE)) {
            return walk_pml4(mem, state, gva, access, update_ad, is_fetch);
        }
    }
    TranslateResult::Ok {
        gpa: pte.frame(FRAME_MASK_4K) | (gva & 0xFFF),
        order: 12,
        leaf: pte,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MockMem(RefCell<HashMap<u64, u64>>);

    impl MockMem {
        fn new() -> Self {
            Self(RefCell::new(HashMap::new()))
        }
        fn set(&self, gpa: u64, val: u64) {
            self.0.borrow_mut().insert(gpa, val);
        }
        fn get(&self, gpa: u64) -> u64 {
            *self.0.borrow().get(&gpa).unwrap_or(&0)
        }
    }

    impl PagingMemory for MockMem {
        // Untouched guest RAM reads back as zero (present bit clear), not
        // as unbacked (`Gp2Hp`); only addresses nobody ever wrote to at
        // all are out of range for these tests, which don't exercise that
        // path.
        fn read32(&self, gpa: u64) -> Option<u32> {
            Some(self.get(gpa) as u32)
        }
        fn read64(&self, gpa: u64) -> Option<u64> {
            Some(self.get(gpa))
        }
        fn cas32(&self, gpa: u64, old: u32, new: u32) -> bool {
            let mut m = self.0.borrow_mut();
            let cur = m.get(&gpa).copied().unwrap_or(0) as u32;
            if cur == old {
                m.insert(gpa, new as u64);
                true
            } else {
                false
            }
        }
        fn cas64(&self, gpa: u64, old: u64, new: u64) -> bool {
            let mut m = self.0.borrow_mut();
            let cur = m.get(&gpa).copied().unwrap_or(0);
            if cur == old {
                m.insert(gpa, new);
                true
            } else {
                false
            }
        }
    }

    #[test]
    fn flat_mode_is_identity() {
        let mem = MockMem::new();
        let state = GuestPagingState {
            cr0: 0,
            cr3: 0,
            cr4: 0,
            efer: Efer::empty(),
        };
        let r = translate(&mem, &state, 0xdead_beef, Access::empty(), false, false);
        match r {
            TranslateResult::Ok { gpa, order, .. } => {
                assert_eq!(gpa, 0xdead_beef);
                assert_eq!(order, 12);
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    /// Scenario 5: PAE 2 MiB page without the A-bit pre-set.
    #[test]
    fn pae_2mb_page_sets_accessed_bit() {
        let mem = MockMem::new();
        mem.set(0x2000, 0x3000 | GuestEntry::P);
        mem.set(0x3000, 0x100000 | GuestEntry::P | GuestEntry::RW | GuestEntry::US | GuestEntry::PS);

        let state = GuestPagingState {
            cr0: CR0_PG,
            cr3: 0x2000,
            cr4: CR4_PAE,
            efer: Efer::empty(),
        };
        let r = translate(&mem, &state, 0x1F_FFFF, Access::USER, true, false);
        match r {
            TranslateResult::Ok { gpa, order, .. } => {
                assert_eq!(gpa, 0x1F_FFFF);
                assert_eq!(order, 21);
            }
            other => panic!("expected Ok, got {:?}", other),
        }
        assert_eq!(mem.get(0x3000) & GuestEntry::A, GuestEntry::A);
        assert_eq!(mem.get(0x3000) & GuestEntry::D, 0);
    }

    #[test]
    fn two_level_not_present_reports_access_bits() {
        let mem = MockMem::new();
        let state = GuestPagingState {
            cr0: CR0_PG,
            cr3: 0,
            cr4: 0,
            efer: Efer::empty(),
        };
        let r = translate(&mem, &state, 0x1000, Access::WRITE | Access::USER, true, false);
        match r {
            TranslateResult::Fault(pfec) => {
                assert!(!pfec.contains(Pfec::P));
                assert!(pfec.contains(Pfec::W));
                assert!(pfec.contains(Pfec::U));
            }
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn supervisor_write_to_readonly_page_succeeds_when_wp_clear() {
        let mem = MockMem::new();
        // PDE present+writable+supervisor, PTE present+supervisor, read-only.
        mem.set(0x1000, 0x2000 | GuestEntry::P | GuestEntry::RW);
        mem.set(0x2000, 0x3000 | GuestEntry::P);

        let state = GuestPagingState {
            cr0: CR0_PG,
            cr3: 0x1000,
            cr4: 0,
            efer: Efer::empty(),
        };
        let r = translate(&mem, &state, 0, Access::WRITE, true, false);
        match r {
            TranslateResult::Ok { gpa, order, .. } => {
                assert_eq!(gpa, 0x3000);
                assert_eq!(order, 12);
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn supervisor_write_to_readonly_page_faults_when_wp_set() {
        let mem = MockMem::new();
        mem.set(0x1000, 0x2000 | GuestEntry::P | GuestEntry::RW);
        mem.set(0x2000, 0x3000 | GuestEntry::P);

        let state = GuestPagingState {
            cr0: CR0_PG | CR0_WP,
            cr3: 0x1000,
            cr4: 0,
            efer: Efer::empty(),
        };
        let r = translate(&mem, &state, 0, Access::WRITE, true, false);
        match r {
            TranslateResult::Fault(pfec) => assert!(pfec.contains(Pfec::P) && pfec.contains(Pfec::W)),
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn xd_bit_is_reserved_unless_nxe_set() {
        // PAE mode (CR4.PAE=1, EFER.LMA=0) so the PTE's bit 63 is meaningful.
        let mem = MockMem::new();
        mem.set(0x500, 0x1000 | GuestEntry::P);
        mem.set(0x1000, 0x2000 | GuestEntry::P | GuestEntry::RW);
        mem.set(0x2000, 0x3000 | GuestEntry::P | GuestEntry::RW | GuestEntry::XD);

        let state_no_nxe = GuestPagingState {
            cr0: CR0_PG,
            cr3: 0x500,
            cr4: CR4_PAE,
            efer: Efer::empty(),
        };
        // With EFER.NXE=0, bit 63 is reserved outright: even a plain read
        // faults, not just a fetch.
        match translate(&mem, &state_no_nxe, 0, Access::empty(), false, false) {
            TranslateResult::Fault(pfec) => assert!(pfec.contains(Pfec::RSVD)),
            other => panic!("expected reserved-bit fault, got {:?}", other),
        }
        match translate(&mem, &state_no_nxe, 0, Access::EXEC, false, true) {
            TranslateResult::Fault(pfec) => assert!(pfec.contains(Pfec::RSVD)),
            other => panic!("expected reserved-bit fault, got {:?}", other),
        }

        let state_nxe = GuestPagingState {
            cr0: CR0_PG,
            cr3: 0x500,
            cr4: CR4_PAE,
            efer: Efer::NXE,
        };
        // With NXE=1 the bit is a legitimate no-execute marker: fetches are
        // denied but ordinary accesses still succeed.
        match translate(&mem, &state_nxe, 0, Access::empty(), false, false) {
            TranslateResult::Ok { gpa, order, .. } => {
                assert_eq!(gpa, 0x3000);
                assert_eq!(order, 12);
            }
            other => panic!("expected Ok, got {:?}", other),
        }
        match translate(&mem, &state_nxe, 0, Access::EXEC, false, true) {
            TranslateResult::Fault(pfec) => assert!(pfec.contains(Pfec::ID) && !pfec.contains(Pfec::RSVD)),
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn code_packs_marker_and_pfec() {
        let ok = TranslateResult::Ok {
            gpa: 0,
            order: 12,
            leaf: GuestEntry(GuestEntry::P),
        };
        assert_eq!(ok.code(), 0);
        let gp2hp = TranslateResult::Gp2Hp;
        assert_eq!(gp2hp.code(), TranslateResult::GP2HP_MARKER);
        let fault = TranslateResult::Fault(Pfec::P | Pfec::W);
        assert_eq!(fault.code(), TranslateResult::FAULT_MARKER | 0x3);
    }
}
