//! Software vTLB shadow engine.
//!
//! On hosts without EPT, [`crate::paging`]'s walker still validates every
//! guest access, but the hardware has to be given *something* to walk on
//! every memory reference, not just on the rare ones this core intercepts.
//! This module maintains a real, hardware-walkable shadow page table (legacy
//! PAE format, loaded into `GUEST_CR3` while non-root mode runs) that mirrors
//! whatever the guest's own tables currently resolve to, built lazily off
//! page faults rather than eagerly off the guest tables.
//!
//! The shadow is always PAE-format two-level (PDPT -> PD -> PT) regardless
//! of which of the four modes [`crate::paging::PagingMode`] the guest itself
//! is in: a flat, 2-level or PML4 guest translation all collapse down to one
//! 4 KiB shadow PTE per guest page once the walker has resolved it. This
//! mirrors the PAE shadow layout the teaching materials describe for
//! `project3`'s EPT code, just keyed off the walker instead of off
//! identity-mapped host frames.
//!
//! Table pages are managed through three lists rather than a simple
//! allocate/free pair, per the component design's arena note: `free`
//! (unused, immediately reusable), `used` (currently mapped into the
//! shadow), and `igo` ("in guest operation" -- unmapped on the last flush
//! but not yet safe to hand back to `free`, since hardware may still be
//! mid-walk through them until the *next* flush proves otherwise). Each
//! [`Vtlb::invalidate_all`] call recycles the previous round's `igo` into
//! `free` before producing a new `igo` batch, giving any in-flight hardware
//! walk exactly one full flush cycle to drain.

use crate::paging::{self, Access, GuestEntry, GuestPagingState, PagingMemory, PagingMode, Pfec, TranslateResult};
use abyss::addressing::Pa;
use alloc::vec::Vec;

/// Maximum number of shadow PT pages kept alive at once. Past this the
/// engine recycles from `igo` rather than asking [`PageSource`] for more
/// host memory -- a vCPU with a pathological working set degrades to more
/// frequent re-faulting, not unbounded growth.
const MAX_PT_PAGES: usize = 256;

const PDE_FLAGS: u64 = 0x7; // P | RW | US -- the PDPTE/PDE pass permission
                            // checks down to the PTE; only the PTE itself
                            // carries the guest's actual leaf permissions.

/// One page-table-sized (512 x `u64`) page, wherever it actually lives.
/// Implemented over [`keos::mm::Page`] in the lifecycle layer and over a
/// plain boxed array in tests.
pub trait TablePage {
    /// Host-physical address of this page. Must be 4 KiB aligned.
    fn hpa(&self) -> Pa;
    /// Mutable view of the 512 table entries.
    fn entries_mut(&mut self) -> &mut [u64; 512];
    /// Read-only view of the 512 table entries.
    fn entries(&self) -> &[u64; 512];
}

/// Supplies fresh, zeroed table pages to the vTLB engine. The only way the
/// engine touches host memory allocation.
pub trait PageSource {
    /// Concrete table-page type this source hands out.
    type Page: TablePage;
    /// Allocate one zeroed page. `None` means host memory is exhausted.
    fn alloc_page(&self) -> Option<Self::Page>;
}

/// Resolves a guest-physical leaf address to the host-physical frame that
/// backs it. Implemented by [`crate::memory::MemoryGateway`] over whatever
/// GPA->HVA bookkeeping the lifecycle layer maintains.
pub trait GpaResolver {
    /// Host-physical frame backing the page containing `gpa`, if any.
    fn gpa_to_hpa(&self, gpa: u64) -> Option<Pa>;
}

/// What the caller should do after [`Vtlb::handle_page_fault`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtlbOutcome {
    /// The shadow was updated; re-entering the guest at the same RIP will
    /// now hit the freshly installed mapping.
    Resume,
    /// The guest's own tables faulted; re-inject this as an architectural
    /// `#PF` with `cr2=gva` and this error code.
    InjectPageFault(Pfec),
    /// The guest-physical address the walk resolved to has no host
    /// backing. Not a `#PF` -- the caller (typically the vmexit handler)
    /// decides whether this is an MMIO access or a fatal misconfiguration.
    Gp2Hp,
}

struct PtSlot<P: TablePage> {
    page: P,
    /// Set once any installed PTE in this page carries the guest's global
    /// bit. Lets a non-global-only flush skip the page entirely instead of
    /// walking all 512 entries to find nothing to clear.
    has_global: bool,
}

/// A live PAE-format shadow page table plus the bookkeeping needed to keep
/// it consistent with the guest's own tables without ever re-walking more
/// of the guest's tree than a single fault requires.
pub struct Vtlb<S: PageSource> {
    pdpte: S::Page,
    pd: [S::Page; 4],
    arena: Vec<Option<PtSlot<S::Page>>>,
    free: Vec<u32>,
    used: Vec<u32>,
    igo: Vec<u32>,
    /// `meta[quadrant * 512 + pd_slot]` -> arena handle of the PT page
    /// currently backing that PDE, if one has been installed.
    meta: Vec<Option<u32>>,
    mode: Option<PagingMode>,
    cr3_loaded: Option<u64>,
    needs_cr3_reload: bool,
}

fn shadow_pte(hpa_frame: u64, leaf: GuestEntry) -> u64 {
    let mut bits = 0x1u64; // P
    // Write iff guest W=1 AND D=1: a writable-but-clean guest PTE still
    // needs the write fault through to set D, so the shadow stays read-only
    // until that happens.
    if leaf.writable() && leaf.dirty() {
        bits |= 1 << 1;
    }
    if leaf.user() {
        bits |= 1 << 2;
    }
    if leaf.pwt() {
        bits |= 1 << 3;
    }
    if leaf.pcd() {
        bits |= 1 << 4;
    }
    if leaf.accessed() {
        bits |= 1 << 5;
    }
    if leaf.dirty() {
        bits |= 1 << 6;
    }
    if leaf.global() {
        bits |= 1 << 8;
    }
    if leaf.xd() {
        bits |= 1 << 63;
    }
    bits | hpa_frame
}

impl<S: PageSource> Vtlb<S> {
    /// Build an empty shadow over `source`. `None` if the initial five
    /// pages (one PDPT, four PDs) can't be allocated.
    pub fn new(source: &S) -> Option<Self> {
        let pdpte = source.alloc_page()?;
        let pd0 = source.alloc_page()?;
        let pd1 = source.alloc_page()?;
        let pd2 = source.alloc_page()?;
        let pd3 = source.alloc_page()?;
        let mut pdpte = pdpte;
        let pd = [pd0, pd1, pd2, pd3];
        for (i, p) in pd.iter().enumerate() {
            // Legacy (non-IA32e) PAE PDPTE: only P may be set, per
            // PAE_PDPTE_RESERVED_MASK in the walker -- the CPU checks this
            // on every CR3/CR4.PAE load, not just on a TLB fill.
            pdpte.entries_mut()[i] = unsafe { p.hpa().into_usize() } as u64 | 0x1;
        }
        Some(Self {
            pdpte,
            pd,
            arena: Vec::new(),
            free: Vec::new(),
            used: Vec::new(),
            igo: Vec::new(),
            meta: alloc::vec![None; 4 * 512],
            mode: None,
            cr3_loaded: None,
            needs_cr3_reload: false,
        })
    }

    /// Host-physical address to load into `GUEST_CR3` while this shadow is
    /// active.
    pub fn root_hpa(&self) -> Pa {
        self.pdpte.hpa()
    }

    /// Whether a CR3 reload is pending since the last call -- the caller is
    /// expected to consume this once per vmexit handling pass and actually
    /// issue the `VMWRITE(GUEST_CR3, root_hpa())`.
    pub fn take_cr3_reload_pending(&mut self) -> bool {
        core::mem::replace(&mut self.needs_cr3_reload, false)
    }

    fn indices(gva: u64) -> (usize, usize, usize) {
        let quadrant = ((gva >> 30) & 0x3) as usize;
        let pd_slot = ((gva >> 21) & 0x1FF) as usize;
        let pt_slot = ((gva >> 12) & 0x1FF) as usize;
        (quadrant, pd_slot, pt_slot)
    }

    fn reset_slot(&mut self, handle: u32) {
        if let Some(slot) = &mut self.arena[handle as usize] {
            for e in slot.page.entries_mut().iter_mut() {
                *e = 0;
            }
            slot.has_global = false;
        }
    }

    fn alloc_pt_page(&mut self, source: &S) -> Option<u32> {
        if let Some(h) = self.free.pop() {
            self.reset_slot(h);
            return Some(h);
        }
        if self.arena.len() < MAX_PT_PAGES {
            if let Some(page) = source.alloc_page() {
                let handle = self.arena.len() as u32;
                self.arena.push(Some(PtSlot { page, has_global: false }));
                return Some(handle);
            }
        }
        // Either the arena is at its cap or the host is out of memory right
        // now: recycle from igo before giving up. A page in igo survived at
        // least one full flush since it was last mapped, so by definition
        // hardware is no longer walking it.
        if let Some(h) = self.igo.pop() {
            self.reset_slot(h);
            return Some(h);
        }
        None
    }

    fn clear_pde(&mut self, global_idx: usize) {
        let quadrant = global_idx / 512;
        let pd_slot = global_idx % 512;
        self.pd[quadrant].entries_mut()[pd_slot] = 0;
    }

    /// Install a shadow PTE mapping `gva`'s containing page to
    /// `hpa_frame`, carrying `leaf`'s permission/typing bits, allocating a
    /// PT page for this PDE slot if none exists yet.
    pub fn install(&mut self, source: &S, gva: u64, leaf: GuestEntry, hpa_frame: Pa) {
        let (quadrant, pd_slot, pt_slot) = Self::indices(gva);
        let global_idx = quadrant * 512 + pd_slot;
        let handle = match self.meta[global_idx] {
            Some(h) => h,
            None => {
                let Some(h) = self.alloc_pt_page(source) else {
                    return;
                };
                self.meta[global_idx] = Some(h);
                self.used.push(h);
                let pt_hpa = match &self.arena[h as usize] {
                    Some(slot) => unsafe { slot.page.hpa().into_usize() } as u64,
                    None => return,
                };
                self.pd[quadrant].entries_mut()[pd_slot] = pt_hpa | PDE_FLAGS;
                h
            }
        };
        let frame_bits = unsafe { hpa_frame.into_usize() } as u64 & !0xFFFu64;
        if let Some(slot) = &mut self.arena[handle as usize] {
            slot.page.entries_mut()[pt_slot] = shadow_pte(frame_bits, leaf);
            slot.has_global |= leaf.global();
        }
    }

    /// Drop the shadow mapping for a single guest-linear page, leaving the
    /// PT page itself (and its other 511 entries) intact. Used for
    /// `INVLPG`.
    pub fn invalidate_addr(&mut self, gva: u64) {
        let (quadrant, pd_slot, pt_slot) = Self::indices(gva);
        let global_idx = quadrant * 512 + pd_slot;
        if let Some(handle) = self.meta[global_idx] {
            if let Some(slot) = &mut self.arena[handle as usize] {
                slot.page.entries_mut()[pt_slot] = 0;
            }
        }
    }

    /// Flush the whole shadow. `keep_global=true` preserves PTEs the guest
    /// marked global (CR3 write without a TLB-wide flush -- `INVLPG` is the
    /// only thing that ever clears a global entry). Recycles the previous
    /// round's `igo` batch into `free` before producing this round's.
    pub fn invalidate_all(&mut self, keep_global: bool) {
        self.free.append(&mut self.igo);

        let drained: Vec<u32> = self.used.drain(..).collect();
        for handle in drained {
            let keep = keep_global
                && self.arena[handle as usize]
                    .as_ref()
                    .map(|s| s.has_global)
                    .unwrap_or(false);
            if keep {
                self.used.push(handle);
                continue;
            }
            // Find and clear whichever PDE slot(s) point at this handle.
            for (idx, m) in self.meta.iter_mut().enumerate() {
                if *m == Some(handle) {
                    *m = None;
                    let quadrant = idx / 512;
                    let pd_slot = idx % 512;
                    self.pd[quadrant].entries_mut()[pd_slot] = 0;
                }
            }
            self.igo.push(handle);
        }
        self.needs_cr3_reload = true;
    }

    /// React to a guest write of a new value into CR3. A same-value
    /// reload is architecturally still a non-global flush; only identical
    /// *and* un-invalidated state would make this a no-op, which this
    /// engine doesn't attempt to detect.
    pub fn on_cr3_write(&mut self, new_cr3: u64) {
        self.invalidate_all(true);
        self.cr3_loaded = Some(new_cr3);
    }

    /// React to a guest `INVLPG gva`.
    pub fn on_invlpg(&mut self, gva: u64) {
        self.invalidate_addr(gva);
        self.needs_cr3_reload = true;
    }

    /// Re-walk the 16-page-aligned window around `gva` and opportunistically
    /// install any neighbor whose guest PTE is already accessed-and-dirty
    /// (i.e. the guest has touched it before, so a shadow miss on it is
    /// likely imminent) and resolves to host memory. This walks the guest's
    /// tables again for each neighbor rather than reading sibling PTEs out
    /// of the page [`paging::translate`] already had mapped, since the
    /// walker doesn't hand back the guest-physical address of the leaf
    /// entry itself -- an acceptable extra cost given prefetch misses are
    /// silent by design.
    fn prefetch_window<M: PagingMemory + GpaResolver>(
        &mut self,
        source: &S,
        mem: &M,
        state: &GuestPagingState,
        gva: u64,
    ) {
        let window_base = gva & !0xFFFF;
        for i in 0..16u64 {
            let addr = window_base + i * 0x1000;
            if addr == gva {
                continue;
            }
            let (q, d, t) = Self::indices(addr);
            if self.meta[q * 512 + d]
                .and_then(|h| self.arena[h as usize].as_ref())
                .map(|s| s.page.entries()[t] != 0)
                .unwrap_or(false)
            {
                continue; // already shadowed
            }
            match paging::translate(mem, state, addr, Access::empty(), false, false) {
                TranslateResult::Ok { gpa, order, leaf } if order == 12 && leaf.accessed() && leaf.dirty() => {
                    let frame_gpa = gpa & !0xFFF;
                    if let Some(hpa) = mem.gpa_to_hpa(frame_gpa) {
                        self.install(source, addr, leaf, hpa);
                    }
                }
                _ => {}
            }
        }
    }

    /// Resolve a `gva` fault: re-walk the guest's own tables, and either
    /// install a fresh shadow PTE for it (plus opportunistically prefetch
    /// its neighbors) or report that the fault belongs to the guest.
    ///
    /// A paging-mode or CR3 change since the last call triggers a full,
    /// non-global-preserving flush first -- the shadow's entire PT/PD
    /// structure is meaningless once the guest has switched address spaces.
    pub fn handle_page_fault<M: PagingMemory + GpaResolver>(
        &mut self,
        source: &S,
        mem: &M,
        state: &GuestPagingState,
        gva: u64,
        access: Access,
    ) -> VtlbOutcome {
        let mode = PagingMode::from_state(state);
        if self.mode != Some(mode) || self.cr3_loaded != Some(state.cr3) {
            self.invalidate_all(false);
            self.mode = Some(mode);
            self.cr3_loaded = Some(state.cr3);
        }

        match paging::translate(mem, state, gva, access, true, access.contains(Access::EXEC)) {
            TranslateResult::Fault(pfec) => VtlbOutcome::InjectPageFault(pfec),
            TranslateResult::Gp2Hp => VtlbOutcome::Gp2Hp,
            TranslateResult::Ok { gpa, leaf, .. } => {
                let frame_gpa = gpa & !0xFFF;
                let Some(hpa) = mem.gpa_to_hpa(frame_gpa) else {
                    return VtlbOutcome::Gp2Hp;
                };
                self.install(source, gva, leaf, hpa);
                self.prefetch_window(source, mem, state, gva);
                VtlbOutcome::Resume
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::Efer;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    struct TestPage {
        hpa: u64,
        entries: [u64; 512],
    }

    impl TablePage for TestPage {
        fn hpa(&self) -> Pa {
            Pa::new(self.hpa as usize).unwrap()
        }
        fn entries_mut(&mut self) -> &mut [u64; 512] {
            &mut self.entries
        }
        fn entries(&self) -> &[u64; 512] {
            &self.entries
        }
    }

    struct TestSource {
        next: RefCell<u64>,
        fail_after: Option<u32>,
        allocs: RefCell<u32>,
    }

    impl TestSource {
        fn new() -> Self {
            Self { next: RefCell::new(0x1000_0000), fail_after: None, allocs: RefCell::new(0) }
        }
        fn limited(n: u32) -> Self {
            Self { next: RefCell::new(0x1000_0000), fail_after: Some(n), allocs: RefCell::new(0) }
        }
    }

    impl PageSource for TestSource {
        type Page = TestPage;
        fn alloc_page(&self) -> Option<TestPage> {
            if let Some(limit) = self.fail_after {
                if *self.allocs.borrow() >= limit {
                    return None;
                }
            }
            *self.allocs.borrow_mut() += 1;
            let mut n = self.next.borrow_mut();
            let addr = *n;
            *n += 0x1000;
            Some(TestPage { hpa: addr, entries: [0; 512] })
        }
    }

    // Flat guest-physical-memory mock doubling as a host-physical resolver:
    // guest-physical == host-physical for every test here, so GpaResolver
    // just echoes the address back.
    struct FlatMem {
        pages: Rc<RefCell<HashMap<u64, [u8; 4096]>>>,
    }

    impl FlatMem {
        fn new() -> Self {
            Self { pages: Rc::new(RefCell::new(HashMap::new())) }
        }
        fn set_entry(&self, gpa: u64, val: u64) {
            let mut pages = self.pages.borrow_mut();
            let base = gpa & !0xFFF;
            let page = pages.entry(base).or_insert([0u8; 4096]);
            let off = (gpa & 0xFFF) as usize;
            page[off..off + 8].copy_from_slice(&val.to_le_bytes());
        }
    }

    impl PagingMemory for FlatMem {
        fn read32(&self, gpa: u64) -> Option<u32> {
            let pages = self.pages.borrow();
            let base = gpa & !0xFFF;
            let off = (gpa & 0xFFF) as usize;
            let page = pages.get(&base)?;
            Some(u32::from_le_bytes(page[off..off + 4].try_into().unwrap()))
        }
        fn read64(&self, gpa: u64) -> Option<u64> {
            let pages = self.pages.borrow();
            let base = gpa & !0xFFF;
            let off = (gpa & 0xFFF) as usize;
            let page = pages.get(&base)?;
            Some(u64::from_le_bytes(page[off..off + 8].try_into().unwrap()))
        }
        fn cas32(&self, gpa: u64, old: u32, new: u32) -> bool {
            if self.read32(gpa) != Some(old) {
                return false;
            }
            self.set_entry(gpa & !0x7, {
                // preserve the other half of the containing u64 on a
                // sub-word CAS, matching how the real mapping would.
                let base64 = self.read64(gpa & !0x7).unwrap_or(0);
                let shift = ((gpa & 0x7) * 8) as u32;
                let mask = !(0xFFFF_FFFFu64 << shift);
                (base64 & mask) | ((new as u64) << shift)
            });
            true
        }
        fn cas64(&self, gpa: u64, old: u64, new: u64) -> bool {
            if self.read64(gpa) != Some(old) {
                return false;
            }
            self.set_entry(gpa, new);
            true
        }
    }

    impl GpaResolver for FlatMem {
        fn gpa_to_hpa(&self, gpa: u64) -> Option<Pa> {
            Pa::new(gpa as usize)
        }
    }

    fn two_level_state(cr3: u64) -> GuestPagingState {
        GuestPagingState { cr0: 1 << 31, cr3, cr4: 0, efer: Efer::empty() }
    }

    fn build_two_level_mapping(mem: &FlatMem, cr3: u64, gva: u64, frame: u64, flags: u64) {
        let pd_index = (gva >> 22) & 0x3FF;
        let pt_index = (gva >> 12) & 0x3FF;
        // Each guest PDE gets its own backing PT page so two mappings
        // under different PDEs never alias the same guest-physical PTE
        // storage.
        let pt_base = 0x2000_0000u64 + pd_index * 0x1000;
        mem.set_entry(cr3 + pd_index * 4, pt_base | 0x7);
        let pt_entry32 = (frame as u32 as u64) | flags;
        // 32-bit (non-PAE) entries are 4 bytes; reuse set_entry's 8-byte
        // write but only the low 4 bytes matter to read32.
        let base = (pt_base + pt_index * 4) & !0x7;
        let off = ((pt_base + pt_index * 4) & 0x7) * 8;
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&(pt_entry32 as u32).to_le_bytes());
        let _ = off;
        let mut pages = mem.pages.borrow_mut();
        let page = pages.entry(base).or_insert([0u8; 4096]);
        let pg_off = (base & 0xFFF) as usize;
        page[pg_off..pg_off + 4].copy_from_slice(&buf[0..4]);
    }

    #[test]
    fn new_shadow_has_four_present_pdptes() {
        let source = TestSource::new();
        let vtlb = Vtlb::new(&source).unwrap();
        for i in 0..4 {
            assert_eq!(vtlb.pdpte.entries()[i] & 0x1, 1);
        }
    }

    #[test]
    fn page_fault_installs_shadow_pte_matching_guest_permissions() {
        let source = TestSource::new();
        let mut vtlb = Vtlb::new(&source).unwrap();
        let mem = FlatMem::new();
        let cr3 = 0x3000_0000u64;
        let gva = 0x0040_3000u64;
        build_two_level_mapping(&mem, cr3, gva, 0x0050_0000, 0x47); // P|RW|US|D

        let state = two_level_state(cr3);
        let outcome = vtlb.handle_page_fault(&source, &mem, &state, gva, Access::WRITE);
        assert_eq!(outcome, VtlbOutcome::Resume);

        let (q, d, t) = Vtlb::<TestSource>::indices(gva);
        let handle = vtlb.meta[q * 512 + d].expect("pte installed");
        let pte = vtlb.arena[handle as usize].as_ref().unwrap().page.entries()[t];
        assert_eq!(pte & 0x1, 1, "present");
        assert_eq!(pte & 0x2, 0x2, "writable carried from guest PTE already marked dirty");
        assert_eq!(pte & !0xFFFu64 & 0xF_FFFF_FFFFu64, 0x0050_0000);
    }

    #[test]
    fn writable_but_clean_guest_pte_installs_read_only_shadow() {
        let source = TestSource::new();
        let mut vtlb = Vtlb::new(&source).unwrap();
        let mem = FlatMem::new();
        let cr3 = 0x3000_0000u64;
        let gva = 0x0040_3000u64;
        build_two_level_mapping(&mem, cr3, gva, 0x0050_0000, 0x7); // P|RW|US, D=0

        let state = two_level_state(cr3);
        let outcome = vtlb.handle_page_fault(&source, &mem, &state, gva, Access::empty());
        assert_eq!(outcome, VtlbOutcome::Resume);

        let (q, d, t) = Vtlb::<TestSource>::indices(gva);
        let handle = vtlb.meta[q * 512 + d].expect("pte installed");
        let pte = vtlb.arena[handle as usize].as_ref().unwrap().page.entries()[t];
        assert_eq!(pte & 0x2, 0, "write bit withheld until guest D is set");
    }

    #[test]
    fn not_present_guest_pte_reports_page_fault_to_caller() {
        let source = TestSource::new();
        let mut vtlb = Vtlb::new(&source).unwrap();
        let mem = FlatMem::new();
        let cr3 = 0x3000_0000u64;
        let state = two_level_state(cr3);
        // PDE present in the backing store but with P=0: a real
        // not-present fault, as opposed to a GPA with no backing at all.
        mem.set_entry(cr3, 0);
        let outcome = vtlb.handle_page_fault(&source, &mem, &state, 0x1000, Access::empty());
        match outcome {
            VtlbOutcome::InjectPageFault(pfec) => assert!(!pfec.contains(Pfec::P)),
            other => panic!("expected InjectPageFault, got {:?}", other),
        }
    }

    #[test]
    fn invalidate_all_clears_non_global_entries_but_keeps_global() {
        let source = TestSource::new();
        let mut vtlb = Vtlb::new(&source).unwrap();
        let mem = FlatMem::new();
        let cr3 = 0x3000_0000u64;
        // Addresses chosen to land in different shadow PD slots (bits
        // 21..29 of the guest-linear address), so each gets its own PT
        // page rather than sharing one.
        let gva_g = 0x0020_1000u64;
        let gva_ng = 0x0060_1000u64;
        build_two_level_mapping(&mem, cr3, gva_g, 0x0050_0000, 0x107); // P|RW|US|G
        build_two_level_mapping(&mem, cr3, gva_ng, 0x0060_0000, 0x7);

        let state = two_level_state(cr3);
        vtlb.handle_page_fault(&source, &mem, &state, gva_g, Access::empty());
        vtlb.handle_page_fault(&source, &mem, &state, gva_ng, Access::empty());

        vtlb.invalidate_all(true);

        let (qg, dg, tg) = Vtlb::<TestSource>::indices(gva_g);
        let (qn, dn, tn) = Vtlb::<TestSource>::indices(gva_ng);
        assert!(vtlb.meta[qg * 512 + dg].is_some(), "global mapping survives");
        assert!(vtlb.meta[qn * 512 + dn].is_none(), "non-global mapping dropped");
        let _ = (tg, tn);
    }

    #[test]
    fn invlpg_clears_single_address_without_dropping_table_page() {
        let source = TestSource::new();
        let mut vtlb = Vtlb::new(&source).unwrap();
        let mem = FlatMem::new();
        let cr3 = 0x3000_0000u64;
        let gva = 0x0040_3000u64;
        build_two_level_mapping(&mem, cr3, gva, 0x0050_0000, 0x7);
        let state = two_level_state(cr3);
        vtlb.handle_page_fault(&source, &mem, &state, gva, Access::empty());

        vtlb.on_invlpg(gva);

        let (q, d, t) = Vtlb::<TestSource>::indices(gva);
        let handle = vtlb.meta[q * 512 + d].expect("PT page retained across INVLPG");
        assert_eq!(vtlb.arena[handle as usize].as_ref().unwrap().page.entries()[t], 0);
    }

    #[test]
    fn exhausted_arena_recycles_from_igo_instead_of_failing() {
        // Enough pages for the initial 5 (PDPT + 4 PD) plus a handful of
        // PT pages before the source starts refusing.
        let source = TestSource::limited(8);
        let mut vtlb = Vtlb::new(&source).unwrap();
        let mem = FlatMem::new();
        let cr3 = 0x3000_0000u64;

        for i in 0..3u64 {
            let gva = 0x0040_0000 + i * 0x0020_0000; // distinct PD slots
            build_two_level_mapping(&mem, cr3, gva, 0x0050_0000 + i * 0x1000, 0x7);
            let state = two_level_state(cr3);
            let outcome = vtlb.handle_page_fault(&source, &mem, &state, gva, Access::empty());
            assert_eq!(outcome, VtlbOutcome::Resume);
        }
        // Force a flush so the 3 PT pages move to igo, then exhaust the
        // remaining source budget so a 4th install must recycle from igo.
        vtlb.invalidate_all(false);
        let gva4 = 0x00A0_0000u64;
        build_two_level_mapping(&mem, cr3, gva4, 0x0070_0000, 0x7);
        let state = two_level_state(cr3);
        let outcome = vtlb.handle_page_fault(&source, &mem, &state, gva4, Access::empty());
        assert_eq!(outcome, VtlbOutcome::Resume);
    }

    #[test]
    fn cr3_write_marks_reload_pending_and_flushes_non_global() {
        let source = TestSource::new();
        let mut vtlb = Vtlb::new(&source).unwrap();
        let mem = FlatMem::new();
        let cr3 = 0x3000_0000u64;
        let gva = 0x0040_3000u64;
        build_two_level_mapping(&mem, cr3, gva, 0x0050_0000, 0x7);
        let state = two_level_state(cr3);
        vtlb.handle_page_fault(&source, &mem, &state, gva, Access::empty());
        assert!(vtlb.take_cr3_reload_pending());
        assert!(!vtlb.take_cr3_reload_pending(), "consumed, not sticky");

        vtlb.on_cr3_write(0x9000_0000);
        assert!(vtlb.take_cr3_reload_pending());
        let (q, d, _) = Vtlb::<TestSource>::indices(gva);
        assert!(vtlb.meta[q * 512 + d].is_none(), "non-global entry dropped on CR3 write");
    }
}
