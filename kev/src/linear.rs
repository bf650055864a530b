//! Linear-memory gateway.
//!
//! Builds `read_guest_virtual` / `write_guest_virtual` / `fetch_instruction`
//! on top of the software [`walker`](crate::paging), handling the
//! page-at-a-time iteration, the three failure policies callers need
//! (guest-facing fault injection, best-effort short count, inspection), and
//! the single-page kernel-mapping cache that makes MMIO instruction fetch
//! cheap.

use crate::paging::{self, Access, GuestPagingState, PagingMemory, TranslateResult};
use abyss::addressing::{PAGE_MASK, PAGE_SIZE};

/// `-ENOMEM`, returned when the fetch cache (or a one-shot mapping) can't
/// be established.
pub const ENOMEM: i32 = -12;

/// Capability a [`PagingMemory`] implementor additionally offers so the
/// gateway can hand back a raw kernel-virtual window over a mapped guest
/// page, rather than only supporting indirect 32/64-bit reads.
pub trait FrameAccess: PagingMemory {
    /// Kernel-virtual address (as a plain integer, since this module is
    /// mode-agnostic) of the frame backing the guest-physical page
    /// containing `gpa`. `None` if the frame has no host backing.
    fn frame_base(&self, gpa: u64) -> Option<usize>;
}

/// Policy selecting what happens when a page in the middle of a linear
/// access can't be translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Guest-facing: set CR2 and inject `#PF`; return whether the whole
    /// access completed.
    Guest,
    /// Best-effort: never inject, just report how many bytes landed.
    BestEffort,
    /// Inspection: like best-effort, but additionally suppresses A/D-bit
    /// updates (debugger/monitor reads).
    Inspect,
}

/// Where to deliver a page fault synthesized by [`FaultMode::Guest`].
pub trait PageFaultSink {
    /// Record `cr2` and arrange for `#PF` with the given architectural
    /// error code to be injected before the next VM-entry.
    fn fault(&mut self, cr2: u64, error_code: u32);
}

/// Per-vCPU single-page instruction-fetch cache. Reused across fetches that
/// land in the same guest page under the same CR3; invalidated otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchCache {
    last_gva_page: Option<u64>,
    last_cr3: u64,
    hit_count: u64,
    kernel_base: usize,
}

impl FetchCache {
    /// A fresh, empty cache.
    pub const fn new() -> Self {
        Self {
            last_gva_page: None,
            last_cr3: 0,
            hit_count: 0,
            kernel_base: 0,
        }
    }

    /// Number of times this cache has served a fetch without re-walking.
    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    fn lookup(&mut self, gva_page: u64, cr3: u64) -> Option<usize> {
        if self.last_gva_page == Some(gva_page) && self.last_cr3 == cr3 {
            self.hit_count += 1;
            Some(self.kernel_base)
        } else {
            None
        }
    }

    fn fill(&mut self, gva_page: u64, cr3: u64, kernel_base: usize) {
        self.last_gva_page = Some(gva_page);
        self.last_cr3 = cr3;
        self.kernel_base = kernel_base;
    }

    /// Drop the cached mapping. Called whenever CR3 or the paging mode
    /// changes out from under a vCPU.
    pub fn invalidate(&mut self) {
        self.last_gva_page = None;
        self.hit_count = 0;
    }
}

fn page_of(addr: u64) -> u64 {
    addr & !(PAGE_MASK as u64)
}

/// Read up to `dst.len()` bytes starting at guest-linear `gva`. Returns the
/// number of bytes actually copied; under [`FaultMode::Guest`] a short
/// count only happens after `sink` has already been told about the fault.
pub fn read_guest_virtual<M: PagingMemory + FrameAccess>(
    mem: &M,
    state: &GuestPagingState,
    gva: u64,
    dst: &mut [u8],
    mode: FaultMode,
    sink: &mut dyn PageFaultSink,
) -> usize {
    let update_ad = mode != FaultMode::Inspect;
    let mut done = 0;
    while done < dst.len() {
        let cur = gva + done as u64;
        match paging::translate(mem, state, cur, Access::empty(), update_ad, false) {
            TranslateResult::Ok { gpa, .. } => {
                let Some(base) = mem.frame_base(gpa) else {
                    break;
                };
                let off = gpa as usize & PAGE_MASK;
                let chunk = core::cmp::min(dst.len() - done, PAGE_SIZE - off);
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        (base + off) as *const u8,
                        dst[done..done + chunk].as_mut_ptr(),
                        chunk,
                    );
                }
                done += chunk;
            }
            TranslateResult::Fault(pfec) => {
                if mode == FaultMode::Guest {
                    sink.fault(cur, pfec.bits());
                }
                break;
            }
            TranslateResult::Gp2Hp => break,
        }
    }
    done
}

/// Write up to `src.len()` bytes starting at guest-linear `gva`. Returns
/// the number of bytes actually copied.
pub fn write_guest_virtual<M: PagingMemory + FrameAccess>(
    mem: &M,
    state: &GuestPagingState,
    gva: u64,
    src: &[u8],
    mode: FaultMode,
    sink: &mut dyn PageFaultSink,
) -> usize {
    let mut done = 0;
    while done < src.len() {
        let cur = gva + done as u64;
        match paging::translate(mem, state, cur, Access::WRITE, true, false) {
            TranslateResult::Ok { gpa, .. } => {
                let Some(base) = mem.frame_base(gpa) else {
                    break;
                };
                let off = gpa as usize & PAGE_MASK;
                let chunk = core::cmp::min(src.len() - done, PAGE_SIZE - off);
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        src[done..done + chunk].as_ptr(),
                        (base + off) as *mut u8,
                        chunk,
                    );
                }
                done += chunk;
            }
            TranslateResult::Fault(pfec) => {
                if mode == FaultMode::Guest {
                    sink.fault(cur, pfec.bits());
                }
                break;
            }
            TranslateResult::Gp2Hp => break,
        }
    }
    done
}

/// Fetch up to `buf.len()` (at most 15) instruction bytes starting at
/// `gva`. Uses `cache` when the fetch stays within one page and the guest
/// hasn't switched CR3 or moved to a different page since the last fetch;
/// falls back to the byte-at-a-time slow path (no caching) when the fetch
/// spans two pages.
///
/// Returns `Ok(())` on success, `Err(ENOMEM)` if the page has no host
/// backing.
pub fn fetch_instruction<M: PagingMemory + FrameAccess>(
    mem: &M,
    state: &GuestPagingState,
    cache: &mut FetchCache,
    gva: u64,
    buf: &mut [u8],
) -> Result<(), i32> {
    debug_assert!(buf.len() <= 15);
    let start_off = gva as usize & PAGE_MASK;
    if start_off + buf.len() <= PAGE_SIZE {
        let gva_page = page_of(gva);
        let cr3 = state.cr3;
        let base = match cache.lookup(gva_page, cr3) {
            Some(base) => base,
            None => {
                let TranslateResult::Ok { gpa, .. } =
                    paging::translate(mem, state, gva_page, Access::EXEC, true, true)
                else {
                    cache.invalidate();
                    return Err(ENOMEM);
                };
                let Some(base) = mem.frame_base(gpa) else {
                    cache.invalidate();
                    return Err(ENOMEM);
                };
                cache.fill(gva_page, cr3, base);
                base
            }
        };
        unsafe {
            core::ptr::copy_nonoverlapping(
                (base + start_off) as *const u8,
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    } else {
        // Spans two pages: skip the cache, walk byte range directly.
        cache.invalidate();
        let mut done = 0;
        while done < buf.len() {
            let cur = gva + done as u64;
            let TranslateResult::Ok { gpa, .. } =
                paging::translate(mem, state, cur, Access::EXEC, true, true)
            else {
                return Err(ENOMEM);
            };
            let Some(base) = mem.frame_base(gpa) else {
                return Err(ENOMEM);
            };
            let off = gpa as usize & PAGE_MASK;
            let chunk = core::cmp::min(buf.len() - done, PAGE_SIZE - off);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    (base + off) as *const u8,
                    buf[done..done + chunk].as_mut_ptr(),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::Efer;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MockMem {
        words: RefCell<HashMap<u64, u64>>,
        bytes: RefCell<HashMap<u64, u8>>,
    }

    impl MockMem {
        fn new() -> Self {
            Self {
                words: RefCell::new(HashMap::new()),
                bytes: RefCell::new(HashMap::new()),
            }
        }
        fn set_entry(&self, gpa: u64, val: u64) {
            self.words.borrow_mut().insert(gpa, val);
        }
        fn set_byte(&self, gpa: u64, val: u8) {
            self.bytes.borrow_mut().insert(gpa, val);
        }
    }

    impl PagingMemory for MockMem {
        fn read32(&self, gpa: u64) -> Option<u32> {
            Some(self.words.borrow().get(&gpa).copied().unwrap_or(0) as u32)
        }
        fn read64(&self, gpa: u64) -> Option<u64> {
            Some(self.words.borrow().get(&gpa).copied().unwrap_or(0))
        }
        fn cas32(&self, gpa: u64, old: u32, new: u32) -> bool {
            let mut m = self.words.borrow_mut();
            let cur = m.get(&gpa).copied().unwrap_or(0) as u32;
            if cur == old {
                m.insert(gpa, new as u64);
                true
            } else {
                false
            }
        }
        fn cas64(&self, gpa: u64, old: u64, new: u64) -> bool {
            let mut m = self.words.borrow_mut();
            let cur = m.get(&gpa).copied().unwrap_or(0);
            if cur == old {
                m.insert(gpa, new);
                true
            } else {
                false
            }
        }
    }

    impl FrameAccess for MockMem {
        fn frame_base(&self, gpa: u64) -> Option<usize> {
            // Back every guest page with its own private, zero-initialized
            // host buffer, keyed by page number; fabricate a stable
            // "kernel-virtual" pointer into a per-page Vec leaked for the
            // test's duration.
            thread_local! {
                static PAGES: RefCell<HashMap<u64, Box<[u8; PAGE_SIZE]>>> = RefCell::new(HashMap::new());
            }
            let page = gpa & !(PAGE_MASK as u64);
            PAGES.with(|p| {
                let mut p = p.borrow_mut();
                let entry = p.entry(page).or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
                // Seed from the byte map the first time the page is touched.
                for off in 0..PAGE_SIZE {
                    if let Some(b) = self.bytes.borrow().get(&(page + off as u64)) {
                        entry[off] = *b;
                    }
                }
                Some(entry.as_ptr() as usize)
            })
        }
    }

    struct NullSink;
    impl PageFaultSink for NullSink {
        fn fault(&mut self, _cr2: u64, _error_code: u32) {}
    }

    fn flat_state() -> GuestPagingState {
        GuestPagingState {
            cr0: 0,
            cr3: 0,
            cr4: 0,
            efer: Efer::empty(),
        }
    }

    #[test]
    fn flat_mode_read_round_trips() {
        let mem = MockMem::new();
        for (i, b) in (0u64..8).zip([1u8, 2, 3, 4, 5, 6, 7, 8]) {
            mem.set_byte(i, b);
        }
        let state = flat_state();
        let mut dst = [0u8; 8];
        let mut sink = NullSink;
        let n = read_guest_virtual(&mem, &state, 0, &mut dst, FaultMode::Guest, &mut sink);
        assert_eq!(n, 8);
        assert_eq!(dst, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn fetch_cache_hits_same_page() {
        let mem = MockMem::new();
        mem.set_byte(0x10, 0x90);
        let state = flat_state();
        let mut cache = FetchCache::new();
        let mut buf = [0u8; 1];
        fetch_instruction(&mem, &state, &mut cache, 0x10, &mut buf).unwrap();
        assert_eq!(cache.hit_count(), 0);
        fetch_instruction(&mem, &state, &mut cache, 0x11, &mut buf).unwrap();
        assert_eq!(cache.hit_count(), 1);
    }

    #[test]
    fn write_then_read_back() {
        let mem = MockMem::new();
        let state = flat_state();
        let mut sink = NullSink;
        let n = write_guest_virtual(&mem, &state, 0x40, &[0xAB; 4], FaultMode::Guest, &mut sink);
        assert_eq!(n, 4);
        let mut dst = [0u8; 4];
        let n = read_guest_virtual(&mem, &state, 0x40, &mut dst, FaultMode::Guest, &mut sink);
        assert_eq!(n, 4);
        assert_eq!(dst, [0xAB; 4]);
    }

    #[test]
    fn not_present_reports_fault_and_short_count() {
        let mem = MockMem::new();
        let state = GuestPagingState {
            cr0: 1 << 31,
            cr3: 0,
            cr4: 0,
            efer: Efer::empty(),
        };
        let mut dst = [0u8; 4];
        struct Recorder {
            cr2: Option<u64>,
        }
        impl PageFaultSink for Recorder {
            fn fault(&mut self, cr2: u64, _error_code: u32) {
                self.cr2 = Some(cr2);
            }
        }
        let mut sink = Recorder { cr2: None };
        let n = read_guest_virtual(&mem, &state, 0x1000, &mut dst, FaultMode::Guest, &mut sink);
        assert_eq!(n, 0);
        assert_eq!(sink.cr2, Some(0x1000));
    }
}
