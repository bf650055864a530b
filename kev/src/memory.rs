//! Guest memory gateway.
//!
//! The narrow interface through which the walker, the vTLB engine and the
//! linear-memory gateway touch guest physical memory: map a guest-physical
//! frame into the kernel's address space, or bulk copy bytes by GPA. This
//! module owns none of the bookkeeping (GPA->HVA slot tables, RAM blocks) —
//! that lives in the lifecycle layer and is reached only through [`Probe`].

use crate::{linear::FrameAccess, paging::PagingMemory, probe::Probe, vm::Gpa, vmcs::ActiveVmcs};
use abyss::addressing::{Pa, Va, PAGE_MASK, PAGE_SIZE};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A guest-physical frame mapped into kernel-virtual space.
#[derive(Clone, Copy)]
pub struct MappedPage {
    va: Va,
}

impl MappedPage {
    /// Kernel-virtual address of the mapped frame.
    pub fn addr(&self) -> Va {
        self.va
    }
}

/// Gateway to guest physical memory, built over whatever [`Probe`]
/// implementation the lifecycle layer supplies for this vCPU.
pub struct MemoryGateway<'a, P: Probe> {
    probe: &'a P,
    vmcs: &'a ActiveVmcs,
}

fn page_base(gpa: u64) -> Gpa {
    Gpa::new((gpa as usize) & !PAGE_MASK).expect("masked address stays below the GPA limit")
}

impl<'a, P: Probe> MemoryGateway<'a, P> {
    /// Build a gateway bound to `probe`'s translations for the lifetime of
    /// `vmcs`'s activation.
    pub fn new(probe: &'a P, vmcs: &'a ActiveVmcs) -> Self {
        Self { probe, vmcs }
    }

    /// Map the guest-physical frame containing `gpa` into kernel space.
    /// `None` means the frame has no host backing (`GP2HP`).
    pub fn map_page(&self, gpa: Gpa) -> Option<MappedPage> {
        self.probe.gpa2hva(self.vmcs, gpa).map(|va| MappedPage { va })
    }

    /// Unmap a page obtained from [`Self::map_page`]. Kernel memory here is
    /// direct-mapped, so there is nothing to release; kept for symmetry
    /// with the `memory_gateway` contract.
    pub fn unmap_page(&self, _page: MappedPage) {}

    /// Host-physical frame backing guest frame number `gfn`, if any.
    pub fn gfn_to_hpa(&self, gfn: u64) -> Option<Pa> {
        let gpa = Gpa::new((gfn as usize) << 12)?;
        self.probe.gpa2hpa(self.vmcs, gpa)
    }

    /// Copy up to `dst.len()` bytes starting at guest-physical `gpa` into
    /// `dst`. Stops at the first unmapped page; returns the number of bytes
    /// actually copied.
    pub fn read_data(&self, gpa: u64, dst: &mut [u8]) -> usize {
        let mut done = 0;
        while done < dst.len() {
            let cur = gpa + done as u64;
            let off = cur as usize & PAGE_MASK;
            let page = match self.map_page(page_base(cur)) {
                Some(p) => p,
                None => break,
            };
            let chunk = core::cmp::min(dst.len() - done, PAGE_SIZE - off);
            unsafe {
                let src = (page.addr().into_usize() + off) as *const u8;
                core::ptr::copy_nonoverlapping(src, dst[done..done + chunk].as_mut_ptr(), chunk);
            }
            done += chunk;
        }
        done
    }

    /// Copy up to `src.len()` bytes from `src` to guest-physical `gpa`.
    /// Stops at the first unmapped page; returns the number of bytes
    /// actually copied.
    pub fn write_data(&self, gpa: u64, src: &[u8]) -> usize {
        let mut done = 0;
        while done < src.len() {
            let cur = gpa + done as u64;
            let off = cur as usize & PAGE_MASK;
            let page = match self.map_page(page_base(cur)) {
                Some(p) => p,
                None => break,
            };
            let chunk = core::cmp::min(src.len() - done, PAGE_SIZE - off);
            unsafe {
                let dst = (page.addr().into_usize() + off) as *mut u8;
                core::ptr::copy_nonoverlapping(src[done..done + chunk].as_ptr(), dst, chunk);
            }
            done += chunk;
        }
        done
    }
}

/// The walker reads and CASes guest paging entries through the same
/// mapping the bulk-copy paths use.
impl<'a, P: Probe> PagingMemory for MemoryGateway<'a, P> {
    fn read32(&self, gpa: u64) -> Option<u32> {
        let page = self.map_page(page_base(gpa))?;
        let off = gpa as usize & PAGE_MASK;
        Some(unsafe { *((page.addr().into_usize() + off) as *const u32) })
    }

    fn read64(&self, gpa: u64) -> Option<u64> {
        let page = self.map_page(page_base(gpa))?;
        let off = gpa as usize & PAGE_MASK;
        Some(unsafe { *((page.addr().into_usize() + off) as *const u64) })
    }

    fn cas32(&self, gpa: u64, old: u32, new: u32) -> bool {
        let Some(page) = self.map_page(page_base(gpa)) else {
            return false;
        };
        let off = gpa as usize & PAGE_MASK;
        let cell = unsafe { &*((page.addr().into_usize() + off) as *const AtomicU32) };
        cell.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    fn cas64(&self, gpa: u64, old: u64, new: u64) -> bool {
        let Some(page) = self.map_page(page_base(gpa)) else {
            return false;
        };
        let off = gpa as usize & PAGE_MASK;
        let cell = unsafe { &*((page.addr().into_usize() + off) as *const AtomicU64) };
        cell.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }
}

/// The linear-memory gateway's instruction-fetch fast path needs a raw
/// kernel-virtual pointer to a mapped guest page, not just the ability to
/// copy through one.
impl<'a, P: Probe> FrameAccess for MemoryGateway<'a, P> {
    fn frame_base(&self, gpa_page: u64) -> Option<usize> {
        self.map_page(page_base(gpa_page)).map(|p| unsafe { p.addr().into_usize() })
    }
}

/// The vTLB engine resolves guest-physical leaf frames through the same
/// [`Probe`] the rest of the gateway uses, rather than through its own
/// GPA->HVA bookkeeping.
impl<'a, P: Probe> crate::vtlb::GpaResolver for MemoryGateway<'a, P> {
    fn gpa_to_hpa(&self, gpa: u64) -> Option<Pa> {
        let base = self.probe.gpa2hpa(self.vmcs, page_base(gpa))?;
        let off = gpa as usize & PAGE_MASK;
        Pa::new(unsafe { base.into_usize() } + off)
    }
}
