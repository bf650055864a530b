//! Interrupt / exception injection engine.
//!
//! Decides, once per VM-entry, which pending event (if any) gets delivered
//! to the guest next: a synthesized exception takes priority over a queued
//! external interrupt, a concurrent fault pair gets promoted to `#DF`, and
//! anything that can't go in yet arms interrupt-window exiting so we get
//! another shot at it. Talks to the VMCS only through [`InjectionTarget`],
//! so the state-machine logic here stays testable without real VMX.

use core::sync::atomic::{AtomicU64, Ordering};

/// Sentinel returned by [`PendingBitmap::highest_pending`]'s wire-format
/// twin when nothing is pending.
pub const INVALID_VECTOR: u32 = 0x100;

/// 256-bit vector of pending interrupts, one bit per vector, with atomic
/// set/clear so a kick from another thread never races the vCPU thread's
/// own bitmap scan.
#[derive(Debug, Default)]
pub struct PendingBitmap {
    words: [AtomicU64; 4],
}

impl PendingBitmap {
    /// An empty bitmap.
    pub const fn new() -> Self {
        Self {
            words: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    /// Mark `vector` pending. Returns `true` if it was not already set.
    pub fn set_pending(&self, vector: u8) -> bool {
        let (w, bit) = (vector as usize / 64, vector % 64);
        let mask = 1u64 << bit;
        self.words[w].fetch_or(mask, Ordering::SeqCst) & mask == 0
    }

    /// Clear `vector`. Returns `true` if it had been set.
    pub fn clear_pending(&self, vector: u8) -> bool {
        let (w, bit) = (vector as usize / 64, vector % 64);
        let mask = 1u64 << bit;
        self.words[w].fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    /// Highest-indexed pending vector, or `None` if the bitmap is empty.
    pub fn highest_pending(&self) -> Option<u8> {
        for (w, word) in self.words.iter().enumerate().rev() {
            let v = word.load(Ordering::SeqCst);
            if v != 0 {
                let bit = 63 - v.leading_zeros();
                return Some((w as u32 * 64 + bit) as u8);
            }
        }
        None
    }

    /// Number of vectors currently pending.
    pub fn pop_count(&self) -> u32 {
        self.words.iter().map(|w| w.load(Ordering::SeqCst).count_ones()).sum()
    }
}

/// Guest-interruptibility-state bits the blocking check cares about
/// (VMCS `GUEST_INTERRUPTIBILITY_STATE`, bits 0-1): STI shadow and
/// MOV-SS shadow.
pub const INTERRUPTIBILITY_STI_BLOCKING: u32 = 1 << 0;
/// See [`INTERRUPTIBILITY_STI_BLOCKING`].
pub const INTERRUPTIBILITY_MOVSS_BLOCKING: u32 = 1 << 1;

/// Whether interrupt delivery is currently blocked: `RFLAGS.IF=0`, or
/// either the STI or MOV-SS shadow is up.
pub fn blocked(rflags_if: bool, interruptibility: u32) -> bool {
    !rflags_if || interruptibility & 0x3 != 0
}

/// The contributory exception class (SDM Table 6-5): `#DE`, `#TS`, `#NP`,
/// `#SS`, `#GP`. Anything else is "benign" except `#PF`, which is its own
/// class.
const CONTRIBUTORY: u32 = (1 << 0) | (1 << 10) | (1 << 11) | (1 << 12) | (1 << 13);
const PF_VECTOR: u8 = 14;
/// `#DF`'s own vector.
pub const DF_VECTOR: u8 = 8;

fn is_contributory(vector: u8) -> bool {
    vector < 32 && CONTRIBUTORY & (1 << vector) != 0
}

/// Whether delivering `second` while `first` is still being vectored
/// through the IDT promotes to a double fault, per the SDM 6.15
/// contingent-exception rule: PF followed by (PF or contributory), or
/// contributory followed by contributory.
pub fn promotes_to_double_fault(first: u8, second: u8) -> bool {
    if first == PF_VECTOR {
        second == PF_VECTOR || is_contributory(second)
    } else {
        is_contributory(first) && is_contributory(second)
    }
}

/// VM-exit interruption type, as encoded in bits 10:8 of the
/// VM-entry/VM-exit interruption-information field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectoringType {
    /// External interrupt.
    ExternalInt,
    /// Non-maskable interrupt.
    Nmi,
    /// Hardware exception (the only type that participates in double-fault
    /// promotion).
    HardwareException,
    /// Software interrupt / privileged or ordinary software exception.
    Software,
}

/// The narrow slice of VMCS state the injection engine reads and writes,
/// abstracted so the algorithm in this module can be tested without a real
/// VMCS.
pub trait InjectionTarget {
    /// `RFLAGS.IF`.
    fn interrupts_enabled(&self) -> bool;
    /// `GUEST_INTERRUPTIBILITY_STATE`, bits 0-1.
    fn interruptibility(&self) -> u32;
    /// Whether `VM_ENTRY_INTR_INFO_FIELD.valid` is already set (an event
    /// is already queued for the next entry).
    fn entry_info_valid(&self) -> bool;
    /// Write `VM_ENTRY_INTR_INFO_FIELD` for an external-interrupt
    /// injection of `vector`.
    fn inject_external(&mut self, vector: u8);
    /// Write `VM_ENTRY_INTR_INFO_FIELD` (+ error code, if any) for a
    /// hardware-exception injection.
    fn inject_exception_now(&mut self, vector: u8, error_code: Option<u32>);
    /// Defer injection of `#PF` to the VM-exit handler, which still needs
    /// to finish ordering CR2 against other pending updates.
    fn defer_page_fault(&mut self, vector: u8, error_code: u32);
    /// `VM_EXIT_INSTRUCTION_LEN`, copied into `VM_ENTRY_INSTRUCTION_LEN`
    /// for exceptions that re-execute the faulting instruction.
    fn exit_instruction_length(&self) -> u32;
    /// Set or clear `INTERRUPT_WINDOW_EXITING` in the primary proc-based
    /// controls.
    fn set_interrupt_window_exiting(&mut self, on: bool);
    /// `(vector, type)` from `IDT_VECTORING_INFO_FIELD` if it was valid on
    /// the exit that just happened.
    fn idt_vectoring_info(&self) -> Option<(u8, VectoringType)>;
}

/// Re-queue an externally-interrupted interrupt so it gets redelivered:
/// if the VM-exit interrupted delivery of an external interrupt (as
/// opposed to an exception), the vector goes back on the pending bitmap
/// rather than being lost.
pub fn handle_idt_vectoring<T: InjectionTarget>(target: &T, pending: &PendingBitmap) {
    if let Some((vector, VectoringType::ExternalInt)) = target.idt_vectoring_info() {
        pending.set_pending(vector);
    }
}

/// Inject a synthesized exception, promoting to `#DF` if the vectoring
/// info left over from the prior exit says we're already mid-delivery of
/// an exception that contends with this one.
pub fn inject_exception<T: InjectionTarget>(target: &mut T, vector: u8, error_code: Option<u32>) {
    let prior_exception = match target.idt_vectoring_info() {
        Some((v, VectoringType::HardwareException)) => Some(v),
        _ => None,
    };
    let (vector, error_code) = match prior_exception {
        Some(prior) if promotes_to_double_fault(prior, vector) => (DF_VECTOR, Some(0)),
        _ => (vector, error_code),
    };

    if vector == PF_VECTOR {
        // CR2 ordering against the rest of this exit's effects is the
        // exit handler's job; we only record that a #PF wants in.
        target.defer_page_fault(vector, error_code.unwrap_or(0));
        return;
    }
    target.inject_exception_now(vector, error_code);
}

/// Run the once-per-VM-entry injection cycle: deliver the highest pending
/// interrupt if nothing is already queued and delivery isn't blocked,
/// then arm the interrupt window if anything remains undeliverable.
pub fn inject_pending<T: InjectionTarget>(target: &mut T, pending: &PendingBitmap) {
    if !target.entry_info_valid()
        && !blocked(target.interrupts_enabled(), target.interruptibility())
    {
        if let Some(vector) = pending.highest_pending() {
            pending.clear_pending(vector);
            target.inject_external(vector);
        }
    }
    target.set_interrupt_window_exiting(pending.highest_pending().is_some());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockTarget {
        rflags_if: bool,
        interruptibility: u32,
        entry_valid: bool,
        injected: Option<(u8, Option<u32>)>,
        deferred_pf: Option<(u8, u32)>,
        window_exiting: bool,
        idt_vectoring: Option<(u8, VectoringType)>,
        exit_instr_len: u32,
    }

    impl InjectionTarget for MockTarget {
        fn interrupts_enabled(&self) -> bool {
            self.rflags_if
        }
        fn interruptibility(&self) -> u32 {
            self.interruptibility
        }
        fn entry_info_valid(&self) -> bool {
            self.entry_valid
        }
        fn inject_external(&mut self, vector: u8) {
            self.injected = Some((vector, None));
            self.entry_valid = true;
        }
        fn inject_exception_now(&mut self, vector: u8, error_code: Option<u32>) {
            self.injected = Some((vector, error_code));
            self.entry_valid = true;
        }
        fn defer_page_fault(&mut self, vector: u8, error_code: u32) {
            self.deferred_pf = Some((vector, error_code));
        }
        fn exit_instruction_length(&self) -> u32 {
            self.exit_instr_len
        }
        fn set_interrupt_window_exiting(&mut self, on: bool) {
            self.window_exiting = on;
        }
        fn idt_vectoring_info(&self) -> Option<(u8, VectoringType)> {
            self.idt_vectoring
        }
    }

    #[test]
    fn highest_pending_wins() {
        let bitmap = PendingBitmap::new();
        bitmap.set_pending(3);
        bitmap.set_pending(0x40);
        bitmap.set_pending(7);
        assert_eq!(bitmap.highest_pending(), Some(0x40));
        assert_eq!(bitmap.pop_count(), 3);
    }

    #[test]
    fn set_pending_is_idempotent() {
        let bitmap = PendingBitmap::new();
        assert!(bitmap.set_pending(5));
        assert!(!bitmap.set_pending(5));
        assert!(bitmap.clear_pending(5));
        assert!(!bitmap.clear_pending(5));
    }

    #[test]
    fn injection_picks_highest_when_unblocked() {
        let bitmap = PendingBitmap::new();
        bitmap.set_pending(0x20);
        bitmap.set_pending(0x21);
        let mut target = MockTarget {
            rflags_if: true,
            ..Default::default()
        };
        inject_pending(&mut target, &bitmap);
        assert_eq!(target.injected, Some((0x21, None)));
        assert_eq!(bitmap.highest_pending(), Some(0x20));
        assert!(target.window_exiting);
    }

    #[test]
    fn blocked_by_if_arms_window_instead() {
        let bitmap = PendingBitmap::new();
        bitmap.set_pending(0x30);
        let mut target = MockTarget {
            rflags_if: false,
            ..Default::default()
        };
        inject_pending(&mut target, &bitmap);
        assert_eq!(target.injected, None);
        assert!(target.window_exiting);
        assert_eq!(bitmap.highest_pending(), Some(0x30));
    }

    #[test]
    fn double_fault_matrix_matches_sdm_table_6_5() {
        // Contributory x contributory -> #DF.
        assert!(promotes_to_double_fault(0, 13)); // #DE then #GP
        assert!(promotes_to_double_fault(13, 10)); // #GP then #TS
        // PF x contributory / PF -> #DF.
        assert!(promotes_to_double_fault(14, 13));
        assert!(promotes_to_double_fault(14, 14));
        // Benign first exception never promotes.
        assert!(!promotes_to_double_fault(3, 13)); // #BP then #GP
        // Contributory then benign does not promote.
        assert!(!promotes_to_double_fault(13, 3));
    }

    /// Scenario 6: injecting #PF while IDT-vectoring carries a prior
    /// external interrupt re-queues the interrupt and does not promote.
    #[test]
    fn external_interrupt_vectoring_does_not_promote_and_requeues_separately() {
        let bitmap = PendingBitmap::new();
        let mut target = MockTarget {
            idt_vectoring: Some((0x30, VectoringType::ExternalInt)),
            exit_instr_len: 2,
            ..Default::default()
        };
        handle_idt_vectoring(&target, &bitmap);
        assert_eq!(bitmap.highest_pending(), Some(0x30));

        inject_exception(&mut target, PF_VECTOR, Some(0x7));
        assert_eq!(target.deferred_pf, Some((PF_VECTOR, 0x7)));
        assert_eq!(target.injected, None);
    }

    #[test]
    fn contributory_vectoring_promotes_new_contributory_to_double_fault() {
        let mut target = MockTarget {
            idt_vectoring: Some((13, VectoringType::HardwareException)), // #GP was vectoring
            ..Default::default()
        };
        inject_exception(&mut target, 0, None); // #DE arrives
        assert_eq!(target.injected, Some((DF_VECTOR, Some(0))));
    }

    #[test]
    fn no_prior_vectoring_injects_directly() {
        let mut target = MockTarget {
            exit_instr_len: 3,
            ..Default::default()
        };
        inject_exception(&mut target, 6, None); // #UD, no error code
        assert_eq!(target.injected, Some((6, None)));
    }
}
