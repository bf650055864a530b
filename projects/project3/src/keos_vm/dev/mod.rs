//! Collection of Emulated devices.

mod kvm;
mod x2apic;
mod x86;

pub use kvm::*;
pub use x2apic::X2Apic;
pub use x86::*;
