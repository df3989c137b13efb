//! Architecture-specific code for i686

pub mod context;
pub mod cpu;
pub mod interrupts;
pub mod port;
