//! Device drivers used by the kernel core.

pub mod serial;
