//! Common types shared by all filesystem backends
mod device;
mod records;

pub use device::BlockDevice;
pub use records::*;
