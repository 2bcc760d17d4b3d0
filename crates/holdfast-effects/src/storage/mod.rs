//! Storage handlers

pub mod lease;
pub mod memory;

pub use lease::MemoryLeaseMap;
pub use memory::MemoryRecordStore;
