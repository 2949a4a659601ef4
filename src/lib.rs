//! Virtual machine for the SAP 8-bit educational architecture.
//!
//! The CPU lives in [`processor`], backed by a flat byte [`memory`] covering
//! the full 16-bit address space. Programs arrive as `"SAPC"` binary images
//! ([`memory::image`]) and talk to the outside world through two memory-mapped
//! character ports ([`ports`]).

pub mod memory;
pub mod ports;
pub mod processor;
