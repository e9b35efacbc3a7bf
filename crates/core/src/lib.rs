//! Jab Core Library
//!
//! Foundation crate for the Jab virtual machine: a moving garbage-collected
//! heap generic over the object representation, and bit-addressable IO
//! spaces (in-memory buffers, files, and sub-windows) that mapped values
//! read from and write to.
//!
//! This crate knows nothing about Jab values or bytecode; the runtime crate
//! supplies the object type and drives collection from its safe points.

pub mod bits;
pub mod heap;
pub mod ios;

pub use bits::{Endian, Nenc};
pub use heap::{GcRef, GcStats, Heap, RootHandle, Shape};
pub use ios::{IoSpace, IosError, IosTable, IOS_READ, IOS_WRITE};
