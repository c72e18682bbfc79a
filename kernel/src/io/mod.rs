//! I/O (io)
//!
//! Byte-stream plumbing:
//!
//! - **Ring buffer**: lock-free fixed-capacity byte ring
//! - **Streams**: reference-counted FCBs behind per-process descriptors
//! - **Pipes**: blocking reader/writer pair over one ring buffer

pub mod buffer;
pub mod pipe;
pub mod streams;

pub use buffer::IoBuffer;
pub use streams::Fid;
