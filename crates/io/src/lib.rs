//! Binary stream primitives for the Ares runtime.
//!
//! This crate provides the bounds-checked little-endian reader and writer
//! shared by the bytecode loader and the persisted-state codec. All reads
//! validate lengths up front so malformed input surfaces as an error value,
//! never a panic.

pub mod error;
pub mod stream_reader;
pub mod stream_writer;

pub use error::{IoError, IoResult, Result};
pub use stream_reader::StreamReader;
pub use stream_writer::StreamWriter;
