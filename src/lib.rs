//! HLX filter runner
//!
//! Invokes precompiled, dynamically typed filter modules from the command
//! line. Filter arguments are known only through a runtime descriptor
//! (`FilterMetadata`); the runner resolves them from `name=value` text,
//! negotiates output shapes with a bounds query, runs the filter (optionally
//! as a benchmark, optionally tracking memory), and saves the outputs.

pub mod args;
pub mod benchmark;
pub mod buffer;
pub mod cli;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod ffi;
pub mod filter;
pub mod image_io;
pub mod memory;
pub mod scalar;
pub mod shape;
pub mod types;

pub use buffer::{allocate_buffer, Buffer};
pub use driver::{RunGen, RunOptions, RunReport, Stage};
pub use error::{Result, RunGenError};
pub use filter::{ArgSlot, ArgumentKind, ArgumentMetadata, Filter, FilterMetadata, InvokeContext};
pub use image_io::{FormatInfo, ImageFileIo, ImageIo};
pub use shape::{Dimension, Shape, ShapeRepairPolicy};
pub use types::{TypeCode, TypeTag};
