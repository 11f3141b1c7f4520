//! Filter module boundary
//!
//! A compiled filter is described by a `FilterMetadata` (its name and the
//! name, kind, type and dimensionality of every argument) and is invoked
//! with one `ArgSlot` per argument, in metadata order. The same call is
//! used for the bounds query (output buffers without storage) and for the
//! real run.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use crate::buffer::Buffer;
use crate::error::{Result, RunGenError};
use crate::memory::{HostAllocator, SystemAllocator};
use crate::scalar::ScalarValue;
use crate::types::TypeTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentKind {
    InputScalar,
    InputBuffer,
    OutputBuffer,
}

impl ArgumentKind {
    pub fn is_input(self) -> bool {
        self != ArgumentKind::OutputBuffer
    }
}

/// Declared argument of a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentMetadata {
    pub name: String,
    pub kind: ArgumentKind,
    pub type_tag: TypeTag,
    /// Number of buffer axes (0 for scalars).
    pub dimensions: usize,
}

impl ArgumentMetadata {
    pub fn scalar(name: &str, type_tag: TypeTag) -> Self {
        Self {
            name: name.to_string(),
            kind: ArgumentKind::InputScalar,
            type_tag,
            dimensions: 0,
        }
    }

    pub fn input_buffer(name: &str, type_tag: TypeTag, dimensions: usize) -> Self {
        Self {
            name: name.to_string(),
            kind: ArgumentKind::InputBuffer,
            type_tag,
            dimensions,
        }
    }

    pub fn output_buffer(name: &str, type_tag: TypeTag, dimensions: usize) -> Self {
        Self {
            name: name.to_string(),
            kind: ArgumentKind::OutputBuffer,
            type_tag,
            dimensions,
        }
    }
}

/// Read-only description of a compiled filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterMetadata {
    pub name: String,
    pub arguments: Vec<ArgumentMetadata>,
}

/// One positional argument passed to a filter call.
#[derive(Debug)]
pub enum ArgSlot<'a> {
    Scalar(&'a ScalarValue),
    Buffer(&'a mut Buffer),
}

impl<'a> ArgSlot<'a> {
    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            ArgSlot::Scalar(v) => Some(v),
            ArgSlot::Buffer(_) => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            ArgSlot::Buffer(b) => Some(b),
            ArgSlot::Scalar(_) => None,
        }
    }

    pub fn as_buffer_mut(&mut self) -> Option<&mut Buffer> {
        match self {
            ArgSlot::Buffer(b) => Some(b),
            ArgSlot::Scalar(_) => None,
        }
    }
}

/// A compiled filter the runner can drive.
pub trait Filter {
    fn metadata(&self) -> &FilterMetadata;

    /// Run the filter. Returns 0 on success and a filter-defined nonzero
    /// code on failure.
    ///
    /// If any output buffer has no storage this is a bounds query: the
    /// filter writes the extents and strides it requires into the
    /// placeholder shapes (`Buffer::query_shape_mut`) and leaves zeros where
    /// it has no constraint.
    fn call(&self, args: &mut [ArgSlot<'_>], ctx: &InvokeContext) -> i32;
}

/// Runtime services available to a filter during a call.
pub struct InvokeContext {
    allocator: Arc<dyn HostAllocator>,
    custom_allocator: bool,
    print_to_stdout: bool,
    device: Option<String>,
    fault: Mutex<Option<RunGenError>>,
}

impl InvokeContext {
    pub fn new(print_to_stdout: bool, device: Option<String>) -> Self {
        Self {
            allocator: Arc::new(SystemAllocator::new()),
            custom_allocator: false,
            print_to_stdout,
            device,
            fault: Mutex::new(None),
        }
    }

    /// Route filter allocations through `allocator`.
    ///
    /// # Errors
    ///
    /// Returns `RunGenError::TrackingInvariant` if a custom allocator is
    /// already installed.
    pub fn install_allocator(&mut self, allocator: Arc<dyn HostAllocator>) -> Result<()> {
        if self.custom_allocator {
            return Err(RunGenError::TrackingInvariant(
                "a custom allocator is already installed".to_string(),
            ));
        }
        self.allocator = allocator;
        self.custom_allocator = true;
        Ok(())
    }

    /// Allocate host memory for the filter. Failures are recorded as the
    /// call's fault and reported as `None`.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        match self.allocator.allocate(size) {
            Ok(ptr) => Some(ptr),
            Err(e) => {
                self.record_fault(e);
                None
            }
        }
    }

    pub fn free(&self, ptr: NonNull<u8>) {
        if let Err(e) = self.allocator.free(ptr) {
            self.record_fault(e);
        }
    }

    /// Print a message on behalf of the filter.
    pub fn print(&self, message: &str) {
        if self.print_to_stdout {
            print!("print: {}", message);
            if !message.ends_with('\n') {
                println!();
            }
        }
    }

    /// Report a fatal error on behalf of the filter. The call fails with
    /// `RunGenError::ModuleError` whatever its return code.
    pub fn error(&self, message: &str) {
        self.record_fault(RunGenError::ModuleError(message.trim_end().to_string()));
    }

    /// Device selection token passed through from the command line.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Record a fatal condition raised inside a filter callback. Only the
    /// first fault is kept.
    pub fn record_fault(&self, error: RunGenError) {
        log::debug!("Filter callback fault: {}", error);
        let mut fault = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if fault.is_none() {
            *fault = Some(error);
        }
    }

    pub fn take_fault(&self) -> Option<RunGenError> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}
