//! Dynamic filter modules
//!
//! Filters compiled ahead of time are shipped as shared libraries exporting
//! two C symbols:
//!
//! ```text
//! const hlx_filter_metadata_t *hlx_filter_metadata(void);
//! int hlx_filter_argv(const hlx_runtime_t *runtime, void **args);
//! ```
//!
//! `args` holds one pointer per argument in metadata order: scalars point at
//! an 8-byte slot holding the native-endian value, buffers point at a
//! `RawBuffer`. A buffer with a null `host` is a bounds query; the module
//! writes its constraints into `dim`.
//!
//! `runtime` carries the allocator, print and error callbacks, all taking
//! the runtime's `user_context` as their first argument.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;
use std::ptr::{self, NonNull};

use libloading::Library;

use crate::error::{Result, RunGenError};
use crate::filter::{ArgSlot, ArgumentKind, ArgumentMetadata, Filter, FilterMetadata, InvokeContext};
use crate::shape::Dimension;
use crate::types::{TypeCode, TypeTag};

/// Descriptor layout version this runner understands.
pub const ABI_VERSION: i32 = 1;

const METADATA_SYMBOL: &[u8] = b"hlx_filter_metadata\0";
const ARGV_SYMBOL: &[u8] = b"hlx_filter_argv\0";

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawType {
    pub code: u8,
    pub bits: u8,
    pub lanes: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDimension {
    pub min: i64,
    pub extent: i64,
    pub stride: i64,
}

#[repr(C)]
#[derive(Debug)]
pub struct RawBuffer {
    pub host: *mut u8,
    pub type_: RawType,
    pub dimensions: i32,
    pub dim: *mut RawDimension,
}

#[repr(C)]
#[derive(Debug)]
pub struct RawArgument {
    pub name: *const c_char,
    /// 0 = input scalar, 1 = input buffer, 2 = output buffer.
    pub kind: i32,
    pub dimensions: i32,
    pub type_: RawType,
}

#[repr(C)]
#[derive(Debug)]
pub struct RawFilterMetadata {
    pub abi_version: i32,
    pub num_arguments: i32,
    pub arguments: *const RawArgument,
    pub name: *const c_char,
}

/// Runtime services handed to the module on every call.
#[repr(C)]
pub struct RawRuntime {
    pub user_context: *mut c_void,
    pub malloc: unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void,
    pub free: unsafe extern "C" fn(*mut c_void, *mut c_void),
    pub print: unsafe extern "C" fn(*mut c_void, *const c_char),
    /// Reports a fatal error; the call fails with this message even if
    /// the module then returns 0.
    pub error: unsafe extern "C" fn(*mut c_void, *const c_char),
    /// Device token, or null.
    pub device: *const c_char,
}

pub type MetadataFn = unsafe extern "C" fn() -> *const RawFilterMetadata;
pub type ArgvFn = unsafe extern "C" fn(*const RawRuntime, *mut *mut c_void) -> c_int;

impl From<TypeTag> for RawType {
    fn from(tag: TypeTag) -> Self {
        Self {
            code: tag.code.to_raw(),
            bits: tag.bits,
            lanes: tag.lanes,
        }
    }
}

impl TryFrom<RawType> for TypeTag {
    type Error = RunGenError;

    fn try_from(raw: RawType) -> Result<Self> {
        let code = TypeCode::from_raw(raw.code)
            .ok_or_else(|| RunGenError::InvalidMetadata(format!("unknown type code {}", raw.code)))?;
        if raw.bits == 0 || raw.lanes == 0 {
            return Err(RunGenError::InvalidMetadata(format!(
                "invalid type: {} bits x {} lanes",
                raw.bits, raw.lanes
            )));
        }
        Ok(TypeTag::new(code, raw.bits).with_lanes(raw.lanes))
    }
}

impl From<Dimension> for RawDimension {
    fn from(d: Dimension) -> Self {
        Self {
            min: d.min,
            extent: d.extent,
            stride: d.stride,
        }
    }
}

impl From<RawDimension> for Dimension {
    fn from(d: RawDimension) -> Self {
        Dimension::new(d.min, d.extent, d.stride)
    }
}

/// Read a C string field of the descriptor.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn read_name(ptr: *const c_char, what: &str) -> Result<String> {
    if ptr.is_null() {
        return Err(RunGenError::InvalidMetadata(format!("{} is null", what)));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(str::to_string)
        .map_err(|_| RunGenError::InvalidMetadata(format!("{} is not valid UTF-8", what)))
}

/// Copy a module's descriptor into owned metadata.
///
/// # Safety
///
/// `raw` must be null or point to a descriptor whose `arguments` array has
/// `num_arguments` entries, valid for the duration of the call.
pub unsafe fn read_metadata(raw: *const RawFilterMetadata) -> Result<FilterMetadata> {
    let raw = raw
        .as_ref()
        .ok_or_else(|| RunGenError::InvalidMetadata("filter descriptor is null".to_string()))?;
    if raw.abi_version != ABI_VERSION {
        return Err(RunGenError::InvalidMetadata(format!(
            "descriptor ABI version {} (expected {})",
            raw.abi_version, ABI_VERSION
        )));
    }
    let count = usize::try_from(raw.num_arguments).map_err(|_| {
        RunGenError::InvalidMetadata(format!("negative argument count {}", raw.num_arguments))
    })?;
    let name = read_name(raw.name, "filter name")?;

    let raw_args: &[RawArgument] = if count == 0 {
        &[]
    } else if raw.arguments.is_null() {
        return Err(RunGenError::InvalidMetadata("argument list is null".to_string()));
    } else {
        std::slice::from_raw_parts(raw.arguments, count)
    };

    let mut arguments = Vec::with_capacity(count);
    for (i, arg) in raw_args.iter().enumerate() {
        let arg_name = read_name(arg.name, &format!("name of argument {}", i))?;
        let kind = match arg.kind {
            0 => ArgumentKind::InputScalar,
            1 => ArgumentKind::InputBuffer,
            2 => ArgumentKind::OutputBuffer,
            other => {
                return Err(RunGenError::InvalidMetadata(format!(
                    "argument \"{}\" has unknown kind {}",
                    arg_name, other
                )))
            }
        };
        let dimensions = usize::try_from(arg.dimensions).map_err(|_| {
            RunGenError::InvalidMetadata(format!(
                "argument \"{}\" has {} dimensions",
                arg_name, arg.dimensions
            ))
        })?;
        arguments.push(ArgumentMetadata {
            name: arg_name,
            kind,
            type_tag: TypeTag::try_from(arg.type_)?,
            dimensions,
        });
    }

    Ok(FilterMetadata { name, arguments })
}

unsafe extern "C" fn runtime_malloc(user_context: *mut c_void, size: usize) -> *mut c_void {
    match (user_context as *const InvokeContext).as_ref() {
        Some(ctx) => ctx
            .allocate(size)
            .map_or(ptr::null_mut(), |p| p.as_ptr().cast()),
        None => ptr::null_mut(),
    }
}

unsafe extern "C" fn runtime_free(user_context: *mut c_void, block: *mut c_void) {
    let ctx = (user_context as *const InvokeContext).as_ref();
    if let (Some(ctx), Some(block)) = (ctx, NonNull::new(block.cast::<u8>())) {
        ctx.free(block);
    }
}

unsafe extern "C" fn runtime_print(user_context: *mut c_void, message: *const c_char) {
    let ctx = (user_context as *const InvokeContext).as_ref();
    if let (Some(ctx), false) = (ctx, message.is_null()) {
        ctx.print(&CStr::from_ptr(message).to_string_lossy());
    }
}

unsafe extern "C" fn runtime_error(user_context: *mut c_void, message: *const c_char) {
    let Some(ctx) = (user_context as *const InvokeContext).as_ref() else {
        return;
    };
    if message.is_null() {
        ctx.error("(no message)");
    } else {
        ctx.error(&CStr::from_ptr(message).to_string_lossy());
    }
}

/// One argument laid out for the C call.
enum Marshalled {
    Scalar(u64),
    Buffer(RawBuffer, Vec<RawDimension>),
}

/// A filter loaded from a shared library.
pub struct DynamicFilter {
    metadata: FilterMetadata,
    entry: ArgvFn,
    // Keeps `entry` valid; must outlive every call.
    _library: Option<Library>,
}

impl DynamicFilter {
    /// Open the shared library at `path` and read its descriptor.
    ///
    /// # Errors
    ///
    /// Returns `RunGenError::ModuleLoad` if the library or its symbols
    /// cannot be found, and `RunGenError::InvalidMetadata` if the
    /// descriptor is unusable.
    pub fn load(path: &Path) -> Result<Self> {
        log::info!("Loading filter module {}", path.display());
        let load_error = |e: libloading::Error| {
            RunGenError::ModuleLoad(format!("{}: {}", path.display(), e))
        };

        // SAFETY: loading runs the library's initializers; filter modules
        // are trusted input, like any executable the user runs.
        let library = unsafe { Library::new(path) }.map_err(load_error)?;

        // SAFETY: the symbol types match the exported C signatures, and the
        // copied function pointers are only used while `library` is alive.
        let (metadata_fn, entry) = unsafe {
            let metadata_fn = *library.get::<MetadataFn>(METADATA_SYMBOL).map_err(load_error)?;
            let entry = *library.get::<ArgvFn>(ARGV_SYMBOL).map_err(load_error)?;
            (metadata_fn, entry)
        };

        // SAFETY: the descriptor is static data inside the library.
        let metadata = unsafe { read_metadata(metadata_fn()) }?;
        log::debug!(
            "Filter module {} declares {} argument(s)",
            metadata.name,
            metadata.arguments.len()
        );

        Ok(Self {
            metadata,
            entry,
            _library: Some(library),
        })
    }

    /// Wrap an entry point that is linked into the current process.
    pub fn from_entry(metadata: FilterMetadata, entry: ArgvFn) -> Self {
        Self {
            metadata,
            entry,
            _library: None,
        }
    }
}

impl Filter for DynamicFilter {
    fn metadata(&self) -> &FilterMetadata {
        &self.metadata
    }

    fn call(&self, args: &mut [ArgSlot<'_>], ctx: &InvokeContext) -> i32 {
        let mut marshalled: Vec<Marshalled> = Vec::with_capacity(args.len());
        for slot in args.iter_mut() {
            match slot {
                ArgSlot::Scalar(value) => {
                    let mut bytes = [0u8; 8];
                    value.write_ne(&mut bytes);
                    marshalled.push(Marshalled::Scalar(u64::from_ne_bytes(bytes)));
                }
                ArgSlot::Buffer(buffer) => {
                    let dims: Vec<RawDimension> =
                        buffer.shape().iter().map(|&d| RawDimension::from(d)).collect();
                    let raw = RawBuffer {
                        host: buffer.host_ptr(),
                        type_: RawType::from(buffer.type_tag()),
                        dimensions: dims.len() as i32,
                        dim: ptr::null_mut(),
                    };
                    marshalled.push(Marshalled::Buffer(raw, dims));
                }
            }
        }

        // `marshalled` no longer grows, so these pointers stay valid.
        let mut argv: Vec<*mut c_void> = marshalled
            .iter_mut()
            .map(|m| match m {
                Marshalled::Scalar(slot) => slot as *mut u64 as *mut c_void,
                Marshalled::Buffer(raw, dims) => {
                    raw.dim = dims.as_mut_ptr();
                    raw as *mut RawBuffer as *mut c_void
                }
            })
            .collect();

        let device = ctx.device().and_then(|d| CString::new(d).ok());
        let runtime = RawRuntime {
            user_context: ctx as *const InvokeContext as *mut c_void,
            malloc: runtime_malloc,
            free: runtime_free,
            print: runtime_print,
            error: runtime_error,
            device: device.as_ref().map_or(ptr::null(), |d| d.as_ptr()),
        };

        // SAFETY: every pointer in argv refers to live data in `marshalled`
        // or in the caller's buffers, and `runtime` and `device` outlive the
        // call.
        let code = unsafe { (self.entry)(&runtime, argv.as_mut_ptr()) };

        // Bounds-query results flow back into the placeholders.
        for (slot, m) in args.iter_mut().zip(marshalled.iter()) {
            if let (ArgSlot::Buffer(buffer), Marshalled::Buffer(_, dims)) = (slot, m) {
                if let Some(shape) = buffer.query_shape_mut() {
                    for (d, raw) in shape.iter_mut().zip(dims.iter()) {
                        *d = Dimension::from(*raw);
                    }
                }
            }
        }
        code
    }
}
