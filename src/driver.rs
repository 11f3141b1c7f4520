//! Invocation driver
//!
//! Runs one filter end to end:
//!
//! 1. resolve `name=value` tokens and load inputs,
//! 2. bounds query with placeholder outputs,
//! 3. repair and allocate the output shapes,
//! 4. invoke (once, or warm-up plus timed batches),
//! 5. save outputs.
//!
//! Every failure is returned as a `RunGenError`; the driver never retries.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::args::{ArgValue, ArgumentTable};
use crate::benchmark::{self, BenchmarkResult, DEFAULT_ITERATIONS, DEFAULT_SAMPLES};
use crate::buffer::{allocate_buffer, Buffer};
use crate::diagnostics::Diagnostics;
use crate::error::{Result, RunGenError};
use crate::filter::{ArgSlot, ArgumentKind, ArgumentMetadata, Filter, InvokeContext};
use crate::image_io::{best_save_format, ImageIo};
use crate::memory::{MemoryTracker, SystemAllocator};
use crate::scalar;
use crate::shape::{
    adjust_buffer_dimensions, default_output_shape, parse_extent_list, ImageLayoutHeuristic,
    Shape, ShapeRepairPolicy,
};

/// Run configuration, built from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub benchmark: bool,
    pub benchmark_samples: u32,
    pub benchmark_iterations: u32,
    pub track_memory: bool,
    /// Forward filter `print` output to stdout.
    pub print: bool,
    /// Default shape for output bounds queries. When unset, the shape of
    /// the first input buffer (in name order) is used.
    pub output_extents: Option<Shape>,
    /// Device selection token passed to the filter.
    pub device: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            benchmark: false,
            benchmark_samples: DEFAULT_SAMPLES,
            benchmark_iterations: DEFAULT_ITERATIONS,
            track_memory: false,
            print: true,
            output_extents: None,
            device: None,
        }
    }
}

impl RunOptions {
    /// Outputs may be left unnamed when nothing needs to be saved.
    pub fn tolerates_missing_outputs(&self) -> bool {
        self.benchmark || self.track_memory
    }
}

/// Driver state, for debug logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    BoundsQuery,
    ShapeFix,
    Allocating,
    Invoking,
    Persisting,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolving => "resolving",
            Stage::BoundsQuery => "bounds query",
            Stage::ShapeFix => "shape fix",
            Stage::Allocating => "allocating",
            Stage::Invoking => "invoking",
            Stage::Persisting => "persisting",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a run produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunReport {
    pub benchmark: Option<BenchmarkResult>,
    /// Peak tracked allocation in bytes, with `--track_memory`.
    pub memory_highwater: Option<u64>,
    /// Output size used for throughput, in 2^20 pixels.
    pub megapixels: f64,
    pub saved: Vec<PathBuf>,
}

/// Drives a single filter run.
pub struct RunGen<'a> {
    filter: &'a dyn Filter,
    io: &'a dyn ImageIo,
    options: RunOptions,
    policy: Box<dyn ShapeRepairPolicy>,
    stage: Stage,
    diagnostics: Diagnostics,
}

impl<'a> RunGen<'a> {
    pub fn new(filter: &'a dyn Filter, io: &'a dyn ImageIo, options: RunOptions) -> Self {
        Self {
            filter,
            io,
            options,
            policy: Box::new(ImageLayoutHeuristic),
            stage: Stage::Resolving,
            diagnostics: Diagnostics::new(),
        }
    }

    /// Replace the bounds-query shape repair policy.
    pub fn with_repair_policy(mut self, policy: Box<dyn ShapeRepairPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    fn enter(&mut self, stage: Stage) {
        log::debug!("Driver: {} -> {}", self.stage, stage);
        self.stage = stage;
    }

    /// Run the filter with the given `name=value` tokens.
    ///
    /// # Errors
    ///
    /// Any usage, parse, shape, I/O, tracking or module failure. The driver
    /// is left in `Stage::Failed`.
    pub fn run<S: AsRef<str>>(&mut self, tokens: &[S]) -> Result<RunReport> {
        match self.run_stages(tokens) {
            Ok(report) => {
                self.enter(Stage::Done);
                Ok(report)
            }
            Err(e) => {
                self.enter(Stage::Failed);
                Err(e)
            }
        }
    }

    fn run_stages<S: AsRef<str>>(&mut self, tokens: &[S]) -> Result<RunReport> {
        self.enter(Stage::Resolving);
        let mut table = ArgumentTable::new(self.filter.metadata())?;
        table.resolve_all(tokens)?;

        if self.options.benchmark && self.options.track_memory {
            self.diagnostics.warn(
                "Using --track_memory with --benchmark will produce inaccurate benchmark results."
                    .to_string(),
            );
        }
        table.check_complete(self.options.tolerates_missing_outputs())?;

        let output_hint = self.resolve_inputs(&mut table)?;

        let mut ctx = InvokeContext::new(self.options.print, self.options.device.clone());

        self.enter(Stage::BoundsQuery);
        for arg in table.iter_by_name_mut() {
            if arg.metadata.kind == ArgumentKind::OutputBuffer {
                let shape = default_output_shape(arg.metadata.dimensions, &output_hint);
                arg.value = ArgValue::Buffer(Buffer::unallocated(arg.metadata.type_tag, shape));
            }
        }
        log::info!("Running bounds query...");
        invoke(self.filter, &mut table.call_slots()?, &ctx, "Bounds query")?;

        let megapixels = self.allocate_outputs(&mut table)?;

        // Only the real calls are tracked, not the bounds query.
        let tracker = if self.options.track_memory {
            let tracker = Arc::new(MemoryTracker::new(Arc::new(SystemAllocator::new())));
            ctx.install_allocator(tracker.clone())?;
            Some(tracker)
        } else {
            None
        };

        self.enter(Stage::Invoking);
        let filter = self.filter;
        let mut slots = table.call_slots()?;
        let benchmark = if self.options.benchmark {
            log::info!("Benchmarking filter...");
            invoke(filter, &mut slots, &ctx, "Filter")?;
            if let Some(tracker) = &tracker {
                tracker.highwater_reset();
            }
            let result = benchmark::benchmark(
                self.options.benchmark_samples,
                self.options.benchmark_iterations,
                || invoke(filter, &mut slots, &ctx, "Filter"),
            )?;
            Some(result)
        } else {
            log::info!("Running filter...");
            invoke(filter, &mut slots, &ctx, "Filter")?;
            None
        };
        drop(slots);
        let memory_highwater = tracker.as_ref().map(|t| t.highwater());

        self.enter(Stage::Persisting);
        let saved = self.save_outputs(&mut table)?;

        Ok(RunReport {
            benchmark,
            memory_highwater,
            megapixels,
            saved,
        })
    }

    /// Parse scalars and load input buffers. Returns the default shape for
    /// output bounds queries.
    fn resolve_inputs(&mut self, table: &mut ArgumentTable) -> Result<Shape> {
        let mut output_hint = self.options.output_extents.clone();
        let io = self.io;
        for arg in table.iter_by_name_mut() {
            match arg.metadata.kind {
                ArgumentKind::InputScalar => {
                    let value = scalar::parse(&arg.raw, arg.metadata.type_tag).map_err(|e| match e {
                        RunGenError::Parse { text, expected } => RunGenError::ArgumentParse {
                            name: arg.metadata.name.clone(),
                            text,
                            expected,
                        },
                        other => other,
                    })?;
                    arg.value = ArgValue::Scalar(value);
                }
                ArgumentKind::InputBuffer => {
                    let buffer = load_input(io, &arg.raw, &arg.metadata, &mut self.diagnostics)?;
                    if output_hint.is_none() {
                        output_hint = Some(buffer.shape().clone());
                    }
                    arg.value = ArgValue::Buffer(buffer);
                }
                ArgumentKind::OutputBuffer => {}
            }
        }
        Ok(output_hint.unwrap_or_default())
    }

    /// Replace each bounds-query placeholder with an allocated buffer.
    /// Returns the total output megapixels.
    fn allocate_outputs(&mut self, table: &mut ArgumentTable) -> Result<f64> {
        self.enter(Stage::ShapeFix);
        let mut repaired = Vec::new();
        for arg in table.iter_by_name() {
            if arg.metadata.kind != ArgumentKind::OutputBuffer {
                continue;
            }
            let constrained = arg.buffer().map(|b| b.shape().clone()).unwrap_or_default();
            log::info!(
                "Output {}: BoundsQuery result is {}",
                arg.name(),
                constrained
            );
            repaired.push(self.policy.repair(&constrained));
        }

        self.enter(Stage::Allocating);
        let mut pixels = 0.0f64;
        let outputs = table
            .iter_by_name_mut()
            .filter(|arg| arg.metadata.kind == ArgumentKind::OutputBuffer);
        for (arg, shape) in outputs.zip(repaired) {
            let buffer = allocate_buffer(arg.metadata.type_tag, &shape)?;
            log::info!("Output {}: Shape is {}", arg.name(), buffer.shape());
            // Counts the first two axes only, as if every output were an image.
            pixels += shape.iter().take(2).map(|d| d.extent as f64).product::<f64>();
            arg.value = ArgValue::Buffer(buffer);
        }
        Ok(pixels / (1024.0 * 1024.0))
    }

    fn save_outputs(&mut self, table: &mut ArgumentTable) -> Result<Vec<PathBuf>> {
        let mut saved = Vec::new();
        for arg in table.iter_by_name_mut() {
            if arg.metadata.kind != ArgumentKind::OutputBuffer {
                continue;
            }
            if !arg.is_specified() {
                log::info!("(Output {} was not saved.)", arg.name());
                continue;
            }

            let name = arg.metadata.name.clone();
            let path = PathBuf::from(&arg.raw);
            log::info!("Saving output {} to {} ...", name, path.display());
            let ArgValue::Buffer(buffer) = std::mem::replace(&mut arg.value, ArgValue::Unresolved)
            else {
                return Err(RunGenError::Usage(format!("Output {} has no buffer", name)));
            };

            let formats = self.io.query_savable_formats(&path)?;
            let best = best_save_format(&buffer, &formats)?;
            let mut buffer = adjust_buffer_dimensions(
                buffer,
                best.dimensions,
                "Output",
                &name,
                &mut self.diagnostics,
            );
            if buffer.type_tag() != best.type_tag {
                self.diagnostics.warn(format!(
                    "Image for argument \"{}\" is of type {} but is being saved as type {}; \
                     data loss may have occurred.",
                    name,
                    buffer.type_tag(),
                    best.type_tag
                ));
                buffer = buffer.convert(best.type_tag)?;
            }
            self.io.save(&buffer, &path)?;
            saved.push(path);
        }
        Ok(saved)
    }
}

/// Call the filter once and check both the return code and any fault
/// recorded by runtime callbacks during the call.
fn invoke(
    filter: &dyn Filter,
    slots: &mut [ArgSlot<'_>],
    ctx: &InvokeContext,
    phase: &'static str,
) -> Result<()> {
    let code = filter.call(slots, ctx);
    if let Some(fault) = ctx.take_fault() {
        return Err(fault);
    }
    if code != 0 {
        return Err(RunGenError::ModuleInvocation { phase, code });
    }
    Ok(())
}

/// Load an input buffer from `source`.
///
/// `source` is either a path or `key:value` with a key longer than one
/// character (so Windows drive letters still read as paths). The only key
/// is `zero`, taking an extent list: `zero:[1920,1080,3]`.
pub fn load_input(
    io: &dyn ImageIo,
    source: &str,
    metadata: &ArgumentMetadata,
    diagnostics: &mut Diagnostics,
) -> Result<Buffer> {
    match source.split_once(':') {
        Some((key, value)) if key.len() > 1 && !value.contains(':') => {
            if key == "zero" {
                let shape = parse_extent_list(value)?;
                let mut buffer = allocate_buffer(metadata.type_tag, &shape)?;
                buffer.fill_zero();
                Ok(buffer)
            } else {
                Err(RunGenError::Usage(format!("Unknown input: {}", source)))
            }
        }
        _ => load_input_from_file(io, Path::new(source), metadata, diagnostics),
    }
}

fn load_input_from_file(
    io: &dyn ImageIo,
    path: &Path,
    metadata: &ArgumentMetadata,
    diagnostics: &mut Diagnostics,
) -> Result<Buffer> {
    log::info!("Loading input {} from {} ...", metadata.name, path.display());
    let buffer = io.load(path)?;
    let buffer = adjust_buffer_dimensions(
        buffer,
        metadata.dimensions,
        "Input",
        &metadata.name,
        diagnostics,
    );
    if buffer.type_tag() == metadata.type_tag {
        return Ok(buffer);
    }
    diagnostics.warn(format!(
        "Image loaded for argument \"{}\" is type {} but this argument expects type {}; \
         data loss may have occurred.",
        metadata.name,
        buffer.type_tag(),
        metadata.type_tag
    ));
    buffer.convert(metadata.type_tag)
}
