//! Command-line surface
//!
//! Parses `name=value` filter arguments and `--flag[=value]` options with
//! clap, runs the driver, and prints the benchmark and memory report.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, CommandFactory, Parser};

use crate::args::ArgumentTable;
use crate::benchmark::{DEFAULT_ITERATIONS, DEFAULT_SAMPLES};
use crate::diagnostics::{describe, init_logging};
use crate::driver::{RunGen, RunOptions, RunReport};
use crate::error::{Result, RunGenError};
use crate::ffi::DynamicFilter;
use crate::filter::Filter;
use crate::image_io::{ImageFileIo, ImageIo};
use crate::shape::{parse_extent_list, Shape};

const USAGE: &str = "hlx_rungen --module=PATH argument=value [argument=value... ] [flags]";

const ARGUMENTS_HELP: &str = "\
Arguments:

    Filter inputs and outputs are given by name, in any order.

    Scalar inputs use their literal value:

        some_int=42 some_float=3.1415 some_bool=true

    Handle inputs may only be nullptr, and may be omitted.

    Buffer inputs and outputs are file paths:

        some_input_buffer=/path/to/existing/file.png
        some_output_buffer=/path/to/create/file.png

    The file format is chosen by extension (png, jpg, jpeg, pgm, ppm).
    Data is converted to the buffer's type and dimensionality where needed,
    with a warning when this may lose data.

    An input buffer may instead be a pseudo-source:

        zero:[NUM,NUM,...]   a zero-filled buffer with the given extents

    Outputs may be omitted with --benchmark or --track_memory.

Known issues:

    * Output shapes are guessed from the first input (by name) or from
      --output_extents, then repaired assuming axis 2 is the channel axis.
      Filters with other interleaved layouts may need --output_extents.";

fn parse_output_extents(text: &str) -> std::result::Result<Shape, String> {
    parse_extent_list(text).map_err(|e| e.to_string())
}

/// Command-line arguments of `hlx_rungen`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "hlx_rungen",
    about = "Run a compiled filter module on files or synthetic inputs",
    version,
    override_usage = USAGE,
    after_long_help = ARGUMENTS_HELP
)]
pub struct RunGenArgs {
    /// Filter arguments as name=value
    #[arg(value_name = "ARGUMENT=VALUE")]
    pub arguments: Vec<String>,

    /// Shared library exporting the filter
    #[arg(long, require_equals = true, value_name = "PATH")]
    pub module: Option<PathBuf>,

    /// Print the names and types of all filter arguments and exit
    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub describe: bool,

    /// Extent of each output dimension, e.g. [1000,100] or [100,200,3];
    /// applies to every output
    #[arg(
        long = "output_extents",
        require_equals = true,
        value_name = "[NUM,NUM,...]",
        value_parser = parse_output_extents
    )]
    pub output_extents: Option<Shape>,

    /// Emit extra diagnostic output
    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub verbose: bool,

    /// Forward filter print calls to stdout (--print=false silences them)
    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = true,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub print: bool,

    /// Run the filter many times and report the best time per call
    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub benchmark: bool,

    /// Number of timed batches (with --benchmark)
    #[arg(long = "benchmark_samples", require_equals = true, default_value_t = DEFAULT_SAMPLES)]
    pub benchmark_samples: u32,

    /// Calls per timed batch (with --benchmark)
    #[arg(long = "benchmark_iterations", require_equals = true, default_value_t = DEFAULT_ITERATIONS)]
    pub benchmark_iterations: u32,

    /// Track the high-water mark of filter memory allocation; slows down
    /// execution, so benchmarks may be inaccurate with this on
    #[arg(
        long = "track_memory",
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub track_memory: bool,

    /// Device selection token passed to the filter
    #[arg(long, require_equals = true, value_name = "TOKEN")]
    pub device: Option<String>,
}

impl From<&RunGenArgs> for RunOptions {
    fn from(args: &RunGenArgs) -> Self {
        Self {
            benchmark: args.benchmark,
            benchmark_samples: args.benchmark_samples,
            benchmark_iterations: args.benchmark_iterations,
            track_memory: args.track_memory,
            print: args.print,
            output_extents: args.output_extents.clone(),
            device: args.device.clone(),
        }
    }
}

/// Lines printed to stdout after a successful run.
pub fn report_lines(filter_name: &str, report: &RunReport) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(bench) = &report.benchmark {
        lines.push(format!(
            "Benchmark for {} produces best case of {} sec/iter, over {} blocks of {} iterations.",
            filter_name, bench.best_seconds, bench.samples, bench.iterations
        ));
        lines.push(format!(
            "Best output throughput is {} mpix/sec.",
            bench.throughput(report.megapixels)
        ));
    }
    if let Some(highwater) = report.memory_highwater {
        lines.push(format!(
            "Maximum memory: {} bytes for output of {} mpix.",
            highwater, report.megapixels
        ));
    }
    lines
}

/// Run `filter` as the command line asks.
///
/// With `--describe` the arguments are only checked for syntax, the filter's
/// signature is printed, and an empty report is returned.
///
/// # Errors
///
/// Any error from the driver.
pub fn run_with_filter(filter: &dyn Filter, io: &dyn ImageIo, args: &RunGenArgs) -> Result<RunReport> {
    if args.describe {
        ArgumentTable::new(filter.metadata())?.resolve_all(&args.arguments)?;
        print!("{}", describe(filter.metadata()));
        return Ok(RunReport::default());
    }

    let mut driver = RunGen::new(filter, io, RunOptions::from(args));
    let report = driver.run(&args.arguments)?;
    for line in report_lines(&filter.metadata().name, &report) {
        println!("{}", line);
    }
    Ok(report)
}

fn run(args: &RunGenArgs) -> Result<RunReport> {
    let module = args.module.as_ref().ok_or_else(|| {
        RunGenError::Usage("No filter module given; use --module=PATH".to_string())
    })?;
    let filter = DynamicFilter::load(module)?;
    run_with_filter(&filter, &ImageFileIo::new(), args)
}

/// Full text printed for `--help` and for a bare invocation.
pub fn usage_text() -> String {
    RunGenArgs::command().render_long_help().to_string()
}

/// Entry point of the `hlx_rungen` binary. Returns the process exit code.
pub fn execute<I, T>(argv: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let argv: Vec<OsString> = argv.into_iter().map(Into::into).collect();
    if argv.len() <= 1 {
        println!("{}", usage_text());
        return 0;
    }

    let args = match RunGenArgs::try_parse_from(&argv) {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { 1 } else { 0 };
        }
    };
    init_logging(args.verbose);

    match run(&args) {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    }
}
