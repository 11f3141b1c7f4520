//! End-to-end runs through the command-line surface with in-process filters
//! and real image files.

use std::cell::Cell;

use clap::Parser;
use hlx_rungen::cli::{run_with_filter, RunGenArgs};
use hlx_rungen::scalar::ScalarValue;
use hlx_rungen::{
    ArgSlot, ArgumentMetadata, Filter, FilterMetadata, ImageFileIo, InvokeContext, RunGenError,
    TypeTag,
};

/// `out(x, y) = in(x, y) + bias`, allocating scratch memory on real calls.
struct Brighten {
    metadata: FilterMetadata,
    calls: Cell<usize>,
}

impl Brighten {
    fn new() -> Self {
        Self {
            metadata: FilterMetadata {
                name: "brighten".to_string(),
                arguments: vec![
                    ArgumentMetadata::scalar("bias", TypeTag::INT32),
                    ArgumentMetadata::input_buffer("in", TypeTag::UINT8, 2),
                    ArgumentMetadata::output_buffer("out", TypeTag::UINT8, 2),
                ],
            },
            calls: Cell::new(0),
        }
    }
}

impl Filter for Brighten {
    fn metadata(&self) -> &FilterMetadata {
        &self.metadata
    }

    fn call(&self, args: &mut [ArgSlot<'_>], ctx: &InvokeContext) -> i32 {
        self.calls.set(self.calls.get() + 1);
        let bias = match args[0].as_scalar() {
            Some(ScalarValue::Int32(b)) => *b,
            _ => return 1,
        };
        let (head, tail) = args.split_at_mut(2);
        let (Some(input), Some(output)) = (head[1].as_buffer(), tail[0].as_buffer_mut()) else {
            return 1;
        };

        if let Some(shape) = output.query_shape_mut() {
            for (d, src) in shape.iter_mut().zip(input.shape().iter()) {
                d.min = src.min;
                d.extent = src.extent;
            }
            return 0;
        }

        let Some(scratch) = ctx.allocate(1 << 16) else {
            return 2;
        };
        ctx.print("brightening");
        for coords in output.coordinates() {
            let Some(ScalarValue::UInt8(v)) = input.get(&coords) else {
                ctx.free(scratch);
                return 3;
            };
            let value = (i32::from(v) + bias).clamp(0, 255) as u8;
            if output.set(&coords, ScalarValue::UInt8(value)).is_err() {
                ctx.free(scratch);
                return 4;
            }
        }
        ctx.free(scratch);
        0
    }
}

fn parse(argv: &[&str]) -> RunGenArgs {
    let mut full = vec!["hlx_rungen"];
    full.extend_from_slice(argv);
    RunGenArgs::try_parse_from(full).unwrap()
}

#[test]
fn test_zero_input_writes_png() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("o.png");
    let out_arg = format!("out={}", out.display());

    let filter = Brighten::new();
    let args = parse(&["bias=3", "in=zero:[10,10]", out_arg.as_str(), "--describe=false"]);
    let report = run_with_filter(&filter, &ImageFileIo::new(), &args).unwrap();

    assert_eq!(report.saved, vec![out.clone()]);
    let png = image::open(&out).unwrap().to_luma8();
    assert_eq!(png.dimensions(), (10, 10));
    assert!(png.pixels().all(|p| p.0[0] == 3));
}

#[test]
fn test_file_input_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.png");
    let out = dir.path().join("out.png");

    let mut img = image::GrayImage::new(6, 4);
    img.put_pixel(5, 3, image::Luma([250]));
    img.put_pixel(1, 2, image::Luma([40]));
    img.save(&input).unwrap();

    let filter = Brighten::new();
    let in_arg = format!("in={}", input.display());
    let out_arg = format!("out={}", out.display());
    let args = parse(&["--print=false", "bias=10", in_arg.as_str(), out_arg.as_str()]);
    run_with_filter(&filter, &ImageFileIo::new(), &args).unwrap();

    let result = image::open(&out).unwrap().to_luma8();
    assert_eq!(result.dimensions(), (6, 4));
    assert_eq!(result.get_pixel(5, 3).0[0], 255);
    assert_eq!(result.get_pixel(1, 2).0[0], 50);
    assert_eq!(result.get_pixel(0, 0).0[0], 10);
}

#[test]
fn test_benchmark_call_count() {
    let filter = Brighten::new();
    let args = parse(&[
        "--benchmark",
        "--benchmark_samples=2",
        "--benchmark_iterations=5",
        "--print=false",
        "bias=1",
        "in=zero:[16,16]",
    ]);
    let report = run_with_filter(&filter, &ImageFileIo::new(), &args).unwrap();

    // Bounds query + warm-up + 2 x 5 timed calls.
    assert_eq!(filter.calls.get(), 12);
    let bench = report.benchmark.unwrap();
    assert_eq!((bench.samples, bench.iterations), (2, 5));
    assert!(bench.best_seconds >= 0.0);
    assert!((report.megapixels - 256.0 / 1048576.0).abs() < 1e-15);
    assert!(report.saved.is_empty());
}

#[test]
fn test_track_memory_reports_highwater() {
    let filter = Brighten::new();
    let args = parse(&["--track_memory", "--print=false", "bias=1", "in=zero:[4,4]"]);
    let report = run_with_filter(&filter, &ImageFileIo::new(), &args).unwrap();
    assert_eq!(report.memory_highwater, Some(1 << 16));
    assert_eq!(filter.calls.get(), 2);
}

#[test]
fn test_describe_does_not_run() {
    let filter = Brighten::new();
    let args = parse(&["--describe", "bias=1"]);
    let report = run_with_filter(&filter, &ImageFileIo::new(), &args).unwrap();
    assert_eq!(filter.calls.get(), 0);
    assert!(report.saved.is_empty());
}

#[test]
fn test_typos_reported_with_missing_arguments() {
    let filter = Brighten::new();
    let args = parse(&["bais=1", "in=zero:[4,4]", "out=o.png"]);
    let err = run_with_filter(&filter, &ImageFileIo::new(), &args).unwrap_err();
    assert!(matches!(err, RunGenError::Usage(_)));
    let message = err.to_string();
    assert!(message.contains("Unknown argument name: bais"), "{}", message);
    assert!(message.contains("Argument value missing for: bias"), "{}", message);
    assert_eq!(filter.calls.get(), 0);
}

#[test]
fn test_unsupported_output_format() {
    let dir = tempfile::tempdir().unwrap();
    let out_arg = format!("out={}", dir.path().join("o.tiff").display());
    let filter = Brighten::new();
    let args = parse(&["--print=false", "bias=1", "in=zero:[4,4]", out_arg.as_str()]);
    let err = run_with_filter(&filter, &ImageFileIo::new(), &args).unwrap_err();
    assert!(matches!(err, RunGenError::Io(_)), "got {:?}", err);
}
