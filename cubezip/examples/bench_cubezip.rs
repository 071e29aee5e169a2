use std::time::Instant;

use num_traits::Zero;

use cubezip::{
    compress, decompress, gpu_available, CubeFloat, CubezipBackend, CubezipOptions, Extent, Slice,
    SliceMut,
};

#[derive(Debug, Clone)]
struct BenchConfig {
    dims: usize,
    extent: usize,
    double: bool,
    backend: Option<CubezipBackend>,
    runs: usize,
    warmups: usize,
    cpu_workers: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            dims: 3,
            extent: 0,
            double: false,
            backend: None,
            runs: 3,
            warmups: 1,
            cpu_workers: 0,
        }
    }
}

fn parse_backend(s: &str) -> Result<CubezipBackend, String> {
    match s {
        "serial" => Ok(CubezipBackend::Serial),
        "threaded" => Ok(CubezipBackend::Threaded),
        "gpu" => Ok(CubezipBackend::Gpu),
        _ => Err(format!(
            "invalid --backend: {s} (expected serial|threaded|gpu)"
        )),
    }
}

fn parse_args() -> Result<BenchConfig, String> {
    let mut cfg = BenchConfig::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1_usize;
    while i < args.len() {
        match args[i].as_str() {
            "--dims" => {
                i += 1;
                let v = args.get(i).ok_or("--dims requires value")?;
                cfg.dims = v.parse::<usize>().map_err(|e| format!("invalid --dims: {e}"))?;
                if !(1..=3).contains(&cfg.dims) {
                    return Err("--dims must be 1, 2 or 3".to_string());
                }
            }
            "--extent" => {
                i += 1;
                let v = args.get(i).ok_or("--extent requires value")?;
                cfg.extent = v
                    .parse::<usize>()
                    .map_err(|e| format!("invalid --extent: {e}"))?;
            }
            "--double" => {
                cfg.double = true;
            }
            "--backend" => {
                i += 1;
                let v = args.get(i).ok_or("--backend requires value")?;
                cfg.backend = Some(parse_backend(v)?);
            }
            "--runs" => {
                i += 1;
                let v = args.get(i).ok_or("--runs requires value")?;
                cfg.runs = v.parse::<usize>().map_err(|e| format!("invalid --runs: {e}"))?;
            }
            "--warmups" => {
                i += 1;
                let v = args.get(i).ok_or("--warmups requires value")?;
                cfg.warmups = v
                    .parse::<usize>()
                    .map_err(|e| format!("invalid --warmups: {e}"))?;
            }
            "--workers" => {
                i += 1;
                let v = args.get(i).ok_or("--workers requires value")?;
                cfg.cpu_workers = v
                    .parse::<usize>()
                    .map_err(|e| format!("invalid --workers: {e}"))?;
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
        i += 1;
    }
    if cfg.extent == 0 {
        // Roughly 64 MiB of f32 samples per dimensionality, with border.
        cfg.extent = match cfg.dims {
            1 => 4096 * 4096 + 999,
            2 => 64 * 64 + 33,
            _ => 16 * 16 + 7,
        };
    }
    Ok(cfg)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

// Smooth pseudo-random field: spatially correlated enough that the delta
// transform has something to remove, seeded LCG so runs are reproducible.
fn fill_field(bits: &mut u32, smooth: &mut f64) -> f64 {
    *bits = bits.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
    let noise = (*bits >> 8) as f64 / 16_777_216.0 - 0.5;
    *smooth = *smooth * 0.96 + noise * 0.04;
    *smooth
}

fn bench_case<T: CubeFloat, const D: usize>(
    data: &[T],
    size: Extent<D>,
    backend: CubezipBackend,
    cfg: &BenchConfig,
    label: &str,
) {
    let options = CubezipOptions {
        backend,
        cpu_worker_count: cfg.cpu_workers,
    };
    let raw_bytes = data.len() * std::mem::size_of::<T>();

    let mut best_comp_ms = f64::MAX;
    let mut best_decomp_ms = f64::MAX;
    let mut stream_len = 0_usize;
    for run in 0..cfg.warmups + cfg.runs {
        let input = match Slice::new(data, size) {
            Ok(slice) => slice,
            Err(e) => {
                eprintln!("bench: {e}");
                std::process::exit(1);
            }
        };
        let comp_start = Instant::now();
        let stream = match compress(input, &options) {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("bench: compress failed: {e}");
                std::process::exit(1);
            }
        };
        let comp_ms = elapsed_ms(comp_start);

        let mut restored = vec![T::from_bits(T::Bits::zero()); data.len()];
        let mut output = match SliceMut::new(&mut restored, size) {
            Ok(slice) => slice,
            Err(e) => {
                eprintln!("bench: {e}");
                std::process::exit(1);
            }
        };
        let decomp_start = Instant::now();
        if let Err(e) = decompress(&stream, &mut output, &options) {
            eprintln!("bench: decompress failed: {e}");
            std::process::exit(1);
        }
        let decomp_ms = elapsed_ms(decomp_start);

        for (a, b) in data.iter().zip(restored.iter()) {
            if a.to_bits() != b.to_bits() {
                eprintln!("bench: roundtrip mismatch");
                std::process::exit(1);
            }
        }

        if run >= cfg.warmups {
            best_comp_ms = best_comp_ms.min(comp_ms);
            best_decomp_ms = best_decomp_ms.min(decomp_ms);
        }
        stream_len = stream.len();
    }

    let mib = raw_bytes as f64 / (1024.0 * 1024.0);
    println!(
        "[bench] {label:>8}  raw={raw_bytes} B  compressed={stream_len} B  ratio={:.4}  \
         compress={:.1} MiB/s  decompress={:.1} MiB/s",
        raw_bytes as f64 / stream_len as f64,
        mib / (best_comp_ms / 1000.0),
        mib / (best_decomp_ms / 1000.0),
    );
}

fn run_all<T: CubeFloat, const D: usize>(data: &[T], size: Extent<D>, cfg: &BenchConfig) {
    match cfg.backend {
        Some(backend) => bench_case(data, size, backend, cfg, "chosen"),
        None => {
            bench_case(data, size, CubezipBackend::Serial, cfg, "serial");
            bench_case(data, size, CubezipBackend::Threaded, cfg, "threaded");
            if gpu_available() {
                bench_case(data, size, CubezipBackend::Gpu, cfg, "gpu");
            } else {
                println!("[bench]      gpu  skipped (no usable adapter)");
            }
        }
    }
}

fn main() {
    let cfg = match parse_args() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("bench: {e}");
            eprintln!(
                "usage: bench_cubezip [--dims 1|2|3] [--extent N] [--double] \
                 [--backend serial|threaded|gpu] [--runs N] [--warmups N] [--workers N]"
            );
            std::process::exit(1);
        }
    };

    let n = cfg.extent;
    let elements = n.pow(cfg.dims as u32);
    println!(
        "[bench] dims={} extent={} elements={} type={}",
        cfg.dims,
        n,
        elements,
        if cfg.double { "f64" } else { "f32" },
    );

    let mut bits = 0x5eed_cafe_u32;
    let mut smooth = 0.0_f64;
    if cfg.double {
        let data: Vec<f64> = (0..elements).map(|_| fill_field(&mut bits, &mut smooth)).collect();
        match cfg.dims {
            1 => run_all(&data, Extent([n]), &cfg),
            2 => run_all(&data, Extent([n, n]), &cfg),
            _ => run_all(&data, Extent([n, n, n]), &cfg),
        }
    } else {
        let data: Vec<f32> = (0..elements)
            .map(|_| fill_field(&mut bits, &mut smooth) as f32)
            .collect();
        match cfg.dims {
            1 => run_all(&data, Extent([n]), &cfg),
            2 => run_all(&data, Extent([n, n]), &cfg),
            _ => run_all(&data, Extent([n, n, n]), &cfg),
        }
    }
}
