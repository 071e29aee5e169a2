// Minimal file driver: compresses or decompresses one raw little-endian
// float dump as a single stream. The array extent is given on the command
// line, first-major, one value per dimension.

use cubezip::{
    compress, decompress, CubeBits, CubeFloat, CubezipBackend, CubezipOptions, Extent, Slice,
    SliceMut,
};
use num_traits::Zero;

#[derive(Debug)]
struct DriverConfig {
    decompress: bool,
    extent: Vec<usize>,
    double: bool,
    backend: CubezipBackend,
    input: String,
    output: String,
}

fn parse_args() -> Result<DriverConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).ok_or("expected compress|decompress")?;
    let mut cfg = DriverConfig {
        decompress: match mode.as_str() {
            "compress" => false,
            "decompress" => true,
            other => return Err(format!("unknown mode: {other}")),
        },
        extent: Vec::new(),
        double: false,
        backend: CubezipBackend::Threaded,
        input: String::new(),
        output: String::new(),
    };

    let mut i = 2_usize;
    while i < args.len() {
        match args[i].as_str() {
            "--extent" => {
                while let Some(v) = args.get(i + 1) {
                    let Ok(axis) = v.parse::<usize>() else {
                        break;
                    };
                    cfg.extent.push(axis);
                    i += 1;
                }
                if cfg.extent.is_empty() {
                    return Err("--extent requires 1 to 3 values".to_string());
                }
            }
            "--double" => {
                cfg.double = true;
            }
            "--backend" => {
                i += 1;
                let v = args.get(i).ok_or("--backend requires value")?;
                cfg.backend = match v.as_str() {
                    "serial" => CubezipBackend::Serial,
                    "threaded" => CubezipBackend::Threaded,
                    "gpu" => CubezipBackend::Gpu,
                    other => return Err(format!("invalid --backend: {other}")),
                };
            }
            "--input" => {
                i += 1;
                cfg.input = args.get(i).ok_or("--input requires value")?.clone();
            }
            "--output" => {
                i += 1;
                cfg.output = args.get(i).ok_or("--output requires value")?.clone();
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
        i += 1;
    }

    if !(1..=3).contains(&cfg.extent.len()) {
        return Err("--extent requires 1 to 3 values".to_string());
    }
    if cfg.input.is_empty() || cfg.output.is_empty() {
        return Err("--input and --output are required".to_string());
    }
    Ok(cfg)
}

fn decode_samples<T: CubeFloat>(raw: &[u8]) -> Result<Vec<T>, String> {
    let word = std::mem::size_of::<T>();
    if raw.len() % word != 0 {
        return Err(format!("input length is not a multiple of {word} bytes"));
    }
    Ok(raw
        .chunks_exact(word)
        .map(|chunk| T::from_bits(T::Bits::read_le(chunk)))
        .collect())
}

fn encode_samples<T: CubeFloat>(samples: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * std::mem::size_of::<T>());
    for &value in samples {
        value.to_bits().write_le(&mut out);
    }
    out
}

fn run_case<T: CubeFloat, const D: usize>(
    cfg: &DriverConfig,
    size: Extent<D>,
) -> Result<(), String> {
    let options = CubezipOptions {
        backend: cfg.backend,
        cpu_worker_count: 0,
    };
    let raw = std::fs::read(&cfg.input).map_err(|e| format!("{}: {e}", cfg.input))?;

    let out = if cfg.decompress {
        let mut samples = vec![T::from_bits(T::Bits::zero()); size.num_elements()];
        let mut output =
            SliceMut::new(&mut samples, size).map_err(|e| format!("decompress: {e}"))?;
        decompress(&raw, &mut output, &options).map_err(|e| format!("decompress: {e}"))?;
        encode_samples(&samples)
    } else {
        let samples = decode_samples::<T>(&raw)?;
        let input = Slice::new(&samples, size).map_err(|e| format!("compress: {e}"))?;
        let stream = compress(input, &options).map_err(|e| format!("compress: {e}"))?;
        eprintln!(
            "raw = {} bytes, compressed = {} bytes, ratio = {:.4}",
            raw.len(),
            stream.len(),
            raw.len() as f64 / stream.len() as f64,
        );
        stream
    };

    std::fs::write(&cfg.output, out).map_err(|e| format!("{}: {e}", cfg.output))
}

fn run(cfg: &DriverConfig) -> Result<(), String> {
    match (cfg.extent.len(), cfg.double) {
        (1, false) => run_case::<f32, 1>(cfg, Extent([cfg.extent[0]])),
        (2, false) => run_case::<f32, 2>(cfg, Extent([cfg.extent[0], cfg.extent[1]])),
        (3, false) => run_case::<f32, 3>(
            cfg,
            Extent([cfg.extent[0], cfg.extent[1], cfg.extent[2]]),
        ),
        (1, true) => run_case::<f64, 1>(cfg, Extent([cfg.extent[0]])),
        (2, true) => run_case::<f64, 2>(cfg, Extent([cfg.extent[0], cfg.extent[1]])),
        (3, true) => run_case::<f64, 3>(
            cfg,
            Extent([cfg.extent[0], cfg.extent[1], cfg.extent[2]]),
        ),
        _ => Err("unsupported extent".to_string()),
    }
}

fn main() {
    let cfg = match parse_args() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("roundtrip_file: {e}");
            eprintln!(
                "usage: roundtrip_file compress|decompress --extent N [N [N]] \
                 --input PATH --output PATH [--double] [--backend serial|threaded|gpu]"
            );
            std::process::exit(1);
        }
    };
    if let Err(e) = run(&cfg) {
        eprintln!("roundtrip_file: {e}");
        std::process::exit(1);
    }
}
