use std::path::PathBuf;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use clap::{Parser, Subcommand};

use mbv2_common::{ExecutionMode, MobileNetV2Config};
use mbv2_core::{make_divisible, BlockKind, LayerShapes, MobileNetV2};
use mbv2_infer::{init_model_dir, InferenceRuntime, CONFIG_FILE};

#[derive(Parser, Debug)]
#[command(name = "mbv2", about = "Build, inspect, calibrate and run MobileNetV2")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a model directory with a config and freshly initialised weights.
    Init(InitArgs),
    /// Print the block layout and parameter counts for a config.
    Summary(SummaryArgs),
    /// Run a batch through a model directory and print top-k classes.
    Classify(ClassifyArgs),
    /// Calibrate the quantization boundaries and write quant_params.json.
    Calibrate(CalibrateArgs),
}

// ── Init ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct InitArgs {
    #[arg(long, default_value = "model")]
    output_dir: PathBuf,
    /// Start from an existing config file instead of the flags below.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 1000)]
    num_classes: usize,
    #[arg(long, default_value_t = 1.0)]
    width_mult: f64,
    #[arg(long, default_value_t = 8)]
    round_nearest: usize,
    #[arg(long, default_value_t = 0.2)]
    dropout: f32,
    #[arg(long)]
    quantized: bool,
}

// ── Summary ────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct SummaryArgs {
    /// Config file; the reference network is used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Also list every parameter tensor shape.
    #[arg(long)]
    shapes: bool,
}

// ── Classify / Calibrate ───────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct ClassifyArgs {
    #[arg(long)]
    model_dir: PathBuf,
    /// `.npy` array of shape (N, 3, H, W) or (3, H, W); random normal input when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    batch_size: usize,
    #[arg(long, default_value_t = 224)]
    resolution: usize,
    #[arg(long, default_value_t = 5)]
    top_k: usize,
}

#[derive(Parser, Debug)]
struct CalibrateArgs {
    #[arg(long)]
    model_dir: PathBuf,
    /// `.npy` arrays of shape (N, 3, H, W); random normal batches when omitted.
    #[arg(long, num_args = 0..)]
    inputs: Vec<PathBuf>,
    #[arg(long, default_value_t = 8)]
    batches: usize,
    #[arg(long, default_value_t = 4)]
    batch_size: usize,
    #[arg(long, default_value_t = 224)]
    resolution: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Init(args) => cmd_init(args),
        Command::Summary(args) => cmd_summary(args),
        Command::Classify(args) => cmd_classify(args),
        Command::Calibrate(args) => cmd_calibrate(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_init(args: InitArgs) -> Result<()> {
    let config = match args.config {
        Some(ref path) => MobileNetV2Config::load(path)?,
        None => MobileNetV2Config {
            num_classes: args.num_classes,
            width_mult: args.width_mult,
            round_nearest: args.round_nearest,
            dropout: args.dropout,
            execution: if args.quantized {
                ExecutionMode::Quantized
            } else {
                ExecutionMode::Float
            },
            ..Default::default()
        },
    };

    let device = Device::cuda_if_available(0)?;
    let stats = init_model_dir(&args.output_dir, &config, &device)?;
    eprintln!(
        "Wrote {} ({} trainable parameters)",
        args.output_dir.display(),
        stats.total()
    );
    Ok(())
}

fn cmd_summary(args: SummaryArgs) -> Result<()> {
    let config = match args.config {
        Some(ref path) => MobileNetV2Config::load(path)?,
        None => MobileNetV2Config::default(),
    };

    // Shapes only: a throwaway var map on CPU.
    let varmap = candle_nn::VarMap::new();
    let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = MobileNetV2::new(vb, &config)?;

    println!(
        "MobileNetV2  width_mult={}  round_nearest={}  classes={}  execution={:?}",
        config.width_mult, config.round_nearest, config.num_classes, config.execution
    );
    println!(
        "stem={}  head={}",
        make_divisible(
            config.input_channel as f64 * config.width_mult,
            config.round_nearest,
            None
        ),
        model.last_channel()
    );
    println!(
        "{:>4}  {:<17} {:>6} {:>6} {:>6} {:>4}  {}",
        "idx", "block", "in", "out", "stride", "t", "residual"
    );
    for s in model.block_summaries() {
        let kind = match s.kind {
            BlockKind::Stem => "stem conv3x3",
            BlockKind::InvertedResidual => "inverted residual",
            BlockKind::Head => "head conv1x1",
        };
        let t = s
            .expand_ratio
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>4}  {:<17} {:>6} {:>6} {:>6} {:>4}  {}",
            s.index,
            kind,
            s.in_channels,
            s.out_channels,
            s.stride,
            t,
            if s.residual { "yes" } else { "" }
        );
    }

    let stats = model.param_stats();
    println!(
        "params: total={} conv={} ({} layers) norm={} ({} layers) linear={}",
        stats.total(),
        stats.conv_params,
        stats.num_convs,
        stats.norm_params,
        stats.num_norms,
        stats.linear_params
    );

    if args.shapes {
        let mut shapes = LayerShapes::default();
        model.visit(&mut shapes);
        for (name, dims) in shapes.entries {
            println!("  {name:<32} {dims:?}");
        }
    }
    Ok(())
}

fn cmd_classify(args: ClassifyArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    eprintln!("Loading model from {} ...", args.model_dir.display());
    let runtime = InferenceRuntime::load(&args.model_dir, device.clone())?;

    let images = match args.input {
        Some(ref path) => Tensor::read_npy(path)?,
        None => random_batch(args.batch_size, args.resolution, &device)?,
    };

    let predictions = runtime.classify(&images, args.top_k)?;
    for (i, preds) in predictions.iter().enumerate() {
        let ranked: Vec<String> = preds
            .iter()
            .map(|p| format!("{}:{:.4}", p.class, p.probability))
            .collect();
        println!("image {i}: {}", ranked.join("  "));
    }
    Ok(())
}

fn cmd_calibrate(args: CalibrateArgs) -> Result<()> {
    let config_path = args.model_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        anyhow::bail!("no {} in {}", CONFIG_FILE, args.model_dir.display());
    }

    let device = Device::cuda_if_available(0)?;
    let runtime = InferenceRuntime::load(&args.model_dir, device.clone())?;

    let batches: Vec<Tensor> = if args.inputs.is_empty() {
        eprintln!(
            "No inputs given; calibrating on {} random batches of {}",
            args.batches, args.batch_size
        );
        (0..args.batches)
            .map(|_| random_batch(args.batch_size, args.resolution, &device))
            .collect::<Result<_>>()?
    } else {
        args.inputs
            .iter()
            .map(|p| {
                Ok(Tensor::read_npy(p)?
                    .to_dtype(DType::F32)?
                    .to_device(&device)?)
            })
            .collect::<Result<_>>()?
    };

    runtime.calibrate(&batches)?;
    let params = runtime.save_quant_params(&args.model_dir)?;
    println!(
        "quant: scale={:.6} zero_point={}  dequant: scale={:.6} zero_point={}",
        params.quant.scale, params.quant.zero_point, params.dequant.scale, params.dequant.zero_point
    );
    Ok(())
}

fn random_batch(batch_size: usize, resolution: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::randn(
        0f32,
        1.0,
        (batch_size, 3, resolution, resolution),
        device,
    )?)
}
