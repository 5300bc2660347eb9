use burn::backend::candle::{Candle, CandleDevice};
use burn::backend::ndarray::NdArray;
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::backend::Autodiff;
use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::{Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use argmine::config::FullConfig;
use argmine::data::{PairBatcher, Split};
use argmine::error::TrainError;
use argmine::training::trainer::{init_model, positive_relations};
use argmine::training::{evaluate, find_checkpoints, load_checkpoint, train};

type NdArrayBackend = NdArray<f32>;
type NdArrayAutodiff = Autodiff<NdArrayBackend>;

type WgpuBackend = Wgpu;
type WgpuAutodiff = Autodiff<WgpuBackend>;

type CandleBackend = Candle;
type CandleAutodiff = Autodiff<CandleBackend>;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum BackendType {
    Ndarray,
    Wgpu,
    Candle,
}

impl BackendType {
    /// Backend named in a config file; unknown names run on the CPU.
    fn from_config(name: &str) -> Self {
        <Self as ValueEnum>::from_str(name, true).unwrap_or_else(|_| {
            warn!(backend = name, "unknown backend, using ndarray");
            BackendType::Ndarray
        })
    }

    fn accelerator(&self) -> String {
        match self {
            BackendType::Ndarray => "CPU".to_string(),
            BackendType::Wgpu => match WgpuDevice::default() {
                WgpuDevice::DiscreteGpu(idx) => format!("discrete GPU #{}", idx),
                WgpuDevice::IntegratedGpu(idx) => format!("integrated GPU #{}", idx),
                WgpuDevice::VirtualGpu(idx) => format!("virtual GPU #{}", idx),
                WgpuDevice::Cpu => "CPU (software rendering)".to_string(),
                _ => "default GPU".to_string(),
            },
            BackendType::Candle => match CandleDevice::default() {
                CandleDevice::Cpu => "CPU".to_string(),
                CandleDevice::Cuda(cuda) => format!("CUDA GPU #{}", cuda.index),
                CandleDevice::Metal(metal) => format!("Metal GPU #{}", metal.index),
            },
        }
    }
}

#[derive(Parser)]
#[command(name = "argmine")]
#[command(about = "Argument mining networks - train, evaluate and inspect")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG applies when absent.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train every iteration of the run described by a config file
    Train {
        #[arg(long, short = 'c')]
        config: String,

        /// Overrides the backend of the config file
        #[arg(long, short, value_enum)]
        backend: Option<BackendType>,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long)]
        iterations: Option<usize>,

        /// Retrain iterations whose checkpoint already exists
        #[arg(long)]
        overwrite: bool,
    },
    /// Score the saved checkpoints of a run on the test split
    Evaluate {
        #[arg(long, short = 'c')]
        config: String,

        #[arg(long, short, value_enum)]
        backend: Option<BackendType>,

        /// Checkpoint directory, defaults to the one of the config file
        #[arg(long)]
        checkpoint_dir: Option<String>,
    },
    /// Print the input signature and parameter counts of a network
    Describe {
        #[arg(long, short = 'c')]
        config: Option<String>,
    },
    InitConfig {
        #[arg(long, short, default_value = "config.yaml")]
        output: String,

        /// Template: default or demo
        #[arg(long, short, default_value = "default")]
        template: String,
    },
    Backends,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_backends() {
    println!("argmine - argument mining networks");
    println!();
    println!("Backends:");
    println!("  ndarray  CPU, always available");
    println!("  wgpu     GPU through WebGPU (Vulkan, Metal, DX12)");
    println!("  candle   CPU, CUDA or Metal through Candle");
    println!();
    println!("Commands:");
    println!("  argmine init-config -o config.yaml -t demo");
    println!("  argmine describe -c config.yaml");
    println!("  argmine train -c config.yaml -b wgpu");
    println!("  argmine evaluate -c config.yaml");
}

fn init_config(output: &str, template: &str) -> Result<(), Box<dyn Error>> {
    let config = match template {
        "demo" => FullConfig::demo_config(),
        "default" => FullConfig::default_config(),
        other => return Err(format!("unknown template `{}` (expected default or demo)", other).into()),
    };
    config.save_to_yaml(output)?;
    println!("Wrote {} config to {}", template, output);
    Ok(())
}

fn describe(config_path: Option<&str>) -> Result<(), Box<dyn Error>> {
    let config = match config_path {
        Some(path) => FullConfig::load_from_yaml(path)?,
        None => FullConfig::demo_config(),
    };
    let device = Default::default();
    let model = config.model.init::<NdArrayBackend>(&device)?;

    let signature = model.signature();
    println!("Architecture: {}", model.architecture().name());
    println!("Inputs:");
    for input in &signature.inputs {
        println!("  {:<9} {:?} {:?}", input.name.name(), input.kind, input.shape);
    }
    println!("Outputs:");
    for output in &signature.outputs {
        println!("  {:<9} {}", output.name.name(), output.width);
    }
    println!();
    model.print_summary();
    Ok(())
}

fn run_training<B: AutodiffBackend>(
    config: &FullConfig,
    device: &B::Device,
) -> Result<(), Box<dyn Error>> {
    let training = config.training.to_training_config();
    let dataset = config.dataset.load()?;
    info!(path = %config.dataset.path, pairs = dataset.len(), "loaded dataset");

    let reports = train::<B>(&config.model, &training, &dataset, device)?;
    for report in reports {
        if report.skipped {
            println!("{}: skipped", report.name);
            continue;
        }
        println!(
            "{}: {} epoch(s), best epoch {:?}, best score {:?}",
            report.name, report.epochs_run, report.best_epoch, report.best_score
        );
        if let Some(test) = report.test {
            println!("  test: {}", test);
        }
    }
    Ok(())
}

fn run_evaluation<B: Backend>(
    config: &FullConfig,
    checkpoint_dir: &Path,
    device: &B::Device,
) -> Result<(), Box<dyn Error>> {
    let dataset = config.dataset.load()?;
    let records = dataset.require_split(Split::Test)?;
    let batcher = PairBatcher::new(&config.model);
    let positive = positive_relations(&config.model);
    let training = &config.training;

    let checkpoints = find_checkpoints(checkpoint_dir, &training.name);
    if checkpoints.is_empty() {
        warn!(dir = %checkpoint_dir.display(), name = %training.name, "no checkpoints found");
        return Ok(());
    }

    for path in checkpoints {
        let model = init_model::<B>(&config.model, &dataset, device)?;
        let model = load_checkpoint(model, &path, device).map_err(TrainError::from)?;
        let (loss, scores) = evaluate(
            &model,
            &batcher,
            &records,
            training.batch_size,
            &training.loss_weights,
            &positive,
            device,
        )?;
        println!("{}: loss {:.5} | {}", path.display(), loss, scores);
    }
    Ok(())
}

fn load_config(
    path: &str,
    backend: Option<BackendType>,
) -> Result<(FullConfig, BackendType), Box<dyn Error>> {
    let config = FullConfig::load_from_yaml(path)?;
    config.validate()?;
    let backend = backend.unwrap_or_else(|| BackendType::from_config(&config.backend.backend_type));
    info!(?backend, accelerator = %backend.accelerator(), "selected backend");
    Ok((config, backend))
}

fn run(command: Option<Commands>) -> Result<(), Box<dyn Error>> {
    match command {
        None | Some(Commands::Backends) => print_backends(),
        Some(Commands::InitConfig { output, template }) => init_config(&output, &template)?,
        Some(Commands::Describe { config }) => describe(config.as_deref())?,
        Some(Commands::Train {
            config,
            backend,
            epochs,
            iterations,
            overwrite,
        }) => {
            let (mut config, backend) = load_config(&config, backend)?;
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            if let Some(iterations) = iterations {
                config.training.iterations = iterations;
            }
            config.training.overwrite |= overwrite;

            match backend {
                BackendType::Ndarray => run_training::<NdArrayAutodiff>(&config, &Default::default())?,
                BackendType::Wgpu => run_training::<WgpuAutodiff>(&config, &Default::default())?,
                BackendType::Candle => run_training::<CandleAutodiff>(&config, &Default::default())?,
            }
        }
        Some(Commands::Evaluate {
            config,
            backend,
            checkpoint_dir,
        }) => {
            let (config, backend) = load_config(&config, backend)?;
            let dir = checkpoint_dir
                .or_else(|| config.training.checkpoint_dir.clone())
                .map(PathBuf::from)
                .ok_or("no checkpoint directory given or configured")?;

            match backend {
                BackendType::Ndarray => run_evaluation::<NdArrayBackend>(&config, &dir, &Default::default())?,
                BackendType::Wgpu => run_evaluation::<WgpuBackend>(&config, &dir, &Default::default())?,
                BackendType::Candle => run_evaluation::<CandleBackend>(&config, &dir, &Default::default())?,
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_backend_names() {
        assert_eq!(BackendType::from_config("wgpu"), BackendType::Wgpu);
        assert_eq!(BackendType::from_config("Candle"), BackendType::Candle);
        assert_eq!(BackendType::from_config("cuda"), BackendType::Ndarray);
        assert_eq!(BackendType::Ndarray.accelerator(), "CPU");
    }
}
