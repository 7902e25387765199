//! lora-router CLI: routed LoRA fine-tuning and evaluation runs
//!
//! Commands:
//!   lora-router init-config : write a default run config
//!   lora-router finetune    : fine-tune a routed adapter
//!   lora-router dreambooth  : DreamBooth LoRA training of a diffusion model
//!   lora-router evaluate    : evaluate an adapter on every benchmark
//!   lora-router pipeline    : fine-tune, then evaluate
//!   lora-router route-demo  : run a routed layer on random input

use clap::{Args, Parser, Subcommand};
use lora_router::lora::{LoraConfig, Linear, RoutedLinear, RoutingMode};
use lora_router::run::{
    parse_target_modules, Benchmark, CommandRunner, DryRunRunner, Pipeline, PipelineConfig, ProcessRunner, Stage,
    SweepReport,
};
use lora_router::{Error, Result};
use log::{info, warn};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "lora-router", version, about = "Routed LoRA fine-tuning and evaluation runs")]
struct Cli {
    #[arg(long, global = true, help = "Run config JSON (defaults apply to missing fields)")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Print the commands instead of running them")]
    dry_run: bool,

    #[arg(long, global = true, help = "Value for CUDA_VISIBLE_DEVICES")]
    device: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the default run config
    InitConfig {
        #[arg(default_value = "lora-router.json")]
        path: PathBuf,
    },
    /// Fine-tune a routed adapter
    Finetune(FinetuneFlags),
    /// DreamBooth LoRA training of a diffusion model
    Dreambooth {
        #[arg(long)]
        instance_data_dir: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        use_lora_router: bool,
    },
    /// Evaluate trained adapter weights on the benchmarks
    Evaluate(EvalFlags),
    /// Fine-tune, then evaluate
    Pipeline {
        #[command(flatten)]
        finetune: FinetuneFlags,
        #[command(flatten)]
        eval: EvalFlags,
    },
    /// Run a routed layer on random input and report gate entropy
    RouteDemo {
        #[arg(long, value_parser = clap::value_parser!(RoutingMode), default_value = "router")]
        routing: RoutingMode,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[derive(Debug, Args)]
struct FinetuneFlags {
    #[arg(long)]
    base_model: Option<String>,
    #[arg(long)]
    data_path: Option<String>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    batch_size: Option<u32>,
    #[arg(long)]
    micro_batch_size: Option<u32>,
    #[arg(long)]
    num_epochs: Option<u32>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    lora_r: Option<usize>,
    #[arg(long)]
    lora_alpha: Option<f64>,
    #[arg(long)]
    lora_dropout: Option<f64>,
    #[arg(long, help = "List such as '[\"q_proj\", \"v_proj\"]' or q_proj,v_proj")]
    target_modules: Option<String>,
    #[arg(long, value_parser = clap::value_parser!(RoutingMode), help = "off, router or mixer")]
    routing: Option<RoutingMode>,
}

#[derive(Debug, Args)]
struct EvalFlags {
    #[arg(long, value_delimiter = ',', value_parser = clap::value_parser!(Benchmark))]
    datasets: Option<Vec<Benchmark>>,
    #[arg(long)]
    lora_weights: Option<PathBuf>,
    #[arg(long)]
    save_dir: Option<PathBuf>,
    #[arg(long)]
    eval_batch_size: Option<u32>,
}

impl FinetuneFlags {
    fn apply(&self, config: &mut PipelineConfig) -> Result<()> {
        let ft = &mut config.finetune;
        if let Some(v) = &self.base_model {
            ft.base_model = v.clone();
        }
        if let Some(v) = &self.data_path {
            ft.data_path = v.clone();
        }
        if let Some(v) = &self.output_dir {
            ft.output_dir = Some(v.clone());
        }
        if let Some(v) = self.batch_size {
            ft.batch_size = v;
        }
        if let Some(v) = self.micro_batch_size {
            ft.micro_batch_size = v;
        }
        if let Some(v) = self.num_epochs {
            ft.num_epochs = v;
        }
        if let Some(v) = self.learning_rate {
            ft.learning_rate = v;
        }
        if let Some(v) = self.lora_r {
            ft.lora_r = v;
        }
        if let Some(v) = self.lora_alpha {
            ft.lora_alpha = v;
        }
        if let Some(v) = self.lora_dropout {
            ft.lora_dropout = v;
        }
        if let Some(v) = &self.target_modules {
            ft.target_modules = parse_target_modules(v)?;
        }
        if let Some(v) = self.routing {
            ft.routing = v;
        }
        Ok(())
    }
}

impl EvalFlags {
    fn apply(&self, config: &mut PipelineConfig) {
        let eval = &mut config.eval;
        if let Some(v) = &self.datasets {
            eval.datasets = v.clone();
        }
        if let Some(v) = &self.lora_weights {
            eval.lora_weights = Some(v.clone());
        }
        if let Some(v) = &self.save_dir {
            eval.save_dir = Some(v.clone());
        }
        if let Some(v) = self.eval_batch_size {
            eval.batch_size = v;
        }
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    config.apply_env();
    if let Some(device) = &cli.device {
        config.device = Some(device.clone());
    }
    Ok(config)
}

fn print_report(report: &SweepReport) {
    println!("Sweep {} ({} / {})", report.run_id, report.model, report.adapter);
    for entry in &report.entries {
        println!("  {:<14} {:?} ({} ms)", entry.dataset.as_str(), entry.outcome, entry.duration_ms);
    }
    println!("  {} succeeded, {} failed", report.succeeded().len(), report.failed().len());
}

async fn cmd_finetune<R: CommandRunner>(pipeline: &Pipeline, runner: &mut R) -> Result<()> {
    let output = pipeline.train(runner).await?;
    println!("Adapter weights: {}", output.display());
    Ok(())
}

async fn cmd_evaluate<R: CommandRunner>(pipeline: &Pipeline, runner: &mut R) -> Result<()> {
    let report = pipeline.evaluate(runner).await?;
    print_report(&report);
    Ok(())
}

async fn cmd_pipeline<R: CommandRunner>(pipeline: &Pipeline, runner: &mut R) -> Result<()> {
    let report = pipeline.run(runner).await?;
    print_report(&report);
    Ok(())
}

/// Run `stage`, or only print its commands on a dry run
async fn run_stage<R: CommandRunner>(pipeline: &Pipeline, stage: Stage, runner: &mut R, dry_run: bool) -> Result<()> {
    if dry_run {
        let issued = pipeline.dry_run(stage, runner).await?;
        info!("Dry run: {} command(s)", issued);
        return Ok(());
    }
    match stage {
        Stage::Finetune => cmd_finetune(pipeline, runner).await,
        Stage::Evaluate => cmd_evaluate(pipeline, runner).await,
        Stage::Full => cmd_pipeline(pipeline, runner).await,
        Stage::DreamBooth => pipeline.dreambooth(runner).await,
    }
}

fn cmd_route_demo(routing: RoutingMode, seed: u64) -> Result<()> {
    let config = LoraConfig {
        r: 8,
        lora_alpha: 16.0,
        lora_dropout: 0.01,
        routing,
        seed,
        ..LoraConfig::default()
    };
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(seed);
    let (batch, seq, hidden) = (4, 16, 768);
    let mut layer = RoutedLinear::new(Linear::random(hidden, hidden, false, &mut rng), &config)?;
    let x = DMatrix::from_fn(batch * seq, hidden, |_, _| rng.gen_range(-1.0..1.0));

    let y = layer.forward(&x)?;
    let weights = layer.routing_weights(&x)?;
    let mean_entropy = if weights.is_empty() {
        0.0
    } else {
        weights.iter().map(|w| w.entropy()).sum::<f64>() / weights.len() as f64
    };
    info!("Routed layer: {} adapter parameters", layer.mixture.num_parameters());
    println!("input  shape: ({}, {}, {})", batch, seq, hidden);
    println!("output shape: ({}, {}, {})", batch, y.nrows() / batch, y.ncols());
    println!("routing: {}, mean gate entropy: {:.4}", routing, mean_entropy);
    Ok(())
}

async fn dispatch<R: CommandRunner>(cli: &Cli, runner: &mut R) -> Result<()> {
    match &cli.command {
        Command::InitConfig { path } => {
            PipelineConfig::default().save(path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Command::Finetune(flags) => {
            let mut config = load_config(cli)?;
            flags.apply(&mut config)?;
            run_stage(&Pipeline::new(config)?, Stage::Finetune, runner, cli.dry_run).await
        }
        Command::Dreambooth { instance_data_dir, output_dir, use_lora_router } => {
            let mut config = load_config(cli)?;
            if let Some(dir) = instance_data_dir {
                config.dreambooth.instance_data_dir = dir.clone();
            }
            if let Some(dir) = output_dir {
                config.dreambooth.output_dir = dir.clone();
            }
            config.dreambooth.use_lora_router |= *use_lora_router;
            run_stage(&Pipeline::new(config)?, Stage::DreamBooth, runner, cli.dry_run).await
        }
        Command::Evaluate(flags) => {
            let mut config = load_config(cli)?;
            flags.apply(&mut config);
            run_stage(&Pipeline::new(config)?, Stage::Evaluate, runner, cli.dry_run).await
        }
        Command::Pipeline { finetune, eval } => {
            let mut config = load_config(cli)?;
            finetune.apply(&mut config)?;
            eval.apply(&mut config);
            run_stage(&Pipeline::new(config)?, Stage::Full, runner, cli.dry_run).await
        }
        Command::RouteDemo { routing, seed } => cmd_route_demo(*routing, *seed),
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let result = if cli.dry_run {
        dispatch(&cli, &mut DryRunRunner::new()).await
    } else {
        let device = match load_config(&cli) {
            Ok(config) => config.device,
            Err(e) => {
                warn!("Could not read config for device selection: {}", e);
                cli.device.clone()
            }
        };
        dispatch(&cli, &mut ProcessRunner::new(device)).await
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if matches!(e, Error::MissingAdapterWeights(_)) {
            eprintln!("Run `lora-router finetune` first or pass --lora-weights.");
        }
        std::process::exit(1);
    }
}
