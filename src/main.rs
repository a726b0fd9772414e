//! `ocnn`: run OC-CNN carpet experiments and inspect saved heads.

use clap::{Parser, Subcommand, ValueEnum};
use ocnn_mvtec::config::{ExperimentConfig, Preset};
use ocnn_mvtec::experiment::{backbone_from_config, normalization, Experiment};
use ocnn_mvtec::features::{ConvBackbone, VGG16_LAYERS};
use ocnn_mvtec::logging;
use ocnn_mvtec::persist::HeadInfo;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Parser)]
#[command(name = "ocnn")]
#[command(about = "One-class CNN anomaly detection on MVTec carpet patches")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the head, score the test set and write the evaluation outputs
    Run {
        /// JSON configuration file
        #[arg(short, long, conflicts_with = "preset")]
        config: Option<PathBuf>,

        /// Built-in parameter set
        #[arg(short, long, value_enum, default_value = "carpet-color")]
        preset: PresetArg,

        /// VGG16 SafeTensors weights (overrides the configuration)
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Number of training epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Random seed for reproducibility
        #[arg(long)]
        seed: Option<u64>,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Use a randomly initialised backbone instead of pretrained weights
        #[arg(long)]
        random_backbone: bool,
    },

    /// Print a preset configuration as JSON
    Preset {
        /// Preset to print
        #[arg(value_enum)]
        name: PresetArg,
    },

    /// Display information about a saved head
    Inspect {
        /// Model file (.apr)
        model: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PresetArg {
    CarpetColor,
    CarpetRawScore,
}

impl From<PresetArg> for Preset {
    fn from(arg: PresetArg) -> Self {
        match arg {
            PresetArg::CarpetColor => Preset::CarpetColor,
            PresetArg::CarpetRawScore => Preset::CarpetRawScore,
        }
    }
}

/// Overrides applied on top of a loaded configuration.
#[derive(Debug, Default)]
struct Overrides {
    weights: Option<PathBuf>,
    epochs: Option<usize>,
    seed: Option<u64>,
    output: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, mut config: ExperimentConfig) -> ExperimentConfig {
        if let Some(weights) = self.weights {
            config.backbone_weights = Some(weights);
        }
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        config
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init_tracing() {
        eprintln!("Warning: {e}");
    }

    let result = match cli.command {
        Commands::Run {
            config,
            preset,
            weights,
            epochs,
            seed,
            output,
            random_backbone,
        } => {
            let overrides = Overrides {
                weights,
                epochs,
                seed,
                output,
            };
            cmd_run(config.as_deref(), preset, overrides, random_backbone)
        }
        Commands::Preset { name } => cmd_preset(name),
        Commands::Inspect { model } => cmd_inspect(&model),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(
    path: Option<&Path>,
    preset: PresetArg,
    overrides: Overrides,
) -> ocnn_mvtec::Result<ExperimentConfig> {
    let base = match path {
        Some(path) => ExperimentConfig::from_json_file(path)?,
        None => Preset::from(preset).config(),
    };
    let config = overrides.apply(base);
    config.validate()?;
    Ok(config)
}

fn cmd_run(
    path: Option<&Path>,
    preset: PresetArg,
    overrides: Overrides,
    random_backbone: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path, preset, overrides)?;

    let backbone = if random_backbone {
        warn!("using a randomly initialised backbone; scores will not match pretrained features");
        let seed = config
            .seed
            .unwrap_or_else(|| ocnn_mvtec::experiment::hash_name_to_seed(&config.name));
        ConvBackbone::random(&VGG16_LAYERS, seed)?.with_normalization(normalization(&config))
    } else {
        backbone_from_config(&config)?
    };

    let outcome = Experiment::new(config, backbone)?.run()?;

    println!("Experiment: {}", outcome.report.experiment);
    println!("===========");
    println!("Test patches:      {}", outcome.report.patches);
    println!("Anomalous patches: {}", outcome.report.anomalous);
    println!("ROC points:        {}", outcome.report.roc_points);
    println!("AUC:               {:.4}", outcome.report.auc);
    println!();
    println!("Report: {}", outcome.report_path.display());
    println!("ROC:    {}", outcome.roc_path.display());
    println!("Head:   {}", outcome.head_path.display());
    if let Some((full, zoom)) = &outcome.plot_paths {
        println!("Plots:  {}, {}", full.display(), zoom.display());
    }
    if let Some((labels, predictions)) = &outcome.grid_paths {
        println!("Grids:  {}, {}", labels.display(), predictions.display());
    }
    Ok(())
}

fn cmd_preset(name: PresetArg) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", Preset::from(name).config().to_json_pretty()?);
    Ok(())
}

fn cmd_inspect(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let info = HeadInfo::from_path(path)?;

    println!("Model: {}", path.display());
    println!("======");
    println!("Type:       {:?}", info.model_type());
    println!("Version:    {}.{}", info.version().0, info.version().1);
    println!("Name:       {}", info.name().unwrap_or("(unnamed)"));
    if let Some(description) = info.description() {
        println!("Description: {description}");
    }
    println!("Payload:    {} bytes", info.payload_size());
    println!("Compressed: {}", info.is_compressed());
    Ok(())
}
