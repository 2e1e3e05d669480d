use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use strokeseg::{
    backend::{create_device, get_backend_name, SelectedAutodiffBackend, SelectedBackend},
    build_engine, export_graph,
    inference::save_panels,
    training::{self, Checkpoint},
    ArtifactStore, BackendKind, EngineBuildConfig, ExportConfig, InferenceEngine, ModelArtifact,
    Precision, TrainingConfig,
};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Parser)]
#[command(name = "strokeseg")]
#[command(about = "Brain stroke CT segmentation: training, export and inference")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a segmentation model
    Train {
        /// Directory holding training configurations
        #[arg(long, default_value = "configs")]
        config_dir: PathBuf,

        /// Configuration name, with or without the .json suffix
        #[arg(long, default_value = "train")]
        config_name: String,

        /// Dotted overrides, e.g. `--set num_epochs=5 --set model.encoder=Resnet18`
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },

    /// Segment an image or every image in a directory
    Infer {
        /// Checkpoint directory, graph file or engine file
        #[arg(short, long)]
        artifact: PathBuf,

        /// Artifact kind: checkpoint, graph or engine
        #[arg(short, long, default_value = "checkpoint")]
        kind: BackendKind,

        /// Input image path or directory
        #[arg(short, long)]
        input: PathBuf,

        /// Probability above which a pixel is lesion
        #[arg(short, long, default_value_t = 0.5)]
        threshold: f32,

        /// Output directory for result panels
        #[arg(short, long, default_value = "predictions")]
        output: PathBuf,
    },

    /// Convert a checkpoint into a portable graph
    ExportGraph {
        /// Checkpoint directory
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// Artifact store root (defaults to the user cache directory)
        #[arg(short, long)]
        store: Option<PathBuf>,
    },

    /// Compile a checkpoint's graph into an engine for this platform
    BuildEngine {
        /// Checkpoint directory
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// Artifact store root (defaults to the user cache directory)
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Engine precision: fp32 or fp16
        #[arg(short, long, default_value = "fp32")]
        precision: Precision,

        /// Workspace limit in MiB
        #[arg(long, default_value_t = 1024)]
        workspace_mb: u64,

        /// Largest batch the engine accepts
        #[arg(long, default_value_t = 1)]
        max_batch: usize,
    },

    /// List stored artifacts, optionally removing them
    Artifacts {
        /// Artifact store root (defaults to the user cache directory)
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Remove artifacts instead of listing them
        #[arg(long)]
        clean: bool,

        /// Restrict removal to one checkpoint hash
        #[arg(long, requires = "clean")]
        hash: Option<String>,
    },

    /// Show backend information
    Info,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let device = create_device();

    match cli.command {
        Commands::Train {
            config_dir,
            config_name,
            overrides,
        } => {
            let config = TrainingConfig::load_with_overrides(&config_dir, &config_name, &overrides)?;
            let summary = training::train::<SelectedAutodiffBackend>(config, device)?;

            println!("Training finished after {} epochs ({:?})", summary.epochs_run, summary.termination);
            match &summary.best {
                Some(best) => println!(
                    "  Best {}: {:.4} at epoch {} -> {}",
                    summary.monitored_metric,
                    best.value,
                    best.epoch,
                    best.dir.display()
                ),
                None => println!("  No checkpoint was saved"),
            }
            if let Some(graph) = &summary.graph {
                println!("  Graph: {}", graph.display());
            }
            Ok(())
        }

        Commands::Infer {
            artifact,
            kind,
            input,
            threshold,
            output,
        } => {
            let artifact = ModelArtifact::new(kind, artifact);
            let engine = InferenceEngine::<SelectedBackend>::load(&artifact, device)?;
            std::fs::create_dir_all(&output)
                .with_context(|| format!("creating {}", output.display()))?;

            let inputs = collect_images(&input)?;
            if inputs.is_empty() {
                bail!("no images found under {}", input.display());
            }

            for path in inputs {
                let image = image::open(&path).with_context(|| format!("reading {}", path.display()))?;
                let result = engine.predict(&image, threshold)?;

                let target = prediction_target(&input, &path, &output);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                save_panels(&target, &engine.resized_input(&image), &result)?;

                println!(
                    "{}: {} lesion pixels, confidence {:.3} -> {}",
                    path.display(),
                    result.positive_pixels(),
                    result.confidence,
                    target.display()
                );
            }
            Ok(())
        }

        Commands::ExportGraph { checkpoint, store } => {
            let checkpoint = Checkpoint::open(&checkpoint)?;
            let store = open_store(store)?;
            let path = export_graph::<SelectedBackend>(&checkpoint, &store, &ExportConfig::new(), &device)?;
            println!("Graph: {}", path.display());
            Ok(())
        }

        Commands::BuildEngine {
            checkpoint,
            store,
            precision,
            workspace_mb,
            max_batch,
        } => {
            let checkpoint = Checkpoint::open(&checkpoint)?;
            let store = open_store(store)?;
            let build = EngineBuildConfig::new()
                .with_precision(precision)
                .with_workspace_bytes(workspace_mb.saturating_mul(1 << 20))
                .with_max_batch_size(max_batch);
            let path = build_engine::<SelectedBackend>(
                &checkpoint,
                &store,
                &build,
                &ExportConfig::new(),
                &device,
            )?;
            println!("Engine: {}", path.display());
            Ok(())
        }

        Commands::Artifacts { store, clean, hash } => {
            let store = open_store(store)?;
            if clean {
                let removed = store.cleanup(hash.as_deref())?;
                println!("Removed {removed} artifacts from {}", store.root().display());
            } else {
                for path in store.list() {
                    println!("{}", path.display());
                }
            }
            Ok(())
        }

        Commands::Info => {
            println!("strokeseg Information:");
            println!("  Backend: {}", get_backend_name());
            println!("  Device: {device:?}");
            Ok(())
        }
    }
}

fn open_store(root: Option<PathBuf>) -> Result<ArtifactStore> {
    Ok(match root {
        Some(root) => ArtifactStore::open(root)?,
        None => ArtifactStore::open_default()?,
    })
}

fn collect_images(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        bail!("{} is neither a file nor a directory", input.display());
    }

    let mut images: Vec<PathBuf> = WalkDir::new(input)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    images.sort();
    Ok(images)
}

/// Output path for `path`, mirroring its location below `input` so that
/// slices with the same file name in different folders stay apart.
fn prediction_target(input: &Path, path: &Path, output: &Path) -> PathBuf {
    let stem = path.file_stem().map_or_else(
        || "image".to_owned(),
        |s| s.to_string_lossy().into_owned(),
    );
    let file_name = format!("{stem}_prediction.png");

    match path.strip_prefix(input).ok().and_then(Path::parent) {
        Some(relative) => output.join(relative).join(file_name),
        None => output.join(file_name),
    }
}
