use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use rollcall_core::CandidateSet;
use rollcall_engine::{
    fetch_frame, spawn_engine, test_connection, Config, EngineHandle, EnrollOutcome,
    RetrainOutcome,
};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retrain the recognition model over all stored reference images
    Train {
        /// Retrain even if a trained model already exists
        #[arg(long)]
        force: bool,
    },
    /// Evaluate the trained model on a held-out sample of references
    Evaluate {
        /// Fraction of each identity's images to hold out
        #[arg(long, default_value_t = 0.2)]
        test_split: f32,
        /// Write the full report as JSON to this path
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Register a reference image for an identity
    Register {
        /// Identity to enroll (e.g., an employee id)
        #[arg(short, long)]
        identity: String,
        #[command(flatten)]
        source: ImageSource,
    },
    /// Recognize faces in an image against a candidate set
    Recognize {
        #[command(flatten)]
        source: ImageSource,
        /// Comma-separated identities to match against; all enrolled if omitted
        #[arg(short, long)]
        candidates: Option<String>,
    },
    /// List stored reference images
    List {
        /// Restrict to one identity
        #[arg(short, long)]
        identity: Option<String>,
    },
    /// Remove a reference image by id
    Remove {
        /// Image id to remove
        id: i64,
    },
    /// Camera registry and diagnostics
    Camera {
        #[command(subcommand)]
        command: CameraCommands,
    },
    /// Show engine status
    Status,
}

#[derive(Subcommand)]
enum CameraCommands {
    /// Probe a camera and record it in the registry on success
    Test {
        /// Camera IP address or host:port
        ip: String,
        /// Camera name (e.g., "entrance"); defaults to the address
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List registered cameras
    List,
}

/// Exactly one image source: a file on disk or a live camera frame.
#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct ImageSource {
    /// Path to an image file
    #[arg(long)]
    image: Option<PathBuf>,
    /// Camera IP address to capture from
    #[arg(long)]
    camera: Option<String>,
}

impl ImageSource {
    async fn load(&self, timeout: Duration) -> Result<Vec<u8>> {
        match (&self.image, &self.camera) {
            (Some(path), None) => {
                std::fs::read(path).with_context(|| format!("reading {}", path.display()))
            }
            (None, Some(ip)) => fetch_frame(ip, timeout)
                .await
                .with_context(|| format!("capturing from camera {ip}")),
            _ => bail!("exactly one of --image or --camera is required"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let capture_timeout = Duration::from_secs(config.capture_timeout_secs);
    let engine = spawn_engine(config)?;

    match cli.command {
        Commands::Train { force } => {
            if !force && engine.status().await?.trained {
                bail!("a trained model already exists; pass --force to retrain");
            }
            let started = std::time::Instant::now();
            let outcome = engine.retrain_all().await?;
            match &outcome {
                RetrainOutcome::Retrained(report) => {
                    println!(
                        "retrained in {:.1?}: {} classes, {} samples, {} epochs, train acc {:.3}, val acc {:.3}",
                        started.elapsed(),
                        report.num_classes,
                        report.num_samples,
                        report.epochs_run,
                        report.train_accuracy,
                        report.val_accuracy,
                    );
                }
                other => println!("not retrained: {}", other.as_str()),
            }
        }
        Commands::Evaluate { test_split, output } => {
            let report = engine.evaluate(test_split).await?;
            println!(
                "accuracy {:.3} over {} held-out images (mean confidence {:.3})",
                report.accuracy, report.evaluated, report.mean_confidence
            );
            for ia in &report.per_identity {
                println!(
                    "  {}: {}/{} correct ({:.3})",
                    ia.identity, ia.correct, ia.evaluated, ia.accuracy
                );
            }
            if !report.low_performers.is_empty() {
                println!("needs better references: {}", report.low_performers.join(", "));
            }
            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&report)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("report written to {}", path.display());
            }
        }
        Commands::Register { identity, source } => {
            let image = source.load(capture_timeout).await?;
            match engine.register_face(identity.clone(), image).await? {
                EnrollOutcome::Registered {
                    image_id,
                    path,
                    is_primary,
                } => {
                    println!(
                        "registered image {image_id} for {identity} at {path}{}",
                        if is_primary { " (primary)" } else { "" }
                    );
                }
                EnrollOutcome::DuplicateSuspected {
                    conflicting_identity,
                    confidence,
                } => {
                    bail!(
                        "rejected: face recognized as already-enrolled identity \
                         {conflicting_identity} (confidence {confidence:.3})"
                    );
                }
            }
        }
        Commands::Recognize { source, candidates } => {
            let image = source.load(capture_timeout).await?;
            let candidates = match candidates {
                Some(list) => list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect(),
                None => all_identities(&engine).await?,
            };
            if candidates.is_empty() {
                bail!("no candidate identities (nothing enrolled?)");
            }
            let outcome = engine.recognize(image, candidates).await?;
            println!("{} face(s) detected", outcome.faces_detected);
            if outcome.matches.is_empty() {
                println!("no matches");
            }
            for m in &outcome.matches {
                println!("  {} (confidence {:.3})", m.identity, m.confidence);
            }
        }
        Commands::List { identity } => {
            let records = engine.list_references(identity).await?;
            if records.is_empty() {
                println!("no reference images");
            }
            for r in records {
                println!(
                    "{:>6}  {}  {}{}",
                    r.id,
                    r.identity,
                    r.path,
                    if r.is_primary { "  (primary)" } else { "" }
                );
            }
        }
        Commands::Remove { id } => {
            let outcome = engine.remove_face(id).await?;
            println!(
                "removed image {id} for {}; {} image(s) remain, model {}",
                outcome.identity,
                outcome.remaining_for_identity,
                outcome.model_status.as_str()
            );
            if !outcome.recognizable {
                println!("warning: {} has no reference images left", outcome.identity);
            }
        }
        Commands::Camera { command } => match command {
            CameraCommands::Test { ip, name } => {
                let frame_len = test_connection(&ip, capture_timeout)
                    .await
                    .with_context(|| format!("camera {ip} unreachable"))?;
                let name = name.unwrap_or_else(|| ip.clone());
                let camera = engine.camera_seen(name, ip).await?;
                println!(
                    "camera {} ({}) ok: {frame_len} byte frame",
                    camera.name, camera.ip_address
                );
            }
            CameraCommands::List => {
                let cameras = engine.cameras().await?;
                if cameras.is_empty() {
                    println!("no cameras registered");
                }
                for c in cameras {
                    println!(
                        "{:>4}  {}  {}  last seen {}",
                        c.id,
                        c.name,
                        c.ip_address,
                        c.last_connected.as_deref().unwrap_or("never")
                    );
                }
            }
        },
        Commands::Status => {
            let status = engine.status().await?;
            println!(
                "trained: {}{}",
                status.trained,
                status
                    .num_classes
                    .map(|n| format!(" ({n} classes)"))
                    .unwrap_or_default()
            );
            println!("identities enrolled: {}", status.identities_enrolled);
            println!("reference images: {}", status.reference_images);
            println!("head artifact: {}", status.head_path);
            println!("encoder artifact: {}", status.encoder_path);
        }
    }

    Ok(())
}

async fn all_identities(engine: &EngineHandle) -> Result<CandidateSet> {
    let records = engine.list_references(None).await?;
    Ok(records.iter().map(|r| r.identity.as_str()).collect())
}
