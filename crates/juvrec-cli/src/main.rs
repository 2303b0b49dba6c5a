use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use juvrec_core::codec;
use juvrec_core::matcher::{within_threshold, EuclideanMatcher};
use juvrec_core::scan::{RetryReason, ScanEvent, ScanFlow, ScanOutcome, Scanner};
use juvrec_core::store::EmbeddingStore;
use juvrec_core::types::{IdentityId, SessionContext};
use juvrec_core::{FaceDetector, FaceEncoder};
use juvrec_hw::Camera;
use juvrec_store::SqliteStore;
use std::future::Future;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::{spawn_engine, Engine, EngineError, ScanSession};

#[derive(Parser)]
#[command(name = "juvrec", about = "Juvenile intake face enrollment and identification")]
struct Cli {
    /// Operator recorded on new enrollments (overrides JUVREC_OPERATOR)
    #[arg(long, global = true)]
    operator: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture and store the face of a new juvenile record
    Enroll {
        /// Record id the face is stored under
        #[arg(short, long)]
        identity: String,
    },
    /// Check whether the subject in front of the camera is already enrolled
    Identify,
    /// Show the distance between two enrolled faces
    Compare { a: String, b: String },
    /// List enrolled records
    List,
    /// List video capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load().context("loading configuration")?;
    if let Some(operator) = cli.operator {
        config.operator = operator;
    }

    match cli.command {
        Commands::Enroll { identity } => {
            let flow = ScanFlow::Enroll {
                identity: IdentityId::from(identity),
            };
            run_scan(&config, flow).await
        }
        Commands::Identify => run_scan(&config, ScanFlow::Recognize).await,
        Commands::Compare { a, b } => compare(&config, &a, &b),
        Commands::List => list(&config),
        Commands::Devices => {
            devices();
            Ok(())
        }
    }
}

async fn run_scan(config: &Config, flow: ScanFlow) -> Result<()> {
    let build_config = config.clone();
    let engine = spawn_engine(
        move || {
            let c = build_config;
            let locator = FaceDetector::load(&c.detector_model_path(), c.locator_config())?;
            let landmarks = FaceDetector::load(&c.detector_model_path(), c.extraction_locator_config())?;
            let encoder = FaceEncoder::load(&c.encoder_model_path(), landmarks)?;
            let store = SqliteStore::open(&c.db_path)?;
            tracing::info!(db = %c.db_path.display(), models = %c.model_dir.display(), "engine resources loaded");

            Ok::<_, EngineError>(Engine {
                scanner: Scanner::new(
                    Camera::new(c.camera_config()),
                    locator,
                    encoder,
                    EuclideanMatcher::new(c.match_threshold),
                    c.scanner_config(),
                ),
                store,
            })
        },
        config.tick(),
    )
    .await?;

    let mut scan = engine
        .start_scan(flow, SessionContext::new(config.operator.clone()))
        .await?;
    tracing::info!(scan = %scan.id, "scanning");
    println!("Center your face in the camera frame.");

    loop {
        tokio::select! {
            event = scan.next_event() => {
                let Some(event) = event else {
                    bail!("scan ended without a result");
                };
                if let Some(outcome) = handle_event(&scan, event).await? {
                    return report(outcome);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                scan.stop();
                bail!("scan cancelled");
            }
        }
    }
}

async fn handle_event(scan: &ScanSession, event: ScanEvent) -> Result<Option<ScanOutcome>> {
    match event {
        ScanEvent::FaceCentered { remaining } => println!("Face centered. Hold still... {remaining}"),
        ScanEvent::Countdown { remaining } => println!("{remaining}..."),
        ScanEvent::FaceLost => println!("Face lost. Center your face in the frame."),
        ScanEvent::Retry(RetryReason::NoFaceFound) => println!("No face found in the capture. Try again."),
        ScanEvent::Retry(RetryReason::DuplicateRejected) => println!("Enrollment cancelled. Scanning again."),
        ScanEvent::DuplicateSuspected { identity, distance } => {
            println!("This face closely matches enrolled record {identity} (distance {distance:.3}).");
            let prompt = ask_yes_no("Enroll anyway? [y/N] ");
            let Some(answer) = answer_or_cancel(prompt, tokio::signal::ctrl_c()).await else {
                scan.stop();
                bail!("scan cancelled");
            };
            scan.confirm(answer?)?;
        }
        ScanEvent::Finished(outcome) => return Ok(Some(outcome)),
    }
    Ok(None)
}

fn report(outcome: ScanOutcome) -> Result<()> {
    match outcome {
        ScanOutcome::Captured { image, .. } => {
            println!("Enrolled ({} byte capture stored).", image.len());
            Ok(())
        }
        ScanOutcome::MatchFound { identity, distance } => {
            println!("Match: {identity} (distance {distance:.3})");
            Ok(())
        }
        ScanOutcome::NoMatch { best_distance } => {
            match best_distance {
                Some(d) => println!("No match (closest distance {d:.3}). Proceed with a new enrollment."),
                None => println!("No match (no faces enrolled). Proceed with a new enrollment."),
            }
            Ok(())
        }
        ScanOutcome::Failed(reason) => bail!("scan failed: {reason}"),
    }
}

/// The operator's answer, or `None` when `cancel` completes first.
async fn answer_or_cancel<A, C>(answer: A, cancel: C) -> Option<Result<bool>>
where
    A: Future<Output = Result<bool>>,
    C: Future,
{
    tokio::select! {
        answer = answer => Some(answer),
        _ = cancel => None,
    }
}

async fn ask_yes_no(prompt: &str) -> Result<bool> {
    use std::io::Write;

    print!("{prompt}");
    std::io::stdout().flush()?;
    // A plain thread, not the blocking pool: runtime shutdown must not wait
    // on an unanswered prompt after Ctrl-C.
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("juvrec-prompt".into())
        .spawn(move || {
            let mut line = String::new();
            let _ = tx.send(std::io::stdin().read_line(&mut line).map(|_| line));
        })?;
    let line = rx.await.context("prompt reader exited")??;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn compare(config: &Config, a: &str, b: &str) -> Result<()> {
    let store = SqliteStore::open(&config.db_path)?;
    let load = |id: &str| -> Result<juvrec_core::Embedding> {
        let text = store
            .fetch_embedding(&IdentityId::from(id))?
            .with_context(|| format!("{id} is not enrolled"))?;
        codec::decode(&text).with_context(|| format!("stored embedding for {id} is unreadable"))
    };
    let (ea, eb) = (load(a)?, load(b)?);

    let Some(distance) = ea.distance(&eb) else {
        bail!("embeddings for {a} and {b} are not comparable");
    };
    let same = within_threshold(&ea, &eb, config.match_threshold);
    println!(
        "{a} vs {b}: distance {distance:.4} ({} at threshold {})",
        if same { "same person" } else { "different people" },
        config.match_threshold
    );
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let store = SqliteStore::open(&config.db_path)?;
    let records = store.list_records()?;
    if records.is_empty() {
        println!("No faces enrolled");
        return Ok(());
    }
    for r in records {
        let when = r
            .created_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<20} {:<16} {when} ({} bytes)", r.identity, r.enrolled_by, r.image_bytes);
    }
    Ok(())
}

fn devices() {
    let found = Camera::list_devices();
    if found.is_empty() {
        println!("No video capture devices found");
        return;
    }
    for d in found {
        println!("{:>2}  {}  {} ({}, {})", d.index, d.path, d.name, d.driver, d.bus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::{pending, ready};

    #[tokio::test]
    async fn test_cancel_interrupts_unanswered_prompt() {
        let answer = answer_or_cancel(pending::<Result<bool>>(), ready(())).await;
        assert!(answer.is_none());
    }

    #[tokio::test]
    async fn test_answer_passes_through() {
        let answer = answer_or_cancel(ready(Ok(true)), pending::<()>()).await;
        assert!(matches!(answer, Some(Ok(true))));
    }
}
