use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::artifact::ModelArtifact;
use rollcall_core::attendance::AttendanceSession;
use rollcall_core::edit::{CommitAction, EditSession};
use rollcall_core::lbph::LbphParams;
use rollcall_core::source::CancelToken;
use rollcall_core::store::IdentityStore;
use rollcall_core::trainer::{self, TrainOutcome};
use rollcall_hw::Camera;
use std::io::{BufRead, Write};
use tracing_subscriber::EnvFilter;

mod config;
mod runner;

use config::Config;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture face samples for an identity
    Enroll {
        /// Identity id (numeric ids sort first in reports)
        #[arg(long)]
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Samples to capture (default from config)
        #[arg(long)]
        count: Option<usize>,
    },
    /// Train the recognition model from every enrolled sample
    Train,
    /// Recognize faces and mark attendance until Ctrl-C
    Attend,
    /// Show who is present and absent this session
    Report,
    /// Clear the attendance session
    Reset,
    /// List enrolled identities
    Users {
        /// Also show each identity's sample storage key
        #[arg(long)]
        keys: bool,
    },
    /// Interactively delete and rename identities
    Edit,
    /// Show store, model and session status
    Status,
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Enroll { id, name, count } => {
            println!("Enrolling {name} ({id}); look at the camera.");
            let report = run_blocking(move |cancel| {
                runner::enroll(&config, &id, &name, count, &cancel)
            })
            .await?;
            println!(
                "Stored {} samples for {} over {} frames ({:?}).",
                report.stored, report.id, report.frames, report.stop
            );
            println!("Run `rollcall train` to update the model.");
        }
        Commands::Train => {
            let report = tokio::task::spawn_blocking(move || -> Result<_> {
                let store = open_store(&config)?;
                Ok(trainer::train(&store, &config.artifact_path(), LbphParams::default())?)
            })
            .await??;
            for skipped in &report.skipped {
                println!("skipped {}: {}", skipped.path.display(), skipped.reason);
            }
            match report.outcome {
                TrainOutcome::Trained {
                    identities,
                    samples,
                    revision,
                } => println!(
                    "Trained on {samples} samples from {identities} identities (revision {revision})."
                ),
                TrainOutcome::NoSamples => println!("No samples to train on; model unchanged."),
            }
        }
        Commands::Attend => {
            let report = run_blocking(move |cancel| runner::attend(&config, &cancel)).await?;
            println!(
                "Processed {} frames, {} faces, {} newly marked.",
                report.frames, report.faces, report.marked
            );
        }
        Commands::Report => {
            let store = open_store(&config)?;
            let session = AttendanceSession::open(&config.attendance_path())?;
            let snapshot = session.snapshot(&store)?;
            print!("{}", snapshot.summary());
            println!(
                "\n{} present, {} absent",
                snapshot.present.len(),
                snapshot.absent.len()
            );
        }
        Commands::Reset => {
            AttendanceSession::open(&config.attendance_path())?.reset()?;
            println!("Attendance session cleared.");
        }
        Commands::Users { keys } => {
            let store = open_store(&config)?;
            if keys {
                for (record, key) in store.list_with_storage_key()? {
                    println!("{}\t{}\t{key}", record.id, record.name);
                }
            } else {
                for record in store.list()? {
                    let samples = store.samples(&record.id)?.len();
                    println!("{}\t{}\t{samples} samples", record.id, record.name);
                }
            }
        }
        Commands::Edit => {
            tokio::task::spawn_blocking(move || edit_repl(&config)).await??;
        }
        Commands::Status => status(&config)?,
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found.");
            }
            for dev in devices {
                println!("{}\t{} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<IdentityStore> {
    IdentityStore::open(&config.db_path(), &config.samples_dir()).context("opening identity store")
}

/// Run a blocking capture loop, cancelling it on Ctrl-C.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(CancelToken) -> Result<T> + Send + 'static,
{
    let cancel = CancelToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping after this frame");
                cancel.cancel();
            }
        })
    };

    let result = tokio::task::spawn_blocking(move || f(cancel)).await;
    watcher.abort();
    result?
}

fn status(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let snapshot = store.snapshot()?;
    println!("data dir:     {}", config.data_dir.display());
    println!(
        "identities:   {} ({} samples)",
        snapshot.identities.len(),
        snapshot.sample_count()
    );
    println!("revision:     {}", snapshot.revision);

    match ModelArtifact::load(&config.artifact_path()) {
        Ok(Some(artifact)) => {
            let state = if artifact.revision == snapshot.revision {
                "current"
            } else {
                "stale, run `rollcall train`"
            };
            println!(
                "model:        revision {} trained {} ({state})",
                artifact.revision, artifact.trained_at
            );
        }
        Ok(None) => println!("model:        not trained"),
        Err(e) => println!("model:        unreadable ({e})"),
    }

    let session = AttendanceSession::open(&config.attendance_path())?;
    println!("present:      {}", session.entries()?.len());
    println!(
        "thresholds:   display {} / attendance {}",
        config.display_threshold, config.attendance_threshold
    );
    Ok(())
}

const EDIT_HELP: &str = "\
commands:
  show               list identities with pending edits
  del <id>           toggle deletion of <id>
  ren <id> <name>    rename <id>
  undo               revert the last edit
  done               apply pending edits
  cancel             discard pending edits";

fn edit_repl(config: &Config) -> Result<()> {
    let mut store = open_store(config)?;
    let mut session = EditSession::begin(&store)?;
    print_rows(&session);
    println!("{EDIT_HELP}");

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("edit> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next().transpose()? else {
            session.cancel();
            println!("\nNo changes applied.");
            return Ok(());
        };

        let line = line.trim();
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match cmd {
            "" => {}
            "show" => print_rows(&session),
            "del" => match session.toggle_delete(rest) {
                Ok(true) => println!("{rest} marked for deletion"),
                Ok(false) => println!("{rest} unmarked"),
                Err(e) => println!("{e}"),
            },
            "ren" => {
                let (id, name) = rest.split_once(' ').unwrap_or((rest, ""));
                match session.rename(id, name.trim()) {
                    Ok(true) => println!("{id} -> {}", name.trim()),
                    Ok(false) => println!("{id} already has that name"),
                    Err(e) => println!("{e}"),
                }
            }
            "undo" => match session.undo() {
                Some(op) => println!("undid {op:?}"),
                None => println!("nothing to undo"),
            },
            "done" => {
                let report = session.commit(&mut store);
                for id in &report.deleted {
                    println!("deleted {id}");
                }
                for (id, name) in &report.renamed {
                    println!("renamed {id} to {name}");
                }
                for failure in &report.failures {
                    let action = match failure.action {
                        CommitAction::Delete => "delete",
                        CommitAction::Rename => "rename",
                    };
                    println!("failed to {action} {}: {}", failure.id, failure.reason);
                }
                if report.retrain_required {
                    println!("Identities changed; run `rollcall train`.");
                }
                return Ok(());
            }
            "cancel" | "quit" => {
                session.cancel();
                println!("No changes applied.");
                return Ok(());
            }
            _ => println!("{EDIT_HELP}"),
        }
    }
}

fn print_rows(session: &EditSession) {
    for row in session.rows() {
        let mut flags = String::new();
        if row.pending_delete {
            flags.push_str(" [delete]");
        }
        if row.renamed {
            flags.push_str(" [renamed]");
        }
        println!("  {}\t{}{flags}", row.id, row.display);
    }
}
