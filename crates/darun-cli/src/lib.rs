pub mod cli_args;

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use darun_core::{
    ArtifactSet, CancellationToken, ConfigError, DaError, ENV_CLIENT_SECRET, JobOrchestrator,
    JobSpec, LoggingDestination, Settings, init_logging, load_settings, load_settings_with,
};
use rpassword::prompt_password;
use tracing::{info, warn};

use cli_args::{Cli, Command, RunArgs, StatusArgs, UploadArgs};

/// Exit status used when the run was interrupted by the user.
pub const EXIT_CANCELLED: i32 = 130;

pub async fn run(cli: Cli) -> Result<()> {
    let destination = if cli.quiet {
        LoggingDestination::FileOnly
    } else {
        LoggingDestination::FileAndStderr
    };
    if let Err(err) = init_logging(destination) {
        eprintln!("Warning: logging disabled: {err}");
    }

    let settings = resolve_settings()?;
    let orchestrator = JobOrchestrator::from_settings(&settings)?;

    match cli.command {
        Command::Run(args) => run_workitem(&orchestrator, &settings, args).await,
        Command::Token => check_token(&orchestrator).await,
        Command::Status(args) => print_status(&orchestrator, args).await,
        Command::Upload(args) => upload_file(&orchestrator, args).await,
    }
}

/// Exit code for a failed run.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<DaError>() {
        Some(DaError::Cancelled { .. }) => EXIT_CANCELLED,
        _ => 1,
    }
}

/// Load settings, prompting for the client secret when it is not configured.
fn resolve_settings() -> Result<Settings> {
    match load_settings() {
        Ok(settings) => Ok(settings),
        Err(ConfigError::Missing(key)) if key == ENV_CLIENT_SECRET => {
            let secret = prompt_password("APS client secret: ")
                .context("failed to read client secret")?;
            let settings = load_settings_with(|name| {
                if name == ENV_CLIENT_SECRET {
                    Some(secret.clone())
                } else {
                    env::var(name).ok()
                }
            })?;
            Ok(settings)
        }
        Err(err) => Err(err.into()),
    }
}

/// Cancellation token tripped by Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

async fn run_workitem(
    orchestrator: &JobOrchestrator,
    settings: &Settings,
    args: RunArgs,
) -> Result<()> {
    let activity = match args.activity.clone() {
        Some(activity) => activity.into(),
        None => settings.activity_id.clone().ok_or_else(|| {
            anyhow!("no activity given; pass --activity or set APS_DA_NICKNAME and APS_DA_ACTIVITY")
        })?,
    };
    let raw = tokio::fs::read_to_string(&args.arguments)
        .await
        .with_context(|| format!("failed to read {}", args.arguments.display()))?;
    let spec = JobSpec::from_arguments_json(activity, &raw)?;
    let options = args.poll_options(settings.poll);

    let cancel = interrupt_token();
    let (status, artifacts) = orchestrator
        .run_to_completion(&spec, options, &cancel)
        .await?;

    let written = write_artifacts(&args.out_dir, &artifacts).await?;
    println!("Workitem {} finished: {}", status.id, status.state);
    for path in written {
        println!("  {}", path.display());
    }
    Ok(())
}

/// Write each artifact to `out_dir/<argument name>`.
pub async fn write_artifacts(out_dir: &Path, artifacts: &ArtifactSet) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let mut written = Vec::with_capacity(artifacts.len());
    for (name, bytes) in artifacts.iter() {
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| anyhow!("output name {name:?} is not a valid file name"))?;
        let path = out_dir.join(file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(output = name, path = %path.display(), bytes = bytes.len(), "output written");
        written.push(path);
    }
    Ok(written)
}

async fn check_token(orchestrator: &JobOrchestrator) -> Result<()> {
    let credential = orchestrator.tokens().token().await?;
    let remaining = credential
        .expires_at
        .saturating_duration_since(tokio::time::Instant::now());
    println!(
        "Credentials accepted; token valid for {}s",
        remaining.as_secs()
    );
    Ok(())
}

async fn print_status(orchestrator: &JobOrchestrator, args: StatusArgs) -> Result<()> {
    let status = orchestrator.poller().query_status(&args.job_id).await?;
    println!("{}: {}", status.id, status.state);
    if let Some(progress) = status.progress.as_deref() {
        println!("  progress: {progress}");
    }
    if let Some(report) = status.report_url.as_deref() {
        println!("  report:   {report}");
    }
    for name in status.arguments.keys() {
        if status.location_of(name).is_some() {
            println!("  output:   {name}");
        }
    }
    Ok(())
}

async fn upload_file(orchestrator: &JobOrchestrator, args: UploadArgs) -> Result<()> {
    let content = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    if content.is_empty() {
        bail!("{} is empty", args.file.display());
    }
    let size = content.len();
    orchestrator.transferer().upload(&args.url, content).await?;
    println!("Uploaded {} ({size} bytes)", args.file.display());
    Ok(())
}
