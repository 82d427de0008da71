use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use darun_core::PollOptions;

/// Run Design Automation workitems from the command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "darun", version, about, long_about = None)]
pub struct Cli {
    /// Log to the log file only, keeping stderr for errors.
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Submit a workitem, wait for it and download its outputs.
    Run(RunArgs),
    /// Exchange the configured credentials for a token to check they work.
    Token,
    /// Print the current status of a workitem.
    Status(StatusArgs),
    /// Upload a local file to a signed location.
    Upload(UploadArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Fully qualified activity id (`nickname.Activity+alias`). Defaults to the configured one.
    #[arg(short, long, value_name = "ID")]
    pub activity: Option<String>,

    /// JSON file with the argument map (`{"name": {"url": ..., "verb": "get"|"put"}}`).
    #[arg(long = "args", value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub arguments: PathBuf,

    /// Give up waiting after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub max_wait: Option<u64>,

    /// Seconds between status queries.
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_interval: Option<u64>,

    /// Directory outputs are written to.
    #[arg(short, long, value_name = "DIR", default_value = ".", value_hint = ValueHint::DirPath)]
    pub out_dir: PathBuf,
}

impl RunArgs {
    /// Apply command-line overrides on top of the configured poll options.
    pub fn poll_options(&self, configured: PollOptions) -> PollOptions {
        let mut options = configured;
        if let Some(secs) = self.max_wait {
            options = options.with_max_wait(Duration::from_secs(secs));
        }
        if let Some(secs) = self.poll_interval {
            options = options.with_poll_interval(Duration::from_secs(secs));
        }
        options
    }
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    /// Workitem id returned at submission.
    pub job_id: String,
}

#[derive(Debug, Clone, Args)]
pub struct UploadArgs {
    /// Local file to upload.
    #[arg(value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Signed destination URL.
    #[arg(long, value_name = "SIGNED_URL")]
    pub url: String,
}
