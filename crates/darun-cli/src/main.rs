use clap::Parser;
use darun_cli::cli_args::Cli;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    if let Err(err) = darun_cli::run(cli).await {
        eprintln!("Error: {err:#}");
        std::process::exit(darun_cli::exit_code(&err));
    }
}
