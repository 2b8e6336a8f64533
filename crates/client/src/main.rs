// webinar CLI entry point.

use clap::Parser;

mod commands;
mod exit_code;
mod output;

#[derive(Parser)]
#[command(name = "webinar", about = "Join live webinars from the terminal")]
struct Cli {
    /// Relay base URL (overrides ~/.webinar/config.toml).
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: commands::Command,
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match commands::run(cli.command, cli.server.as_deref()) {
        Ok(()) => exit_code::ExitCode::Success.into(),
        Err(error) => exit_code::ExitCode::from_error(&error).into(),
    }
}
