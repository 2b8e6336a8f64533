// CLI subcommand dispatch.

use anyhow::Context;
use clap::Subcommand;
use webinar_client::{
    cache::FileIdentityCache, config::ClientConfig, rest::HttpRegistry, ClientError,
    MountOutcome, Mounter,
};
use webinar_common::types::Participant;

pub mod forget;
pub mod join;
pub mod register;
pub mod whoami;

#[derive(Subcommand)]
pub enum Command {
    /// Register for a webinar with a phone number
    Register(register::RegisterArgs),
    /// Join a webinar's live session
    Join(join::JoinArgs),
    /// Show the cached identity for a webinar
    Whoami(whoami::WhoamiArgs),
    /// Forget the cached identity for a webinar
    Forget(forget::ForgetArgs),
}

pub fn run(cmd: Command, server: Option<&str>) -> anyhow::Result<()> {
    let config = ClientConfig::load();
    let server_url = config.resolve_server_url(server);
    match cmd {
        Command::Register(args) => register::run(args, &config, &server_url),
        Command::Join(args) => join::run(args, &config, &server_url),
        Command::Whoami(args) => whoami::run(args, &server_url),
        Command::Forget(args) => forget::run(args),
    }
}

pub(crate) type CliMounter = Mounter<HttpRegistry, FileIdentityCache>;

pub(crate) fn mounter(server_url: &str) -> anyhow::Result<CliMounter> {
    let registry = HttpRegistry::new(server_url)?;
    let cache = FileIdentityCache::at_default_path()?;
    Ok(Mounter::new(registry, cache))
}

pub(crate) fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

/// A mount outcome the CLI can continue with.
pub(crate) fn ready(outcome: MountOutcome) -> anyhow::Result<Participant> {
    match outcome {
        MountOutcome::Ready(participant) => Ok(participant),
        MountOutcome::NeedsRegistration => {
            anyhow::bail!("not registered for this webinar; run `webinar register <webinar> --phone <number>`")
        }
        MountOutcome::Blocked { attempts, last_error } => Err(ClientError::RegistryUnavailable(
            format!("gave up after {attempts} attempts: {last_error}"),
        )
        .into()),
        MountOutcome::RegistrationLoop => Err(ClientError::RegistrationLoop.into()),
    }
}
