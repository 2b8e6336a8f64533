// `webinar register`: resolve (or create) the participant for a phone number.

use anyhow::Context;
use clap::Args;
use uuid::Uuid;
use webinar_client::config::ClientConfig;
use webinar_common::types::Participant;

use super::{mounter, ready, runtime};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct RegisterArgs {
    /// Webinar id.
    webinar: Uuid,
    /// Phone number in any common local or international form.
    #[arg(long)]
    phone: Option<String>,
    /// Name shown to hosts.
    #[arg(long)]
    name: Option<String>,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

pub fn run(args: RegisterArgs, config: &ClientConfig, server_url: &str) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    match runtime()?.block_on(register(&args, config, server_url)) {
        Ok(participant) => {
            output::print_output(format, &participant, format_human)?;
            Ok(())
        }
        Err(error) => {
            output::print_command_error(format, &error);
            Err(error)
        }
    }
}

async fn register(
    args: &RegisterArgs,
    config: &ClientConfig,
    server_url: &str,
) -> anyhow::Result<Participant> {
    let phone = args
        .phone
        .as_deref()
        .or(config.phone.as_deref())
        .context("a phone number is required (--phone, or `phone` in ~/.webinar/config.toml)")?;
    let display_name = args.name.as_deref().or(config.display_name.as_deref());

    let mut mounter = mounter(server_url)?;
    let outcome = mounter.register(args.webinar, phone, display_name).await?;
    ready(outcome)
}

pub(crate) fn format_human(participant: &Participant) -> String {
    let name = participant.display_name.as_deref().unwrap_or("(no name)");
    format!("registered {} {name} as {}", participant.phone, participant.id)
}
