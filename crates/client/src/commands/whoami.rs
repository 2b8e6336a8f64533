// `webinar whoami`: show the verified identity for a webinar.

use clap::Args;
use uuid::Uuid;

use super::{mounter, ready, register::format_human, runtime};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct WhoamiArgs {
    /// Webinar id.
    webinar: Uuid,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

pub fn run(args: WhoamiArgs, server_url: &str) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let result = runtime()?.block_on(async {
        let mut mounter = mounter(server_url)?;
        ready(mounter.mount(args.webinar).await?)
    });
    match result {
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
