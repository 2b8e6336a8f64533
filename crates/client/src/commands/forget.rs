// `webinar forget`: drop the cached identity for a webinar.

use clap::Args;
use serde::Serialize;
use uuid::Uuid;
use webinar_client::cache::{FileIdentityCache, IdentityCache};

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ForgetArgs {
    /// Webinar id.
    webinar: Uuid,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Forgotten {
    webinar_id: Uuid,
}

pub fn run(args: ForgetArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let result = FileIdentityCache::at_default_path().and_then(|cache| cache.clear(args.webinar));
    match result {
        Ok(()) => {
            output::print_output(format, &Forgotten { webinar_id: args.webinar }, |f| {
                format!("forgot identity for webinar {}", f.webinar_id)
            })?;
            Ok(())
        }
        Err(error) => {
            let error = anyhow::Error::new(error);
            output::print_command_error(format, &error);
            Err(error)
        }
    }
}
