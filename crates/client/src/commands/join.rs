// `webinar join`: mount, then run the live session against stdin.
//
// Each stdin line is one action (`answer A`, `react clap`, `ask ...`,
// `upvote <id>`, `resync`, `retry`, `quit`). The view is re-rendered
// whenever its summary changes.

use anyhow::Context;
use clap::Args;
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
};
use uuid::Uuid;
use webinar_client::{
    config::ClientConfig,
    transport::WsConnector,
    view::{ConnectionState, Notice, Progress},
    ClientError, MountOutcome, SessionCommand, SessionConfig, SessionDriver, SessionView,
};
use webinar_common::types::ReactionCounts;

use super::{mounter, ready, runtime};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct JoinArgs {
    /// Webinar id.
    webinar: Uuid,
    /// Phone number, used when no identity is cached yet.
    #[arg(long)]
    phone: Option<String>,
    /// Name shown to hosts.
    #[arg(long)]
    name: Option<String>,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

pub fn run(args: JoinArgs, config: &ClientConfig, server_url: &str) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    match runtime()?.block_on(join(&args, config, server_url, format)) {
        Ok(()) => Ok(()),
        Err(error) => {
            output::print_command_error(format, &error);
            Err(error)
        }
    }
}

async fn join(
    args: &JoinArgs,
    config: &ClientConfig,
    server_url: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let webinar_id = args.webinar;
    let mut mounter = mounter(server_url)?;
    let outcome = match mounter.mount(webinar_id).await? {
        MountOutcome::NeedsRegistration => {
            let phone = args
                .phone
                .as_deref()
                .or(config.phone.as_deref())
                .context("not registered for this webinar; pass --phone to register")?;
            let display_name = args.name.as_deref().or(config.display_name.as_deref());
            mounter.register(webinar_id, phone, display_name).await?
        }
        other => other,
    };
    let participant = ready(outcome)?;

    let connector = WsConnector::new(server_url, webinar_id)?;
    let (driver, handle) =
        SessionDriver::new(connector, SessionConfig::new(webinar_id, participant.id));
    let mut session = tokio::spawn(driver.run());
    let renderer = tokio::spawn(render_loop(handle.view(), format));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let result = loop {
        tokio::select! {
            finished = &mut session => break finished.context("live session task failed")?,
            line = lines.next_line() => match line.context("failed to read stdin")? {
                None => {
                    let _ = handle.shutdown().await;
                    break (&mut session).await.context("live session task failed")?;
                }
                Some(line) => match parse_input(&line) {
                    Ok(Some(command)) => {
                        if handle.send(command).await.is_err() {
                            break (&mut session).await.context("live session task failed")?;
                        }
                    }
                    Ok(None) => {}
                    Err(message) => output::print_warning(format, "USAGE", &message),
                },
            },
        }
    };
    renderer.abort();

    if let Err(ClientError::StaleIdentity(_)) = &result {
        mounter.forget(webinar_id)?;
    }
    result.map_err(anyhow::Error::from)
}

fn parse_input(line: &str) -> Result<Option<SessionCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let require = |what: &str| -> Result<String, String> {
        if rest.is_empty() {
            Err(format!("`{verb}` needs {what}"))
        } else {
            Ok(rest.to_string())
        }
    };

    let command = match verb {
        "answer" | "a" => {
            SessionCommand::SubmitResponse { interaction_id: None, value: require("a value")? }
        }
        "react" | "r" => SessionCommand::React { kind: require("a reaction kind")? },
        "ask" | "q" => SessionCommand::AskQuestion { text: require("question text")? },
        "upvote" | "u" => {
            let question_id = require("a question id")?
                .parse()
                .map_err(|error| format!("invalid question id: {error}"))?;
            SessionCommand::Upvote { question_id }
        }
        "resync" => SessionCommand::Resync,
        "retry" => SessionCommand::RetryStream,
        "quit" | "exit" => SessionCommand::Shutdown,
        other => {
            return Err(format!(
                "unknown command `{other}`; try answer, react, ask, upvote, resync, retry or quit"
            ))
        }
    };
    Ok(Some(command))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ViewSummary {
    connection: ConnectionState,
    active: Option<ActiveSummary>,
    progress: Progress,
    presence: u64,
    reactions: ReactionCounts,
    questions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ActiveSummary {
    id: Uuid,
    prompt: String,
    options: Vec<String>,
    my_response: Option<String>,
}

impl ViewSummary {
    fn of(view: &SessionView) -> Self {
        Self {
            connection: view.connection(),
            active: view.active().map(|interaction| ActiveSummary {
                id: interaction.id,
                prompt: interaction.prompt.clone(),
                options: interaction.options.clone(),
                my_response: view.my_response(interaction.id).map(|r| r.value.clone()),
            }),
            progress: view.progress(),
            presence: view.presence(),
            reactions: view.reaction_counts().clone(),
            questions: view.questions().len(),
        }
    }
}

async fn render_loop(mut view: watch::Receiver<SessionView>, format: OutputFormat) {
    let mut last: Option<ViewSummary> = None;
    let mut notices_shown = 0;
    while view.changed().await.is_ok() {
        let current = view.borrow_and_update().clone();

        for notice in current.notices().iter().skip(notices_shown) {
            let (code, message) = describe_notice(notice);
            output::print_warning(format, code, &message);
        }
        notices_shown = current.notices().len();

        let summary = ViewSummary::of(&current);
        if last.as_ref() != Some(&summary) {
            let _ = output::print_output(format, &summary, format_human);
            last = Some(summary);
        }
    }
}

fn describe_notice(notice: &Notice) -> (&'static str, String) {
    match notice {
        Notice::InteractionClosed { interaction_id } => {
            ("INTERACTION_CLOSED", format!("interaction {interaction_id} closed before your answer"))
        }
        Notice::ResponseRejected { message, .. } => ("RESPONSE_REJECTED", message.clone()),
        Notice::QuestionRejected { text, message } => {
            ("QUESTION_REJECTED", format!("question \"{text}\" was rejected: {message}"))
        }
        Notice::Error { message, .. } => ("SESSION_ERROR", message.clone()),
    }
}

fn format_human(summary: &ViewSummary) -> String {
    let state = match summary.connection {
        ConnectionState::Connecting => "connecting".to_string(),
        ConnectionState::Live => "live".to_string(),
        ConnectionState::Reconnecting { attempt } => format!("reconnecting (attempt {attempt})"),
        ConnectionState::Closed => "closed".to_string(),
    };
    let mut lines = vec![format!(
        "[{state}] {} watching, {}",
        summary.presence, summary.progress
    )];
    match &summary.active {
        Some(active) => {
            let mut line = format!("> {}", active.prompt);
            if !active.options.is_empty() {
                line.push_str(&format!(" [{}]", active.options.join(" | ")));
            }
            if let Some(answer) = &active.my_response {
                line.push_str(&format!(" (your answer: {answer})"));
            }
            lines.push(line);
        }
        None => lines.push("> waiting for the host".to_string()),
    }
    if !summary.reactions.is_empty() {
        let counts: Vec<String> =
            summary.reactions.iter().map(|(kind, count)| format!("{kind} {count}")).collect();
        lines.push(format!("reactions: {}", counts.join(", ")));
    }
    if summary.questions > 0 {
        lines.push(format!("{} question(s)", summary.questions));
    }
    lines.join("\n")
}
