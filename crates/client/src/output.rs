// Output format auto-detection for the CLI.
//
// TTY → human-readable text. Piped/redirected → structured JSON.
// `--json` flag forces JSON output regardless of terminal.

use serde::Serialize;
use std::io::{self, IsTerminal, Write};
use webinar_client::ClientError;

const ANSI_RED: &str = "\x1b[31m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    /// One JSON object per line.
    Json,
}

impl OutputFormat {
    /// JSON if `--json` was passed or stdout is not a TTY.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    let mut out = io::stdout().lock();
    write_output(&mut out, format, value, human_fn)
}

pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    human_fn: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => {
            writeln!(writer, "{}", human_fn(value))
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    print_stderr(format, "error", ANSI_RED, code, message);
}

pub fn print_warning(format: OutputFormat, code: &str, message: &str) {
    print_stderr(format, "warning", ANSI_YELLOW, code, message);
}

/// Print a command failure, using the client error code when there is one.
pub fn print_command_error(format: OutputFormat, error: &anyhow::Error) {
    let code = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ClientError>())
        .map(ClientError::code)
        .unwrap_or("CLIENT_ERROR");
    print_error(format, code, &format!("{error:#}"));
}

fn print_stderr(format: OutputFormat, label: &str, color: &str, code: &str, message: &str) {
    let mut err = io::stderr().lock();
    match format {
        OutputFormat::Human => {
            let line = render_human_stderr_line(label, message, io::stderr().is_terminal(), color);
            let _ = writeln!(err, "{line}");
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({
                label: {
                    "code": code,
                    "message": message,
                }
            });
            let _ = serde_json::to_writer(&mut err, &obj);
            let _ = writeln!(err);
        }
    }
}

fn render_human_stderr_line(label: &str, message: &str, is_tty: bool, color: &str) -> String {
    if is_tty {
        format!("{color}{label}:{ANSI_RESET} {message}")
    } else {
        format!("{label}: {message}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_tty_returns_human() {
        assert_eq!(OutputFormat::detect_from_terminal(true), OutputFormat::Human);
    }

    #[test]
    fn detect_pipe_returns_json() {
        assert_eq!(OutputFormat::detect_from_terminal(false), OutputFormat::Json);
    }

    #[test]
    fn json_flag_overrides_detection() {
        assert_eq!(OutputFormat::detect(true), OutputFormat::Json);
    }

    #[derive(Serialize)]
    struct Sample {
        answered: usize,
    }

    #[test]
    fn write_output_human_uses_formatter() {
        let mut buffer = Vec::new();
        write_output(&mut buffer, OutputFormat::Human, &Sample { answered: 2 }, |s| {
            format!("answered {}", s.answered)
        })
        .unwrap();
        assert_eq!(String::from_utf8(buffer).unwrap(), "answered 2\n");
    }

    #[test]
    fn write_output_json_is_one_line() {
        let mut buffer = Vec::new();
        write_output(&mut buffer, OutputFormat::Json, &Sample { answered: 2 }, |_| unreachable!())
            .unwrap();
        assert_eq!(String::from_utf8(buffer).unwrap(), "{\"answered\":2}\n");
    }

    #[test]
    fn human_stderr_is_colored_only_on_tty() {
        assert_eq!(render_human_stderr_line("error", "boom", false, ANSI_RED), "error: boom");
        assert!(render_human_stderr_line("error", "boom", true, ANSI_RED).starts_with(ANSI_RED));
    }
}
