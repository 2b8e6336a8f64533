// Consistent exit codes for the webinar CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error
//   10 = registry or relay unreachable
//   11 = identity error (stale identity, registration loop)
//   12 = interaction closed
//   13 = live connection lost

use std::process;

use webinar_client::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Unavailable = 10,
    Identity = 11,
    Closed = 12,
    Network = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(client_err) = cause.downcast_ref::<ClientError>() {
                return Self::from_client_code(client_err.code());
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused => Self::Unavailable,
                    std::io::ErrorKind::TimedOut => Self::Network,
                    _ => Self::Error,
                };
            }
        }
        Self::Error
    }

    pub fn from_client_code(code: &str) -> Self {
        match code {
            "REGISTRY_UNAVAILABLE" => Self::Unavailable,
            "STALE_IDENTITY" | "REGISTRATION_LOOP" => Self::Identity,
            "INTERACTION_CLOSED" => Self::Closed,
            "TRANSPORT_DISCONNECTED" => Self::Network,
            "VALIDATION_FAILED" => Self::Usage,
            _ => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}
