// webinar-client: participant-side session orchestration.

pub mod backoff;
pub mod cache;
pub mod config;
pub mod error;
pub mod guard;
pub mod mount;
pub mod reactions;
pub mod rest;
pub mod security;
pub mod session;
pub mod transport;
pub mod view;

pub use error::ClientError;
pub use mount::{MountOutcome, Mounter};
pub use session::{SessionCommand, SessionConfig, SessionDriver, SessionHandle};
pub use view::SessionView;
