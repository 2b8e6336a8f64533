// webinar-common: shared types and utilities for the webinar-live workspace

pub mod phone;
pub mod protocol;
pub mod types;
pub mod webhook;
