// Redirect guard: at most one route-to-registration per mount.

use crate::error::ClientError;

#[derive(Debug, Default)]
pub struct RedirectGuard {
    redirected: bool,
}

impl RedirectGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new mount cycle.
    pub fn reset(&mut self) {
        self.redirected = false;
    }

    /// Record a redirect. The second request in one cycle is a loop.
    pub fn request_redirect(&mut self) -> Result<(), ClientError> {
        if self.redirected {
            return Err(ClientError::RegistrationLoop);
        }
        self.redirected = true;
        Ok(())
    }

    pub fn has_redirected(&self) -> bool {
        self.redirected
    }
}
