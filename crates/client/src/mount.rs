// Mount flow: cached identity -> registry check -> live session.
//
// A mount either resolves a verified participant, asks the caller to run
// registration, or blocks after the registry stays unavailable. Within one
// mount cycle the flow routes to registration at most once.

use std::future::Future;

use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webinar_common::types::Participant;

use crate::{
    backoff::RetryPolicy,
    cache::{CachedIdentity, IdentityCache},
    error::ClientError,
    guard::RedirectGuard,
    rest::RegistryApi,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOutcome {
    /// Verified identity; the live session can start.
    Ready(Participant),
    /// Show the registration form.
    NeedsRegistration,
    /// The registry kept failing. Mounting again is the manual retry.
    Blocked { attempts: u32, last_error: String },
    /// Registration was requested a second time in one cycle.
    RegistrationLoop,
}

enum RetryFailure {
    Exhausted { attempts: u32, last_error: ClientError },
    Fatal(ClientError),
}

pub struct Mounter<R, C> {
    registry: R,
    cache: C,
    policy: RetryPolicy,
    guard: RedirectGuard,
}

impl<R: RegistryApi, C: IdentityCache> Mounter<R, C> {
    pub fn new(registry: R, cache: C) -> Self {
        Self::with_policy(registry, cache, RetryPolicy::registry())
    }

    pub fn with_policy(registry: R, cache: C, policy: RetryPolicy) -> Self {
        Self { registry, cache, policy, guard: RedirectGuard::new() }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Start a new mount cycle for `webinar_id`.
    pub async fn mount(&mut self, webinar_id: Uuid) -> Result<MountOutcome, ClientError> {
        self.guard.reset();
        self.resolve(webinar_id).await
    }

    /// Register, cache the identity, then re-check it within the current cycle.
    pub async fn register(
        &mut self,
        webinar_id: Uuid,
        phone: &str,
        display_name: Option<&str>,
    ) -> Result<MountOutcome, ClientError> {
        let registry = &self.registry;
        let participant = match with_registry_retry(&self.policy, || {
            registry.register(webinar_id, phone, display_name)
        })
        .await
        {
            Ok(participant) => participant,
            Err(RetryFailure::Exhausted { attempts, last_error }) => {
                return Ok(blocked(attempts, &last_error))
            }
            Err(RetryFailure::Fatal(error)) => return Err(error),
        };

        self.cache.store(&CachedIdentity::from_participant(&participant))?;
        info!(%webinar_id, participant_id = %participant.id, "identity cached");
        self.resolve(webinar_id).await
    }

    /// Forget the cached identity for a webinar.
    pub fn forget(&self, webinar_id: Uuid) -> Result<(), ClientError> {
        self.cache.clear(webinar_id)
    }

    async fn resolve(&mut self, webinar_id: Uuid) -> Result<MountOutcome, ClientError> {
        let cached = match self.cache.load(webinar_id) {
            Ok(cached) => cached,
            Err(error) => {
                warn!(%webinar_id, %error, "identity cache unreadable; treating as empty");
                None
            }
        };
        let Some(identity) = cached else {
            debug!(%webinar_id, "no cached identity");
            return Ok(self.redirect());
        };

        let registry = &self.registry;
        let participant_id = identity.participant_id;
        match with_registry_retry(&self.policy, || registry.verify(webinar_id, participant_id))
            .await
        {
            Ok(participant) => Ok(MountOutcome::Ready(participant)),
            Err(RetryFailure::Fatal(ClientError::StaleIdentity(_))) => {
                debug!(%webinar_id, %participant_id, "cached identity is stale");
                if let Err(error) = self.cache.clear(webinar_id) {
                    warn!(%webinar_id, %error, "failed to clear stale identity");
                }
                Ok(self.redirect())
            }
            Err(RetryFailure::Exhausted { attempts, last_error }) => {
                Ok(blocked(attempts, &last_error))
            }
            Err(RetryFailure::Fatal(error)) => Err(error),
        }
    }

    fn redirect(&mut self) -> MountOutcome {
        match self.guard.request_redirect() {
            Ok(()) => MountOutcome::NeedsRegistration,
            Err(_) => {
                warn!("registration requested twice in one mount");
                MountOutcome::RegistrationLoop
            }
        }
    }
}

fn blocked(attempts: u32, last_error: &ClientError) -> MountOutcome {
    warn!(attempts, error = %last_error, "registry unavailable; mount blocked");
    MountOutcome::Blocked { attempts, last_error: last_error.to_string() }
}

async fn with_registry_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempts = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() => {
                attempts += 1;
                if !policy.allows(attempts) {
                    return Err(RetryFailure::Exhausted { attempts, last_error: error });
                }
                let delay = policy.delay(attempts - 1);
                debug!(attempts, delay_ms = delay.as_millis() as u64, %error, "retrying registry call");
                sleep(delay).await;
            }
            Err(error) => return Err(RetryFailure::Fatal(error)),
        }
    }
}
