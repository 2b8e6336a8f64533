use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Long enough to cover a full live session.
pub const HOST_TOKEN_TTL_SECONDS: i64 = 12 * 60 * 60;

const HOST_ROLE: &str = "host";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HostTokenClaims {
    sub: String,
    webinar_id: Uuid,
    role: String,
    iat: i64,
    exp: i64,
}

/// A validated host grant for exactly one webinar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAccess {
    pub host_id: String,
    pub webinar_id: Uuid,
}

#[derive(Clone)]
pub struct JwtHostTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtHostTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Issue a host token. Called by the scheduling flow and by tests.
    pub fn issue_host_token(&self, host_id: &str, webinar_id: Uuid) -> anyhow::Result<String> {
        self.issue_host_token_at(host_id, webinar_id, current_unix_timestamp()?)
    }

    fn issue_host_token_at(
        &self,
        host_id: &str,
        webinar_id: Uuid,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        if host_id.trim().is_empty() {
            bail!("host id must not be empty");
        }

        let claims = HostTokenClaims {
            sub: host_id.to_string(),
            webinar_id,
            role: HOST_ROLE.to_string(),
            iat: issued_at,
            exp: issued_at + HOST_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode host token")
    }

    pub fn validate_host_token(&self, token: &str) -> anyhow::Result<HostAccess> {
        let claims = decode::<HostTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode host token")?
            .claims;

        if claims.role != HOST_ROLE {
            bail!("token role '{}' is not a host role", claims.role);
        }

        Ok(HostAccess { host_id: claims.sub, webinar_id: claims.webinar_id })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
