// Protocol version negotiation and N-1 support.
//
// Live sockets send a protocol version string (e.g. "webinar-live.v1") in
// their hello frame. Unsupported versions are rejected with UPGRADE_REQUIRED.

use crate::error::{ErrorCode, RelayError};
use serde_json::json;
use webinar_common::protocol::ws::{
    is_supported_protocol_version, CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Validates a client-supplied protocol version. Returns `Ok(())` if
/// supported, or a `RelayError` with code `UPGRADE_REQUIRED` and
/// `details.supported_versions` if not.
pub fn require_supported(version: &str) -> Result<(), RelayError> {
    if is_supported_protocol_version(version) {
        Ok(())
    } else {
        Err(RelayError::new(
            ErrorCode::UpgradeRequired,
            format!("unsupported protocol version: {version}"),
        )
        .with_details(json!({
            "requested_version": version,
            "supported_versions": SUPPORTED_PROTOCOL_VERSIONS,
            "current_version": CURRENT_PROTOCOL_VERSION,
        })))
    }
}
