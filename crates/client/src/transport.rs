// Live socket transport.
//
// The session driver talks to a `LiveConnector`, which opens `LiveLink`s.
// Production uses tokio-tungstenite; tests substitute scripted links.

use std::{future::Future, net::IpAddr};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::{protocol::WebSocketConfig, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;
use uuid::Uuid;
use webinar_common::protocol::ws::{WsMessage, MAX_FRAME_BYTES};

use crate::error::ClientError;

/// One open live connection.
pub trait LiveLink: Send {
    fn send(&mut self, message: &WsMessage) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Next protocol frame. `Ok(None)` means the server closed the connection.
    fn recv(&mut self) -> impl Future<Output = Result<Option<WsMessage>, ClientError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

pub trait LiveConnector: Send + Sync {
    type Link: LiveLink;

    fn connect(&self) -> impl Future<Output = Result<Self::Link, ClientError>> + Send;
}

/// Parse a relay base URL. Plain http is allowed only for loopback hosts.
pub fn validate_server_url(value: &str) -> Result<Url, ClientError> {
    let mut parsed = Url::parse(value)
        .map_err(|error| ClientError::Protocol(format!("invalid server_url `{value}`: {error}")))?;
    match parsed.scheme() {
        "https" => {}
        "http" if is_loopback_host(parsed.host_str()) => {}
        _ => {
            return Err(ClientError::Protocol(
                "server_url must use https (http is allowed only for localhost testing)".into(),
            ))
        }
    }
    if !parsed.path().ends_with('/') {
        let path = format!("{}/", parsed.path());
        parsed.set_path(&path);
    }
    Ok(parsed)
}

/// `ws(s)://.../v1/webinars/{id}/live` for a validated base URL.
pub fn live_url(base: &Url, webinar_id: Uuid) -> Result<Url, ClientError> {
    let mut url = base
        .join(&format!("v1/webinars/{webinar_id}/live"))
        .map_err(|error| ClientError::Protocol(format!("invalid live url: {error}")))?;
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Protocol(format!("cannot use scheme `{scheme}`")))?;
    Ok(url)
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(server_url: &str, webinar_id: Uuid) -> Result<Self, ClientError> {
        let base = validate_server_url(server_url)?;
        Ok(Self { url: live_url(&base, webinar_id)? })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl LiveConnector for WsConnector {
    type Link = WsLink;

    async fn connect(&self) -> Result<WsLink, ClientError> {
        let config = WebSocketConfig::default()
            .max_frame_size(Some(MAX_FRAME_BYTES))
            .max_message_size(Some(MAX_FRAME_BYTES));
        let (stream, _) =
            tokio_tungstenite::connect_async_with_config(self.url.as_str(), Some(config), false)
                .await
                .map_err(|error| ClientError::TransportDisconnected(error.to_string()))?;
        debug!(url = %self.url, "live socket connected");
        Ok(WsLink { stream })
    }
}

pub struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl LiveLink for WsLink {
    async fn send(&mut self, message: &WsMessage) -> Result<(), ClientError> {
        let text = serde_json::to_string(message)
            .map_err(|error| ClientError::Protocol(format!("failed to encode frame: {error}")))?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| ClientError::TransportDisconnected(error.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<WsMessage>, ClientError> {
        loop {
            let Some(frame) = self.stream.next().await else {
                return Ok(None);
            };
            match frame.map_err(|error| ClientError::TransportDisconnected(error.to_string()))? {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str()).map(Some).map_err(|error| {
                        ClientError::Protocol(format!("malformed server frame: {error}"))
                    });
                }
                Message::Close(_) => return Ok(None),
                // Pongs are queued by tungstenite; flushing sends them.
                Message::Ping(_) => {
                    let _ = self.stream.flush().await;
                }
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
