// Live session driver.
//
// Owns one `SessionView` and a live link. Server frames and local commands
// are folded into the view, which is published on a watch channel after
// every change. On transport loss the driver reconnects with backoff, says
// hello again and lets the fresh snapshot replace everything.

use std::time::Duration;

use tokio::{
    sync::{mpsc, watch},
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webinar_common::protocol::ws::{WsMessage, CURRENT_PROTOCOL_VERSION, HEARTBEAT_TIMEOUT_MS};

use crate::{
    backoff::RetryPolicy,
    error::ClientError,
    reactions::ReactionBatcher,
    transport::{LiveConnector, LiveLink},
    view::SessionView,
};

const COMMAND_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub webinar_id: Uuid,
    pub participant_id: Uuid,
    pub reconnect: RetryPolicy,
    /// Window over which reaction taps are batched.
    pub reaction_flush: Duration,
    pub handshake_timeout: Duration,
}

impl SessionConfig {
    pub fn new(webinar_id: Uuid, participant_id: Uuid) -> Self {
        Self {
            webinar_id,
            participant_id,
            reconnect: RetryPolicy::reconnect(),
            reaction_flush: Duration::from_millis(250),
            handshake_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Answer `interaction_id`, or the active interaction when `None`.
    SubmitResponse { interaction_id: Option<Uuid>, value: String },
    React { kind: String },
    AskQuestion { text: String },
    Upvote { question_id: Uuid },
    Resync,
    StreamPlaying,
    StreamFailed,
    RetryStream,
    Shutdown,
}

/// Cloneable handle for issuing commands and observing the view.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    view: watch::Receiver<SessionView>,
}

impl SessionHandle {
    pub async fn send(&self, command: SessionCommand) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::TransportDisconnected("session has ended".into()))
    }

    pub async fn submit_response(&self, value: impl Into<String>) -> Result<(), ClientError> {
        self.send(SessionCommand::SubmitResponse { interaction_id: None, value: value.into() })
            .await
    }

    pub async fn react(&self, kind: impl Into<String>) -> Result<(), ClientError> {
        self.send(SessionCommand::React { kind: kind.into() }).await
    }

    pub async fn ask(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.send(SessionCommand::AskQuestion { text: text.into() }).await
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.send(SessionCommand::Shutdown).await
    }

    pub fn view(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn current(&self) -> SessionView {
        self.view.borrow().clone()
    }
}

enum PumpExit {
    Shutdown,
    Disconnected(ClientError),
}

pub struct SessionDriver<C: LiveConnector> {
    connector: C,
    config: SessionConfig,
    view: SessionView,
    published: watch::Sender<SessionView>,
    commands: mpsc::Receiver<SessionCommand>,
    reactions: ReactionBatcher,
}

impl<C: LiveConnector> SessionDriver<C> {
    pub fn new(connector: C, config: SessionConfig) -> (Self, SessionHandle) {
        let view = SessionView::new();
        let (published, view_rx) = watch::channel(view.clone());
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let driver = Self {
            connector,
            config,
            view,
            published,
            commands,
            reactions: ReactionBatcher::new(),
        };
        (driver, SessionHandle { commands: commands_tx, view: view_rx })
    }

    /// Run until shutdown, a dropped handle, or an unrecoverable identity error.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let webinar_id = self.config.webinar_id;
        let mut failures = 0u32;

        loop {
            let exit = match self.connector.connect().await {
                Ok(mut link) => match self.handshake(&mut link).await {
                    Ok(()) => {
                        failures = 0;
                        info!(%webinar_id, "live session established");
                        let exit = self.pump(&mut link).await;
                        link.close().await;
                        exit
                    }
                    Err(error @ ClientError::StaleIdentity(_)) => {
                        self.finish();
                        return Err(error);
                    }
                    Err(error)
                        if !error.is_retryable() && !matches!(error, ClientError::Protocol(_)) =>
                    {
                        self.finish();
                        return Err(error);
                    }
                    Err(error) => PumpExit::Disconnected(error),
                },
                Err(error) => PumpExit::Disconnected(error),
            };

            match exit {
                PumpExit::Shutdown => {
                    self.finish();
                    return Ok(());
                }
                PumpExit::Disconnected(error) => {
                    failures += 1;
                    if !self.config.reconnect.allows(failures) {
                        self.finish();
                        return Err(error);
                    }
                    warn!(%webinar_id, attempt = failures, %error, "live connection lost; reconnecting");
                    self.view.mark_reconnecting(failures);
                    self.publish();
                    let delay = self.config.reconnect.delay(failures - 1);
                    if self.wait_offline(delay).await {
                        self.finish();
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handshake(&mut self, link: &mut C::Link) -> Result<(), ClientError> {
        link.send(&WsMessage::Hello {
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            webinar_id: self.config.webinar_id,
            participant_id: self.config.participant_id,
        })
        .await?;

        let deadline = self.config.handshake_timeout;
        loop {
            let frame = timeout(deadline, link.recv())
                .await
                .map_err(|_| ClientError::TransportDisconnected("handshake timed out".into()))??;
            match frame {
                Some(ack @ WsMessage::HelloAck { .. }) => {
                    self.view.apply(&ack);
                    self.publish();
                    return Ok(());
                }
                Some(WsMessage::Error { code, message, retryable, .. }) => {
                    return Err(ClientError::from_server(
                        &code,
                        &message,
                        retryable,
                        Some(self.config.participant_id),
                    ));
                }
                Some(other) => debug!(frame = other.type_name(), "ignoring frame before hello_ack"),
                None => {
                    return Err(ClientError::TransportDisconnected(
                        "connection closed during handshake".into(),
                    ))
                }
            }
        }
    }

    async fn pump(&mut self, link: &mut C::Link) -> PumpExit {
        let mut flush = interval(self.config.reaction_flush);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = link.recv() => match frame {
                    Ok(Some(message)) => {
                        debug!(frame = message.type_name(), "live frame");
                        self.view.apply(&message);
                        self.publish();
                    }
                    Ok(None) => {
                        return PumpExit::Disconnected(ClientError::TransportDisconnected(
                            "server closed the connection".into(),
                        ))
                    }
                    Err(ClientError::Protocol(reason)) => {
                        warn!(%reason, "dropping malformed frame");
                    }
                    Err(error) => return PumpExit::Disconnected(error),
                },
                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => {
                        if let Err(error) = self.flush_reactions(link).await {
                            debug!(%error, "final reaction flush failed");
                        }
                        return PumpExit::Shutdown;
                    }
                    Some(command) => {
                        if let Err(error) = self.handle_command(command, link).await {
                            return PumpExit::Disconnected(error);
                        }
                    }
                },
                _ = flush.tick() => {
                    if let Err(error) = self.flush_reactions(link).await {
                        return PumpExit::Disconnected(error);
                    }
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: SessionCommand,
        link: &mut C::Link,
    ) -> Result<(), ClientError> {
        let frame = match command {
            SessionCommand::SubmitResponse { interaction_id, value } => {
                let frame = match interaction_id {
                    Some(interaction_id) => self.view.submit_response(interaction_id, &value),
                    None => self.view.submit_active_response(&value),
                };
                self.publish();
                self.local_result(frame)
            }
            SessionCommand::AskQuestion { text } => {
                let frame = self.view.submit_question(&text);
                self.publish();
                self.local_result(frame)
            }
            SessionCommand::Upvote { question_id } => {
                let frame = self.view.upvote_question(question_id);
                self.local_result(frame)
            }
            SessionCommand::React { kind } => {
                self.reactions.tap(&kind);
                None
            }
            SessionCommand::Resync => Some(WsMessage::Resync {}),
            SessionCommand::StreamPlaying | SessionCommand::StreamFailed | SessionCommand::RetryStream => {
                self.apply_stream(&command);
                None
            }
            SessionCommand::Shutdown => None,
        };

        match frame {
            Some(frame) => link.send(&frame).await,
            None => Ok(()),
        }
    }

    fn local_result(&mut self, result: Result<WsMessage, ClientError>) -> Option<WsMessage> {
        match result {
            Ok(frame) => Some(frame),
            Err(ClientError::InteractionClosed(_)) => {
                // The view already raised its own notice.
                self.publish();
                None
            }
            Err(error) => {
                self.notice(error.code(), &error.to_string());
                None
            }
        }
    }

    fn apply_stream(&mut self, command: &SessionCommand) {
        match command {
            SessionCommand::StreamPlaying => self.view.stream_playing(),
            SessionCommand::StreamFailed => self.view.stream_failed(),
            SessionCommand::RetryStream => {
                self.view.retry_stream();
            }
            _ => return,
        }
        self.publish();
    }

    async fn flush_reactions(&mut self, link: &mut C::Link) -> Result<(), ClientError> {
        for frame in self.reactions.drain() {
            link.send(&frame).await?;
        }
        Ok(())
    }

    /// Sleep out a reconnect delay while still serving commands.
    /// Returns `true` when the session should end.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let wake = sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                _ = &mut wake => return false,
                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => return true,
                    Some(SessionCommand::React { kind }) => self.reactions.tap(&kind),
                    Some(SessionCommand::Resync) => {}
                    Some(
                        command @ (SessionCommand::StreamPlaying
                        | SessionCommand::StreamFailed
                        | SessionCommand::RetryStream),
                    ) => self.apply_stream(&command),
                    Some(_) => self.notice("TRANSPORT_DISCONNECTED", "reconnecting; try again shortly"),
                },
            }
        }
    }

    fn notice(&mut self, code: &str, message: &str) {
        self.view.apply(&WsMessage::error(code, message, true, None));
        self.publish();
    }

    fn finish(&mut self) {
        self.view.mark_closed();
        self.publish();
    }

    fn publish(&self) {
        self.published.send_replace(self.view.clone());
    }
}
