// Outbound webhook delivery.
//
// Events are queued on a bounded channel and posted by a single worker.
// Delivery is fire-and-forget: a full queue drops the event and a failed
// post is logged, never surfaced to the caller.

use std::time::Duration;

use chrono::Utc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};
use webinar_common::webhook::{TemplateRenderer, WebhookEnvelope, WebhookEvent};

use crate::metrics;

pub const WEBHOOK_QUEUE_CAPACITY: usize = 256;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub template: Option<TemplateRenderer>,
}

#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    sender: mpsc::Sender<WebhookEnvelope>,
    template: Option<TemplateRenderer>,
}

impl WebhookDispatcher {
    /// Start the delivery worker. The returned handle ends once every
    /// dispatcher clone is dropped.
    pub fn spawn(config: WebhookConfig) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .user_agent(concat!("webinar-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let (sender, receiver) = mpsc::channel(WEBHOOK_QUEUE_CAPACITY);
        let worker = tokio::spawn(deliver_loop(client, config.url, receiver));
        Ok((Self { sender, template: config.template }, worker))
    }

    /// Queue an event. Never blocks and never fails.
    pub fn emit(&self, event: WebhookEvent) {
        let occurred_at = Utc::now();
        let text = self.template.as_ref().and_then(|template| template.render(&event, occurred_at));
        let kind = event.kind();
        let envelope = WebhookEnvelope { event, occurred_at, text };

        if let Err(error) = self.sender.try_send(envelope) {
            metrics::record_webhook_delivery("dropped");
            debug!(event = kind.as_str(), %error, "webhook queue unavailable; event dropped");
        }
    }
}

async fn deliver_loop(
    client: reqwest::Client,
    url: String,
    mut receiver: mpsc::Receiver<WebhookEnvelope>,
) {
    while let Some(envelope) = receiver.recv().await {
        let kind = envelope.event.kind();
        match client.post(&url).json(&envelope).send().await {
            Ok(response) if response.status().is_success() => {
                metrics::record_webhook_delivery("delivered");
                debug!(event = kind.as_str(), "webhook delivered");
            }
            Ok(response) => {
                metrics::record_webhook_delivery("failed");
                warn!(event = kind.as_str(), status = %response.status(), "webhook rejected");
            }
            Err(error) => {
                metrics::record_webhook_delivery("failed");
                warn!(event = kind.as_str(), %error, "webhook delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use uuid::Uuid;
    use webinar_common::{
        types::WebinarStatus,
        webhook::{WebinarRef, WebinarStatusChanged},
    };

    type Received = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn capture_server() -> (String, Received) {
        let received: Received = Arc::default();
        let app = Router::new()
            .route(
                "/hook",
                post(|State(received): State<Received>, Json(body): Json<serde_json::Value>| async move {
                    received.lock().unwrap().push(body);
                }),
            )
            .with_state(Arc::clone(&received));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), received)
    }

    fn status_event() -> WebhookEvent {
        WebhookEvent::WebinarStatusChanged(WebinarStatusChanged {
            webinar: WebinarRef { id: Uuid::nil(), slug: "intro".into(), title: "Intro".into() },
            previous_status: WebinarStatus::Scheduled,
            status: WebinarStatus::Live,
        })
    }

    #[tokio::test]
    async fn delivers_typed_envelope_with_rendered_text() {
        let (url, received) = capture_server().await;
        let template = TemplateRenderer::compile("{{webinar.slug}} is {{webinar.status}}").unwrap();
        let (dispatcher, _worker) =
            WebhookDispatcher::spawn(WebhookConfig { url, template: Some(template) }).unwrap();

        dispatcher.emit(status_event());

        let body = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(body) = received.lock().unwrap().first().cloned() {
                    return body;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("webhook should be delivered");

        assert_eq!(body["event"], "webinar.status_changed");
        assert_eq!(body["data"]["status"], "live");
        assert_eq!(body["text"], "intro is live");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_swallowed() {
        let (dispatcher, worker) = WebhookDispatcher::spawn(WebhookConfig {
            url: "http://127.0.0.1:9/unreachable".into(),
            template: None,
        })
        .unwrap();

        dispatcher.emit(status_event());
        drop(dispatcher);

        tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .expect("worker should exit once the queue closes")
            .expect("worker should not panic");
    }
}
