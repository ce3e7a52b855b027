use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::ConsoleError;
use crate::rcon::{ConsoleTransport, ServerEndpoint};
use crate::{AgentError, AgentResult};

/// Operator channel. Delivery is fire-and-forget: failures are logged here
/// and never reach the lifecycle sequence.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, text: &str);
}

/// Posts messages to a Discord channel webhook.
pub struct DiscordWebhook {
    client: Client,
    url: String,
}

impl DiscordWebhook {
    pub fn new(url: String, timeout: Duration) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AgentError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl NotificationSink for DiscordWebhook {
    async fn send(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        match self
            .client
            .post(&self.url)
            .json(&json!({ "content": text }))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!("Notification delivered: {}", text);
            }
            Ok(resp) => {
                warn!("Notification rejected with HTTP {}", resp.status());
            }
            Err(e) => {
                warn!("Failed to deliver notification: {}", e);
            }
        }
    }
}

/// Used when no webhook is configured.
pub struct LogOnlySink;

#[async_trait]
impl NotificationSink for LogOnlySink {
    async fn send(&self, text: &str) {
        info!("Notification (no channel configured): {}", text);
    }
}

/// In-game broadcast to everyone connected to the server.
#[async_trait]
pub trait PlayerBroadcast: Send + Sync {
    async fn broadcast(&self, endpoint: &ServerEndpoint, text: &str) -> Result<(), ConsoleError>;
}

/// Broadcasts with the console `say` command.
pub struct ConsoleBroadcast {
    console: Arc<dyn ConsoleTransport>,
}

impl ConsoleBroadcast {
    pub fn new(console: Arc<dyn ConsoleTransport>) -> Self {
        Self { console }
    }
}

#[async_trait]
impl PlayerBroadcast for ConsoleBroadcast {
    async fn broadcast(&self, endpoint: &ServerEndpoint, text: &str) -> Result<(), ConsoleError> {
        self.console
            .execute(endpoint, &format!("say {}", text))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use tokio::sync::Mutex;

    type Seen = Arc<Mutex<Vec<Value>>>;

    async fn hook(State(seen): State<Seen>, Json(body): Json<Value>) -> StatusCode {
        seen.lock().await.push(body);
        StatusCode::NO_CONTENT
    }

    #[tokio::test]
    async fn test_discord_webhook_posts_content() {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/hook", post(hook))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let sink =
            DiscordWebhook::new(format!("http://{}/hook", addr), Duration::from_secs(2)).unwrap();
        sink.send("world has started").await;

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["content"], "world has started");
    }

    #[tokio::test]
    async fn test_discord_webhook_swallows_failures() {
        let sink =
            DiscordWebhook::new("http://127.0.0.1:9/hook".to_string(), Duration::from_millis(500))
                .unwrap();
        sink.send("nobody is listening").await;
    }

    struct EchoConsole(Mutex<Vec<String>>);

    #[async_trait]
    impl ConsoleTransport for EchoConsole {
        async fn execute(
            &self,
            _endpoint: &ServerEndpoint,
            command: &str,
        ) -> Result<String, ConsoleError> {
            self.0.lock().await.push(command.to_string());
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_console_broadcast_uses_say() {
        let console = Arc::new(EchoConsole(Mutex::new(Vec::new())));
        let broadcast = ConsoleBroadcast::new(console.clone());
        let endpoint = ServerEndpoint {
            host: "127.0.0.1".to_string(),
            port: 25575,
            password: "pw".to_string(),
        };
        broadcast.broadcast(&endpoint, "hello all").await.unwrap();
        assert_eq!(*console.0.lock().await, vec!["say hello all".to_string()]);
    }
}
