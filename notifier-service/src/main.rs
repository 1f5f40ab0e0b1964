// Copyright (C) 2026 Grove Games
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use axum::{Json, Router, routing::get};
use chrono::Utc;
use grove_common::{
    BroadcastCommand, ConnectionsResponse, DomainEvent, Notification, NotificationKind,
};
use rdkafka::{
    Message,
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    producer::{FutureProducer, FutureRecord},
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Source of the live connection ids for a game, looked up at fan-out time so
/// broadcasts only target connections that still exist.
#[async_trait]
trait ConnectionDirectory: Send + Sync {
    async fn connections_for_game(&self, game_id: &str) -> anyhow::Result<Vec<String>>;
}

/// Hand-off to the delivery transport that owns the client connections.
#[async_trait]
trait BroadcastSender: Send + Sync {
    async fn send_broadcast(&self, command: &BroadcastCommand) -> anyhow::Result<()>;
}

struct HttpConnectionDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConnectionDirectory {
    fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: std::env::var("SESSION_SERVICE_BASE_URL")
                .ok()
                .unwrap_or_else(|| "http://game-session-service:8080".to_string()),
        }
    }
}

#[async_trait]
impl ConnectionDirectory for HttpConnectionDirectory {
    async fn connections_for_game(&self, game_id: &str) -> anyhow::Result<Vec<String>> {
        let url = format!(
            "{}/internal/v1/games/{game_id}/connections",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("connection lookup request failed")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!(game_id = %game_id, "connection lookup returned 404; treating as no connections");
            return Ok(Vec::new());
        }

        let body: ConnectionsResponse = response
            .error_for_status()
            .context("connection lookup returned an error status")?
            .json()
            .await
            .context("failed to decode connection lookup response")?;
        Ok(body.connections)
    }
}

struct KafkaBroadcastSender {
    producer: FutureProducer,
    topic: String,
}

impl KafkaBroadcastSender {
    fn from_env() -> anyhow::Result<Self> {
        let bootstrap_servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .ok()
            .unwrap_or_else(|| "kafka:9092".to_string());
        let producer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("failed to create Kafka broadcast producer")?;
        Ok(Self {
            producer,
            topic: std::env::var("DELIVERY_TOPIC")
                .ok()
                .unwrap_or_else(|| "connection.delivery.v1".to_string()),
        })
    }
}

#[async_trait]
impl BroadcastSender for KafkaBroadcastSender {
    async fn send_broadcast(&self, command: &BroadcastCommand) -> anyhow::Result<()> {
        let payload =
            serde_json::to_string(command).context("failed to encode broadcast command")?;
        self.producer
            .send(
                FutureRecord::to(&self.topic)
                    .key(&command.game_id)
                    .payload(&payload),
                Duration::from_secs(5),
            )
            .await
            .map_err(|(error, _)| anyhow::anyhow!("Kafka publish failed: {error:?}"))?;
        Ok(())
    }
}

struct Notifier {
    directory: Arc<dyn ConnectionDirectory>,
    sender: Arc<dyn BroadcastSender>,
}

impl Notifier {
    /// Turn a domain event into a broadcast to every live connection in the
    /// game except the one that caused the event.
    async fn handle_domain_event(&self, event: &DomainEvent) -> anyhow::Result<()> {
        let notification = compose_notification(event);
        let save_to_chat_history = matches!(
            notification.kind,
            NotificationKind::PlayerJoined | NotificationKind::PlayerLeft
        );

        let game_id = event.game_id().to_string();
        let mut connections = self.directory.connections_for_game(&game_id).await?;
        if let Some(own_connection) = event.connection_id() {
            connections.retain(|connection| connection != own_connection);
        }
        if connections.is_empty() {
            info!(game_id = %game_id, event = event.name(), "no connections to notify");
            return Ok(());
        }

        self.sender
            .send_broadcast(&BroadcastCommand {
                connections,
                message: notification,
                game_id,
                save_to_chat_history,
            })
            .await
    }
}

fn compose_notification(event: &DomainEvent) -> Notification {
    let base = Notification {
        message_id: Uuid::new_v4(),
        kind: NotificationKind::PlayerJoined,
        message: String::new(),
        time: Utc::now(),
        x: None,
        y: None,
        direction: None,
        score: None,
    };
    match event {
        DomainEvent::PlayerJoined { message, .. } => Notification {
            kind: NotificationKind::PlayerJoined,
            message: message.clone(),
            ..base
        },
        DomainEvent::PlayerLeft { message, .. } => Notification {
            kind: NotificationKind::PlayerLeft,
            message: message.clone(),
            ..base
        },
        DomainEvent::PlayerMoved {
            username,
            x,
            y,
            direction,
            ..
        } => Notification {
            kind: NotificationKind::PlayerMoved,
            message: format!("{username} moved"),
            x: Some(*x),
            y: Some(*y),
            direction: Some(*direction),
            ..base
        },
        DomainEvent::PointsUpdated {
            username, score, ..
        } => Notification {
            kind: NotificationKind::PointsUpdated,
            message: format!("{username} now has {} points", score.floor() as i64),
            score: Some(*score),
            ..base
        },
    }
}

async fn run_event_consumer(notifier: Arc<Notifier>) -> anyhow::Result<()> {
    let bootstrap_servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
        .ok()
        .unwrap_or_else(|| "kafka:9092".to_string());
    let group_id = std::env::var("NOTIFIER_CONSUMER_GROUP_ID")
        .ok()
        .unwrap_or_else(|| "notifier-v1".to_string());
    let topic_prefix = std::env::var("GAME_EVENTS_TOPIC_PREFIX")
        .ok()
        .unwrap_or_else(|| "game.events".to_string());

    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", bootstrap_servers)
        .set("group.id", &group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "latest")
        .create()
        .context("failed to create Kafka domain-event consumer")?;

    let topic_pattern = format!("^{}\\..*\\.v1$", regex_escape(&topic_prefix));
    consumer
        .subscribe(&[&topic_pattern])
        .context("failed to subscribe to domain-event topics")?;
    info!(group_id = %group_id, pattern = %topic_pattern, "consuming domain events");

    loop {
        let message = match consumer.recv().await {
            Ok(message) => message,
            Err(error) => {
                warn!(error = %error, "Kafka receive error");
                continue;
            }
        };

        // Malformed and failed events are committed and skipped; redelivery
        // would fail the same way.
        match message
            .payload()
            .map(|payload| serde_json::from_slice::<DomainEvent>(payload))
        {
            Some(Ok(event)) => {
                if let Err(error) = notifier.handle_domain_event(&event).await {
                    warn!(
                        event = event.name(),
                        game_id = event.game_id(),
                        error = %error,
                        "failed to fan out domain event"
                    );
                }
            }
            Some(Err(error)) => {
                warn!(topic = message.topic(), error = %error, "skipping undecodable domain event");
            }
            None => {
                warn!(topic = message.topic(), "skipping domain event with empty payload");
            }
        }

        if let Err(error) = consumer.commit_message(&message, CommitMode::Async) {
            warn!(error = %error, "failed to commit consumer offset");
        }
    }
}

// rdkafka topic patterns are full regexes; a literal prefix must be escaped.
fn regex_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if !c.is_alphanumeric() && c != '-' && c != '_' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "notifier_service=debug,tower_http=info".to_string()),
        )
        .init();

    let notifier = Arc::new(Notifier {
        directory: Arc::new(HttpConnectionDirectory::from_env()),
        sender: Arc::new(KafkaBroadcastSender::from_env()?),
    });

    tokio::spawn(async move {
        if let Err(error) = run_event_consumer(notifier).await {
            warn!(error = %error, "domain-event consumer terminated");
        }
    });

    let app = Router::new()
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http());

    let bind_addr: SocketAddr = std::env::var("NOTIFIER_BIND")
        .ok()
        .unwrap_or_else(|| "0.0.0.0:8085".to_string())
        .parse()
        .context("invalid NOTIFIER_BIND")?;
    info!(%bind_addr, "notifier-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "notifier-service"}))
}
