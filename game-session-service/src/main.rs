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

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use grove_common::{
    AbilityResponse, ChatMessage, ConnectionsResponse, CreateGameRequest, CreateGameResponse,
    DEFAULT_AVATAR, DEFAULT_MAP_ID, DecreaseAbilityRequest, Direction, DomainEvent, GameSummary,
    INITIAL_LEADERBOARD_SCORE, IncreaseAbilityRequest, JoinGameRequest, JoinGameResponse,
    LeaderboardResponse, LeaderboardRow, LeaveGameRequest, MAX_SUPER_ABILITY_USES, MapCatalog,
    MapTemplate, MoveRequest, MoveResponse, ScoreResponse, SetScoreRequest, SortOrder,
    SUPER_ABILITY_USE_PENALTY, Tile, UpdatePointsRequest, slugify, tile_key,
};
use lambda_http::run as lambda_run;
use rand::Rng;
use rdkafka::{
    config::ClientConfig,
    producer::{FutureProducer, FutureRecord},
};
use serde::Deserialize;
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

const CACHE_GAME: &str = "game";
const CACHE_PLAYER: &str = "player";
const CACHE_USER: &str = "user";
const CACHE_CONNECTION: &str = "connection";
const CACHE_LEADERBOARD: &str = "leaderboard";
const CACHE_CHAT: &str = "chat";

/// Member of the `game` set cache that holds the global game list.
const GAME_LIST_KEY: &str = "list";

/// Three-way lookup result from the KV Store: found, absent, or (as the `Err`
/// arm of the surrounding `Result`) failed.
#[derive(Debug, Clone, PartialEq)]
enum Lookup<T> {
    Found(T),
    Absent,
}

/// Storage capability consumed by the session engine: named caches holding
/// dictionaries, sets, sorted sets, scalar counters, and lists, with optional
/// per-entry expiry. Writes of a multi-field mutation are independent; there
/// is no cross-key transaction.
#[async_trait]
trait KvStore: Send + Sync {
    async fn dictionary_fetch(
        &self,
        cache: &str,
        key: &str,
    ) -> anyhow::Result<Lookup<HashMap<String, String>>>;

    async fn dictionary_get_fields(
        &self,
        cache: &str,
        key: &str,
        fields: &[&str],
    ) -> anyhow::Result<Lookup<HashMap<String, String>>>;

    async fn dictionary_set_fields(
        &self,
        cache: &str,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>;

    async fn dictionary_remove_fields(
        &self,
        cache: &str,
        key: &str,
        fields: &[&str],
    ) -> anyhow::Result<()>;

    async fn set_add_element(&self, cache: &str, key: &str, element: String)
    -> anyhow::Result<()>;

    async fn set_remove_element(&self, cache: &str, key: &str, element: &str)
    -> anyhow::Result<()>;

    async fn set_fetch(&self, cache: &str, key: &str) -> anyhow::Result<Lookup<HashSet<String>>>;

    async fn sorted_set_increment(
        &self,
        cache: &str,
        key: &str,
        member: &str,
        delta: f64,
    ) -> anyhow::Result<f64>;

    async fn sorted_set_put_element(
        &self,
        cache: &str,
        key: &str,
        member: &str,
        score: f64,
    ) -> anyhow::Result<()>;

    async fn sorted_set_get_score(
        &self,
        cache: &str,
        key: &str,
        member: &str,
    ) -> anyhow::Result<Lookup<f64>>;

    async fn sorted_set_fetch_by_rank(
        &self,
        cache: &str,
        key: &str,
        order: SortOrder,
    ) -> anyhow::Result<Lookup<Vec<(String, f64)>>>;

    async fn increment(&self, cache: &str, key: &str, delta: i64) -> anyhow::Result<i64>;

    async fn set_counter(&self, cache: &str, key: &str, value: i64) -> anyhow::Result<()>;

    async fn list_fetch(&self, cache: &str, key: &str) -> anyhow::Result<Lookup<Vec<String>>>;

    async fn list_push_back(&self, cache: &str, key: &str, value: String) -> anyhow::Result<()>;
}

/// Publish side of the Event Bus: one domain event per completed state
/// change, keyed by game id.
#[async_trait]
trait EventPublisher: Send + Sync {
    async fn publish_event(&self, event: &DomainEvent) -> anyhow::Result<()>;
}

struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

type EntryKey = (String, String);

#[derive(Default)]
struct InMemoryState {
    dictionaries: HashMap<EntryKey, Entry<HashMap<String, String>>>,
    sets: HashMap<EntryKey, Entry<HashSet<String>>>,
    sorted_sets: HashMap<EntryKey, Entry<HashMap<String, f64>>>,
    counters: HashMap<EntryKey, Entry<i64>>,
    lists: HashMap<EntryKey, Entry<Vec<String>>>,
}

/// Process-local KV Store adapter. Backs local deployments and tests; a
/// hosted cache adapter can replace it behind the same trait without touching
/// the engine.
struct InMemoryKvStore {
    state: RwLock<InMemoryState>,
    default_ttl: Option<Duration>,
}

impl InMemoryKvStore {
    fn new(default_ttl: Duration) -> Self {
        Self {
            state: RwLock::new(InMemoryState::default()),
            default_ttl: Some(default_ttl),
        }
    }

    #[cfg(test)]
    fn without_expiry() -> Self {
        Self {
            state: RwLock::new(InMemoryState::default()),
            default_ttl: None,
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<Instant> {
        ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl)
    }
}

fn entry_key(cache: &str, key: &str) -> EntryKey {
    (cache.to_string(), key.to_string())
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn dictionary_fetch(
        &self,
        cache: &str,
        key: &str,
    ) -> anyhow::Result<Lookup<HashMap<String, String>>> {
        let state = self.state.read().await;
        Ok(match state.dictionaries.get(&entry_key(cache, key)) {
            Some(entry) if entry.live() => Lookup::Found(entry.value.clone()),
            _ => Lookup::Absent,
        })
    }

    async fn dictionary_get_fields(
        &self,
        cache: &str,
        key: &str,
        fields: &[&str],
    ) -> anyhow::Result<Lookup<HashMap<String, String>>> {
        let state = self.state.read().await;
        Ok(match state.dictionaries.get(&entry_key(cache, key)) {
            Some(entry) if entry.live() => Lookup::Found(
                fields
                    .iter()
                    .filter_map(|field| {
                        entry
                            .value
                            .get(*field)
                            .map(|value| (field.to_string(), value.clone()))
                    })
                    .collect(),
            ),
            _ => Lookup::Absent,
        })
    }

    async fn dictionary_set_fields(
        &self,
        cache: &str,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        let expires_at = self.expiry(ttl);
        let mut state = self.state.write().await;
        let entry = state
            .dictionaries
            .entry(entry_key(cache, key))
            .or_insert_with(|| Entry {
                value: HashMap::new(),
                expires_at,
            });
        if !entry.live() {
            entry.value.clear();
            entry.expires_at = expires_at;
        }
        for (field, value) in fields {
            entry.value.insert(field, value);
        }
        Ok(())
    }

    async fn dictionary_remove_fields(
        &self,
        cache: &str,
        key: &str,
        fields: &[&str],
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if let Some(entry) = state.dictionaries.get_mut(&entry_key(cache, key))
            && entry.live()
        {
            for field in fields {
                entry.value.remove(*field);
            }
        }
        Ok(())
    }

    async fn set_add_element(
        &self,
        cache: &str,
        key: &str,
        element: String,
    ) -> anyhow::Result<()> {
        let expires_at = self.expiry(None);
        let mut state = self.state.write().await;
        let entry = state.sets.entry(entry_key(cache, key)).or_insert_with(|| Entry {
            value: HashSet::new(),
            expires_at,
        });
        if !entry.live() {
            entry.value.clear();
            entry.expires_at = expires_at;
        }
        entry.value.insert(element);
        Ok(())
    }

    async fn set_remove_element(
        &self,
        cache: &str,
        key: &str,
        element: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if let Some(entry) = state.sets.get_mut(&entry_key(cache, key))
            && entry.live()
        {
            entry.value.remove(element);
        }
        Ok(())
    }

    async fn set_fetch(&self, cache: &str, key: &str) -> anyhow::Result<Lookup<HashSet<String>>> {
        let state = self.state.read().await;
        Ok(match state.sets.get(&entry_key(cache, key)) {
            Some(entry) if entry.live() => Lookup::Found(entry.value.clone()),
            _ => Lookup::Absent,
        })
    }

    async fn sorted_set_increment(
        &self,
        cache: &str,
        key: &str,
        member: &str,
        delta: f64,
    ) -> anyhow::Result<f64> {
        let expires_at = self.expiry(None);
        let mut state = self.state.write().await;
        let entry = state
            .sorted_sets
            .entry(entry_key(cache, key))
            .or_insert_with(|| Entry {
                value: HashMap::new(),
                expires_at,
            });
        if !entry.live() {
            entry.value.clear();
            entry.expires_at = expires_at;
        }
        let score = entry.value.entry(member.to_string()).or_insert(0.0);
        *score += delta;
        Ok(*score)
    }

    async fn sorted_set_put_element(
        &self,
        cache: &str,
        key: &str,
        member: &str,
        score: f64,
    ) -> anyhow::Result<()> {
        let expires_at = self.expiry(None);
        let mut state = self.state.write().await;
        let entry = state
            .sorted_sets
            .entry(entry_key(cache, key))
            .or_insert_with(|| Entry {
                value: HashMap::new(),
                expires_at,
            });
        entry.value.insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_set_get_score(
        &self,
        cache: &str,
        key: &str,
        member: &str,
    ) -> anyhow::Result<Lookup<f64>> {
        let state = self.state.read().await;
        Ok(match state.sorted_sets.get(&entry_key(cache, key)) {
            Some(entry) if entry.live() => match entry.value.get(member) {
                Some(score) => Lookup::Found(*score),
                None => Lookup::Absent,
            },
            _ => Lookup::Absent,
        })
    }

    async fn sorted_set_fetch_by_rank(
        &self,
        cache: &str,
        key: &str,
        order: SortOrder,
    ) -> anyhow::Result<Lookup<Vec<(String, f64)>>> {
        let state = self.state.read().await;
        Ok(match state.sorted_sets.get(&entry_key(cache, key)) {
            Some(entry) if entry.live() => {
                let mut entries: Vec<(String, f64)> = entry
                    .value
                    .iter()
                    .map(|(member, score)| (member.clone(), *score))
                    .collect();
                // Equal scores tie-break on the member name so ranks are
                // deterministic across fetches.
                entries.sort_by(|a, b| {
                    let by_score = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
                    let by_score = match order {
                        SortOrder::Ascending => by_score,
                        SortOrder::Descending => by_score.reverse(),
                    };
                    by_score.then_with(|| a.0.cmp(&b.0))
                });
                Lookup::Found(entries)
            }
            _ => Lookup::Absent,
        })
    }

    async fn increment(&self, cache: &str, key: &str, delta: i64) -> anyhow::Result<i64> {
        let expires_at = self.expiry(None);
        let mut state = self.state.write().await;
        let entry = state
            .counters
            .entry(entry_key(cache, key))
            .or_insert_with(|| Entry {
                value: 0,
                expires_at,
            });
        if !entry.live() {
            entry.value = 0;
            entry.expires_at = expires_at;
        }
        entry.value += delta;
        Ok(entry.value)
    }

    async fn set_counter(&self, cache: &str, key: &str, value: i64) -> anyhow::Result<()> {
        let expires_at = self.expiry(None);
        let mut state = self.state.write().await;
        state
            .counters
            .insert(entry_key(cache, key), Entry { value, expires_at });
        Ok(())
    }

    async fn list_fetch(&self, cache: &str, key: &str) -> anyhow::Result<Lookup<Vec<String>>> {
        let state = self.state.read().await;
        Ok(match state.lists.get(&entry_key(cache, key)) {
            Some(entry) if entry.live() => Lookup::Found(entry.value.clone()),
            _ => Lookup::Absent,
        })
    }

    async fn list_push_back(&self, cache: &str, key: &str, value: String) -> anyhow::Result<()> {
        let expires_at = self.expiry(None);
        let mut state = self.state.write().await;
        let entry = state.lists.entry(entry_key(cache, key)).or_insert_with(|| Entry {
            value: Vec::new(),
            expires_at,
        });
        entry.value.push(value);
        Ok(())
    }
}

#[derive(Clone)]
struct KafkaEventPublisher {
    producer: FutureProducer,
    topic_prefix: String,
}

impl KafkaEventPublisher {
    fn from_env() -> anyhow::Result<Self> {
        let bootstrap_servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .ok()
            .unwrap_or_else(|| "kafka:9092".to_string());
        let producer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("failed to create Kafka domain-event producer")?;
        Ok(Self {
            producer,
            topic_prefix: std::env::var("GAME_EVENTS_TOPIC_PREFIX")
                .ok()
                .unwrap_or_else(|| "game.events".to_string()),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish_event(&self, event: &DomainEvent) -> anyhow::Result<()> {
        let topic = format!("{}.{}.v1", self.topic_prefix, event.name());
        let payload = serde_json::to_string(event).context("failed to encode domain event")?;
        self.producer
            .send(
                FutureRecord::to(&topic)
                    .key(event.game_id())
                    .payload(&payload),
                Duration::from_secs(5),
            )
            .await
            .map_err(|(error, _)| anyhow::anyhow!("Kafka publish failed: {error:?}"))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct UserSession {
    username: String,
    sign_in_time: Option<String>,
    current_game_id: Option<String>,
    connection_id: Option<String>,
}

#[derive(Debug, PartialEq)]
enum CreateOutcome {
    Created { id: String },
    AlreadyExists,
}

#[derive(Debug)]
enum JoinOutcome {
    Joined(JoinGameResponse),
    GameNotFound,
    MapFull,
}

#[derive(Debug, PartialEq)]
enum MoveOutcome {
    Moved(MoveResponse),
    GameNotFound,
    NotInGame,
}

#[derive(Debug, PartialEq)]
enum LeaderboardOutcome {
    Ranked(Vec<LeaderboardRow>),
    GameNotFound,
}

#[derive(Debug, PartialEq)]
enum DecreaseOutcome {
    Used { remaining: i64 },
    OutOfUses,
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn KvStore>,
    bus: Arc<dyn EventPublisher>,
    maps: Arc<MapCatalog>,
}

impl AppState {
    fn from_env() -> anyhow::Result<Self> {
        let default_ttl = std::env::var("CACHE_TTL_SECONDS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(86_400);

        let mut maps = MapCatalog::built_in();
        for template in load_map_overrides().unwrap_or_default() {
            if template.width == 0 || template.height == 0 {
                warn!(map_id = %template.id, "skipping map template with empty grid");
                continue;
            }
            info!(map_id = %template.id, width = template.width, height = template.height, "loaded map template from config");
            maps.insert(template);
        }

        Ok(Self {
            store: Arc::new(InMemoryKvStore::new(Duration::from_secs(default_ttl))),
            bus: Arc::new(KafkaEventPublisher::from_env()?),
            maps: Arc::new(maps),
        })
    }
}

fn load_map_overrides() -> Option<Vec<MapTemplate>> {
    let path = std::env::var("MAP_CONFIG_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read map config file");
            return None;
        }
    };

    match serde_yaml::from_str::<Vec<MapTemplate>>(&raw) {
        Ok(templates) => Some(templates),
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse map config yaml");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "game_session_service=debug,tower_http=info".to_string()),
        )
        .init();

    let state = AppState::from_env()?;
    let app = build_router(state);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running game-session-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr = parse_bind_addr("GAME_SESSION_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "game-session-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/games", post(create_game_handler).get(list_games_handler))
        .route(
            "/v1/games/{game_id}/players",
            post(join_game_handler).delete(leave_game_handler),
        )
        .route("/v1/movements", post(move_handler))
        .route("/v1/points", post(update_points_handler))
        .route("/v1/leaderboard", get(leaderboard_handler))
        .route(
            "/v1/super-abilities",
            post(increase_ability_handler).delete(decrease_ability_handler),
        )
        .route(
            "/internal/v1/games/{game_id}/connections",
            get(connections_handler),
        )
        .route(
            "/internal/v1/leaderboard/{game_id}/players/{username}/score",
            put(set_score_handler),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "game-session-service"}))
}

async fn create_game_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateGameRequest>,
) -> Result<(StatusCode, Json<CreateGameResponse>), ApiError> {
    let outcome = create_game(
        &state,
        &request.name,
        request.duration,
        request.map_id.as_deref(),
        request.is_ranked.unwrap_or(false),
    )
    .await
    .map_err(|error| ApiError::internal(format!("failed to create game: {error:#}")))?;

    match outcome {
        CreateOutcome::Created { id } => Ok((StatusCode::CREATED, Json(CreateGameResponse { id }))),
        CreateOutcome::AlreadyExists => Err(ApiError::conflict(
            "a game with the provided name already exists",
        )),
    }
}

async fn list_games_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<GameSummary>>, ApiError> {
    let games = list_games(&state)
        .await
        .map_err(|error| ApiError::internal(format!("failed to list games: {error:#}")))?;
    Ok(Json(games))
}

async fn join_game_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(request): Json<JoinGameRequest>,
) -> Result<Json<JoinGameResponse>, ApiError> {
    let outcome = join_game(&state, &game_id, &request.username)
        .await
        .map_err(|error| ApiError::internal(format!("failed to join game: {error:#}")))?;

    match outcome {
        JoinOutcome::Joined(response) => Ok(Json(response)),
        JoinOutcome::GameNotFound => {
            Err(ApiError::not_found(format!("game {game_id} not found")))
        }
        JoinOutcome::MapFull => Err(ApiError::conflict("no free tiles left on the map")),
    }
}

async fn leave_game_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(request): Json<LeaveGameRequest>,
) -> Result<StatusCode, ApiError> {
    leave_game(&state, &game_id, &request.username, None)
        .await
        .map_err(|error| ApiError::internal(format!("failed to leave game: {error:#}")))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn move_handler(
    State(state): State<AppState>,
    Json(request): Json<MoveRequest>,
) -> Result<Json<MoveResponse>, ApiError> {
    let game_id = require_active_game(&state, &request.username).await?;
    let outcome = move_player(&state, &game_id, &request.username, request.direction)
        .await
        .map_err(|error| ApiError::internal(format!("failed to move player: {error:#}")))?;

    match outcome {
        MoveOutcome::Moved(response) => Ok(Json(response)),
        MoveOutcome::GameNotFound => Err(ApiError::not_found(format!("game {game_id} not found"))),
        MoveOutcome::NotInGame => Err(ApiError::conflict("you are not part of an active game")),
    }
}

async fn update_points_handler(
    State(state): State<AppState>,
    Json(request): Json<UpdatePointsRequest>,
) -> Result<Json<ScoreResponse>, ApiError> {
    let game_id = require_active_game(&state, &request.username).await?;
    let score = update_score(&state, &game_id, &request.username, request.points)
        .await
        .map_err(|error| ApiError::internal(format!("failed to update score: {error:#}")))?;
    Ok(Json(ScoreResponse { score }))
}

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    username: String,
    order: Option<SortOrder>,
    top: Option<usize>,
}

async fn leaderboard_handler(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<LeaderboardResponse>, ApiError> {
    let game_id = require_active_game(&state, &query.username).await?;
    let outcome = fetch_leaderboard(
        &state,
        &game_id,
        query.order.unwrap_or(SortOrder::Descending),
        query.top,
    )
    .await
    .map_err(|error| ApiError::internal(format!("failed to fetch leaderboard: {error:#}")))?;

    match outcome {
        LeaderboardOutcome::Ranked(leaderboard) => Ok(Json(LeaderboardResponse { leaderboard })),
        LeaderboardOutcome::GameNotFound => {
            Err(ApiError::not_found(format!("game {game_id} not found")))
        }
    }
}

async fn increase_ability_handler(
    State(state): State<AppState>,
    Json(request): Json<IncreaseAbilityRequest>,
) -> Result<Json<AbilityResponse>, ApiError> {
    if request.count < 1 {
        return Err(ApiError::bad_request("count must be a positive integer"));
    }

    let game_id = require_active_game(&state, &request.username).await?;
    let remaining = increase_ability(&state, &game_id, &request.username, request.count)
        .await
        .map_err(|error| {
            ApiError::internal(format!("failed to increase super-ability uses: {error:#}"))
        })?;
    Ok(Json(AbilityResponse { remaining }))
}

async fn decrease_ability_handler(
    State(state): State<AppState>,
    Json(request): Json<DecreaseAbilityRequest>,
) -> Result<Json<AbilityResponse>, ApiError> {
    let game_id = require_active_game(&state, &request.username).await?;
    let outcome = decrease_ability(&state, &game_id, &request.username)
        .await
        .map_err(|error| {
            ApiError::internal(format!("failed to decrease super-ability uses: {error:#}"))
        })?;

    match outcome {
        DecreaseOutcome::Used { remaining } => Ok(Json(AbilityResponse { remaining })),
        DecreaseOutcome::OutOfUses => Err(ApiError::conflict("out of super-ability uses")),
    }
}

async fn connections_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<ConnectionsResponse>, ApiError> {
    let connections = match state
        .store
        .set_fetch(CACHE_CONNECTION, &game_id)
        .await
        .map_err(|error| ApiError::internal(format!("failed to fetch connections: {error:#}")))?
    {
        Lookup::Found(connections) => {
            let mut connections: Vec<String> = connections.into_iter().collect();
            connections.sort();
            connections
        }
        Lookup::Absent => Vec::new(),
    };
    Ok(Json(ConnectionsResponse { connections }))
}

async fn set_score_handler(
    State(state): State<AppState>,
    Path((game_id, username)): Path<(String, String)>,
    Json(request): Json<SetScoreRequest>,
) -> StatusCode {
    set_score(&state, &game_id, &username, request.score).await;
    StatusCode::NO_CONTENT
}

/// Resolve the caller's active game from their session, mirroring the
/// active-game gate the request layer applies before score/move/ability
/// operations.
async fn require_active_game(state: &AppState, username: &str) -> Result<String, ApiError> {
    let session = load_session(state, username)
        .await
        .map_err(|error| ApiError::internal(format!("failed to load session: {error:#}")))?;
    session
        .current_game_id
        .ok_or_else(|| ApiError::conflict("you are not part of an active game"))
}

fn tiles_key(game_id: &str) -> String {
    format!("{game_id}-tiles")
}

fn ability_key(game_id: &str, username: &str) -> String {
    format!("{game_id}-{username}-SA")
}

async fn create_game(
    state: &AppState,
    name: &str,
    duration_seconds: u64,
    map_id: Option<&str>,
    is_ranked: bool,
) -> anyhow::Result<CreateOutcome> {
    let slug = slugify(name);
    let games = list_games(state).await?;
    if games.iter().any(|game| game.id == slug) {
        return Ok(CreateOutcome::AlreadyExists);
    }

    let map = match map_id {
        Some(id) => match state.maps.get(id) {
            Some(template) => template.clone(),
            None => {
                warn!(map_id = %id, "unknown map id in create request; using default template");
                state.maps.default_template().clone()
            }
        },
        None => state.maps.default_template().clone(),
    };

    let mut metadata = vec![
        ("name".to_string(), name.to_string()),
        ("map".to_string(), map.id.clone()),
        ("duration".to_string(), duration_seconds.to_string()),
    ];
    if is_ranked {
        metadata.push(("is_ranked".to_string(), "true".to_string()));
    }

    let list_entry = serde_json::to_string(&GameSummary {
        id: slug.clone(),
        name: name.to_string(),
    })
    .context("failed to encode game list entry")?;

    let mut obstacle_tiles = Vec::with_capacity(map.obstacles.len());
    for obstacle in &map.obstacles {
        obstacle_tiles.push((
            tile_key(obstacle.x, obstacle.y),
            serde_json::to_string(&Tile::obstacle()).context("failed to encode obstacle tile")?,
        ));
    }

    let ttl = Some(Duration::from_secs(duration_seconds));
    let game_tiles_key = tiles_key(&slug);
    let (metadata_write, list_add, tiles_write) = tokio::join!(
        state
            .store
            .dictionary_set_fields(CACHE_GAME, &slug, metadata, ttl),
        state
            .store
            .set_add_element(CACHE_GAME, GAME_LIST_KEY, list_entry),
        state
            .store
            .dictionary_set_fields(CACHE_GAME, &game_tiles_key, obstacle_tiles, ttl),
    );
    metadata_write?;
    list_add?;
    tiles_write?;

    info!(game_id = %slug, map_id = %map.id, duration_seconds, is_ranked, "created game session");
    Ok(CreateOutcome::Created { id: slug })
}

async fn list_games(state: &AppState) -> anyhow::Result<Vec<GameSummary>> {
    match state.store.set_fetch(CACHE_GAME, GAME_LIST_KEY).await? {
        Lookup::Found(entries) => {
            let mut games: Vec<GameSummary> = entries
                .iter()
                .filter_map(|raw| match serde_json::from_str(raw) {
                    Ok(game) => Some(game),
                    Err(error) => {
                        warn!(error = %error, "skipping undecodable game list entry");
                        None
                    }
                })
                .collect();
            games.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(games)
        }
        Lookup::Absent => Ok(Vec::new()),
    }
}

async fn load_session(state: &AppState, username: &str) -> anyhow::Result<UserSession> {
    match state
        .store
        .dictionary_get_fields(
            CACHE_USER,
            username,
            &["current_game_id", "sign_in_time", "connection_id"],
        )
        .await?
    {
        Lookup::Found(fields) => Ok(UserSession {
            username: username.to_string(),
            sign_in_time: fields.get("sign_in_time").cloned(),
            current_game_id: fields.get("current_game_id").cloned(),
            connection_id: fields.get("connection_id").cloned(),
        }),
        Lookup::Absent => {
            let sign_in_time = Utc::now().to_rfc3339();
            state
                .store
                .dictionary_set_fields(
                    CACHE_USER,
                    username,
                    vec![("sign_in_time".to_string(), sign_in_time.clone())],
                    None,
                )
                .await?;
            Ok(UserSession {
                username: username.to_string(),
                sign_in_time: Some(sign_in_time),
                current_game_id: None,
                connection_id: None,
            })
        }
    }
}

async fn join_game(
    state: &AppState,
    game_id: &str,
    username: &str,
) -> anyhow::Result<JoinOutcome> {
    let game = match state.store.dictionary_fetch(CACHE_GAME, game_id).await? {
        Lookup::Found(fields) => fields,
        Lookup::Absent => return Ok(JoinOutcome::GameNotFound),
    };

    let session = load_session(state, username).await?;
    if let Some(active_game) = session.current_game_id.as_deref() {
        if active_game == game_id {
            // Rejoin of the same game: free the previously held tile before
            // picking a new spawn, or the old position lingers as a ghost
            // player until the game expires.
            clear_player_tile(state, game_id, username).await?;
        } else {
            // A player is active in at most one game at a time.
            leave_game(state, active_game, username, Some(session.clone())).await?;
        }
    }

    let map_id = game
        .get("map")
        .map(String::as_str)
        .unwrap_or(DEFAULT_MAP_ID);
    let map = resolve_map(state, map_id);

    let game_tiles_key = tiles_key(game_id);
    let occupied: HashSet<String> = match state
        .store
        .dictionary_fetch(CACHE_GAME, &game_tiles_key)
        .await?
    {
        Lookup::Found(tiles) => tiles.into_keys().collect(),
        Lookup::Absent => HashSet::new(),
    };

    let Some((x, y)) = pick_spawn_tile(&map, &occupied) else {
        warn!(game_id = %game_id, username = %username, "no free spawn tile available");
        return Ok(JoinOutcome::MapFull);
    };
    let direction = if x < map.width / 2 {
        Direction::Right
    } else {
        Direction::Left
    };

    let tile = Tile::player(username, DEFAULT_AVATAR, direction);
    let tile_json = serde_json::to_string(&tile).context("failed to encode player tile")?;

    let joined_event = DomainEvent::PlayerJoined {
        game_id: game_id.to_string(),
        username: username.to_string(),
        connection_id: session.connection_id.clone(),
        message: format!("{username} joined the game"),
    };
    let moved_event = DomainEvent::PlayerMoved {
        game_id: game_id.to_string(),
        username: username.to_string(),
        connection_id: session.connection_id.clone(),
        x,
        y,
        avatar: DEFAULT_AVATAR.to_string(),
        direction,
    };

    let connection_id = session.connection_id.clone();
    let (player_add, score_init, connection_add, position_write, tile_write, joined_publish, moved_publish) = tokio::join!(
        state
            .store
            .set_add_element(CACHE_PLAYER, game_id, username.to_string()),
        initialize_leaderboard_score(state, game_id, username),
        async {
            match connection_id {
                Some(connection_id) => {
                    state
                        .store
                        .set_add_element(CACHE_CONNECTION, game_id, connection_id)
                        .await
                }
                None => Ok(()),
            }
        },
        state.store.dictionary_set_fields(
            CACHE_USER,
            username,
            vec![
                ("x".to_string(), x.to_string()),
                ("y".to_string(), y.to_string()),
                ("avatar".to_string(), DEFAULT_AVATAR.to_string()),
                ("direction".to_string(), direction.as_str().to_string()),
                ("current_game_id".to_string(), game_id.to_string()),
            ],
            None,
        ),
        state.store.dictionary_set_fields(
            CACHE_GAME,
            &game_tiles_key,
            vec![(tile_key(x, y), tile_json)],
            None,
        ),
        state.bus.publish_event(&joined_event),
        state.bus.publish_event(&moved_event),
    );
    log_batch_failures(
        "join",
        game_id,
        username,
        [
            ("player set add", player_add),
            ("leaderboard init", score_init),
            ("connection set add", connection_add),
            ("player position write", position_write),
            ("tile write", tile_write),
            ("player-joined publish", joined_publish),
            ("player-moved publish", moved_publish),
        ],
    );

    let players = match state.store.set_fetch(CACHE_PLAYER, game_id).await? {
        Lookup::Found(players) => {
            let mut players: Vec<String> = players.into_iter().collect();
            players.sort();
            players
        }
        Lookup::Absent => Vec::new(),
    };
    let messages = match state.store.list_fetch(CACHE_CHAT, game_id).await? {
        Lookup::Found(raw) => raw
            .iter()
            .filter_map(|message| serde_json::from_str::<ChatMessage>(message).ok())
            .collect(),
        Lookup::Absent => Vec::new(),
    };
    let name = game
        .get("name")
        .cloned()
        .unwrap_or_else(|| game_id.to_string());

    Ok(JoinOutcome::Joined(JoinGameResponse {
        name,
        username: username.to_string(),
        players,
        messages,
    }))
}

/// Seed the player's leaderboard entry on their first ever join of this game.
/// The existence check and the put are not atomic; a concurrent first join
/// can double-write the same seed value, which is harmless.
async fn initialize_leaderboard_score(
    state: &AppState,
    game_id: &str,
    username: &str,
) -> anyhow::Result<()> {
    if let Lookup::Absent = state
        .store
        .sorted_set_get_score(CACHE_LEADERBOARD, game_id, username)
        .await?
    {
        state
            .store
            .sorted_set_put_element(
                CACHE_LEADERBOARD,
                game_id,
                username,
                INITIAL_LEADERBOARD_SCORE,
            )
            .await?;
    }
    Ok(())
}

async fn leave_game(
    state: &AppState,
    game_id: &str,
    username: &str,
    session: Option<UserSession>,
) -> anyhow::Result<()> {
    let session = match session {
        Some(session) => session,
        None => load_session(state, username).await?,
    };

    let location = match state
        .store
        .dictionary_get_fields(CACHE_USER, username, &["x", "y"])
        .await?
    {
        Lookup::Found(fields) => match (fields.get("x"), fields.get("y")) {
            (Some(x), Some(y)) => Some(format!("{x},{y}")),
            _ => None,
        },
        Lookup::Absent => None,
    };

    let left_event = DomainEvent::PlayerLeft {
        game_id: game_id.to_string(),
        username: username.to_string(),
        connection_id: session.connection_id.clone(),
        message: format!("{username} left the game"),
    };

    let connection_id = session.connection_id.clone();
    let (player_remove, connection_remove, fields_remove, tile_remove, left_publish) = tokio::join!(
        state
            .store
            .set_remove_element(CACHE_PLAYER, game_id, username),
        async {
            match connection_id.as_deref() {
                Some(connection_id) => {
                    state
                        .store
                        .set_remove_element(CACHE_CONNECTION, game_id, connection_id)
                        .await
                }
                None => Ok(()),
            }
        },
        state.store.dictionary_remove_fields(
            CACHE_USER,
            username,
            &["current_game_id", "x", "y", "avatar", "direction"],
        ),
        async {
            match location.as_deref() {
                Some(coords) => {
                    state
                        .store
                        .dictionary_remove_fields(CACHE_GAME, &tiles_key(game_id), &[coords])
                        .await
                }
                None => Ok(()),
            }
        },
        state.bus.publish_event(&left_event),
    );
    log_batch_failures(
        "leave",
        game_id,
        username,
        [
            ("player set remove", player_remove),
            ("connection set remove", connection_remove),
            ("player field removal", fields_remove),
            ("tile removal", tile_remove),
            ("player-left publish", left_publish),
        ],
    );

    Ok(())
}

/// Remove the tile at the player's last recorded coordinates, if any.
async fn clear_player_tile(
    state: &AppState,
    game_id: &str,
    username: &str,
) -> anyhow::Result<()> {
    if let Lookup::Found(fields) = state
        .store
        .dictionary_get_fields(CACHE_USER, username, &["x", "y"])
        .await?
        && let (Some(x), Some(y)) = (fields.get("x"), fields.get("y"))
    {
        let coords = format!("{x},{y}");
        state
            .store
            .dictionary_remove_fields(CACHE_GAME, &tiles_key(game_id), &[coords.as_str()])
            .await?;
    }
    Ok(())
}

async fn move_player(
    state: &AppState,
    game_id: &str,
    username: &str,
    direction: Direction,
) -> anyhow::Result<MoveOutcome> {
    let map_id = match state
        .store
        .dictionary_get_fields(CACHE_GAME, game_id, &["map"])
        .await?
    {
        Lookup::Found(fields) => fields
            .get("map")
            .cloned()
            .unwrap_or_else(|| DEFAULT_MAP_ID.to_string()),
        Lookup::Absent => return Ok(MoveOutcome::GameNotFound),
    };
    let map = resolve_map(state, &map_id);

    let location = match state
        .store
        .dictionary_get_fields(CACHE_USER, username, &["x", "y", "avatar"])
        .await?
    {
        Lookup::Found(fields) => fields,
        Lookup::Absent => return Ok(MoveOutcome::NotInGame),
    };
    let (Some(current_x), Some(current_y)) = (
        coordinate_field(&location, "x"),
        coordinate_field(&location, "y"),
    ) else {
        return Ok(MoveOutcome::NotInGame);
    };
    let avatar = location
        .get("avatar")
        .cloned()
        .unwrap_or_else(|| DEFAULT_AVATAR.to_string());

    let (x, y) = step_within_bounds(current_x, current_y, direction, &map);
    let game_tiles_key = tiles_key(game_id);
    let candidate_key = tile_key(x, y);
    let destination_free = match state
        .store
        .dictionary_get_fields(CACHE_GAME, &game_tiles_key, &[candidate_key.as_str()])
        .await?
    {
        Lookup::Found(fields) => !fields.contains_key(&candidate_key),
        Lookup::Absent => true,
    };

    let (final_x, final_y) = if destination_free {
        let tile = Tile::player(username, avatar.clone(), direction);
        let tile_json = serde_json::to_string(&tile).context("failed to encode player tile")?;
        let old_key = tile_key(current_x, current_y);
        let old_fields = [old_key.as_str()];
        let (tile_clear, tile_write, position_write) = tokio::join!(
            state
                .store
                .dictionary_remove_fields(CACHE_GAME, &game_tiles_key, &old_fields),
            state.store.dictionary_set_fields(
                CACHE_GAME,
                &game_tiles_key,
                vec![(candidate_key.clone(), tile_json)],
                None,
            ),
            state.store.dictionary_set_fields(
                CACHE_USER,
                username,
                vec![
                    ("x".to_string(), x.to_string()),
                    ("y".to_string(), y.to_string()),
                    ("direction".to_string(), direction.as_str().to_string()),
                ],
                None,
            ),
        );
        log_batch_failures(
            "move",
            game_id,
            username,
            [
                ("tile clear", tile_clear),
                ("tile write", tile_write),
                ("player position write", position_write),
            ],
        );
        (x, y)
    } else {
        // Blocked: the player stays put but still turns to face the
        // requested direction.
        (current_x, current_y)
    };

    let moved_event = DomainEvent::PlayerMoved {
        game_id: game_id.to_string(),
        username: username.to_string(),
        connection_id: None,
        x: final_x,
        y: final_y,
        avatar,
        direction,
    };
    if let Err(error) = state.bus.publish_event(&moved_event).await {
        warn!(game_id = %game_id, username = %username, error = %error, "failed to publish player-moved event");
    }

    Ok(MoveOutcome::Moved(MoveResponse {
        x: final_x,
        y: final_y,
        direction,
    }))
}

async fn update_score(
    state: &AppState,
    game_id: &str,
    username: &str,
    delta: f64,
) -> anyhow::Result<f64> {
    let score = state
        .store
        .sorted_set_increment(CACHE_LEADERBOARD, game_id, username, delta)
        .await?;

    let event = DomainEvent::PointsUpdated {
        game_id: game_id.to_string(),
        username: username.to_string(),
        connection_id: None,
        score,
    };
    if let Err(error) = state.bus.publish_event(&event).await {
        warn!(game_id = %game_id, username = %username, error = %error, "failed to publish points-updated event");
    }

    Ok(score)
}

/// Corrective overwrite of a stored score. Storage failures are logged, not
/// raised.
async fn set_score(state: &AppState, game_id: &str, username: &str, score: f64) {
    if let Err(error) = state
        .store
        .sorted_set_put_element(CACHE_LEADERBOARD, game_id, username, score)
        .await
    {
        warn!(
            cache = CACHE_LEADERBOARD,
            key = %game_id,
            username = %username,
            error = %error,
            "failed to overwrite leaderboard score"
        );
    }
}

async fn fetch_leaderboard(
    state: &AppState,
    game_id: &str,
    order: SortOrder,
    top: Option<usize>,
) -> anyhow::Result<LeaderboardOutcome> {
    let entries = match state
        .store
        .sorted_set_fetch_by_rank(CACHE_LEADERBOARD, game_id, order)
        .await?
    {
        Lookup::Found(entries) => entries,
        Lookup::Absent => return Ok(LeaderboardOutcome::GameNotFound),
    };

    let mut rows: Vec<LeaderboardRow> = entries
        .into_iter()
        .enumerate()
        .map(|(index, (username, score))| LeaderboardRow {
            rank: index as u32 + 1,
            username,
            score: score.floor() as i64,
        })
        .collect();
    if let Some(top) = top {
        rows.truncate(top);
    }
    Ok(LeaderboardOutcome::Ranked(rows))
}

async fn increase_ability(
    state: &AppState,
    game_id: &str,
    username: &str,
    count: i64,
) -> anyhow::Result<i64> {
    let counter_key = ability_key(game_id, username);
    let raw = state.store.increment(CACHE_PLAYER, &counter_key, count).await?;

    let mut remaining = raw;
    let mut effective = count;
    if raw > MAX_SUPER_ABILITY_USES {
        // Clamp the overshoot back down; only the portion of the increment
        // that fit below the cap counts.
        state
            .store
            .set_counter(CACHE_PLAYER, &counter_key, MAX_SUPER_ABILITY_USES)
            .await?;
        effective = count - (raw - MAX_SUPER_ABILITY_USES);
        remaining = MAX_SUPER_ABILITY_USES;
    }

    if effective > 0 {
        update_score(state, game_id, username, effective as f64 / 10.0).await?;
    }

    Ok(remaining)
}

async fn decrease_ability(
    state: &AppState,
    game_id: &str,
    username: &str,
) -> anyhow::Result<DecreaseOutcome> {
    let counter_key = ability_key(game_id, username);
    let raw = state.store.increment(CACHE_PLAYER, &counter_key, -1).await?;
    if raw < 0 {
        // The counter must never rest below zero; put the use back.
        state.store.increment(CACHE_PLAYER, &counter_key, 1).await?;
        return Ok(DecreaseOutcome::OutOfUses);
    }

    update_score(state, game_id, username, SUPER_ABILITY_USE_PENALTY).await?;
    Ok(DecreaseOutcome::Used { remaining: raw })
}

fn resolve_map(state: &AppState, map_id: &str) -> MapTemplate {
    match state.maps.get(map_id) {
        Some(template) => template.clone(),
        None => {
            warn!(map_id = %map_id, "stored game references unknown map; using default template");
            state.maps.default_template().clone()
        }
    }
}

/// Sample a free spawn coordinate. Attempts are capped so a crowded map
/// surfaces as an explicit map-full outcome instead of an unbounded loop.
fn pick_spawn_tile(map: &MapTemplate, occupied: &HashSet<String>) -> Option<(u32, u32)> {
    let capacity = (map.width as usize) * (map.height as usize);
    if capacity == 0 || occupied.len() >= capacity {
        return None;
    }

    let mut rng = rand::rng();
    for _ in 0..capacity.saturating_mul(4) {
        let x = rng.random_range(0..map.width);
        let y = rng.random_range(0..map.height);
        if !occupied.contains(&tile_key(x, y)) {
            return Some((x, y));
        }
    }
    None
}

/// Candidate coordinate one step in `direction`, clamped to the grid; moving
/// into a boundary is a no-op for that axis.
fn step_within_bounds(x: u32, y: u32, direction: Direction, map: &MapTemplate) -> (u32, u32) {
    match direction {
        Direction::Up => (x, y.saturating_sub(1)),
        Direction::Down => (x, (y + 1).min(map.height - 1)),
        Direction::Left => (x.saturating_sub(1), y),
        Direction::Right => ((x + 1).min(map.width - 1), y),
    }
}

fn coordinate_field(fields: &HashMap<String, String>, field: &str) -> Option<u32> {
    fields.get(field).and_then(|value| value.parse().ok())
}

fn log_batch_failures(
    operation: &str,
    game_id: &str,
    username: &str,
    results: impl IntoIterator<Item = (&'static str, anyhow::Result<()>)>,
) {
    for (sub_operation, result) in results {
        if let Err(error) = result {
            warn!(
                operation,
                sub_operation,
                game_id = %game_id,
                username = %username,
                error = %error,
                "best-effort sub-operation failed"
            );
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_common::TileKind;
    use std::sync::Mutex;

    struct RecordingEventPublisher {
        events: Mutex<Vec<DomainEvent>>,
    }

    impl RecordingEventPublisher {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        fn events(&self) -> Vec<DomainEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingEventPublisher {
        async fn publish_event(&self, event: &DomainEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn test_state() -> (AppState, Arc<RecordingEventPublisher>) {
        let recorder = Arc::new(RecordingEventPublisher::new());
        let state = AppState {
            store: Arc::new(InMemoryKvStore::without_expiry()),
            bus: recorder.clone(),
            maps: Arc::new(MapCatalog::built_in()),
        };
        (state, recorder)
    }

    fn test_state_with_maps(maps: MapCatalog) -> (AppState, Arc<RecordingEventPublisher>) {
        let recorder = Arc::new(RecordingEventPublisher::new());
        let state = AppState {
            store: Arc::new(InMemoryKvStore::without_expiry()),
            bus: recorder.clone(),
            maps: Arc::new(maps),
        };
        (state, recorder)
    }

    fn single_cell_catalog() -> MapCatalog {
        let mut maps = MapCatalog::built_in();
        maps.insert(MapTemplate {
            id: "cell".to_string(),
            width: 1,
            height: 1,
            obstacles: Vec::new(),
        });
        maps
    }

    async fn seed_player(state: &AppState, game_id: &str, username: &str, x: u32, y: u32) {
        let tile = Tile::player(username, DEFAULT_AVATAR, Direction::Right);
        state
            .store
            .dictionary_set_fields(
                CACHE_USER,
                username,
                vec![
                    ("x".to_string(), x.to_string()),
                    ("y".to_string(), y.to_string()),
                    ("avatar".to_string(), DEFAULT_AVATAR.to_string()),
                    ("direction".to_string(), "right".to_string()),
                    ("current_game_id".to_string(), game_id.to_string()),
                ],
                None,
            )
            .await
            .unwrap();
        state
            .store
            .dictionary_set_fields(
                CACHE_GAME,
                &tiles_key(game_id),
                vec![(tile_key(x, y), serde_json::to_string(&tile).unwrap())],
                None,
            )
            .await
            .unwrap();
        state
            .store
            .set_add_element(CACHE_PLAYER, game_id, username.to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_game_registers_metadata_list_entry_and_obstacles() {
        let (state, _) = test_state();

        let outcome = create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CreateOutcome::Created {
                id: "acorn-arena".to_string()
            }
        );

        let metadata = match state
            .store
            .dictionary_fetch(CACHE_GAME, "acorn-arena")
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => panic!("metadata missing"),
        };
        assert_eq!(metadata.get("name").unwrap(), "Acorn Arena");
        assert_eq!(metadata.get("map").unwrap(), "oak-city");
        assert_eq!(metadata.get("duration").unwrap(), "600");
        assert!(!metadata.contains_key("is_ranked"));

        let tiles = match state
            .store
            .dictionary_fetch(CACHE_GAME, &tiles_key("acorn-arena"))
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => panic!("tiles missing"),
        };
        assert_eq!(tiles.len(), 3);
        let obstacle: Tile = serde_json::from_str(tiles.get("4,4").unwrap()).unwrap();
        assert_eq!(obstacle.kind, TileKind::Obstacle);

        let games = list_games(&state).await.unwrap();
        assert_eq!(
            games,
            vec![GameSummary {
                id: "acorn-arena".to_string(),
                name: "Acorn Arena".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn create_game_marks_ranked_sessions() {
        let (state, _) = test_state();
        create_game(&state, "Ranked Run", 300, None, true)
            .await
            .unwrap();

        let metadata = match state
            .store
            .dictionary_fetch(CACHE_GAME, "ranked-run")
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => panic!("metadata missing"),
        };
        assert_eq!(metadata.get("is_ranked").unwrap(), "true");
    }

    #[tokio::test]
    async fn create_game_rejects_duplicate_slug() {
        let (state, _) = test_state();
        create_game(&state, "Maple Run", 300, None, false)
            .await
            .unwrap();

        let outcome = create_game(&state, "Maple Run!", 900, None, false)
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::AlreadyExists);
        assert_eq!(list_games(&state).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_game_falls_back_to_default_map_for_unknown_id() {
        let (state, _) = test_state();
        create_game(&state, "Lost Woods", 300, Some("no-such-map"), false)
            .await
            .unwrap();

        let metadata = match state
            .store
            .dictionary_fetch(CACHE_GAME, "lost-woods")
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => panic!("metadata missing"),
        };
        assert_eq!(metadata.get("map").unwrap(), DEFAULT_MAP_ID);
    }

    #[tokio::test]
    async fn join_unknown_game_reports_not_found() {
        let (state, recorder) = test_state();
        let outcome = join_game(&state, "nowhere", "pip").await.unwrap();
        assert!(matches!(outcome, JoinOutcome::GameNotFound));
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn join_places_player_and_publishes_joined_and_moved() {
        let (state, recorder) = test_state();
        create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();

        let outcome = join_game(&state, "acorn-arena", "pip").await.unwrap();
        let response = match outcome {
            JoinOutcome::Joined(response) => response,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(response.name, "Acorn Arena");
        assert_eq!(response.username, "pip");
        assert_eq!(response.players, vec!["pip".to_string()]);
        assert!(response.messages.is_empty());

        let players = match state
            .store
            .set_fetch(CACHE_PLAYER, "acorn-arena")
            .await
            .unwrap()
        {
            Lookup::Found(players) => players,
            Lookup::Absent => panic!("player set missing"),
        };
        assert!(players.contains("pip"));

        let session = load_session(&state, "pip").await.unwrap();
        assert_eq!(session.current_game_id.as_deref(), Some("acorn-arena"));

        let score = match state
            .store
            .sorted_set_get_score(CACHE_LEADERBOARD, "acorn-arena", "pip")
            .await
            .unwrap()
        {
            Lookup::Found(score) => score,
            Lookup::Absent => panic!("leaderboard seed missing"),
        };
        assert_eq!(score, INITIAL_LEADERBOARD_SCORE);

        let user = match state
            .store
            .dictionary_get_fields(CACHE_USER, "pip", &["x", "y"])
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => panic!("user record missing"),
        };
        let x: u32 = user.get("x").unwrap().parse().unwrap();
        let y: u32 = user.get("y").unwrap().parse().unwrap();
        assert!(x < 10 && y < 10);

        let tiles = match state
            .store
            .dictionary_fetch(CACHE_GAME, &tiles_key("acorn-arena"))
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => panic!("tiles missing"),
        };
        let tile: Tile = serde_json::from_str(tiles.get(&tile_key(x, y)).unwrap()).unwrap();
        assert_eq!(tile.kind, TileKind::Player);
        assert_eq!(tile.username.as_deref(), Some("pip"));

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            DomainEvent::PlayerJoined {
                game_id,
                username,
                message,
                ..
            } => {
                assert_eq!(game_id, "acorn-arena");
                assert_eq!(username, "pip");
                assert_eq!(message, "pip joined the game");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(&events[1], DomainEvent::PlayerMoved { .. }));
    }

    #[tokio::test]
    async fn join_does_not_disturb_preexisting_leaderboard_score() {
        let (state, _) = test_state();
        create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();
        state
            .store
            .sorted_set_put_element(CACHE_LEADERBOARD, "acorn-arena", "pip", 4.2)
            .await
            .unwrap();

        join_game(&state, "acorn-arena", "pip").await.unwrap();

        let score = match state
            .store
            .sorted_set_get_score(CACHE_LEADERBOARD, "acorn-arena", "pip")
            .await
            .unwrap()
        {
            Lookup::Found(score) => score,
            Lookup::Absent => panic!("leaderboard entry missing"),
        };
        assert_eq!(score, 4.2);
    }

    #[tokio::test]
    async fn join_returns_chat_history_in_order() {
        let (state, _) = test_state();
        create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();
        for text in ["hello", "anyone here?"] {
            let message = ChatMessage {
                username: "nutkin".to_string(),
                message: text.to_string(),
                time: Utc::now(),
            };
            state
                .store
                .list_push_back(
                    CACHE_CHAT,
                    "acorn-arena",
                    serde_json::to_string(&message).unwrap(),
                )
                .await
                .unwrap();
        }

        let outcome = join_game(&state, "acorn-arena", "pip").await.unwrap();
        let response = match outcome {
            JoinOutcome::Joined(response) => response,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let texts: Vec<&str> = response
            .messages
            .iter()
            .map(|message| message.message.as_str())
            .collect();
        assert_eq!(texts, vec!["hello", "anyone here?"]);
    }

    #[tokio::test]
    async fn join_moves_player_out_of_their_previous_game() {
        let (state, recorder) = test_state();
        create_game(&state, "First Game", 600, None, false)
            .await
            .unwrap();
        create_game(&state, "Second Game", 600, None, false)
            .await
            .unwrap();

        join_game(&state, "first-game", "pip").await.unwrap();
        join_game(&state, "second-game", "pip").await.unwrap();

        let first_players = match state
            .store
            .set_fetch(CACHE_PLAYER, "first-game")
            .await
            .unwrap()
        {
            Lookup::Found(players) => players,
            Lookup::Absent => HashSet::new(),
        };
        assert!(!first_players.contains("pip"));

        let session = load_session(&state, "pip").await.unwrap();
        assert_eq!(session.current_game_id.as_deref(), Some("second-game"));

        let names: Vec<&str> = recorder
            .events()
            .iter()
            .map(|event| event.name())
            .collect::<Vec<_>>()
            .into_iter()
            .collect();
        assert_eq!(
            names,
            vec![
                "player-joined",
                "player-moved",
                "player-left",
                "player-joined",
                "player-moved"
            ]
        );
    }

    #[tokio::test]
    async fn rejoining_the_same_game_does_not_leave_first() {
        let (state, recorder) = test_state();
        create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();
        join_game(&state, "acorn-arena", "pip").await.unwrap();
        join_game(&state, "acorn-arena", "pip").await.unwrap();

        assert!(
            !recorder
                .events()
                .iter()
                .any(|event| event.name() == "player-left")
        );
    }

    #[tokio::test]
    async fn rejoining_the_same_game_frees_the_old_tile() {
        let (state, _) = test_state();
        create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();

        join_game(&state, "acorn-arena", "pip").await.unwrap();
        join_game(&state, "acorn-arena", "pip").await.unwrap();

        let tiles = match state
            .store
            .dictionary_fetch(CACHE_GAME, &tiles_key("acorn-arena"))
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => panic!("tiles missing"),
        };
        let pip_tiles = tiles
            .values()
            .filter(|raw| raw.contains("pip"))
            .count();
        assert_eq!(pip_tiles, 1);

        // The one remaining tile is at the player's recorded coordinates.
        let user = match state
            .store
            .dictionary_get_fields(CACHE_USER, "pip", &["x", "y"])
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => panic!("user record missing"),
        };
        let current = format!("{},{}", user.get("x").unwrap(), user.get("y").unwrap());
        assert!(tiles.contains_key(&current));
    }

    #[tokio::test]
    async fn join_reports_map_full_when_no_tile_is_free() {
        let (state, _) = test_state_with_maps(single_cell_catalog());
        create_game(&state, "Tiny", 600, Some("cell"), false)
            .await
            .unwrap();

        join_game(&state, "tiny", "pip").await.unwrap();
        let outcome = join_game(&state, "tiny", "nutkin").await.unwrap();
        assert!(matches!(outcome, JoinOutcome::MapFull));

        let players = match state.store.set_fetch(CACHE_PLAYER, "tiny").await.unwrap() {
            Lookup::Found(players) => players,
            Lookup::Absent => HashSet::new(),
        };
        assert!(!players.contains("nutkin"));
    }

    #[tokio::test]
    async fn leave_clears_membership_tile_and_session() {
        let (state, recorder) = test_state();
        create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();
        join_game(&state, "acorn-arena", "pip").await.unwrap();

        let user = match state
            .store
            .dictionary_get_fields(CACHE_USER, "pip", &["x", "y"])
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => panic!("user record missing"),
        };
        let occupied = format!("{},{}", user.get("x").unwrap(), user.get("y").unwrap());

        leave_game(&state, "acorn-arena", "pip", None).await.unwrap();

        let players = match state
            .store
            .set_fetch(CACHE_PLAYER, "acorn-arena")
            .await
            .unwrap()
        {
            Lookup::Found(players) => players,
            Lookup::Absent => HashSet::new(),
        };
        assert!(!players.contains("pip"));

        let tiles = match state
            .store
            .dictionary_fetch(CACHE_GAME, &tiles_key("acorn-arena"))
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => HashMap::new(),
        };
        assert!(!tiles.contains_key(&occupied));

        let session = load_session(&state, "pip").await.unwrap();
        assert!(session.current_game_id.is_none());
        assert!(session.sign_in_time.is_some());

        assert_eq!(
            recorder.events().last().map(|event| event.name()),
            Some("player-left")
        );
    }

    #[tokio::test]
    async fn move_into_free_tile_updates_tile_and_user_record() {
        let (state, recorder) = test_state();
        create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();
        seed_player(&state, "acorn-arena", "pip", 2, 2).await;

        let outcome = move_player(&state, "acorn-arena", "pip", Direction::Down)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MoveOutcome::Moved(MoveResponse {
                x: 2,
                y: 3,
                direction: Direction::Down
            })
        );

        let tiles = match state
            .store
            .dictionary_fetch(CACHE_GAME, &tiles_key("acorn-arena"))
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => panic!("tiles missing"),
        };
        assert!(!tiles.contains_key("2,2"));
        let tile: Tile = serde_json::from_str(tiles.get("2,3").unwrap()).unwrap();
        assert_eq!(tile.username.as_deref(), Some("pip"));
        assert_eq!(tile.direction, Some(Direction::Down));

        let user = match state
            .store
            .dictionary_get_fields(CACHE_USER, "pip", &["x", "y", "direction"])
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => panic!("user record missing"),
        };
        assert_eq!(user.get("x").unwrap(), "2");
        assert_eq!(user.get("y").unwrap(), "3");
        assert_eq!(user.get("direction").unwrap(), "down");

        match recorder.events().last() {
            Some(DomainEvent::PlayerMoved { x, y, direction, .. }) => {
                assert_eq!((*x, *y), (2, 3));
                assert_eq!(*direction, Direction::Down);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn move_into_occupied_tile_keeps_position_and_turns() {
        let (state, recorder) = test_state();
        create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();
        seed_player(&state, "acorn-arena", "pip", 3, 4).await;
        // Obstacle from the oak-city template sits at (4,4).
        let outcome = move_player(&state, "acorn-arena", "pip", Direction::Right)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MoveOutcome::Moved(MoveResponse {
                x: 3,
                y: 4,
                direction: Direction::Right
            })
        );

        let tiles = match state
            .store
            .dictionary_fetch(CACHE_GAME, &tiles_key("acorn-arena"))
            .await
            .unwrap()
        {
            Lookup::Found(fields) => fields,
            Lookup::Absent => panic!("tiles missing"),
        };
        assert!(tiles.contains_key("3,4"));
        let blocked: Tile = serde_json::from_str(tiles.get("4,4").unwrap()).unwrap();
        assert_eq!(blocked.kind, TileKind::Obstacle);

        match recorder.events().last() {
            Some(DomainEvent::PlayerMoved { x, y, .. }) => assert_eq!((*x, *y), (3, 4)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn move_clamps_at_every_grid_edge() {
        let (state, _) = test_state();
        create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();
        seed_player(&state, "acorn-arena", "pip", 0, 0).await;

        let up = move_player(&state, "acorn-arena", "pip", Direction::Up)
            .await
            .unwrap();
        assert_eq!(
            up,
            MoveOutcome::Moved(MoveResponse {
                x: 0,
                y: 0,
                direction: Direction::Up
            })
        );
        let left = move_player(&state, "acorn-arena", "pip", Direction::Left)
            .await
            .unwrap();
        assert_eq!(
            left,
            MoveOutcome::Moved(MoveResponse {
                x: 0,
                y: 0,
                direction: Direction::Left
            })
        );

        seed_player(&state, "acorn-arena", "nutkin", 9, 9).await;
        let down = move_player(&state, "acorn-arena", "nutkin", Direction::Down)
            .await
            .unwrap();
        assert_eq!(
            down,
            MoveOutcome::Moved(MoveResponse {
                x: 9,
                y: 9,
                direction: Direction::Down
            })
        );
        let right = move_player(&state, "acorn-arena", "nutkin", Direction::Right)
            .await
            .unwrap();
        assert_eq!(
            right,
            MoveOutcome::Moved(MoveResponse {
                x: 9,
                y: 9,
                direction: Direction::Right
            })
        );
    }

    #[tokio::test]
    async fn move_in_unknown_game_or_without_position_is_rejected() {
        let (state, _) = test_state();
        assert_eq!(
            move_player(&state, "nowhere", "pip", Direction::Up)
                .await
                .unwrap(),
            MoveOutcome::GameNotFound
        );

        create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();
        assert_eq!(
            move_player(&state, "acorn-arena", "pip", Direction::Up)
                .await
                .unwrap(),
            MoveOutcome::NotInGame
        );
    }

    #[tokio::test]
    async fn update_score_accumulates_and_publishes() {
        let (state, recorder) = test_state();
        create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();
        join_game(&state, "acorn-arena", "pip").await.unwrap();

        let score = update_score(&state, "acorn-arena", "pip", 0.3)
            .await
            .unwrap();
        assert_eq!(score, 0.6);

        match recorder.events().last() {
            Some(DomainEvent::PointsUpdated {
                username, score, ..
            }) => {
                assert_eq!(username, "pip");
                assert_eq!(*score, 0.6);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sequential_score_updates_accumulate_from_zero() {
        let (state, _) = test_state();
        let first = update_score(&state, "oak-city", "alice", 0.3).await.unwrap();
        let second = update_score(&state, "oak-city", "alice", 0.3).await.unwrap();
        assert_eq!(first, 0.3);
        assert_eq!(second, 0.6);
    }

    #[tokio::test]
    async fn set_score_overwrites_existing_entry() {
        let (state, _) = test_state();
        state
            .store
            .sorted_set_put_element(CACHE_LEADERBOARD, "acorn-arena", "pip", 7.5)
            .await
            .unwrap();

        set_score(&state, "acorn-arena", "pip", 2.0).await;

        let score = match state
            .store
            .sorted_set_get_score(CACHE_LEADERBOARD, "acorn-arena", "pip")
            .await
            .unwrap()
        {
            Lookup::Found(score) => score,
            Lookup::Absent => panic!("leaderboard entry missing"),
        };
        assert_eq!(score, 2.0);
    }

    #[tokio::test]
    async fn leaderboard_ranks_floors_and_truncates() {
        let (state, _) = test_state();
        for (username, score) in [("pip", 4.7), ("nutkin", 9.2), ("hazel", 1.1)] {
            state
                .store
                .sorted_set_put_element(CACHE_LEADERBOARD, "acorn-arena", username, score)
                .await
                .unwrap();
        }

        let outcome =
            fetch_leaderboard(&state, "acorn-arena", SortOrder::Descending, None)
                .await
                .unwrap();
        let rows = match outcome {
            LeaderboardOutcome::Ranked(rows) => rows,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(
            rows,
            vec![
                LeaderboardRow {
                    rank: 1,
                    username: "nutkin".to_string(),
                    score: 9
                },
                LeaderboardRow {
                    rank: 2,
                    username: "pip".to_string(),
                    score: 4
                },
                LeaderboardRow {
                    rank: 3,
                    username: "hazel".to_string(),
                    score: 1
                },
            ]
        );

        let top = fetch_leaderboard(&state, "acorn-arena", SortOrder::Ascending, Some(1))
            .await
            .unwrap();
        let rows = match top {
            LeaderboardOutcome::Ranked(rows) => rows,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].username, "hazel");
    }

    #[tokio::test]
    async fn leaderboard_breaks_ties_by_username() {
        let (state, _) = test_state();
        for username in ["nutkin", "pip", "hazel"] {
            state
                .store
                .sorted_set_put_element(CACHE_LEADERBOARD, "acorn-arena", username, 3.0)
                .await
                .unwrap();
        }

        let outcome =
            fetch_leaderboard(&state, "acorn-arena", SortOrder::Descending, None)
                .await
                .unwrap();
        let rows = match outcome {
            LeaderboardOutcome::Ranked(rows) => rows,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let usernames: Vec<&str> = rows.iter().map(|row| row.username.as_str()).collect();
        assert_eq!(usernames, vec!["hazel", "nutkin", "pip"]);
    }

    #[tokio::test]
    async fn leaderboard_for_unknown_game_reports_not_found() {
        let (state, _) = test_state();
        assert_eq!(
            fetch_leaderboard(&state, "nowhere", SortOrder::Descending, None)
                .await
                .unwrap(),
            LeaderboardOutcome::GameNotFound
        );
    }

    #[tokio::test]
    async fn increase_ability_awards_bonus_points() {
        let (state, _) = test_state();
        let remaining = increase_ability(&state, "acorn-arena", "pip", 3)
            .await
            .unwrap();
        assert_eq!(remaining, 3);

        let score = match state
            .store
            .sorted_set_get_score(CACHE_LEADERBOARD, "acorn-arena", "pip")
            .await
            .unwrap()
        {
            Lookup::Found(score) => score,
            Lookup::Absent => panic!("leaderboard entry missing"),
        };
        assert_eq!(score, 0.3);
    }

    #[tokio::test]
    async fn increase_ability_clamps_at_the_cap() {
        let (state, _) = test_state();
        let remaining = increase_ability(&state, "acorn-arena", "pip", 10)
            .await
            .unwrap();
        assert_eq!(remaining, MAX_SUPER_ABILITY_USES);

        let counter = state
            .store
            .increment(CACHE_PLAYER, &ability_key("acorn-arena", "pip"), 0)
            .await
            .unwrap();
        assert_eq!(counter, MAX_SUPER_ABILITY_USES);

        // Only the five uses that fit below the cap earn bonus points.
        let score = match state
            .store
            .sorted_set_get_score(CACHE_LEADERBOARD, "acorn-arena", "pip")
            .await
            .unwrap()
        {
            Lookup::Found(score) => score,
            Lookup::Absent => panic!("leaderboard entry missing"),
        };
        assert_eq!(score, 0.5);
    }

    #[tokio::test]
    async fn increase_ability_at_cap_awards_nothing() {
        let (state, recorder) = test_state();
        increase_ability(&state, "acorn-arena", "pip", 5)
            .await
            .unwrap();
        let events_before = recorder.events().len();

        let remaining = increase_ability(&state, "acorn-arena", "pip", 1)
            .await
            .unwrap();
        assert_eq!(remaining, MAX_SUPER_ABILITY_USES);
        assert_eq!(recorder.events().len(), events_before);
    }

    #[tokio::test]
    async fn decrease_ability_spends_a_use_and_deducts_points() {
        let (state, _) = test_state();
        increase_ability(&state, "acorn-arena", "pip", 2)
            .await
            .unwrap();

        let outcome = decrease_ability(&state, "acorn-arena", "pip").await.unwrap();
        assert_eq!(outcome, DecreaseOutcome::Used { remaining: 1 });

        let score = match state
            .store
            .sorted_set_get_score(CACHE_LEADERBOARD, "acorn-arena", "pip")
            .await
            .unwrap()
        {
            Lookup::Found(score) => score,
            Lookup::Absent => panic!("leaderboard entry missing"),
        };
        // 2 banked uses earned 0.2; spending one costs 0.1.
        assert!((score - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn decrease_ability_with_empty_counter_is_rejected() {
        let (state, recorder) = test_state();
        let outcome = decrease_ability(&state, "acorn-arena", "pip").await.unwrap();
        assert_eq!(outcome, DecreaseOutcome::OutOfUses);

        let counter = state
            .store
            .increment(CACHE_PLAYER, &ability_key("acorn-arena", "pip"), 0)
            .await
            .unwrap();
        assert_eq!(counter, 0);
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn first_session_load_stamps_sign_in_time() {
        let (state, _) = test_state();
        let first = load_session(&state, "pip").await.unwrap();
        assert!(first.sign_in_time.is_some());
        assert!(first.current_game_id.is_none());

        let second = load_session(&state, "pip").await.unwrap();
        assert_eq!(second.sign_in_time, first.sign_in_time);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let store = InMemoryKvStore::new(Duration::ZERO);
        store
            .dictionary_set_fields(
                CACHE_GAME,
                "fleeting",
                vec![("name".to_string(), "Fleeting".to_string())],
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            store.dictionary_fetch(CACHE_GAME, "fleeting").await.unwrap(),
            Lookup::Absent
        );

        store
            .set_add_element(CACHE_GAME, GAME_LIST_KEY, "entry".to_string())
            .await
            .unwrap();
        assert_eq!(
            store.set_fetch(CACHE_GAME, GAME_LIST_KEY).await.unwrap(),
            Lookup::Absent
        );
    }

    #[tokio::test]
    async fn dictionary_ttl_overrides_default() {
        let store = InMemoryKvStore::new(Duration::ZERO);
        store
            .dictionary_set_fields(
                CACHE_GAME,
                "lasting",
                vec![("name".to_string(), "Lasting".to_string())],
                Some(Duration::from_secs(3600)),
            )
            .await
            .unwrap();
        assert!(matches!(
            store.dictionary_fetch(CACHE_GAME, "lasting").await.unwrap(),
            Lookup::Found(_)
        ));
    }

    #[tokio::test]
    async fn pick_spawn_tile_avoids_occupied_and_reports_full() {
        let map = MapTemplate {
            id: "cell".to_string(),
            width: 1,
            height: 1,
            obstacles: Vec::new(),
        };
        assert_eq!(pick_spawn_tile(&map, &HashSet::new()), Some((0, 0)));

        let mut occupied = HashSet::new();
        occupied.insert("0,0".to_string());
        assert_eq!(pick_spawn_tile(&map, &occupied), None);
    }

    #[tokio::test]
    async fn connection_set_tracks_join_and_leave() {
        let (state, _) = test_state();
        create_game(&state, "Acorn Arena", 600, None, false)
            .await
            .unwrap();
        state
            .store
            .dictionary_set_fields(
                CACHE_USER,
                "pip",
                vec![("connection_id".to_string(), "conn-1".to_string())],
                None,
            )
            .await
            .unwrap();

        join_game(&state, "acorn-arena", "pip").await.unwrap();
        let connections = match state
            .store
            .set_fetch(CACHE_CONNECTION, "acorn-arena")
            .await
            .unwrap()
        {
            Lookup::Found(connections) => connections,
            Lookup::Absent => panic!("connection set missing"),
        };
        assert!(connections.contains("conn-1"));

        leave_game(&state, "acorn-arena", "pip", None).await.unwrap();
        let connections = match state
            .store
            .set_fetch(CACHE_CONNECTION, "acorn-arena")
            .await
            .unwrap()
        {
            Lookup::Found(connections) => connections,
            Lookup::Absent => HashSet::new(),
        };
        assert!(!connections.contains("conn-1"));
    }
}
