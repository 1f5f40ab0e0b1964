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

use std::{collections::HashMap, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on stored super-ability uses per (game, player).
pub const MAX_SUPER_ABILITY_USES: i64 = 5;
/// Score a player's leaderboard entry is seeded with on their first join.
pub const INITIAL_LEADERBOARD_SCORE: f64 = 0.3;
/// Leaderboard penalty applied when a super-ability use is spent.
pub const SUPER_ABILITY_USE_PENALTY: f64 = -0.1;
pub const DEFAULT_AVATAR: &str = "blue-squirrel";
pub const DEFAULT_MAP_ID: &str = "oak-city";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TileKind {
    Obstacle,
    Player,
}

/// One occupied cell of a game's grid. Empty cells have no tile entry at all,
/// so a coordinate is either absent, an obstacle, or exactly one player.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tile {
    pub kind: TileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl Tile {
    pub fn obstacle() -> Self {
        Self {
            kind: TileKind::Obstacle,
            username: None,
            avatar: None,
            direction: None,
        }
    }

    pub fn player(username: impl Into<String>, avatar: impl Into<String>, direction: Direction) -> Self {
        Self {
            kind: TileKind::Player,
            username: Some(username.into()),
            avatar: Some(avatar.into()),
            direction: Some(direction),
        }
    }
}

/// Field name for a coordinate inside a game's tile dictionary.
pub fn tile_key(x: u32, y: u32) -> String {
    format!("{x},{y}")
}

/// Derive a URL-safe game identifier from a display name: lowercased,
/// punctuation stripped, spaces replaced with hyphens.
pub fn slugify(name: &str) -> String {
    static PUNCTUATION: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^\w\s]").unwrap());
    PUNCTUATION
        .replace_all(&name.to_lowercase(), "")
        .replace(' ', "-")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Obstacle {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapTemplate {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub obstacles: Vec<Obstacle>,
}

impl MapTemplate {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }
}

/// The built-in level. Deployments can layer extra templates on top through
/// the map config file.
pub fn oak_city() -> MapTemplate {
    MapTemplate {
        id: DEFAULT_MAP_ID.to_string(),
        width: 10,
        height: 10,
        obstacles: vec![
            Obstacle { x: 4, y: 4 },
            Obstacle { x: 5, y: 4 },
            Obstacle { x: 8, y: 1 },
        ],
    }
}

/// Static map templates available to new games, keyed by map id.
#[derive(Debug, Clone)]
pub struct MapCatalog {
    templates: HashMap<String, MapTemplate>,
}

impl MapCatalog {
    pub fn built_in() -> Self {
        let mut templates = HashMap::new();
        let default = oak_city();
        templates.insert(default.id.clone(), default);
        Self { templates }
    }

    pub fn insert(&mut self, template: MapTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn get(&self, map_id: &str) -> Option<&MapTemplate> {
        self.templates.get(map_id)
    }

    /// Template used when a create request names no map or an unknown one.
    pub fn default_template(&self) -> &MapTemplate {
        self.templates
            .get(DEFAULT_MAP_ID)
            .unwrap_or_else(|| panic!("default map template {DEFAULT_MAP_ID} missing from catalog"))
    }
}

impl Default for MapCatalog {
    fn default() -> Self {
        Self::built_in()
    }
}

/// Notification of a completed state change, published once per mutation and
/// consumed by the connection fan-out path. Delivery is at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DomainEvent {
    PlayerJoined {
        game_id: String,
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        message: String,
    },
    PlayerLeft {
        game_id: String,
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        message: String,
    },
    PlayerMoved {
        game_id: String,
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        x: u32,
        y: u32,
        avatar: String,
        direction: Direction,
    },
    PointsUpdated {
        game_id: String,
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        score: f64,
    },
}

impl DomainEvent {
    /// Topic-name segment for this event kind.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::PlayerJoined { .. } => "player-joined",
            DomainEvent::PlayerLeft { .. } => "player-left",
            DomainEvent::PlayerMoved { .. } => "player-moved",
            DomainEvent::PointsUpdated { .. } => "points-updated",
        }
    }

    pub fn game_id(&self) -> &str {
        match self {
            DomainEvent::PlayerJoined { game_id, .. }
            | DomainEvent::PlayerLeft { game_id, .. }
            | DomainEvent::PlayerMoved { game_id, .. }
            | DomainEvent::PointsUpdated { game_id, .. } => game_id,
        }
    }

    /// Connection of the acting player, excluded from its own fan-out.
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            DomainEvent::PlayerJoined { connection_id, .. }
            | DomainEvent::PlayerLeft { connection_id, .. }
            | DomainEvent::PlayerMoved { connection_id, .. }
            | DomainEvent::PointsUpdated { connection_id, .. } => connection_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    PlayerJoined,
    PlayerLeft,
    PlayerMoved,
    PointsUpdated,
}

/// User-facing record handed to the connection delivery transport. The
/// `message_id` lets downstream consumers dedupe at-least-once redeliveries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub message_id: Uuid,
    pub kind: NotificationKind,
    pub message: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Instruction for the downstream delivery layer: push `message` to every
/// listed live connection and optionally append it to the game's chat log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastCommand {
    pub connections: Vec<String>,
    pub message: Notification,
    pub game_id: String,
    pub save_to_chat_history: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub username: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGameRequest {
    pub name: String,
    /// Seconds the game session stays valid for.
    pub duration: u64,
    #[serde(default)]
    pub map_id: Option<String>,
    #[serde(default)]
    pub is_ranked: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGameResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinGameRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinGameResponse {
    pub name: String,
    pub username: String,
    pub players: Vec<String>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveGameRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRequest {
    pub username: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MoveResponse {
    pub x: u32,
    pub y: u32,
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePointsRequest {
    pub username: String,
    pub points: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetScoreRequest {
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncreaseAbilityRequest {
    pub username: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecreaseAbilityRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbilityResponse {
    pub remaining: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardRow {
    pub rank: u32,
    pub username: String,
    /// Stored scores are fractional; display floors them to whole points.
    pub score: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardResponse {
    pub leaderboard: Vec<LeaderboardRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionsResponse {
    pub connections: Vec<String>,
}
