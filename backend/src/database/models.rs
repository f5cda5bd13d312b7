use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::chain::TokenMetadata;

/// One row per registered job.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRecord {
    pub id: String,
    pub enabled: bool,
    pub running: bool,
    pub panicked: bool,
    pub cron: String,
    pub cursor: Option<i64>,
    pub config: Value,
    pub auxiliary_data: Option<Value>,
    pub last_run_duration_seconds: Option<String>,
}

impl TaskRecord {
    /// A freshly seeded, enabled row with empty config.
    pub fn new(id: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            running: false,
            panicked: false,
            cron: cron.into(),
            cursor: None,
            config: Value::Object(Default::default()),
            auxiliary_data: None,
            last_run_duration_seconds: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_cursor(mut self, cursor: i64) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Last persisted progress; a null or negative cursor means nothing processed yet.
    pub fn cursor_position(&self) -> u64 {
        self.cursor.map(|c| c.max(0) as u64).unwrap_or(0)
    }

    pub fn task_config(&self) -> Result<TaskConfig, serde_json::Error> {
        TaskConfig::from_value(&self.config)
    }
}

/// Typed view over the `config` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    #[serde(default)]
    pub chunk: Option<u64>,
    #[serde(default = "default_history_days")]
    pub historical_record_days: u32,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default)]
    pub metadata_path: Option<String>,
}

fn default_history_days() -> u32 {
    31
}

fn default_max_retry() -> u32 {
    2
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            chunk: None,
            historical_record_days: default_history_days(),
            max_retry: default_max_retry(),
            metadata_path: None,
        }
    }
}

impl TaskConfig {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
    }

    pub fn chunk_or(&self, default: u64) -> u64 {
        self.chunk.unwrap_or(default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "token_kind")]
pub enum TokenKind {
    #[sqlx(rename = "Native")]
    Native,
    #[sqlx(rename = "Single")]
    Single,
    #[sqlx(rename = "Composite")]
    Composite,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Native => write!(f, "Native"),
            TokenKind::Single => write!(f, "Single"),
            TokenKind::Composite => write!(f, "Composite"),
        }
    }
}

/// A persisted fungible asset on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub network_id: i64,
    pub address: Address,
    pub kind: TokenKind,
    pub name: String,
    pub symbol: String,
    pub decimals: i32,
    pub status: bool,
    pub constituent_a: Option<i64>,
    pub constituent_b: Option<i64>,
}

/// Insert payload for [`Token`]; ids are assigned by storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewToken {
    pub network_id: i64,
    pub address: Address,
    pub kind: TokenKind,
    pub name: String,
    pub symbol: String,
    pub decimals: i32,
    pub status: bool,
    pub constituent_a: Option<i64>,
    pub constituent_b: Option<i64>,
}

impl NewToken {
    /// A plain asset; active only when its metadata resolved.
    pub fn single(network_id: i64, address: Address, metadata: &TokenMetadata) -> Self {
        Self {
            network_id,
            address,
            kind: TokenKind::Single,
            name: metadata.name.clone(),
            symbol: metadata.symbol.clone(),
            decimals: metadata.decimals as i32,
            status: metadata.is_resolved(),
            constituent_a: None,
            constituent_b: None,
        }
    }

    /// A pool share referencing two persisted constituents; active only when
    /// both constituents are active and its own metadata resolved.
    pub fn composite(network_id: i64, address: Address, metadata: &TokenMetadata, a: &Token, b: &Token) -> Self {
        Self {
            network_id,
            address,
            kind: TokenKind::Composite,
            name: metadata.name.clone(),
            symbol: metadata.symbol.clone(),
            decimals: metadata.decimals as i32,
            status: a.status && b.status && metadata.is_resolved(),
            constituent_a: Some(a.id),
            constituent_b: Some(b.id),
        }
    }

    pub(crate) fn into_token(self, id: i64) -> Token {
        Token {
            id,
            network_id: self.network_id,
            address: self.address,
            kind: self.kind,
            name: self.name,
            symbol: self.symbol,
            decimals: self.decimals,
            status: self.status,
            constituent_a: self.constituent_a,
            constituent_b: self.constituent_b,
        }
    }
}
