// src/account.rs
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityType {
    Person,
    Agent,
    Community,
    Platform,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Agent => "agent",
            EntityType::Community => "community",
            EntityType::Platform => "platform",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "person" => Some(EntityType::Person),
            "agent" => Some(EntityType::Agent),
            "community" => Some(EntityType::Community),
            "platform" => Some(EntityType::Platform),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub version: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// The string namespace partitioning credits. `NULL` and `"general"` are
/// aliases for the default pool everywhere a pool is read or compared.
pub const DEFAULT_POOL: &str = "general";

pub fn effective_pool(pool: Option<&str>) -> &str {
    match pool {
        None => DEFAULT_POOL,
        Some(p) if p.is_empty() => DEFAULT_POOL,
        Some(p) => p,
    }
}
