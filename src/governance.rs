// src/governance.rs
//
// Governance Resolver — three-tier parameter resolution (entity override,
// global, compile-time fallback) plus the proposal/approval lifecycle for
// changing a parameter's active value. Callers resolve a parameter without
// knowing whether it came from an override row, a global row, or code.

use crate::account::EntityType;
use crate::error::LedgerError;
use crate::outbox;
use crate::store::{StoreFacade, Tx};
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernanceStatus {
    Draft,
    PendingApproval,
    CoolingDown,
    Active,
    Superseded,
    Rejected,
}

impl GovernanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GovernanceStatus::Draft => "draft",
            GovernanceStatus::PendingApproval => "pending_approval",
            GovernanceStatus::CoolingDown => "cooling_down",
            GovernanceStatus::Active => "active",
            GovernanceStatus::Superseded => "superseded",
            GovernanceStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(GovernanceStatus::Draft),
            "pending_approval" => Some(GovernanceStatus::PendingApproval),
            "cooling_down" => Some(GovernanceStatus::CoolingDown),
            "active" => Some(GovernanceStatus::Active),
            "superseded" => Some(GovernanceStatus::Superseded),
            "rejected" => Some(GovernanceStatus::Rejected),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, GovernanceStatus::Superseded | GovernanceStatus::Rejected)
    }
}

#[derive(Debug, Clone)]
pub struct GovernanceConfig {
    pub id: String,
    pub param_key: String,
    pub value: String,
    pub entity_type: Option<EntityType>,
    pub version: i64,
    pub status: GovernanceStatus,
    pub required_approvals: i64,
    pub approval_count: i64,
    pub proposer: String,
    pub approvers: Vec<String>,
    pub cooldown_ends_at: Option<i64>,
    pub created_at: i64,
}

/// Compile-time defaults used when no global or entity-override row is
/// active for a key. These are the floor the resolver can never fail below.
pub struct FallbackTable;

impl FallbackTable {
    pub fn resolve(param_key: &str) -> Option<&'static str> {
        match param_key {
            "settlement.hold_seconds" => Some("172800"),
            "agent.drip_recovery_pct" => Some("50"),
            "transfer.max_single_micro" => Some("100000000"),
            "transfer.daily_limit_micro" => Some("500000000"),
            "governance.agent_weight_source" => Some("delegation"),
            _ => None,
        }
    }
}

/// The four-eyes rule: a config needs at least two distinct approvers before
/// it can leave `pending_approval`, and the proposer cannot count as one of
/// them.
const MIN_APPROVALS: i64 = 2;
const DEFAULT_COOLDOWN_SECONDS: i64 = 86_400;

/// An emergency override needs a strictly higher bar than ordinary approval:
/// at least three distinct people signing off, not the usual two.
const MIN_EMERGENCY_APPROVERS: usize = 3;

/// Resolves `param_key` for an optional entity type: entity-specific active
/// override first, then the global active row (`entity_type IS NULL`), then
/// the compile-time fallback. Returns `NotFound` only if none of the three
/// tiers has a value — every key in `FallbackTable` is therefore always
/// resolvable.
pub async fn resolve(tx: &mut Tx<'_>, param_key: &str, entity_type: Option<EntityType>) -> Result<String, LedgerError> {
    if let Some(entity_type) = entity_type {
        if let Some(row) = fetch_active(tx, param_key, Some(entity_type.as_str())).await? {
            return Ok(row);
        }
    }
    if let Some(row) = fetch_active(tx, param_key, None).await? {
        return Ok(row);
    }
    FallbackTable::resolve(param_key)
        .map(str::to_string)
        .ok_or_else(|| LedgerError::NotFound(format!("governance parameter {param_key}")))
}

async fn fetch_active(tx: &mut Tx<'_>, param_key: &str, entity_type: Option<&str>) -> Result<Option<String>, LedgerError> {
    let row: Option<(String,)> = match entity_type {
        Some(et) => {
            sqlx::query_as(
                "SELECT value FROM governance_configs WHERE param_key = ?1 AND entity_type = ?2 AND status = 'active' ORDER BY version DESC LIMIT 1",
            )
            .bind(param_key)
            .bind(et)
            .fetch_optional(&mut **tx)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT value FROM governance_configs WHERE param_key = ?1 AND entity_type IS NULL AND status = 'active' ORDER BY version DESC LIMIT 1",
            )
            .bind(param_key)
            .fetch_optional(&mut **tx)
            .await?
        }
    };
    Ok(row.map(|(v,)| v))
}

/// Proposes a new value for `param_key`, starting in `draft`. The caller
/// must call `submit_for_approval` to move it into the approval queue.
pub async fn propose(
    tx: &mut Tx<'_>,
    param_key: &str,
    value: &str,
    entity_type: Option<EntityType>,
    proposer: &str,
) -> Result<GovernanceConfig, LedgerError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();
    let version = next_version(tx, param_key, entity_type).await?;

    sqlx::query(
        r#"
        INSERT INTO governance_configs (id, param_key, value, entity_type, version, status, required_approvals, approval_count, proposer, approvers, cooldown_ends_at, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'draft', ?6, 0, ?7, '[]', NULL, ?8)
        "#,
    )
    .bind(&id)
    .bind(param_key)
    .bind(value)
    .bind(entity_type.map(|e| e.as_str()))
    .bind(version)
    .bind(MIN_APPROVALS)
    .bind(proposer)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    fetch_config(tx, &id).await
}

async fn next_version(tx: &mut Tx<'_>, param_key: &str, entity_type: Option<EntityType>) -> Result<i64, LedgerError> {
    let row: (Option<i64>,) = match entity_type {
        Some(et) => {
            sqlx::query_as("SELECT MAX(version) FROM governance_configs WHERE param_key = ?1 AND entity_type = ?2")
                .bind(param_key)
                .bind(et.as_str())
                .fetch_one(&mut **tx)
                .await?
        }
        None => {
            sqlx::query_as("SELECT MAX(version) FROM governance_configs WHERE param_key = ?1 AND entity_type IS NULL")
                .bind(param_key)
                .fetch_one(&mut **tx)
                .await?
        }
    };
    Ok(row.0.unwrap_or(0) + 1)
}

pub async fn submit_for_approval(tx: &mut Tx<'_>, config_id: &str) -> Result<GovernanceConfig, LedgerError> {
    let config = fetch_config(tx, config_id).await?;
    if config.status != GovernanceStatus::Draft {
        return Err(LedgerError::InvalidState(format!(
            "governance config {config_id} is {}, expected draft",
            config.status.as_str()
        )));
    }
    sqlx::query("UPDATE governance_configs SET status = 'pending_approval' WHERE id = ?1")
        .bind(config_id)
        .execute(&mut **tx)
        .await?;
    fetch_config(tx, config_id).await
}

/// Records one approval. `approver` must differ from the proposer and from
/// every approver already recorded. Once `approval_count` reaches
/// `required_approvals`, the config moves to `cooling_down` rather than
/// straight to `active` — `activate_expired_cooldowns` promotes it later.
pub async fn approve(tx: &mut Tx<'_>, config_id: &str, approver: &str) -> Result<GovernanceConfig, LedgerError> {
    let config = fetch_config(tx, config_id).await?;
    if config.status != GovernanceStatus::PendingApproval {
        return Err(LedgerError::InvalidState(format!(
            "governance config {config_id} is {}, expected pending_approval",
            config.status.as_str()
        )));
    }
    if approver == config.proposer {
        return Err(LedgerError::PolicyDenied("proposer cannot approve their own change".into()));
    }
    if config.approvers.iter().any(|a| a == approver) {
        return Err(LedgerError::Invalid(format!("{approver} already approved this config")));
    }

    let mut approvers = config.approvers.clone();
    approvers.push(approver.to_string());
    let approval_count = approvers.len() as i64;
    let approvers_json = serde_json::to_string(&approvers)
        .map_err(|e| LedgerError::internal(format!("cannot serialize approvers: {e}")))?;

    if approval_count >= config.required_approvals {
        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE governance_configs SET approvers = ?1, approval_count = ?2, status = 'cooling_down', cooldown_ends_at = ?3 WHERE id = ?4",
        )
        .bind(&approvers_json)
        .bind(approval_count)
        .bind(now + DEFAULT_COOLDOWN_SECONDS)
        .bind(config_id)
        .execute(&mut **tx)
        .await?;
    } else {
        sqlx::query("UPDATE governance_configs SET approvers = ?1, approval_count = ?2 WHERE id = ?3")
            .bind(&approvers_json)
            .bind(approval_count)
            .bind(config_id)
            .execute(&mut **tx)
            .await?;
    }

    fetch_config(tx, config_id).await
}

pub async fn reject(tx: &mut Tx<'_>, config_id: &str) -> Result<GovernanceConfig, LedgerError> {
    let config = fetch_config(tx, config_id).await?;
    if config.status.is_terminal() {
        return Err(LedgerError::InvalidState(format!(
            "governance config {config_id} is already {}",
            config.status.as_str()
        )));
    }
    sqlx::query("UPDATE governance_configs SET status = 'rejected' WHERE id = ?1")
        .bind(config_id)
        .execute(&mut **tx)
        .await?;
    fetch_config(tx, config_id).await
}

/// Bypasses the cooldown, moving a `cooling_down` (or, in a declared
/// emergency, even a `pending_approval`) config straight to `active`.
/// Supersedes whatever was previously active for the same `(param_key,
/// entity_type)`. Requires at least three distinct approvers and a
/// justification, and is logged as a governance audit event regardless of
/// how the outbox write turns out.
pub async fn emergency_override(
    tx: &mut Tx<'_>,
    config_id: &str,
    approvers: &[String],
    justification: &str,
) -> Result<GovernanceConfig, LedgerError> {
    let distinct: HashSet<&str> = approvers.iter().map(String::as_str).collect();
    if distinct.len() < MIN_EMERGENCY_APPROVERS {
        return Err(LedgerError::PolicyDenied(format!(
            "emergency override requires at least {MIN_EMERGENCY_APPROVERS} distinct approvers, got {}",
            distinct.len()
        )));
    }
    if justification.trim().is_empty() {
        return Err(LedgerError::Invalid("emergency override requires a justification".into()));
    }

    let config = fetch_config(tx, config_id).await?;
    if !matches!(config.status, GovernanceStatus::CoolingDown | GovernanceStatus::PendingApproval) {
        return Err(LedgerError::InvalidState(format!(
            "governance config {config_id} is {}, cannot be emergency-activated",
            config.status.as_str()
        )));
    }

    outbox::emit_event(
        tx,
        "governance.emergency_override",
        "governance_config",
        config_id,
        None,
        None,
        &json!({
            "param_key": config.param_key,
            "entity_type": config.entity_type.map(|e| e.as_str()),
            "approvers": approvers,
            "justification": justification,
        }),
    )
    .await;

    activate(tx, &config).await
}

/// Promotes every `cooling_down` config whose `cooldown_ends_at` has passed
/// to `active`, superseding the prior active row for the same key. Run by
/// the sweeper on an hourly interval.
pub async fn activate_expired_cooldowns(tx: &mut Tx<'_>, now_epoch: i64) -> Result<u32, LedgerError> {
    let due: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM governance_configs WHERE status = 'cooling_down' AND cooldown_ends_at <= ?1",
    )
    .bind(now_epoch)
    .fetch_all(&mut **tx)
    .await?;

    let mut activated = 0u32;
    for (id,) in due {
        let config = fetch_config(tx, &id).await?;
        activate(tx, &config).await?;
        activated += 1;
    }
    Ok(activated)
}

async fn activate(tx: &mut Tx<'_>, config: &GovernanceConfig) -> Result<GovernanceConfig, LedgerError> {
    match config.entity_type {
        Some(et) => {
            sqlx::query(
                "UPDATE governance_configs SET status = 'superseded' WHERE param_key = ?1 AND entity_type = ?2 AND status = 'active'",
            )
            .bind(&config.param_key)
            .bind(et.as_str())
            .execute(&mut **tx)
            .await?;
        }
        None => {
            sqlx::query(
                "UPDATE governance_configs SET status = 'superseded' WHERE param_key = ?1 AND entity_type IS NULL AND status = 'active'",
            )
            .bind(&config.param_key)
            .execute(&mut **tx)
            .await?;
        }
    }
    sqlx::query("UPDATE governance_configs SET status = 'active' WHERE id = ?1")
        .bind(&config.id)
        .execute(&mut **tx)
        .await?;
    fetch_config(tx, &config.id).await
}

async fn fetch_config(tx: &mut Tx<'_>, id: &str) -> Result<GovernanceConfig, LedgerError> {
    let row: Option<GovernanceConfigRow> = sqlx::query_as(
        r#"
        SELECT id, param_key, value, entity_type, version, status, required_approvals, approval_count, proposer, approvers, cooldown_ends_at, created_at
        FROM governance_configs WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    row.ok_or_else(|| LedgerError::NotFound(format!("governance config {id}")))?
        .into_config()
}

impl StoreFacade {
    pub async fn resolve_governance(&self, param_key: &str, entity_type: Option<EntityType>) -> Result<String, LedgerError> {
        self.transaction(|tx| Box::pin(async move { resolve(tx, param_key, entity_type).await }))
            .await
    }
}

#[derive(sqlx::FromRow)]
struct GovernanceConfigRow {
    id: String,
    param_key: String,
    value: String,
    entity_type: Option<String>,
    version: i64,
    status: String,
    required_approvals: i64,
    approval_count: i64,
    proposer: String,
    approvers: String,
    cooldown_ends_at: Option<i64>,
    created_at: i64,
}

impl GovernanceConfigRow {
    fn into_config(self) -> Result<GovernanceConfig, LedgerError> {
        let approvers: Vec<String> = serde_json::from_str(&self.approvers)
            .map_err(|e| LedgerError::internal(format!("corrupt approvers json: {e}")))?;
        Ok(GovernanceConfig {
            id: self.id,
            param_key: self.param_key,
            value: self.value,
            entity_type: self
                .entity_type
                .map(|s| EntityType::from_str(&s).ok_or_else(|| LedgerError::internal("unknown entity_type in store")))
                .transpose()?,
            version: self.version,
            status: GovernanceStatus::from_str(&self.status)
                .ok_or_else(|| LedgerError::internal("unknown governance status in store"))?,
            required_approvals: self.required_approvals,
            approval_count: self.approval_count,
            proposer: self.proposer,
            approvers,
            cooldown_ends_at: self.cooldown_ends_at,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;

    async fn test_store() -> StoreFacade {
        let store = StoreFacade::connect(&LedgerConfig::in_memory()).await.unwrap();
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn fallback_resolves_when_no_rows_exist() {
        let store = test_store().await;
        let value = store.resolve_governance("transfer.max_single_micro", None).await.unwrap();
        assert_eq!(value, "100000000");
    }

    #[tokio::test]
    async fn full_lifecycle_from_draft_to_active_supersedes_prior() {
        let store = test_store().await;
        store
            .transaction(|tx| {
                Box::pin(async move {
                    let first = propose(tx, "transfer.max_single_micro", "100000000", None, "alice").await?;
                    submit_for_approval(tx, &first.id).await?;
                    approve(tx, &first.id, "bob").await?;
                    approve(tx, &first.id, "carol").await?;
                    let cooling = fetch_config(tx, &first.id).await?;
                    assert_eq!(cooling.status, GovernanceStatus::CoolingDown);
                    let activated = activate_expired_cooldowns(tx, cooling.cooldown_ends_at.unwrap() + 1).await?;
                    assert_eq!(activated, 1);
                    Ok(())
                })
            })
            .await
            .unwrap();

        let value = store.resolve_governance("transfer.max_single_micro", None).await.unwrap();
        assert_eq!(value, "100000000");
    }

    #[tokio::test]
    async fn emergency_override_requires_three_distinct_approvers_and_a_justification() {
        let store = test_store().await;
        let config_id = store
            .transaction(|tx| {
                Box::pin(async move {
                    let cfg = propose(tx, "transfer.max_single_micro", "250000000", None, "alice").await?;
                    submit_for_approval(tx, &cfg.id).await?;
                    Ok(cfg.id)
                })
            })
            .await
            .unwrap();

        let too_few = store
            .transaction({
                let config_id = config_id.clone();
                move |tx| {
                    let config_id = config_id.clone();
                    Box::pin(async move {
                        let approvers = vec!["bob".to_string(), "carol".to_string()];
                        emergency_override(tx, &config_id, &approvers, "incident-123").await
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(too_few, LedgerError::PolicyDenied(_)));

        let no_justification = store
            .transaction({
                let config_id = config_id.clone();
                move |tx| {
                    let config_id = config_id.clone();
                    Box::pin(async move {
                        let approvers = vec!["bob".to_string(), "carol".to_string(), "dave".to_string()];
                        emergency_override(tx, &config_id, &approvers, "   ").await
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(no_justification, LedgerError::Invalid(_)));

        let activated = store
            .transaction(move |tx| {
                let config_id = config_id.clone();
                Box::pin(async move {
                    let approvers = vec!["bob".to_string(), "carol".to_string(), "dave".to_string()];
                    emergency_override(tx, &config_id, &approvers, "incident-123").await
                })
            })
            .await
            .unwrap();
        assert_eq!(activated.status, GovernanceStatus::Active);

        let events: Vec<(String,)> = sqlx::query_as("SELECT event_type FROM event_outbox WHERE aggregate_id = ?1")
            .bind(&activated.id)
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert!(events.iter().any(|(t,)| t == "governance.emergency_override"));
    }

    #[tokio::test]
    async fn proposer_cannot_approve_own_change() {
        let store = test_store().await;
        let err = store
            .transaction(|tx| {
                Box::pin(async move {
                    let cfg = propose(tx, "agent.drip_recovery_pct", "60", None, "alice").await?;
                    submit_for_approval(tx, &cfg.id).await?;
                    approve(tx, &cfg.id, "alice").await
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::PolicyDenied(_)));
    }
}
