// src/idempotency.rs
//
// Idempotency-key bookkeeping shared by the ledger engine, peer transfer,
// and settlement. Generalizes the single `(key -> transaction_id)` lookup
// into a `(scope, key) -> response` table so reserve/finalize/transfer each
// get their own namespace without colliding on key reuse.

use crate::error::LedgerError;
use crate::store::Tx;
use chrono::Utc;

/// Hashes a raw idempotency key with blake3 before storing it, so the store
/// never holds caller-supplied strings verbatim (keys may embed sensitive
/// request context upstream).
pub fn hash_key(raw_key: &str) -> String {
    blake3::hash(raw_key.as_bytes()).to_hex().to_string()
}

/// Looks up `(scope, key)`. Returns the stored response hash and payload if
/// present and unexpired. Callers compare the returned hash against a fresh
/// shape hash of the incoming request to detect a key reused for a
/// differently-shaped call (e.g. `finalize` retried with a different
/// `actual_cost`), which should be rejected rather than replayed.
pub async fn lookup(
    tx: &mut Tx<'_>,
    scope: &str,
    raw_key: &str,
    now_epoch: i64,
) -> Result<Option<(String, String)>, LedgerError> {
    let hashed = hash_key(raw_key);
    let row: Option<(String, String, i64)> = sqlx::query_as(
        r#"
        SELECT response_hash, response_payload, expires_at
        FROM idempotency_keys
        WHERE scope = ?1 AND key = ?2
        "#,
    )
    .bind(scope)
    .bind(&hashed)
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        Some((response_hash, payload, expires_at)) if expires_at > now_epoch => {
            Ok(Some((response_hash, payload)))
        }
        _ => Ok(None),
    }
}

/// Records the response for `(scope, key)` with a 24-hour TTL from `now`.
pub async fn store(
    tx: &mut Tx<'_>,
    scope: &str,
    raw_key: &str,
    response_hash: &str,
    response_payload: &str,
    ttl_hours: i64,
) -> Result<(), LedgerError> {
    let hashed = hash_key(raw_key);
    let now = Utc::now().timestamp();
    let expires_at = now + ttl_hours * 3_600;

    sqlx::query(
        r#"
        INSERT INTO idempotency_keys (scope, key, response_hash, response_payload, expires_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (scope, key) DO NOTHING
        "#,
    )
    .bind(scope)
    .bind(&hashed)
    .bind(response_hash)
    .bind(response_payload)
    .bind(expires_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Hash of a request's "shape" (the fields that must match for a replay to
/// be considered the same call, e.g. `actual_cost` on `finalize`).
pub fn hash_shape(parts: &[&str]) -> String {
    let joined = parts.join("\u{1f}");
    blake3::hash(joined.as_bytes()).to_hex().to_string()
}
