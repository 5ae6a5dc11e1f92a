//! Event application and rollback.
//!
//! Every ledger event turns into at most one domain-table mutation plus the
//! side-table updates, and is recorded in the projection's `messages` log
//! together with the inverse needed to undo it: the prior row image for
//! updates, the inserted rowid for inserts.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteQueryResult;
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, trace};

use crate::database::{self, bind_json_value, fetch_row_as_json};
use crate::event::{update_id_fields, Event, StoredEvent};
use crate::{mempool, updaters};

/// Fatal projection conditions. Everything else propagates as plain
/// `anyhow` errors and is retried by the next loop iteration.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// The ledger emitted an update event this build has no id-field set
    /// for: ledger and projection disagree on the wire contract.
    #[error("unknown id field set for event `{0}`")]
    UnknownEventShape(String),
    /// An inserted row vanished before its insert could be undone.
    #[error("rollback target missing in `{category}` (rowid {rowid})")]
    RollbackTargetMissing { category: String, rowid: i64 },
    /// An already-applied migration's SQL changed underneath us.
    #[error("migration `{0}` content changed after being applied")]
    MigrationMismatch(String),
}

// ─────────────────────────────────────────────────────────
// Event → SQL translation
// ─────────────────────────────────────────────────────────

/// Insert of every binding, plus `block_index` when the ledger left it out.
pub fn insert_event_to_sql(
    category: &str,
    bindings: &Map<String, Value>,
    block_index: i64,
) -> (String, Vec<Value>) {
    let mut names: Vec<&str> = Vec::with_capacity(bindings.len() + 1);
    let mut values: Vec<Value> = Vec::with_capacity(bindings.len() + 1);
    for (name, value) in bindings {
        names.push(name);
        values.push(value.clone());
    }
    if !bindings.contains_key("block_index") {
        names.push("block_index");
        values.push(Value::from(block_index));
    }
    let placeholders = vec!["?"; names.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        category,
        names.join(", "),
        placeholders
    );
    (sql, values)
}

/// Update of every non-id binding, keyed by the event's id-field set.
/// Returns `None` when nothing but id fields was bound.
pub fn update_event_to_sql(
    event_kind: &str,
    category: &str,
    bindings: &Map<String, Value>,
) -> Result<Option<(String, Vec<Value>)>> {
    let id_fields = update_id_fields(event_kind)
        .ok_or_else(|| WatcherError::UnknownEventShape(event_kind.to_string()))?;

    let mut set_parts: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    for (name, value) in bindings {
        if id_fields.contains(&name.as_str()) {
            continue;
        }
        set_parts.push(format!("{name} = ?"));
        values.push(value.clone());
    }
    if set_parts.is_empty() {
        return Ok(None);
    }

    let mut where_parts: Vec<String> = Vec::new();
    for id_field in id_fields {
        let value = bindings
            .get(*id_field)
            .ok_or_else(|| WatcherError::UnknownEventShape(event_kind.to_string()))?;
        where_parts.push(format!("{id_field} = ?"));
        values.push(value.clone());
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        category,
        set_parts.join(", "),
        where_parts.join(" AND ")
    );
    Ok(Some((sql, values)))
}

async fn run_sql(
    tx: &mut Transaction<'_, Sqlite>,
    sql: &str,
    values: &[Value],
) -> Result<SqliteQueryResult> {
    let mut query = sqlx::query(sql);
    for value in values {
        query = bind_json_value(query, value);
    }
    query
        .execute(&mut **tx)
        .await
        .with_context(|| format!("statement failed: {sql}"))
}

/// Row image the event is about to overwrite, selected by the id-field set.
/// Null for inserts and for unconfirmed updates, which mutate nothing.
async fn get_event_previous_state(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
    bindings: &Map<String, Value>,
) -> Result<Option<Map<String, Value>>> {
    if event.command != "update" && event.command != "parse" {
        return Ok(None);
    }
    if event.is_mempool() {
        return Ok(None);
    }
    let id_fields = update_id_fields(&event.event)
        .ok_or_else(|| WatcherError::UnknownEventShape(event.event.clone()))?;

    let mut where_parts: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    for id_field in id_fields {
        let value = bindings
            .get(*id_field)
            .ok_or_else(|| WatcherError::UnknownEventShape(event.event.clone()))?;
        where_parts.push(format!("{id_field} = ?"));
        values.push(value.clone());
    }
    let sql = format!(
        "SELECT * FROM {} WHERE {}",
        event.category,
        where_parts.join(" AND ")
    );
    fetch_row_as_json(&mut *tx, &sql, &values).await
}

/// Run the event's primary mutation. Returns the inserted rowid for insert
/// commands; updates against unconfirmed events are suppressed.
pub async fn execute_event(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
    bindings: &Map<String, Value>,
) -> Result<Option<i64>> {
    match event.command.as_str() {
        "insert" => {
            let (sql, values) = insert_event_to_sql(&event.category, bindings, event.block_index);
            let result = run_sql(tx, &sql, &values).await?;
            Ok(Some(result.last_insert_rowid()))
        }
        "update" | "parse" => {
            if event.is_mempool() {
                return Ok(None);
            }
            if let Some((sql, values)) =
                update_event_to_sql(&event.event, &event.category, bindings)?
            {
                run_sql(tx, &sql, &values).await?;
            }
            Ok(None)
        }
        other => {
            debug!(command = other, "Unhandled command, event stored only");
            Ok(None)
        }
    }
}

async fn insert_message(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
    previous_state: Option<String>,
    insert_rowid: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO messages
             (message_index, block_index, event, category, command, bindings,
              timestamp, tx_hash, event_hash, previous_state, insert_rowid)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.message_index)
    .bind(event.block_index)
    .bind(&event.event)
    .bind(&event.category)
    .bind(&event.command)
    .bind(&event.bindings)
    .bind(event.timestamp)
    .bind(&event.tx_hash)
    .bind(&event.event_hash)
    .bind(previous_state)
    .bind(insert_rowid)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn delete_message(tx: &mut Transaction<'_, Sqlite>, message_index: i64) -> Result<()> {
    sqlx::query("DELETE FROM messages WHERE message_index = ?")
        .bind(message_index)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Apply
// ─────────────────────────────────────────────────────────

/// Apply one ledger event inside the caller's transaction: primary mutation,
/// side tables, then the `messages` record with the captured inverse.
pub async fn apply_event(tx: &mut Transaction<'_, Sqlite>, event: &Event) -> Result<()> {
    if event.is_skipped() {
        insert_message(tx, event, None, None).await?;
        return Ok(());
    }

    // A new block invalidates the whole unconfirmed view.
    if event.event == "NEW_BLOCK" && !event.is_mempool() {
        mempool::clean(tx).await?;
    }

    let bindings = event.canonical_bindings()?;
    let previous_state = get_event_previous_state(tx, event, &bindings).await?;
    let insert_rowid = execute_event(tx, event, &bindings).await?;

    updaters::update_balances(tx, event, &bindings, false).await?;
    updaters::update_expiration(tx, event, &bindings, false).await?;
    updaters::update_assets_info(tx, event, &bindings).await?;
    updaters::update_xcp_supply(tx, event, &bindings, false).await?;
    updaters::update_address_events(tx, event, &bindings).await?;
    updaters::update_fairminters(tx, event, &bindings, false).await?;

    let previous_state = previous_state.map(|map| Value::Object(map).to_string());
    insert_message(tx, event, previous_state, insert_rowid).await?;
    trace!(
        message_index = event.message_index,
        event = %event.event,
        "Event parsed"
    );
    Ok(())
}

/// Apply one event in its own transaction.
pub async fn parse_event(api_db: &SqlitePool, event: &Event) -> Result<()> {
    let mut tx = api_db.begin().await?;
    apply_event(&mut tx, event).await?;
    tx.commit().await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Rollback
// ─────────────────────────────────────────────────────────

async fn restore_previous_state(
    tx: &mut Transaction<'_, Sqlite>,
    stored: &StoredEvent,
    previous_state: &Map<String, Value>,
) -> Result<()> {
    let id_fields = update_id_fields(&stored.event)
        .ok_or_else(|| WatcherError::UnknownEventShape(stored.event.clone()))?;

    let mut set_parts: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    for (name, value) in previous_state {
        if id_fields.contains(&name.as_str()) {
            continue;
        }
        set_parts.push(format!("{name} = ?"));
        values.push(value.clone());
    }
    if set_parts.is_empty() {
        return Ok(());
    }

    let mut where_parts: Vec<String> = Vec::new();
    for id_field in id_fields {
        let value = previous_state
            .get(*id_field)
            .ok_or_else(|| WatcherError::UnknownEventShape(stored.event.clone()))?;
        where_parts.push(format!("{id_field} = ?"));
        values.push(value.clone());
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        stored.category,
        set_parts.join(", "),
        where_parts.join(" AND ")
    );
    run_sql(tx, &sql, &values).await?;
    Ok(())
}

async fn delete_inserted_row(
    tx: &mut Transaction<'_, Sqlite>,
    stored: &StoredEvent,
) -> Result<()> {
    let rowid = stored
        .insert_rowid
        .ok_or_else(|| WatcherError::RollbackTargetMissing {
            category: stored.category.clone(),
            rowid: -1,
        })?;
    let sql = format!("DELETE FROM {} WHERE rowid = ?", stored.category);
    let deleted = sqlx::query(&sql)
        .bind(rowid)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(WatcherError::RollbackTargetMissing {
            category: stored.category.clone(),
            rowid,
        }
        .into());
    }
    Ok(())
}

/// Undo one stored event inside the caller's transaction: primary mutation
/// first (so refreshes recompute from the log as it stood before the event),
/// then the side tables, then the `messages` record itself.
pub async fn rollback_event(tx: &mut Transaction<'_, Sqlite>, stored: &StoredEvent) -> Result<()> {
    trace!(
        message_index = stored.message_index,
        event = %stored.event,
        "Rolling back event"
    );
    if stored.is_skipped() {
        return delete_message(tx, stored.message_index).await;
    }

    let event = stored.as_event();
    let bindings = event.canonical_bindings()?;

    match stored.previous_state_map()? {
        Some(previous_state) => restore_previous_state(tx, stored, &previous_state).await?,
        None if stored.command == "insert" => delete_inserted_row(tx, stored).await?,
        None => {} // update that never mutated (unconfirmed): nothing to restore
    }

    updaters::update_balances(tx, &event, &bindings, true).await?;
    updaters::update_expiration(tx, &event, &bindings, true).await?;
    updaters::rollback_assets_info(tx, &event, &bindings).await?;
    updaters::update_xcp_supply(tx, &event, &bindings, true).await?;
    updaters::rollback_address_events(tx, stored.message_index).await?;
    updaters::update_fairminters(tx, &event, &bindings, true).await?;

    delete_message(tx, stored.message_index).await
}

/// Undo every event at or above `block_index`, newest first, in one
/// transaction. The mempool sentinel sorts above every real height, so
/// unconfirmed records are always included.
pub async fn rollback(api_db: &SqlitePool, block_index: i64) -> Result<()> {
    let mut tx = api_db.begin().await?;
    let rows = sqlx::query(
        "SELECT * FROM messages WHERE block_index >= ? ORDER BY message_index DESC",
    )
    .bind(block_index)
    .fetch_all(&mut *tx)
    .await?;

    debug!(
        block_index,
        events = rows.len(),
        "Rolling back projection suffix"
    );
    for row in &rows {
        let stored = database::stored_event_from_row(row)?;
        rollback_event(&mut tx, &stored).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Undo the single newest stored event in its own transaction; used by the
/// reconciler. Returns false when the projection is already empty.
pub async fn rollback_last_event(api_db: &SqlitePool) -> Result<bool> {
    let Some(stored) = database::get_last_stored_event(api_db).await? else {
        return Ok(false);
    };
    let mut tx = api_db.begin().await?;
    rollback_event(&mut tx, &stored).await?;
    tx.commit().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        let Value::Object(map) = value else {
            panic!("expected object")
        };
        map
    }

    #[test]
    fn insert_sql_covers_all_bindings_and_block_index() {
        let bindings = map(json!({
            "tx_hash": "ab",
            "quantity": 5
        }));
        let (sql, values) = insert_event_to_sql("credits", &bindings, 120);
        assert_eq!(
            sql,
            "INSERT INTO credits (quantity, tx_hash, block_index) VALUES (?, ?, ?)"
        );
        assert_eq!(values, vec![json!(5), json!("ab"), json!(120)]);
    }

    #[test]
    fn insert_sql_keeps_bound_block_index() {
        let bindings = map(json!({"block_index": 7, "asset": "FOO"}));
        let (sql, values) = insert_event_to_sql("issuances", &bindings, 120);
        assert_eq!(sql, "INSERT INTO issuances (asset, block_index) VALUES (?, ?)");
        assert_eq!(values, vec![json!("FOO"), json!(7)]);
    }

    #[test]
    fn update_sql_keys_on_the_id_field_set() {
        let bindings = map(json!({
            "tx_hash": "ab",
            "status": "filled",
            "give_remaining": 0
        }));
        let (sql, values) = update_event_to_sql("ORDER_UPDATE", "orders", &bindings)
            .unwrap()
            .unwrap();
        assert_eq!(
            sql,
            "UPDATE orders SET give_remaining = ?, status = ? WHERE tx_hash = ?"
        );
        assert_eq!(values, vec![json!(0), json!("filled"), json!("ab")]);
    }

    #[test]
    fn update_sql_with_only_id_fields_is_a_noop() {
        let bindings = map(json!({"tx_hash": "ab"}));
        let translated = update_event_to_sql("ORDER_UPDATE", "orders", &bindings).unwrap();
        assert!(translated.is_none());
    }

    #[test]
    fn unknown_update_event_is_fatal() {
        let bindings = map(json!({"tx_hash": "ab", "status": "x"}));
        let err = update_event_to_sql("MYSTERY_UPDATE", "orders", &bindings).unwrap_err();
        let watcher_err = err.downcast_ref::<WatcherError>().unwrap();
        assert!(matches!(watcher_err, WatcherError::UnknownEventShape(_)));
    }

    #[test]
    fn missing_id_binding_is_fatal() {
        let bindings = map(json!({"status": "expired"}));
        let err = update_event_to_sql("ORDER_UPDATE", "orders", &bindings).unwrap_err();
        assert!(err.downcast_ref::<WatcherError>().is_some());
    }
}
