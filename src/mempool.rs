//! Mempool projection: a rebuilt-from-scratch view of unconfirmed events.
//!
//! The rebuild is wholesale — clean everything flagged with the mempool
//! block sentinel, then replay the ledger's current mempool snapshot — so
//! the view is never left partially applied when the snapshot churns.

use anyhow::Result;
use rand::Rng;
use serde_json::{Map, Value};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use tracing::{debug, trace, warn};

use crate::database;
use crate::event::{
    addresses_string, binding_i64, Event, MempoolEvent, MEMPOOL_BLOCK_INDEX, SKIP_EVENTS,
};
use crate::projection;
use crate::updaters;

/// Domain tables carrying a block_index, cleaned of unconfirmed rows on
/// every rebuild.
const MEMPOOL_CLEAN_TABLES: &[&str] = &[
    "blocks",
    "transactions",
    "assets",
    "credits",
    "debits",
    "issuances",
    "sends",
    "orders",
    "order_matches",
    "bets",
    "bet_matches",
    "dispensers",
    "dispenses",
    "sweeps",
    "broadcasts",
    "burns",
    "dividends",
    "destructions",
    "fairminters",
    "fairmints",
    "rps",
    "rps_matches",
    "order_expirations",
    "order_match_expirations",
    "bet_expirations",
    "bet_match_expirations",
    "rps_expirations",
    "rps_match_expirations",
    "address_options",
    "all_expirations",
    "transaction_count",
];

fn is_skipped_in_mempool(event: &str) -> bool {
    SKIP_EVENTS.contains(&event) || event == "NEW_BLOCK" || event == "BLOCK_PARSED"
}

/// tx_index values of unconfirmed transactions are expanded and randomised so
/// they can never collide with the dense confirmed sequence.
fn synthetic_tx_index(tx_index: i64) -> i64 {
    tx_index * 1000 + rand::thread_rng().gen_range(0..100_000_000)
}

/// Walk the error chain for a SQLite uniqueness violation and return the
/// offending `table.column`.
fn unique_violation_column(error: &anyhow::Error) -> Option<String> {
    let mut current: &dyn std::error::Error = error.as_ref();
    loop {
        if let Some(sqlx_error) = current.downcast_ref::<sqlx::Error>() {
            if let sqlx::Error::Database(db_error) = sqlx_error {
                return db_error
                    .message()
                    .strip_prefix("UNIQUE constraint failed: ")
                    .map(str::to_string);
            }
            return None;
        }
        match current.source() {
            Some(source) => current = source,
            None => return None,
        }
    }
}

/// Delete every trace of the unconfirmed view: the mempool table itself,
/// mempool-flagged rows in the domain tables, and unconfirmed asset rows.
pub async fn clean(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
    sqlx::query("DELETE FROM mempool").execute(&mut **tx).await?;
    for table in MEMPOOL_CLEAN_TABLES {
        let sql = format!("DELETE FROM {table} WHERE block_index = ?");
        sqlx::query(&sql)
            .bind(MEMPOOL_BLOCK_INDEX)
            .execute(&mut **tx)
            .await?;
    }
    sqlx::query("DELETE FROM assets_info WHERE confirmed = 0")
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Clean in a transaction of its own; used at catch-up start.
pub async fn clean_all(api_db: &SqlitePool) -> Result<()> {
    let mut tx = api_db.begin().await?;
    clean(&mut tx).await?;
    tx.commit().await?;
    Ok(())
}

/// Rebuild the mempool projection from the ledger's current snapshot.
///
/// Uniqueness violations are recoverable: a clash on the synthetic
/// transactions.tx_index gets one retry with a fresh randomisation, anything
/// else puts the tx_hash on the caller's skip list. Other SQL failures are
/// tolerated (and skip-listed) only when `tolerant` is set.
pub async fn synchronize(
    api_db: &SqlitePool,
    ledger_db: &SqlitePool,
    skip_list: &mut HashSet<String>,
    tolerant: bool,
) -> Result<()> {
    let events = database::get_ledger_mempool_events(ledger_db).await?;
    let mut tx = api_db.begin().await?;
    clean(&mut tx).await?;

    let mut projected = 0usize;
    for mempool_event in &events {
        if is_skipped_in_mempool(&mempool_event.event) {
            continue;
        }
        if skip_list.contains(&mempool_event.tx_hash) {
            trace!(tx_hash = %mempool_event.tx_hash, "Skipping known-bad mempool transaction");
            continue;
        }

        if let Err(error) = project_event(&mut tx, mempool_event).await {
            match unique_violation_column(&error).as_deref() {
                Some(column) => {
                    warn!(
                        tx_hash = %mempool_event.tx_hash,
                        column,
                        "Uniqueness violation in mempool projection, skip-listing"
                    );
                    skip_list.insert(mempool_event.tx_hash.clone());
                }
                None if tolerant => {
                    warn!(
                        tx_hash = %mempool_event.tx_hash,
                        error = %error,
                        "Tolerating mempool projection failure, skip-listing"
                    );
                    skip_list.insert(mempool_event.tx_hash.clone());
                }
                None => return Err(error),
            }
        } else {
            projected += 1;
        }
    }

    tx.commit().await?;
    debug!(
        snapshot = events.len(),
        projected, "Mempool projection rebuilt"
    );
    Ok(())
}

/// Project a single unconfirmed event: record it in the mempool table with
/// its search string, then apply the translator and the assets_info updater
/// under the mempool block sentinel. A collision on the synthetic
/// transactions.tx_index gets exactly one retry with a fresh randomisation.
async fn project_event(
    tx: &mut Transaction<'_, Sqlite>,
    mempool_event: &MempoolEvent,
) -> Result<()> {
    let mut bindings: Map<String, Value> = serde_json::from_str(&mempool_event.bindings)?;
    let addresses = addresses_string(&mempool_event.event, &bindings);

    sqlx::query(
        "INSERT INTO mempool (tx_hash, command, category, bindings, timestamp, event, addresses)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&mempool_event.tx_hash)
    .bind(&mempool_event.command)
    .bind(&mempool_event.category)
    .bind(&mempool_event.bindings)
    .bind(mempool_event.timestamp)
    .bind(&mempool_event.event)
    .bind(addresses)
    .execute(&mut **tx)
    .await?;

    bindings.insert("block_index".to_string(), Value::from(MEMPOOL_BLOCK_INDEX));
    let base_tx_index = binding_i64(&bindings, "tx_index");

    match apply_unconfirmed(tx, mempool_event, bindings.clone(), base_tx_index).await {
        Err(error)
            if base_tx_index.is_some()
                && unique_violation_column(&error).as_deref() == Some("transactions.tx_index") =>
        {
            trace!(
                tx_hash = %mempool_event.tx_hash,
                "Synthetic tx_index collided, retrying with a fresh randomisation"
            );
            apply_unconfirmed(tx, mempool_event, bindings, base_tx_index).await
        }
        result => result,
    }
}

async fn apply_unconfirmed(
    tx: &mut Transaction<'_, Sqlite>,
    mempool_event: &MempoolEvent,
    mut bindings: Map<String, Value>,
    base_tx_index: Option<i64>,
) -> Result<()> {
    if let Some(tx_index) = base_tx_index {
        bindings.insert(
            "tx_index".to_string(),
            Value::from(synthetic_tx_index(tx_index)),
        );
    }

    let event = Event {
        message_index: 0,
        block_index: MEMPOOL_BLOCK_INDEX,
        event: mempool_event.event.clone(),
        category: mempool_event.category.clone(),
        command: mempool_event.command.clone(),
        bindings: Value::Object(bindings.clone()).to_string(),
        timestamp: mempool_event.timestamp,
        tx_hash: Some(mempool_event.tx_hash.clone()),
        event_hash: None,
    };

    projection::execute_event(tx, &event, &bindings).await?;
    updaters::update_assets_info(tx, &event, &bindings).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_tx_index_expands_and_randomises() {
        for _ in 0..32 {
            let synthetic = synthetic_tx_index(7);
            assert!(synthetic >= 7000);
            assert!(synthetic < 7000 + 100_000_000);
        }
    }

    #[test]
    fn block_lifecycle_events_never_enter_the_mempool_view() {
        assert!(is_skipped_in_mempool("NEW_BLOCK"));
        assert!(is_skipped_in_mempool("BLOCK_PARSED"));
        assert!(is_skipped_in_mempool("NEW_TRANSACTION_OUTPUT"));
        assert!(!is_skipped_in_mempool("CREDIT"));
    }
}
