//! Side-table updaters: the aggregates maintained next to the primary
//! event-to-row translation. Each one is symmetric — the `inverse` flag (or
//! the dedicated rollback function) undoes exactly what apply did.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use sqlx::{Sqlite, Transaction};

use crate::database::{bind_json_value, fetch_row_as_json, row_to_json};
use crate::event::{
    binding_i64, binding_status_valid, binding_str, expiration_object_id_field, Event,
    ASSET_EVENTS, XCP_ASSET, XCP_DESTROY_EVENTS,
};

fn map_flag(map: &Map<String, Value>, field: &str) -> bool {
    binding_i64(map, field).unwrap_or(0) != 0
}

// ─────────────────────────────────────────────────────────
// Balances
// ─────────────────────────────────────────────────────────

/// Fold a DEBIT or CREDIT into the balances table. The holder key is the
/// UTXO when one is bound, the address otherwise. Rows that reach zero are
/// removed so that undoing a creating event leaves no trace.
pub async fn update_balances(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
    bindings: &Map<String, Value>,
    inverse: bool,
) -> Result<()> {
    let kind = event.event.as_str();
    if kind != "DEBIT" && kind != "CREDIT" {
        return Ok(());
    }
    let mut quantity = binding_i64(bindings, "quantity").unwrap_or(0);
    if quantity == 0 {
        return Ok(());
    }
    // The inverse of a DEBIT is a CREDIT of the same quantity.
    if (kind == "DEBIT") != inverse {
        quantity = -quantity;
    }

    let asset = binding_str(bindings, "asset")
        .ok_or_else(|| anyhow!("{kind} without asset at event {}", event.message_index))?;
    let (key_field, holder) = match binding_str(bindings, "utxo") {
        Some(utxo) => ("utxo", utxo),
        None => (
            "address",
            binding_str(bindings, "address").ok_or_else(|| {
                anyhow!("{kind} without address or utxo at event {}", event.message_index)
            })?,
        ),
    };

    let select = format!("SELECT quantity FROM balances WHERE {key_field} = ? AND asset = ?");
    let existing = sqlx::query(&select)
        .bind(holder)
        .bind(asset)
        .fetch_optional(&mut **tx)
        .await?;

    if existing.is_some() {
        let update =
            format!("UPDATE balances SET quantity = quantity + ? WHERE {key_field} = ? AND asset = ?");
        sqlx::query(&update)
            .bind(quantity)
            .bind(holder)
            .bind(asset)
            .execute(&mut **tx)
            .await?;
    } else if key_field == "utxo" {
        sqlx::query(
            "INSERT INTO balances (address, utxo, utxo_address, asset, quantity)
             VALUES (NULL, ?, ?, ?, ?)",
        )
        .bind(holder)
        .bind(binding_str(bindings, "utxo_address"))
        .bind(asset)
        .bind(quantity)
        .execute(&mut **tx)
        .await?;
    } else {
        sqlx::query(
            "INSERT INTO balances (address, utxo, utxo_address, asset, quantity)
             VALUES (?, NULL, NULL, ?, ?)",
        )
        .bind(holder)
        .bind(asset)
        .bind(quantity)
        .execute(&mut **tx)
        .await?;
    }

    let purge = format!("DELETE FROM balances WHERE {key_field} = ? AND asset = ? AND quantity = 0");
    sqlx::query(&purge)
        .bind(holder)
        .bind(asset)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Expirations
// ─────────────────────────────────────────────────────────

pub async fn update_expiration(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
    bindings: &Map<String, Value>,
    inverse: bool,
) -> Result<()> {
    let Some(object_field) = expiration_object_id_field(&event.event) else {
        return Ok(());
    };
    let object_id = bindings
        .get(object_field)
        .cloned()
        .ok_or_else(|| anyhow!("{} without {object_field}", event.event))?;
    let block_index = binding_i64(bindings, "block_index").unwrap_or(event.block_index);
    let expiration_type = event.event.replace("_EXPIRATION", "").to_lowercase();

    let sql = if inverse {
        "DELETE FROM all_expirations WHERE type = ? AND block_index = ? AND object_id = ?"
    } else {
        "INSERT INTO all_expirations (type, block_index, object_id) VALUES (?, ?, ?)"
    };
    let query = sqlx::query(sql).bind(expiration_type).bind(block_index);
    bind_json_value(query, &object_id).execute(&mut **tx).await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Assets info
// ─────────────────────────────────────────────────────────

async fn fetch_asset_info_row(
    tx: &mut Transaction<'_, Sqlite>,
    asset: Option<&str>,
    asset_longname: Option<&str>,
) -> Result<Option<Map<String, Value>>> {
    if let Some(asset) = asset {
        let row = fetch_row_as_json(
            &mut *tx,
            "SELECT * FROM assets_info WHERE asset = ?",
            &[Value::from(asset)],
        )
        .await?;
        if row.is_some() {
            return Ok(row);
        }
    }
    if let Some(longname) = asset_longname {
        return fetch_row_as_json(
            &mut *tx,
            "SELECT * FROM assets_info WHERE asset_longname = ?",
            &[Value::from(longname)],
        )
        .await;
    }
    Ok(None)
}

/// Maintain the denormalised per-asset row. Unconfirmed events may create and
/// grow unconfirmed rows but never touch confirmed state; the mempool cleaner
/// removes everything they produced.
pub async fn update_assets_info(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
    bindings: &Map<String, Value>,
) -> Result<()> {
    if !ASSET_EVENTS.contains(&event.event.as_str()) {
        return Ok(());
    }
    if !binding_status_valid(bindings) {
        return Ok(());
    }
    let confirmed = !event.is_mempool();

    match event.event.as_str() {
        "ASSET_CREATION" => {
            let asset_name = binding_str(bindings, "asset_name")
                .ok_or_else(|| anyhow!("ASSET_CREATION without asset_name"))?;
            if !confirmed {
                let existing = fetch_asset_info_row(tx, Some(asset_name), None).await?;
                if existing.map(|row| map_flag(&row, "confirmed")).unwrap_or(false) {
                    return Ok(());
                }
            }
            sqlx::query(
                "INSERT OR REPLACE INTO assets_info
                     (asset, asset_id, asset_longname,
                      first_issuance_block_index, last_issuance_block_index, confirmed)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(asset_name)
            .bind(binding_str(bindings, "asset_id"))
            .bind(binding_str(bindings, "asset_longname"))
            .bind(binding_i64(bindings, "block_index").unwrap_or(event.block_index))
            .bind(binding_i64(bindings, "block_index").unwrap_or(event.block_index))
            .bind(confirmed)
            .execute(&mut **tx)
            .await?;
        }
        "ASSET_ISSUANCE" | "RESET_ISSUANCE" => {
            apply_issuance(tx, event, bindings, confirmed).await?;
        }
        "ASSET_DESTRUCTION" => {
            if !confirmed {
                return Ok(());
            }
            sqlx::query("UPDATE assets_info SET supply = supply - ? WHERE asset = ?")
                .bind(binding_i64(bindings, "quantity").unwrap_or(0))
                .bind(binding_str(bindings, "asset"))
                .execute(&mut **tx)
                .await?;
        }
        "ASSET_TRANSFER" => {
            if !confirmed {
                return Ok(());
            }
            sqlx::query("UPDATE assets_info SET owner = ? WHERE asset = ?")
                .bind(binding_str(bindings, "issuer"))
                .bind(binding_str(bindings, "asset"))
                .execute(&mut **tx)
                .await?;
        }
        "BURN" => {
            if !confirmed {
                return Ok(());
            }
            sqlx::query("UPDATE assets_info SET supply = supply + ? WHERE asset = ?")
                .bind(binding_i64(bindings, "earned").unwrap_or(0))
                .bind(XCP_ASSET)
                .execute(&mut **tx)
                .await?;
        }
        _ => unreachable!("gated by ASSET_EVENTS"),
    }
    Ok(())
}

async fn apply_issuance(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
    bindings: &Map<String, Value>,
    confirmed: bool,
) -> Result<()> {
    let asset = binding_str(bindings, "asset");
    let asset_longname = binding_str(bindings, "asset_longname");
    // Only confirmed issuances move supply; an unconfirmed one previews
    // metadata without minting anything.
    let quantity = if confirmed {
        binding_i64(bindings, "quantity").unwrap_or(0)
    } else {
        0
    };
    let block_index = binding_i64(bindings, "block_index").unwrap_or(event.block_index);
    let issuer = binding_str(bindings, "issuer");

    let existing = fetch_asset_info_row(tx, asset, asset_longname).await?;
    match existing {
        Some(info) => {
            // A confirmed row is authoritative; mempool issuances may not
            // overwrite it.
            if map_flag(&info, "confirmed") && !confirmed {
                return Ok(());
            }
            let locked = map_flag(&info, "locked") || map_flag(bindings, "locked");
            // The first issuer sticks for the asset's lifetime.
            let first_issuer = match info.get("issuer") {
                Some(Value::String(existing_issuer)) if !existing_issuer.is_empty() => {
                    Some(existing_issuer.clone())
                }
                _ => issuer.map(str::to_string),
            };
            let row_key = info
                .get("asset")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("assets_info row without asset name"))?;
            sqlx::query(
                "UPDATE assets_info SET
                     divisible = ?, description = ?, owner = ?, issuer = ?,
                     supply = supply + ?, locked = ?, last_issuance_block_index = ?,
                     asset_longname = COALESCE(?, asset_longname)
                 WHERE asset = ?",
            )
            .bind(map_flag(bindings, "divisible"))
            .bind(binding_str(bindings, "description"))
            .bind(issuer)
            .bind(first_issuer)
            .bind(quantity)
            .bind(locked)
            .bind(block_index)
            .bind(asset_longname)
            .bind(row_key)
            .execute(&mut **tx)
            .await?;
        }
        None => {
            sqlx::query(
                "INSERT INTO assets_info
                     (asset, asset_longname, issuer, owner, divisible, locked, supply,
                      description, first_issuance_block_index, last_issuance_block_index,
                      confirmed)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(asset)
            .bind(asset_longname)
            .bind(issuer)
            .bind(issuer)
            .bind(map_flag(bindings, "divisible"))
            .bind(map_flag(bindings, "locked"))
            .bind(quantity)
            .bind(binding_str(bindings, "description"))
            .bind(block_index)
            .bind(block_index)
            .bind(confirmed)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

/// Undo the assets_info effect of one event. The issuance-shaped cases are
/// recomputed wholesale from the issuance log, which at this point no longer
/// contains the row being undone.
pub async fn rollback_assets_info(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
    bindings: &Map<String, Value>,
) -> Result<()> {
    if !ASSET_EVENTS.contains(&event.event.as_str()) {
        return Ok(());
    }
    if !binding_status_valid(bindings) {
        return Ok(());
    }
    let confirmed = !event.is_mempool();

    match event.event.as_str() {
        "ASSET_CREATION" => {
            sqlx::query("DELETE FROM assets_info WHERE asset_id = ? AND confirmed = ?")
                .bind(binding_str(bindings, "asset_id"))
                .bind(confirmed)
                .execute(&mut **tx)
                .await?;
        }
        "ASSET_ISSUANCE" | "RESET_ISSUANCE" => {
            if !confirmed {
                return Ok(());
            }
            if let Some(asset) = binding_str(bindings, "asset").or(binding_str(bindings, "asset_longname")) {
                refresh_assets_info(tx, asset).await?;
            }
        }
        "ASSET_DESTRUCTION" => {
            if !confirmed {
                return Ok(());
            }
            sqlx::query("UPDATE assets_info SET supply = supply + ? WHERE asset = ?")
                .bind(binding_i64(bindings, "quantity").unwrap_or(0))
                .bind(binding_str(bindings, "asset"))
                .execute(&mut **tx)
                .await?;
        }
        "ASSET_TRANSFER" => {
            if !confirmed {
                return Ok(());
            }
            if let Some(asset) = binding_str(bindings, "asset") {
                refresh_assets_info(tx, asset).await?;
            }
        }
        "BURN" => {
            if !confirmed {
                return Ok(());
            }
            sqlx::query("UPDATE assets_info SET supply = supply - ? WHERE asset = ?")
                .bind(binding_i64(bindings, "earned").unwrap_or(0))
                .bind(XCP_ASSET)
                .execute(&mut **tx)
                .await?;
        }
        _ => unreachable!("gated by ASSET_EVENTS"),
    }
    Ok(())
}

/// Recompute every assets_info field from the valid issuance log, minus valid
/// destructions. The issuance log is the authority: first issuance fixes the
/// issuer and the first block, the last one fixes owner, description,
/// divisibility and longname, and a lock anywhere sticks.
pub async fn refresh_assets_info(tx: &mut Transaction<'_, Sqlite>, asset: &str) -> Result<()> {
    let rows = sqlx::query(
        "SELECT * FROM issuances
         WHERE status = 'valid' AND (asset = ?1 OR asset_longname = ?1)
         ORDER BY rowid",
    )
    .bind(asset)
    .fetch_all(&mut **tx)
    .await?;

    if rows.is_empty() {
        sqlx::query("DELETE FROM assets_info WHERE asset = ?1 OR asset_longname = ?1")
            .bind(asset)
            .execute(&mut **tx)
            .await?;
        return Ok(());
    }

    let mut issuances = Vec::with_capacity(rows.len());
    for row in &rows {
        issuances.push(row_to_json(row)?);
    }
    let first = &issuances[0];
    let last = &issuances[issuances.len() - 1];

    let issued: i64 = issuances
        .iter()
        .map(|issuance| binding_i64(issuance, "quantity").unwrap_or(0))
        .sum();
    let destroyed: (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(quantity), 0) FROM destructions
         WHERE status = 'valid' AND asset = ?",
    )
    .bind(asset)
    .fetch_one(&mut **tx)
    .await?;
    let locked = issuances.iter().any(|issuance| map_flag(issuance, "locked"));

    let asset_name = last
        .get("asset")
        .and_then(Value::as_str)
        .unwrap_or(asset)
        .to_string();
    let updated = sqlx::query(
        "UPDATE assets_info SET
             asset = ?, asset_longname = ?, issuer = ?, owner = ?, divisible = ?,
             locked = ?, supply = ?, description = ?,
             first_issuance_block_index = ?, last_issuance_block_index = ?, confirmed = 1
         WHERE asset = ?11 OR asset_longname = ?11",
    )
    .bind(&asset_name)
    .bind(last.get("asset_longname").and_then(Value::as_str))
    .bind(first.get("issuer").and_then(Value::as_str))
    .bind(last.get("issuer").and_then(Value::as_str))
    .bind(map_flag(last, "divisible"))
    .bind(locked)
    .bind(issued - destroyed.0)
    .bind(last.get("description").and_then(Value::as_str))
    .bind(binding_i64(first, "block_index"))
    .bind(binding_i64(last, "block_index"))
    .bind(asset)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if updated == 0 {
        let asset_id: Option<(Option<String>,)> =
            sqlx::query_as("SELECT asset_id FROM assets WHERE asset_name = ?")
                .bind(&asset_name)
                .fetch_optional(&mut **tx)
                .await?;
        sqlx::query(
            "INSERT INTO assets_info
                 (asset, asset_id, asset_longname, issuer, owner, divisible, locked,
                  supply, description, first_issuance_block_index,
                  last_issuance_block_index, confirmed)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(&asset_name)
        .bind(asset_id.and_then(|(id,)| id))
        .bind(last.get("asset_longname").and_then(Value::as_str))
        .bind(first.get("issuer").and_then(Value::as_str))
        .bind(last.get("issuer").and_then(Value::as_str))
        .bind(map_flag(last, "divisible"))
        .bind(locked)
        .bind(issued - destroyed.0)
        .bind(last.get("description").and_then(Value::as_str))
        .bind(binding_i64(first, "block_index"))
        .bind(binding_i64(last, "block_index"))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// XCP supply destruction
// ─────────────────────────────────────────────────────────

/// Fees on supply-destroying events burn XCP.
pub async fn update_xcp_supply(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
    bindings: &Map<String, Value>,
    inverse: bool,
) -> Result<()> {
    if !XCP_DESTROY_EVENTS.contains(&event.event.as_str()) {
        return Ok(());
    }
    let fee_paid = binding_i64(bindings, "fee_paid").unwrap_or(0);
    if fee_paid == 0 {
        return Ok(());
    }
    let delta = if inverse { fee_paid } else { -fee_paid };
    sqlx::query("UPDATE assets_info SET supply = supply + ? WHERE asset = ?")
        .bind(delta)
        .bind(XCP_ASSET)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Address events
// ─────────────────────────────────────────────────────────

pub async fn update_address_events(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
    bindings: &Map<String, Value>,
) -> Result<()> {
    for field in crate::event::address_fields(&event.event) {
        if let Some(address) = binding_str(bindings, field) {
            sqlx::query("INSERT INTO address_events (address, message_index) VALUES (?, ?)")
                .bind(address)
                .bind(event.message_index)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

pub async fn rollback_address_events(
    tx: &mut Transaction<'_, Sqlite>,
    message_index: i64,
) -> Result<()> {
    sqlx::query("DELETE FROM address_events WHERE message_index = ?")
        .bind(message_index)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Fairminter counters
// ─────────────────────────────────────────────────────────

pub async fn update_fairminters(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
    bindings: &Map<String, Value>,
    inverse: bool,
) -> Result<()> {
    if event.event != "NEW_FAIRMINT" {
        return Ok(());
    }
    if !binding_status_valid(bindings) {
        return Ok(());
    }
    let sign = if inverse { -1 } else { 1 };
    sqlx::query(
        "UPDATE fairminters SET
             earned_quantity = COALESCE(earned_quantity, 0) + ?,
             commission = COALESCE(commission, 0) + ?,
             paid_quantity = COALESCE(paid_quantity, 0) + ?
         WHERE tx_hash = ?",
    )
    .bind(binding_i64(bindings, "earn_quantity").unwrap_or(0) * sign)
    .bind(binding_i64(bindings, "commission").unwrap_or(0) * sign)
    .bind(binding_i64(bindings, "paid_quantity").unwrap_or(0) * sign)
    .bind(binding_str(bindings, "fairminter_tx_hash"))
    .execute(&mut **tx)
    .await?;
    Ok(())
}
