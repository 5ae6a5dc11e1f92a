// Store access: connection pools, migrations, bootstrap and read queries.
use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row, Sqlite, SqlitePool, TypeInfo, ValueRef};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::event::{Event, MempoolEvent, StoredEvent, XCP_ASSET};
use crate::migrations::{self, MIGRATIONS};
use crate::projection::WatcherError;

/// Historical issuance block bounds seeded on the XCP singleton row.
const XCP_FIRST_ISSUANCE_BLOCK: i64 = 278_319;
const XCP_LAST_ISSUANCE_BLOCK: i64 = 283_810;

const MIGRATION_LOCK_POLL: Duration = Duration::from_millis(250);

/// Open the projection store for the watcher. Single connection: the watcher
/// is the only writer, and every event applies inside one short transaction.
///
/// Foreign keys stay off for the lifetime of the connection; the mempool's
/// synthetic tx_index values would violate them.
pub async fn open_projection_db(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10))
        .foreign_keys(false);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Read-only pool over the projection store for API handlers. WAL mode lets
/// these readers run concurrently with the watcher's transactions.
pub async fn open_projection_reader(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Read-only pool over the primary ledger store.
pub async fn open_ledger_db(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Migrations
// ─────────────────────────────────────────────────────────

/// Apply all outstanding migrations in order, newest last, under the
/// advisory lock. A lock older than `lock_timeout` is considered stale and
/// broken (single-writer deployment invariant).
pub async fn apply_migrations(pool: &SqlitePool, lock_timeout: Duration) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations
             (name TEXT PRIMARY KEY, content_hash TEXT, applied_at INTEGER)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migration_lock
             (id INTEGER PRIMARY KEY CHECK (id = 1), pid INTEGER, acquired_at INTEGER)",
    )
    .execute(pool)
    .await?;

    acquire_migration_lock(pool, lock_timeout).await?;
    let result = apply_outstanding_migrations(pool).await;
    release_migration_lock(pool).await?;
    result
}

async fn apply_outstanding_migrations(pool: &SqlitePool) -> Result<()> {
    for migration in MIGRATIONS {
        let applied: Option<(String,)> =
            sqlx::query_as("SELECT content_hash FROM migrations WHERE name = ?")
                .bind(migration.name)
                .fetch_optional(pool)
                .await?;

        match applied {
            Some((hash,)) if hash == migration.content_hash() => continue,
            Some(_) => {
                return Err(WatcherError::MigrationMismatch(migration.name.to_string()).into())
            }
            None => {
                info!("Applying migration {}", migration.name);
                let mut tx = pool.begin().await?;
                migrations::apply(&mut tx, migration).await?;
                tx.commit().await?;
            }
        }
    }
    Ok(())
}

async fn acquire_migration_lock(pool: &SqlitePool, timeout: Duration) -> Result<()> {
    let pid = std::process::id() as i64;
    let deadline = Instant::now() + timeout;
    loop {
        let inserted = sqlx::query(
            "INSERT INTO migration_lock (id, pid, acquired_at) VALUES (1, ?, ?)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(pid)
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(());
        }

        if Instant::now() >= deadline {
            let holder: Option<(i64,)> =
                sqlx::query_as("SELECT pid FROM migration_lock WHERE id = 1")
                    .fetch_optional(pool)
                    .await?;
            warn!(
                holder_pid = holder.map(|(pid,)| pid),
                "Migration lock held past timeout, breaking stale lock"
            );
            sqlx::query("DELETE FROM migration_lock WHERE id = 1")
                .execute(pool)
                .await?;
            continue;
        }

        tokio::time::sleep(MIGRATION_LOCK_POLL).await;
    }
}

async fn release_migration_lock(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM migration_lock WHERE id = 1 AND pid = ?")
        .bind(std::process::id() as i64)
        .execute(pool)
        .await?;
    Ok(())
}

/// Seed the reserved BTC and XCP singleton rows. Idempotent.
pub async fn seed_reserved_assets(pool: &SqlitePool) -> Result<()> {
    let existing: Option<(String,)> =
        sqlx::query_as("SELECT asset_name FROM assets WHERE asset_name = 'BTC'")
            .fetch_optional(pool)
            .await?;
    if existing.is_some() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO assets (asset_id, asset_name, block_index, asset_longname)
         VALUES ('0', 'BTC', NULL, NULL)",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO assets (asset_id, asset_name, block_index, asset_longname)
         VALUES ('1', 'XCP', NULL, NULL)",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO assets_info
             (asset, asset_id, divisible, locked, supply, description,
              first_issuance_block_index, last_issuance_block_index, confirmed)
         VALUES (?, '1', 1, 1, 0, 'The protocol native currency', ?, ?, 1)",
    )
    .bind(XCP_ASSET)
    .bind(XCP_FIRST_ISSUANCE_BLOCK)
    .bind(XCP_LAST_ISSUANCE_BLOCK)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Dynamic rows and bindings
// ─────────────────────────────────────────────────────────

/// Bind one JSON scalar onto a dynamically-built query.
pub fn bind_json_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(flag) => query.bind(*flag),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                query.bind(integer)
            } else {
                query.bind(number.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(text) => query.bind(text.clone()),
        // Nested structures never appear in ledger bindings; serialise
        // defensively rather than panic.
        other => query.bind(other.to_string()),
    }
}

/// Convert a row into a column→scalar map, keyed by the value's actual
/// storage class rather than the declared column type.
pub fn row_to_json(row: &SqliteRow) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(index)?),
                "REAL" => Value::from(row.try_get::<f64, _>(index)?),
                "BLOB" => {
                    let bytes = row.try_get::<Vec<u8>, _>(index)?;
                    Value::from(
                        bytes
                            .iter()
                            .map(|byte| format!("{byte:02x}"))
                            .collect::<String>(),
                    )
                }
                _ => Value::from(row.try_get::<String, _>(index)?),
            }
        };
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}

fn event_from_row(row: &SqliteRow) -> Result<Event> {
    Ok(Event {
        message_index: row.try_get("message_index")?,
        block_index: row.try_get("block_index")?,
        event: row.try_get("event")?,
        category: row.try_get("category")?,
        command: row.try_get("command")?,
        bindings: row.try_get("bindings")?,
        timestamp: row.try_get("timestamp").unwrap_or(None),
        tx_hash: row.try_get("tx_hash")?,
        event_hash: row.try_get("event_hash")?,
    })
}

pub(crate) fn stored_event_from_row(row: &SqliteRow) -> Result<StoredEvent> {
    Ok(StoredEvent {
        message_index: row.try_get("message_index")?,
        block_index: row.try_get("block_index")?,
        event: row.try_get("event")?,
        category: row.try_get("category")?,
        command: row.try_get("command")?,
        bindings: row.try_get("bindings")?,
        timestamp: row.try_get("timestamp").unwrap_or(None),
        tx_hash: row.try_get("tx_hash")?,
        event_hash: row.try_get("event_hash")?,
        previous_state: row.try_get("previous_state")?,
        insert_rowid: row.try_get("insert_rowid")?,
    })
}

// ─────────────────────────────────────────────────────────
// Watcher cursors
// ─────────────────────────────────────────────────────────

/// Highest message index applied to the projection, if any.
pub async fn get_last_parsed_message_index(api_db: &SqlitePool) -> Result<Option<i64>> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT message_index FROM messages ORDER BY message_index DESC LIMIT 1")
            .fetch_optional(api_db)
            .await?;
    Ok(row.map(|(index,)| index))
}

/// Last projection event in full, for reconciliation and rollback.
pub async fn get_last_stored_event(api_db: &SqlitePool) -> Result<Option<StoredEvent>> {
    let row = sqlx::query("SELECT * FROM messages ORDER BY message_index DESC LIMIT 1")
        .fetch_optional(api_db)
        .await?;
    row.map(|row| stored_event_from_row(&row)).transpose()
}

/// The single ledger event the projection should apply next: the successor of
/// the projection head, or the ledger's first event when the projection is
/// empty. A missing successor means no work yet.
pub async fn get_next_event_to_parse(
    api_db: &SqlitePool,
    ledger_db: &SqlitePool,
) -> Result<Option<Event>> {
    let row = match get_last_parsed_message_index(api_db).await? {
        Some(last_index) => {
            sqlx::query("SELECT * FROM messages WHERE message_index = ?")
                .bind(last_index + 1)
                .fetch_optional(ledger_db)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM messages ORDER BY message_index ASC LIMIT 1")
                .fetch_optional(ledger_db)
                .await?
        }
    };
    row.map(|row| event_from_row(&row)).transpose()
}

/// Ledger event at an exact index, for head fingerprint comparison.
pub async fn get_ledger_event(
    ledger_db: &SqlitePool,
    message_index: i64,
) -> Result<Option<Event>> {
    let row = sqlx::query("SELECT * FROM messages WHERE message_index = ?")
        .bind(message_index)
        .fetch_optional(ledger_db)
        .await?;
    row.map(|row| event_from_row(&row)).transpose()
}

/// How far behind the projection is, for catch-up progress reporting.
pub async fn get_event_to_parse_count(
    api_db: &SqlitePool,
    ledger_db: &SqlitePool,
) -> Result<i64> {
    let last_parsed = get_last_parsed_message_index(api_db).await?.unwrap_or(-1);
    let ledger_head: Option<(i64,)> =
        sqlx::query_as("SELECT message_index FROM messages ORDER BY message_index DESC LIMIT 1")
            .fetch_optional(ledger_db)
            .await?;
    Ok(ledger_head
        .map(|(head,)| head - last_parsed)
        .unwrap_or(0)
        .max(0))
}

/// Block height of the projection head, if any block has been applied.
pub async fn get_last_block_index(api_db: &SqlitePool) -> Result<Option<i64>> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT block_index FROM blocks ORDER BY block_index DESC LIMIT 1")
            .fetch_optional(api_db)
            .await?;
    Ok(row.map(|(index,)| index))
}

/// Snapshot of the ledger's current mempool view.
pub async fn get_ledger_mempool_events(ledger_db: &SqlitePool) -> Result<Vec<MempoolEvent>> {
    let rows = sqlx::query("SELECT * FROM mempool")
        .fetch_all(ledger_db)
        .await?;
    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        events.push(MempoolEvent {
            tx_hash: row.try_get("tx_hash")?,
            command: row.try_get("command")?,
            category: row.try_get("category")?,
            bindings: row.try_get("bindings")?,
            event: row.try_get("event")?,
            timestamp: row.try_get("timestamp").unwrap_or(None),
        });
    }
    Ok(events)
}

// ─────────────────────────────────────────────────────────
// Read API queries
// ─────────────────────────────────────────────────────────

pub async fn get_last_block(pool: &SqlitePool) -> Result<Option<Value>> {
    let row = sqlx::query("SELECT * FROM blocks ORDER BY block_index DESC LIMIT 1")
        .fetch_optional(pool)
        .await?;
    row.map(|row| row_to_json(&row).map(Value::Object))
        .transpose()
}

pub async fn get_recent_events(pool: &SqlitePool, limit: i64) -> Result<Vec<Value>> {
    let rows = sqlx::query(
        "SELECT message_index, block_index, event, category, command, bindings, tx_hash, event_hash
         FROM messages ORDER BY message_index DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| row_to_json(row).map(Value::Object))
        .collect()
}

pub async fn get_address_balances(pool: &SqlitePool, address: &str) -> Result<Vec<Value>> {
    let rows = sqlx::query(
        "SELECT address, utxo, asset, quantity FROM balances
         WHERE address = ? AND quantity != 0 ORDER BY asset",
    )
    .bind(address)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| row_to_json(row).map(Value::Object))
        .collect()
}

pub async fn get_address_events(
    pool: &SqlitePool,
    address: &str,
    limit: i64,
) -> Result<Vec<Value>> {
    let rows = sqlx::query(
        "SELECT m.message_index, m.block_index, m.event, m.category, m.bindings, m.tx_hash
         FROM address_events ae JOIN messages m ON m.message_index = ae.message_index
         WHERE ae.address = ? ORDER BY m.message_index DESC LIMIT ?",
    )
    .bind(address)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| row_to_json(row).map(Value::Object))
        .collect()
}

pub async fn get_asset_info(pool: &SqlitePool, asset: &str) -> Result<Option<Value>> {
    let row = sqlx::query("SELECT * FROM assets_info WHERE asset = ? OR asset_longname = ?")
        .bind(asset)
        .bind(asset)
        .fetch_optional(pool)
        .await?;
    row.map(|row| row_to_json(&row).map(Value::Object))
        .transpose()
}

pub async fn get_mempool_events(pool: &SqlitePool, address: Option<&str>) -> Result<Vec<Value>> {
    let rows = match address {
        Some(address) => {
            // `addresses` is a space-separated search string
            sqlx::query(
                "SELECT * FROM mempool
                 WHERE ' ' || addresses || ' ' LIKE '% ' || ? || ' %'
                 ORDER BY timestamp DESC",
            )
            .bind(address)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query("SELECT * FROM mempool ORDER BY timestamp DESC")
                .fetch_all(pool)
                .await?
        }
    };
    rows.iter()
        .map(|row| row_to_json(row).map(Value::Object))
        .collect()
}

/// Raw row fetch keyed by a generated WHERE clause; shared by the translator
/// and the updaters for previous-state capture and refreshes.
pub async fn fetch_row_as_json(
    executor: &mut sqlx::SqliteConnection,
    sql: &str,
    values: &[Value],
) -> Result<Option<Map<String, Value>>> {
    let mut query = sqlx::query(sql);
    for value in values {
        query = bind_json_value(query, value);
    }
    let row = query
        .fetch_optional(executor)
        .await
        .with_context(|| anyhow!("query failed: {sql}"))?;
    row.map(|row| row_to_json(&row)).transpose()
}
