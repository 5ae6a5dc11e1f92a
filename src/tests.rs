//! End-to-end scenarios over real store pairs: a writable stand-in for the
//! ledger and a fully migrated projection, both file-backed in a temp dir.

use serde_json::{json, Map, Value};
use sqlx::{Executor, SqlitePool};
use std::collections::HashSet;
use std::time::Duration;
use tempfile::TempDir;

use crate::database;
use crate::event::{Event, MEMPOOL_BLOCK_INDEX};
use crate::migrations::MIGRATIONS;
use crate::{mempool, projection, watcher};

const LEDGER_SCHEMA: &str = r#"
CREATE TABLE messages (
    message_index INTEGER PRIMARY KEY,
    block_index INTEGER,
    event TEXT,
    category TEXT,
    command TEXT,
    bindings TEXT,
    timestamp INTEGER,
    tx_hash TEXT,
    event_hash TEXT
);
CREATE TABLE mempool (
    tx_hash TEXT,
    command TEXT,
    category TEXT,
    bindings TEXT,
    timestamp INTEGER,
    event TEXT
);
"#;

async fn setup() -> (TempDir, SqlitePool, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();

    let api_db = database::open_projection_db(&dir.path().join("api.db"))
        .await
        .unwrap();
    database::apply_migrations(&api_db, Duration::from_secs(5))
        .await
        .unwrap();
    database::seed_reserved_assets(&api_db).await.unwrap();

    // Writable stand-in for the primary ledger store.
    let ledger_db = database::open_projection_db(&dir.path().join("ledger.db"))
        .await
        .unwrap();
    ledger_db.execute(LEDGER_SCHEMA).await.unwrap();

    (dir, api_db, ledger_db)
}

fn event(
    message_index: i64,
    block_index: i64,
    kind: &str,
    category: &str,
    command: &str,
    bindings: Value,
) -> Event {
    Event {
        message_index,
        block_index,
        event: kind.to_string(),
        category: category.to_string(),
        command: command.to_string(),
        bindings: bindings.to_string(),
        timestamp: Some(1_700_000_000),
        tx_hash: Some(format!("tx{message_index}")),
        event_hash: Some(format!("{kind}-{message_index}")),
    }
}

fn credit(message_index: i64, block_index: i64, address: &str, asset: &str, quantity: i64) -> Event {
    event(
        message_index,
        block_index,
        "CREDIT",
        "credits",
        "insert",
        json!({
            "address": address,
            "asset": asset,
            "quantity": quantity,
            "calling_function": "send",
            "event": format!("tx{message_index}"),
            "tx_index": message_index,
            "block_index": block_index
        }),
    )
}

fn debit(message_index: i64, block_index: i64, address: &str, asset: &str, quantity: i64) -> Event {
    event(
        message_index,
        block_index,
        "DEBIT",
        "debits",
        "insert",
        json!({
            "address": address,
            "asset": asset,
            "quantity": quantity,
            "action": "send",
            "event": format!("tx{message_index}"),
            "tx_index": message_index,
            "block_index": block_index
        }),
    )
}

fn issuance(
    message_index: i64,
    block_index: i64,
    asset: &str,
    quantity: i64,
    issuer: &str,
    description: &str,
    locked: bool,
) -> Event {
    event(
        message_index,
        block_index,
        "ASSET_ISSUANCE",
        "issuances",
        "insert",
        json!({
            "tx_index": message_index,
            "tx_hash": format!("tx{message_index}"),
            "block_index": block_index,
            "asset": asset,
            "quantity": quantity,
            "divisible": true,
            "source": issuer,
            "issuer": issuer,
            "description": description,
            "fee_paid": 0,
            "locked": locked,
            "status": "valid",
            "asset_longname": null
        }),
    )
}

fn open_order(message_index: i64, block_index: i64, tx_hash: &str, source: &str) -> Event {
    event(
        message_index,
        block_index,
        "OPEN_ORDER",
        "orders",
        "insert",
        json!({
            "tx_index": message_index,
            "tx_hash": tx_hash,
            "block_index": block_index,
            "source": source,
            "give_asset": "XCP",
            "give_quantity": 100,
            "give_remaining": 100,
            "get_asset": "BTC",
            "get_quantity": 1,
            "get_remaining": 1,
            "expiration": 10,
            "expire_index": block_index + 10,
            "fee_required": 0,
            "fee_required_remaining": 0,
            "fee_provided": 0,
            "fee_provided_remaining": 0,
            "status": "open"
        }),
    )
}

async fn insert_ledger_event(ledger_db: &SqlitePool, event: &Event) {
    sqlx::query(
        "INSERT INTO messages
             (message_index, block_index, event, category, command, bindings,
              timestamp, tx_hash, event_hash)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
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
    .execute(ledger_db)
    .await
    .unwrap();
}

async fn insert_ledger_mempool_event(
    ledger_db: &SqlitePool,
    tx_hash: &str,
    kind: &str,
    category: &str,
    bindings: Value,
) {
    sqlx::query(
        "INSERT INTO mempool (tx_hash, command, category, bindings, timestamp, event)
         VALUES (?, 'insert', ?, ?, 1700000000, ?)",
    )
    .bind(tx_hash)
    .bind(category)
    .bind(bindings.to_string())
    .bind(kind)
    .execute(ledger_db)
    .await
    .unwrap();
}

/// Reconcile then pull ledger events until none is pending, the way the
/// watcher's catch-up loop does.
async fn drain(api_db: &SqlitePool, ledger_db: &SqlitePool) {
    watcher::reconcile(api_db, ledger_db).await.unwrap();
    while let Some(next) = database::get_next_event_to_parse(api_db, ledger_db)
        .await
        .unwrap()
    {
        projection::parse_event(api_db, &next).await.unwrap();
    }
}

async fn balance(api_db: &SqlitePool, address: &str, asset: &str) -> Option<i64> {
    sqlx::query_as::<_, (i64,)>(
        "SELECT quantity FROM balances WHERE address = ? AND asset = ?",
    )
    .bind(address)
    .bind(asset)
    .fetch_optional(api_db)
    .await
    .unwrap()
    .map(|(quantity,)| quantity)
}

async fn table_count(api_db: &SqlitePool, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    sqlx::query_as::<_, (i64,)>(&sql)
        .fetch_one(api_db)
        .await
        .unwrap()
        .0
}

async fn fetch_asset_info(api_db: &SqlitePool, asset: &str) -> Option<Map<String, Value>> {
    let row = sqlx::query("SELECT * FROM assets_info WHERE asset = ?")
        .bind(asset)
        .fetch_optional(api_db)
        .await
        .unwrap();
    row.map(|row| database::row_to_json(&row).unwrap())
}

async fn dump_table(api_db: &SqlitePool, table: &str) -> Vec<Map<String, Value>> {
    let sql = format!("SELECT * FROM {table} ORDER BY rowid");
    let rows = sqlx::query(&sql).fetch_all(api_db).await.unwrap();
    rows.iter()
        .map(|row| database::row_to_json(row).unwrap())
        .collect()
}

async fn snapshot(api_db: &SqlitePool, tables: &[&str]) -> Value {
    let mut dump = Map::new();
    for table in tables {
        let rows: Vec<Value> = dump_table(api_db, table)
            .await
            .into_iter()
            .map(Value::Object)
            .collect();
        dump.insert(table.to_string(), Value::Array(rows));
    }
    Value::Object(dump)
}

const SNAPSHOT_TABLES: &[&str] = &[
    "messages",
    "balances",
    "credits",
    "debits",
    "orders",
    "issuances",
    "assets_info",
    "all_expirations",
    "address_events",
];

// ─────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn balances_accumulate_and_unwind() {
    let (_dir, api_db, _ledger_db) = setup().await;

    projection::parse_event(&api_db, &credit(1, 1, "addrA", "XCP", 100))
        .await
        .unwrap();
    projection::parse_event(&api_db, &credit(2, 1, "addrA", "XCP", 50))
        .await
        .unwrap();
    projection::parse_event(&api_db, &debit(3, 2, "addrA", "XCP", 30))
        .await
        .unwrap();

    assert_eq!(balance(&api_db, "addrA", "XCP").await, Some(120));

    projection::rollback(&api_db, 0).await.unwrap();
    assert_eq!(table_count(&api_db, "balances").await, 0);
    assert_eq!(table_count(&api_db, "messages").await, 0);
}

#[tokio::test]
async fn utxo_balances_are_keyed_separately() {
    let (_dir, api_db, _ledger_db) = setup().await;

    let utxo_credit = event(
        1,
        1,
        "CREDIT",
        "credits",
        "insert",
        json!({
            "address": null,
            "utxo": "deadbeef:0",
            "utxo_address": "addrA",
            "asset": "XCP",
            "quantity": 40,
            "calling_function": "attach",
            "event": "tx1",
            "tx_index": 1,
            "block_index": 1
        }),
    );
    projection::parse_event(&api_db, &utxo_credit).await.unwrap();
    projection::parse_event(&api_db, &credit(2, 1, "addrA", "XCP", 7))
        .await
        .unwrap();

    let utxo_row = sqlx::query_as::<_, (i64,)>(
        "SELECT quantity FROM balances WHERE utxo = ? AND asset = 'XCP'",
    )
    .bind("deadbeef:0")
    .fetch_one(&api_db)
    .await
    .unwrap();
    assert_eq!(utxo_row.0, 40);
    assert_eq!(balance(&api_db, "addrA", "XCP").await, Some(7));
}

#[tokio::test]
async fn zero_quantity_credit_writes_no_balance() {
    let (_dir, api_db, _ledger_db) = setup().await;

    projection::parse_event(&api_db, &credit(1, 1, "addrA", "XCP", 0))
        .await
        .unwrap();

    assert_eq!(table_count(&api_db, "balances").await, 0);
    assert_eq!(table_count(&api_db, "messages").await, 1);
}

#[tokio::test]
async fn unconfirmed_issuance_previews_without_minting() {
    let (_dir, api_db, _ledger_db) = setup().await;

    let creation = event(
        1,
        MEMPOOL_BLOCK_INDEX,
        "ASSET_CREATION",
        "assets",
        "insert",
        json!({
            "asset_id": "42",
            "asset_name": "FOO",
            "block_index": MEMPOOL_BLOCK_INDEX,
            "asset_longname": null
        }),
    );
    projection::parse_event(&api_db, &creation).await.unwrap();
    projection::parse_event(
        &api_db,
        &issuance(2, MEMPOOL_BLOCK_INDEX, "FOO", 1000, "addrA", "Foo asset", false),
    )
    .await
    .unwrap();

    let info = fetch_asset_info(&api_db, "FOO").await.unwrap();
    assert_eq!(info.get("confirmed"), Some(&json!(0)));
    assert_eq!(info.get("supply"), Some(&json!(0)));

    mempool::clean_all(&api_db).await.unwrap();
    assert!(fetch_asset_info(&api_db, "FOO").await.is_none());
    assert_eq!(table_count(&api_db, "issuances").await, 0);
}

#[tokio::test]
async fn reconciler_repairs_hash_divergence() {
    let (_dir, api_db, ledger_db) = setup().await;

    for index in 1..=6 {
        insert_ledger_event(&ledger_db, &credit(index, index, "addrA", "XCP", 10)).await;
    }
    drain(&api_db, &ledger_db).await;
    assert_eq!(balance(&api_db, "addrA", "XCP").await, Some(60));

    // The ledger reorganises: events 5 and 6 are replaced.
    for index in 5..=6 {
        let replacement = credit(index, index, "addrA", "XCP", 1);
        sqlx::query(
            "UPDATE messages SET bindings = ?, event_hash = ? WHERE message_index = ?",
        )
        .bind(&replacement.bindings)
        .bind(format!("reorg-{index}"))
        .bind(index)
        .execute(&ledger_db)
        .await
        .unwrap();
    }

    drain(&api_db, &ledger_db).await;

    assert_eq!(balance(&api_db, "addrA", "XCP").await, Some(42));
    let head = database::get_last_stored_event(&api_db).await.unwrap().unwrap();
    assert_eq!(head.message_index, 6);
    assert_eq!(head.event_hash.as_deref(), Some("reorg-6"));
}

#[tokio::test]
async fn rollback_restores_overwritten_order() {
    let (_dir, api_db, _ledger_db) = setup().await;

    projection::parse_event(&api_db, &open_order(1, 100, "order1", "addrA"))
        .await
        .unwrap();
    projection::parse_event(&api_db, &credit(2, 100, "addrA", "XCP", 10))
        .await
        .unwrap();

    let fill = event(
        3,
        101,
        "ORDER_UPDATE",
        "orders",
        "update",
        json!({
            "tx_hash": "order1",
            "status": "filled",
            "give_remaining": 0
        }),
    );
    projection::parse_event(&api_db, &fill).await.unwrap();
    projection::parse_event(&api_db, &credit(4, 101, "addrB", "XCP", 5))
        .await
        .unwrap();
    projection::parse_event(&api_db, &credit(5, 102, "addrB", "XCP", 5))
        .await
        .unwrap();

    let (status,): (String,) =
        sqlx::query_as("SELECT status FROM orders WHERE tx_hash = 'order1'")
            .fetch_one(&api_db)
            .await
            .unwrap();
    assert_eq!(status, "filled");

    projection::rollback(&api_db, 101).await.unwrap();

    let (status, give_remaining): (String, i64) =
        sqlx::query_as("SELECT status, give_remaining FROM orders WHERE tx_hash = 'order1'")
            .fetch_one(&api_db)
            .await
            .unwrap();
    assert_eq!(status, "open");
    assert_eq!(give_remaining, 100);
    assert_eq!(balance(&api_db, "addrB", "XCP").await, None);
    assert_eq!(
        database::get_last_parsed_message_index(&api_db).await.unwrap(),
        Some(2)
    );
}

#[tokio::test]
async fn unconfirmed_update_stores_message_only() {
    let (_dir, api_db, _ledger_db) = setup().await;

    projection::parse_event(&api_db, &open_order(1, 100, "order1", "addrA"))
        .await
        .unwrap();

    let unconfirmed_fill = event(
        2,
        MEMPOOL_BLOCK_INDEX,
        "ORDER_UPDATE",
        "orders",
        "update",
        json!({
            "tx_hash": "order1",
            "status": "filled",
            "give_remaining": 0
        }),
    );
    projection::parse_event(&api_db, &unconfirmed_fill).await.unwrap();

    let (status,): (String,) =
        sqlx::query_as("SELECT status FROM orders WHERE tx_hash = 'order1'")
            .fetch_one(&api_db)
            .await
            .unwrap();
    assert_eq!(status, "open");

    let head = database::get_last_stored_event(&api_db).await.unwrap().unwrap();
    assert_eq!(head.message_index, 2);
    assert!(head.previous_state.is_none());
    assert!(head.insert_rowid.is_none());
}

#[tokio::test]
async fn expirations_are_logged_and_unlogged() {
    let (_dir, api_db, _ledger_db) = setup().await;

    let expiration = event(
        1,
        120,
        "ORDER_EXPIRATION",
        "order_expirations",
        "insert",
        json!({
            "order_hash": "order1",
            "source": "addrA",
            "block_index": 120
        }),
    );
    projection::parse_event(&api_db, &expiration).await.unwrap();

    let (kind, object_id): (String, String) = sqlx::query_as(
        "SELECT type, object_id FROM all_expirations WHERE block_index = 120",
    )
    .fetch_one(&api_db)
    .await
    .unwrap();
    assert_eq!(kind, "order");
    assert_eq!(object_id, "order1");

    projection::rollback(&api_db, 120).await.unwrap();
    assert_eq!(table_count(&api_db, "all_expirations").await, 0);
}

#[tokio::test]
async fn mempool_synthetic_indexes_and_skip_list() {
    let (_dir, api_db, ledger_db) = setup().await;

    // Two unconfirmed transactions sharing a tx_index.
    for tx_hash in ["aa", "bb"] {
        insert_ledger_mempool_event(
            &ledger_db,
            tx_hash,
            "NEW_TRANSACTION",
            "transactions",
            json!({
                "tx_index": 5,
                "tx_hash": tx_hash,
                "block_index": 500,
                "source": "addrA",
                "destination": "addrB",
                "btc_amount": 0,
                "fee": 100
            }),
        )
        .await;
    }

    let mut skip_list = HashSet::new();
    mempool::synchronize(&api_db, &ledger_db, &mut skip_list, false)
        .await
        .unwrap();

    assert_eq!(table_count(&api_db, "mempool").await, 2);
    let indexes: Vec<(i64,)> =
        sqlx::query_as("SELECT tx_index FROM transactions ORDER BY tx_index")
            .fetch_all(&api_db)
            .await
            .unwrap();
    assert_eq!(indexes.len(), 2);
    for (tx_index,) in &indexes {
        assert!(*tx_index >= 5000 && *tx_index < 5000 + 100_000_000);
    }
    assert!(skip_list.is_empty());

    // A third event reusing an existing tx_hash violates a constraint the
    // retry cannot fix; it must land on the skip list.
    insert_ledger_mempool_event(
        &ledger_db,
        "cc",
        "NEW_TRANSACTION",
        "transactions",
        json!({
            "tx_index": 9,
            "tx_hash": "aa",
            "block_index": 500,
            "source": "addrC",
            "destination": "addrD",
            "btc_amount": 0,
            "fee": 100
        }),
    )
    .await;

    mempool::synchronize(&api_db, &ledger_db, &mut skip_list, false)
        .await
        .unwrap();
    assert!(skip_list.contains("cc"));

    // The next rebuild ignores the skip-listed transaction entirely.
    mempool::synchronize(&api_db, &ledger_db, &mut skip_list, false)
        .await
        .unwrap();
    assert_eq!(table_count(&api_db, "mempool").await, 2);
    assert_eq!(table_count(&api_db, "transactions").await, 2);
}

#[tokio::test]
async fn mempool_rebuild_is_idempotent() {
    let (_dir, api_db, ledger_db) = setup().await;

    insert_ledger_mempool_event(
        &ledger_db,
        "aa",
        "CREDIT",
        "credits",
        json!({
            "address": "addrA",
            "asset": "XCP",
            "quantity": 9,
            "calling_function": "send",
            "event": "aa",
            "tx_index": 12,
            "block_index": 500
        }),
    )
    .await;

    let mut skip_list = HashSet::new();
    mempool::synchronize(&api_db, &ledger_db, &mut skip_list, false)
        .await
        .unwrap();
    let first = snapshot(&api_db, &["mempool"]).await;

    mempool::synchronize(&api_db, &ledger_db, &mut skip_list, false)
        .await
        .unwrap();
    let second = snapshot(&api_db, &["mempool"]).await;

    assert_eq!(first, second);
}

#[tokio::test]
async fn issuance_unapply_refreshes_from_log() {
    let (_dir, api_db, _ledger_db) = setup().await;

    projection::parse_event(&api_db, &issuance(1, 100, "BAR", 10, "issuer1", "v1", true))
        .await
        .unwrap();
    projection::parse_event(&api_db, &issuance(2, 200, "BAR", 20, "issuer2", "v2", false))
        .await
        .unwrap();
    projection::parse_event(&api_db, &issuance(3, 300, "BAR", 30, "issuer3", "v3", false))
        .await
        .unwrap();

    let info = fetch_asset_info(&api_db, "BAR").await.unwrap();
    assert_eq!(info.get("supply"), Some(&json!(60)));
    assert_eq!(info.get("owner"), Some(&json!("issuer3")));
    assert_eq!(info.get("issuer"), Some(&json!("issuer1")));
    assert_eq!(info.get("locked"), Some(&json!(1)));

    projection::rollback_last_event(&api_db).await.unwrap();

    let info = fetch_asset_info(&api_db, "BAR").await.unwrap();
    assert_eq!(info.get("supply"), Some(&json!(30)));
    assert_eq!(info.get("owner"), Some(&json!("issuer2")));
    assert_eq!(info.get("issuer"), Some(&json!("issuer1")));
    assert_eq!(info.get("description"), Some(&json!("v2")));
    assert_eq!(info.get("first_issuance_block_index"), Some(&json!(100)));
    assert_eq!(info.get("last_issuance_block_index"), Some(&json!(200)));
    assert_eq!(info.get("locked"), Some(&json!(1)));
}

// ─────────────────────────────────────────────────────────
// Invariants
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn apply_then_unapply_is_byte_identical() {
    let (_dir, api_db, _ledger_db) = setup().await;

    projection::parse_event(&api_db, &open_order(1, 100, "order1", "addrA"))
        .await
        .unwrap();
    projection::parse_event(&api_db, &credit(2, 100, "addrA", "XCP", 10))
        .await
        .unwrap();
    let before = snapshot(&api_db, SNAPSHOT_TABLES).await;

    let fill = event(
        3,
        101,
        "ORDER_UPDATE",
        "orders",
        "update",
        json!({
            "tx_hash": "order1",
            "status": "filled",
            "give_remaining": 0
        }),
    );
    projection::parse_event(&api_db, &fill).await.unwrap();
    projection::rollback_last_event(&api_db).await.unwrap();

    let after = snapshot(&api_db, SNAPSHOT_TABLES).await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn rollback_then_catch_up_converges() {
    let (_dir, api_db, ledger_db) = setup().await;

    let events = vec![
        credit(1, 1, "addrA", "XCP", 100),
        open_order(2, 1, "order1", "addrA"),
        debit(3, 2, "addrA", "XCP", 25),
        event(
            4,
            2,
            "ORDER_UPDATE",
            "orders",
            "update",
            json!({"tx_hash": "order1", "status": "filled", "give_remaining": 0}),
        ),
        credit(5, 3, "addrB", "XCP", 11),
        issuance(6, 3, "BAZ", 500, "addrB", "baz", false),
    ];
    for next in &events {
        insert_ledger_event(&ledger_db, next).await;
    }
    drain(&api_db, &ledger_db).await;
    let converged = snapshot(&api_db, SNAPSHOT_TABLES).await;

    projection::rollback(&api_db, 2).await.unwrap();
    assert_eq!(
        database::get_last_parsed_message_index(&api_db).await.unwrap(),
        Some(2)
    );

    drain(&api_db, &ledger_db).await;
    let reconverged = snapshot(&api_db, SNAPSHOT_TABLES).await;
    assert_eq!(converged, reconverged);
}

#[tokio::test]
async fn replayed_prefix_reproduces_ledger_head_hash() {
    let (_dir, api_db, ledger_db) = setup().await;

    for index in 1..=5 {
        insert_ledger_event(&ledger_db, &credit(index, index, "addrA", "XCP", index)).await;
    }
    drain(&api_db, &ledger_db).await;

    let head = database::get_last_stored_event(&api_db).await.unwrap().unwrap();
    let ledger_head = database::get_ledger_event(&ledger_db, head.message_index)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.event_hash, ledger_head.event_hash);
}

#[tokio::test]
async fn skip_events_are_stored_but_mutate_nothing() {
    let (_dir, api_db, _ledger_db) = setup().await;

    let skipped = event(
        1,
        100,
        "NEW_TRANSACTION_OUTPUT",
        "transaction_outputs",
        "insert",
        json!({"tx_index": 1, "out_index": 0, "value": 546, "block_index": 100}),
    );
    projection::parse_event(&api_db, &skipped).await.unwrap();

    assert_eq!(table_count(&api_db, "messages").await, 1);

    projection::rollback(&api_db, 0).await.unwrap();
    assert_eq!(table_count(&api_db, "messages").await, 0);
}

#[tokio::test]
async fn migrations_apply_idempotently() {
    let (_dir, api_db, _ledger_db) = setup().await;

    // Second run sees everything applied and does nothing.
    database::apply_migrations(&api_db, Duration::from_secs(5))
        .await
        .unwrap();

    let applied = table_count(&api_db, "migrations").await;
    assert_eq!(applied as usize, MIGRATIONS.len());
}

#[tokio::test]
async fn fee_paying_events_burn_xcp_supply() {
    let (_dir, api_db, _ledger_db) = setup().await;

    let before = fetch_asset_info(&api_db, "XCP").await.unwrap();
    let supply_before = before.get("supply").and_then(Value::as_i64).unwrap();

    let bindings = json!({
        "tx_index": 1,
        "tx_hash": "tx1",
        "block_index": 100,
        "asset": "NAMED",
        "quantity": 10,
        "divisible": true,
        "source": "addrA",
        "issuer": "addrA",
        "description": "named asset",
        "fee_paid": 50000000,
        "locked": false,
        "status": "valid",
        "asset_longname": null
    });
    let issuance_with_fee = event(1, 100, "ASSET_ISSUANCE", "issuances", "insert", bindings);
    projection::parse_event(&api_db, &issuance_with_fee).await.unwrap();

    let after = fetch_asset_info(&api_db, "XCP").await.unwrap();
    let supply_after = after.get("supply").and_then(Value::as_i64).unwrap();
    assert_eq!(supply_after, supply_before - 50_000_000);

    projection::rollback(&api_db, 100).await.unwrap();
    let restored = fetch_asset_info(&api_db, "XCP").await.unwrap();
    assert_eq!(restored.get("supply").and_then(Value::as_i64), Some(supply_before));
}

#[tokio::test]
async fn address_events_index_follows_applies_and_rollbacks() {
    let (_dir, api_db, _ledger_db) = setup().await;

    let send = event(
        1,
        100,
        "SEND",
        "sends",
        "insert",
        json!({
            "tx_index": 1,
            "tx_hash": "tx1",
            "block_index": 100,
            "source": "addrA",
            "destination": "addrB",
            "asset": "XCP",
            "quantity": 10,
            "status": "valid"
        }),
    );
    projection::parse_event(&api_db, &send).await.unwrap();

    let indexed: Vec<(String,)> =
        sqlx::query_as("SELECT address FROM address_events WHERE message_index = 1 ORDER BY address")
            .fetch_all(&api_db)
            .await
            .unwrap();
    let addresses: Vec<&str> = indexed.iter().map(|(address,)| address.as_str()).collect();
    assert_eq!(addresses, vec!["addrA", "addrB"]);

    projection::rollback(&api_db, 100).await.unwrap();
    assert_eq!(table_count(&api_db, "address_events").await, 0);
}

#[tokio::test]
async fn fairmint_counters_accumulate_and_unwind() {
    let (_dir, api_db, _ledger_db) = setup().await;

    let fairminter = event(
        1,
        100,
        "NEW_FAIRMINTER",
        "fairminters",
        "insert",
        json!({
            "tx_hash": "fm1",
            "tx_index": 1,
            "block_index": 100,
            "source": "addrA",
            "asset": "MINTY",
            "price": 10,
            "status": "open"
        }),
    );
    projection::parse_event(&api_db, &fairminter).await.unwrap();

    let fairmint = event(
        2,
        101,
        "NEW_FAIRMINT",
        "fairmints",
        "insert",
        json!({
            "tx_hash": "tx2",
            "tx_index": 2,
            "block_index": 101,
            "source": "addrB",
            "fairminter_tx_hash": "fm1",
            "asset": "MINTY",
            "earn_quantity": 90,
            "commission": 10,
            "paid_quantity": 1000,
            "status": "valid"
        }),
    );
    projection::parse_event(&api_db, &fairmint).await.unwrap();

    let (earned, commission, paid): (i64, i64, i64) = sqlx::query_as(
        "SELECT earned_quantity, commission, paid_quantity FROM fairminters WHERE tx_hash = 'fm1'",
    )
    .fetch_one(&api_db)
    .await
    .unwrap();
    assert_eq!((earned, commission, paid), (90, 10, 1000));

    projection::rollback(&api_db, 101).await.unwrap();
    let (earned, commission, paid): (i64, i64, i64) = sqlx::query_as(
        "SELECT earned_quantity, commission, paid_quantity FROM fairminters WHERE tx_hash = 'fm1'",
    )
    .fetch_one(&api_db)
    .await
    .unwrap();
    assert_eq!((earned, commission, paid), (0, 0, 0));
}

// ─────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────

mod balance_properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Any sequence of credits and debits sums algebraically, and undoing
        /// the whole history leaves no trace.
        #[test]
        fn credits_and_debits_always_sum(deltas in proptest::collection::vec(-50i64..50, 1..12)) {
            tokio_test::block_on(async {
                let (_dir, api_db, _ledger_db) = setup().await;

                let mut expected: i64 = 0;
                for (offset, delta) in deltas.iter().enumerate() {
                    let message_index = offset as i64 + 1;
                    let next = if *delta >= 0 {
                        credit(message_index, 1, "addrA", "XCP", *delta)
                    } else {
                        debit(message_index, 1, "addrA", "XCP", -*delta)
                    };
                    projection::parse_event(&api_db, &next).await.unwrap();
                    expected += *delta;
                }

                let observed = balance(&api_db, "addrA", "XCP").await;
                if expected == 0 {
                    prop_assert!(observed.is_none());
                } else {
                    prop_assert_eq!(observed, Some(expected));
                }

                projection::rollback(&api_db, 0).await.unwrap();
                prop_assert_eq!(table_count(&api_db, "balances").await, 0);
                Ok(())
            })?;
        }
    }
}
