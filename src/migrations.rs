//! Projection store schema, as an ordered migration list.
//!
//! Each migration is identified by name and by the SHA-256 of its SQL; the
//! applier records both and refuses to run if an already-applied migration's
//! content has changed underneath it.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::{Executor, Sqlite, Transaction};

pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    pub fn content_hash(&self) -> String {
        let digest = Sha256::digest(self.sql.as_bytes());
        format!("{:x}", digest)
    }
}

/// All migrations, oldest first. Append only.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001.create-projection-tables",
        sql: CREATE_PROJECTION_TABLES,
    },
    Migration {
        name: "0002.create-lookup-indexes",
        sql: CREATE_LOOKUP_INDEXES,
    },
];

pub async fn apply(tx: &mut Transaction<'_, Sqlite>, migration: &Migration) -> Result<()> {
    tx.execute(migration.sql).await?;
    sqlx::query("INSERT INTO migrations (name, content_hash, applied_at) VALUES (?, ?, ?)")
        .bind(migration.name)
        .bind(migration.content_hash())
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

const CREATE_PROJECTION_TABLES: &str = r#"
CREATE TABLE messages (
    message_index INTEGER PRIMARY KEY,
    block_index INTEGER,
    event TEXT,
    category TEXT,
    command TEXT,
    bindings TEXT,
    timestamp INTEGER,
    tx_hash TEXT,
    event_hash TEXT,
    previous_state TEXT,
    insert_rowid INTEGER
);

CREATE TABLE blocks (
    block_index INTEGER UNIQUE,
    block_hash TEXT UNIQUE,
    block_time INTEGER,
    previous_block_hash TEXT,
    difficulty INTEGER,
    ledger_hash TEXT,
    txlist_hash TEXT,
    messages_hash TEXT,
    transaction_count INTEGER
);

CREATE TABLE transactions (
    tx_index INTEGER UNIQUE,
    tx_hash TEXT UNIQUE,
    block_index INTEGER,
    block_hash TEXT,
    block_time INTEGER,
    source TEXT,
    destination TEXT,
    btc_amount INTEGER,
    fee INTEGER,
    data BLOB,
    supported BOOL DEFAULT 1,
    utxos_info TEXT,
    transaction_type TEXT
);

CREATE TABLE credits (
    block_index INTEGER,
    address TEXT,
    asset TEXT,
    quantity INTEGER,
    calling_function TEXT,
    event TEXT,
    tx_index INTEGER,
    utxo TEXT,
    utxo_address TEXT
);

CREATE TABLE debits (
    block_index INTEGER,
    address TEXT,
    asset TEXT,
    quantity INTEGER,
    action TEXT,
    event TEXT,
    tx_index INTEGER,
    utxo TEXT,
    utxo_address TEXT
);

CREATE TABLE balances (
    address TEXT,
    asset TEXT,
    quantity INTEGER,
    utxo TEXT,
    utxo_address TEXT
);

CREATE TABLE assets (
    asset_id TEXT UNIQUE,
    asset_name TEXT UNIQUE,
    block_index INTEGER,
    asset_longname TEXT
);

CREATE TABLE assets_info (
    asset TEXT UNIQUE,
    asset_id TEXT UNIQUE,
    asset_longname TEXT,
    issuer TEXT,
    owner TEXT,
    divisible BOOL,
    locked BOOL DEFAULT 0,
    supply INTEGER DEFAULT 0,
    description TEXT,
    first_issuance_block_index INTEGER,
    last_issuance_block_index INTEGER,
    confirmed BOOL DEFAULT 1
);

CREATE TABLE issuances (
    tx_index INTEGER,
    tx_hash TEXT,
    msg_index INTEGER DEFAULT 0,
    block_index INTEGER,
    asset TEXT,
    quantity INTEGER,
    divisible BOOL,
    source TEXT,
    issuer TEXT,
    transfer BOOL,
    callable BOOL,
    call_date INTEGER,
    call_price REAL,
    description TEXT,
    fee_paid INTEGER,
    locked BOOL,
    status TEXT,
    asset_longname TEXT,
    reset BOOL,
    description_locked BOOL,
    fair_minting BOOL DEFAULT 0,
    asset_events TEXT
);

CREATE TABLE orders (
    tx_index INTEGER UNIQUE,
    tx_hash TEXT UNIQUE,
    block_index INTEGER,
    source TEXT,
    give_asset TEXT,
    give_quantity INTEGER,
    give_remaining INTEGER,
    get_asset TEXT,
    get_quantity INTEGER,
    get_remaining INTEGER,
    expiration INTEGER,
    expire_index INTEGER,
    fee_required INTEGER,
    fee_required_remaining INTEGER,
    fee_provided INTEGER,
    fee_provided_remaining INTEGER,
    status TEXT
);

CREATE TABLE order_matches (
    id TEXT UNIQUE,
    tx0_index INTEGER,
    tx0_hash TEXT,
    tx0_address TEXT,
    tx1_index INTEGER,
    tx1_hash TEXT,
    tx1_address TEXT,
    forward_asset TEXT,
    forward_quantity INTEGER,
    backward_asset TEXT,
    backward_quantity INTEGER,
    tx0_block_index INTEGER,
    tx1_block_index INTEGER,
    block_index INTEGER,
    tx0_expiration INTEGER,
    tx1_expiration INTEGER,
    match_expire_index INTEGER,
    fee_paid INTEGER,
    status TEXT
);

CREATE TABLE bets (
    tx_index INTEGER UNIQUE,
    tx_hash TEXT UNIQUE,
    block_index INTEGER,
    source TEXT,
    feed_address TEXT,
    bet_type INTEGER,
    deadline INTEGER,
    wager_quantity INTEGER,
    wager_remaining INTEGER,
    counterwager_quantity INTEGER,
    counterwager_remaining INTEGER,
    target_value REAL,
    leverage INTEGER,
    expiration INTEGER,
    expire_index INTEGER,
    fee_fraction_int INTEGER,
    status TEXT
);

CREATE TABLE bet_matches (
    id TEXT UNIQUE,
    tx0_index INTEGER,
    tx0_hash TEXT,
    tx0_address TEXT,
    tx1_index INTEGER,
    tx1_hash TEXT,
    tx1_address TEXT,
    tx0_bet_type INTEGER,
    tx1_bet_type INTEGER,
    feed_address TEXT,
    initial_value INTEGER,
    deadline INTEGER,
    target_value REAL,
    leverage INTEGER,
    forward_quantity INTEGER,
    backward_quantity INTEGER,
    tx0_block_index INTEGER,
    tx1_block_index INTEGER,
    block_index INTEGER,
    tx0_expiration INTEGER,
    tx1_expiration INTEGER,
    match_expire_index INTEGER,
    fee_fraction_int INTEGER,
    status TEXT
);

CREATE TABLE dispensers (
    tx_index INTEGER,
    tx_hash TEXT UNIQUE,
    block_index INTEGER,
    source TEXT,
    asset TEXT,
    give_quantity INTEGER,
    escrow_quantity INTEGER,
    satoshirate INTEGER,
    status INTEGER,
    give_remaining INTEGER,
    oracle_address TEXT,
    last_status_tx_hash TEXT,
    origin TEXT,
    dispense_count INTEGER DEFAULT 0
);

CREATE TABLE dispenses (
    tx_index INTEGER,
    dispense_index INTEGER,
    tx_hash TEXT,
    block_index INTEGER,
    source TEXT,
    destination TEXT,
    asset TEXT,
    dispense_quantity INTEGER,
    dispenser_tx_hash TEXT,
    btc_amount INTEGER DEFAULT 0
);

CREATE TABLE sweeps (
    tx_index INTEGER,
    tx_hash TEXT,
    block_index INTEGER,
    source TEXT,
    destination TEXT,
    flags INTEGER,
    status TEXT,
    memo BLOB,
    fee_paid INTEGER
);

CREATE TABLE broadcasts (
    tx_index INTEGER UNIQUE,
    tx_hash TEXT UNIQUE,
    block_index INTEGER,
    source TEXT,
    timestamp INTEGER,
    value REAL,
    fee_fraction_int INTEGER,
    text TEXT,
    locked BOOL,
    status TEXT
);

CREATE TABLE burns (
    tx_index INTEGER UNIQUE,
    tx_hash TEXT UNIQUE,
    block_index INTEGER,
    source TEXT,
    burned INTEGER,
    earned INTEGER,
    status TEXT
);

CREATE TABLE sends (
    tx_index INTEGER,
    tx_hash TEXT,
    block_index INTEGER,
    source TEXT,
    destination TEXT,
    asset TEXT,
    quantity INTEGER,
    status TEXT,
    msg_index INTEGER DEFAULT 0,
    memo BLOB,
    fee_paid INTEGER DEFAULT 0,
    send_type TEXT,
    source_address TEXT,
    destination_address TEXT
);

CREATE TABLE dividends (
    tx_index INTEGER,
    tx_hash TEXT UNIQUE,
    block_index INTEGER,
    source TEXT,
    asset TEXT,
    dividend_asset TEXT,
    quantity_per_unit INTEGER,
    fee_paid INTEGER,
    status TEXT
);

CREATE TABLE destructions (
    tx_index INTEGER,
    tx_hash TEXT,
    block_index INTEGER,
    source TEXT,
    asset TEXT,
    quantity INTEGER,
    tag TEXT,
    fee_paid INTEGER DEFAULT 0,
    status TEXT
);

CREATE TABLE fairminters (
    tx_hash TEXT UNIQUE,
    tx_index INTEGER,
    block_index INTEGER,
    source TEXT,
    asset TEXT,
    asset_parent TEXT,
    asset_longname TEXT,
    description TEXT,
    price INTEGER,
    quantity_by_price INTEGER,
    hard_cap INTEGER,
    burn_payment BOOL,
    max_mint_per_tx INTEGER,
    premint_quantity INTEGER,
    start_block INTEGER,
    end_block INTEGER,
    minted_asset_commission_int INTEGER,
    soft_cap INTEGER,
    soft_cap_deadline_block INTEGER,
    lock_description BOOL,
    lock_quantity BOOL,
    divisible BOOL,
    pre_minted BOOL DEFAULT 0,
    status TEXT,
    earned_quantity INTEGER,
    commission INTEGER,
    paid_quantity INTEGER
);

CREATE TABLE fairmints (
    tx_hash TEXT UNIQUE,
    tx_index INTEGER,
    block_index INTEGER,
    source TEXT,
    fairminter_tx_hash TEXT,
    asset TEXT,
    earn_quantity INTEGER,
    paid_quantity INTEGER,
    commission INTEGER,
    status TEXT
);

CREATE TABLE rps (
    tx_index INTEGER UNIQUE,
    tx_hash TEXT UNIQUE,
    block_index INTEGER,
    source TEXT,
    possible_moves INTEGER,
    wager INTEGER,
    move_random_hash TEXT,
    expiration INTEGER,
    expire_index INTEGER,
    status TEXT
);

CREATE TABLE rps_matches (
    id TEXT UNIQUE,
    tx0_index INTEGER,
    tx0_hash TEXT,
    tx0_address TEXT,
    tx1_index INTEGER,
    tx1_hash TEXT,
    tx1_address TEXT,
    tx0_move_random_hash TEXT,
    tx1_move_random_hash TEXT,
    wager INTEGER,
    possible_moves INTEGER,
    tx0_block_index INTEGER,
    tx1_block_index INTEGER,
    block_index INTEGER,
    tx0_expiration INTEGER,
    tx1_expiration INTEGER,
    match_expire_index INTEGER,
    status TEXT
);

CREATE TABLE order_expirations (
    order_hash TEXT,
    source TEXT,
    block_index INTEGER
);

CREATE TABLE order_match_expirations (
    order_match_id TEXT,
    tx0_address TEXT,
    tx1_address TEXT,
    block_index INTEGER
);

CREATE TABLE bet_expirations (
    bet_index INTEGER,
    bet_hash TEXT,
    source TEXT,
    block_index INTEGER
);

CREATE TABLE bet_match_expirations (
    bet_match_id TEXT,
    tx0_address TEXT,
    tx1_address TEXT,
    block_index INTEGER
);

CREATE TABLE rps_expirations (
    rps_index INTEGER,
    rps_hash TEXT,
    source TEXT,
    block_index INTEGER
);

CREATE TABLE rps_match_expirations (
    rps_match_id TEXT,
    tx0_address TEXT,
    tx1_address TEXT,
    block_index INTEGER
);

CREATE TABLE address_options (
    address TEXT UNIQUE,
    options INTEGER,
    block_index INTEGER
);

CREATE TABLE mempool (
    tx_hash TEXT,
    command TEXT,
    category TEXT,
    bindings TEXT,
    timestamp INTEGER,
    event TEXT,
    addresses TEXT
);

CREATE TABLE all_expirations (
    type TEXT,
    object_id TEXT,
    block_index INTEGER
);

CREATE TABLE address_events (
    address TEXT,
    message_index INTEGER
);

CREATE TABLE transaction_count (
    block_index INTEGER,
    transaction_id INTEGER,
    count INTEGER
);
"#;

const CREATE_LOOKUP_INDEXES: &str = r#"
CREATE INDEX messages_block_index_idx ON messages (block_index);
CREATE INDEX messages_event_idx ON messages (event);
CREATE INDEX blocks_block_index_idx ON blocks (block_index);
CREATE INDEX transactions_block_index_idx ON transactions (block_index);
CREATE INDEX credits_address_idx ON credits (address);
CREATE INDEX credits_block_index_idx ON credits (block_index);
CREATE INDEX debits_address_idx ON debits (address);
CREATE INDEX debits_block_index_idx ON debits (block_index);
CREATE INDEX balances_address_idx ON balances (address, asset);
CREATE INDEX balances_utxo_idx ON balances (utxo, asset);
CREATE INDEX assets_info_longname_idx ON assets_info (asset_longname);
CREATE INDEX issuances_asset_idx ON issuances (asset, status);
CREATE INDEX issuances_block_index_idx ON issuances (block_index);
CREATE INDEX orders_block_index_idx ON orders (block_index);
CREATE INDEX order_matches_block_index_idx ON order_matches (block_index);
CREATE INDEX dispensers_block_index_idx ON dispensers (block_index);
CREATE INDEX dispenses_block_index_idx ON dispenses (block_index);
CREATE INDEX sends_block_index_idx ON sends (block_index);
CREATE INDEX destructions_asset_idx ON destructions (asset, status);
CREATE INDEX all_expirations_object_id_idx ON all_expirations (object_id);
CREATE INDEX address_events_address_idx ON address_events (address);
CREATE INDEX address_events_message_index_idx ON address_events (message_index);
CREATE INDEX mempool_tx_hash_idx ON mempool (tx_hash);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered_and_uniquely_named() {
        let mut names: Vec<_> = MIGRATIONS.iter().map(|m| m.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted, "migration list must stay in apply order");
        names.dedup();
        assert_eq!(names.len(), MIGRATIONS.len());
    }

    #[test]
    fn content_hash_is_stable_hex() {
        let hash = MIGRATIONS[0].content_hash();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, MIGRATIONS[0].content_hash());
    }
}
