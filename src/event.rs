//! Ledger event records and the event-shape tables that drive projection.
//!
//! Every mutation the ledger performs is published as one row of its
//! `messages` log. Bindings are shape-polymorphic, so they stay a JSON
//! object (column name → scalar) end to end; all SQL is generated from
//! that map rather than from per-kind structs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Block index sentinel marking unconfirmed rows.
pub const MEMPOOL_BLOCK_INDEX: i64 = 9_999_999;

/// Reserved asset names seeded at bootstrap.
pub const BTC_ASSET: &str = "BTC";
pub const XCP_ASSET: &str = "XCP";

/// Events persisted to `messages` but generating no domain-table mutation.
pub const SKIP_EVENTS: &[&str] = &["NEW_TRANSACTION_OUTPUT"];

/// Events whose `fee_paid` binding destroys XCP.
pub const XCP_DESTROY_EVENTS: &[&str] = &[
    "ASSET_ISSUANCE",
    "ASSET_DESTRUCTION",
    "SWEEP",
    "ASSET_DIVIDEND",
];

/// Events handled by the assets_info updater.
pub const ASSET_EVENTS: &[&str] = &[
    "ASSET_CREATION",
    "ASSET_ISSUANCE",
    "RESET_ISSUANCE",
    "ASSET_DESTRUCTION",
    "ASSET_TRANSFER",
    "BURN",
];

/// One row of the ledger's `messages` log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub message_index: i64,
    pub block_index: i64,
    pub event: String,
    pub category: String,
    pub command: String,
    pub bindings: String,
    pub timestamp: Option<i64>,
    pub tx_hash: Option<String>,
    pub event_hash: Option<String>,
}

/// An event as stored in the projection's `messages` log, enriched with the
/// captured inverse.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub message_index: i64,
    pub block_index: i64,
    pub event: String,
    pub category: String,
    pub command: String,
    pub bindings: String,
    pub timestamp: Option<i64>,
    pub tx_hash: Option<String>,
    pub event_hash: Option<String>,
    pub previous_state: Option<String>,
    pub insert_rowid: Option<i64>,
}

/// One row of the ledger's `mempool` view.
#[derive(Debug, Clone)]
pub struct MempoolEvent {
    pub tx_hash: String,
    pub command: String,
    pub category: String,
    pub bindings: String,
    pub event: String,
    pub timestamp: Option<i64>,
}

impl Event {
    pub fn is_skipped(&self) -> bool {
        SKIP_EVENTS.contains(&self.event.as_str())
    }

    pub fn is_mempool(&self) -> bool {
        self.block_index == MEMPOOL_BLOCK_INDEX
    }

    /// Parse the bindings exactly once, applying the canonical key elision:
    /// `order_match_id` is dropped when it duplicates `id`.
    pub fn canonical_bindings(&self) -> Result<Map<String, Value>> {
        let mut bindings: Map<String, Value> = serde_json::from_str(&self.bindings)
            .with_context(|| format!("invalid bindings for event {}", self.message_index))?;
        let duplicated = match (bindings.get("order_match_id"), bindings.get("id")) {
            (Some(order_match_id), Some(id)) => order_match_id == id,
            _ => false,
        };
        if duplicated {
            bindings.remove("order_match_id");
        }
        Ok(bindings)
    }
}

impl StoredEvent {
    pub fn is_skipped(&self) -> bool {
        SKIP_EVENTS.contains(&self.event.as_str())
    }

    /// The stored event seen as a plain ledger event, for re-use of the
    /// bindings helpers.
    pub fn as_event(&self) -> Event {
        Event {
            message_index: self.message_index,
            block_index: self.block_index,
            event: self.event.clone(),
            category: self.category.clone(),
            command: self.command.clone(),
            bindings: self.bindings.clone(),
            timestamp: self.timestamp,
            tx_hash: self.tx_hash.clone(),
            event_hash: self.event_hash.clone(),
        }
    }

    /// The previous-state snapshot as a column map, if one was captured.
    pub fn previous_state_map(&self) -> Result<Option<Map<String, Value>>> {
        match self.previous_state.as_deref() {
            None | Some("null") | Some("None") => Ok(None),
            Some(serialized) => {
                let map = serde_json::from_str(serialized).with_context(|| {
                    format!("invalid previous_state for event {}", self.message_index)
                })?;
                Ok(Some(map))
            }
        }
    }
}

/// Id-field sets keying `update`/`parse` commands. Part of the wire contract
/// with the ledger: rows are addressed by these columns both when applying an
/// update and when rolling it back.
pub fn update_id_fields(event: &str) -> Option<&'static [&'static str]> {
    match event {
        "BLOCK_PARSED" => Some(&["block_index"]),
        "TRANSACTION_PARSED" => Some(&["tx_hash"]),
        "BET_MATCH_UPDATE" => Some(&["id"]),
        "BET_UPDATE" => Some(&["tx_hash"]),
        "DISPENSER_UPDATE" => Some(&["tx_hash"]),
        "ORDER_FILLED" => Some(&["tx_hash"]),
        "ORDER_MATCH_UPDATE" => Some(&["id"]),
        "ORDER_UPDATE" => Some(&["tx_hash"]),
        "RPS_MATCH_UPDATE" => Some(&["id"]),
        "RPS_UPDATE" => Some(&["tx_hash"]),
        "ADDRESS_OPTIONS_UPDATE" => Some(&["address"]),
        "FAIRMINTER_UPDATE" => Some(&["tx_hash"]),
        _ => None,
    }
}

/// Binding field naming the expired object for each expiration event.
pub fn expiration_object_id_field(event: &str) -> Option<&'static str> {
    match event {
        "ORDER_EXPIRATION" => Some("order_hash"),
        "ORDER_MATCH_EXPIRATION" => Some("order_match_id"),
        "RPS_EXPIRATION" => Some("rps_hash"),
        "RPS_MATCH_EXPIRATION" => Some("rps_match_id"),
        "BET_EXPIRATION" => Some("bet_hash"),
        "BET_MATCH_EXPIRATION" => Some("bet_match_id"),
        _ => None,
    }
}

/// Binding fields carrying addresses, per event kind. Drives both the
/// address_events reverse index and the mempool `addresses` search string.
pub fn address_fields(event: &str) -> &'static [&'static str] {
    match event {
        "NEW_TRANSACTION" => &["source", "destination"],
        "DEBIT" | "CREDIT" => &["address"],
        "SEND" | "ENHANCED_SEND" | "MPMA_SEND" => &["source", "destination"],
        "ASSET_ISSUANCE" | "RESET_ISSUANCE" | "ASSET_TRANSFER" => &["source", "issuer"],
        "SWEEP" => &["source", "destination"],
        "ASSET_DIVIDEND" => &["source"],
        "ASSET_DESTRUCTION" => &["source"],
        "OPEN_ORDER" => &["source"],
        "ORDER_MATCH" => &["tx0_address", "tx1_address"],
        "BTC_PAY" => &["source", "destination"],
        "CANCEL_ORDER" => &["source"],
        "ORDER_EXPIRATION" => &["source"],
        "ORDER_MATCH_EXPIRATION" => &["tx0_address", "tx1_address"],
        "OPEN_DISPENSER" => &["source", "origin", "oracle_address"],
        "DISPENSER_UPDATE" => &["source"],
        "REFILL_DISPENSER" => &["source", "destination"],
        "DISPENSE" => &["source", "destination"],
        "BROADCAST" => &["source"],
        "BURN" => &["source"],
        "NEW_FAIRMINT" => &["source"],
        "NEW_FAIRMINTER" => &["source"],
        "OPEN_BET" => &["source"],
        "CANCEL_BET" => &["source"],
        "BET_EXPIRATION" => &["source"],
        "BET_MATCH" => &["tx0_address", "tx1_address"],
        "BET_MATCH_EXPIRATION" => &["tx0_address", "tx1_address"],
        "NEW_ADDRESS_OPTIONS" | "ADDRESS_OPTIONS_UPDATE" => &["address"],
        "ATTACH_TO_UTXO" => &["address", "destination_address"],
        "DETACH_FROM_UTXO" => &["source_address", "destination_address"],
        "UTXO_MOVE" => &["source_address", "destination_address"],
        _ => &[],
    }
}

/// Space-separated address string for mempool search, built from the
/// address-bearing bindings of an event.
pub fn addresses_string(event: &str, bindings: &Map<String, Value>) -> String {
    let mut addresses = Vec::new();
    for field in address_fields(event) {
        if let Some(Value::String(address)) = bindings.get(*field) {
            if !address.is_empty() {
                addresses.push(address.as_str());
            }
        }
    }
    addresses.join(" ")
}

/// Integer read tolerant of the ledger occasionally serialising numbers as
/// strings.
pub fn binding_i64(bindings: &Map<String, Value>, field: &str) -> Option<i64> {
    match bindings.get(field) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Bool(b)) => Some(*b as i64),
        _ => None,
    }
}

pub fn binding_str<'a>(bindings: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    match bindings.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

/// Status gate shared by the asset and fairminter updaters: absent status
/// counts as valid.
pub fn binding_status_valid(bindings: &Map<String, Value>) -> bool {
    match bindings.get("status") {
        Some(Value::String(status)) => status == "valid",
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_with_bindings(bindings: Value) -> Event {
        Event {
            message_index: 1,
            block_index: 100,
            event: "ORDER_MATCH_UPDATE".to_string(),
            category: "order_matches".to_string(),
            command: "update".to_string(),
            bindings: bindings.to_string(),
            timestamp: None,
            tx_hash: None,
            event_hash: None,
        }
    }

    #[test]
    fn order_match_id_elided_when_duplicating_id() {
        let event = event_with_bindings(json!({
            "id": "aa_bb",
            "order_match_id": "aa_bb",
            "status": "completed"
        }));
        let bindings = event.canonical_bindings().unwrap();
        assert!(!bindings.contains_key("order_match_id"));
        assert_eq!(bindings.get("id"), Some(&json!("aa_bb")));
    }

    #[test]
    fn order_match_id_kept_when_distinct() {
        let event = event_with_bindings(json!({
            "id": "aa_bb",
            "order_match_id": "cc_dd"
        }));
        let bindings = event.canonical_bindings().unwrap();
        assert_eq!(bindings.get("order_match_id"), Some(&json!("cc_dd")));
    }

    #[test]
    fn id_field_sets_match_the_ledger_contract() {
        assert_eq!(update_id_fields("BLOCK_PARSED"), Some(&["block_index"][..]));
        assert_eq!(update_id_fields("TRANSACTION_PARSED"), Some(&["tx_hash"][..]));
        assert_eq!(update_id_fields("ORDER_MATCH_UPDATE"), Some(&["id"][..]));
        assert_eq!(update_id_fields("ADDRESS_OPTIONS_UPDATE"), Some(&["address"][..]));
        assert_eq!(update_id_fields("FAIRMINTER_UPDATE"), Some(&["tx_hash"][..]));
        assert_eq!(update_id_fields("DEBIT"), None);
    }

    #[test]
    fn addresses_string_skips_absent_fields() {
        let bindings = json!({
            "source": "addr1",
            "destination": "",
            "quantity": 10
        });
        let Value::Object(map) = bindings else { unreachable!() };
        assert_eq!(addresses_string("SEND", &map), "addr1");
        assert_eq!(addresses_string("BLOCK_PARSED", &map), "");
    }

    #[test]
    fn binding_i64_tolerates_stringified_numbers() {
        let bindings = json!({"quantity": "42", "fee_paid": 7});
        let Value::Object(map) = bindings else { unreachable!() };
        assert_eq!(binding_i64(&map, "quantity"), Some(42));
        assert_eq!(binding_i64(&map, "fee_paid"), Some(7));
        assert_eq!(binding_i64(&map, "missing"), None);
    }
}
