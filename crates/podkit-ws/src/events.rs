//! Typed push payloads, one per channel.

use std::collections::BTreeMap;
use std::str::FromStr;

use alloy_primitives::{Address, Bytes, B256, U256};
use podkit_core::Receipt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::normalize_id;

/// Decodes a push payload into a typed event.
pub trait Decode: Sized + Send + 'static {
    fn decode(data: Value) -> Result<Self, String>;
}

impl Decode for Value {
    fn decode(data: Value) -> Result<Self, String> {
        Ok(data)
    }
}

fn u256(field: &str, s: &str) -> Result<U256, String> {
    U256::from_str(s.trim()).map_err(|e| format!("{field}: invalid integer {s:?}: {e}"))
}

// ─── Order book ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrderLevel {
    pub price: U256,
    pub volume: U256,
    /// Earliest expiry at this level, in microseconds.
    pub minimum_expiry: u64,
}

/// Snapshot of one order book after a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawOrderBook")]
pub struct OrderBookUpdate {
    pub clob_id: String,
    /// Sorted by price, highest first.
    pub bids: Vec<OrderLevel>,
    /// Sorted by price, lowest first.
    pub asks: Vec<OrderLevel>,
    pub grouping_precision: U256,
    /// Microseconds.
    pub timestamp: u64,
    pub new_bids_count: u32,
}

#[derive(Deserialize)]
struct RawTick {
    volume: String,
    minimum_expiry: u64,
}

#[derive(Deserialize)]
struct RawOrderBook {
    clob_id: String,
    buys: BTreeMap<String, RawTick>,
    sells: BTreeMap<String, RawTick>,
    grouping_precision: String,
    timestamp: u64,
    new_bids_count: u32,
}

fn levels(side: BTreeMap<String, RawTick>) -> Result<Vec<OrderLevel>, String> {
    side.into_iter()
        .map(|(price, tick)| {
            Ok(OrderLevel {
                price: u256("price", &price)?,
                volume: u256("volume", &tick.volume)?,
                minimum_expiry: tick.minimum_expiry,
            })
        })
        .collect()
}

impl TryFrom<RawOrderBook> for OrderBookUpdate {
    type Error = String;

    fn try_from(raw: RawOrderBook) -> Result<Self, String> {
        let mut bids = levels(raw.buys)?;
        let mut asks = levels(raw.sells)?;
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        Ok(Self {
            clob_id: normalize_id(&raw.clob_id),
            bids,
            asks,
            grouping_precision: u256("grouping_precision", &raw.grouping_precision)?,
            timestamp: raw.timestamp,
            new_bids_count: raw.new_bids_count,
        })
    }
}

impl OrderBookUpdate {
    pub fn best_bid(&self) -> Option<U256> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<U256> {
        self.asks.first().map(|l| l.price)
    }

    /// `best_ask - best_bid`; `None` if a side is empty or the book is crossed.
    pub fn spread(&self) -> Option<U256> {
        self.best_ask()?.checked_sub(self.best_bid()?)
    }

    pub fn mid_price(&self) -> Option<U256> {
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        Some((bid >> 1) + (ask >> 1) + (bid & ask & U256::from(1)))
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Levels on the deeper side.
    pub fn depth(&self) -> usize {
        self.bids.len().max(self.asks.len())
    }
}

impl Decode for OrderBookUpdate {
    fn decode(data: Value) -> Result<Self, String> {
        serde_json::from_value(data).map_err(|e| e.to_string())
    }
}

// ─── Bids ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawClobBid")]
pub struct ClobBid {
    pub tx_hash: B256,
    pub bidder: Address,
    pub volume: U256,
    pub price: U256,
    pub side: Side,
    pub start_ts: u64,
    pub end_ts: u64,
    pub nonce: u64,
}

#[derive(Deserialize)]
struct RawClobBid {
    tx_hash: String,
    bidder: String,
    volume: String,
    price: String,
    side: Side,
    start_ts: u64,
    end_ts: u64,
    nonce: u64,
}

impl TryFrom<RawClobBid> for ClobBid {
    type Error = String;

    fn try_from(raw: RawClobBid) -> Result<Self, String> {
        Ok(Self {
            tx_hash: B256::from_str(&raw.tx_hash).map_err(|e| format!("tx_hash: {e}"))?,
            bidder: Address::from_str(&raw.bidder).map_err(|e| format!("bidder: {e}"))?,
            volume: u256("volume", &raw.volume)?,
            price: u256("price", &raw.price)?,
            side: raw.side,
            start_ts: raw.start_ts,
            end_ts: raw.end_ts,
            nonce: raw.nonce,
        })
    }
}

/// New bids placed on one order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidEvent {
    #[serde(deserialize_with = "prefixed_id")]
    pub clob_id: String,
    pub bids: Vec<ClobBid>,
    pub timestamp: u64,
}

fn prefixed_id<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    String::deserialize(d).map(|s| normalize_id(&s))
}

impl BidEvent {
    pub fn count(&self) -> usize {
        self.bids.len()
    }
}

impl Decode for BidEvent {
    fn decode(data: Value) -> Result<Self, String> {
        serde_json::from_value(data).map_err(|e| e.to_string())
    }
}

// ─── Auction bids ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawAuctionBid")]
pub struct AuctionBid {
    pub tx_hash: B256,
    pub bidder: Address,
    pub auction_id: U256,
    pub value: U256,
    pub data: Bytes,
    pub deadline: u64,
}

#[derive(Deserialize)]
struct RawAuctionBid {
    tx_hash: String,
    bidder: String,
    auction_id: String,
    value: String,
    data: String,
    deadline: u64,
}

impl TryFrom<RawAuctionBid> for AuctionBid {
    type Error = String;

    fn try_from(raw: RawAuctionBid) -> Result<Self, String> {
        Ok(Self {
            tx_hash: B256::from_str(&raw.tx_hash).map_err(|e| format!("tx_hash: {e}"))?,
            bidder: Address::from_str(&raw.bidder).map_err(|e| format!("bidder: {e}"))?,
            auction_id: u256("auction_id", &raw.auction_id)?,
            value: u256("value", &raw.value)?,
            data: Bytes::from_str(&raw.data).map_err(|e| format!("data: {e}"))?,
            deadline: raw.deadline,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionBidEvent {
    pub bids: Vec<AuctionBid>,
    pub timestamp: u64,
}

impl AuctionBidEvent {
    pub fn count(&self) -> usize {
        self.bids.len()
    }

    pub fn highest(&self) -> Option<&AuctionBid> {
        self.bids.iter().max_by_key(|b| b.value)
    }
}

impl Decode for AuctionBidEvent {
    fn decode(data: Value) -> Result<Self, String> {
        serde_json::from_value(data).map_err(|e| e.to_string())
    }
}

// ─── Receipts ─────────────────────────────────────────────────────────────────

/// A confirmed receipt pushed by the node.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptEvent(pub Receipt);

impl ReceiptEvent {
    pub fn into_receipt(self) -> Receipt {
        self.0
    }
}

impl Decode for ReceiptEvent {
    fn decode(data: Value) -> Result<Self, String> {
        match Receipt::from_json(data) {
            Ok(Some(receipt)) => Ok(Self(receipt)),
            Ok(None) => Err("null receipt".into()),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> Value {
        json!({
            "type": "orderbook_snapshot",
            "clob_id": "AB",
            "buys": {
                "1000": { "volume": "5", "minimum_expiry": 10 },
                "1200": { "volume": "1", "minimum_expiry": 11 },
                "900":  { "volume": "7", "minimum_expiry": 12 }
            },
            "sells": {
                "1500": { "volume": "3", "minimum_expiry": 13 },
                "1301": { "volume": "2", "minimum_expiry": 14 }
            },
            "grouping_precision": "100",
            "timestamp": 1_700_000_000_000_000u64,
            "new_bids_count": 2
        })
    }

    #[test]
    fn orderbook_sides_are_sorted() {
        let book = OrderBookUpdate::decode(snapshot()).unwrap();
        assert_eq!(book.clob_id, "0xab");
        let bids: Vec<_> = book.bids.iter().map(|l| l.price.to::<u64>()).collect();
        let asks: Vec<_> = book.asks.iter().map(|l| l.price.to::<u64>()).collect();
        assert_eq!(bids, [1200, 1000, 900]);
        assert_eq!(asks, [1301, 1500]);
        assert_eq!(book.depth(), 3);
        assert_eq!(book.new_bids_count, 2);
    }

    #[test]
    fn orderbook_helpers() {
        let book = OrderBookUpdate::decode(snapshot()).unwrap();
        assert_eq!(book.best_bid(), Some(U256::from(1200)));
        assert_eq!(book.best_ask(), Some(U256::from(1301)));
        assert_eq!(book.spread(), Some(U256::from(101)));
        assert_eq!(book.mid_price(), Some(U256::from(1250)));
        assert!(!book.is_empty());

        let mut one_sided = snapshot();
        one_sided["sells"] = json!({});
        let book = OrderBookUpdate::decode(one_sided).unwrap();
        assert_eq!(book.spread(), None);
        assert_eq!(book.mid_price(), None);
    }

    #[test]
    fn orderbook_rejects_bad_price() {
        let mut bad = snapshot();
        bad["buys"] = json!({ "lots": { "volume": "1", "minimum_expiry": 0 } });
        assert!(OrderBookUpdate::decode(bad).is_err());
        assert!(OrderBookUpdate::decode(json!({"clob_id": "0x1"})).is_err());
    }

    #[test]
    fn bid_event_decodes() {
        let ev = BidEvent::decode(json!({
            "clob_id": "0xAB",
            "bids": [{
                "tx_hash": "11".repeat(32),
                "bidder": "0x00000000000000000000000000000000000000aa",
                "volume": "100",
                "price": "0x10",
                "side": "sell",
                "start_ts": 1,
                "end_ts": 2,
                "nonce": 3
            }],
            "timestamp": 9
        }))
        .unwrap();
        assert_eq!(ev.clob_id, "0xab");
        assert_eq!(ev.count(), 1);
        assert_eq!(ev.bids[0].side, Side::Sell);
        assert_eq!(ev.bids[0].price, U256::from(16));
        assert_eq!(ev.bids[0].tx_hash, B256::repeat_byte(0x11));
    }

    #[test]
    fn auction_bid_event_decodes() {
        let bid = |value: &str| {
            json!({
                "tx_hash": format!("0x{}", "22".repeat(32)),
                "bidder": "0x00000000000000000000000000000000000000bb",
                "auction_id": "7",
                "value": value,
                "data": "beef",
                "deadline": 100
            })
        };
        let ev = AuctionBidEvent::decode(json!({ "bids": [bid("5"), bid("9")], "timestamp": 1 })).unwrap();
        assert_eq!(ev.count(), 2);
        assert_eq!(ev.highest().unwrap().value, U256::from(9));
        assert_eq!(ev.bids[0].data, Bytes::from_static(&[0xbe, 0xef]));
        assert_eq!(ev.bids[0].auction_id, U256::from(7));
    }

    #[test]
    fn receipt_event_requires_a_receipt() {
        assert!(ReceiptEvent::decode(Value::Null).is_err());
        let ev = ReceiptEvent::decode(json!({
            "transactionHash": format!("0x{}", "33".repeat(32)),
            "from": "0x00000000000000000000000000000000000000aa",
            "status": "0x1"
        }))
        .unwrap();
        assert_eq!(ev.0.transaction_hash, B256::repeat_byte(0x33));
    }
}
