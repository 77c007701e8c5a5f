//! Subscription channels, their typed params, and the canonical key policy.
//!
//! Params are canonicalized before they are sent or compared: object keys are
//! sorted recursively and every `0x`-prefixed hex string is lowercased, so
//! `{"clob_ids": ["0xAB"]}` and `{"clob_ids": ["0xab"]}` name the same
//! subscription. Arrays keep their order. Absent params and `{}` are equal.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::WsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Orderbook,
    Bids,
    AuctionBids,
    /// Confirmed transaction receipts, optionally for one account.
    Receipts,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Self::Orderbook, Self::Bids, Self::AuctionBids, Self::Receipts];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orderbook => "orderbook",
            Self::Bids => "bids",
            Self::AuctionBids => "auction_bids",
            Self::Receipts => "receipts",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown channel `{s}`"))
    }
}

/// Price levels per side when a subscriber does not ask for a depth.
pub const DEFAULT_ORDERBOOK_DEPTH: u32 = 10;

fn default_depth() -> u32 {
    DEFAULT_ORDERBOOK_DEPTH
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderbookParams {
    /// Order books to follow; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clob_ids: Vec<String>,
    /// Price levels per side. Always sent.
    #[serde(default = "default_depth")]
    pub depth: u32,
}

impl Default for OrderbookParams {
    fn default() -> Self {
        Self { clob_ids: Vec::new(), depth: DEFAULT_ORDERBOOK_DEPTH }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BidsParams {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clob_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuctionBidsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auction_id: Option<U256>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiptsParams {
    /// Only receipts sent from or to this account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Address>,
}

/// Params of one subscription, one variant per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionParams {
    Orderbook(OrderbookParams),
    Bids(BidsParams),
    AuctionBids(AuctionBidsParams),
    Receipts(ReceiptsParams),
}

impl SubscriptionParams {
    /// Validate untyped params against `channel`; unknown fields are rejected.
    pub fn parse(channel: Channel, params: Option<Value>) -> Result<Self, WsError> {
        let params = match params {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(v) => v,
        };
        let invalid = |e: serde_json::Error| WsError::InvalidParams {
            channel: channel.to_string(),
            reason: e.to_string(),
        };
        Ok(match channel {
            Channel::Orderbook => Self::Orderbook(serde_json::from_value(params).map_err(invalid)?),
            Channel::Bids => Self::Bids(serde_json::from_value(params).map_err(invalid)?),
            Channel::AuctionBids => Self::AuctionBids(serde_json::from_value(params).map_err(invalid)?),
            Channel::Receipts => Self::Receipts(serde_json::from_value(params).map_err(invalid)?),
        })
    }

    pub fn channel(&self) -> Channel {
        match self {
            Self::Orderbook(_) => Channel::Orderbook,
            Self::Bids(_) => Channel::Bids,
            Self::AuctionBids(_) => Channel::AuctionBids,
            Self::Receipts(_) => Channel::Receipts,
        }
    }

    /// Canonical wire form; `None` when there is nothing to send.
    pub fn to_wire(&self) -> Option<Value> {
        let value = match self {
            Self::Orderbook(p) => serde_json::to_value(p),
            Self::Bids(p) => serde_json::to_value(p),
            Self::AuctionBids(p) => serde_json::to_value(p),
            Self::Receipts(p) => serde_json::to_value(p),
        }
        .ok()?;
        match canonicalize(value) {
            Value::Object(map) if map.is_empty() => None,
            v => Some(v),
        }
    }

    /// The registry key: channel plus canonical params.
    pub fn key(&self) -> String {
        match self.to_wire() {
            Some(params) => format!("{}:{}", self.channel(), params),
            None => self.channel().to_string(),
        }
    }

    /// Whether a push payload on this channel belongs to this subscription.
    pub fn matches(&self, data: &Value) -> bool {
        match self {
            Self::Orderbook(OrderbookParams { clob_ids, .. }) | Self::Bids(BidsParams { clob_ids }) => {
                clob_ids.is_empty()
                    || data
                        .get("clob_id")
                        .and_then(Value::as_str)
                        .map(normalize_id)
                        .is_some_and(|id| clob_ids.iter().any(|want| normalize_id(want) == id))
            }
            Self::AuctionBids(AuctionBidsParams { auction_id: None }) => true,
            Self::AuctionBids(AuctionBidsParams {
                auction_id: Some(want),
            }) => data
                .get("bids")
                .and_then(Value::as_array)
                .is_some_and(|bids| {
                    bids.iter().any(|bid| {
                        bid.get("auction_id")
                            .and_then(Value::as_str)
                            .and_then(|s| U256::from_str(s).ok())
                            == Some(*want)
                    })
                }),
            Self::Receipts(ReceiptsParams { account: None }) => true,
            Self::Receipts(ReceiptsParams { account: Some(want) }) => ["from", "to"].iter().any(|field| {
                data.get(field)
                    .and_then(Value::as_str)
                    .and_then(|s| Address::from_str(s).ok())
                    == Some(*want)
            }),
        }
    }
}

/// Lowercase and `0x`-prefix an identifier.
pub(crate) fn normalize_id(id: &str) -> String {
    let id = id.trim();
    let hex = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")).unwrap_or(id);
    format!("0x{}", hex.to_ascii_lowercase())
}

/// Apply the canonicalization policy described at module level.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::String(s) if is_prefixed_hex(&s) => Value::String(s.to_ascii_lowercase()),
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, canonicalize(v))).collect())
        }
        other => other,
    }
}

fn is_prefixed_hex(s: &str) -> bool {
    let Some(digits) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) else {
        return false;
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_hexdigit())
}
