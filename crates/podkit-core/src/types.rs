//! Receipt model and its decoding from node JSON.
//!
//! Nodes encode quantities either as `0x` hex strings or plain numbers, and
//! receipt status as a bool, `"0x1"`/`"0x0"` or `1`/`0`. Both spellings are
//! accepted here so callers only ever see typed values.

use std::collections::BTreeMap;

use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// 32-byte transaction hash assigned by the network.
pub type TxHash = B256;

/// Transaction hash and committee epoch the attestation was produced in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedTx {
    pub hash: TxHash,
    pub committee_epoch: u64,
}

/// Pod-specific attestation data carried at the top level of a receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodMetadata {
    pub attested_tx: Option<AttestedTx>,
    /// Validator index → signature.
    pub signatures: BTreeMap<String, String>,
}

impl PodMetadata {
    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn committee_epoch(&self) -> Option<u64> {
        self.attested_tx.as_ref().map(|a| a.committee_epoch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default, with = "quantity::opt")]
    pub log_index: Option<u64>,
    #[serde(default)]
    pub removed: bool,
}

/// A transaction receipt with attestation metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub from: Address,
    pub to: Option<Address>,
    pub contract_address: Option<Address>,
    /// `true` = executed successfully, `false` = reverted.
    pub status: bool,
    pub gas_used: u128,
    pub cumulative_gas_used: u128,
    pub effective_gas_price: u128,
    pub transaction_index: Option<u64>,
    pub logs: Vec<Log>,
    pub pod_metadata: PodMetadata,
}

impl Receipt {
    /// Decode a receipt RPC result. `null` means the transaction is not yet known.
    pub fn from_json(value: Value) -> Result<Option<Self>, TransportError> {
        if value.is_null() {
            return Ok(None);
        }
        let raw: RawReceipt = serde_json::from_value(value)
            .map_err(|e| TransportError::MalformedResponse(format!("receipt: {e}")))?;
        Ok(Some(raw.into()))
    }

    pub fn succeeded(&self) -> bool {
        self.status
    }

    pub fn is_deployment(&self) -> bool {
        self.contract_address.is_some()
    }

    /// `gas_used * effective_gas_price`, saturating.
    pub fn total_cost(&self) -> u128 {
        self.gas_used.saturating_mul(self.effective_gas_price)
    }

    pub fn signature_count(&self) -> usize {
        self.pod_metadata.signature_count()
    }

    pub fn has_attestations(&self) -> bool {
        self.signature_count() > 0
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: TxHash,
    #[serde(default, with = "quantity::opt")]
    block_number: Option<u64>,
    #[serde(default)]
    block_hash: Option<B256>,
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    #[serde(default)]
    contract_address: Option<Address>,
    #[serde(deserialize_with = "status::deserialize")]
    status: bool,
    #[serde(default, with = "quantity")]
    gas_used: u128,
    #[serde(default, with = "quantity")]
    cumulative_gas_used: u128,
    #[serde(default, with = "quantity")]
    effective_gas_price: u128,
    #[serde(default, with = "quantity::opt")]
    transaction_index: Option<u64>,
    #[serde(default)]
    logs: Vec<Log>,
    #[serde(default, rename = "attested_tx")]
    attested_tx: Option<AttestedTx>,
    #[serde(default)]
    signatures: BTreeMap<String, String>,
}

impl From<RawReceipt> for Receipt {
    fn from(r: RawReceipt) -> Self {
        Self {
            transaction_hash: r.transaction_hash,
            block_number: r.block_number,
            block_hash: r.block_hash,
            from: r.from,
            to: r.to,
            contract_address: r.contract_address,
            status: r.status,
            gas_used: r.gas_used,
            cumulative_gas_used: r.cumulative_gas_used,
            effective_gas_price: r.effective_gas_price,
            transaction_index: r.transaction_index,
            logs: r.logs,
            pod_metadata: PodMetadata {
                attested_tx: r.attested_tx,
                signatures: r.signatures,
            },
        }
    }
}

/// Parse a quantity string: `0x`-prefixed hex or decimal.
pub fn parse_quantity(s: &str) -> Result<u128, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some("") => Ok(0),
        Some(hex) => u128::from_str_radix(hex, 16),
        None => s.parse::<u128>(),
    };
    parsed.map_err(|e| format!("invalid quantity {s:?}: {e}"))
}

/// serde helpers for hex-or-number quantities.
pub mod quantity {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u64),
        Str(String),
    }

    fn to_u128(r: Repr) -> Result<u128, String> {
        match r {
            Repr::Num(n) => Ok(n as u128),
            Repr::Str(s) => super::parse_quantity(&s),
        }
    }

    pub fn deserialize<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<u128>,
    {
        let v = to_u128(Repr::deserialize(d)?).map_err(D::Error::custom)?;
        T::try_from(v).map_err(|_| D::Error::custom(format!("quantity {v} out of range")))
    }

    pub fn serialize<S: Serializer, T: Into<u128> + Copy>(v: &T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:#x}", (*v).into()))
    }

    pub mod opt {
        use super::*;

        pub fn deserialize<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
        where
            D: Deserializer<'de>,
            T: TryFrom<u128>,
        {
            match Option::<Repr>::deserialize(d)? {
                None => Ok(None),
                Some(r) => {
                    let v = to_u128(r).map_err(D::Error::custom)?;
                    T::try_from(v)
                        .map(Some)
                        .map_err(|_| D::Error::custom(format!("quantity {v} out of range")))
                }
            }
        }

        pub fn serialize<S: Serializer, T: Into<u128> + Copy>(
            v: &Option<T>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match v {
                Some(v) => super::serialize(v, s),
                None => s.serialize_none(),
            }
        }
    }
}

mod status {
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        match Value::deserialize(d)? {
            Value::Bool(b) => Ok(b),
            Value::Number(n) => match n.as_u64() {
                Some(0) => Ok(false),
                Some(1) => Ok(true),
                _ => Err(D::Error::custom(format!("invalid receipt status {n}"))),
            },
            Value::String(s) => match s.as_str() {
                "0x0" | "0" => Ok(false),
                "0x1" | "1" => Ok(true),
                _ => Err(D::Error::custom(format!("invalid receipt status {s:?}"))),
            },
            other => Err(D::Error::custom(format!("invalid receipt status {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(status: Value) -> Value {
        json!({
            "transactionHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "blockNumber": "0x10",
            "blockHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "from": "0x00000000000000000000000000000000000000aa",
            "to": null,
            "contractAddress": null,
            "status": status,
            "gasUsed": "0x5208",
            "cumulativeGasUsed": "0x5208",
            "effectiveGasPrice": "0x3b9aca00",
            "transactionIndex": "0x0",
            "logs": [],
            "attested_tx": {
                "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
                "committee_epoch": 3
            },
            "signatures": { "0": "0xaa", "1": "0xbb" }
        })
    }

    #[test]
    fn decodes_full_receipt() {
        let r = Receipt::from_json(sample(json!("0x1"))).unwrap().unwrap();
        assert!(r.succeeded());
        assert_eq!(r.block_number, Some(16));
        assert_eq!(r.gas_used, 21_000);
        assert_eq!(r.total_cost(), 21_000 * 1_000_000_000);
        assert_eq!(r.signature_count(), 2);
        assert_eq!(r.pod_metadata.committee_epoch(), Some(3));
        assert!(!r.is_deployment());
    }

    #[test]
    fn status_spellings() {
        for (v, expected) in [
            (json!(true), true),
            (json!(false), false),
            (json!("0x1"), true),
            (json!("0x0"), false),
            (json!(1), true),
            (json!(0), false),
        ] {
            let r = Receipt::from_json(sample(v.clone())).unwrap().unwrap();
            assert_eq!(r.status, expected, "status {v}");
        }
    }

    #[test]
    fn null_is_not_found() {
        assert!(Receipt::from_json(Value::Null).unwrap().is_none());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = Receipt::from_json(json!({"transactionHash": 5})).unwrap_err();
        assert!(err.is_malformed());
        let err = Receipt::from_json(sample(json!(["x"]))).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn unknown_status_is_malformed() {
        for v in [json!("0x2"), json!("bogus"), json!(""), json!(7), json!(-1), json!(1.5)] {
            let err = Receipt::from_json(sample(v.clone())).unwrap_err();
            assert!(err.is_malformed(), "status {v}");
        }
    }

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert_eq!(parse_quantity("0xff").unwrap(), 255);
        assert_eq!(parse_quantity("1000").unwrap(), 1000);
        assert!(parse_quantity("0xzz").is_err());
    }
}
