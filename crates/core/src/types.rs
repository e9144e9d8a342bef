use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::abi::Quantity;

/// Indexing provider a payload originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Activity-shaped deliveries (`event.activity[].log`).
    Alchemy,
    /// Block-shaped deliveries (`{ number, hash, timestamp, logs }`).
    Quicknode,
    /// Logs read back from a JSON-RPC node during reconciliation.
    Rpc,
}

impl ProviderId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alchemy => "alchemy",
            Self::Quicknode => "quicknode",
            Self::Rpc => "rpc",
        }
    }

    /// Header carrying the HMAC signature for push deliveries. `None` for
    /// sources that never arrive over the webhook ingress.
    pub fn signature_header(self) -> Option<&'static str> {
        match self {
            Self::Alchemy => Some("x-alchemy-signature"),
            Self::Quicknode => Some("x-quicknode-signature"),
            Self::Rpc => None,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "alchemy" => Ok(Self::Alchemy),
            "quicknode" => Ok(Self::Quicknode),
            "rpc" => Ok(Self::Rpc),
            _ => Err(()),
        }
    }
}

/// Canonical protocol event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    Minted,
    Funded,
    RepaymentDeposited,
    Settled,
    Defaulted,
    Transferred,
    Unknown,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minted => "Minted",
            Self::Funded => "Funded",
            Self::RepaymentDeposited => "RepaymentDeposited",
            Self::Settled => "Settled",
            Self::Defaulted => "Defaulted",
            Self::Transferred => "Transferred",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a log on chain, ordered by block, then transaction, then log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPosition {
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl EventPosition {
    pub fn new(block_number: u64, transaction_index: u64, log_index: u64) -> Self {
        Self {
            block_number,
            transaction_index,
            log_index,
        }
    }

    /// Fixed-width key whose lexical order matches the positional order.
    pub fn to_key(self) -> String {
        format!(
            "{:020}:{:020}:{:020}",
            self.block_number, self.transaction_index, self.log_index
        )
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.block_number, self.transaction_index, self.log_index
        )
    }
}

impl FromStr for EventPosition {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.split(':');
        let mut next = || -> Result<u64, ()> {
            parts
                .next()
                .ok_or(())
                .and_then(|part| part.parse().map_err(|_| ()))
        };
        let position = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(());
        }
        Ok(position)
    }
}

/// Event specific payload decoded from topics and data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DecodedFields {
    #[serde(rename_all = "camelCase")]
    Transfer {
        from: String,
        to: String,
        token_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Funded {
        token_id: String,
        investor: String,
        amount_cents: i64,
        funding_target_cents: i64,
    },
    #[serde(rename_all = "camelCase")]
    RepaymentDeposited {
        token_id: String,
        payer: String,
        amount_cents: i64,
    },
    #[serde(rename_all = "camelCase")]
    Settled {
        token_id: String,
        total_repaid_cents: i64,
        yield_cents: i64,
    },
    #[serde(rename_all = "camelCase")]
    Defaulted {
        token_id: String,
        outstanding_cents: i64,
    },
    #[serde(rename_all = "camelCase")]
    Unknown { topics: Vec<String>, data: String },
}

impl DecodedFields {
    pub fn token_id(&self) -> Option<&str> {
        match self {
            Self::Transfer { token_id, .. }
            | Self::Funded { token_id, .. }
            | Self::RepaymentDeposited { token_id, .. }
            | Self::Settled { token_id, .. }
            | Self::Defaulted { token_id, .. } => Some(token_id),
            Self::Unknown { .. } => None,
        }
    }
}

/// Provider-agnostic representation of one protocol log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalEvent {
    pub provider: ProviderId,
    pub event_name: EventName,
    pub network: String,
    pub block_number: u64,
    pub block_hash: String,
    pub block_timestamp: DateTime<Utc>,
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub log_index: u64,
    pub contract_address: String,
    pub decoded_fields: DecodedFields,
    pub received_at: DateTime<Utc>,
}

impl CanonicalEvent {
    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.block_number, self.transaction_index, self.log_index)
    }

    pub fn token_id(&self) -> Option<&str> {
        self.decoded_fields.token_id()
    }

    /// Key used to keep events of one invoice on one consumer. Events without
    /// a token fall back to their transaction.
    pub fn partition_key(&self) -> &str {
        self.token_id().unwrap_or(&self.transaction_hash)
    }
}

/// Raw log in the JSON-RPC `eth_getLogs` shape, shared by every provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_index: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_index: Option<Quantity>,
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    /// Position of the log when all index fields are present.
    pub fn position(&self) -> Option<EventPosition> {
        Some(EventPosition::new(
            self.block_number?.0,
            self.transaction_index?.0,
            self.log_index?.0,
        ))
    }
}

/// Outcome recorded in the applied-event ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOutcome {
    Applied,
    RejectedInvalidTransition,
    IgnoredUnknown,
}

impl LedgerOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::RejectedInvalidTransition => "rejected-invalid-transition",
            Self::IgnoredUnknown => "ignored-unknown",
        }
    }
}

impl fmt::Display for LedgerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerOutcome {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "applied" => Ok(Self::Applied),
            "rejected-invalid-transition" => Ok(Self::RejectedInvalidTransition),
            "ignored-unknown" => Ok(Self::IgnoredUnknown),
            _ => Err(()),
        }
    }
}

impl Serialize for LedgerOutcome {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LedgerOutcome {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LedgerOutcome::from_str(&value).map_err(|_| D::Error::custom("unknown ledger outcome"))
    }
}
