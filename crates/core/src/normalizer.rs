use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::abi::{self, AbiError, EventSignature, Quantity};
use crate::types::{CanonicalEvent, DecodedFields, EventName, ProviderId, RawLog};

/// Errors that can occur during normalization of incoming payloads.
#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("failed to parse payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("failed to decode log: {0}")]
    Abi(#[from] AbiError),
    #[error("invalid timestamp for field '{field}': {source}")]
    InvalidTimestamp {
        field: &'static str,
        source: chrono::ParseError,
    },
    #[error("timestamp {0} is out of range")]
    TimestampOutOfRange(u64),
}

/// A log that was skipped because it could not be decoded. Its neighbours in
/// the same delivery are still emitted.
#[derive(Debug)]
pub struct UndecodableLog {
    pub transaction_hash: Option<String>,
    pub log_index: Option<u64>,
    pub error: NormalizerError,
}

/// Output of one delivery: the canonical events plus the logs that failed to
/// decode on their own.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub events: Vec<CanonicalEvent>,
    pub undecodable: Vec<UndecodableLog>,
}

/// Per-provider decoding strategy. Implementations must be deterministic for
/// a given payload and receive time.
pub trait PayloadNormalizer: Send + Sync {
    fn provider(&self) -> ProviderId;

    fn normalize(
        &self,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedBatch, NormalizerError>;
}

/// Delivery level context shared by all logs of one payload.
#[derive(Debug, Clone, Copy)]
pub struct LogContext<'a> {
    pub provider: ProviderId,
    pub network: &'a str,
    /// Used when the log itself carries no block timestamp. Push providers
    /// fall back to `received_at` after that; RPC logs have no fallback.
    pub block_timestamp: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// Decodes one raw log into a [`CanonicalEvent`]. Only logs emitted by the
/// watched invoice contracts are decoded; an empty watch list matches nothing.
#[derive(Debug, Clone)]
pub struct LogDecoder {
    amount_decimals: u32,
    contracts: Arc<HashSet<String>>,
}

impl LogDecoder {
    pub fn new<I, S>(amount_decimals: u32, contracts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let contracts = contracts
            .into_iter()
            .map(|address| address.as_ref().trim().to_ascii_lowercase())
            .collect();
        Self {
            amount_decimals,
            contracts: Arc::new(contracts),
        }
    }

    /// Whether `address` is one of the invoice contracts.
    pub fn watches(&self, address: &str) -> bool {
        self.contracts.contains(&address.to_ascii_lowercase())
    }

    /// Returns `Ok(None)` for logs removed by a reorg and for logs emitted by
    /// any other contract.
    pub fn decode(
        &self,
        log: &RawLog,
        ctx: &LogContext<'_>,
    ) -> Result<Option<CanonicalEvent>, NormalizerError> {
        if log.removed || !self.watches(&log.address) {
            return Ok(None);
        }

        let block_number = log
            .block_number
            .ok_or(NormalizerError::MissingField("blockNumber"))?;
        let block_hash = log
            .block_hash
            .clone()
            .ok_or(NormalizerError::MissingField("blockHash"))?;
        let transaction_hash = log
            .transaction_hash
            .clone()
            .ok_or(NormalizerError::MissingField("transactionHash"))?;
        let transaction_index = log
            .transaction_index
            .ok_or(NormalizerError::MissingField("transactionIndex"))?;
        let log_index = log
            .log_index
            .ok_or(NormalizerError::MissingField("logIndex"))?;

        let block_timestamp = match (log.block_timestamp, ctx.block_timestamp) {
            (Some(Quantity(seconds)), _) => unix_timestamp(seconds)?,
            (None, Some(timestamp)) => timestamp,
            (None, None) if ctx.provider == ProviderId::Rpc => {
                return Err(NormalizerError::MissingField("blockTimestamp"));
            }
            (None, None) => ctx.received_at,
        };

        let (event_name, decoded_fields) = self.decode_fields(log)?;

        Ok(Some(CanonicalEvent {
            provider: ctx.provider,
            event_name,
            network: ctx.network.to_string(),
            block_number: block_number.0,
            block_hash: block_hash.to_ascii_lowercase(),
            block_timestamp,
            transaction_hash: transaction_hash.to_ascii_lowercase(),
            transaction_index: transaction_index.0,
            log_index: log_index.0,
            contract_address: log.address.to_ascii_lowercase(),
            decoded_fields,
            received_at: ctx.received_at,
        }))
    }

    fn decode_fields(&self, log: &RawLog) -> Result<(EventName, DecodedFields), NormalizerError> {
        let signature = log.topics.first().and_then(|topic| abi::lookup_signature(topic));
        let Some(signature) = signature else {
            return Ok(unknown(log));
        };

        let decoded = match signature {
            EventSignature::Transfer => {
                // ERC-20 transfers share topic 0 but carry the value in data.
                if log.topics.len() < 4 {
                    return Ok(unknown(log));
                }
                let from = topic_address(log, 1)?;
                let to = topic_address(log, 2)?;
                let token_id = topic_uint(log, 3)?.to_string();
                let name = if abi::is_zero_address(&from) {
                    EventName::Minted
                } else {
                    EventName::Transferred
                };
                (name, DecodedFields::Transfer { from, to, token_id })
            }
            EventSignature::InvoiceFunded => {
                let words = data_words(log, 2)?;
                (
                    EventName::Funded,
                    DecodedFields::Funded {
                        token_id: topic_uint(log, 1)?.to_string(),
                        investor: topic_address(log, 2)?,
                        amount_cents: self.cents(&words[0])?,
                        funding_target_cents: self.cents(&words[1])?,
                    },
                )
            }
            EventSignature::RepaymentDeposited => {
                let words = data_words(log, 1)?;
                (
                    EventName::RepaymentDeposited,
                    DecodedFields::RepaymentDeposited {
                        token_id: topic_uint(log, 1)?.to_string(),
                        payer: topic_address(log, 2)?,
                        amount_cents: self.cents(&words[0])?,
                    },
                )
            }
            EventSignature::InvoiceSettled => {
                let words = data_words(log, 2)?;
                (
                    EventName::Settled,
                    DecodedFields::Settled {
                        token_id: topic_uint(log, 1)?.to_string(),
                        total_repaid_cents: self.cents(&words[0])?,
                        yield_cents: self.cents(&words[1])?,
                    },
                )
            }
            EventSignature::InvoiceDefaulted => {
                let words = data_words(log, 1)?;
                (
                    EventName::Defaulted,
                    DecodedFields::Defaulted {
                        token_id: topic_uint(log, 1)?.to_string(),
                        outstanding_cents: self.cents(&words[0])?,
                    },
                )
            }
        };
        Ok(decoded)
    }

    fn cents(&self, word: &[u8; abi::WORD_LEN]) -> Result<i64, AbiError> {
        abi::units_to_cents(abi::word_to_u128(word)?, self.amount_decimals)
    }
}

fn unknown(log: &RawLog) -> (EventName, DecodedFields) {
    (
        EventName::Unknown,
        DecodedFields::Unknown {
            topics: log.topics.clone(),
            data: log.data.clone(),
        },
    )
}

fn topic_word(log: &RawLog, index: usize) -> Result<[u8; abi::WORD_LEN], AbiError> {
    let topic = log.topics.get(index).ok_or(AbiError::MissingTopic(index))?;
    abi::decode_word(topic)
}

fn topic_address(log: &RawLog, index: usize) -> Result<String, AbiError> {
    abi::word_to_address(&topic_word(log, index)?)
}

fn topic_uint(log: &RawLog, index: usize) -> Result<u128, AbiError> {
    abi::word_to_u128(&topic_word(log, index)?)
}

fn data_words(log: &RawLog, expected: usize) -> Result<Vec<[u8; abi::WORD_LEN]>, AbiError> {
    let words = abi::data_words(&log.data)?;
    if words.len() < expected {
        return Err(AbiError::MissingData {
            expected,
            actual: words.len(),
        });
    }
    Ok(words)
}

fn unix_timestamp(seconds: u64) -> Result<DateTime<Utc>, NormalizerError> {
    i64::try_from(seconds)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or(NormalizerError::TimestampOutOfRange(seconds))
}

fn collect_events<'a, I>(decoder: &LogDecoder, logs: I, ctx: &LogContext<'_>, out: &mut NormalizedBatch)
where
    I: IntoIterator<Item = &'a RawLog>,
{
    for log in logs {
        match decoder.decode(log, ctx) {
            Ok(Some(event)) => out.events.push(event),
            Ok(None) => {}
            Err(error) => out.undecodable.push(UndecodableLog {
                transaction_hash: log.transaction_hash.clone(),
                log_index: log.log_index.map(|index| index.0),
                error,
            }),
        }
    }
}

/// Activity-shaped deliveries: `event.activity[]`, each entry optionally
/// embedding one log.
#[derive(Debug, Clone)]
pub struct AlchemyNormalizer {
    decoder: LogDecoder,
    default_network: String,
}

impl AlchemyNormalizer {
    pub fn new(decoder: LogDecoder, default_network: impl Into<String>) -> Self {
        Self {
            decoder,
            default_network: default_network.into(),
        }
    }
}

impl PayloadNormalizer for AlchemyNormalizer {
    fn provider(&self) -> ProviderId {
        ProviderId::Alchemy
    }

    fn normalize(
        &self,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedBatch, NormalizerError> {
        let data: AlchemyPayload = serde_json::from_slice(payload)?;
        let event = data.event.ok_or(NormalizerError::MissingField("event"))?;

        let created_at = data
            .created_at
            .as_deref()
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|value| value.with_timezone(&Utc))
                    .map_err(|source| NormalizerError::InvalidTimestamp {
                        field: "createdAt",
                        source,
                    })
            })
            .transpose()?;

        let network = event
            .network
            .map(|value| value.to_ascii_lowercase().replace('_', "-"))
            .unwrap_or_else(|| self.default_network.clone());
        let ctx = LogContext {
            provider: ProviderId::Alchemy,
            network: &network,
            block_timestamp: created_at,
            received_at,
        };

        let logs: Vec<RawLog> = event
            .activity
            .into_iter()
            .filter_map(|activity| {
                let mut log = activity.log?;
                if log.block_number.is_none() {
                    log.block_number = activity.block_num;
                }
                if log.transaction_hash.is_none() {
                    log.transaction_hash = activity.hash;
                }
                Some(log)
            })
            .collect();

        let mut batch = NormalizedBatch::default();
        collect_events(&self.decoder, &logs, &ctx, &mut batch);
        Ok(batch)
    }
}

/// Block-shaped deliveries: one block object, or an array of them, each with
/// a `logs` array.
#[derive(Debug, Clone)]
pub struct QuickNodeNormalizer {
    decoder: LogDecoder,
    default_network: String,
}

impl QuickNodeNormalizer {
    pub fn new(decoder: LogDecoder, default_network: impl Into<String>) -> Self {
        Self {
            decoder,
            default_network: default_network.into(),
        }
    }
}

impl PayloadNormalizer for QuickNodeNormalizer {
    fn provider(&self) -> ProviderId {
        ProviderId::Quicknode
    }

    fn normalize(
        &self,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedBatch, NormalizerError> {
        let blocks = match serde_json::from_slice::<QuickNodePayload>(payload)? {
            QuickNodePayload::Many(blocks) => blocks,
            QuickNodePayload::One(block) => vec![block],
        };

        let mut batch = NormalizedBatch::default();
        for block in blocks {
            let block_timestamp = block.timestamp.map(|q| unix_timestamp(q.0)).transpose()?;
            let network = block
                .network
                .unwrap_or_else(|| self.default_network.clone());
            let ctx = LogContext {
                provider: ProviderId::Quicknode,
                network: &network,
                block_timestamp,
                received_at,
            };
            let logs: Vec<RawLog> = block
                .logs
                .into_iter()
                .map(|mut log| {
                    if log.block_number.is_none() {
                        log.block_number = block.number;
                    }
                    if log.block_hash.is_none() {
                        log.block_hash = block.hash.clone();
                    }
                    log
                })
                .collect();
            collect_events(&self.decoder, &logs, &ctx, &mut batch);
        }
        Ok(batch)
    }
}

/// Plain `eth_getLogs` result arrays.
#[derive(Debug, Clone)]
pub struct RpcLogNormalizer {
    decoder: LogDecoder,
    network: String,
}

impl RpcLogNormalizer {
    pub fn new(decoder: LogDecoder, network: impl Into<String>) -> Self {
        Self {
            decoder,
            network: network.into(),
        }
    }
}

impl PayloadNormalizer for RpcLogNormalizer {
    fn provider(&self) -> ProviderId {
        ProviderId::Rpc
    }

    fn normalize(
        &self,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedBatch, NormalizerError> {
        let logs: Vec<RawLog> = serde_json::from_slice(payload)?;
        let ctx = LogContext {
            provider: ProviderId::Rpc,
            network: &self.network,
            block_timestamp: None,
            received_at,
        };
        let mut batch = NormalizedBatch::default();
        collect_events(&self.decoder, &logs, &ctx, &mut batch);
        Ok(batch)
    }
}

/// Selects the decoding strategy for a provider.
#[derive(Debug, Clone)]
pub struct Normalizer {
    decoder: LogDecoder,
    network: String,
    alchemy: AlchemyNormalizer,
    quicknode: QuickNodeNormalizer,
    rpc: RpcLogNormalizer,
}

impl Normalizer {
    pub fn new<I, S>(amount_decimals: u32, network: impl Into<String>, contracts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let network = network.into();
        let decoder = LogDecoder::new(amount_decimals, contracts);
        Self {
            alchemy: AlchemyNormalizer::new(decoder.clone(), network.clone()),
            quicknode: QuickNodeNormalizer::new(decoder.clone(), network.clone()),
            rpc: RpcLogNormalizer::new(decoder.clone(), network.clone()),
            decoder,
            network,
        }
    }

    pub fn strategy(&self, provider: ProviderId) -> &dyn PayloadNormalizer {
        match provider {
            ProviderId::Alchemy => &self.alchemy,
            ProviderId::Quicknode => &self.quicknode,
            ProviderId::Rpc => &self.rpc,
        }
    }

    /// Converts a raw provider payload into zero or more canonical events.
    /// Structural errors fail the whole payload; a bad log only skips itself.
    pub fn normalize(
        &self,
        provider: ProviderId,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedBatch, NormalizerError> {
        self.strategy(provider).normalize(payload, received_at)
    }

    pub fn decoder(&self) -> &LogDecoder {
        &self.decoder
    }

    pub fn network(&self) -> &str {
        &self.network
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlchemyPayload {
    #[serde(default)]
    created_at: Option<String>,
    event: Option<AlchemyEvent>,
}

#[derive(Debug, Deserialize)]
struct AlchemyEvent {
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    activity: Vec<AlchemyActivity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlchemyActivity {
    #[serde(default)]
    block_num: Option<Quantity>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    log: Option<RawLog>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QuickNodePayload {
    Many(Vec<QuickNodeBlock>),
    One(QuickNodeBlock),
}

#[derive(Debug, Deserialize)]
struct QuickNodeBlock {
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    number: Option<Quantity>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    timestamp: Option<Quantity>,
    #[serde(default)]
    logs: Vec<RawLog>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    use crate::abi::EventSignature;

    pub const CONTRACT: &str = "0x00000000000000000000000000000000000c0de1";
    pub const ZERO: &str = "0x0000000000000000000000000000000000000000";
    pub const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
    pub const BOB: &str = "0x0000000000000000000000000000000000000b0b";

    pub fn uint_topic(value: u128) -> String {
        format!("0x{value:064x}")
    }

    pub fn address_topic(address: &str) -> String {
        format!("0x{:0>64}", address.trim_start_matches("0x"))
    }

    /// Amounts are whole cents at six token decimals.
    pub fn amount_word(cents: u128) -> String {
        format!("{:064x}", cents * 10_000)
    }

    pub fn funded_log(token: u128, cents: u128, target_cents: u128, tx: &str, index: u64) -> Value {
        json!({
            "address": CONTRACT,
            "topics": [
                EventSignature::InvoiceFunded.topic(),
                uint_topic(token),
                address_topic(ALICE),
            ],
            "data": format!("0x{}{}", amount_word(cents), amount_word(target_cents)),
            "transactionHash": tx,
            "transactionIndex": "0x1",
            "logIndex": format!("{index:#x}"),
            "removed": false
        })
    }

    pub fn transfer_log(from: &str, to: &str, token: u128, tx: &str, index: u64) -> Value {
        json!({
            "address": CONTRACT,
            "topics": [
                EventSignature::Transfer.topic(),
                address_topic(from),
                address_topic(to),
                uint_topic(token),
            ],
            "data": "0x",
            "transactionHash": tx,
            "transactionIndex": "0x0",
            "logIndex": format!("{index:#x}"),
            "removed": false
        })
    }
}
