//! Hex and ABI word decoding for the invoice contract's logs.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tiny_keccak::{Hasher, Keccak};

/// Size of one ABI word in bytes.
pub const WORD_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("invalid integer quantity: {0}")]
    InvalidQuantity(String),
    #[error("expected a {WORD_LEN}-byte word, got {0} bytes")]
    WordLength(usize),
    #[error("data length {0} is not a multiple of {WORD_LEN} bytes")]
    DataLength(usize),
    #[error("value does not fit in 128 bits")]
    Overflow,
    #[error("word is not a left-padded 20-byte address")]
    NotAnAddress,
    #[error("missing topic at index {0}")]
    MissingTopic(usize),
    #[error("expected {expected} data words, got {actual}")]
    MissingData { expected: usize, actual: usize },
    #[error("amount does not fit in cents")]
    AmountOutOfRange,
}

/// Known event signatures of the invoice contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSignature {
    Transfer,
    InvoiceFunded,
    RepaymentDeposited,
    InvoiceSettled,
    InvoiceDefaulted,
}

impl EventSignature {
    const ALL: [Self; 5] = [
        Self::Transfer,
        Self::InvoiceFunded,
        Self::RepaymentDeposited,
        Self::InvoiceSettled,
        Self::InvoiceDefaulted,
    ];

    pub fn signature(self) -> &'static str {
        match self {
            Self::Transfer => "Transfer(address,address,uint256)",
            Self::InvoiceFunded => "InvoiceFunded(uint256,address,uint256,uint256)",
            Self::RepaymentDeposited => "RepaymentDeposited(uint256,address,uint256)",
            Self::InvoiceSettled => "InvoiceSettled(uint256,uint256,uint256)",
            Self::InvoiceDefaulted => "InvoiceDefaulted(uint256,uint256)",
        }
    }

    /// Hex encoded topic 0 of the event.
    pub fn topic(self) -> String {
        event_topic(self.signature())
    }
}

static SIGNATURES: LazyLock<HashMap<String, EventSignature>> = LazyLock::new(|| {
    EventSignature::ALL
        .into_iter()
        .map(|signature| (signature.topic(), signature))
        .collect()
});

/// Resolves topic 0 against the static signature table.
pub fn lookup_signature(topic0: &str) -> Option<EventSignature> {
    SIGNATURES.get(&topic0.to_ascii_lowercase()).copied()
}

/// `keccak256` of an event signature, `0x`-prefixed lowercase hex.
pub fn event_topic(signature: &str) -> String {
    let mut hasher = Keccak::v256();
    hasher.update(signature.as_bytes());
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    format!("0x{}", hex::encode(output))
}

/// Integer that providers encode either as `0x` hex or as decimal, in a
/// string or a bare JSON number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Quantity(pub u64);

impl Quantity {
    pub fn parse(raw: &str) -> Result<Self, AbiError> {
        parse_quantity(raw).map(Self)
    }
}

pub fn parse_quantity(raw: &str) -> Result<u64, AbiError> {
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some("") => Ok(0),
        Some(digits) => u64::from_str_radix(digits, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed.map_err(|_| AbiError::InvalidQuantity(raw.to_string()))
}

impl Serialize for Quantity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:#x}", self.0))
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct QuantityVisitor;

        impl<'de> Visitor<'de> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a hex or decimal integer")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Quantity, E> {
                Ok(Quantity(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Quantity, E> {
                u64::try_from(value)
                    .map(Quantity)
                    .map_err(|_| E::custom("negative quantity"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Quantity, E> {
                Quantity::parse(value).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}

/// Decodes `0x`-prefixed (or bare) hex into bytes.
pub fn decode_hex(raw: &str) -> Result<Vec<u8>, AbiError> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(digits).map_err(|_| AbiError::InvalidHex(raw.to_string()))
}

/// Decodes a single 32-byte word, e.g. an indexed topic.
pub fn decode_word(raw: &str) -> Result<[u8; WORD_LEN], AbiError> {
    let bytes = decode_hex(raw)?;
    <[u8; WORD_LEN]>::try_from(bytes.as_slice()).map_err(|_| AbiError::WordLength(bytes.len()))
}

/// Splits a data blob into 32-byte words.
pub fn data_words(raw: &str) -> Result<Vec<[u8; WORD_LEN]>, AbiError> {
    let bytes = decode_hex(raw)?;
    if bytes.len() % WORD_LEN != 0 {
        return Err(AbiError::DataLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(WORD_LEN)
        .map(|chunk| {
            let mut word = [0u8; WORD_LEN];
            word.copy_from_slice(chunk);
            word
        })
        .collect())
}

pub fn word_to_u128(word: &[u8; WORD_LEN]) -> Result<u128, AbiError> {
    let (high, low) = word.split_at(16);
    if high.iter().any(|byte| *byte != 0) {
        return Err(AbiError::Overflow);
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(low);
    Ok(u128::from_be_bytes(buf))
}

/// Drops the 12 bytes of left padding of an indexed address.
pub fn word_to_address(word: &[u8; WORD_LEN]) -> Result<String, AbiError> {
    let (padding, address) = word.split_at(12);
    if padding.iter().any(|byte| *byte != 0) {
        return Err(AbiError::NotAnAddress);
    }
    Ok(format!("0x{}", hex::encode(address)))
}

pub fn is_zero_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .map(|digits| digits.chars().all(|c| c == '0'))
        .unwrap_or(false)
}

/// Converts token base units to cents, rounding down.
pub fn units_to_cents(units: u128, decimals: u32) -> Result<i64, AbiError> {
    let cents = if decimals >= 2 {
        let divisor = 10u128
            .checked_pow(decimals - 2)
            .ok_or(AbiError::AmountOutOfRange)?;
        units / divisor
    } else {
        units
            .checked_mul(10u128.pow(2 - decimals))
            .ok_or(AbiError::AmountOutOfRange)?
    };
    i64::try_from(cents).map_err(|_| AbiError::AmountOutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_topic_matches_erc721_constant() {
        assert_eq!(
            EventSignature::Transfer.topic(),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
        assert_eq!(
            lookup_signature("0xDDF252AD1BE2C89B69C2B068FC378DAA952BA7F163C4A11628F55A4DF523B3EF"),
            Some(EventSignature::Transfer)
        );
        assert_eq!(lookup_signature("0x00"), None);
    }

    #[test]
    fn quantities_accept_hex_and_decimal() {
        assert_eq!(parse_quantity("0x1b4"), Ok(436));
        assert_eq!(parse_quantity("436"), Ok(436));
        assert_eq!(parse_quantity("0x"), Ok(0));
        assert!(parse_quantity("0xzz").is_err());

        let from_json: Vec<Quantity> =
            serde_json::from_str(r#"["0x10", "16", 16]"#).expect("quantities");
        assert_eq!(from_json, vec![Quantity(16); 3]);
    }

    #[test]
    fn unpads_indexed_addresses() {
        let word = decode_word(
            "0x000000000000000000000000AbCdEf0000000000000000000000000000000001",
        )
        .expect("word");
        assert_eq!(
            word_to_address(&word).expect("address"),
            "0xabcdef0000000000000000000000000000000001"
        );

        let mut dirty = word;
        dirty[0] = 1;
        assert_eq!(word_to_address(&dirty), Err(AbiError::NotAnAddress));
    }

    #[test]
    fn rejects_values_wider_than_128_bits() {
        let mut word = [0u8; WORD_LEN];
        word[31] = 42;
        assert_eq!(word_to_u128(&word), Ok(42));
        word[15] = 1;
        assert_eq!(word_to_u128(&word), Err(AbiError::Overflow));
    }

    #[test]
    fn splits_data_into_words() {
        let data = format!("0x{}{}", "00".repeat(31) + "01", "00".repeat(31) + "02");
        let words = data_words(&data).expect("words");
        assert_eq!(words.len(), 2);
        assert_eq!(word_to_u128(&words[1]), Ok(2));
        assert_eq!(data_words("0x0102"), Err(AbiError::DataLength(2)));
        assert_eq!(data_words("0x").map(|w| w.len()), Ok(0));
    }

    #[test]
    fn converts_base_units_to_cents() {
        assert_eq!(units_to_cents(6_000_000_000, 6), Ok(600_000));
        assert_eq!(units_to_cents(1_234_567, 6), Ok(123));
        assert_eq!(units_to_cents(5, 2), Ok(5));
        assert_eq!(units_to_cents(u128::MAX, 6), Err(AbiError::AmountOutOfRange));
    }
}
