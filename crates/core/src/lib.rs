//! Pure domain layer: canonical events, provider normalizers and the invoice
//! lifecycle state machine. Nothing in this crate performs I/O.

pub mod abi;
pub mod lifecycle;
pub mod normalizer;
pub mod types;

pub use lifecycle::{
    InvoiceLifecycleRecord, LifecycleStatus, MutationClass, RejectReason, SideEffect,
    TransactionKind, Transition,
};
pub use normalizer::{
    LogContext, LogDecoder, NormalizedBatch, Normalizer, NormalizerError, PayloadNormalizer,
    UndecodableLog,
};
pub use types::{
    CanonicalEvent, DecodedFields, EventName, EventPosition, LedgerOutcome, ProviderId, RawLog,
};
