//! Invoice lifecycle state machine.
//!
//! [`apply`] is pure: it validates one canonical event against the current
//! record and returns either the mutated record plus its side effects, or the
//! reason the event was rejected. Persistence and idempotency live in the
//! synchronizer that calls it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CanonicalEvent, DecodedFields, EventName, EventPosition};

/// Position of an invoice in its financing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Draft,
    Listed,
    PartiallyFunded,
    FullyFunded,
    Disbursed,
    PendingRepayment,
    PartiallyRepaid,
    FullyRepaid,
    Settled,
    Overdue,
    UnderCollection,
    Defaulted,
}

impl LifecycleStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Listed => "LISTED",
            Self::PartiallyFunded => "PARTIALLY_FUNDED",
            Self::FullyFunded => "FULLY_FUNDED",
            Self::Disbursed => "DISBURSED",
            Self::PendingRepayment => "PENDING_REPAYMENT",
            Self::PartiallyRepaid => "PARTIALLY_REPAID",
            Self::FullyRepaid => "FULLY_REPAID",
            Self::Settled => "SETTLED",
            Self::Overdue => "OVERDUE",
            Self::UnderCollection => "UNDER_COLLECTION",
            Self::Defaulted => "DEFAULTED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Defaulted)
    }

    fn accepts_funding(self) -> bool {
        matches!(self, Self::Listed | Self::PartiallyFunded)
    }

    fn accepts_repayment(self) -> bool {
        matches!(
            self,
            Self::FullyFunded
                | Self::Disbursed
                | Self::PendingRepayment
                | Self::PartiallyRepaid
                | Self::Overdue
                | Self::UnderCollection
        )
    }

    fn accepts_default(self) -> bool {
        self.accepts_repayment()
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "DRAFT" => Ok(Self::Draft),
            "LISTED" => Ok(Self::Listed),
            "PARTIALLY_FUNDED" => Ok(Self::PartiallyFunded),
            "FULLY_FUNDED" => Ok(Self::FullyFunded),
            "DISBURSED" => Ok(Self::Disbursed),
            "PENDING_REPAYMENT" => Ok(Self::PendingRepayment),
            "PARTIALLY_REPAID" => Ok(Self::PartiallyRepaid),
            "FULLY_REPAID" => Ok(Self::FullyRepaid),
            "SETTLED" => Ok(Self::Settled),
            "OVERDUE" => Ok(Self::Overdue),
            "UNDER_COLLECTION" => Ok(Self::UnderCollection),
            "DEFAULTED" => Ok(Self::Defaulted),
            _ => Err(()),
        }
    }
}

/// Authoritative lifecycle state of one invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLifecycleRecord {
    pub invoice_id: String,
    /// Invoice contract that minted the token. Token ids are only unique
    /// within one contract.
    pub contract_address: Option<String>,
    pub token_id: Option<String>,
    pub status: LifecycleStatus,
    pub owner_address: Option<String>,
    pub minted_at: Option<DateTime<Utc>>,
    pub mint_tx_hash: Option<String>,
    pub funding_target_cents: i64,
    pub funded_amount_cents: i64,
    pub expected_repayment_cents: i64,
    pub repaid_amount_cents: i64,
    pub distributed_yield_cents: i64,
    pub settled_at: Option<DateTime<Utc>>,
    pub defaulted_at: Option<DateTime<Utc>>,
    pub last_applied_event: Option<EventPosition>,
    pub last_lifecycle_event: Option<EventPosition>,
    pub last_ownership_event: Option<EventPosition>,
    pub updated_at: DateTime<Utc>,
}

impl InvoiceLifecycleRecord {
    /// A fresh record awaiting its mint.
    pub fn draft(invoice_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            invoice_id: invoice_id.into(),
            contract_address: None,
            token_id: None,
            status: LifecycleStatus::Draft,
            owner_address: None,
            minted_at: None,
            mint_tx_hash: None,
            funding_target_cents: 0,
            funded_amount_cents: 0,
            expected_repayment_cents: 0,
            repaid_amount_cents: 0,
            distributed_yield_cents: 0,
            settled_at: None,
            defaulted_at: None,
            last_applied_event: None,
            last_lifecycle_event: None,
            last_ownership_event: None,
            updated_at: now,
        }
    }
}

/// Which ordering guard an event is subject to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationClass {
    /// Owner changes; must be newer than the last ownership event.
    Ownership,
    /// Status milestones; must be newer than the last lifecycle event.
    Lifecycle,
    /// Commutative sums, guarded only by the applied-event ledger.
    Accumulating,
}

impl MutationClass {
    pub fn of(event: EventName) -> Option<Self> {
        match event {
            EventName::Transferred => Some(Self::Ownership),
            EventName::Minted | EventName::Settled | EventName::Defaulted => Some(Self::Lifecycle),
            EventName::Funded | EventName::RepaymentDeposited => Some(Self::Accumulating),
            EventName::Unknown => None,
        }
    }
}

/// Why an event was not applied. Rejections are final outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("{event} is not a legal transition from {from}")]
    IllegalTransition {
        event: EventName,
        from: LifecycleStatus,
    },
    #[error("record is in terminal state {0}")]
    Terminal(LifecycleStatus),
    #[error("{event} at {position} is not newer than {last}")]
    Stale {
        event: EventName,
        position: EventPosition,
        last: EventPosition,
    },
    #[error("funding target is unknown")]
    MissingFundingTarget,
    #[error("decoded fields do not belong to {0}")]
    FieldMismatch(EventName),
    #[error("event for token {actual} applied to record of token {expected}")]
    TokenMismatch { expected: String, actual: String },
    #[error("event from contract {actual} applied to record of contract {expected}")]
    ContractMismatch { expected: String, actual: String },
}

/// Kind of row written to the invoice transaction table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Funding,
    Repayment,
    Settlement,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Funding => "FUNDING",
            Self::Repayment => "REPAYMENT",
            Self::Settlement => "SETTLEMENT",
        }
    }
}

/// Writes to collaborator tables that accompany an applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    Ownership {
        token_id: String,
        contract_address: String,
        owner_address: String,
        position: EventPosition,
    },
    Transaction {
        kind: TransactionKind,
        amount_cents: i64,
        counterparty: Option<String>,
    },
}

/// Result of a legal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub record: InvoiceLifecycleRecord,
    pub from: LifecycleStatus,
    pub to: LifecycleStatus,
    pub side_effects: Vec<SideEffect>,
}

/// Validates `event` against `current` and returns the next state.
pub fn apply(
    current: &InvoiceLifecycleRecord,
    event: &CanonicalEvent,
    now: DateTime<Utc>,
) -> Result<Transition, RejectReason> {
    let class = MutationClass::of(event.event_name)
        .ok_or(RejectReason::FieldMismatch(event.event_name))?;

    if current.status.is_terminal() {
        return Err(RejectReason::Terminal(current.status));
    }

    if let Some(expected) = current.contract_address.as_deref() {
        if !expected.eq_ignore_ascii_case(&event.contract_address) {
            return Err(RejectReason::ContractMismatch {
                expected: expected.to_string(),
                actual: event.contract_address.clone(),
            });
        }
    }

    if let (Some(expected), Some(actual)) = (current.token_id.as_deref(), event.token_id()) {
        if expected != actual {
            return Err(RejectReason::TokenMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }

    let position = event.position();
    let guard = match class {
        MutationClass::Ownership => current.last_ownership_event,
        MutationClass::Lifecycle => current.last_lifecycle_event,
        MutationClass::Accumulating => None,
    };
    if let Some(last) = guard {
        if position <= last {
            return Err(RejectReason::Stale {
                event: event.event_name,
                position,
                last,
            });
        }
    }

    let mut next = current.clone();
    let mut side_effects = Vec::new();
    let illegal = || RejectReason::IllegalTransition {
        event: event.event_name,
        from: current.status,
    };

    match (event.event_name, &event.decoded_fields) {
        (EventName::Minted, DecodedFields::Transfer { to, token_id, .. }) => {
            if current.status != LifecycleStatus::Draft {
                return Err(illegal());
            }
            next.status = LifecycleStatus::Listed;
            next.contract_address = Some(event.contract_address.to_ascii_lowercase());
            next.token_id = Some(token_id.clone());
            next.owner_address = Some(to.clone());
            next.minted_at = Some(event.block_timestamp);
            next.mint_tx_hash = Some(event.transaction_hash.clone());
            next.last_ownership_event = Some(position);
            side_effects.push(ownership(event, token_id, to));
        }
        (EventName::Transferred, DecodedFields::Transfer { to, token_id, .. }) => {
            next.owner_address = Some(to.clone());
            side_effects.push(ownership(event, token_id, to));
        }
        (
            EventName::Funded,
            DecodedFields::Funded {
                investor,
                amount_cents,
                funding_target_cents,
                ..
            },
        ) => {
            if !current.status.accepts_funding() {
                return Err(illegal());
            }
            let target = if current.funding_target_cents > 0 {
                current.funding_target_cents
            } else {
                *funding_target_cents
            };
            if target <= 0 {
                return Err(RejectReason::MissingFundingTarget);
            }
            next.funding_target_cents = target;
            let funded = current.funded_amount_cents.saturating_add(*amount_cents);
            if funded >= target {
                next.funded_amount_cents = target;
                next.status = LifecycleStatus::FullyFunded;
                if next.expected_repayment_cents == 0 {
                    next.expected_repayment_cents = target;
                }
            } else {
                next.funded_amount_cents = funded;
                next.status = LifecycleStatus::PartiallyFunded;
            }
            side_effects.push(SideEffect::Transaction {
                kind: TransactionKind::Funding,
                amount_cents: *amount_cents,
                counterparty: Some(investor.clone()),
            });
        }
        (
            EventName::RepaymentDeposited,
            DecodedFields::RepaymentDeposited {
                payer, amount_cents, ..
            },
        ) => {
            if !current.status.accepts_repayment() {
                return Err(illegal());
            }
            next.repaid_amount_cents = current.repaid_amount_cents.saturating_add(*amount_cents);
            next.status = if next.expected_repayment_cents > 0
                && next.repaid_amount_cents >= next.expected_repayment_cents
            {
                LifecycleStatus::FullyRepaid
            } else {
                LifecycleStatus::PartiallyRepaid
            };
            side_effects.push(SideEffect::Transaction {
                kind: TransactionKind::Repayment,
                amount_cents: *amount_cents,
                counterparty: Some(payer.clone()),
            });
        }
        (
            EventName::Settled,
            DecodedFields::Settled {
                total_repaid_cents,
                yield_cents,
                ..
            },
        ) => {
            if current.status != LifecycleStatus::FullyRepaid {
                return Err(illegal());
            }
            next.status = LifecycleStatus::Settled;
            next.settled_at = Some(event.block_timestamp);
            next.distributed_yield_cents = *yield_cents;
            next.repaid_amount_cents = next.repaid_amount_cents.max(*total_repaid_cents);
            side_effects.push(SideEffect::Transaction {
                kind: TransactionKind::Settlement,
                amount_cents: *yield_cents,
                counterparty: None,
            });
        }
        (EventName::Defaulted, DecodedFields::Defaulted { .. }) => {
            if !current.status.accepts_default() {
                return Err(illegal());
            }
            next.status = LifecycleStatus::Defaulted;
            next.defaulted_at = Some(event.block_timestamp);
        }
        (name, _) => return Err(RejectReason::FieldMismatch(name)),
    }

    match class {
        MutationClass::Ownership => next.last_ownership_event = Some(position),
        MutationClass::Lifecycle => next.last_lifecycle_event = Some(position),
        MutationClass::Accumulating => {}
    }
    next.last_applied_event = Some(match current.last_applied_event {
        Some(last) if last > position => last,
        _ => position,
    });
    next.updated_at = now;

    Ok(Transition {
        from: current.status,
        to: next.status,
        record: next,
        side_effects,
    })
}

fn ownership(event: &CanonicalEvent, token_id: &str, owner: &str) -> SideEffect {
    SideEffect::Ownership {
        token_id: token_id.to_string(),
        contract_address: event.contract_address.clone(),
        owner_address: owner.to_string(),
        position: event.position(),
    }
}
