use std::future::Future;

use tracing::warn;

use invoice_sync_core::{CanonicalEvent, EventName};

use crate::sync::{Resolve, SyncError, SyncOutcome, Synchronizer};

/// One handler per canonical event name.
pub trait LifecycleHandler: Send + Sync + 'static {
    fn on_minted(
        &self,
        event: &CanonicalEvent,
    ) -> impl Future<Output = Result<SyncOutcome, SyncError>> + Send;

    fn on_funded(
        &self,
        event: &CanonicalEvent,
    ) -> impl Future<Output = Result<SyncOutcome, SyncError>> + Send;

    fn on_repayment_deposited(
        &self,
        event: &CanonicalEvent,
    ) -> impl Future<Output = Result<SyncOutcome, SyncError>> + Send;

    fn on_settled(
        &self,
        event: &CanonicalEvent,
    ) -> impl Future<Output = Result<SyncOutcome, SyncError>> + Send;

    fn on_defaulted(
        &self,
        event: &CanonicalEvent,
    ) -> impl Future<Output = Result<SyncOutcome, SyncError>> + Send;

    fn on_transferred(
        &self,
        event: &CanonicalEvent,
    ) -> impl Future<Output = Result<SyncOutcome, SyncError>> + Send;

    /// Records an unrecognised log so redelivery stays a no-op.
    fn on_unknown(
        &self,
        event: &CanonicalEvent,
    ) -> impl Future<Output = Result<SyncOutcome, SyncError>> + Send;
}

/// The transition itself is decided by the lifecycle state machine; each
/// handler chooses how its event finds the record to transition.
impl LifecycleHandler for Synchronizer {
    /// Mints attach to a pre-created draft or open a new record.
    async fn on_minted(&self, event: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
        self.apply_with(event, Resolve::MintTransaction).await
    }

    async fn on_funded(&self, event: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
        self.apply_with(event, Resolve::Token).await
    }

    async fn on_repayment_deposited(
        &self,
        event: &CanonicalEvent,
    ) -> Result<SyncOutcome, SyncError> {
        self.apply_with(event, Resolve::Token).await
    }

    async fn on_settled(&self, event: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
        self.apply_with(event, Resolve::Token).await
    }

    async fn on_defaulted(&self, event: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
        self.apply_with(event, Resolve::Token).await
    }

    async fn on_transferred(&self, event: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
        self.apply_with(event, Resolve::Token).await
    }

    async fn on_unknown(&self, event: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
        self.apply_with(event, Resolve::LedgerOnly).await
    }
}

/// Dispatches canonical events to their lifecycle handler.
pub struct EventRouter<H> {
    handler: H,
}

impl<H: LifecycleHandler> EventRouter<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    #[cfg(test)]
    pub(crate) fn handler(&self) -> &H {
        &self.handler
    }

    pub async fn route(&self, event: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
        match event.event_name {
            EventName::Minted => self.handler.on_minted(event).await,
            EventName::Funded => self.handler.on_funded(event).await,
            EventName::RepaymentDeposited => self.handler.on_repayment_deposited(event).await,
            EventName::Settled => self.handler.on_settled(event).await,
            EventName::Defaulted => self.handler.on_defaulted(event).await,
            EventName::Transferred => self.handler.on_transferred(event).await,
            EventName::Unknown => {
                warn!(
                    stage = "router",
                    tx_hash = %event.transaction_hash,
                    log_index = event.log_index,
                    provider = %event.provider,
                    contract = %event.contract_address,
                    "unknown event signature ignored"
                );
                self.handler.on_unknown(event).await
            }
        }
    }
}
