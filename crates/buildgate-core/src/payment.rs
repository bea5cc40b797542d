use crate::error::CoreError;
use async_trait::async_trait;

/// External fund-transfer rail used to settle approved releases.
///
/// Implementations move `amount_cents` to `destination_account` and return the rail's
/// transfer id. The escrow machine bounds every call with a timeout. `description` names
/// the escrow transaction, so rails with idempotency keys can derive one from it.
#[async_trait]
pub trait PaymentRail: Send + Sync {
    fn rail(&self) -> &'static str;

    async fn transfer(
        &self,
        destination_account: &str,
        amount_cents: i64,
        description: &str,
    ) -> Result<String, CoreError>;
}
