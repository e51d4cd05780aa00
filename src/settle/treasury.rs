//! Treasury Provider Seam
//!
//! The external payout boundary. The provider is assumed at-least-once:
//! callers must stay idempotent against repeated acknowledgements, and a
//! row is only marked paid once a settlement reference came back.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

/// Payout provider errors.
#[derive(Debug, Clone, Error)]
pub enum TreasuryError {
    /// Provider unreachable or timed out; retryable.
    #[error("payout provider unavailable: {0}")]
    Unavailable(String),

    /// Provider rejected the transfer.
    #[error("payout rejected: {0}")]
    Rejected(String),
}

/// External payout provider.
pub trait Treasury: Send + Sync + 'static {
    /// Transfer `amount_micros` to `wallet`. Returns the provider's
    /// settlement reference on success.
    fn send_payout(
        &self,
        wallet: &str,
        amount_micros: u64,
    ) -> impl Future<Output = Result<String, TreasuryError>> + Send;
}

impl<T: Treasury> Treasury for Arc<T> {
    fn send_payout(
        &self,
        wallet: &str,
        amount_micros: u64,
    ) -> impl Future<Output = Result<String, TreasuryError>> + Send {
        self.as_ref().send_payout(wallet, amount_micros)
    }
}

/// Development treasury: fabricates settlement references and logs the
/// transfer instead of moving value.
pub struct DevTreasury;

impl Treasury for DevTreasury {
    async fn send_payout(&self, wallet: &str, amount_micros: u64) -> Result<String, TreasuryError> {
        let reference = format!("dev-{}", uuid::Uuid::new_v4());
        info!("dev payout of {} micros to {} ({})", amount_micros, wallet, reference);
        Ok(reference)
    }
}
