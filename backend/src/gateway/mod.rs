// Payment node facade
pub mod lnd;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AppResult;
use crate::ledger::models::Preimage;

pub use lnd::LndGateway;

/// Invoice lifecycle as reported by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceState {
    Open,
    Settled,
    Canceled,
    Accepted,
}

impl InvoiceState {
    /// Funds reached the node: held (accepted) or already captured
    pub fn is_paid(&self) -> bool {
        matches!(self, InvoiceState::Accepted | InvoiceState::Settled)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, InvoiceState::Settled | InvoiceState::Canceled)
    }
}

/// Plain invoice, captured on payment
#[derive(Debug, Clone)]
pub struct Invoice {
    pub payment_hash: String,
    pub pay_req: String,
}

/// Hold invoice. The preimage stays with us until we settle.
#[derive(Debug, Clone)]
pub struct HoldInvoice {
    pub preimage: Preimage,
    pub payment_hash: String,
    pub pay_req: String,
}

/// Snapshot of one invoice, from a lookup or a subscription event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceUpdate {
    /// Hex encoded
    pub payment_hash: String,
    pub state: InvoiceState,
    pub amount_paid_sat: i64,
    /// 0 until the invoice is settled
    pub settle_index: i64,
}

impl InvoiceUpdate {
    pub fn settle_index(&self) -> Option<i64> {
        (self.settle_index > 0).then_some(self.settle_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayReq {
    pub destination: String,
    pub payment_hash: String,
    pub num_satoshis: i64,
    pub timestamp: i64,
    /// Seconds after `timestamp`
    pub expiry: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendResponse {
    /// Empty on success
    pub payment_error: String,
}

pub type InvoiceStream = BoxStream<'static, AppResult<InvoiceUpdate>>;

/// Payment node operations the lifecycle needs
///
/// Implementations report node-side rejections as `GatewayError::Rpc` and
/// connectivity problems as `GatewayError::Transport`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn add_invoice(&self, amount: i64, expiry_seconds: i64, memo: &str) -> AppResult<Invoice>;

    async fn add_hold_invoice(
        &self,
        amount: i64,
        expiry_seconds: i64,
        memo: &str,
    ) -> AppResult<HoldInvoice>;

    async fn cancel_hold_invoice(&self, payment_hash: &str) -> AppResult<()>;

    async fn settle_hold_invoice(&self, preimage: &Preimage) -> AppResult<()>;

    async fn lookup_invoice(&self, payment_hash: &str) -> AppResult<InvoiceUpdate>;

    /// Updates for a single invoice, starting with its current state
    async fn subscribe_invoice(&self, payment_hash: &str) -> AppResult<InvoiceStream>;

    /// Every invoice settled after `settle_index`, then live updates
    async fn subscribe_invoices(&self, settle_index: i64) -> AppResult<InvoiceStream>;

    async fn decode_payment_request(&self, pay_req: &str) -> AppResult<DecodedPayReq>;

    async fn send_payment(&self, pay_req: &str, amount: i64) -> AppResult<SendResponse>;
}

/// Fresh 32-byte preimage and its hex-encoded sha256 payment hash
pub fn new_preimage() -> (Preimage, String) {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let hash = payment_hash(&bytes);
    (Preimage::new(bytes.to_vec()), hash)
}

pub fn payment_hash(preimage: &[u8]) -> String {
    hex::encode(Sha256::digest(preimage))
}
