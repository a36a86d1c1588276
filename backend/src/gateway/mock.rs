use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    new_preimage, payment_hash, DecodedPayReq, HoldInvoice, Invoice, InvoiceState, InvoiceStream,
    InvoiceUpdate, PaymentGateway, SendResponse,
};
use crate::error::{AppResult, GatewayError};
use crate::ledger::models::Preimage;

type UpdateSender = UnboundedSender<AppResult<InvoiceUpdate>>;
type UpdateReceiver = UnboundedReceiver<AppResult<InvoiceUpdate>>;

#[derive(Default)]
struct Channel {
    sender: Option<UpdateSender>,
    receiver: Option<UpdateReceiver>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedInvoice {
    pub amount: i64,
    pub expiry_seconds: i64,
    pub memo: String,
    pub hold: bool,
}

/// Scripted gateway for tests. Records every call and answers from state
/// the test sets up.
pub struct MockGateway {
    invoices: Mutex<HashMap<String, InvoiceUpdate>>,
    added: Mutex<Vec<AddedInvoice>>,
    cancelled: Mutex<Vec<String>>,
    settled: Mutex<Vec<String>>,
    payments: Mutex<Vec<(String, i64)>>,
    single: Mutex<HashMap<String, Channel>>,
    global: Mutex<Option<UpdateSender>>,
    global_subscriptions: Mutex<Vec<i64>>,
    decoded: Mutex<Option<DecodedPayReq>>,
    payment_error: Mutex<String>,
    fail_cancel: Mutex<bool>,
    fail_settle: Mutex<bool>,
    fail_add: Mutex<bool>,
    fail_subscribe_invoices: Mutex<bool>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self {
            invoices: Mutex::default(),
            added: Mutex::default(),
            cancelled: Mutex::default(),
            settled: Mutex::default(),
            payments: Mutex::default(),
            single: Mutex::default(),
            global: Mutex::default(),
            global_subscriptions: Mutex::default(),
            decoded: Mutex::new(Some(DecodedPayReq {
                destination: "02mock".to_string(),
                payment_hash: "00".repeat(32),
                num_satoshis: 0,
                timestamp: chrono::Utc::now().timestamp(),
                expiry: 30 * 24 * 3600,
            })),
            payment_error: Mutex::default(),
            fail_cancel: Mutex::new(false),
            fail_settle: Mutex::new(false),
            fail_add: Mutex::new(false),
            fail_subscribe_invoices: Mutex::new(false),
        }
    }
}

fn rpc_failure(what: &str) -> crate::error::AppError {
    GatewayError::Rpc {
        status: 500,
        message: format!("{} failed", what),
    }
    .into()
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== SCRIPTING ==========

    pub fn set_invoice_state(&self, payment_hash: &str, state: InvoiceState, amount_paid_sat: i64) {
        let mut invoices = self.invoices.lock().unwrap();
        let entry = invoices
            .entry(payment_hash.to_string())
            .or_insert_with(|| open_invoice(payment_hash));
        entry.state = state;
        entry.amount_paid_sat = amount_paid_sat;
    }

    pub fn set_decoded(&self, decoded: Option<DecodedPayReq>) {
        *self.decoded.lock().unwrap() = decoded;
    }

    pub fn set_payment_error(&self, error: &str) {
        *self.payment_error.lock().unwrap() = error.to_string();
    }

    pub fn fail_cancel(&self, fail: bool) {
        *self.fail_cancel.lock().unwrap() = fail;
    }

    pub fn fail_settle(&self, fail: bool) {
        *self.fail_settle.lock().unwrap() = fail;
    }

    pub fn fail_add(&self, fail: bool) {
        *self.fail_add.lock().unwrap() = fail;
    }

    pub fn fail_subscribe_invoices(&self, fail: bool) {
        *self.fail_subscribe_invoices.lock().unwrap() = fail;
    }

    /// Queue an event on a single-invoice subscription, before or after it starts
    pub fn push_invoice_update(&self, update: InvoiceUpdate) -> bool {
        let mut single = self.single.lock().unwrap();
        let channel = single
            .entry(update.payment_hash.clone())
            .or_insert_with(new_channel);
        channel
            .sender
            .as_ref()
            .map(|s| s.send(Ok(update)).is_ok())
            .unwrap_or(false)
    }

    /// Close a single-invoice subscription
    pub fn close_invoice_stream(&self, payment_hash: &str) {
        if let Some(channel) = self.single.lock().unwrap().get_mut(payment_hash) {
            channel.sender = None;
        }
    }

    pub fn push_global(&self, item: AppResult<InvoiceUpdate>) -> bool {
        match self.global.lock().unwrap().as_ref() {
            Some(sender) => sender.send(item).is_ok(),
            None => false,
        }
    }

    /// End the current global stream without an error
    pub fn close_global(&self) {
        *self.global.lock().unwrap() = None;
    }

    pub async fn wait_for_global_subscriptions(&self, n: usize) -> Vec<i64> {
        for _ in 0..200 {
            let subscriptions = self.global_subscriptions.lock().unwrap().clone();
            if subscriptions.len() >= n {
                return subscriptions;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.global_subscriptions.lock().unwrap().clone()
    }

    // ========== RECORDED CALLS ==========

    pub fn added(&self) -> Vec<AddedInvoice> {
        self.added.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn settled(&self) -> Vec<String> {
        self.settled.lock().unwrap().clone()
    }

    pub fn payments(&self) -> Vec<(String, i64)> {
        self.payments.lock().unwrap().clone()
    }

    pub fn is_subscribed(&self, payment_hash: &str) -> bool {
        self.single
            .lock()
            .unwrap()
            .get(payment_hash)
            .map(|c| c.receiver.is_none())
            .unwrap_or(false)
    }

    fn record_added(&self, amount: i64, expiry_seconds: i64, memo: &str, hold: bool) {
        self.added.lock().unwrap().push(AddedInvoice {
            amount,
            expiry_seconds,
            memo: memo.to_string(),
            hold,
        });
    }
}

fn new_channel() -> Channel {
    let (sender, receiver) = unbounded_channel();
    Channel {
        sender: Some(sender),
        receiver: Some(receiver),
    }
}

fn open_invoice(payment_hash: &str) -> InvoiceUpdate {
    InvoiceUpdate {
        payment_hash: payment_hash.to_string(),
        state: InvoiceState::Open,
        amount_paid_sat: 0,
        settle_index: 0,
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn add_invoice(&self, amount: i64, expiry_seconds: i64, memo: &str) -> AppResult<Invoice> {
        if *self.fail_add.lock().unwrap() {
            return Err(rpc_failure("add invoice"));
        }
        let (_, hash) = new_preimage();
        self.record_added(amount, expiry_seconds, memo, false);
        self.invoices
            .lock()
            .unwrap()
            .insert(hash.clone(), open_invoice(&hash));
        Ok(Invoice {
            pay_req: format!("lnbcmock{}", &hash[..16]),
            payment_hash: hash,
        })
    }

    async fn add_hold_invoice(
        &self,
        amount: i64,
        expiry_seconds: i64,
        memo: &str,
    ) -> AppResult<HoldInvoice> {
        if *self.fail_add.lock().unwrap() {
            return Err(rpc_failure("add hold invoice"));
        }
        let (preimage, hash) = new_preimage();
        self.record_added(amount, expiry_seconds, memo, true);
        self.invoices
            .lock()
            .unwrap()
            .insert(hash.clone(), open_invoice(&hash));
        Ok(HoldInvoice {
            preimage,
            pay_req: format!("lnbcmock{}", &hash[..16]),
            payment_hash: hash,
        })
    }

    async fn cancel_hold_invoice(&self, payment_hash: &str) -> AppResult<()> {
        if *self.fail_cancel.lock().unwrap() {
            return Err(rpc_failure("cancel"));
        }
        self.cancelled.lock().unwrap().push(payment_hash.to_string());
        self.set_invoice_state(payment_hash, InvoiceState::Canceled, 0);
        Ok(())
    }

    async fn settle_hold_invoice(&self, preimage: &Preimage) -> AppResult<()> {
        if *self.fail_settle.lock().unwrap() {
            return Err(rpc_failure("settle"));
        }
        let hash = payment_hash(preimage.as_bytes());
        self.settled.lock().unwrap().push(hash.clone());

        let mut invoices = self.invoices.lock().unwrap();
        let entry = invoices
            .entry(hash.clone())
            .or_insert_with(|| open_invoice(&hash));
        entry.state = InvoiceState::Settled;
        Ok(())
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> AppResult<InvoiceUpdate> {
        self.invoices
            .lock()
            .unwrap()
            .get(payment_hash)
            .cloned()
            .ok_or_else(|| {
                GatewayError::Rpc {
                    status: 404,
                    message: "unable to locate invoice".to_string(),
                }
                .into()
            })
    }

    async fn subscribe_invoice(&self, payment_hash: &str) -> AppResult<InvoiceStream> {
        let mut single = self.single.lock().unwrap();
        let channel = single
            .entry(payment_hash.to_string())
            .or_insert_with(new_channel);
        let receiver = match channel.receiver.take() {
            Some(receiver) => receiver,
            None => {
                let (sender, receiver) = unbounded_channel();
                channel.sender = Some(sender);
                receiver
            }
        };
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn subscribe_invoices(&self, settle_index: i64) -> AppResult<InvoiceStream> {
        self.global_subscriptions.lock().unwrap().push(settle_index);
        if *self.fail_subscribe_invoices.lock().unwrap() {
            return Err(rpc_failure("subscribe invoices"));
        }
        let (sender, receiver) = unbounded_channel();
        *self.global.lock().unwrap() = Some(sender);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn decode_payment_request(&self, _pay_req: &str) -> AppResult<DecodedPayReq> {
        self.decoded.lock().unwrap().clone().ok_or_else(|| {
            GatewayError::Rpc {
                status: 400,
                message: "invalid payment request".to_string(),
            }
            .into()
        })
    }

    async fn send_payment(&self, pay_req: &str, amount: i64) -> AppResult<SendResponse> {
        self.payments
            .lock()
            .unwrap()
            .push((pay_req.to_string(), amount));
        Ok(SendResponse {
            payment_error: self.payment_error.lock().unwrap().clone(),
        })
    }
}
