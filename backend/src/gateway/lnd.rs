use std::time::Duration;

use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine as _,
};
use futures::stream::{self, Stream, StreamExt};
use reqwest::{Certificate, Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use super::{
    new_preimage, DecodedPayReq, HoldInvoice, Invoice, InvoiceState, InvoiceStream,
    InvoiceUpdate, PaymentGateway, SendResponse,
};
use crate::error::{AppError, AppResult, GatewayError};
use crate::ledger::models::Preimage;

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

/// LND over its REST proxy
///
/// Unary calls carry a per-request timeout; subscriptions don't, they run
/// until the node closes them or the caller drops the stream.
pub struct LndGateway {
    base_url: String,
    macaroon: Option<String>,
    rpc_timeout: Duration,
    client: Client,
}

impl LndGateway {
    pub fn new(
        base_url: &str,
        tls_cert_path: Option<&str>,
        macaroon_path: Option<&str>,
        rpc_timeout: Duration,
    ) -> AppResult<Self> {
        let mut builder = Client::builder();

        if let Some(path) = tls_cert_path {
            let pem = std::fs::read(path)
                .map_err(|e| AppError::Config(format!("cannot read LND cert {}: {}", path, e)))?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| AppError::Config(format!("invalid LND cert {}: {}", path, e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let macaroon = match macaroon_path {
            Some(path) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    AppError::Config(format!("cannot read macaroon {}: {}", path, e))
                })?;
                Some(hex::encode(bytes))
            }
            None => None,
        };

        let client = builder
            .build()
            .map_err(|e| AppError::Config(format!("cannot build LND client: {}", e)))?;

        info!("LND gateway configured for {}", base_url);

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            macaroon,
            rpc_timeout,
            client,
        })
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.macaroon {
            Some(macaroon) => builder.header(MACAROON_HEADER, macaroon),
            None => builder,
        }
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> AppResult<R> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .request(self.client.get(&url))
            .timeout(self.rpc_timeout)
            .send()
            .await?;
        parse_response(response).await
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> AppResult<R> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .request(self.client.post(&url))
            .timeout(self.rpc_timeout)
            .json(body)
            .send()
            .await?;
        parse_response(response).await
    }

    async fn subscribe(&self, path: &str) -> AppResult<InvoiceStream> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.request(self.client.get(&url)).send().await?;
        let response = check_status(response).await?;
        Ok(invoice_stream(response.bytes_stream().boxed()))
    }
}

async fn check_status(response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<RpcError>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    Err(GatewayError::Rpc {
        status: status.as_u16(),
        message,
    }
    .into())
}

async fn parse_response<R: DeserializeOwned>(response: Response) -> AppResult<R> {
    let response = check_status(response).await?;
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| GatewayError::Decode(e.to_string()).into())
}

// ========== WIRE TYPES ==========

/// int64 fields arrive as JSON strings
fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(i64),
        Str(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) if s.is_empty() => Ok(0),
        Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn open_state() -> InvoiceState {
    InvoiceState::Open
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct AddInvoiceRequest<'a> {
    value: String,
    expiry: String,
    memo: &'a str,
}

#[derive(Debug, Deserialize)]
struct AddInvoiceResponse {
    r_hash: String,
    payment_request: String,
}

#[derive(Debug, Serialize)]
struct AddHoldInvoiceRequest<'a> {
    hash: String,
    value: String,
    expiry: String,
    memo: &'a str,
}

#[derive(Debug, Deserialize)]
struct AddHoldInvoiceResponse {
    payment_request: String,
}

#[derive(Debug, Serialize)]
struct CancelInvoiceRequest {
    payment_hash: String,
}

#[derive(Debug, Serialize)]
struct SettleInvoiceRequest {
    preimage: String,
}

#[derive(Debug, Deserialize)]
struct LndInvoice {
    #[serde(default)]
    r_hash: String,
    #[serde(default = "open_state")]
    state: InvoiceState,
    #[serde(default, deserialize_with = "de_i64")]
    amt_paid_sat: i64,
    #[serde(default, deserialize_with = "de_i64")]
    settle_index: i64,
}

impl LndInvoice {
    fn into_update(self) -> AppResult<InvoiceUpdate> {
        Ok(InvoiceUpdate {
            payment_hash: base64_to_hex(&self.r_hash)?,
            state: self.state,
            amount_paid_sat: self.amt_paid_sat,
            settle_index: self.settle_index,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    result: Option<LndInvoice>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct LndPayReq {
    #[serde(default)]
    destination: String,
    #[serde(default)]
    payment_hash: String,
    #[serde(default, deserialize_with = "de_i64")]
    num_satoshis: i64,
    #[serde(default, deserialize_with = "de_i64")]
    timestamp: i64,
    #[serde(default, deserialize_with = "de_i64")]
    expiry: i64,
}

#[derive(Debug, Serialize)]
struct SendPaymentRequest<'a> {
    payment_request: &'a str,
    amt: String,
}

#[derive(Debug, Deserialize)]
struct SendPaymentResponse {
    #[serde(default)]
    payment_error: String,
}

fn base64_to_hex(encoded: &str) -> AppResult<String> {
    let bytes = STANDARD
        .decode(encoded)
        .or_else(|_| URL_SAFE.decode(encoded))
        .map_err(|e| GatewayError::Decode(format!("payment hash {}: {}", encoded, e)))?;
    Ok(hex::encode(bytes))
}

fn hex_to_bytes(payment_hash: &str) -> AppResult<Vec<u8>> {
    hex::decode(payment_hash).map_err(|e| {
        AppError::Internal(format!("payment hash {} is not hex: {}", payment_hash, e))
    })
}

// ========== STREAMS ==========

struct LineReader<S> {
    body: S,
    buf: Vec<u8>,
    done: bool,
}

fn parse_stream_line(line: &[u8]) -> AppResult<InvoiceUpdate> {
    let parsed: StreamLine =
        serde_json::from_slice(line).map_err(|e| GatewayError::Decode(e.to_string()))?;

    match (parsed.result, parsed.error) {
        (Some(invoice), _) => invoice.into_update(),
        (None, Some(error)) => Err(GatewayError::Rpc {
            status: 500,
            message: error.message,
        }
        .into()),
        (None, None) => Err(GatewayError::Decode("empty stream message".to_string()).into()),
    }
}

/// Newline-delimited JSON body to invoice updates. A decode or node error
/// ends the stream after it is yielded.
fn invoice_stream<S, B, E>(body: S) -> InvoiceStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<AppError> + Send + 'static,
{
    let reader = LineReader {
        body,
        buf: Vec::new(),
        done: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if reader.done {
                return None;
            }

            if let Some(pos) = reader.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.buf.drain(..=pos).collect();
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                let item = parse_stream_line(line);
                reader.done = item.is_err();
                return Some((item, reader));
            }

            match reader.body.next().await {
                Some(Ok(chunk)) => reader.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    reader.done = true;
                    return Some((Err(e.into()), reader));
                }
                None => {
                    reader.done = true;
                    let rest = std::mem::take(&mut reader.buf);
                    let rest = rest.trim_ascii();
                    if rest.is_empty() {
                        return None;
                    }
                    return Some((parse_stream_line(rest), reader));
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl PaymentGateway for LndGateway {
    async fn add_invoice(&self, amount: i64, expiry_seconds: i64, memo: &str) -> AppResult<Invoice> {
        let response: AddInvoiceResponse = self
            .post(
                "/v1/invoices",
                &AddInvoiceRequest {
                    value: amount.to_string(),
                    expiry: expiry_seconds.to_string(),
                    memo,
                },
            )
            .await?;

        Ok(Invoice {
            payment_hash: base64_to_hex(&response.r_hash)?,
            pay_req: response.payment_request,
        })
    }

    async fn add_hold_invoice(
        &self,
        amount: i64,
        expiry_seconds: i64,
        memo: &str,
    ) -> AppResult<HoldInvoice> {
        let (preimage, payment_hash) = new_preimage();

        let response: AddHoldInvoiceResponse = self
            .post(
                "/v2/invoices/hodl",
                &AddHoldInvoiceRequest {
                    hash: STANDARD.encode(hex_to_bytes(&payment_hash)?),
                    value: amount.to_string(),
                    expiry: expiry_seconds.to_string(),
                    memo,
                },
            )
            .await?;

        debug!("Hold invoice added: {}", payment_hash);

        Ok(HoldInvoice {
            preimage,
            payment_hash,
            pay_req: response.payment_request,
        })
    }

    async fn cancel_hold_invoice(&self, payment_hash: &str) -> AppResult<()> {
        let _: serde_json::Value = self
            .post(
                "/v2/invoices/cancel",
                &CancelInvoiceRequest {
                    payment_hash: STANDARD.encode(hex_to_bytes(payment_hash)?),
                },
            )
            .await?;
        Ok(())
    }

    async fn settle_hold_invoice(&self, preimage: &Preimage) -> AppResult<()> {
        let _: serde_json::Value = self
            .post(
                "/v2/invoices/settle",
                &SettleInvoiceRequest {
                    preimage: STANDARD.encode(preimage.as_bytes()),
                },
            )
            .await?;
        Ok(())
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> AppResult<InvoiceUpdate> {
        let invoice: LndInvoice = self.get(&format!("/v1/invoice/{}", payment_hash)).await?;
        let mut update = invoice.into_update()?;
        if update.payment_hash.is_empty() {
            update.payment_hash = payment_hash.to_string();
        }
        Ok(update)
    }

    async fn subscribe_invoice(&self, payment_hash: &str) -> AppResult<InvoiceStream> {
        let hash = URL_SAFE.encode(hex_to_bytes(payment_hash)?);
        self.subscribe(&format!("/v2/invoices/subscribe/{}", hash)).await
    }

    async fn subscribe_invoices(&self, settle_index: i64) -> AppResult<InvoiceStream> {
        info!("Subscribing to settled invoices after index {}", settle_index);
        self.subscribe(&format!("/v1/invoices/subscribe?settle_index={}", settle_index))
            .await
    }

    async fn decode_payment_request(&self, pay_req: &str) -> AppResult<DecodedPayReq> {
        let decoded: LndPayReq = self.get(&format!("/v1/payreq/{}", pay_req)).await?;
        Ok(DecodedPayReq {
            destination: decoded.destination,
            payment_hash: decoded.payment_hash,
            num_satoshis: decoded.num_satoshis,
            timestamp: decoded.timestamp,
            expiry: decoded.expiry,
        })
    }

    async fn send_payment(&self, pay_req: &str, amount: i64) -> AppResult<SendResponse> {
        let response: SendPaymentResponse = self
            .post(
                "/v1/channels/transactions",
                &SendPaymentRequest {
                    payment_request: pay_req,
                    amt: amount.to_string(),
                },
            )
            .await?;

        Ok(SendResponse {
            payment_error: response.payment_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, AppError>> + Send + Unpin {
        let owned: Vec<Result<Vec<u8>, AppError>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(owned)
    }

    // sha256 of 32 zero bytes
    const HASH_HEX: &str = "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925";

    fn hash_b64() -> String {
        STANDARD.encode(hex::decode(HASH_HEX).unwrap())
    }

    #[test]
    fn test_invoice_with_string_integers() {
        let body = format!(
            r#"{{"r_hash":"{}","state":"SETTLED","amt_paid_sat":"10","settle_index":"42"}}"#,
            hash_b64()
        );
        let invoice: LndInvoice = serde_json::from_str(&body).unwrap();
        let update = invoice.into_update().unwrap();
        assert_eq!(update.payment_hash, HASH_HEX);
        assert_eq!(update.state, InvoiceState::Settled);
        assert_eq!(update.amount_paid_sat, 10);
        assert_eq!(update.settle_index(), Some(42));
    }

    #[test]
    fn test_missing_fields_default() {
        let invoice: LndInvoice = serde_json::from_str(r#"{"r_hash":""}"#).unwrap();
        assert_eq!(invoice.state, InvoiceState::Open);
        assert_eq!(invoice.settle_index, 0);
    }

    #[tokio::test]
    async fn test_stream_splits_lines_across_chunks() {
        let line = format!(
            r#"{{"result":{{"r_hash":"{}","state":"ACCEPTED","amt_paid_sat":"10"}}}}"#,
            hash_b64()
        );
        let (a, b) = line.split_at(20);
        let body = chunks(&[a, b, "\n\n", &line, "\n"]);

        let updates: Vec<_> = invoice_stream(body).collect().await;
        assert_eq!(updates.len(), 2);
        for update in updates {
            let update = update.unwrap();
            assert_eq!(update.state, InvoiceState::Accepted);
            assert_eq!(update.settle_index(), None);
        }
    }

    #[tokio::test]
    async fn test_stream_error_line_ends_stream() {
        let body = chunks(&[
            "{\"error\":{\"code\":2,\"message\":\"invoice not found\"}}\n",
            "{\"result\":{}}\n",
        ]);

        let updates: Vec<_> = invoice_stream(body).collect().await;
        assert_eq!(updates.len(), 1);
        match &updates[0] {
            Err(AppError::Gateway(GatewayError::Rpc { message, .. })) => {
                assert_eq!(message, "invoice not found")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_trailing_line_without_newline() {
        let line = format!(r#"{{"result":{{"r_hash":"{}","state":"OPEN"}}}}"#, hash_b64());
        let updates: Vec<_> = invoice_stream(chunks(&[&line])).collect().await;
        assert_eq!(updates.len(), 1);
        assert!(updates[0].is_ok());
    }

    #[test]
    fn test_pay_req_decoding() {
        let decoded: LndPayReq = serde_json::from_str(
            r#"{"destination":"02ab","payment_hash":"ff","num_satoshis":"0","timestamp":"1700000000","expiry":"86400"}"#,
        )
        .unwrap();
        assert_eq!(decoded.num_satoshis, 0);
        assert_eq!(decoded.expiry, 86400);
    }
}
