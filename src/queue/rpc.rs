//! NEAR JSON-RPC queue client.
//!
//! Reads go through the `query`/`call_function` view path and need no key.
//! Writes build, sign and broadcast a `submit_result` function call.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::QueueClient;
use super::signer::Signer;
use super::transaction::{Action, FunctionCall, PublicKey, Transaction};
use crate::config::LedgerConfig;
use crate::error::QueueError;
use crate::task::{Submission, Task};

const VIEW_METHOD: &str = "get_tasks_from_queue";
const SUBMIT_METHOD: &str = "submit_result";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// `broadcast_tx_commit` waits for finality, which can take a while.
const COMMIT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Deserialize)]
struct CallFunctionResult {
    #[serde(default)]
    result: Option<Vec<u8>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    logs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AccessKeyView {
    nonce: u64,
    block_hash: String,
}

/// Queue client backed by the task contract on a NEAR network.
pub struct NearQueueClient {
    node_url: String,
    contract_id: String,
    gas: u64,
    attached_deposit: u128,
    signer: Option<Signer>,
    client: reqwest::Client,
}

impl NearQueueClient {
    /// Create a client. Without a signer the client is read-only and
    /// `submit_confirmation` fails.
    pub fn new(config: &LedgerConfig, signer: Option<Signer>) -> Self {
        Self::with_client(config, signer, reqwest::Client::new())
    }

    pub fn with_client(config: &LedgerConfig, signer: Option<Signer>, client: reqwest::Client) -> Self {
        Self {
            node_url: config.node_url.clone(),
            contract_id: config.contract_id.clone(),
            gas: config.gas,
            attached_deposit: config.attached_deposit,
            signer,
            client,
        }
    }

    pub fn contract_id(&self) -> &str {
        &self.contract_id
    }

    /// Issue one JSON-RPC call and return its `result`, or the error text.
    async fn rpc(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, String> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "obrigado-worker",
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.node_url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("{method} request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!("{method} returned HTTP {status}: {}", text.trim()));
        }

        let mut envelope: Value = response
            .json()
            .await
            .map_err(|e| format!("{method} returned invalid JSON: {e}"))?;

        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            return Err(describe_rpc_error(error));
        }
        match envelope.get_mut("result") {
            Some(result) => Ok(result.take()),
            None => Err(format!("{method} response has no result")),
        }
    }

    async fn access_key(&self, signer: &Signer) -> Result<AccessKeyView, String> {
        let result = self
            .rpc(
                "query",
                json!({
                    "request_type": "view_access_key",
                    "finality": "final",
                    "account_id": signer.account_id(),
                    "public_key": signer.public_key(),
                }),
                REQUEST_TIMEOUT,
            )
            .await?;
        if let Some(error) = result.get("error").and_then(Value::as_str) {
            return Err(format!("access key lookup failed: {error}"));
        }
        serde_json::from_value(result).map_err(|e| format!("malformed access key view: {e}"))
    }
}

/// Flatten a JSON-RPC error object into one line.
fn describe_rpc_error(error: &Value) -> String {
    let name = error.get("name").and_then(Value::as_str);
    let cause = error
        .pointer("/cause/name")
        .and_then(Value::as_str);
    let detail = error
        .get("data")
        .map(|d| d.as_str().map(str::to_string).unwrap_or_else(|| d.to_string()))
        .or_else(|| error.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| error.to_string());

    match (name, cause) {
        (Some(name), Some(cause)) => format!("{name}/{cause}: {detail}"),
        (Some(name), None) => format!("{name}: {detail}"),
        _ => detail,
    }
}

fn decode_block_hash(encoded: &str) -> Result<[u8; 32], String> {
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| format!("invalid block hash: {e}"))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("block hash has {} bytes, expected 32", bytes.len()))
}

#[async_trait]
impl QueueClient for NearQueueClient {
    async fn list_pending(&self) -> Result<Vec<Task>, QueueError> {
        let result = self
            .rpc(
                "query",
                json!({
                    "request_type": "call_function",
                    "finality": "final",
                    "account_id": self.contract_id,
                    "method_name": VIEW_METHOD,
                    "args_base64": BASE64.encode(b"{}"),
                }),
                REQUEST_TIMEOUT,
            )
            .await
            .map_err(QueueError::Read)?;

        let call: CallFunctionResult = serde_json::from_value(result)
            .map_err(|e| QueueError::Read(format!("malformed view result: {e}")))?;
        for line in &call.logs {
            debug!(contract = %self.contract_id, log = %line, "Contract log");
        }
        if let Some(error) = call.error {
            return Err(QueueError::Read(format!("{VIEW_METHOD} failed: {error}")));
        }

        let bytes = call
            .result
            .ok_or_else(|| QueueError::Read(format!("{VIEW_METHOD} returned no value")))?;
        let tasks: Vec<Task> = serde_json::from_slice(&bytes)
            .map_err(|e| QueueError::Read(format!("unexpected task list shape: {e}")))?;

        debug!(count = tasks.len(), "Fetched task queue snapshot");
        Ok(tasks)
    }

    async fn submit_confirmation(&self, submission: &Submission) -> Result<(), QueueError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| QueueError::Write("no signing key configured".to_string()))?;

        let key = self.access_key(signer).await.map_err(QueueError::Write)?;
        let block_hash = decode_block_hash(&key.block_hash).map_err(QueueError::Write)?;

        let args = serde_json::to_vec(&json!({
            "task_id": submission.task_id,
            "result_hash": submission.result_hash,
            "result_url": submission.result_url,
        }))
        .map_err(|e| QueueError::Write(e.to_string()))?;

        let signed = Transaction {
            signer_id: signer.account_id().to_string(),
            public_key: PublicKey::Ed25519(signer.public_key_bytes()),
            nonce: key.nonce + 1,
            receiver_id: self.contract_id.clone(),
            block_hash,
            actions: vec![Action::FunctionCall(FunctionCall {
                method_name: SUBMIT_METHOD.to_string(),
                args,
                gas: self.gas,
                deposit: self.attached_deposit,
            })],
        }
        .sign(signer)
        .map_err(|e| QueueError::Write(format!("failed to encode transaction: {e}")))?;
        let encoded = signed
            .to_borsh()
            .map_err(|e| QueueError::Write(format!("failed to encode transaction: {e}")))?;
        let tx_hash = signed.id();

        debug!(task_id = %submission.task_id, tx_hash = %tx_hash, nonce = key.nonce + 1, "Broadcasting submit_result");

        let outcome = self
            .rpc(
                "broadcast_tx_commit",
                json!([BASE64.encode(encoded)]),
                COMMIT_TIMEOUT,
            )
            .await
            .map_err(QueueError::Write)?;

        let status = outcome.get("status").cloned().unwrap_or(Value::Null);
        if let Some(failure) = status.get("Failure") {
            warn!(task_id = %submission.task_id, tx_hash = %tx_hash, "submit_result transaction failed");
            return Err(QueueError::Write(format!(
                "transaction {tx_hash} failed: {failure}"
            )));
        }

        let returned = status
            .get("SuccessValue")
            .and_then(Value::as_str)
            .and_then(|v| BASE64.decode(v).ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        if returned.is_none() {
            return Err(QueueError::Write(format!(
                "transaction {tx_hash} has unexpected status: {status}"
            )));
        }

        info!(
            task_id = %submission.task_id,
            tx_hash = %tx_hash,
            returned = returned.as_deref().unwrap_or_default(),
            "Confirmation recorded on ledger"
        );
        Ok(())
    }
}
