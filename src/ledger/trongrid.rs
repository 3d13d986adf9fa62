//! TronGrid-compatible HTTP client
//!
//! Talks to the node's `/wallet/*` HTTP API with `visible: true`, so
//! addresses travel in base58 form. Token balances and transfers go through
//! the TRC20 `balanceOf` / `transfer` selectors.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    AccountInfo, AccountResource, GeneratedKeypair, LedgerClient, LedgerError, SignedTransfer,
    TransactionRelay, UnsignedTransfer,
};
use crate::custody::{address_to_hex, validate_address};
use crate::types::{Asset, FrozenStake};

/// Public endpoints
pub const MAINNET_URL: &str = "https://api.trongrid.io";
pub const SHASTA_URL: &str = "https://api.shasta.trongrid.io";
pub const NILE_URL: &str = "https://nile.trongrid.io";

/// Max TRX burned by a token transfer when energy runs short (sun)
const DEFAULT_FEE_LIMIT: u64 = 30_000_000;

/// TronGrid HTTP client
#[derive(Debug, Clone)]
pub struct TronGridClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    fee_limit: u64,
}

impl TronGridClient {
    /// Create a new client with custom URL
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            fee_limit: DEFAULT_FEE_LIMIT,
        }
    }

    /// Create a client for mainnet
    pub fn new_mainnet(api_key: Option<String>) -> Self {
        Self::new(MAINNET_URL, api_key)
    }

    /// Create a client for the Nile testnet
    pub fn new_nile() -> Self {
        Self::new(NILE_URL, None)
    }

    pub fn with_fee_limit(mut self, fee_limit: u64) -> Self {
        self.fee_limit = fee_limit;
        self
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, LedgerError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("TRON-PRO-API-KEY", key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Api(format!("{} {}: {}", path, status, text)));
        }

        let value: Value = resp.json().await?;
        if let Some(err) = value.get("Error").and_then(Value::as_str) {
            return Err(LedgerError::Api(err.to_string()));
        }
        Ok(value)
    }

    async fn trc20_balance(&self, address: &str, contract: &str) -> Result<u64, LedgerError> {
        let parameter = encode_address_param(address)?;
        let value = self
            .post(
                "/wallet/triggerconstantcontract",
                json!({
                    "owner_address": address,
                    "contract_address": contract,
                    "function_selector": "balanceOf(address)",
                    "parameter": parameter,
                    "visible": true,
                }),
            )
            .await?;

        let word = value
            .get("constant_result")
            .and_then(|r| r.get(0))
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::InvalidResponse("missing constant_result".to_string()))?;

        decode_uint_word(word)
    }
}

/// `getaccountresource` response; absent fields mean zero
#[derive(Debug, Default, Deserialize)]
struct AccountResourceResponse {
    #[serde(rename = "freeNetLimit", default)]
    free_net_limit: u64,
    #[serde(rename = "freeNetUsed", default)]
    free_net_used: u64,
    #[serde(rename = "NetLimit", default)]
    net_limit: u64,
    #[serde(rename = "NetUsed", default)]
    net_used: u64,
    #[serde(rename = "EnergyLimit", default)]
    energy_limit: u64,
    #[serde(rename = "EnergyUsed", default)]
    energy_used: u64,
}

#[derive(Debug, Default, Deserialize)]
struct FrozenV2Entry {
    #[serde(default)]
    amount: u64,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountResponse {
    #[serde(default)]
    balance: u64,
    #[serde(rename = "frozenV2", default)]
    frozen_v2: Vec<FrozenV2Entry>,
}

impl AccountResponse {
    fn frozen(&self) -> FrozenStake {
        let mut frozen = FrozenStake::default();
        for entry in &self.frozen_v2 {
            match entry.kind.as_deref() {
                None | Some("BANDWIDTH") => frozen.for_bandwidth += entry.amount,
                Some("ENERGY") => frozen.for_energy += entry.amount,
                _ => {}
            }
        }
        frozen
    }
}

/// ABI-encode an address as a 32-byte word
fn encode_address_param(address: &str) -> Result<String, LedgerError> {
    let hex = address_to_hex(address).map_err(|e| LedgerError::InvalidAddress(e.to_string()))?;
    // Drop the 0x41 prefix; the ABI word holds the 20-byte account id
    Ok(format!("{:0>64}", &hex[2..]))
}

/// ABI-encode `transfer(address,uint256)` arguments
fn encode_transfer_params(to: &str, amount: u64) -> Result<String, LedgerError> {
    Ok(format!("{}{:064x}", encode_address_param(to)?, amount))
}

/// Decode a hex uint256 word that must fit in u64
fn decode_uint_word(word: &str) -> Result<u64, LedgerError> {
    let trimmed = word.trim_start_matches('0');
    if trimmed.is_empty() {
        return Ok(0);
    }
    if trimmed.len() > 16 {
        return Err(LedgerError::InvalidResponse(format!(
            "balance word exceeds u64: {}",
            word
        )));
    }
    u64::from_str_radix(trimmed, 16)
        .map_err(|e| LedgerError::InvalidResponse(format!("bad uint word {}: {}", word, e)))
}

/// Pull the transaction object and id out of a create/trigger response
fn parse_unsigned(value: Value) -> Result<UnsignedTransfer, LedgerError> {
    // triggersmartcontract nests the transaction and reports a result flag
    let tx = match value.get("transaction").cloned() {
        Some(tx) => {
            let ok = value
                .get("result")
                .and_then(|r| r.get("result"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !ok {
                let message = value
                    .get("result")
                    .and_then(|r| r.get("message"))
                    .and_then(Value::as_str)
                    .map(decode_message)
                    .unwrap_or_else(|| "contract call rejected".to_string());
                return Err(LedgerError::Api(message));
            }
            tx
        }
        None => value,
    };

    let txid = tx
        .get("txID")
        .and_then(Value::as_str)
        .ok_or_else(|| LedgerError::InvalidResponse("transaction without txID".to_string()))?
        .to_string();

    if txid.len() != 64 || hex::decode(&txid).is_err() {
        return Err(LedgerError::InvalidResponse(format!("malformed txID {}", txid)));
    }

    Ok(UnsignedTransfer { txid, raw: tx })
}

/// Node error messages are often hex-encoded UTF-8
fn decode_message(message: &str) -> String {
    hex::decode(message)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| message.to_string())
}

#[async_trait]
impl LedgerClient for TronGridClient {
    async fn get_account_resource(&self, address: &str) -> Result<AccountResource, LedgerError> {
        let value = self
            .post(
                "/wallet/getaccountresource",
                json!({ "address": address, "visible": true }),
            )
            .await?;

        let resp: AccountResourceResponse = serde_json::from_value(value)
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;

        Ok(AccountResource {
            energy_limit: resp.energy_limit,
            energy_used: resp.energy_used,
            net_limit: resp.net_limit,
            net_used: resp.net_used,
            free_net_limit: resp.free_net_limit,
            free_net_used: resp.free_net_used,
        })
    }

    async fn get_account(&self, address: &str) -> Result<AccountInfo, LedgerError> {
        let value = self
            .post("/wallet/getaccount", json!({ "address": address, "visible": true }))
            .await?;

        let resp: AccountResponse = serde_json::from_value(value)
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;

        Ok(AccountInfo {
            balance: resp.balance,
            frozen: resp.frozen(),
        })
    }

    async fn get_balance(&self, address: &str, asset: &Asset) -> Result<u64, LedgerError> {
        match asset {
            Asset::Trx => Ok(self.get_account(address).await?.balance),
            Asset::Trc20(contract) => self.trc20_balance(address, contract).await,
        }
    }

    async fn generate_keypair(&self) -> Result<GeneratedKeypair, LedgerError> {
        let value = self.post("/wallet/generateaddress", json!({})).await?;

        let address = value
            .get("address")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::InvalidResponse("missing address".to_string()))?;
        validate_address(address).map_err(|e| LedgerError::InvalidAddress(e.to_string()))?;

        let private_key = value
            .get("privateKey")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::InvalidResponse("missing privateKey".to_string()))?;

        Ok(GeneratedKeypair {
            address: address.to_string(),
            private_key: private_key.to_string(),
        })
    }
}

#[async_trait]
impl TransactionRelay for TronGridClient {
    async fn create_transfer(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        asset: &Asset,
    ) -> Result<UnsignedTransfer, LedgerError> {
        validate_address(to).map_err(|e| LedgerError::InvalidAddress(e.to_string()))?;

        let value = match asset {
            Asset::Trx => {
                self.post(
                    "/wallet/createtransaction",
                    json!({
                        "owner_address": from,
                        "to_address": to,
                        "amount": amount,
                        "visible": true,
                    }),
                )
                .await?
            }
            Asset::Trc20(contract) => {
                self.post(
                    "/wallet/triggersmartcontract",
                    json!({
                        "owner_address": from,
                        "contract_address": contract,
                        "function_selector": "transfer(address,uint256)",
                        "parameter": encode_transfer_params(to, amount)?,
                        "fee_limit": self.fee_limit,
                        "call_value": 0,
                        "visible": true,
                    }),
                )
                .await?
            }
        };

        parse_unsigned(value)
    }

    async fn broadcast(&self, signed: &SignedTransfer) -> Result<String, LedgerError> {
        let mut tx = signed.unsigned.raw.clone();
        let obj = tx
            .as_object_mut()
            .ok_or_else(|| LedgerError::InvalidResponse("transaction is not an object".to_string()))?;
        obj.insert("signature".to_string(), json!([signed.signature]));
        obj.insert("visible".to_string(), json!(true));

        let value = self.post("/wallet/broadcasttransaction", tx).await?;

        if value.get("result").and_then(Value::as_bool) == Some(true) {
            return Ok(value
                .get("txid")
                .and_then(Value::as_str)
                .unwrap_or(signed.unsigned.txid.as_str())
                .to_string());
        }

        let code = value
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN");
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map(decode_message)
            .unwrap_or_default();
        Err(LedgerError::Api(format!("broadcast rejected ({}): {}", code, message)))
    }
}
