//! Payments, served by one-shot `wallet api` calls.

use serde::Serialize;

use crate::api::Api;
use crate::error::Result;
use crate::models::{PaymentSummary, RelayClaimResult, SendResult};
use crate::protocol::{ApiFamily, Request};

#[derive(Debug, Serialize)]
struct TxIdOptions<'a> {
    txid: &'a str,
}

/// A payment to send with [`Api::send_wallet_tx`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WalletSend {
    pub recipient: String,
    pub amount: String,
    /// Display currency the amount is denominated in, e.g. `USD`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo_text: Option<String>,
}

impl WalletSend {
    pub fn new(recipient: impl Into<String>, amount: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            amount: amount.into(),
            ..Default::default()
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn from_account(mut self, account_id: impl Into<String>) -> Self {
        self.from_account_id = Some(account_id.into());
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo_text = Some(memo.into());
        self
    }
}

impl Api {
    /// Details of a single transaction.
    pub async fn wallet_tx_details(&self, txid: &str) -> Result<PaymentSummary> {
        self.call(ApiFamily::Wallet, &Request::new("details", TxIdOptions { txid }))
            .await
    }

    pub async fn send_wallet_tx(&self, payment: &WalletSend) -> Result<SendResult> {
        self.call(ApiFamily::Wallet, &Request::new("send", payment))
            .await
    }

    /// Cancel a relay payment that has not been claimed yet.
    pub async fn cancel_wallet_tx(&self, txid: &str) -> Result<RelayClaimResult> {
        self.call(ApiFamily::Wallet, &Request::new("cancel", TxIdOptions { txid }))
            .await
    }
}
