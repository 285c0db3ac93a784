//! Pool wallet: the node wallet behind its password.
//!
//! Each payout run unlocks once, sends its batches, and locks again. A
//! batch is exactly one `send` call; nothing here retries.

use std::sync::Arc;

use crate::blockchain::{PaymentRequest, WalletClient};
use crate::error::{NodeError, SendError};
use crate::storage::PreparedPayment;

#[derive(Clone)]
pub struct PoolWallet {
    client: Arc<dyn WalletClient>,
    pass: String,
}

impl PoolWallet {
    /// `None` when no password is configured; payouts are then disabled.
    pub fn new(client: Arc<dyn WalletClient>, pass: Option<&str>) -> Option<Self> {
        let pass = pass.map(str::trim).filter(|p| !p.is_empty())?;
        Some(Self { client, pass: pass.to_string() })
    }

    pub async fn unlock(&self) -> Result<(), NodeError> {
        self.client.unlock(&self.pass).await
    }

    /// Best effort; a wallet left unlocked is logged, not fatal.
    pub async fn lock(&self) {
        if let Err(e) = self.client.lock().await {
            tracing::warn!(error = %e, "Failed to lock wallet");
        }
    }

    pub async fn send(&self, batch: &[PreparedPayment]) -> Result<String, SendError> {
        let requests: Vec<PaymentRequest> = batch
            .iter()
            .map(|p| PaymentRequest { address: p.address.clone(), value: p.amount })
            .collect();
        self.client.send_payment(&requests).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Vec<PaymentRequest>>>,
    }

    #[async_trait]
    impl WalletClient for Recording {
        async fn unlock(&self, _pass: &str) -> Result<(), NodeError> {
            Ok(())
        }
        async fn lock(&self) -> Result<(), NodeError> {
            Ok(())
        }
        async fn send_payment(&self, requests: &[PaymentRequest]) -> Result<String, SendError> {
            self.sent.lock().unwrap().push(requests.to_vec());
            Ok("tx".to_string())
        }
    }

    #[test]
    fn blank_password_disables_wallet() {
        let client = Arc::new(Recording::default());
        assert!(PoolWallet::new(client.clone(), None).is_none());
        assert!(PoolWallet::new(client.clone(), Some("  ")).is_none());
        assert!(PoolWallet::new(client, Some("secret")).is_some());
    }

    #[tokio::test]
    async fn batch_is_one_request() {
        let client = Arc::new(Recording::default());
        let wallet = PoolWallet::new(client.clone(), Some("pw")).unwrap();
        let batch = vec![
            PreparedPayment { id: 1, address: "A".to_string(), amount: 5 },
            PreparedPayment { id: 2, address: "B".to_string(), amount: 7 },
        ];
        assert_eq!(wallet.send(&batch).await.unwrap(), "tx");
        let sent = client.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][1], PaymentRequest { address: "B".to_string(), value: 7 });
    }
}
