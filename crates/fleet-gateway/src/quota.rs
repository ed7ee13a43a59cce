//! Token quota gate
//!
//! Wraps each completion in a balance check and a post-hoc debit. The
//! stores behind it are external collaborators; the traits here are the
//! whole contract the gateway needs, and the in-memory implementations back
//! development and tests.
//!
//! Failures after a successful completion (debit or call recording) are
//! logged and suppressed: the user already has their answer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{Error, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

/// Rough token estimate: one token per four characters of trimmed input.
/// Precision is a fairness property here, not a correctness one.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.trim().len() / 4) as i64
}

/// A user's balance as the gateway sees it.
#[derive(Debug, Clone, Serialize)]
pub struct UserAccount {
    pub id: String,
    pub tokens: i64,
}

/// External user store interface.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: &str) -> Result<UserAccount>;

    /// Atomically debit `amount` tokens. Fails without changing the balance
    /// when it would go negative. Returns the remaining balance.
    async fn consume_tokens(&self, id: &str, amount: i64) -> Result<i64>;
}

/// External call-record interface.
#[async_trait]
pub trait CallRecorder: Send + Sync {
    async fn record_call(
        &self,
        user_id: &str,
        endpoint: &str,
        tokens: i64,
        request: &str,
        response: &str,
    ) -> Result<()>;
}

/// In-memory user store. New users are provisioned with a default grant the
/// first time they are seen, mirroring what registration does upstream.
pub struct InMemoryUserStore {
    accounts: RwLock<HashMap<String, i64>>,
    default_tokens: i64,
}

impl InMemoryUserStore {
    pub fn new(default_tokens: i64) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            default_tokens,
        }
    }

    /// Set a user's balance directly.
    pub fn set_balance(&self, id: &str, tokens: i64) {
        self.accounts.write().insert(id.to_string(), tokens);
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get_user(&self, id: &str) -> Result<UserAccount> {
        let tokens = *self
            .accounts
            .write()
            .entry(id.to_string())
            .or_insert(self.default_tokens);
        Ok(UserAccount {
            id: id.to_string(),
            tokens,
        })
    }

    async fn consume_tokens(&self, id: &str, amount: i64) -> Result<i64> {
        let mut accounts = self.accounts.write();
        let balance = accounts
            .entry(id.to_string())
            .or_insert(self.default_tokens);
        if *balance < amount {
            return Err(Error::QuotaExceeded {
                current: *balance,
                required: amount,
            });
        }
        *balance -= amount;
        Ok(*balance)
    }
}

/// One recorded completion call.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub user_id: String,
    pub endpoint: String,
    pub tokens: i64,
    pub request: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
}

/// In-memory call log.
#[derive(Default)]
pub struct InMemoryCallRecorder {
    calls: RwLock<Vec<CallRecord>>,
}

impl InMemoryCallRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.read().clone()
    }
}

#[async_trait]
impl CallRecorder for InMemoryCallRecorder {
    async fn record_call(
        &self,
        user_id: &str,
        endpoint: &str,
        tokens: i64,
        request: &str,
        response: &str,
    ) -> Result<()> {
        self.calls.write().push(CallRecord {
            user_id: user_id.to_string(),
            endpoint: endpoint.to_string(),
            tokens,
            request: request.to_string(),
            response: response.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

/// The quota gate around completions.
pub struct QuotaGate {
    users: Arc<dyn UserStore>,
    calls: Arc<dyn CallRecorder>,
}

impl QuotaGate {
    pub fn new(users: Arc<dyn UserStore>, calls: Arc<dyn CallRecorder>) -> Self {
        Self { users, calls }
    }

    /// Pre-dispatch balance check.
    ///
    /// `needed` is the input estimate plus the completion budget. A short
    /// balance rejects the call before any backend work happens; the
    /// balance is untouched.
    pub async fn precheck(&self, user_id: &str, input: &str, max_tokens: u32) -> Result<i64> {
        let needed = estimate_tokens(input) + max_tokens as i64;
        let user = self.users.get_user(user_id).await?;
        if user.tokens < needed {
            return Err(Error::QuotaExceeded {
                current: user.tokens,
                required: needed,
            });
        }
        Ok(needed)
    }

    /// Post-completion debit and call record.
    ///
    /// Debits the tokens the backend actually reported. Failures here are
    /// logged and swallowed; returns the remaining balance when the debit
    /// went through.
    pub async fn settle(
        &self,
        user_id: &str,
        endpoint: &str,
        actual_tokens: i64,
        request: &str,
        response: &str,
    ) -> Option<i64> {
        let remaining = match self.users.consume_tokens(user_id, actual_tokens).await {
            Ok(remaining) => Some(remaining),
            Err(e) => {
                error!(user = %user_id, tokens = actual_tokens, error = %e, "Token debit failed after completion");
                None
            }
        };

        if let Err(e) = self
            .calls
            .record_call(user_id, endpoint, actual_tokens, request, response)
            .await
        {
            warn!(user = %user_id, endpoint = %endpoint, error = %e, "Failed to record call");
        }

        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with_balance(tokens: i64) -> (QuotaGate, Arc<InMemoryUserStore>, Arc<InMemoryCallRecorder>) {
        let users = Arc::new(InMemoryUserStore::new(0));
        users.set_balance("u1", tokens);
        let calls = Arc::new(InMemoryCallRecorder::new());
        let gate = QuotaGate::new(users.clone(), calls.clone());
        (gate, users, calls)
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("   "), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(80)), 20);
        // trimming happens before counting
        assert_eq!(estimate_tokens("  abcdefgh  "), 2);
    }

    #[tokio::test]
    async fn test_precheck_rejects_short_balance() {
        let (gate, users, _) = gate_with_balance(5);

        // 80 chars estimate to 20 tokens; plus 50 requested = 70 needed
        let input = "x".repeat(80);
        let err = gate.precheck("u1", &input, 50).await.unwrap_err();
        match err {
            Error::QuotaExceeded { current, required } => {
                assert_eq!(current, 5);
                assert_eq!(required, 70);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // balance unchanged
        assert_eq!(users.get_user("u1").await.unwrap().tokens, 5);
    }

    #[tokio::test]
    async fn test_precheck_passes_with_sufficient_balance() {
        let (gate, _, _) = gate_with_balance(100);
        let needed = gate.precheck("u1", "abcd", 50).await.unwrap();
        assert_eq!(needed, 51);
    }

    #[tokio::test]
    async fn test_settle_debits_and_records() {
        let (gate, users, calls) = gate_with_balance(100);

        let remaining = gate
            .settle("u1", "/api/v1/models/m1/chat", 30, "{}", "{}")
            .await;
        assert_eq!(remaining, Some(70));
        assert_eq!(users.get_user("u1").await.unwrap().tokens, 70);

        let records = calls.calls();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tokens, 30);
        assert_eq!(records[0].endpoint, "/api/v1/models/m1/chat");
    }

    #[tokio::test]
    async fn test_settle_suppresses_debit_failure() {
        let (gate, users, calls) = gate_with_balance(10);

        // actual usage overshot the balance; the debit fails but the call
        // is still recorded and nothing panics
        let remaining = gate.settle("u1", "/chat", 50, "{}", "{}").await;
        assert_eq!(remaining, None);
        assert_eq!(users.get_user("u1").await.unwrap().tokens, 10);
        assert_eq!(calls.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_consume_never_goes_negative() {
        let users = InMemoryUserStore::new(0);
        users.set_balance("u1", 3);

        assert!(users.consume_tokens("u1", 5).await.is_err());
        assert_eq!(users.get_user("u1").await.unwrap().tokens, 3);
        assert_eq!(users.consume_tokens("u1", 3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_default_grant_for_new_users() {
        let users = InMemoryUserStore::new(1000);
        assert_eq!(users.get_user("fresh").await.unwrap().tokens, 1000);
    }

    #[tokio::test]
    async fn test_debit_sequence_sums() {
        let (gate, users, _) = gate_with_balance(100);
        for debit in [10, 20, 30] {
            gate.settle("u1", "/chat", debit, "{}", "{}").await;
        }
        assert_eq!(users.get_user("u1").await.unwrap().tokens, 40);
    }
}
