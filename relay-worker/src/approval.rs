//! Two-phase approval for destructive operations.
//!
//! `propose` hashes the plan and hands back a single-use token. `consume`
//! accepts the token only if it is known, unused, unexpired, issued for the
//! same action, and the plan it is presented with still hashes to the
//! proposed value. A changed plan needs a fresh proposal.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::event::canonicalize;

/// Handed to the proposer; presented again to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalToken {
    pub token: Uuid,
    pub action: String,
    pub plan_hash: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Proposal {
    action: String,
    plan_hash: String,
    expires_at: DateTime<Utc>,
    consumed: bool,
}

/// SHA-256 over the canonical JSON form of a plan.
pub fn plan_hash(plan: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(canonicalize(plan).to_string().as_bytes()))
}

pub struct ApprovalGate {
    ttl: Duration,
    proposals: Mutex<HashMap<Uuid, Proposal>>,
}

impl ApprovalGate {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(5)),
            proposals: Mutex::new(HashMap::new()),
        }
    }

    /// Record a plan and issue a token for it.
    pub fn propose(&self, action: &str, plan: &serde_json::Value, now: DateTime<Utc>) -> ApprovalToken {
        let token = ApprovalToken {
            token: Uuid::new_v4(),
            action: action.to_string(),
            plan_hash: plan_hash(plan),
            expires_at: now + self.ttl,
        };

        let mut proposals = self.proposals.lock().unwrap_or_else(PoisonError::into_inner);
        // drop proposals that expired more than one ttl ago
        let horizon = now - self.ttl;
        proposals.retain(|_, p| p.expires_at > horizon);
        proposals.insert(
            token.token,
            Proposal {
                action: token.action.clone(),
                plan_hash: token.plan_hash.clone(),
                expires_at: token.expires_at,
                consumed: false,
            },
        );

        info!(token = %token.token, action = %action, expires_at = %token.expires_at, "approval_proposed");
        token
    }

    /// Redeem a token for `plan`. A token can be redeemed once.
    pub fn consume(
        &self,
        token: Uuid,
        action: &str,
        plan: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> RelayResult<String> {
        let mut proposals = self.proposals.lock().unwrap_or_else(PoisonError::into_inner);
        let proposal = proposals
            .get_mut(&token)
            .ok_or_else(|| reject(token, "unknown approval token"))?;

        if proposal.consumed {
            return Err(reject(token, "approval token already consumed"));
        }
        if proposal.expires_at <= now {
            return Err(reject(token, "approval token expired"));
        }
        if proposal.action != action {
            return Err(reject(token, "approval token was issued for another action"));
        }
        let current = plan_hash(plan);
        if proposal.plan_hash != current {
            return Err(reject(token, "plan changed since it was approved"));
        }

        proposal.consumed = true;
        info!(token = %token, action = %action, "approval_consumed");
        Ok(current)
    }
}

fn reject(token: Uuid, reason: &str) -> RelayError {
    warn!(token = %token, reason, "approval_rejected");
    RelayError::Approval(reason.to_string())
}
