use crate::backend::{KvBackend, StorageEstimate};
use crate::config::QuotaPolicy;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuotaStatus {
    /// Backend could not report usage; the save proceeds.
    Unknown,
    Ok(f64),
    Warning(f64),
    Exceeded(f64),
}

impl QuotaPolicy {
    pub fn classify(&self, estimate: Option<StorageEstimate>) -> QuotaStatus {
        let Some(estimate) = estimate else {
            return QuotaStatus::Unknown;
        };
        let ratio = estimate.usage_ratio();
        if ratio >= self.reject_ratio {
            QuotaStatus::Exceeded(ratio)
        } else if ratio >= self.warn_ratio {
            QuotaStatus::Warning(ratio)
        } else {
            QuotaStatus::Ok(ratio)
        }
    }
}

/// Best-effort usage check against the primary backend.
pub async fn check<B: KvBackend>(backend: &B, policy: &QuotaPolicy) -> QuotaStatus {
    policy.classify(backend.estimate().await)
}
