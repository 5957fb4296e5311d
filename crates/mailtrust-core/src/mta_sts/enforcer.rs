//! MX hostname enforcement against a domain's MTA-STS policy

use super::fetcher::MtaStsFetcher;
use super::policy::mx_pattern_matches;
use super::MtaStsError;
use mailtrust_storage::{MtaStsMode, MtaStsPolicy};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Outcome of checking one MX host against a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Policy mode is `none`
    NotEnforced,
    /// The host matches a listed pattern
    Allowed,
    /// No pattern matched, but the policy is in testing mode
    Violation,
    /// No pattern matched under an enforce policy
    Rejected,
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, PolicyDecision::Rejected)
    }
}

/// Decide what `policy` says about delivering to `mx_hostname`
pub fn evaluate(policy: &MtaStsPolicy, mx_hostname: &str) -> PolicyDecision {
    if policy.mode == MtaStsMode::None {
        return PolicyDecision::NotEnforced;
    }

    if policy
        .mx_patterns
        .iter()
        .any(|pattern| mx_pattern_matches(pattern, mx_hostname))
    {
        return PolicyDecision::Allowed;
    }

    match policy.mode {
        MtaStsMode::Testing => PolicyDecision::Violation,
        _ => PolicyDecision::Rejected,
    }
}

pub struct MtaStsEnforcer {
    fetcher: Arc<MtaStsFetcher>,
}

impl MtaStsEnforcer {
    pub fn new(fetcher: Arc<MtaStsFetcher>) -> Self {
        Self { fetcher }
    }

    /// Fetch the domain's policy and evaluate `mx_hostname` against it
    pub async fn check(&self, domain: &str, mx_hostname: &str) -> Result<PolicyDecision, MtaStsError> {
        let policy = self.fetcher.fetch_policy(domain).await?;
        let decision = evaluate(&policy, mx_hostname);

        match decision {
            PolicyDecision::NotEnforced | PolicyDecision::Allowed => {
                debug!(domain, mx_hostname, ?decision, "MTA-STS check passed")
            }
            PolicyDecision::Violation => {
                warn!(domain, mx_hostname, "MTA-STS policy violation (testing mode)")
            }
            PolicyDecision::Rejected => {
                error!(domain, mx_hostname, "MTA-STS policy violation, delivery rejected")
            }
        }

        Ok(decision)
    }

    /// May mail for `domain` be delivered to `mx_hostname`?
    ///
    /// `false` only under an enforce policy that lists no matching
    /// pattern. Errors mean no policy could be obtained at all.
    pub async fn enforce_policy(&self, domain: &str, mx_hostname: &str) -> Result<bool, MtaStsError> {
        Ok(self.check(domain, mx_hostname).await?.is_allowed())
    }
}
