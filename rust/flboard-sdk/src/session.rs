use std::time::Duration;

use tokio::time::Instant;

use flboard_core::SessionId;

/// How long a session is assumed to live and how early it is renewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// The lifetime of a session, counted from its creation or its last
    /// confirmation by the service.
    pub lifetime: Duration,
    /// How long before its expiry a session gets renewed.
    pub renew_before: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(30 * 60),
            renew_before: Duration::from_secs(5 * 60),
        }
    }
}

/// A session with the training service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub created_at: Instant,
    pub expires_at: Instant,
    renew_before: Duration,
}

impl Session {
    /// Starts tracking a session the service just issued.
    pub fn new(id: SessionId, policy: SessionPolicy) -> Self {
        let created_at = Instant::now();
        Self {
            id,
            created_at,
            expires_at: created_at + policy.lifetime,
            renew_before: policy.renew_before,
        }
    }

    /// Pushes the expiry back after the service confirmed the session.
    pub fn extend(&mut self, policy: SessionPolicy) {
        self.expires_at = Instant::now() + policy.lifetime;
        self.renew_before = policy.renew_before;
    }

    /// The instant from which on the session should be renewed.
    pub fn renew_at(&self) -> Instant {
        self.expires_at
            .checked_sub(self.renew_before)
            .unwrap_or(self.created_at)
            .max(self.created_at)
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn needs_renewal(&self) -> bool {
        Instant::now() >= self.renew_at()
    }
}
