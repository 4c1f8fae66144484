use std::time::Duration;

pub const DEFAULT_MEMBER_CAP: usize = 2;
pub const DEFAULT_IDLE_SESSION_EXPIRY: Duration = Duration::from_secs(600);
pub const DEFAULT_RECYCLE_INTERVAL: Duration = Duration::from_secs(60);

/// How simultaneous offers are resolved. Only one policy exists; it is kept
/// as a type so the choice shows up in configuration dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlarePolicy {
    /// The offer from the lexicographically smaller peer id wins.
    #[default]
    LexicographicPeerId,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub member_cap: usize,
    pub idle_session_expiry: Duration,
    pub recycle_interval: Duration,
    pub glare_policy: GlarePolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            member_cap: DEFAULT_MEMBER_CAP,
            idle_session_expiry: DEFAULT_IDLE_SESSION_EXPIRY,
            recycle_interval: DEFAULT_RECYCLE_INTERVAL,
            glare_policy: GlarePolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn with_member_cap(mut self, member_cap: usize) -> Self {
        self.member_cap = member_cap;
        self
    }

    pub fn with_idle_session_expiry(mut self, expiry: Duration) -> Self {
        self.idle_session_expiry = expiry;
        self
    }

    pub fn with_recycle_interval(mut self, interval: Duration) -> Self {
        self.recycle_interval = interval;
        self
    }
}
