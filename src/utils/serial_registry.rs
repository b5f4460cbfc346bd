//! Serial Registry for single-use envelope serials
//!
//! Every envelope the relay signs carries a fresh 32-bit serial. A serial stays
//! active from issuance until a receiver voids it (exactly once) or until it
//! outlives `max_lifetime` and is swept. Voiding an unknown serial, or one
//! already consumed, is how replays are detected.
//!
//! A failed void of an expired serial leaves the entry in place. Later attempts
//! report "expired" until the sweep removes it.

use crate::error::{PortalError, Result};
use crate::utils::time::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Single-use nonce bound to one envelope
pub type Serial = u32;

/// Default lifetime of an issued serial
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct RegistryInner {
    /// Highest serial handed out so far (0 = none)
    last_issued: Serial,
    /// Active serial -> issue time in unix millis
    active: HashMap<Serial, u64>,
}

/// Thread-safe registry of issued, not yet consumed serials
pub struct SerialRegistry {
    inner: Mutex<RegistryInner>,
    max_lifetime: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SerialRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialRegistry")
            .field("max_lifetime", &self.max_lifetime)
            .finish_non_exhaustive()
    }
}

impl SerialRegistry {
    /// Create a registry using the system clock
    pub fn new(max_lifetime: Duration) -> Self {
        Self::with_clock(max_lifetime, SystemClock)
    }

    /// Create a registry with a custom clock
    pub fn with_clock(max_lifetime: Duration, clock: impl Clock) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_lifetime,
            clock: Arc::new(clock),
        }
    }

    pub fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }

    /// Allocate the next serial and record its issue time
    pub fn next_serial(&self) -> Result<Serial> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock()?;
        let serial = inner
            .last_issued
            .checked_add(1)
            .ok_or(PortalError::SerialExhausted)?;
        inner.last_issued = serial;
        inner.active.insert(serial, now);
        Ok(serial)
    }

    /// Consume a serial.
    ///
    /// Fails with `UnknownSerial` if it was never issued or is already void,
    /// and with `ExpiredSerial` if it outlived `max_lifetime` (the entry is kept).
    #[instrument(skip(self), level = "debug")]
    pub fn void_serial(&self, serial: Serial) -> Result<()> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock()?;

        let issued_at = match inner.active.get(&serial) {
            Some(issued_at) => *issued_at,
            None => {
                warn!(serial, "Void attempt for unknown or already voided serial");
                return Err(PortalError::UnknownSerial(serial));
            }
        };

        if now.saturating_sub(issued_at) > self.max_lifetime_millis() {
            warn!(serial, issued_at, "Void attempt for expired serial");
            return Err(PortalError::ExpiredSerial(serial));
        }

        inner.active.remove(&serial);
        debug!(serial, "Serial voided");
        Ok(())
    }

    /// Remove serials older than `max_lifetime`; returns how many were purged
    pub fn sweep(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let max_age = self.max_lifetime_millis();
        let mut inner = self.inner.lock()?;

        let initial_count = inner.active.len();
        inner
            .active
            .retain(|_, issued_at| now.saturating_sub(*issued_at) <= max_age);

        let removed = initial_count - inner.active.len();
        if removed > 0 {
            debug!("Swept {} expired serials", removed);
        }
        Ok(removed)
    }

    /// Number of serials currently active
    pub fn active_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.active.len()).unwrap_or(0)
    }

    /// Get current registry statistics
    pub fn stats(&self) -> RegistryStats {
        let (active, last_issued) = self
            .inner
            .lock()
            .map(|inner| (inner.active.len(), inner.last_issued))
            .unwrap_or((0, 0));
        RegistryStats {
            active,
            last_issued,
            max_lifetime_ms: self.max_lifetime_millis(),
        }
    }

    /// Capture the state that must survive a restart
    pub fn snapshot(&self) -> Result<SerialSnapshot> {
        let inner = self.inner.lock()?;
        let mut active: Vec<(Serial, u64)> =
            inner.active.iter().map(|(s, t)| (*s, *t)).collect();
        active.sort_unstable();
        Ok(SerialSnapshot {
            last_issued: inner.last_issued,
            active,
        })
    }

    /// Merge a previously captured snapshot.
    ///
    /// The counter never moves backwards, so serials issued before the restart
    /// are never handed out again.
    pub fn restore(&self, snapshot: &SerialSnapshot) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.last_issued = inner.last_issued.max(snapshot.last_issued);
        for (serial, issued_at) in &snapshot.active {
            inner.active.insert(*serial, *issued_at);
        }
        info!(
            last_issued = inner.last_issued,
            active = inner.active.len(),
            "Serial registry restored"
        );
        Ok(())
    }

    /// Run `sweep` every `period` on the current tokio runtime
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                if let Err(e) = registry.sweep() {
                    warn!(error = %e, "Serial sweep failed");
                }
            }
        })
    }

    fn max_lifetime_millis(&self) -> u64 {
        self.max_lifetime.as_millis() as u64
    }
}

impl Default for SerialRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LIFETIME)
    }
}

/// Statistics about the serial registry
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Current number of active serials
    pub active: usize,
    /// Highest serial issued
    pub last_issued: Serial,
    /// Lifetime in milliseconds
    pub max_lifetime_ms: u64,
}

/// Persisted registry state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSnapshot {
    pub last_issued: Serial,
    pub active: Vec<(Serial, u64)>,
}

impl SerialSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}
