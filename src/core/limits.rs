use crate::core::errors::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Ceiling on concurrently executing units of work.
///
/// `None` means unbounded; every caller is admitted immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    pub max_concurrent: Option<usize>,
}

impl ConcurrencyLimits {
    pub fn unbounded() -> Self {
        Self {
            max_concurrent: None,
        }
    }

    pub fn bounded(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: Some(max_concurrent),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == Some(0) {
            return Err(ForgeError::configuration(
                "max_concurrent must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Counts running units of work and refuses admission past the ceiling.
///
/// Admission hands out an [`ExecutionPermit`]; dropping it releases the slot,
/// so a worker thread that unwinds still gives its slot back.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    name: String,
    limits: ConcurrencyLimits,
    active: AtomicUsize,
    peak: AtomicUsize,
    total_admitted: AtomicU64,
    total_rejected: AtomicU64,
}

impl ConcurrencyLimiter {
    pub fn new(name: impl Into<String>, limits: ConcurrencyLimits) -> Result<Arc<Self>> {
        limits.validate()?;
        Ok(Arc::new(Self {
            name: name.into(),
            limits,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            total_admitted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }))
    }

    /// Try to take a slot
    pub fn try_acquire(self: &Arc<Self>) -> Result<ExecutionPermit> {
        let admitted = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match self.limits.max_concurrent {
                    Some(max) if current >= max => None,
                    _ => Some(current + 1),
                }
            });

        match admitted {
            Ok(previous) => {
                let now = previous + 1;
                self.peak.fetch_max(now, Ordering::Relaxed);
                self.total_admitted.fetch_add(1, Ordering::Relaxed);
                debug!(limiter = %self.name, active = now, "Admitted unit of work");
                Ok(ExecutionPermit {
                    limiter: Arc::clone(self),
                    started_at: Instant::now(),
                })
            }
            Err(current) => {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                let limit = self.limits.max_concurrent.unwrap_or(usize::MAX);
                Err(ForgeError::resource_exhausted(
                    self.name.clone(),
                    current as u64 + 1,
                    limit as u64,
                ))
            }
        }
    }

    /// Whether a slot is free right now
    pub fn has_capacity(&self) -> bool {
        match self.limits.max_concurrent {
            Some(max) => self.active.load(Ordering::Acquire) < max,
            None => true,
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limits.max_concurrent
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            active: self.active.load(Ordering::Relaxed),
            peak: self.peak.load(Ordering::Relaxed),
            limit: self.limits.max_concurrent,
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }

    fn release(&self, held_for: Duration) {
        let previous = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            })
            .unwrap_or(0);
        debug!(
            limiter = %self.name,
            active = previous.saturating_sub(1),
            held_ms = held_for.as_millis() as u64,
            "Released unit of work"
        );
    }
}

/// RAII slot in a [`ConcurrencyLimiter`]
#[derive(Debug)]
pub struct ExecutionPermit {
    limiter: Arc<ConcurrencyLimiter>,
    started_at: Instant,
}

impl ExecutionPermit {
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.limiter.release(self.started_at.elapsed());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterStats {
    pub active: usize,
    pub peak: usize,
    pub limit: Option<usize>,
    pub total_admitted: u64,
    pub total_rejected: u64,
}
