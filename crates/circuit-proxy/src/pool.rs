//! Fixed-size pool of backend circuits with sticky-session affinity.
//!
//! Every slot maps to a local SOCKS port and a control port derived from its
//! index. An exchange takes a slot with [`CircuitPool::acquire`] and holds it
//! through the returned [`CircuitLease`]; dropping the lease frees the slot,
//! so every exit path of an exchange releases exactly once.
//!
//! Selection order:
//! 1. a free slot already bound to the caller's session token;
//! 2. otherwise the least-recently-used free slot (lowest id on ties), which
//!    is then bound to the token if one was supplied.
//!
//! When nothing is free the caller waits up to the configured acquire
//! timeout for a release, then gets [`ProxyError::PoolExhausted`].

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Addressing for one backend circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Circuit {
    /// Slot index in the pool
    pub id: usize,
    /// Local SOCKS port of the circuit
    pub socks_port: u16,
    /// Local control port of the circuit
    pub control_port: u16,
}

/// Point-in-time view of one slot, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStatus {
    pub id: usize,
    pub busy: bool,
    pub sticky_key: Option<String>,
}

#[derive(Debug)]
struct Slot {
    circuit: Circuit,
    busy: bool,
    last_use: Instant,
    /// Logical clock value of the last acquisition. Gives a strict total
    /// order even when two acquisitions share a timestamp.
    use_seq: u64,
    sticky_key: Option<String>,
}

#[derive(Debug)]
struct Slots {
    slots: Vec<Slot>,
    clock: u64,
}

/// Shared pool of circuits.
#[derive(Debug)]
pub struct CircuitPool {
    inner: Mutex<Slots>,
    released: Notify,
    acquire_timeout: Duration,
    sticky_ttl: Option<Duration>,
}

impl CircuitPool {
    /// Create a pool of `size` circuits. Circuit `i` uses
    /// `socks_base_port + i` and `control_base_port + i`.
    ///
    /// Port arithmetic saturates; [`ProxyConfig::validate`] rejects layouts
    /// that would overflow.
    #[must_use]
    pub fn new(size: usize, socks_base_port: u16, control_base_port: u16) -> Self {
        let now = Instant::now();
        let slots = (0..size)
            .map(|id| {
                let offset = u16::try_from(id).unwrap_or(u16::MAX);
                Slot {
                    circuit: Circuit {
                        id,
                        socks_port: socks_base_port.saturating_add(offset),
                        control_port: control_base_port.saturating_add(offset),
                    },
                    busy: false,
                    last_use: now,
                    use_seq: 0,
                    sticky_key: None,
                }
            })
            .collect();

        Self {
            inner: Mutex::new(Slots { slots, clock: 0 }),
            released: Notify::new(),
            acquire_timeout: Duration::ZERO,
            sticky_ttl: None,
        }
    }

    /// Build a pool from the proxy configuration.
    #[must_use]
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            config.pool_size,
            config.socks_base_port,
            config.control_base_port,
        )
        .with_acquire_timeout(config.acquire_timeout())
        .with_sticky_ttl(config.sticky_ttl())
    }

    /// How long [`acquire`](Self::acquire) waits when every circuit is busy.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Idle time after which a free circuit drops its sticky token.
    #[must_use]
    pub fn with_sticky_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.sticky_ttl = ttl;
        self
    }

    /// Number of circuits in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire a circuit, preferring the one bound to `sticky_key`.
    ///
    /// Waits for a release while the pool is exhausted, bounded by the
    /// acquire timeout.
    pub async fn acquire(self: &Arc<Self>, sticky_key: Option<&str>) -> Result<CircuitLease> {
        // A timeout too large to represent means waiting without a deadline.
        let deadline = Instant::now().checked_add(self.acquire_timeout);
        loop {
            // Register for release notifications before looking, so a
            // release between the check and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire(sticky_key) {
                return Ok(lease);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        debug!("Circuit pool exhausted after {:?}", self.acquire_timeout);
                        return Err(ProxyError::PoolExhausted {
                            waited: self.acquire_timeout,
                        });
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Acquire a circuit without waiting. Returns `None` if all are busy.
    pub fn try_acquire(self: &Arc<Self>, sticky_key: Option<&str>) -> Option<CircuitLease> {
        let mut guard = self.lock();
        let now = Instant::now();

        if let Some(ttl) = self.sticky_ttl {
            for slot in guard.slots.iter_mut().filter(|s| !s.busy) {
                if slot.sticky_key.is_some() && now.duration_since(slot.last_use) > ttl {
                    debug!("Circuit {} sticky token expired", slot.circuit.id);
                    slot.sticky_key = None;
                }
            }
        }

        let bound = sticky_key.and_then(|key| {
            guard
                .slots
                .iter()
                .position(|s| !s.busy && s.sticky_key.as_deref() == Some(key))
        });

        let (index, rebound) = match bound {
            Some(index) => (index, false),
            None => {
                let index = guard
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| !s.busy)
                    .min_by_key(|(id, s)| (s.use_seq, *id))
                    .map(|(index, _)| index)?;
                let slot = &mut guard.slots[index];
                let rebound = match sticky_key {
                    Some(key) => {
                        let previous = slot.sticky_key.replace(key.to_string());
                        previous.is_some_and(|prev| prev != key)
                    }
                    None => false,
                };
                (index, rebound)
            }
        };

        guard.clock += 1;
        let seq = guard.clock;
        let slot = &mut guard.slots[index];
        slot.busy = true;
        slot.last_use = now;
        slot.use_seq = seq;
        let circuit = slot.circuit;
        drop(guard);

        debug!(
            "Acquired circuit {} (socks port {}, sticky: {})",
            circuit.id,
            circuit.socks_port,
            sticky_key.is_some()
        );

        Some(CircuitLease {
            pool: Arc::clone(self),
            circuit,
            rebound,
        })
    }

    /// Snapshot of every slot, in id order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CircuitStatus> {
        self.lock()
            .slots
            .iter()
            .map(|s| CircuitStatus {
                id: s.circuit.id,
                busy: s.busy,
                sticky_key: s.sticky_key.clone(),
            })
            .collect()
    }

    /// Number of circuits currently held by exchanges.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.busy).count()
    }

    fn release(&self, id: usize) {
        let mut guard = self.lock();
        let slot = &mut guard.slots[id];
        assert!(slot.busy, "circuit {} released while not busy", id);
        // The sticky token stays: the next request with it should land here.
        slot.busy = false;
        drop(guard);

        debug!("Released circuit {}", id);
        self.released.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive hold on one circuit. The circuit is released when the lease is
/// dropped.
#[derive(Debug)]
pub struct CircuitLease {
    pool: Arc<CircuitPool>,
    circuit: Circuit,
    rebound: bool,
}

impl CircuitLease {
    #[must_use]
    pub fn circuit(&self) -> Circuit {
        self.circuit
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.circuit.id
    }

    /// True when acquiring this lease replaced a different session token on
    /// the circuit.
    #[must_use]
    pub fn rebound(&self) -> bool {
        self.rebound
    }
}

impl Drop for CircuitLease {
    fn drop(&mut self) {
        self.pool.release(self.circuit.id);
    }
}
