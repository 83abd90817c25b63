//! Lease ledger and the revoke-on-write coherence driver.
//!
//! For each key the ledger tracks the set of outstanding lease holders and
//! a `revoking` flag. Writes run in three phases: freeze (new grants for
//! the key are denied), wait (revocation callbacks fan out to every
//! unexpired holder, each bounded by that holder's server-side expiry),
//! apply (the caller mutates the store, then clears the key's ledger
//! entry). The ledger itself never blocks operations on other keys.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::server::external::{RevokeReply, RevokeRequest};
use crate::utils::{
    framed_recv, framed_send, tcp_connect_with_retry, LeaseKvError, Timer,
};

use async_trait::async_trait;

use bytes::BytesMut;

use futures::future::join_all;

use tokio::time::{Duration, Instant};

/// Seconds a granted lease stays valid on the holder's clock.
pub const LEASE_VALID_SECS: u64 = 10;

/// Extra seconds the grantor waits past validity before writing a lease
/// off, covering clock skew and grant messages still in flight.
pub const LEASE_GUARD_SECS: u64 = 2;

/// Delivery seam for revocation callbacks. The production implementation
/// dials the holder's callback endpoint over TCP; tests substitute delayed
/// or unresponsive deliveries.
#[async_trait]
pub(crate) trait RevokeDispatch: Send + Sync + 'static {
    /// Delivers one `RevokeLease` callback for `key` to `holder` and waits
    /// for its acknowledgment. Any reply status counts as acknowledged.
    async fn revoke(
        &self,
        holder: SocketAddr,
        key: &str,
    ) -> Result<(), LeaseKvError>;
}

/// Production dispatcher: one fresh connection per callback. The time
/// bound is applied by the ledger's fan-out, so no retries here.
pub(crate) struct TcpRevoker;

#[async_trait]
impl RevokeDispatch for TcpRevoker {
    async fn revoke(
        &self,
        holder: SocketAddr,
        key: &str,
    ) -> Result<(), LeaseKvError> {
        let mut conn = tcp_connect_with_retry(holder, 0).await?;
        framed_send(
            &mut conn,
            &RevokeRequest {
                id: 0,
                key: key.to_owned(),
            },
        )
        .await?;
        let mut read_buf = BytesMut::with_capacity(64);
        let _reply: RevokeReply = framed_recv(&mut read_buf, &mut conn).await?;
        Ok(())
    }
}

/// Per-key lease bookkeeping.
#[derive(Debug, Default)]
struct KeyLeases {
    /// Outstanding holders mapped to their grant instant.
    holders: HashMap<SocketAddr, Instant>,

    /// Whether a write is currently revoking this key. While set, new
    /// grants are denied.
    revoking: bool,
}

/// The node-wide lease ledger.
pub(crate) struct LeaseLedger {
    /// My node ID (logging prefix).
    me: u32,

    /// Lease validity window promised to holders.
    valid: Duration,

    /// Guard margin added on the grantor side.
    guard: Duration,

    /// Per-key lease state. Locked only for short bookkeeping sections,
    /// never across the revocation wait.
    entries: Mutex<HashMap<String, KeyLeases>>,
}

impl LeaseLedger {
    /// Creates a ledger with the given validity/guard windows.
    pub(crate) fn new(me: u32, valid: Duration, guard: Duration) -> Self {
        LeaseLedger {
            me,
            valid,
            guard,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Validity window in whole seconds, as carried in grant replies.
    pub(crate) fn valid_secs(&self) -> u32 {
        self.valid.as_secs() as u32
    }

    /// Attempts to grant a lease on `key` to `holder`. Denied while a
    /// revocation for the key is in progress. Re-granting to the same
    /// holder refreshes its grant instant.
    pub(crate) fn try_grant(&self, key: &str, holder: SocketAddr) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        let entry = entries.entry(key.to_owned()).or_default();
        if entry.revoking {
            return false;
        }

        // shed grants already past their server-side expiry
        let horizon = self.valid + self.guard;
        entry
            .holders
            .retain(|_, granted_at| now < *granted_at + horizon);

        entry.holders.insert(holder, now);
        pl_trace!(self.me; "lease granted on '{}' -> {}", key, holder);
        true
    }

    /// Phases 1-2 of a write to `key`: sets the `revoking` flag, then
    /// fans out revocation callbacks to every holder whose grant has not
    /// expired from the grantor's perspective. Returns once every such
    /// holder has acknowledged or passed its expiry; never earlier, never
    /// unboundedly later. The caller must hold the key's write gate.
    pub(crate) async fn freeze_and_revoke(
        &self,
        key: &str,
        dispatch: &dyn RevokeDispatch,
    ) {
        let targets: Vec<(SocketAddr, Instant)> = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(key.to_owned()).or_default();
            entry.revoking = true;

            let now = Instant::now();
            entry
                .holders
                .iter()
                .filter_map(|(&holder, &granted_at)| {
                    let expiry = granted_at + self.valid + self.guard;
                    (now < expiry).then_some((holder, expiry))
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }
        pl_debug!(self.me; "revoking '{}' from {} holder(s)", key,
                           targets.len());

        join_all(targets.into_iter().map(|(holder, expiry)| async move {
            let remaining = expiry.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            let expire_timer = Timer::new();
            if let Err(e) = expire_timer.arm(remaining) {
                pl_error!(self.me; "error arming revocation timer: {}", e);
                return;
            }

            tokio::select! {
                ack = dispatch.revoke(holder, key) => {
                    match ack {
                        Ok(()) => pl_trace!(self.me;
                            "revocation of '{}' acked by {}", key, holder),
                        // delivery failures fall back to the expiry bound
                        // of the remaining holders; this one is written off
                        Err(e) => pl_warn!(self.me;
                            "revocation of '{}' to {} failed: {}",
                            key, holder, e),
                    }
                },
                () = expire_timer.expired() => {
                    pl_warn!(self.me;
                        "revocation of '{}' to {} expired unacked",
                        key, holder);
                },
            }
        }))
        .await;
    }

    /// Withdraws `holder`'s grant on `key`, for grants made on reads that
    /// found nothing to cache. A no-op while the key is being revoked (the
    /// fan-out may already be targeting the holder; one spurious callback
    /// is harmless).
    pub(crate) fn retract_grant(&self, key: &str, holder: SocketAddr) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            if !entry.revoking {
                entry.holders.remove(&holder);
                if entry.holders.is_empty() {
                    entries.remove(key);
                }
            }
        }
    }

    /// Phase-3 tail of a write to `key`: drops the key's ledger entry,
    /// clearing all holders and the `revoking` flag. New grants are
    /// admitted again after this returns.
    pub(crate) fn clear_after_apply(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Number of unexpired holders currently recorded for `key`.
    #[cfg(test)]
    fn holder_count(&self, key: &str) -> usize {
        let entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let horizon = self.valid + self.guard;
        entries.get(key).map_or(0, |e| {
            e.holders
                .values()
                .filter(|&&granted_at| now < granted_at + horizon)
                .count()
        })
    }

    /// Backdates `holder`'s grant on `key` by `age`, for expiry testing.
    #[cfg(test)]
    fn backdate_grant(&self, key: &str, holder: SocketAddr, age: Duration) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.to_owned()).or_default();
        entry.holders.insert(holder, Instant::now() - age);
    }
}

#[cfg(test)]
mod leases_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time;

    fn holder(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Dispatcher that sleeps for a configured delay before acking, and
    /// counts deliveries.
    struct SlowAcker {
        delay: Duration,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl RevokeDispatch for SlowAcker {
        async fn revoke(
            &self,
            _holder: SocketAddr,
            _key: &str,
        ) -> Result<(), LeaseKvError> {
            time::sleep(self.delay).await;
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn grant_refresh_and_count() {
        let ledger = LeaseLedger::new(
            0,
            Duration::from_millis(200),
            Duration::from_millis(50),
        );
        assert!(ledger.try_grant("k", holder(7001)));
        assert!(ledger.try_grant("k", holder(7002)));
        assert!(ledger.try_grant("k", holder(7001))); // refresh, not new
        assert_eq!(ledger.holder_count("k"), 2);
        assert_eq!(ledger.holder_count("other"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expired_grants_shed_on_access() {
        let ledger = LeaseLedger::new(
            0,
            Duration::from_millis(50),
            Duration::from_millis(20),
        );
        ledger.backdate_grant("k", holder(7001), Duration::from_millis(100));
        assert_eq!(ledger.holder_count("k"), 0);
        assert!(ledger.try_grant("k", holder(7002)));
        assert_eq!(ledger.holder_count("k"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn grants_denied_while_revoking() -> Result<(), LeaseKvError> {
        let ledger = Arc::new(LeaseLedger::new(
            0,
            Duration::from_millis(500),
            Duration::from_millis(100),
        ));
        assert!(ledger.try_grant("k", holder(7001)));

        let dispatch = Arc::new(SlowAcker {
            delay: Duration::from_millis(150),
            delivered: AtomicUsize::new(0),
        });
        let ledger_ref = ledger.clone();
        let dispatch_ref = dispatch.clone();
        let revoker = tokio::spawn(async move {
            ledger_ref
                .freeze_and_revoke("k", dispatch_ref.as_ref())
                .await;
        });

        // while the callback is still in flight, grants must be denied but
        // only for this key
        time::sleep(Duration::from_millis(50)).await;
        assert!(!ledger.try_grant("k", holder(7002)));
        assert!(ledger.try_grant("unrelated", holder(7002)));

        revoker.await?;
        assert_eq!(dispatch.delivered.load(Ordering::SeqCst), 1);

        // still frozen until the caller finishes applying its mutation
        assert!(!ledger.try_grant("k", holder(7003)));
        ledger.clear_after_apply("k");
        assert!(ledger.try_grant("k", holder(7003)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unacked_revocation_bounded_by_expiry() {
        let ledger = LeaseLedger::new(
            0,
            Duration::from_millis(80),
            Duration::from_millis(40),
        );
        assert!(ledger.try_grant("k", holder(7001)));

        // dispatcher never acks within the test's lifetime
        let stuck = SlowAcker {
            delay: Duration::from_secs(3600),
            delivered: AtomicUsize::new(0),
        };
        let start = Instant::now();
        ledger.freeze_and_revoke("k", &stuck).await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(1000));
        assert_eq!(stuck.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_holders_returns_immediately() {
        let ledger = LeaseLedger::new(
            0,
            Duration::from_secs(10),
            Duration::from_secs(2),
        );
        let stuck = SlowAcker {
            delay: Duration::from_secs(3600),
            delivered: AtomicUsize::new(0),
        };
        let start = Instant::now();
        ledger.freeze_and_revoke("fresh", &stuck).await;
        assert!(start.elapsed() < Duration::from_millis(100));
        // the freeze must still have taken effect
        assert!(!ledger.try_grant("fresh", holder(7001)));
        ledger.clear_after_apply("fresh");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fanout_acks_all_holders() {
        let ledger = LeaseLedger::new(
            0,
            Duration::from_millis(500),
            Duration::from_millis(100),
        );
        for port in 7001..7005 {
            assert!(ledger.try_grant("k", holder(port)));
        }
        let acker = SlowAcker {
            delay: Duration::from_millis(50),
            delivered: AtomicUsize::new(0),
        };
        let start = Instant::now();
        ledger.freeze_and_revoke("k", &acker).await;

        // deliveries run in parallel, so four 50 ms acks take ~50 ms
        assert!(start.elapsed() < Duration::from_millis(300));
        assert_eq!(acker.delivered.load(Ordering::SeqCst), 4);
    }
}
