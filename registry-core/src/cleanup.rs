//! Periodically scans the services map and proposes `ENDEL` for every
//! instance whose lease has lapsed. Deletes are proposed through the log,
//! never applied directly; on a follower `propose` fails with `NotLeader`
//! and the scan just moves on to the next entry. The leader's own cleanup
//! loop will eventually perform the delete. A failed delete is never
//! retried directly: the next pass will simply observe the still-expired
//! entry and propose again.
//!
//! State machine: `Idle -> Scanning -> Proposing -> Sleeping -> Scanning ->
//! ...`, with no terminal state during normal operation; shutdown is
//! cancellation from outside (dropping the `JoinHandle` / cancelling the
//! task that owns this loop).

use crate::command::{Command, DelRequest};
use crate::consensus::Proposer;
use crate::state::CleanableResource;
use crate::time::now_unix_ms;
use std::sync::Arc;
use std::time::Duration;

/// The period an instance that hasn't renewed is observed before the
/// cleanup loop proposes its removal is widened by this much, to absorb
/// scan latency. Must actually be folded into the expiry comparison below
/// (see `DESIGN.md` for why that matters).
pub const SAFETY_DELTA: Duration = Duration::from_millis(100);

pub struct CleanupConfig {
    pub period: Duration,
    pub threshold: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { period: Duration::from_secs(10), threshold: Duration::from_secs(20) }
    }
}

pub struct CleanupLoop<R, P> {
    resources: Arc<R>,
    proposer: Arc<P>,
    config: CleanupConfig,
}

impl<R, P> CleanupLoop<R, P>
where
    R: CleanableResource + Send + Sync + 'static,
    P: Proposer + 'static,
{
    pub fn new(resources: Arc<R>, proposer: Arc<P>, config: CleanupConfig) -> Self {
        Self { resources, proposer, config }
    }

    /// Run forever, sleeping `period` between passes. Cancel by dropping the
    /// task this future is spawned on.
    pub async fn run(&self) {
        loop {
            self.scan_and_propose(now_unix_ms()).await;
            tokio::time::sleep(self.config.period).await;
        }
    }

    /// One pass: scan then propose. Exposed separately from `run` so tests
    /// can drive it deterministically with a fixed `now`.
    pub async fn scan_and_propose(&self, now_ms: u64) {
        // Snapshot view of the services map: iteration must not hold the
        // services lock while `propose` is in flight.
        let services = self.resources.get_resources();
        let threshold_ms = self.config.threshold.as_millis() as u64 + SAFETY_DELTA.as_millis() as u64;

        for entry in services.values() {
            for instance in &entry.instances {
                if now_ms.saturating_sub(instance.last_beat_ms) > threshold_ms {
                    let req = DelRequest { name: entry.name.clone(), host: instance.host.clone(), port: instance.port };
                    let cmd = match Command::Endel(req).encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode ENDEL for expired instance");
                            continue;
                        }
                    };
                    if let Err(e) = self.proposer.propose(cmd).await {
                        tracing::debug!(error = %e, service = %entry.name, host = %instance.host, port = instance.port, "cleanup propose did not land, will retry next pass");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::state::{InstanceEntry, RegistryState, ServiceRegistry};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct RecordingProposer {
        proposed: Mutex<Vec<Command>>,
        fail: bool,
    }

    #[async_trait]
    impl Proposer for RecordingProposer {
        async fn propose(&self, command: Vec<u8>) -> Result<()> {
            if self.fail {
                return Err(Error::NotLeader);
            }
            self.proposed.lock().push(Command::decode(&command).unwrap());
            Ok(())
        }
    }

    fn instance(host: &str, port: u16, last_beat_ms: u64) -> InstanceEntry {
        InstanceEntry { host: host.into(), port, created_unix_ms: 0, last_beat_ms }
    }

    #[tokio::test]
    async fn expired_instance_is_proposed_for_deletion() {
        let state = Arc::new(RegistryState::new());
        state.register("svc-a", instance("127.0.0.1", 8001, 0));

        let proposer = Arc::new(RecordingProposer { proposed: Mutex::new(Vec::new()), fail: false });
        let cleanup = CleanupLoop::new(state, proposer.clone(), CleanupConfig { period: Duration::from_secs(1), threshold: Duration::from_millis(100) });

        cleanup.scan_and_propose(1_000).await;

        let proposed = proposer.proposed.lock();
        assert_eq!(proposed.len(), 1);
        assert!(matches!(&proposed[0], Command::Endel(req) if req.name == "svc-a" && req.port == 8001));
    }

    #[tokio::test]
    async fn fresh_instance_within_threshold_is_never_proposed() {
        let state = Arc::new(RegistryState::new());
        state.register("svc-a", instance("127.0.0.1", 8001, 950));

        let proposer = Arc::new(RecordingProposer { proposed: Mutex::new(Vec::new()), fail: false });
        let cleanup = CleanupLoop::new(state, proposer.clone(), CleanupConfig { period: Duration::from_secs(1), threshold: Duration::from_millis(100) });

        cleanup.scan_and_propose(1_000).await;

        assert!(proposer.proposed.lock().is_empty());
    }

    #[tokio::test]
    async fn safety_delta_widens_the_effective_threshold() {
        let state = Arc::new(RegistryState::new());
        // Past threshold (100ms) but still within threshold + safety delta (200ms).
        state.register("svc-a", instance("127.0.0.1", 8001, 850));

        let proposer = Arc::new(RecordingProposer { proposed: Mutex::new(Vec::new()), fail: false });
        let cleanup = CleanupLoop::new(state, proposer.clone(), CleanupConfig { period: Duration::from_secs(1), threshold: Duration::from_millis(100) });

        cleanup.scan_and_propose(1_000).await;

        assert!(proposer.proposed.lock().is_empty(), "instance within the safety delta must not be removed yet");
    }

    #[tokio::test]
    async fn follower_rejection_does_not_stop_the_scan() {
        let state = Arc::new(RegistryState::new());
        state.register("svc-a", instance("127.0.0.1", 8001, 0));
        state.register("svc-b", instance("127.0.0.1", 8002, 0));

        let proposer = Arc::new(RecordingProposer { proposed: Mutex::new(Vec::new()), fail: true });
        let cleanup = CleanupLoop::new(state, proposer, CleanupConfig { period: Duration::from_secs(1), threshold: Duration::from_millis(100) });

        // Must not panic or early-return despite every propose failing.
        cleanup.scan_and_propose(10_000).await;
    }
}
