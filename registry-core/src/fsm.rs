//! Deterministic apply of a committed log entry to the registry state, plus
//! the snapshot/restore discipline that keeps the log bounded. The applier
//! runs on every replica, in log order, without concurrency; it must never
//! block on I/O or consult a non-deterministic source. `REG`'s timestamps
//! arrive on the command (see `command::InstanceRegistration`) rather than
//! being read from the local clock here, which is what keeps replicas
//! byte-identical after a shared log prefix.

use crate::command::Command;
use crate::error::Result;
use crate::state::{InstanceEntry, KvStore, RegistryState, ServiceEntry, ServiceRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The state machine applied on top of the replicated log.
pub struct Fsm {
    state: Arc<RegistryState>,
    decode_failures: AtomicU64,
}

impl Fsm {
    pub fn new(state: Arc<RegistryState>) -> Self {
        Self { state, decode_failures: AtomicU64::new(0) }
    }

    pub fn state(&self) -> &Arc<RegistryState> {
        &self.state
    }

    /// Count of log entries that failed to decode. Exposed so the owning
    /// process can alert on persistent decode failure, which (per design)
    /// indicates a cross-version protocol break rather than a transient
    /// glitch.
    pub fn decode_failure_count(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Apply one committed log entry. Never blocks on I/O.
    pub fn apply(&self, entry: &[u8]) {
        let cmd = match Command::decode(entry) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::error!(error = %e, "committed log entry failed to decode");
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match cmd {
            Command::Put { key, value } => self.state.put(key, value),
            Command::Del { key } => self.state.delete(&key),
            Command::Reg(reg) => {
                self.state.register(
                    &reg.service,
                    InstanceEntry {
                        host: reg.host,
                        port: reg.port,
                        created_unix_ms: reg.created_unix_ms,
                        last_beat_ms: reg.last_beat_ms,
                    },
                );
            }
            Command::Endel(req) => {
                self.state.delete_instance(&req.name, &req.host, req.port);
            }
        }
    }

    /// Produce a snapshot blob encoding both maps: a snapshot covering only
    /// one of the two would let the other silently diverge across a restore
    /// (see `DESIGN.md`).
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let (kv, services) = self.state.snapshot_maps();
        let blob = SnapshotBlob { kv, services };
        Ok(serde_json::to_vec(&blob)?)
    }

    /// Replace current state wholesale from a snapshot blob. Idempotent:
    /// restoring the same blob twice leaves the state unchanged the second
    /// time.
    pub fn restore(&self, blob: &[u8]) -> Result<()> {
        let blob: SnapshotBlob = serde_json::from_slice(blob)?;
        self.state.replace_maps(blob.kv, blob.services);
        Ok(())
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SnapshotBlob {
    kv: HashMap<String, String>,
    services: HashMap<String, ServiceEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{DelRequest, InstanceRegistration};

    fn fsm() -> Fsm {
        Fsm::new(Arc::new(RegistryState::new()))
    }

    #[test]
    fn put_then_del() {
        let fsm = fsm();
        fsm.apply(&Command::Put { key: "k".into(), value: "v".into() }.encode().unwrap());
        assert_eq!(fsm.state().get("k"), Some("v".into()));
        fsm.apply(&Command::Del { key: "k".into() }.encode().unwrap());
        assert_eq!(fsm.state().get("k"), None);
    }

    #[test]
    fn del_of_absent_key_is_noop() {
        let fsm = fsm();
        fsm.apply(&Command::Del { key: "missing".into() }.encode().unwrap());
        assert_eq!(fsm.state().get("missing"), None);
    }

    #[test]
    fn reg_creates_then_renews_preserving_created() {
        let fsm = fsm();
        let reg = InstanceRegistration {
            service: "svc-a".into(),
            host: "127.0.0.1".into(),
            port: 8001,
            last_beat_ms: 100,
            created_unix_ms: 1_000,
        };
        fsm.apply(&Command::Reg(reg).encode().unwrap());

        let renewal = InstanceRegistration {
            service: "svc-a".into(),
            host: "127.0.0.1".into(),
            port: 8001,
            last_beat_ms: 200,
            // Deliberately different: the FSM must ignore this on renewal.
            created_unix_ms: 9_999,
        };
        fsm.apply(&Command::Reg(renewal).encode().unwrap());

        let services = fsm.state().get_services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].instances.len(), 1);
        let inst = &services[0].instances[0];
        assert_eq!(inst.created_unix_ms, 1_000);
        assert_eq!(inst.last_beat_ms, 200);
    }

    #[test]
    fn endel_removes_registered_instance() {
        let fsm = fsm();
        fsm.apply(
            &Command::Reg(InstanceRegistration {
                service: "svc-a".into(),
                host: "127.0.0.1".into(),
                port: 8001,
                last_beat_ms: 1,
                created_unix_ms: 1,
            })
            .encode()
            .unwrap(),
        );
        fsm.apply(
            &Command::Endel(DelRequest { name: "svc-a".into(), host: "127.0.0.1".into(), port: 8001 })
                .encode()
                .unwrap(),
        );

        let services = fsm.state().get_services();
        assert_eq!(services[0].instances.len(), 0);
    }

    #[test]
    fn malformed_entry_is_logged_not_fatal() {
        let fsm = fsm();
        fsm.apply(b"not a command");
        assert_eq!(fsm.decode_failure_count(), 1);
        // The FSM keeps working after a bad entry.
        fsm.apply(&Command::Put { key: "k".into(), value: "v".into() }.encode().unwrap());
        assert_eq!(fsm.state().get("k"), Some("v".into()));
    }

    #[test]
    fn snapshot_then_restore_reproduces_state() {
        let fsm = fsm();
        fsm.apply(&Command::Put { key: "k".into(), value: "v".into() }.encode().unwrap());
        fsm.apply(
            &Command::Reg(InstanceRegistration {
                service: "svc-a".into(),
                host: "127.0.0.1".into(),
                port: 8001,
                last_beat_ms: 5,
                created_unix_ms: 1,
            })
            .encode()
            .unwrap(),
        );

        let blob = fsm.snapshot().unwrap();

        let fresh = Fsm::new(Arc::new(RegistryState::new()));
        fresh.restore(&blob).unwrap();

        assert_eq!(fresh.state().get("k"), Some("v".into()));
        assert_eq!(fresh.state().get_services(), fsm.state().get_services());
    }

    #[test]
    fn restore_is_idempotent() {
        let fsm = fsm();
        fsm.apply(&Command::Put { key: "k".into(), value: "v".into() }.encode().unwrap());
        let blob = fsm.snapshot().unwrap();

        fsm.restore(&blob).unwrap();
        let first = fsm.state().get_services();
        fsm.restore(&blob).unwrap();
        let second = fsm.state().get_services();

        assert_eq!(first, second);
        assert_eq!(fsm.state().get("k"), Some("v".into()));
    }
}
