//! Property tests for the invariants a replicated registry state machine
//! must hold regardless of which sequence of commands produced it.

use proptest::prelude::*;
use registry_core::command::{Command, DelRequest, InstanceRegistration};
use registry_core::fsm::Fsm;
use registry_core::state::{RegistryState, ServiceRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Reg { service: String, host: String, port: u16, beat: u64 },
    Endel { service: String, host: String, port: u16 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let service = prop::sample::select(vec!["svc-a", "svc-b"]);
    let host = prop::sample::select(vec!["10.0.0.1", "10.0.0.2"]);
    let port = prop::sample::select(vec![8001u16, 8002u16]);
    let beat = 0u64..10_000u64;

    prop_oneof![
        (service.clone(), host.clone(), port, beat).prop_map(|(service, host, port, beat)| Op::Reg {
            service: service.to_string(),
            host: host.to_string(),
            port,
            beat,
        }),
        (service, host, port).prop_map(|(service, host, port)| Op::Endel {
            service: service.to_string(),
            host: host.to_string(),
            port,
        }),
    ]
}

fn apply_ops(fsm: &Fsm, ops: &[Op]) {
    for op in ops {
        let cmd = match op {
            Op::Reg { service, host, port, beat } => Command::Reg(InstanceRegistration {
                service: service.clone(),
                host: host.clone(),
                port: *port,
                last_beat_ms: *beat,
                created_unix_ms: 0,
            }),
            Op::Endel { service, host, port } => {
                Command::Endel(DelRequest { name: service.clone(), host: host.clone(), port: *port })
            }
        };
        fsm.apply(&cmd.encode().unwrap());
    }
}

proptest! {
    /// For any ordered sequence of REG commands, the final state contains,
    /// for each `(service, host, port)` triple ever registered, exactly one
    /// instance whose `last_beat_ms` equals the value from its last REG.
    #[test]
    fn reg_only_sequences_converge_to_last_beat(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let reg_only: Vec<Op> = ops.into_iter().filter(|o| matches!(o, Op::Reg { .. })).collect();

        let fsm = Fsm::new(Arc::new(RegistryState::new()));
        apply_ops(&fsm, &reg_only);

        let mut expected_last_beat: HashMap<(String, String, u16), u64> = HashMap::new();
        for op in &reg_only {
            if let Op::Reg { service, host, port, beat } = op {
                expected_last_beat.insert((service.clone(), host.clone(), *port), *beat);
            }
        }

        let mut seen: HashSet<(String, String, u16)> = HashSet::new();
        for entry in fsm.state().get_services() {
            let mut in_service: HashSet<(String, u16)> = HashSet::new();
            for inst in &entry.instances {
                prop_assert!(in_service.insert((inst.host.clone(), inst.port)), "duplicate (host, port) within one service");
                let key = (entry.name.clone(), inst.host.clone(), inst.port);
                prop_assert_eq!(Some(&inst.last_beat_ms), expected_last_beat.get(&key));
                seen.insert(key);
            }
        }
        prop_assert_eq!(seen, expected_last_beat.keys().cloned().collect());
    }

    /// For any sequence interleaving REG and ENDEL, if the last operation
    /// for a given `(service, host, port)` is ENDEL, no entry with that
    /// pair remains.
    #[test]
    fn trailing_endel_removes_the_instance(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let fsm = Fsm::new(Arc::new(RegistryState::new()));
        apply_ops(&fsm, &ops);

        let mut last_op: HashMap<(String, String, u16), bool> = HashMap::new(); // true = last op was REG
        for op in &ops {
            match op {
                Op::Reg { service, host, port, .. } => {
                    last_op.insert((service.clone(), host.clone(), *port), true);
                }
                Op::Endel { service, host, port } => {
                    last_op.insert((service.clone(), host.clone(), *port), false);
                }
            }
        }

        let present: HashSet<(String, String, u16)> = fsm
            .state()
            .get_services()
            .into_iter()
            .flat_map(|entry| {
                entry.instances.into_iter().map(move |inst| (entry.name.clone(), inst.host, inst.port))
            })
            .collect();

        for (key, last_was_reg) in &last_op {
            if !last_was_reg {
                prop_assert!(!present.contains(key), "instance last ENDEL'd is still present: {:?}", key);
            }
        }
    }

    /// Snapshot-then-restore on a fresh FSM reproduces the original state
    /// structurally, including `created_unix_ms` and `last_beat_ms`.
    #[test]
    fn snapshot_restore_round_trips(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let fsm = Fsm::new(Arc::new(RegistryState::new()));
        apply_ops(&fsm, &ops);

        let blob = fsm.snapshot().unwrap();
        let restored = Fsm::new(Arc::new(RegistryState::new()));
        restored.restore(&blob).unwrap();

        let mut original = fsm.state().get_services();
        let mut after = restored.state().get_services();
        original.sort_by(|a, b| a.name.cmp(&b.name));
        after.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in original.iter_mut().chain(after.iter_mut()) {
            entry.instances.sort_by(|a, b| (a.host.clone(), a.port).cmp(&(b.host.clone(), b.port)));
        }

        prop_assert_eq!(original, after);
    }
}
