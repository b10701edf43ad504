use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use libj1939::error::J1939Error;
use libj1939::j1939::{
    Address, ClaimResult, EcuState, InterfaceConfig, InterfaceState, J1939Stack, Name, NetDevice,
    Pgn, Priority, Session, SessionId,
};
use proptest::prelude::*;

fn iface() -> InterfaceState {
    InterfaceState::new(NetDevice::new(1, "can0"), InterfaceConfig::default()).unwrap()
}

/// Every unicast slot holds at most one record, and every record with a
/// unicast address is the one its slot holds.
fn assert_cache_consistent(iface: &InterfaceState) {
    let ecus = iface.ecus();
    for raw in 0..=Address::MAX_UNICAST.raw() {
        let addr = Address(raw);
        let holders: Vec<_> = ecus.iter().filter(|ecu| ecu.address() == addr).collect();
        assert!(holders.len() <= 1, "address {} held by {:?}", addr, holders);
        match iface.lookup_by_address(addr) {
            Ok(bound) => {
                assert_eq!(holders.len(), 1);
                assert!(bound.same(holders[0]));
            }
            Err(err) => {
                assert_eq!(err, J1939Error::NotFound);
                assert!(holders.is_empty());
            }
        }
    }
}

#[test]
fn test_scenario_uncontested_claim() {
    let iface = iface();
    let result = iface.claim(Name(100), Address(42), 0).unwrap();
    assert_eq!(result, ClaimResult::Claiming { displaced: None });
    assert_eq!(
        iface.find_by_name(Name(100)).unwrap().state(),
        EcuState::Claiming
    );

    iface.poll_timers(250);
    assert_eq!(
        iface.find_by_name(Name(100)).unwrap().state(),
        EcuState::Claimed
    );
    assert_eq!(iface.lookup_by_address(Address(42)).unwrap().name(), Name(100));
}

#[test]
fn test_scenario_smaller_name_takes_over() {
    let iface = iface();
    iface.claim(Name(100), Address(42), 0).unwrap();
    iface.poll_timers(250);

    iface.claim(Name(50), Address(42), 300).unwrap();
    let old = iface.find_by_name(Name(100)).unwrap();
    let new = iface.find_by_name(Name(50)).unwrap();
    assert_eq!(old.state(), EcuState::Idle);
    assert_eq!(new.state(), EcuState::Claiming);

    iface.poll_timers(550);
    assert_eq!(new.state(), EcuState::Claimed);
    assert_eq!(old.state(), EcuState::Idle);
    assert_eq!(iface.lookup_by_address(Address(42)).unwrap().name(), Name(50));
}

#[test]
fn test_scenario_repeated_claim_is_idempotent() {
    let iface = iface();
    iface.claim(Name(100), Address(42), 0).unwrap();
    iface.claim(Name(100), Address(43), 10).unwrap();

    assert_eq!(iface.ecus().len(), 1);
    let ecu = iface.find_by_name(Name(100)).unwrap();
    assert_eq!(ecu.address(), Address(43));
    assert_cache_consistent(&iface);
}

#[test]
fn test_scenario_stale_unbind() {
    let iface = iface();
    let first = iface.create(Name(100)).unwrap();
    let other = iface.create(Name(200)).unwrap();

    iface.bind(Address(42), &first).unwrap();
    iface.unbind(Address(42), &first).unwrap();
    iface.bind(Address(42), &other).unwrap();

    let err = iface.unbind(Address(42), &first).unwrap_err();
    assert_eq!(err, J1939Error::StaleUnbind(Address(42)));
    assert!(err.is_benign());
    assert!(iface.lookup_by_address(Address(42)).unwrap().same(&other));
}

#[test]
fn test_duplicate_name_is_surfaced() {
    let a = iface();
    let b = InterfaceState::new(NetDevice::new(2, "can1"), InterfaceConfig::default()).unwrap();
    let ours = a.create(Name(9)).unwrap();
    let theirs = b.create(Name(9)).unwrap();
    assert_eq!(
        libj1939::j1939::resolve_conflict(&ours, &theirs),
        Err(J1939Error::DuplicateName(Name(9)))
    );
}

#[test]
fn test_teardown_notifies_every_session_once() {
    let stack = J1939Stack::new(InterfaceConfig::default()).unwrap();
    let iface = stack.on_interface_ready(NetDevice::new(7, "can0")).unwrap();

    let sessions: Vec<_> = (1..=4u32)
        .map(|i| {
            Session::bind(
                &iface,
                SessionId::new(i).unwrap(),
                Some(Name(i as u64)),
                Address::NO_ADDR,
            )
            .unwrap()
        })
        .collect();
    for (i, session) in sessions.iter().enumerate() {
        iface
            .claim(Name(i as u64 + 1), Address(i as u8 + 10), 0)
            .unwrap();
        session
            .prepare_tx(Pgn::REQUEST, Priority::DEFAULT, None, Address::NO_ADDR)
            .unwrap();
    }

    stack.on_interface_removed(7).unwrap();
    assert_eq!(
        stack.on_interface_removed(7).unwrap_err(),
        J1939Error::NotFound
    );

    for session in &sessions {
        assert_eq!(session.removal_notifications(), 1);
        assert_eq!(session.pending(), 0);
        assert!(session
            .prepare_tx(Pgn::REQUEST, Priority::DEFAULT, None, Address::NO_ADDR)
            .is_err());
        session.close().unwrap();
    }
    for raw in 0..=255u8 {
        assert!(iface.lookup_by_address(Address(raw)).is_err());
    }
    for i in 1..=4u64 {
        assert!(iface.find_by_name(Name(i)).is_err());
    }
    assert!(stack.get(7).is_err());
}

#[test]
fn test_lookups_never_see_torn_bindings() {
    let iface = iface();
    let a = iface.create(Name(100)).unwrap();
    let b = iface.create(Name(200)).unwrap();
    iface.bind(Address(42), &a).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let iface = iface.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut seen = 0usize;
                while !stop.load(Ordering::Acquire) {
                    if let Ok(ecu) = iface.lookup_by_address(Address(42)) {
                        let name = ecu.name();
                        assert!(name == Name(100) || name == Name(200));
                        seen += 1;
                    }
                }
                seen
            })
        })
        .collect();

    for i in 0..2_000 {
        let (from, to) = if i % 2 == 0 { (&a, &b) } else { (&b, &a) };
        let _ = iface.unbind(Address(42), from);
        iface.bind(Address(42), to).unwrap();
    }
    stop.store(true, Ordering::Release);

    for reader in readers {
        reader.join().unwrap();
    }
    assert_cache_consistent(&iface);
}

#[test]
fn test_concurrent_claims_smallest_name_wins() {
    let iface = iface();
    let names: Vec<u64> = (0..8).map(|i| 1_000 - i * 37).collect();

    let claimants: Vec<_> = names
        .iter()
        .map(|&name| {
            let iface = iface.clone();
            thread::spawn(move || iface.claim(Name(name), Address(42), 0).unwrap())
        })
        .collect();
    for claimant in claimants {
        claimant.join().unwrap();
    }

    iface.poll_timers(1_000);
    let winner = *names.iter().min().unwrap();
    assert_eq!(iface.lookup_by_address(Address(42)).unwrap().name(), Name(winner));
    for &name in &names {
        let state = iface.find_by_name(Name(name)).unwrap().state();
        if name == winner {
            assert_eq!(state, EcuState::Claimed);
        } else {
            assert_eq!(state, EcuState::Idle);
        }
    }
}

#[test]
fn test_concurrent_lookup_refcounts_balance() {
    let iface = iface();
    iface.claim(Name(1), Address(1), 0).unwrap();
    let ecu = iface.find_by_name(Name(1)).unwrap();
    let baseline = ecu.refcount();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let iface = iface.clone();
            thread::spawn(move || {
                for _ in 0..1_000 {
                    let held = iface.lookup_by_address(Address(1)).unwrap();
                    drop(held);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(ecu.refcount(), baseline);
}

#[derive(Debug, Clone)]
enum Op {
    Claim(u64, u8),
    Bind(u64, u8),
    Unbind(u64, u8),
    Release(u64),
    Unregister(u64),
    Poll(u64),
}

fn op() -> impl Strategy<Value = Op> {
    let name = 1u64..6;
    let addr = 0u8..6;
    prop_oneof![
        (name.clone(), addr.clone()).prop_map(|(n, a)| Op::Claim(n, a)),
        (name.clone(), addr.clone()).prop_map(|(n, a)| Op::Bind(n, a)),
        (name.clone(), addr).prop_map(|(n, a)| Op::Unbind(n, a)),
        name.clone().prop_map(Op::Release),
        name.prop_map(Op::Unregister),
        (0u64..1_000).prop_map(Op::Poll),
    ]
}

proptest! {
    #[test]
    fn prop_one_record_per_slot(ops in prop::collection::vec(op(), 1..60)) {
        let iface = iface();
        for op in ops {
            match op {
                Op::Claim(n, a) => {
                    let _ = iface.claim(Name(n), Address(a), 0);
                }
                Op::Bind(n, a) => {
                    let ecu = iface.create(Name(n)).unwrap();
                    iface.bind(Address(a), &ecu).unwrap();
                }
                Op::Unbind(n, a) => {
                    if let Ok(ecu) = iface.find_by_name(Name(n)) {
                        let _ = iface.unbind(Address(a), &ecu);
                    }
                }
                Op::Release(n) => {
                    if let Ok(ecu) = iface.find_by_name(Name(n)) {
                        iface.release_address(&ecu).unwrap();
                    }
                }
                Op::Unregister(n) => {
                    if let Ok(ecu) = iface.find_by_name(Name(n)) {
                        iface.unregister(&ecu).unwrap();
                    }
                }
                Op::Poll(now) => {
                    iface.poll_timers(now);
                }
            }
            assert_cache_consistent(&iface);
        }
    }

    #[test]
    fn prop_arbitration_ignores_arrival_order(
        names in prop::collection::hash_set(1u64..10_000, 2..8),
        reverse in any::<bool>(),
    ) {
        let mut names: Vec<u64> = names.into_iter().collect();
        if reverse {
            names.reverse();
        }

        let iface = iface();
        for (i, &name) in names.iter().enumerate() {
            iface.claim(Name(name), Address(42), i as u64).unwrap();
        }
        iface.poll_timers(10_000);

        let winner = *names.iter().min().unwrap();
        prop_assert_eq!(iface.lookup_by_address(Address(42)).unwrap().name(), Name(winner));
        for &name in &names {
            let expected = if name == winner { EcuState::Claimed } else { EcuState::Idle };
            prop_assert_eq!(iface.find_by_name(Name(name)).unwrap().state(), expected);
        }
    }
}
