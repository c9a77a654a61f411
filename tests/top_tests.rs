//! Integration tests for the Top controller.

use memhier_coherence::coherence::{
    CacheLine, CcState, Command, LineState, MemEvent, Outgoing, Protocol, SharerSet,
    TopController, TopOutcome,
};
use memhier_coherence::common::{CoherenceError, LineAddr};
use memhier_coherence::config::TimingConfig;
use memhier_coherence::stats::CoherenceStats;

const LINE: u64 = 0x2000;

/// Creates a controller with requestors A, B and C on ports 0, 1 and 2.
fn create_top(protocol: Protocol) -> TopController {
    TopController::new(
        "l2",
        protocol,
        vec!["A".to_string(), "B".to_string(), "C".to_string()],
        TimingConfig::default(),
    )
}

/// Creates a local line in `state` and an empty sharer set for it.
fn create_line(state: LineState) -> (CacheLine, SharerSet) {
    let base = LineAddr::new(LINE, 64);
    let mut line = CacheLine::new(64);
    line.set_base_addr(base).unwrap();
    let path: &[LineState] = match state {
        LineState::S => &[LineState::IS, LineState::S],
        LineState::E => &[LineState::IS, LineState::E],
        LineState::M => &[LineState::IM, LineState::M],
        other => panic!("no path to {}", other),
    };
    for &next in path {
        line.set_state(next).unwrap();
    }
    let mut cc = SharerSet::new(3);
    cc.reset_for(base).unwrap();
    (line, cc)
}

fn event(src: &str, cmd: Command) -> MemEvent {
    let mut ev = MemEvent::new(src, LINE, LineAddr::new(LINE, 64), cmd);
    ev.dst = "l2".to_string();
    ev
}

fn drain(top: &mut TopController) -> Vec<Outgoing> {
    top.port_mut().drain(u64::MAX)
}

/// Tests that the first reader of an exclusive local line gets Exclusive.
#[test]
fn test_gets_grants_exclusive_when_alone() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::E);

    let outcome = top
        .handle_request(&event("A", Command::GetS), &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Granted(LineState::E));
    assert_eq!(cc.owner(), Some(0));
    assert!(cc.is_shareless());

    let out = drain(&mut top);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].cmd(), Command::GetSResp);
    assert_eq!(out[0].destination(), "A");
    assert_eq!(out[0].event.granted, Some(LineState::E));
    assert_eq!(stats.exclusive_grants, 1);
}

/// Tests that MSI never hands out Exclusive.
#[test]
fn test_msi_grants_shared() {
    let mut top = create_top(Protocol::Msi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::M);

    let outcome = top
        .handle_request(&event("A", Command::GetS), &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Granted(LineState::S));
    assert!(cc.is_sharer(0));
}

/// Tests that a read of a Shared local line adds a sharer.
#[test]
fn test_gets_adds_sharer() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::S);

    for src in ["A", "B", "A"] {
        let outcome = top
            .handle_request(&event(src, Command::GetS), &line, &mut cc, false, &mut stats)
            .unwrap();
        assert_eq!(outcome, TopOutcome::Granted(LineState::S));
    }
    assert_eq!(cc.num_sharers(), 2);
    assert_eq!(stats.responses_sent, 3);
}

/// Tests that a read against an upstream owner downgrades the owner first.
#[test]
fn test_gets_downgrades_owner() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::M);
    cc.set_owner(2).unwrap();

    let outcome = top
        .handle_request(&event("A", Command::GetS), &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Deferred);
    assert_eq!(cc.state(), CcState::InvXAcking);

    let out = drain(&mut top);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].cmd(), Command::InvX);
    assert_eq!(out[0].destination(), "C");

    // The owner answers with a downgrade writeback and stays on as a sharer.
    let put = event("C", Command::PutX).with_payload(vec![1; 64]);
    let outcome = top
        .handle_request(&put, &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Released { shareless: false });
    assert_eq!(cc.state(), CcState::Valid);
    assert_eq!(cc.owner(), None);
    assert!(cc.is_sharer(2));

    let outcome = top
        .handle_request(&event("A", Command::GetS), &line, &mut cc, true, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Granted(LineState::S));
    assert_eq!(cc.num_sharers(), 2);
}

/// Tests the weak GetX fan-out: one Inv to each other sharer, immediate grant.
#[test]
fn test_getx_fans_out_invalidations() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::M);
    cc.add_sharer(0).unwrap();
    cc.add_sharer(1).unwrap();

    let outcome = top
        .handle_request(&event("C", Command::GetX), &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Granted(LineState::M));
    assert!(cc.is_shareless());
    assert_eq!(cc.owner(), Some(2));

    let out = drain(&mut top);
    let invs: Vec<&str> = out
        .iter()
        .filter(|m| m.cmd() == Command::Inv)
        .map(Outgoing::destination)
        .collect();
    assert_eq!(invs, vec!["A", "B"]);
    assert!(out.iter().filter(|m| m.cmd() == Command::Inv).all(|m| !m.event.ack_needed));

    let grant = out.iter().find(|m| m.cmd() == Command::GetXResp).unwrap();
    assert_eq!(grant.destination(), "C");
    assert_eq!(grant.event.granted, Some(LineState::M));
    assert_eq!(stats.invalidates_sent, 2);
}

/// Tests the strict GetSEx fan-out: the grant waits for every acknowledgement.
#[test]
fn test_getsex_waits_for_acks() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::M);
    cc.add_sharer(0).unwrap();
    cc.add_sharer(1).unwrap();
    cc.add_sharer(2).unwrap();

    let req = event("C", Command::GetSEx);
    let outcome = top
        .handle_request(&req, &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Deferred);
    assert_eq!(cc.state(), CcState::InvAcking);
    assert_eq!(cc.ack_count(), 2);

    let out = drain(&mut top);
    assert_eq!(out.len(), 2);
    assert!(out.iter().all(|m| m.cmd() == Command::Inv && m.event.ack_needed));

    assert_eq!(top.handle_inv_ack(&event("A", Command::InvAck), &mut cc, &mut stats).unwrap(), 1);
    let outcome = top
        .handle_request(&event("B", Command::PutS), &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Released { shareless: false });
    assert_eq!(cc.state(), CcState::Valid);

    let outcome = top
        .handle_request(&req, &line, &mut cc, true, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Granted(LineState::M));
    assert_eq!(cc.owner(), Some(2));
    assert!(cc.is_shareless());
    assert_eq!(stats.inv_acks_received, 2);
}

/// Tests that a write against another owner invalidates the owner first.
#[test]
fn test_getx_invalidates_owner() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::M);
    cc.set_owner(0).unwrap();

    let outcome = top
        .handle_request(&event("B", Command::GetX), &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Deferred);

    let out = drain(&mut top);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].cmd(), Command::Inv);
    assert_eq!(out[0].destination(), "A");

    let put = event("A", Command::PutM).with_payload(vec![3; 64]);
    let outcome = top
        .handle_request(&put, &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Released { shareless: true });
    assert!(cc.is_valid());
}

/// Tests that a PutS from a port that is no longer a sharer is dropped.
#[test]
fn test_stale_puts_dropped() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::M);
    cc.set_owner(2).unwrap();

    let outcome = top
        .handle_request(&event("A", Command::PutS), &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Stale);
    assert_eq!(cc.owner(), Some(2));
    assert_eq!(stats.stale_puts, 1);
    assert!(drain(&mut top).is_empty());
}

/// Tests that dirty or exclusive relinquishes from non-holders stay fatal under MESI.
#[test]
fn test_put_from_non_owner_is_fatal() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::M);

    let put = event("A", Command::PutM).with_payload(vec![0; 64]);
    assert!(matches!(
        top.handle_request(&put, &line, &mut cc, false, &mut stats),
        Err(CoherenceError::InvariantViolation { .. })
    ));
    assert!(top
        .handle_request(&event("A", Command::PutE), &line, &mut cc, false, &mut stats)
        .is_err());
    assert_eq!(stats.stale_puts, 0);
}

/// Tests that a MOESI sharer holding the line Owned writes back with PutM.
#[test]
fn test_owned_sharer_writes_back() {
    let mut top = create_top(Protocol::Moesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::M);
    cc.add_sharer(0).unwrap();
    cc.add_sharer(1).unwrap();

    let req = event("C", Command::GetSEx);
    let outcome = top
        .handle_request(&req, &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Deferred);

    let put = event("A", Command::PutM).with_payload(vec![8; 64]);
    let outcome = top
        .handle_request(&put, &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Released { shareless: false });
    assert!(!cc.is_sharer(0));
    assert_eq!(cc.ack_count(), 1);

    let remaining = top
        .handle_inv_ack(&event("B", Command::InvAck), &mut cc, &mut stats)
        .unwrap();
    assert_eq!(remaining, 0);
    assert!(cc.is_valid());
    assert_eq!(stats.inv_acks_received, 2);
}

/// Tests that a MOESI PutM from a port invalidated without acks is dropped.
#[test]
fn test_owned_writeback_after_weak_invalidation() {
    let mut top = create_top(Protocol::Moesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::M);
    cc.add_sharer(0).unwrap();

    top.handle_request(&event("C", Command::GetX), &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(cc.owner(), Some(2));

    let put = event("A", Command::PutM).with_payload(vec![8; 64]);
    let outcome = top
        .handle_request(&put, &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Stale);
    assert_eq!(cc.owner(), Some(2));
    assert_eq!(stats.stale_puts, 1);
}

/// Tests that the incoherent protocol grants whole lines and tracks nobody.
#[test]
fn test_incoherent_grants() {
    let mut top = create_top(Protocol::Incoherent);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::E);

    for src in ["A", "B"] {
        let outcome = top
            .handle_request(&event(src, Command::GetS), &line, &mut cc, false, &mut stats)
            .unwrap();
        assert_eq!(outcome, TopOutcome::Granted(LineState::E));
    }
    let outcome = top
        .handle_request(&event("C", Command::GetX), &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Granted(LineState::M));
    assert!(cc.is_idle());

    let out = drain(&mut top);
    assert_eq!(out.len(), 3);
    assert!(out.iter().all(|m| m.cmd() != Command::Inv && m.cmd() != Command::InvX));

    let put = event("A", Command::PutM).with_payload(vec![1; 64]);
    assert_eq!(
        top.handle_request(&put, &line, &mut cc, false, &mut stats).unwrap(),
        TopOutcome::Released { shareless: true }
    );
    assert!(top
        .handle_request(&event("A", Command::PutS), &line, &mut cc, false, &mut stats)
        .is_err());
    assert!(top
        .handle_invalidate(&event("memory", Command::Inv), &mut cc, &mut stats)
        .is_err());
}

/// Tests that PutE clears ownership without re-adding a sharer.
#[test]
fn test_pute_clears_owner() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::E);
    cc.set_owner(1).unwrap();

    let outcome = top
        .handle_request(&event("B", Command::PutE), &line, &mut cc, false, &mut stats)
        .unwrap();
    assert_eq!(outcome, TopOutcome::Released { shareless: true });
    assert!(cc.is_idle());
}

/// Tests that unknown requestors are rejected.
#[test]
fn test_unknown_requestor() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::S);
    assert_eq!(
        top.handle_request(&event("Z", Command::GetS), &line, &mut cc, false, &mut stats),
        Err(CoherenceError::UnknownRequestor("Z".to_string()))
    );
}

/// Tests that an InvAck while nothing is outstanding is stale.
#[test]
fn test_stale_inv_ack() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (_, mut cc) = create_line(LineState::S);
    cc.add_sharer(0).unwrap();
    assert!(matches!(
        top.handle_inv_ack(&event("A", Command::InvAck), &mut cc, &mut stats),
        Err(CoherenceError::StaleAck { .. })
    ));
}

/// Tests that an invalidation from below reaches every sharer and the owner.
#[test]
fn test_invalidate_from_below() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (_, mut cc) = create_line(LineState::S);
    cc.add_sharer(0).unwrap();
    cc.add_sharer(2).unwrap();

    assert!(top
        .handle_invalidate(&event("memory", Command::Inv), &mut cc, &mut stats)
        .unwrap());
    assert_eq!(cc.ack_count(), 2);
    let dsts: Vec<String> = drain(&mut top)
        .iter()
        .map(|m| m.destination().to_string())
        .collect();
    assert_eq!(dsts, vec!["A".to_string(), "C".to_string()]);

    let (_, mut idle) = create_line(LineState::S);
    assert!(!top
        .handle_invalidate(&event("memory", Command::Inv), &mut idle, &mut stats)
        .unwrap());
}

/// Tests that a downgrade from below targets only the owner.
#[test]
fn test_downgrade_from_below() {
    let mut top = create_top(Protocol::Moesi);
    let mut stats = CoherenceStats::default();
    let (line, mut cc) = create_line(LineState::M);
    cc.set_owner(1).unwrap();

    assert!(top
        .handle_invalidate(&event("memory", Command::FetchInvX), &mut cc, &mut stats)
        .unwrap());
    let out = drain(&mut top);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].cmd(), Command::InvX);
    assert_eq!(out[0].destination(), "B");

    // A MOESI owner answers with its data instead of a writeback.
    let resp = event("B", Command::FetchResp).with_payload(vec![2; 64]);
    top.handle_request(&resp, &line, &mut cc, false, &mut stats)
        .unwrap();
    assert!(cc.is_valid());
    assert!(cc.is_sharer(1));

    let (_, mut shared) = create_line(LineState::S);
    shared.add_sharer(0).unwrap();
    assert!(!top
        .handle_invalidate(&event("memory", Command::InvX), &mut shared, &mut stats)
        .unwrap());
}

/// Tests that an eviction invalidates every upstream copy and waits.
#[test]
fn test_eviction_invalidates_upstream() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (_, mut cc) = create_line(LineState::S);
    cc.add_sharer(1).unwrap();

    assert!(top.handle_eviction(&mut cc, &mut stats).unwrap());
    assert_eq!(cc.state(), CcState::InvAcking);
    let remaining = top
        .handle_inv_ack(&event("B", Command::InvAck), &mut cc, &mut stats)
        .unwrap();
    assert_eq!(remaining, 0);
    assert!(cc.is_idle());
    assert!(!top.handle_eviction(&mut cc, &mut stats).unwrap());
}

/// Tests that send_invalidates skips the excluded requestor.
#[test]
fn test_send_invalidates_skips_requestor() {
    let mut top = create_top(Protocol::Mesi);
    let mut stats = CoherenceStats::default();
    let (_, mut cc) = create_line(LineState::S);
    cc.add_sharer(0).unwrap();
    cc.add_sharer(1).unwrap();

    let sent = top.send_invalidates(&cc, LineAddr::new(LINE, 64), Some(1), true, &mut stats);
    assert_eq!(sent, 1);
    assert_eq!(top.send_invalidate_x(&cc, LineAddr::new(LINE, 64), &mut stats), 0);
    let out = drain(&mut top);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].destination(), "A");
}
