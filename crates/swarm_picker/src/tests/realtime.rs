use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

use super::test_util::{FakePeer, Harness, lengths, seeded_config, setup_test_logging};
use crate::{
    Clock, EndGameState, ManualClock, PRIORITY_REALTIME, PeerHaves, RealTimeProvider,
    RequestError, StaticDisk,
};

/// Deadlines a fixed distance from the clock's current time.
struct Playback {
    clock: Arc<ManualClock>,
    pieces: Vec<(u32, Duration)>,
}

impl RealTimeProvider for Playback {
    fn piece_deadlines(&self, total_pieces: u32) -> Vec<Option<Instant>> {
        let now = self.clock.now();
        let mut v = vec![None; total_pieces as usize];
        for (piece, within) in &self.pieces {
            v[*piece as usize] = Some(now + *within);
        }
        v
    }
}

#[test]
fn test_deadline_pieces_go_to_the_fast_peer() {
    setup_test_logging();
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), seeded_config(9));
    let fast = h.add_peer(1, FakePeer::transferring(1024 * 1024), PeerHaves::full(10));
    let slow = h.add_peer(2, FakePeer::transferring(10 * 1024), PeerHaves::full(10));
    h.scheduler.register_real_time_provider(Arc::new(Playback {
        clock: h.clock.clone(),
        pieces: vec![(0, Duration::from_secs(10)), (1, Duration::from_secs(10))],
    }));

    let r = h.scheduler.schedule();
    assert_eq!(r.realtime_requests, 8);
    assert_eq!(h.scheduler.piece_score(0).unwrap(), PRIORITY_REALTIME);

    let fast_reqs = h.peer(fast).take_requests();
    let realtime: Vec<(u32, u32)> = fast_reqs
        .iter()
        .filter(|(_, rt)| *rt)
        .map(|(b, _)| (b.piece_index.get(), b.block_index))
        .collect();
    assert_eq!(realtime.len(), 8);
    assert!(realtime.iter().all(|(p, _)| *p < 2));

    // The normal pass leaves deadline pieces alone.
    let slow_pieces: BTreeSet<u32> = h
        .peer(slow)
        .take_requests()
        .iter()
        .map(|(b, rt)| {
            assert!(!rt);
            b.piece_index.get()
        })
        .collect();
    assert!(slow_pieces.iter().all(|p| *p >= 2));
    assert!(
        fast_reqs
            .iter()
            .filter(|(_, rt)| !rt)
            .all(|(b, _)| b.piece_index.get() >= 2)
    );
    assert_eq!(h.scheduler.stats().requests.realtime, 8);
}

#[test]
fn test_unreachable_deadline_still_requests() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(4)), seeded_config(9));
    let fast = h.add_peer(1, FakePeer::transferring(64 * 1024), PeerHaves::full(4));
    h.add_peer(2, FakePeer::transferring(16 * 1024), PeerHaves::full(4));
    h.scheduler.register_real_time_provider(Arc::new(Playback {
        clock: h.clock.clone(),
        pieces: vec![(3, Duration::from_millis(1))],
    }));

    let r = h.scheduler.schedule();
    assert_eq!(r.realtime_requests, 4);
    let on_fast = h
        .peer(fast)
        .take_requests()
        .iter()
        .filter(|(b, rt)| *rt && b.piece_index.get() == 3)
        .count();
    assert_eq!(on_fast, 4);
}

#[test]
fn test_real_time_provider_disables_end_game_for_good() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), seeded_config(9));
    for id in 1..=3 {
        let conn = FakePeer::transferring(0);
        conn.update(|s| s.advertised_max_requests = Some(64));
        h.add_peer(id, conn, PeerHaves::full(10));
    }
    let id = h.scheduler.register_real_time_provider(Arc::new(Playback {
        clock: h.clock.clone(),
        pieces: vec![],
    }));
    assert!(h.scheduler.unregister_provider(id));
    assert!(!h.scheduler.unregister_provider(id));

    let r = h.scheduler.schedule();
    assert_eq!(r.normal_requests, 40);
    assert_eq!(r.end_game_requests, 0);
    assert_eq!(h.scheduler.end_game_state(), EndGameState::Normal);
}

#[test]
fn test_late_block_races_a_faster_peer() {
    setup_test_logging();
    let mut h = Harness::new(StaticDisk::single_file(lengths(4)), seeded_config(3));
    // One block every 4s, the deadline is 2s away.
    let slow = h.add_peer(1, FakePeer::transferring(4096), PeerHaves::full(4));
    h.scheduler.register_real_time_provider(Arc::new(Playback {
        clock: h.clock.clone(),
        pieces: vec![(0, Duration::from_secs(2))],
    }));

    let r = h.scheduler.schedule();
    assert_eq!(r.realtime_requests, 4);
    let on_slow: Vec<(u32, u32)> = h
        .peer(slow)
        .take_requests()
        .iter()
        .filter(|(_, rt)| *rt)
        .map(|(b, _)| (b.piece_index.get(), b.block_index))
        .collect();
    assert_eq!(on_slow, vec![(0, 0), (0, 1), (0, 2), (0, 3)]);

    // A fast peer shows up but can't take the requests yet: nothing changes for the
    // slow racer, and the failed duplicates are dropped.
    let fast_conn = FakePeer::transferring(1024 * 1024);
    fast_conn.fail_with(Some(RequestError::QueueFull));
    let fast = h.add_peer(2, fast_conn, PeerHaves::full(4));
    let r = h.scheduler.schedule();
    assert_eq!(r.realtime_requests, 0);
    assert!(r.failed_requests >= 4);
    assert!(h.scheduler.outstanding_requests(fast).unwrap().is_empty());
    let slow_outstanding = h.scheduler.outstanding_requests(slow).unwrap();
    assert!((0..4).all(|b| slow_outstanding.contains(&(0, b))));

    // Now it accepts: every late block gets a second, earlier request.
    h.peer(fast).fail_with(None);
    let r = h.scheduler.schedule();
    assert_eq!(r.realtime_requests, 4);
    let dup: Vec<(u32, u32)> = h
        .peer(fast)
        .take_requests()
        .iter()
        .filter(|(_, rt)| *rt)
        .map(|(b, _)| (b.piece_index.get(), b.block_index))
        .collect();
    assert_eq!(dup, vec![(0, 0), (0, 1), (0, 2), (0, 3)]);
    assert_eq!(h.scheduler.stats().requests.realtime, 8);

    // The fast copy wins; the slow one is cancelled.
    h.scheduler.on_block_written(Some(fast), 0, 0).unwrap();
    assert_eq!(h.peer(slow).cancels(), vec![(0, 0)]);
    assert!(h.peer(fast).cancels().is_empty());
    assert!(!h.scheduler.outstanding_requests(slow).unwrap().contains(&(0, 0)));
    assert!(!h.scheduler.outstanding_requests(fast).unwrap().contains(&(0, 0)));
}
