use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
    time::Duration,
};

use super::test_util::{
    BLOCK_LEN, CountingTokens, FakePeer, Harness, PIECE_LEN, lengths, peer_addr, seeded_config,
    setup_test_logging,
};
use crate::{
    Error, NOT_NEEDED, PRIORITY_FORCED, PeerHaves, PeerState, PriorityProvider, RequestError,
    SchedulerConfig, Score, StaticDisk, TokenDispenser,
};

fn pieces_of(reqs: &[(picker_core::BlockInfo, bool)]) -> Vec<u32> {
    reqs.iter().map(|(b, _)| b.piece_index.get()).collect()
}

/// Download 10 pieces from 3 seeds, one pass per second, delivering everything
/// between passes. Returns the pieces each peer was asked for on the first pass.
fn download_from_three_seeds(seed: u64) -> Vec<BTreeSet<u32>> {
    let cfg = SchedulerConfig {
        end_game_enabled: false,
        first_last_boost: false,
        ..seeded_config(seed)
    };
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), cfg);
    for id in 1..=3 {
        h.add_seed(id, 0);
    }

    let mut requested = HashSet::new();
    let mut first_pass = Vec::new();
    for pass in 0..50 {
        if h.scheduler.is_complete() {
            break;
        }
        h.scheduler.schedule();
        h.assert_no_duplicate_outstanding();
        for (_, delivered) in h.deliver_all() {
            if pass == 0 {
                first_pass.push(delivered.iter().map(|(p, _)| *p).collect());
            }
            for b in delivered {
                assert!(requested.insert(b), "block {b:?} requested twice");
            }
        }
        h.tick(Duration::from_secs(1));
    }
    assert!(h.scheduler.is_complete());
    assert_eq!(requested.len(), 40);
    first_pass
}

#[test]
fn test_three_seeds_every_block_requested_once() {
    setup_test_logging();
    let first = download_from_three_seeds(42);
    // Default budget of 8 blocks: two whole pieces per peer.
    for pieces in &first {
        assert_eq!(pieces.len(), 2);
    }
    let all: BTreeSet<u32> = first.iter().flatten().copied().collect();
    assert_eq!(all.len(), 6);
}

#[test]
fn test_piece_selection_is_seeded() {
    assert_eq!(download_from_three_seeds(7), download_from_three_seeds(7));

    let distinct: HashSet<Vec<BTreeSet<u32>>> =
        (1..=8).map(download_from_three_seeds).collect();
    assert!(
        distinct.len() > 1,
        "equally rare pieces should not always be picked in the same order"
    );
}

#[test]
fn test_sequential_ascending() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), seeded_config(1));
    let p = h.add_seed(1, 0);
    h.scheduler.set_sequential_ascending_from(0).unwrap();

    let mut started = Vec::new();
    for _ in 0..3 {
        h.scheduler.schedule();
        let reqs = h.peer(p).take_requests();
        for piece in pieces_of(&reqs) {
            if started.last() != Some(&piece) {
                started.push(piece);
            }
        }
        for (block, _) in reqs {
            h.scheduler
                .on_block_written(Some(p), block.piece_index.get(), block.block_index)
                .unwrap();
        }
        for piece in started.iter().copied() {
            let _ = h.scheduler.on_piece_done(piece);
        }
        h.tick(Duration::from_secs(1));
    }
    assert_eq!(&started[..5], &[0, 1, 2, 3, 4]);
}

#[test]
fn test_sequential_descending() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), seeded_config(1));
    let p = h.add_seed(1, 0);
    h.scheduler.set_sequential_descending_from(9).unwrap();
    h.scheduler.schedule();
    assert_eq!(pieces_of(&h.peer(p).take_requests()), vec![9, 9, 9, 9, 8, 8, 8, 8]);

    h.scheduler.clear_sequential();
    assert!(h.scheduler.set_sequential_ascending_from(10).is_err());
}

struct Boost {
    piece: usize,
    delta: Score,
}

impl PriorityProvider for Boost {
    fn piece_priority_deltas(&self, total_pieces: u32) -> Vec<Score> {
        let mut v = vec![0; total_pieces as usize];
        v[self.piece] = self.delta;
        v
    }
}

fn assert_top_score(h: &Harness, piece: u32) {
    let top = h.scheduler.piece_score(piece).unwrap();
    for other in (0..10).filter(|p| *p != piece) {
        let s = h.scheduler.piece_score(other).unwrap();
        assert!(top > s, "piece {piece} ({top}) <= piece {other} ({s})");
    }
}

#[test]
fn test_forced_rare_piece_beats_everything() {
    let l = lengths(10);
    let disk = StaticDisk::new(l, &[5 * PIECE_LEN as u64, 5 * PIECE_LEN as u64]);
    let mut h = Harness::new(disk, seeded_config(3));
    let without_3 = PeerHaves::from_indices(10, (0..10).filter(|p| *p != 3));
    h.add_peer(1, FakePeer::transferring(0), without_3.clone());
    h.add_peer(2, FakePeer::transferring(0), without_3);
    let c = h.add_seed(3, 0);

    h.scheduler.set_force_piece(3, true).unwrap();
    assert!(h.scheduler.is_forced(3).unwrap());
    h.scheduler.schedule();
    assert_eq!(h.scheduler.piece_availability(3).unwrap(), 1);
    assert!(h.scheduler.piece_score(3).unwrap() >= PRIORITY_FORCED);
    assert_top_score(&h, 3);
    assert_eq!(h.peer(c).take_requests()[0].0.piece_index.get(), 3);

    // Higher priority on the other file.
    h.scheduler.set_file_priority(1, 64).unwrap();
    h.tick(Duration::from_secs(1));
    h.scheduler.schedule();
    assert_top_score(&h, 3);

    // Sequential ordering over the other pieces.
    h.scheduler.set_sequential_ascending_from(5).unwrap();
    h.tick(Duration::from_secs(1));
    h.scheduler.schedule();
    assert_top_score(&h, 3);

    // A provider pushing another piece as hard as it can.
    h.scheduler.register_priority_provider(Arc::new(Boost {
        piece: 7,
        delta: Score::MAX / 2,
    }));
    h.tick(Duration::from_secs(1));
    h.scheduler.schedule();
    assert_eq!(h.scheduler.piece_score(7).unwrap(), PRIORITY_FORCED - 1);
    assert_top_score(&h, 3);

    h.scheduler.set_force_piece(3, false).unwrap();
    h.tick(Duration::from_secs(1));
    h.scheduler.schedule();
    assert!(h.scheduler.piece_score(3).unwrap() < PRIORITY_FORCED);
}

#[test]
fn test_availability_follows_transferring_peers() {
    let l = lengths(10);
    let disk = StaticDisk::single_file(l).with_done(l.validate_piece_index(9).unwrap());
    let mut h = Harness::new(disk, seeded_config(1));
    let a = h.add_seed(1, 0);
    h.add_peer(2, FakePeer::transferring(0), PeerHaves::from_indices(10, 0..5));
    let connecting = FakePeer::transferring(0);
    connecting.update(|s| s.state = PeerState::Connecting);
    h.add_peer(3, connecting.clone(), PeerHaves::full(10));

    h.scheduler.schedule();
    let avail = |h: &Harness, p| h.scheduler.piece_availability(p).unwrap();
    assert_eq!(avail(&h, 0), 2);
    assert_eq!(avail(&h, 7), 1);
    assert_eq!(avail(&h, 9), 2);

    connecting.update(|s| s.state = PeerState::Transferring);
    h.tick(Duration::from_secs(1));
    h.scheduler.schedule();
    assert_eq!(avail(&h, 7), 2);

    h.scheduler.remove_peer(a).unwrap();
    h.tick(Duration::from_secs(1));
    h.scheduler.schedule();
    assert_eq!(avail(&h, 7), 1);
    assert_eq!(avail(&h, 0), 2);

    let stats = h.scheduler.stats();
    assert_eq!(stats.availability_drift_corrections, 0);
    assert_eq!(stats.availability.global_max, 2);
}

#[test]
fn test_have_and_bitfield() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), seeded_config(1));
    let p = h.add_peer(1, FakePeer::transferring(0), PeerHaves::empty(10));

    h.scheduler.on_have(p, 4).unwrap();
    h.scheduler.on_have(p, 4).unwrap();
    h.scheduler.schedule();
    assert_eq!(h.scheduler.piece_availability(4).unwrap(), 1);

    h.scheduler.on_bitfield(p, &[0b1000_0000, 0]).unwrap();
    h.tick(Duration::from_secs(1));
    h.scheduler.schedule();
    assert_eq!(h.scheduler.piece_availability(0).unwrap(), 1);
    assert_eq!(h.scheduler.piece_availability(4).unwrap(), 0);

    assert!(matches!(
        h.scheduler.on_have(p, 10),
        Err(Error::InvalidPieceIndex { index: 10, total: 10 })
    ));
    assert!(matches!(
        h.scheduler.on_bitfield(p, &[0]),
        Err(Error::BitfieldLength {
            got: 1,
            expected: 2
        })
    ));
    assert!(matches!(
        h.scheduler.on_have(peer_addr(99), 1),
        Err(Error::UnknownPeer(_))
    ));
    assert!(matches!(
        h.scheduler
            .add_peer(p, FakePeer::transferring(0), None),
        Err(Error::PeerAlreadyRegistered(_))
    ));
}

#[test]
fn test_nothing_needed_is_idle() {
    let l = lengths(4);
    let mut disk = StaticDisk::single_file(l);
    for i in 0..4 {
        disk = disk.with_done(l.validate_piece_index(i).unwrap());
    }
    let mut h = Harness::new(disk, seeded_config(1));
    let p = h.add_seed(1, 0);

    for _ in 0..2 {
        let r = h.scheduler.schedule();
        assert!(r.idle);
        assert_eq!(r.total_requests(), 0);
        h.tick(Duration::from_secs(1));
    }
    assert_eq!(h.peer(p).request_count(), 0);
    assert!(!h.scheduler.is_schedulable());
    assert!(h.scheduler.is_complete());
    let stats = h.scheduler.stats();
    assert_eq!(stats.idle_ticks, 2);
    assert_eq!(stats.requests.issued, 0);
}

#[test]
fn test_skipped_files_are_not_requested() {
    let l = lengths(4);
    let disk = StaticDisk::new(l, &[2 * PIECE_LEN as u64, 2 * PIECE_LEN as u64]);
    let mut h = Harness::new(disk, seeded_config(1));
    let p = h.add_seed(1, 0);
    h.scheduler.set_file_skipped(0, true).unwrap();

    h.scheduler.schedule();
    let pieces: BTreeSet<u32> = pieces_of(&h.peer(p).take_requests()).into_iter().collect();
    assert_eq!(pieces, BTreeSet::from([2, 3]));
    assert_eq!(h.scheduler.piece_score(0).unwrap(), NOT_NEEDED);

    h.scheduler.set_file_skipped(1, true).unwrap();
    h.tick(Duration::from_secs(1));
    assert!(h.scheduler.schedule().idle);
    assert!(h.scheduler.set_file_priority(5, 1).is_err());
}

#[test]
fn test_choked_peer_is_not_asked() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(4)), seeded_config(1));
    let p = h.add_seed(1, 0);
    h.peer(p).update(|s| s.choked = true);
    let r = h.scheduler.schedule();
    assert_eq!(r.peers_considered, 0);
    assert_eq!(h.peer(p).request_count(), 0);

    h.peer(p).update(|s| s.choked = false);
    let r = h.scheduler.schedule();
    assert_eq!(r.normal_requests, 8);
}

#[test]
fn test_request_hint_sets_the_first_block() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), seeded_config(1));
    let p = h.add_seed(1, 0);
    h.scheduler
        .set_global_request_hint(5, BLOCK_LEN, 100)
        .unwrap();
    assert!(h.scheduler.global_request_hint().is_some());
    h.scheduler.schedule();

    let reqs: Vec<(u32, u32)> = h
        .peer(p)
        .take_requests()
        .iter()
        .map(|(b, _)| (b.piece_index.get(), b.block_index))
        .collect();
    assert_eq!(&reqs[..4], &[(5, 1), (5, 2), (5, 3), (5, 0)]);

    assert!(
        h.scheduler
            .set_global_request_hint(5, PIECE_LEN - 10, 100)
            .is_err()
    );
    h.scheduler.clear_global_request_hint();
    assert!(h.scheduler.global_request_hint().is_none());
}

#[test]
fn test_rarest_first_after_startup() {
    let l = lengths(10);
    let mut disk = StaticDisk::new(l, &[5 * PIECE_LEN as u64, 5 * PIECE_LEN as u64])
        .with_file_priority(0, 1);
    for i in 0..4 {
        disk = disk.with_done(l.validate_piece_index(i).unwrap());
    }

    let run = |wait: Duration| {
        let mut h = Harness::new(disk.clone(), seeded_config(1));
        let a = h.add_seed(1, 0);
        for id in [2, 3] {
            let choked = FakePeer::transferring(0);
            choked.update(|s| s.choked = true);
            h.add_peer(id, choked, PeerHaves::from_indices(10, (0..10).filter(|p| *p != 7)));
        }
        h.tick(wait);
        h.scheduler.schedule();
        h.peer(a).take_requests()[0].0.piece_index.get()
    };

    // Startup: the highest score wins.
    assert_eq!(run(Duration::ZERO), 4);
    // Enough pieces done and past the grace period: the rarest piece wins.
    assert_eq!(run(Duration::from_secs(11)), 7);
}

#[test]
fn test_reconfigure_changes_budgets() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), seeded_config(1));
    h.add_seed(1, 0);
    h.scheduler.reconfigure(SchedulerConfig {
        requests_min: 3,
        ..seeded_config(1)
    });
    assert_eq!(h.scheduler.config().requests_min, 3);
    let r = h.scheduler.schedule();
    assert_eq!(r.normal_requests, 3);
    assert_eq!(h.scheduler.stats().config_version, 1);
}

#[test]
fn test_failed_sends_are_rolled_back() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), seeded_config(1));
    let bad = h.add_seed(1, 0);
    let good = h.add_seed(2, 0);
    h.peer(bad).fail_with(Some(RequestError::QueueFull));

    let r = h.scheduler.schedule();
    assert_eq!(r.failed_requests, 8);
    assert_eq!(r.normal_requests, 8);
    assert!(h.scheduler.outstanding_requests(bad).unwrap().is_empty());
    assert_eq!(h.scheduler.outstanding_requests(good).unwrap().len(), 8);

    h.peer(bad).fail_with(None);
    h.tick(Duration::from_secs(1));
    let r = h.scheduler.schedule();
    assert_eq!(r.normal_requests, 8);
    assert_eq!(h.assert_no_duplicate_outstanding().len(), 16);
    assert_eq!(h.scheduler.stats().requests.failed, 8);
}

#[test]
fn test_rejected_request_can_be_claimed_again() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(1)), seeded_config(1));
    let a = h.add_seed(1, 0);
    h.scheduler.schedule();
    assert_eq!(
        h.scheduler.outstanding_requests(a).unwrap(),
        vec![(0, 0), (0, 1), (0, 2), (0, 3)]
    );
    h.peer(a).take_requests();

    h.scheduler.on_request_rejected(a, 0, 2).unwrap();
    assert_eq!(h.scheduler.outstanding_requests(a).unwrap().len(), 3);
    h.peer(a).update(|s| s.choked = true);
    let b = h.add_seed(2, 0);
    h.tick(Duration::from_secs(1));
    h.scheduler.schedule();
    assert_eq!(h.scheduler.outstanding_requests(b).unwrap(), vec![(0, 2)]);
    assert_eq!(h.scheduler.stats().requests.rejected, 1);
}

#[test]
fn test_failed_piece_is_downloaded_again() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(1)), seeded_config(1));
    let p = h.add_seed(1, 0);
    h.scheduler.schedule();
    for (block, _) in h.peer(p).take_requests() {
        h.scheduler
            .on_block_written(Some(p), 0, block.block_index)
            .unwrap();
    }

    h.scheduler.on_piece_failed(0).unwrap();
    h.tick(Duration::from_secs(1));
    let r = h.scheduler.schedule();
    assert_eq!(r.normal_requests, 4);
    assert_eq!(h.scheduler.stats().pieces_failed, 1);

    for (block, _) in h.peer(p).take_requests() {
        h.scheduler
            .on_block_written(Some(p), 0, block.block_index)
            .unwrap();
    }
    assert!(h.scheduler.on_piece_done(0).unwrap());
    assert!(!h.scheduler.on_piece_done(0).unwrap());
    assert!(h.scheduler.is_complete());
}

#[test]
fn test_tokens_pace_remote_peers_only() {
    let tokens = Arc::new(CountingTokens::default());
    tokens
        .available
        .store(3 * BLOCK_LEN as u64, std::sync::atomic::Ordering::Relaxed);
    let mut h = Harness::with_tokens(
        StaticDisk::single_file(lengths(10)),
        seeded_config(1),
        Some(tokens.clone()),
    );
    let lan = FakePeer::transferring(0);
    lan.update(|s| s.lan_local = true);
    h.add_peer(1, lan.clone(), PeerHaves::full(10));
    let a = h.add_seed(2, 0);
    let b = h.add_seed(3, 0);

    h.scheduler.schedule();
    assert_eq!(lan.request_count(), 8);
    assert_eq!(h.peer(a).request_count() + h.peer(b).request_count(), 3);
    assert_eq!(tokens.peek(), 0);
}

#[test]
fn test_unused_tokens_are_returned() {
    let tokens = Arc::new(CountingTokens::default());
    tokens
        .available
        .store(100 * BLOCK_LEN as u64, std::sync::atomic::Ordering::Relaxed);
    let mut h = Harness::with_tokens(
        StaticDisk::single_file(lengths(1)),
        seeded_config(1),
        Some(tokens.clone()),
    );
    h.add_seed(1, 0);
    let r = h.scheduler.schedule();
    assert_eq!(r.normal_requests, 4);
    // 8 blocks dispensed, 4 used.
    assert_eq!(
        tokens.returned.load(std::sync::atomic::Ordering::Relaxed),
        4 * BLOCK_LEN as u64
    );
    assert_eq!(tokens.peek(), 96 * BLOCK_LEN as u64);
}

#[test]
fn test_peer_backs_off_after_empty_passes() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), seeded_config(1));
    // Has nothing we need.
    let p = h.add_peer(1, FakePeer::transferring(0), PeerHaves::empty(10));
    let considered: Vec<usize> = (0..6)
        .map(|_| h.scheduler.schedule().peers_considered)
        .collect();
    // One pass off after the first empty pass, two after the second.
    assert_eq!(considered, vec![1, 0, 1, 0, 0, 1]);

    h.scheduler.remove_peer(p).unwrap();
    assert!(matches!(
        h.scheduler.remove_peer(p),
        Err(Error::UnknownPeer(_))
    ));
}

#[test]
fn test_stats_serialize() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(4)), seeded_config(1));
    h.add_seed(1, 0);
    h.scheduler.schedule();
    let v = serde_json::to_value(h.scheduler.stats()).unwrap();
    assert_eq!(v["end_game"], "Normal");
    assert_eq!(v["requests"]["issued"], 8);
    assert_eq!(v["total_pieces"], 4);
    assert_eq!(v["active_pieces"], 2);

    let diag = h.scheduler.piece_diagnostic(0).unwrap();
    assert!(diag.starts_with("piece=0 "), "{diag}");
    assert!(h.scheduler.piece_diagnostic(4).is_err());
}

#[test]
fn test_slow_peer_keeps_its_reserved_piece() {
    let l = picker_core::Lengths::new(4 * 262144, 262144, None).unwrap();
    let cfg = SchedulerConfig {
        end_game_enabled: false,
        first_last_boost: false,
        ..seeded_config(4)
    };
    let mut h = Harness::new(StaticDisk::single_file(l), cfg);
    // 4 KiB/s: below the reservation threshold, 9 requests deep.
    let slow = h.add_seed(1, 4096);

    let r = h.scheduler.schedule();
    assert_eq!(r.normal_requests, 9);
    let outstanding = h.scheduler.outstanding_requests(slow).unwrap();
    let piece = outstanding[0].0;
    assert_eq!(outstanding, (0..9).map(|b| (piece, b)).collect::<Vec<_>>());
    assert!(
        h.scheduler
            .piece_diagnostic(piece)
            .unwrap()
            .contains("reserved_by=10.0.0.1:6881")
    );

    let fast = h.add_seed(2, 1024 * 1024);
    h.tick(Duration::from_secs(1));
    let r = h.scheduler.schedule();
    assert_eq!(r.normal_requests, 48);
    let delivered = h.deliver_all();
    let (_, by_fast) = delivered.iter().find(|(p, _)| *p == fast).unwrap();
    assert_eq!(by_fast.len(), 48);
    assert!(by_fast.iter().all(|(p, _)| *p != piece));

    // Only the slow peer finishes it.
    h.tick(Duration::from_secs(1));
    let r = h.scheduler.schedule();
    assert_eq!(r.normal_requests, 7);
    assert!(h.peer(fast).take_requests().is_empty());
    let blocks: Vec<(u32, u32)> = h
        .peer(slow)
        .take_requests()
        .iter()
        .map(|(b, _)| (b.piece_index.get(), b.block_index))
        .collect();
    assert_eq!(blocks, (9..16).map(|b| (piece, b)).collect::<Vec<_>>());
    // Nothing left to reserve for.
    assert!(
        !h.scheduler
            .piece_diagnostic(piece)
            .unwrap()
            .contains("reserved_by")
    );
}
