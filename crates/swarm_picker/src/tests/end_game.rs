use std::time::Duration;

use super::test_util::{FakePeer, Harness, lengths, seeded_config, setup_test_logging};
use crate::{EndGameState, PeerHandle, PeerHaves, SchedulerConfig, StaticDisk};

fn deep_queue_seeds(h: &mut Harness, ids: impl IntoIterator<Item = u8>) -> Vec<PeerHandle> {
    ids.into_iter()
        .map(|id| {
            let conn = FakePeer::transferring(0);
            conn.update(|s| s.advertised_max_requests = Some(64));
            h.add_peer(id, conn, PeerHaves::full(10))
        })
        .collect()
}

#[test]
fn test_end_game_duplicates_and_cancels() {
    setup_test_logging();
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), seeded_config(5));
    let peers = deep_queue_seeds(&mut h, 1..=3);

    let r = h.scheduler.schedule();
    // One peer can take the whole transfer; the other two get a copy of every block.
    assert_eq!(r.normal_requests, 40);
    assert_eq!(r.end_game_requests, 80);
    assert_eq!(h.scheduler.end_game_state(), EndGameState::EndGame);
    for p in &peers {
        assert_eq!(h.scheduler.outstanding_requests(*p).unwrap().len(), 40);
        assert_eq!(h.peer(*p).request_count(), 40);
    }

    h.scheduler
        .on_block_written(Some(peers[0]), 0, 0)
        .unwrap();
    assert!(h.peer(peers[0]).cancels().is_empty());
    assert_eq!(h.peer(peers[1]).cancels(), vec![(0, 0)]);
    assert_eq!(h.peer(peers[2]).cancels(), vec![(0, 0)]);
    for p in &peers {
        assert_eq!(h.scheduler.outstanding_requests(*p).unwrap().len(), 39);
    }

    h.deliver_all();
    assert!(h.scheduler.is_complete());
    assert_eq!(h.scheduler.end_game_state(), EndGameState::Normal);

    let stats = h.scheduler.stats();
    assert_eq!(stats.requests.end_game, 80);
    assert_eq!(stats.requests.issued, 120);
    assert!(stats.requests.cancels_sent >= 2);
}

#[test]
fn test_end_game_times_out() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), seeded_config(5));
    deep_queue_seeds(&mut h, 1..=3);
    h.scheduler.schedule();
    assert_eq!(h.scheduler.end_game_state(), EndGameState::EndGame);

    h.tick(Duration::from_secs(60));
    h.scheduler.schedule();
    assert_eq!(h.scheduler.end_game_state(), EndGameState::EndGame);

    h.tick(Duration::from_secs(61));
    h.scheduler.schedule();
    assert_eq!(h.scheduler.end_game_state(), EndGameState::Abandoned);
    let stats = h.scheduler.stats();
    assert_eq!(stats.end_game_queue, 0);
    assert_eq!(stats.end_game_entries, 1);
}

#[test]
fn test_end_game_needs_enough_peers() {
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), seeded_config(5));
    deep_queue_seeds(&mut h, 1..=2);
    let r = h.scheduler.schedule();
    assert_eq!(r.normal_requests, 40);
    assert_eq!(r.end_game_requests, 0);
    assert_eq!(h.scheduler.end_game_state(), EndGameState::Normal);
}

#[test]
fn test_playback_lowers_the_end_game_trigger() {
    let cfg = SchedulerConfig {
        end_game_size_trigger: 1024 * 1024,
        end_game_reduced_trigger: 100 * 1024,
        ..seeded_config(5)
    };

    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), cfg.clone());
    deep_queue_seeds(&mut h, 1..=3);
    h.scheduler.schedule();
    assert_eq!(h.scheduler.end_game_state(), EndGameState::EndGame);

    // 640 KiB left is under the normal trigger but not under the reduced one.
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), cfg);
    deep_queue_seeds(&mut h, 1..=3);
    h.scheduler.set_sequential_ascending_from(0).unwrap();
    h.scheduler.schedule();
    assert_eq!(h.scheduler.end_game_state(), EndGameState::Normal);
}

#[test]
fn test_disabled_end_game_never_starts() {
    let cfg = SchedulerConfig {
        end_game_enabled: false,
        ..seeded_config(5)
    };
    let mut h = Harness::new(StaticDisk::single_file(lengths(10)), cfg);
    deep_queue_seeds(&mut h, 1..=3);
    let r = h.scheduler.schedule();
    assert_eq!(r.end_game_requests, 0);
    assert_eq!(h.scheduler.end_game_state(), EndGameState::Normal);
}
