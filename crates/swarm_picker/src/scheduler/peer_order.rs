use std::cmp::Reverse;

use crate::{config::SchedulerConfig, peer::PeerView, type_aliases::PeerHandle};

/// Everything the peer ordering looks at, frozen once per pass. Sorting compares
/// these values only, so inputs changing under our feet can't break the ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerSortKey {
    lan_local: Reverse<bool>,
    receive_rate: Reverse<u64>,
    uploading_to: Reverse<bool>,
    snubbed: bool,
    rate_sampled: bool,
    tie: u64,
    handle: PeerHandle,
}

impl PeerSortKey {
    pub fn new(view: &PeerView, tie: u64) -> Self {
        let s = &view.snapshot;
        Self {
            lan_local: Reverse(s.lan_local),
            receive_rate: Reverse(s.receive_rate),
            uploading_to: Reverse(s.send_rate > 0),
            snubbed: s.snubbed,
            rate_sampled: s.rate_sampled,
            tie,
            handle: view.handle,
        }
    }
}

/// How many requests the peer may have outstanding.
pub fn max_requests(view: &PeerView, config: &SchedulerConfig) -> u32 {
    let s = &view.snapshot;
    if s.snubbed {
        return config.requests_snubbed.max(1);
    }
    if let Some(advertised) = s.advertised_max_requests {
        return advertised.clamp(1, config.requests_max.max(1));
    }
    let base = if s.recently_unchoked {
        config.requests_min_unchoked
    } else {
        config.requests_min
    };
    let by_rate = s.receive_rate / config.requests_slope_bps.max(1);
    let wanted = (base as u64).saturating_add(by_rate).min(u32::MAX as u64) as u32;
    wanted.clamp(base.max(1), config.requests_max.max(base).max(1))
}

/// Batch locality: wait until a good part of the previous batch came back.
pub fn wants_more(view: &PeerView, max_requests: u32, config: &SchedulerConfig) -> bool {
    (view.outstanding as f64) < max_requests as f64 * config.batch_locality
}

/// Ticks to sit out after `consecutive_no_requests` empty passes.
pub fn backoff_ticks(consecutive_no_requests: u32) -> u64 {
    if consecutive_no_requests == 0 {
        0
    } else {
        consecutive_no_requests as u64 + 1
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{haves::PeerHaves, peer::PeerSnapshot};

    fn view(id: u8, snapshot: PeerSnapshot) -> PeerView {
        PeerView {
            handle: PeerHandle::new([127, 0, 0, id].into(), 6881),
            snapshot,
            haves: Arc::new(PeerHaves::empty(1)),
            last_piece: None,
            consecutive_no_requests: 0,
            outstanding: 0,
        }
    }

    #[test]
    fn test_sort_order() {
        let lan = view(
            1,
            PeerSnapshot {
                lan_local: true,
                ..Default::default()
            },
        );
        let fast = view(
            2,
            PeerSnapshot {
                receive_rate: 100_000,
                rate_sampled: true,
                ..Default::default()
            },
        );
        let uploading = view(
            3,
            PeerSnapshot {
                send_rate: 10,
                rate_sampled: true,
                ..Default::default()
            },
        );
        let unsampled = view(4, PeerSnapshot::default());
        let sampled = view(
            5,
            PeerSnapshot {
                rate_sampled: true,
                ..Default::default()
            },
        );
        let snubbed = view(
            6,
            PeerSnapshot {
                snubbed: true,
                ..Default::default()
            },
        );

        let mut peers = [&snubbed, &sampled, &unsampled, &uploading, &fast, &lan];
        peers.sort_by_key(|v| PeerSortKey::new(v, 0));
        let ids: Vec<_> = peers.iter().map(|v| v.handle).collect();
        let expected: Vec<_> = [&lan, &fast, &uploading, &unsampled, &sampled, &snubbed]
            .iter()
            .map(|v| v.handle)
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_max_requests() {
        let cfg = SchedulerConfig::default();
        let v = |snapshot| view(1, snapshot);

        assert_eq!(max_requests(&v(PeerSnapshot::default()), &cfg), 8);
        let unchoked = PeerSnapshot {
            recently_unchoked: true,
            ..Default::default()
        };
        assert_eq!(max_requests(&v(unchoked), &cfg), 2);
        let fast = PeerSnapshot {
            receive_rate: 40 * 4096,
            ..Default::default()
        };
        assert_eq!(max_requests(&v(fast), &cfg), 48);
        let very_fast = PeerSnapshot {
            receive_rate: 100_000_000,
            ..Default::default()
        };
        assert_eq!(max_requests(&v(very_fast), &cfg), 256);
        let snubbed = PeerSnapshot {
            snubbed: true,
            receive_rate: 100_000_000,
            ..Default::default()
        };
        assert_eq!(max_requests(&v(snubbed), &cfg), 2);
        let advertised = PeerSnapshot {
            advertised_max_requests: Some(500),
            ..Default::default()
        };
        assert_eq!(max_requests(&v(advertised), &cfg), 256);
    }

    #[test]
    fn test_batch_locality_and_backoff() {
        let cfg = SchedulerConfig::default();
        let mut v = view(1, PeerSnapshot::default());
        v.outstanding = 4;
        assert!(wants_more(&v, 8, &cfg));
        v.outstanding = 5;
        assert!(!wants_more(&v, 8, &cfg));

        assert_eq!(backoff_ticks(0), 0);
        assert_eq!(backoff_ticks(1), 2);
        assert_eq!(backoff_ticks(8), 9);
    }
}
