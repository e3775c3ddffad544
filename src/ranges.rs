//! Bookkeeping of outstanding download requests for one blob.
//!
//! A [`RequestSet`] holds disjoint byte ranges we have asked for. A range is
//! either *unserviced* (we broadcast a query and wait for someone to say
//! they have it) or *serviced* (a peer confirmed it and we asked that peer
//! for the bytes). New interest only queries what is not already covered,
//! and a confirmation turns exactly the not-yet-serviced part of its range
//! into a block request to the confirming peer.

use std::time::{Duration, Instant};

/// Unserviced requests are re-queried after this long.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub start: u64,
    pub finish: u64,
    pub sent_at: Option<Instant>,
    pub serviced_at: Option<Instant>,
}

impl DownloadRequest {
    fn new(start: u64, finish: u64) -> Self {
        Self {
            start,
            finish,
            sent_at: None,
            serviced_at: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.finish.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_serviced(&self) -> bool {
        self.serviced_at.is_some()
    }

    fn overlaps(&self, start: u64, finish: u64) -> bool {
        self.start < finish && start < self.finish
    }

    fn is_due(&self, now: Instant, timeout: Duration) -> bool {
        !self.is_serviced()
            && self
                .sent_at
                .map(|sent| now.saturating_duration_since(sent) >= timeout)
                .unwrap_or(true)
    }
}

/// `[start, finish)` minus every range in `holes`.
fn subtract(start: u64, finish: u64, holes: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut holes: Vec<(u64, u64)> = holes
        .iter()
        .copied()
        .filter(|&(s, f)| s < finish && start < f)
        .collect();
    holes.sort_unstable();

    let mut pieces = Vec::new();
    let mut cursor = start;
    for (s, f) in holes {
        if s > cursor {
            pieces.push((cursor, s.min(finish)));
        }
        cursor = cursor.max(f);
        if cursor >= finish {
            break;
        }
    }
    if cursor < finish {
        pieces.push((cursor, finish));
    }
    pieces
}

#[derive(Debug, Clone)]
pub struct RequestSet {
    requests: Vec<DownloadRequest>,
    timeout: Duration,
}

impl Default for RequestSet {
    fn default() -> Self {
        Self::new(REQUEST_TIMEOUT)
    }
}

impl RequestSet {
    pub fn new(timeout: Duration) -> Self {
        Self {
            requests: Vec::new(),
            timeout,
        }
    }

    pub fn requests(&self) -> &[DownloadRequest] {
        &self.requests
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Register interest in `[start, finish)`. Ranges that need a (re-)query
    /// are passed to `query`, which returns whether the query went out.
    pub fn request<F>(&mut self, start: u64, finish: u64, now: Instant, mut query: F)
    where
        F: FnMut(u64, u64) -> bool,
    {
        if finish <= start {
            return;
        }

        // Unserviced requests inside the new range are absorbed by it
        self.requests
            .retain(|r| r.is_serviced() || !(r.start >= start && r.finish <= finish));

        let covered: Vec<(u64, u64)> = self
            .requests
            .iter()
            .filter(|r| r.overlaps(start, finish))
            .map(|r| (r.start, r.finish))
            .collect();
        for (s, f) in subtract(start, finish, &covered) {
            self.requests.push(DownloadRequest::new(s, f));
        }
        self.requests.sort_by_key(|r| r.start);

        let timeout = self.timeout;
        for request in self.requests.iter_mut() {
            if request.overlaps(start, finish)
                && request.is_due(now, timeout)
                && query(request.start, request.finish)
            {
                request.sent_at = Some(now);
            }
        }
    }

    /// A peer confirmed it has `[start, finish)`. The part not already being
    /// serviced is handed to `fetch` as block requests to that peer.
    pub fn respond<F>(&mut self, start: u64, finish: u64, now: Instant, mut fetch: F)
    where
        F: FnMut(u64, u64) -> bool,
    {
        if finish <= start {
            return;
        }

        let serviced: Vec<(u64, u64)> = self
            .requests
            .iter()
            .filter(|r| r.is_serviced())
            .map(|r| (r.start, r.finish))
            .collect();
        let pieces = subtract(start, finish, &serviced);
        if pieces.is_empty() {
            return;
        }

        // Carve the confirmed pieces out of unserviced requests
        let mut remaining = Vec::with_capacity(self.requests.len());
        for request in self.requests.drain(..) {
            if request.is_serviced() || !pieces.iter().any(|&(s, f)| request.overlaps(s, f)) {
                remaining.push(request);
                continue;
            }
            for (s, f) in subtract(request.start, request.finish, &pieces) {
                remaining.push(DownloadRequest {
                    start: s,
                    finish: f,
                    ..request.clone()
                });
            }
        }
        self.requests = remaining;

        for (s, f) in pieces {
            let mut request = DownloadRequest::new(s, f);
            if fetch(s, f) {
                request.sent_at = Some(now);
                request.serviced_at = Some(now);
            }
            self.requests.push(request);
        }
        self.requests.sort_by_key(|r| r.start);
    }

    /// Bytes `[start, finish)` arrived; forget about them.
    pub fn received(&mut self, start: u64, finish: u64) {
        if finish <= start {
            return;
        }
        let done = [(start, finish)];
        let mut remaining = Vec::with_capacity(self.requests.len());
        for request in self.requests.drain(..) {
            if !request.overlaps(start, finish) {
                remaining.push(request);
                continue;
            }
            for (s, f) in subtract(request.start, request.finish, &done) {
                remaining.push(DownloadRequest {
                    start: s,
                    finish: f,
                    ..request.clone()
                });
            }
        }
        self.requests = remaining;
    }

    /// Serviced requests that made no progress for the timeout go back to
    /// the unserviced pool. Returns how many were reset.
    pub fn expire_serviced(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for request in self.requests.iter_mut() {
            if let Some(serviced) = request.serviced_at {
                if now.saturating_duration_since(serviced) >= self.timeout {
                    request.serviced_at = None;
                    request.sent_at = None;
                    expired += 1;
                }
            }
        }
        expired
    }

    /// Push back the service deadline of requests covering `[start, finish)`
    /// after bytes arrived for them.
    pub fn touch(&mut self, start: u64, finish: u64, now: Instant) {
        for request in self.requests.iter_mut() {
            if request.is_serviced() && request.overlaps(start, finish) {
                request.serviced_at = Some(now);
            }
        }
    }

    /// Query again every unserviced request whose last query went out
    /// longer than the timeout ago, or never went out.
    pub fn requery<F>(&mut self, now: Instant, mut query: F)
    where
        F: FnMut(u64, u64) -> bool,
    {
        let timeout = self.timeout;
        for request in self.requests.iter_mut() {
            if request.is_due(now, timeout) && query(request.start, request.finish) {
                request.sent_at = Some(now);
            }
        }
    }

    /// Outstanding ranges, for re-sending queries to a peer that just came
    /// online.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.requests.iter().map(|r| (r.start, r.finish)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn ranges(set: &RequestSet) -> Vec<(u64, u64, bool)> {
        set.requests()
            .iter()
            .map(|r| (r.start, r.finish, r.is_serviced()))
            .collect()
    }

    fn assert_disjoint(set: &RequestSet) {
        for pair in set.requests().windows(2) {
            assert!(pair[0].finish <= pair[1].start, "overlap in {:?}", set.requests());
        }
        assert!(set.requests().iter().all(|r| !r.is_empty()));
    }

    #[test]
    fn test_overlapping_interest_is_coalesced() {
        let mut set = RequestSet::default();
        let now = Instant::now();
        let mut queried = Vec::new();
        set.request(0, 100, now, |s, f| {
            queried.push((s, f));
            true
        });
        set.request(50, 150, now, |s, f| {
            queried.push((s, f));
            true
        });

        assert_eq!(ranges(&set), vec![(0, 100, false), (100, 150, false)]);
        // Only the uncovered tail was queried the second time
        assert_eq!(queried, vec![(0, 100), (100, 150)]);
        assert_disjoint(&set);
    }

    #[test]
    fn test_serviced_range_is_not_requested_again() {
        let mut set = RequestSet::default();
        let now = Instant::now();
        set.request(0, 100, now, |_, _| true);
        set.respond(0, 100, now, |_, _| true);

        let mut queried = Vec::new();
        set.request(80, 120, now, |s, f| {
            queried.push((s, f));
            true
        });
        assert_eq!(queried, vec![(100, 120)]);
        assert_eq!(ranges(&set), vec![(0, 100, true), (100, 120, false)]);
    }

    #[test]
    fn test_contained_in_serviced_issues_nothing() {
        let mut set = RequestSet::default();
        let now = Instant::now();
        set.respond(0, 100, now, |_, _| true);
        set.request(10, 20, now, |_, _| panic!("must not query"));
        assert_eq!(ranges(&set), vec![(0, 100, true)]);
    }

    #[test]
    fn test_new_interest_absorbs_unserviced() {
        let mut set = RequestSet::default();
        let now = Instant::now();
        set.request(40, 60, now, |_, _| true);
        set.request(0, 100, now, |_, _| true);
        assert_eq!(ranges(&set), vec![(0, 100, false)]);
    }

    #[test]
    fn test_interest_around_serviced_is_split() {
        let mut set = RequestSet::default();
        let now = Instant::now();
        set.respond(40, 60, now, |_, _| true);
        set.request(0, 100, now, |_, _| true);
        assert_eq!(
            ranges(&set),
            vec![(0, 40, false), (40, 60, true), (60, 100, false)]
        );
    }

    #[test]
    fn test_response_splits_unserviced_request() {
        let mut set = RequestSet::default();
        let now = Instant::now();
        set.request(0, 100, now, |_, _| true);

        let mut fetched = Vec::new();
        set.respond(30, 70, now, |s, f| {
            fetched.push((s, f));
            true
        });
        assert_eq!(fetched, vec![(30, 70)]);
        assert_eq!(
            ranges(&set),
            vec![(0, 30, false), (30, 70, true), (70, 100, false)]
        );

        // A second peer confirming everything only gets the gaps
        fetched.clear();
        set.respond(0, 100, now, |s, f| {
            fetched.push((s, f));
            true
        });
        assert_eq!(fetched, vec![(0, 30), (70, 100)]);
        assert_disjoint(&set);
    }

    #[test]
    fn test_empty_ranges_are_discarded() {
        let mut set = RequestSet::default();
        let now = Instant::now();
        set.request(10, 10, now, |_, _| panic!("empty"));
        set.respond(20, 5, now, |_, _| panic!("inverted"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_stale_unserviced_requests_are_requeried() {
        let mut set = RequestSet::new(Duration::from_secs(60));
        let start = Instant::now();
        let mut count = 0;
        set.request(0, 10, start, |_, _| {
            count += 1;
            true
        });
        set.request(0, 10, start + Duration::from_secs(30), |_, _| {
            count += 1;
            true
        });
        assert_eq!(count, 1);
        set.request(0, 10, start + Duration::from_secs(61), |_, _| {
            count += 1;
            true
        });
        assert_eq!(count, 2);
    }

    #[test]
    fn test_failed_query_is_retried_next_time() {
        let mut set = RequestSet::default();
        let now = Instant::now();
        set.request(0, 10, now, |_, _| false);
        let mut retried = false;
        set.request(0, 10, now, |_, _| {
            retried = true;
            true
        });
        assert!(retried);
    }

    #[test]
    fn test_requery_skips_serviced_and_recent() {
        let mut set = RequestSet::new(Duration::from_secs(60));
        let now = Instant::now();
        set.request(0, 10, now, |_, _| true);
        set.request(10, 20, now, |_, _| false);
        set.respond(20, 30, now, |_, _| true);

        let mut asked = Vec::new();
        set.requery(now, |s, f| {
            asked.push((s, f));
            true
        });
        assert_eq!(asked, vec![(10, 20)]);

        asked.clear();
        set.requery(now + Duration::from_secs(61), |s, f| {
            asked.push((s, f));
            true
        });
        assert_eq!(asked, vec![(0, 10), (10, 20)]);
    }

    #[test]
    fn test_received_bytes_shrink_requests() {
        let mut set = RequestSet::default();
        let now = Instant::now();
        set.respond(0, 100, now, |_, _| true);
        set.received(0, 40);
        assert_eq!(ranges(&set), vec![(40, 100, true)]);
        set.received(40, 100);
        assert!(set.is_empty());
    }

    #[test]
    fn test_expire_serviced() {
        let mut set = RequestSet::new(Duration::from_secs(5));
        let now = Instant::now();
        set.respond(0, 10, now, |_, _| true);
        assert_eq!(set.expire_serviced(now + Duration::from_secs(1)), 0);
        assert_eq!(set.expire_serviced(now + Duration::from_secs(6)), 1);
        assert_eq!(ranges(&set), vec![(0, 10, false)]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Request(u64, u64),
        Respond(u64, u64),
        Received(u64, u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        (0u64..3, 0u64..500, 0u64..500).prop_map(|(kind, a, b)| {
            let (s, f) = (a.min(b), a.max(b));
            match kind {
                0 => Op::Request(s, f),
                1 => Op::Respond(s, f),
                _ => Op::Received(s, f),
            }
        })
    }

    proptest! {
        #[test]
        fn prop_requests_stay_disjoint(ops in proptest::collection::vec(op(), 1..40)) {
            let mut set = RequestSet::default();
            let now = Instant::now();
            for op in ops {
                match op {
                    Op::Request(s, f) => set.request(s, f, now, |_, _| true),
                    Op::Respond(s, f) => set.respond(s, f, now, |_, _| true),
                    Op::Received(s, f) => set.received(s, f),
                }
                for pair in set.requests().windows(2) {
                    prop_assert!(pair[0].finish <= pair[1].start);
                }
                prop_assert!(set.requests().iter().all(|r| r.start < r.finish));
            }
        }

        #[test]
        fn prop_interest_is_fully_covered(s in 0u64..1000, len in 1u64..1000, pre in proptest::collection::vec((0u64..2000, 1u64..300), 0..10)) {
            let mut set = RequestSet::default();
            let now = Instant::now();
            for (ps, plen) in pre {
                set.respond(ps, ps + plen, now, |_, _| true);
            }
            set.request(s, s + len, now, |_, _| true);
            let covered: u64 = set
                .requests()
                .iter()
                .map(|r| r.finish.min(s + len).saturating_sub(r.start.max(s)))
                .sum();
            prop_assert_eq!(covered, len);
        }
    }
}
