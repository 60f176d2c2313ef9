//! History backfill scheduling.
//!
//! The controller watches the viewport and keeps history coverage ahead of
//! the user: missing rows inside the viewport plus a prefetch margin in the
//! scroll direction are claimed as `pending` and requested in bounded
//! windows. At most `max_inflight` requests are outstanding; replies clear
//! their entry and, when the host signals `more`, the remaining window is
//! immediately reconsidered. A reply that never arrives times out, reverting
//! its rows to `missing` so they can be re-requested.

use std::time::{Duration, Instant};

use super::grid::GridStore;
use crate::config::ClientConfig;
use crate::protocol::ClientFrame;

// Ranges the host answered with no content are left alone for a while
// instead of being re-requested in a tight loop.
const EMPTY_RANGE_COOLDOWN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct InflightRequest {
    id: u64,
    start: u64,
    end: u64,
    issued_at: Instant,
}

#[derive(Debug, Clone)]
struct EmptyRange {
    start: u64,
    end: u64,
    recorded_at: Instant,
}

pub struct BackfillController {
    max_inflight: usize,
    max_rows: u32,
    debounce: Duration,
    prefetch_ahead: Option<u32>,
    response_timeout: Duration,
    next_request_id: u64,
    inflight: Vec<InflightRequest>,
    empty_ranges: Vec<EmptyRange>,
    last_viewport_change: Option<Instant>,
    last_viewport_top: Option<u64>,
    scrolling_up: bool,
}

impl BackfillController {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            max_inflight: config.max_inflight,
            max_rows: config.max_backfill_rows,
            debounce: config.request_debounce,
            prefetch_ahead: config.prefetch_ahead,
            response_timeout: config.backfill_response_timeout,
            next_request_id: 1,
            inflight: Vec::new(),
            empty_ranges: Vec::new(),
            last_viewport_change: None,
            last_viewport_top: None,
            scrolling_up: true,
        }
    }

    pub fn reset(&mut self) {
        self.next_request_id = 1;
        self.inflight.clear();
        self.empty_ranges.clear();
        self.last_viewport_change = None;
        self.last_viewport_top = None;
        self.scrolling_up = true;
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Records a viewport move for debouncing and scroll-direction tracking.
    pub fn note_viewport(&mut self, top: u64, now: Instant) {
        if let Some(previous) = self.last_viewport_top {
            if top != previous {
                self.scrolling_up = top < previous;
            }
        }
        self.last_viewport_top = Some(top);
        self.last_viewport_change = Some(now);
    }

    /// Scans for missing rows and emits up to `max_inflight` requests. Rows
    /// covered by a request are marked `pending` in the store before the
    /// frame is returned, so no window is ever requested twice.
    pub fn poll(
        &mut self,
        store: &mut GridStore,
        subscription: u64,
        now: Instant,
    ) -> Vec<ClientFrame> {
        self.expire(store, now);
        self.prune_empty_ranges(now);

        if let Some(changed_at) = self.last_viewport_change {
            if now.duration_since(changed_at) < self.debounce {
                return Vec::new();
            }
        }
        // Following the live tail: whatever is below stays requestable via
        // inflight entries, but no new forward prefetch is issued.
        if store.follow_tail() {
            return Vec::new();
        }
        let (top, height) = store.viewport();
        if height < 1 {
            return Vec::new();
        }

        let prefetch = self.prefetch_ahead.unwrap_or(height) as u64;
        let (window_start, window_end) = if self.scrolling_up {
            (top.saturating_sub(prefetch), top.saturating_add(height as u64))
        } else {
            (top, top.saturating_add(height as u64 + prefetch))
        };
        let window_start = window_start.max(store.base_row());
        let window_end = window_end.min(store.end_row());

        let mut frames = Vec::new();
        let mut cursor = window_start;
        while self.inflight.len() < self.max_inflight && cursor < window_end {
            let Some((run_start, run_len)) = store.first_missing_run(cursor, window_end) else {
                break;
            };
            let run_end = run_start + run_len as u64;
            if let Some(range) = self.active_empty_range(run_start, run_end) {
                cursor = range.max(run_start + 1);
                continue;
            }
            if self.is_covered(run_start, run_end) {
                cursor = run_end;
                continue;
            }
            let count = run_len.min(self.max_rows).max(1);
            let request_id = self.next_request_id;
            self.next_request_id += 1;
            store.mark_pending(run_start, count);
            self.inflight.push(InflightRequest {
                id: request_id,
                start: run_start,
                end: run_start + count as u64,
                issued_at: now,
            });
            tracing::trace!(
                target = "client::backfill",
                request_id,
                start = run_start,
                count,
                "requesting history backfill"
            );
            frames.push(ClientFrame::RequestBackfill {
                subscription,
                request_id,
                start_row: run_start,
                count,
            });
            cursor = run_start + count as u64;
        }
        frames
    }

    /// Handles a `history_backfill` reply. Returns true when the caller
    /// should poll again immediately (the host has more for this window).
    pub fn on_history_backfill(
        &mut self,
        store: &mut GridStore,
        request_id: u64,
        start_row: u64,
        count: u32,
        more: bool,
        now: Instant,
    ) -> bool {
        let request_range = match self.inflight.iter().position(|req| req.id == request_id) {
            Some(position) => {
                let request = self.inflight.remove(position);
                Some((request.start, request.end))
            }
            None => {
                tracing::debug!(
                    target = "client::backfill",
                    request_id,
                    "reply for unknown backfill request"
                );
                None
            }
        };

        // A reply may cover less than was asked for; everything the request
        // claimed must stop being pending either way.
        let reply_end = start_row.saturating_add(count as u64);
        let (clear_start, clear_end) = match request_range {
            Some((start, end)) => (start.min(start_row), end.max(reply_end)),
            None => (start_row, reply_end),
        };
        let span = clear_end.saturating_sub(clear_start);
        let mut untouched = 0u64;
        for absolute in clear_start..clear_end {
            if !store.is_loaded(absolute) {
                untouched += 1;
            }
        }
        store.mark_missing(clear_start, span as u32);
        // A range the host answered with no content at all is left alone for
        // a while instead of being re-requested immediately.
        if !more && untouched == span && span > 0 {
            self.empty_ranges.push(EmptyRange {
                start: clear_start,
                end: clear_end,
                recorded_at: now,
            });
        }

        if more {
            // Reconsider the remaining window without waiting out the
            // debounce timer.
            self.last_viewport_change = None;
            true
        } else {
            false
        }
    }

    fn expire(&mut self, store: &mut GridStore, now: Instant) {
        let timeout = self.response_timeout;
        let mut expired = Vec::new();
        self.inflight.retain(|req| {
            if now.duration_since(req.issued_at) > timeout {
                expired.push((req.start, req.end));
                false
            } else {
                true
            }
        });
        for (start, end) in expired {
            tracing::debug!(
                target = "client::backfill",
                start,
                end,
                "backfill request timed out; re-marking rows missing"
            );
            store.mark_missing(start, (end - start) as u32);
        }
    }

    fn prune_empty_ranges(&mut self, now: Instant) {
        self.empty_ranges
            .retain(|range| now.duration_since(range.recorded_at) < EMPTY_RANGE_COOLDOWN);
    }

    fn active_empty_range(&self, start: u64, end: u64) -> Option<u64> {
        self.empty_ranges
            .iter()
            .find(|range| range.start < end && start < range.end)
            .map(|range| range.end)
    }

    fn is_covered(&self, start: u64, end: u64) -> bool {
        self.inflight
            .iter()
            .any(|req| req.start < end && start < req.end)
    }
}
