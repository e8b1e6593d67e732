//! Session registry with a bounded disconnect-recovery window.
//!
//! ```text
//!   open(None) ──► Live ──detach()──► Detached { since, delivered, missed[] }
//!                   ▲                      │
//!                   │ open(token)          │ record(event) appends
//!                   │ within window,       │ while detached
//!                   │ not overflowed,      │
//!                   └── offset>=delivered ◄┤
//!                                          │ window elapsed / overflow / gap
//!                                          ▼
//!                                      forgotten (next open is fresh)
//! ```
//!
//! The registry is plain data; the hub calls it under its lock so that
//! `record` sees events in broadcast order.
//!
//! A detached buffer holds every event after `delivered`, the last seq
//! written to the old socket. A client resuming from an earlier offset
//! lost frames in transit and cannot be served from the buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{BoardEvent, ResumeToken};

enum SessionSlot {
    Live,
    Detached {
        since: Instant,
        delivered: u64,
        missed: VecDeque<Arc<BoardEvent>>,
        overflowed: bool,
    },
}

/// Why a connection was handed a fresh session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshReason {
    NoToken,
    UnknownSession,
    AlreadyLive,
    Expired,
    Overflowed,
    /// The client's offset is older than what the buffer covers
    Gap,
}

/// Outcome of opening a session.
#[derive(Debug)]
pub enum Resumption {
    /// Recovered: replay `events` (all with seq > the client's offset)
    Resumed {
        session: Uuid,
        events: Vec<Arc<BoardEvent>>,
    },
    /// New session: send a full snapshot
    Fresh { session: Uuid, reason: FreshReason },
}

impl Resumption {
    pub fn session(&self) -> Uuid {
        match self {
            Self::Resumed { session, .. } | Self::Fresh { session, .. } => *session,
        }
    }
}

/// Tracks live and recently detached sessions.
pub struct SessionRegistry {
    sessions: HashMap<Uuid, SessionSlot>,
    recovery_window: Duration,
    replay_capacity: usize,
}

impl SessionRegistry {
    pub fn new(recovery_window: Duration, replay_capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            recovery_window,
            replay_capacity,
        }
    }

    /// Open a session for a new connection, recovering `resume` if possible.
    pub fn open(&mut self, resume: Option<ResumeToken>, now: Instant) -> Resumption {
        let Some(token) = resume else {
            return self.fresh(FreshReason::NoToken);
        };

        let reason = match self.sessions.get(&token.session) {
            None => FreshReason::UnknownSession,
            Some(SessionSlot::Live) => FreshReason::AlreadyLive,
            Some(SessionSlot::Detached { overflowed: true, .. }) => FreshReason::Overflowed,
            Some(SessionSlot::Detached { since, .. })
                if now.saturating_duration_since(*since) > self.recovery_window =>
            {
                FreshReason::Expired
            }
            Some(SessionSlot::Detached { delivered, .. }) if token.offset < *delivered => {
                FreshReason::Gap
            }
            Some(SessionSlot::Detached { .. }) => {
                let slot = self.sessions.insert(token.session, SessionSlot::Live);
                let events = match slot {
                    Some(SessionSlot::Detached { missed, .. }) => missed
                        .into_iter()
                        .filter(|e| e.seq() > token.offset)
                        .collect(),
                    _ => Vec::new(),
                };
                return Resumption::Resumed {
                    session: token.session,
                    events,
                };
            }
        };

        // A stale detached slot will never be resumable again.
        if matches!(
            reason,
            FreshReason::Expired | FreshReason::Overflowed | FreshReason::Gap
        ) {
            self.sessions.remove(&token.session);
        }
        self.fresh(reason)
    }

    fn fresh(&mut self, reason: FreshReason) -> Resumption {
        let session = Uuid::new_v4();
        self.sessions.insert(session, SessionSlot::Live);
        Resumption::Fresh { session, reason }
    }

    /// Mark a live session detached.
    ///
    /// `delivered` is the last seq written to the socket. `undelivered` are
    /// events after it already broadcast to the connection but not written;
    /// they seed the replay buffer.
    pub fn detach(
        &mut self,
        session: Uuid,
        delivered: u64,
        undelivered: impl IntoIterator<Item = Arc<BoardEvent>>,
        now: Instant,
    ) {
        let mut missed = VecDeque::new();
        let mut overflowed = false;
        for event in undelivered {
            missed.push_back(event);
            if missed.len() > self.replay_capacity {
                missed.clear();
                overflowed = true;
                break;
            }
        }
        self.sessions.insert(
            session,
            SessionSlot::Detached {
                since: now,
                delivered,
                missed,
                overflowed,
            },
        );
    }

    /// Append a freshly broadcast event to every detached session's buffer.
    pub fn record(&mut self, event: &Arc<BoardEvent>) {
        for slot in self.sessions.values_mut() {
            if let SessionSlot::Detached {
                missed, overflowed, ..
            } = slot
            {
                if *overflowed {
                    continue;
                }
                missed.push_back(event.clone());
                if missed.len() > self.replay_capacity {
                    missed.clear();
                    *overflowed = true;
                }
            }
        }
    }

    /// Forget a session outright (clean close, or events were lost).
    pub fn forget(&mut self, session: &Uuid) -> bool {
        self.sessions.remove(session).is_some()
    }

    /// Drop detached sessions whose window has elapsed. Returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let window = self.recovery_window;
        let before = self.sessions.len();
        self.sessions.retain(|_, slot| match slot {
            SessionSlot::Live => true,
            SessionSlot::Detached { since, .. } => now.saturating_duration_since(*since) <= window,
        });
        before - self.sessions.len()
    }

    pub fn live_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| matches!(s, SessionSlot::Live))
            .count()
    }

    pub fn detached_count(&self) -> usize {
        self.sessions.len() - self.live_count()
    }

    /// Number of events buffered for a detached session.
    pub fn buffered(&self, session: &Uuid) -> Option<usize> {
        match self.sessions.get(session)? {
            SessionSlot::Live => None,
            SessionSlot::Detached { missed, .. } => Some(missed.len()),
        }
    }

    pub fn recovery_window(&self) -> Duration {
        self.recovery_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::Category;
    use crate::protocol::Added;
    use crate::store::EntryId;

    fn event(seq: u64) -> Arc<BoardEvent> {
        Arc::new(BoardEvent::Added(Added {
            seq,
            category: Category::Drs,
            value: seq.to_string(),
            id: EntryId(seq),
            position: 0,
            announce_text: format!("DRS {seq}"),
        }))
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(120), 4)
    }

    fn fresh_session(registry: &mut SessionRegistry, now: Instant) -> Uuid {
        match registry.open(None, now) {
            Resumption::Fresh { session, reason } => {
                assert_eq!(reason, FreshReason::NoToken);
                session
            }
            other => panic!("expected fresh session, got {other:?}"),
        }
    }

    #[test]
    fn test_resume_within_window_replays_missed() {
        let mut reg = registry();
        let t0 = Instant::now();
        let session = fresh_session(&mut reg, t0);

        reg.detach(session, 0, [], t0);
        reg.record(&event(5));
        reg.record(&event(6));
        assert_eq!(reg.buffered(&session), Some(2));

        let token = ResumeToken { session, offset: 4 };
        match reg.open(Some(token), t0 + Duration::from_secs(30)) {
            Resumption::Resumed { session: s, events } => {
                assert_eq!(s, session);
                let seqs: Vec<u64> = events.iter().map(|e| e.seq()).collect();
                assert_eq!(seqs, vec![5, 6]);
            }
            other => panic!("expected resume, got {other:?}"),
        }
        assert_eq!(reg.live_count(), 1);
        assert_eq!(reg.detached_count(), 0);
    }

    #[test]
    fn test_resume_skips_events_client_already_has() {
        let mut reg = registry();
        let t0 = Instant::now();
        let session = fresh_session(&mut reg, t0);

        reg.detach(session, 2, [event(3), event(4)], t0);
        reg.record(&event(5));

        let token = ResumeToken { session, offset: 3 };
        let Resumption::Resumed { events, .. } = reg.open(Some(token), t0) else {
            panic!("expected resume");
        };
        let seqs: Vec<u64> = events.iter().map(|e| e.seq()).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn test_offset_behind_delivered_is_fresh() {
        let mut reg = registry();
        let t0 = Instant::now();
        let session = fresh_session(&mut reg, t0);

        // Seqs 1 and 2 were written to the socket but never arrived.
        reg.detach(session, 2, [], t0);
        reg.record(&event(3));

        let token = ResumeToken { session, offset: 0 };
        match reg.open(Some(token), t0) {
            Resumption::Fresh { session: s, reason } => {
                assert_ne!(s, session);
                assert_eq!(reason, FreshReason::Gap);
            }
            other => panic!("expected fresh, got {other:?}"),
        }
        assert_eq!(reg.detached_count(), 0);
    }

    #[test]
    fn test_offset_at_delivered_resumes() {
        let mut reg = registry();
        let t0 = Instant::now();
        let session = fresh_session(&mut reg, t0);

        reg.detach(session, 2, [], t0);
        reg.record(&event(3));

        let token = ResumeToken { session, offset: 2 };
        let Resumption::Resumed { events, .. } = reg.open(Some(token), t0) else {
            panic!("expected resume");
        };
        let seqs: Vec<u64> = events.iter().map(|e| e.seq()).collect();
        assert_eq!(seqs, vec![3]);
    }

    #[test]
    fn test_expired_window_is_fresh() {
        let mut reg = registry();
        let t0 = Instant::now();
        let session = fresh_session(&mut reg, t0);
        reg.detach(session, 0, [], t0);

        let token = ResumeToken { session, offset: 0 };
        match reg.open(Some(token), t0 + Duration::from_secs(121)) {
            Resumption::Fresh { session: s, reason } => {
                assert_ne!(s, session);
                assert_eq!(reason, FreshReason::Expired);
            }
            other => panic!("expected fresh, got {other:?}"),
        }
        assert_eq!(reg.detached_count(), 0);
    }

    #[test]
    fn test_overflow_is_fresh() {
        let mut reg = registry();
        let t0 = Instant::now();
        let session = fresh_session(&mut reg, t0);
        reg.detach(session, 0, [], t0);
        for seq in 1..=5 {
            reg.record(&event(seq));
        }
        assert_eq!(reg.buffered(&session), Some(0));

        let token = ResumeToken { session, offset: 0 };
        match reg.open(Some(token), t0) {
            Resumption::Fresh { reason, .. } => assert_eq!(reason, FreshReason::Overflowed),
            other => panic!("expected fresh, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_and_live_sessions_are_fresh() {
        let mut reg = registry();
        let t0 = Instant::now();

        let unknown = ResumeToken {
            session: Uuid::new_v4(),
            offset: 0,
        };
        let Resumption::Fresh { reason, .. } = reg.open(Some(unknown), t0) else {
            panic!("expected fresh");
        };
        assert_eq!(reason, FreshReason::UnknownSession);

        let live = fresh_session(&mut reg, t0);
        let token = ResumeToken {
            session: live,
            offset: 0,
        };
        let Resumption::Fresh { session, reason } = reg.open(Some(token), t0) else {
            panic!("expected fresh");
        };
        assert_eq!(reason, FreshReason::AlreadyLive);
        assert_ne!(session, live);
    }

    #[test]
    fn test_live_sessions_do_not_buffer() {
        let mut reg = registry();
        let t0 = Instant::now();
        let session = fresh_session(&mut reg, t0);
        reg.record(&event(1));
        assert_eq!(reg.buffered(&session), None);
    }

    #[test]
    fn test_sweep_drops_only_expired() {
        let mut reg = registry();
        let t0 = Instant::now();
        let old = fresh_session(&mut reg, t0);
        let recent = fresh_session(&mut reg, t0);
        let _live = fresh_session(&mut reg, t0);

        reg.detach(old, 0, [], t0);
        reg.detach(recent, 0, [], t0 + Duration::from_secs(100));

        assert_eq!(reg.sweep(t0 + Duration::from_secs(150)), 1);
        assert_eq!(reg.detached_count(), 1);
        assert_eq!(reg.live_count(), 1);
        assert!(reg.buffered(&recent).is_some());
    }
}
