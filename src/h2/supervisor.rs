//! Connection lifecycle bookkeeping shared by both roles
//!
//! [`HealthCheck`] decides when to probe a quiet connection with PING and
//! when an unanswered probe means the connection is gone. [`IdleTimer`]
//! tracks how long a connection has carried no streams.
//! [`ShutdownState`] records how far a graceful or immediate shutdown has
//! progressed.

use rand::RngCore;
use std::time::{Duration, Instant};

/// What the owner of a connection should do about its health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// Nothing to do right now
    Healthy,
    /// Send a PING with this payload
    SendPing([u8; 8]),
    /// The outstanding PING was not answered in time
    Dead,
}

/// Read-idle PING probing
#[derive(Debug, Clone)]
pub struct HealthCheck {
    read_idle: Option<Duration>,
    ping_timeout: Duration,
    last_read: Instant,
    outstanding: Option<([u8; 8], Instant)>,
}

/// Random opaque payload for a PING
pub fn ping_payload() -> [u8; 8] {
    let mut data = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

impl HealthCheck {
    pub fn new(read_idle: Option<Duration>, ping_timeout: Duration, now: Instant) -> Self {
        HealthCheck {
            read_idle,
            ping_timeout,
            last_read: now,
            outstanding: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.read_idle.is_some()
    }

    /// Any frame arrived
    pub fn frame_read(&mut self, now: Instant) {
        self.last_read = now;
    }

    /// A PING ACK arrived; returns true if it answered our probe
    pub fn ping_acked(&mut self, data: &[u8; 8]) -> bool {
        match self.outstanding {
            Some((sent, _)) if &sent == data => {
                self.outstanding = None;
                true
            }
            _ => false,
        }
    }

    /// Decide what to do at `now`
    pub fn poll(&mut self, now: Instant) -> HealthAction {
        let Some(read_idle) = self.read_idle else {
            return HealthAction::Healthy;
        };
        if let Some((_, sent_at)) = self.outstanding {
            if now.saturating_duration_since(sent_at) >= self.ping_timeout {
                return HealthAction::Dead;
            }
            return HealthAction::Healthy;
        }
        if now.saturating_duration_since(self.last_read) >= read_idle {
            let data = ping_payload();
            self.outstanding = Some((data, now));
            return HealthAction::SendPing(data);
        }
        HealthAction::Healthy
    }

    /// When `poll` next needs to run
    pub fn next_deadline(&self) -> Option<Instant> {
        let read_idle = self.read_idle?;
        Some(match self.outstanding {
            Some((_, sent_at)) => sent_at + self.ping_timeout,
            None => self.last_read + read_idle,
        })
    }
}

/// Time spent with zero open streams
#[derive(Debug, Clone, Copy)]
pub struct IdleTimer {
    timeout: Option<Duration>,
    idle_since: Option<Instant>,
}

impl IdleTimer {
    /// A new connection starts idle
    pub fn new(timeout: Option<Duration>, now: Instant) -> Self {
        IdleTimer {
            timeout,
            idle_since: Some(now),
        }
    }

    pub fn set_busy(&mut self) {
        self.idle_since = None;
    }

    pub fn set_idle(&mut self, now: Instant) {
        if self.idle_since.is_none() {
            self.idle_since = Some(now);
        }
    }

    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }

    pub fn deadline(&self) -> Option<Instant> {
        Some(self.idle_since? + self.timeout?)
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline().map_or(false, |deadline| now >= deadline)
    }
}

/// Shutdown progress of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    /// GOAWAY(NO_ERROR) sent; existing streams may finish until `deadline`
    Draining { deadline: Option<Instant> },
    /// Error GOAWAY sent; the transport closes at `close_at`
    Aborting { close_at: Instant },
    Closed,
}

impl ShutdownState {
    pub fn is_running(&self) -> bool {
        matches!(self, ShutdownState::Running)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ShutdownState::Closed)
    }

    /// Start draining unless already further along
    ///
    /// Returns true on the transition.
    pub fn begin_drain(&mut self, deadline: Option<Instant>) -> bool {
        if self.is_running() {
            *self = ShutdownState::Draining { deadline };
            return true;
        }
        false
    }

    /// Start an abrupt close unless already aborting or closed
    pub fn begin_abort(&mut self, close_at: Instant) -> bool {
        match self {
            ShutdownState::Running | ShutdownState::Draining { .. } => {
                *self = ShutdownState::Aborting { close_at };
                true
            }
            _ => false,
        }
    }

    /// Point in time at which the transport must be closed
    pub fn close_deadline(&self) -> Option<Instant> {
        match self {
            ShutdownState::Draining { deadline } => *deadline,
            ShutdownState::Aborting { close_at } => Some(*close_at),
            _ => None,
        }
    }
}

/// Earliest of a set of optional deadlines
pub fn earliest(deadlines: &[Option<Instant>]) -> Option<Instant> {
    deadlines.iter().flatten().min().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_disabled() {
        let now = Instant::now();
        let mut health = HealthCheck::new(None, Duration::from_secs(1), now);
        assert_eq!(health.poll(now + Duration::from_secs(100)), HealthAction::Healthy);
        assert_eq!(health.next_deadline(), None);
    }

    #[test]
    fn test_ping_after_read_idle_then_dead() {
        let now = Instant::now();
        let idle = Duration::from_secs(10);
        let mut health = HealthCheck::new(Some(idle), Duration::from_secs(2), now);

        assert_eq!(health.poll(now + Duration::from_secs(5)), HealthAction::Healthy);
        let data = match health.poll(now + idle) {
            HealthAction::SendPing(data) => data,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(health.poll(now + idle + Duration::from_secs(1)), HealthAction::Healthy);
        assert_eq!(health.poll(now + idle + Duration::from_secs(2)), HealthAction::Dead);
        assert!(health.ping_acked(&data));
    }

    #[test]
    fn test_ack_clears_probe() {
        let now = Instant::now();
        let mut health = HealthCheck::new(Some(Duration::from_secs(1)), Duration::from_secs(1), now);
        let later = now + Duration::from_secs(1);
        let HealthAction::SendPing(data) = health.poll(later) else {
            panic!("expected a probe");
        };
        assert!(!health.ping_acked(&[0xaa; 8]));
        assert!(health.ping_acked(&data));
        health.frame_read(later);
        assert_eq!(health.poll(later), HealthAction::Healthy);
    }

    #[test]
    fn test_idle_timer() {
        let now = Instant::now();
        let mut idle = IdleTimer::new(Some(Duration::from_secs(5)), now);
        assert!(!idle.expired(now + Duration::from_secs(4)));
        assert!(idle.expired(now + Duration::from_secs(5)));

        idle.set_busy();
        assert!(!idle.expired(now + Duration::from_secs(60)));
        idle.set_idle(now + Duration::from_secs(60));
        assert_eq!(idle.deadline(), Some(now + Duration::from_secs(65)));
    }

    #[test]
    fn test_shutdown_transitions() {
        let now = Instant::now();
        let mut state = ShutdownState::Running;
        assert!(state.begin_drain(Some(now)));
        assert!(!state.begin_drain(None));
        assert_eq!(state.close_deadline(), Some(now));

        assert!(state.begin_abort(now));
        assert!(!state.begin_abort(now));
        state = ShutdownState::Closed;
        assert!(!state.begin_drain(None));
        assert!(state.is_closed());
    }

    #[test]
    fn test_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(earliest(&[None, Some(later), Some(now)]), Some(now));
        assert_eq!(earliest(&[None, None]), None);
    }
}
