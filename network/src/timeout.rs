use crate::error::TimeoutError;
use std::time::{Duration, Instant};

/// Idle time before a ping is sent
pub const IDLE_LIMIT: Duration = Duration::from_secs(60);

/// Time allowed for the pong
pub const PONG_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    None,
    SendPing(u64),
}

/// Per-peer keepalive policy.
///
/// At most one ping is outstanding; any received message clears it.
#[derive(Debug)]
pub struct ConnectionTimeoutManager {
    last_activity: Instant,
    outstanding_ping: Option<Instant>,
    idle_limit: Duration,
    pong_timeout: Duration,
}

impl ConnectionTimeoutManager {
    pub fn new(now: Instant) -> Self {
        Self::with_limits(now, IDLE_LIMIT, PONG_TIMEOUT)
    }

    pub fn with_limits(now: Instant, idle_limit: Duration, pong_timeout: Duration) -> Self {
        Self {
            last_activity: now,
            outstanding_ping: None,
            idle_limit,
            pong_timeout,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.last_activity = now;
        self.outstanding_ping = None;
    }

    pub fn ping_outstanding(&self) -> bool {
        self.outstanding_ping.is_some()
    }

    pub fn tick(&mut self, now: Instant) -> Result<TimeoutAction, TimeoutError> {
        if let Some(sent_at) = self.outstanding_ping {
            if now.saturating_duration_since(sent_at) > self.pong_timeout {
                return Err(TimeoutError::Ping);
            }
            return Ok(TimeoutAction::None);
        }

        if now.saturating_duration_since(self.last_activity) > self.idle_limit {
            self.outstanding_ping = Some(now);
            return Ok(TimeoutAction::SendPing(rand::random()));
        }

        Ok(TimeoutAction::None)
    }
}
