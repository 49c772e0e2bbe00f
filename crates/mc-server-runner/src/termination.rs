//! Graceful-shutdown state machine.
//!
//! The controller only decides; the supervisor's event loop owns the timers
//! and the child and carries out the returned actions.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    /// Server running, no shutdown requested.
    Idle,
    /// Shutdown announced in-game, waiting for the announce delay.
    AnnounceDelayPending,
    /// Stop command sent, waiting for the server to exit.
    Stopping,
    /// Stop took too long and the server was killed.
    Killed,
}

impl std::fmt::Display for TerminationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::AnnounceDelayPending => write!(f, "announce_delay_pending"),
            Self::Stopping => write!(f, "stopping"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationEvent {
    /// SIGTERM.
    Terminate,
    /// SIGUSR1: stop now, skipping any remaining announce delay.
    Bypass,
    AnnounceElapsed,
    KillElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationAction {
    /// Tell players the server stops after the given delay.
    Announce(Duration),
    ArmAnnounceTimer(Duration),
    CancelAnnounceTimer,
    SendStop,
    ArmKillTimer(Duration),
    Kill,
}

#[derive(Debug)]
pub struct TerminationController {
    state: TerminationState,
    announce_delay: Duration,
    stop_duration: Duration,
}

impl TerminationController {
    pub fn new(announce_delay: Duration, stop_duration: Duration) -> Self {
        Self {
            state: TerminationState::Idle,
            announce_delay,
            stop_duration,
        }
    }

    pub fn state(&self) -> TerminationState {
        self.state
    }

    /// Apply `event` and return what must happen, in order. An empty list
    /// means the event is ignored in the current state.
    pub fn handle(&mut self, event: TerminationEvent) -> Vec<TerminationAction> {
        use TerminationAction as A;
        use TerminationEvent as E;
        use TerminationState as S;

        let mut actions = Vec::new();
        match (self.state, event) {
            (S::Idle, E::Terminate) if !self.announce_delay.is_zero() => {
                self.state = S::AnnounceDelayPending;
                actions.push(A::Announce(self.announce_delay));
                actions.push(A::ArmAnnounceTimer(self.announce_delay));
            }
            (S::Idle, E::Terminate | E::Bypass) => self.enter_stopping(&mut actions),
            (S::AnnounceDelayPending, E::Bypass) => {
                actions.push(A::CancelAnnounceTimer);
                self.enter_stopping(&mut actions);
            }
            (S::AnnounceDelayPending, E::AnnounceElapsed) => self.enter_stopping(&mut actions),
            (S::Stopping, E::KillElapsed) => {
                self.state = S::Killed;
                actions.push(A::Kill);
            }
            _ => {}
        }
        actions
    }

    fn enter_stopping(&mut self, actions: &mut Vec<TerminationAction>) {
        self.state = TerminationState::Stopping;
        actions.push(TerminationAction::SendStop);
        if !self.stop_duration.is_zero() {
            actions.push(TerminationAction::ArmKillTimer(self.stop_duration));
        }
    }
}

/// In-game notice sent before an announced shutdown.
pub fn announcement(delay: Duration) -> String {
    format!(
        "say Server shutting down in {} seconds",
        delay.as_secs_f64().round() as u64
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use TerminationAction as A;
    use TerminationEvent as E;
    use TerminationState as S;

    const DELAY: Duration = Duration::from_secs(10);
    const STOP: Duration = Duration::from_secs(60);

    #[test]
    fn immediate_stop_without_announce_delay() {
        let mut c = TerminationController::new(Duration::ZERO, STOP);
        assert_eq!(c.handle(E::Terminate), vec![A::SendStop, A::ArmKillTimer(STOP)]);
        assert_eq!(c.state(), S::Stopping);
    }

    #[test]
    fn zero_stop_duration_never_arms_kill_timer() {
        let mut c = TerminationController::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(c.handle(E::Terminate), vec![A::SendStop]);

        let mut c = TerminationController::new(DELAY, Duration::ZERO);
        c.handle(E::Terminate);
        assert_eq!(c.handle(E::AnnounceElapsed), vec![A::SendStop]);
    }

    #[test]
    fn announce_then_stop_then_kill() {
        let mut c = TerminationController::new(DELAY, STOP);
        assert_eq!(
            c.handle(E::Terminate),
            vec![A::Announce(DELAY), A::ArmAnnounceTimer(DELAY)]
        );
        assert_eq!(c.state(), S::AnnounceDelayPending);

        assert_eq!(
            c.handle(E::AnnounceElapsed),
            vec![A::SendStop, A::ArmKillTimer(STOP)]
        );
        assert_eq!(c.state(), S::Stopping);

        assert_eq!(c.handle(E::KillElapsed), vec![A::Kill]);
        assert_eq!(c.state(), S::Killed);
    }

    #[test]
    fn kill_happens_at_most_once() {
        let mut c = TerminationController::new(Duration::ZERO, STOP);
        c.handle(E::Terminate);
        assert_eq!(c.handle(E::KillElapsed), vec![A::Kill]);
        assert!(c.handle(E::KillElapsed).is_empty());
        assert!(c.handle(E::Terminate).is_empty());
        assert!(c.handle(E::Bypass).is_empty());
        assert_eq!(c.state(), S::Killed);
    }

    #[test]
    fn bypass_cancels_pending_announce_delay() {
        let mut c = TerminationController::new(DELAY, STOP);
        c.handle(E::Terminate);
        assert_eq!(
            c.handle(E::Bypass),
            vec![A::CancelAnnounceTimer, A::SendStop, A::ArmKillTimer(STOP)]
        );
        assert_eq!(c.state(), S::Stopping);
        assert!(c.handle(E::AnnounceElapsed).is_empty());
    }

    #[test]
    fn bypass_after_announce_elapsed_is_ignored() {
        let mut c = TerminationController::new(DELAY, STOP);
        c.handle(E::Terminate);
        c.handle(E::AnnounceElapsed);
        assert!(c.handle(E::Bypass).is_empty());
        assert_eq!(c.state(), S::Stopping);
    }

    #[test]
    fn bypass_while_idle_stops_immediately() {
        let mut c = TerminationController::new(DELAY, Duration::ZERO);
        assert_eq!(c.handle(E::Bypass), vec![A::SendStop]);
        assert_eq!(c.state(), S::Stopping);
    }

    #[test]
    fn repeated_terminate_is_ignored() {
        let mut c = TerminationController::new(DELAY, STOP);
        c.handle(E::Terminate);
        assert!(c.handle(E::Terminate).is_empty());
        assert_eq!(c.state(), S::AnnounceDelayPending);
        c.handle(E::AnnounceElapsed);
        assert!(c.handle(E::Terminate).is_empty());
    }

    #[test]
    fn stray_timer_events_in_idle_do_nothing() {
        let mut c = TerminationController::new(DELAY, STOP);
        assert!(c.handle(E::AnnounceElapsed).is_empty());
        assert!(c.handle(E::KillElapsed).is_empty());
        assert_eq!(c.state(), S::Idle);
    }

    #[test]
    fn announcement_rounds_to_whole_seconds() {
        assert_eq!(
            announcement(Duration::from_millis(29_600)),
            "say Server shutting down in 30 seconds"
        );
    }
}
