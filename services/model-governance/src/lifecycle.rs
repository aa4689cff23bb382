//! Deployment lifecycle state machine.
//!
//! `Searching -> Auditing -> (Promoted | Rejected) -> Active -> {Stable,
//! Drifted} -> Retired`. Rejected and Stable may re-enter Searching;
//! Retired is terminal for the version the lifecycle follows.
//!
//! Tracks how long each phase lasted.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::{GovernanceError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase { Searching, Auditing, Promoted, Rejected, Active, Stable, Drifted, Retired }

impl DeploymentPhase {
    pub fn can_advance_to(self, next: DeploymentPhase) -> bool {
        use DeploymentPhase::*;
        matches!((self, next),
            (Searching, Auditing) | (Searching, Rejected)
            | (Auditing, Promoted) | (Auditing, Rejected)
            | (Rejected, Searching)
            | (Promoted, Active)
            | (Active, Stable) | (Active, Drifted) | (Active, Retired)
            | (Stable, Stable) | (Stable, Drifted) | (Stable, Searching) | (Stable, Retired)
            | (Drifted, Searching) | (Drifted, Retired))
    }

    pub fn is_terminal(self) -> bool { self == DeploymentPhase::Retired }
}

#[derive(Debug)]
pub struct DeploymentLifecycle {
    phase: DeploymentPhase,
    started_at: Instant,
    phase_started_at: Instant,
    phase_durations: Vec<(DeploymentPhase, Duration)>,
}

impl Default for DeploymentLifecycle {
    fn default() -> Self { Self::new() }
}

impl DeploymentLifecycle {
    pub fn new() -> Self {
        let now = Instant::now();
        Self { phase: DeploymentPhase::Searching, started_at: now, phase_started_at: now, phase_durations: Vec::new() }
    }

    pub fn phase(&self) -> DeploymentPhase { self.phase }

    pub fn advance(&mut self, next: DeploymentPhase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(GovernanceError::InvalidInput(format!("illegal lifecycle transition {:?} -> {:?}", self.phase, next)));
        }
        let now = Instant::now();
        self.phase_durations.push((self.phase, now - self.phase_started_at));
        self.phase = next;
        self.phase_started_at = now;
        Ok(())
    }

    pub fn is_serving(&self) -> bool { matches!(self.phase, DeploymentPhase::Active | DeploymentPhase::Stable | DeploymentPhase::Drifted) }
    pub fn elapsed(&self) -> Duration { self.started_at.elapsed() }
    pub fn durations(&self) -> &[(DeploymentPhase, Duration)] { &self.phase_durations }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentPhase::*;

    #[test]
    fn happy_path_to_retirement() {
        let mut lc = DeploymentLifecycle::new();
        for p in [Auditing, Promoted, Active, Stable, Drifted, Retired] { lc.advance(p).unwrap(); }
        assert!(lc.phase().is_terminal());
        assert_eq!(lc.durations().len(), 6);
        assert!(lc.advance(Searching).is_err());
    }

    #[test]
    fn rejected_and_stable_reenter_search() {
        let mut lc = DeploymentLifecycle::new();
        lc.advance(Auditing).unwrap();
        lc.advance(Rejected).unwrap();
        lc.advance(Searching).unwrap();
        assert!(Stable.can_advance_to(Searching));
        assert!(!Promoted.can_advance_to(Retired));
        assert!(lc.advance(Active).is_err());
        assert!(!lc.is_serving());
    }
}
