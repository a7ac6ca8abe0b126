use tracing::debug;

use crate::error::{Result, TriageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    BaselineEval,
    TrainingEpoch,
    PeriodicEval,
    Checkpointing,
    Done,
}

impl Phase {
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Initializing, BaselineEval)
                | (BaselineEval, TrainingEpoch)
                | (BaselineEval, Done)
                | (TrainingEpoch, TrainingEpoch)
                | (TrainingEpoch, PeriodicEval)
                | (TrainingEpoch, Done)
                | (PeriodicEval, Checkpointing)
                | (Checkpointing, TrainingEpoch)
                | (Checkpointing, Done)
        )
    }
}

/// Tracks the epoch loop's phase and rejects illegal transitions.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    phase: Phase,
    history: Vec<Phase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            phase: Phase::Initializing,
            history: vec![Phase::Initializing],
        }
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(TriageError::IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        debug!("Phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
        self.history.push(next);
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn history(&self) -> &[Phase] {
        &self.history
    }
}
