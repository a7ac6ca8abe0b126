use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingStage {
    Backbone,
    Semantic,
}

/// Epoch-based choice between the backbone and the semantic optimizer.
///
/// The schedule computes the intended stage, but the selection is overridden
/// to the backbone for every epoch. The semantic optimizer is built and never
/// selected.
#[derive(Debug, Clone, Copy)]
pub struct StageSchedule {
    pub in_sem: usize,
    pub switcher: usize,
    pub has_semantic: bool,
}

impl StageSchedule {
    pub fn new(in_sem: usize, switcher: usize, has_semantic: bool) -> Self {
        Self {
            in_sem,
            switcher: switcher.max(1),
            has_semantic,
        }
    }

    pub fn intended(&self, epoch: usize) -> TrainingStage {
        if epoch < self.in_sem || epoch % self.switcher != 0 || !self.has_semantic {
            TrainingStage::Backbone
        } else {
            TrainingStage::Semantic
        }
    }

    pub fn select(&self, epoch: usize) -> TrainingStage {
        if self.intended(epoch) == TrainingStage::Semantic {
            debug!("Epoch {}: semantic stage overridden, training backbone", epoch);
        }
        TrainingStage::Backbone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semantic_stage_is_never_selected() {
        for in_sem in [0, 1, 5] {
            for switcher in [1, 2, 3] {
                let schedule = StageSchedule::new(in_sem, switcher, true);
                for epoch in 0..200 {
                    assert_eq!(schedule.select(epoch), TrainingStage::Backbone);
                }
            }
        }
    }

    #[test]
    fn test_intended_stage() {
        let schedule = StageSchedule::new(2, 3, true);
        assert_eq!(schedule.intended(0), TrainingStage::Backbone);
        assert_eq!(schedule.intended(3), TrainingStage::Semantic);
        assert_eq!(schedule.intended(4), TrainingStage::Backbone);
        assert_eq!(schedule.intended(6), TrainingStage::Semantic);

        let no_semantic = StageSchedule::new(0, 3, false);
        assert_eq!(no_semantic.intended(3), TrainingStage::Backbone);
    }
}
