use super::{ScoringContext, ScoringStrategy, StrategyKind};
use crate::{Result, SchemaSearchError};

/// Weighted blend of two strategies: `w * norm(a) + (1 - w) * norm(b)`.
///
/// Each component is min-max normalized over every indexed table for the
/// current query, so a table's hybrid score does not depend on which other
/// tables happen to be candidates.
pub struct HybridStrategy {
    first: Box<dyn ScoringStrategy>,
    second: Box<dyn ScoringStrategy>,
    weight: f32,
}

impl HybridStrategy {
    #[inline]
    pub fn new(
        first: Box<dyn ScoringStrategy>,
        second: Box<dyn ScoringStrategy>,
        weight: f32,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&weight) {
            return Err(SchemaSearchError::invalid_parameter(
                "hybrid_weight",
                format!("{} is outside [0, 1]", weight),
            ));
        }
        if first.kind() == StrategyKind::Hybrid || second.kind() == StrategyKind::Hybrid {
            return Err(SchemaSearchError::Config(
                "hybrid cannot be its own component".to_string(),
            ));
        }
        Ok(Self {
            first,
            second,
            weight,
        })
    }

    #[inline]
    pub fn weight(&self) -> f32 {
        self.weight
    }

    #[inline]
    pub fn components(&self) -> [StrategyKind; 2] {
        [self.first.kind(), self.second.kind()]
    }
}

impl ScoringStrategy for HybridStrategy {
    #[inline]
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hybrid
    }

    #[inline]
    fn needs_query_embedding(&self) -> bool {
        self.first.needs_query_embedding() || self.second.needs_query_embedding()
    }

    #[inline]
    fn score(&self, ctx: &ScoringContext<'_>, table: &str) -> f32 {
        let first = ctx.corpus_scores(self.first.as_ref());
        let second = ctx.corpus_scores(self.second.as_ref());
        self.weight * first.normalized(table) + (1.0 - self.weight) * second.normalized(table)
    }
}
