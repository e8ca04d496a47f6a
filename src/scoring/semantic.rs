use super::{Aggregation, ScoringContext, ScoringStrategy, StrategyKind};

/// Vector similarity between the query and a table's chunks
#[derive(Debug, Clone)]
pub struct SemanticStrategy {
    aggregation: Aggregation,
}

impl SemanticStrategy {
    #[inline]
    pub fn new(aggregation: Aggregation) -> Self {
        Self { aggregation }
    }
}

impl ScoringStrategy for SemanticStrategy {
    #[inline]
    fn kind(&self) -> StrategyKind {
        StrategyKind::Semantic
    }

    #[inline]
    fn needs_query_embedding(&self) -> bool {
        true
    }

    #[inline]
    fn score(&self, ctx: &ScoringContext<'_>, table: &str) -> f32 {
        self.aggregation
            .aggregate(
                ctx.corpus()
                    .chunks_of(table)
                    .iter()
                    .filter_map(|&chunk| self.chunk_score(ctx, chunk)),
            )
            .unwrap_or(0.0)
    }

    #[inline]
    fn chunk_score(&self, ctx: &ScoringContext<'_>, chunk: usize) -> Option<f32> {
        let query = ctx.query_vector()?;
        let chunk = ctx.corpus().chunks().get(chunk)?;
        ctx.corpus().embeddings().similarity(query, &chunk.id)
    }
}
