use super::{ScoringContext, ScoringStrategy, StrategyKind};
use crate::schema::Table;
use crate::text::tokenize;

/// Approximate string matching of the query against table, column and
/// index names. Ignores chunk text and vectors entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuzzyStrategy;

impl FuzzyStrategy {
    /// Best match between `query` and the names of `table`, in `[0, 1]`
    #[inline]
    pub fn score_table(query: &str, table: &Table) -> f32 {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return 0.0;
        }
        let query = query_tokens.join(" ");

        let mut names: Vec<String> = Vec::with_capacity(table.columns.len() + 2);
        names.push(normalize(&table.name));
        // table name followed by its index names, matched as one string
        let mut searchable = vec![table.name.as_str()];
        searchable.extend(table.indices.iter().map(|i| i.name.as_str()));
        names.push(normalize(&searchable.join(" ")));
        names.extend(table.columns.iter().map(|c| normalize(&c.name)));

        let whole = names
            .iter()
            .map(|name| indel_ratio(&query, name))
            .fold(0.0_f32, f32::max);

        let name_tokens: Vec<&str> = names
            .iter()
            .flat_map(|name| name.split(' '))
            .filter(|token| !token.is_empty())
            .collect();
        let per_token = query_tokens
            .iter()
            .map(|token| {
                name_tokens
                    .iter()
                    .map(|name| indel_ratio(token, name))
                    .fold(0.0_f32, f32::max)
            })
            .sum::<f32>()
            / query_tokens.len() as f32;

        whole.max(per_token)
    }
}

impl ScoringStrategy for FuzzyStrategy {
    #[inline]
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fuzzy
    }

    #[inline]
    fn score(&self, ctx: &ScoringContext<'_>, table: &str) -> f32 {
        ctx.corpus()
            .table(table)
            .map_or(0.0, |t| Self::score_table(ctx.query(), t))
    }
}

fn normalize(name: &str) -> String {
    tokenize(name).join(" ")
}

/// Normalized indel similarity: `1 - indel_distance / (|a| + |b|)`.
///
/// The indel distance only allows insertions and deletions, so it equals
/// `|a| + |b| - 2 * lcs(a, b)`.
#[inline]
pub fn indel_ratio(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 0.0;
    }

    let mut previous = vec![0_usize; b.len() + 1];
    let mut current = vec![0_usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            current[j + 1] = if ca == cb {
                previous[j] + 1
            } else {
                previous[j + 1].max(current[j])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }
    let lcs = previous[b.len()];

    let indel = total - 2 * lcs;
    1.0 - indel as f32 / total as f32
}
