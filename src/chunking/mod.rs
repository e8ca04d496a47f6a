#[cfg(test)]
mod tests;

pub mod summarizer;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::schema::Table;
use crate::{Result, SchemaSearchError};

pub use summarizer::{OllamaSummarizer, TextSummarizer};

/// How a table is turned into chunk text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    /// Structured markdown rendering of the table metadata
    Raw,
    /// Natural-language summary produced by a [`TextSummarizer`]
    Summarized,
}

impl fmt::Display for ChunkingStrategy {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Summarized => f.write_str("summarized"),
        }
    }
}

/// Configuration for table chunking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub strategy: ChunkingStrategy,
    /// Token budget per chunk, header included
    pub max_tokens: usize,
    /// Minimum tokens repeated from the previous chunk of the same table
    pub overlap_tokens: usize,
    /// Abort indexing on the first table that cannot be chunked
    pub strict: bool,
    pub show_progress: bool,
    pub summarizer_model: String,
    pub summarizer_timeout_secs: u64,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::Raw,
            max_tokens: 256,
            overlap_tokens: 32,
            strict: false,
            show_progress: false,
            summarizer_model: "llama3.2:latest".to_string(),
            summarizer_timeout_secs: 60,
        }
    }
}

/// A retrievable unit of table text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Content hash of table identifier, text and chunking strategy
    pub id: String,
    /// Identifier of the source table
    pub table: String,
    /// Index of this chunk within its table
    pub position: usize,
    pub text: String,
    pub token_count: usize,
    /// Leading body lines repeated from the previous chunk
    pub overlap_lines: usize,
}

impl Chunk {
    /// Body lines of the chunk, header excluded
    #[inline]
    pub fn body_lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines().skip(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFailure {
    pub table: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ChunkingOutcome {
    pub chunks: Vec<Chunk>,
    pub failures: Vec<TableFailure>,
    /// Summaries used by this run, keyed by [`summary_key`]
    pub summaries: HashMap<String, String>,
}

pub struct Chunker {
    config: ChunkingConfig,
    summarizer: Option<Arc<dyn TextSummarizer>>,
    summary_cache: HashMap<String, String>,
}

struct TableChunks {
    chunks: Vec<Chunk>,
    summary: Option<(String, String)>,
}

impl Chunker {
    #[inline]
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            config,
            summarizer: None,
            summary_cache: HashMap::new(),
        }
    }

    #[inline]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn TextSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Seed previously generated summaries so unchanged tables skip the summarizer
    #[inline]
    pub fn with_summary_cache(mut self, summaries: HashMap<String, String>) -> Self {
        self.summary_cache = summaries;
        self
    }

    #[inline]
    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Identifier of everything that shapes chunk text; part of every chunk id
    #[inline]
    pub fn strategy_id(&self) -> String {
        let mut id = self.config.strategy.to_string();
        if self.config.strategy == ChunkingStrategy::Summarized {
            if let Some(summarizer) = &self.summarizer {
                let _ = write!(id, ":{}", summarizer.id());
            }
        }
        let _ = write!(
            id,
            ":max{}:overlap{}",
            self.config.max_tokens, self.config.overlap_tokens
        );
        id
    }

    /// Chunk every table; tables that fail are excluded and reported unless `strict`
    #[inline]
    pub fn chunk_tables(&self, tables: &[Table]) -> Result<ChunkingOutcome> {
        if self.config.strategy == ChunkingStrategy::Summarized && self.summarizer.is_none() {
            return Err(SchemaSearchError::Config(
                "summarized chunking requires a summarizer".to_string(),
            ));
        }

        let progress = if self.config.show_progress {
            let bar = ProgressBar::new(tables.len() as u64);
            bar.set_style(ProgressStyle::default_bar());
            bar.set_message("chunking");
            bar
        } else {
            ProgressBar::hidden()
        };

        let strategy_id = self.strategy_id();
        let results: Vec<(String, std::result::Result<TableChunks, String>)> = tables
            .par_iter()
            .map(|table| {
                let result = self.chunk_table_inner(table, &strategy_id);
                progress.inc(1);
                (table.id(), result)
            })
            .collect();
        progress.finish_and_clear();

        let mut outcome = ChunkingOutcome::default();
        for (table, result) in results {
            match result {
                Ok(table_chunks) => {
                    outcome.chunks.extend(table_chunks.chunks);
                    if let Some((key, summary)) = table_chunks.summary {
                        outcome.summaries.insert(key, summary);
                    }
                }
                Err(message) => {
                    if self.config.strict {
                        return Err(SchemaSearchError::Chunking { table, message });
                    }
                    warn!("Excluding table {} from the index: {}", table, message);
                    outcome.failures.push(TableFailure { table, message });
                }
            }
        }

        debug!(
            "Chunked {} tables into {} chunks ({} failed, avg {} tokens)",
            tables.len(),
            outcome.chunks.len(),
            outcome.failures.len(),
            outcome.chunks.iter().map(|c| c.token_count).sum::<usize>()
                / outcome.chunks.len().max(1)
        );

        Ok(outcome)
    }

    /// Chunk a single table
    #[inline]
    pub fn chunk_table(&self, table: &Table) -> Result<Vec<Chunk>> {
        self.chunk_table_inner(table, &self.strategy_id())
            .map(|table_chunks| table_chunks.chunks)
            .map_err(|message| SchemaSearchError::Chunking {
                table: table.id(),
                message,
            })
    }

    fn chunk_table_inner(
        &self,
        table: &Table,
        strategy_id: &str,
    ) -> std::result::Result<TableChunks, String> {
        let table_id = table.id();
        let header = format!("# Table: {}", table_id);
        let serialized = render_table(table);

        let (body, summary): (Vec<String>, Option<(String, String)>) = match self.config.strategy {
            ChunkingStrategy::Raw => (
                serialized.lines().skip(1).map(str::to_string).collect(),
                None,
            ),
            ChunkingStrategy::Summarized => {
                let summary = self.summarize(table, &serialized)?;
                let budget = line_budget(&header, self.config.max_tokens);
                (wrap_lines(&summary.1, budget), Some(summary))
            }
        };

        let chunks = pack_lines(&header, &body, self.config.max_tokens, self.config.overlap_tokens)
            .into_iter()
            .enumerate()
            .map(|(position, (lines, overlap_lines))| {
                let mut text = header.clone();
                for line in lines {
                    text.push('\n');
                    text.push_str(line);
                }
                Chunk {
                    id: chunk_id(&table_id, &text, strategy_id),
                    table: table_id.clone(),
                    position,
                    token_count: estimate_token_count(&text),
                    text,
                    overlap_lines,
                }
            })
            .collect();

        Ok(TableChunks { chunks, summary })
    }

    fn summarize(
        &self,
        table: &Table,
        serialized: &str,
    ) -> std::result::Result<(String, String), String> {
        let Some(summarizer) = &self.summarizer else {
            return Err("no summarizer configured".to_string());
        };

        let key = summary_key(&summarizer.id(), serialized);
        if let Some(summary) = self.summary_cache.get(&key) {
            debug!("Reusing cached summary for {}", table.id());
            return Ok((key, summary.clone()));
        }

        let summary = summarizer
            .summarize(table, serialized)
            .map_err(|e| format!("summarizer failed: {:#}", e))?;
        if summary.trim().is_empty() {
            return Err("summarizer returned an empty summary".to_string());
        }
        Ok((key, summary.trim().to_string()))
    }
}

/// Render a table as the markdown-like text that raw chunks are cut from.
/// The first line is always the `# Table:` header.
#[inline]
pub fn render_table(table: &Table) -> String {
    let mut out = format!("# Table: {}\n## Columns\n", table.id());

    for column in &table.columns {
        let _ = write!(
            out,
            "- **{}**: `{}` {}",
            column.name,
            column.data_type,
            if column.nullable { "NULL" } else { "NOT NULL" }
        );
        if table.is_primary_key(&column.name) {
            out.push_str(" [PK]");
        }
        if let Some(default) = &column.default {
            let _ = write!(out, " DEFAULT {}", default);
        }
        for constraint in &column.constraints {
            let _ = write!(out, " {}", constraint);
        }
        out.push('\n');
    }

    if !table.primary_key.is_empty() {
        let _ = writeln!(out, "## Primary Key\n- {}", table.primary_key.join(", "));
    }

    if !table.foreign_keys.is_empty() {
        out.push_str("## Foreign Keys\n");
        for fk in &table.foreign_keys {
            let _ = writeln!(
                out,
                "- `{}` → `{}.{}`",
                fk.constrained_columns.join(", "),
                fk.referred_table,
                fk.referred_columns.join(", ")
            );
        }
    }

    if !table.indices.is_empty() {
        out.push_str("## Indices\n");
        for index in &table.indices {
            let _ = writeln!(
                out,
                "- {}{} ({})",
                if index.unique { "UNIQUE " } else { "" },
                index.name,
                index.columns.join(", ")
            );
        }
    }

    if let Some(comment) = table.comment.as_deref().filter(|c| !c.trim().is_empty()) {
        out.push_str("## Comment\n");
        for line in comment.lines().filter(|l| !l.trim().is_empty()) {
            out.push_str(line.trim());
            out.push('\n');
        }
    }

    out.truncate(out.trim_end().len());
    out
}

#[inline]
pub fn chunk_id(table: &str, text: &str, strategy_id: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(table.as_bytes());
    hasher.update(&[0]);
    hasher.update(text.as_bytes());
    hasher.update(&[0]);
    hasher.update(strategy_id.as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[inline]
pub fn summary_key(summarizer_id: &str, serialized: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(summarizer_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(serialized.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Estimate token count using a simple heuristic
/// This is a rough approximation - actual tokenization would be more accurate
#[inline]
pub fn estimate_token_count(text: &str) -> usize {
    token_weight(text) as usize
}

fn token_weight(text: &str) -> f64 {
    // Rough heuristic: 1 token ≈ 0.75 words for English text
    let word_count = text.split_whitespace().count();
    let punct_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();

    (punct_count as f64).mul_add(0.1, word_count as f64 / 0.75)
}

fn line_budget(header: &str, max_tokens: usize) -> f64 {
    (max_tokens as f64 - token_weight(header)).max(1.0)
}

/// Greedily pack body lines under the budget. Each returned chunk carries
/// the number of leading lines it repeats from its predecessor.
fn pack_lines<'a>(
    header: &str,
    body: &'a [String],
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<(Vec<&'a str>, usize)> {
    let budget = line_budget(header, max_tokens);
    let weights: Vec<f64> = body.iter().map(|line| token_weight(line)).collect();

    let mut packed = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_weight = 0.0;
    let mut overlap = 0;

    for (i, &weight) in weights.iter().enumerate() {
        if current.len() > overlap && current_weight + weight > budget {
            packed.push((current.clone(), overlap));

            let keep = overlap_suffix(&current, &weights, overlap_tokens);
            current.drain(..current.len() - keep);
            current_weight = current.iter().map(|&j| weights[j]).sum();
            overlap = keep;

            // Oversized neighbours can leave no room for the repeated lines
            while overlap > 0 && current_weight + weight > budget {
                current_weight -= weights[current.remove(0)];
                overlap -= 1;
            }
        }
        current.push(i);
        current_weight += weight;
    }

    if current.len() > overlap || packed.is_empty() {
        packed.push((current, overlap));
    }

    packed
        .into_iter()
        .map(|(indices, overlap)| (indices.into_iter().map(|i| body[i].as_str()).collect(), overlap))
        .collect()
}

/// Shortest run of trailing lines worth at least `overlap_tokens`, never the whole chunk
fn overlap_suffix(lines: &[usize], weights: &[f64], overlap_tokens: usize) -> usize {
    if overlap_tokens == 0 || lines.len() < 2 {
        return 0;
    }

    let mut total = 0.0;
    let mut count = 0;
    for &line in lines.iter().rev().take(lines.len() - 1) {
        total += weights[line];
        count += 1;
        if total >= overlap_tokens as f64 {
            break;
        }
    }
    count
}

/// Word-wrap free text so that no single line exceeds the budget
fn wrap_lines(text: &str, budget: f64) -> Vec<String> {
    let mut lines = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if token_weight(line) <= budget {
            lines.push(line.to_string());
            continue;
        }

        let mut current = String::new();
        for word in line.split_whitespace() {
            let candidate_weight = token_weight(&current) + token_weight(word);
            if !current.is_empty() && candidate_weight > budget {
                lines.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        if !current.is_empty() {
            lines.push(current);
        }
    }
    lines
}
