use clap::{Parser, Subcommand};
use schema_search::commands::{
    ConfigUpdate, clear_cache, configure, index_database, search_database, show_status,
};
use schema_search::config::Config;
use schema_search::{Result, SchemaSearchError, SearchRequest};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schema-search")]
#[command(about = "Natural-language search over relational database schemas")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml and the index cache
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or change configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
        /// Ollama protocol, "http" or "https"
        #[arg(long)]
        ollama_protocol: Option<String>,
        #[arg(long)]
        ollama_host: Option<String>,
        #[arg(long)]
        ollama_port: Option<u16>,
        /// Embedding model name
        #[arg(long)]
        embedding_model: Option<String>,
        #[arg(long)]
        batch_size: Option<u32>,
    },
    /// Index the schema of a SQLite database
    Index {
        /// Path to the SQLite database file
        database: PathBuf,
        /// Recompute every embedding instead of reusing cached ones
        #[arg(long)]
        force: bool,
    },
    /// Search the schema of a SQLite database
    Search {
        /// Natural-language query
        query: String,
        /// Path to the SQLite database file
        #[arg(long)]
        database: PathBuf,
        /// Foreign-key hops to expand results by
        #[arg(long)]
        hops: Option<usize>,
        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,
        /// semantic, bm25, fuzzy or hybrid
        #[arg(long)]
        strategy: Option<String>,
    },
    /// Show the cached index
    Status,
    /// Delete the cached index
    Clear,
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => Config::config_dir().map_err(|e| SchemaSearchError::Config(e.to_string()))?,
    };
    let config = Config::load(&config_dir)?;
    init_tracing(&config.logging.level);

    match cli.command {
        Commands::Config {
            show: _,
            ollama_protocol,
            ollama_host,
            ollama_port,
            embedding_model,
            batch_size,
        } => {
            let update = ConfigUpdate {
                ollama_protocol,
                ollama_host,
                ollama_port,
                embedding_model,
                batch_size,
            };
            configure(config, update)?;
        }
        Commands::Index { database, force } => {
            index_database(config, &database, force).await?;
        }
        Commands::Search {
            query,
            database,
            hops,
            limit,
            strategy,
        } => {
            let mut request = SearchRequest::new(query);
            if let Some(hops) = hops {
                request = request.hops(hops);
            }
            if let Some(limit) = limit {
                request = request.limit(limit);
            }
            if let Some(strategy) = strategy {
                request = request.strategy(strategy);
            }
            search_database(config, &database, request).await?;
        }
        Commands::Status => {
            show_status(&config).await?;
        }
        Commands::Clear => {
            clear_cache(&config).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn index_command() {
        let cli = Cli::try_parse_from(["schema-search", "index", "shop.db", "--force"])
            .expect("index should parse");
        let Commands::Index { database, force } = cli.command else {
            panic!("expected the index command");
        };
        assert_eq!(database, PathBuf::from("shop.db"));
        assert!(force);
        assert!(cli.config_dir.is_none());
    }

    #[test]
    fn search_command_with_overrides() {
        let cli = Cli::try_parse_from([
            "schema-search",
            "search",
            "who placed this order",
            "--database",
            "shop.db",
            "--hops",
            "2",
            "--limit",
            "3",
            "--strategy",
            "bm25",
            "--config-dir",
            "/tmp/schema-search",
        ])
        .expect("search should parse");

        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/schema-search")));
        let Commands::Search {
            query,
            hops,
            limit,
            strategy,
            ..
        } = cli.command
        else {
            panic!("expected the search command");
        };
        assert_eq!(query, "who placed this order");
        assert_eq!(hops, Some(2));
        assert_eq!(limit, Some(3));
        assert_eq!(strategy.as_deref(), Some("bm25"));
    }

    #[test]
    fn search_requires_database() {
        let cli = Cli::try_parse_from(["schema-search", "search", "orders"]);
        let err = cli.err().expect("missing database should be rejected");
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn config_setters() {
        let cli = Cli::try_parse_from(["schema-search", "config", "--ollama-port", "8080"])
            .expect("config should parse");
        let Commands::Config {
            show, ollama_port, ..
        } = cli.command
        else {
            panic!("expected the config command");
        };
        assert!(!show);
        assert_eq!(ollama_port, Some(8080));
    }

    #[test]
    fn status_and_clear_commands() {
        assert!(matches!(
            Cli::try_parse_from(["schema-search", "status"])
                .expect("status should parse")
                .command,
            Commands::Status
        ));
        assert!(matches!(
            Cli::try_parse_from(["schema-search", "clear"])
                .expect("clear should parse")
                .command,
            Commands::Clear
        ));
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["schema-search", "serve"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["schema-search", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
