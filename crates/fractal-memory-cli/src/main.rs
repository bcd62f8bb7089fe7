// fmem — command-line front end for the fractal memory engine.
//
// Logging goes to stderr via env_logger (RUST_LOG=info for engine detail);
// results go to stdout, as text or with --json as JSON.

use clap::{CommandFactory, Parser, Subcommand};
use fractal_memory::{
    EmbeddingMode, EngineError, EngineResult, FlushGuard, MemoryConfig, MemoryEngine, MemoryItem, MemoryStats,
    Metadata, SearchOptions,
};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fmem", version, about = "Durable per-agent long-term memory")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true, env = "FMEM_CONFIG")]
    config: Option<PathBuf>,

    /// Memory root directory (overrides config and FMEM_HOME)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Offline hashed embeddings only; never call a remote service
    #[arg(long, global = true)]
    hash: bool,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store one memory
    Add {
        agent: String,
        text: String,
        /// Metadata entry; the value is parsed as JSON when possible
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        meta: Vec<String>,
    },
    /// Generate and store N synthetic memories from a template
    IngestBatch {
        agent: String,
        #[arg(long, default_value_t = 1000)]
        count: usize,
        /// `{i}` is replaced by the item number
        #[arg(long, default_value = "synthetic memory {i}")]
        template: String,
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
    },
    /// Ranked search over an agent's memories
    Search {
        agent: String,
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        decay: Option<f64>,
        /// Blend in TF-IDF with this weight
        #[arg(long)]
        hybrid: Option<f64>,
        #[arg(long)]
        fresh_boost: Option<f64>,
        #[arg(long)]
        min_score: Option<f64>,
        #[arg(long)]
        nprobe: Option<usize>,
    },
    /// Render the prompt-injection block for a query
    Inject {
        agent: String,
        query: String,
        #[arg(long)]
        header: Option<String>,
    },
    /// Rebuild the IVF index
    Reindex {
        agent: String,
        #[arg(long, default_value_t = 64)]
        k: usize,
        #[arg(long, default_value_t = 3)]
        iters: usize,
    },
    /// Record counts and index shape (all agents when none is given)
    Stats { agent: Option<String> },
    /// Outline of an agent's fractal tree
    Tree { agent: String },
    /// Print shell completions
    Completions { shell: clap_complete::Shell },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let result = {
        // Written trees are flushed when this scope ends, success or not.
        let _flush = FlushGuard;
        run(cli).await
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> EngineResult<()> {
    if let Command::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "fmem", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = MemoryConfig::load(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.store.root = Some(root);
    }
    if cli.hash {
        config.embedding.mode = EmbeddingMode::Hash;
    }
    let engine = MemoryEngine::open(config)?;

    match cli.command {
        Command::Add { agent, text, meta } => {
            let metadata = parse_meta(&meta)?;
            let outcome = engine.upsert_item(&agent, MemoryItem::new(text, metadata)).await?;
            if cli.json {
                print_json(&serde_json::json!({
                    "id": outcome.id,
                    "inserted": outcome.inserted,
                    "frequency": outcome.frequency,
                }))?;
            } else if outcome.inserted {
                println!("stored #{}", outcome.id);
            } else {
                println!("#{} already known (seen {} times)", outcome.id, outcome.frequency);
            }
        }

        Command::IngestBatch { agent, count, template, batch_size } => {
            let items: Vec<MemoryItem> = (0..count)
                .map(|i| MemoryItem::new(template.replace("{i}", &i.to_string()), Metadata::new()))
                .collect();
            let batches: Vec<Vec<MemoryItem>> = items.chunks(batch_size.max(1)).map(<[MemoryItem]>::to_vec).collect();
            let started = std::time::Instant::now();
            let outcomes = engine.ingest(&agent, batches).await?;
            let inserted = outcomes.iter().filter(|o| o.inserted).count();
            if cli.json {
                print_json(&serde_json::json!({ "items": outcomes.len(), "inserted": inserted }))?;
            } else {
                println!(
                    "ingested {} item(s), {} new, in {:.2}s",
                    outcomes.len(),
                    inserted,
                    started.elapsed().as_secs_f64()
                );
            }
        }

        Command::Search { agent, query, top_k, decay, hybrid, fresh_boost, min_score, nprobe } => {
            let opts = SearchOptions {
                top_k,
                decay_rate: decay,
                hybrid: hybrid.map(|_| true),
                tfidf_weight: hybrid,
                fresh_boost,
                min_score,
                nprobe,
            };
            let hits = engine.search_memory(&agent, &query, &opts).await?;
            if cli.json {
                print_json(&hits)?;
            } else if hits.is_empty() {
                println!("no matches");
            } else {
                for h in &hits {
                    println!("{:>7.4}  #{:<6} {}  {}", h.score, h.id, format_ts(h.timestamp), h.text);
                }
            }
        }

        Command::Inject { agent, query, header } => {
            let block = engine
                .inject_for_prompt(&agent, &query, &SearchOptions::default(), header.as_deref())
                .await?;
            print!("{}", block);
        }

        Command::Reindex { agent, k, iters } => {
            // One bucket is a linear scan; insist on a real partition.
            let summary = engine.reindex(&agent, k.max(2), iters.max(1)).await?;
            match (summary, cli.json) {
                (Some(s), true) => print_json(&s)?,
                (Some(s), false) => println!(
                    "indexed {} vector(s): dim={} K={} largest bucket={}",
                    s.count,
                    s.dim,
                    s.clusters,
                    s.bucket_sizes.iter().max().copied().unwrap_or(0)
                ),
                (None, _) => println!("no memories for '{}'", agent),
            }
        }

        Command::Stats { agent } => {
            let agents = match agent {
                Some(a) => vec![a],
                None => engine.agents()?,
            };
            let stats: Vec<MemoryStats> = agents.iter().map(|a| engine.stats(a)).collect::<EngineResult<_>>()?;
            if cli.json {
                print_json(&stats)?;
            } else {
                for s in &stats {
                    print_stats(s);
                }
            }
        }

        Command::Tree { agent } => {
            let outline = engine.outline(&agent)?;
            if outline.is_empty() {
                println!("(empty)");
            } else {
                print!("{}", outline);
            }
        }

        Command::Completions { .. } => {}
    }
    Ok(())
}

fn parse_meta(pairs: &[String]) -> EngineResult<Metadata> {
    let mut meta = Metadata::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| EngineError::Config(format!("--meta expects KEY=VALUE, got '{}'", pair)))?;
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        meta.insert(key.to_string(), value);
    }
    Ok(meta)
}

fn print_json<T: serde::Serialize>(value: &T) -> EngineResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_stats(s: &MemoryStats) {
    println!("{}: {} record(s), {} total writes", s.agent_id, s.records, s.total_frequency);
    match &s.index {
        Some(idx) => {
            let empty = idx.bucket_sizes.iter().filter(|n| **n == 0).count();
            println!(
                "  ivf: dim={} K={} count={} built {} ({} empty bucket(s))",
                idx.dim,
                idx.clusters,
                idx.count,
                format_ts(idx.built_at),
                empty
            );
        }
        None => println!("  ivf: none (exact scan)"),
    }
}

fn format_ts(ts: f64) -> String {
    chrono::DateTime::from_timestamp(ts as i64, 0)
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".into())
}
