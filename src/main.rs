//! # Corpus Assistant CLI (`assistant`)
//!
//! The `assistant` binary drives the core from a terminal: index search,
//! fragment retrieval, single questions, an interactive chat, the Q&A
//! history and retrieval evaluation.
//!
//! ## Usage
//!
//! ```bash
//! assistant --settings ./settings.json <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `assistant init` | Create the SQLite index schema |
//! | `assistant search "<query>"` | Ranked lexical hits |
//! | `assistant fragments "<query>"` | Packed RAG fragments |
//! | `assistant ask "<query>"` | One orchestrated turn, streamed to stdout |
//! | `assistant chat` | Interactive session; Ctrl-C stops a generation |
//! | `assistant history` | List Q&A records |
//! | `assistant rate <id> <0-10>` | Rate a Q&A record |
//! | `assistant eval` | Run stored test cases |
//!
//! Logs go to stderr (`RUST_LOG`, default `warn`); answers go to stdout.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use corpus_assistant::config::{self, Settings};
use corpus_assistant::events::{CancelFlag, EventBus};
use corpus_assistant::generator::Generator;
use corpus_assistant::models::normalize_ext;
use corpus_assistant::orchestrator::Orchestrator;
use corpus_assistant::progress::ProgressMode;
use corpus_assistant::rag::{self, RagRetriever};
use corpus_assistant::retriever::{Retriever, RetrieverOptions};
use corpus_assistant::store::Store;
use corpus_assistant::{eval, migrate};

/// Corpus Assistant CLI — questions and answers over a local document archive.
///
/// All commands accept a `--settings` flag pointing to a JSON settings
/// file. A missing file means defaults.
#[derive(Parser)]
#[command(
    name = "assistant",
    about = "Corpus Assistant — ranked index retrieval and local RAG answers over a document archive",
    version
)]
struct Cli {
    /// Path to the settings file (JSON).
    #[arg(long, global = true, default_value = "./settings.json")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index schema. Idempotent.
    Init,

    /// Search the keyword/notes index.
    Search {
        query: String,

        /// Allowed extension (`pdf`, `.docx`). Repeatable.
        #[arg(long = "ext")]
        ext: Vec<String>,

        /// Maximum number of hits (defaults to `top_k`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show the RAG fragments a question would be answered from.
    Fragments {
        query: String,

        /// Number of fragments (defaults to `rag_k`).
        #[arg(long)]
        k: Option<usize>,
    },

    /// Ask one question and stream the answer.
    Ask {
        query: String,

        /// Session extension filter for this question. Repeatable.
        #[arg(long = "ext")]
        ext: Vec<String>,
    },

    /// Interactive session. Type `exit` or send EOF to leave.
    Chat,

    /// List Q&A records, newest first.
    History {
        /// Only records whose query or answer contains this text.
        #[arg(long)]
        filter: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Rate a Q&A record from 0 to 10.
    Rate {
        qa_id: i64,
        rating: i64,
        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Run the stored retrieval test cases and save the results.
    Eval {
        /// Override each case's own top-k.
        #[arg(long)]
        top_k: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = config::load_settings(&cli.settings)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&settings.db_path).await?;
        println!("Index initialized successfully.");
        return Ok(());
    }

    let store = Store::open(&settings.db_path)?;
    let events = EventBus::new();

    match cli.command {
        Commands::Init => {}
        Commands::Search { query, ext, limit } => {
            let filter: BTreeSet<String> = ext.iter().map(|e| normalize_ext(e)).collect();
            let retriever = Retriever::new(
                &store,
                &events,
                RetrieverOptions {
                    note_chars: settings.note_chars,
                    extra_stopwords: vec![settings.assistant_name.clone()],
                },
            );
            let hits = retriever
                .try_search(&query, &filter, limit.unwrap_or(settings.top_k))
                .await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, h) in hits.iter().enumerate() {
                println!("{}. [{:.0}] {}", i + 1, h.score, h.path);
                if !h.keywords.is_empty() {
                    println!("   keywords: {}", h.keywords);
                }
                if !h.note.is_empty() {
                    println!("   note: {}", h.note);
                }
            }
        }
        Commands::Fragments { query, k } => {
            let k = k.unwrap_or(settings.rag_k);
            let rag = RagRetriever::new(settings.resolved_embedding_dir());
            let fragments = rag.fragments(&store, &query, &BTreeSet::new(), k).await?;
            if fragments.is_empty() {
                println!("No fragments.");
            } else {
                println!("{}", rag::pack_fragments(&fragments, k, settings.rag_max_chars));
            }
        }
        Commands::Ask { query, ext } => {
            let generator = load_generator(&settings, &events);
            let mut orch = Orchestrator::new(store, settings, generator, events);
            orch.set_extension_filter(ext.iter().map(|e| normalize_ext(e)).collect());
            let reply = orch.turn(&query, &mut print_chunk).await;
            println!();
            if let Some(notice) = reply.notice {
                eprintln!("{}", notice);
            }
        }
        Commands::Chat => {
            let generator = load_generator(&settings, &events);
            let mut orch = Orchestrator::new(store, settings, generator, events);
            run_chat(&mut orch).await?;
        }
        Commands::History { filter, limit } => {
            let records = store.list_qa(filter.as_deref(), limit).await?;
            if records.is_empty() {
                println!("No history.");
            }
            for r in records {
                let rating = r
                    .rating
                    .map(|n| format!(" rated {}/10", n))
                    .unwrap_or_default();
                println!("#{} {} [{}]{}", r.id, r.ts, r.model, rating);
                println!("  Q: {}", r.query);
                println!("  A: {}", r.answer.lines().next().unwrap_or(""));
            }
        }
        Commands::Rate {
            qa_id,
            rating,
            notes,
        } => {
            store.set_rating(qa_id, rating, &notes).await?;
            println!("Rated #{}: {}/10", qa_id, rating);
        }
        Commands::Eval { top_k } => {
            let cancel = CancelFlag::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });
            let reporter = ProgressMode::default_for_tty().reporter();
            let results = eval::run_with_progress(
                &store,
                &settings,
                &cancel,
                &events,
                reporter.as_ref(),
                top_k,
            )
            .await?;
            let n = results.len().max(1) as f64;
            println!(
                "{} cases  P@k {:.3}  R@k {:.3}  MRR {:.3}",
                results.len(),
                results.iter().map(|r| r.precision_at_k).sum::<f64>() / n,
                results.iter().map(|r| r.recall_at_k).sum::<f64>() / n,
                results.iter().map(|r| r.mrr).sum::<f64>() / n,
            );
        }
    }

    Ok(())
}

fn print_chunk(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

async fn run_chat(orch: &mut Orchestrator) -> Result<()> {
    let cancel = orch.cancel_flag();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit" | "salir") {
            break;
        }
        let reply = orch.turn(line, &mut print_chunk).await;
        println!();
        if let Some(notice) = reply.notice {
            eprintln!("{}", notice);
        }
    }
    Ok(())
}

#[cfg(feature = "llama-cpp")]
fn load_generator(settings: &Settings, events: &EventBus) -> Option<Arc<dyn Generator>> {
    use corpus_assistant::generator::{llama::LlamaGenerator, spawn_warmup};

    let path = settings.model_path.as_ref()?;
    match LlamaGenerator::load(path, settings.effective_ctx(), None) {
        Ok(generator) => {
            let generator: Arc<dyn Generator> = Arc::new(generator);
            if let Err(e) = spawn_warmup(generator.clone(), events.clone()) {
                events.warn("generator", format!("could not start warmup: {}", e));
            }
            Some(generator)
        }
        Err(e) => {
            events.error("generator", format!("model load failed: {}", e));
            None
        }
    }
}

#[cfg(not(feature = "llama-cpp"))]
fn load_generator(settings: &Settings, events: &EventBus) -> Option<Arc<dyn Generator>> {
    if settings.model_path.is_some() {
        events.warn(
            "generator",
            "built without the llama-cpp feature; answering from the index only",
        );
    }
    None
}
