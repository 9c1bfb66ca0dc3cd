use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use qa_core::{
    default_build_concurrency, evaluate_cases, EngineConfig, EvalCase, HashEmbeddingProvider,
    QaEngine, DEFAULT_DATA_PATH, DEFAULT_EMBEDDING_DIM, DEFAULT_MAX_BACKUPS,
};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_REQUIRED_PASS_RATE: f32 = 0.85;

#[derive(Debug, Parser)]
#[command(name = "qa")]
#[command(about = "Semantic QA matching CLI")]
struct Cli {
    /// Path to the QA corpus JSON file.
    #[arg(long = "data", global = true, env = "QA_DATA_PATH", default_value = DEFAULT_DATA_PATH)]
    data_path: PathBuf,

    /// Width of the hash embedding.
    #[arg(long, global = true, env = "QA_EMBEDDING_DIM", default_value_t = DEFAULT_EMBEDDING_DIM)]
    embedding_dim: usize,

    /// Concurrent embedding calls while building the index. Defaults to the number of CPUs.
    #[arg(long, global = true, env = "QA_BUILD_CONCURRENCY")]
    build_concurrency: Option<usize>,

    /// Directory receiving a copy of the corpus before each save.
    #[arg(long, global = true, env = "QA_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "QA_MAX_BACKUPS", default_value_t = DEFAULT_MAX_BACKUPS)]
    max_backups: usize,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Find the closest QA pair for a question.
    Query {
        #[arg(long)]
        question: String,
        /// Return every answer of the match instead of the primary one.
        #[arg(long, conflicts_with = "top")]
        all_answers: bool,
        /// Return the k best matches as JSON.
        #[arg(long)]
        top: Option<usize>,
    },
    Show {
        #[arg(long)]
        id: String,
    },
    ByCategory {
        #[arg(long)]
        name: String,
    },
    /// Pairs carrying any of the given tags.
    ByTags {
        #[arg(long = "tag", required = true)]
        tags: Vec<String>,
    },
    Categories,
    Tags,
    Stats,
    /// Load and index the corpus without serving anything.
    Validate,
    /// Rewrite the corpus file atomically with recomputed metadata.
    Save,
    Eval {
        #[arg(long)]
        cases: PathBuf,
        #[arg(long, default_value_t = DEFAULT_REQUIRED_PASS_RATE)]
        min_pass_rate: f32,
    },
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig {
        data_path: cli.data_path.clone(),
        build_concurrency: cli
            .build_concurrency
            .unwrap_or_else(default_build_concurrency),
        backup_dir: cli.backup_dir.clone(),
        max_backups: cli.max_backups,
    }
}

fn make_engine(cli: &Cli) -> Result<QaEngine<HashEmbeddingProvider>> {
    let config = engine_config(cli);
    let provider = HashEmbeddingProvider::new(cli.embedding_dim);
    let engine = QaEngine::new(provider, config).context("configure QA engine")?;
    engine.initialize()?;
    Ok(engine)
}

fn read_eval_cases_json(path: &Path) -> Result<Vec<EvalCase>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let cases: Vec<EvalCase> = serde_json::from_reader(file).context("parse eval cases json")?;
    Ok(cases)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let engine = make_engine(&cli)?;

    match &cli.command {
        Commands::Query {
            question,
            all_answers,
            top,
        } => {
            if let Some(k) = top {
                print_json(&engine.find_top_matches(question, *k)?)?;
            } else if *all_answers {
                print_json(&engine.find_best_match_with_all_answers(question)?)?;
            } else {
                match engine.find_best_match(question)? {
                    Some(m) => {
                        println!(
                            "qa_id={} answer_id={} score={:.4} category={} total_answers={}",
                            m.qa_id, m.answer.id, m.score, m.category, m.total_answers
                        );
                        println!("question={}", m.question);
                        println!("answer={}", m.answer.text);
                    }
                    None => println!("qa_id=null"),
                }
            }
        }
        Commands::Show { id } => match engine.qa_pair_by_id(id)? {
            Some(pair) => print_json(&pair)?,
            None => bail!("no QA pair with id '{id}'"),
        },
        Commands::ByCategory { name } => print_json(&engine.search_by_category(name)?)?,
        Commands::ByTags { tags } => print_json(&engine.search_by_tags(tags.as_slice())?)?,
        Commands::Categories => print_json(&engine.categories()?)?,
        Commands::Tags => print_json(&engine.tags()?)?,
        Commands::Stats => {
            let stats = engine.stats()?;
            println!(
                "total_questions={} total_answers={} unique_tags={} average_answers_per_question={:.2}",
                stats.total_questions,
                stats.total_answers,
                stats.unique_tags,
                stats.average_answers_per_question
            );
            println!(
                "categories={}",
                stats.categories.into_iter().collect::<Vec<_>>().join(",")
            );
        }
        Commands::Validate => {
            let stats = engine.stats()?;
            println!(
                "valid=true qa_pairs={} total_answers={} generation={}",
                stats.total_questions,
                stats.total_answers,
                engine.generation().unwrap_or(0)
            );
        }
        Commands::Save => {
            engine.save()?;
            let stats = engine.stats()?;
            println!(
                "saved qa_pairs={} total_answers={} path={}",
                stats.total_questions,
                stats.total_answers,
                cli.data_path.display()
            );
        }
        Commands::Eval {
            cases,
            min_pass_rate,
        } => {
            let cases = read_eval_cases_json(cases)?;
            info!(cases = cases.len(), "running evaluation");
            let summary = evaluate_cases(&engine, &cases)?;
            let meets_threshold = summary.pass_rate >= *min_pass_rate;

            println!(
                "total={} passed={} failed={} pass_rate={:.4} required={:.4} meets_threshold={}",
                summary.total,
                summary.passed,
                summary.failed,
                summary.pass_rate,
                min_pass_rate,
                meets_threshold
            );

            for o in &summary.outcomes {
                println!(
                    "case={} passed={} qa_id={} score={:.4} latency={:.1}ms",
                    o.case_id,
                    o.passed,
                    o.actual_qa_id.as_deref().unwrap_or("null"),
                    o.score,
                    o.latency_ms
                );
            }

            if !meets_threshold {
                bail!(
                    "pass rate {:.4} below required {:.4}",
                    summary.pass_rate,
                    min_pass_rate
                );
            }
        }
    }

    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
