use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use shuati_exam::logging::init_logging;
use shuati_exam::services::{
    AppContext, BankFilter, BankScope, EmbeddingIndex, LlamaClient,
    Orchestrator, PregenQueue, QuestionStore, SessionFactory, SqliteSessions, TieredCache,
    VectorSearch,
};
use shuati_exam::utils::get_log_path;
use shuati_exam::PipelineConfig;
use std::path::PathBuf;
use std::sync::Arc;

/// 索引风格参考题时单次读取的上限
const INDEX_LIMIT: usize = 200;

#[derive(Parser, Debug)]
#[command(name = "shuati-exam", version, about = "Adaptive exam paper generator")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Print pipeline metrics after the command finishes
    #[arg(long, global = true)]
    metrics: bool,

    /// Also append logs to shuati.log in the data directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a test and print it as JSON
    Generate {
        #[arg(long)]
        topic: i64,
        #[arg(long)]
        user: i64,
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// Share of bank questions, 0.0 - 1.0
        #[arg(long)]
        ratio: Option<f64>,
        /// Question ids to leave out
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<i64>,
    },
    /// Pre-generate a test into the cache and wait for the job
    Pregen {
        #[arg(long)]
        topic: i64,
        #[arg(long)]
        user: i64,
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_path = cli.log_file.then(get_log_path);
    init_logging(&cli.log_level, log_path.as_deref())?;

    let config = PipelineConfig::load(cli.config.as_deref())?;
    info!("Using database {}", config.database_path.display());

    // 每个会话打开时都会确保表结构存在
    let sessions = Arc::new(SqliteSessions::new(&config.database_path));
    let store = sessions.open().await.context("Failed to open database")?;

    let llama = Arc::new(LlamaClient::new(config.llama.clone()));
    let index = Arc::new(EmbeddingIndex::new(llama.clone()));
    let cache = Arc::new(TieredCache::from_config(&config.cache));

    let topic = match &cli.command {
        Command::Generate { topic, .. } | Command::Pregen { topic, .. } => *topic,
    };
    index_topic(&index, store.as_ref(), topic).await;

    let ctx = Arc::new(AppContext::new(
        config,
        cache,
        llama,
        index as Arc<dyn VectorSearch>,
        sessions,
    ));

    match cli.command {
        Command::Generate {
            topic,
            user,
            count,
            ratio,
            exclude,
        } => {
            let orchestrator = Orchestrator::new(ctx, store);
            let outcome = orchestrator
                .generate_test(topic, user, count, ratio, &exclude)
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if cli.metrics {
                print_metrics(&orchestrator)?;
            }
        }
        Command::Pregen { topic, user, count } => {
            let orchestrator = Orchestrator::new(ctx.clone(), store.clone())
                .with_pregen(PregenQueue::spawn(ctx.clone()));
            orchestrator.pre_generate(topic, user, count).await;
            orchestrator.shutdown().await;

            let reader = Orchestrator::new(ctx, store);
            match reader.pregen_status(topic, user).await {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => warn!("No pre-generation status recorded"),
            }
            if cli.metrics {
                print_metrics(&reader)?;
            }
        }
    }

    Ok(())
}

/// 为风格参考建立索引，嵌入服务不可用时跳过
async fn index_topic(index: &EmbeddingIndex, store: &dyn QuestionStore, topic_id: i64) {
    let filter = BankFilter {
        scope: BankScope::Topic(topic_id),
        exclude_ids: Vec::new(),
    };
    let questions = match store.fetch_bank_questions(&filter, INDEX_LIMIT).await {
        Ok(questions) => questions,
        Err(e) => {
            warn!("Failed to load questions for indexing: {:#}", e);
            return;
        }
    };
    if questions.is_empty() {
        return;
    }
    if let Err(e) = index.index_questions(&questions).await {
        warn!("Embedding index unavailable, continuing without style references: {:#}", e);
    }
}

fn print_metrics(orchestrator: &Orchestrator) -> Result<()> {
    eprintln!("{}", serde_json::to_string_pretty(&orchestrator.get_metrics())?);
    Ok(())
}
