//! rca 命令行
//!
//! - `rca diagnose`：对一次故障描述运行完整诊断流水线，输出 Markdown 或 JSON 报告
//! - `rca ingest` / `rca search` / `rca seed`：维护与检索领域知识库
//! - `rca taxonomy`：列出故障分类表

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use rca::config::{load_config, AppConfig};
use rca::core::{open_knowledge_base, PipelineBuilder};
use rca::diagnosis::{render_markdown, DiagnosisEvent, FaultTaxonomy, GlobalContext};
use rca::llm::create_embedder_from_config;

#[derive(Parser, Debug)]
#[command(author, version, about = "Hadoop 集群多智能体故障诊断", long_about = None)]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 诊断一次故障
    Diagnose {
        /// 故障描述
        #[arg(short, long)]
        query: String,
        /// 上下文快照 JSON（{"logs": {..}, "metrics": {..}}）
        #[arg(long)]
        context: Option<PathBuf>,
        /// 节点日志目录（*.log），同时作为日志工具的数据源
        #[arg(long)]
        logs_dir: Option<PathBuf>,
        /// 输出 JSON 而不是 Markdown
        #[arg(long, default_value_t = false)]
        json: bool,
        /// 在 stderr 打印诊断进度
        #[arg(long, default_value_t = false)]
        progress: bool,
    },
    /// 导入文档到知识库领域
    Ingest {
        #[arg(short, long)]
        domain: String,
        /// 文件或目录（.txt / .md）
        #[arg(short, long)]
        path: PathBuf,
        /// 导入前清空该领域
        #[arg(long, default_value_t = false)]
        rebuild: bool,
    },
    /// 检索知识库
    Search {
        #[arg(short, long)]
        query: String,
        #[arg(short, long)]
        domain: Option<String>,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// 为空领域写入示例知识
    Seed,
    /// 列出故障分类表
    Taxonomy,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rca::observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    match cli.command {
        Command::Diagnose {
            query,
            context,
            logs_dir,
            json,
            progress,
        } => diagnose(cfg, &query, context.as_deref(), logs_dir, json, progress).await,
        Command::Ingest {
            domain,
            path,
            rebuild,
        } => ingest(&cfg, &domain, &path, rebuild).await,
        Command::Search {
            query,
            domain,
            top_k,
        } => search(&cfg, &query, domain.as_deref(), top_k).await,
        Command::Seed => {
            let kb = open_knowledge_base(&cfg, create_embedder_from_config(&cfg.embedding)).await?;
            let added = kb.seed_sample_knowledge().await?;
            println!("写入示例知识 {} 条", added);
            Ok(())
        }
        Command::Taxonomy => {
            let taxonomy = match &cfg.diagnosis.taxonomy_path {
                Some(p) => FaultTaxonomy::load(p)?,
                None => FaultTaxonomy::builtin(),
            };
            for entry in taxonomy.entries() {
                println!(
                    "{:<32} {:<18} {:?}\t{}",
                    entry.id, entry.owner.as_str(), entry.severity, entry.description
                );
            }
            Ok(())
        }
    }
}

async fn diagnose(
    mut cfg: AppConfig,
    query: &str,
    context: Option<&Path>,
    logs_dir: Option<PathBuf>,
    json: bool,
    progress: bool,
) -> anyhow::Result<()> {
    let ctx = match (context, &logs_dir) {
        (Some(path), _) => GlobalContext::from_json_file(path)?,
        (None, Some(dir)) => GlobalContext::from_log_dir(dir, cfg.tools.log_max_lines)?,
        (None, None) => GlobalContext::builder().build(),
    };
    if logs_dir.is_some() {
        cfg.tools.log_dir = logs_dir;
    }

    let mut builder = PipelineBuilder::new(cfg);
    if progress {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<DiagnosisEvent>();
        builder = builder.with_events(tx);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{line}");
                }
            }
        });
    }
    let orchestrator = builder.build().await.context("Failed to build pipeline")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl+C received, cancelling diagnosis");
            ctrl_c.cancel();
        }
    });

    let outcome = orchestrator
        .diagnose_cancellable(query, ctx, Some(&cancel))
        .await;
    let (prompt_tokens, completion_tokens, total_tokens) = orchestrator.deps().engine.token_usage();
    tracing::info!(prompt_tokens, completion_tokens, total_tokens, "token usage");
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", render_markdown(&outcome.report));
    }
    Ok(())
}

async fn ingest(cfg: &AppConfig, domain: &str, path: &Path, rebuild: bool) -> anyhow::Result<()> {
    if cfg.knowledge_root().is_none() {
        tracing::warn!("neither knowledge.root nor app.data_dir is set, ingested documents will not be persisted");
    }
    let kb = Arc::new(open_knowledge_base(cfg, create_embedder_from_config(&cfg.embedding)).await?);
    if rebuild {
        kb.rebuild_domain(domain).await?;
    }
    let added = if path.is_dir() {
        kb.import_directory(domain, path).await?
    } else {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        kb.import_text(domain, &path.display().to_string(), &text, Default::default())
            .await?
    };
    println!("{} 导入 {} 条，共 {} 条", domain, added, kb.len(domain).await);
    Ok(())
}

async fn search(
    cfg: &AppConfig,
    query: &str,
    domain: Option<&str>,
    top_k: Option<usize>,
) -> anyhow::Result<()> {
    let kb = open_knowledge_base(cfg, create_embedder_from_config(&cfg.embedding)).await?;
    let hits = kb
        .search(
            domain,
            query,
            top_k.unwrap_or(cfg.knowledge.top_k),
            cfg.knowledge.score_threshold,
        )
        .await;
    if hits.is_empty() {
        println!("未找到相关知识");
    }
    for (i, hit) in hits.iter().enumerate() {
        println!("{}. [{}] {:.3} {}", i + 1, hit.domain, hit.score, hit.text);
    }
    Ok(())
}
