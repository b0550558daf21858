//! Negotiator 命令行入口
//!
//! 每个子命令对应 WorkflowEngine 的一个操作，结果以 JSON 输出到 stdout，日志写到 stderr。
//! 挂起的会话通过 `approve` / `reject` 在之后任意时间恢复（Checkpoint 默认保存在 SQLite）。

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use negotiator::config::load_config;
use negotiator::core::QueryRequest;
use negotiator::workflow::{ApprovalDecision, RunOutcome, WorkflowEngine};

/// 本地商家搜索、评价聚合与模拟议价
#[derive(Parser, Debug)]
#[command(name = "negotiator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 输出 debug 日志
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 开始新的搜索会话
    Search {
        #[arg(long)]
        city: String,
        /// 商家类型，如 gym、salon
        #[arg(long = "type")]
        place_type: String,
        /// negotiation / info_only / comparison
        #[arg(long, default_value = "info_only")]
        intent: String,
        /// 自由文本需求
        #[arg(short, long, default_value = "")]
        query: String,
        /// 月预算
        #[arg(short, long)]
        budget: Option<f64>,
        /// 返回全部符合条件的商家，而不只是第一名
        #[arg(long)]
        show_all: bool,
        /// 指定会话 ID（默认自动生成）
        #[arg(long)]
        thread: Option<String>,
    },
    /// 批准挂起的会话
    Approve {
        thread: String,
        #[arg(short, long)]
        notes: Option<String>,
    },
    /// 拒绝挂起的会话
    Reject {
        thread: String,
        #[arg(short, long, default_value = "")]
        notes: String,
    },
    /// 从最近的 Checkpoint 继续（失败重试或进程重启后）
    Resume { thread: String },
    /// 查看会话状态与 Checkpoint 历史
    Status { thread: String },
    /// 列出已保存的会话
    Threads,
    /// 抓取某个商家的详细评价
    Reviews {
        thread: String,
        #[arg(long)]
        place: String,
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },
}

fn outcome_json(outcome: &RunOutcome) -> serde_json::Value {
    let state = outcome.state();
    json!({
        "thread_id": state.thread_id,
        "status": if outcome.is_completed() { "completed" } else { "awaiting_approval" },
        "route": state.route,
        "current_step": state.current_step,
        "iteration": state.iteration,
        "recommendations": state.recommendations,
        "last_message": state.messages.last().map(|m| m.content.as_str()),
    })
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    negotiator::observability::init(args.verbose);

    let cfg = load_config(args.config).context("Failed to load config")?;
    let engine = WorkflowEngine::from_config(&cfg).context("Failed to create workflow engine")?;

    match args.command {
        Command::Search {
            city,
            place_type,
            intent,
            query,
            budget,
            show_all,
            thread,
        } => {
            let request = QueryRequest {
                city,
                place_type,
                user_intent: intent,
                user_query: query,
                budget,
                show_all: show_all.then_some(true),
                thread_id: thread,
            };
            let outcome = engine.start(request).await.context("Search failed")?;
            print_json(&outcome_json(&outcome))?;
        }
        Command::Approve { thread, notes } => {
            let outcome = engine
                .submit_approval(&thread, ApprovalDecision::Approve { notes })
                .await
                .with_context(|| format!("Approval of {thread} failed"))?;
            print_json(&outcome_json(&outcome))?;
        }
        Command::Reject { thread, notes } => {
            let outcome = engine
                .submit_approval(&thread, ApprovalDecision::Reject { notes })
                .await
                .with_context(|| format!("Rejection of {thread} failed"))?;
            print_json(&outcome_json(&outcome))?;
        }
        Command::Resume { thread } => {
            let outcome = engine
                .resume(&thread)
                .await
                .with_context(|| format!("Resume of {thread} failed"))?;
            print_json(&outcome_json(&outcome))?;
        }
        Command::Status { thread } => {
            let state = engine.status(&thread).await?;
            let history = engine.history(&thread).await?;
            print_json(&json!({"state": state, "history": history}))?;
        }
        Command::Threads => {
            print_json(&json!(engine.list_threads().await?))?;
        }
        Command::Reviews {
            thread,
            place,
            limit,
        } => {
            let reviews = engine
                .fetch_reviews(&thread, &place, limit)
                .await
                .with_context(|| format!("Fetching reviews for {place} failed"))?;
            print_json(&json!({"place": place, "reviews": reviews}))?;
        }
    }

    Ok(())
}
