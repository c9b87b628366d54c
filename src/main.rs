//! Fabula - chapter-level fact extraction and knowledge aggregation for
//! long-form novels.
//!
//! Usage:
//!   fabula import book.json            Import a pre-segmented novel
//!   fabula analyze <novel> 1 100       Analyze a chapter range
//!   fabula estimate <novel> 1 100      Token/cost estimate
//!   fabula entity <novel> 韩立         Aggregated entity profile
//!   fabula graph <novel>               Relationship graph JSON
//!   fabula world <novel>               World structure JSON
//!   fabula ask <novel> "问题"          Semantic Q&A (streams)
//!   fabula --help                      Show all commands

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use fabula::init::AppContext;
use fabula::models::{AnalysisEvent, ChapterImport, EntityType, TaskStatus};
use fabula::repository::NovelRepository;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Parser)]
#[command(name = "fabula", version, about = "Novel analysis engine")]
struct Cli {
    /// Data directory (default: FABULA_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a novel from a JSON chapter list or a marker-split text file
    Import {
        file: PathBuf,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        author: Option<String>,
    },
    /// List imported novels
    List,
    /// Analyze a chapter range, streaming progress to stdout
    Analyze {
        novel_id: String,
        chapter_start: u32,
        chapter_end: u32,
        #[arg(long)]
        force: bool,
    },
    /// Pause, resume or cancel a task
    Task {
        task_id: String,
        #[arg(value_parser = ["paused", "running", "cancelled"])]
        status: String,
    },
    /// Estimate token usage and cost for a range
    Estimate {
        novel_id: String,
        chapter_start: u32,
        chapter_end: u32,
    },
    /// Aggregated profile of one entity
    Entity {
        novel_id: String,
        name: String,
        #[arg(long)]
        kind: Option<String>,
    },
    /// Relationship graph
    Graph {
        novel_id: String,
        #[arg(long)]
        from: Option<u32>,
        #[arg(long)]
        to: Option<u32>,
    },
    /// Timeline events
    Timeline {
        novel_id: String,
        #[arg(long)]
        from: Option<u32>,
        #[arg(long)]
        to: Option<u32>,
    },
    /// Factions overview
    Factions { novel_id: String },
    /// Map layout data
    Map { novel_id: String },
    /// World structure (overrides applied)
    World { novel_id: String },
    /// Entity dictionary from the pre-scan
    Dictionary {
        novel_id: String,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Ask a question about the novel (streams the answer)
    Ask { novel_id: String, question: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("fabula=info".parse()?),
        )
        .init();

    let ctx = AppContext::new(cli.data_path.clone()).await?;
    let recovered = ctx.resume_interrupted().await?;
    if recovered > 0 {
        eprintln!("recovered {recovered} interrupted task(s)");
    }

    match cli.command {
        Commands::Import {
            file,
            title,
            author,
        } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let (title, chapters) = parse_import(&file, &raw, title)?;
            let novel = ctx
                .import_novel(&title, author.as_deref(), chapters)
                .await?;
            println!("{}", serde_json::to_string_pretty(&novel)?);
        }
        Commands::List => {
            let novels = ctx.novels.list_novels().await?;
            println!("{}", serde_json::to_string_pretty(&novels)?);
        }
        Commands::Analyze {
            novel_id,
            chapter_start,
            chapter_end,
            force,
        } => {
            let task_id = ctx
                .orchestrator
                .analyze(&novel_id, chapter_start, chapter_end, force)
                .await?;
            eprintln!("task {task_id}");
            let mut events = BroadcastStream::new(ctx.orchestrator.subscribe(&task_id));
            while let Some(event) = events.next().await {
                // A lagged receiver only means missed progress lines.
                let Ok(event) = event else { continue };
                println!("{}", serde_json::to_string(&event)?);
                if let AnalysisEvent::TaskStatus { status, .. } = &event {
                    if status.is_terminal() {
                        break;
                    }
                }
            }
        }
        Commands::Task { task_id, status } => {
            let status = TaskStatus::parse(&status);
            ctx.orchestrator.patch_task(&task_id, status).await?;
            eprintln!("task {task_id} -> {}", status.as_str());
        }
        Commands::Estimate {
            novel_id,
            chapter_start,
            chapter_end,
        } => {
            let estimate = ctx
                .orchestrator
                .estimate_cost(&novel_id, chapter_start, chapter_end)
                .await?;
            println!("{}", serde_json::to_string_pretty(&estimate)?);
        }
        Commands::Entity {
            novel_id,
            name,
            kind,
        } => {
            let kind = kind.as_deref().map(EntityType::parse);
            let profile = ctx.aggregator.get_entity(&novel_id, &name, kind).await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        Commands::Graph { novel_id, from, to } => {
            let range = range_of(from, to);
            let graph = ctx.aggregator.graph(&novel_id, range).await?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }
        Commands::Timeline { novel_id, from, to } => {
            let range = range_of(from, to);
            let timeline = ctx.aggregator.timeline(&novel_id, range).await?;
            println!("{}", serde_json::to_string_pretty(&timeline)?);
        }
        Commands::Factions { novel_id } => {
            let factions = ctx.aggregator.factions(&novel_id, None).await?;
            println!("{}", serde_json::to_string_pretty(&factions)?);
        }
        Commands::Map { novel_id } => {
            let map = ctx.aggregator.map_data(&novel_id, None).await?;
            println!("{}", serde_json::to_string_pretty(&map)?);
        }
        Commands::World { novel_id } => {
            let world = ctx.get_world_structure(&novel_id).await?;
            println!("{}", serde_json::to_string_pretty(&world)?);
        }
        Commands::Dictionary {
            novel_id,
            kind,
            limit,
        } => {
            let kind = kind.as_deref().map(EntityType::parse);
            let entries = ctx
                .get_entity_dictionary(&novel_id, kind, Some(limit))
                .await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::Ask { novel_id, question } => {
            let mut stream = ctx.qa.ask(&novel_id, &question).await?;
            while let Some(chunk) = stream.next().await {
                print!("{}", chunk?);
            }
            println!();
        }
    }

    Ok(())
}

fn range_of(from: Option<u32>, to: Option<u32>) -> Option<(u32, u32)> {
    match (from, to) {
        (None, None) => None,
        (from, to) => Some((from.unwrap_or(1), to.unwrap_or(u32::MAX))),
    }
}

/// JSON import: `{"title": ..., "chapters": [{chapter_num, title, content}]}`.
/// Text import: chapters split on lines that look like `第…章` headings.
fn parse_import(
    file: &std::path::Path,
    raw: &str,
    title_flag: Option<String>,
) -> Result<(String, Vec<ChapterImport>)> {
    if file.extension().is_some_and(|e| e == "json") {
        #[derive(serde::Deserialize)]
        struct ImportFile {
            title: String,
            #[serde(default)]
            chapters: Vec<ChapterImport>,
        }
        let parsed: ImportFile = serde_json::from_str(raw).context("parsing import JSON")?;
        return Ok((title_flag.unwrap_or(parsed.title), parsed.chapters));
    }

    let title = title_flag.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "未命名".to_string())
    });
    let mut chapters = Vec::new();
    let mut current_title = String::new();
    let mut current_body = String::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        let is_heading = trimmed.starts_with('第')
            && trimmed.contains('章')
            && trimmed.chars().count() < 30;
        if is_heading {
            if !current_body.trim().is_empty() {
                chapters.push(ChapterImport {
                    chapter_num: chapters.len() as u32 + 1,
                    volume_num: None,
                    title: std::mem::take(&mut current_title),
                    content: std::mem::take(&mut current_body),
                });
            }
            current_title = trimmed.to_string();
            current_body.clear();
        } else {
            current_body.push_str(line);
            current_body.push('\n');
        }
    }
    if !current_body.trim().is_empty() {
        chapters.push(ChapterImport {
            chapter_num: chapters.len() as u32 + 1,
            volume_num: None,
            title: current_title,
            content: current_body,
        });
    }
    Ok((title, chapters))
}
