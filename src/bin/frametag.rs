//! Command-line front end over a directory of frames named `{frame_id}.{ext}`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use frametag::api::{
    AnalyzeResponse, BatchRequest, DeleteEmbeddingResponse, ErrorResponse, JobStatusResponse,
    PipelineListResponse, WarmupResponse,
};
use frametag::{
    Analyzer, DirectoryFrameSource, FrameFilter, FrameId, FrameSource, FrametagConfig, LogFormat,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

enum Command {
    Pipelines,
    Warmup {
        pipeline_ids: Vec<String>,
    },
    Analyze {
        dir: PathBuf,
        frame_id: FrameId,
        pipeline_id: Option<String>,
        force: bool,
    },
    Batch {
        dir: PathBuf,
        pipeline_id: Option<String>,
        limit: Option<usize>,
    },
    Delete {
        frame_id: FrameId,
        pipeline_id: String,
    },
}

struct Invocation {
    config_path: Option<PathBuf>,
    command: Command,
}

fn run() -> Result<(), String> {
    let invocation = parse_args(std::env::args().skip(1).collect())?;
    let cfg = FrametagConfig::load(invocation.config_path.as_deref()).map_err(|e| e.to_string())?;
    init_tracing(&cfg);

    match invocation.command {
        Command::Pipelines => {
            let analyzer = analyzer(&cfg, None)?;
            print_json(&PipelineListResponse {
                pipelines: analyzer.list_pipelines(),
                default_pipeline: analyzer.default_pipeline().to_string(),
            })
        }
        Command::Warmup { pipeline_ids } => {
            let analyzer = analyzer(&cfg, None)?;
            let ids = (!pipeline_ids.is_empty()).then_some(pipeline_ids.as_slice());
            let response = WarmupResponse::from(analyzer.warmup(ids));
            print_json(&response)?;
            if response.all_loaded {
                Ok(())
            } else {
                Err("one or more pipelines failed to load".to_string())
            }
        }
        Command::Analyze {
            dir,
            frame_id,
            pipeline_id,
            force,
        } => {
            let analyzer = analyzer(&cfg, Some(dir))?;
            let pipeline_id = pipeline_id.unwrap_or_else(|| analyzer.default_pipeline().to_string());
            match analyzer.analyze_frame(frame_id, &pipeline_id, force) {
                Ok(analysis) => print_json(&AnalyzeResponse::new(analysis, false)),
                Err(err) => {
                    print_json(&ErrorResponse::from(&err))?;
                    Err(err.to_string())
                }
            }
        }
        Command::Batch {
            dir,
            pipeline_id,
            limit,
        } => {
            let analyzer = analyzer(&cfg, Some(dir))?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| e.to_string())?;
            runtime.block_on(run_batch(analyzer, pipeline_id, limit))
        }
        Command::Delete {
            frame_id,
            pipeline_id,
        } => {
            let analyzer = analyzer(&cfg, None)?;
            let outcome = analyzer
                .delete_embedding(frame_id, &pipeline_id)
                .map_err(|e| e.to_string())?;
            print_json(&DeleteEmbeddingResponse::from(outcome))
        }
    }
}

async fn run_batch(
    mut analyzer: Analyzer,
    pipeline_id: Option<String>,
    limit: Option<usize>,
) -> Result<(), String> {
    analyzer.start_jobs();
    let submission = analyzer
        .submit_batch(&BatchRequest {
            frame_ids: None,
            filter: Some(FrameFilter::default()),
            pipeline_id,
            limit,
        })
        .map_err(|e| e.to_string())?;
    tracing::info!(job_id = %submission.job_id, count = submission.count, "waiting for batch");

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let job = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted, stopping batch worker");
                analyzer.stop_jobs().await;
                break analyzer.job_status(&submission.job_id).map_err(|e| e.to_string())?;
            }
            _ = ticker.tick() => {
                let job = analyzer.job_status(&submission.job_id).map_err(|e| e.to_string())?;
                if job.status.is_terminal() {
                    break job;
                }
            }
        }
    };
    analyzer.stop_jobs().await;

    let failed = job.status == frametag::JobStatus::Failed;
    print_json(&JobStatusResponse::from(job))?;
    if failed {
        Err("batch failed".to_string())
    } else {
        Ok(())
    }
}

fn analyzer(cfg: &FrametagConfig, dir: Option<PathBuf>) -> Result<Analyzer, String> {
    let frames: Arc<dyn FrameSource> = match dir {
        Some(dir) => Arc::new(DirectoryFrameSource::open(dir).map_err(|e| e.to_string())?),
        // Commands that never read frames.
        None => Arc::new(frametag::InMemoryFrameSource::new()),
    };
    Analyzer::from_config(cfg, frames).map_err(|e| e.to_string())
}

fn init_tracing(cfg: &FrametagConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match cfg.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{text}");
    Ok(())
}

fn parse_args(args: Vec<String>) -> Result<Invocation, String> {
    let mut config_path = None;
    let mut pipeline_id = None;
    let mut limit = None;
    let mut force = false;
    let mut positional = Vec::new();

    let mut idx = 0usize;
    while idx < args.len() {
        let arg = args[idx].as_str();
        match arg {
            "--config" => {
                idx += 1;
                config_path = Some(PathBuf::from(value_of(&args, idx, arg)?));
            }
            "--pipeline" => {
                idx += 1;
                pipeline_id = Some(value_of(&args, idx, arg)?.to_string());
            }
            "--limit" => {
                idx += 1;
                let raw = value_of(&args, idx, arg)?;
                limit = Some(
                    raw.parse::<usize>()
                        .map_err(|_| format!("Invalid --limit value: {raw}"))?,
                );
            }
            "--force" => force = true,
            "-h" | "--help" => return Err(help_text()),
            _ if arg.starts_with("--") => return Err(format!("Unknown flag: {arg}\n\n{}", help_text())),
            _ => positional.push(args[idx].clone()),
        }
        idx += 1;
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("pipelines") => Command::Pipelines,
        Some("warmup") => Command::Warmup {
            pipeline_ids: positional.by_ref().collect(),
        },
        Some("analyze") => {
            let dir = positional.next().ok_or_else(help_text)?;
            let frame_id = parse_frame_id(positional.next())?;
            Command::Analyze {
                dir: PathBuf::from(dir),
                frame_id,
                pipeline_id,
                force,
            }
        }
        Some("batch") => {
            let dir = positional.next().ok_or_else(help_text)?;
            Command::Batch {
                dir: PathBuf::from(dir),
                pipeline_id,
                limit,
            }
        }
        Some("delete") => {
            let frame_id = parse_frame_id(positional.next())?;
            let pipeline_id = positional.next().ok_or_else(help_text)?;
            Command::Delete {
                frame_id,
                pipeline_id,
            }
        }
        Some(other) => return Err(format!("Unknown command: {other}\n\n{}", help_text())),
        None => return Err(help_text()),
    };
    if let Some(extra) = positional.next() {
        return Err(format!("Unexpected argument: {extra}"));
    }
    Ok(Invocation {
        config_path,
        command,
    })
}

fn value_of<'a>(args: &'a [String], idx: usize, flag: &str) -> Result<&'a str, String> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| format!("Missing value for {flag}"))
}

fn parse_frame_id(raw: Option<String>) -> Result<FrameId, String> {
    let raw = raw.ok_or_else(help_text)?;
    raw.parse::<FrameId>()
        .map_err(|_| format!("Invalid frame id: {raw}"))
}

fn help_text() -> String {
    [
        "Usage:",
        "  frametag [--config <path>] pipelines",
        "  frametag [--config <path>] warmup [pipeline_id ...]",
        "  frametag [--config <path>] analyze <dir> <frame_id> [--pipeline <id>] [--force]",
        "  frametag [--config <path>] batch <dir> [--pipeline <id>] [--limit <n>]",
        "  frametag [--config <path>] delete <frame_id> <pipeline_id>",
        "",
        "Frames are read from <dir>/<frame_id>.{png,jpg,jpeg,webp}.",
        "Embeddings persist between runs only with a redb cache (FRAMETAG_CACHE_PATH).",
    ]
    .join("\n")
}
