use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vidquery::clip::ClipModel;
use vidquery::config::Config;
use vidquery::db::SqliteStore;
use vidquery::frames::FfmpegSampler;
use vidquery::logging;
use vidquery::playback::PlaybackReconciler;
use vidquery::search::QueryResult;
use vidquery::session::{SessionEvent, SessionSettings, UploadOutcome, VideoSession};
use vidquery::PipelineError;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

enum Command {
    Index(PathBuf),
    Search { query: String, top_k: Option<usize> },
    Jump(f64),
    Status,
    Reset,
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn usage_error(message: &str) -> ! {
    eprintln!("Error: {}", message);
    print_help();
    std::process::exit(1);
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut top_k = None;
    let mut positional = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("vidquery {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    usage_error("--config requires a path argument");
                }
            }
            "--top-k" | "-k" => match args.get(i + 1).and_then(|v| v.parse::<usize>().ok()) {
                Some(k) => {
                    top_k = Some(k);
                    i += 1;
                }
                None => usage_error("--top-k requires a number"),
            },
            arg if arg.starts_with('-') && arg.parse::<f64>().is_err() => {
                usage_error(&format!("Unknown argument: {}", arg));
            }
            _ => positional.push(args[i].clone()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("index") => match positional.next() {
            Some(path) => Command::Index(PathBuf::from(path)),
            None => usage_error("index requires a video path"),
        },
        Some("search") => {
            let query = positional.collect::<Vec<_>>().join(" ");
            if query.is_empty() {
                usage_error("search requires a query");
            }
            Command::Search { query, top_k }
        }
        Some("jump") => match positional.next().and_then(|v| v.parse::<f64>().ok()) {
            Some(seconds) => Command::Jump(seconds),
            None => usage_error("jump requires a timestamp in seconds"),
        },
        Some("status") => Command::Status,
        Some("reset") => Command::Reset,
        Some(other) => usage_error(&format!("Unknown command: {}", other)),
        None => usage_error("no command given"),
    };

    Args {
        config_path,
        command,
    }
}

fn print_help() {
    println!(
        r#"vidquery - search a video's frames with text

USAGE:
    vidquery [OPTIONS] <COMMAND>

COMMANDS:
    index <VIDEO>           Index a video (replaces the previously indexed one)
    search <QUERY>...       Find the frames that best match QUERY
    jump <SECONDS>          Show the playback start for a matched timestamp
    status                  Show the active video
    reset                   Forget the active video and delete its index

OPTIONS:
    --config, -c PATH   Path to config file
    --top-k, -k N       Number of results to request (search)
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    VIDQUERY_CONFIG     Path to config file (overrides default location)
    VIDQUERY_LOG        Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/vidquery/config.toml"#
    );
}

fn main() -> Result<()> {
    let args = parse_args();

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let result = runtime.block_on(run(args));
    // A timed-out search may still be running on the blocking pool; don't wait for it
    runtime.shutdown_background();
    result
}

async fn run(args: Args) -> Result<()> {
    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    store.initialize().context("Failed to initialize database")?;
    let store = Arc::new(store);

    let mut settings = SessionSettings::from_config(&config);
    if let Command::Search { top_k: Some(k), .. } = args.command {
        settings.top_k = k;
    }

    let clip = Arc::new(ClipModel::new(config.models.clone()));
    let mut session = VideoSession::new(
        Arc::new(FfmpegSampler::new(&config.sampler)),
        clip.clone(),
        store.clone(),
        store,
        settings,
    );
    session.restore()?;

    match args.command {
        Command::Index(video) => index(&mut session, &video, &config).await,
        Command::Search { query, .. } => {
            // Model download is not part of the query budget
            tokio::task::spawn_blocking(move || clip.init_text())
                .await
                .context("Model loading task panicked")?
                .context("Failed to load CLIP text encoder")?;
            search(session, query, &config).await
        }
        Command::Jump(seconds) => {
            let jump = session.reconciler().jump_to(seconds);
            println!("{}", jump.caption());
            println!("Start playback at {}s", jump.start_secs);
            Ok(())
        }
        Command::Status => {
            print_status(&session);
            Ok(())
        }
        Command::Reset => {
            session.reset()?;
            println!("Session reset");
            Ok(())
        }
    }
}

async fn index(session: &mut VideoSession, video: &std::path::Path, config: &Config) -> Result<()> {
    let collection_id = match session.upload(video)? {
        UploadOutcome::Unchanged { collection_id } => {
            println!("Already indexed as {}", collection_id);
            return Ok(());
        }
        UploadOutcome::Indexing { collection_id, .. } => {
            println!("Indexing {} as {}", video.display(), collection_id);
            collection_id
        }
        UploadOutcome::Retrying { collection_id, .. } => {
            println!("Retrying index of {} as {}", video.display(), collection_id);
            collection_id
        }
    };

    let seconds = config.timeouts.build_secs;
    let outcome = tokio::time::timeout(
        Duration::from_secs(seconds),
        wait_for_build(session, &collection_id),
    )
    .await;

    match outcome {
        Ok(result) => result,
        Err(_) => {
            session.cancel_build();
            Err(PipelineError::Timeout {
                operation: "indexing",
                seconds,
            }
            .into())
        }
    }
}

async fn wait_for_build(session: &mut VideoSession, collection_id: &str) -> Result<()> {
    loop {
        for event in session.poll()? {
            match event {
                SessionEvent::Indexed { collection_id: id, frames } if id == collection_id => {
                    println!("Indexed {} frames", frames);
                    return Ok(());
                }
                SessionEvent::BuildFailed { error, .. } => anyhow::bail!("Indexing failed: {}", error),
                SessionEvent::BuildCancelled { .. } => anyhow::bail!("Indexing was cancelled"),
                _ => {}
            }
        }
        if let Some(progress) = session.build_progress() {
            tracing::debug!(
                current = progress.current,
                item = progress.current_item.as_deref().unwrap_or(""),
                "Build progress"
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn search(mut session: VideoSession, query: String, config: &Config) -> Result<()> {
    let seconds = config.timeouts.query_secs;
    let reconciler = *session.reconciler();
    let handle = tokio::task::spawn_blocking(move || session.search(&query).map(|r| r.to_vec()));

    let results = match tokio::time::timeout(Duration::from_secs(seconds), handle).await {
        Ok(joined) => joined.context("Search task panicked")??,
        Err(_) => {
            return Err(PipelineError::Timeout {
                operation: "search",
                seconds,
            }
            .into())
        }
    };

    print_results(&results, &reconciler);
    Ok(())
}

/// Heading above the result list; `None` when nothing matched
fn results_heading(count: usize) -> Option<String> {
    match count {
        0 => None,
        1 => Some("Top match".to_string()),
        n => Some(format!("Found {} matches", n)),
    }
}

fn print_results(results: &[QueryResult], reconciler: &PlaybackReconciler) {
    let (Some(heading), Some(top)) = (results_heading(results.len()), results.first()) else {
        println!("No close matches found. Try a different search term.");
        return;
    };

    println!("{}", heading);
    for result in results {
        println!(
            "  #{:<2} {:>8.2}s  {:>7}  {}",
            result.rank,
            result.frame.timestamp_sec,
            result.similarity_percent(),
            result.frame.frame_filename
        );
    }

    println!("{}", reconciler.jump(top).caption());
}

fn print_status(session: &VideoSession) {
    let state = session.state();
    let Some(identity) = &state.identity else {
        println!("No active video");
        return;
    };

    println!("Collection: {}", identity.collection_id());
    if let Some(path) = &state.source_path {
        println!("Source:     {}", path.display());
    }
    match (state.indexed, state.frame_count) {
        (true, Some(frames)) => println!("Indexed:    yes ({} frames)", frames),
        (true, None) => println!("Indexed:    yes"),
        (false, _) => println!("Indexed:    no (run `vidquery index` again to retry)"),
    }
}
