use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pano_runner::{
    AzureCaptioner, ControllerAction, DirectoryCamera, GoogleSpeech, HttpEncoder, PanoramaGraph, RegistryError,
    RemoteServices, ResolvedRun, RunSession, ServiceError, SilentPlayer,
};
use pano_settings::{ExperimentSettings, SettingsError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const DEFAULT_ENCODER_URL: &str = "http://127.0.0.1:8765";
const ACTION_BUFFER: usize = 64;

#[derive(Parser)]
#[command(name = "pano", version, about = "Panoramic capture experiment runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate an experiment settings file.
    ValidateSettings {
        settings: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Register or log in a participant and show the next run.
    Register {
        #[arg(long)]
        settings: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Show a participant's run manifest without creating anything.
    Status {
        #[arg(long)]
        settings: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Score two stored feature vectors.
    Score {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        text: PathBuf,
        #[arg(long)]
        min: Option<f64>,
        #[arg(long)]
        max: Option<f64>,
        #[arg(long)]
        settings: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Run the next run for a participant. Reads actions from stdin; the
    /// run starts on a `sync` line.
    Session {
        #[arg(long)]
        settings: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        scenes: PathBuf,
        #[arg(long, default_value = DEFAULT_ENCODER_URL)]
        encoder: String,
        #[arg(long, default_value = GoogleSpeech::DEFAULT_BASE_URL)]
        tts_base: String,
        #[arg(long)]
        links: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{:#}", err), error_details(&err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .compact();
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::ValidateSettings { settings, json } => {
            let loaded = pano_settings::load_settings(&settings)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate-settings",
                    "settings": settings_to_json(&settings, &loaded),
                })));
            }
            print_settings(&settings, &loaded);
        }
        Commands::Register {
            settings,
            name,
            id,
            json,
        } => {
            let loaded = pano_settings::load_settings(&settings)?;
            // The run directory is only created once a session starts.
            let run = pano_runner::select_run(&loaded.data_root(), &name, &id, &loaded.run_info)?;
            info!(participant = %run.participant, run = run.run_number, "participant ready");
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "register",
                    "run": run_to_json(&run),
                })));
            }
            print_run(&run);
        }
        Commands::Status {
            settings,
            name,
            id,
            json,
        } => {
            let loaded = pano_settings::load_settings(&settings)?;
            let status = pano_runner::participant_status(&loaded.data_root(), &name, &id)?;
            if json {
                let runs = status.as_ref().map(|runs| {
                    runs.iter()
                        .map(|r| {
                            json!({
                                "sequence": r.entry.sequence,
                                "dir": r.entry.dir_name(),
                                "original_index": r.entry.original_index,
                                "completed": r.completed,
                            })
                        })
                        .collect::<Vec<_>>()
                });
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "registered": status.is_some(),
                    "runs": runs,
                })));
            }
            match status {
                None => println!("participant {}_{} is not registered", id.trim(), name.trim()),
                Some(runs) => {
                    for r in runs {
                        let mark = if r.completed { "done" } else { "pending" };
                        println!("{:>3} {:<24} {}", r.entry.sequence, r.entry.dir_name(), mark);
                    }
                }
            }
        }
        Commands::Score {
            image,
            text,
            min,
            max,
            settings,
            json,
        } => {
            let defaults = match settings {
                Some(path) => pano_settings::load_settings(&path)?.trial_info,
                None => pano_settings::TrialInfo::default(),
            };
            let min = min.unwrap_or(defaults.min_similarity_threshold);
            let max = max.unwrap_or(defaults.max_similarity_threshold);
            if min >= max {
                anyhow::bail!("--min ({}) must be below --max ({})", min, max);
            }
            let image_feature = pano_core::load_feature(&image)?;
            let text_feature = pano_core::load_feature(&text)?;
            let score = pano_runner::score(
                Some(image_feature.as_slice()),
                Some(text_feature.as_slice()),
                min,
                max,
            );
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "score",
                    "similarity": score.similarity,
                    "percent": score.percent,
                    "min": min,
                    "max": max,
                })));
            }
            println!("similarity: {}", score.similarity);
            println!("percent: {}", score.percent);
        }
        Commands::Session {
            settings,
            name,
            id,
            scenes,
            encoder,
            tts_base,
            links,
            seed,
            json,
        } => {
            let loaded = pano_settings::load_settings(&settings)?;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            let options = SessionOptions {
                scenes,
                encoder,
                tts_base,
                links,
                seed,
            };
            let outcome = runtime.block_on(run_session(&loaded, &name, &id, options));
            // The stdin reader may still be parked on a blocking read.
            runtime.shutdown_background();
            let (run, summary) = outcome?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "session",
                    "run": run_to_json(&run),
                    "summary": serde_json::to_value(&summary)?,
                })));
            }
            print_run(&run);
            println!("trials: {}", summary.trials);
            println!(
                "captures: {} manual, {} timed out",
                summary.manual_captures, summary.timeout_captures
            );
            for (idx, score) in summary.rewards.iter().enumerate() {
                println!(
                    "trial {}: similarity {:.4}, percent {:.1}",
                    idx + 1,
                    score.similarity,
                    score.percent
                );
            }
        }
    }
    Ok(None)
}

struct SessionOptions {
    scenes: PathBuf,
    encoder: String,
    tts_base: String,
    links: Option<PathBuf>,
    seed: Option<u64>,
}

async fn run_session(
    settings: &ExperimentSettings,
    name: &str,
    id: &str,
    options: SessionOptions,
) -> Result<(ResolvedRun, pano_runner::SessionSummary)> {
    // Everything that can fail on setup happens before the run directory is
    // created; an existing run directory counts as a started run.
    let camera = DirectoryCamera::open(&options.scenes)?;
    let links = match &options.links {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("cannot read panorama links {}", path.display()))?,
        ),
        None => None,
    };
    let graph = links.as_deref().map(PanoramaGraph::from_json).transpose()?;
    let encoder = HttpEncoder::new(
        &options.encoder,
        &settings.clip_text_model_path,
        &settings.clip_image_model_path,
    )
    .map_err(ServiceError::from)?;
    let captioner = AzureCaptioner::new(&settings.azure_api_url, &settings.azure_api_key)?;
    let speech = GoogleSpeech::new(&options.tts_base, &settings.google_tts_api_key)?;
    let services = RemoteServices::connect(encoder, captioner, speech, SilentPlayer).await?;

    let run = claim_run(settings, name, id)?;
    eprintln!("{}", run.status_message());
    let view = graph.unwrap_or_else(|| {
        PanoramaGraph::single(run.run_info.latlng.lat, run.run_info.latlng.lng)
    });

    let rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let mut session = RunSession::new(&run, settings.trial_info.clone(), services, view, camera, rng);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("waiting for `sync` on stdin");
    loop {
        match lines.next_line().await? {
            Some(line) if line.trim().eq_ignore_ascii_case("sync") => break,
            Some(line) => warn!(line = %line.trim(), "ignoring input before sync"),
            None => anyhow::bail!("stdin closed before `sync`"),
        }
    }

    let (tx, mut rx) = mpsc::channel::<ControllerAction>(ACTION_BUFFER);
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<ControllerAction>() {
                Ok(action) => {
                    if tx.send(action).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "ignoring controller input"),
            }
        }
    });

    let summary = session.run(&mut rx).await?;
    Ok((run, summary))
}

fn claim_run(settings: &ExperimentSettings, name: &str, id: &str) -> Result<ResolvedRun> {
    Ok(pano_runner::resolve_run(
        &settings.data_root(),
        name,
        id,
        &settings.run_info,
    )?)
}

fn settings_to_json(path: &Path, settings: &ExperimentSettings) -> Value {
    json!({
        "path": path.display().to_string(),
        "data_root": settings.data_root().display().to_string(),
        "runs": settings.run_info.iter().map(|r| json!({
            "city": r.city,
            "caption_target": r.caption_target,
        })).collect::<Vec<_>>(),
        "trial_info": serde_json::to_value(&settings.trial_info).unwrap_or(Value::Null),
    })
}

fn print_settings(path: &Path, settings: &ExperimentSettings) {
    println!("settings: {}", path.display());
    println!("data_root: {}", settings.data_root().display());
    println!("runs: {}", settings.run_info.len());
    for run in &settings.run_info {
        println!("  {} -> {:?}", run.city, run.caption_target);
    }
    println!("trials_per_run: {}", settings.trial_info.total_number_of_trials);
    println!("capture_interval_ms: {}", settings.trial_info.capture_interval_in_ms);
}

fn run_to_json(run: &ResolvedRun) -> Value {
    json!({
        "participant": run.participant.dir_name(),
        "participant_dir": run.participant_dir.display().to_string(),
        "run_dir": run.workspace.root.display().to_string(),
        "run_number": run.run_number,
        "total_runs": run.total_runs,
        "first_registration": run.first_registration,
        "city": run.run_info.city,
        "caption_target": run.run_info.caption_target,
        "message": run.status_message(),
    })
}

fn print_run(run: &ResolvedRun) {
    println!("{}", run.status_message());
    println!("run_dir: {}", run.workspace.root.display());
    println!("run: {}/{} ({})", run.run_number, run.total_runs, run.run_info.city);
    println!("caption_target: {}", run.run_info.caption_target);
}

fn error_code(err: &anyhow::Error) -> &'static str {
    if let Some(e) = err.downcast_ref::<RegistryError>() {
        return e.code();
    }
    if let Some(e) = err.downcast_ref::<ServiceError>() {
        return e.code();
    }
    if err.downcast_ref::<SettingsError>().is_some() {
        return "settings_error";
    }
    "command_failed"
}

fn error_details(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<SettingsError>() {
        Some(SettingsError::Invalid(problems)) => json!({ "problems": problems }),
        _ => json!({}),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::ValidateSettings { json, .. }
        | Commands::Register { json, .. }
        | Commands::Status { json, .. }
        | Commands::Score { json, .. }
        | Commands::Session { json, .. } => *json,
    }
}
