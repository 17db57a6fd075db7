use crate::{
    config::Config,
    display::DisplayTail,
    job::{JobSpec, Mode, Precision, Quantize, VaeSplit},
    progress::parse_progress,
    report::RunReport,
    runner::{JobHandle, Runner, Session},
    staging::{default_output_name, now_local, stage_reference_file},
    util::{ensure_dir, find_on_path, now_rfc3339},
};
use anyhow::{anyhow, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const POLL_WAIT: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "flux-runner")]
#[command(about = "Run mflux image generation with live output and clean cancellation")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./flux-runner.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that each mode's generator can be found.
    Doctor {},
    /// Print mode profiles (ranges and defaults) as JSON.
    Modes {},
    /// Print the command line a generation would run, without running it.
    Plan(GenerateArgs),
    /// Run a generation, streaming the tool's output.
    Generate {
        #[command(flatten)]
        opts: GenerateArgs,
        /// Only print progress, not every output line.
        #[arg(long)]
        quiet: bool,
    },
}

#[derive(ClapArgs, Debug, Clone)]
pub struct GenerateArgs {
    #[arg(long, value_enum, default_value_t = Mode::Schnell)]
    pub mode: Mode,
    #[arg(long)]
    pub prompt: String,
    /// Reference image (kontext only).
    #[arg(long)]
    pub image: Option<PathBuf>,
    /// Defaults to the mode's default.
    #[arg(long)]
    pub steps: Option<u32>,
    /// Defaults to the mode's default; ignored by schnell.
    #[arg(long)]
    pub guidance: Option<f32>,
    #[arg(long, default_value_t = 1024)]
    pub width: u32,
    #[arg(long, default_value_t = 1024)]
    pub height: u32,
    #[arg(long)]
    pub seed: Option<u32>,
    /// 3, 4, 6, 8 or "none".
    #[arg(long, default_value = "3")]
    pub quantize: String,
    #[arg(long)]
    pub low_ram: bool,
    /// Enable VAE tiling with this split direction.
    #[arg(long, value_enum)]
    pub vae_tiling: Option<VaeSplit>,
    #[arg(long, value_enum)]
    pub dtype: Option<Precision>,
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
    /// Output file name; defaults to <mode>_<timestamp>.png.
    #[arg(long)]
    pub name: Option<String>,
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg = match resolve_config_path(args.config.as_deref()) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    let _guard = init_logging(&args, &cfg)?;

    match &args.cmd {
        Command::Doctor {} => doctor(&cfg),
        Command::Modes {} => modes(),
        Command::Plan(opts) => plan(&cfg, opts),
        Command::Generate { opts, quiet } => generate(&cfg, opts, *quiet),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    let default = PathBuf::from("flux-runner.toml");
    default.exists().then_some(default)
}

fn init_logging(args: &Args, cfg: &Config) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries JSON results; logs go to stderr.
    let stderr_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let file_path = resolve_log_path(cfg);
    let (file_layer, guard) = if let Some(path) = file_path.as_deref() {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from(&cfg.paths.out_dir).join("flux-runner.log"))
}

fn doctor(cfg: &Config) -> Result<()> {
    let mut report = Vec::new();
    let mut missing = 0;
    for mode in Mode::ALL {
        let tool = cfg.tools.resolve(mode);
        let found = find_on_path(&tool.program);
        if found.is_none() {
            missing += 1;
            warn!("{mode}: {} not found on PATH", tool.program);
        }
        report.push(serde_json::json!({
            "mode": mode,
            "program": tool.program,
            "prefix_args": tool.prefix_args,
            "resolved": found,
        }));
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    if missing > 0 {
        return Err(anyhow!("{missing} generator(s) not found"));
    }
    Ok(())
}

fn modes() -> Result<()> {
    let profiles: Vec<_> = Mode::ALL.iter().map(|m| m.profile()).collect();
    println!("{}", serde_json::to_string_pretty(&profiles)?);
    Ok(())
}

fn plan(cfg: &Config, opts: &GenerateArgs) -> Result<()> {
    let spec = build_spec(cfg, opts, false)?;
    let runner = Runner::new(cfg);
    let invocation = runner.invocation(&spec);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "spec": spec,
            "invocation": invocation,
            "command": invocation.display(),
        }))?
    );
    Ok(())
}

/// Turn CLI flags into a validated spec. With `stage`, the reference image is
/// copied into the staging area first.
pub fn build_spec(cfg: &Config, opts: &GenerateArgs, stage: bool) -> Result<JobSpec> {
    let out_dir = opts
        .out_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&cfg.paths.out_dir));
    let name = opts
        .name
        .clone()
        .unwrap_or_else(|| default_output_name(opts.mode, now_local()));

    let mut spec = JobSpec::new(opts.mode, opts.prompt.clone(), out_dir, name);
    let profile = opts.mode.profile();

    if let Some(steps) = opts.steps {
        spec.steps = steps;
    }
    if profile.guidance_range.is_some() {
        if let Some(g) = opts.guidance {
            spec.guidance = Some(g);
        }
    } else if opts.guidance.is_some() {
        warn!("mode {} ignores --guidance", opts.mode);
    }
    spec.width = opts.width;
    spec.height = opts.height;
    spec.seed = opts.seed;
    spec.quantize = parse_quantize(&opts.quantize)?;
    spec.low_ram = opts.low_ram;
    spec.vae_tiling = opts.vae_tiling;
    spec.precision = opts.dtype;

    if profile.requires_image {
        if let Some(image) = opts.image.as_deref() {
            spec.image_path = Some(if stage {
                stage_reference_file(Path::new(&cfg.paths.staging_dir), image)
                    .with_context(|| format!("staging reference image: {}", image.display()))?
            } else {
                image.to_path_buf()
            });
        }
    } else if opts.image.is_some() {
        warn!("mode {} ignores --image", opts.mode);
    }

    spec.validate()?;
    Ok(spec)
}

fn parse_quantize(raw: &str) -> Result<Option<Quantize>> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let bits: u8 = raw
        .parse()
        .with_context(|| format!("invalid --quantize: {raw}"))?;
    Quantize::try_from(bits).map(Some).map_err(|e| anyhow!(e))
}

fn generate(cfg: &Config, opts: &GenerateArgs, quiet: bool) -> Result<()> {
    let spec = build_spec(cfg, opts, true)?;
    let runner = Runner::new(cfg);
    let session = Session::new();
    session.reap_orphan(&runner);

    let started = now_rfc3339();
    let handle = runner
        .launch(&session, &spec)
        .context("launching generation")?;
    install_interrupt(&handle);

    info!(
        "running {} (first run may download model weights)",
        spec.mode.profile().executable
    );

    let mut tail = DisplayTail::new(cfg.runner.display_lines);
    loop {
        let batch = runner.poll_output(&handle, POLL_WAIT);
        show_lines(&batch.lines, &mut tail, quiet);
        if batch.finished {
            break;
        }
        if batch.lines.is_empty() && handle.state().is_terminal() {
            break;
        }
    }

    let result = runner.await_result(&handle);
    let rest = runner.poll_output(&handle, Duration::ZERO);
    show_lines(&rest.lines, &mut tail, quiet);

    let invocation = handle.invocation().clone();
    let report = RunReport::new(&spec, &invocation, &result, started, now_rfc3339());
    if cfg.output.write_report_json && spec.out_dir.is_dir() {
        let path = RunReport::default_path(&spec);
        if let Err(e) = report.write(&path) {
            warn!("could not write report: {e}");
        }
    }

    if cfg.output.print_summary {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "job_id": result.job_id,
                "outcome": result.outcome,
                "exit_code": result.exit_code,
                "artifact": result.artifact,
                "duration_ms": result.duration_ms,
                "message": result.summary(),
            }))?
        );
    }

    if result.is_success() {
        info!("{}", result.summary());
        return Ok(());
    }

    if !tail.is_empty() {
        eprintln!("--- last {} line(s) of generator output ---", tail.len());
        eprintln!("{}", tail.render());
    }
    Err(anyhow!(result.summary()))
}

fn show_lines(lines: &[String], tail: &mut DisplayTail, quiet: bool) {
    for line in lines {
        if let Some(p) = parse_progress(line) {
            eprint!("\rstep {}/{} ({}%)", p.current, p.total, p.percent());
            if p.current == p.total {
                eprintln!();
            }
        } else if !quiet {
            eprintln!("{line}");
        }
        tail.push(line.as_str());
    }
}

/// Ctrl-C cancels the job instead of killing us: the tool runs in its own
/// process group and would not see the terminal's SIGINT.
fn install_interrupt(handle: &JobHandle) {
    let handle = handle.clone();
    let res = ctrlc::set_handler(move || {
        warn!("interrupt received; cancelling job {}", handle.id());
        handle.cancel();
    });
    if let Err(e) = res {
        warn!("could not install Ctrl-C handler: {e}");
    }
}
