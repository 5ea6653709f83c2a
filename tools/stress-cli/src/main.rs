use clap::{Args, Parser, Subcommand, ValueHint};
use serde::{Deserialize, Serialize};
use spiral_config::{
    flush_tracing, init_tracing, MonteCarloConfig, NoiseModel, ResumePoint, RunConfig,
    TracingOptions,
};
use spiral_stress::{
    replay, CemEngine, FailureCollector, FailureRecord, GaussianSequence, MonteCarloEstimator,
    MonteCarloReport, ReplayReport, RunSummary, ToySimulator, TrajectoryScorer,
};
use std::error::Error;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::info;

type DynError = Box<dyn Error>;

type Result<T> = std::result::Result<T, DynError>;

/// Reference point-agent simulator settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ToyConfig {
    goal: Vec<f64>,
    collision_threshold: f64,
}

impl ToyConfig {
    fn build(&self) -> ToySimulator {
        ToySimulator::new(self.goal.clone(), self.collision_threshold)
    }

    fn pool(&self, size: usize) -> Vec<ToySimulator> {
        (0..size.max(1)).map(|_| self.build()).collect()
    }
}

/// On-disk scenario: nominal noise, simulator, and the run sections.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Scenario {
    noise: NoiseModel,
    simulator: ToyConfig,
    #[serde(default)]
    run: Option<RunConfig>,
    #[serde(default)]
    monte_carlo: Option<MonteCarloConfig>,
}

impl Scenario {
    fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let scenario: Scenario = serde_json::from_str(&raw)?;
        if scenario.simulator.goal.len() != scenario.noise.dim() {
            return Err(invalid_input(format!(
                "simulator goal has {} dimensions but the noise model has {}",
                scenario.simulator.goal.len(),
                scenario.noise.dim()
            )));
        }
        Ok(scenario)
    }

    fn nominal(&self, steps: usize) -> Result<GaussianSequence> {
        Ok(GaussianSequence::from_noise_model(&self.noise, steps)?)
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Adaptive importance sampling stress tests for closed-loop controllers"
)]
struct Cli {
    /// Log every evaluated member, not just generation summaries
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search for failure-inducing disturbances with the cross-entropy method
    Cem(CemArgs),

    /// Estimate the failure probability by sampling the nominal distribution
    MonteCarlo(MonteCarloArgs),

    /// Re-run the collisions recorded in a trajectory log
    Replay(ReplayArgs),
}

#[derive(Args)]
struct CemArgs {
    /// Scenario file (JSON) with `noise`, `simulator` and `run` sections
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: PathBuf,

    /// Override the scenario seed
    #[arg(long)]
    seed: Option<u64>,

    /// Override the number of worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Continue an interrupted run at this generation
    #[arg(long, requires = "resume_sample")]
    resume_generation: Option<usize>,

    /// First member of the resumed generation that still needs simulating
    #[arg(long, requires = "resume_generation")]
    resume_sample: Option<usize>,

    /// Destination for the run summary JSON payload
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

#[derive(Args)]
struct MonteCarloArgs {
    /// Scenario file (JSON) with `noise`, `simulator` and `monte_carlo` sections
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: PathBuf,

    /// Override the scenario seed
    #[arg(long)]
    seed: Option<u64>,

    /// Destination for the estimate JSON payload
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

#[derive(Args)]
struct ReplayArgs {
    /// Scenario file (JSON); only `noise` and `simulator` are used
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: PathBuf,

    /// Trajectory log to replay
    #[arg(long, value_hint = ValueHint::FilePath)]
    log: PathBuf,

    /// Where the replayed rows are appended
    #[arg(long, value_hint = ValueHint::FilePath)]
    replay_log: PathBuf,

    /// Destination for the replay report JSON payload
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

#[derive(Serialize)]
struct CemOutput {
    summary: RunSummary,
    failures: Vec<FailureRecord>,
}

fn main() {
    let code = match try_main() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    };
    flush_tracing();
    std::process::exit(code);
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let directive = if cli.verbose { "debug" } else { "info" };
    init_tracing(TracingOptions::from_env()?.with_default_directive(directive))?;

    match &cli.command {
        Command::Cem(args) => run_cem(args),
        Command::MonteCarlo(args) => run_monte_carlo(args),
        Command::Replay(args) => run_replay(args),
    }
}

fn run_cem(args: &CemArgs) -> Result<()> {
    let scenario = Scenario::load(&args.config)?;
    let mut config = scenario
        .run
        .clone()
        .ok_or_else(|| invalid_input("scenario has no `run` section"))?;
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let (Some(generation), Some(sample)) = (args.resume_generation, args.resume_sample) {
        config.resume = ResumePoint { generation, sample };
    }
    let objective = config.objective;
    let nominal = scenario.nominal(config.steps)?;
    let pool = scenario.simulator.pool(config.workers);
    let failures = FailureCollector::new();
    let mut engine = CemEngine::new(config, nominal, pool)?.with_tracker(Box::new(failures.clone()));
    let report = engine.run()?;
    let summary = RunSummary::new(&report, objective);
    info!(
        state = ?summary.state,
        collisions = summary.collisions,
        collision_rate = summary.collision_rate,
        "writing run summary"
    );
    write_json(
        &CemOutput {
            summary,
            failures: failures.failures(),
        },
        &args.output,
    )
}

fn run_monte_carlo(args: &MonteCarloArgs) -> Result<()> {
    let scenario = Scenario::load(&args.config)?;
    let mut config = scenario
        .monte_carlo
        .clone()
        .ok_or_else(|| invalid_input("scenario has no `monte_carlo` section"))?;
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    let nominal = scenario.nominal(config.steps)?;
    let pool = scenario.simulator.pool(config.workers);
    let report: MonteCarloReport = MonteCarloEstimator::new(config, nominal, pool)?.run()?;
    write_json(&report, &args.output)
}

fn run_replay(args: &ReplayArgs) -> Result<()> {
    let scenario = Scenario::load(&args.config)?;
    let (schema, _) = spiral_stress::TrajectoryLog::read(&args.log)?;
    let steps = scenario
        .run
        .as_ref()
        .map(|run| run.steps)
        .or_else(|| scenario.monte_carlo.as_ref().map(|mc| mc.steps))
        .ok_or_else(|| invalid_input("scenario defines neither `run` nor `monte_carlo`"))?;
    if schema.noise_dim != scenario.noise.dim() {
        return Err(invalid_input(format!(
            "log has {} noise columns but the scenario noise model has {}",
            schema.noise_dim,
            scenario.noise.dim()
        )));
    }
    let risk_mode = scenario
        .run
        .as_ref()
        .map(|run| run.risk_mode)
        .unwrap_or_default();
    let nominal = scenario.nominal(steps)?;
    let mut simulator = scenario.simulator.build();
    let report: ReplayReport = replay(
        &args.log,
        &args.replay_log,
        &mut simulator,
        &nominal,
        &TrajectoryScorer::new(risk_mode),
    )?;
    write_json(&report, &args.output)
}

fn write_json<T: Serialize>(payload: &T, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    let payload = serde_json::to_string_pretty(payload)?;
    fs::write(path, payload)?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn invalid_input(message: impl Into<String>) -> DynError {
    Box::new(io::Error::new(ErrorKind::InvalidInput, message.into()))
}
