use clap::{Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use captcha_vision::config::{self, Config};
use captcha_vision::{
    ChallengeKind, Engine, Experiment, RecognitionClient, TesseractClient, TrialOutcome, VlmClient,
    VlmConfig, WebDriverLauncher, check_health, check_webdriver,
};

/// Bound on each reachability probe in `check`
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Captcha Vision - cross-browser CAPTCHA recognition experiments
#[derive(Parser, Debug)]
#[command(
    name = "captcha-vision",
    about = "Measure how well a vision model solves CAPTCHAs across browser engines",
    after_help = "ENVIRONMENT VARIABLES:\n\
        CAPTCHA_VISION_VLM_API_KEY      Vision model credential (or DASHSCOPE_API_KEY)\n\
        CAPTCHA_VISION_VLM_ENDPOINT     Chat-completions endpoint URL\n\
        CAPTCHA_VISION_VLM_MODEL        Vision model name\n\
        CAPTCHA_VISION_WEBDRIVER_*      WebDriver URL per engine\n\
        CAPTCHA_VISION_TRIAL_TIMEOUT    Bound on one trial (seconds)\n\
        CAPTCHA_VISION_OCR_TIMEOUT      Bound on one tesseract run (seconds)\n\
        RUST_LOG                        Log filter (default: info)"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an experiment (the default)
    Run(RunArgs),

    /// Check that the WebDriver endpoints and the vision model are reachable
    Check {
        /// Comma-separated engines to probe
        #[arg(short, long, env = "CAPTCHA_VISION_ENGINES")]
        engines: Option<String>,
    },
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Challenge kind: math, chinese-click or alphanumeric-text
    #[arg(short, long, env = "CAPTCHA_VISION_KIND")]
    kind: Option<ChallengeKind>,

    /// Comma-separated engines: chromium, firefox, webkit
    #[arg(short, long, env = "CAPTCHA_VISION_ENGINES")]
    engines: Option<String>,

    /// Trials per engine
    #[arg(short, long, env = "CAPTCHA_VISION_TRIALS")]
    trials: Option<usize>,

    /// Which recognizer reads the challenge
    #[arg(short, long, value_enum, default_value = "vlm")]
    recognizer: Recognizer,

    /// Delay between trials in milliseconds
    #[arg(short, long, env = "CAPTCHA_VISION_INTER_TRIAL_DELAY")]
    delay: Option<u64>,

    /// Directory for the report and trial log
    #[arg(long, env = "CAPTCHA_VISION_REPORT_DIR")]
    report_dir: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Recognizer {
    /// Vision language model over HTTP
    #[default]
    Vlm,
    /// Local tesseract baseline
    Ocr,
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Some(Commands::Check { engines }) => check(engines).await,
        Some(Commands::Run(run_args)) => run(run_args).await,
        None => run(RunArgs::default()).await,
    }
}

async fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let mut config = Config::from_env();
    if let Some(kind) = args.kind {
        config.experiment.kind = kind;
    }
    if let Some(engines) = &args.engines {
        config.experiment.engines = config::parse_engines(engines);
    }
    if let Some(trials) = args.trials {
        config.experiment.trials_per_engine = trials;
    }
    if let Some(delay) = args.delay {
        config.experiment.inter_trial_delay = delay;
    }
    if let Some(dir) = args.report_dir {
        config.experiment.report_dir = dir;
    }

    // Fail before any browser starts
    config.validate(args.recognizer == Recognizer::Vlm)?;

    let recognizer: Arc<dyn RecognitionClient> = match args.recognizer {
        Recognizer::Vlm => Arc::new(VlmClient::new(VlmConfig::from_settings(&config.vlm)?)?),
        Recognizer::Ocr => Arc::new(
            TesseractClient::new(config.experiment.kind)
                .with_timeout(config.experiment.ocr_timeout()),
        ),
    };
    let launcher = Arc::new(WebDriverLauncher::new(config.browser.clone()));

    let completed = Experiment::new(&config, launcher, recognizer)
        .run(&config.experiment.engines, config.experiment.trials_per_engine)
        .await?;
    let report = &completed.report;

    println!("{}", report.title);
    println!(
        "  Overall: {}/{} ({:.2}%) in {:.2}s",
        report.total_success, report.total_runs, report.accuracy, report.duration
    );
    for engine in &report.engines {
        println!(
            "  {:<9} {}/{} ({:.2}%)",
            engine.engine.as_str(),
            engine.success,
            engine.total,
            engine.accuracy
        );
    }
    for (name, variant) in &report.variants {
        println!(
            "  {:<9} {}/{} ({:.2}%)",
            name, variant.success, variant.total, variant.accuracy
        );
    }
    let failures: Vec<String> = report
        .failure_breakdown
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(outcome, count)| format!("{}={}", outcome, count))
        .collect();
    if !failures.is_empty() {
        println!("  Failures: {}", failures.join(", "));
    }
    if report.engines.len() > 1 {
        println!("  Cross-engine std dev: {:.2}", report.consistency);
    }
    println!();
    println!("Report:   {}", completed.report_path.display());
    println!("Trials:   {}", completed.trials_path.display());
    println!("Evidence: {}", completed.session_dir.display());

    if report.total_runs > 0
        && report.failure_breakdown.get(&TrialOutcome::InfrastructureError) == Some(&report.total_runs)
    {
        eprintln!("Warning: every trial hit an infrastructure error; run `captcha-vision check`");
    }

    Ok(())
}

async fn check(engines: Option<String>) -> Result<(), Box<dyn Error>> {
    let config = Config::from_env();
    let engines: Vec<Engine> = match engines {
        Some(list) => config::parse_engines(&list),
        None => config.experiment.engines.clone(),
    };

    let mut all_ok = true;
    for engine in engines {
        let url = config.browser.webdriver_url(engine);
        let ok = check_webdriver(url, PROBE_TIMEOUT).await;
        all_ok &= ok;
        println!(
            "{:<9} {} at {}: {}",
            engine.as_str(),
            engine.driver_name(),
            url,
            if ok { "ready" } else { "not reachable" }
        );
    }

    let vlm_ok = check_health(&config.vlm.endpoint, PROBE_TIMEOUT).await;
    all_ok &= vlm_ok;
    println!(
        "vlm       {} at {}: {}",
        config.vlm.model,
        config.vlm.endpoint,
        if vlm_ok { "responding" } else { "not reachable" }
    );
    if config.vlm.api_key.is_none() {
        println!("          no credential set ({})", config::ENV_VLM_API_KEY);
    }

    if !all_ok {
        return Err("one or more services are unavailable".into());
    }
    Ok(())
}
