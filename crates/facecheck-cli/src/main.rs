use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use facecheck_core::{ComparisonConfig, FallbackPolicy, ImageInput};
use facecheck_engine::{CompareRequest, Engine, EngineConfig};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facecheck", about = "Decide whether two face images show the same person")]
struct Cli {
    /// TOML config file (overrides FACECHECK_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare two images and print the result as JSON
    Compare {
        /// First image: a file path or a data URL
        image1: String,
        /// Second image: a file path or a data URL
        image2: String,
        /// Confidence above which the faces match
        #[arg(long)]
        threshold: Option<f32>,
        /// Time budget for the whole comparison
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Result reported when the model pipeline fails
        #[arg(long, value_enum)]
        fallback: Option<Fallback>,
    },
    /// Answer a JSON comparison request read from a file or stdin
    Request {
        /// Request file; `-` or absent reads stdin
        file: Option<PathBuf>,
    },
    /// Detect faces in one image and print the regions as JSON
    Detect {
        /// A file path or a data URL
        image: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum Fallback {
    FailClosed,
    Randomized,
}

impl From<Fallback> for FallbackPolicy {
    fn from(f: Fallback) -> Self {
        match f {
            Fallback::FailClosed => FallbackPolicy::FailClosed,
            Fallback::Randomized => FallbackPolicy::LEGACY_RANDOMIZED,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let outcome = runtime.block_on(run(cli.command, &config));
    // Workers abandoned by a timed-out comparison must not hold the process open.
    runtime.shutdown_timeout(Duration::from_millis(100));
    outcome
}

fn load_config(path: Option<&std::path::Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let config = EngineConfig::from_toml_file(path)?.with_env_overrides();
            config.comparison.validate()?;
            config
        }
        None => EngineConfig::load()?,
    };
    tracing::debug!(model_dir = %config.model_dir.display(), "configuration loaded");
    Ok(config)
}

async fn run(command: Commands, config: &EngineConfig) -> Result<()> {
    match command {
        Commands::Compare {
            image1,
            image2,
            threshold,
            timeout_ms,
            fallback,
        } => {
            let engine = Engine::from_config(config)?;
            let mut overrides: ComparisonConfig = engine.defaults().clone();
            if let Some(t) = threshold {
                overrides.match_threshold = t;
            }
            if let Some(ms) = timeout_ms {
                overrides.timeout_ms = ms;
            }
            if let Some(f) = fallback {
                overrides.fallback = f.into();
            }

            let result = engine
                .compare_with(
                    ImageInput::from_arg(&image1),
                    ImageInput::from_arg(&image2),
                    &overrides,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Request { file } => {
            let engine = Engine::from_config(config)?;
            let text = match file {
                Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                _ => {
                    let mut text = String::new();
                    std::io::stdin().read_to_string(&mut text)?;
                    text
                }
            };
            let request: CompareRequest =
                serde_json::from_str(&text).context("malformed comparison request")?;
            let result = engine.handle(request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Detect { image } => {
            let engine = Engine::from_config(config)?;
            let regions = engine
                .detect(ImageInput::from_arg(&image))
                .await?
                .with_context(|| format!("detection failed ({} backend)", engine.backend_name()))?;
            println!("{}", serde_json::to_string_pretty(&regions)?);
        }
        Commands::Config => print!("{}", toml::to_string_pretty(config)?),
    }

    Ok(())
}
