//! evalpool CLI - concurrent evaluation of LLM endpoints.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use evalpool::client::HealthStatus;
use evalpool::{Config, EvalPipeline, LLMClient};
use std::path::{Path, PathBuf};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "evalpool")]
#[command(version)]
#[command(about = "Concurrent evaluation of LLM endpoints against ground-truth answers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a batch of samples
    Eval {
        /// Path to input samples JSONL file
        #[arg(short, long)]
        samples: PathBuf,

        /// Path to output JSONL file (defaults to output.path from the config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum number of samples evaluated at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Completions per sample for samples that do not set `n`
        #[arg(short = 'n', long = "samples-per-prompt")]
        samples_per_prompt: Option<usize>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Validate configuration file
    Validate,

    /// Check that every configured endpoint is reachable
    Health,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn print_example_config() {
    let example = r#"# evalpool configuration file

# One entry per inference server. Requests are spread round-robin.
[[endpoints]]
name = "local-0"
base_url = "http://localhost:8000/v1"

[[endpoints]]
name = "local-1"
base_url = "http://localhost:8001/v1"
# api_key = "sk-..."
# api_key_env = "LOCAL_API_KEY"
# headers = { "X-Team" = "${TEAM_ID}" }

[client]
timeout_secs = 1800

[retry]
max_attempts = 20
base_delay_secs = 5.0
max_delay_secs = 90.0
# Pick a fresh endpoint on every attempt instead of one per sample
rotate_endpoints = false

[generation]
model = "Qwen/Qwen3-4B"
max_tokens = 39936
temperature = 1.0
samples_per_prompt = 4

[scheduler]
max_concurrency = 2048

[scoring]
# "strict_reasoning" grades only the text after the delimiter
# "no_reasoning" grades the whole response
policy = "strict_reasoning"
delimiter = "</think>"

[output]
path = "results.jsonl"
"#;
    println!("{example}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            let endpoints = config
                .resolve_endpoints()
                .context("Failed to resolve endpoints")?;

            info!("Configuration is valid");
            for endpoint in &endpoints {
                info!(
                    "  Endpoint: {} ({}){}",
                    endpoint.name,
                    endpoint.base_url,
                    if endpoint.api_key.is_some() { " [auth]" } else { "" }
                );
            }
            info!("  Model: {}", config.generation.model);
            info!("  Samples per prompt: {}", config.generation.samples_per_prompt);
            info!("  Max concurrency: {}", config.scheduler.max_concurrency);
            info!(
                "  Retry: {} attempts, {}s base, {}s cap",
                config.retry.max_attempts, config.retry.base_delay_secs, config.retry.max_delay_secs
            );
            info!("  Scoring: {:?}", config.scoring.policy);
        }

        Commands::Health => {
            let config = load_config(&cli.config)?;
            let endpoints = config
                .resolve_endpoints()
                .context("Failed to resolve endpoints")?;
            let client = LLMClient::new(config.client.timeout_secs)?;

            let mut healthy = 0;
            for endpoint in &endpoints {
                let result = client.health_check(endpoint).await;
                let latency = result
                    .latency_ms
                    .map(|ms| format!("{ms}ms"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<20} {:<12} {:>8}  {}",
                    result.endpoint,
                    result.status.to_string(),
                    latency,
                    result.error.as_deref().unwrap_or("")
                );
                if result.status == HealthStatus::Healthy {
                    healthy += 1;
                } else {
                    warn!(endpoint = %result.endpoint, status = %result.status, "Endpoint not healthy");
                }
            }

            if healthy == 0 {
                bail!("No healthy endpoints");
            }
            info!(healthy, total = endpoints.len(), "Health check complete");
        }

        Commands::Eval {
            samples,
            output,
            concurrency,
            samples_per_prompt,
            no_progress,
        } => {
            let mut config = load_config(&cli.config)?;

            // Override config from CLI
            if let Some(n) = samples_per_prompt {
                config.generation.samples_per_prompt = n;
            }
            if let Some(k) = concurrency {
                config.scheduler.max_concurrency = k;
            }
            config.validate().context("Invalid command-line override")?;

            let output = output.unwrap_or_else(|| config.output.path.clone());

            let pipeline = EvalPipeline::from_config(&config)
                .context("Failed to set up evaluation pipeline")?
                .with_progress(!no_progress);
            let samples_data = EvalPipeline::load_samples(&samples)
                .with_context(|| format!("Failed to load samples from {samples:?}"))?;

            let eval = pipeline.run(samples_data, &output).await?;
            let report = &eval.report;

            println!("\n=== Evaluation Complete ===");
            println!("Run:         {}", report.run_id);
            println!("Samples:     {}", report.total_samples);
            println!("Failed:      {}", report.failed_samples);
            println!(
                "Correct:     {}/{}",
                report.correct_responses, report.total_responses
            );
            println!("Mean score:  {:.4}", report.mean_score);
            println!("Throughput:  {:.0}/hr", report.throughput_per_hour);
            println!("Runtime:     {:.1}s", report.runtime_secs);
            for usage in &report.usage {
                println!(
                    "Endpoint:    {} ({} attempts, {} ok, {} transient, {} fatal)",
                    usage.endpoint,
                    usage.attempts,
                    usage.successes,
                    usage.transient_failures,
                    usage.fatal_failures
                );
            }
            println!("Output:      {output:?}");
        }
    }

    Ok(())
}
