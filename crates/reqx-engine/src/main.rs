//! ReqX engine CLI
//!
//! Offline driver for the interception engine. Compiles intercept rules into
//! declarative fast-path rules, or runs requests through the full pipeline
//! against an in-memory host and prints how each one was resolved.
//!
//! Usage:
//!   reqx compile --rules rules.yaml
//!   reqx check --rules rules.yaml --url https://api.example.com/users [OPTIONS]

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use reqx_engine::config::{EngineConfig, LogFormat, RuleSet};
use reqx_engine::fast_path::FastPathCompiler;
use reqx_engine::host::{PausedRequest, RecordingHost, TabId};
use reqx_engine::transport::PanelCommand;
use reqx_engine::Engine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// ANSI color codes
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

const CHECK_TAB: TabId = 1;

/// ReqX request interception engine
#[derive(Parser, Debug)]
#[command(name = "reqx")]
#[command(
    author,
    version,
    about = "Evaluate ReqX intercept, mock and header override rules offline"
)]
struct Args {
    /// Engine configuration file (YAML)
    #[arg(short, long, global = true, env = "REQX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the declarative rules the fast path would install
    Compile {
        /// Rule file (YAML or JSON)
        #[arg(short, long)]
        rules: PathBuf,
    },
    /// Run requests through the interception pipeline
    Check {
        /// Rule file (YAML or JSON)
        #[arg(short, long)]
        rules: PathBuf,

        /// Request URL, repeat for several concurrent requests
        #[arg(short, long, required = true)]
        url: Vec<String>,

        /// Request method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Request header as `Name: value`
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Features to enable
        #[arg(
            short,
            long,
            value_delimiter = ',',
            default_values_t = [FeatureArg::Intercept, FeatureArg::Mock, FeatureArg::Headers]
        )]
        features: Vec<FeatureArg>,

        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FeatureArg {
    Intercept,
    Mock,
    Headers,
}

impl std::fmt::Display for FeatureArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FeatureArg::Intercept => "intercept",
            FeatureArg::Mock => "mock",
            FeatureArg::Headers => "headers",
        };
        f.write_str(name)
    }
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected `Name: value`, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in `{raw}`"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn init_tracing(config: &EngineConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    init_tracing(&config);

    match args.command {
        Command::Compile { rules } => compile(&config, &rules),
        Command::Check {
            rules,
            url,
            method,
            headers,
            features,
            metrics,
        } => {
            let requests = url
                .iter()
                .enumerate()
                .map(|(i, url)| {
                    headers.iter().fold(
                        PausedRequest::new(format!("cli-{}", i + 1), &method, url.as_str()),
                        |request, (name, value)| request.with_header(name, value),
                    )
                })
                .collect();
            check(config, &rules, requests, &features).await?;
            if metrics {
                println!("\n{BOLD}Metrics{RESET}");
                print!("{}", reqx_engine::metrics::collect_metrics());
            }
            Ok(())
        }
    }
}

fn compile(config: &EngineConfig, rules: &Path) -> anyhow::Result<()> {
    let rule_set = RuleSet::from_file(rules)?;
    let compiler = FastPathCompiler::new(&config.fast_path, config.cookie_rules.base_id);
    let compiled = compiler.compile(&rule_set.intercept);

    let skipped = rule_set.intercept.len() - compiled.len();
    if skipped > 0 {
        eprintln!("{YELLOW}Note:{RESET} {skipped} intercept rule(s) stay on the debugger path only");
    }
    println!("{}", serde_json::to_string_pretty(&compiled)?);
    Ok(())
}

async fn check(
    config: EngineConfig,
    rules: &Path,
    requests: Vec<PausedRequest>,
    features: &[FeatureArg],
) -> anyhow::Result<()> {
    let rule_set = RuleSet::from_file(rules)?;
    let host = Arc::new(RecordingHost::new());
    let engine = Engine::with_recording_host(config, host.clone());
    let mut port = engine.connect_panel(CHECK_TAB);

    engine
        .handle_command(
            CHECK_TAB,
            PanelCommand::InterceptorRulesSync {
                rules: rule_set.intercept,
            },
        )
        .await;
    engine
        .handle_command(
            CHECK_TAB,
            PanelCommand::MockRulesSync {
                rules: rule_set.mocks,
            },
        )
        .await;
    engine
        .handle_command(
            CHECK_TAB,
            PanelCommand::HeaderOverridesSync {
                rules: rule_set.header_overrides,
            },
        )
        .await;

    for feature in features {
        let command = match feature {
            FeatureArg::Intercept => PanelCommand::InterceptorToggle { enabled: true },
            FeatureArg::Mock => PanelCommand::MockToggle { enabled: true },
            FeatureArg::Headers => PanelCommand::HeaderOverridesToggle { enabled: true },
        };
        engine.handle_command(CHECK_TAB, command).await;
    }

    let enabled: Vec<String> = features.iter().map(ToString::to_string).collect();
    println!("{BOLD}{CYAN}ReqX check{RESET}");
    println!("{DIM}━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━{RESET}");
    println!("{DIM}Features:{RESET} {}", enabled.join(", "));
    println!(
        "{DIM}Fast-path rules installed:{RESET} {}",
        host.dynamic_rules().len()
    );

    let ids: Vec<String> = requests.iter().map(|r| r.request_id.clone()).collect();
    let summaries: Vec<String> = requests
        .iter()
        .map(|r| format!("{} {}", r.method, r.url))
        .collect();
    futures::future::join_all(
        requests
            .into_iter()
            .map(|request| engine.process_paused(CHECK_TAB, request)),
    )
    .await;

    for (id, summary) in ids.iter().zip(&summaries) {
        println!("\n{BOLD}{summary}{RESET}");
        let resolutions = host.resolutions(id);
        if resolutions.is_empty() {
            println!("  {YELLOW}unresolved{RESET}");
        }
        for resolution in resolutions {
            println!(
                "  {GREEN}resolved:{RESET} {}",
                serde_json::to_string(&resolution).context("Failed to encode resolution")?
            );
        }
    }

    println!("\n{BOLD}Panel events{RESET}");
    while let Ok(event) = port.events.try_recv() {
        println!("  {}", serde_json::to_string(&event)?);
    }

    println!("\n{BOLD}Page messages{RESET}");
    for message in host.page_messages(CHECK_TAB) {
        println!("  {}", message.to_wire());
    }

    Ok(())
}
