//! E2E suite entry point
//!
//! Runs the YAML scenarios against a live AlertWatch deployment.
//! Run with: cargo test --package alertwatch-e2e --test e2e -- --tag smoke
//!
//! Credentials come from `ALERTWATCH_{ADMIN,NORMAL}_{USERNAME,PASSWORD}`.
//! With none of them set the suite is skipped; with only some set it fails.

use std::path::PathBuf;
use std::sync::Arc;

use alertwatch_common::config::credential_vars;
use alertwatch_common::{HarnessConfig, IdentityConfig, UserType};
use alertwatch_e2e::playwright::{Browser, PlaywrightConfig, PlaywrightDriver};
use alertwatch_e2e::runner::preflight;
use alertwatch_e2e::{E2eResult, RunnerConfig, TestRunner};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "alertwatch-e2e")]
#[command(about = "E2E scenario runner for the AlertWatch dashboard")]
struct Args {
    /// Harness configuration file (TOML)
    #[arg(short, long, env = "ALERTWATCH_CONFIG", default_value = "alertwatch.toml")]
    config: PathBuf,

    /// Directory of YAML scenarios
    #[arg(short, long, env = "ALERTWATCH_SPECS", default_value = "scenarios")]
    specs: PathBuf,

    /// Run only scenarios with this tag
    #[arg(short, long)]
    tag: Option<String>,

    /// Run only scenarios whose name contains this
    #[arg(short, long)]
    name: Option<String>,

    /// Browser to use (chromium, firefox, webkit)
    #[arg(long, env = "ALERTWATCH_BROWSER", default_value = "chromium")]
    browser: Browser,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Discard stored sessions and log in from scratch
    #[arg(long)]
    fresh_sessions: bool,

    /// Write screenshots as new baselines instead of comparing
    #[arg(long)]
    update_baselines: bool,

    /// Output directory for results (overrides the config file)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {}", e);
            std::process::exit(2);
        }
    };

    match rt.block_on(async_main(args)) {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }
}

/// True when not a single credential variable is set
fn credentials_unconfigured() -> bool {
    UserType::all().iter().all(|user_type| {
        let (user_var, pass_var) = credential_vars(*user_type);
        std::env::var_os(user_var).is_none() && std::env::var_os(pass_var).is_none()
    })
}

async fn async_main(args: Args) -> E2eResult<bool> {
    if credentials_unconfigured() {
        warn!("No ALERTWATCH_* credentials configured; skipping E2E scenarios");
        return Ok(true);
    }

    let mut harness = HarnessConfig::load(&args.config)?;
    harness.apply_env(|key| std::env::var(key).ok());
    if let Some(output) = args.output {
        harness.output.debug_dir = output.join("debug");
        harness.output.results_dir = output;
    }
    harness.validate()?;
    let identities = IdentityConfig::from_process_env()?;

    preflight(harness.base_url()).await?;

    let driver = Arc::new(
        PlaywrightDriver::launch(PlaywrightConfig {
            browser: args.browser,
            headless: !args.headed,
            default_timeout: std::time::Duration::from_millis(harness.waits.element_timeout_ms),
            ..Default::default()
        })
        .await?,
    );

    let config = RunnerConfig {
        harness,
        identities,
        specs_dir: args.specs,
        tag: args.tag,
        name: args.name,
        fresh_sessions: args.fresh_sessions,
        update_baselines: args.update_baselines,
    };

    let passed = {
        let mut runner = TestRunner::new(config, driver.clone())?;
        let results = runner.run_all().await?;
        runner.write_results(&results)?;
        results.all_passed()
    };

    match Arc::try_unwrap(driver) {
        Ok(driver) => driver.close().await?,
        Err(_) => info!("Browser still referenced; leaving it to exit with the process"),
    }

    Ok(passed)
}
