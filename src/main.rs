//! trainrelay CLI entry point
//!
//! Each subcommand drives its relay work on a dedicated event loop, so the
//! entry point itself stays synchronous.

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use trainrelay::channels::Channel;
use trainrelay::config::AppConfig;
use trainrelay::jobs::{ExternalCommand, JobRunner};
use trainrelay::plugin::{CommandRequest, Plugin};
use trainrelay::relay::fetch_logs;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::from_env().context("Invalid configuration")?;
    if let Some(url) = cli.relay_url {
        config.relay.url = url;
    }
    if let Some(channel) = cli.channel {
        Channel::parse(&channel).with_context(|| format!("Invalid channel: {}", channel))?;
        config.relay.channel = channel;
    }

    match cli.command {
        Commands::Run { cwd, command } => run(config, cwd, command),
        Commands::Logs => logs(config),
        Commands::Token {
            subject,
            for_channel,
        } => token(config, subject, for_channel),
        Commands::Dispatch {
            command,
            kwargs,
            wait,
        } => dispatch(config, command, kwargs, wait),
    }
}

fn run(config: AppConfig, cwd: Option<String>, command: Vec<String>) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("No command given");
    };

    let mut external = ExternalCommand::new(program.as_str()).args(args.iter().cloned());
    if let Some(dir) = cwd {
        external = external.current_dir(dir);
    }

    let heartbeat = config
        .gateway
        .heartbeat()
        .context("Invalid Pushgateway configuration")?;
    let channel = config.relay.channel.clone();
    let runner = JobRunner::new(config.relay, channel, heartbeat);

    info!(command = %external, channel = %runner.channel(), "Running job");
    let outcome = runner.run_blocking(&external).context("Job failed")?;

    if !outcome.success {
        bail!("Command exited unsuccessfully (exit code {:?})", outcome.exit_code);
    }
    Ok(())
}

fn logs(config: AppConfig) -> Result<()> {
    let lines = fetch_logs(&config.relay, &config.relay.channel)
        .with_context(|| format!("Failed to fetch history of {}", config.relay.channel))?;

    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

fn token(config: AppConfig, subject: String, for_channel: Option<String>) -> Result<()> {
    let issuer = config.relay.issuer();

    let token = match for_channel {
        Some(channel) => issuer
            .issue_subscription_token(&subject, &channel)
            .with_context(|| format!("Cannot issue subscription token for {}", channel))?,
        None => issuer
            .issue_client_token(&subject)
            .context("Cannot issue connection token")?,
    };

    println!("{}", token);
    Ok(())
}

fn dispatch(
    config: AppConfig,
    command: String,
    kwargs: serde_json::Map<String, serde_json::Value>,
    wait: bool,
) -> Result<()> {
    let plugin = Plugin::new(config).context("Failed to build plugin")?;

    let mut request = CommandRequest::new(command);
    request.kwargs = kwargs;
    let response = plugin.dispatch(request);
    println!("{}", serde_json::to_string_pretty(&response)?);

    if wait {
        if let Some(run_id) = response.result.get("run_id").and_then(|v| v.as_str()) {
            let handle = plugin
                .jobs()
                .take(run_id)
                .with_context(|| format!("Unknown run {}", run_id))?;
            let outcome = handle.join().context("Training job failed")?;
            println!("{}", json!({ "run_id": run_id, "outcome": outcome }));
        }
    }
    Ok(())
}
