use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Polls an stq scheduler server for work and executes it locally.
#[derive(Parser)]
#[command(name = "stq-runner", about = "stq runner client")]
struct Cli {
    /// Base URL of the stq scheduler server, e.g. http://localhost:8080.
    #[arg(long)]
    server: String,

    /// Seconds to sleep between polls when no attempt is available.
    #[arg(long, default_value_t = 5.0)]
    wait_time: f64,

    /// Identifier this runner reports itself as. Random if unset.
    #[arg(long, default_value_t = random_runner_id())]
    runner_id: String,

    /// Execute the returned command through a shell instead of tokenizing
    /// it as argv. Only enable this against trusted schedulers.
    #[arg(long)]
    risky: bool,
}

fn random_runner_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    format!("runner-{}", hex::encode(bytes))
}

#[derive(Deserialize)]
#[serde(tag = "status")]
enum AttemptResponse {
    #[serde(rename = "attempt")]
    Attempt {
        task_id: i64,
        command: String,
        attempt_id: i64,
    },
    #[serde(rename = "no attempt")]
    NoAttempt,
}

#[derive(Serialize)]
struct AttemptReport<'a> {
    runner_id: &'a str,
    task_id: i64,
    attempt_id: i64,
    status: &'a str,
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    info!(runner_id = %cli.runner_id, server = %cli.server, "stq-runner starting");

    loop {
        match poll_once(&client, &cli).await {
            Ok(true) => {}
            Ok(false) => {
                tokio::time::sleep(Duration::from_secs_f64(cli.wait_time)).await;
            }
            Err(err) => {
                error!(error = %err, "poll failed, backing off");
                tokio::time::sleep(Duration::from_secs_f64(cli.wait_time)).await;
            }
        }
    }
}

/// Poll once. Returns `Ok(true)` if an attempt was run (caller should poll
/// again immediately), `Ok(false)` if there was nothing to do.
async fn poll_once(client: &reqwest::Client, cli: &Cli) -> Result<bool> {
    let url = format!("{}/attempt", cli.server.trim_end_matches('/'));
    let resp: AttemptResponse = client
        .get(&url)
        .query(&[("runner_id", cli.runner_id.as_str())])
        .send()
        .await
        .context("failed to poll for an attempt")?
        .json()
        .await
        .context("failed to parse attempt response")?;

    let (task_id, command, attempt_id) = match resp {
        AttemptResponse::NoAttempt => return Ok(false),
        AttemptResponse::Attempt {
            task_id,
            command,
            attempt_id,
        } => (task_id, command, attempt_id),
    };

    info!(task_id, attempt_id, %command, "running attempt");
    let outcome = run_command(&command, cli.risky).await;

    let report = match &outcome {
        Ok(()) => AttemptReport {
            runner_id: &cli.runner_id,
            task_id,
            attempt_id,
            status: "completed",
            message: None,
        },
        Err(err) => AttemptReport {
            runner_id: &cli.runner_id,
            task_id,
            attempt_id,
            status: "failed",
            message: Some(err.to_string()),
        },
    };

    if let Err(err) = &outcome {
        warn!(task_id, attempt_id, error = %err, "attempt failed");
    }

    let report_url = format!("{}/attempt", cli.server.trim_end_matches('/'));
    client
        .put(&report_url)
        .form(&report)
        .send()
        .await
        .context("failed to report attempt outcome")?;

    Ok(true)
}

async fn run_command(command: &str, risky: bool) -> Result<()> {
    let status = if risky {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .await
            .context("failed to spawn shell")?
    } else {
        let argv = shell_words::split(command).context("failed to tokenize command")?;
        let Some((program, args)) = argv.split_first() else {
            anyhow::bail!("empty command");
        };
        tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .context("failed to spawn command")?
    };

    if status.success() {
        Ok(())
    } else {
        anyhow::bail!("command exited with status {status}")
    }
}
