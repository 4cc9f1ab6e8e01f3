use aps_automation::activity::{delete_activity, deploy_activity, load_activity_file};
use aps_automation::appbundle::{delete_appbundle, deploy_appbundle, load_appbundle_file, publish_update};
use aps_automation::descriptor::load_job_file;
use aps_automation::oss::{create_bucket, OssTransfer, PolicyKey};
use aps_automation::signals::shutdown_signal;
use aps_automation::workitem::{cancel_work_item, work_item_status};
use aps_automation::{
    account, load_config, ApsClient, AuthContext, AutomationConfig, BearerToken,
    DesignAutomationExecutor, MonitorError, RemoteJobMonitor, RunError,
    WorkItemRunner,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

type CliResult = Result<ExitCode, Box<dyn std::error::Error>>;

/// Deploy Design Automation app bundles and activities, run work items and
/// wait for their results.
#[derive(Parser, Debug)]
#[command(name = "aps-automation", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "aps.toml", global = true)]
    config: PathBuf,

    /// Bearer token for APS calls
    #[arg(long, env = "APS_ACCESS_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Debug logging (requests, poll decisions)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the account nickname, or try to set it
    Nickname {
        #[arg(long, value_name = "NICKNAME")]
        set: Option<String>,
    },
    /// OSS buckets
    Bucket {
        #[command(subcommand)]
        action: BucketAction,
    },
    /// App bundles
    Bundle {
        #[command(subcommand)]
        action: BundleAction,
    },
    /// Activities
    Activity {
        #[command(subcommand)]
        action: ActivityAction,
    },
    /// Upload inputs, submit a work item, wait, download outputs
    Run {
        /// Job file (TOML)
        job: PathBuf,
        /// Give up waiting after this many seconds (overrides config)
        #[arg(long, value_name = "SECS")]
        max_wait: Option<u64>,
        /// Seconds between status queries (overrides config)
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print a work item's current status
    Status { id: String },
    /// Cancel a running work item
    Cancel { id: String },
    /// Print the resolved configuration
    Config,
}

#[derive(Subcommand, Debug)]
enum BucketAction {
    Create {
        key: String,
        /// transient, temporary or persistent (default: from config)
        #[arg(long)]
        policy: Option<PolicyKey>,
        /// Storage region (default: from config)
        #[arg(long)]
        region: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum BundleAction {
    /// Register a new app bundle, upload it and create its alias
    Deploy { definition: PathBuf },
    /// Upload a new version and move the alias to it
    Publish { definition: PathBuf },
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum ActivityAction {
    /// Create the activity and alias its first version
    Deploy { definition: PathBuf },
    Delete { id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "aps_automation=debug"
    } else if cli.quiet {
        "aps_automation=warn"
    } else {
        "aps_automation=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(?cli.command, "parsed CLI arguments");

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> CliResult {
    let config = load_config(&cli.config)?;
    let auth = match cli.token {
        Some(token) => AuthContext::with_token(BearerToken::new(token)),
        None => AuthContext::empty(),
    };
    let client = ApsClient::new(&config, auth)?;

    match cli.command {
        Command::Nickname { set } => {
            let nickname = match set {
                Some(requested) => account::set_nickname(&client, &requested).await?,
                None => account::get_nickname(&client).await?,
            };
            println!("{nickname}");
        }
        Command::Bucket {
            action: BucketAction::Create { key, policy, region },
        } => {
            let policy = match policy {
                Some(p) => p,
                None => config.storage.policy_key.parse::<PolicyKey>()?,
            };
            let region = region.unwrap_or_else(|| config.storage.region.clone());
            create_bucket(&client, &key, policy, &region).await?;
            println!("created bucket {key} ({}, {region})", policy.as_str());
        }
        Command::Bundle { action } => match action {
            BundleAction::Deploy { definition } => {
                let def = load_appbundle_file(&definition)?;
                let version = deploy_appbundle(&client, &def).await?;
                let nickname = account::get_nickname(&client).await?;
                println!("{} (version {version})", def.full_alias(&nickname));
            }
            BundleAction::Publish { definition } => {
                let def = load_appbundle_file(&definition)?;
                let summary = publish_update(&client, &def).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            BundleAction::Delete { id } => {
                delete_appbundle(&client, &id).await?;
                println!("deleted app bundle {id}");
            }
        },
        Command::Activity { action } => match action {
            ActivityAction::Deploy { definition } => {
                let def = load_activity_file(&definition)?;
                let version = deploy_activity(&client, &def).await?;
                let nickname = account::get_nickname(&client).await?;
                println!("{} (version {version})", def.full_alias(&nickname));
            }
            ActivityAction::Delete { id } => {
                delete_activity(&client, &id).await?;
                println!("deleted activity {id}");
            }
        },
        Command::Run {
            job,
            max_wait,
            interval,
            json,
        } => return run_job(&config, client, job, max_wait, interval, json).await,
        Command::Status { id } => {
            let status = work_item_status(&client, &id).await?;
            println!("{}: {} ({})", status.id, status.job_status(), status.status);
            if let Some(progress) = &status.progress {
                println!("progress: {progress}");
            }
            if let Some(report) = &status.report_url {
                println!("report: {report}");
            }
        }
        Command::Cancel { id } => {
            cancel_work_item(&client, &id).await?;
            println!("cancellation requested for {id}");
        }
        Command::Config => print!("{}", toml::to_string_pretty(&config)?),
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_job(
    config: &AutomationConfig,
    client: ApsClient,
    job: PathBuf,
    max_wait: Option<u64>,
    interval: Option<u64>,
    json: bool,
) -> CliResult {
    let descriptor = load_job_file(&job)?;
    let policy = config.poll.overridden(max_wait, interval).policy()?;

    let transfer = OssTransfer::new(
        client.clone(),
        config.storage.policy_key.parse::<PolicyKey>()?,
        config.storage.region.clone(),
    );
    let executor = DesignAutomationExecutor::new(client, config.report.clone());
    let runner = WorkItemRunner::new(RemoteJobMonitor::new(executor), transfer);

    let outcome = match runner.run_until(&descriptor, &policy, shutdown_signal()).await {
        Ok(outcome) => outcome,
        Err(RunError::Monitor(e @ MonitorError::Aborted { .. })) => {
            if let Some(handle) = e.handle() {
                eprintln!("{e}");
                eprintln!("work item {handle} is still running; check it with `aps-automation status {handle}`");
            }
            return Ok(ExitCode::from(130));
        }
        Err(RunError::Monitor(e @ MonitorError::Timeout { .. })) => {
            eprintln!("{e}");
            return Ok(ExitCode::from(2));
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        let value = serde_json::json!({
            "result": outcome.result,
            "downloaded": outcome.downloaded,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        let result = &outcome.result;
        println!(
            "{} ({}) after {:.1}s, {} polls",
            result.status,
            result.remote_status,
            result.elapsed.as_secs_f64(),
            result.polls
        );
        for path in &outcome.downloaded {
            println!("downloaded {}", path.display());
        }
        if let Some(report) = &result.report_url {
            println!("report: {report}");
        }
        if let Some(diagnostics) = result.diagnostics.as_deref().filter(|_| !result.succeeded()) {
            println!("--- report excerpt ---\n{diagnostics}");
        }
    }

    Ok(if outcome.result.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
