//! alertctl - command-line client for alertd
//!
//! Lists and manages alerts, shows root-cause analyses, applies rules
//! and pushes ad-hoc samples.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use commands::{alerts, ops, rules};
use std::path::PathBuf;

/// alertctl
#[derive(Parser)]
#[command(name = "alertctl")]
#[command(author, version, about = "CLI for the alerting and root-cause analysis engine", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via ALERTCTL_API_URL env var)
    #[arg(long, env = "ALERTCTL_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table", global = true)]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and manage alerts
    #[command(subcommand)]
    Alerts(AlertCommands),

    /// Show the root-cause analysis for an alert
    Analysis {
        /// Alert ID
        id: String,

        /// Request a fresh analysis instead of showing the stored one
        #[arg(long)]
        refresh: bool,
    },

    /// Show alerts grouped by aggregation rules
    Aggregated,

    /// Manage alert rules
    #[command(subcommand)]
    Rules(RuleCommands),

    /// Push a metric sample
    Push {
        /// Metric name
        metric: String,

        /// Sample value
        value: f64,

        /// Label as key=value, repeatable
        #[arg(long = "label", short)]
        labels: Vec<String>,

        /// RFC 3339 timestamp, defaults to now
        #[arg(long)]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Show daemon health
    Health,
}

#[derive(Subcommand)]
pub enum AlertCommands {
    /// List alerts
    List {
        /// Filter by status (pending, firing, acknowledged, resolved)
        #[arg(long, short)]
        status: Option<String>,
    },

    /// Show one alert
    Show {
        /// Alert ID
        id: String,
    },

    /// Acknowledge a firing alert
    Ack {
        /// Alert ID
        id: String,

        /// Who is acknowledging
        #[arg(long)]
        actor: Option<String>,
    },

    /// Resolve an alert by hand
    Resolve {
        /// Alert ID
        id: String,

        /// Who is resolving
        #[arg(long)]
        actor: Option<String>,
    },

    /// Show notification deliveries for an alert
    Deliveries {
        /// Alert ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum RuleCommands {
    /// List loaded rules
    List,

    /// Create or replace rules from a JSON file
    Apply {
        /// Rule file
        file: PathBuf,
    },

    /// Delete a rule
    Delete {
        /// Rule ID
        id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::Config::load()?;
    let client = client::ApiClient::new(&config.api_url(cli.api_url.as_deref()))?;
    let format = cli.format;

    match cli.command {
        Commands::Alerts(alert_cmd) => match alert_cmd {
            AlertCommands::List { status } => {
                alerts::list_alerts(&client, status, format).await?;
            }
            AlertCommands::Show { id } => {
                alerts::show_alert(&client, &id, format).await?;
            }
            AlertCommands::Ack { id, actor } => {
                let actor = config.actor(actor.as_deref());
                alerts::acknowledge_alert(&client, &id, &actor, format).await?;
            }
            AlertCommands::Resolve { id, actor } => {
                let actor = config.actor(actor.as_deref());
                alerts::resolve_alert(&client, &id, &actor, format).await?;
            }
            AlertCommands::Deliveries { id } => {
                alerts::list_deliveries(&client, &id, format).await?;
            }
        },
        Commands::Analysis { id, refresh } => {
            alerts::show_analysis(&client, &id, refresh, format).await?;
        }
        Commands::Aggregated => {
            alerts::list_aggregated(&client, format).await?;
        }
        Commands::Rules(rule_cmd) => match rule_cmd {
            RuleCommands::List => rules::list_rules(&client, format).await?,
            RuleCommands::Apply { file } => rules::apply_rules(&client, &file, format).await?,
            RuleCommands::Delete { id } => rules::delete_rule(&client, &id).await?,
        },
        Commands::Push {
            metric,
            value,
            labels,
            timestamp,
        } => {
            ops::push_sample(&client, &metric, value, &labels, timestamp, format).await?;
        }
        Commands::Health => {
            ops::show_health(&client, format).await?;
        }
    }

    Ok(())
}
