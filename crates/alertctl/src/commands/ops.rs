//! Sample ingest and daemon health commands

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tabled::Tabled;

use crate::client::{ApiClient, HealthResponse, IngestRequest, IngestSummary, SampleInput};
use crate::output::{color_status, format_time, print_json, print_rows, print_success, print_warning, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Heartbeat")]
    heartbeat: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Parse `key=value` label arguments
pub fn parse_labels(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                labels.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => bail!("invalid label '{}', expected key=value", pair),
        }
    }
    Ok(labels)
}

/// Push one sample, mostly for testing rules by hand
pub async fn push_sample(
    client: &ApiClient,
    metric: &str,
    value: f64,
    labels: &[String],
    timestamp: Option<DateTime<Utc>>,
    format: OutputFormat,
) -> Result<()> {
    let request = IngestRequest {
        samples: vec![SampleInput {
            metric: metric.to_string(),
            labels: parse_labels(labels)?,
            value,
            timestamp,
        }],
    };
    let summary: IngestSummary = client.post("api/v1/samples", &request).await?;

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => {
            if summary.dropped > 0 {
                print_warning(&format!("Sample for {} was dropped", metric));
            } else {
                print_success(&format!("Sample accepted for {}", metric));
            }
        }
    }
    Ok(())
}

pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: HealthResponse = client.get("healthz").await?;

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => {
            println!("Daemon: {}", color_status(&health.status));
            let mut rows: Vec<ComponentRow> = health
                .components
                .iter()
                .map(|(name, c)| ComponentRow {
                    name: name.clone(),
                    status: color_status(&c.status),
                    heartbeat: format_time(Some(c.last_heartbeat)),
                    message: c.message.clone().unwrap_or_default(),
                })
                .collect();
            rows.sort_by(|a, b| a.name.cmp(&b.name));
            print_rows(rows);
        }
    }
    Ok(())
}
