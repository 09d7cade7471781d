//! Alert lifecycle commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{
    ActorRequest, AggregatedAlert, Alert, Analysis, ApiClient, ApiError, DeliveryRecord,
};
use crate::output::{
    color_confidence, color_severity, color_status, format_labels, format_time, print_info,
    print_json, print_rows, print_success, print_warning, truncate_id, OutputFormat,
};

/// Row for alerts table
#[derive(Tabled)]
struct AlertRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Labels")]
    labels: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Since")]
    since: String,
}

impl From<&Alert> for AlertRow {
    fn from(alert: &Alert) -> Self {
        Self {
            id: truncate_id(&alert.id),
            rule: alert.rule_name.clone(),
            status: color_status(&alert.status),
            severity: color_severity(&alert.severity),
            labels: format_labels(&alert.labels),
            value: format!("{:.2}", alert.value),
            since: format_time(alert.starts_at),
        }
    }
}

#[derive(Tabled)]
struct GroupRow {
    #[tabled(rename = "Group")]
    rule: String,
    #[tabled(rename = "Labels")]
    labels: String,
    #[tabled(rename = "Alerts")]
    count: usize,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "First")]
    first: String,
    #[tabled(rename = "Last")]
    last: String,
}

#[derive(Tabled)]
struct DeliveryRow {
    #[tabled(rename = "Step")]
    step: usize,
    #[tabled(rename = "Channel")]
    channel: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "At")]
    at: String,
    #[tabled(rename = "Error")]
    error: String,
}

fn alert_path(id: &str) -> String {
    format!("api/v1/alerts/{}", id)
}

/// List alerts, newest first
pub async fn list_alerts(client: &ApiClient, status: Option<String>, format: OutputFormat) -> Result<()> {
    let path = match &status {
        Some(s) => format!("api/v1/alerts?status={}", s),
        None => "api/v1/alerts".to_string(),
    };
    let alerts: Vec<Alert> = client.get(&path).await?;

    match format {
        OutputFormat::Json => print_json(&alerts)?,
        OutputFormat::Table => {
            if alerts.is_empty() {
                print_warning("No alerts found");
                return Ok(());
            }
            let count = alerts.len();
            print_rows(alerts.iter().map(AlertRow::from).collect());
            println!("\nTotal: {} alerts", count);
        }
    }

    Ok(())
}

pub async fn show_alert(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let alert: Alert = client.get(&alert_path(id)).await?;

    match format {
        OutputFormat::Json => print_json(&alert)?,
        OutputFormat::Table => {
            println!("Alert:     {}", alert.id);
            println!("Rule:      {} ({})", alert.rule_name, alert.rule_id);
            println!("Status:    {}", color_status(&alert.status));
            println!("Severity:  {}", color_severity(&alert.severity));
            println!("Labels:    {}", format_labels(&alert.labels));
            println!("Value:     {:.2}", alert.value);
            println!("Started:   {}", format_time(alert.starts_at));
            println!("Ended:     {}", format_time(alert.ends_at));
            if let Some(by) = &alert.acknowledged_by {
                println!("Acked by:  {}", by);
            }
            if let Some(by) = &alert.resolved_by {
                println!("Resolved:  by {}", by);
            }
            if alert.reopen_count > 0 {
                println!("Reopened:  {} times", alert.reopen_count);
            }
            if let Some(previous) = &alert.related_to {
                println!("Continues: {}", previous);
            }
            for (key, value) in &alert.annotations {
                println!("{}: {}", key, value);
            }
        }
    }

    Ok(())
}

pub async fn acknowledge_alert(client: &ApiClient, id: &str, actor: &str, format: OutputFormat) -> Result<()> {
    let alert: Alert = client
        .post(&format!("{}/acknowledge", alert_path(id)), &ActorRequest { actor: actor.to_string() })
        .await?;

    match format {
        OutputFormat::Json => print_json(&alert)?,
        OutputFormat::Table => print_success(&format!("Alert {} acknowledged by {}", alert.id, actor)),
    }
    Ok(())
}

pub async fn resolve_alert(client: &ApiClient, id: &str, actor: &str, format: OutputFormat) -> Result<()> {
    let alert: Alert = client
        .post(&format!("{}/resolve", alert_path(id)), &ActorRequest { actor: actor.to_string() })
        .await?;

    match format {
        OutputFormat::Json => print_json(&alert)?,
        OutputFormat::Table => print_success(&format!("Alert {} resolved by {}", alert.id, actor)),
    }
    Ok(())
}

/// Show the stored analysis, or request one with `refresh`
pub async fn show_analysis(client: &ApiClient, id: &str, refresh: bool, format: OutputFormat) -> Result<()> {
    let path = format!("{}/analysis", alert_path(id));
    let analysis: Analysis = if refresh {
        client.post(&path, &serde_json::json!({})).await?
    } else {
        match client.get(&path).await {
            Ok(analysis) => analysis,
            Err(e) if e.downcast_ref::<ApiError>().is_some_and(ApiError::is_not_found) => {
                print_info("No analysis stored yet, run with --refresh to request one");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    };

    if let OutputFormat::Json = format {
        return print_json(&analysis);
    }

    println!("Analysis for {} ({})", analysis.alert_id, color_status(&analysis.status));
    println!("Model:      {}", analysis.model);
    println!("Confidence: {}", color_confidence(analysis.confidence));
    if analysis.unavailable {
        print_warning(&format!(
            "AI analysis unavailable: {}",
            analysis.unavailable_reason.as_deref().unwrap_or("unknown")
        ));
        return Ok(());
    }

    if analysis.causes.is_empty() {
        print_info("No probable cause identified");
    }
    for (rank, cause) in analysis.causes.iter().enumerate() {
        println!("\n{}. {} [{}]", rank + 1, cause.description, color_confidence(cause.confidence));
        for item in &cause.evidence {
            println!("     - {}", item);
        }
    }
    if !analysis.evidence.is_empty() {
        println!("\nEvidence:");
        for item in &analysis.evidence {
            println!("  - {}", item);
        }
    }
    if !analysis.recommendations.is_empty() {
        println!("\nRecommendations:");
        for item in &analysis.recommendations {
            println!("  - {}", item);
        }
    }
    if !analysis.knowledge_refs.is_empty() {
        println!("\nRunbooks: {}", analysis.knowledge_refs.join(", "));
    }

    Ok(())
}

pub async fn list_aggregated(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let groups: Vec<AggregatedAlert> = client.get("api/v1/alerts/aggregated").await?;

    match format {
        OutputFormat::Json => print_json(&groups)?,
        OutputFormat::Table => {
            if groups.is_empty() {
                print_warning("No aggregated alert groups");
                return Ok(());
            }
            print_rows(
                groups
                    .iter()
                    .map(|g| GroupRow {
                        rule: g.rule.clone(),
                        labels: format_labels(&g.labels),
                        count: g.count,
                        severity: color_severity(&g.severity),
                        first: format_time(Some(g.first_started)),
                        last: format_time(Some(g.last_started)),
                    })
                    .collect(),
            );
        }
    }

    Ok(())
}

pub async fn list_deliveries(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let records: Vec<DeliveryRecord> = client.get(&format!("{}/deliveries", alert_path(id))).await?;

    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Table => {
            if records.is_empty() {
                print_warning("No deliveries recorded");
                return Ok(());
            }
            print_rows(
                records
                    .iter()
                    .map(|r| DeliveryRow {
                        step: r.step,
                        channel: r.channel.clone(),
                        kind: r.kind.clone(),
                        outcome: color_status(&r.outcome),
                        attempts: r.attempts,
                        at: format_time(Some(r.at)),
                        error: r.error.clone().unwrap_or_default(),
                    })
                    .collect(),
            );
        }
    }

    Ok(())
}
