//! Rule management commands

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_severity, print_json, print_rows, print_success, print_warning, OutputFormat};

#[derive(Tabled)]
struct RuleRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "For")]
    for_secs: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
}

impl From<&Value> for RuleRow {
    fn from(rule: &Value) -> Self {
        let text = |v: &Value| v.as_str().unwrap_or("-").to_string();
        Self {
            id: text(&rule["id"]),
            name: text(&rule["name"]),
            metric: text(&rule["selector"]["metric"]),
            severity: color_severity(rule["severity"].as_str().unwrap_or("-")),
            for_secs: format!("{}s", rule["for_secs"].as_u64().unwrap_or(0)),
            enabled: rule["enabled"].as_bool().unwrap_or(true).to_string(),
        }
    }
}

/// A rule file holds one rule, a list, or `{"rules": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum RuleDocument {
    Wrapped { rules: Vec<Value> },
    List(Vec<Value>),
    Single(Value),
}

pub fn read_rules(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let document: RuleDocument =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;

    let rules = match document {
        RuleDocument::Wrapped { rules } | RuleDocument::List(rules) => rules,
        RuleDocument::Single(rule) => vec![rule],
    };

    for rule in &rules {
        if rule["id"].as_str().map(str::trim).unwrap_or("").is_empty() {
            bail!("every rule in {} needs an id", path.display());
        }
    }
    Ok(rules)
}

pub async fn list_rules(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let rules: Vec<Value> = client.get("api/v1/rules").await?;

    match format {
        OutputFormat::Json => print_json(&rules)?,
        OutputFormat::Table => {
            if rules.is_empty() {
                print_warning("No rules loaded");
                return Ok(());
            }
            print_rows(rules.iter().map(RuleRow::from).collect());
        }
    }
    Ok(())
}

/// Upsert every rule in the file
pub async fn apply_rules(client: &ApiClient, path: &Path, format: OutputFormat) -> Result<()> {
    let rules = read_rules(path)?;
    let mut applied = Vec::with_capacity(rules.len());

    for rule in &rules {
        let id = rule["id"].as_str().unwrap_or_default();
        let stored: Value = client
            .put(&format!("api/v1/rules/{}", id), rule)
            .await
            .with_context(|| format!("Failed to apply rule {}", id))?;
        if let OutputFormat::Table = format {
            print_success(&format!("Rule {} applied", id));
        }
        applied.push(stored);
    }

    if let OutputFormat::Json = format {
        print_json(&applied)?;
    }
    Ok(())
}

pub async fn delete_rule(client: &ApiClient, id: &str) -> Result<()> {
    client.delete(&format!("api/v1/rules/{}", id)).await?;
    print_success(&format!("Rule {} deleted", id));
    Ok(())
}
