//! Manager status command

use anyhow::Result;
use colored::Colorize;
use serde_json::json;

use crate::client::{ApiClient, HealthResponse, ReadinessResponse};
use crate::output::{color_status, print_json, OutputFormat};

/// Show manager health and readiness
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (_, health): (_, HealthResponse) = client.probe("healthz").await?;
    let (_, readiness): (_, ReadinessResponse) = client.probe("readyz").await?;

    match format {
        OutputFormat::Json => print_json(&json!({
            "health": health,
            "readiness": readiness,
        }))?,
        OutputFormat::Table => {
            println!("{}", "Fleet Manager Status".bold());
            println!("{}", "=".repeat(50));
            println!("Health:     {}", color_status(&health.status));
            let ready = if readiness.ready { "ready" } else { "not ready" };
            println!("Readiness:  {}", color_status(ready));
            if let Some(reason) = &readiness.reason {
                println!("Reason:     {}", reason.dimmed());
            }
            println!();

            println!("{}", "Components".bold());
            println!("{}", "-".repeat(50));
            for (name, component) in &health.components {
                match &component.message {
                    Some(message) => println!(
                        "  {:<20} {} {}",
                        name,
                        color_status(&component.status),
                        message.dimmed()
                    ),
                    None => println!("  {:<20} {}", name, color_status(&component.status)),
                }
            }
        }
    }
    Ok(())
}
