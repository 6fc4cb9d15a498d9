//! Command implementations and table rendering.

use crate::client::RamsdClient;
use anyhow::Result;
use owo_colors::OwoColorize;
use rams_common::SrStatus;
use serde::Serialize;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn health(client: &RamsdClient, json: bool) -> Result<()> {
    let health = client.health().await?;
    if json {
        return print_json(&health);
    }

    println!("{} ramsd v{}", "●".green(), health.version);
    println!("  uptime:           {}s", health.uptime_secs);
    println!("  service requests: {}", health.counts.service_requests);
    println!("  animals:          {}", health.counts.animals);
    println!("  assignments:      {}", health.counts.assignments);
    println!("  teams:            {}", health.counts.teams);
    Ok(())
}

pub async fn srs(
    client: &RamsdClient,
    status: Option<&str>,
    incident: Option<&str>,
    json: bool,
) -> Result<()> {
    let srs = client.service_requests(status, incident).await?;
    if json {
        return print_json(&srs);
    }

    if srs.is_empty() {
        println!("No service requests.");
        return Ok(());
    }
    println!(
        "{:>5}  {:<9}  {:>4}  ADDRESS",
        "SR#".bold(),
        "STATUS".bold(),
        "PRI".bold()
    );
    for sr in srs {
        let status = match sr.status {
            SrStatus::Open => sr.status.to_string().yellow().to_string(),
            SrStatus::Closed => sr.status.to_string().dimmed().to_string(),
            SrStatus::Canceled => sr.status.to_string().dimmed().to_string(),
            _ => sr.status.to_string(),
        };
        println!(
            "{:>5}  {:<9}  {:>4}  {}, {}",
            sr.id_for_incident, status, sr.priority, sr.address, sr.city
        );
    }
    Ok(())
}

pub async fn assignments(client: &RamsdClient, status: Option<&str>, json: bool) -> Result<()> {
    let assignments = client.assignments(status).await?;
    if json {
        return print_json(&assignments);
    }

    if assignments.is_empty() {
        println!("No assignments.");
        return Ok(());
    }
    println!("{:>5}  {:<7}  STARTED", "DA#".bold(), "STATE".bold());
    for assignment in assignments {
        let state = if assignment.is_open() {
            "open".green().to_string()
        } else {
            "closed".dimmed().to_string()
        };
        println!(
            "{:>5}  {:<7}  {}",
            assignment.id_for_incident,
            state,
            assignment.start_time.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub async fn teams(client: &RamsdClient, json: bool) -> Result<()> {
    let teams = client.teams().await?;
    if json {
        return print_json(&teams);
    }

    if teams.is_empty() {
        println!("No teams.");
        return Ok(());
    }
    for view in teams {
        let marker = if view.is_assigned {
            "out".yellow().to_string()
        } else {
            "idle".dimmed().to_string()
        };
        println!(
            "{} [{}] {} member(s)",
            view.team.name.bold(),
            marker,
            view.team.member_ids.len()
        );
    }
    Ok(())
}
