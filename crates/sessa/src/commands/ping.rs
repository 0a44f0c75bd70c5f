//! Ping command - checks connectivity to the configured session store.

use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Args;
use console::{Style, style};
use serde::Serialize;
use sessa_session::StoreConfig;
use sessa_session::store::{KvConnection, KvConnector, RedisConnector};

use super::Context;

/// Arguments for the ping command.
#[derive(Args, Debug)]
pub struct PingArgs {
    /// Number of round trips per endpoint
    #[arg(short = 'n', long, default_value_t = 3)]
    pub count: u32,
}

/// Result for one endpoint.
#[derive(Debug, Serialize)]
struct EndpointReport {
    endpoint: String,
    reachable: bool,
    round_trips: u32,
    avg_latency_ms: Option<f64>,
    error: Option<String>,
}

/// Run the ping command.
pub async fn run(args: PingArgs, ctx: &Context) -> Result<()> {
    let settings = match &ctx.config.store {
        StoreConfig::Local => {
            if ctx.json_output {
                println!("{}", serde_json::to_string_pretty(&Vec::<EndpointReport>::new())?);
            } else {
                println!("Local session store configured, nothing to ping.");
            }
            return Ok(());
        }
        StoreConfig::Distributed(settings) => settings,
    };

    let mut reports = Vec::with_capacity(settings.endpoints.len());
    for endpoint in &settings.endpoints {
        let report = match RedisConnector::new(std::slice::from_ref(endpoint), settings.io_timeout())
        {
            Ok(connector) => {
                check_endpoint(&connector, endpoint, args.count, &settings.key_prefix).await
            }
            Err(e) => EndpointReport::failed(endpoint, e.to_string()),
        };
        reports.push(report);
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_reports(&reports, ctx.verbose);
    }

    if reports.iter().all(|report| !report.reachable) {
        bail!("No session store endpoint reachable");
    }
    Ok(())
}

impl EndpointReport {
    fn failed(endpoint: &str, error: String) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            reachable: false,
            round_trips: 0,
            avg_latency_ms: None,
            error: Some(error),
        }
    }
}

async fn check_endpoint(
    connector: &RedisConnector,
    endpoint: &str,
    count: u32,
    key_prefix: &str,
) -> EndpointReport {
    let mut report = EndpointReport {
        endpoint: endpoint.to_string(),
        reachable: false,
        round_trips: 0,
        avg_latency_ms: None,
        error: None,
    };

    let mut conn = match connector.connect().await {
        Ok(conn) => conn,
        Err(e) => {
            report.error = Some(e.to_string());
            return report;
        }
    };
    report.reachable = true;

    let ping_key = format!("{key_prefix}__sessa_ping__");
    let mut total = Duration::ZERO;
    for _ in 0..count {
        let started = Instant::now();
        match conn.exists(&ping_key).await {
            Ok(_) => {
                total += started.elapsed();
                report.round_trips += 1;
            }
            Err(e) => {
                report.error = Some(e.to_string());
                break;
            }
        }
    }
    if report.round_trips > 0 {
        report.avg_latency_ms =
            Some(total.as_secs_f64() * 1000.0 / f64::from(report.round_trips));
    }
    report
}

fn print_reports(reports: &[EndpointReport], verbose: bool) {
    let green = Style::new().green();
    let red = Style::new().red();
    let dim = Style::new().dim();

    println!();
    println!("{}", style("Session Store").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!();
    for report in reports {
        let status = if report.reachable && report.error.is_none() {
            green.apply_to("● reachable".to_string())
        } else {
            red.apply_to("● unreachable".to_string())
        };
        println!("  {} {}", status, report.endpoint);
        if let Some(latency) = report.avg_latency_ms {
            println!(
                "    {} {:.2} ms over {} round trips",
                dim.apply_to("Latency:"),
                latency,
                report.round_trips
            );
        }
        if let Some(error) = &report.error
            && (verbose || !report.reachable)
        {
            println!("    {} {}", dim.apply_to("Error:"), error);
        }
    }
    println!();
}
