//! Soak command - drives concurrent activities through a session manager.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use clap::Args;
use console::{Style, style};
use serde::Serialize;
use sessa_session::{SessionManager, SessionStats};
use tokio::task::JoinSet;
use tracing::warn;

use super::Context;

/// Arguments for the soak command.
#[derive(Args, Debug)]
pub struct SoakArgs {
    /// Concurrent activities
    #[arg(short, long, default_value_t = 50)]
    pub agents: usize,

    /// Activities run by each worker
    #[arg(short, long, default_value_t = 20)]
    pub rounds: usize,

    /// Distinct session ids the activities share
    #[arg(short, long, default_value_t = 10)]
    pub sessions: usize,

    /// Override the default idle timeout of created sessions
    #[arg(long)]
    pub idle_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SoakOutput {
    activities: usize,
    failed: usize,
    elapsed_ms: u128,
    stats: SessionStats,
}

/// Run the soak command.
pub async fn run(args: SoakArgs, ctx: &Context) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(secs) = args.idle_secs {
        config.default_max_idle_secs = secs;
    }

    let manager = Arc::new(SessionManager::new(config).context("Invalid session config")?);
    manager.start().await?;

    let ids: Arc<Vec<String>> = Arc::new(
        (0..args.sessions.max(1))
            .map(|_| manager.new_session_id())
            .collect(),
    );

    let started = Instant::now();
    let mut workers = JoinSet::new();
    for worker in 0..args.agents {
        let manager = Arc::clone(&manager);
        let ids = Arc::clone(&ids);
        let rounds = args.rounds;
        workers.spawn(async move {
            let mut failed = 0;
            for round in 0..rounds {
                let id = &ids[(worker + round) % ids.len()];
                if let Err(e) = activity(&manager, id, worker).await {
                    warn!(session_id = %id, error = %e, "Soak activity failed");
                    failed += 1;
                }
            }
            failed
        });
    }

    let mut failed = 0;
    while let Some(joined) = workers.join_next().await {
        failed += joined.context("Soak worker panicked")?;
    }
    let elapsed = started.elapsed();

    manager.stop().await;

    let output = SoakOutput {
        activities: args.agents * args.rounds,
        failed,
        elapsed_ms: elapsed.as_millis(),
        stats: manager.stats(),
    };
    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_output(&output);
    }
    Ok(())
}

/// One activity: bind the session, bump a counter, complete.
async fn activity(manager: &SessionManager, id: &str, worker: usize) -> sessa_session::Result<()> {
    let mut agent = manager.new_session_agent_with_id(id);
    agent.get_session(true).await?;
    let hits: u64 = agent.get_attribute_as("hits").await?.unwrap_or(0);
    agent.set_attribute("hits", hits + 1).await?;
    agent.set_attribute("last_worker", worker).await?;
    agent.complete().await
}

fn print_output(output: &SoakOutput) {
    let dim = Style::new().dim();
    let stats = &output.stats;

    println!();
    println!("{}", style("Soak Results").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!();
    println!("  {} {}", dim.apply_to("Activities:"), output.activities);
    println!("  {} {}", dim.apply_to("Failed:"), output.failed);
    println!("  {} {} ms", dim.apply_to("Elapsed:"), output.elapsed_ms);
    println!();
    println!("  {} {}", dim.apply_to("sessions_current:"), stats.sessions_current);
    println!("  {} {}", dim.apply_to("sessions_max:"), stats.sessions_max);
    println!("  {} {}", dim.apply_to("sessions_total:"), stats.sessions_total);
    println!("  {} {}", dim.apply_to("sessions_created:"), stats.sessions_created);
    println!("  {} {}", dim.apply_to("sessions_expired:"), stats.sessions_expired);
    println!(
        "  {} {}",
        dim.apply_to("sessions_invalidated:"),
        stats.sessions_invalidated
    );
    println!("  {} {}", dim.apply_to("agents_leaked:"), stats.agents_leaked);
    println!("  {} {}", dim.apply_to("store_failures:"), stats.store_failures);
    println!();
}
