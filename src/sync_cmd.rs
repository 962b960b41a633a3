//! Remote sync: the `sth sync` command and the background drain loop.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;

/// Drain the queue once and, for `documents`, pull remote artifacts.
pub async fn run_sync(orchestrator: &Orchestrator, documents: &[String]) -> Result<()> {
    let report = orchestrator.drain().await?;
    println!(
        "Synced {} artifact(s), {} conflict(s), {} still pending.",
        report.synced, report.conflicts, report.still_pending
    );
    for doc in &report.blocked_documents {
        println!("  blocked: {}", doc);
    }

    for doc in documents {
        match orchestrator.pull(doc).await {
            Ok(added) => println!("Pulled {} new artifact(s) for {}.", added, doc),
            Err(e) => println!("Could not pull {}: {}", doc, e),
        }
    }
    Ok(())
}

/// Replay the offline queue every `interval`, forever.
pub async fn drain_loop(orchestrator: Orchestrator, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match orchestrator.drain().await {
            Ok(report) if report.synced > 0 || report.conflicts > 0 => info!(
                synced = report.synced,
                conflicts = report.conflicts,
                pending = report.still_pending,
                "sync queue drained"
            ),
            Ok(report) => debug!(pending = report.still_pending, "sync queue checked"),
            Err(e) => warn!(error = %e, "sync queue drain failed"),
        }
    }
}
