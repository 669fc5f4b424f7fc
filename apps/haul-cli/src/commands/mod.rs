pub mod jobs;
pub mod transfer;

use std::sync::Arc;

use anyhow::Context;
use haul_engine::{JobSnapshot, LocalObjectStore, ObjectStore, Orchestrator};
use haul_protocol::{JobId, JobStatus, TransferEvent};
use haul_state::{FileStateStore, StateStore};
use tokio::task::JoinHandle;

use crate::config::HaulConfig;

/// An orchestrator wired to the configured stores, with its events
/// printed as they arrive.
pub struct Session {
    pub orch: Orchestrator,
    printer: JoinHandle<()>,
}

impl Session {
    pub fn open(cfg: &HaulConfig) -> anyhow::Result<Self> {
        let state = FileStateStore::open(&cfg.state_dir)
            .with_context(|| format!("failed to open state dir {}", cfg.state_dir.display()))?;
        let store = LocalObjectStore::new(&cfg.store_root);
        tracing::debug!(
            store = %cfg.store_root.display(),
            state = %cfg.state_dir.display(),
            "engine session opened"
        );

        let mut orch = Orchestrator::new(
            cfg.engine.clone(),
            Arc::new(store) as Arc<dyn ObjectStore>,
            Arc::new(state) as Arc<dyn StateStore>,
        );
        let mut events = orch
            .take_events()
            .context("event stream already taken")?;
        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                print_event(&event);
            }
        });
        Ok(Self { orch, printer })
    }

    /// Waits for each job to stop. Ctrl-C pauses them so a later
    /// `haul resume` picks up where they left off.
    pub async fn follow(&self, jobs: &[JobId]) -> anyhow::Result<Vec<JobSnapshot>> {
        let mut paused_by_signal = false;
        let mut finished = Vec::with_capacity(jobs.len());
        for job in jobs {
            let snapshot = loop {
                tokio::select! {
                    snap = self.orch.wait(job) => break snap?,
                    signal = tokio::signal::ctrl_c(), if !paused_by_signal => {
                        signal.context("failed to listen for ctrl-c")?;
                        eprintln!("interrupt: pausing, run `haul resume <job>` to continue");
                        for j in jobs {
                            self.orch.pause(j)?;
                        }
                        paused_by_signal = true;
                    }
                }
            };
            finished.push(snapshot);
        }
        Ok(finished)
    }

    /// Stops the event printer after the last buffered events are out.
    pub async fn close(self) {
        drop(self.orch);
        if let Err(e) = self.printer.await {
            tracing::warn!(error = %e, "event printer stopped abnormally");
        }
    }
}

fn print_event(event: &TransferEvent) {
    match event {
        TransferEvent::Progress(p) => {
            println!(
                "{}  {:>6.2}%  {}/{} bytes",
                p.job_id,
                p.percentage(),
                p.bytes_completed,
                p.bytes_total
            );
        }
        TransferEvent::StatusChanged { job_id, status } => println!("{job_id}  -> {status}"),
        TransferEvent::Completed { job_id, digest } => println!("{job_id}  completed  {digest}"),
        TransferEvent::Failed { job_id, failure } => {
            println!("{job_id}  failed ({}): {}", failure.class, failure.message);
        }
        TransferEvent::Cancelled { job_id } => println!("{job_id}  cancelled"),
    }
}

pub fn print_snapshot(snap: &JobSnapshot) {
    println!("job:       {}", snap.job_id);
    println!("direction: {}", snap.direction);
    println!("status:    {}", snap.status);
    println!(
        "progress:  {}/{} bytes, {}/{} chunks",
        snap.bytes_completed,
        snap.bytes_total,
        snap.chunk_summary.completed,
        snap.chunk_summary.total
    );
    if let Some(digest) = &snap.final_digest {
        println!("digest:    {digest}");
    }
    if let Some(failure) = &snap.failure {
        println!("failure:   {} ({})", failure.message, failure.class);
    }
    if let Some((first, last)) = snap.failed_range {
        println!("failed chunks: {first}..={last}");
    }
}

/// Non-zero exit for anything other than a clean finish or a pause.
pub fn outcome(snapshots: &[JobSnapshot]) -> anyhow::Result<()> {
    let unfinished: Vec<String> = snapshots
        .iter()
        .filter(|s| !matches!(s.status, JobStatus::Completed | JobStatus::Paused))
        .map(|s| format!("{} {}", s.job_id, s.status))
        .collect();
    if unfinished.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("jobs did not complete: {}", unfinished.join(", "))
    }
}
