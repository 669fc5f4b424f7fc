use haul_engine::JobSnapshot;
use haul_protocol::JobId;
use haul_state::{FileStateStore, StateStore};

use super::{Session, outcome, print_snapshot};
use crate::config::HaulConfig;

/// Prints one job, or a line per stored job.
pub fn status(cfg: &HaulConfig, job: Option<&str>) -> anyhow::Result<()> {
    let state = FileStateStore::open(&cfg.state_dir)?;
    if let Some(job) = job {
        let manifest = state.snapshot(&JobId::from(job))?;
        print_snapshot(&JobSnapshot::from(&manifest));
        return Ok(());
    }

    let ids = state.list_jobs()?;
    if ids.is_empty() {
        println!("no jobs");
    }
    for id in ids {
        match state.snapshot(&id) {
            Ok(m) => println!(
                "{}  {:<8}  {:<11}  {}/{} bytes  {} -> {}",
                id,
                m.job.direction.to_string(),
                m.job.status.to_string(),
                m.bytes_completed(),
                m.job.total_size,
                m.job.source,
                m.job.destination
            ),
            Err(e) => println!("{id}  unreadable: {e}"),
        }
    }
    Ok(())
}

/// Restarts every interrupted job and, if given, resumes `job` as well.
pub async fn resume(cfg: &HaulConfig, job: Option<&str>) -> anyhow::Result<()> {
    let session = Session::open(cfg)?;
    let mut jobs = session.orch.recover()?;
    if let Some(job) = job {
        let id = JobId::from(job);
        session.orch.resume(&id)?;
        if !jobs.contains(&id) {
            jobs.push(id);
        }
    }
    if jobs.is_empty() {
        println!("nothing to resume");
        session.close().await;
        return Ok(());
    }

    let snapshots = session.follow(&jobs).await?;
    session.close().await;
    for snap in &snapshots {
        print_snapshot(snap);
    }
    outcome(&snapshots)
}

pub async fn cancel(cfg: &HaulConfig, job: &str) -> anyhow::Result<()> {
    let session = Session::open(cfg)?;
    let id = JobId::from(job);
    session.orch.cancel(&id)?;
    let snap = session.orch.wait(&id).await?;
    session.close().await;
    print_snapshot(&snap);
    Ok(())
}

pub async fn resubmit(cfg: &HaulConfig, job: &str) -> anyhow::Result<()> {
    let session = Session::open(cfg)?;
    let id = session.orch.resubmit(&JobId::from(job))?;
    println!("resubmitted {job} as {id}");

    let snapshots = session.follow(std::slice::from_ref(&id)).await?;
    session.close().await;
    for snap in &snapshots {
        print_snapshot(snap);
    }
    outcome(&snapshots)
}
