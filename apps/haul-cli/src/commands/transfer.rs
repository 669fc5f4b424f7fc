use haul_engine::{JobOptions, SubmitRequest};

use super::{Session, outcome, print_snapshot};
use crate::TransferArgs;
use crate::config::HaulConfig;

pub async fn upload(
    cfg: &HaulConfig,
    source: String,
    object: String,
    args: TransferArgs,
) -> anyhow::Result<()> {
    run(cfg, SubmitRequest::upload(source, object), args).await
}

pub async fn download(
    cfg: &HaulConfig,
    object: String,
    destination: String,
    args: TransferArgs,
) -> anyhow::Result<()> {
    run(cfg, SubmitRequest::download(object, destination), args).await
}

async fn run(cfg: &HaulConfig, req: SubmitRequest, args: TransferArgs) -> anyhow::Result<()> {
    let mut req = req.with_options(JobOptions {
        parallelism: args.parallelism,
        bandwidth_cap: args.bandwidth_cap,
        expected_digest: args.expected_digest,
        ..JobOptions::default()
    });
    req.size_hint = args.size;

    let session = Session::open(cfg)?;
    let job = session.orch.submit(req).await?;
    tracing::info!(job = %job, "job submitted");

    let snapshots = session.follow(std::slice::from_ref(&job)).await?;
    session.close().await;
    for snap in &snapshots {
        print_snapshot(snap);
    }
    outcome(&snapshots)
}
