//! In-process data-parallel launcher.
//!
//! A run with `world_size = N` spawns N worker threads named `rank-{i}`, each
//! with its own learner and a [`ThreadCommunicator`] for the collectives.
//! Rank 0 is the coordinator: it alone writes the event log and the run
//! summary.
//!
//! [`ThreadCommunicator`]: mvit_core::distributed::ThreadCommunicator

use std::fs;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use candle_core::Device;
use mvit_core::data::{open_splits, DataSplits};
use mvit_core::distributed::{DeviceCommunicator, LocalCommunicator, ThreadGroup};
use mvit_core::metrics::{EventWriter, MetricsHistory};
use mvit_core::trainer::{build_learner, fit, FitData};

use crate::config::{ResolvedConfig, RunConfig};

pub const SUMMARY_FILE: &str = "summary.json";
pub const RUN_CONFIG_FILE: &str = "config.json";

/// Train `resolved` on `world_size` worker threads and return the
/// coordinator's metrics.
pub fn launch(resolved: &ResolvedConfig, run: &RunConfig) -> anyhow::Result<MetricsHistory> {
    let trainer = &resolved.trainer;
    let splits = open_splits(
        resolved.dataset,
        &resolved.data_path,
        trainer.image_size,
        resolved.synthetic,
        trainer.seed,
    )
    .with_context(|| format!("failed to open dataset at {}", resolved.data_path.display()))?;

    let run_dir = resolved.board_path.join(&resolved.name);
    run.save_to(&run_dir.join(RUN_CONFIG_FILE))
        .context("failed to record run config")?;

    let history = if trainer.world_size == 1 {
        run_worker(resolved, &splits, Arc::new(LocalCommunicator::new()))?
    } else {
        let group = ThreadGroup::with_timeout(trainer.world_size, resolved.collective_timeout)?;
        let results = thread::scope(|s| {
            let handles = group
                .communicators()
                .into_iter()
                .enumerate()
                .map(|(rank, comm)| {
                    let splits = &splits;
                    thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(s, move || run_worker(resolved, splits, Arc::new(comm)))
                        .with_context(|| format!("failed to spawn rank {rank}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| match handle.join() {
                    Ok(result) => result.with_context(|| format!("rank {rank} failed")),
                    Err(_) => Err(anyhow::anyhow!("rank {rank} panicked")),
                })
                .collect::<anyhow::Result<Vec<_>>>()
        })?;
        results
            .into_iter()
            .next()
            .context("no worker reported metrics")?
    };

    let summary = serde_json::to_string_pretty(&history)?;
    let path = run_dir.join(SUMMARY_FILE);
    fs::write(&path, summary).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        best_top1 = ?history.best_top1(),
        best_top5 = ?history.best_top5(),
        "run finished"
    );
    Ok(history)
}

fn run_worker(
    resolved: &ResolvedConfig,
    splits: &DataSplits,
    comm: Arc<dyn DeviceCommunicator>,
) -> anyhow::Result<MetricsHistory> {
    let rank = comm.rank();
    let device = Device::cuda_if_available(comm.process_group().local_rank())?;
    let cfg = &resolved.trainer;

    let data = FitData::from_splits(cfg, splits, resolved.eval_resize, rank, &device)?;
    let mut learner = build_learner(cfg, data.steps_per_epoch(), comm, &device)?;
    let mut events = if rank == 0 {
        EventWriter::create(&resolved.board_path, &resolved.name)?
    } else {
        EventWriter::disabled()
    };
    tracing::info!(rank, device = ?device, "worker ready");
    Ok(fit(learner.as_mut(), cfg, &data, &mut events)?)
}
