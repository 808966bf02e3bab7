use std::sync::Arc;
use std::time::Instant;

use candle_core::{Device, Tensor};

use super::{
    Learner, Method, MomentumLearner, Result, SimClrLearner, StepReport, TrainError,
    TrainerConfig,
};
use crate::data::{
    eval_transform, DataSplits, EvalLoader, ImageDataset, LoaderConfig, TwoViewLoader, TwoViews,
};
use crate::distributed::{DeviceCommunicator, ReduceOp};
use crate::head::EmbeddingNet;
use crate::knn::{FeatureBank, KnnAccuracy, KnnClassifier, KnnError};
use crate::metrics::{EventWriter, MetricsHistory};

/// Loaders of one worker.
pub struct FitData {
    pub train: TwoViewLoader,
    /// Reference set of the KNN evaluation, sharded across workers.
    pub bank: Option<EvalLoader>,
    /// Queries of the KNN evaluation; every worker scores all of them.
    pub val: Option<EvalLoader>,
    /// Micro-batches per optimizer step.
    pub accumulate: usize,
}

impl FitData {
    pub fn from_splits(
        cfg: &TrainerConfig,
        splits: &DataSplits,
        eval_resize: usize,
        rank: usize,
        device: &Device,
    ) -> Result<Self> {
        let views = match cfg.method {
            Method::Momentum => TwoViews::momentum(cfg.image_size),
            Method::Simclr => TwoViews::simclr(cfg.image_size),
        };
        let train = TwoViewLoader::new(
            Arc::clone(&splits.pretrain),
            views,
            LoaderConfig {
                batch_size: cfg.batch_size_per_worker,
                shuffle: true,
                drop_last: true,
                seed: cfg.seed,
                rank,
                world_size: cfg.world_size,
            },
            device.clone(),
        )?;
        if train.num_batches() == 0 {
            return Err(TrainError::NoBatches);
        }

        let (bank, val) = if cfg.val_interval > 0 {
            let eval = |dataset: &Arc<dyn ImageDataset>, shard: bool| {
                EvalLoader::new(
                    Arc::clone(dataset),
                    eval_transform(eval_resize, cfg.image_size),
                    cfg.batch_size_per_worker,
                    rank,
                    cfg.world_size,
                    shard,
                    device.clone(),
                )
            };
            (
                Some(eval(&splits.bank, true)?),
                Some(eval(&splits.val, false)?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            train,
            bank,
            val,
            accumulate: cfg.accumulate.max(1),
        })
    }

    /// Optimizer steps per epoch; a trailing partial group still steps.
    pub fn steps_per_epoch(&self) -> usize {
        self.train.num_batches().div_ceil(self.accumulate)
    }
}

/// Build the learner of `cfg.method`.
pub fn build_learner(
    cfg: &TrainerConfig,
    steps_per_epoch: usize,
    comm: Arc<dyn DeviceCommunicator>,
    device: &Device,
) -> Result<Box<dyn Learner>> {
    Ok(match cfg.method {
        Method::Momentum => Box::new(MomentumLearner::new(cfg, steps_per_epoch, comm, device)?),
        Method::Simclr => Box::new(SimClrLearner::new(cfg, steps_per_epoch, comm, device)?),
    })
}

/// Weighted KNN accuracy `(top1, top5)` in percent of `net`'s backbone
/// representation.
pub fn evaluate_knn(
    net: &EmbeddingNet,
    bank: &EvalLoader,
    val: &EvalLoader,
    classifier: &KnnClassifier,
    comm: &dyn DeviceCommunicator,
) -> Result<(f64, f64)> {
    let mut features = Vec::with_capacity(bank.num_batches());
    let mut labels = Vec::new();
    for batch in bank.batches() {
        let batch = batch?;
        features.push(net.representation(&batch.images)?);
        labels.extend(batch.labels);
    }
    if features.is_empty() {
        return Err(KnnError::EmptyBank.into());
    }
    let bank = FeatureBank::gather(&Tensor::cat(&features, 0)?, &labels, comm)?;

    let mut acc = KnnAccuracy::default();
    for batch in val.batches() {
        let batch = batch?;
        let queries = net.representation(&batch.images)?;
        classifier.accumulate(&bank, &queries, &batch.labels, &mut acc)?;
    }
    Ok(acc.percentages()?)
}

fn log_step(events: &mut EventWriter, report: &StepReport) -> Result<()> {
    let step = report.step;
    events.add_scalar("loss", report.loss as f64, step)?;
    events.add_scalar("lr", report.schedule.lr, step)?;
    events.add_scalar("wd", report.schedule.weight_decay, step)?;
    events.add_scalar("momentum", report.schedule.momentum, step)?;
    events.add_scalar("ratio", report.schedule.ratio, step)?;
    events.add_scalar("grad_norm", report.grad_norm, step)?;
    if let Some(mid) = report.parts.intermediate {
        events.add_scalar("loss_intermediate", mid as f64, step)?;
    }
    if let Some(detached) = report.parts.detached {
        events.add_scalar("loss_detached", detached as f64, step)?;
    }
    Ok(())
}

/// Mean of `value` across workers.
fn mean_across(comm: &dyn DeviceCommunicator, value: f64) -> Result<f64> {
    let local = Tensor::new(value as f32, &Device::Cpu)?;
    let mean = comm.all_reduce(&local, ReduceOp::Average)?;
    Ok(mean.to_scalar::<f32>()? as f64)
}

/// Train for `cfg.max_epochs` epochs, evaluating every `cfg.val_interval`
/// epochs and after the last one.
///
/// Only the coordinator should pass an enabled `events` writer.
pub fn fit(
    learner: &mut dyn Learner,
    cfg: &TrainerConfig,
    data: &FitData,
    events: &mut EventWriter,
) -> Result<MetricsHistory> {
    let steps_per_epoch = data.steps_per_epoch();
    let scheduled = learner.state().schedules().len();
    if cfg.max_epochs * steps_per_epoch > scheduled {
        return Err(TrainError::InvalidConfig(format!(
            "{} epochs of {steps_per_epoch} steps exceed the {scheduled} scheduled steps",
            cfg.max_epochs
        )));
    }
    let classifier = KnnClassifier::new(cfg.knn_k);
    let comm = learner.state().shared_comm();
    let mut history = MetricsHistory::new();

    tracing::info!(
        method = %learner.method(),
        epochs = cfg.max_epochs,
        steps_per_epoch,
        accumulate = data.accumulate,
        rank = comm.rank(),
        "starting training"
    );
    for epoch in 0..cfg.max_epochs {
        let started = Instant::now();
        let mut loss_sum = 0f64;
        let mut last = None;
        let mut pending = Vec::with_capacity(data.accumulate);
        let mut batches = data.train.batches(epoch).peekable();
        while let Some(batch) = batches.next() {
            pending.push(batch?);
            if pending.len() < data.accumulate && batches.peek().is_some() {
                continue;
            }
            let report = learner.train_accumulated(&pending)?;
            pending.clear();
            loss_sum += report.loss as f64;
            log_step(events, &report)?;
            last = Some(report);
        }
        let epoch_loss = mean_across(comm.as_ref(), loss_sum / steps_per_epoch as f64)?;
        history.record_epoch_loss(epoch_loss);
        events.add_scalar("epoch_loss", epoch_loss, epoch)?;
        tracing::info!(
            epoch,
            loss = epoch_loss,
            lr = last.map(|r| r.schedule.lr),
            elapsed_s = started.elapsed().as_secs_f64(),
            "epoch finished"
        );

        let due = cfg.val_interval > 0
            && ((epoch + 1) % cfg.val_interval == 0 || epoch + 1 == cfg.max_epochs);
        if let (true, Some(bank), Some(val)) = (due, &data.bank, &data.val) {
            let started = Instant::now();
            let (top1, top5) =
                evaluate_knn(learner.eval_net(), bank, val, &classifier, comm.as_ref())?;
            history.record_eval(epoch, top1, top5);
            events.add_scalar("top1", top1, epoch)?;
            events.add_scalar("top5", top5, epoch)?;
            tracing::info!(
                epoch,
                top1,
                top5,
                elapsed_s = started.elapsed().as_secs_f64(),
                "knn evaluation"
            );
        }
        events.flush()?;
    }
    history.steps = learner.state().step();

    if let Some(best) = history.best_top1() {
        tracing::info!(best_top1 = best, steps = history.steps, "training finished");
    }
    Ok(history)
}
