//! Data-parallel collectives.
//!
//! This module provides abstractions for multi-worker training:
//! - [`ProcessGroup`] - rank and world size
//! - [`DeviceCommunicator`] - collective operations (all_reduce, all_gather,
//!   broadcast, barrier)
//!
//! # Architecture
//!
//! - Single worker: [`LocalCommunicator`], every collective is the identity.
//! - Multiple workers: [`ThreadGroup`] hands out one [`ThreadCommunicator`]
//!   per worker thread; collectives rendezvous in process memory.
//!
//! # Usage
//!
//! ```ignore
//! use mvit_core::distributed::{DeviceCommunicator, ThreadGroup};
//!
//! let group = ThreadGroup::new(2)?;
//! for comm in group.communicators() {
//!     // move `comm` into its worker thread
//! }
//! ```

mod communicator;
mod error;
mod process_group;
mod thread_group;

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::VarMap;

pub use communicator::{DeviceCommunicator, LocalCommunicator, ReduceOp};
pub use error::{DistributedError, Result};
pub use process_group::{LocalProcessGroup, ProcessGroup};
pub use thread_group::{ThreadCommunicator, ThreadGroup};

/// Overwrite every variable of `varmap` with the coordinator's value so all
/// replicas start from identical weights. Variables are visited in name order.
pub fn broadcast_parameters(varmap: &VarMap, comm: &dyn DeviceCommunicator) -> Result<()> {
    if comm.world_size() == 1 {
        return Ok(());
    }
    let data = varmap.data().lock().map_err(|_| DistributedError::Poisoned)?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    for name in &names {
        let var = &data[*name];
        let src = comm.broadcast(var.as_tensor(), 0)?;
        if comm.rank() != 0 {
            var.set(&src)?;
        }
    }
    tracing::debug!(rank = comm.rank(), params = names.len(), "parameters broadcast");
    Ok(())
}

/// Replace each local gradient by its mean across ranks.
///
/// Every rank must pass the same `vars` in the same order and hold a
/// gradient for the same subset of them.
pub fn all_reduce_gradients(
    grads: &mut GradStore,
    vars: &[Var],
    comm: &dyn DeviceCommunicator,
) -> Result<()> {
    if comm.world_size() == 1 {
        return Ok(());
    }
    for var in vars {
        let reduced = match grads.get(var.as_tensor()) {
            Some(grad) => comm.all_reduce(grad, ReduceOp::Average)?,
            None => continue,
        };
        grads.insert(var.as_tensor(), reduced);
    }
    Ok(())
}
