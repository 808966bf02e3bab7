//! In-process rendezvous for data-parallel workers running as threads.
//!
//! Each collective is one rendezvous round: every rank deposits its tensor,
//! the last rank to arrive publishes the full set and wakes the others, and
//! each rank then combines the set locally in rank order so all ranks compute
//! bit-identical results. Rounds are generation-counted so a fast rank can
//! enter the next collective while slow ranks still read the previous one.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use candle_core::Tensor;

use super::communicator::{concat, DeviceCommunicator, ReduceOp};
use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

#[derive(Default)]
struct Round {
    slots: Vec<Option<Tensor>>,
    arrived: usize,
    generation: u64,
    published: Arc<Vec<Tensor>>,
}

struct Shared {
    world_size: usize,
    /// `None` waits for peers indefinitely.
    timeout: Option<Duration>,
    round: Mutex<Round>,
    condvar: Condvar,
}

/// Factory for the communicators of one thread group.
pub struct ThreadGroup {
    shared: Arc<Shared>,
}

impl ThreadGroup {
    /// Collectives block until every rank arrives.
    pub fn new(world_size: usize) -> Result<Self> {
        Self::with_timeout(world_size, None)
    }

    pub fn with_timeout(world_size: usize, timeout: Option<Duration>) -> Result<Self> {
        if world_size == 0 {
            return Err(DistributedError::EmptyWorld);
        }
        let round = Round {
            slots: vec![None; world_size],
            ..Round::default()
        };
        Ok(Self {
            shared: Arc::new(Shared {
                world_size,
                timeout,
                round: Mutex::new(round),
                condvar: Condvar::new(),
            }),
        })
    }

    pub fn world_size(&self) -> usize {
        self.shared.world_size
    }

    /// One communicator per rank, in rank order. Hand each to its own thread.
    pub fn communicators(&self) -> Vec<ThreadCommunicator> {
        (0..self.shared.world_size)
            .map(|rank| ThreadCommunicator {
                process_group: LocalProcessGroup::with_rank(rank, self.shared.world_size),
                shared: Arc::clone(&self.shared),
            })
            .collect()
    }
}

pub struct ThreadCommunicator {
    process_group: LocalProcessGroup,
    shared: Arc<Shared>,
}

impl ThreadCommunicator {
    /// Deposit `tensor` and block until every rank has deposited theirs.
    fn exchange(&self, tensor: &Tensor) -> Result<Arc<Vec<Tensor>>> {
        let shared = &*self.shared;
        let rank = self.process_group.rank();
        let mut round = shared.round.lock().map_err(|_| DistributedError::Poisoned)?;

        let generation = round.generation;
        round.slots[rank] = Some(tensor.clone());
        round.arrived += 1;

        if round.arrived == shared.world_size {
            let published: Vec<Tensor> = round.slots.iter_mut().filter_map(Option::take).collect();
            round.published = Arc::new(published);
            round.arrived = 0;
            round.generation += 1;
            shared.condvar.notify_all();
            return Ok(Arc::clone(&round.published));
        }

        let deadline = shared.timeout.map(|t| (t, Instant::now() + t));
        while round.generation == generation {
            round = match deadline {
                None => shared
                    .condvar
                    .wait(round)
                    .map_err(|_| DistributedError::Poisoned)?,
                Some((timeout, deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::error!(rank, generation, "collective timed out");
                        return Err(DistributedError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    shared
                        .condvar
                        .wait_timeout(round, deadline - now)
                        .map_err(|_| DistributedError::Poisoned)?
                        .0
                }
            };
        }
        Ok(Arc::clone(&round.published))
    }
}

impl DeviceCommunicator for ThreadCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        if self.process_group.is_single() {
            return Ok(tensor.clone());
        }
        op.reduce(&self.exchange(tensor)?)
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        if self.process_group.is_single() {
            return Ok(tensor.clone());
        }
        concat(&self.exchange(tensor)?, gather_dim)
    }

    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor> {
        let world_size = self.process_group.world_size();
        if src_rank >= world_size {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size,
            });
        }
        if world_size == 1 {
            return Ok(tensor.clone());
        }
        let parts = self.exchange(tensor)?;
        Ok(parts[src_rank].clone())
    }

    fn barrier(&self) -> Result<()> {
        if self.process_group.is_single() {
            return Ok(());
        }
        let token = Tensor::zeros(1, candle_core::DType::U8, &candle_core::Device::Cpu)?;
        self.exchange(&token)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::thread;

    fn run<F, T>(world_size: usize, f: F) -> Vec<T>
    where
        F: Fn(&ThreadCommunicator) -> T + Sync,
        T: Send,
    {
        let group = ThreadGroup::new(world_size).unwrap();
        let comms = group.communicators();
        let f = &f;
        thread::scope(|s| {
            let handles: Vec<_> = comms.iter().map(|c| s.spawn(move || f(c))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn all_gather_concatenates_in_rank_order() {
        let out = run(3, |c| {
            let t = Tensor::new(&[[c.rank() as f32; 2]], &Device::Cpu).unwrap();
            let g: Vec<Vec<f32>> = c.all_gather(&t, 0).unwrap().to_vec2().unwrap();
            g
        });
        let expected = vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]];
        assert!(out.iter().all(|g| *g == expected));
    }

    #[test]
    fn all_reduce_average_matches_on_every_rank() {
        let out = run(4, |c| {
            let t = Tensor::new(&[c.rank() as f32, 1.0], &Device::Cpu).unwrap();
            let v: Vec<f32> = c.all_reduce(&t, ReduceOp::Average).unwrap().to_vec1().unwrap();
            v
        });
        assert!(out.iter().all(|v| *v == vec![1.5, 1.0]));
    }

    #[test]
    fn repeated_collectives_do_not_mix_rounds() {
        let out = run(2, |c| {
            let mut seen = Vec::new();
            for step in 0..20 {
                let t = Tensor::new(&[(step * 10 + c.rank()) as f32], &Device::Cpu).unwrap();
                let v: Vec<f32> = c.all_gather(&t, 0).unwrap().to_vec1().unwrap();
                seen.push(v);
                c.barrier().unwrap();
            }
            seen
        });
        for seen in out {
            for (step, v) in seen.iter().enumerate() {
                let base = (step * 10) as f32;
                assert_eq!(*v, vec![base, base + 1.0]);
            }
        }
    }

    #[test]
    fn broadcast_takes_source_rank() {
        let out = run(3, |c| {
            let t = Tensor::new(&[c.rank() as f32 + 7.0], &Device::Cpu).unwrap();
            let v: Vec<f32> = c.broadcast(&t, 1).unwrap().to_vec1().unwrap();
            v
        });
        assert!(out.iter().all(|v| *v == vec![8.0]));
    }

    #[test]
    fn untimed_group_waits_for_a_slow_peer() {
        let group = ThreadGroup::new(2).unwrap();
        let comms = group.communicators();
        let out: Vec<Vec<f32>> = thread::scope(|s| {
            let fast = s.spawn(|| {
                let t = Tensor::new(&[1f32], &Device::Cpu).unwrap();
                comms[0].all_reduce(&t, ReduceOp::Sum).unwrap().to_vec1().unwrap()
            });
            let slow = s.spawn(|| {
                thread::sleep(Duration::from_millis(200));
                let t = Tensor::new(&[2f32], &Device::Cpu).unwrap();
                comms[1].all_reduce(&t, ReduceOp::Sum).unwrap().to_vec1().unwrap()
            });
            vec![fast.join().unwrap(), slow.join().unwrap()]
        });
        assert_eq!(out, vec![vec![3.0], vec![3.0]]);
    }

    #[test]
    fn missing_peer_times_out() {
        let group = ThreadGroup::with_timeout(2, Some(Duration::from_millis(20))).unwrap();
        let comms = group.communicators();
        let err = comms[0].barrier().unwrap_err();
        assert!(matches!(err, DistributedError::Timeout { timeout_ms: 20 }));
        assert!(matches!(
            ThreadGroup::new(0),
            Err(DistributedError::EmptyWorld)
        ));
    }
}
