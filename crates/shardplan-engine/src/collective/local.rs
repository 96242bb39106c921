//! In-process communicator
//!
//! Simulated ranks run as tasks in one process and rendezvous through a
//! shared [`LocalHub`]. Collectives are matched by group membership and a
//! per-group sequence number, so every member must issue collectives on a
//! group in the same order. Point-to-point transfers are matched by
//! `(src, dst, tag)`.

use async_trait::async_trait;
use parking_lot::Mutex;
use shardplan_interfaces::{Communicator, ProcessGroup};
use shardplan_types::{Rank, Result, ShardplanError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// How long a rank waits for its peers before failing
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type GatherKey = (Vec<Rank>, u64);

struct GatherSlot {
    parts: Vec<Option<Vec<f32>>>,
    waiters: Vec<oneshot::Sender<Vec<Vec<f32>>>>,
}

impl GatherSlot {
    fn new(size: usize) -> Self {
        Self {
            parts: vec![None; size],
            waiters: Vec::with_capacity(size),
        }
    }

    fn is_complete(&self) -> bool {
        self.parts.iter().all(Option::is_some)
    }
}

enum Mailbox {
    Data(Vec<f32>),
    Waiting(oneshot::Sender<Vec<f32>>),
}

/// Rendezvous point shared by all ranks of one simulated world
pub struct LocalHub {
    world_size: usize,
    gathers: Mutex<HashMap<GatherKey, GatherSlot>>,
    mailboxes: Mutex<HashMap<(Rank, Rank, u64), Mailbox>>,
}

impl LocalHub {
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            gathers: Mutex::new(HashMap::new()),
            mailboxes: Mutex::new(HashMap::new()),
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Communicator for `rank` with the default timeout
    pub fn communicator(self: &Arc<Self>, rank: Rank) -> Result<LocalCommunicator> {
        LocalCommunicator::new(rank, Arc::clone(self), DEFAULT_TIMEOUT)
    }

    /// Open rendezvous: unreceived transfers, waiting receives and
    /// collectives some member has not joined yet
    pub fn pending_messages(&self) -> usize {
        self.mailboxes.lock().len() + self.gathers.lock().len()
    }
}

/// One rank's handle onto a [`LocalHub`]
pub struct LocalCommunicator {
    rank: Rank,
    hub: Arc<LocalHub>,
    sequences: Mutex<HashMap<Vec<Rank>, u64>>,
    timeout: Duration,
}

impl LocalCommunicator {
    pub fn new(rank: Rank, hub: Arc<LocalHub>, timeout: Duration) -> Result<Self> {
        if rank >= hub.world_size {
            return Err(ShardplanError::communication(format!(
                "rank {} outside a world of {}",
                rank, hub.world_size
            )));
        }
        Ok(Self {
            rank,
            hub,
            sequences: Mutex::new(HashMap::new()),
            timeout,
        })
    }

    fn next_sequence(&self, group: &ProcessGroup) -> u64 {
        let mut sequences = self.sequences.lock();
        let counter = sequences.entry(group.ranks().to_vec()).or_insert(0);
        let current = *counter;
        *counter += 1;
        current
    }

    async fn wait<T>(&self, rx: oneshot::Receiver<T>, what: String) -> Result<T> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ShardplanError::communication(format!(
                "rank {}: {} abandoned",
                self.rank, what
            ))),
            Err(_) => Err(ShardplanError::communication(format!(
                "rank {}: {} timed out after {:?}",
                self.rank, what, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl Communicator for LocalCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.hub.world_size
    }

    async fn all_gather(&self, group: &ProcessGroup, local: &[f32]) -> Result<Vec<Vec<f32>>> {
        let index = group.index_of(self.rank).ok_or_else(|| {
            ShardplanError::communication(format!(
                "rank {} is not a member of group {}",
                self.rank, group
            ))
        })?;
        if group.is_trivial() {
            return Ok(vec![local.to_vec()]);
        }
        let sequence = self.next_sequence(group);
        let key = (group.ranks().to_vec(), sequence);
        trace!(rank = self.rank, group = %group, sequence, "all_gather");

        let rx = {
            let mut gathers = self.hub.gathers.lock();
            let slot = gathers
                .entry(key.clone())
                .or_insert_with(|| GatherSlot::new(group.size()));
            if slot.parts[index].is_some() {
                return Err(ShardplanError::communication(format!(
                    "rank {} contributed twice to collective {} on {}",
                    self.rank, sequence, group
                )));
            }
            slot.parts[index] = Some(local.to_vec());

            if slot.is_complete() {
                let slot = gathers
                    .remove(&key)
                    .ok_or_else(|| ShardplanError::internal("gather slot vanished"))?;
                let parts: Vec<Vec<f32>> = slot.parts.into_iter().flatten().collect();
                for waiter in slot.waiters {
                    // a waiter that timed out has nothing left to deliver to
                    let _ = waiter.send(parts.clone());
                }
                return Ok(parts);
            }

            let (tx, rx) = oneshot::channel();
            slot.waiters.push(tx);
            rx
        };
        let result = self
            .wait(rx, format!("collective {} on {}", sequence, group))
            .await;
        if result.is_err() {
            // drops the other waiters too, failing the collective everywhere
            self.hub.gathers.lock().remove(&key);
        }
        result
    }

    async fn send(&self, dst: Rank, tag: u64, data: Vec<f32>) -> Result<()> {
        if dst >= self.hub.world_size {
            return Err(ShardplanError::communication(format!(
                "send to rank {} outside a world of {}",
                dst, self.hub.world_size
            )));
        }
        let key = (self.rank, dst, tag);
        let mut mailboxes = self.hub.mailboxes.lock();
        match mailboxes.remove(&key) {
            Some(Mailbox::Waiting(tx)) => tx.send(data).map_err(|_| {
                ShardplanError::communication(format!(
                    "rank {} stopped waiting for tag {} from {}",
                    dst, tag, self.rank
                ))
            }),
            Some(Mailbox::Data(previous)) => {
                mailboxes.insert(key, Mailbox::Data(previous));
                Err(ShardplanError::communication(format!(
                    "tag {} from {} to {} sent twice",
                    tag, self.rank, dst
                )))
            }
            None => {
                debug!(src = self.rank, dst, tag, len = data.len(), "Queued transfer");
                mailboxes.insert(key, Mailbox::Data(data));
                Ok(())
            }
        }
    }

    async fn recv(&self, src: Rank, tag: u64) -> Result<Vec<f32>> {
        let key = (src, self.rank, tag);
        let rx = {
            let mut mailboxes = self.hub.mailboxes.lock();
            match mailboxes.remove(&key) {
                Some(Mailbox::Data(data)) => return Ok(data),
                Some(Mailbox::Waiting(tx)) => {
                    mailboxes.insert(key, Mailbox::Waiting(tx));
                    return Err(ShardplanError::communication(format!(
                        "rank {} already waits for tag {} from {}",
                        self.rank, tag, src
                    )));
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    mailboxes.insert(key, Mailbox::Waiting(tx));
                    rx
                }
            }
        };
        let result = self
            .wait(rx, format!("receive of tag {} from {}", tag, src))
            .await;
        if result.is_err() {
            let mut mailboxes = self.hub.mailboxes.lock();
            if matches!(mailboxes.get(&key), Some(Mailbox::Waiting(_))) {
                mailboxes.remove(&key);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardplan_interfaces::ReduceOp;

    fn world(size: usize) -> Vec<Arc<LocalCommunicator>> {
        let hub = LocalHub::new(size);
        (0..size)
            .map(|rank| Arc::new(hub.communicator(rank).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_all_reduce_across_tasks() {
        let comms = world(4);
        let group = ProcessGroup::world(4);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let group = group.clone();
                tokio::spawn(async move {
                    let mut data = vec![comm.rank() as f32, 1.0];
                    comm.all_reduce(&group, &mut data, ReduceOp::Sum).await.unwrap();
                    data
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), vec![6.0, 4.0]);
        }
    }

    #[tokio::test]
    async fn test_gathers_on_disjoint_groups() {
        let comms = world(4);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                tokio::spawn(async move {
                    let rank = comm.rank();
                    let group = ProcessGroup::new(if rank % 2 == 0 { vec![0, 2] } else { vec![1, 3] });
                    comm.all_gather(&group, &[rank as f32]).await.unwrap()
                })
            })
            .collect();
        let results: Vec<_> = futures::future::join_all(handles).await;
        assert_eq!(results[0].as_ref().unwrap(), &vec![vec![0.0], vec![2.0]]);
        assert_eq!(results[3].as_ref().unwrap(), &vec![vec![1.0], vec![3.0]]);
    }

    #[tokio::test]
    async fn test_send_before_and_after_recv() {
        let comms = world(2);
        comms[0].send(1, 7, vec![1.0, 2.0]).await.unwrap();
        assert_eq!(comms[1].recv(0, 7).await.unwrap(), vec![1.0, 2.0]);

        let receiver = Arc::clone(&comms[1]);
        let pending = tokio::spawn(async move { receiver.recv(0, 8).await });
        tokio::task::yield_now().await;
        comms[0].send(1, 8, vec![3.0]).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), vec![3.0]);
    }

    #[tokio::test]
    async fn test_timed_out_waits_leave_no_state() {
        let hub = LocalHub::new(2);
        let comm = LocalCommunicator::new(0, Arc::clone(&hub), Duration::from_millis(20)).unwrap();

        let err = comm.recv(1, 3).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(hub.pending_messages(), 0);

        let group = ProcessGroup::world(2);
        assert!(comm.all_gather(&group, &[1.0]).await.is_err());
        assert_eq!(hub.pending_messages(), 0);
    }

    #[tokio::test]
    async fn test_missing_peer_times_out() {
        let hub = LocalHub::new(2);
        let comm = LocalCommunicator::new(0, hub, Duration::from_millis(20)).unwrap();
        let err = comm.recv(1, 0).await.unwrap_err();
        assert!(matches!(err, ShardplanError::Communication { .. }));
    }

    #[test]
    fn test_rank_outside_world() {
        let hub = LocalHub::new(2);
        assert!(hub.communicator(2).is_err());
    }
}
