use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::warn;

use crate::error::{Error, Result};

/// Collective byte exchange between the ranks of one job, rooted at rank 0.
///
/// Every rank makes the same sequence of [`gather`](Exchange::gather) and
/// [`scatter`](Exchange::scatter) calls.
pub trait Exchange: Send + Sync {
    fn rank(&self) -> usize;

    fn num_workers(&self) -> usize;

    /// Collect one payload per rank at rank 0.
    ///
    /// Rank 0 gets every payload indexed by rank, its own included; a rank
    /// that could not deliver shows up as `None`. Other ranks get `None`.
    fn gather(&self, payload: Vec<u8>) -> Result<Option<Vec<Option<Vec<u8>>>>>;

    /// Hand every rank its own payload.
    ///
    /// Rank 0 passes one payload per rank and gets back its own; other ranks
    /// pass `None` and receive theirs.
    fn scatter(&self, payloads: Option<Vec<Vec<u8>>>) -> Result<Vec<u8>>;
}

enum Role {
    Root {
        from: Vec<Receiver<Vec<u8>>>,
        to: Vec<Sender<Vec<u8>>>,
    },
    Member {
        to_root: Sender<Vec<u8>>,
        from_root: Receiver<Vec<u8>>,
    },
}

/// In-process exchange over channels, one endpoint per rank
pub struct MemoryExchange {
    rank: usize,
    num_workers: usize,
    role: Role,
}

impl MemoryExchange {
    /// Connected endpoints for ranks `0..num_workers`
    pub fn group(num_workers: usize) -> Vec<MemoryExchange> {
        let num_workers = num_workers.max(1);
        let mut from = Vec::new();
        let mut to = Vec::new();
        let mut members = Vec::new();

        for rank in 1..num_workers {
            let (up_tx, up_rx) = unbounded();
            let (down_tx, down_rx) = unbounded();
            from.push(up_rx);
            to.push(down_tx);
            members.push(MemoryExchange {
                rank,
                num_workers,
                role: Role::Member {
                    to_root: up_tx,
                    from_root: down_rx,
                },
            });
        }

        let mut group = Vec::with_capacity(num_workers);
        group.push(MemoryExchange {
            rank: 0,
            num_workers,
            role: Role::Root { from, to },
        });
        group.extend(members);
        group
    }
}

impl Exchange for MemoryExchange {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn gather(&self, payload: Vec<u8>) -> Result<Option<Vec<Option<Vec<u8>>>>> {
        match &self.role {
            Role::Root { from, .. } => {
                let mut all = Vec::with_capacity(self.num_workers);
                all.push(Some(payload));
                for (i, rx) in from.iter().enumerate() {
                    match rx.recv() {
                        Ok(bytes) => all.push(Some(bytes)),
                        Err(_) => {
                            warn!("rank {} left before sending its partitions", i + 1);
                            all.push(None);
                        }
                    }
                }
                Ok(Some(all))
            }
            Role::Member { to_root, .. } => {
                to_root
                    .send(payload)
                    .map_err(|_| Error::Protocol("rank 0 is gone".into()))?;
                Ok(None)
            }
        }
    }

    fn scatter(&self, payloads: Option<Vec<Vec<u8>>>) -> Result<Vec<u8>> {
        match &self.role {
            Role::Root { to, .. } => {
                let payloads = payloads.ok_or_else(|| Error::Protocol("rank 0 scattered nothing".into()))?;
                if payloads.len() != self.num_workers {
                    return Err(Error::Protocol(format!(
                        "{} payloads for {} ranks",
                        payloads.len(),
                        self.num_workers
                    )));
                }
                let mut payloads = payloads.into_iter();
                let own = payloads.next().unwrap_or_default();
                for (i, (tx, bytes)) in to.iter().zip(payloads).enumerate() {
                    if tx.send(bytes).is_err() {
                        warn!("rank {} left before receiving its partitions", i + 1);
                    }
                }
                Ok(own)
            }
            Role::Member { from_root, .. } => from_root
                .recv()
                .map_err(|_| Error::Protocol("rank 0 is gone".into())),
        }
    }
}
