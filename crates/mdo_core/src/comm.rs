//! Process-group abstraction used by the distributed runtime.
//!
//! The engine only talks to [`Communicator`]. [`SerialComm`] runs a model on a
//! single worker; [`ThreadComm`] connects in-process workers (one per thread)
//! through channels and is what the multi-worker tests use.

use crate::error::{MdoError, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

pub const TAG_TRANSFER: u64 = 1;
pub const TAG_REDUCE: u64 = 2;
pub const TAG_BROADCAST: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    fn combine(self, acc: &mut [f64], other: &[f64]) {
        for (a, b) in acc.iter_mut().zip(other) {
            match self {
                ReduceOp::Sum => *a += b,
                ReduceOp::Max => *a = a.max(*b),
            }
        }
    }
}

/// Point-to-point messaging plus collectives over contiguous rank ranges.
///
/// Messages from one rank to another with the same tag arrive in the order
/// they were sent. `send` never blocks.
pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn send(&self, dest: usize, tag: u64, data: Vec<f64>) -> Result<()>;
    fn recv(&self, src: usize, tag: u64) -> Result<Vec<f64>>;

    /// Combines `values` elementwise across `ranks`; every rank in the range
    /// ends up with the same result. Ranks outside the range return
    /// immediately.
    fn allreduce(&self, ranks: Range<usize>, values: &mut [f64], op: ReduceOp, tag: u64) -> Result<()> {
        let rank = self.rank();
        if ranks.len() <= 1 || !ranks.contains(&rank) {
            return Ok(());
        }
        let root = ranks.start;
        if rank == root {
            for other in ranks.clone().skip(1) {
                let part = self.recv(other, tag)?;
                if part.len() != values.len() {
                    return Err(MdoError::Communication(format!(
                        "rank {other} contributed {} values to a reduction of {}",
                        part.len(),
                        values.len()
                    )));
                }
                op.combine(values, &part);
            }
            for other in ranks.skip(1) {
                self.send(other, tag, values.to_vec())?;
            }
        } else {
            self.send(root, tag, values.to_vec())?;
            let result = self.recv(root, tag)?;
            values.copy_from_slice(&result);
        }
        Ok(())
    }

    /// Copies `values` from `root` to every other rank of `ranks`.
    fn broadcast(&self, root: usize, ranks: Range<usize>, values: &mut Vec<f64>, tag: u64) -> Result<()> {
        let rank = self.rank();
        if ranks.len() <= 1 || !ranks.contains(&rank) {
            return Ok(());
        }
        if rank == root {
            for other in ranks.filter(|&r| r != root) {
                self.send(other, tag, values.clone())?;
            }
        } else {
            *values = self.recv(root, tag)?;
        }
        Ok(())
    }
}

/// The trivial single-worker communicator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, dest: usize, _tag: u64, _data: Vec<f64>) -> Result<()> {
        Err(MdoError::Communication(format!(
            "serial run cannot send to rank {dest}"
        )))
    }

    fn recv(&self, src: usize, _tag: u64) -> Result<Vec<f64>> {
        Err(MdoError::Communication(format!(
            "serial run cannot receive from rank {src}"
        )))
    }
}

#[derive(Debug)]
struct Message {
    src: usize,
    tag: u64,
    data: Vec<f64>,
}

/// In-process workers connected by channels.
pub struct ThreadComm {
    rank: usize,
    senders: Vec<Sender<Message>>,
    receiver: Receiver<Message>,
    /// Messages that arrived before anyone asked for them.
    pending: RefCell<VecDeque<Message>>,
    timeout: Duration,
}

impl ThreadComm {
    /// Creates `size` connected communicators; hand one to each thread.
    pub fn create(size: usize) -> Vec<ThreadComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| ThreadComm {
                rank,
                senders: senders.clone(),
                receiver,
                pending: RefCell::new(VecDeque::new()),
                timeout: Duration::from_secs(60),
            })
            .collect()
    }

    /// Fails a `recv` that waits longer than `timeout` instead of hanging.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.senders.len())
            .finish()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, dest: usize, tag: u64, data: Vec<f64>) -> Result<()> {
        let sender = self
            .senders
            .get(dest)
            .ok_or_else(|| MdoError::Communication(format!("no rank {dest}")))?;
        sender
            .send(Message {
                src: self.rank,
                tag,
                data,
            })
            .map_err(|_| MdoError::Communication(format!("rank {dest} hung up")))
    }

    fn recv(&self, src: usize, tag: u64) -> Result<Vec<f64>> {
        {
            let mut pending = self.pending.borrow_mut();
            if let Some(pos) = pending.iter().position(|m| m.src == src && m.tag == tag) {
                if let Some(message) = pending.remove(pos) {
                    return Ok(message.data);
                }
            }
        }
        loop {
            match self.receiver.recv_timeout(self.timeout) {
                Ok(message) if message.src == src && message.tag == tag => return Ok(message.data),
                Ok(message) => self.pending.borrow_mut().push_back(message),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(MdoError::Communication(format!(
                        "rank {} timed out waiting for rank {src} (tag {tag})",
                        self.rank
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(MdoError::Communication(format!(
                        "rank {src} disconnected before sending (tag {tag})"
                    )))
                }
            }
        }
    }
}
