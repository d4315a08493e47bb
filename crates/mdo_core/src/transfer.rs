//! Data passing between connected variables.
//!
//! The schedule is computed once at setup for one worker: every connection
//! belongs to the deepest group containing both ends, and to the pair of that
//! group's children holding the source and the target. Forward phases copy
//! source entries into targets; the reverse phase accumulates target
//! derivatives back into their sources.

use crate::comm::{Communicator, TAG_TRANSFER};
use crate::error::{MdoError, Result};
use crate::model::{common_ancestor, ComponentPlan};
use crate::registry::Registry;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `u` into `p`.
    Nonlinear,
    /// `du` into `dp`.
    LinearForward,
    /// `dp` accumulated into `du`.
    LinearReverse,
}

/// Work one worker does for one (group, child) entry of the schedule.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct TransferSet {
    /// (from, to) pairs this worker handles on its own.
    pub local: Vec<(usize, usize)>,
    /// Entries of the source vector to send, per peer.
    pub sends: BTreeMap<usize, Vec<usize>>,
    /// Entries of the destination vector to fill, per peer.
    pub recvs: BTreeMap<usize, Vec<usize>>,
}

impl TransferSet {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.sends.is_empty() && self.recvs.is_empty()
    }

    /// Moves `from` into `to`, overwriting or (when `accumulate`) adding.
    /// Sends go out before any receive so peers never wait on each other.
    pub fn run(&self, comm: &dyn Communicator, from: &[f64], to: &mut [f64], accumulate: bool) -> Result<()> {
        for (&peer, entries) in &self.sends {
            comm.send(peer, TAG_TRANSFER, entries.iter().map(|&i| from[i]).collect())?;
        }
        let mut put = |index: usize, value: f64| {
            if accumulate {
                to[index] += value;
            } else {
                to[index] = value;
            }
        };
        for &(f, t) in &self.local {
            put(t, from[f]);
        }
        for (&peer, entries) in &self.recvs {
            let data = comm.recv(peer, TAG_TRANSFER)?;
            if data.len() != entries.len() {
                return Err(MdoError::Communication(format!(
                    "expected {} values from rank {peer}, received {}",
                    entries.len(),
                    data.len()
                )));
            }
            for (&index, value) in entries.iter().zip(data) {
                put(index, value);
            }
        }
        Ok(())
    }

    /// Adds entry pairs for data flowing from `src_workers` (owner first) to
    /// every worker of `dst_workers`.
    fn add(&mut self, rank: usize, pairs: &[(usize, usize)], src_workers: &Range<usize>, dst_workers: &Range<usize>) {
        let owner = src_workers.start;
        if dst_workers.contains(&rank) {
            if src_workers.contains(&rank) {
                self.local.extend_from_slice(pairs);
            } else {
                self.recvs
                    .entry(owner)
                    .or_default()
                    .extend(pairs.iter().map(|&(_, t)| t));
            }
        }
        if rank == owner {
            for peer in dst_workers.clone().filter(|w| !src_workers.contains(w)) {
                self.sends
                    .entry(peer)
                    .or_default()
                    .extend(pairs.iter().map(|&(f, _)| f));
            }
        }
    }
}

/// This worker's whole schedule.
#[derive(Debug, Clone, Default)]
pub(crate) struct Transfers {
    /// Forward sets keyed by (group, target child).
    by_target: HashMap<(usize, usize), TransferSet>,
    /// Reverse sets keyed by (group, source child).
    by_source: HashMap<(usize, usize), TransferSet>,
}

impl Transfers {
    pub fn build(registry: &Registry, comps: &[ComponentPlan], rank: usize) -> Self {
        let mut transfers = Transfers::default();
        for connection in registry.connections() {
            let src = &comps[registry.variable(connection.src).component];
            let target = &comps[registry.variable(connection.target).component];
            let (group, a, b) = common_ancestor(&src.ancestry, &target.ancestry);
            let pairs: Vec<(usize, usize)> = connection.pairs(registry).collect();

            transfers
                .by_target
                .entry((group, b))
                .or_default()
                .add(rank, &pairs, &src.workers, &target.workers);

            let reversed: Vec<(usize, usize)> = pairs.iter().map(|&(u, p)| (p, u)).collect();
            transfers
                .by_source
                .entry((group, a))
                .or_default()
                .add(rank, &reversed, &target.workers, &src.workers);
        }
        transfers.by_target.retain(|_, set| !set.is_empty());
        transfers.by_source.retain(|_, set| !set.is_empty());
        transfers
    }

    /// The set moving data into (forward) or out of (reverse) `child` of
    /// `group`.
    pub fn set(&self, phase: Phase, group: usize, child: usize) -> Option<&TransferSet> {
        match phase {
            Phase::Nonlinear | Phase::LinearForward => self.by_target.get(&(group, child)),
            Phase::LinearReverse => self.by_source.get(&(group, child)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;

    #[test]
    fn forward_sets_copy_only_selected_entries() {
        let mut set = TransferSet::default();
        set.add(0, &[(2, 0), (0, 1)], &(0..1), &(0..1));
        let u = [10.0, 20.0, 30.0];
        let mut p = [-1.0, -1.0, -1.0];
        set.run(&SerialComm, &u, &mut p, false).unwrap();
        assert_eq!(p, [30.0, 10.0, -1.0]);
    }

    #[test]
    fn reverse_sets_accumulate() {
        let mut set = TransferSet::default();
        set.add(0, &[(0, 1), (1, 1)], &(0..1), &(0..1));
        let dp = [1.5, 2.5];
        let mut du = [0.0, 1.0];
        set.run(&SerialComm, &dp, &mut du, true).unwrap();
        assert_eq!(du, [0.0, 5.0]);
    }

    #[test]
    fn remote_targets_receive_from_the_source_owner() {
        let pairs = [(4, 7)];
        let src = 0..2;
        let dst = 1..3;

        let mut on_owner = TransferSet::default();
        on_owner.add(0, &pairs, &src, &dst);
        assert!(on_owner.local.is_empty());
        assert_eq!(on_owner.sends.get(&2), Some(&vec![4]));
        assert!(on_owner.sends.get(&1).is_none());

        let mut shared = TransferSet::default();
        shared.add(1, &pairs, &src, &dst);
        assert_eq!(shared.local, vec![(4, 7)]);
        assert!(shared.sends.is_empty());

        let mut remote = TransferSet::default();
        remote.add(2, &pairs, &src, &dst);
        assert_eq!(remote.recvs.get(&0), Some(&vec![7]));
    }
}
