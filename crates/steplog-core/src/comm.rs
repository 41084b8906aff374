//! Distributed coordination between ranks.
//!
//! The tick engine only needs two collectives: gather-to-root and
//! broadcast-from-root. Both are expressed over [`serde_json::Value`] so any
//! launch mechanism (MPI bindings, sockets, threads) can implement
//! [`Communicator`] without knowing the engine's payload types.
//!
//! Collectives block until every rank arrives. There is no timeout: a rank
//! that never arrives stalls the others.
//!
//! [`thread_group`] provides an in-process implementation with one OS thread
//! per rank, used by tests and single-machine demos.

use std::sync::mpsc::{Receiver, Sender, channel};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Rank that gathers and broadcasts.
pub const ROOT_RANK: u32 = 0;

/// Errors raised by collective calls.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// A peer hung up before the collective finished.
    #[error("rank {rank} disconnected")]
    Disconnected {
        /// The rank that went away.
        rank: u32,
    },

    /// The communicator was used in a way its protocol forbids.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// What went wrong.
        reason: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("payload error: {source}")]
    Payload {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },
}

/// A group of cooperating ranks.
pub trait Communicator {
    /// This process's rank, `0..size`.
    fn rank(&self) -> u32;

    /// Number of ranks in the group.
    fn size(&self) -> u32;

    /// Send `value` to the root. The root receives every rank's value in
    /// rank order; other ranks receive `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CommError`] if a peer disconnects.
    fn gather(&self, value: Value) -> Result<Option<Vec<Value>>, CommError>;

    /// Distribute the root's value to every rank. The root passes
    /// `Some(value)`; other ranks pass `None` and receive the root's value.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::Protocol`] if the root passes `None`, or
    /// [`CommError::Disconnected`] if a peer disconnects.
    fn broadcast(&self, value: Option<Value>) -> Result<Value, CommError>;

    /// Whether this rank is the root.
    fn is_root(&self) -> bool {
        self.rank() == ROOT_RANK
    }
}

/// Typed gather: serialize, gather, deserialize on the root.
///
/// # Errors
///
/// Returns [`CommError`] on transport or payload failure.
pub fn gather_as<T>(comm: &dyn Communicator, value: &T) -> Result<Option<Vec<T>>, CommError>
where
    T: Serialize + DeserializeOwned,
{
    let gathered = comm.gather(serde_json::to_value(value)?)?;
    gathered
        .map(|values| {
            values
                .into_iter()
                .map(|v| serde_json::from_value(v).map_err(CommError::from))
                .collect::<Result<Vec<T>, _>>()
        })
        .transpose()
}

/// Typed broadcast. The root passes `Some`, everyone receives the root's
/// value.
///
/// # Errors
///
/// Returns [`CommError`] on transport or payload failure.
pub fn broadcast_as<T>(comm: &dyn Communicator, value: Option<&T>) -> Result<T, CommError>
where
    T: Serialize + DeserializeOwned,
{
    let encoded = value.map(serde_json::to_value).transpose()?;
    let received = comm.broadcast(encoded)?;
    Ok(serde_json::from_value(received)?)
}

// ---------------------------------------------------------------------------
// In-process thread group
// ---------------------------------------------------------------------------

enum Links {
    Root {
        inbound: Vec<Receiver<Value>>,
        outbound: Vec<Sender<Value>>,
    },
    Member {
        to_root: Sender<Value>,
        from_root: Receiver<Value>,
    },
}

/// One rank of an in-process group created by [`thread_group`].
///
/// Each handle is meant to be moved into its own thread.
pub struct ThreadCommunicator {
    rank: u32,
    size: u32,
    links: Links,
}

impl core::fmt::Debug for ThreadCommunicator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadCommunicator")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Create `size` connected communicators, index `i` being rank `i`.
pub fn thread_group(size: u32) -> Vec<ThreadCommunicator> {
    if size == 0 {
        return Vec::new();
    }
    let mut inbound = Vec::new();
    let mut outbound = Vec::new();
    let mut members = Vec::new();
    for rank in 1..size {
        let (to_root, root_rx) = channel();
        let (root_tx, from_root) = channel();
        inbound.push(root_rx);
        outbound.push(root_tx);
        members.push(ThreadCommunicator {
            rank,
            size,
            links: Links::Member { to_root, from_root },
        });
    }
    let mut group = vec![ThreadCommunicator {
        rank: ROOT_RANK,
        size,
        links: Links::Root { inbound, outbound },
    }];
    group.extend(members);
    group
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn gather(&self, value: Value) -> Result<Option<Vec<Value>>, CommError> {
        match &self.links {
            Links::Root { inbound, .. } => {
                let mut values = Vec::with_capacity(inbound.len().saturating_add(1));
                values.push(value);
                for (rank, rx) in (1..).zip(inbound) {
                    values.push(rx.recv().map_err(|_err| CommError::Disconnected { rank })?);
                }
                Ok(Some(values))
            }
            Links::Member { to_root, .. } => {
                to_root
                    .send(value)
                    .map_err(|_err| CommError::Disconnected { rank: ROOT_RANK })?;
                Ok(None)
            }
        }
    }

    fn broadcast(&self, value: Option<Value>) -> Result<Value, CommError> {
        match &self.links {
            Links::Root { outbound, .. } => {
                let value = value.ok_or_else(|| CommError::Protocol {
                    reason: "root must supply the broadcast value".to_owned(),
                })?;
                for (rank, tx) in (1..).zip(outbound) {
                    tx.send(value.clone())
                        .map_err(|_err| CommError::Disconnected { rank })?;
                }
                Ok(value)
            }
            Links::Member { from_root, .. } => from_root
                .recv()
                .map_err(|_err| CommError::Disconnected { rank: ROOT_RANK }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn gather_collects_in_rank_order_on_root() {
        let mut group = thread_group(3);
        let root = group.remove(0);
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let rank = comm.rank();
                    assert!(gather_as(&comm, &(rank * 10)).unwrap().is_none());
                    broadcast_as::<String>(&comm, None).unwrap()
                })
            })
            .collect();

        let gathered = gather_as(&root, &0_u32).unwrap().unwrap();
        assert_eq!(gathered, vec![0, 10, 20]);
        let sent = broadcast_as(&root, Some(&"go".to_owned())).unwrap();
        assert_eq!(sent, "go");

        for handle in handles {
            assert_eq!(handle.join().expect("rank thread"), "go");
        }
    }

    #[test]
    fn single_rank_group_is_its_own_root() {
        let group = thread_group(1);
        let comm = group.first().unwrap();
        assert!(comm.is_root());
        assert_eq!(gather_as(comm, &5_i32).unwrap(), Some(vec![5]));
        assert_eq!(broadcast_as(comm, Some(&7_i32)).unwrap(), 7);
    }

    #[test]
    fn root_broadcast_without_value_is_rejected() {
        let group = thread_group(1);
        let comm = group.first().unwrap();
        assert!(matches!(
            comm.broadcast(None),
            Err(CommError::Protocol { .. })
        ));
    }

    #[test]
    fn member_sees_disconnect_when_root_is_gone() {
        let mut group = thread_group(2);
        let member = group.pop().unwrap();
        drop(group);
        assert!(matches!(
            broadcast_as::<u32>(&member, None),
            Err(CommError::Disconnected { rank: 0 })
        ));
    }
}
