//! Bound State
//!
//! Durable cells in which computations remember partial results between
//! incremental steps: running sums and counts, and one contribution per item
//! so that a deleted item can be subtracted without re-reading it.
//!
//! # Layout
//!
//! The store is an arena indexed by [`StateKey`]: the owning computation, a
//! cell name and a [`StateScope`]. Record and relation-row ids are the stable
//! external index into it, which is what makes deletes O(1).
//!
//! - `Global` holds one value for the whole computation
//! - `Record` holds one value per host record
//! - `Item` holds one value per watched item, optionally per host as well
//!   (a symmetric relation row is an item of both of its endpoints)
//!
//! Cells belonging to a deleted record are dropped by [`BoundStateStore::forget_record`]
//! at the end of the propagation pass that deleted it. Reading a forgotten
//! cell yields the cell's default. Every key is indexed by the records it
//! belongs to and by its computation, so forgetting a record or clearing one
//! host's items only visits those cells.
//!
//! Pending async tasks live beside the cells so that a snapshot captures both.
//!
//! # Transactions
//!
//! [`BoundStateStore::begin`] opens an undo journal. Each write made while it
//! is open records the value it replaced, and [`BoundStateStore::rollback`]
//! puts those values back in reverse order.

mod cell;

pub use cell::{GlobalBoundState, ItemBoundState, RecordBoundState};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use crate::error::Result;
use crate::graph::NodeId;
use crate::store::RecordId;

/// Where a bound state cell lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateScope {
    Global,
    Record { record: String, id: RecordId },
    Item {
        record: String,
        id: RecordId,
        host: Option<RecordId>,
    },
}

/// Address of one bound state cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub computation: NodeId,
    pub cell: String,
    pub scope: StateScope,
}

/// Secondary index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Owner {
    Computation(NodeId),
    Record(RecordId),
}

impl StateKey {
    /// The computation, plus the records the cell belongs to as key or host.
    fn owners(&self) -> SmallVec<[Owner; 3]> {
        let mut owners = SmallVec::new();
        owners.push(Owner::Computation(self.computation));
        match &self.scope {
            StateScope::Global => {}
            StateScope::Record { id, .. } => owners.push(Owner::Record(*id)),
            StateScope::Item { id, host, .. } => {
                owners.push(Owner::Record(*id));
                match *host {
                    Some(host) if host != *id => owners.push(Owner::Record(host)),
                    _ => {}
                }
            }
        }
        owners
    }
}

/// A suspended async computation waiting for [`crate::Controller::handle_async_return`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTask {
    pub id: u64,
    pub computation: NodeId,
    /// Host record name and id for property computations.
    pub host: Option<(String, RecordId)>,
    /// Arguments the computation handed out with its async result.
    pub args: Value,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    cells: Vec<(StateKey, Value)>,
    tasks: Vec<PendingTask>,
    next_task: u64,
}

/// What a write replaced.
#[derive(Debug)]
enum Undo {
    Cell(StateKey, Option<Value>),
    Task(u64, Option<PendingTask>),
}

/// Concurrent arena of bound state cells and pending async tasks.
#[derive(Debug, Default)]
pub struct BoundStateStore {
    cells: DashMap<StateKey, Value>,
    owners: DashMap<Owner, HashSet<StateKey>>,
    tasks: DashMap<u64, PendingTask>,
    next_task: AtomicU64,
    journal: Mutex<Vec<Vec<Undo>>>,
}

impl BoundStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &StateKey) -> Option<Value> {
        self.cells.get(key).map(|value| value.clone())
    }

    pub fn set(&self, key: StateKey, value: Value) {
        let old = self.put_cell(key.clone(), value);
        self.log(Undo::Cell(key, old));
    }

    pub fn remove(&self, key: &StateKey) -> Option<Value> {
        let old = self.take_cell(key)?;
        self.log(Undo::Cell(key.clone(), Some(old.clone())));
        Some(old)
    }

    pub fn contains(&self, key: &StateKey) -> bool {
        self.cells.contains_key(key)
    }

    /// Number of stored cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Keys of the cells scoped to record `id`, as key or as host.
    pub fn keys_of_record(&self, id: RecordId) -> Vec<StateKey> {
        self.keys_of(Owner::Record(id))
    }

    /// Keys of every cell owned by `computation`.
    pub fn keys_of_computation(&self, computation: NodeId) -> Vec<StateKey> {
        self.keys_of(Owner::Computation(computation))
    }

    /// Drop every cell scoped to record `id`. Returns how many were dropped.
    pub fn forget_record(&self, id: RecordId) -> usize {
        let keys = self.keys_of_record(id);
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    /// Persist a pending async task and return its id.
    pub fn push_task(&self, computation: NodeId, host: Option<(String, RecordId)>, args: Value) -> u64 {
        let id = self.next_task.fetch_add(1, Ordering::SeqCst) + 1;
        self.tasks.insert(
            id,
            PendingTask {
                id,
                computation,
                host,
                args,
            },
        );
        self.log(Undo::Task(id, None));
        id
    }

    pub fn task(&self, id: u64) -> Option<PendingTask> {
        self.tasks.get(&id).map(|task| task.clone())
    }

    pub fn take_task(&self, id: u64) -> Option<PendingTask> {
        let (_, task) = self.tasks.remove(&id)?;
        self.log(Undo::Task(id, Some(task.clone())));
        Some(task)
    }

    /// Pending tasks in creation order.
    pub fn tasks(&self) -> Vec<PendingTask> {
        let mut tasks: Vec<PendingTask> = self.tasks.iter().map(|entry| entry.value().clone()).collect();
        tasks.sort_by_key(|task| task.id);
        tasks
    }

    /// Drop the tasks whose host record is `id`. Returns the dropped task ids.
    pub fn drop_tasks_of_host(&self, id: RecordId) -> Vec<u64> {
        let orphaned: Vec<u64> = self
            .tasks
            .iter()
            .filter(|entry| entry.host.as_ref().is_some_and(|(_, host)| *host == id))
            .map(|entry| *entry.key())
            .collect();
        for task in &orphaned {
            self.take_task(*task);
        }
        orphaned
    }

    /// Open a transaction. Transactions nest.
    pub fn begin(&self) {
        self.journal.lock().push(Vec::new());
    }

    /// Keep the writes of the innermost transaction.
    pub fn commit(&self) {
        let mut journal = self.journal.lock();
        if let Some(done) = journal.pop() {
            if let Some(outer) = journal.last_mut() {
                outer.extend(done);
            }
        }
    }

    /// Undo the writes of the innermost transaction. Task ids are not reused.
    pub fn rollback(&self) {
        let undone = self.journal.lock().pop().unwrap_or_default();
        for undo in undone.into_iter().rev() {
            match undo {
                Undo::Cell(key, Some(old)) => {
                    self.put_cell(key, old);
                }
                Undo::Cell(key, None) => {
                    self.take_cell(&key);
                }
                Undo::Task(id, Some(task)) => {
                    self.tasks.insert(id, task);
                }
                Undo::Task(id, None) => {
                    self.tasks.remove(&id);
                }
            }
        }
    }

    /// Encode every cell and pending task as MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let snapshot = Snapshot {
            cells: self
                .cells
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            tasks: self.tasks(),
            next_task: self.next_task.load(Ordering::SeqCst),
        };
        Ok(rmp_serde::to_vec_named(&snapshot)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let snapshot: Snapshot = rmp_serde::from_slice(bytes)?;
        let store = Self {
            tasks: snapshot.tasks.into_iter().map(|task| (task.id, task)).collect(),
            next_task: AtomicU64::new(snapshot.next_task),
            ..Self::default()
        };
        for (key, value) in snapshot.cells {
            store.put_cell(key, value);
        }
        Ok(store)
    }

    fn log(&self, undo: Undo) {
        if let Some(open) = self.journal.lock().last_mut() {
            open.push(undo);
        }
    }

    fn keys_of(&self, owner: Owner) -> Vec<StateKey> {
        self.owners
            .get(&owner)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Write a cell and index a new key. Returns the replaced value.
    fn put_cell(&self, key: StateKey, value: Value) -> Option<Value> {
        let old = self.cells.insert(key.clone(), value);
        if old.is_none() {
            for owner in key.owners() {
                self.owners.entry(owner).or_default().insert(key.clone());
            }
        }
        old
    }

    fn take_cell(&self, key: &StateKey) -> Option<Value> {
        let (_, old) = self.cells.remove(key)?;
        for owner in key.owners() {
            if let Some(mut keys) = self.owners.get_mut(&owner) {
                keys.remove(key);
            }
            self.owners.remove_if(&owner, |_, keys| keys.is_empty());
        }
        Some(old)
    }
}
