//! Cross-worker interest bookkeeping.
//!
//! A worker keeps two tables: [`Subscriptions`], what it asked other workers'
//! runnables to forward to it, and [`Audience`], what other workers asked of
//! its own runnables.

use std::collections::{BTreeMap, BTreeSet};

use crate::identifier::Identifier;
use crate::message::Listenables;

/// Interest of the local worker in messages named `names` produced by
/// `runnable` on `worker`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listenable {
    pub worker: String,
    pub runnable: String,
    pub names: Vec<String>,
}

impl Listenable {
    pub fn new(worker: impl Into<String>, runnable: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            runnable: runnable.into(),
            names: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn runnable_id(&self) -> Identifier {
        Identifier::runnable(&self.runnable, &self.worker)
    }
}

type NestedSets = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

fn insert_all(table: &mut NestedSets, outer: &str, inner: &str, names: &[String]) -> bool {
    let set = table
        .entry(outer.to_string())
        .or_default()
        .entry(inner.to_string())
        .or_default();
    let mut added = false;
    for name in names {
        added |= set.insert(name.clone());
    }
    added
}

/// `owner worker -> runnable -> message names` the local worker wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscriptions {
    by_worker: NestedSets,
}

impl Subscriptions {
    /// Returns whether anything new was recorded.
    pub fn add(&mut self, listenable: &Listenable) -> bool {
        insert_all(
            &mut self.by_worker,
            &listenable.worker,
            &listenable.runnable,
            &listenable.names,
        )
    }

    /// Announcement payloads for every runnable of `worker` we listen to.
    pub fn for_worker(&self, worker: &str) -> Vec<Listenables> {
        self.by_worker
            .get(worker)
            .map(|runnables| {
                runnables
                    .iter()
                    .map(|(runnable, names)| Listenables {
                        runnable: runnable.clone(),
                        names: names.iter().cloned().collect(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn workers(&self) -> Vec<String> {
        self.by_worker.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_worker.is_empty()
    }
}

/// `local runnable -> remote worker -> message names` other workers want.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Audience {
    by_runnable: NestedSets,
}

impl Audience {
    pub fn add(&mut self, worker: &str, listenables: &Listenables) -> bool {
        insert_all(
            &mut self.by_runnable,
            &listenables.runnable,
            worker,
            &listenables.names,
        )
    }

    /// Remote workers that asked for messages named `name` from `runnable`.
    pub fn interested(&self, runnable: &str, name: &str) -> Vec<String> {
        self.by_runnable
            .get(runnable)
            .map(|workers| {
                workers
                    .iter()
                    .filter(|(_, names)| names.contains(name))
                    .map(|(worker, _)| worker.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn names(&self, runnable: &str, worker: &str) -> Vec<String> {
        self.by_runnable
            .get(runnable)
            .and_then(|workers| workers.get(worker))
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops everything `worker` asked for.
    pub fn remove_worker(&mut self, worker: &str) {
        self.retain_workers(|candidate| candidate != worker);
    }

    pub fn retain_workers<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        for workers in self.by_runnable.values_mut() {
            workers.retain(|worker, _| keep(worker));
        }
        self.by_runnable.retain(|_, workers| !workers.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.by_runnable.is_empty()
    }
}
