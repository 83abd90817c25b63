//! In-memory storage engine: disjoint string and list namespaces with
//! short-lock map access. Mutation ordering per key is enforced by the
//! node's per-key gates, not in here; this module only guarantees that each
//! individual operation reads or writes its map atomically.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::server::external::Status;

/// The per-node authoritative store. String-valued and list-valued keys
/// live in separate namespaces; the operation invoked determines which
/// namespace is touched.
#[derive(Debug, Default)]
pub(crate) struct KvStore {
    /// String namespace.
    strings: RwLock<HashMap<String, String>>,

    /// List namespace: insertion-ordered lists of unique items.
    lists: RwLock<HashMap<String, Vec<String>>>,
}

impl KvStore {
    /// Creates an empty store.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reads a string-valued key.
    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.strings
            .read()
            .unwrap()
            .get(key)
            .cloned()
    }

    /// Reads a list-valued key as a snapshot copy.
    pub(crate) fn get_list(&self, key: &str) -> Option<Vec<String>> {
        self.lists
            .read()
            .unwrap()
            .get(key)
            .cloned()
    }

    /// Overwrites a string-valued key. Always succeeds.
    pub(crate) fn put(&self, key: &str, value: &str) -> Status {
        self.strings
            .write()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
        Status::Ok
    }

    /// Appends `item` to the list at `key`, creating the list if absent.
    /// Fails with `ItemExists` if the exact item is already present.
    pub(crate) fn list_append(&self, key: &str, item: &str) -> Status {
        let mut lists = self.lists.write().unwrap();
        let list = lists.entry(key.to_owned()).or_default();
        if list.iter().any(|existing| existing == item) {
            Status::ItemExists
        } else {
            list.push(item.to_owned());
            Status::Ok
        }
    }

    /// Removes the exact `item` from the list at `key`. Fails with
    /// `ItemNotFound` if the key has no list or the item is absent.
    pub(crate) fn list_remove(&self, key: &str, item: &str) -> Status {
        let mut lists = self.lists.write().unwrap();
        match lists.get_mut(key) {
            Some(list) => match list.iter().position(|x| x == item) {
                Some(idx) => {
                    list.remove(idx);
                    Status::Ok
                }
                None => Status::ItemNotFound,
            },
            None => Status::ItemNotFound,
        }
    }
}
