// Alias cache: wire alias -> logical proxy row, plus the per-round status merge.

use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use super::{phase_to_state, LogicalProxy, ProxyStatusInfo};
use crate::ipc::ProxyMessage;

type RowKey = u64;

#[derive(Debug, Clone)]
struct Row {
    key: RowKey,
    proxy: LogicalProxy,
    aliases: Vec<String>,
}

impl Row {
    fn claims(&self, alias: &str) -> bool {
        !self.proxy.disabled && self.aliases.iter().any(|a| a == alias)
    }
}

/// Rows in display order, and the alias map covering every enabled row.
///
/// Rows carry a stable key so the alias map survives inserts and removals
/// that shift row indices.
#[derive(Debug, Default)]
pub struct AliasCache {
    rows: Vec<Row>,
    aliases: HashMap<String, RowKey>,
    next_key: RowKey,
}

impl AliasCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(proxies: Vec<LogicalProxy>) -> Self {
        let mut cache = Self::new();
        cache.reset(proxies);
        cache
    }

    /// Replace every row and rebuild the alias map from scratch.
    pub fn reset(&mut self, proxies: Vec<LogicalProxy>) {
        self.rows = proxies
            .into_iter()
            .map(|proxy| {
                let key = self.allocate_key();
                Row {
                    key,
                    aliases: proxy.aliases(),
                    proxy,
                }
            })
            .collect();
        self.rebuild();
    }

    pub fn rebuild(&mut self) {
        self.aliases.clear();
        for row in self.rows.iter().filter(|row| !row.proxy.disabled) {
            for alias in &row.aliases {
                self.aliases.insert(alias.clone(), row.key);
            }
        }
    }

    /// Insert a proxy at `index` (clamped to the end). Returns the row index used.
    pub fn insert(&mut self, index: usize, proxy: LogicalProxy) -> usize {
        let index = index.min(self.rows.len());
        let key = self.allocate_key();
        let row = Row {
            key,
            aliases: proxy.aliases(),
            proxy,
        };
        self.register(&row);
        self.rows.insert(index, row);
        index
    }

    pub fn remove(&mut self, index: usize) -> Option<LogicalProxy> {
        if index >= self.rows.len() {
            return None;
        }
        let row = self.rows.remove(index);
        self.unregister(row.key);
        Some(row.proxy)
    }

    /// Rename a row. Renames rebuild the whole map.
    pub fn rename(&mut self, index: usize, name: impl Into<String>) -> bool {
        let Some(row) = self.rows.get_mut(index) else {
            return false;
        };
        row.proxy.name = name.into();
        row.aliases = row.proxy.aliases();
        self.rebuild();
        true
    }

    /// Replace a row's configuration, keeping its current status.
    /// Returns whether the row's alias set changed.
    pub fn update(&mut self, index: usize, proxy: LogicalProxy) -> bool {
        let Some(row) = self.rows.get_mut(index) else {
            return false;
        };
        let status = std::mem::take(&mut row.proxy.status);
        let aliases = proxy.aliases();
        let changed = aliases != row.aliases || proxy.disabled != row.proxy.disabled;

        row.proxy = LogicalProxy { status, ..proxy };
        row.aliases = aliases;
        let key = row.key;

        if changed {
            self.unregister(key);
            if let Some(row) = self.rows.iter().find(|row| row.key == key) {
                let row = row.clone();
                self.register(&row);
            }
        }
        changed
    }

    /// Enable or disable a row. Disabling drops its aliases and resets its
    /// status so no stale state is shown for a tunnel that is not running.
    /// Returns whether anything changed.
    pub fn set_disabled(&mut self, index: usize, disabled: bool) -> bool {
        let Some(row) = self.rows.get_mut(index) else {
            return false;
        };
        if row.proxy.disabled == disabled {
            return false;
        }
        row.proxy.disabled = disabled;
        let key = row.key;

        if disabled {
            row.proxy.status = ProxyStatusInfo::default();
            self.unregister(key);
        } else {
            let row = row.clone();
            self.register(&row);
        }
        true
    }

    /// Every registered alias, sorted.
    pub fn alias_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.aliases.keys().cloned().collect();
        names.sort();
        names
    }

    /// Row index an alias currently resolves to.
    pub fn owner_of(&self, alias: &str) -> Option<usize> {
        let key = self.aliases.get(alias)?;
        self.rows.iter().position(|row| row.key == *key)
    }

    pub fn get(&self, index: usize) -> Option<&LogicalProxy> {
        self.rows.get(index).map(|row| &row.proxy)
    }

    pub fn proxies(&self) -> impl Iterator<Item = &LogicalProxy> {
        self.rows.iter().map(|row| &row.proxy)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Fold one response into row statuses and return the rows whose status
    /// changed, in ascending order.
    ///
    /// Records for unknown aliases are dropped. Within a row the most severe
    /// state wins, ties going to the smaller alias name. Rows without any
    /// record keep their previous status.
    pub fn merge(&mut self, records: &[ProxyMessage]) -> Vec<usize> {
        let index_of: HashMap<RowKey, usize> = self
            .rows
            .iter()
            .enumerate()
            .map(|(index, row)| (row.key, index))
            .collect();

        let mut chosen: HashMap<usize, &ProxyMessage> = HashMap::new();
        for record in records {
            let Some(index) = self
                .aliases
                .get(&record.name)
                .and_then(|key| index_of.get(key))
            else {
                continue;
            };

            match chosen.entry(*index) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(mut slot) => {
                    if rank(record) > rank(slot.get()) {
                        slot.insert(record);
                    }
                }
            }
        }

        let mut changed = Vec::new();
        for (index, record) in chosen {
            let info = ProxyStatusInfo::from_message(record);
            let proxy = &mut self.rows[index].proxy;
            if proxy.status != info {
                proxy.status = info;
                changed.push(index);
            }
        }
        changed.sort_unstable();
        changed
    }

    fn allocate_key(&mut self) -> RowKey {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    fn register(&mut self, row: &Row) {
        if row.proxy.disabled {
            return;
        }
        for alias in &row.aliases {
            if let Some(previous) = self.aliases.insert(alias.clone(), row.key) {
                if previous != row.key {
                    log::warn!("Alias {} is claimed by more than one proxy", alias);
                }
            }
        }
    }

    /// Drop the map entries owned by `key`, then hand each freed alias to
    /// the last remaining enabled row that also claims it.
    fn unregister(&mut self, key: RowKey) {
        let freed: Vec<String> = self
            .aliases
            .iter()
            .filter(|(_, owner)| **owner == key)
            .map(|(alias, _)| alias.clone())
            .collect();

        for alias in freed {
            self.aliases.remove(&alias);
            let heir = self
                .rows
                .iter()
                .rev()
                .find(|row| row.key != key && row.claims(&alias));
            if let Some(heir) = heir {
                self.aliases.insert(alias, heir.key);
            }
        }
    }
}

fn rank(record: &ProxyMessage) -> (u8, Reverse<&str>) {
    (
        phase_to_state(&record.phase).priority(),
        Reverse(record.name.as_str()),
    )
}
