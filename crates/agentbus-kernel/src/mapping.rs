//! Mapping engine: which remote outputs feed which local inputs.
//!
//! Two tables share one id sequence: plain mappings and splits. Both route
//! by `(agent name, output name)` and both overwrite the target input on
//! every arrival; splits exist so several sources can be declared for one
//! input independently of the plain table.

use crate::definition::DefinitionStore;
use agentbus_types::definition::validate_name;
use agentbus_types::error::{BusError, BusResult};
use agentbus_types::mapping::{MappingEntry, MappingTable};
use agentbus_types::value::IoKind;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::debug;

/// Notified after every successful change to either table.
pub trait MappingListener: Send + Sync {
    fn mapping_changed(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Mappings,
    Splits,
}

/// Routing tables of one agent.
pub struct MappingEngine {
    store: Arc<DefinitionStore>,
    table: RwLock<MappingTable>,
    next_id: AtomicU64,
    outputs_request: AtomicBool,
    path: Mutex<Option<PathBuf>>,
    listener: Option<Weak<dyn MappingListener>>,
}

impl MappingEngine {
    /// Inputs are validated against `store`.
    pub fn new(store: Arc<DefinitionStore>, outputs_request: bool) -> Self {
        Self::build(store, outputs_request, None)
    }

    pub(crate) fn with_listener(
        store: Arc<DefinitionStore>,
        outputs_request: bool,
        listener: Weak<dyn MappingListener>,
    ) -> Self {
        Self::build(store, outputs_request, Some(listener))
    }

    fn build(
        store: Arc<DefinitionStore>,
        outputs_request: bool,
        listener: Option<Weak<dyn MappingListener>>,
    ) -> Self {
        Self {
            store,
            table: RwLock::new(MappingTable::default()),
            next_id: AtomicU64::new(1),
            outputs_request: AtomicBool::new(outputs_request),
            path: Mutex::new(None),
            listener,
        }
    }

    fn changed(&self) {
        if let Some(listener) = self.listener.as_ref().and_then(Weak::upgrade) {
            listener.mapping_changed();
        }
    }

    fn read<T>(&self, f: impl FnOnce(&MappingTable) -> T) -> T {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        f(&table)
    }

    fn edit<T>(&self, f: impl FnOnce(&mut MappingTable) -> BusResult<T>) -> BusResult<T> {
        let result = {
            let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
            f(&mut table)
        };
        if result.is_ok() {
            self.changed();
        }
        result
    }

    fn validate(&self, input: &str, agent: &str, output: &str) -> BusResult<()> {
        validate_name(input)?;
        validate_name(agent)?;
        validate_name(output)?;
        if !self.store.exists(IoKind::Input, input) {
            return Err(BusError::not_found("input", input));
        }
        Ok(())
    }

    fn insert(&self, which: Table, input: &str, agent: &str, output: &str) -> BusResult<u64> {
        self.validate(input, agent, output)?;
        let id = self.edit(|t| {
            let entries = entries_mut(t, which);
            if entries.iter().any(|e| e.matches(input, agent, output)) {
                return Err(BusError::already_exists(
                    "mapping",
                    format!("{input}->{agent}.{output}"),
                ));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            entries.push(MappingEntry::new(id, input, agent, output));
            Ok(id)
        })?;
        debug!(id, input, agent, output, split = which == Table::Splits, "Mapping added");
        Ok(id)
    }

    fn remove_where(&self, which: Table, what: String, pred: impl Fn(&MappingEntry) -> bool) -> BusResult<()> {
        self.edit(|t| {
            let entries = entries_mut(t, which);
            let before = entries.len();
            entries.retain(|e| !pred(e));
            if entries.len() == before {
                return Err(BusError::not_found("mapping", what));
            }
            Ok(())
        })
    }

    /// Map `agent.output` into our `input`. Returns the new id (never 0).
    pub fn add(&self, input: &str, agent: &str, output: &str) -> BusResult<u64> {
        self.insert(Table::Mappings, input, agent, output)
    }

    /// Add a split entry. Returns the new id (never 0).
    pub fn add_split(&self, input: &str, agent: &str, output: &str) -> BusResult<u64> {
        self.insert(Table::Splits, input, agent, output)
    }

    pub fn remove(&self, id: u64) -> BusResult<()> {
        self.remove_where(Table::Mappings, id.to_string(), |e| e.id == id)
    }

    pub fn remove_entry(&self, input: &str, agent: &str, output: &str) -> BusResult<()> {
        self.remove_where(Table::Mappings, format!("{input}->{agent}.{output}"), |e| {
            e.matches(input, agent, output)
        })
    }

    pub fn remove_split(&self, id: u64) -> BusResult<()> {
        self.remove_where(Table::Splits, id.to_string(), |e| e.id == id)
    }

    pub fn remove_split_entry(&self, input: &str, agent: &str, output: &str) -> BusResult<()> {
        self.remove_where(Table::Splits, format!("{input}->{agent}.{output}"), |e| {
            e.matches(input, agent, output)
        })
    }

    pub fn count(&self) -> usize {
        self.read(|t| t.mappings.len())
    }

    pub fn split_count(&self) -> usize {
        self.read(|t| t.splits.len())
    }

    pub fn entries(&self) -> Vec<MappingEntry> {
        self.read(|t| t.mappings.clone())
    }

    pub fn splits(&self) -> Vec<MappingEntry> {
        self.read(|t| t.splits.clone())
    }

    /// A copy of both tables.
    pub fn table(&self) -> MappingTable {
        self.read(MappingTable::clone)
    }

    /// Empty both tables.
    pub fn clear(&self) -> BusResult<()> {
        self.edit(|t| {
            t.mappings.clear();
            t.splits.clear();
            Ok(())
        })
    }

    /// Drop every entry, in both tables, sourced from `agent`.
    pub fn clear_with_agent(&self, agent: &str) -> BusResult<()> {
        self.edit(|t| {
            t.mappings.retain(|e| e.agent != agent);
            t.splits.retain(|e| e.agent != agent);
            Ok(())
        })
    }

    /// Drop every entry, in both tables, feeding `input`.
    pub fn clear_for_input(&self, input: &str) -> BusResult<()> {
        self.edit(|t| {
            t.mappings.retain(|e| e.input != input);
            t.splits.retain(|e| e.input != input);
            Ok(())
        })
    }

    /// Local inputs fed by `agent.output`, each listed once.
    pub fn route(&self, agent: &str, output: &str) -> Vec<String> {
        self.read(|t| {
            let mut inputs: Vec<String> = Vec::new();
            for entry in t.mappings.iter().chain(&t.splits) {
                if entry.agent == agent && entry.output == output && !inputs.contains(&entry.input) {
                    inputs.push(entry.input.clone());
                }
            }
            inputs
        })
    }

    pub fn references_agent(&self, agent: &str) -> bool {
        self.read(|t| t.references_agent(agent))
    }

    /// Names of every agent some entry reads from.
    pub fn referenced_agents(&self) -> BTreeSet<String> {
        self.read(|t| {
            t.mappings
                .iter()
                .chain(&t.splits)
                .map(|e| e.agent.clone())
                .collect()
        })
    }

    /// Whether newly discovered sources are asked for their current outputs.
    pub fn outputs_request(&self) -> bool {
        self.outputs_request.load(Ordering::Relaxed)
    }

    pub fn set_outputs_request(&self, enabled: bool) {
        self.outputs_request.store(enabled, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // JSON
    // -----------------------------------------------------------------------

    /// Replace both tables with a JSON document. Entries get fresh ids.
    pub fn load_json(&self, json: &str) -> BusResult<()> {
        let loaded = MappingTable::from_json(json)?;
        let mut fresh = MappingTable::default();
        for (which, entries) in [(Table::Mappings, &loaded.mappings), (Table::Splits, &loaded.splits)] {
            for entry in entries {
                self.validate(&entry.input, &entry.agent, &entry.output)?;
                let target = entries_mut(&mut fresh, which);
                if target.iter().any(|e| e.matches(&entry.input, &entry.agent, &entry.output)) {
                    return Err(BusError::already_exists(
                        "mapping",
                        format!("{}->{}.{}", entry.input, entry.agent, entry.output),
                    ));
                }
                target.push(MappingEntry::new(
                    self.next_id.fetch_add(1, Ordering::Relaxed),
                    &entry.input,
                    &entry.agent,
                    &entry.output,
                ));
            }
        }
        self.edit(|t| {
            *t = fresh;
            Ok(())
        })
    }

    pub fn load_file(&self, path: &Path) -> BusResult<()> {
        let json = std::fs::read_to_string(path)?;
        self.load_json(&json)?;
        self.set_path(path);
        Ok(())
    }

    pub fn to_json(&self) -> BusResult<String> {
        self.read(MappingTable::to_json)
    }

    pub fn set_path(&self, path: &Path) {
        *self.path.lock().unwrap_or_else(|e| e.into_inner()) = Some(path.to_path_buf());
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn save(&self) -> BusResult<()> {
        let path = self
            .path()
            .ok_or_else(|| BusError::InvalidState("no mapping path set".to_string()))?;
        std::fs::write(&path, self.to_json()?)?;
        Ok(())
    }
}

fn entries_mut(table: &mut MappingTable, which: Table) -> &mut Vec<MappingEntry> {
    match which {
        Table::Mappings => &mut table.mappings,
        Table::Splits => &mut table.splits,
    }
}
