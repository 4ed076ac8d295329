//! In-memory relational store implementing [`EntityStore`].
//!
//! Tables are insertion-ordered maps of JSON rows keyed by `id`. Each row has
//! a version; a transaction remembers the version of every row it reads or
//! writes and commit fails if any of them moved in the meantime.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use ontos_protocol::{
    EntityStore, OntosError, OntosResult, Row, RowChange, RowFilter, SYSTEM_TABLE_PREFIX,
    StoreTransaction, row_id,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone)]
struct Versioned {
    row: Row,
    version: u64,
}

type Table = IndexMap<String, Versioned>;

#[derive(Debug, Default)]
struct Tables {
    tables: HashMap<String, Table>,
}

impl Tables {
    fn committed(&self, entity: &str, id: &str) -> Option<&Versioned> {
        self.tables.get(entity).and_then(|t| t.get(id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEntityStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts rows outside of any transaction. Intended for seeding.
    pub fn seed(&self, entity: &str, rows: impl IntoIterator<Item = Row>) -> OntosResult<usize> {
        let mut tx = self.begin();
        let mut count = 0;
        for row in rows {
            tx.insert(entity, row)?;
            count += 1;
        }
        tx.commit()?;
        debug!(entity, count, "seeded rows");
        Ok(count)
    }

    pub fn len(&self, entity: &str) -> usize {
        self.inner.read().tables.get(entity).map_or(0, IndexMap::len)
    }

    pub fn is_empty(&self, entity: &str) -> bool {
        self.len(entity) == 0
    }
}

impl EntityStore for MemoryEntityStore {
    fn begin(&self) -> Box<dyn StoreTransaction> {
        Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            reads: Mutex::new(HashMap::new()),
            writes: IndexMap::new(),
        })
    }
}

#[derive(Debug)]
struct PendingWrite {
    /// Committed version when first touched; `None` if the row did not exist.
    base_version: Option<u64>,
    before: Option<Row>,
    after: Option<Row>,
}

#[derive(Debug)]
struct MemoryTransaction {
    inner: Arc<RwLock<Tables>>,
    /// Committed version seen by the first read of each row; `None` if absent.
    reads: Mutex<HashMap<(String, String), Option<u64>>>,
    writes: IndexMap<(String, String), PendingWrite>,
}

impl MemoryTransaction {
    fn key(entity: &str, id: &str) -> (String, String) {
        (entity.to_owned(), id.to_owned())
    }

    fn record_read(&self, entity: &str, id: &str, version: Option<u64>) {
        self.reads.lock().entry(Self::key(entity, id)).or_insert(version);
    }

    fn touch(&mut self, entity: &str, id: &str) -> &mut PendingWrite {
        let inner = Arc::clone(&self.inner);
        let read = self.reads.get_mut().get(&Self::key(entity, id)).copied();
        self.writes.entry(Self::key(entity, id)).or_insert_with(|| {
            let tables = inner.read();
            let committed = tables.committed(entity, id);
            PendingWrite {
                base_version: read.unwrap_or_else(|| committed.map(|v| v.version)),
                before: committed.map(|v| v.row.clone()),
                after: committed.map(|v| v.row.clone()),
            }
        })
    }
}

impl StoreTransaction for MemoryTransaction {
    fn get(&self, entity: &str, id: &str) -> OntosResult<Option<Row>> {
        if let Some(write) = self.writes.get(&Self::key(entity, id)) {
            return Ok(write.after.clone());
        }
        let tables = self.inner.read();
        let committed = tables.committed(entity, id);
        self.record_read(entity, id, committed.map(|v| v.version));
        Ok(committed.map(|v| v.row.clone()))
    }

    fn query(&self, entity: &str, filters: &[RowFilter]) -> OntosResult<Vec<Row>> {
        let tables = self.inner.read();
        let mut rows = Vec::new();
        if let Some(table) = tables.tables.get(entity) {
            for (id, committed) in table {
                match self.writes.get(&Self::key(entity, id)) {
                    Some(write) => rows.extend(write.after.clone()),
                    None if filters.iter().all(|f| f.matches(&committed.row)) => {
                        self.record_read(entity, id, Some(committed.version));
                        rows.push(committed.row.clone());
                    }
                    None => {}
                }
            }
        }
        for ((table, _), write) in &self.writes {
            if table == entity && write.base_version.is_none() {
                if let Some(row) = &write.after {
                    rows.push(row.clone());
                }
            }
        }
        rows.retain(|row| filters.iter().all(|f| f.matches(row)));
        Ok(rows)
    }

    fn insert(&mut self, entity: &str, mut row: Row) -> OntosResult<String> {
        let id = match row_id(&row) {
            Some(id) => id.to_owned(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                row.insert("id".into(), Value::String(id.clone()));
                id
            }
        };
        if self.get(entity, &id)?.is_some() {
            return Err(OntosError::Store(format!("duplicate id {id} in {entity}")));
        }
        self.touch(entity, &id).after = Some(row);
        Ok(id)
    }

    fn update(&mut self, entity: &str, id: &str, patch: Row) -> OntosResult<Row> {
        let mut current = self.require(entity, id)?;
        for (key, value) in patch {
            if key != "id" {
                current.insert(key, value);
            }
        }
        self.touch(entity, id).after = Some(current.clone());
        Ok(current)
    }

    fn put(&mut self, entity: &str, row: Row) -> OntosResult<()> {
        let id = row_id(&row)
            .ok_or_else(|| OntosError::Store(format!("row for {entity} has no id")))?
            .to_owned();
        self.touch(entity, &id).after = Some(row);
        Ok(())
    }

    fn delete(&mut self, entity: &str, id: &str) -> OntosResult<Option<Row>> {
        if self.get(entity, id)?.is_none() {
            return Ok(None);
        }
        Ok(self.touch(entity, id).after.take())
    }

    fn changes(&self) -> Vec<RowChange> {
        self.writes
            .iter()
            .filter(|((entity, _), write)| {
                !entity.starts_with(SYSTEM_TABLE_PREFIX) && write.before != write.after
            })
            .map(|((entity, id), write)| RowChange {
                entity: entity.clone(),
                id: id.clone(),
                before: write.before.clone(),
                after: write.after.clone(),
            })
            .collect()
    }

    fn commit(self: Box<Self>) -> OntosResult<()> {
        let MemoryTransaction { inner, reads, writes } = *self;
        let mut tables = inner.write();

        for ((entity, id), write) in &writes {
            let current = tables.committed(entity, id).map(|v| v.version);
            if current != write.base_version {
                return Err(OntosError::Store(format!(
                    "concurrent modification of {entity} {id}"
                )));
            }
        }

        for ((entity, id), seen) in reads.into_inner() {
            if tables.committed(&entity, &id).map(|v| v.version) != seen {
                return Err(OntosError::Store(format!(
                    "{entity} {id} changed after it was read"
                )));
            }
        }

        let touched = writes.len();
        for ((entity, id), write) in writes {
            let table = tables.tables.entry(entity).or_default();
            match write.after {
                Some(row) => {
                    let version = write.base_version.map_or(1, |v| v + 1);
                    table.insert(id, Versioned { row, version });
                }
                None => {
                    table.shift_remove(&id);
                }
            }
        }
        debug!(touched, "transaction committed");
        Ok(())
    }
}
