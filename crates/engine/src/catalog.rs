//! Index catalog.
//!
//! Descriptors persist under `meta:idx:<table>.<name>` and are loaded into
//! the in-memory registry at open. The registry owns the runtime state of
//! the vector and spatial indices (the arena the rest of the system
//! borrows); everything else is stateless and works off the descriptors.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use themis_core::key;
use themis_core::{Result, ThemisError};
use themis_index::{CompositeIndexSpec, FullTextSpec, ScalarIndexSpec, TtlIndexSpec};
use themis_spatial::{SpatialIndex, SpatialIndexSpec};
use themis_storage::KvRead;
use themis_vector::{VectorIndex, VectorIndexSpec};

/// A persisted index descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexDescriptor {
    /// Equality / range / sparse.
    Scalar(ScalarIndexSpec),
    /// Ordered multi-field tuple.
    Composite(CompositeIndexSpec),
    /// Expire-at timestamp.
    Ttl(TtlIndexSpec),
    /// Inverted text index.
    FullText(FullTextSpec),
    /// HNSW.
    Vector(VectorIndexSpec),
    /// R*-tree.
    Spatial(SpatialIndexSpec),
}

impl IndexDescriptor {
    /// Index name.
    pub fn name(&self) -> &str {
        match self {
            IndexDescriptor::Scalar(s) => &s.name,
            IndexDescriptor::Composite(s) => &s.name,
            IndexDescriptor::Ttl(s) => &s.name,
            IndexDescriptor::FullText(s) => &s.name,
            IndexDescriptor::Vector(s) => &s.name,
            IndexDescriptor::Spatial(s) => &s.name,
        }
    }

    /// Indexed table.
    pub fn table(&self) -> &str {
        match self {
            IndexDescriptor::Scalar(s) => &s.table,
            IndexDescriptor::Composite(s) => &s.table,
            IndexDescriptor::Ttl(s) => &s.table,
            IndexDescriptor::FullText(s) => &s.table,
            IndexDescriptor::Vector(s) => &s.table,
            IndexDescriptor::Spatial(s) => &s.table,
        }
    }

    /// Catalog key for this descriptor.
    pub fn catalog_key(&self) -> Vec<u8> {
        descriptor_key(self.table(), self.name())
    }
}

/// Catalog key for `(table, name)`.
pub fn descriptor_key(table: &str, name: &str) -> Vec<u8> {
    key::meta_key("idx", &format!("{table}.{name}"))
}

/// Runtime index set of one table.
#[derive(Default)]
pub struct TableIndexes {
    /// Equality / range / sparse descriptors.
    pub scalars: Vec<ScalarIndexSpec>,
    /// Composite descriptors.
    pub composites: Vec<CompositeIndexSpec>,
    /// TTL descriptors.
    pub ttls: Vec<TtlIndexSpec>,
    /// Full-text descriptors.
    pub fulltexts: Vec<FullTextSpec>,
    /// Vector runtimes.
    pub vectors: Vec<Arc<VectorIndex>>,
    /// Spatial runtimes.
    pub spatials: Vec<Arc<SpatialIndex>>,
}

/// The in-memory registry: table -> runtime indices.
#[derive(Default)]
pub struct Registry {
    tables: RwLock<BTreeMap<String, Arc<TableIndexes>>>,
}

impl Registry {
    /// Load every persisted descriptor and build the runtimes.
    pub fn load(view: &dyn KvRead) -> Result<Registry> {
        let registry = Registry::default();
        let prefix = key::meta_prefix("idx");
        for (_, bytes) in view.scan_prefix(&prefix, usize::MAX) {
            let descriptor: IndexDescriptor = bincode::deserialize(&bytes)?;
            registry.register(descriptor, view)?;
        }
        Ok(registry)
    }

    /// The index set of a table. Empty set when untouched.
    pub fn table(&self, table: &str) -> Arc<TableIndexes> {
        self.tables
            .read()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Tables that currently have indices.
    pub fn indexed_tables(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Every vector runtime, for the flusher.
    pub fn all_vectors(&self) -> Vec<Arc<VectorIndex>> {
        self.tables
            .read()
            .values()
            .flat_map(|t| t.vectors.iter().cloned())
            .collect()
    }

    /// Register a descriptor, building its runtime where one is needed.
    /// Rejects duplicate `(table, name)` pairs.
    pub fn register(&self, descriptor: IndexDescriptor, view: &dyn KvRead) -> Result<()> {
        let table_name = descriptor.table().to_string();
        let name = descriptor.name().to_string();
        let mut tables = self.tables.write();
        let current = tables.entry(table_name.clone()).or_default();
        if table_has_index(current, &name) {
            return Err(ThemisError::exists(table_name, format!("index {name}")));
        }
        let mut next = clone_indexes(current);
        match descriptor {
            IndexDescriptor::Scalar(spec) => next.scalars.push(spec),
            IndexDescriptor::Composite(spec) => next.composites.push(spec),
            IndexDescriptor::Ttl(spec) => next.ttls.push(spec),
            IndexDescriptor::FullText(spec) => next.fulltexts.push(spec),
            IndexDescriptor::Vector(spec) => {
                next.vectors.push(Arc::new(VectorIndex::open(spec, view)?));
            }
            IndexDescriptor::Spatial(spec) => {
                next.spatials.push(Arc::new(SpatialIndex::open(spec, view)?));
            }
        }
        tables.insert(table_name, Arc::new(next));
        Ok(())
    }

    /// Drop an index from the registry. Returns the removed descriptor's
    /// keyspace prefixes so the caller can erase them.
    pub fn deregister(&self, table: &str, name: &str) -> Result<Vec<Vec<u8>>> {
        let mut tables = self.tables.write();
        let current = tables
            .get(table)
            .ok_or_else(|| ThemisError::not_found(format!("index {table}.{name}")))?;
        if !table_has_index(current, name) {
            return Err(ThemisError::not_found(format!("index {table}.{name}")));
        }
        let mut next = clone_indexes(current);
        let mut prefixes: Vec<Vec<u8>> = Vec::new();

        next.scalars.retain(|s| {
            if s.name == name {
                prefixes.push(key::scalar_index_prefix(s.kind.prefix(), &s.table, &s.field));
                false
            } else {
                true
            }
        });
        next.composites.retain(|s| {
            if s.name == name {
                if let Ok(empty) = themis_core::key::FieldTuple::encode(&[]) {
                    prefixes.push(key::composite_index_prefix(&s.table, &s.name, &empty, 0));
                }
                false
            } else {
                true
            }
        });
        next.ttls.retain(|s| {
            if s.name == name {
                prefixes.push(key::ttl_index_prefix(&s.table));
                false
            } else {
                true
            }
        });
        next.fulltexts.retain(|s| {
            if s.name == name {
                prefixes.push(key::scalar_index_prefix(
                    key::KeyPrefix::IdxFullText,
                    &s.table,
                    &s.field,
                ));
                prefixes.push(key::ft_doc_prefix(&s.table, &s.field));
                false
            } else {
                true
            }
        });
        next.vectors.retain(|v| {
            if v.spec().name == name {
                prefixes.push(v.keyspace_prefix());
                false
            } else {
                true
            }
        });
        next.spatials.retain(|s| {
            if s.spec().name == name {
                prefixes.push(s.keyspace_prefix());
                false
            } else {
                true
            }
        });

        tables.insert(table.to_string(), Arc::new(next));
        Ok(prefixes)
    }
}

fn table_has_index(t: &TableIndexes, name: &str) -> bool {
    t.scalars.iter().any(|s| s.name == name)
        || t.composites.iter().any(|s| s.name == name)
        || t.ttls.iter().any(|s| s.name == name)
        || t.fulltexts.iter().any(|s| s.name == name)
        || t.vectors.iter().any(|v| v.spec().name == name)
        || t.spatials.iter().any(|s| s.spec().name == name)
}

fn clone_indexes(t: &TableIndexes) -> TableIndexes {
    TableIndexes {
        scalars: t.scalars.clone(),
        composites: t.composites.clone(),
        ttls: t.ttls.clone(),
        fulltexts: t.fulltexts.clone(),
        vectors: t.vectors.clone(),
        spatials: t.spatials.clone(),
    }
}
