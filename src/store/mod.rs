pub mod atomic;
pub mod file;

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

use crate::error::LineageResult;
use crate::lineage::entry::ResourceLineage;
use crate::lineage::refs::ResourceRef;
use crate::query::walk::{LineageWalk, WalkMode, walk_lineage};

pub use file::FileLineageStore;

/// Which region of the store a query reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineageView {
    Current,
    Snapshot(String),
}

/// Persistence and query layer over the ref → lineage graph.
///
/// Reads take `&self`; implementations may cache behind interior mutability.
/// Every write must keep the refs filed under one resource name free of
/// `covers` relations in either direction.
pub trait LineageStore {
    fn store_entry(&mut self, instance: &str, lineage: &ResourceLineage) -> LineageResult<()>;

    /// Exact ref first, then an entry whose ref covers `resource_ref`.
    fn retrieve_entry(
        &self,
        instance: &str,
        resource_ref: &ResourceRef,
    ) -> LineageResult<ResourceLineage>;

    fn has_entry(&self, instance: &str, resource_ref: &ResourceRef) -> LineageResult<bool>;

    fn retrieve_entry_as_of_snapshot(
        &self,
        instance: &str,
        resource_ref: &ResourceRef,
        snapshot_hash: &str,
    ) -> LineageResult<ResourceLineage>;

    fn resource_names(&self, instance: &str) -> LineageResult<Vec<String>>;

    fn refs_for_resource(&self, instance: &str, resource_name: &str)
    -> LineageResult<Vec<ResourceRef>>;

    fn snapshot_resource_names(&self, snapshot_hash: &str) -> LineageResult<Vec<String>>;

    fn snapshot_refs_for_resource(
        &self,
        snapshot_hash: &str,
        resource_name: &str,
    ) -> LineageResult<Vec<ResourceRef>>;

    fn snapshot_exists(&self, snapshot_hash: &str) -> bool;

    /// Drops current lineage for `resource_ref` and every ref overlapping it.
    fn invalidate_entry(&mut self, instance: &str, resource_ref: &ResourceRef) -> LineageResult<()>;

    /// Drops all current lineage for a resource, e.g. after its data was pulled.
    fn invalidate_resource(&mut self, instance: &str, resource_name: &str) -> LineageResult<()>;

    /// Rewrites current placeholders of the mapped resources into hash
    /// certificates. Returns the number of certificates rewritten.
    fn replace_placeholders(
        &mut self,
        instance: &str,
        hash_mapping: &HashMap<String, String>,
    ) -> LineageResult<usize>;

    fn snapshot_lineage(
        &mut self,
        instance: &str,
        snapshot_hash: &str,
        resource_names: &[String],
    ) -> LineageResult<()>;

    fn restore_lineage(
        &mut self,
        instance: &str,
        snapshot_hash: &str,
        resource_names: &[String],
    ) -> LineageResult<()>;

    fn retrieve_in_view(
        &self,
        instance: &str,
        resource_ref: &ResourceRef,
        view: &LineageView,
    ) -> LineageResult<ResourceLineage> {
        match view {
            LineageView::Current => self.retrieve_entry(instance, resource_ref),
            LineageView::Snapshot(hash) => {
                self.retrieve_entry_as_of_snapshot(instance, resource_ref, hash)
            }
        }
    }

    fn resource_names_in_view(
        &self,
        instance: &str,
        view: &LineageView,
    ) -> LineageResult<Vec<String>> {
        match view {
            LineageView::Current => self.resource_names(instance),
            LineageView::Snapshot(hash) => self.snapshot_resource_names(hash),
        }
    }

    fn refs_in_view(
        &self,
        instance: &str,
        resource_name: &str,
        view: &LineageView,
    ) -> LineageResult<Vec<ResourceRef>> {
        match view {
            LineageView::Current => self.refs_for_resource(instance, resource_name),
            LineageView::Snapshot(hash) => self.snapshot_refs_for_resource(hash, resource_name),
        }
    }

    /// Best-effort transitive lineage of everything filed under `resource_name`.
    fn get_lineage_for_resource(
        &self,
        instance: &str,
        resource_name: &str,
    ) -> LineageResult<LineageWalk> {
        let start = self.refs_for_resource(instance, resource_name)?;
        walk_lineage(self, instance, &LineageView::Current, &start, WalkMode::Lenient)
    }
}

/// Snapshot identifier derived from the per-resource hashes.
pub fn snapshot_hash_for(hash_mapping: &HashMap<String, String>) -> String {
    let sorted = hash_mapping.iter().collect::<BTreeMap<_, _>>();
    let mut hasher = Sha256::new();
    for (name, hashval) in sorted {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(hashval.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
