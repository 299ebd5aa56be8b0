use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LineageError, LineageResult};
use crate::lineage::cert::Certificate;
use crate::lineage::entry::{FiledLineage, ResourceLineage};
use crate::lineage::refs::ResourceRef;
use crate::store::LineageStore;
use crate::store::atomic::{atomic_copy, atomic_write};

const DOCUMENT_SUFFIX: &str = ".json";
const CURRENT_DIR: &str = "current";
const SNAPSHOT_DIR: &str = "snapshots";
/// Written into snapshots that archived no documents, so that the snapshot
/// still differs from one whose lineage was never captured.
pub const NO_RESOURCES_MARKER: &str = ".no_resources";

/// Refs filed under one resource name, in insertion order.
type ResourceDocument = IndexMap<ResourceRef, ResourceLineage>;

/// On-disk form of a [`ResourceDocument`].
#[derive(Debug, Serialize, Deserialize)]
struct DocumentRecord {
    resource_name: String,
    lineages: Vec<FiledLineage>,
}

/// Lineage store kept as one JSON document per resource name.
///
/// ```text
/// <root>/current/<instance>/<resource>.json
/// <root>/snapshots/<snapshot-hash>/<resource>.json
/// ```
pub struct FileLineageStore {
    current_dir: PathBuf,
    snapshot_dir: PathBuf,
    resource_cache: RefCell<HashMap<(String, String), ResourceDocument>>,
    snapshot_cache: RefCell<HashMap<(String, String), ResourceDocument>>,
}

impl FileLineageStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self::with_dirs(root.join(CURRENT_DIR), root.join(SNAPSHOT_DIR))
    }

    pub fn with_dirs(current_dir: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            current_dir: current_dir.into(),
            snapshot_dir: snapshot_dir.into(),
            resource_cache: RefCell::new(HashMap::new()),
            snapshot_cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn current_dir(&self) -> &Path {
        &self.current_dir
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn current_document_path(&self, instance: &str, resource_name: &str) -> LineageResult<PathBuf> {
        validate_path_component(instance)?;
        validate_path_component(resource_name)?;
        Ok(self
            .current_dir
            .join(instance)
            .join(format!("{resource_name}{DOCUMENT_SUFFIX}")))
    }

    pub fn snapshot_document_path(&self, snapshot_hash: &str, resource_name: &str) -> LineageResult<PathBuf> {
        validate_path_component(resource_name)?;
        Ok(self
            .snapshot_path(snapshot_hash)?
            .join(format!("{resource_name}{DOCUMENT_SUFFIX}")))
    }

    fn snapshot_path(&self, snapshot_hash: &str) -> LineageResult<PathBuf> {
        validate_path_component(snapshot_hash)?;
        Ok(self.snapshot_dir.join(snapshot_hash))
    }

    fn current_document(&self, instance: &str, resource_name: &str) -> LineageResult<ResourceDocument> {
        let key = (instance.to_string(), resource_name.to_string());
        if let Some(document) = self.resource_cache.borrow().get(&key) {
            return Ok(document.clone());
        }
        let path = self.current_document_path(instance, resource_name)?;
        let document = read_document(&path, resource_name)?;
        self.resource_cache.borrow_mut().insert(key, document.clone());
        Ok(document)
    }

    fn snapshot_document(&self, snapshot_hash: &str, resource_name: &str) -> LineageResult<ResourceDocument> {
        if !self.snapshot_exists(snapshot_hash) {
            return Err(LineageError::SnapshotNotFound(snapshot_hash.to_string()));
        }
        let key = (snapshot_hash.to_string(), resource_name.to_string());
        if let Some(document) = self.snapshot_cache.borrow().get(&key) {
            return Ok(document.clone());
        }
        let path = self.snapshot_document_path(snapshot_hash, resource_name)?;
        let document = read_document(&path, resource_name)?;
        self.snapshot_cache.borrow_mut().insert(key, document.clone());
        Ok(document)
    }

    fn write_current_document(
        &self,
        instance: &str,
        resource_name: &str,
        document: ResourceDocument,
    ) -> LineageResult<()> {
        let path = self.current_document_path(instance, resource_name)?;
        if document.is_empty() {
            remove_if_exists(&path)?;
        } else {
            let bytes = document_bytes(resource_name, &document)?;
            atomic_write(&path, &bytes).map_err(|err| LineageError::io(&path, err))?;
        }
        debug!(
            instance,
            resource = resource_name,
            entries = document.len(),
            "wrote current lineage document"
        );
        self.resource_cache
            .borrow_mut()
            .insert((instance.to_string(), resource_name.to_string()), document);
        Ok(())
    }

    fn invalidate_cache(&self) {
        self.resource_cache.borrow_mut().clear();
        debug!("cleared lineage cache");
    }
}

impl LineageStore for FileLineageStore {
    fn store_entry(&mut self, instance: &str, lineage: &ResourceLineage) -> LineageResult<()> {
        let mut by_resource: IndexMap<String, Vec<ResourceRef>> = IndexMap::new();
        for cert in lineage.get_certs() {
            let claimed = cert.resource_ref();
            by_resource
                .entry(claimed.name().to_string())
                .or_default()
                .push(claimed.clone());
        }
        if by_resource.is_empty() {
            warn!(
                instance,
                lineage_type = lineage.lineage_type(),
                "lineage claims no certificates; nothing stored"
            );
            return Ok(());
        }

        // Validate every affected document before writing any of them.
        let mut updated = Vec::with_capacity(by_resource.len());
        for (resource_name, claimed_refs) in by_resource {
            let mut document = self.current_document(instance, &resource_name)?;
            for claimed in &claimed_refs {
                if let Some(existing) = document
                    .keys()
                    .find(|existing| *existing != claimed && existing.overlaps(claimed))
                {
                    return Err(LineageError::Conflict {
                        first: existing.clone(),
                        second: claimed.clone(),
                        context: format!("when storing {} lineage", lineage.lineage_type()),
                    });
                }
            }
            for claimed in claimed_refs {
                document.insert(claimed, lineage.clone());
            }
            updated.push((resource_name, document));
        }

        for (resource_name, document) in updated {
            self.write_current_document(instance, &resource_name, document)?;
        }
        Ok(())
    }

    fn retrieve_entry(
        &self,
        instance: &str,
        resource_ref: &ResourceRef,
    ) -> LineageResult<ResourceLineage> {
        let document = self.current_document(instance, resource_ref.name())?;
        lookup(&document, resource_ref)
    }

    fn has_entry(&self, instance: &str, resource_ref: &ResourceRef) -> LineageResult<bool> {
        match self.retrieve_entry(instance, resource_ref) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn retrieve_entry_as_of_snapshot(
        &self,
        _instance: &str,
        resource_ref: &ResourceRef,
        snapshot_hash: &str,
    ) -> LineageResult<ResourceLineage> {
        let document = self.snapshot_document(snapshot_hash, resource_ref.name())?;
        lookup(&document, resource_ref)
    }

    fn resource_names(&self, instance: &str) -> LineageResult<Vec<String>> {
        validate_path_component(instance)?;
        list_documents(&self.current_dir.join(instance))
    }

    fn refs_for_resource(
        &self,
        instance: &str,
        resource_name: &str,
    ) -> LineageResult<Vec<ResourceRef>> {
        Ok(self
            .current_document(instance, resource_name)?
            .keys()
            .cloned()
            .collect())
    }

    fn snapshot_resource_names(&self, snapshot_hash: &str) -> LineageResult<Vec<String>> {
        if !self.snapshot_exists(snapshot_hash) {
            return Err(LineageError::SnapshotNotFound(snapshot_hash.to_string()));
        }
        list_documents(&self.snapshot_path(snapshot_hash)?)
    }

    fn snapshot_refs_for_resource(
        &self,
        snapshot_hash: &str,
        resource_name: &str,
    ) -> LineageResult<Vec<ResourceRef>> {
        Ok(self
            .snapshot_document(snapshot_hash, resource_name)?
            .keys()
            .cloned()
            .collect())
    }

    fn snapshot_exists(&self, snapshot_hash: &str) -> bool {
        self.snapshot_path(snapshot_hash)
            .map(|path| path.is_dir())
            .unwrap_or(false)
    }

    fn invalidate_entry(&mut self, instance: &str, resource_ref: &ResourceRef) -> LineageResult<()> {
        let mut document = self.current_document(instance, resource_ref.name())?;
        let before = document.len();
        document.retain(|filed, _| filed != resource_ref && !filed.overlaps(resource_ref));
        if document.len() == before {
            return Ok(());
        }
        debug!(instance, %resource_ref, removed = before - document.len(), "invalidated lineage");
        self.write_current_document(instance, resource_ref.name(), document)
    }

    fn invalidate_resource(&mut self, instance: &str, resource_name: &str) -> LineageResult<()> {
        let path = self.current_document_path(instance, resource_name)?;
        remove_if_exists(&path)?;
        self.resource_cache
            .borrow_mut()
            .remove(&(instance.to_string(), resource_name.to_string()));
        debug!(instance, resource = resource_name, "invalidated resource lineage");
        Ok(())
    }

    fn replace_placeholders(
        &mut self,
        instance: &str,
        hash_mapping: &HashMap<String, String>,
    ) -> LineageResult<usize> {
        let mut documents = Vec::new();
        for resource_name in self.resource_names(instance)? {
            let document = self.current_document(instance, &resource_name)?;
            documents.push((resource_name, document));
        }

        // Certificates that are still the live state of some ref. Resolving any
        // other placeholder stamps it with a hash of newer content.
        let mut current: HashSet<Certificate> = HashSet::new();
        for (_, document) in &documents {
            for (filed, lineage) in document {
                if let Some(cert) = lineage.cert_for(filed) {
                    current.insert(cert.clone());
                }
            }
        }

        let mut replaced = 0;
        let mut changed = Vec::new();
        for (resource_name, mut document) in documents {
            let mut document_replaced = 0;
            for (filed, lineage) in document.iter_mut() {
                let replaced_certs = lineage.replace_placeholders(hash_mapping);
                for stale in replaced_certs.iter().filter(|cert| !current.contains(*cert)) {
                    warn!(
                        instance,
                        resource = %resource_name,
                        placeholder = %stale,
                        "resolving a placeholder that is no longer current; its hash describes newer content"
                    );
                }
                document_replaced += replaced_certs.len();
                if !hash_mapping.contains_key(filed.name()) {
                    continue;
                }
                match lineage.cert_for(filed) {
                    Some(cert) if cert.is_placeholder() => {
                        return Err(LineageError::PlaceHolder {
                            resource_name: filed.name().to_string(),
                            cert: cert.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        return Err(LineageError::format(format!(
                            "lineage filed under `{filed}` does not claim it"
                        )));
                    }
                }
            }
            if document_replaced > 0 {
                replaced += document_replaced;
                changed.push((resource_name, document));
            }
        }

        for (resource_name, document) in changed {
            self.write_current_document(instance, &resource_name, document)?;
        }
        debug!(instance, replaced, "replaced placeholders");
        Ok(replaced)
    }

    fn snapshot_lineage(
        &mut self,
        instance: &str,
        snapshot_hash: &str,
        resource_names: &[String],
    ) -> LineageResult<()> {
        let target = self.snapshot_path(snapshot_hash)?;

        let mut to_copy = Vec::new();
        for resource_name in resource_names {
            let source = self.current_document_path(instance, resource_name)?;
            if !source.exists() {
                continue;
            }
            for lineage in self.current_document(instance, resource_name)?.values() {
                if let Some(cert) = lineage.all_certs().into_iter().find(|cert| cert.is_placeholder()) {
                    return Err(LineageError::PlaceHolder {
                        resource_name: resource_name.clone(),
                        cert: cert.clone(),
                    });
                }
            }
            to_copy.push((source, self.snapshot_document_path(snapshot_hash, resource_name)?));
        }

        fs::create_dir_all(&target).map_err(|err| LineageError::io(&target, err))?;
        self.snapshot_cache
            .borrow_mut()
            .retain(|(hash, _), _| hash != snapshot_hash);
        let marker = target.join(NO_RESOURCES_MARKER);
        if to_copy.is_empty() {
            atomic_write(&marker, b"").map_err(|err| LineageError::io(&marker, err))?;
        } else {
            remove_if_exists(&marker)?;
        }
        for (source, destination) in &to_copy {
            atomic_copy(source, destination).map_err(|err| LineageError::io(destination, err))?;
        }
        debug!(
            instance,
            snapshot = snapshot_hash,
            documents = to_copy.len(),
            "archived lineage"
        );
        Ok(())
    }

    fn restore_lineage(
        &mut self,
        instance: &str,
        snapshot_hash: &str,
        resource_names: &[String],
    ) -> LineageResult<()> {
        if !self.snapshot_exists(snapshot_hash) {
            warn!(
                instance,
                snapshot = snapshot_hash,
                "snapshot has no archived lineage; clearing current lineage of restored resources"
            );
            for resource_name in resource_names {
                self.invalidate_resource(instance, resource_name)?;
            }
            self.invalidate_cache();
            return Ok(());
        }

        for resource_name in resource_names {
            let archived = self.snapshot_document_path(snapshot_hash, resource_name)?;
            let destination = self.current_document_path(instance, resource_name)?;
            if archived.exists() {
                atomic_copy(&archived, &destination)
                    .map_err(|err| LineageError::io(&destination, err))?;
            } else {
                remove_if_exists(&destination)?;
            }
        }
        self.invalidate_cache();
        debug!(
            instance,
            snapshot = snapshot_hash,
            resources = resource_names.len(),
            "restored lineage"
        );
        Ok(())
    }
}

fn lookup(document: &ResourceDocument, resource_ref: &ResourceRef) -> LineageResult<ResourceLineage> {
    if let Some(lineage) = document.get(resource_ref) {
        return Ok(lineage.clone());
    }
    document
        .iter()
        .find(|(filed, _)| filed.covers(resource_ref))
        .map(|(_, lineage)| lineage.clone())
        .ok_or_else(|| LineageError::NotFound(resource_ref.clone()))
}

fn validate_path_component(name: &str) -> LineageResult<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(LineageError::InvalidResourceName(name.to_string()));
    }
    Ok(())
}

fn list_documents(dir: &Path) -> LineageResult<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| LineageError::io(dir, err))? {
        let entry = entry.map_err(|err| LineageError::io(dir, err))?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }
        if let Some(name) = file_name.strip_suffix(DOCUMENT_SUFFIX) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn remove_if_exists(path: &Path) -> LineageResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(LineageError::io(path, err)),
    }
}

fn read_document(path: &Path, resource_name: &str) -> LineageResult<ResourceDocument> {
    if !path.exists() {
        return Ok(ResourceDocument::new());
    }
    let content = fs::read_to_string(path).map_err(|err| LineageError::io(path, err))?;
    let record: DocumentRecord =
        serde_json::from_str(&content).map_err(|source| LineageError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    into_document(record, resource_name).map_err(|err| err.in_file(path))
}

fn into_document(record: DocumentRecord, resource_name: &str) -> LineageResult<ResourceDocument> {
    if record.resource_name != resource_name {
        return Err(LineageError::format(format!(
            "document declares resource `{}` but is filed as `{resource_name}`",
            record.resource_name
        )));
    }
    let mut document = ResourceDocument::new();
    for FiledLineage {
        resource_ref,
        lineage,
    } in record.lineages
    {
        if resource_ref.name() != resource_name {
            return Err(LineageError::format(format!(
                "entry for `{resource_ref}` found in document of `{resource_name}`"
            )));
        }
        document.insert(resource_ref, lineage);
    }
    Ok(document)
}

fn document_bytes(resource_name: &str, document: &ResourceDocument) -> LineageResult<Vec<u8>> {
    let record = DocumentRecord {
        resource_name: resource_name.to_string(),
        lineages: document
            .iter()
            .map(|(resource_ref, lineage)| FiledLineage {
                resource_ref: resource_ref.clone(),
                lineage: lineage.clone(),
            })
            .collect(),
    };
    let mut bytes = serde_json::to_vec_pretty(&record).map_err(|err| {
        LineageError::format(format!("unable to encode lineage of `{resource_name}`: {err}"))
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::entry::{CodeLineage, SourceDataLineage, StepLineage};
    use pretty_assertions::assert_eq;

    const HOST: &str = "host-a";

    fn source(resource_ref: ResourceRef) -> ResourceLineage {
        ResourceLineage::SourceData(SourceDataLineage {
            cert: Certificate::input_placeholder(resource_ref, 1, ""),
        })
    }

    #[test]
    fn covered_subpath_conflicts_with_whole_resource() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        store
            .store_entry(HOST, &source(ResourceRef::whole("data")))
            .expect("store whole");

        let err = store
            .store_entry(HOST, &source(ResourceRef::subpath_of("data", "subdir/file.csv")))
            .expect_err("subpath must conflict");
        assert!(matches!(err, LineageError::Conflict { .. }), "{err}");
        assert_eq!(
            store.refs_for_resource(HOST, "data").expect("refs"),
            vec![ResourceRef::whole("data")]
        );
    }

    #[test]
    fn sibling_subpaths_coexist_and_exact_ref_overwrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        let left = ResourceRef::subpath_of("data", "a");
        let right = ResourceRef::subpath_of("data", "b");
        store.store_entry(HOST, &source(left.clone())).expect("left");
        store.store_entry(HOST, &source(right.clone())).expect("right");

        let code = ResourceLineage::Code(CodeLineage {
            cert: Certificate::hash(left.clone(), "h", ""),
        });
        store.store_entry(HOST, &code).expect("overwrite left");
        assert_eq!(store.retrieve_entry(HOST, &left).expect("left"), code);
        assert_eq!(
            store.refs_for_resource(HOST, "data").expect("refs"),
            vec![left, right]
        );
    }

    #[test]
    fn retrieve_falls_back_to_covering_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        let lineage = source(ResourceRef::subpath_of("data", "raw"));
        store.store_entry(HOST, &lineage).expect("store");

        let deeper = ResourceRef::subpath_of("data", "raw/2024/file.csv");
        assert_eq!(store.retrieve_entry(HOST, &deeper).expect("covered"), lineage);
        assert!(store.has_entry(HOST, &deeper).expect("has"));
        assert!(!store.has_entry(HOST, &ResourceRef::whole("data")).expect("has"));
        let err = store
            .retrieve_entry(HOST, &ResourceRef::subpath_of("data", "other"))
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[test]
    fn fresh_store_reads_what_was_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lineage = source(ResourceRef::whole("data"));
        {
            let mut store = FileLineageStore::new(dir.path());
            store.store_entry(HOST, &lineage).expect("store");
        }
        let reopened = FileLineageStore::new(dir.path());
        let loaded = reopened
            .retrieve_entry(HOST, &ResourceRef::whole("data"))
            .expect("reload");
        assert_eq!(loaded.to_json(), lineage.to_json());
        assert_eq!(reopened.resource_names(HOST).expect("names"), vec!["data".to_string()]);
    }

    #[test]
    fn instances_are_isolated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        store
            .store_entry(HOST, &source(ResourceRef::whole("data")))
            .expect("store");
        assert!(store.resource_names("host-b").expect("names").is_empty());
        assert!(
            !store
                .has_entry("host-b", &ResourceRef::whole("data"))
                .expect("has")
        );
    }

    #[test]
    fn invalid_resource_names_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        let err = store
            .store_entry(HOST, &source(ResourceRef::whole("../escape")))
            .expect_err("must reject");
        assert!(matches!(err, LineageError::InvalidResourceName(_)), "{err}");
    }

    #[test]
    fn malformed_document_reports_filename() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileLineageStore::new(dir.path());
        let path = store.current_document_path(HOST, "data").expect("path");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, r#"{"resource_name":"data"}"#).expect("seed");

        let err = store
            .retrieve_entry(HOST, &ResourceRef::whole("data"))
            .expect_err("must fail");
        let message = err.to_string();
        assert!(message.contains("lineages"), "{message}");
        assert!(message.contains("data.json"), "{message}");
    }

    #[test]
    fn invalidate_entry_drops_overlapping_refs_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        store
            .store_entry(HOST, &source(ResourceRef::subpath_of("data", "a/x")))
            .expect("ax");
        store
            .store_entry(HOST, &source(ResourceRef::subpath_of("data", "b")))
            .expect("b");

        store
            .invalidate_entry(HOST, &ResourceRef::subpath_of("data", "a"))
            .expect("invalidate");
        assert_eq!(
            store.refs_for_resource(HOST, "data").expect("refs"),
            vec![ResourceRef::subpath_of("data", "b")]
        );

        store.invalidate_resource(HOST, "data").expect("invalidate all");
        assert!(store.resource_names(HOST).expect("names").is_empty());
    }

    #[test]
    fn empty_snapshot_is_distinguishable_from_missing_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        assert!(!store.snapshot_exists("snap0"));
        store.snapshot_lineage(HOST, "snap0", &[]).expect("snapshot");
        assert!(store.snapshot_exists("snap0"));
        assert!(store.snapshot_dir().join("snap0").join(NO_RESOURCES_MARKER).exists());
        assert!(store.snapshot_resource_names("snap0").expect("names").is_empty());
    }

    #[test]
    fn snapshot_refuses_unresolved_placeholders() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        store
            .store_entry(HOST, &source(ResourceRef::whole("data")))
            .expect("store");
        let err = store
            .snapshot_lineage(HOST, "snap1", &["data".to_string()])
            .expect_err("placeholder must block snapshot");
        assert!(matches!(err, LineageError::PlaceHolder { .. }), "{err}");
        assert!(!store.snapshot_exists("snap1"));
    }

    #[test]
    fn retaking_a_snapshot_replaces_cached_archive_and_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        let data = ResourceRef::whole("data");
        let hashed = |hashval: &str| {
            ResourceLineage::SourceData(SourceDataLineage {
                cert: Certificate::hash(data.clone(), hashval, ""),
            })
        };
        let names = ["data".to_string()];

        store.snapshot_lineage(HOST, "snap1", &[]).expect("empty snapshot");
        store.store_entry(HOST, &hashed("h1")).expect("store h1");
        store.snapshot_lineage(HOST, "snap1", &names).expect("snapshot h1");
        assert!(!store.snapshot_dir().join("snap1").join(NO_RESOURCES_MARKER).exists());
        assert_eq!(store.snapshot_resource_names("snap1").expect("names"), names.to_vec());
        assert_eq!(
            store
                .retrieve_entry_as_of_snapshot(HOST, &data, "snap1")
                .expect("archived h1"),
            hashed("h1")
        );

        store.store_entry(HOST, &hashed("h2")).expect("store h2");
        store.snapshot_lineage(HOST, "snap1", &names).expect("snapshot h2");
        assert_eq!(
            store
                .retrieve_entry_as_of_snapshot(HOST, &data, "snap1")
                .expect("archived h2"),
            hashed("h2")
        );
    }

    #[test]
    fn snapshot_refuses_placeholders_among_dependencies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        let raw = Certificate::input_placeholder(ResourceRef::whole("raw"), 1, "");
        let mut step = StepLineage::new(
            "clean",
            chrono::Utc::now(),
            IndexMap::new(),
            vec![raw.clone()],
            Vec::new(),
        );
        step.add_output_version(ResourceRef::whole("clean"), 1)
            .expect("output");
        store
            .store_entry(HOST, &ResourceLineage::Step(step))
            .expect("store");

        let mapping = HashMap::from([("clean".to_string(), "c1".to_string())]);
        assert_eq!(store.replace_placeholders(HOST, &mapping).expect("resolve"), 1);
        let err = store
            .snapshot_lineage(HOST, "snap1", &["clean".to_string()])
            .expect_err("unresolved input must block snapshot");
        let LineageError::PlaceHolder { resource_name, cert } = err else {
            panic!("expected placeholder error, got {err}");
        };
        assert_eq!(resource_name, "clean");
        assert_eq!(cert, raw);
        assert!(!store.snapshot_exists("snap1"));
    }

    #[test]
    fn restore_without_archive_clears_current_lineage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        store
            .store_entry(HOST, &source(ResourceRef::whole("data")))
            .expect("store");
        store
            .restore_lineage(HOST, "never-taken", &["data".to_string()])
            .expect("restore");
        assert!(
            !store
                .has_entry(HOST, &ResourceRef::whole("data"))
                .expect("has")
        );
    }
}
