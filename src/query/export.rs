use serde_json::{Value, json};

use crate::error::LineageResult;
use crate::lineage::entry::FiledLineage;
use crate::query::walk::{WalkMode, walk_lineage};
use crate::store::{LineageStore, LineageView};

/// Transitive lineage of a resource as one JSON document.
///
/// Uses the lenient walk, so missing or mismatched branches show up in
/// `warnings` instead of failing the export.
pub fn export_lineage_for_resource<S>(
    instance: &str,
    store: &S,
    resource_name: &str,
    view: &LineageView,
) -> LineageResult<Value>
where
    S: LineageStore + ?Sized,
{
    let start = store.refs_in_view(instance, resource_name, view)?;
    let walk = walk_lineage(store, instance, view, &start, WalkMode::Lenient)?;

    let lineages = walk
        .nodes
        .iter()
        .map(|node| FiledLineage {
            resource_ref: node.resource_ref.clone(),
            lineage: node.lineage.clone(),
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "resource_name": resource_name,
        "lineages": lineages,
        "warnings": walk.warnings,
    }))
}
