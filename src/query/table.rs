use std::fmt::Write as _;

use serde_json::{Value, json};
use tracing::warn;

use crate::error::LineageResult;
use crate::lineage::entry::ResourceLineage;
use crate::lineage::refs::ResourceRef;
use crate::store::{LineageStore, LineageView};

#[derive(Debug, Clone, PartialEq)]
pub struct LineageTableRow {
    pub resource_ref: ResourceRef,
    pub lineage_type: &'static str,
    pub details: String,
    pub inputs: Vec<String>,
}

impl LineageTableRow {
    pub fn to_json(&self) -> Value {
        json!({
            "ref": self.resource_ref.to_string(),
            "type": self.lineage_type,
            "details": self.details,
            "inputs": self.inputs,
        })
    }
}

/// One row per filed ref, resources in name order and refs in filing order.
pub fn make_lineage_table<S>(
    instance: &str,
    store: &S,
    view: &LineageView,
) -> LineageResult<Vec<LineageTableRow>>
where
    S: LineageStore + ?Sized,
{
    let mut rows = Vec::new();
    for resource_name in store.resource_names_in_view(instance, view)? {
        for resource_ref in store.refs_in_view(instance, &resource_name, view)? {
            let lineage = match store.retrieve_in_view(instance, &resource_ref, view) {
                Ok(lineage) => lineage,
                Err(err) if err.is_not_found() => {
                    warn!(%resource_ref, "filed ref vanished while building table");
                    continue;
                }
                Err(err) => return Err(err),
            };
            rows.push(row_for(resource_ref, &lineage));
        }
    }
    Ok(rows)
}

fn row_for(resource_ref: ResourceRef, lineage: &ResourceLineage) -> LineageTableRow {
    let cert = lineage
        .cert_for(&resource_ref)
        .map(ToString::to_string)
        .unwrap_or_default();
    let details = match lineage {
        ResourceLineage::Step(step) => {
            let mut details = format!("step {}", step.step_name);
            if !step.parameters.is_empty() {
                let params = step
                    .parameters
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = write!(details, " ({params})");
            }
            let _ = write!(details, " at {}", step.start_time.format("%Y-%m-%d %H:%M:%S"));
            let _ = write!(details, " -> {cert}");
            details
        }
        ResourceLineage::SourceData(_) => format!("source data {cert}"),
        ResourceLineage::Code(_) => format!("code {cert}"),
    };
    let inputs = lineage
        .dependencies()
        .into_iter()
        .map(ToString::to_string)
        .collect();
    LineageTableRow {
        resource_ref,
        lineage_type: lineage.lineage_type(),
        details,
        inputs,
    }
}

/// Aligned plain-text rendering for terminals.
pub fn render_lineage_table(rows: &[LineageTableRow]) -> String {
    let refs = rows
        .iter()
        .map(|row| row.resource_ref.to_string())
        .collect::<Vec<_>>();
    let ref_width = refs.iter().map(String::len).max().unwrap_or(0).max("ref".len());
    let type_width = rows
        .iter()
        .map(|row| row.lineage_type.len())
        .max()
        .unwrap_or(0)
        .max("type".len());

    let mut out = String::new();
    let _ = writeln!(out, "{:ref_width$}  {:type_width$}  details", "ref", "type");
    for (row, resource_ref) in rows.iter().zip(&refs) {
        let _ = writeln!(
            out,
            "{resource_ref:ref_width$}  {:type_width$}  {}",
            row.lineage_type, row.details
        );
        for input in &row.inputs {
            let _ = writeln!(out, "{:ref_width$}  {:type_width$}    <- {input}", "", "");
        }
    }
    out
}
