use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::error::{LineageError, LineageResult};
use crate::lineage::cert::Certificate;
use crate::lineage::entry::ResourceLineage;
use crate::lineage::refs::ResourceRef;
use crate::store::{LineageStore, LineageView};

/// How a walk reacts when one ref is reached at two different certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode<'a> {
    /// Admission of a new step: a mismatch is a [`LineageError::Consistency`].
    Strict { step_name: &'a str },
    /// Reporting: mismatches and missing entries are logged and counted, and
    /// the offending branch is not expanded.
    Lenient,
}

/// A lineage reached by a walk, with the certificate it was reached through.
#[derive(Debug, Clone, PartialEq)]
pub struct LineageNode {
    pub resource_ref: ResourceRef,
    pub cert: Certificate,
    pub lineage: ResourceLineage,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LineageWalk {
    pub nodes: Vec<LineageNode>,
    pub warnings: usize,
}

/// Breadth-first walk from `start` along input and code certificates.
///
/// Each ref may be seen under one certificate only. A dependency whose ref
/// now holds a different certificate was overwritten after it was read; its
/// own history is no longer in the store, so the walk stops there.
pub fn walk_lineage<S>(
    store: &S,
    instance: &str,
    view: &LineageView,
    start: &[ResourceRef],
    mode: WalkMode<'_>,
) -> LineageResult<LineageWalk>
where
    S: LineageStore + ?Sized,
{
    let mut walk = LineageWalk::default();
    let mut queue = VecDeque::new();

    for resource_ref in start {
        match store.retrieve_in_view(instance, resource_ref, view) {
            Ok(lineage) => {
                if let Some(cert) = lineage.cert_for(resource_ref) {
                    queue.push_back(cert.clone());
                }
            }
            Err(err) if err.is_not_found() => {
                if mode == WalkMode::Lenient {
                    warn!(%resource_ref, "no lineage recorded");
                    walk.warnings += 1;
                }
            }
            Err(err) => return Err(err),
        }
    }

    let mut seen: HashMap<ResourceRef, Certificate> = HashMap::new();
    while let Some(cert) = queue.pop_front() {
        let resource_ref = cert.resource_ref().clone();
        if let Some(previous) = seen.get(&resource_ref) {
            if previous == &cert {
                continue;
            }
            match mode {
                WalkMode::Strict { step_name } => {
                    return Err(LineageError::Consistency {
                        step_name: step_name.to_string(),
                        first: previous.clone(),
                        second: cert,
                    });
                }
                WalkMode::Lenient => {
                    warn!(
                        %resource_ref,
                        first = %previous,
                        second = %cert,
                        "lineage reaches the same ref at two versions"
                    );
                    walk.warnings += 1;
                    continue;
                }
            }
        }
        seen.insert(resource_ref.clone(), cert.clone());

        let lineage = match store.retrieve_in_view(instance, &resource_ref, view) {
            Ok(lineage) => lineage,
            Err(err) if err.is_not_found() => {
                if mode == WalkMode::Lenient {
                    warn!(%resource_ref, "no lineage recorded for dependency");
                    walk.warnings += 1;
                }
                continue;
            }
            Err(err) => return Err(err),
        };
        if lineage.cert_for(&resource_ref) != Some(&cert) {
            debug!(%cert, "dependency was overwritten; not expanding");
            continue;
        }

        // A step that rewrote its own input read the version it then replaced.
        queue.extend(
            lineage
                .dependencies()
                .into_iter()
                .filter(|dep| lineage.cert_for(dep.resource_ref()).is_none())
                .cloned(),
        );
        walk.nodes.push(LineageNode {
            resource_ref,
            cert,
            lineage,
        });
    }

    Ok(walk)
}
