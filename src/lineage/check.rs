use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use crate::error::{LineageError, LineageResult};
use crate::lineage::cert::Certificate;
use crate::lineage::entry::{CodeLineage, ResourceLineage, SourceDataLineage, StepLineage};
use crate::lineage::refs::ResourceRef;
use crate::query::walk::{WalkMode, walk_lineage};
use crate::store::{LineageStore, LineageView};

/// Everything a caller declares about a step before it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDeclaration {
    pub step_name: String,
    pub start_time: DateTime<Utc>,
    pub parameters: IndexMap<String, Value>,
    pub inputs: Vec<ResourceRef>,
    pub code: Vec<ResourceRef>,
    pub command_line: Vec<String>,
    pub run_from_directory: Option<String>,
}

impl StepDeclaration {
    pub fn new(step_name: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            step_name: step_name.into(),
            start_time,
            parameters: IndexMap::new(),
            inputs: Vec::new(),
            code: Vec::new(),
            command_line: Vec::new(),
            run_from_directory: None,
        }
    }
}

/// Rejects declared refs of one resource that overlap through `covers`.
pub fn check_for_step_dependency_conflicts(
    step_name: &str,
    refs: &[ResourceRef],
) -> LineageResult<()> {
    for (idx, first) in refs.iter().enumerate() {
        for second in &refs[idx + 1..] {
            if first.overlaps(second) {
                return Err(LineageError::Conflict {
                    first: first.clone(),
                    second: second.clone(),
                    context: format!("in dependencies of step `{step_name}`"),
                });
            }
        }
    }
    Ok(())
}

/// Fails when the transitive dependencies of `refs` reach one ref at two
/// different certificates. Refs without lineage are skipped.
pub fn check_for_step_transitive_consistency<S>(
    instance: &str,
    step_name: &str,
    refs: &[ResourceRef],
    store: &S,
) -> LineageResult<()>
where
    S: LineageStore + ?Sized,
{
    walk_lineage(
        store,
        instance,
        &LineageView::Current,
        refs,
        WalkMode::Strict { step_name },
    )
    .map(|_| ())
}

/// A step built from its declaration, plus the source data and code entries
/// for refs the store has never seen. Nothing here has been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStep {
    pub step: StepLineage,
    pub first_reads: Vec<ResourceLineage>,
}

/// Runs the pre-flight checks, then builds the step from the current
/// certificates of its inputs and code. Refs the store has never seen get an
/// input placeholder, returned as source data (inputs) or code lineage (code)
/// in [`PreparedStep::first_reads`].
pub fn prepare_step_lineage(
    instance: &str,
    declaration: StepDeclaration,
    store: &dyn LineageStore,
) -> LineageResult<PreparedStep> {
    let StepDeclaration {
        step_name,
        start_time,
        parameters,
        inputs,
        code,
        command_line,
        run_from_directory,
    } = declaration;

    let inputs = dedup_refs(inputs);
    let code = dedup_refs(code);
    let declared = inputs.iter().chain(code.iter()).cloned().collect::<Vec<_>>();
    check_for_step_dependency_conflicts(&step_name, &declared)?;
    check_for_step_transitive_consistency(instance, &step_name, &declared, store)?;

    let mut first_reads = Vec::new();
    let input_certs = certs_for_refs(instance, &step_name, &inputs, store, |cert| {
        first_reads.push(ResourceLineage::SourceData(SourceDataLineage { cert }))
    })?;
    let code_certs = certs_for_refs(instance, &step_name, &code, store, |cert| {
        first_reads.push(ResourceLineage::Code(CodeLineage { cert }))
    })?;

    let mut step = StepLineage::new(step_name, start_time, parameters, input_certs, code_certs);
    step.command_line = command_line;
    step.run_from_directory = run_from_directory;
    Ok(PreparedStep { step, first_reads })
}

/// [`prepare_step_lineage`], filing the first-read entries right away.
pub fn make_step_lineage(
    instance: &str,
    declaration: StepDeclaration,
    store: &mut dyn LineageStore,
) -> LineageResult<StepLineage> {
    let PreparedStep { step, first_reads } = prepare_step_lineage(instance, declaration, &*store)?;
    for lineage in &first_reads {
        store.store_entry(instance, lineage)?;
    }
    Ok(step)
}

fn certs_for_refs(
    instance: &str,
    step_name: &str,
    refs: &[ResourceRef],
    store: &dyn LineageStore,
    mut first_seen: impl FnMut(Certificate),
) -> LineageResult<Vec<Certificate>> {
    let mut certs = Vec::with_capacity(refs.len());
    for resource_ref in refs {
        match store.retrieve_entry(instance, resource_ref) {
            Ok(lineage) => {
                let cert = lineage.cert_for(resource_ref).cloned().ok_or_else(|| {
                    LineageError::format(format!(
                        "lineage returned for `{resource_ref}` does not claim it"
                    ))
                })?;
                certs.push(cert);
            }
            Err(err) if err.is_not_found() => {
                let cert = Certificate::input_placeholder(
                    resource_ref.clone(),
                    1,
                    format!("first read by step {step_name}"),
                );
                debug!(instance, %resource_ref, "minting input placeholder");
                first_seen(cert.clone());
                certs.push(cert);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(certs)
}

fn dedup_refs(refs: Vec<ResourceRef>) -> Vec<ResourceRef> {
    let mut out: Vec<ResourceRef> = Vec::with_capacity(refs.len());
    for resource_ref in refs {
        if !out.contains(&resource_ref) {
            out.push(resource_ref);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileLineageStore;

    const HOST: &str = "host-a";

    fn declare(name: &str, inputs: &[ResourceRef], code: &[ResourceRef]) -> StepDeclaration {
        let mut declaration = StepDeclaration::new(name, Utc::now());
        declaration.inputs = inputs.to_vec();
        declaration.code = code.to_vec();
        declaration
    }

    fn run_step(
        store: &mut FileLineageStore,
        name: &str,
        inputs: &[ResourceRef],
        outputs: &[ResourceRef],
    ) -> StepLineage {
        let mut step =
            make_step_lineage(HOST, declare(name, inputs, &[]), store).expect("make step");
        for output in outputs {
            step.add_output(HOST, &*store, output.clone()).expect("add output");
        }
        store
            .store_entry(HOST, &ResourceLineage::Step(step.clone()))
            .expect("store step");
        step
    }

    #[test]
    fn overlapping_declared_refs_conflict() {
        let refs = [
            ResourceRef::whole("data"),
            ResourceRef::whole("code"),
            ResourceRef::subpath_of("data", "train.csv"),
        ];
        let err = check_for_step_dependency_conflicts("fit", &refs).expect_err("conflict");
        let LineageError::Conflict { first, second, .. } = err else {
            panic!("expected conflict, got {err}");
        };
        assert_eq!(first, ResourceRef::whole("data"));
        assert_eq!(second, ResourceRef::subpath_of("data", "train.csv"));

        let disjoint = [
            ResourceRef::subpath_of("data", "a"),
            ResourceRef::subpath_of("data", "b"),
        ];
        check_for_step_dependency_conflicts("fit", &disjoint).expect("siblings are fine");
    }

    #[test]
    fn unseen_inputs_and_code_get_placeholders_and_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        let data = ResourceRef::whole("data");
        let script = ResourceRef::subpath_of("code", "prep.py");

        let step = make_step_lineage(
            HOST,
            declare("prep", &[data.clone(), data.clone()], &[script.clone()]),
            &mut store,
        )
        .expect("make step");

        assert_eq!(step.input_resources.len(), 1);
        assert_eq!(
            step.input_resources[0],
            Certificate::input_placeholder(data.clone(), 1, "")
        );
        assert!(matches!(
            store.retrieve_entry(HOST, &data).expect("source"),
            ResourceLineage::SourceData(_)
        ));
        assert!(matches!(
            store.retrieve_entry(HOST, &script).expect("code"),
            ResourceLineage::Code(_)
        ));
    }

    #[test]
    fn prepare_leaves_the_store_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileLineageStore::new(dir.path());
        let data = ResourceRef::whole("data");

        let prepared = prepare_step_lineage(HOST, declare("prep", &[data.clone()], &[]), &store)
            .expect("prepare");
        assert_eq!(
            prepared.first_reads,
            vec![ResourceLineage::SourceData(SourceDataLineage {
                cert: Certificate::input_placeholder(data.clone(), 1, ""),
            })]
        );
        assert!(!store.has_entry(HOST, &data).expect("has"));
    }

    #[test]
    fn inputs_reuse_the_current_certificate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        let raw = ResourceRef::whole("raw");
        let clean = ResourceRef::whole("clean");
        let produced = run_step(&mut store, "clean", &[raw.clone()], &[clean.clone()]);

        let consumer = make_step_lineage(HOST, declare("fit", &[clean.clone()], &[]), &mut store)
            .expect("fit");
        assert_eq!(
            Some(&consumer.input_resources[0]),
            produced.output_for(&clean)
        );
    }

    #[test]
    fn diamond_with_overwritten_source_is_inconsistent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        let r1 = ResourceRef::whole("r1");
        let intermediate = ResourceRef::whole("intermediate");
        let results = ResourceRef::whole("results");

        run_step(&mut store, "a", &[r1.clone()], &[intermediate.clone()]);
        run_step(
            &mut store,
            "b",
            &[r1.clone(), intermediate.clone()],
            &[results.clone()],
        );
        run_step(&mut store, "c", &[], &[r1.clone()]);

        let err = make_step_lineage(HOST, declare("d", &[intermediate, r1.clone()], &[]), &mut store)
            .expect_err("d must be rejected");
        let LineageError::Consistency {
            step_name,
            first,
            second,
        } = err
        else {
            panic!("expected consistency error, got {err}");
        };
        assert_eq!(step_name, "d");
        assert_eq!(first.resource_ref(), &r1);
        assert_eq!(second.resource_ref(), &r1);
        assert_ne!(first, second);
    }

    #[test]
    fn overwritten_source_alone_is_consistent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        let r1 = ResourceRef::whole("r1");
        let intermediate = ResourceRef::whole("intermediate");

        run_step(&mut store, "a", &[r1.clone()], &[intermediate.clone()]);
        run_step(&mut store, "c", &[], &[r1.clone()]);

        check_for_step_transitive_consistency(HOST, "d", &[intermediate], &store)
            .expect("old r1 is only reached once");
    }

    #[test]
    fn in_place_update_is_not_a_diamond() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        let table = ResourceRef::whole("table");
        run_step(&mut store, "append", &[table.clone()], &[table.clone()]);

        check_for_step_transitive_consistency(HOST, "report", &[table], &store)
            .expect("rewriting an input is not a conflict");
    }
}
