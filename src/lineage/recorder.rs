use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::LineageResult;
use crate::lineage::cert::Certificate;
use crate::lineage::check::{PreparedStep, StepDeclaration, prepare_step_lineage};
use crate::lineage::entry::{
    CodeLineage, ResourceLineage, SourceDataLineage, StepLineage, next_placeholder_version,
};
use crate::lineage::refs::ResourceRef;
use crate::store::LineageStore;

/// Builder for a step run. Nothing touches the store until [`StepRecorder::start`].
#[derive(Debug, Clone)]
pub struct StepRecorder {
    declaration: StepDeclaration,
}

impl StepRecorder {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            declaration: StepDeclaration::new(step_name, Utc::now()),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.declaration.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, resource_ref: ResourceRef) -> Self {
        self.declaration.inputs.push(resource_ref);
        self
    }

    pub fn with_code(mut self, resource_ref: ResourceRef) -> Self {
        self.declaration.code.push(resource_ref);
        self
    }

    pub fn with_command_line(mut self, argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.declaration.command_line = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_run_from_directory(mut self, dir: impl Into<String>) -> Self {
        self.declaration.run_from_directory = Some(dir.into());
        self
    }

    pub fn declaration(&self) -> &StepDeclaration {
        &self.declaration
    }

    /// Checks the declared dependencies and opens the step for outputs.
    pub fn start<'s>(
        self,
        instance: &str,
        store: &'s mut dyn LineageStore,
    ) -> LineageResult<RunningStep<'s>> {
        let mut declaration = self.declaration;
        declaration.start_time = Utc::now();
        let PreparedStep {
            step: lineage,
            first_reads,
        } = prepare_step_lineage(instance, declaration, &*store)?;
        debug!(instance, step = %lineage.step_name, "step started");
        Ok(RunningStep {
            instance: instance.to_string(),
            store,
            lineage,
            first_reads,
            started: Instant::now(),
        })
    }
}

/// A step whose inputs were admitted and whose outputs are being declared.
///
/// The store is untouched until [`RunningStep::complete`]; dropping the step
/// records nothing, not even entries for inputs seen for the first time.
pub struct RunningStep<'s> {
    instance: String,
    store: &'s mut dyn LineageStore,
    lineage: StepLineage,
    first_reads: Vec<ResourceLineage>,
    started: Instant,
}

impl RunningStep<'_> {
    pub fn add_output(&mut self, resource_ref: ResourceRef) -> LineageResult<Certificate> {
        let pending = self
            .first_reads
            .iter()
            .find_map(|lineage| lineage.cert_for(&resource_ref))
            .and_then(Certificate::placeholder_version);
        let version = match pending {
            Some(previous) => previous + 1,
            None => next_placeholder_version(&self.instance, &*self.store, &resource_ref)?,
        };
        self.lineage.add_output_version(resource_ref, version)
    }

    /// Entries that [`RunningStep::complete`] files ahead of the step.
    pub fn first_reads(&self) -> &[ResourceLineage] {
        &self.first_reads
    }

    pub fn lineage(&self) -> &StepLineage {
        &self.lineage
    }

    /// Stamps the execution time and files the lineage under every output.
    pub fn complete(self) -> LineageResult<StepLineage> {
        let Self {
            instance,
            store,
            mut lineage,
            first_reads,
            started,
        } = self;
        lineage.execution_time_seconds = Some(started.elapsed().as_secs_f64());
        for first_read in &first_reads {
            store.store_entry(&instance, first_read)?;
        }
        store.store_entry(&instance, &ResourceLineage::Step(lineage.clone()))?;
        info!(
            instance = %instance,
            step = %lineage.step_name,
            outputs = lineage.output_resources().count(),
            "step recorded"
        );
        Ok(lineage)
    }

    pub fn abort(self) {
        debug!(
            instance = %self.instance,
            step = %self.lineage.step_name,
            discarded_first_reads = self.first_reads.len(),
            "step aborted"
        );
    }
}

/// Files externally supplied data. Without a hash the ref gets an input
/// placeholder that continues any placeholder version already on record.
pub fn record_source_data(
    instance: &str,
    store: &mut dyn LineageStore,
    resource_ref: ResourceRef,
    hashval: Option<&str>,
    comment: &str,
) -> LineageResult<Certificate> {
    let cert = leaf_cert(instance, &*store, resource_ref, hashval, comment)?;
    store.store_entry(
        instance,
        &ResourceLineage::SourceData(SourceDataLineage { cert: cert.clone() }),
    )?;
    Ok(cert)
}

pub fn record_code(
    instance: &str,
    store: &mut dyn LineageStore,
    resource_ref: ResourceRef,
    hashval: Option<&str>,
    comment: &str,
) -> LineageResult<Certificate> {
    let cert = leaf_cert(instance, &*store, resource_ref, hashval, comment)?;
    store.store_entry(
        instance,
        &ResourceLineage::Code(CodeLineage { cert: cert.clone() }),
    )?;
    Ok(cert)
}

fn leaf_cert(
    instance: &str,
    store: &dyn LineageStore,
    resource_ref: ResourceRef,
    hashval: Option<&str>,
    comment: &str,
) -> LineageResult<Certificate> {
    if let Some(hashval) = hashval {
        return Ok(Certificate::hash(resource_ref, hashval, comment));
    }
    let version = next_placeholder_version(instance, store, &resource_ref)?;
    Ok(Certificate::input_placeholder(resource_ref, version, comment))
}
