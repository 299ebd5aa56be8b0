use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{LineageError, LineageResult};
use crate::lineage::cert::Certificate;
use crate::lineage::refs::ResourceRef;
use crate::store::LineageStore;

/// Provenance recorded for a resource ref.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceLineage {
    Step(StepLineage),
    SourceData(SourceDataLineage),
    Code(CodeLineage),
}

/// The ref was supplied from outside any tracked step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDataLineage {
    #[serde(rename = "certificate")]
    pub cert: Certificate,
}

/// The ref is code a step depended on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeLineage {
    #[serde(rename = "certificate")]
    pub cert: Certificate,
}

/// A lineage together with the ref it is filed under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiledLineage {
    #[serde(rename = "ref")]
    pub resource_ref: ResourceRef,
    #[serde(flatten)]
    pub lineage: ResourceLineage,
}

/// One recorded execution of a pipeline step.
///
/// Outputs live in a single map keyed by ref, in declaration order; the
/// per-resource view is derived from it rather than maintained separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLineage {
    pub step_name: String,
    pub start_time: DateTime<Utc>,
    pub execution_time_seconds: Option<f64>,
    #[serde(default)]
    pub parameters: IndexMap<String, Value>,
    pub input_resources: Vec<Certificate>,
    pub code_resources: Vec<Certificate>,
    #[serde(with = "output_list")]
    output_resources: IndexMap<ResourceRef, Certificate>,
    #[serde(default)]
    pub command_line: Vec<String>,
    pub run_from_directory: Option<String>,
}

/// Outputs are persisted as a plain certificate list; the map key is the
/// certificate's own ref.
mod output_list {
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::lineage::cert::Certificate;
    use crate::lineage::refs::ResourceRef;

    pub fn serialize<S: Serializer>(
        outputs: &IndexMap<ResourceRef, Certificate>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(outputs.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<IndexMap<ResourceRef, Certificate>, D::Error> {
        Ok(Vec::<Certificate>::deserialize(deserializer)?
            .into_iter()
            .map(|cert| (cert.resource_ref().clone(), cert))
            .collect())
    }
}

impl StepLineage {
    pub fn new(
        step_name: impl Into<String>,
        start_time: DateTime<Utc>,
        parameters: IndexMap<String, Value>,
        input_resources: Vec<Certificate>,
        code_resources: Vec<Certificate>,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            start_time,
            parameters,
            input_resources,
            code_resources,
            output_resources: IndexMap::new(),
            execution_time_seconds: None,
            command_line: Vec::new(),
            run_from_directory: None,
        }
    }

    pub fn output_resources(&self) -> impl Iterator<Item = &Certificate> {
        self.output_resources.values()
    }

    pub fn outputs_for_resource<'a>(
        &'a self,
        resource_name: &'a str,
    ) -> impl Iterator<Item = &'a Certificate> + 'a {
        self.output_resources
            .values()
            .filter(move |cert| cert.resource_ref().name() == resource_name)
    }

    pub fn output_for(&self, resource_ref: &ResourceRef) -> Option<&Certificate> {
        self.output_resources.get(resource_ref)
    }

    /// Declares `resource_ref` as written by this step and mints its placeholder.
    ///
    /// The version continues from the ref's current placeholder, so a re-run
    /// of a step is distinguishable from the run it replaces.
    pub fn add_output(
        &mut self,
        instance: &str,
        store: &dyn LineageStore,
        resource_ref: ResourceRef,
    ) -> LineageResult<Certificate> {
        let version = next_placeholder_version(instance, store, &resource_ref)?;
        self.add_output_version(resource_ref, version)
    }

    /// Like [`StepLineage::add_output`], with the placeholder version chosen by the caller.
    pub fn add_output_version(
        &mut self,
        resource_ref: ResourceRef,
        version: u64,
    ) -> LineageResult<Certificate> {
        self.check_output_clash(&resource_ref)?;
        let cert = Certificate::output_placeholder(resource_ref.clone(), version, self.step_name.clone());
        self.output_resources.insert(resource_ref, cert.clone());
        Ok(cert)
    }

    fn check_output_clash(&self, resource_ref: &ResourceRef) -> LineageResult<()> {
        let clash = self
            .outputs_for_resource(resource_ref.name())
            .map(Certificate::resource_ref)
            .find(|existing| *existing == resource_ref || existing.overlaps(resource_ref))
            .cloned();
        match clash {
            Some(first) => Err(LineageError::Conflict {
                first,
                second: resource_ref.clone(),
                context: format!("in outputs of step `{}`", self.step_name),
            }),
            None => Ok(()),
        }
    }

    fn replace_placeholders(&mut self, hash_mapping: &HashMap<String, String>) -> Vec<Certificate> {
        let mut replaced = Vec::new();
        for cert in self
            .input_resources
            .iter_mut()
            .chain(self.code_resources.iter_mut())
            .chain(self.output_resources.values_mut())
        {
            if let Some(resolved) = resolve(cert, hash_mapping) {
                replaced.push(std::mem::replace(cert, resolved));
            }
        }
        replaced
    }
}

impl ResourceLineage {
    /// The `type` discriminator of the persisted form.
    pub fn lineage_type(&self) -> &'static str {
        match self {
            Self::Step(_) => "step",
            Self::SourceData(_) => "source_data",
            Self::Code(_) => "code",
        }
    }

    /// The certificates this lineage claims to have produced.
    pub fn get_certs(&self) -> Vec<&Certificate> {
        match self {
            Self::Step(step) => step.output_resources().collect(),
            Self::SourceData(SourceDataLineage { cert }) | Self::Code(CodeLineage { cert }) => {
                vec![cert]
            }
        }
    }

    /// The claimed certificate for `resource_ref`, either exact or from a covering ref.
    pub fn cert_for(&self, resource_ref: &ResourceRef) -> Option<&Certificate> {
        if let Self::Step(step) = self {
            if let Some(cert) = step.output_for(resource_ref) {
                return Some(cert);
            }
        }
        self.get_certs().into_iter().find(|cert| {
            let claimed = cert.resource_ref();
            claimed == resource_ref || claimed.covers(resource_ref)
        })
    }

    /// Input and code certificates, the edges followed by traversals.
    pub fn dependencies(&self) -> Vec<&Certificate> {
        match self {
            Self::Step(step) => step
                .input_resources
                .iter()
                .chain(step.code_resources.iter())
                .collect(),
            Self::SourceData(_) | Self::Code(_) => Vec::new(),
        }
    }

    /// Swaps every placeholder whose resource appears in `hash_mapping` for
    /// a hash certificate, in inputs, code and outputs alike. Returns the
    /// placeholders that were replaced.
    pub fn replace_placeholders(
        &mut self,
        hash_mapping: &HashMap<String, String>,
    ) -> Vec<Certificate> {
        match self {
            Self::Step(step) => step.replace_placeholders(hash_mapping),
            Self::SourceData(SourceDataLineage { cert }) | Self::Code(CodeLineage { cert }) => {
                resolve(cert, hash_mapping)
                    .map(|resolved| std::mem::replace(cert, resolved))
                    .into_iter()
                    .collect()
            }
        }
    }

    /// Every certificate the lineage mentions: claims first, then dependencies.
    pub fn all_certs(&self) -> Vec<&Certificate> {
        let mut certs = self.get_certs();
        certs.extend(self.dependencies());
        certs
    }

    pub fn to_json(&self) -> Value {
        json!(self)
    }

    pub fn from_json(value: &Value) -> LineageResult<Self> {
        Self::deserialize(value).map_err(|err| LineageError::format(format!("lineage: {err}")))
    }
}

/// One past the placeholder version currently claimed for `resource_ref`,
/// or 1 when the ref is untracked or hashed.
pub fn next_placeholder_version(
    instance: &str,
    store: &dyn LineageStore,
    resource_ref: &ResourceRef,
) -> LineageResult<u64> {
    match store.retrieve_entry(instance, resource_ref) {
        Ok(lineage) => Ok(lineage
            .cert_for(resource_ref)
            .and_then(Certificate::placeholder_version)
            .map_or(1, |previous| previous + 1)),
        Err(err) if err.is_not_found() => Ok(1),
        Err(err) => Err(err),
    }
}

fn resolve(cert: &Certificate, hash_mapping: &HashMap<String, String>) -> Option<Certificate> {
    if !cert.is_placeholder() {
        return None;
    }
    hash_mapping
        .get(cert.resource_ref().name())
        .map(|hashval| cert.resolved(hashval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn sample_step() -> StepLineage {
        let mut parameters = IndexMap::new();
        parameters.insert("zeta".to_string(), json!(1));
        parameters.insert("alpha".to_string(), json!("adam"));
        let mut step = StepLineage::new(
            "train",
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap(),
            parameters,
            vec![Certificate::hash(ResourceRef::whole("data"), "d1", "")],
            vec![Certificate::input_placeholder(
                ResourceRef::subpath_of("code", "train.py"),
                1,
                "",
            )],
        );
        step.output_resources.insert(
            ResourceRef::whole("model"),
            Certificate::output_placeholder(ResourceRef::whole("model"), 1, "train"),
        );
        step.execution_time_seconds = Some(1.5);
        step.command_line = vec!["python".to_string(), "train.py".to_string()];
        step.run_from_directory = Some("/work".to_string());
        step
    }

    #[test]
    fn step_json_is_a_fixed_point() {
        let lineage = ResourceLineage::Step(sample_step());
        let value = lineage.to_json();
        let parsed = ResourceLineage::from_json(&value).expect("parse");
        assert_eq!(parsed.to_json(), value);
        assert_eq!(parsed, lineage);
    }

    #[test]
    fn parameters_keep_declaration_order() {
        let value = ResourceLineage::Step(sample_step()).to_json();
        let keys = value["parameters"]
            .as_object()
            .expect("object")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["zeta".to_string(), "alpha".to_string()]);
    }

    #[test]
    fn cert_for_falls_back_to_covering_output() {
        let lineage = ResourceLineage::Step(sample_step());
        let cert = lineage
            .cert_for(&ResourceRef::subpath_of("model", "weights.bin"))
            .expect("covered");
        assert_eq!(cert.resource_ref(), &ResourceRef::whole("model"));
        assert!(lineage.cert_for(&ResourceRef::whole("data")).is_none());
    }

    #[test]
    fn replace_placeholders_resolves_every_mapped_cert() {
        let mut step = sample_step();
        step.input_resources.push(Certificate::input_placeholder(
            ResourceRef::whole("model"),
            7,
            "",
        ));
        let mut lineage = ResourceLineage::Step(step);
        let mapping = HashMap::from([("model".to_string(), "m1".to_string())]);

        let replaced = lineage.replace_placeholders(&mapping);
        assert_eq!(
            replaced,
            vec![
                Certificate::input_placeholder(ResourceRef::whole("model"), 7, ""),
                Certificate::output_placeholder(ResourceRef::whole("model"), 1, ""),
            ]
        );
        let ResourceLineage::Step(step) = &lineage else {
            panic!("expected step");
        };
        assert_eq!(
            step.output_for(&ResourceRef::whole("model")).and_then(Certificate::hashval),
            Some("m1")
        );
        assert_eq!(step.input_resources[1].hashval(), Some("m1"));
        // `code` is not in the mapping.
        assert!(step.code_resources[0].is_placeholder());
        assert!(lineage.replace_placeholders(&mapping).is_empty());
    }

    #[test]
    fn filed_lineage_flattens_ref_and_type() {
        let filed = FiledLineage {
            resource_ref: ResourceRef::whole("model"),
            lineage: ResourceLineage::Step(sample_step()),
        };
        let value = json!(filed);
        let keys = value.as_object().expect("object").keys().take(3).cloned().collect::<Vec<_>>();
        assert_eq!(keys, vec!["ref", "type", "step_name"]);
        let start = value["start_time"].as_str().expect("start_time string");
        assert_eq!(
            DateTime::parse_from_rfc3339(start).expect("rfc3339"),
            sample_step().start_time
        );
        assert_eq!(value["output_resources"][0]["is_output"], json!(true));

        let parsed: FiledLineage = serde_json::from_value(value).expect("parse");
        assert_eq!(parsed, filed);
    }

    #[test]
    fn missing_required_key_is_reported() {
        let value = json!({"type": "code"});
        let err = ResourceLineage::from_json(&value).expect_err("must fail");
        assert!(err.to_string().contains("certificate"), "{err}");
    }

    #[test]
    fn invalid_type_discriminator_is_rejected() {
        let value = json!({"type": "mystery"});
        let err = ResourceLineage::from_json(&value).expect_err("must fail");
        assert!(err.to_string().contains("mystery"), "{err}");
    }
}
