use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::Path;

use serde_json::{Value, json};
use tracing::warn;

use crate::error::{LineageError, LineageResult};
use crate::lineage::cert::Certificate;
use crate::lineage::entry::ResourceLineage;
use crate::lineage::refs::ResourceRef;
use crate::store::atomic::atomic_write;
use crate::store::{LineageStore, LineageView};

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub cert: Certificate,
    pub label: String,
    /// `None` when the certificate's lineage is missing or was overwritten.
    pub lineage_type: Option<&'static str>,
}

/// `from` was an input (or code) of the step that produced `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub step_name: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LineageGraph {
    pub resource_name: String,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub warnings: usize,
}

/// Certificates reachable backward from the refs filed under `resource_name`.
///
/// Expansion stops at a certificate that is already rendered and at any
/// certificate whose ref now carries a different lineage.
pub fn make_simplified_lineage_graph_for_resource<S>(
    instance: &str,
    store: &S,
    resource_name: &str,
    view: &LineageView,
) -> LineageResult<LineageGraph>
where
    S: LineageStore + ?Sized,
{
    let mut graph = LineageGraph {
        resource_name: resource_name.to_string(),
        ..LineageGraph::default()
    };
    // Ids are handed out on discovery so edges can name queued nodes.
    let mut ids: HashMap<Certificate, String> = HashMap::new();
    let mut queue = VecDeque::new();

    let start = store.refs_in_view(instance, resource_name, view)?;
    if start.is_empty() {
        return Err(LineageError::NotFound(ResourceRef::whole(resource_name)));
    }
    for resource_ref in start {
        let lineage = store.retrieve_in_view(instance, &resource_ref, view)?;
        if let Some(cert) = lineage.cert_for(&resource_ref) {
            discover(&mut ids, &mut queue, cert);
        }
    }

    while let Some((id, cert)) = queue.pop_front() {
        let resource_ref = cert.resource_ref();
        let lineage = match store.retrieve_in_view(instance, resource_ref, view) {
            Ok(lineage) if lineage.cert_for(resource_ref) == Some(&cert) => Some(lineage),
            Ok(_) => None,
            Err(err) if err.is_not_found() => {
                warn!(%resource_ref, "no lineage recorded; rendering as a leaf");
                graph.warnings += 1;
                None
            }
            Err(err) => return Err(err),
        };

        graph.nodes.push(GraphNode {
            id: id.clone(),
            label: cert.to_string(),
            lineage_type: lineage.as_ref().map(ResourceLineage::lineage_type),
            cert,
        });

        let Some(ResourceLineage::Step(step)) = lineage else {
            continue;
        };
        for dep in step.input_resources.iter().chain(&step.code_resources) {
            graph.edges.push(GraphEdge {
                from: discover(&mut ids, &mut queue, dep),
                to: id.clone(),
                step_name: step.step_name.clone(),
            });
        }
    }

    Ok(graph)
}

/// Returns the id of `cert`, queueing it for rendering the first time it is seen.
fn discover(
    ids: &mut HashMap<Certificate, String>,
    queue: &mut VecDeque<(String, Certificate)>,
    cert: &Certificate,
) -> String {
    if let Some(id) = ids.get(cert) {
        return id.clone();
    }
    let id = format!("n{}", ids.len());
    ids.insert(cert.clone(), id.clone());
    queue.push_back((id.clone(), cert.clone()));
    id
}

impl LineageGraph {
    pub fn to_json(&self) -> Value {
        json!({
            "resource_name": self.resource_name,
            "nodes": self.nodes.iter().map(|node| json!({
                "id": node.id,
                "label": node.label,
                "type": node.lineage_type,
                "certificate": node.cert.to_json(),
            })).collect::<Vec<_>>(),
            "edges": self.edges.iter().map(|edge| json!({
                "from": edge.from,
                "to": edge.to,
                "step_name": edge.step_name,
            })).collect::<Vec<_>>(),
            "warnings": self.warnings,
        })
    }

    /// Graphviz source, edges pointing from input to output.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", escape_dot(&self.resource_name));
        let _ = writeln!(out, "  rankdir=LR;");
        for node in &self.nodes {
            let shape = match node.lineage_type {
                Some("step") => "box",
                Some("code") => "note",
                Some(_) => "ellipse",
                None => "plaintext",
            };
            let _ = writeln!(
                out,
                "  {} [label=\"{}\", shape={shape}];",
                node.id,
                escape_dot(&node.label)
            );
        }
        for edge in &self.edges {
            let _ = writeln!(
                out,
                "  {} -> {} [label=\"{}\"];",
                edge.from,
                edge.to,
                escape_dot(&edge.step_name)
            );
        }
        out.push_str("}\n");
        out
    }

    pub fn write_dot(&self, path: &Path) -> LineageResult<()> {
        atomic_write(path, self.to_dot().as_bytes()).map_err(|err| LineageError::io(path, err))
    }
}

fn escape_dot(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::recorder::{StepRecorder, record_source_data};
    use crate::store::FileLineageStore;

    const HOST: &str = "host-a";

    fn run(store: &mut FileLineageStore, name: &str, inputs: &[&str], outputs: &[&str]) {
        let mut recorder = StepRecorder::new(name);
        for input in inputs {
            recorder = recorder.with_input(ResourceRef::whole(*input));
        }
        let mut step = recorder.start(HOST, store).expect("start");
        for output in outputs {
            step.add_output(ResourceRef::whole(*output)).expect("output");
        }
        step.complete().expect("complete");
    }

    #[test]
    fn graph_walks_backward_and_shares_nodes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        record_source_data(HOST, &mut store, ResourceRef::whole("raw"), Some("r1"), "upload")
            .expect("raw");
        run(&mut store, "split", &["raw"], &["train", "test"]);
        run(&mut store, "fit", &["train"], &["model"]);
        run(&mut store, "score", &["model", "test"], &["results"]);

        let graph = make_simplified_lineage_graph_for_resource(
            HOST,
            &store,
            "results",
            &LineageView::Current,
        )
        .expect("graph");

        let labels = graph
            .nodes
            .iter()
            .map(|node| node.label.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            labels,
            vec![
                "results@output-placeholder-v1",
                "model@output-placeholder-v1",
                "test@output-placeholder-v1",
                "train@output-placeholder-v1",
                "raw@r1",
            ]
        );
        // raw is rendered once even though split produced two outputs from it.
        assert_eq!(graph.edges.len(), 5);
        let into_raw = graph
            .edges
            .iter()
            .filter(|edge| edge.from == "n4")
            .map(|edge| edge.to.as_str())
            .collect::<Vec<_>>();
        assert_eq!(into_raw, vec!["n2", "n3"]);
        assert_eq!(graph.warnings, 0);
        assert_eq!(graph.nodes[4].lineage_type, Some("source_data"));
    }

    #[test]
    fn overwritten_inputs_are_leaves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLineageStore::new(dir.path());
        run(&mut store, "prep", &["raw"], &["clean"]);
        run(&mut store, "reload", &[], &["raw"]);

        let graph =
            make_simplified_lineage_graph_for_resource(HOST, &store, "clean", &LineageView::Current)
                .expect("graph");
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.nodes[1].label, "raw@input-placeholder-v1");
        assert_eq!(graph.nodes[1].lineage_type, None);
    }

    #[test]
    fn unknown_resource_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileLineageStore::new(dir.path());
        let err =
            make_simplified_lineage_graph_for_resource(HOST, &store, "nothing", &LineageView::Current)
                .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[test]
    fn dot_output_escapes_labels() {
        let graph = LineageGraph {
            resource_name: "res\"ults".to_string(),
            nodes: vec![GraphNode {
                id: "n0".to_string(),
                cert: Certificate::hash(ResourceRef::whole("res\"ults"), "h", ""),
                label: "res\"ults@h".to_string(),
                lineage_type: Some("source_data"),
            }],
            edges: Vec::new(),
            warnings: 0,
        };
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph \"res\\\"ults\" {"));
        assert!(dot.contains("n0 [label=\"res\\\"ults@h\", shape=ellipse];"));

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out/results.dot");
        graph.write_dot(&path).expect("write dot");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), dot);
    }
}
