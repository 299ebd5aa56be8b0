pub mod export;
pub mod graph;
pub mod table;
pub mod walk;

pub use export::export_lineage_for_resource;
pub use graph::{GraphEdge, GraphNode, LineageGraph, make_simplified_lineage_graph_for_resource};
pub use table::{LineageTableRow, make_lineage_table, render_lineage_table};
pub use walk::{LineageNode, LineageWalk, WalkMode, walk_lineage};
