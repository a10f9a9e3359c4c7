//! Human-readable dumps of the build and request graphs.

use std::collections::HashMap;
use std::fmt::{Debug, Write};
use std::hash::Hash;
use std::time::Duration;

use crate::graph::DirectedGraph;
use crate::request::{RequestGraphNode, RequestId, RequestKey};

/// Renders a graph as a Mermaid flowchart. Node ids are positional, so two
/// dumps of different graphs are not comparable line by line.
pub fn render_mermaid<K, N, E, F>(graph: &DirectedGraph<K, N, E>, mut label: F) -> String
where
    K: Clone + Eq + Hash + Debug,
    N: PartialEq,
    E: Clone + PartialEq + Debug,
    F: FnMut(&K, &N) -> String,
{
    let mut f = String::new();
    let mut index = HashMap::new();

    _ = writeln!(f, "graph LR");

    for (i, (id, node)) in graph.nodes().enumerate() {
        index.insert(id.clone(), i);
        _ = writeln!(f, "    {i}[\"{}\"]", escape(&label(id, node)));
    }

    for edge in graph.edges() {
        let (Some(from), Some(to)) = (index.get(&edge.from), index.get(&edge.to)) else {
            continue;
        };

        match &edge.ty {
            Some(ty) => {
                let ty = escape(&format!("{ty:?}"));
                _ = writeln!(f, "    {from} -- \"{ty}\" --> {to}");
            }
            None => {
                _ = writeln!(f, "    {from} --> {to}");
            }
        }
    }

    f
}

/// Renders the request graph, coloring requests by how long they took in
/// the last build. Requests that did not run are shown as cached.
pub fn render_request_graph<R, E>(
    graph: &DirectedGraph<RequestKey, RequestGraphNode<R>, E>,
    durations: &HashMap<RequestId, Duration>,
) -> String
where
    E: Clone + PartialEq + Debug,
{
    let slowest = durations
        .values()
        .map(Duration::as_secs_f64)
        .fold(0.0_f64, f64::max);

    let mut f = render_mermaid(graph, |_, node| match node {
        RequestGraphNode::Root => "root".into(),
        RequestGraphNode::File(path) => path.to_string(),
        RequestGraphNode::Request(node) => match durations.get(&node.id) {
            Some(duration) => format!("{} {}\\n{duration:.2?}", node.kind, node.id),
            None => format!("{} {}\\ncached", node.kind, node.id),
        },
    });

    for (i, (_, node)) in graph.nodes().enumerate() {
        let RequestGraphNode::Request(node) = node else {
            continue;
        };

        let color = match durations.get(&node.id) {
            Some(duration) => heat(duration.as_secs_f64(), slowest),
            None => "#ADD8E6".to_string(),
        };

        _ = writeln!(f, "    style {i} fill:{color}");
    }

    f
}

// green through yellow to red
fn heat(value: f64, max: f64) -> String {
    let t = if max > f64::EPSILON { value / max } else { 0.0 };

    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };

    format!("#{r:02X}{g:02X}00")
}

fn escape(text: &str) -> String {
    text.replace('"', "#quot;")
}
