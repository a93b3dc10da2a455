//! Node trait and the linear-pipeline interpreter used to compose subgraphs.
//!
//! Per the Design Notes, the master graph is "a table of nodes, edges, and
//! routers — a lightweight compiled DAG interpreter"; no external graph
//! library is required. Each subgraph in this engine is linear (or has a
//! single bounded loop/branch), so the interpreter here is a straight
//! sequential runner with a short-circuit predicate, rather than a general
//! DAG executor.

use async_trait::async_trait;

use crate::error::NodeError;
use crate::state::ScanState;

/// A pure asynchronous transformation from state to state.
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, state: &ScanState) -> Result<ScanState, NodeError>;
}

/// Runs `nodes` in order, short-circuiting as soon as a node reports an
/// error in `state.errors` (the uniform conditional-edge rule: "after each
/// subgraph, if errors is non-empty, route to the Error Handler").
pub async fn run_pipeline(nodes: &[Box<dyn Node>], initial: ScanState) -> Result<ScanState, NodeError> {
    let mut state = initial;
    for node in nodes {
        let span = crate::telemetry::phase_span(&state.scan_id, "pipeline", node.name());
        let _guard = span.enter();
        state = node.run(&state).await?;
        if !state.errors.is_empty() {
            break;
        }
    }
    Ok(state)
}
