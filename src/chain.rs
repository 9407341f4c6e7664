//! Handler chaining as an explicit decision graph.
//!
//! Each node wraps a handler and has two optional successors: one followed
//! when the handler reports the event as handled, one when it does not.
//! Evaluation starts at the root and walks the graph iteratively until a node
//! has no successor for its outcome.
//!
//! ```text
//!        ┌───────────┐ unhandled ┌───────────┐ unhandled ┌──────────┐
//! root ─▶│ auth      │──────────▶│ commands  │──────────▶│ fallback │
//!        └───────────┘           └───────────┘           └──────────┘
//!              │ handled
//!              ▼
//!        ┌───────────┐
//!        │ audit     │
//!        └───────────┘
//! ```
//!
//! The graph is validated to be acyclic when built, so evaluation always
//! terminates. The chain itself implements [`Handler`] and can be attached to
//! a server like any other handler.

use std::sync::Arc;

use crate::{
    connection::NonBlockingConnection,
    error::{DisconnectCause, Error, Result},
    handler::{Capabilities, Handler},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Which outgoing edge of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Handled,
    Unhandled,
}

struct Node {
    handler: Arc<dyn Handler>,
    capabilities: Capabilities,
    on_handled: Option<NodeId>,
    on_unhandled: Option<NodeId>,
}

pub struct HandlerChain {
    nodes: Vec<Node>,
    root: NodeId,
    capabilities: Capabilities,
}

#[derive(Default)]
pub struct HandlerChainBuilder {
    nodes: Vec<Node>,
    root: Option<NodeId>,
}

impl HandlerChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its id. The first node added is the default
    /// root.
    pub fn add(&mut self, handler: Arc<dyn Handler>) -> NodeId {
        let id = NodeId(self.nodes.len());
        let capabilities = handler.capabilities();
        self.nodes.push(Node {
            handler,
            capabilities,
            on_handled: None,
            on_unhandled: None,
        });
        id
    }

    pub fn on_handled(&mut self, from: NodeId, to: NodeId) -> &mut Self {
        if let Some(node) = self.nodes.get_mut(from.0) {
            node.on_handled = Some(to);
        }
        self
    }

    pub fn on_unhandled(&mut self, from: NodeId, to: NodeId) -> &mut Self {
        if let Some(node) = self.nodes.get_mut(from.0) {
            node.on_unhandled = Some(to);
        }
        self
    }

    pub fn root(&mut self, root: NodeId) -> &mut Self {
        self.root = Some(root);
        self
    }

    /// Builds a linear chain where each handler is tried until one reports
    /// the event as handled.
    pub fn first_match(handlers: impl IntoIterator<Item = Arc<dyn Handler>>) -> Result<HandlerChain> {
        let mut builder = Self::new();
        let mut previous: Option<NodeId> = None;
        for handler in handlers {
            let id = builder.add(handler);
            if let Some(prev) = previous {
                builder.on_unhandled(prev, id);
            }
            previous = Some(id);
        }
        builder.build()
    }

    pub fn build(self) -> Result<HandlerChain> {
        if self.nodes.is_empty() {
            return Err(Error::Configuration("handler chain has no nodes".into()));
        }
        let root = self.root.unwrap_or(NodeId(0));
        let len = self.nodes.len();
        let out_of_range = |id: &NodeId| id.0 >= len;
        if out_of_range(&root)
            || self.nodes.iter().any(|n| {
                n.on_handled.iter().chain(n.on_unhandled.iter()).any(out_of_range)
            })
        {
            return Err(Error::Configuration(
                "handler chain edge points to an unknown node".into(),
            ));
        }
        if has_cycle(&self.nodes) {
            return Err(Error::Configuration("handler chain contains a cycle".into()));
        }

        let capabilities = self
            .nodes
            .iter()
            .fold(Capabilities::empty(), |acc, n| acc | n.capabilities);
        Ok(HandlerChain {
            nodes: self.nodes,
            root,
            capabilities,
        })
    }
}

fn has_cycle(nodes: &[Node]) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    let mut marks = vec![Mark::New; nodes.len()];
    for start in 0..nodes.len() {
        if marks[start] != Mark::New {
            continue;
        }
        // iterative DFS: (node, next edge index)
        let mut stack = vec![(start, 0usize)];
        marks[start] = Mark::Active;
        while let Some((node, edge)) = stack.pop() {
            let successors = [nodes[node].on_handled, nodes[node].on_unhandled];
            match successors.get(edge) {
                Some(next) => {
                    stack.push((node, edge + 1));
                    if let Some(NodeId(next)) = *next {
                        match marks[next] {
                            Mark::Active => return true,
                            Mark::New => {
                                marks[next] = Mark::Active;
                                stack.push((next, 0));
                            }
                            Mark::Done => {}
                        }
                    }
                }
                None => marks[node] = Mark::Done,
            }
        }
    }
    false
}

impl HandlerChain {
    pub fn builder() -> HandlerChainBuilder {
        HandlerChainBuilder::new()
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All edges as `(from, outcome, to)`, in node order.
    pub fn edges(&self) -> Vec<(NodeId, Outcome, NodeId)> {
        let mut edges = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if let Some(to) = node.on_handled {
                edges.push((NodeId(i), Outcome::Handled, to));
            }
            if let Some(to) = node.on_unhandled {
                edges.push((NodeId(i), Outcome::Unhandled, to));
            }
        }
        edges
    }

    /// Walks the graph from the root, skipping nodes without `capability`.
    /// A skipped node follows its unhandled edge. Returns the outcome of the
    /// last evaluated node.
    fn walk<F>(&self, capability: Capabilities, mut eval: F) -> Result<bool>
    where
        F: FnMut(&dyn Handler) -> Result<bool>,
    {
        let mut current = Some(self.root);
        let mut handled = false;
        while let Some(NodeId(index)) = current {
            let node = &self.nodes[index];
            handled = if node.capabilities.contains(capability) {
                match eval(node.handler.as_ref()) {
                    Ok(handled) => handled,
                    Err(Error::Incomplete) => false,
                    Err(e) => return Err(e),
                }
            } else {
                false
            };
            current = if handled {
                node.on_handled
            } else {
                node.on_unhandled
            };
        }
        Ok(handled)
    }
}

impl Handler for HandlerChain {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn on_init(&self) {
        for node in self.nodes.iter().filter(|n| n.capabilities.contains(Capabilities::LIFECYCLE)) {
            node.handler.on_init();
        }
    }

    fn on_destroy(&self) {
        for node in self.nodes.iter().filter(|n| n.capabilities.contains(Capabilities::LIFECYCLE)) {
            node.handler.on_destroy();
        }
    }

    fn on_connect(&self, conn: &NonBlockingConnection) -> Result<bool> {
        // a connection is rejected only if a connect-capable node rejects it
        let mut accepted = true;
        for node in self.nodes.iter().filter(|n| n.capabilities.contains(Capabilities::CONNECT)) {
            accepted &= node.handler.on_connect(conn)?;
        }
        Ok(accepted)
    }

    fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
        self.walk(Capabilities::DATA, |handler| handler.on_data(conn))
    }

    fn on_disconnect(&self, conn: &NonBlockingConnection, cause: &DisconnectCause) {
        for node in self.nodes.iter().filter(|n| n.capabilities.contains(Capabilities::DISCONNECT)) {
            node.handler.on_disconnect(conn, cause);
        }
    }

    fn on_idle_timeout(&self, conn: &NonBlockingConnection) -> bool {
        self.nodes
            .iter()
            .filter(|n| n.capabilities.contains(Capabilities::TIMEOUT))
            .fold(true, |close, n| n.handler.on_idle_timeout(conn) && close)
    }

    fn on_connection_timeout(&self, conn: &NonBlockingConnection) -> bool {
        self.nodes
            .iter()
            .filter(|n| n.capabilities.contains(Capabilities::TIMEOUT))
            .fold(true, |close, n| n.handler.on_connection_timeout(conn) && close)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Marker;

    impl Handler for Marker {
        fn capabilities(&self) -> Capabilities {
            Capabilities::DATA
        }
    }

    fn node() -> Arc<dyn Handler> {
        Arc::new(Marker)
    }

    // The walk is independent of connections, so it is driven directly with
    // a scripted evaluator here; connection-level behavior is covered by the
    // integration tests.
    fn run(chain: &HandlerChain, script: &[(usize, Result<bool>)]) -> (Vec<usize>, Result<bool>) {
        let visited = std::cell::RefCell::new(Vec::new());
        let ptrs: Vec<*const ()> = chain
            .nodes
            .iter()
            .map(|n| Arc::as_ptr(&n.handler) as *const ())
            .collect();
        let result = chain.walk(Capabilities::DATA, |handler| {
            let this = handler as *const _ as *const ();
            let index = ptrs.iter().position(|p| *p == this).unwrap();
            visited.borrow_mut().push(index);
            match script.iter().find(|(i, _)| *i == index) {
                Some((_, Ok(v))) => Ok(*v),
                Some((_, Err(Error::Incomplete))) => Err(Error::Incomplete),
                Some((_, Err(_))) => Err(Error::Protocol("scripted".into())),
                None => Ok(false),
            }
        });
        (visited.into_inner(), result)
    }

    #[test]
    fn test_walk_follows_typed_edges() {
        let mut builder = HandlerChain::builder();
        let a = builder.add(node());
        let b = builder.add(node());
        let c = builder.add(node());
        let d = builder.add(node());
        builder.on_handled(a, b).on_unhandled(a, c).on_unhandled(c, d);
        let chain = builder.build().unwrap();

        let (visited, result) = run(&chain, &[(0, Ok(true)), (1, Ok(true))]);
        assert_eq!(visited, vec![0, 1]);
        assert!(result.unwrap());

        let (visited, result) = run(&chain, &[(0, Ok(false)), (2, Err(Error::Incomplete))]);
        assert_eq!(visited, vec![0, 2, 3]);
        assert!(!result.unwrap());
    }

    #[test]
    fn test_walk_propagates_failures() {
        let chain = HandlerChainBuilder::first_match(vec![node(), node()]).unwrap();
        let (visited, result) = run(&chain, &[(0, Err(Error::Closed))]);
        assert_eq!(visited, vec![0]);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_edges_and_root() {
        let chain = HandlerChainBuilder::first_match(vec![node(), node(), node()]).unwrap();
        assert_eq!(chain.root_id(), NodeId(0));
        assert_eq!(
            chain.edges(),
            vec![
                (NodeId(0), Outcome::Unhandled, NodeId(1)),
                (NodeId(1), Outcome::Unhandled, NodeId(2)),
            ]
        );
        assert_eq!(chain.capabilities(), Capabilities::DATA);
    }

    #[test]
    fn test_rejects_cycles_and_dangling_edges() {
        let mut builder = HandlerChain::builder();
        let a = builder.add(node());
        let b = builder.add(node());
        builder.on_handled(a, b).on_unhandled(b, a);
        assert!(matches!(builder.build(), Err(Error::Configuration(_))));

        let mut builder = HandlerChain::builder();
        let a = builder.add(node());
        builder.on_handled(a, NodeId(7));
        assert!(builder.build().is_err());

        assert!(HandlerChain::builder().build().is_err());
    }

    #[test]
    fn test_lifecycle_reaches_every_node() {
        struct Counted(Arc<AtomicUsize>);
        impl Handler for Counted {
            fn on_init(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let chain = HandlerChainBuilder::first_match(vec![
            Arc::new(Counted(count.clone())) as Arc<dyn Handler>,
            Arc::new(Counted(count.clone())),
            node(),
        ])
        .unwrap();
        chain.on_init();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
