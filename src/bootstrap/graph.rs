//! Service dependency graph: cycle detection and topological ordering

use std::collections::HashMap;

/// Directed graph of service names where an edge means "dependent requires
/// prerequisite". Node indices follow registration order, which also breaks
/// ties in the topological order for determinism.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// requires[d] = prerequisites of d
    requires: Vec<Vec<usize>>,
    /// dependents[p] = nodes that require p
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str) -> bool {
        if self.index.contains_key(name) {
            return false;
        }
        self.index.insert(name.to_string(), self.names.len());
        self.names.push(name.to_string());
        self.requires.push(Vec::new());
        self.dependents.push(Vec::new());
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Declare that `dependent` requires `prerequisite`. Both must exist.
    pub fn add_edge(&mut self, dependent: &str, prerequisite: &str) -> Result<(), String> {
        let d = *self.index.get(dependent).ok_or_else(|| dependent.to_string())?;
        let p = *self.index.get(prerequisite).ok_or_else(|| prerequisite.to_string())?;
        if !self.requires[d].contains(&p) {
            self.requires[d].push(p);
            self.dependents[p].push(d);
        }
        Ok(())
    }

    /// DFS with a recursion-stack set; every back-edge contributes its cycle
    /// path. A self-dependency yields a cycle of length 1.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        let n = self.names.len();
        let mut color = vec![Color::White; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut cycles: Vec<Vec<String>> = Vec::new();

        fn visit(
            node: usize,
            graph: &DependencyGraph,
            color: &mut [Color],
            stack: &mut Vec<usize>,
            cycles: &mut Vec<Vec<String>>,
        ) {
            color[node] = Color::Grey;
            stack.push(node);

            for &next in &graph.requires[node] {
                match color[next] {
                    Color::Grey => {
                        // Back-edge: the cycle is the stack suffix from `next`
                        let from = stack.iter().position(|&x| x == next).unwrap_or(0);
                        let cycle =
                            stack[from..].iter().map(|&i| graph.names[i].clone()).collect();
                        cycles.push(cycle);
                    }
                    Color::White => visit(next, graph, color, stack, cycles),
                    Color::Black => {}
                }
            }

            stack.pop();
            color[node] = Color::Black;
        }

        for node in 0..n {
            if color[node] == Color::White {
                visit(node, self, &mut color, &mut stack, &mut cycles);
            }
        }
        cycles
    }

    /// Kahn's algorithm. Among ready nodes the lowest registration index goes
    /// first. Errors with all detected cycles when the graph is cyclic.
    pub fn topological_order(&self) -> Result<Vec<String>, Vec<Vec<String>>> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        let n = self.names.len();
        let mut in_degree: Vec<usize> = self.requires.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| in_degree[i] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(node)) = ready.pop() {
            order.push(self.names[node].clone());
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() < n {
            return Err(self.find_cycles());
        }
        Ok(order)
    }
}

/// `A -> B -> C -> A` rendering of one cycle.
pub fn format_cycle(cycle: &[String]) -> String {
    let mut parts: Vec<&str> = cycle.iter().map(String::as_str).collect();
    if let Some(first) = cycle.first() {
        parts.push(first);
    }
    parts.join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for node in nodes {
            g.add_node(node);
        }
        for (dependent, prerequisite) in edges {
            g.add_edge(dependent, prerequisite).unwrap();
        }
        g
    }

    #[test]
    fn empty_graph_orders_trivially() {
        let g = DependencyGraph::new();
        assert!(g.topological_order().unwrap().is_empty());
        assert!(g.find_cycles().is_empty());
    }

    #[test]
    fn prerequisites_come_first() {
        let g = graph(
            &["peer", "tracker", "registry"],
            &[("peer", "tracker"), ("tracker", "registry")],
        );
        let order = g.topological_order().unwrap();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("registry") < pos("tracker"));
        assert!(pos("tracker") < pos("peer"));
    }

    #[test]
    fn ties_break_by_registration_order() {
        let g = graph(&["c", "a", "b"], &[]);
        assert_eq!(g.topological_order().unwrap(), vec!["c", "a", "b"]);
    }

    #[test]
    fn three_node_cycle_is_reported() {
        let g = graph(&["A", "B", "C"], &[("A", "B"), ("B", "C"), ("C", "A")]);
        let cycles = g.find_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(format_cycle(&cycles[0]), "A -> B -> C -> A");
        assert!(g.topological_order().is_err());
    }

    #[test]
    fn self_dependency_is_a_cycle_of_length_one() {
        let g = graph(&["A"], &[("A", "A")]);
        let cycles = g.find_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(format_cycle(&cycles[0]), "A -> A");
    }

    #[test]
    fn multiple_disjoint_cycles_are_all_found() {
        let g = graph(
            &["A", "B", "C", "D", "E"],
            &[("A", "B"), ("B", "A"), ("C", "D"), ("D", "C")],
        );
        let cycles = g.find_cycles();
        assert_eq!(cycles.len(), 2);
        let formatted: Vec<String> = cycles.iter().map(|c| format_cycle(c)).collect();
        assert!(formatted.iter().any(|c| c.contains("A") && c.contains("B")));
        assert!(formatted.iter().any(|c| c.contains("C") && c.contains("D")));
    }

    #[test]
    fn unknown_edge_endpoints_error() {
        let mut g = graph(&["A"], &[]);
        assert!(g.add_edge("A", "ghost").is_err());
        assert!(g.add_edge("ghost", "A").is_err());
    }

    #[test]
    fn duplicate_nodes_are_rejected() {
        let mut g = DependencyGraph::new();
        assert!(g.add_node("A"));
        assert!(!g.add_node("A"));
        assert_eq!(g.len(), 1);
    }
}
