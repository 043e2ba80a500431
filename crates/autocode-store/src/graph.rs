//! Dependency-graph analysis over an adjacency list of function ids.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use regex::Regex;
use serde::Serialize;

/// `function_id -> ids it depends on`.
pub type DependencyGraph = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecursionReport {
    pub direct: bool,
    pub mutual_cycles: Vec<Vec<String>>,
}

/// All elementary cycles reachable by DFS, each rotated so its smallest id
/// comes first, de-duplicated, in discovery order.
pub fn find_cycles(graph: &DependencyGraph) -> Vec<Vec<String>> {
    let mut walk = CycleWalk {
        graph,
        visited: HashSet::new(),
        stack: Vec::new(),
        cycles: Vec::new(),
    };
    for node in graph.keys() {
        if !walk.visited.contains(node.as_str()) {
            walk.visit(node);
        }
    }

    let mut seen = BTreeSet::new();
    let mut unique = Vec::new();
    for cycle in walk.cycles {
        let normalized = rotate_smallest_first(cycle);
        if seen.insert(normalized.clone()) {
            unique.push(normalized);
        }
    }
    unique
}

struct CycleWalk<'a> {
    graph: &'a DependencyGraph,
    visited: HashSet<&'a str>,
    stack: Vec<&'a str>,
    cycles: Vec<Vec<String>>,
}

impl<'a> CycleWalk<'a> {
    fn visit(&mut self, node: &'a str) {
        self.visited.insert(node);
        self.stack.push(node);
        let graph = self.graph;
        for next in graph.get(node).into_iter().flatten() {
            if let Some(position) = self.stack.iter().position(|entry| *entry == next.as_str()) {
                self.cycles.push(
                    self.stack[position..]
                        .iter()
                        .map(|entry| entry.to_string())
                        .collect(),
                );
            } else if !self.visited.contains(next.as_str()) {
                self.visit(next);
            }
        }
        self.stack.pop();
    }
}

fn rotate_smallest_first(mut cycle: Vec<String>) -> Vec<String> {
    if let Some(start) = cycle
        .iter()
        .enumerate()
        .min_by(|left, right| left.1.cmp(right.1))
        .map(|(index, _)| index)
    {
        cycle.rotate_left(start);
    }
    cycle
}

/// True when adding `function_id -> depends_on_id` would close a cycle.
pub fn would_create_cycle(graph: &DependencyGraph, function_id: &str, depends_on_id: &str) -> bool {
    let mut pending = vec![depends_on_id];
    let mut seen = HashSet::new();
    while let Some(current) = pending.pop() {
        if current == function_id {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        pending.extend(graph.get(current).into_iter().flatten().map(String::as_str));
    }
    false
}

/// Direct recursion: the name is called more often than it is declared.
/// Mutual recursion: every dependency cycle containing `function_id`.
pub fn detect_recursion(
    graph: &DependencyGraph,
    function_id: &str,
    name: &str,
    code: &str,
) -> RecursionReport {
    let mutual_cycles = find_cycles(graph)
        .into_iter()
        .filter(|cycle| cycle.len() > 1 && cycle.iter().any(|id| id == function_id))
        .collect();
    RecursionReport {
        direct: calls_itself(name, code),
        mutual_cycles,
    }
}

fn calls_itself(name: &str, code: &str) -> bool {
    let escaped = regex::escape(name);
    let Ok(calls) = Regex::new(&format!(r"\b{escaped}\s*\(")) else {
        return false;
    };
    let Ok(declarations) = Regex::new(&format!(
        r"(?m)(\bfunction\s+{escaped}\s*\(|^\s*{escaped}\s*\([^)\n]*\)\s*=([^=]|$))"
    )) else {
        return false;
    };
    calls.find_iter(code).count() > declarations.find_iter(code).count()
}
