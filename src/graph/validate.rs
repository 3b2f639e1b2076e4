//! Compile-time validation turning builder parts into a [`CompiledGraph`].
//!
//! Checks run in dependency order: names and references must resolve before
//! the cycle/reachability analysis can interpret the edge lists, and the
//! cross-function rule runs last over the already-proven DAG. Error edges
//! (`on_error`) participate in the cycle and reachability analysis exactly
//! like declared edges.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use crate::context::ROOT_FUNCTION;
use crate::graph::compiled::{CompiledGraph, FunctionSpec, Topology};
use crate::graph::errors::GraphError;
use crate::router::Router;
use crate::steps::{HandlerRef, RemoteTarget, Step, StepKind};

pub(crate) fn compile(
    steps: Vec<Step>,
    edges: FxHashMap<String, Vec<String>>,
    topology: Topology,
    functions: FxHashMap<String, FunctionSpec>,
) -> Result<CompiledGraph, GraphError> {
    if steps.is_empty() {
        return Err(GraphError::EmptyGraph);
    }

    // Unique names first; everything else resolves through this index.
    let mut index: FxHashMap<String, usize> = FxHashMap::default();
    for (pos, step) in steps.iter().enumerate() {
        if index.insert(step.name().to_string(), pos).is_some() {
            return Err(GraphError::DuplicateStepName {
                name: step.name().to_string(),
            });
        }
    }

    // Every edge endpoint names an existing step.
    for step in &steps {
        let Some(targets) = edges.get(step.name()) else {
            continue;
        };
        for to in targets {
            if !index.contains_key(to) {
                return Err(GraphError::UnknownStep {
                    name: to.clone(),
                    referenced_by: step.name().to_string(),
                });
            }
        }
    }
    for from in edges.keys() {
        if !index.contains_key(from) {
            return Err(GraphError::UnknownStep {
                name: from.clone(),
                referenced_by: "connect".to_string(),
            });
        }
    }

    // Per-step configuration.
    for step in &steps {
        if step.io().conflicts() {
            return Err(GraphError::ConfigConflict {
                step: step.name().to_string(),
            });
        }

        let function = step.effective_function();
        if function != ROOT_FUNCTION && !functions.contains_key(function) {
            return Err(GraphError::UnknownFunction {
                function: function.to_string(),
                step: step.name().to_string(),
            });
        }

        if let Some(target) = step.on_error() {
            let Some(&pos) = index.get(target) else {
                return Err(GraphError::UnknownStep {
                    name: target.to_string(),
                    referenced_by: step.name().to_string(),
                });
            };
            // Error redirects are direct handoffs; they never cross
            // function units.
            if steps[pos].effective_function() != function {
                return Err(GraphError::InvalidCrossFunctionEdge {
                    from: step.name().to_string(),
                    to: target.to_string(),
                });
            }
        }

        check_remote_target(step, &functions)?;
        if let StepKind::Router(router) = step.kind() {
            validate_router(step, router, &functions)?;
        }
    }

    // Topology shape.
    match topology {
        Topology::Router => {
            if steps.len() != 1 {
                return Err(GraphError::TopologyMismatch {
                    detail: format!(
                        "router topology holds exactly one router step, found {} steps",
                        steps.len()
                    ),
                });
            }
            if !matches!(steps[0].kind(), StepKind::Router(_)) {
                return Err(GraphError::TopologyMismatch {
                    detail: format!(
                        "router topology requires a router step, '{}' is a {}",
                        steps[0].name(),
                        steps[0].kind().name()
                    ),
                });
            }
            if !edges.is_empty() {
                return Err(GraphError::TopologyMismatch {
                    detail: "router topology does not take edges".to_string(),
                });
            }
        }
        Topology::Flow => {}
    }

    // Adjacency over declared edges plus on_error redirects, in insertion
    // order for deterministic reporting.
    let names: Vec<&str> = steps.iter().map(Step::name).collect();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (pos, step) in steps.iter().enumerate() {
        if let Some(targets) = edges.get(step.name()) {
            for to in targets {
                adjacency[pos].push(index[to.as_str()]);
            }
        }
        if let Some(target) = step.on_error() {
            adjacency[pos].push(index[target]);
        }
    }

    detect_cycle(&names, &adjacency)?;

    // Entry points: no inbound edge and no on_error pointing here.
    let entries: Vec<String> = match topology {
        Topology::Router => vec![steps[0].name().to_string()],
        Topology::Flow => {
            let mut referenced = vec![false; steps.len()];
            for targets in &adjacency {
                for &to in targets {
                    referenced[to] = true;
                }
            }
            steps
                .iter()
                .enumerate()
                .filter(|(pos, _)| !referenced[*pos])
                .map(|(_, step)| step.name().to_string())
                .collect()
        }
    };

    // Reachability from the entry points.
    let mut reached = vec![false; steps.len()];
    let mut worklist: Vec<usize> = entries.iter().map(|name| index[name.as_str()]).collect();
    for &entry in &worklist {
        reached[entry] = true;
    }
    while let Some(node) = worklist.pop() {
        for &next in &adjacency[node] {
            if !reached[next] {
                reached[next] = true;
                worklist.push(next);
            }
        }
    }
    if let Some((pos, _)) = reached.iter().enumerate().find(|(_, seen)| !**seen) {
        return Err(GraphError::UnreachableStep {
            name: names[pos].to_string(),
        });
    }

    // Function boundaries are only crossed through queue steps.
    for step in &steps {
        let Some(targets) = edges.get(step.name()) else {
            continue;
        };
        for to in targets {
            let successor = &steps[index[to.as_str()]];
            if successor.effective_function() != step.effective_function()
                && !step.kind().is_queue()
            {
                return Err(GraphError::InvalidCrossFunctionEdge {
                    from: step.name().to_string(),
                    to: to.clone(),
                });
            }
        }
    }

    let terminals: Vec<String> = steps
        .iter()
        .filter(|step| edges.get(step.name()).is_none_or(Vec::is_empty))
        .map(|step| step.name().to_string())
        .collect();

    Ok(CompiledGraph::from_parts(
        steps, index, edges, topology, functions, entries, terminals,
    ))
}

/// Three-color DFS reporting the first back edge found in declaration
/// order.
fn detect_cycle(names: &[&str], adjacency: &[Vec<usize>]) -> Result<(), GraphError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Open,
        Done,
    }

    let mut marks = vec![Mark::New; names.len()];
    for root in 0..names.len() {
        if marks[root] != Mark::New {
            continue;
        }
        marks[root] = Mark::Open;
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        while let Some(frame) = stack.last_mut() {
            let (node, cursor) = *frame;
            if cursor < adjacency[node].len() {
                frame.1 += 1;
                let child = adjacency[node][cursor];
                match marks[child] {
                    Mark::Open => {
                        return Err(GraphError::CyclicGraph {
                            from: names[node].to_string(),
                            to: names[child].to_string(),
                        });
                    }
                    Mark::New => {
                        marks[child] = Mark::Open;
                        stack.push((child, 0));
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                stack.pop();
            }
        }
    }
    Ok(())
}

fn validate_router(
    step: &Step,
    router: &Router,
    functions: &FxHashMap<String, FunctionSpec>,
) -> Result<(), GraphError> {
    if router.routes().is_empty() {
        return Err(GraphError::TopologyMismatch {
            detail: format!("router '{}' declares no routes", step.name()),
        });
    }

    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for route in router.routes() {
        if !seen.insert(route.name()) {
            return Err(GraphError::DuplicateRoute {
                router: step.name().to_string(),
                route: route.name().to_string(),
            });
        }

        let child = route.step();
        if child.io().conflicts() {
            return Err(GraphError::ConfigConflict {
                step: child.name().to_string(),
            });
        }
        if child.on_error().is_some() {
            warn!(
                router = step.name(),
                route = route.name(),
                "route child declares on_error; child failures surface through the router itself"
            );
        }
        if let (Some(router_path), Some(child_path)) =
            (step.io().result_path(), child.io().result_path())
            && paths_overlap(router_path, child_path)
        {
            warn!(
                router = step.name(),
                route = route.name(),
                router_path,
                child_path,
                "router and route result paths overlap; route placement applies first, router placement to the aggregate"
            );
        }

        check_remote_target(child, functions)?;
        if let StepKind::Router(nested) = child.kind() {
            validate_router(child, nested, functions)?;
        }
    }
    Ok(())
}

fn check_remote_target(
    step: &Step,
    functions: &FxHashMap<String, FunctionSpec>,
) -> Result<(), GraphError> {
    if let StepKind::Task(HandlerRef::Remote(spec)) = step.kind()
        && let RemoteTarget::Function(function) = spec.target()
        && function != ROOT_FUNCTION
        && !functions.contains_key(function)
    {
        return Err(GraphError::UnknownFunction {
            function: function.clone(),
            step: step.name().to_string(),
        });
    }
    Ok(())
}

/// Dotted paths overlap when one's segments are a prefix of the other's.
fn paths_overlap(a: &str, b: &str) -> bool {
    let a: Vec<&str> = a.split('.').collect();
    let b: Vec<&str> = b.split('.').collect();
    let shared = a.len().min(b.len());
    a[..shared] == b[..shared]
}
