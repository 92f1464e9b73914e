// SPDX-License-Identifier: MIT OR Apache-2.0
//! Kahn's-algorithm topological sort over the stage sub-DAG induced by a
//! requested id set and its transitive dependencies.

use crate::registry::StageRegistry;
use isx_error::{ErrorCode, PipelineError};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Resolve `ids` (and everything they transitively depend on) into a
/// deterministic execution order.
///
/// Ties among ready stages are broken by `registry`'s registration order,
/// so a fixed registration order and request always produce the same
/// linear order.
pub fn resolve(registry: &StageRegistry, ids: &[String]) -> Result<Vec<String>, PipelineError> {
    let mut closure: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = ids.to_vec();
    while let Some(id) = stack.pop() {
        if !closure.insert(id.clone()) {
            continue;
        }
        let stage = registry.get(&id).ok_or_else(|| {
            PipelineError::new(
                ErrorCode::DependencyMissing,
                format!("stage '{id}' depends on unregistered stage"),
            )
            .with_stage(id.clone())
        })?;
        for dep in stage.dependencies() {
            if registry.get(dep).is_none() {
                return Err(PipelineError::new(
                    ErrorCode::DependencyMissing,
                    format!("stage '{id}' depends on unregistered stage '{dep}'"),
                )
                .with_stage(id.clone()));
            }
            stack.push(dep.clone());
        }
    }

    let mut in_degree: HashMap<String, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for id in &closure {
        in_degree.entry(id.clone()).or_insert(0);
        let stage = registry.get(id).expect("closure members are registered");
        for dep in stage.dependencies() {
            *in_degree.entry(id.clone()).or_insert(0) += 1;
            dependents.entry(dep.clone()).or_default().push(id.clone());
        }
    }

    let priority: HashMap<&str, usize> = registry
        .registration_order()
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut ready: VecDeque<String> = closure
        .iter()
        .filter(|id| in_degree[*id] == 0)
        .cloned()
        .collect();
    sort_by_registration_order(&mut ready, &priority);

    let mut order = Vec::with_capacity(closure.len());
    while let Some(id) = ready.pop_front() {
        order.push(id.clone());
        if let Some(children) = dependents.get(&id) {
            let mut newly_ready = Vec::new();
            for child in children {
                let degree = in_degree.get_mut(child).expect("tracked degree");
                *degree -= 1;
                if *degree == 0 {
                    newly_ready.push(child.clone());
                }
            }
            for child in newly_ready {
                ready.push_back(child);
            }
            let mut as_vec: VecDeque<String> = ready.drain(..).collect();
            sort_by_registration_order(&mut as_vec, &priority);
            ready = as_vec;
        }
    }

    if order.len() != closure.len() {
        let remaining: BTreeSet<String> = closure.difference(&order.iter().cloned().collect()).cloned().collect();
        return Err(PipelineError::new(
            ErrorCode::DependencyCyclic,
            format!(
                "dependency cycle detected among stages: {}",
                remaining.into_iter().collect::<Vec<_>>().join(", ")
            ),
        ));
    }

    Ok(order)
}

fn sort_by_registration_order(ids: &mut VecDeque<String>, priority: &HashMap<&str, usize>) {
    let mut as_vec: Vec<String> = ids.drain(..).collect();
    as_vec.sort_by_key(|id| priority.get(id.as_str()).copied().unwrap_or(usize::MAX));
    ids.extend(as_vec);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StageRegistry;
    use isx_core::{CancellationToken, Stage, StageHandle};

    struct Fake {
        id: &'static str,
        deps: Vec<String>,
    }

    #[async_trait::async_trait]
    impl Stage for Fake {
        fn id(&self) -> &str {
            self.id
        }
        fn name(&self) -> &str {
            self.id
        }
        fn dependencies(&self) -> &[String] {
            &self.deps
        }
        async fn execute(
            &self,
            _cancel: CancellationToken,
            _handle: StageHandle,
        ) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    fn registry_with(stages: Vec<(&'static str, Vec<&'static str>)>) -> StageRegistry {
        let mut registry = StageRegistry::new();
        for (id, deps) in stages {
            registry
                .register(Fake {
                    id,
                    deps: deps.into_iter().map(String::from).collect(),
                })
                .unwrap();
        }
        registry
    }

    #[test]
    fn linear_chain_resolves_in_dependency_order() {
        let registry = registry_with(vec![
            ("scrape", vec![]),
            ("process", vec!["scrape"]),
            ("indexcsv", vec!["process"]),
            ("analysis", vec!["indexcsv"]),
        ]);
        let ids = ["analysis".to_string()];
        let order = resolve(&registry, &ids).unwrap();
        assert_eq!(order, vec!["scrape", "process", "indexcsv", "analysis"]);
    }

    #[test]
    fn independent_branches_tie_break_by_registration_order() {
        let registry = registry_with(vec![("b", vec![]), ("a", vec![]), ("c", vec!["a", "b"])]);
        let ids = ["c".to_string()];
        let order = resolve(&registry, &ids).unwrap();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let registry = registry_with(vec![("a", vec!["b"]), ("b", vec!["a"])]);
        let ids = ["a".to_string()];
        let err = resolve(&registry, &ids).unwrap_err();
        assert_eq!(err.code, ErrorCode::DependencyCyclic);
    }

    #[test]
    fn missing_dependency_is_rejected() {
        let mut registry = StageRegistry::new();
        registry
            .register(Fake {
                id: "process",
                deps: vec!["scrape".to_string()],
            })
            .unwrap();
        let ids = ["process".to_string()];
        let err = resolve(&registry, &ids).unwrap_err();
        assert_eq!(err.code, ErrorCode::DependencyMissing);
    }

    #[test]
    fn unregistered_requested_id_is_rejected() {
        let registry = registry_with(vec![("scrape", vec![])]);
        let ids = ["nonexistent".to_string()];
        let err = resolve(&registry, &ids).unwrap_err();
        assert_eq!(err.code, ErrorCode::DependencyMissing);
    }
}
