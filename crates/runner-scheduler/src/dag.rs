//! Dependency-order walk over a job's step list.

use std::collections::HashMap;

use runner_core::job::StepDef;

/// Execution order for `parallel` mode: steps grouped into waves where every
/// step in a wave has had all its dependencies resolved by an earlier wave.
/// `serial` mode is just a flattening of these waves, one step at a time.
pub fn execution_waves(steps: &[StepDef]) -> Vec<Vec<String>> {
    let mut remaining: HashMap<String, &StepDef> =
        steps.iter().map(|s| (s.name.clone(), s)).collect();
    let mut done: Vec<String> = Vec::new();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let mut wave: Vec<String> = remaining
            .values()
            .filter(|s| s.depends.iter().all(|d| done.contains(d)))
            .map(|s| s.name.clone())
            .collect();

        if wave.is_empty() {
            // Cyclic or dangling dependency: flush whatever is left as one
            // final wave so every step still gets a status report.
            let mut leftover: Vec<String> = remaining.keys().cloned().collect();
            leftover.sort();
            waves.push(leftover);
            break;
        }

        wave.sort();
        for name in &wave {
            remaining.remove(name);
            done.push(name.clone());
        }
        waves.push(wave);
    }

    waves
}

/// Flattens `execution_waves` into a single serial order.
pub fn serial_order(steps: &[StepDef]) -> Vec<String> {
    execution_waves(steps).into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn step(name: &str, depends: &[&str]) -> StepDef {
        StepDef {
            id: runner_core::ResourceId::new(),
            name: name.to_string(),
            commands: vec![],
            depends: depends.iter().map(|s| s.to_string()).collect(),
            env: Map::new(),
        }
    }

    #[test]
    fn linear_chain_orders_by_dependency() {
        let steps = vec![step("b", &["a"]), step("a", &[]), step("c", &["b"])];
        assert_eq!(serial_order(&steps), vec!["a", "b", "c"]);
    }

    #[test]
    fn independent_steps_share_a_wave() {
        let steps = vec![step("a", &[]), step("b", &[])];
        let waves = execution_waves(&steps);
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].len(), 2);
    }

    #[test]
    fn dangling_dependency_still_produces_a_wave() {
        let steps = vec![step("a", &["missing"])];
        let waves = execution_waves(&steps);
        assert_eq!(waves, vec![vec!["a".to_string()]]);
    }
}
