use std::collections::{HashMap, HashSet};

/// Depth-first search with a recursion stack. Returns the first cycle found,
/// as a path that starts and ends on the same task, or `None`.
///
/// Roots are visited in the order of `nodes`, so the reported cycle is stable.
pub fn find_cycle(
    nodes: &[String],
    successors: &HashMap<String, Vec<String>>,
) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut rec_stack: Vec<String> = Vec::new();

    fn dfs(
        name: &str,
        successors: &HashMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        rec_stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = rec_stack.iter().position(|n| n == name) {
            // 检测到循环
            let mut cycle = rec_stack[pos..].to_vec();
            cycle.push(name.to_string());
            return Some(cycle);
        }
        if visited.contains(name) {
            return None; // 已处理
        }

        visited.insert(name.to_string());
        rec_stack.push(name.to_string());

        if let Some(children) = successors.get(name) {
            for child in children {
                if let Some(cycle) = dfs(child, successors, visited, rec_stack) {
                    return Some(cycle);
                }
            }
        }

        rec_stack.pop();
        None
    }

    for name in nodes {
        if !visited.contains(name) {
            if let Some(cycle) = dfs(name, successors, &mut visited, &mut rec_stack) {
                return Some(cycle);
            }
        }
    }

    None
}
