use std::collections::HashSet;

use crate::ir::{Module, ENTRY_FUNCTION};
use crate::optimizer::{OptimizerError, Pass, PassContext};

/// Drops every function unreachable from the entry function through call
/// nodes.
pub struct RemoveUnusedFunctions;

impl Pass for RemoveUnusedFunctions {
    fn name(&self) -> &'static str {
        "RemoveUnusedFunctions"
    }

    fn run(&self, module: &mut Module, _cx: &PassContext) -> Result<(), OptimizerError> {
        if !module.functions.contains_key(ENTRY_FUNCTION) {
            return Ok(());
        }
        let mut reachable: HashSet<String> = HashSet::new();
        let mut stack = vec![ENTRY_FUNCTION.to_string()];
        while let Some(name) = stack.pop() {
            if !reachable.insert(name.clone()) {
                continue;
            }
            if let Some(func) = module.functions.get(&name) {
                for node in &func.nodes {
                    if let Some(callee) = &node.callee {
                        stack.push(callee.clone());
                    }
                }
            }
        }
        module.functions.retain(|name, _| reachable.contains(name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::text::parse_module;

    #[test]
    fn unused_helper_is_removed() {
        let mut module = parse_module(
            "def @main(%x: f32[1]) {\n  %x\n}\n\
             def @helper(%a: f32[1]) {\n  %a\n}\n",
        )
        .unwrap();

        RemoveUnusedFunctions
            .run(&mut module, &PassContext::highest())
            .unwrap();
        assert_eq!(module.functions.len(), 1);
        assert!(module.entry().is_some());
    }

    #[test]
    fn transitively_called_functions_survive() {
        let mut module = parse_module(
            "def @main(%x: f32[1]) {\n  %0 = call @a(%x)\n  %0\n}\n\
             def @a(%x: f32[1]) {\n  %0 = call @b(%x)\n  %0\n}\n\
             def @b(%x: f32[1]) {\n  %x\n}\n\
             def @dead(%x: f32[1]) {\n  %x\n}\n",
        )
        .unwrap();

        RemoveUnusedFunctions
            .run(&mut module, &PassContext::highest())
            .unwrap();
        assert_eq!(module.functions.len(), 3);
        assert!(!module.functions.contains_key("dead"));
    }
}
