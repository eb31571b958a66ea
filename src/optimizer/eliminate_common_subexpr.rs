use std::collections::HashMap;

use crate::ir::{Function, Module, Node};
use crate::optimizer::{OptimizerError, Pass, PassContext};

/// Collapses structurally identical nodes onto their first occurrence. Two
/// nodes match when op, inputs, attributes, callee and constant payload all
/// agree; later duplicates are rewired away and removed.
pub struct EliminateCommonSubexpr;

impl Pass for EliminateCommonSubexpr {
    fn name(&self) -> &'static str {
        "EliminateCommonSubexpr"
    }

    fn run(&self, module: &mut Module, _cx: &PassContext) -> Result<(), OptimizerError> {
        for func in module.functions.values_mut() {
            dedup(func);
        }
        Ok(())
    }
}

/// A structural key covering everything but the node id. Attributes are a
/// BTreeMap, so the debug form is deterministic.
fn structural_key(node: &Node) -> String {
    format!(
        "{:?}|{:?}|{:?}|{:?}|{:?}",
        node.op, node.inputs, node.attrs, node.callee, node.value
    )
}

fn dedup(func: &mut Function) {
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut replace: HashMap<String, String> = HashMap::new();
    let mut kept = Vec::with_capacity(func.nodes.len());

    for mut node in std::mem::take(&mut func.nodes) {
        // Apply earlier rewires first so chained duplicates collapse in one
        // sweep.
        for input in &mut node.inputs {
            if let Some(target) = replace.get(input) {
                *input = target.clone();
            }
        }
        let key = structural_key(&node);
        match seen.get(&key) {
            Some(first) => {
                replace.insert(node.id.clone(), first.clone());
            }
            None => {
                seen.insert(key, node.id.clone());
                kept.push(node);
            }
        }
    }
    func.nodes = kept;
    if let Some(target) = replace.get(&func.output) {
        func.output = target.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::text::{parse_module, print_module};

    #[test]
    fn duplicate_subexpressions_collapse() {
        let src = "def @main(%x: f32[1]) {\n\
            \x20 %0 = nn.relu(%x)\n\
            \x20 %1 = nn.relu(%x)\n\
            \x20 %2 = add(%0, %1)\n\
            \x20 %2\n}\n";
        let mut module = parse_module(src).unwrap();
        EliminateCommonSubexpr
            .run(&mut module, &PassContext::highest())
            .unwrap();

        let main = module.entry().unwrap();
        assert_eq!(main.nodes.len(), 2);
        assert_eq!(
            main.node("2").unwrap().inputs,
            vec!["0".to_string(), "0".to_string()]
        );
    }

    #[test]
    fn chained_duplicates_collapse_in_one_run() {
        let src = "def @main(%x: f32[1]) {\n\
            \x20 %0 = nn.relu(%x)\n\
            \x20 %1 = nn.relu(%x)\n\
            \x20 %2 = add(%0, %0)\n\
            \x20 %3 = add(%1, %1)\n\
            \x20 %4 = multiply(%2, %3)\n\
            \x20 %4\n}\n";
        let mut module = parse_module(src).unwrap();
        EliminateCommonSubexpr
            .run(&mut module, &PassContext::highest())
            .unwrap();
        assert_eq!(module.entry().unwrap().nodes.len(), 3);
    }

    #[test]
    fn differing_attrs_are_not_merged() {
        let src = "def @main(%x: f32[1]) {\n\
            \x20 %0 = nn.softmax(%x) {axis=1}\n\
            \x20 %1 = nn.softmax(%x) {axis=2}\n\
            \x20 %2 = add(%0, %1)\n\
            \x20 %2\n}\n";
        let mut module = parse_module(src).unwrap();
        EliminateCommonSubexpr
            .run(&mut module, &PassContext::highest())
            .unwrap();
        assert_eq!(module.entry().unwrap().nodes.len(), 3);
    }

    #[test]
    fn pass_is_idempotent() {
        let src = "def @main(%x: f32[1]) {\n\
            \x20 %0 = nn.relu(%x)\n\
            \x20 %1 = nn.relu(%x)\n\
            \x20 %2 = add(%0, %1)\n\
            \x20 %2\n}\n";
        let mut once = parse_module(src).unwrap();
        EliminateCommonSubexpr
            .run(&mut once, &PassContext::highest())
            .unwrap();
        let mut twice = once.clone();
        EliminateCommonSubexpr
            .run(&mut twice, &PassContext::highest())
            .unwrap();
        assert_eq!(print_module(&once), print_module(&twice));
    }
}
