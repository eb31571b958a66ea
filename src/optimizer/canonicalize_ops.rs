use crate::ir::Module;
use crate::optimizer::{OptimizerError, Pass, PassContext};

/// Rewrites convenience operators into their canonical form so later
/// consumers only ever see one spelling: `nn.bias_add(x, b)` becomes a
/// broadcast `add` (the channel axis attribute is kept as the broadcast
/// hint).
pub struct CanonicalizeOps;

impl Pass for CanonicalizeOps {
    fn name(&self) -> &'static str {
        "CanonicalizeOps"
    }

    fn run(&self, module: &mut Module, _cx: &PassContext) -> Result<(), OptimizerError> {
        for func in module.functions.values_mut() {
            for node in &mut func.nodes {
                if node.op == "nn.bias_add" && node.inputs.len() == 2 {
                    node.op = "add".to_string();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::text::{parse_module, print_module};

    #[test]
    fn bias_add_becomes_add() {
        let src = "def @main(%x: f32[1,4,4,8], %b: f32[8]) {\n\
            \x20 %0 = nn.bias_add(%x, %b) {axis=3}\n\
            \x20 %0\n}\n";
        let mut module = parse_module(src).unwrap();
        CanonicalizeOps
            .run(&mut module, &PassContext::highest())
            .unwrap();

        let node = module.entry().unwrap().node("0").unwrap().clone();
        assert_eq!(node.op, "add");
        assert_eq!(node.inputs.len(), 2);
        assert!(node.attrs.contains_key("axis"));
    }

    #[test]
    fn pass_is_idempotent() {
        let src = "def @main(%x: f32[1,4,4,8], %b: f32[8]) {\n\
            \x20 %0 = nn.bias_add(%x, %b) {axis=3}\n\
            \x20 %0\n}\n";
        let mut once = parse_module(src).unwrap();
        CanonicalizeOps.run(&mut once, &PassContext::highest()).unwrap();
        let mut twice = once.clone();
        CanonicalizeOps.run(&mut twice, &PassContext::highest()).unwrap();
        assert_eq!(print_module(&once), print_module(&twice));
    }
}
