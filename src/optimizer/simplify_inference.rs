use crate::ir::{Attribute, Function, Module, Node, Tensor};
use crate::optimizer::{OptimizerError, Pass, PassContext};

/// Rewrites training-only constructs into their inference form:
///
/// - `nn.dropout` is the identity at inference time and disappears;
/// - `nn.batch_norm` with constant statistics becomes a per-channel
///   multiply/add by precomputed scale and shift.
pub struct SimplifyInference;

impl Pass for SimplifyInference {
    fn name(&self) -> &'static str {
        "SimplifyInference"
    }

    fn run(&self, module: &mut Module, _cx: &PassContext) -> Result<(), OptimizerError> {
        for func in module.functions.values_mut() {
            drop_dropout(func);
            lower_batch_norm(func, self.name())?;
            func.prune();
        }
        Ok(())
    }
}

fn drop_dropout(func: &mut Function) {
    let mut i = 0;
    while i < func.nodes.len() {
        if func.nodes[i].op == "nn.dropout" && !func.nodes[i].inputs.is_empty() {
            let id = func.nodes[i].id.clone();
            let src = func.nodes[i].inputs[0].clone();
            func.nodes.remove(i);
            func.replace_uses(&id, &src);
        } else {
            i += 1;
        }
    }
}

fn lower_batch_norm(func: &mut Function, pass: &str) -> Result<(), OptimizerError> {
    let mut i = 0;
    while i < func.nodes.len() {
        let node = &func.nodes[i];
        if node.op != "nn.batch_norm" || node.inputs.len() != 5 {
            i += 1;
            continue;
        }
        // inputs: data, gamma, beta, moving mean, moving variance
        let stats: Option<Vec<Vec<f32>>> = node.inputs[1..]
            .iter()
            .map(|id| func.const_value(id).and_then(|t| t.f32s()))
            .collect();
        let Some(stats) = stats else {
            // Statistics still flow in as free variables; nothing to fold.
            i += 1;
            continue;
        };
        let (gamma, beta, mean, var) = (&stats[0], &stats[1], &stats[2], &stats[3]);
        let channels = gamma.len();
        if beta.len() != channels || mean.len() != channels || var.len() != channels {
            return Err(OptimizerError::failure(
                pass,
                format!(
                    "batch_norm `%{}` has mismatched statistics lengths",
                    func.nodes[i].id
                ),
            ));
        }

        let node = func.nodes[i].clone();
        let epsilon = match node.attrs.get("epsilon") {
            Some(Attribute::Float(v)) => *v,
            _ => 1e-5,
        };
        let axis = match node.attrs.get("axis") {
            Some(Attribute::Int(v)) => *v,
            _ => 1,
        };

        let scale: Vec<f32> = gamma
            .iter()
            .zip(var)
            .map(|(g, v)| g / (v + epsilon).sqrt())
            .collect();
        let shift: Vec<f32> = beta
            .iter()
            .zip(mean)
            .zip(&scale)
            .map(|((b, m), s)| b - m * s)
            .collect();
        if scale.iter().chain(&shift).any(|v| !v.is_finite()) {
            i += 1;
            continue;
        }

        let scale_id = func.fresh_id(&format!("{}.scale", node.id));
        func.nodes.insert(
            i,
            Node::constant(scale_id.clone(), Tensor::from_f32s(vec![channels], &scale)),
        );
        let mul_id = func.fresh_id(&format!("{}.scaled", node.id));
        let mut mul = Node::new(
            mul_id.clone(),
            "multiply",
            vec![node.inputs[0].clone(), scale_id],
        );
        mul.attrs.insert("axis".to_string(), Attribute::Int(axis));
        func.nodes.insert(i + 1, mul);
        let shift_id = func.fresh_id(&format!("{}.shift", node.id));
        func.nodes.insert(
            i + 2,
            Node::constant(shift_id.clone(), Tensor::from_f32s(vec![channels], &shift)),
        );

        let rewritten = &mut func.nodes[i + 3];
        rewritten.op = "add".to_string();
        rewritten.inputs = vec![mul_id, shift_id];
        rewritten.attrs.clear();
        rewritten
            .attrs
            .insert("axis".to_string(), Attribute::Int(axis));
        rewritten.value = None;
        i += 4;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::text::{parse_module, print_module};

    const BN: &str = "def @main(%x: f32[1,2,4,4]) {\n\
        \x20 %g = const f32[2] [1.0, 2.0]\n\
        \x20 %b = const f32[2] [0.5, 0.5]\n\
        \x20 %m = const f32[2] [0.0, 0.0]\n\
        \x20 %v = const f32[2] [1.0, 1.0]\n\
        \x20 %0 = nn.batch_norm(%x, %g, %b, %m, %v) {axis=1, epsilon=0.0}\n\
        \x20 %0\n}\n";

    #[test]
    fn batch_norm_becomes_scale_and_shift() {
        let mut module = parse_module(BN).unwrap();
        SimplifyInference
            .run(&mut module, &PassContext::highest())
            .unwrap();

        let main = module.entry().unwrap();
        assert!(main.nodes.iter().all(|n| n.op != "nn.batch_norm"));
        let add = main.node("0").unwrap();
        assert_eq!(add.op, "add");
        let mul = main.node(&add.inputs[0]).unwrap();
        assert_eq!(mul.op, "multiply");
        // epsilon = 0, var = 1: scale is gamma itself
        let scale = main.const_value(&mul.inputs[1]).unwrap();
        assert_eq!(scale.f32s(), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn dropout_is_removed() {
        let src = "def @main(%x: f32[1]) {\n  %0 = nn.dropout(%x)\n  %1 = nn.relu(%0)\n  %1\n}\n";
        let mut module = parse_module(src).unwrap();
        SimplifyInference
            .run(&mut module, &PassContext::highest())
            .unwrap();

        let main = module.entry().unwrap();
        assert_eq!(main.nodes.len(), 1);
        assert_eq!(main.node("1").unwrap().inputs, vec!["x".to_string()]);
    }

    #[test]
    fn non_constant_statistics_are_left_alone() {
        let src = "def @main(%x: f32[1,2], %g: f32[2], %b: f32[2], %m: f32[2], %v: f32[2]) {\n\
            \x20 %0 = nn.batch_norm(%x, %g, %b, %m, %v)\n  %0\n}\n";
        let mut module = parse_module(src).unwrap();
        let before = print_module(&module);
        SimplifyInference
            .run(&mut module, &PassContext::highest())
            .unwrap();
        assert_eq!(before, print_module(&module));
    }

    #[test]
    fn pass_is_idempotent() {
        let mut once = parse_module(BN).unwrap();
        SimplifyInference
            .run(&mut once, &PassContext::highest())
            .unwrap();
        let mut twice = once.clone();
        SimplifyInference
            .run(&mut twice, &PassContext::highest())
            .unwrap();
        assert_eq!(print_module(&once), print_module(&twice));
    }
}
