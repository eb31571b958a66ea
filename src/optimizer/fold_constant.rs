use crate::ir::{Attribute, Function, Module, Node, Tensor};
use crate::optimizer::{OptimizerError, Pass, PassContext};

/// Evaluates nodes whose inputs are all constants and replaces them with
/// embedded constant nodes. Covers f32 elementwise arithmetic (with scalar
/// broadcast), a few unary ops, `transpose` and `reshape`; anything else is
/// left in place.
pub struct FoldConstant;

impl Pass for FoldConstant {
    fn name(&self) -> &'static str {
        "FoldConstant"
    }

    fn run(&self, module: &mut Module, _cx: &PassContext) -> Result<(), OptimizerError> {
        for func in module.functions.values_mut() {
            let mut i = 0;
            while i < func.nodes.len() {
                if let Some(folded) = try_fold(func, i) {
                    let id = func.nodes[i].id.clone();
                    func.nodes[i] = Node::constant(id, folded);
                }
                i += 1;
            }
            func.prune();
        }
        Ok(())
    }
}

fn try_fold(func: &Function, i: usize) -> Option<Tensor> {
    let node = &func.nodes[i];
    if node.is_const() || node.op == "call" {
        return None;
    }
    let operands: Option<Vec<&Tensor>> =
        node.inputs.iter().map(|id| func.const_value(id)).collect();
    let operands = operands?;

    match node.op.as_str() {
        "add" | "subtract" | "multiply" | "divide" if operands.len() == 2 => {
            fold_binary(&node.op, operands[0], operands[1])
        }
        "negative" if operands.len() == 1 => fold_unary(operands[0], |v| -v),
        "sqrt" if operands.len() == 1 => fold_unary(operands[0], f32::sqrt),
        "nn.relu" if operands.len() == 1 => fold_unary(operands[0], |v| v.max(0.0)),
        "transpose" if operands.len() == 1 => {
            let perm = match node.attrs.get("perm") {
                Some(Attribute::Ints(p)) => p.clone(),
                _ => {
                    let mut p: Vec<i64> = (0..operands[0].shape.len() as i64).collect();
                    p.reverse();
                    p
                }
            };
            fold_transpose(operands[0], &perm)
        }
        "reshape" if operands.len() == 1 => {
            let dims = match node.attrs.get("newshape") {
                Some(Attribute::Ints(d)) => d.clone(),
                _ => return None,
            };
            fold_reshape(operands[0], &dims)
        }
        _ => None,
    }
}

fn fold_unary(a: &Tensor, f: impl Fn(f32) -> f32) -> Option<Tensor> {
    let values: Vec<f32> = a.f32s()?.into_iter().map(f).collect();
    // Non-finite results have no textual literal; leave those at runtime.
    if values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(Tensor::from_f32s(a.shape.clone(), &values))
}

fn fold_binary(op: &str, a: &Tensor, b: &Tensor) -> Option<Tensor> {
    let av = a.f32s()?;
    let bv = b.f32s()?;
    let (len, shape) = if av.len() == bv.len() {
        (av.len(), a.shape.clone())
    } else if bv.len() == 1 {
        (av.len(), a.shape.clone())
    } else if av.len() == 1 {
        (bv.len(), b.shape.clone())
    } else {
        return None;
    };

    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let x = av[if av.len() == 1 { 0 } else { i }];
        let y = bv[if bv.len() == 1 { 0 } else { i }];
        out.push(match op {
            "add" => x + y,
            "subtract" => x - y,
            "multiply" => x * y,
            _ => x / y,
        });
    }
    if out.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(Tensor::from_f32s(shape, &out))
}

fn fold_transpose(a: &Tensor, perm: &[i64]) -> Option<Tensor> {
    let rank = a.shape.len();
    if rank == 0 || perm.len() != rank {
        return None;
    }
    if perm.iter().any(|&p| p < 0 || p as usize >= rank) {
        return None;
    }
    let values = a.f32s()?;

    let mut out_shape = Vec::with_capacity(rank);
    for &p in perm {
        out_shape.push(a.shape[p as usize]);
    }

    let mut strides_in = vec![1usize; rank];
    let mut strides_out = vec![1usize; rank];
    for j in (0..rank - 1).rev() {
        strides_in[j] = strides_in[j + 1] * a.shape[j + 1];
        strides_out[j] = strides_out[j + 1] * out_shape[j + 1];
    }

    let mut out = vec![0.0f32; values.len()];
    for (flat, value) in values.iter().enumerate() {
        let mut remaining = flat;
        let mut coords = vec![0usize; rank];
        for (k, stride) in strides_in.iter().enumerate() {
            coords[k] = remaining / stride;
            remaining %= stride;
        }
        let mut idx = 0;
        for (k, &p) in perm.iter().enumerate() {
            idx += coords[p as usize] * strides_out[k];
        }
        out[idx] = *value;
    }
    Some(Tensor::from_f32s(out_shape, &out))
}

fn fold_reshape(a: &Tensor, dims: &[i64]) -> Option<Tensor> {
    let count = a.element_count();
    let mut shape = Vec::with_capacity(dims.len());
    let mut infer_at = None;
    let mut known = 1usize;
    for (i, &d) in dims.iter().enumerate() {
        match d {
            -1 if infer_at.is_none() => {
                infer_at = Some(i);
                shape.push(0);
            }
            d if d > 0 => {
                known *= d as usize;
                shape.push(d as usize);
            }
            _ => return None,
        }
    }
    if let Some(i) = infer_at {
        if known == 0 || count % known != 0 {
            return None;
        }
        shape[i] = count / known;
    } else if known != count {
        return None;
    }
    Some(Tensor {
        data_type: a.data_type,
        shape,
        data: a.data.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::text::{parse_module, print_module};

    fn run(src: &str) -> crate::ir::Module {
        let mut module = parse_module(src).unwrap();
        FoldConstant
            .run(&mut module, &PassContext::highest())
            .unwrap();
        module
    }

    #[test]
    fn constant_add_folds_to_a_single_constant() {
        let module = run(
            "def @main(%x: f32[1]) {\n\
             \x20 %0 = const f32[] 1.0\n\
             \x20 %1 = const f32[] 2.0\n\
             \x20 %2 = add(%0, %1)\n\
             \x20 %2\n}\n",
        );
        let main = module.entry().unwrap();
        assert_eq!(main.nodes.len(), 1);
        assert_eq!(
            main.const_value("2"),
            Some(&Tensor::scalar_f32(3.0))
        );
    }

    #[test]
    fn scalar_broadcast_folds() {
        let module = run(
            "def @main(%x: f32[1]) {\n\
             \x20 %0 = const f32[3] [1.0, 2.0, 3.0]\n\
             \x20 %1 = const f32[] 2.0\n\
             \x20 %2 = multiply(%0, %1)\n\
             \x20 %2\n}\n",
        );
        let folded = module.entry().unwrap().const_value("2").unwrap();
        assert_eq!(folded.f32s(), Some(vec![2.0, 4.0, 6.0]));
        assert_eq!(folded.shape, vec![3]);
    }

    #[test]
    fn transpose_of_constant_folds() {
        let module = run(
            "def @main(%x: f32[1]) {\n\
             \x20 %0 = const f32[2,3] [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]\n\
             \x20 %1 = transpose(%0) {perm=[1, 0]}\n\
             \x20 %1\n}\n",
        );
        let folded = module.entry().unwrap().const_value("1").unwrap();
        assert_eq!(folded.shape, vec![3, 2]);
        assert_eq!(folded.f32s(), Some(vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]));
    }

    #[test]
    fn reshape_with_inferred_dim_folds() {
        let module = run(
            "def @main(%x: f32[1]) {\n\
             \x20 %0 = const f32[2,3] [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]\n\
             \x20 %1 = reshape(%0) {newshape=[3, -1]}\n\
             \x20 %1\n}\n",
        );
        let folded = module.entry().unwrap().const_value("1").unwrap();
        assert_eq!(folded.shape, vec![3, 2]);
    }

    #[test]
    fn free_variables_block_folding() {
        let src = "def @main(%x: f32[1]) {\n\
             \x20 %0 = const f32[] 2.0\n\
             \x20 %1 = add(%x, %0)\n\
             \x20 %1\n}\n";
        let module = run(src);
        assert_eq!(module.entry().unwrap().nodes.len(), 2);
    }

    #[test]
    fn pass_is_idempotent() {
        let src = "def @main(%x: f32[1]) {\n\
             \x20 %0 = const f32[] 1.0\n\
             \x20 %1 = const f32[] 2.0\n\
             \x20 %2 = add(%0, %1)\n\
             \x20 %2\n}\n";
        let mut once = parse_module(src).unwrap();
        FoldConstant.run(&mut once, &PassContext::highest()).unwrap();
        let mut twice = once.clone();
        FoldConstant.run(&mut twice, &PassContext::highest()).unwrap();
        assert_eq!(print_module(&once), print_module(&twice));
    }
}
