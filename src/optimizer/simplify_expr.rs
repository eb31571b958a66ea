use crate::ir::{Attribute, Function, Module};
use crate::optimizer::{OptimizerError, Pass, PassContext};

/// Local algebraic rewrites:
///
/// - `identity(x)` forwards to `x`;
/// - `add`/`subtract` with a scalar constant 0 and `multiply`/`divide` with
///   a scalar constant 1 forward their other operand;
/// - a `transpose` of a `transpose` whose permutations compose to the
///   identity forwards the original value;
/// - a `reshape` of a `reshape` reads through to the innermost input.
pub struct SimplifyExpr;

impl Pass for SimplifyExpr {
    fn name(&self) -> &'static str {
        "SimplifyExpr"
    }

    fn run(&self, module: &mut Module, _cx: &PassContext) -> Result<(), OptimizerError> {
        for func in module.functions.values_mut() {
            while simplify_once(func) {}
            func.prune();
        }
        Ok(())
    }
}

fn is_scalar_const(func: &Function, id: &str, expected: f32) -> bool {
    match func.const_value(id).and_then(|t| t.f32s()) {
        Some(values) => values.len() == 1 && values[0] == expected,
        None => false,
    }
}

/// For `op(a, b)` with `b` the neutral element (or `a` when commutative),
/// the surviving operand.
fn forwarded_operand(
    func: &Function,
    inputs: &[String],
    neutral: f32,
    commutative: bool,
) -> Option<String> {
    if inputs.len() != 2 {
        return None;
    }
    if is_scalar_const(func, &inputs[1], neutral) {
        return Some(inputs[0].clone());
    }
    if commutative && is_scalar_const(func, &inputs[0], neutral) {
        return Some(inputs[1].clone());
    }
    None
}

fn perm_of(func: &Function, id: &str) -> Option<Vec<i64>> {
    let node = func.node(id)?;
    if node.op != "transpose" {
        return None;
    }
    match node.attrs.get("perm") {
        Some(Attribute::Ints(p)) => Some(p.clone()),
        _ => None,
    }
}

enum Step {
    /// Remove the node and rewire its uses to the named value.
    Forward(String),
    /// Keep the node but read its first input through to the named value.
    ReadThrough(String),
}

fn find_step(func: &Function, node: &crate::ir::Node) -> Option<Step> {
    match node.op.as_str() {
        "identity" if node.inputs.len() == 1 => Some(Step::Forward(node.inputs[0].clone())),
        "add" => forwarded_operand(func, &node.inputs, 0.0, true).map(Step::Forward),
        "subtract" => forwarded_operand(func, &node.inputs, 0.0, false).map(Step::Forward),
        "multiply" => forwarded_operand(func, &node.inputs, 1.0, true).map(Step::Forward),
        "divide" => forwarded_operand(func, &node.inputs, 1.0, false).map(Step::Forward),
        "transpose" => {
            let outer = match node.attrs.get("perm") {
                Some(Attribute::Ints(p)) => p.clone(),
                _ => return None,
            };
            let inner_node = node.inputs.first().and_then(|id| func.node(id))?;
            let inner = node.inputs.first().and_then(|id| perm_of(func, id))?;
            let identity = inner.len() == outer.len()
                && outer
                    .iter()
                    .enumerate()
                    .all(|(axis, &o)| inner.get(o as usize).copied() == Some(axis as i64));
            if identity {
                inner_node.inputs.first().cloned().map(Step::Forward)
            } else {
                None
            }
        }
        "reshape" => {
            let inner = node.inputs.first().and_then(|id| func.node(id))?;
            if inner.op == "reshape" {
                inner.inputs.first().cloned().map(Step::ReadThrough)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn simplify_once(func: &mut Function) -> bool {
    let mut action = None;
    for (i, node) in func.nodes.iter().enumerate() {
        if let Some(step) = find_step(func, node) {
            action = Some((i, step));
            break;
        }
    }
    match action {
        Some((i, Step::Forward(target))) => {
            let id = func.nodes[i].id.clone();
            func.nodes.remove(i);
            func.replace_uses(&id, &target);
            true
        }
        Some((i, Step::ReadThrough(src))) => {
            func.nodes[i].inputs[0] = src;
            true
        }
        None => false,
    }
}
