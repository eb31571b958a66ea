use crate::ir::{Function, Module, Node, Tensor};
use crate::optimizer::{OptimizerError, Pass, PassContext};

/// Folds a constant output scale into convolution weights:
/// `multiply(nn.conv2d(x, W), c)` becomes `nn.conv2d(x, W')` with
/// `W'[o] = W[o] * c[o]`. The scale must be a scalar or one value per
/// output channel (leading weight axis), and the convolution result may
/// have no other consumer. Runs after constant folding so already-folded
/// scales are visible.
pub struct FoldScaleAxis;

impl Pass for FoldScaleAxis {
    fn name(&self) -> &'static str {
        "FoldScaleAxis"
    }

    fn run(&self, module: &mut Module, _cx: &PassContext) -> Result<(), OptimizerError> {
        for func in module.functions.values_mut() {
            while fold_once(func) {}
            func.prune();
        }
        Ok(())
    }
}

fn use_count(func: &Function, id: &str) -> usize {
    let mut count = func
        .nodes
        .iter()
        .flat_map(|n| n.inputs.iter())
        .filter(|input| *input == id)
        .count();
    if func.output == id {
        count += 1;
    }
    count
}

/// The per-output-channel scale vector, if the tensor is usable as one.
fn channel_scale(scale: &Tensor, out_channels: usize) -> Option<Vec<f32>> {
    let values = scale.f32s()?;
    if values.len() == 1 {
        return Some(vec![values[0]; out_channels]);
    }
    let dense_dims = scale.shape.iter().filter(|&&d| d > 1).count();
    if values.len() == out_channels && dense_dims <= 1 {
        return Some(values);
    }
    None
}

fn fold_once(func: &mut Function) -> bool {
    for i in 0..func.nodes.len() {
        let node = &func.nodes[i];
        if node.op != "multiply" || node.inputs.len() != 2 {
            continue;
        }
        let conv_side = node.inputs.iter().position(|id| {
            func.node(id).map(|n| n.op == "nn.conv2d" && n.inputs.len() == 2) == Some(true)
        });
        let Some(conv_side) = conv_side else {
            continue;
        };
        let conv_id = node.inputs[conv_side].clone();
        let scale_id = node.inputs[1 - conv_side].clone();
        if use_count(func, &conv_id) != 1 {
            continue;
        }

        let Some(scale) = func.const_value(&scale_id) else {
            continue;
        };
        let Some(conv) = func.node(&conv_id) else {
            continue;
        };
        let weight_id = conv.inputs[1].clone();
        let Some(weight) = func.const_value(&weight_id) else {
            continue;
        };
        let Some(&out_channels) = weight.shape.first() else {
            continue;
        };
        let Some(per_channel) = channel_scale(scale, out_channels) else {
            continue;
        };
        let Some(weight_values) = weight.f32s() else {
            continue;
        };
        if out_channels == 0 || weight_values.len() % out_channels != 0 {
            continue;
        }

        let per_filter = weight_values.len() / out_channels;
        let scaled: Vec<f32> = weight_values
            .iter()
            .enumerate()
            .map(|(flat, w)| w * per_channel[flat / per_filter])
            .collect();
        let new_weight = Tensor::from_f32s(weight.shape.clone(), &scaled);

        let mul_id = func.nodes[i].id.clone();
        let conv_index = func
            .nodes
            .iter()
            .position(|n| n.id == conv_id)
            .unwrap_or(i);
        let new_weight_id = func.fresh_id(&format!("{weight_id}.scaled"));
        func.nodes
            .insert(conv_index, Node::constant(new_weight_id.clone(), new_weight));
        if let Some(conv) = func.nodes.iter_mut().find(|n| n.id == conv_id) {
            conv.inputs[1] = new_weight_id;
        }
        func.nodes.retain(|n| n.id != mul_id);
        func.replace_uses(&mul_id, &conv_id);
        return true;
    }
    false
}
