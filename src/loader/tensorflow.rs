//! TensorFlow GraphDef importer.
//!
//! Loading is three separate steps: decode the protobuf, validate the graph
//! against a throwaway name index (the index is dropped once validation
//! passes), then convert node by node into an IR function plus a parameter
//! table. Placeholders become function params shaped by the shape
//! dictionary; `Const` nodes become params with a matching table entry so
//! the driver can bind them.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use log::debug;
use prost::Message;

use crate::ir::{
    DataType, Function, Module, Node, Param, Tensor, ENTRY_FUNCTION,
};
use crate::loader::tf_proto::{self, attr_value, GraphDef, NodeDef, TensorProto};
use crate::loader::{LoaderError, Params, ShapeDict};

pub fn load(path: &Path, shapes: &ShapeDict) -> Result<(Module, Params), LoaderError> {
    let bytes = fs::read(path)?;
    let graph =
        GraphDef::decode(bytes.as_slice()).map_err(|e| LoaderError::GraphImport(e.to_string()))?;
    debug!("decoded GraphDef with {} node(s)", graph.node.len());
    validate_graph(&graph)?;
    convert(&graph, shapes)
}

/// Checks structural well-formedness of a decoded graph: node names are
/// unique and every input reference resolves. The index built here is
/// discarded; conversion re-derives what it needs.
fn validate_graph(graph: &GraphDef) -> Result<(), LoaderError> {
    if graph.node.is_empty() {
        return Err(LoaderError::GraphImport("graph has no nodes".to_string()));
    }
    let mut index: HashSet<&str> = HashSet::with_capacity(graph.node.len());
    for node in &graph.node {
        if !index.insert(node.name.as_str()) {
            return Err(LoaderError::GraphImport(format!(
                "duplicate node name `{}`",
                node.name
            )));
        }
    }
    for node in &graph.node {
        for input in &node.input {
            let referenced = referenced_node(input);
            if !index.contains(referenced) {
                return Err(LoaderError::GraphImport(format!(
                    "node `{}` references undefined input `{}`",
                    node.name, input
                )));
            }
        }
    }
    Ok(())
}

/// The producing node of an input reference: strips the `^` control-dep
/// marker and any `:N` output-port suffix.
fn referenced_node(input: &str) -> &str {
    let name = input.strip_prefix('^').unwrap_or(input);
    match name.rfind(':') {
        Some(i) if name[i + 1..].chars().all(|c| c.is_ascii_digit()) => &name[..i],
        _ => name,
    }
}

/// Data inputs only; control dependencies carry no value.
fn data_inputs(node: &NodeDef) -> impl Iterator<Item = &str> {
    node.input
        .iter()
        .filter(|i| !i.starts_with('^'))
        .map(|i| referenced_node(i))
}

/// TF node names may contain `/` and other characters the textual IR does
/// not accept as value names.
fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let all_digits = out.chars().all(|c| c.is_ascii_digit());
    if !all_digits && out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn attr<'a>(node: &'a NodeDef, key: &str) -> Option<&'a attr_value::Value> {
    node.attr.get(key).and_then(|a| a.value.as_ref())
}

fn attr_string(node: &NodeDef, key: &str) -> Option<String> {
    match attr(node, key) {
        Some(attr_value::Value::S(bytes)) => String::from_utf8(bytes.clone()).ok(),
        _ => None,
    }
}

fn attr_float(node: &NodeDef, key: &str) -> Option<f32> {
    match attr(node, key) {
        Some(attr_value::Value::F(v)) => Some(*v),
        _ => None,
    }
}

fn attr_int_list(node: &NodeDef, key: &str) -> Option<Vec<i64>> {
    match attr(node, key) {
        Some(attr_value::Value::List(list)) => Some(list.i.clone()),
        _ => None,
    }
}

fn attr_bool(node: &NodeDef, key: &str) -> Option<bool> {
    match attr(node, key) {
        Some(attr_value::Value::B(v)) => Some(*v),
        _ => None,
    }
}

fn ir_dtype(raw: i32, context: &str) -> Result<DataType, LoaderError> {
    match tf_proto::DataType::try_from(raw) {
        Ok(tf_proto::DataType::DtFloat) => Ok(DataType::F32),
        Ok(tf_proto::DataType::DtDouble) => Ok(DataType::F64),
        Ok(tf_proto::DataType::DtInt32) => Ok(DataType::I32),
        Ok(tf_proto::DataType::DtInt64) => Ok(DataType::I64),
        Ok(tf_proto::DataType::DtUint8) => Ok(DataType::U8),
        _ => Err(LoaderError::Conversion(format!(
            "unsupported dtype {raw} on {context}"
        ))),
    }
}

fn tensor_from_proto(proto: &TensorProto, context: &str) -> Result<Tensor, LoaderError> {
    let data_type = ir_dtype(proto.dtype, context)?;
    let mut shape = Vec::new();
    if let Some(ts) = &proto.tensor_shape {
        if ts.unknown_rank {
            return Err(LoaderError::Conversion(format!(
                "constant {context} has unknown rank"
            )));
        }
        for dim in &ts.dim {
            if dim.size < 0 {
                return Err(LoaderError::Conversion(format!(
                    "constant {context} has dynamic dimension"
                )));
            }
            shape.push(dim.size as usize);
        }
    }
    let expected: usize = shape.iter().product();

    if !proto.tensor_content.is_empty() {
        if proto.tensor_content.len() != expected * data_type.size_of() {
            return Err(LoaderError::Conversion(format!(
                "constant {context}: payload is {} byte(s), expected {}",
                proto.tensor_content.len(),
                expected * data_type.size_of()
            )));
        }
        return Ok(Tensor {
            data_type,
            shape,
            data: proto.tensor_content.clone(),
        });
    }

    // Typed value lists; a single entry splats across the whole shape.
    let mut data = Vec::with_capacity(expected * data_type.size_of());
    let given = match data_type {
        DataType::F32 => proto.float_val.len(),
        DataType::F64 => proto.double_val.len(),
        DataType::I32 | DataType::U8 => proto.int_val.len(),
        DataType::I64 => proto.int64_val.len(),
    };
    if given != expected && !(given == 1 && expected >= 1) {
        return Err(LoaderError::Conversion(format!(
            "constant {context}: {given} value(s) for {expected} element(s)"
        )));
    }
    for i in 0..expected {
        let j = if given == 1 { 0 } else { i };
        match data_type {
            DataType::F32 => data.extend_from_slice(&proto.float_val[j].to_le_bytes()),
            DataType::F64 => data.extend_from_slice(&proto.double_val[j].to_le_bytes()),
            DataType::I32 => data.extend_from_slice(&proto.int_val[j].to_le_bytes()),
            DataType::I64 => data.extend_from_slice(&proto.int64_val[j].to_le_bytes()),
            DataType::U8 => data.push(proto.int_val[j] as u8),
        }
    }
    Ok(Tensor {
        data_type,
        shape,
        data,
    })
}

fn placeholder_shape(node: &NodeDef, shapes: &ShapeDict) -> Result<Vec<usize>, LoaderError> {
    if let Some((_, dims)) = shapes.iter().find(|(name, _)| name == &node.name) {
        return Ok(dims.clone());
    }
    if let Some(attr_value::Value::Shape(shape)) = attr(node, "shape") {
        if !shape.unknown_rank && shape.dim.iter().all(|d| d.size > 0) {
            return Ok(shape.dim.iter().map(|d| d.size as usize).collect());
        }
    }
    Err(LoaderError::Conversion(format!(
        "input `{}` has no static shape; provide one via the shape dictionary",
        node.name
    )))
}

/// Orders computation nodes so every data input is defined first.
fn topo_order<'a>(compute: &[&'a NodeDef]) -> Result<Vec<&'a NodeDef>, LoaderError> {
    let names: HashSet<&str> = compute.iter().map(|n| n.name.as_str()).collect();
    let mut pending: HashMap<&str, usize> = HashMap::new();
    let mut consumers: HashMap<&str, Vec<&NodeDef>> = HashMap::new();
    for node in compute {
        let deps = data_inputs(node).filter(|i| names.contains(i)).count();
        pending.insert(node.name.as_str(), deps);
        for input in data_inputs(node).filter(|i| names.contains(i)) {
            consumers.entry(input).or_default().push(node);
        }
    }

    let mut ready: Vec<&NodeDef> = compute
        .iter()
        .copied()
        .filter(|n| pending.get(n.name.as_str()) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(compute.len());
    let mut next = 0;
    while next < ready.len() {
        let node = ready[next];
        next += 1;
        order.push(node);
        if let Some(users) = consumers.get(node.name.as_str()) {
            for user in users {
                if let Some(count) = pending.get_mut(user.name.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(user);
                    }
                }
            }
        }
    }
    if order.len() != compute.len() {
        return Err(LoaderError::Conversion(
            "graph contains a cycle".to_string(),
        ));
    }
    Ok(order)
}

fn convert(graph: &GraphDef, shapes: &ShapeDict) -> Result<(Module, Params), LoaderError> {
    let mut func = Function::default();
    let mut table = Params::new();
    let by_name: HashMap<&str, &NodeDef> =
        graph.node.iter().map(|n| (n.name.as_str(), n)).collect();

    let mut compute = Vec::new();
    for node in &graph.node {
        match node.op.as_str() {
            "Placeholder" | "PlaceholderV2" => {
                let dtype = match attr(node, "dtype") {
                    Some(attr_value::Value::Type(t)) => ir_dtype(*t, &node.name)?,
                    _ => DataType::F32,
                };
                func.params.push(Param {
                    name: sanitize(&node.name),
                    data_type: dtype,
                    shape: placeholder_shape(node, shapes)?,
                });
            }
            "Const" => {
                let Some(attr_value::Value::Tensor(proto)) = attr(node, "value") else {
                    return Err(LoaderError::Conversion(format!(
                        "Const node `{}` has no value",
                        node.name
                    )));
                };
                let tensor = tensor_from_proto(proto, &node.name)?;
                func.params.push(Param {
                    name: sanitize(&node.name),
                    data_type: tensor.data_type,
                    shape: tensor.shape.clone(),
                });
                table.insert(sanitize(&node.name), tensor);
            }
            _ => compute.push(node),
        }
    }

    for node in topo_order(&compute)? {
        func.nodes.push(convert_op(node, &by_name)?);
    }

    // The graph output is the last computation node nothing else consumes.
    // Placeholders and Consts are never candidates; a stray unconsumed
    // weight declared after the final op must not shadow the real result.
    let consumed: HashSet<&str> = graph.node.iter().flat_map(data_inputs).collect();
    let output = compute
        .iter()
        .rev()
        .find(|n| !consumed.contains(n.name.as_str()))
        .ok_or_else(|| LoaderError::Conversion("graph has no output".to_string()))?;
    func.output = sanitize(&output.name);

    let mut module = Module::new();
    module.functions.insert(ENTRY_FUNCTION.to_string(), func);
    Ok((module, table))
}

fn convert_op(
    node: &NodeDef,
    by_name: &HashMap<&str, &NodeDef>,
) -> Result<Node, LoaderError> {
    use crate::ir::Attribute;

    let id = sanitize(&node.name);
    let inputs: Vec<String> = data_inputs(node).map(sanitize).collect();
    let channel_axis = |node: &NodeDef| -> i64 {
        match attr_string(node, "data_format").as_deref() {
            Some("NCHW") => 1,
            _ => 3,
        }
    };

    let ir = match node.op.as_str() {
        "Identity" | "StopGradient" => Node::new(id, "identity", inputs),
        "Add" | "AddV2" => Node::new(id, "add", inputs),
        "Sub" => Node::new(id, "subtract", inputs),
        "Mul" => Node::new(id, "multiply", inputs),
        "Div" | "RealDiv" => Node::new(id, "divide", inputs),
        "Relu" => Node::new(id, "nn.relu", inputs),
        "Softmax" => Node::new(id, "nn.softmax", inputs),
        "BiasAdd" => {
            let axis = channel_axis(node);
            let mut n = Node::new(id, "nn.bias_add", inputs);
            n.attrs.insert("axis".to_string(), Attribute::Int(axis));
            n
        }
        "Conv2D" => {
            let mut n = Node::new(id, "nn.conv2d", inputs);
            if let Some(strides) = attr_int_list(node, "strides") {
                n.attrs.insert("strides".to_string(), Attribute::Ints(strides));
            }
            if let Some(padding) = attr_string(node, "padding") {
                n.attrs.insert("padding".to_string(), Attribute::String(padding));
            }
            if let Some(layout) = attr_string(node, "data_format") {
                n.attrs.insert("layout".to_string(), Attribute::String(layout));
            }
            n
        }
        "MatMul" => {
            let mut n = Node::new(id, "nn.matmul", inputs);
            n.attrs.insert(
                "transpose_a".to_string(),
                Attribute::Int(attr_bool(node, "transpose_a").unwrap_or(false) as i64),
            );
            n.attrs.insert(
                "transpose_b".to_string(),
                Attribute::Int(attr_bool(node, "transpose_b").unwrap_or(false) as i64),
            );
            n
        }
        "MaxPool" | "AvgPool" => {
            let op = if node.op == "MaxPool" {
                "nn.max_pool2d"
            } else {
                "nn.avg_pool2d"
            };
            let mut n = Node::new(id, op, inputs);
            if let Some(ksize) = attr_int_list(node, "ksize") {
                n.attrs.insert("pool_size".to_string(), Attribute::Ints(ksize));
            }
            if let Some(strides) = attr_int_list(node, "strides") {
                n.attrs.insert("strides".to_string(), Attribute::Ints(strides));
            }
            if let Some(padding) = attr_string(node, "padding") {
                n.attrs.insert("padding".to_string(), Attribute::String(padding));
            }
            n
        }
        "FusedBatchNorm" | "FusedBatchNormV3" => {
            let mut n = Node::new(id, "nn.batch_norm", inputs);
            n.attrs.insert(
                "epsilon".to_string(),
                Attribute::Float(attr_float(node, "epsilon").unwrap_or(1e-5)),
            );
            n.attrs
                .insert("axis".to_string(), Attribute::Int(channel_axis(node)));
            n
        }
        "Reshape" => {
            // The target shape must be a Const companion node; it folds into
            // an attribute and the extra input is dropped.
            let shape_input = node
                .input
                .iter()
                .filter(|i| !i.starts_with('^'))
                .nth(1)
                .map(|i| referenced_node(i))
                .ok_or_else(|| {
                    LoaderError::Conversion(format!("Reshape `{}` lacks a shape input", node.name))
                })?;
            let shape_node = by_name.get(shape_input).copied().ok_or_else(|| {
                LoaderError::Conversion(format!(
                    "Reshape `{}` shape input `{shape_input}` not found",
                    node.name
                ))
            })?;
            let Some(attr_value::Value::Tensor(proto)) = attr(shape_node, "value") else {
                return Err(LoaderError::Conversion(format!(
                    "Reshape `{}` has a dynamic shape input",
                    node.name
                )));
            };
            let tensor = tensor_from_proto(proto, shape_input)?;
            let dims: Vec<i64> = match tensor.data_type {
                DataType::I64 => tensor.i64s().unwrap_or_default(),
                DataType::I32 => tensor
                    .data
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                    .collect(),
                _ => {
                    return Err(LoaderError::Conversion(format!(
                        "Reshape `{}` shape input has a non-integer dtype",
                        node.name
                    )))
                }
            };
            let mut n = Node::new(id, "reshape", inputs.into_iter().take(1).collect());
            n.attrs.insert("newshape".to_string(), Attribute::Ints(dims));
            n
        }
        other => {
            return Err(LoaderError::Conversion(format!(
                "unsupported operator `{other}` (node `{}`)",
                node.name
            )))
        }
    };
    Ok(ir)
}
