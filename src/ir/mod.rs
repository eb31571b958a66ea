use std::collections::{BTreeMap, HashMap, HashSet};

pub mod text;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F32,
    F64,
    I32,
    I64,
    U8,
}

impl DataType {
    pub fn size_of(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
            DataType::U8 => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
        }
    }
}

/// A constant tensor value. `data` is raw little-endian bytes, `shape` is the
/// dimension list (empty for a scalar).
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub data_type: DataType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl Tensor {
    pub fn scalar_f32(v: f32) -> Self {
        Self {
            data_type: DataType::F32,
            shape: Vec::new(),
            data: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_f32s(shape: Vec<usize>, values: &[f32]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            data_type: DataType::F32,
            shape,
            data,
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Decodes the payload as f32 values; `None` if the dtype differs.
    pub fn f32s(&self) -> Option<Vec<f32>> {
        if self.data_type != DataType::F32 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    pub fn i64s(&self) -> Option<Vec<i64>> {
        if self.data_type != DataType::I64 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
}

/// A typed input of a function.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub data_type: DataType,
    pub shape: Vec<usize>,
}

/// One value definition inside a function body. Ops are identified by name
/// ("add", "nn.conv2d", ...); two ops are special-cased:
///
/// - `"const"` carries its tensor in `value` and takes no inputs;
/// - `"call"` invokes the global function named by `callee`.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub op: String,
    pub inputs: Vec<String>,
    pub attrs: BTreeMap<String, Attribute>,
    pub value: Option<Tensor>,
    pub callee: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, op: impl Into<String>, inputs: Vec<String>) -> Self {
        Self {
            id: id.into(),
            op: op.into(),
            inputs,
            attrs: BTreeMap::new(),
            value: None,
            callee: None,
        }
    }

    pub fn constant(id: impl Into<String>, value: Tensor) -> Self {
        Self {
            id: id.into(),
            op: "const".to_string(),
            inputs: Vec::new(),
            attrs: BTreeMap::new(),
            value: Some(value),
            callee: None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.op == "const"
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Function {
    pub params: Vec<Param>,
    pub nodes: Vec<Node>,
    pub output: String,
}

impl Function {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The constant tensor bound to `id`, if `id` names a const node.
    pub fn const_value(&self, id: &str) -> Option<&Tensor> {
        self.node(id)
            .filter(|n| n.is_const())
            .and_then(|n| n.value.as_ref())
    }

    /// Rewrites every use of `old` (node inputs and the function output) to
    /// `new`. Definitions keep their ids.
    pub fn replace_uses(&mut self, old: &str, new: &str) {
        for node in &mut self.nodes {
            for input in &mut node.inputs {
                if input == old {
                    *input = new.to_string();
                }
            }
        }
        if self.output == old {
            self.output = new.to_string();
        }
    }

    /// Drops nodes that no longer contribute to the output. Runs to a fixed
    /// point so chains of dead nodes disappear in one call.
    pub fn prune(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            let mut used: HashSet<String> = HashSet::new();
            used.insert(self.output.clone());
            for node in &self.nodes {
                for input in &node.inputs {
                    used.insert(input.clone());
                }
            }

            let before = self.nodes.len();
            self.nodes.retain(|n| used.contains(&n.id));
            if self.nodes.len() != before {
                changed = true;
            }
        }
    }

    /// Returns an id not yet taken by any param or node, derived from `base`.
    /// Digit-leading mixed names get an underscore prefix so the result
    /// survives the textual form.
    pub fn fresh_id(&self, base: &str) -> String {
        let mut base = base.to_string();
        if base.starts_with(|c: char| c.is_ascii_digit())
            && !base.chars().all(|c| c.is_ascii_digit())
        {
            base.insert(0, '_');
        }
        let base = base.as_str();
        let taken: HashSet<&str> = self
            .params
            .iter()
            .map(|p| p.name.as_str())
            .chain(self.nodes.iter().map(|n| n.id.as_str()))
            .collect();
        if !taken.contains(base) {
            return base.to_string();
        }
        let mut i = 0usize;
        loop {
            let candidate = format!("{base}.{i}");
            if !taken.contains(candidate.as_str()) {
                return candidate;
            }
            i += 1;
        }
    }
}

pub const ENTRY_FUNCTION: &str = "main";

/// A mutable container of named functions. `main` is the entry function.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub functions: BTreeMap<String, Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self) -> Option<&Function> {
        self.functions.get(ENTRY_FUNCTION)
    }

    /// Binds every entry of `params` into the entry function by name: each
    /// matching function param is removed and replaced with an embedded
    /// constant node. Other functions are untouched; the table is consumed.
    pub fn bind_params(&mut self, params: HashMap<String, Tensor>) {
        let Some(func) = self.functions.get_mut(ENTRY_FUNCTION) else {
            return;
        };
        let mut bound = Vec::new();
        func.params.retain(|p| {
            if params.contains_key(&p.name) {
                bound.push(p.name.clone());
                false
            } else {
                true
            }
        });
        // Constants go in front of the body in original param order so every
        // existing use site still refers to a defined value.
        let mut params = params;
        for name in bound.into_iter().rev() {
            if let Some(tensor) = params.remove(&name) {
                func.nodes.insert(0, Node::constant(name, tensor));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_node_fn() -> Function {
        Function {
            params: vec![Param {
                name: "x".to_string(),
                data_type: DataType::F32,
                shape: vec![1],
            }],
            nodes: vec![
                Node::constant("c", Tensor::scalar_f32(2.0)),
                Node::new("y", "add", vec!["x".to_string(), "c".to_string()]),
                Node::new("dead", "mul", vec!["x".to_string(), "x".to_string()]),
            ],
            output: "y".to_string(),
        }
    }

    #[test]
    fn prune_drops_dead_nodes() {
        let mut f = one_node_fn();
        f.prune();
        assert_eq!(f.nodes.len(), 2);
        assert!(f.node("dead").is_none());
    }

    #[test]
    fn replace_uses_rewrites_inputs_and_output() {
        let mut f = one_node_fn();
        f.replace_uses("y", "c");
        assert_eq!(f.output, "c");
    }

    #[test]
    fn bind_params_embeds_constants() {
        let mut module = Module::new();
        module.functions.insert(
            ENTRY_FUNCTION.to_string(),
            Function {
                params: vec![
                    Param {
                        name: "x".to_string(),
                        data_type: DataType::F32,
                        shape: vec![1],
                    },
                    Param {
                        name: "w".to_string(),
                        data_type: DataType::F32,
                        shape: vec![1],
                    },
                ],
                nodes: vec![Node::new("y", "add", vec!["x".to_string(), "w".to_string()])],
                output: "y".to_string(),
            },
        );

        let mut table = HashMap::new();
        table.insert("w".to_string(), Tensor::scalar_f32(0.5));
        module.bind_params(table);

        let main = module.entry().unwrap();
        assert_eq!(main.params.len(), 1);
        assert_eq!(main.params[0].name, "x");
        assert_eq!(main.const_value("w"), Some(&Tensor::scalar_f32(0.5)));
    }

    #[test]
    fn fresh_id_avoids_collisions() {
        let f = one_node_fn();
        assert_eq!(f.fresh_id("z"), "z");
        assert_ne!(f.fresh_id("x"), "x");
    }

    #[test]
    fn tensor_f32_round_trip() {
        let t = Tensor::from_f32s(vec![2], &[1.5, -2.0]);
        assert_eq!(t.f32s(), Some(vec![1.5, -2.0]));
        assert_eq!(t.element_count(), 2);
    }
}
