//! Textual form of the IR.
//!
//! ```text
//! def @main(%x: f32[1,3,224,224]) {
//!   %0 = const f32[] 1.0
//!   %1 = add(%x, %0) {axis=1}
//!   %2 = call @helper(%1)
//!   %2
//! }
//! ```
//!
//! The printer emits a canonical form: printing a parsed module and parsing
//! it again yields an equal module.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;

use crate::ir::{Attribute, DataType, Function, Module, Node, Param, Tensor};

#[derive(Error, Debug)]
#[error("parse error at {line}:{col}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(String),
    Str(String),
    Punct(char),
    Eof,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Ident(s) => format!("identifier `{s}`"),
            Tok::Number(s) => format!("number `{s}`"),
            Tok::Str(s) => format!("string \"{s}\""),
            Tok::Punct(c) => format!("`{c}`"),
            Tok::Eof => "end of input".to_string(),
        }
    }
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.line,
            col: self.col,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.src.get(self.pos + 1) == Some(&b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn tokens(mut self) -> Result<Vec<(Tok, usize, usize)>, ParseError> {
        let mut out = Vec::new();
        loop {
            self.skip_trivia();
            let (line, col) = (self.line, self.col);
            let Some(c) = self.peek() else {
                out.push((Tok::Eof, line, col));
                return Ok(out);
            };
            let tok = match c {
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    let mut s = String::new();
                    while let Some(c) = self.peek() {
                        if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' {
                            s.push(c as char);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    Tok::Ident(s)
                }
                b'0'..=b'9' | b'-' => {
                    let mut s = String::new();
                    if c == b'-' {
                        s.push('-');
                        self.bump();
                        if !matches!(self.peek(), Some(b'0'..=b'9')) {
                            return Err(self.error("expected digit after `-`"));
                        }
                    }
                    while let Some(c) = self.peek() {
                        match c {
                            b'0'..=b'9' | b'.' => {
                                s.push(c as char);
                                self.bump();
                            }
                            b'e' | b'E' => {
                                s.push(c as char);
                                self.bump();
                                if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                                    s.push(self.bump().unwrap_or(b'+') as char);
                                }
                            }
                            _ => break,
                        }
                    }
                    Tok::Number(s)
                }
                b'"' => {
                    self.bump();
                    let mut s = String::new();
                    loop {
                        match self.bump() {
                            Some(b'"') => break,
                            Some(c) => s.push(c as char),
                            None => return Err(self.error("unterminated string")),
                        }
                    }
                    Tok::Str(s)
                }
                b'@' | b'%' | b'(' | b')' | b'{' | b'}' | b'[' | b']' | b',' | b':' | b'=' => {
                    self.bump();
                    Tok::Punct(c as char)
                }
                other => {
                    return Err(self.error(format!("unexpected character `{}`", other as char)))
                }
            };
            out.push((tok, line, col));
        }
    }
}

struct Parser {
    tokens: Vec<(Tok, usize, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn bump(&mut self) -> Tok {
        let t = self.tokens[self.pos.min(self.tokens.len() - 1)].0.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        let (_, line, col) = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        ParseError {
            line: *line,
            col: *col,
            message: message.into(),
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), ParseError> {
        match self.peek() {
            Tok::Punct(p) if *p == c => {
                self.bump();
                Ok(())
            }
            other => Err(self.error_here(format!("expected `{c}`, found {}", other.describe()))),
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek().clone() {
            Tok::Ident(s) => {
                self.bump();
                Ok(s)
            }
            other => Err(self.error_here(format!("expected identifier, found {}", other.describe()))),
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if matches!(self.peek(), Tok::Punct(p) if *p == c) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// A `%`-prefixed value name; node ids may be bare numbers (`%0`).
    fn parse_ref(&mut self) -> Result<String, ParseError> {
        self.expect_punct('%')?;
        match self.peek().clone() {
            Tok::Ident(s) => {
                self.bump();
                Ok(s)
            }
            Tok::Number(s) => {
                self.bump();
                Ok(s)
            }
            other => Err(self.error_here(format!("expected value name, found {}", other.describe()))),
        }
    }

    fn parse_number(&mut self) -> Result<String, ParseError> {
        match self.peek().clone() {
            Tok::Number(s) => {
                self.bump();
                Ok(s)
            }
            other => Err(self.error_here(format!("expected number, found {}", other.describe()))),
        }
    }

    fn parse_dtype(&mut self) -> Result<DataType, ParseError> {
        let name = self.expect_ident()?;
        match name.as_str() {
            "f32" => Ok(DataType::F32),
            "f64" => Ok(DataType::F64),
            "i32" => Ok(DataType::I32),
            "i64" => Ok(DataType::I64),
            "u8" => Ok(DataType::U8),
            other => Err(self.error_here(format!("unknown dtype `{other}`"))),
        }
    }

    /// `dtype[dims]`, e.g. `f32[1,3,224,224]` or `f32[]` for a scalar.
    fn parse_type(&mut self) -> Result<(DataType, Vec<usize>), ParseError> {
        let dtype = self.parse_dtype()?;
        self.expect_punct('[')?;
        let mut dims = Vec::new();
        if !self.eat_punct(']') {
            loop {
                let n = self.parse_number()?;
                let dim: usize = n
                    .parse()
                    .map_err(|_| self.error_here(format!("invalid dimension `{n}`")))?;
                dims.push(dim);
                if self.eat_punct(']') {
                    break;
                }
                self.expect_punct(',')?;
            }
        }
        Ok((dtype, dims))
    }

    fn parse_const(&mut self) -> Result<Tensor, ParseError> {
        let (dtype, shape) = self.parse_type()?;
        let mut literals = Vec::new();
        if self.eat_punct('[') {
            if !self.eat_punct(']') {
                loop {
                    literals.push(self.parse_number()?);
                    if self.eat_punct(']') {
                        break;
                    }
                    self.expect_punct(',')?;
                }
            }
        } else {
            literals.push(self.parse_number()?);
        }

        let expected: usize = shape.iter().product();
        if literals.len() != expected {
            return Err(self.error_here(format!(
                "constant has {} element(s), type expects {}",
                literals.len(),
                expected
            )));
        }

        let mut data = Vec::with_capacity(literals.len() * dtype.size_of());
        for lit in &literals {
            match dtype {
                DataType::F32 => {
                    let v: f32 = lit
                        .parse()
                        .map_err(|_| self.error_here(format!("invalid f32 literal `{lit}`")))?;
                    if !v.is_finite() {
                        return Err(self.error_here(format!("literal `{lit}` overflows f32")));
                    }
                    data.extend_from_slice(&v.to_le_bytes());
                }
                DataType::F64 => {
                    let v: f64 = lit
                        .parse()
                        .map_err(|_| self.error_here(format!("invalid f64 literal `{lit}`")))?;
                    if !v.is_finite() {
                        return Err(self.error_here(format!("literal `{lit}` overflows f64")));
                    }
                    data.extend_from_slice(&v.to_le_bytes());
                }
                DataType::I32 => {
                    let v: i32 = lit
                        .parse()
                        .map_err(|_| self.error_here(format!("invalid i32 literal `{lit}`")))?;
                    data.extend_from_slice(&v.to_le_bytes());
                }
                DataType::I64 => {
                    let v: i64 = lit
                        .parse()
                        .map_err(|_| self.error_here(format!("invalid i64 literal `{lit}`")))?;
                    data.extend_from_slice(&v.to_le_bytes());
                }
                DataType::U8 => {
                    let v: u8 = lit
                        .parse()
                        .map_err(|_| self.error_here(format!("invalid u8 literal `{lit}`")))?;
                    data.push(v);
                }
            }
        }

        Ok(Tensor {
            data_type: dtype,
            shape,
            data,
        })
    }

    fn parse_attr_value(&mut self) -> Result<Attribute, ParseError> {
        match self.peek().clone() {
            Tok::Str(s) => {
                self.bump();
                Ok(Attribute::String(s))
            }
            Tok::Number(_) => {
                let n = self.parse_number()?;
                Ok(number_attr(&n).map_err(|m| self.error_here(m))?)
            }
            Tok::Punct('[') => {
                self.bump();
                let mut items = Vec::new();
                if !self.eat_punct(']') {
                    loop {
                        items.push(self.parse_number()?);
                        if self.eat_punct(']') {
                            break;
                        }
                        self.expect_punct(',')?;
                    }
                }
                if items.iter().any(|s| is_float_literal(s)) {
                    let mut vs = Vec::with_capacity(items.len());
                    for s in &items {
                        let v = s.parse::<f32>().map_err(|_| {
                            self.error_here(format!("invalid float literal `{s}`"))
                        })?;
                        if !v.is_finite() {
                            return Err(
                                self.error_here(format!("literal `{s}` overflows f32"))
                            );
                        }
                        vs.push(v);
                    }
                    Ok(Attribute::Floats(vs))
                } else {
                    let mut vs = Vec::with_capacity(items.len());
                    for s in &items {
                        vs.push(s.parse::<i64>().map_err(|_| {
                            self.error_here(format!("invalid integer literal `{s}`"))
                        })?);
                    }
                    Ok(Attribute::Ints(vs))
                }
            }
            other => Err(self.error_here(format!(
                "expected attribute value, found {}",
                other.describe()
            ))),
        }
    }

    fn parse_attrs(&mut self) -> Result<BTreeMap<String, Attribute>, ParseError> {
        let mut attrs = BTreeMap::new();
        if !self.eat_punct('}') {
            loop {
                let key = self.expect_ident()?;
                self.expect_punct('=')?;
                let value = self.parse_attr_value()?;
                attrs.insert(key, value);
                if self.eat_punct('}') {
                    break;
                }
                self.expect_punct(',')?;
            }
        }
        Ok(attrs)
    }

    fn parse_args(&mut self) -> Result<Vec<String>, ParseError> {
        self.expect_punct('(')?;
        let mut args = Vec::new();
        if !self.eat_punct(')') {
            loop {
                args.push(self.parse_ref()?);
                if self.eat_punct(')') {
                    break;
                }
                self.expect_punct(',')?;
            }
        }
        Ok(args)
    }

    fn parse_function(&mut self) -> Result<(String, Function), ParseError> {
        let kw = self.expect_ident()?;
        if kw != "def" {
            return Err(self.error_here(format!("expected `def`, found `{kw}`")));
        }
        self.expect_punct('@')?;
        let name = self.expect_ident()?;

        self.expect_punct('(')?;
        let mut params = Vec::new();
        if !self.eat_punct(')') {
            loop {
                let pname = self.parse_ref()?;
                self.expect_punct(':')?;
                let (data_type, shape) = self.parse_type()?;
                params.push(Param {
                    name: pname,
                    data_type,
                    shape,
                });
                if self.eat_punct(')') {
                    break;
                }
                self.expect_punct(',')?;
            }
        }

        self.expect_punct('{')?;
        let mut func = Function {
            params,
            nodes: Vec::new(),
            output: String::new(),
        };
        loop {
            let id = self.parse_ref()?;
            if !self.eat_punct('=') {
                // A bare reference closes the body and names the output.
                self.check_defined(&func, &id)?;
                func.output = id;
                self.expect_punct('}')?;
                break;
            }

            let node = match self.peek().clone() {
                Tok::Ident(op) if op == "const" => {
                    self.bump();
                    let tensor = self.parse_const()?;
                    Node::constant(id, tensor)
                }
                Tok::Ident(op) if op == "call" => {
                    self.bump();
                    self.expect_punct('@')?;
                    let callee = self.expect_ident()?;
                    let args = self.parse_args()?;
                    for a in &args {
                        self.check_defined(&func, a)?;
                    }
                    let mut node = Node::new(id, "call", args);
                    node.callee = Some(callee);
                    node
                }
                Tok::Ident(op) => {
                    self.bump();
                    let args = self.parse_args()?;
                    for a in &args {
                        self.check_defined(&func, a)?;
                    }
                    let mut node = Node::new(id, op, args);
                    if self.eat_punct('{') {
                        node.attrs = self.parse_attrs()?;
                    }
                    node
                }
                other => {
                    return Err(
                        self.error_here(format!("expected operator, found {}", other.describe()))
                    )
                }
            };
            if func.params.iter().any(|p| p.name == node.id)
                || func.nodes.iter().any(|n| n.id == node.id)
            {
                return Err(self.error_here(format!("duplicate value name `%{}`", node.id)));
            }
            func.nodes.push(node);
        }

        Ok((name, func))
    }

    fn check_defined(&self, func: &Function, id: &str) -> Result<(), ParseError> {
        let known = func.params.iter().any(|p| p.name == id)
            || func.nodes.iter().any(|n| n.id == id);
        if known {
            Ok(())
        } else {
            Err(self.error_here(format!("undefined value `%{id}`")))
        }
    }

    fn parse_module(&mut self) -> Result<Module, ParseError> {
        let mut module = Module::new();
        while !matches!(self.peek(), Tok::Eof) {
            let before = self.pos;
            let (name, func) = self.parse_function()?;
            debug_assert!(self.pos > before);
            if module.functions.insert(name.clone(), func).is_some() {
                return Err(self.error_here(format!("duplicate function `@{name}`")));
            }
        }
        if module.functions.is_empty() {
            return Err(self.error_here("module defines no functions"));
        }
        Ok(module)
    }
}

fn is_float_literal(s: &str) -> bool {
    s.contains('.') || s.contains('e') || s.contains('E')
}

fn number_attr(s: &str) -> Result<Attribute, String> {
    if is_float_literal(s) {
        let v = s
            .parse::<f32>()
            .map_err(|_| format!("invalid float literal `{s}`"))?;
        if !v.is_finite() {
            return Err(format!("literal `{s}` overflows f32"));
        }
        Ok(Attribute::Float(v))
    } else {
        s.parse::<i64>()
            .map(Attribute::Int)
            .map_err(|_| format!("invalid integer literal `{s}`"))
    }
}

pub fn parse_module(src: &str) -> Result<Module, ParseError> {
    let tokens = Lexer::new(src).tokens()?;
    Parser { tokens, pos: 0 }.parse_module()
}

fn fmt_f32(v: f32) -> String {
    let s = format!("{v:?}");
    if is_float_literal(&s) {
        s
    } else {
        // inf/nan never appear in well-formed constants; keep digits parseable
        format!("{s}.0")
    }
}

fn fmt_type(dtype: DataType, shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("{}[{}]", dtype.as_str(), dims.join(","))
}

fn fmt_tensor(t: &Tensor) -> String {
    let ty = fmt_type(t.data_type, &t.shape);
    let literals: Vec<String> = match t.data_type {
        DataType::F32 => t
            .data
            .chunks_exact(4)
            .map(|c| fmt_f32(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect(),
        DataType::F64 => t
            .data
            .chunks_exact(8)
            .map(|c| {
                let v = f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]);
                let s = format!("{v:?}");
                if is_float_literal(&s) {
                    s
                } else {
                    format!("{s}.0")
                }
            })
            .collect(),
        DataType::I32 => t
            .data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]).to_string())
            .collect(),
        DataType::I64 => t
            .data
            .chunks_exact(8)
            .map(|c| {
                i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]).to_string()
            })
            .collect(),
        DataType::U8 => t.data.iter().map(|b| b.to_string()).collect(),
    };
    if t.shape.is_empty() {
        format!("{ty} {}", literals.first().cloned().unwrap_or_default())
    } else {
        format!("{ty} [{}]", literals.join(", "))
    }
}

fn fmt_attr(value: &Attribute) -> String {
    match value {
        Attribute::Float(v) => fmt_f32(*v),
        Attribute::Int(v) => v.to_string(),
        Attribute::String(s) => format!("\"{s}\""),
        Attribute::Floats(vs) => {
            let items: Vec<String> = vs.iter().map(|v| fmt_f32(*v)).collect();
            format!("[{}]", items.join(", "))
        }
        Attribute::Ints(vs) => {
            let items: Vec<String> = vs.iter().map(|v| v.to_string()).collect();
            format!("[{}]", items.join(", "))
        }
    }
}

pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    for (i, (name, func)) in module.functions.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let params: Vec<String> = func
            .params
            .iter()
            .map(|p| format!("%{}: {}", p.name, fmt_type(p.data_type, &p.shape)))
            .collect();
        let _ = writeln!(out, "def @{name}({}) {{", params.join(", "));
        for node in &func.nodes {
            let _ = write!(out, "  %{} = ", node.id);
            if let Some(tensor) = &node.value {
                let _ = writeln!(out, "const {}", fmt_tensor(tensor));
                continue;
            }
            let args: Vec<String> = node.inputs.iter().map(|a| format!("%{a}")).collect();
            if let Some(callee) = &node.callee {
                let _ = writeln!(out, "call @{callee}({})", args.join(", "));
                continue;
            }
            let _ = write!(out, "{}({})", node.op, args.join(", "));
            if !node.attrs.is_empty() {
                let attrs: Vec<String> = node
                    .attrs
                    .iter()
                    .map(|(k, v)| format!("{k}={}", fmt_attr(v)))
                    .collect();
                let _ = write!(out, " {{{}}}", attrs.join(", "));
            }
            out.push('\n');
        }
        let _ = writeln!(out, "  %{}", func.output);
        out.push_str("}\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
def @main(%x: f32[1,4], %w: f32[4,4]) {
  %0 = const f32[] 1.0
  %1 = nn.dense(%x, %w) {units=4}
  %2 = add(%1, %0)
  %3 = call @helper(%2)
  %3
}

def @helper(%a: f32[1,4]) {
  %0 = nn.relu(%a)
  %0
}
"#;

    #[test]
    fn parses_functions_and_nodes() {
        let module = parse_module(SAMPLE).unwrap();
        assert_eq!(module.functions.len(), 2);
        let main = module.entry().unwrap();
        assert_eq!(main.params.len(), 2);
        assert_eq!(main.nodes.len(), 4);
        assert_eq!(main.output, "3");
        let call = main.node("3").unwrap();
        assert_eq!(call.callee.as_deref(), Some("helper"));
    }

    #[test]
    fn print_parse_round_trip() {
        let module = parse_module(SAMPLE).unwrap();
        let printed = print_module(&module);
        let reparsed = parse_module(&printed).unwrap();
        assert_eq!(module, reparsed);
        // Printing is canonical: a second round produces identical text.
        assert_eq!(printed, print_module(&reparsed));
    }

    #[test]
    fn scalar_and_tensor_constants() {
        let src = "def @main(%x: f32[2]) {\n  %0 = const f32[2] [1.5, -2.0]\n  %1 = const i64[] 7\n  %2 = add(%x, %0)\n  %2\n}\n";
        let module = parse_module(src).unwrap();
        let main = module.entry().unwrap();
        assert_eq!(
            main.const_value("0"),
            Some(&Tensor::from_f32s(vec![2], &[1.5, -2.0]))
        );
        assert_eq!(main.const_value("1").and_then(|t| t.i64s()), Some(vec![7]));
    }

    #[test]
    fn attrs_parse_by_kind() {
        let src = "def @main(%x: f32[1]) {\n  %0 = nn.conv2d(%x, %x) {layout=\"NCHW\", strides=[1, 1], epsilon=1e-5, groups=2}\n  %0\n}\n";
        let module = parse_module(src).unwrap();
        let node = module.entry().unwrap().node("0").unwrap().clone();
        assert_eq!(
            node.attrs.get("layout"),
            Some(&Attribute::String("NCHW".to_string()))
        );
        assert_eq!(node.attrs.get("strides"), Some(&Attribute::Ints(vec![1, 1])));
        assert_eq!(node.attrs.get("epsilon"), Some(&Attribute::Float(1e-5)));
        assert_eq!(node.attrs.get("groups"), Some(&Attribute::Int(2)));
    }

    #[test]
    fn overflowing_float_literal_is_rejected() {
        // `1e99` parses to infinity, which has no printable form; accepting
        // it would let the printer emit text the parser cannot re-read.
        let err = parse_module("def @main(%x: f32[1]) {\n  %0 = const f32[] 1e99\n  %0\n}\n")
            .unwrap_err();
        assert!(err.message.contains("overflows f32"), "{err}");

        let err = parse_module("def @main(%x: f32[1]) {\n  %0 = const f64[] 1e999\n  %0\n}\n")
            .unwrap_err();
        assert!(err.message.contains("overflows f64"), "{err}");

        let err = parse_module(
            "def @main(%x: f32[1]) {\n  %0 = nn.relu(%x) {scale=1e99}\n  %0\n}\n",
        )
        .unwrap_err();
        assert!(err.message.contains("overflows f32"), "{err}");
    }

    #[test]
    fn undefined_reference_is_rejected() {
        let err = parse_module("def @main(%x: f32[1]) {\n  %0 = add(%x, %y)\n  %0\n}\n")
            .unwrap_err();
        assert!(err.message.contains("undefined value"), "{err}");
    }

    #[test]
    fn duplicate_value_is_rejected() {
        let err = parse_module(
            "def @main(%x: f32[1]) {\n  %0 = add(%x, %x)\n  %0 = add(%x, %x)\n  %0\n}\n",
        )
        .unwrap_err();
        assert!(err.message.contains("duplicate value"), "{err}");
    }

    #[test]
    fn malformed_input_reports_position() {
        let err = parse_module("def @main(%x f32[1]) { %x }").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("expected `:`"), "{err}");
    }

    #[test]
    fn comments_are_ignored() {
        let src = "// header\ndef @main(%x: f32[1]) {\n  // body comment\n  %x\n}\n";
        let module = parse_module(src).unwrap();
        assert_eq!(module.entry().unwrap().output, "x");
    }
}
