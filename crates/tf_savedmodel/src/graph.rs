//! Graph view - node records and attribute values decoded from `NodeDef`

use crate::dtype::DataType;
use crate::proto::{self, attr_value, tensor_shape_proto, TensorShapeProto};
use std::collections::BTreeMap;
use std::fmt;

/// Tensor shape. `None` dims means unknown rank; negative sizes are unknown dimensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorShape {
    dims: Option<Vec<i64>>,
}

impl TensorShape {
    pub fn new(dims: Vec<i64>) -> Self {
        Self { dims: Some(dims) }
    }

    pub fn unknown() -> Self {
        Self { dims: None }
    }

    /// A missing proto is a scalar, as in TensorFlow.
    pub fn from_proto(proto: Option<&TensorShapeProto>) -> Self {
        match proto {
            None => Self::new(Vec::new()),
            Some(p) if p.unknown_rank => Self::unknown(),
            Some(p) => Self::new(p.dim.iter().map(|d| d.size).collect()),
        }
    }

    pub fn to_proto(&self) -> TensorShapeProto {
        match &self.dims {
            None => TensorShapeProto {
                dim: Vec::new(),
                unknown_rank: true,
            },
            Some(dims) => TensorShapeProto {
                dim: dims
                    .iter()
                    .map(|&size| tensor_shape_proto::Dim {
                        size,
                        name: String::new(),
                    })
                    .collect(),
                unknown_rank: false,
            },
        }
    }

    pub fn dims(&self) -> Option<&[i64]> {
        self.dims.as_deref()
    }

    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    /// Dimensions as sizes, if the shape is fully defined.
    pub fn known_dims(&self) -> Option<Vec<usize>> {
        self.dims
            .as_ref()?
            .iter()
            .map(|&d| usize::try_from(d).ok())
            .collect()
    }

    /// Element count, or `None` when unknown or not representable.
    pub fn num_elements(&self) -> Option<usize> {
        self.known_dims()?
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }
}

impl From<&[usize]> for TensorShape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims.iter().map(|&d| d as i64).collect())
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(dims) = &self.dims else {
            return f.write_str("<unknown>");
        };
        let parts: Vec<String> = dims
            .iter()
            .map(|&d| if d < 0 { "?".to_string() } else { d.to_string() })
            .collect();
        match parts.len() {
            1 => write!(f, "({},)", parts[0]),
            _ => write!(f, "({})", parts.join(", ")),
        }
    }
}

/// Decoded node attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f32),
    Bool(bool),
    Type(DataType),
    Shape(TensorShape),
    Tensor { dtype: DataType, shape: TensorShape },
    List(Vec<AttrValue>),
    Func(String),
    Placeholder(String),
    Empty,
}

impl AttrValue {
    pub fn as_shape(&self) -> Option<&TensorShape> {
        match self {
            AttrValue::Shape(shape) => Some(shape),
            _ => None,
        }
    }
}

impl From<&proto::AttrValue> for AttrValue {
    fn from(value: &proto::AttrValue) -> Self {
        use attr_value::Value;
        match &value.value {
            None => AttrValue::Empty,
            Some(Value::S(bytes)) => AttrValue::Str(String::from_utf8_lossy(bytes).into_owned()),
            Some(Value::I(i)) => AttrValue::Int(*i),
            Some(Value::F(x)) => AttrValue::Float(*x),
            Some(Value::B(b)) => AttrValue::Bool(*b),
            Some(Value::Type(code)) => AttrValue::Type(DataType::from_i32(*code)),
            Some(Value::Shape(shape)) => AttrValue::Shape(TensorShape::from_proto(Some(shape))),
            Some(Value::Tensor(tensor)) => AttrValue::Tensor {
                dtype: DataType::from_i32(tensor.dtype),
                shape: TensorShape::from_proto(tensor.tensor_shape.as_ref()),
            },
            Some(Value::Placeholder(name)) => AttrValue::Placeholder(name.clone()),
            Some(Value::Func(func)) => AttrValue::Func(func.name.clone()),
            Some(Value::List(list)) => {
                let mut items = Vec::new();
                items.extend(
                    list.s
                        .iter()
                        .map(|s| AttrValue::Str(String::from_utf8_lossy(s).into_owned())),
                );
                items.extend(list.i.iter().map(|&i| AttrValue::Int(i)));
                items.extend(list.f.iter().map(|&x| AttrValue::Float(x)));
                items.extend(list.b.iter().map(|&b| AttrValue::Bool(b)));
                items.extend(
                    list.r#type
                        .iter()
                        .map(|&t| AttrValue::Type(DataType::from_i32(t))),
                );
                items.extend(
                    list.shape
                        .iter()
                        .map(|s| AttrValue::Shape(TensorShape::from_proto(Some(s)))),
                );
                items.extend(list.func.iter().map(|f| AttrValue::Func(f.name.clone())));
                AttrValue::List(items)
            }
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => write!(f, "{:?}", s),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Float(x) => write!(f, "{}", x),
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Type(dtype) => write!(f, "{}", dtype),
            AttrValue::Shape(shape) => write!(f, "{}", shape),
            AttrValue::Tensor { dtype, shape } => write!(f, "tensor<{}, {}>", dtype, shape),
            AttrValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            AttrValue::Func(name) => write!(f, "@{}", name),
            AttrValue::Placeholder(name) => write!(f, "${}", name),
            AttrValue::Empty => f.write_str("<empty>"),
        }
    }
}

/// One operation of a computation graph.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphNode {
    pub name: String,
    pub op: String,
    pub inputs: Vec<String>,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl GraphNode {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            inputs: Vec::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    /// Names of functions this node calls through `func` attributes.
    pub fn called_functions(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for value in self.attrs.values() {
            match value {
                AttrValue::Func(name) => names.push(name.as_str()),
                AttrValue::List(items) => names.extend(items.iter().filter_map(|v| match v {
                    AttrValue::Func(name) => Some(name.as_str()),
                    _ => None,
                })),
                _ => {}
            }
        }
        names
    }
}

impl From<&proto::NodeDef> for GraphNode {
    fn from(node: &proto::NodeDef) -> Self {
        Self {
            name: node.name.clone(),
            op: node.op.clone(),
            inputs: node.input.clone(),
            attrs: node
                .attr
                .iter()
                .map(|(k, v)| (k.clone(), AttrValue::from(v)))
                .collect(),
        }
    }
}
