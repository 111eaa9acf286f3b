//! 概念取值与类型
//!
//! 取值使用 untagged 序列化，模板与事件里可以直接写 JSON/TOML 字面量。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 概念声明类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptType {
    String,
    Int,
    Float,
    Bool,
    /// 固定字段的结构体
    Struct,
    /// 键值帧（如一条搜索结果）
    Frame,
    /// 帧数组（如搜索结果列表）
    FrameArray,
}

impl fmt::Display for ConceptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConceptType::String => "string",
            ConceptType::Int => "int",
            ConceptType::Float => "float",
            ConceptType::Bool => "bool",
            ConceptType::Struct => "struct",
            ConceptType::Frame => "frame",
            ConceptType::FrameArray => "frame_array",
        };
        write!(f, "{}", name)
    }
}

pub type Frame = BTreeMap<String, ConceptValue>;

/// 概念取值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConceptValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    FrameArray(Vec<Frame>),
    Frame(Frame),
}

impl ConceptValue {
    /// 按声明类型校验并做必要的拓宽（int -> float）；不兼容返回 None
    pub fn coerce(self, ty: ConceptType) -> Option<ConceptValue> {
        match (ty, self) {
            (ConceptType::String, v @ ConceptValue::String(_)) => Some(v),
            (ConceptType::Int, v @ ConceptValue::Int(_)) => Some(v),
            (ConceptType::Float, v @ ConceptValue::Float(_)) => Some(v),
            (ConceptType::Float, ConceptValue::Int(i)) => Some(ConceptValue::Float(i as f64)),
            (ConceptType::Bool, v @ ConceptValue::Bool(_)) => Some(v),
            (ConceptType::Struct | ConceptType::Frame, v @ ConceptValue::Frame(_)) => Some(v),
            (ConceptType::FrameArray, v @ ConceptValue::FrameArray(_)) => Some(v),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ConceptValue::Bool(_) => "bool",
            ConceptValue::Int(_) => "int",
            ConceptValue::Float(_) => "float",
            ConceptValue::String(_) => "string",
            ConceptValue::FrameArray(_) => "frame_array",
            ConceptValue::Frame(_) => "frame",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConceptValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConceptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// 取帧数组中的第 index 个（0 起）元素
    pub fn element(&self, index: usize) -> Option<ConceptValue> {
        match self {
            ConceptValue::FrameArray(items) => items.get(index).cloned().map(ConceptValue::Frame),
            _ => None,
        }
    }

    /// 控制台等简单输入的解析：按声明类型把文本转成取值
    pub fn parse_as(text: &str, ty: ConceptType) -> Option<ConceptValue> {
        let text = text.trim();
        match ty {
            ConceptType::String => Some(ConceptValue::String(text.to_string())),
            ConceptType::Int => text.parse().ok().map(ConceptValue::Int),
            ConceptType::Float => text.parse().ok().map(ConceptValue::Float),
            ConceptType::Bool => match text.to_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Some(ConceptValue::Bool(true)),
                "false" | "no" | "n" | "0" => Some(ConceptValue::Bool(false)),
                _ => None,
            },
            ConceptType::Struct | ConceptType::Frame | ConceptType::FrameArray => {
                serde_json::from_str::<ConceptValue>(text)
                    .ok()
                    .and_then(|v| v.coerce(ty))
            }
        }
    }
}

impl fmt::Display for ConceptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConceptValue::Bool(b) => write!(f, "{}", b),
            ConceptValue::Int(i) => write!(f, "{}", i),
            ConceptValue::Float(x) => write!(f, "{}", x),
            ConceptValue::String(s) => write!(f, "{}", s),
            other => match serde_json::to_string(other) {
                Ok(json) => write!(f, "{}", json),
                Err(_) => write!(f, "<{}>", other.kind_name()),
            },
        }
    }
}

impl From<&str> for ConceptValue {
    fn from(s: &str) -> Self {
        ConceptValue::String(s.to_string())
    }
}

impl From<String> for ConceptValue {
    fn from(s: String) -> Self {
        ConceptValue::String(s)
    }
}

impl From<i64> for ConceptValue {
    fn from(i: i64) -> Self {
        ConceptValue::Int(i)
    }
}

impl From<bool> for ConceptValue {
    fn from(b: bool) -> Self {
        ConceptValue::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_json_literals() {
        let v: ConceptValue = serde_json::from_str("3").unwrap();
        assert_eq!(v, ConceptValue::Int(3));
        let v: ConceptValue = serde_json::from_str("3.5").unwrap();
        assert_eq!(v, ConceptValue::Float(3.5));
        let v: ConceptValue = serde_json::from_str(r#"[{"name": "bank"}]"#).unwrap();
        assert!(matches!(v, ConceptValue::FrameArray(ref items) if items.len() == 1));
    }

    #[test]
    fn test_coerce_widens_int_to_float() {
        assert_eq!(
            ConceptValue::Int(2).coerce(ConceptType::Float),
            Some(ConceptValue::Float(2.0))
        );
        assert_eq!(ConceptValue::Float(2.0).coerce(ConceptType::Int), None);
        assert_eq!(ConceptValue::from("x").coerce(ConceptType::Bool), None);
    }

    #[test]
    fn test_element_selection() {
        let mut a = Frame::new();
        a.insert("name".into(), "Bank A".into());
        let mut b = Frame::new();
        b.insert("name".into(), "Bank B".into());
        let list = ConceptValue::FrameArray(vec![a.clone(), b]);
        assert_eq!(list.element(0), Some(ConceptValue::Frame(a)));
        assert_eq!(list.element(5), None);
    }

    #[test]
    fn test_parse_as() {
        assert_eq!(
            ConceptValue::parse_as("yes", ConceptType::Bool),
            Some(ConceptValue::Bool(true))
        );
        assert_eq!(ConceptValue::parse_as("x1", ConceptType::Int), None);
        assert_eq!(
            ConceptValue::parse_as(" 7 ", ConceptType::Int),
            Some(ConceptValue::Int(7))
        );
    }
}
