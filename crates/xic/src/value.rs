use std::collections::BTreeMap;

/// The argument data model carried by quests and answers. `Blob` and
/// `String` are distinct so binary payloads survive the wire untouched.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
    List(Vec<Value>),
    Dict(Dict),
}

pub type Dict = BTreeMap<String, Value>;

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte view of a string or blob value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s.as_bytes()),
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Blob(b)
    }
}

/// Accessors over a `Dict` mirroring the quest argument conventions:
/// `get_*` defaults on absence, `want_*` raises an argument error.
pub trait DictExt {
    fn get_int(&self, key: &str) -> i64;
    fn get_bool(&self, key: &str) -> bool;
    fn get_str(&self, key: &str) -> Option<&str>;
    fn get_blob(&self, key: &str) -> Option<&[u8]>;
    fn want_int(&self, key: &str) -> crate::Result<i64>;
    fn want_str(&self, key: &str) -> crate::Result<&str>;
    fn want_blob(&self, key: &str) -> crate::Result<&[u8]>;
    fn want_list(&self, key: &str) -> crate::Result<&[Value]>;
    fn want_dict(&self, key: &str) -> crate::Result<&Dict>;
    /// A list of strings (blobs are accepted and must be UTF-8).
    fn want_str_seq(&self, key: &str) -> crate::Result<Vec<String>>;
    fn get_str_seq(&self, key: &str) -> Vec<String>;
    fn get_int_seq(&self, key: &str) -> Vec<i64>;
}

fn missing(key: &str) -> crate::Error {
    crate::Error::Argument(format!("missing parameter '{key}'"))
}

fn mistyped(key: &str, expect: &str) -> crate::Error {
    crate::Error::Argument(format!("parameter '{key}' is not a {expect}"))
}

impl DictExt for Dict {
    fn get_int(&self, key: &str) -> i64 {
        self.get(key).and_then(Value::as_int).unwrap_or(0)
    }

    fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn get_blob(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(Value::as_bytes)
    }

    fn want_int(&self, key: &str) -> crate::Result<i64> {
        self.get(key)
            .ok_or_else(|| missing(key))?
            .as_int()
            .ok_or_else(|| mistyped(key, "integer"))
    }

    fn want_str(&self, key: &str) -> crate::Result<&str> {
        self.get(key)
            .ok_or_else(|| missing(key))?
            .as_str()
            .ok_or_else(|| mistyped(key, "string"))
    }

    fn want_blob(&self, key: &str) -> crate::Result<&[u8]> {
        self.get(key)
            .ok_or_else(|| missing(key))?
            .as_bytes()
            .ok_or_else(|| mistyped(key, "blob"))
    }

    fn want_list(&self, key: &str) -> crate::Result<&[Value]> {
        self.get(key)
            .ok_or_else(|| missing(key))?
            .as_list()
            .ok_or_else(|| mistyped(key, "list"))
    }

    fn want_dict(&self, key: &str) -> crate::Result<&Dict> {
        self.get(key)
            .ok_or_else(|| missing(key))?
            .as_dict()
            .ok_or_else(|| mistyped(key, "dict"))
    }

    fn want_str_seq(&self, key: &str) -> crate::Result<Vec<String>> {
        self.want_list(key)?
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                Value::Blob(b) => String::from_utf8(b.clone())
                    .map_err(|_| mistyped(key, "list of strings")),
                _ => Err(mistyped(key, "list of strings")),
            })
            .collect()
    }

    fn get_str_seq(&self, key: &str) -> Vec<String> {
        match self.want_str_seq(key) {
            Ok(v) => v,
            Err(_) => Vec::new(),
        }
    }

    fn get_int_seq(&self, key: &str) -> Vec<i64> {
        self.get(key)
            .and_then(Value::as_list)
            .map(|l| l.iter().filter_map(Value::as_int).collect())
            .unwrap_or_default()
    }
}

/// Render a `Value` for the HTTP shim. Blobs become lossy UTF-8 strings.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Blob(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
        Value::List(l) => serde_json::Value::Array(l.iter().map(to_json).collect()),
        Value::Dict(d) => serde_json::Value::Object(
            d.iter().map(|(k, v)| (k.clone(), to_json(v))).collect(),
        ),
    }
}

pub fn from_json(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(a) => Value::List(a.iter().map(from_json).collect()),
        serde_json::Value::Object(o) => Value::Dict(
            o.iter().map(|(k, v)| (k.clone(), from_json(v))).collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_accessors() {
        let mut d = Dict::new();
        d.insert("n".to_string(), Value::Int(7));
        d.insert("s".to_string(), Value::from("hello"));
        d.insert("b".to_string(), Value::Blob(b"raw".to_vec()));

        assert_eq!(d.get_int("n"), 7);
        assert_eq!(d.get_int("absent"), 0);
        assert_eq!(d.want_str("s").unwrap(), "hello");
        assert_eq!(d.want_blob("b").unwrap(), b"raw");
        // Strings double as blobs.
        assert_eq!(d.want_blob("s").unwrap(), b"hello");
        assert!(d.want_int("s").is_err());
        assert!(d.want_str("absent").is_err());
    }

    #[test]
    fn json_round_trip_modulo_blobs() {
        let mut d = Dict::new();
        d.insert("list".to_string(), Value::List(vec![Value::Int(1), Value::Null]));
        d.insert("f".to_string(), Value::Float(1.5));
        let v = Value::Dict(d);

        let j = to_json(&v);
        assert_eq!(from_json(&j), v);
    }
}
