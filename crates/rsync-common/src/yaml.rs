//! Manifest parsing using yaml-rust2
//!
//! Resource manifests and agent status reports arrive as YAML or JSON text.
//! Both are parsed through yaml-rust2 (JSON is a YAML subset) and converted
//! into `serde_json::Value` so they can be deserialized into typed structs.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::{Error, Result};

/// Parse a single manifest document.
///
/// Multi-document input returns only the first document; empty input
/// returns `Value::Null`.
pub fn parse_document(input: &str) -> Result<Value> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| Error::serialization(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Parse every document of a `---` separated stream, dropping empty ones
pub fn parse_documents(input: &str) -> Result<Vec<Value>> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| Error::serialization(e.to_string()))?;
    docs.into_iter()
        .map(yaml_to_json)
        .filter(|doc| !matches!(doc, Ok(Value::Null)))
        .collect()
}

fn yaml_key(key: Yaml) -> Result<String> {
    match key {
        Yaml::String(s) | Yaml::Real(s) => Ok(s),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Boolean(b) => Ok(b.to_string()),
        Yaml::Null => Ok("null".to_string()),
        _ => Err(Error::serialization("unsupported YAML key type")),
    }
}

fn yaml_to_json(yaml: Yaml) -> Result<Value> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| Error::serialization(e.to_string()))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| Ok((yaml_key(k)?, yaml_to_json(v)?)))
            .collect::<Result<Map<String, Value>>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(Error::serialization("YAML aliases not supported")),
        Yaml::BadValue => Err(Error::serialization("bad YAML value")),
    }
}
