//! File layer of the configuration.
//!
//! Documents are YAML. Nested mappings are flattened into lower-cased,
//! dot-separated key paths; sequences and scalars become leaf values.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use serde_yaml::Value as Yaml;
use voldrive_shared::errors::{VoldriveError, VoldriveResult};

pub(crate) type FlatMap = BTreeMap<String, Value>;

/// Read and flatten a YAML config file.
pub(crate) fn read_yaml_file(path: &Path) -> VoldriveResult<FlatMap> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        VoldriveError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_yaml(&source, &path.display().to_string())
}

/// Parse and flatten a YAML document. `origin` only appears in errors.
pub(crate) fn parse_yaml(source: &str, origin: &str) -> VoldriveResult<FlatMap> {
    let doc: Yaml = serde_yaml::from_str(source)
        .map_err(|e| VoldriveError::InvalidConfig(format!("{}: {}", origin, e)))?;

    let mut flat = FlatMap::new();
    match doc {
        Yaml::Null => {}
        Yaml::Mapping(_) => flatten_into(&mut flat, "", &doc, origin)?,
        other => {
            return Err(VoldriveError::InvalidConfig(format!(
                "{}: top level must be a mapping, found {}",
                origin,
                yaml_kind(&other)
            )));
        }
    }
    Ok(flat)
}

fn flatten_into(flat: &mut FlatMap, prefix: &str, node: &Yaml, origin: &str) -> VoldriveResult<()> {
    match node {
        Yaml::Mapping(map) => {
            for (key, value) in map {
                let key = scalar_key(key).ok_or_else(|| {
                    VoldriveError::InvalidConfig(format!(
                        "{}: unsupported {} key under '{}'",
                        origin,
                        yaml_kind(key),
                        prefix
                    ))
                })?;
                let path = if prefix.is_empty() {
                    key.to_lowercase()
                } else {
                    format!("{}.{}", prefix, key.to_lowercase())
                };
                flatten_into(flat, &path, value, origin)?;
            }
        }
        Yaml::Null => {}
        Yaml::Tagged(tagged) => flatten_into(flat, prefix, &tagged.value, origin)?,
        leaf => {
            let value = serde_json::to_value(leaf).map_err(|e| {
                VoldriveError::InvalidConfig(format!("{}: value of '{}': {}", origin, prefix, e))
            })?;
            flat.insert(prefix.to_string(), value);
        }
    }
    Ok(())
}

fn scalar_key(key: &Yaml) -> Option<String> {
    match key {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Number(n) => Some(n.to_string()),
        Yaml::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn yaml_kind(v: &Yaml) -> &'static str {
    match v {
        Yaml::Null => "null",
        Yaml::Bool(_) => "bool",
        Yaml::Number(_) => "number",
        Yaml::String(_) => "string",
        Yaml::Sequence(_) => "sequence",
        Yaml::Mapping(_) => "mapping",
        Yaml::Tagged(_) => "tagged",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_nested() {
        let flat = parse_yaml(
            r#"
voldrive:
  logLevel: info
libvol:
  server:
    services:
      ebs-east:
        driver: ebs
  hosts: [a, b]
"#,
            "test",
        )
        .unwrap();

        assert_eq!(flat["voldrive.loglevel"], Value::from("info"));
        assert_eq!(flat["libvol.server.services.ebs-east.driver"], Value::from("ebs"));
        assert_eq!(flat["libvol.hosts"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn test_empty_document() {
        assert!(parse_yaml("", "test").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_document() {
        let err = parse_yaml("voldrive: [unclosed", "bad.yml").unwrap_err();
        assert!(matches!(err, VoldriveError::InvalidConfig(msg) if msg.contains("bad.yml")));
    }

    #[test]
    fn test_non_mapping_root() {
        let err = parse_yaml("- a\n- b\n", "list.yml").unwrap_err();
        assert!(matches!(err, VoldriveError::InvalidConfig(msg) if msg.contains("sequence")));
    }

    #[test]
    fn test_missing_file() {
        let err = read_yaml_file(Path::new("/nonexistent/voldrive/config.yml")).unwrap_err();
        assert!(matches!(err, VoldriveError::InvalidConfig(_)));
    }
}
