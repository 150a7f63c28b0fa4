//! YAML configuration loading.
//!
//! Workflow files may be composed from fragments with `$include` and
//! parameterised with `${ENV_VAR:default}` placeholders; both are
//! resolved before deserialization, so the schema types in
//! [`super::workflow`] never see them.

use crate::FlowdError;
use serde::de::DeserializeOwned;
use serde_yaml::Value as YamlValue;
use std::path::Path;
use std::sync::OnceLock;

/// Load a YAML file, resolve `$include` directives relative to its
/// directory, and expand environment placeholders.
pub fn load_yaml_file<P: AsRef<Path>>(path: P) -> Result<YamlValue, FlowdError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| FlowdError::Config(format!("reading {}: {e}", path.display())))?;
    let mut value: YamlValue = serde_yaml::from_str(&content)
        .map_err(|e| FlowdError::Config(format!("parsing {}: {e}", path.display())))?;

    let base_dir = path
        .parent()
        .ok_or_else(|| FlowdError::Config(format!("{} has no parent directory", path.display())))?;
    resolve_includes(&mut value, base_dir)?;
    expand_placeholders(&mut value);
    Ok(value)
}

/// Load a YAML file and deserialize it into a configuration type.
pub fn load_yaml_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, FlowdError> {
    let yaml = load_yaml_file(path)?;
    serde_yaml::from_value(yaml)
        .map_err(|e| FlowdError::Config(format!("invalid configuration: {e}")))
}

/// Replace any mapping of the form `{$include: relative/path.yaml}` with
/// the (recursively loaded) content of that file.
fn resolve_includes(value: &mut YamlValue, base_dir: &Path) -> Result<(), FlowdError> {
    match value {
        YamlValue::Mapping(map) => {
            let include_key = YamlValue::String("$include".to_string());
            if let Some(YamlValue::String(rel_path)) = map.get(&include_key) {
                *value = load_yaml_file(base_dir.join(rel_path))?;
                return Ok(());
            }
            for (_, v) in map.iter_mut() {
                resolve_includes(v, base_dir)?;
            }
        }
        YamlValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                resolve_includes(item, base_dir)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn expand_placeholders(value: &mut YamlValue) {
    match value {
        YamlValue::String(s) => {
            if let Some(expanded) = expand_env(s) {
                *s = expanded;
            }
        }
        YamlValue::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_placeholders(v);
            }
        }
        YamlValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                expand_placeholders(item);
            }
        }
        _ => {}
    }
}

/// Expand every `${NAME}` or `${NAME:default}` in `s` from the process
/// environment. Returns `None` when nothing needed expanding.
fn expand_env(s: &str) -> Option<String> {
    if !s.contains("${") {
        return None;
    }
    static PLACEHOLDER: OnceLock<regex::Regex> = OnceLock::new();
    let re = PLACEHOLDER
        .get_or_init(|| regex::Regex::new(r"\$\{([^:}]+)(?::([^}]*))?\}").expect("placeholder pattern"));

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        let full = cap.get(0)?.as_str();
        let name = cap.get(1)?.as_str();
        let default = cap.get(2).map(|m| m.as_str()).unwrap_or("");
        let value = std::env::var(name).unwrap_or_else(|_| default.to_string());
        result = result.replace(full, &value);
    }
    Some(result)
}

/// Merge `other` into `base`: mappings merge key-wise, recursively;
/// every other value in `other` replaces its counterpart in `base`. Used
/// to layer a site-level fragment under a workflow's own file.
pub fn deep_merge(base: &mut YamlValue, other: &YamlValue) {
    match (base, other) {
        (YamlValue::Mapping(base_map), YamlValue::Mapping(other_map)) => {
            for (key, other_value) in other_map {
                if let Some(base_value) = base_map.get_mut(key) {
                    deep_merge(base_value, other_value);
                } else {
                    base_map.insert(key.clone(), other_value.clone());
                }
            }
        }
        (base, other) => {
            *base = other.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn placeholder_with_default_survives_missing_variable() {
        let expanded = expand_env("tcp://${FLOWD_TEST_MISSING_HOST:localhost}:7766");
        assert_eq!(expanded.as_deref(), Some("tcp://localhost:7766"));
    }

    #[test]
    fn placeholder_reads_the_environment() {
        std::env::set_var("FLOWD_TEST_PORT", "9001");
        let expanded = expand_env("port ${FLOWD_TEST_PORT}");
        assert_eq!(expanded.as_deref(), Some("port 9001"));
        std::env::remove_var("FLOWD_TEST_PORT");
    }

    #[test]
    fn plain_strings_are_left_alone() {
        assert_eq!(expand_env("no placeholders here"), None);
    }

    #[test]
    fn include_splices_the_referenced_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("queues.yaml"), "name: default\nlimit: 4\n").unwrap();
        let mut main = std::fs::File::create(dir.path().join("main.yaml")).unwrap();
        write!(main, "workflow: demo\nqueues:\n  $include: queues.yaml\n").unwrap();

        let value = load_yaml_file(dir.path().join("main.yaml")).unwrap();
        assert_eq!(value["queues"]["limit"], YamlValue::from(4i64));
    }

    #[test]
    fn deep_merge_overlays_nested_mappings() {
        let mut base: YamlValue =
            serde_yaml::from_str("server:\n  bind: 127.0.0.1\n  port: 7766\n").unwrap();
        let overlay: YamlValue = serde_yaml::from_str("server:\n  port: 9000\nextra: 1\n").unwrap();
        deep_merge(&mut base, &overlay);
        assert_eq!(base["server"]["bind"], YamlValue::from("127.0.0.1"));
        assert_eq!(base["server"]["port"], YamlValue::from(9000i64));
        assert_eq!(base["extra"], YamlValue::from(1i64));
    }
}
