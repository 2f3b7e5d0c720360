//! Launch file layering
//!
//! A defaults file sits under the launch file:
//! - Tables: deep-merge by key
//! - Arrays: REPLACE (last wins), so `[[mount]]` lists never concatenate
//! - Scalars: override (last wins)

use toml::Value;

/// Deep merge two TOML values, `overlay` winning.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Table(mut base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_table.insert(key, merged);
            }
            Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Merge layers in order; the first is the base, the last has precedence.
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers
        .into_iter()
        .fold(Value::Table(toml::Table::new()), deep_merge)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Value {
        text.parse::<toml::Table>().map(Value::Table).unwrap()
    }

    #[test]
    fn test_tables_merge_by_key() {
        let base = parse("[launch]\nlaunch_dir = \"/base\"\nsetup = \"echo base\"\n");
        let overlay = parse("[launch]\nsetup = \"echo overlay\"\n");
        let merged = deep_merge(base, overlay);
        assert_eq!(merged["launch"]["launch_dir"].as_str(), Some("/base"));
        assert_eq!(merged["launch"]["setup"].as_str(), Some("echo overlay"));
    }

    #[test]
    fn test_arrays_replace() {
        let base = parse("[[mount]]\ntype = \"bind\"\n[[mount]]\ntype = \"bind\"\n");
        let overlay = parse("[[mount]]\ntype = \"direct\"\n");
        let merged = deep_merge(base, overlay);
        let mounts = merged["mount"].as_array().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0]["type"].as_str(), Some("direct"));
    }

    #[test]
    fn test_merge_layers_in_order() {
        let merged = merge_layers(vec![
            parse("[launcher]\ntype = \"local\"\n"),
            parse("[launcher]\ntype = \"ssh\"\n"),
        ]);
        assert_eq!(merged["launcher"]["type"].as_str(), Some("ssh"));
    }
}
