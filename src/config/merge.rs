//! Deep merge of configuration documents.

use serde_json::Value;

use super::ConfigError;

/// Merge `src` into `dst`. Objects merge recursively; scalars and arrays in
/// later files replace earlier ones unless `conflict_fail` is set, in which
/// case a differing value is an error naming the conflicting path.
pub fn deep_merge(
    dst: &mut Value,
    src: Value,
    path: &mut Vec<String>,
    conflict_fail: bool,
) -> Result<(), ConfigError> {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, src_value) in src_map {
                path.push(key.clone());
                match dst_map.get_mut(&key) {
                    Some(dst_value) => deep_merge(dst_value, src_value, path, conflict_fail)?,
                    None => {
                        dst_map.insert(key, src_value);
                    }
                }
                path.pop();
            }
            Ok(())
        }
        (dst, src) => {
            if conflict_fail && *dst != src {
                return Err(ConfigError::MergeConflict(path.join(".")));
            }
            *dst = src;
            Ok(())
        }
    }
}
