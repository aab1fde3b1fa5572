// Key/value substrate contract consumed by the message table

use eyre::Result;
use serde_json::Value;

/// Generic key/value store that higher-level tables are built on
///
/// Every method is atomic with respect to a single key. Nothing is promised
/// across keys: callers touching several keys must tolerate observing them
/// mid-change.
pub trait Substrate {
    /// Read the current value of a key
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Overwrite a key
    fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Atomic read-modify-write of one key
    ///
    /// `f` edits the slot in place: `None` is an absent key, and a slot left
    /// `None` removes the key. `f` must not touch the slot before its last
    /// fallible step; when it returns an error no write is recorded and the
    /// error is returned unchanged. Returns whatever `f` returns.
    fn update<T, F>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Option<Value>) -> Result<T>;

    /// Read a nested value below a key
    ///
    /// Objects are walked by member name, arrays by decimal index.
    fn get_in(&self, key: &str, path: &[&str]) -> Result<Option<Value>> {
        let Some(root) = self.get(key)? else {
            return Ok(None);
        };
        Ok(lookup_path(&root, path).cloned())
    }
}

/// Walk `path` down from `root`, returning the node it names
pub fn lookup_path<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_path_object_and_array() {
        let root = json!({
            "records": {
                "3": { "id": 3, "text": "hi" }
            },
            "ids": [7, 8, 9]
        });

        assert_eq!(lookup_path(&root, &["records", "3", "text"]), Some(&json!("hi")));
        assert_eq!(lookup_path(&root, &["ids", "1"]), Some(&json!(8)));
        assert_eq!(lookup_path(&root, &[]), Some(&root));
    }

    #[test]
    fn test_lookup_path_missing() {
        let root = json!({ "ids": [1], "n": 5 });

        assert!(lookup_path(&root, &["nope"]).is_none());
        assert!(lookup_path(&root, &["ids", "4"]).is_none());
        assert!(lookup_path(&root, &["ids", "x"]).is_none());
        assert!(lookup_path(&root, &["n", "inner"]).is_none());
    }
}
