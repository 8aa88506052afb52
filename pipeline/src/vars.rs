use serde_json::{Map, Value};

/// The variables visible to a task: the run inputs plus the outputs of the
/// task's completed ancestors, keyed by their dot id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vars(Value);

impl Vars {
    /// Wraps the run inputs. Non-object inputs are kept under `input`.
    pub fn new(inputs: Value) -> Self {
        match inputs {
            Value::Object(_) => Self(inputs),
            Value::Null => Self(Value::Object(Map::new())),
            other => {
                let mut map = Map::new();
                map.insert("input".into(), other);
                Self(Value::Object(map))
            }
        }
    }

    /// Adds or replaces the top level `key`.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        if let Value::Object(map) = &mut self.0 {
            map.insert(key.into(), value);
        }
    }

    /// The value at the dot separated `path`. Numeric segments index arrays.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .filter(|s| !s.is_empty())
            .try_fold(&self.0, |value, segment| match value {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }

    /// Resolves `$(path)` references in `raw`. A value that is exactly one
    /// reference becomes the referenced value; otherwise references are
    /// spliced in as text.
    pub fn interpolate(&self, raw: &str) -> Result<Value, String> {
        let trimmed = raw.trim();
        if let Some(path) = whole_reference(trimmed) {
            return self
                .get(path)
                .cloned()
                .ok_or_else(|| format!("variable $({path}) is not set"));
        }

        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find(')')
                .ok_or_else(|| format!("unterminated variable reference in {raw:?}"))?;
            let path = after[..end].trim();
            match self.get(path) {
                Some(Value::String(s)) => out.push_str(s),
                Some(other) => out.push_str(&other.to_string()),
                None => return Err(format!("variable $({path}) is not set")),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }

    /// The wrapped JSON.
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

fn whole_reference(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("$(")?.strip_suffix(')')?;
    (!inner.contains("$(") && !inner.contains(')')).then(|| inner.trim())
}
