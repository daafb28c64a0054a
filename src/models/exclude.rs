use serde_json::Value;

use crate::models::task::ArgumentMap;

/// Strips arguments named in the conventional "exclude" argument before a
/// task is persisted, so secrets never reach the document store. The full
/// argument set is kept aside and restored after the write.
pub struct ArgumentExcluder {
    filtered: ArgumentMap,
    original: ArgumentMap,
}

impl ArgumentExcluder {
    pub fn new(arguments: &ArgumentMap) -> Self {
        Self {
            filtered: arguments.clone(),
            original: arguments.clone(),
        }
    }

    fn excluded_names(&self) -> Vec<String> {
        match self.original.get("exclude") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(name)) => vec![name.clone()],
            _ => Vec::new(),
        }
    }

    /// Remove every excluded argument except the "exclude" marker itself.
    pub fn exclude(&mut self) {
        for name in self.excluded_names() {
            if name != "exclude" {
                self.filtered.remove(&name);
            }
        }
    }

    pub fn filtered(&self) -> &ArgumentMap {
        &self.filtered
    }

    /// The untouched arguments, used to restore the task after persistence.
    pub fn restore(self) -> ArgumentMap {
        self.original
    }
}
