//! Typed facade over the key/value settings table.
//!
//! Runtime configuration (automation intervals, filters, trigger tables)
//! lives here rather than in the process environment, so the embedding
//! layer can change it without restarts.

use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    values: HashMap<String, Value>,
}

impl Settings {
    pub fn new() -> Settings {
        Settings {
            values: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn set_json<T: serde::Serialize>(&mut self, key: &str, value: &T) {
        if let Ok(json) = serde_json::to_value(value) {
            self.values.insert(key.to_string(), json);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.values
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.values
            .get(key)
            .and_then(Value::as_f64)
            .unwrap_or(default)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Deserializes a structured setting, falling back on any shape
    /// mismatch.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters_with_defaults() {
        let mut settings = Settings::new();

        settings.set("enabled", true);
        settings.set("interval", 15u64);
        settings.set("name", "alpha");

        assert!(settings.get_bool("enabled", false));
        assert!(!settings.get_bool("missing", false));
        assert_eq!(settings.get_u64("interval", 60), 15);
        assert_eq!(settings.get_u64("missing", 60), 60);
        assert_eq!(settings.get_str("name"), Some("alpha"));
    }

    #[test]
    fn test_wrong_type_falls_back() {
        let mut settings = Settings::new();
        settings.set("interval", "soon");

        assert_eq!(settings.get_u64("interval", 60), 60);
    }

    #[test]
    fn test_structured_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Filter {
            channels: Vec<u32>,
        }

        let mut settings = Settings::new();
        settings.set_json("filter", &Filter { channels: vec![0, 2] });

        assert_eq!(
            settings.get_json::<Filter>("filter"),
            Some(Filter { channels: vec![0, 2] })
        );
        assert_eq!(settings.get_json::<Vec<String>>("filter"), None);
    }
}
