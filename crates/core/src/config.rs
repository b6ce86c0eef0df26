//! Layered key/value configuration
//!
//! A [`ConfigManager`] merges several named [`Source`]s. Each key is owned by
//! exactly one source: the one with the numerically lowest priority among
//! those defining it. Tests can overlay values on top of every source.
//!
//! Keys are normalized before lookup: lowercase, with `_` and `/` treated as
//! `.`, so `indexCoord.gc_interval` and `indexcoord.gc.interval` are the same key.

use crate::error::{CoordError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Normalize a configuration key
pub fn format_key(key: &str) -> String {
    key.to_lowercase().replace(['_', '/'], ".")
}

/// A provider of configuration values
pub trait Source: Send + Sync {
    /// Unique source name
    fn name(&self) -> &str;
    /// Lower value wins on conflicting keys
    fn priority(&self) -> i32;
    /// Value of a normalized key
    fn get(&self, key: &str) -> Option<String>;
    /// Every normalized key/value pair
    fn all(&self) -> BTreeMap<String, String>;
}

/// Kind of change carried by a [`ConfigEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Key did not exist before
    Create,
    /// Key changed value
    Update,
    /// Key removed from the source
    Delete,
}

/// A change reported by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEvent {
    /// Source that produced the change
    pub source: String,
    /// Normalized key
    pub key: String,
    /// New value, `None` for deletes
    pub value: Option<String>,
    /// Kind of change
    pub event_type: EventType,
}

/// Filter applied by [`ConfigManager::get_by`]
#[derive(Debug, Clone)]
pub enum Filter {
    /// Keep keys starting with the prefix
    Prefix(String),
    /// Keep keys containing the substring
    Substr(String),
    /// Strip the prefix from the returned key (keeps every key)
    RemovePrefix(String),
}

impl Filter {
    fn apply(&self, key: String) -> Option<String> {
        match self {
            Filter::Prefix(p) => key.starts_with(&format_key(p)).then_some(key),
            Filter::Substr(s) => key.contains(&format_key(s)).then_some(key),
            Filter::RemovePrefix(p) => Some(key.replacen(&format_key(p), "", 1)),
        }
    }
}

// ============================================================================
// Sources
// ============================================================================

/// In-memory source, mutable at runtime
pub struct MapSource {
    name: String,
    priority: i32,
    values: RwLock<BTreeMap<String, String>>,
}

impl MapSource {
    /// Create an empty source
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a source pre-populated with values
    pub fn with_values<K, V>(
        name: impl Into<String>,
        priority: i32,
        values: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let source = Self::new(name, priority);
        {
            let mut map = source.values.write();
            for (k, v) in values {
                map.insert(format_key(k.as_ref()), v.into());
            }
        }
        source
    }

    /// Set a value and return the event to feed into the manager
    pub fn set(&self, key: &str, value: impl Into<String>) -> ConfigEvent {
        let key = format_key(key);
        let value = value.into();
        let previous = self.values.write().insert(key.clone(), value.clone());
        ConfigEvent {
            source: self.name.clone(),
            key,
            value: Some(value),
            event_type: if previous.is_some() {
                EventType::Update
            } else {
                EventType::Create
            },
        }
    }

    /// Remove a value and return the event to feed into the manager
    pub fn remove(&self, key: &str) -> ConfigEvent {
        let key = format_key(key);
        self.values.write().remove(&key);
        ConfigEvent {
            source: self.name.clone(),
            key,
            value: None,
            event_type: EventType::Delete,
        }
    }
}

impl Source for MapSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn all(&self) -> BTreeMap<String, String> {
        self.values.read().clone()
    }
}

/// Read-only source loaded from a TOML file, nested tables flattened to dotted keys
pub struct TomlFileSource {
    inner: MapSource,
}

impl TomlFileSource {
    /// Load and flatten a TOML file
    pub fn open(name: impl Into<String>, priority: i32, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoordError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(name, priority, &content)
    }

    /// Flatten TOML text
    pub fn parse(name: impl Into<String>, priority: i32, content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)?;
        let mut flat = BTreeMap::new();
        flatten("", &toml::Value::Table(table), &mut flat);
        Ok(Self {
            inner: MapSource::with_values(name, priority, flat),
        })
    }
}

fn flatten(prefix: &str, value: &toml::Value, out: &mut BTreeMap<String, String>) {
    match value {
        toml::Value::Table(table) => {
            for (k, v) in table {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                flatten(&key, v, out);
            }
        }
        toml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

impl Source for TomlFileSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn priority(&self) -> i32 {
        self.inner.priority()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    fn all(&self) -> BTreeMap<String, String> {
        self.inner.all()
    }
}

// ============================================================================
// Manager
// ============================================================================

type Handler = Box<dyn Fn(&ConfigEvent) + Send + Sync>;

#[derive(Default)]
struct ManagerState {
    sources: HashMap<String, Arc<dyn Source>>,
    key_source: HashMap<String, String>,
    /// `None` is a tombstone hiding every source
    overlay: HashMap<String, Option<String>>,
}

impl ManagerState {
    fn value_from_source(&self, key: &str, source: &str) -> Option<String> {
        self.sources.get(source).and_then(|s| s.get(key))
    }

    fn priority_of(&self, source: &str) -> Option<i32> {
        self.sources.get(source).map(|s| s.priority())
    }

    fn next_best_source(&self, key: &str, excluding: &str) -> Option<String> {
        self.sources
            .values()
            .filter(|s| s.name() != excluding && s.get(key).is_some())
            .min_by_key(|s| s.priority())
            .map(|s| s.name().to_string())
    }
}

/// Merges configuration sources by priority
#[derive(Default)]
pub struct ConfigManager {
    state: RwLock<ManagerState>,
    handlers: RwLock<Vec<Handler>>,
}

impl ConfigManager {
    /// Create a manager with no sources
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source and take ownership of the keys it wins
    pub fn add_source(&self, source: Arc<dyn Source>) -> Result<()> {
        let mut state = self.state.write();
        let name = source.name().to_string();
        if state.sources.contains_key(&name) {
            return Err(CoordError::Config(format!("duplicate source supplied: {}", name)));
        }
        let priority = source.priority();
        let keys: Vec<String> = source.all().into_keys().collect();
        state.sources.insert(name.clone(), source);

        for key in keys {
            let take = match state.key_source.get(&key) {
                None => true,
                Some(current) => match state.priority_of(current) {
                    Some(current_priority) => current_priority > priority,
                    None => true,
                },
            };
            if take {
                state.key_source.insert(key, name.clone());
            }
        }
        info!(target: "idxcoord::config", source = %name, priority, "config source added");
        Ok(())
    }

    /// Resolve a key
    pub fn get(&self, key: &str) -> Result<String> {
        let state = self.state.read();
        let key = format_key(key);
        if let Some(overlaid) = state.overlay.get(&key) {
            return overlaid
                .clone()
                .ok_or_else(|| CoordError::Config(format!("key not found: {}", key)));
        }
        let source = state
            .key_source
            .get(&key)
            .ok_or_else(|| CoordError::Config(format!("key not found: {}", key)))?;
        state
            .value_from_source(&key, source)
            .ok_or_else(|| CoordError::Config(format!("key not found: {}", key)))
    }

    /// Resolve and parse a key, `None` when absent
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Ok(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| CoordError::Config(format!("invalid value for {}: {}", key, raw))),
            Err(_) => Ok(None),
        }
    }

    /// Every key passing all filters, with filters' key rewrites applied
    pub fn get_by(&self, filters: &[Filter]) -> BTreeMap<String, String> {
        let state = self.state.read();
        let mut matched = BTreeMap::new();
        for (key, source) in &state.key_source {
            let mut out = Some(key.clone());
            for filter in filters {
                out = out.and_then(|k| filter.apply(k));
            }
            let Some(out_key) = out else { continue };
            match state.value_from_source(key, source) {
                Some(value) => {
                    matched.insert(out_key, value);
                }
                None => warn!(target: "idxcoord::config", key = %key, "source lost owned key"),
            }
        }
        matched
    }

    /// Every resolved key/value pair from sources
    pub fn get_configs(&self) -> BTreeMap<String, String> {
        self.get_by(&[])
    }

    /// Overlay a value above every source
    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.state
            .write()
            .overlay
            .insert(format_key(key), Some(value.into()));
    }

    /// Hide a key from every source
    pub fn delete(&self, key: &str) {
        self.state.write().overlay.insert(format_key(key), None);
    }

    /// Remove an overlay entry
    pub fn reset(&self, key: &str) {
        self.state.write().overlay.remove(&format_key(key));
    }

    /// Register a change handler, invoked for applied events
    pub fn subscribe(&self, handler: impl Fn(&ConfigEvent) + Send + Sync + 'static) {
        self.handlers.write().push(Box::new(handler));
    }

    /// Apply a source change. Returns false when the change is shadowed by a
    /// higher-priority source or comes from a source that does not own the key.
    pub fn on_event(&self, event: ConfigEvent) -> bool {
        let mut event = event;
        let applied = {
            let mut state = self.state.write();
            match event.event_type {
                EventType::Create | EventType::Update => {
                    match state.key_source.get(&event.key).cloned() {
                        None => {
                            state.key_source.insert(event.key.clone(), event.source.clone());
                            event.event_type = EventType::Create;
                            true
                        }
                        Some(owner) if owner == event.source => {
                            event.event_type = EventType::Update;
                            true
                        }
                        Some(owner) => {
                            let owner_priority = state.priority_of(&owner);
                            let event_priority = state.priority_of(&event.source);
                            match (owner_priority, event_priority) {
                                (Some(o), Some(e)) if o <= e => {
                                    debug!(
                                        target: "idxcoord::config",
                                        key = %event.key,
                                        owner = %owner,
                                        source = %event.source,
                                        "ignoring change from lower priority source"
                                    );
                                    false
                                }
                                _ => {
                                    state
                                        .key_source
                                        .insert(event.key.clone(), event.source.clone());
                                    event.event_type = EventType::Update;
                                    true
                                }
                            }
                        }
                    }
                }
                EventType::Delete => match state.key_source.get(&event.key).cloned() {
                    Some(owner) if owner == event.source => {
                        match state.next_best_source(&event.key, &owner) {
                            Some(next) => {
                                state.key_source.insert(event.key.clone(), next);
                            }
                            None => {
                                state.key_source.remove(&event.key);
                            }
                        }
                        true
                    }
                    _ => false,
                },
            }
        };
        if applied {
            for handler in self.handlers.read().iter() {
                handler(&event);
            }
        }
        applied
    }
}
