//! Non-destructive JSON config merging.
//!
//! A [`ConfigDocument`] is loaded leniently (missing or unparseable files
//! become an empty object), updated through dotted key paths that touch only
//! the named leaf, and written back atomically: the new content goes to a
//! temporary file in the same directory which is then renamed over the
//! target. Keys are serialised in sorted order with a trailing newline, so
//! applying the same updates twice produces byte-identical files.
//!
//! The same atomic write backs [`upsert_env_line`] for `.env` style files.

use crate::error::{Result, SetupError};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Mode applied to documents written with `private = true`.
#[cfg(unix)]
const PRIVATE_MODE: u32 = 0o600;

/// Mode of a new document written with `private = false`.
#[cfg(unix)]
const SHARED_MODE: u32 = 0o644;

/// A non-empty sequence of object keys, written `a.b.c`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    /// Parse a dotted path. Empty paths and empty segments are rejected.
    pub fn parse(dotted: &str) -> Result<Self> {
        Self::from_segments(dotted.split('.'))
    }

    /// Build a path from explicit segments, for keys that contain dots.
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(|s| s.trim().is_empty()) {
            return Err(SetupError::config(format!(
                "invalid key path '{}'",
                segments.join(".")
            )));
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl FromStr for KeyPath {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Parse a `key.path=value` assignment.
///
/// The value is read as JSON when it parses (`18789`, `true`, `{"a":1}`,
/// `"quoted"`), otherwise it is taken as a plain string.
pub fn parse_assignment(assignment: &str) -> Result<(KeyPath, Value)> {
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| SetupError::config(format!("expected KEY=VALUE, got '{}'", assignment)))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((KeyPath::parse(key)?, value))
}

/// An untyped JSON document whose root is always an object.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    root: Value,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self::empty()
    }
}

impl ConfigDocument {
    pub fn empty() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }

    /// Wrap a value; anything other than an object becomes an empty document.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => Self { root: value },
            other => {
                warn!(kind = json_kind(&other), "config root is not an object, starting empty");
                Self::empty()
            }
        }
    }

    /// Load `path`, falling back to an empty document when the file is
    /// missing, unreadable or not a JSON object. Never fails.
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "config not found, starting empty");
                return Self::empty();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config unreadable, starting empty");
                return Self::empty();
            }
        };

        if content.trim().is_empty() {
            return Self::empty();
        }

        match serde_json::from_str::<Value>(&content) {
            Ok(value) => Self::from_value(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config unparseable, starting empty");
                Self::empty()
            }
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    /// Value at `path`, if every segment resolves through objects.
    pub fn get(&self, path: &KeyPath) -> Option<&Value> {
        path.segments()
            .iter()
            .try_fold(&self.root, |node, key| node.as_object()?.get(key))
    }

    /// True when every update is already present with the same value.
    pub fn contains_all(&self, updates: &[(KeyPath, Value)]) -> bool {
        updates
            .iter()
            .all(|(path, value)| self.get(path) == Some(value))
    }

    /// Set the leaf named by `path`, creating intermediate objects. Siblings
    /// at every level are kept; a non-object intermediate is replaced.
    pub fn set(&mut self, path: &KeyPath, value: Value) {
        let (leaf, parents) = match path.segments().split_last() {
            Some(split) => split,
            None => return,
        };

        let mut node = &mut self.root;
        for key in parents {
            node = ensure_object(node)
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        ensure_object(node).insert(leaf.clone(), value);
    }

    /// A copy with `updates` applied in order. `self` is left untouched.
    pub fn with_updates(&self, updates: &[(KeyPath, Value)]) -> Self {
        let mut next = self.clone();
        for (path, value) in updates {
            next.set(path, value.clone());
        }
        next
    }

    /// Pretty JSON with sorted keys and a trailing newline.
    pub fn render(&self) -> Result<String> {
        let mut text = serde_json::to_string_pretty(&self.root)?;
        text.push('\n');
        Ok(text)
    }

    /// Replace `path` with this document atomically.
    pub fn save_atomic(&self, path: &Path, private: bool) -> Result<()> {
        write_atomic(path, self.render()?.as_bytes(), private)
    }
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        debug!(kind = json_kind(node), "replacing non-object value with object");
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just made an object"),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Load `path`, apply `updates`, write back atomically, return the result.
///
/// The loaded snapshot is never modified; the write only happens once the
/// full new document has been rendered.
pub fn upsert(path: &Path, updates: &[(KeyPath, Value)], private: bool) -> Result<ConfigDocument> {
    let current = ConfigDocument::load(path);
    let next = current.with_updates(updates);
    next.save_atomic(path, private)?;

    let keys: Vec<String> = updates.iter().map(|(k, _)| k.to_string()).collect();
    info!(path = %path.display(), keys = ?keys, "config updated");
    Ok(next)
}

/// Is `key` usable as a shell environment variable name?
pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Set `KEY=value` in a dotenv file.
///
/// An existing `KEY=` (or `export KEY=`) line is replaced in place and later
/// duplicates are dropped; otherwise the line is appended. All other lines
/// are kept verbatim. The file is written atomically with mode 0600.
pub fn upsert_env_line(path: &Path, key: &str, value: &str) -> Result<()> {
    if !is_valid_env_key(key) {
        return Err(SetupError::config(format!("invalid environment key '{}'", key)));
    }
    if value.contains(['\n', '\r']) {
        return Err(SetupError::config(format!("value for '{}' contains a newline", key)));
    }

    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let assignment = format!("{}={}", key, value);
    let mut replaced = false;
    let mut lines: Vec<&str> = Vec::new();
    for line in existing.lines() {
        if assigns_key(line, key) {
            if !replaced {
                lines.push(&assignment);
                replaced = true;
            }
        } else {
            lines.push(line);
        }
    }
    if !replaced {
        lines.push(&assignment);
    }

    let mut content = lines.join("\n");
    content.push('\n');
    write_atomic(path, content.as_bytes(), true)?;

    // Only the key: the value is usually a credential.
    info!(path = %path.display(), key, "env entry updated");
    Ok(())
}

/// Would [`upsert_env_line`] leave the file unchanged? True when exactly one
/// line assigns `key`, and it reads `KEY=value`.
pub fn env_line_present(path: &Path, key: &str, value: &str) -> bool {
    let Ok(content) = fs::read_to_string(path) else {
        return false;
    };
    let expected = format!("{}={}", key, value);
    let mut assignments = content.lines().filter(|line| assigns_key(line, key));
    matches!(
        (assignments.next(), assignments.next()),
        (Some(line), None) if line == expected
    )
}

fn assigns_key(line: &str, key: &str) -> bool {
    let line = line.trim_start();
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    line.strip_prefix(key)
        .is_some_and(|rest| rest.trim_start().starts_with('='))
}

/// Write `bytes` to a temp file next to `path`, then rename it into place.
///
/// A private file gets mode 0600. Otherwise an existing file keeps its mode
/// and a new one gets 0644.
pub fn write_atomic(path: &Path, bytes: &[u8], private: bool) -> Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = if private {
            fs::Permissions::from_mode(PRIVATE_MODE)
        } else {
            match fs::metadata(path) {
                Ok(meta) => meta.permissions(),
                Err(_) => fs::Permissions::from_mode(SHARED_MODE),
            }
        };
        tmp.as_file().set_permissions(permissions)?;
    }
    #[cfg(not(unix))]
    let _ = private;

    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| SetupError::config(format!("failed to replace {}: {}", path.display(), e.error)))?;
    debug!(path = %path.display(), bytes = bytes.len(), "atomic write complete");
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
