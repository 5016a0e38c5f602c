//! Key-path patches and the patch engine
//!
//! A patch sets or deletes the value at a key path inside an object tree.
//! Replay must be total and deterministic on every peer, so writing through
//! a missing or non-object intermediate replaces it with an empty object.
//! Local edits are validated up front with [`check`] instead.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::{ArborError, ArborResult, Value};

/// Separator of the textual key-path form
pub const PATH_SEPARATOR: char = '.';

/// Legacy prefix marking a delete in the textual range form
pub const DELETE_SIGIL: char = '-';

/// Non-empty sequence of object keys
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    /// Build a path from its keys
    pub fn new(keys: Vec<String>) -> ArborResult<Self> {
        if keys.is_empty() {
            return Err(ArborError::InvalidPath(String::new()));
        }
        Ok(KeyPath(keys))
    }

    /// Parse the dot-delimited form, e.g. `"a.b.c"`
    pub fn parse(path: &str) -> ArborResult<Self> {
        if path.is_empty() {
            return Err(ArborError::InvalidPath(path.to_string()));
        }
        let keys: Vec<String> = path.split(PATH_SEPARATOR).map(str::to_string).collect();
        if keys.iter().any(|k| k.is_empty()) {
            return Err(ArborError::InvalidPath(path.to_string()));
        }
        Ok(KeyPath(keys))
    }

    pub fn keys(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split into the intermediate keys and the terminal key
    fn split_terminal(&self) -> (&[String], &String) {
        match self.0.split_last() {
            Some((last, parents)) => (parents, last),
            None => unreachable!("KeyPath is never empty"),
        }
    }
}

impl TryFrom<Vec<String>> for KeyPath {
    type Error = ArborError;

    fn try_from(keys: Vec<String>) -> ArborResult<Self> {
        KeyPath::new(keys)
    }
}

impl From<KeyPath> for Vec<String> {
    fn from(path: KeyPath) -> Self {
        path.0
    }
}

impl FromStr for KeyPath {
    type Err = ArborError;

    fn from_str(s: &str) -> ArborResult<Self> {
        KeyPath::parse(s)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// A single edit to an object tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Patch {
    /// Replace the value at `path`
    Set { path: KeyPath, value: Value },
    /// Remove the terminal key of `path`
    Delete { path: KeyPath },
}

impl Patch {
    pub fn set(path: KeyPath, value: Value) -> Self {
        Patch::Set { path, value }
    }

    pub fn delete(path: KeyPath) -> Self {
        Patch::Delete { path }
    }

    /// Build a patch from the textual range form: `"a.b"` sets, `"-a.b"`
    /// deletes (and ignores `data`)
    pub fn from_range(range: &str, data: Option<Value>) -> ArborResult<Self> {
        match range.strip_prefix(DELETE_SIGIL) {
            Some(rest) => Ok(Patch::delete(KeyPath::parse(rest)?)),
            None => Ok(Patch::set(
                KeyPath::parse(range)?,
                data.unwrap_or(Value::Null),
            )),
        }
    }

    pub fn path(&self) -> &KeyPath {
        match self {
            Patch::Set { path, .. } | Patch::Delete { path } => path,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Patch::Delete { .. })
    }
}

/// Apply a patch, returning a new value and leaving `base` untouched
pub fn apply(base: &Value, patch: &Patch) -> Value {
    let mut value = base.clone();
    apply_in_place(&mut value, patch);
    value
}

/// Apply a patch to an owned value
pub fn apply_in_place(target: &mut Value, patch: &Patch) {
    match patch {
        Patch::Set { path, value } => {
            let (parents, last) = path.split_terminal();
            let mut current = target;
            for key in parents {
                current = as_object(current)
                    .entry(key.clone())
                    .or_insert(Value::Null);
            }
            as_object(current).insert(last.clone(), value.clone());
        }
        Patch::Delete { path } => {
            let (parents, last) = path.split_terminal();
            let mut current = target;
            for key in parents {
                current = match current.get_mut(key.as_str()) {
                    Some(next) => next,
                    None => return,
                };
            }
            if let Value::Object(map) = current {
                map.remove(last);
            }
        }
    }
}

/// Reject patches that would write through an existing non-object value
pub fn check(base: &Value, patch: &Patch) -> ArborResult<()> {
    let (parents, _) = patch.path().split_terminal();
    let mut current = base;
    let mut walked: Vec<&str> = Vec::with_capacity(parents.len());

    if !current.is_object() {
        return Err(ArborError::NotAnObject {
            path: String::new(),
        });
    }
    for key in parents {
        walked.push(key);
        match current.get(key.as_str()) {
            None => return Ok(()),
            Some(next) if next.is_object() => current = next,
            Some(_) => {
                return Err(ArborError::NotAnObject {
                    path: walked.join("."),
                })
            }
        }
    }
    Ok(())
}

/// View `value` as an object map, replacing anything else with `{}`
fn as_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was replaced with an object"),
    }
}
