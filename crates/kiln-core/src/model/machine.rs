//! Fleet machines and capability dimensions

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// A `key:value` capability requirement or tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dimension {
    pub key: String,
    pub value: String,
}

impl Dimension {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Find the value of the first dimension with the given key
    pub fn find<'a>(dims: &'a [Dimension], key: &str) -> Option<&'a str> {
        dims.iter()
            .find(|d| d.key == key)
            .map(|d| d.value.as_str())
    }
}

impl FromStr for Dimension {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                Ok(Self::new(key, value))
            }
            _ => Err(ModelError::InvalidDimension(s.to_string())),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// A fleet worker as reported by an executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    /// Capability key -> every value the machine offers for it
    pub dimensions: BTreeMap<String, Vec<String>>,
    pub is_dead: bool,
    pub is_quarantined: bool,
    pub current_task_id: Option<String>,
}

impl Machine {
    /// Create a live, idle machine with the given dimensions
    pub fn new(id: impl Into<String>, dims: &[Dimension]) -> Self {
        let mut dimensions: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for d in dims {
            dimensions
                .entry(d.key.clone())
                .or_default()
                .push(d.value.clone());
        }
        Self {
            id: id.into(),
            dimensions,
            is_dead: false,
            is_quarantined: false,
            current_task_id: None,
        }
    }

    /// Whether the machine can take a new task
    pub fn is_free(&self) -> bool {
        !self.is_dead && !self.is_quarantined && self.current_task_id.is_none()
    }

    /// Whether the machine offers every requested dimension
    pub fn satisfies(&self, wanted: &[Dimension]) -> bool {
        wanted.iter().all(|d| {
            self.dimensions
                .get(&d.key)
                .is_some_and(|values| values.iter().any(|v| *v == d.value))
        })
    }
}
