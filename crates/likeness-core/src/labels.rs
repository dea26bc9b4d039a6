//! Bidirectional class-name ↔ class-id map.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelMapError {
    #[error("cannot read label map {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("label map is not a JSON object of name -> id: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("label map is empty")]
    Empty,
    #[error("class id {id} is used by both '{first}' and '{second}'")]
    DuplicateId {
        id: usize,
        first: String,
        second: String,
    },
    #[error("class ids must be dense 0..{count}; id {missing} is missing")]
    MissingId { missing: usize, count: usize },
}

/// Dense bijection between class names and ids `0..len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    /// Indexed by class id.
    names: Vec<String>,
    ids: HashMap<String, usize>,
}

impl LabelMap {
    /// Build from name -> id pairs; ids must cover `0..n` exactly once.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, LabelMapError>
    where
        I: IntoIterator<Item = (String, usize)>,
    {
        let ids: HashMap<String, usize> = pairs.into_iter().collect();
        if ids.is_empty() {
            return Err(LabelMapError::Empty);
        }

        let count = ids.len();
        let mut names: Vec<Option<String>> = vec![None; count];
        for (name, &id) in &ids {
            let Some(slot) = names.get_mut(id) else {
                // An id past the end means some id below it is missing.
                let missing = (0..count).find(|i| !ids.values().any(|v| v == i)).unwrap_or(id);
                return Err(LabelMapError::MissingId { missing, count });
            };
            if let Some(first) = slot {
                let (first, second) = if first.as_str() < name.as_str() {
                    (first.clone(), name.clone())
                } else {
                    (name.clone(), first.clone())
                };
                return Err(LabelMapError::DuplicateId { id, first, second });
            }
            *slot = Some(name.clone());
        }

        let names = names
            .into_iter()
            .enumerate()
            .map(|(id, name)| name.ok_or(LabelMapError::MissingId { missing: id, count }))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { names, ids })
    }

    /// Parse a flat JSON object such as `{"ada": 0, "bob": 1}`.
    pub fn from_json(json: &str) -> Result<Self, LabelMapError> {
        let raw: BTreeMap<String, usize> = serde_json::from_str(json)?;
        Self::from_pairs(raw)
    }

    /// Read and parse a JSON label map file.
    pub fn load(path: &Path) -> Result<Self, LabelMapError> {
        let json = std::fs::read_to_string(path).map_err(|source| LabelMapError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let map = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), classes = map.len(), "loaded label map");
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name_of(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn id_of(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    /// Names in id order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// `(id, name)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(id, name)| (id, name.as_str()))
    }

    /// Name -> id copy for result payloads.
    pub fn to_dictionary(&self) -> BTreeMap<String, usize> {
        self.iter().map(|(id, name)| (name.to_string(), id)).collect()
    }
}
