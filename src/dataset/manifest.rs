//! Image record store built from a manifest CSV.
//!
//! The manifest has a header row with an `image` column (file name relative
//! to the dataset's image directory) and, for training data, a `cultivar`
//! column. Extra columns are ignored.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SorghumError};

/// Whether records carry labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetMode {
    /// Labeled images under `<root>/train_images`
    Training,
    /// Unlabeled images under `<root>/test`
    Inference,
}

impl DatasetMode {
    /// Directory under the dataset root holding this mode's images
    pub fn image_dir(&self) -> &'static str {
        match self {
            DatasetMode::Training => "train_images",
            DatasetMode::Inference => "test",
        }
    }
}

/// One manifest row, resolved against the dataset root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Dense position in the store
    pub index: usize,
    pub image_path: PathBuf,
    pub cultivar: Option<String>,
}

impl Record {
    /// File name as written in the manifest
    pub fn file_name(&self) -> String {
        self.image_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A cultivar label resolved to its class index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cultivar {
    pub name: String,
    pub index: usize,
}

/// Sorted set of cultivar names; position is the class index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CultivarVocabulary {
    names: Vec<String>,
}

impl CultivarVocabulary {
    /// Build from any list of names; duplicates collapse and order is sorted
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.binary_search_by(|n| n.as_str().cmp(name)).ok()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Resolve a name to a `Cultivar`
    pub fn cultivar(&self, name: &str) -> Option<Cultivar> {
        self.index_of(name).map(|index| Cultivar {
            name: name.to_string(),
            index,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ManifestRow {
    image: String,
    #[serde(default)]
    cultivar: Option<String>,
}

/// Immutable index -> record mapping plus the shared cultivar vocabulary
#[derive(Debug, Clone)]
pub struct RecordStore {
    records: Vec<Record>,
    vocabulary: Arc<CultivarVocabulary>,
    mode: DatasetMode,
}

impl RecordStore {
    /// Load a manifest file, resolving image paths under `root`
    pub fn from_manifest(manifest: &Path, root: &Path, mode: DatasetMode) -> Result<Self> {
        let file = File::open(manifest).map_err(|e| {
            SorghumError::Manifest(format!("cannot open {}: {}", manifest.display(), e))
        })?;
        let store = Self::from_reader(file, root, mode)?;

        tracing::info!(
            "Loaded {} records ({} cultivars) from {}",
            store.len(),
            store.vocabulary.len(),
            manifest.display()
        );
        Ok(store)
    }

    /// Parse manifest CSV from any reader
    pub fn from_reader<R: Read>(reader: R, root: &Path, mode: DatasetMode) -> Result<Self> {
        let mut csv_reader = csv::Reader::from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        let has_column = |name: &str| headers.iter().any(|h| h.trim() == name);
        if !has_column("image") {
            return Err(SorghumError::Manifest(
                "missing required column 'image'".to_string(),
            ));
        }
        if mode == DatasetMode::Training && !has_column("cultivar") {
            return Err(SorghumError::Manifest(
                "missing required column 'cultivar'".to_string(),
            ));
        }

        let image_dir = root.join(mode.image_dir());
        let mut records = Vec::new();

        for (index, row) in csv_reader.deserialize::<ManifestRow>().enumerate() {
            let row = row?;
            let cultivar = match mode {
                DatasetMode::Training => {
                    let name = row
                        .cultivar
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .ok_or_else(|| {
                            SorghumError::Manifest(format!(
                                "row {} ('{}') has no cultivar",
                                index, row.image
                            ))
                        })?;
                    Some(name)
                }
                DatasetMode::Inference => None,
            };

            records.push(Record {
                index,
                image_path: image_dir.join(row.image.trim()),
                cultivar,
            });
        }

        let vocabulary = CultivarVocabulary::from_names(
            records.iter().filter_map(|r| r.cultivar.clone()),
        );

        Ok(Self {
            records,
            vocabulary: Arc::new(vocabulary),
            mode,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn mode(&self) -> DatasetMode {
        self.mode
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Record at `index`, or `RecordNotFound`
    pub fn get(&self, index: usize) -> Result<&Record> {
        self.records.get(index).ok_or(SorghumError::RecordNotFound {
            index,
            len: self.records.len(),
        })
    }

    pub fn vocabulary(&self) -> &Arc<CultivarVocabulary> {
        &self.vocabulary
    }

    /// New store holding the given records, re-indexed densely, sharing this vocabulary
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        let records = indices
            .iter()
            .enumerate()
            .map(|(position, &index)| {
                self.get(index).map(|record| Record {
                    index: position,
                    ..record.clone()
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            records,
            vocabulary: Arc::clone(&self.vocabulary),
            mode: self.mode,
        })
    }

    /// Count of records per cultivar, sorted by name
    pub fn cultivar_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for cultivar in self.records.iter().filter_map(|r| r.cultivar.as_deref()) {
            *counts.entry(cultivar).or_insert(0) += 1;
        }
        counts
    }
}
