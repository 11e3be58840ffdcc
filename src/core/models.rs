use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hasher::HashAlgorithm;

/// A named, hash-identified disk image from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub url: String,
    pub sha256: String,
    pub sha512: String,
}

impl Image {
    /// The expected digest for the given algorithm.
    pub fn digest(&self, algorithm: HashAlgorithm) -> &str {
        match algorithm {
            HashAlgorithm::Sha256 => &self.sha256,
            HashAlgorithm::Sha512 => &self.sha512,
        }
    }

    pub(crate) fn validate(&mut self) -> Result<(), CatalogError> {
        let name = self.name.as_str();
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0')
        {
            return Err(CatalogError::InvalidName(self.name.clone()));
        }

        for algorithm in [HashAlgorithm::Sha256, HashAlgorithm::Sha512] {
            let digest = self.digest(algorithm);
            if digest.len() != algorithm.hex_len()
                || !digest.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(CatalogError::InvalidDigest {
                    name: self.name.clone(),
                    algorithm,
                });
            }
        }

        self.sha256.make_ascii_lowercase();
        self.sha512.make_ascii_lowercase();
        Ok(())
    }
}

/// Opaque handle to the target block device or partition.
///
/// Enumeration belongs to the caller; the identifier is passed through to the
/// imaging pipeline untouched (e.g. `/dev/sdb` or `disk4s2`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Disk {
    pub identifier: String,
}

impl Disk {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.identifier)
    }
}

impl fmt::Display for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier)
    }
}

/// Phase of an imaging session, in the order a session moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagingStage {
    NotStarted,
    Imaging,
    Inverting,
    PostScript,
    Verifying,
    Complete,
    Error,
}

impl ImagingStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Stages a running pipeline can report.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Imaging | Self::Inverting | Self::PostScript | Self::Verifying
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Imaging => "imaging",
            Self::Inverting => "inverting",
            Self::PostScript => "post script",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ImagingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid image name {0:?}: names are used as cache file names")]
    InvalidName(String),
    #[error("Image {name:?} has a malformed {algorithm} digest")]
    InvalidDigest {
        name: String,
        algorithm: HashAlgorithm,
    },
    #[error("Image name {0:?} appears more than once")]
    DuplicateName(String),
}

/// Ordered list of images described by the configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub images: Vec<Image>,
}

impl Catalog {
    /// Build a catalog, rejecting malformed entries before they reach the cache.
    pub fn new(mut images: Vec<Image>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for image in &mut images {
            image.validate()?;
            if !seen.insert(image.name.clone()) {
                return Err(CatalogError::DuplicateName(image.name.clone()));
            }
        }
        Ok(Self { images })
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let raw: Catalog = serde_json::from_str(json)?;
        Self::new(raw.images)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn get(&self, name: &str) -> Option<&Image> {
        self.images.iter().find(|image| image.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Image> {
        self.images.iter()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}
