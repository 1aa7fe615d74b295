use std::{
    fmt,
    path::{Path, PathBuf},
};

use burn::data::dataset::Dataset;

/// File extensions treated as images, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "webp", "tif", "tiff"];

/// Which part of the data a loader serves. Decides the transform pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    #[must_use]
    pub fn is_train(self) -> bool {
        self == Self::Train
    }

    /// Lowercase name used for metric log directories.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Valid => "valid",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => write!(f, "Train"),
            Self::Valid => write!(f, "Valid"),
            Self::Test => write!(f, "Test"),
        }
    }
}

/// One labelled image on disk. Decoding happens in the batcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// Dataset laid out as `root/<class>/<image>`, classes sorted by name.
#[derive(Clone, Debug)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    items: Vec<ImageItem>,
}

impl ImageFolder {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, DataError> {
        let root = root.as_ref().to_path_buf();

        let mut classes: Vec<String> = read_dir(&root)?
            .into_iter()
            .filter(|path| path.is_dir())
            .filter_map(|path| path.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect();
        classes.sort();

        if classes.is_empty() {
            return Err(DataError::NoClasses(root.display().to_string()));
        }

        Self::with_classes(root, classes)
    }

    /// Scan `root` with a fixed class list, e.g. the one the model was trained with.
    ///
    /// Class directories missing under `root` contribute no items.
    pub fn with_classes(root: impl AsRef<Path>, classes: Vec<String>) -> Result<Self, DataError> {
        let root = root.as_ref().to_path_buf();
        let mut items = Vec::new();

        for (label, class) in classes.iter().enumerate() {
            let dir = root.join(class);
            if !dir.is_dir() {
                tracing::warn!("class directory {} is missing", dir.display());
                continue;
            }

            let mut files: Vec<PathBuf> = read_dir(&dir)?
                .into_iter()
                .filter(|path| path.is_file() && is_image(path))
                .collect();
            files.sort();

            items.extend(files.into_iter().map(|path| ImageItem { path, label }));
        }

        if items.is_empty() {
            return Err(DataError::Empty(root.display().to_string()));
        }

        tracing::info!(
            "found {} images in {} classes under {}",
            items.len(),
            classes.len(),
            root.display()
        );

        Ok(Self {
            root,
            classes,
            items,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Number of images per class, indexed by label.
    #[must_use]
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len()];
        for item in &self.items {
            counts[item.label] += 1;
        }
        counts
    }
}

impl Dataset<ImageItem> for ImageFolder {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, DataError> {
    let io_err = |e| DataError::Io(dir.display().to_string(), e);
    std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()).map_err(io_err))
        .collect()
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Write the class names (label order) as a JSON array.
pub fn save_classes(classes: &[String], path: impl AsRef<Path>) -> Result<(), DataError> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(classes)
        .map_err(|e| DataError::Classes(path.display().to_string(), e))?;
    std::fs::write(path, json).map_err(|e| DataError::Io(path.display().to_string(), e))
}

pub fn load_classes(path: impl AsRef<Path>) -> Result<Vec<String>, DataError> {
    let path = path.as_ref();
    let content =
        std::fs::read_to_string(path).map_err(|e| DataError::Io(path.display().to_string(), e))?;
    serde_json::from_str(&content).map_err(|e| DataError::Classes(path.display().to_string(), e))
}

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("failed to read {0}: {1}")]
    Io(String, std::io::Error),
    #[error("no class directories under {0}")]
    NoClasses(String),
    #[error("no images found under {0}")]
    Empty(String),
    #[error("failed to decode image {0}: {1}")]
    Decode(String, image::ImageError),
    #[error("invalid class list {0}: {1}")]
    Classes(String, serde_json::Error),
}
