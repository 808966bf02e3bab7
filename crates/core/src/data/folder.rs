//! Labelled image directory tree: `<root>/<class>/<image>`.

use std::path::{Path, PathBuf};

use super::frame::Frame;
use super::{DataError, ImageDataset, Result};

const EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct ImageFolder {
    classes: Vec<String>,
    samples: Vec<(PathBuf, u32)>,
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|source| DataError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths = entries
        .map(|e| {
            e.map(|e| e.path()).map_err(|source| DataError::Io {
                path: dir.to_path_buf(),
                source,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    paths.sort();
    Ok(paths)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl ImageFolder {
    /// Class ids follow the sorted subdirectory names.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut classes = Vec::new();
        let mut samples = Vec::new();
        for class_dir in read_dir_sorted(root)?.into_iter().filter(|p| p.is_dir()) {
            let label = classes.len() as u32;
            let name = class_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            for file in read_dir_sorted(&class_dir)? {
                if file.is_file() && has_image_extension(&file) {
                    samples.push((file, label));
                }
            }
            classes.push(name);
        }
        if samples.is_empty() {
            return Err(DataError::Format(format!(
                "no images under {}",
                root.display()
            )));
        }
        tracing::info!(root = %root.display(), classes = classes.len(), images = samples.len(), "opened image folder");
        Ok(Self { classes, samples })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

impl ImageDataset for ImageFolder {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Frame> {
        let (path, _) = self.samples.get(index).ok_or(DataError::IndexOutOfRange {
            index,
            len: self.samples.len(),
        })?;
        let img = image::open(path).map_err(|source| DataError::Decode {
            path: path.clone(),
            source,
        })?;
        Frame::from_dynamic(&img)
    }

    fn label(&self, index: usize) -> Option<u32> {
        self.samples.get(index).map(|(_, l)| *l)
    }

    fn num_classes(&self) -> Option<usize> {
        Some(self.classes.len())
    }
}
