//! STL-10 binary format.
//!
//! `<split>_X.bin` holds 96x96x3 u8 images back to back; each image is stored
//! channel by channel and column-major within a channel. `<split>_y.bin`
//! holds one u8 label per image, numbered from 1.

use std::fs::File;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use super::frame::Frame;
use super::{DataError, ImageDataset, Result};

pub const STL10_SIDE: usize = 96;
pub const STL10_CLASSES: usize = 10;
const IMAGE_BYTES: usize = STL10_SIDE * STL10_SIDE * 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stl10Split {
    Unlabeled,
    Train,
    Test,
}

impl Stl10Split {
    fn stem(self) -> &'static str {
        match self {
            Stl10Split::Unlabeled => "unlabeled",
            Stl10Split::Train => "train",
            Stl10Split::Test => "test",
        }
    }
}

/// Decode one STL-10 record into a frame.
pub fn decode_record(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() != IMAGE_BYTES {
        return Err(DataError::Format(format!(
            "STL-10 record must be {IMAGE_BYTES} bytes, got {}",
            bytes.len()
        )));
    }
    let side = STL10_SIDE;
    let plane = side * side;
    let at = |c: usize, row: usize, col: usize| bytes[c * plane + col * side + row] as f32 / 255.0;
    Frame::from_fn(side, side, |row, col| {
        [at(0, row, col), at(1, row, col), at(2, row, col)]
    })
}

/// Images are memory-mapped and decoded on demand; labels are loaded
/// eagerly.
pub struct Stl10 {
    images: Mmap,
    len: usize,
    labels: Option<Vec<u32>>,
}

impl Stl10 {
    pub fn open(root: impl AsRef<Path>, split: Stl10Split) -> Result<Self> {
        let root = root.as_ref();
        let path = root.join(format!("{}_X.bin", split.stem()));
        let file = File::open(&path).map_err(|source| DataError::Io {
            path: path.clone(),
            source,
        })?;
        // SAFETY: the split files are read-only inputs for the whole run.
        let images = unsafe { MmapOptions::new().map(&file) }.map_err(|source| DataError::Io {
            path: path.clone(),
            source,
        })?;
        let size = images.len();
        if size % IMAGE_BYTES != 0 {
            return Err(DataError::Format(format!(
                "{} is {size} bytes, not a multiple of {IMAGE_BYTES}",
                path.display()
            )));
        }
        let len = size / IMAGE_BYTES;

        let labels = match split {
            Stl10Split::Unlabeled => None,
            Stl10Split::Train | Stl10Split::Test => {
                let label_path = root.join(format!("{}_y.bin", split.stem()));
                let raw = std::fs::read(&label_path).map_err(|source| DataError::Io {
                    path: label_path.clone(),
                    source,
                })?;
                if raw.len() != len {
                    return Err(DataError::Format(format!(
                        "{} has {} labels for {len} images",
                        label_path.display(),
                        raw.len()
                    )));
                }
                let labels = raw
                    .iter()
                    .map(|&l| match l {
                        1..=10 => Ok(l as u32 - 1),
                        _ => Err(DataError::Format(format!("STL-10 label {l} outside 1..=10"))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Some(labels)
            }
        };

        tracing::info!(path = %path.display(), images = len, labelled = labels.is_some(), "opened STL-10 split");
        Ok(Self {
            images,
            len,
            labels,
        })
    }
}

impl ImageDataset for Stl10 {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<Frame> {
        if index >= self.len {
            return Err(DataError::IndexOutOfRange {
                index,
                len: self.len,
            });
        }
        let start = index * IMAGE_BYTES;
        decode_record(&self.images[start..start + IMAGE_BYTES])
    }

    fn label(&self, index: usize) -> Option<u32> {
        self.labels.as_ref().and_then(|l| l.get(index).copied())
    }

    fn num_classes(&self) -> Option<usize> {
        self.labels.as_ref().map(|_| STL10_CLASSES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    fn record(seed: u8) -> Vec<u8> {
        (0..IMAGE_BYTES).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    #[test]
    fn records_are_column_major() {
        let mut bytes = vec![0u8; IMAGE_BYTES];
        // Channel 0, column 1, row 0.
        bytes[STL10_SIDE] = 255;
        let f = decode_record(&bytes).unwrap();
        assert_eq!(f.get(0, 0, 1), 1.0);
        assert_eq!(f.get(0, 1, 0), 0.0);
    }

    #[test]
    fn reads_labelled_split() {
        let dir = tempfile::tempdir().unwrap();
        let mut x = File::create(dir.path().join("train_X.bin")).unwrap();
        x.write_all(&record(0)).unwrap();
        x.write_all(&record(9)).unwrap();
        std::fs::write(dir.path().join("train_y.bin"), [3u8, 10]).unwrap();

        let ds = Stl10::open(dir.path(), Stl10Split::Train).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.label(0), Some(2));
        assert_eq!(ds.label(1), Some(9));
        assert_eq!(ds.num_classes(), Some(10));
        assert_eq!(ds.get(1).unwrap(), decode_record(&record(9)).unwrap());
        assert!(matches!(
            ds.get(2),
            Err(DataError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn concurrent_reads_decode_their_own_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut x = File::create(dir.path().join("unlabeled_X.bin")).unwrap();
        for seed in 0..8u8 {
            x.write_all(&record(seed * 17)).unwrap();
        }
        drop(x);
        let ds = Arc::new(Stl10::open(dir.path(), Stl10Split::Unlabeled).unwrap());
        std::thread::scope(|s| {
            for worker in 0..4usize {
                let ds = Arc::clone(&ds);
                s.spawn(move || {
                    for round in 0..8usize {
                        let index = (worker + round) % 8;
                        let expected = decode_record(&record(index as u8 * 17)).unwrap();
                        assert_eq!(ds.get(index).unwrap(), expected);
                    }
                });
            }
        });
        assert_eq!(ds.label(0), None);
    }

    #[test]
    fn rejects_bad_labels() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test_X.bin"), record(0)).unwrap();
        std::fs::write(dir.path().join("test_y.bin"), [0u8]).unwrap();
        assert!(matches!(
            Stl10::open(dir.path(), Stl10Split::Test),
            Err(DataError::Format(_))
        ));
    }
}
