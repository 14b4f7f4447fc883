//! Labelled digit images: a directory of PNG files and a CSV file mapping
//! image names to class labels.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::backend::Backend;
use burn::tensor::{Data, Int, Shape, Tensor};
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::utils::int_tensor;

const CHANNELS: usize = 3;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to decode {path}: {source}")]
    Image {
        path: String,
        source: image::ImageError,
    },
    #[error("failed to parse labels in {path}: {source}")]
    Csv {
        path: String,
        source: csv::Error,
    },
    #[error("no labelled png images found in {0}")]
    Empty(String),
}

/// One RGB image, channels first, with its class label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigitItem {
    pub pixels: Vec<u8>,
    pub label: usize,
}

/// In-memory dataset of square RGB images.
pub struct DigitDataset {
    items: Vec<DigitItem>,
    image_size: usize,
}

impl DigitDataset {
    /// Loads every PNG of `image_dir` listed in `csv_path`, resized to
    /// `image_size` x `image_size` when needed.
    ///
    /// The CSV has a header line followed by `image_name,label` rows.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        image_dir: P,
        csv_path: Q,
        image_size: usize,
    ) -> Result<Self, DatasetError> {
        let (image_dir, csv_path) = (image_dir.as_ref(), csv_path.as_ref());
        let labels = read_labels(csv_path)?;

        let entries = fs::read_dir(image_dir).map_err(|source| DatasetError::Io {
            path: image_dir.display().to_string(),
            source,
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| DatasetError::Io {
                    path: image_dir.display().to_string(),
                    source,
                })?
                .path();
            let name = path.file_name().and_then(|name| name.to_str());
            if let Some(&label) = name
                .filter(|name| name.ends_with(".png"))
                .and_then(|name| labels.get(name))
            {
                files.push((path, label));
            }
        }
        if files.is_empty() {
            return Err(DatasetError::Empty(image_dir.display().to_string()));
        }
        files.sort();

        let items = files
            .into_iter()
            .map(|(path, label)| {
                let pixels = load_pixels(&path, image_size)?;
                Ok(DigitItem { pixels, label })
            })
            .collect::<Result<Vec<_>, DatasetError>>()?;
        info!("loaded {} images from {}", items.len(), image_dir.display());

        Ok(Self { items, image_size })
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }
}

impl Dataset<DigitItem> for DigitDataset {
    fn get(&self, index: usize) -> Option<DigitItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// One row of the label file.
#[derive(Debug, Deserialize)]
struct LabelRow {
    image_name: String,
    label: usize,
}

fn read_labels(csv_path: &Path) -> Result<HashMap<String, usize>, DatasetError> {
    let csv_error = |source: csv::Error| DatasetError::Csv {
        path: csv_path.display().to_string(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(csv_path)
        .map_err(csv_error)?;

    let mut labels = HashMap::new();
    for row in reader.deserialize() {
        let row: LabelRow = row.map_err(csv_error)?;
        labels.insert(row.image_name, row.label);
    }

    Ok(labels)
}

fn load_pixels(path: &Path, image_size: usize) -> Result<Vec<u8>, DatasetError> {
    let rgb = image::open(path)
        .map_err(|source| DatasetError::Image {
            path: path.display().to_string(),
            source,
        })?
        .to_rgb8();
    let size = image_size as u32;
    let rgb = if rgb.dimensions() == (size, size) {
        rgb
    } else {
        image::imageops::resize(&rgb, size, size, FilterType::Triangle)
    };

    // HWC -> CHW
    let plane = image_size * image_size;
    let mut pixels = vec![0u8; CHANNELS * plane];
    for (i, pixel) in rgb.pixels().enumerate() {
        for c in 0..CHANNELS {
            pixels[c * plane + i] = pixel[c];
        }
    }
    Ok(pixels)
}

#[derive(Clone, Debug)]
pub struct DigitBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> DigitBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

#[derive(Clone, Debug)]
pub struct DigitBatch<B: Backend> {
    /// `[batch, 3, image_size, image_size]` with values in `[0, 1]`.
    pub images: Tensor<B, 4>,
    /// `[batch]`
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<DigitItem, DigitBatch<B>> for DigitBatcher<B> {
    fn batch(&self, items: Vec<DigitItem>) -> DigitBatch<B> {
        let size = self.image_size;
        let pixels: Vec<f32> = items
            .iter()
            .flat_map(|item| item.pixels.iter().map(|&p| p as f32 / 255.0))
            .collect();
        let labels: Vec<i64> = items.iter().map(|item| item.label as i64).collect();

        let data = Data::new(pixels, Shape::new([items.len(), CHANNELS, size, size]));
        DigitBatch {
            images: Tensor::from_data(data.convert(), &self.device),
            labels: int_tensor(&labels, &self.device),
        }
    }
}
