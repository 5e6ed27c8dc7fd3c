//! Data pipeline: manifest, patient split, frame sequences, batching.
//!
//! The dataset manifest is a JSON file with a `"Patient"` field holding the
//! ordered patient list. Each patient has a frame directory under the data
//! root, with files named `<index>_<stage>.png` (or `.jpg`). A sample is a
//! window of exactly `seq_len` consecutive frames, labelled by the stage of
//! the window's final frame.
//!
//! * **[`load_manifest`]** / **[`split_patients`]** — startup-time inputs.
//! * **[`SleepSeqDataset`]** — indexable windows over per-patient frames.
//! * **[`BatchLoader`]** — decodes batches on a fixed worker pool and
//!   assembles `(frames, labels)` tensors on the target device.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

// ── Manifest ────────────────────────────────────────────────────────────────

/// One patient record from the dataset manifest. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    /// Identifier; also the name of the patient's frame directory.
    pub id: String,
}

/// Dataset manifest: an ordered list of patients under the `"Patient"` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "Patient")]
    pub patients: Vec<Patient>,
}

/// Read the manifest once at startup. Missing or malformed files are fatal.
pub fn load_manifest(path: &Path) -> AnyhowResult<Manifest> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("read dataset manifest {}", path.display()))?;
    let manifest: Manifest = serde_json::from_str(&json)
        .with_context(|| format!("parse dataset manifest {}", path.display()))?;
    Ok(manifest)
}

// ── Patient split ───────────────────────────────────────────────────────────

/// Disjoint train/validation/test patient subsets.
#[derive(Debug, Clone)]
pub struct PatientSplit {
    pub train: Vec<Patient>,
    pub valid: Vec<Patient>,
    pub test: Vec<Patient>,
}

/// Deterministically partition patients into train/validation/test.
///
/// `test_frac` of the full list is held out first, then `valid_frac` of the
/// remainder. The same seed always yields the same partition. Fails when any
/// resulting subset would be empty.
pub fn split_patients(
    patients: &[Patient],
    test_frac: f64,
    valid_frac: f64,
    seed: u64,
) -> AnyhowResult<PatientSplit> {
    if patients.is_empty() {
        bail!("patient list is empty");
    }
    if !(test_frac > 0.0 && test_frac < 1.0) || !(valid_frac > 0.0 && valid_frac < 1.0) {
        bail!(
            "split fractions must lie in (0, 1): test {test_frac}, validation {valid_frac}"
        );
    }
    let mut shuffled = patients.to_vec();
    let mut rng = StdRng::seed_from_u64(seed);
    shuffled.shuffle(&mut rng);

    let n = shuffled.len();
    let n_test = ((n as f64) * test_frac).ceil() as usize;
    let test = shuffled.split_off(n - n_test);
    let n_valid = ((shuffled.len() as f64) * valid_frac).ceil() as usize;
    if n_valid >= shuffled.len() {
        bail!("{n} patients is too few for a non-empty train/validation/test split");
    }
    let valid = shuffled.split_off(shuffled.len() - n_valid);
    let train = shuffled;
    if train.is_empty() || valid.is_empty() || test.is_empty() {
        bail!("{n} patients is too few for a non-empty train/validation/test split");
    }
    Ok(PatientSplit { train, valid, test })
}

// ── Frame transform ─────────────────────────────────────────────────────────

/// Per-frame preprocessing: decode → grayscale → resize → normalise.
///
/// Pixels are mapped to f32 in `[-1, 1]` (`(x/255 − 0.5) / 0.5`), matching
/// the normalisation the encoder was pretrained with.
#[derive(Debug, Clone)]
pub struct FrameTransform {
    pub image_size: usize,
}

impl FrameTransform {
    /// Decode one frame into `image_size × image_size` normalised floats.
    pub fn load(&self, path: &Path) -> AnyhowResult<Vec<f32>> {
        let img = image::open(path).with_context(|| format!("decode frame {}", path.display()))?;
        let gray = img.to_luma8();
        let size = self.image_size as u32;
        let resized = image::imageops::resize(&gray, size, size, FilterType::Triangle);
        Ok(resized
            .pixels()
            .map(|p| (p.0[0] as f32 / 255.0 - 0.5) / 0.5)
            .collect())
    }
}

// ── Sequence dataset ────────────────────────────────────────────────────────

/// One indexed window: `seq_len` frame paths plus the window's label.
#[derive(Debug, Clone)]
struct SeqSample {
    frames: Vec<PathBuf>,
    label: u32,
}

/// Read-only dataset of fixed-length frame sequences across patients.
///
/// Construction scans every patient's frame directory eagerly and fails fast
/// on the first malformed frame name, unknown sleep stage, or patient with
/// fewer than `seq_len` frames. Pixel decoding is deferred to [`Self::get`].
pub struct SleepSeqDataset {
    samples: Vec<SeqSample>,
    seq_len: usize,
    transform: FrameTransform,
}

impl SleepSeqDataset {
    pub fn new(
        patients: &[Patient],
        data_path: &Path,
        labels: &[String],
        seq_len: usize,
        transform: FrameTransform,
    ) -> AnyhowResult<Self> {
        if seq_len == 0 {
            bail!("sequence length must be at least 1");
        }
        let label_index: HashMap<&str, u32> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i as u32))
            .collect();

        let mut samples = Vec::new();
        for patient in patients {
            let dir = data_path.join(&patient.id);
            let mut frames = Vec::new();
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("read frame directory {}", dir.display()))?;
            for entry in entries {
                let path = entry?.path();
                if !is_frame_file(&path) {
                    continue;
                }
                let (index, stage) = parse_frame_name(&path)?;
                let Some(&label) = label_index.get(stage.as_str()) else {
                    bail!(
                        "patient {}: unknown sleep stage {stage:?} in {}",
                        patient.id,
                        path.display()
                    );
                };
                frames.push((index, path, label));
            }
            frames.sort_by_key(|f| f.0);
            if frames.len() < seq_len {
                bail!(
                    "patient {}: {} frames on disk, need at least {seq_len}",
                    patient.id,
                    frames.len()
                );
            }
            for window in frames.windows(seq_len) {
                samples.push(SeqSample {
                    frames: window.iter().map(|f| f.1.clone()).collect(),
                    label: window[seq_len - 1].2,
                });
            }
        }

        Ok(Self {
            samples,
            seq_len,
            transform,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn image_size(&self) -> usize {
        self.transform.image_size
    }

    /// Decode sample `index`: `seq_len × image_size²` floats plus the label.
    pub fn get(&self, index: usize) -> AnyhowResult<(Vec<f32>, u32)> {
        let sample = self
            .samples
            .get(index)
            .with_context(|| format!("sample index {index} out of range"))?;
        let frame_len = self.transform.image_size * self.transform.image_size;
        let mut pixels = Vec::with_capacity(self.seq_len * frame_len);
        for path in &sample.frames {
            pixels.extend(self.transform.load(path)?);
        }
        Ok((pixels, sample.label))
    }
}

/// Frame files carry a `.png`/`.jpg`/`.jpeg` extension; everything else in
/// the directory is ignored.
fn is_frame_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
            .unwrap_or(false)
}

/// Parse `<index>_<stage>` from a frame file stem.
fn parse_frame_name(path: &Path) -> AnyhowResult<(u64, String)> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("non-UTF-8 frame name {}", path.display()))?;
    let (index, stage) = stem
        .split_once('_')
        .with_context(|| format!("frame name {stem:?} is not <index>_<stage>"))?;
    let index: u64 = index
        .parse()
        .with_context(|| format!("frame name {stem:?} has a non-numeric index"))?;
    Ok((index, stage.to_string()))
}

// ── Batch loading ───────────────────────────────────────────────────────────

/// Build the fixed-size worker pool used for parallel frame decoding.
pub fn decode_pool(num_workers: usize) -> AnyhowResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers.max(1))
        .build()
        .context("build frame-decoding worker pool")
}

/// Assemble decoded samples into `(frames, labels)` tensors.
///
/// Frames: `(batch, seq_len, 1, image_size, image_size)` f32.
/// Labels: `(batch,)` u32.
pub fn sequence_batch_to_tensors(
    decoded: Vec<(Vec<f32>, u32)>,
    seq_len: usize,
    image_size: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let batch = decoded.len();
    let mut pixels = Vec::with_capacity(batch * seq_len * image_size * image_size);
    let mut labels = Vec::with_capacity(batch);
    for (sample, label) in decoded {
        pixels.extend(sample);
        labels.push(label);
    }
    let frames = Tensor::from_vec(pixels, (batch, seq_len, 1, image_size, image_size), device)?;
    let labels = Tensor::from_vec(labels, (batch,), device)?;
    Ok((frames, labels))
}

/// Batched iteration over a [`SleepSeqDataset`].
///
/// A pure producer: samples in each batch are decoded in parallel on the
/// worker pool, then handed to the caller as device tensors. The final batch
/// may be smaller than `batch_size`.
pub struct BatchLoader<'a> {
    dataset: &'a SleepSeqDataset,
    batch_size: usize,
    pool: &'a rayon::ThreadPool,
    device: &'a Device,
    indices: Vec<usize>,
    cursor: usize,
}

impl<'a> BatchLoader<'a> {
    /// Iterate samples in dataset order (validation passes).
    pub fn sequential(
        dataset: &'a SleepSeqDataset,
        batch_size: usize,
        pool: &'a rayon::ThreadPool,
        device: &'a Device,
    ) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            pool,
            device,
            indices: (0..dataset.len()).collect(),
            cursor: 0,
        }
    }

    /// Iterate samples in a freshly shuffled order (training passes).
    pub fn shuffled(
        dataset: &'a SleepSeqDataset,
        batch_size: usize,
        pool: &'a rayon::ThreadPool,
        device: &'a Device,
        rng: &mut StdRng,
    ) -> Self {
        let mut loader = Self::sequential(dataset, batch_size, pool, device);
        loader.indices.shuffle(rng);
        loader
    }

    /// Decode and assemble the next batch, or `None` when exhausted.
    pub fn next_batch(&mut self) -> AnyhowResult<Option<(Tensor, Tensor)>> {
        if self.cursor >= self.indices.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let indices = &self.indices[self.cursor..end];
        let dataset = self.dataset;
        let decoded: Vec<(Vec<f32>, u32)> = self
            .pool
            .install(|| indices.par_iter().map(|&i| dataset.get(i)).collect::<AnyhowResult<_>>())?;
        self.cursor = end;
        let (frames, labels) = sequence_batch_to_tensors(
            decoded,
            dataset.seq_len(),
            dataset.image_size(),
            self.device,
        )?;
        Ok(Some((frames, labels)))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn patients(n: usize) -> Vec<Patient> {
        (0..n)
            .map(|i| Patient {
                id: format!("p{i:02}"),
            })
            .collect()
    }

    #[test]
    fn split_is_deterministic() {
        let list = patients(30);
        let a = split_patients(&list, 0.1, 0.11, 777).unwrap();
        let b = split_patients(&list, 0.1, 0.11, 777).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.valid, b.valid);
        assert_eq!(a.test, b.test);
    }

    #[test]
    fn split_changes_with_seed() {
        let list = patients(30);
        let a = split_patients(&list, 0.1, 0.11, 777).unwrap();
        let b = split_patients(&list, 0.1, 0.11, 778).unwrap();
        assert!(a.train != b.train || a.test != b.test);
    }

    #[test]
    fn split_is_a_partition() {
        let list = patients(25);
        let split = split_patients(&list, 0.1, 0.11, 42).unwrap();
        let mut all: Vec<_> = split
            .train
            .iter()
            .chain(&split.valid)
            .chain(&split.test)
            .cloned()
            .collect();
        assert_eq!(all.len(), list.len());
        all.sort_by(|a, b| a.id.cmp(&b.id));
        let mut expected = list.clone();
        expected.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(all, expected);
        for p in &split.test {
            assert!(!split.train.contains(p));
            assert!(!split.valid.contains(p));
        }
        for p in &split.valid {
            assert!(!split.train.contains(p));
        }
    }

    #[test]
    fn split_rejects_empty_and_tiny_lists() {
        assert!(split_patients(&[], 0.1, 0.11, 0).is_err());
        assert!(split_patients(&patients(2), 0.1, 0.11, 0).is_err());
    }

    #[test]
    fn split_rejects_out_of_range_fractions() {
        let list = patients(30);
        assert!(split_patients(&list, 1.0, 0.11, 0).is_err());
        assert!(split_patients(&list, 0.0, 0.11, 0).is_err());
        assert!(split_patients(&list, -0.1, 0.11, 0).is_err());
        assert!(split_patients(&list, 0.1, 1.5, 0).is_err());
        assert!(split_patients(&list, 0.1, 0.0, 0).is_err());
    }

    #[test]
    fn frame_name_parsing() {
        let (index, stage) = parse_frame_name(Path::new("007_N2.png")).unwrap();
        assert_eq!(index, 7);
        assert_eq!(stage, "N2");
        assert!(parse_frame_name(Path::new("noindex.png")).is_err());
        assert!(parse_frame_name(Path::new("x_N2.png")).is_err());
    }

    fn write_patient_frames(dir: &Path, stages: &[&str]) {
        std::fs::create_dir_all(dir).unwrap();
        for (i, stage) in stages.iter().enumerate() {
            let img = image::GrayImage::from_fn(8, 8, |x, y| image::Luma([(x * y + i as u32) as u8]));
            img.save(dir.join(format!("{i:03}_{stage}.png"))).unwrap();
        }
    }

    fn stage_labels() -> Vec<String> {
        ["Wake", "N1", "N2", "N3", "REM"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn dataset_windows_and_final_frame_labels() {
        let tmp = tempfile::tempdir().unwrap();
        write_patient_frames(&tmp.path().join("p00"), &["Wake", "N1", "N2", "N3", "REM"]);
        let list = vec![Patient { id: "p00".into() }];
        let dataset = SleepSeqDataset::new(
            &list,
            tmp.path(),
            &stage_labels(),
            3,
            FrameTransform { image_size: 8 },
        )
        .unwrap();
        // 5 frames, windows of 3 → 3 samples labelled N2, N3, REM.
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.get(0).unwrap().1, 2);
        assert_eq!(dataset.get(1).unwrap().1, 3);
        assert_eq!(dataset.get(2).unwrap().1, 4);
        let (pixels, _) = dataset.get(0).unwrap();
        assert_eq!(pixels.len(), 3 * 8 * 8);
        assert!(pixels.iter().all(|p| (-1.0..=1.0).contains(p)));
    }

    #[test]
    fn dataset_rejects_short_patients() {
        let tmp = tempfile::tempdir().unwrap();
        write_patient_frames(&tmp.path().join("p00"), &["Wake", "N1"]);
        let list = vec![Patient { id: "p00".into() }];
        let err = SleepSeqDataset::new(
            &list,
            tmp.path(),
            &stage_labels(),
            5,
            FrameTransform { image_size: 8 },
        );
        assert!(err.is_err());
    }

    #[test]
    fn dataset_rejects_unknown_stage() {
        let tmp = tempfile::tempdir().unwrap();
        write_patient_frames(&tmp.path().join("p00"), &["Wake", "N9", "N2"]);
        let list = vec![Patient { id: "p00".into() }];
        let err = SleepSeqDataset::new(
            &list,
            tmp.path(),
            &stage_labels(),
            2,
            FrameTransform { image_size: 8 },
        );
        assert!(err.is_err());
    }

    #[test]
    fn loader_yields_device_tensors() {
        let tmp = tempfile::tempdir().unwrap();
        write_patient_frames(&tmp.path().join("p00"), &["Wake", "N1", "N2", "N3", "REM"]);
        let list = vec![Patient { id: "p00".into() }];
        let dataset = SleepSeqDataset::new(
            &list,
            tmp.path(),
            &stage_labels(),
            2,
            FrameTransform { image_size: 8 },
        )
        .unwrap();
        let pool = decode_pool(2).unwrap();
        let device = Device::Cpu;
        let mut loader = BatchLoader::sequential(&dataset, 3, &pool, &device);
        let (frames, labels) = loader.next_batch().unwrap().unwrap();
        assert_eq!(frames.dims(), &[3, 2, 1, 8, 8]);
        assert_eq!(labels.dims(), &[3]);
        // 4 windows, batch 3 → final partial batch of 1.
        let (frames, _) = loader.next_batch().unwrap().unwrap();
        assert_eq!(frames.dims(), &[1, 2, 1, 8, 8]);
        assert!(loader.next_batch().unwrap().is_none());
    }

    #[test]
    fn manifest_parses_patient_field() {
        let manifest: Manifest =
            serde_json::from_str(r#"{ "Patient": [{ "id": "p00" }, { "id": "p01" }] }"#).unwrap();
        assert_eq!(manifest.patients.len(), 2);
        assert_eq!(manifest.patients[0].id, "p00");
    }
}
