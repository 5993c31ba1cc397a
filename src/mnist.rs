use braille_rs::BrailleChar;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    ops::Range,
    path::Path,
};
use thiserror::Error;

pub const IMAGE_SIDE: usize = 28;
pub const IMAGE_PIXELS: usize = IMAGE_SIDE * IMAGE_SIDE;
pub const CLASSES: usize = 10;

const TYPE_UBYTE: u8 = 0x08;
const TYPE_F32: u8 = 0x0D;
const TYPE_F64: u8 = 0x0E;

#[derive(Debug, Error)]
pub enum MnistError {
    #[error("i/o error while reading dataset: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad IDX magic {0:02x?}, expected [00, 00, type, ndim]")]
    BadMagic([u8; 4]),
    #[error("unsupported IDX element type 0x{0:02x}")]
    UnsupportedType(u8),
    #[error("{record} record has {found} dimensions, expected {expected}")]
    Dimensions {
        record: &'static str,
        expected: &'static str,
        found: u8,
    },
    #[error("IDX payload truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("{images} images but {labels} labels")]
    LengthMismatch { images: usize, labels: usize },
    #[error("label {label} at index {index} is not a digit class 0-9")]
    LabelOutOfRange { index: usize, label: u8 },
    #[error("split {start}..{end} exceeds dataset of {len} examples")]
    SplitOutOfRange { start: usize, end: usize, len: usize },
    #[error("dimension {0} does not fit in an IDX header")]
    TooLarge(usize),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

type Result<T> = std::result::Result<T, MnistError>;

/// The raw decoded arrays: one row of pixel intensities in `[0, 1]` per image
/// and one class label per image.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub images: Array2<f32>,
    pub labels: Array1<u8>,
}

impl Dataset {
    pub fn new(images: Array2<f32>, labels: Array1<u8>) -> Result<Self> {
        if images.nrows() != labels.len() {
            return Err(MnistError::LengthMismatch {
                images: images.nrows(),
                labels: labels.len(),
            });
        }

        if let Some((index, &label)) = labels
            .iter()
            .enumerate()
            .find(|(_, label)| **label as usize >= CLASSES)
        {
            return Err(MnistError::LabelOutOfRange { index, label });
        }

        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of pixels per image.
    pub fn input_dim(&self) -> usize {
        self.images.ncols()
    }

    /// The first `n` examples (or all of them if there are fewer).
    pub fn head(&self, n: usize) -> Dataset {
        let n = n.min(self.len());
        Dataset {
            images: self.images.slice(s![..n, ..]).to_owned(),
            labels: self.labels.slice(s![..n]).to_owned(),
        }
    }

    /// Borrow rows `range` without copying or casting.
    pub fn raw(
        &self,
        range: Range<usize>,
    ) -> Result<(ArrayView2<'_, f32>, ArrayView1<'_, u8>)> {
        self.check_range(&range)?;
        Ok((
            self.images.slice(s![range.clone(), ..]),
            self.labels.slice(s![range]),
        ))
    }

    /// Copy rows `range` into a split, casting images to `f64` and labels to
    /// indices.
    pub fn split(&self, range: Range<usize>) -> Result<Split> {
        let (images, labels) = self.raw(range)?;
        Ok(Split {
            images: cast_images(images),
            labels: cast_labels(labels),
        })
    }

    pub fn splits(&self, layout: &SplitLayout) -> Result<Splits> {
        Ok(Splits {
            train: self.split(layout.train_range())?,
            valid: self.split(layout.valid_range())?,
            test: self.split(layout.test_range())?,
        })
    }

    fn check_range(&self, range: &Range<usize>) -> Result<()> {
        if range.start > range.end || range.end > self.len() {
            return Err(MnistError::SplitOutOfRange {
                start: range.start,
                end: range.end,
                len: self.len(),
            });
        }
        Ok(())
    }
}

/// Sizes of the three contiguous splits, laid out train, validation, test
/// from the start of the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitLayout {
    pub train: usize,
    pub valid: usize,
    pub test: usize,
}

impl Default for SplitLayout {
    fn default() -> Self {
        Self {
            train: 1000,
            valid: 100,
            test: 100,
        }
    }
}

impl SplitLayout {
    pub fn train_range(&self) -> Range<usize> {
        0..self.train
    }

    pub fn valid_range(&self) -> Range<usize> {
        self.train..self.train + self.valid
    }

    pub fn test_range(&self) -> Range<usize> {
        let start = self.train + self.valid;
        start..start + self.test
    }

    pub fn total(&self) -> usize {
        self.train + self.valid + self.test
    }
}

/// An owned, contiguous split that minibatches are sliced out of by view.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub images: Array2<f64>,
    pub labels: Array1<usize>,
}

impl Split {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of full minibatches; a trailing partial batch is never used.
    pub fn n_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            return 0;
        }
        self.len() / batch_size
    }

    /// Rows `[index * batch_size, (index + 1) * batch_size)`.
    ///
    /// Panics if the batch runs past the end of the split.
    pub fn batch(
        &self,
        index: usize,
        batch_size: usize,
    ) -> (ArrayView2<'_, f64>, ArrayView1<'_, usize>) {
        let rows = index * batch_size..(index + 1) * batch_size;
        (
            self.images.slice(s![rows.clone(), ..]),
            self.labels.slice(s![rows]),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Splits {
    pub train: Split,
    pub valid: Split,
    pub test: Split,
}

pub fn cast_images(images: ArrayView2<'_, f32>) -> Array2<f64> {
    images.mapv(f64::from)
}

pub fn cast_labels(labels: ArrayView1<'_, u8>) -> Array1<usize> {
    labels.mapv(usize::from)
}

/// Read a gzip file holding an image IDX record followed by a label IDX record.
pub fn read(path: impl AsRef<Path>) -> Result<Dataset> {
    let file = File::open(path)?;
    read_from(BufReader::new(file))
}

pub fn read_from<R: Read>(reader: R) -> Result<Dataset> {
    let mut decoder = GzDecoder::new(reader);
    let images = read_images(&mut decoder)?;
    let labels = read_labels(&mut decoder)?;
    Dataset::new(images, labels)
}

/// Read the standard MNIST distribution, where images and labels each sit in
/// their own gzip file.
pub fn read_idx_pair(images: impl AsRef<Path>, labels: impl AsRef<Path>) -> Result<Dataset> {
    let mut images = GzDecoder::new(BufReader::new(File::open(images)?));
    let mut labels = GzDecoder::new(BufReader::new(File::open(labels)?));
    Dataset::new(read_images(&mut images)?, read_labels(&mut labels)?)
}

pub fn write(path: impl AsRef<Path>, dataset: &Dataset) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_to(&mut writer, dataset)?;
    writer.flush()?;
    Ok(())
}

/// Encode `dataset` as a gzip stream of two IDX records: `f32` images, then
/// byte labels.
pub fn write_to<W: Write>(writer: W, dataset: &Dataset) -> Result<()> {
    let mut encoder = GzEncoder::new(writer, Compression::default());

    write_header(&mut encoder, TYPE_F32, &[dataset.len(), dataset.input_dim()])?;
    for value in dataset.images.iter() {
        encoder.write_all(&value.to_be_bytes())?;
    }

    write_header(&mut encoder, TYPE_UBYTE, &[dataset.len()])?;
    for label in dataset.labels.iter() {
        encoder.write_all(&[*label])?;
    }

    encoder.finish()?;
    Ok(())
}

fn write_header<W: Write>(writer: &mut W, kind: u8, dims: &[usize]) -> Result<()> {
    let ndim = u8::try_from(dims.len()).map_err(|_| MnistError::TooLarge(dims.len()))?;
    writer.write_all(&[0, 0, kind, ndim])?;
    for &dim in dims {
        let dim = u32::try_from(dim).map_err(|_| MnistError::TooLarge(dim))?;
        writer.write_all(&dim.to_be_bytes())?;
    }
    Ok(())
}

struct IdxHeader {
    kind: u8,
    dims: Vec<usize>,
}

impl IdxHeader {
    fn element_size(&self) -> Result<usize> {
        match self.kind {
            TYPE_UBYTE => Ok(1),
            TYPE_F32 => Ok(4),
            TYPE_F64 => Ok(8),
            other => Err(MnistError::UnsupportedType(other)),
        }
    }
}

fn read_header<R: Read>(reader: &mut R) -> Result<IdxHeader> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;

    match magic {
        [0, 0, kind, ndim] => {
            let mut dims = Vec::with_capacity(ndim as usize);
            for _ in 0..ndim {
                let mut dim = [0u8; 4];
                reader.read_exact(&mut dim)?;
                dims.push(u32::from_be_bytes(dim) as usize);
            }
            Ok(IdxHeader { kind, dims })
        }
        _ => Err(MnistError::BadMagic(magic)),
    }
}

// Reads exactly `len` bytes without trusting the header for the allocation size.
fn read_payload<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(MnistError::Truncated {
            expected: len,
            found: bytes.len(),
        });
    }
    Ok(bytes)
}

fn read_images<R: Read>(reader: &mut R) -> Result<Array2<f32>> {
    let header = read_header(reader)?;
    if header.dims.len() < 2 {
        return Err(MnistError::Dimensions {
            record: "image",
            expected: "at least 2",
            found: header.dims.len() as u8,
        });
    }

    let rows = header.dims[0];
    let columns = header.dims[1..]
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or(MnistError::TooLarge(usize::MAX))?;
    let element_size = header.element_size()?;
    let len = rows
        .checked_mul(columns)
        .and_then(|len| len.checked_mul(element_size))
        .ok_or(MnistError::TooLarge(rows))?;
    let bytes = read_payload(reader, len)?;

    let values: Vec<f32> = match header.kind {
        TYPE_UBYTE => bytes.into_iter().map(|byte| byte as f32 / 255.).collect(),
        TYPE_F32 => bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
        _ => bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_be_bytes(raw) as f32
            })
            .collect(),
    };

    Ok(Array2::from_shape_vec((rows, columns), values)?)
}

fn read_labels<R: Read>(reader: &mut R) -> Result<Array1<u8>> {
    let header = read_header(reader)?;
    if header.dims.len() != 1 {
        return Err(MnistError::Dimensions {
            record: "label",
            expected: "1",
            found: header.dims.len() as u8,
        });
    }
    if header.kind != TYPE_UBYTE {
        return Err(MnistError::UnsupportedType(header.kind));
    }

    Ok(Array1::from(read_payload(reader, header.dims[0])?))
}

/// Draw a 28x28 image as braille, one character per 2x4 block of pixels.
///
/// Panics if `image` has fewer than [`IMAGE_PIXELS`] pixels.
pub fn render(image: ArrayView1<'_, f32>, threshold: f32) -> String {
    let mut canvas = String::new();

    let mut grid = [false; IMAGE_PIXELS];

    for (i, cell) in grid.iter_mut().enumerate() {
        *cell = image[i] >= threshold;
    }

    let lines = grid.chunks_exact(IMAGE_SIDE * 4);

    for line in lines {
        for i in 0..IMAGE_SIDE / 2 {
            let left = 2 * i;
            let right = 2 * i + 1;
            let byte = (line[left] as u8)
                | ((line[IMAGE_SIDE + left] as u8) << 1)
                | ((line[IMAGE_SIDE * 2 + left] as u8) << 2)
                | ((line[IMAGE_SIDE * 3 + left] as u8) << 3)
                | ((line[right] as u8) << 4)
                | ((line[IMAGE_SIDE + right] as u8) << 5)
                | ((line[IMAGE_SIDE * 2 + right] as u8) << 6)
                | ((line[IMAGE_SIDE * 3 + right] as u8) << 7);

            canvas.push(BrailleChar::with_data(byte).into())
        }
        canvas.push('\n')
    }

    canvas
}
