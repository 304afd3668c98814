//! Stages of the image-statistics pipeline.
//!
//! * [`Fetcher`] decodes the next input image to RGBA, keeps its top-left quarter and paints
//!   fully transparent pixels with a background colour.
//! * [`Statistics`] measures the character drawn in each cropped sample. A pixel belongs to the
//!   character when it is fully opaque (alpha 255).
//! * [`Logger`] collects the resulting records and writes them as CSV on shutdown.
//!
//! Each stage keeps its own unit index, so on a path connector unit `i` is read from and
//! written to `<dir>/<i>.<ext>`.

// Import connectors and the per-unit file naming
use crate::connector::{unit_path, Connector};
// Import stage and configuration errors
use crate::error::{ConfigError, StageError};
// Import the trait every stage implements
use crate::worker::Stage;
// Import RGBA buffers and the crop helper
use image::{imageops, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
// Import recursive directory traversal for input discovery
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 3] = ["gif", "png", "jpg"];

/// RGB triple used to repaint transparent background pixels.
pub type Rgb = [u8; 3];

/// White, the background applied unless configured otherwise.
pub const DEFAULT_BACKGROUND: Rgb = [255, 255, 255];

/// Recursively list image files under `dir`, sorted by path.
///
/// # Arguments
/// * `dir` - Root of the input tree
///
/// # Returns
/// Paths ending in `gif`, `png` or `jpg`, or [`ConfigError::InputDir`] when `dir` cannot be read
pub fn discover_inputs(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|err| ConfigError::InputDir {
            path: dir.to_path_buf(),
            source: err.into(),
        })?;
        if entry.file_type().is_file() && has_image_extension(entry.path()) {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext))
}

/// Top-left quarter of `image`: `width / 4` by `height / 4` pixels.
pub fn crop_top_left(image: &RgbaImage) -> RgbaImage {
    let (width, height) = image.dimensions();
    imageops::crop_imm(image, 0, 0, width / 4, height / 4).to_image()
}

/// Repaint the colour channels of every fully transparent pixel. Alpha is left at 0.
pub fn replace_background(image: &mut RgbaImage, colour: Rgb) {
    for pixel in image.pixels_mut() {
        if pixel.0[3] == 0 {
            pixel.0[..3].copy_from_slice(&colour);
        }
    }
}

/// Decode `path`, crop it and standardize its background.
///
/// # Arguments
/// * `path` - Image file in any format the decoder supports
/// * `background` - Colour for transparent pixels; `None` keeps them as decoded
pub fn load_sample(path: &Path, background: Option<Rgb>) -> Result<RgbaImage, StageError> {
    let decoded = image::open(path)
        .map_err(|err| StageError::image(path, err))?
        .to_rgba8();
    let mut sample = crop_top_left(&decoded);
    if let Some(colour) = background {
        replace_background(&mut sample, colour);
    }
    Ok(sample)
}

/// First stage: turns input files into cropped samples.
pub struct Fetcher {
    paths: Vec<PathBuf>,
    background: Option<Rgb>,
    next: usize,
    output: Connector<RgbaImage>,
}

impl Fetcher {
    /// Scan `input_dir` and prepare `output`. The caller seeds the worker with [`Fetcher::len`].
    ///
    /// # Arguments
    /// * `input_dir` - Directory scanned recursively by [`discover_inputs`]
    /// * `background` - Colour for transparent pixels, see [`replace_background`]
    /// * `output` - Buffer or directory receiving the cropped samples
    pub fn new(
        input_dir: &Path,
        background: Option<Rgb>,
        output: Connector<RgbaImage>,
    ) -> Result<Self, ConfigError> {
        let paths = discover_inputs(input_dir)?;
        tracing::info!(dir = %input_dir.display(), files = paths.len(), "inputs discovered");
        Self::from_paths(paths, background, output)
    }

    pub fn from_paths(
        paths: Vec<PathBuf>,
        background: Option<Rgb>,
        output: Connector<RgbaImage>,
    ) -> Result<Self, ConfigError> {
        output.prepare_output()?;
        Ok(Self {
            paths,
            background,
            next: 0,
            output,
        })
    }

    /// Number of inputs, i.e. units this stage will process.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Stage for Fetcher {
    fn run(&mut self) -> Result<(), StageError> {
        let path = self.paths.get(self.next).ok_or_else(|| {
            StageError::Exhausted(format!("all {} inputs already fetched", self.paths.len()))
        })?;
        let sample = load_sample(path, self.background)?;

        match &self.output {
            Connector::Buffer(buffer) => buffer.push(sample),
            Connector::Path(dir) => {
                let out = unit_path(dir, self.next, "png");
                sample.save(&out).map_err(|err| StageError::image(&out, err))?;
            }
        }
        self.next += 1;
        Ok(())
    }
}

/// Opaque pixels of a sample, the pixels that make up the character.
struct CharacterMask {
    width: usize,
    height: usize,
    cells: Vec<bool>,
}

impl CharacterMask {
    fn new(image: &RgbaImage) -> Self {
        Self {
            width: image.width() as usize,
            height: image.height() as usize,
            cells: image.pixels().map(|pixel| pixel.0[3] == 255).collect(),
        }
    }

    fn at(&self, x: usize, y: usize) -> bool {
        self.cells[y * self.width + x]
    }

    fn column_hit(&self, x: usize) -> bool {
        (0..self.height).any(|y| self.at(x, y))
    }

    fn row_hit(&self, y: usize) -> bool {
        (0..self.width).any(|x| self.at(x, y))
    }

    fn count(&self) -> usize {
        self.cells.iter().filter(|&&hit| hit).count()
    }

    /// Left, right, top and bottom margins around the character; -1 each when there is none.
    fn offsets(&self) -> Offsets {
        let (w, h) = (self.width, self.height);
        Offsets {
            left: first_hit(w, |i| self.column_hit(i)),
            right: first_hit(w, |i| self.column_hit(w - 1 - i)),
            top: first_hit(h, |i| self.row_hit(i)),
            bottom: first_hit(h, |i| self.row_hit(h - 1 - i)),
        }
    }

    /// Width and height of the character's bounding box; -1 each when there is no character.
    fn size(&self) -> (i64, i64) {
        let offsets = self.offsets();
        if offsets.left < 0 {
            return (-1, -1);
        }
        (
            self.width as i64 - offsets.right - offsets.left,
            self.height as i64 - offsets.top - offsets.bottom,
        )
    }

    /// Bounding box area, 0 when there is no character.
    fn bounding_box_area(&self) -> i64 {
        match self.size() {
            (width, height) if width >= 0 && height >= 0 => width * height,
            _ => 0,
        }
    }

    /// RGB channels of the opaque pixels.
    fn colours<'a>(&'a self, image: &'a RgbaImage) -> impl Iterator<Item = [f64; 3]> + 'a {
        image
            .pixels()
            .zip(&self.cells)
            .filter(|(_, hit)| **hit)
            .map(|(pixel, _)| {
                let [r, g, b, _] = pixel.0;
                [f64::from(r), f64::from(g), f64::from(b)]
            })
    }
}

fn first_hit(len: usize, hit: impl Fn(usize) -> bool) -> i64 {
    (0..len).position(hit).map_or(-1, |i| i as i64)
}

struct Offsets {
    left: i64,
    right: i64,
    top: i64,
    bottom: i64,
}

/// Population standard deviation of each colour channel over the character, truncated.
fn colour_variety(image: &RgbaImage, mask: &CharacterMask) -> [i64; 3] {
    let n = mask.count();
    if n == 0 {
        return [-1; 3];
    }
    let mut sum = [0.0; 3];
    for colour in mask.colours(image) {
        for (acc, value) in sum.iter_mut().zip(colour) {
            *acc += value;
        }
    }
    let mean = sum.map(|total| total / n as f64);
    let mut squares = [0.0; 3];
    for colour in mask.colours(image) {
        for channel in 0..3 {
            squares[channel] += (colour[channel] - mean[channel]).powi(2);
        }
    }
    squares.map(|total| (total / n as f64).sqrt() as i64)
}

/// Mean of every colour value over the character, or -1 without one.
fn brightness(image: &RgbaImage, mask: &CharacterMask) -> f64 {
    let n = mask.count();
    if n == 0 {
        return -1.0;
    }
    let total: f64 = mask.colours(image).map(|[r, g, b]| r + g + b).sum();
    total / (3 * n) as f64
}

fn ratio(part: usize, whole: i64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64
    } else {
        -1.0
    }
}

/// Measurement family computed over one sample. Each fills one or more columns of
/// [`ImageStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statistic {
    /// `ResWidth`, `ResHeight`.
    Resolution,
    /// `N_Pixels`.
    NPixels,
    /// `LeftOffset`, `RightOffset`, `TopOffset`, `BottomOffset`.
    Offsets,
    /// `Width`, `Height` of the character's bounding box.
    Sizes,
    /// `BoundingBoxArea`.
    BoundingBox,
    /// `CharacterSize`, the number of opaque pixels.
    CharacterSize,
    /// `SizeToImageRatio`, `SizeToBoundingBoxRatio`.
    Ratios,
    /// `VarietyRed`, `VarietyGreen`, `VarietyBlue`.
    Variety,
    /// `Brightness`.
    Brightness,
}

impl Statistic {
    pub const ALL: [Statistic; 9] = [
        Statistic::Resolution,
        Statistic::NPixels,
        Statistic::Offsets,
        Statistic::Sizes,
        Statistic::BoundingBox,
        Statistic::CharacterSize,
        Statistic::Ratios,
        Statistic::Variety,
        Statistic::Brightness,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Statistic::Resolution => "resolution",
            Statistic::NPixels => "n_pixels",
            Statistic::Offsets => "offsets",
            Statistic::Sizes => "sizes",
            Statistic::BoundingBox => "bbox",
            Statistic::CharacterSize => "char size",
            Statistic::Ratios => "ratios",
            Statistic::Variety => "variety",
            Statistic::Brightness => "brightness",
        }
    }

    fn apply(self, image: &RgbaImage, mask: &CharacterMask, out: &mut ImageStatistics) {
        let (width, height) = image.dimensions();
        let n_pixels = u64::from(width) * u64::from(height);
        match self {
            Statistic::Resolution => {
                out.res_width = Some(width);
                out.res_height = Some(height);
            }
            Statistic::NPixels => out.n_pixels = Some(n_pixels),
            Statistic::Offsets => {
                let offsets = mask.offsets();
                out.left_offset = Some(offsets.left);
                out.right_offset = Some(offsets.right);
                out.top_offset = Some(offsets.top);
                out.bottom_offset = Some(offsets.bottom);
            }
            Statistic::Sizes => {
                let (w, h) = mask.size();
                out.width = Some(w);
                out.height = Some(h);
            }
            Statistic::BoundingBox => out.bounding_box_area = Some(mask.bounding_box_area()),
            Statistic::CharacterSize => out.character_size = Some(mask.count() as u64),
            Statistic::Ratios => {
                let count = mask.count();
                out.size_to_image_ratio = Some(ratio(count, n_pixels as i64));
                out.size_to_bounding_box_ratio = Some(ratio(count, mask.bounding_box_area()));
            }
            Statistic::Variety => {
                let [r, g, b] = colour_variety(image, mask);
                out.variety_red = Some(r);
                out.variety_green = Some(g);
                out.variety_blue = Some(b);
            }
            Statistic::Brightness => out.brightness = Some(brightness(image, mask)),
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Statistic {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "resolution" => Ok(Statistic::Resolution),
            "n_pixels" => Ok(Statistic::NPixels),
            "offsets" | "offset" => Ok(Statistic::Offsets),
            "sizes" | "size" => Ok(Statistic::Sizes),
            "bbox" | "bounding box" => Ok(Statistic::BoundingBox),
            "char size" | "character size" => Ok(Statistic::CharacterSize),
            "ratios" | "ratio" => Ok(Statistic::Ratios),
            "variety" | "color variety" => Ok(Statistic::Variety),
            "brightness" => Ok(Statistic::Brightness),
            _ => Err(ConfigError::UnknownStatistic(value.to_string())),
        }
    }
}

/// Measurements of one sample. Columns whose statistic was not requested stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageStatistics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub res_width: Option<u32>,
    #[serde(rename = "N_Pixels", skip_serializing_if = "Option::is_none")]
    pub n_pixels: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub res_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bottom_offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box_area: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_to_image_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_to_bounding_box_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variety_red: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variety_green: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variety_blue: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
}

impl ImageStatistics {
    /// Header of the results file, `Path` followed by one column per field.
    pub const COLUMNS: [&'static str; 18] = [
        "Path",
        "ResWidth",
        "N_Pixels",
        "ResHeight",
        "LeftOffset",
        "RightOffset",
        "TopOffset",
        "BottomOffset",
        "Width",
        "Height",
        "BoundingBoxArea",
        "CharacterSize",
        "SizeToImageRatio",
        "SizeToBoundingBoxRatio",
        "VarietyRed",
        "VarietyGreen",
        "VarietyBlue",
        "Brightness",
    ];

    /// CSV cells in [`Self::COLUMNS`] order, empty where a statistic was not requested.
    pub fn csv_row(&self, path: &str) -> Vec<String> {
        fn cell<T: ToString>(value: Option<T>) -> String {
            value.map(|v| v.to_string()).unwrap_or_default()
        }
        vec![
            path.to_string(),
            cell(self.res_width),
            cell(self.n_pixels),
            cell(self.res_height),
            cell(self.left_offset),
            cell(self.right_offset),
            cell(self.top_offset),
            cell(self.bottom_offset),
            cell(self.width),
            cell(self.height),
            cell(self.bounding_box_area),
            cell(self.character_size),
            cell(self.size_to_image_ratio),
            cell(self.size_to_bounding_box_ratio),
            cell(self.variety_red),
            cell(self.variety_green),
            cell(self.variety_blue),
            cell(self.brightness),
        ]
    }
}

/// Statistics for one sample, tagged with where the sample came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Statistics")]
    pub statistics: ImageStatistics,
}

/// Second stage: measures cropped samples.
pub struct Statistics {
    stats: Vec<Statistic>,
    input: Connector<RgbaImage>,
    output: Connector<StatsRecord>,
    next: usize,
}

impl Statistics {
    /// Parse the requested statistic names and prepare the output side.
    ///
    /// # Arguments
    /// * `names` - Statistic names or aliases, computed in this order
    /// * `input` - Where cropped samples arrive
    /// * `output` - Where records are sent
    ///
    /// # Returns
    /// [`ConfigError::UnknownStatistic`] on an unrecognized name, or
    /// [`ConfigError::OutputDir`] when an output directory cannot be created
    pub fn new<S: AsRef<str>>(
        names: &[S],
        input: Connector<RgbaImage>,
        output: Connector<StatsRecord>,
    ) -> Result<Self, ConfigError> {
        let stats = names
            .iter()
            .map(|name| name.as_ref().parse())
            .collect::<Result<Vec<Statistic>, _>>()?;
        output.prepare_output()?;
        Ok(Self {
            stats,
            input,
            output,
            next: 0,
        })
    }

    pub fn statistics(&self) -> &[Statistic] {
        &self.stats
    }

    pub fn measure(&self, sample: &RgbaImage) -> ImageStatistics {
        let mask = CharacterMask::new(sample);
        let mut out = ImageStatistics::default();
        for stat in &self.stats {
            stat.apply(sample, &mask, &mut out);
        }
        out
    }

    fn read_sample(&self) -> Result<(String, RgbaImage), StageError> {
        match &self.input {
            Connector::Buffer(buffer) => {
                let sample = buffer
                    .pop()
                    .ok_or_else(|| StageError::Exhausted("sample buffer is empty".into()))?;
                Ok((format!("{}.png", self.next), sample))
            }
            Connector::Path(dir) => {
                let path = unit_path(dir, self.next, "png");
                let sample = image::open(&path)
                    .map_err(|err| StageError::image(&path, err))?
                    .to_rgba8();
                Ok((path.display().to_string(), sample))
            }
        }
    }
}

impl Stage for Statistics {
    fn run(&mut self) -> Result<(), StageError> {
        let (path, sample) = self.read_sample()?;
        let record = StatsRecord {
            path,
            statistics: self.measure(&sample),
        };

        match &self.output {
            Connector::Buffer(buffer) => buffer.push(record),
            Connector::Path(dir) => {
                let out = unit_path(dir, self.next, "json");
                let json = serde_json::to_vec(&record)?;
                fs::write(&out, json).map_err(|err| StageError::io(&out, err))?;
            }
        }
        self.next += 1;
        Ok(())
    }
}

/// Final stage: collects records and writes them as CSV when the worker shuts down.
pub struct Logger {
    input: Connector<StatsRecord>,
    output_file: Option<PathBuf>,
    verbose: bool,
    rows: Vec<StatsRecord>,
    next: usize,
}

impl Logger {
    /// # Arguments
    /// * `input` - Where records arrive
    /// * `output_file` - CSV written on shutdown; `None` keeps nothing
    /// * `verbose` - Log each record at `info` as it arrives
    pub fn new(input: Connector<StatsRecord>, output_file: Option<PathBuf>, verbose: bool) -> Self {
        Self {
            input,
            output_file,
            verbose,
            rows: Vec::new(),
            next: 0,
        }
    }

    /// Records collected so far. Only kept when an output file is configured.
    pub fn rows(&self) -> &[StatsRecord] {
        &self.rows
    }

    fn read_record(&self) -> Result<StatsRecord, StageError> {
        match &self.input {
            Connector::Buffer(buffer) => buffer
                .pop()
                .ok_or_else(|| StageError::Exhausted("record buffer is empty".into())),
            Connector::Path(dir) => {
                let path = unit_path(dir, self.next, "json");
                let raw = fs::read(&path).map_err(|err| StageError::io(&path, err))?;
                let mut record: StatsRecord = serde_json::from_slice(&raw)?;
                record.path = path.display().to_string();
                Ok(record)
            }
        }
    }

    fn write_rows(&self, path: &Path) -> Result<(), StageError> {
        let mut out = csv::Writer::from_path(path)?;
        out.write_record(ImageStatistics::COLUMNS)?;
        for row in &self.rows {
            out.write_record(row.statistics.csv_row(&row.path))?;
        }
        out.flush().map_err(|err| StageError::io(path, err))
    }
}

impl Stage for Logger {
    fn run(&mut self) -> Result<(), StageError> {
        let record = self.read_record()?;
        if self.verbose {
            tracing::info!(path = %record.path, statistics = ?record.statistics, "statistics");
        }
        if self.output_file.is_some() {
            self.rows.push(record);
        }
        self.next += 1;
        Ok(())
    }

    fn clean(&mut self) -> Result<(), StageError> {
        if let Some(path) = &self.output_file {
            self.write_rows(path)?;
            tracing::info!(path = %path.display(), rows = self.rows.len(), "results written");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SharedBuffer;
    use image::Rgba;

    fn write(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    /// Transparent `width` x `height` canvas with the given opaque pixels.
    fn glyph(width: u32, height: u32, opaque: &[(u32, u32, Rgb)]) -> RgbaImage {
        let mut image = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));
        for &(x, y, [r, g, b]) in opaque {
            image.put_pixel(x, y, Rgba([r, g, b, 255]));
        }
        image
    }

    fn measure_all(sample: &RgbaImage) -> ImageStatistics {
        let stage = Statistics::new(
            &Statistic::ALL.map(Statistic::as_str),
            Connector::Buffer(SharedBuffer::new()),
            Connector::Buffer(SharedBuffer::new()),
        )
        .unwrap();
        stage.measure(sample)
    }

    #[test]
    fn discovery_recurses_and_filters_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        write(&tmp.path().join("b.png"), b"x");
        write(&tmp.path().join("a.jpg"), b"x");
        write(&tmp.path().join("notes.txt"), b"x");
        write(&tmp.path().join("nested/deeper/c.gif"), b"x");

        let found = discover_inputs(tmp.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.png", "c.gif"]);
    }

    #[test]
    fn discovery_of_missing_dir_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = discover_inputs(&tmp.path().join("absent")).unwrap_err();
        assert!(matches!(err, ConfigError::InputDir { .. }));
    }

    #[test]
    fn crop_keeps_top_left_quarter() {
        let image = RgbaImage::from_fn(8, 12, |x, y| Rgba([x as u8, y as u8, 0, 255]));
        let cropped = crop_top_left(&image);
        assert_eq!(cropped.dimensions(), (2, 3));
        assert_eq!(cropped.get_pixel(1, 2), &Rgba([1, 2, 0, 255]));
    }

    #[test]
    fn background_only_touches_transparent_pixels() {
        let mut image = glyph(2, 1, &[(0, 0, [10, 20, 30])]);
        image.put_pixel(1, 0, Rgba([1, 2, 3, 0]));
        replace_background(&mut image, [255, 255, 255]);
        assert_eq!(image.get_pixel(0, 0), &Rgba([10, 20, 30, 255]));
        assert_eq!(image.get_pixel(1, 0), &Rgba([255, 255, 255, 0]));
    }

    #[test]
    fn fetcher_decodes_crops_and_exhausts() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("img.png");
        glyph(8, 8, &[(1, 1, [9, 9, 9])]).save(&input).unwrap();

        let buffer = SharedBuffer::new();
        let mut fetcher = Fetcher::from_paths(
            vec![input],
            Some(DEFAULT_BACKGROUND),
            Connector::Buffer(buffer.clone()),
        )
        .unwrap();
        assert_eq!(fetcher.len(), 1);

        fetcher.run().unwrap();
        let sample = buffer.pop().unwrap();
        assert_eq!(sample.dimensions(), (2, 2));
        assert_eq!(sample.get_pixel(1, 1), &Rgba([9, 9, 9, 255]));
        assert_eq!(sample.get_pixel(0, 0), &Rgba([255, 255, 255, 0]));
        assert!(matches!(fetcher.run(), Err(StageError::Exhausted(_))));
    }

    #[test]
    fn fetcher_reports_undecodable_input() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("broken.png");
        write(&input, b"not a png");

        let mut fetcher =
            Fetcher::from_paths(vec![input], None, Connector::Buffer(SharedBuffer::new())).unwrap();
        assert!(matches!(fetcher.run(), Err(StageError::Image { .. })));
    }

    #[test]
    fn statistics_over_known_glyph() {
        // Semi-transparent pixels are neither character nor background.
        let mut sample = glyph(6, 4, &[(1, 1, [10, 20, 30]), (3, 2, [30, 20, 10])]);
        sample.put_pixel(0, 0, Rgba([200, 200, 200, 128]));

        let stats = measure_all(&sample);
        assert_eq!((stats.res_width, stats.res_height), (Some(6), Some(4)));
        assert_eq!(stats.n_pixels, Some(24));
        assert_eq!(stats.left_offset, Some(1));
        assert_eq!(stats.right_offset, Some(2));
        assert_eq!(stats.top_offset, Some(1));
        assert_eq!(stats.bottom_offset, Some(1));
        assert_eq!((stats.width, stats.height), (Some(3), Some(2)));
        assert_eq!(stats.bounding_box_area, Some(6));
        assert_eq!(stats.character_size, Some(2));
        assert_eq!(stats.size_to_image_ratio, Some(2.0 / 24.0));
        assert_eq!(stats.size_to_bounding_box_ratio, Some(2.0 / 6.0));
        assert_eq!(
            (stats.variety_red, stats.variety_green, stats.variety_blue),
            (Some(10), Some(0), Some(10))
        );
        assert_eq!(stats.brightness, Some(20.0));
    }

    #[test]
    fn sample_without_character_reports_sentinels() {
        let stats = measure_all(&glyph(4, 4, &[]));
        assert_eq!(stats.left_offset, Some(-1));
        assert_eq!(stats.bottom_offset, Some(-1));
        assert_eq!((stats.width, stats.height), (Some(-1), Some(-1)));
        assert_eq!(stats.bounding_box_area, Some(0));
        assert_eq!(stats.character_size, Some(0));
        assert_eq!(stats.size_to_image_ratio, Some(0.0));
        assert_eq!(stats.size_to_bounding_box_ratio, Some(-1.0));
        assert_eq!(stats.variety_red, Some(-1));
        assert_eq!(stats.brightness, Some(-1.0));
    }

    #[test]
    fn empty_crop_has_no_image_ratio() {
        let stats = measure_all(&RgbaImage::new(0, 0));
        assert_eq!(stats.n_pixels, Some(0));
        assert_eq!(stats.size_to_image_ratio, Some(-1.0));
    }

    #[test]
    fn statistic_names_and_aliases_parse() {
        for stat in Statistic::ALL {
            assert_eq!(stat.as_str().parse::<Statistic>().unwrap(), stat);
        }
        assert_eq!("Offset".parse::<Statistic>().unwrap(), Statistic::Offsets);
        assert_eq!("bounding box".parse::<Statistic>().unwrap(), Statistic::BoundingBox);
        assert_eq!("character size".parse::<Statistic>().unwrap(), Statistic::CharacterSize);
        assert_eq!("color variety".parse::<Statistic>().unwrap(), Statistic::Variety);
    }

    #[test]
    fn unknown_statistic_fails_construction() {
        let result = Statistics::new(
            &["resolution", "hue"],
            Connector::Buffer(SharedBuffer::new()),
            Connector::Buffer(SharedBuffer::new()),
        );
        assert!(matches!(result, Err(ConfigError::UnknownStatistic(name)) if name == "hue"));
    }

    #[test]
    fn statistics_reads_and_writes_unit_files() {
        let tmp = tempfile::tempdir().unwrap();
        let cropped = tmp.path().join("cropped");
        let stats_dir = tmp.path().join("stats");
        fs::create_dir_all(&cropped).unwrap();
        glyph(3, 2, &[(0, 0, [1, 1, 1])]).save(cropped.join("0.png")).unwrap();

        let mut stage = Statistics::new(
            &["resolution", "char size"],
            Connector::Path(cropped.clone()),
            Connector::Path(stats_dir.clone()),
        )
        .unwrap();
        stage.run().unwrap();

        let raw = fs::read(stats_dir.join("0.json")).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["Path"], cropped.join("0.png").display().to_string());
        assert_eq!(json["Statistics"]["ResWidth"], 3);
        assert_eq!(json["Statistics"]["CharacterSize"], 1);
        assert!(json["Statistics"].get("Brightness").is_none());
    }

    #[test]
    fn logger_writes_csv_on_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("results.csv");
        let records = SharedBuffer::new();
        for i in 0..2 {
            records.push(StatsRecord {
                path: format!("{i}.png"),
                statistics: ImageStatistics {
                    res_width: Some(i),
                    brightness: Some(0.5),
                    ..ImageStatistics::default()
                },
            });
        }

        let mut logger = Logger::new(Connector::Buffer(records), Some(out.clone()), false);
        logger.run().unwrap();
        logger.run().unwrap();
        assert_eq!(logger.rows().len(), 2);
        logger.clean().unwrap();

        let mut reader = csv::Reader::from_path(&out).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(header, ImageStatistics::COLUMNS);
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][0], "1.png");
        assert_eq!(&rows[1][1], "1");
        assert_eq!(&rows[1][2], "");
        assert_eq!(&rows[1][17], "0.5");
    }

    #[test]
    fn logger_without_output_keeps_nothing() {
        let records = SharedBuffer::new();
        records.push(StatsRecord {
            path: "0.png".into(),
            statistics: ImageStatistics::default(),
        });
        let mut logger = Logger::new(Connector::Buffer(records), None, true);
        logger.run().unwrap();
        assert!(logger.rows().is_empty());
        logger.clean().unwrap();
    }
}
