//! Random IFS fractal generator
//!
//! Draws contractive affine iterated function systems, runs the chaos game
//! and renders the attractor. [`generate_fractals`] appends the results to a
//! descriptor file and writes `frac<N>.png` next to it, the layout
//! [`FractalDataset`](super::FractalDataset) reads.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info, instrument};

use super::datasets::FractalStats;
use crate::error::{Error, Result};

/// Iterations discarded before points are recorded
const BURN_IN: usize = 100;

const BACKGROUND: u8 = 255;
const INK: u8 = 0;

/// Generator settings
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    /// Fractals to append
    pub num_fractals: usize,
    /// Affine maps per IFS
    pub num_functions: usize,
    /// Chaos game points per fractal
    pub num_points: usize,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Viewing window `[min_x, max_x, min_y, max_y]`
    pub window: [f64; 4],
    /// Base seed; fractal `i` uses its own stream derived from it
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            num_fractals: 100,
            num_functions: 2,
            num_points: 10_000,
            width: 640,
            height: 640,
            window: [-8.0, 8.0, -8.0, 8.0],
            seed: 42,
        }
    }
}

impl GeneratorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_functions == 0 {
            return Err(Error::config("num_functions must be > 0"));
        }
        if self.num_points == 0 {
            return Err(Error::config("num_points must be > 0"));
        }
        if self.width < 2 || self.height < 2 {
            return Err(Error::config(format!(
                "image must be at least 2x2, got {}x{}",
                self.width, self.height
            )));
        }
        let [min_x, max_x, min_y, max_y] = self.window;
        if !self.window.iter().all(|v| v.is_finite()) || min_x >= max_x || min_y >= max_y {
            return Err(Error::config(format!("invalid viewing window {:?}", self.window)));
        }
        Ok(())
    }
}

/// Spectral radius of `[[a, b], [c, d]]` when both eigenvalues are real and
/// inside the unit circle, `None` otherwise
pub fn spectral_radius(a: f64, b: f64, c: f64, d: f64) -> Option<f64> {
    let trace = a + d;
    let det = a * d - b * c;
    let discr = trace * trace - 4.0 * det;
    if discr < 0.0 {
        return None;
    }
    let root = discr.sqrt();
    let l1 = ((trace + root) * 0.5).abs();
    let l2 = ((trace - root) * 0.5).abs();
    if l1 >= 1.0 || l2 >= 1.0 {
        return None;
    }
    Some(l1.max(l2)).filter(|r| *r > 0.0)
}

/// `(x, y) -> (a x + b y + e, c x + d y + f)`, chosen with `probability`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineMap {
    /// Linear part, row-major
    pub matrix: [f64; 4],
    /// Translation
    pub offset: [f64; 2],
    /// Selection probability
    pub probability: f64,
    /// Spectral radius of the linear part
    pub spectral_radius: f64,
}

impl AffineMap {
    /// Apply the map to a point
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let [a, b, c, d] = self.matrix;
        let [e, f] = self.offset;
        (a * x + b * y + e, c * x + d * y + f)
    }
}

/// An IFS with its maps ordered by increasing spectral radius
#[derive(Debug, Clone, PartialEq)]
pub struct IfsGenome {
    maps: Vec<AffineMap>,
}

impl IfsGenome {
    /// Draw a random contractive IFS. Linear coefficients and offsets are
    /// uniform in `[-1, 1)`; a map is redrawn until it is contractive with
    /// real eigenvalues. Probabilities are proportional to spectral radii.
    pub fn random<R: Rng>(num_functions: usize, rng: &mut R) -> Result<Self> {
        if num_functions == 0 {
            return Err(Error::config("an IFS needs at least one function"));
        }

        let mut maps: Vec<AffineMap> = (0..num_functions)
            .map(|_| {
                let (matrix, radius) = loop {
                    let m: [f64; 4] = std::array::from_fn(|_| rng.random_range(-1.0..1.0));
                    if let Some(radius) = spectral_radius(m[0], m[1], m[2], m[3]) {
                        break (m, radius);
                    }
                };
                AffineMap {
                    matrix,
                    offset: std::array::from_fn(|_| rng.random_range(-1.0..1.0)),
                    probability: 0.0,
                    spectral_radius: radius,
                }
            })
            .collect();

        let total: f64 = maps.iter().map(|m| m.spectral_radius).sum();
        for map in &mut maps {
            map.probability = map.spectral_radius / total;
        }
        maps.sort_by(|a, b| a.spectral_radius.total_cmp(&b.spectral_radius));

        Ok(Self { maps })
    }

    /// Maps of the system
    pub fn maps(&self) -> &[AffineMap] {
        &self.maps
    }

    /// Flattened genome in descriptor order: all multipliers, all offsets,
    /// all probabilities, all spectral radii
    pub fn to_vec(&self) -> Vec<f64> {
        let mut values = Vec::with_capacity(8 * self.maps.len());
        values.extend(self.maps.iter().flat_map(|m| m.matrix));
        values.extend(self.maps.iter().flat_map(|m| m.offset));
        values.extend(self.maps.iter().map(|m| m.probability));
        values.extend(self.maps.iter().map(|m| m.spectral_radius));
        values
    }

    fn pick(&self, u: f64) -> &AffineMap {
        let mut cumulative = 0.0;
        for map in &self.maps {
            cumulative += map.probability;
            if u < cumulative {
                return map;
            }
        }
        &self.maps[self.maps.len() - 1]
    }

    /// Run the chaos game from a random start in the unit square
    pub fn iterate<R: Rng>(&self, num_points: usize, rng: &mut R) -> Vec<(f64, f64)> {
        let (mut x, mut y) = (rng.random::<f64>(), rng.random::<f64>());
        for _ in 0..BURN_IN {
            let map = &self.maps[rng.random_range(0..self.maps.len())];
            (x, y) = map.apply(x, y);
        }

        (0..num_points)
            .map(|_| {
                let map = self.pick(rng.random::<f64>());
                (x, y) = map.apply(x, y);
                (x, y)
            })
            .collect()
    }
}

/// A rendered fractal and its descriptor fields
#[derive(Debug, Clone)]
pub struct GeneratedFractal {
    /// Fractal number
    pub index: usize,
    /// The system that produced it
    pub genome: IfsGenome,
    /// Chaos game points
    pub num_points: usize,
    /// Summary statistics
    pub stats: FractalStats,
    /// Black attractor on white
    pub image: GrayImage,
}

impl GeneratedFractal {
    /// Draw and render fractal `index`
    pub fn render<R: Rng>(
        index: usize,
        config: &GeneratorConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let genome = IfsGenome::random(config.num_functions, rng)?;
        let points = genome.iterate(config.num_points, rng);
        let raster = rasterize(&points, config.width, config.height, config.window);
        let (stddev_x, stddev_y) = std_devs(&points);

        let stats = FractalStats {
            numb: raster.pixels.len() as i64,
            avg_x: raster.avg_x,
            avg_y: raster.avg_y,
            stddev_x,
            stddev_y,
            dimension: box_counting_dimension(&raster.pixels, config.width, config.height),
        };

        Ok(Self {
            index,
            genome,
            num_points: points.len(),
            stats,
            image: raster.image,
        })
    }

    /// Tab-separated descriptor row
    pub fn descriptor_line(&self) -> String {
        let mut fields = vec![
            self.index.to_string(),
            self.genome.maps().len().to_string(),
            self.num_points.to_string(),
            self.stats.numb.to_string(),
            self.stats.avg_x.to_string(),
            self.stats.avg_y.to_string(),
            format!("{:.15}", self.stats.stddev_x),
            format!("{:.15}", self.stats.stddev_y),
            format!("{:.15}", self.stats.dimension),
        ];
        fields.extend(self.genome.to_vec().iter().map(|v| format!("{v:.15}")));
        fields.join("\t")
    }
}

struct Raster {
    image: GrayImage,
    /// Distinct inked pixels
    pixels: Vec<(u32, u32)>,
    avg_x: i64,
    avg_y: i64,
}

/// Map points into the window; points outside it are clamped to the border
fn rasterize(points: &[(f64, f64)], width: u32, height: u32, window: [f64; 4]) -> Raster {
    let [min_x, max_x, min_y, max_y] = window;
    let mut image = GrayImage::from_pixel(width, height, Luma([BACKGROUND]));
    let mut pixels = Vec::new();

    for &(x, y) in points {
        let px = ((x - min_x) / (max_x - min_x) * width as f64).floor();
        let py = ((max_y - y) / (max_y - min_y) * height as f64).floor();
        if !(px.is_finite() && py.is_finite()) {
            continue;
        }
        let px = px.clamp(0.0, (width - 1) as f64) as u32;
        let py = py.clamp(0.0, (height - 1) as f64) as u32;

        let pixel = image.get_pixel_mut(px, py);
        if pixel[0] == BACKGROUND {
            *pixel = Luma([INK]);
            pixels.push((px, py));
        }
    }

    let (avg_x, avg_y) = if pixels.is_empty() {
        (0, 0)
    } else {
        let n = pixels.len() as i64;
        let sx: i64 = pixels.iter().map(|&(x, _)| x as i64).sum();
        let sy: i64 = pixels.iter().map(|&(_, y)| y as i64).sum();
        (sx / n, sy / n)
    };

    Raster {
        image,
        pixels,
        avg_x,
        avg_y,
    }
}

fn std_devs(points: &[(f64, f64)]) -> (f64, f64) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let n = points.len() as f64;
    let (mx, my) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), &(x, y)| (sx + x, sy + y));
    let (mx, my) = (mx / n, my / n);
    let (vx, vy) = points.iter().fold((0.0, 0.0), |(vx, vy), &(x, y)| {
        (vx + (x - mx).powi(2), vy + (y - my).powi(2))
    });
    ((vx / n).sqrt(), (vy / n).sqrt())
}

/// Box-counting estimate: slope of `ln N(s)` against `ln(1/s)` over box
/// sizes `s = 1, 2, 4, ...` up to half the shorter image side
fn box_counting_dimension(pixels: &[(u32, u32)], width: u32, height: u32) -> f64 {
    if pixels.is_empty() {
        return 0.0;
    }

    let mut samples = Vec::new();
    let mut size = 1u32;
    while size <= width.min(height) / 2 {
        let boxes: HashSet<(u32, u32)> =
            pixels.iter().map(|&(x, y)| (x / size, y / size)).collect();
        samples.push((-(size as f64).ln(), (boxes.len() as f64).ln()));
        size *= 2;
    }
    if samples.len() < 2 {
        return 0.0;
    }

    let n = samples.len() as f64;
    let mean_x = samples.iter().map(|s| s.0).sum::<f64>() / n;
    let mean_y = samples.iter().map(|s| s.1).sum::<f64>() / n;
    let cov: f64 = samples.iter().map(|s| (s.0 - mean_x) * (s.1 - mean_y)).sum();
    let var: f64 = samples.iter().map(|s| (s.0 - mean_x).powi(2)).sum();
    cov / var
}

/// Outcome of a generation run
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    /// Descriptor that was appended to
    pub descriptor: PathBuf,
    /// Index of the first new fractal
    pub first_index: usize,
    /// Fractals written
    pub count: usize,
}

/// Append `config.num_fractals` new fractals to `descriptor`, numbering them
/// after the rows already present, and write their images beside it
#[instrument(skip(config), fields(count = config.num_fractals))]
pub fn generate_fractals(
    descriptor: impl AsRef<Path> + std::fmt::Debug,
    config: &GeneratorConfig,
) -> Result<GenerationReport> {
    config.validate()?;
    let descriptor = descriptor.as_ref();
    let dir = descriptor
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let existing = match fs::read_to_string(descriptor) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let first_index = existing.lines().filter(|l| !l.trim().is_empty()).count();
    info!(
        "Generating fractals {} to {} in {}",
        first_index,
        first_index + config.num_fractals,
        dir.display()
    );

    let lines = (first_index..first_index + config.num_fractals)
        .into_par_iter()
        .map(|index| -> Result<String> {
            let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(index as u64));
            let fractal = GeneratedFractal::render(index, config, &mut rng)?;
            let path = dir.join(format!("frac{index}.png"));
            fractal.image.save(&path)?;
            debug!("Wrote {} ({} pixels)", path.display(), fractal.stats.numb);
            Ok(fractal.descriptor_line())
        })
        .collect::<Result<Vec<String>>>()?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(descriptor)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file)?;
    }
    for line in &lines {
        writeln!(file, "{line}")?;
    }
    file.sync_all()?;

    Ok(GenerationReport {
        descriptor: descriptor.to_path_buf(),
        first_index,
        count: lines.len(),
    })
}
