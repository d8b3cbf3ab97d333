//! Visual and numeric summaries of a converted dataset.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use image::{RgbImage, imageops};
use serde::Serialize;

use crate::schema::StepRow;

/// Every n-th step is shown in an image strip.
pub const STRIP_STRIDE: usize = 4;
pub const HISTOGRAM_BINS: usize = 20;

/// Step indices shown in the strip of an episode with `len` steps.
pub fn strip_steps(len: usize) -> impl Iterator<Item = usize> {
    (0..len).step_by(STRIP_STRIDE)
}

/// Tile frames left to right: exterior views on the top row, wrist views
/// below. All frames must share one size.
pub fn image_strip(exterior: &[RgbImage], wrist: &[RgbImage]) -> Result<RgbImage> {
    if exterior.is_empty() || exterior.len() != wrist.len() {
        bail!(
            "need the same non-zero number of exterior and wrist frames, got {} and {}",
            exterior.len(),
            wrist.len()
        );
    }
    let (width, height) = exterior[0].dimensions();
    if let Some(odd) = exterior
        .iter()
        .chain(wrist)
        .find(|frame| frame.dimensions() != (width, height))
    {
        bail!(
            "frame of size {:?} in a strip of {width}x{height} frames",
            odd.dimensions()
        );
    }
    let mut strip = RgbImage::new(width * exterior.len() as u32, height * 2);
    for (col, (top, bottom)) in exterior.iter().zip(wrist).enumerate() {
        let x = col as i64 * width as i64;
        imageops::replace(&mut strip, top, x, 0);
        imageops::replace(&mut strip, bottom, x, height as i64);
    }
    Ok(strip)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub counts: Vec<u64>,
}

impl Histogram {
    /// Equal-width bins over the observed range; the last bin is closed.
    /// A constant column gets the unit range centred on its value.
    fn of(values: &[f64], bins: usize) -> Self {
        let (mut min, mut max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if min == max {
            min -= 0.5;
            max += 0.5;
        }
        let width = (max - min) / bins as f64;
        let mut counts = vec![0u64; bins];
        for &v in values {
            let bin = (((v - min) / width).floor() as usize).min(bins - 1);
            counts[bin] += 1;
        }
        Self { min, max, counts }
    }
}

/// Per-dimension mean and histogram of a fixed-width vector column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorStats {
    pub count: usize,
    pub mean: Vec<f64>,
    pub histograms: Vec<Histogram>,
}

impl VectorStats {
    /// `None` when there are no rows.
    pub fn from_rows<const N: usize>(rows: impl IntoIterator<Item = [f64; N]>) -> Option<Self> {
        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); N];
        for row in rows {
            for (column, value) in columns.iter_mut().zip(row) {
                column.push(value);
            }
        }
        let count = columns.first().map_or(0, Vec::len);
        if count == 0 {
            return None;
        }
        Some(Self {
            count,
            mean: columns
                .iter()
                .map(|c| c.iter().sum::<f64>() / count as f64)
                .collect(),
            histograms: columns
                .iter()
                .map(|c| Histogram::of(c, HISTOGRAM_BINS))
                .collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetStats {
    pub episodes: usize,
    pub steps: usize,
    pub action: VectorStats,
    pub cartesian_position: VectorStats,
}

/// Statistics over the first `max_episodes` episodes (by id).
pub fn dataset_stats(
    steps_by_episode: &BTreeMap<u32, Vec<StepRow>>,
    max_episodes: usize,
) -> Option<DatasetStats> {
    let rows: Vec<&StepRow> = steps_by_episode
        .values()
        .take(max_episodes)
        .flatten()
        .collect();
    Some(DatasetStats {
        episodes: steps_by_episode.len().min(max_episodes),
        steps: rows.len(),
        action: VectorStats::from_rows(rows.iter().map(|r| r.action))?,
        cartesian_position: VectorStats::from_rows(rows.iter().map(|r| r.cartesian_position))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn strip_stacks_exterior_over_wrist() {
        let exterior = vec![
            RgbImage::from_pixel(3, 2, Rgb([255, 0, 0])),
            RgbImage::from_pixel(3, 2, Rgb([0, 255, 0])),
        ];
        let wrist = vec![
            RgbImage::from_pixel(3, 2, Rgb([0, 0, 255])),
            RgbImage::from_pixel(3, 2, Rgb([9, 9, 9])),
        ];
        let strip = image_strip(&exterior, &wrist).unwrap();
        assert_eq!(strip.dimensions(), (6, 4));
        assert_eq!(strip.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(strip.get_pixel(5, 1).0, [0, 255, 0]);
        assert_eq!(strip.get_pixel(2, 2).0, [0, 0, 255]);
        assert_eq!(strip.get_pixel(3, 3).0, [9, 9, 9]);
    }

    #[test]
    fn strip_rejects_mismatched_frames() {
        let a = RgbImage::new(3, 2);
        let b = RgbImage::new(4, 2);
        assert!(image_strip(&[], &[]).is_err());
        assert!(image_strip(&[a.clone()], &[]).is_err());
        assert!(image_strip(&[a], &[b]).is_err());
    }

    #[test]
    fn strip_takes_every_fourth_step() {
        assert_eq!(strip_steps(10).collect::<Vec<_>>(), [0, 4, 8]);
        assert_eq!(strip_steps(0).count(), 0);
    }

    #[test]
    fn vector_stats_mean_and_bins() {
        let rows = (0..=10).map(|i| [i as f64, 2.0]);
        let stats = VectorStats::from_rows(rows).unwrap();
        assert_eq!(stats.count, 11);
        assert_eq!(stats.mean, [5.0, 2.0]);

        let spread = &stats.histograms[0];
        assert_eq!((spread.min, spread.max), (0.0, 10.0));
        assert_eq!(spread.counts.len(), HISTOGRAM_BINS);
        assert_eq!(spread.counts.iter().sum::<u64>(), 11);
        assert_eq!(spread.counts[0], 1);
        assert_eq!(spread.counts[HISTOGRAM_BINS - 1], 1);

        let constant = &stats.histograms[1];
        assert_eq!((constant.min, constant.max), (1.5, 2.5));
        assert_eq!(constant.counts[HISTOGRAM_BINS / 2], 11);
    }

    #[test]
    fn vector_stats_of_nothing() {
        assert!(VectorStats::from_rows(std::iter::empty::<[f64; 3]>()).is_none());
    }
}
