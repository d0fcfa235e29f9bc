//! Pixel tensor produced by the sample pipeline.
//!
//! Layout is `(channel, column, row)`: element `(c, x, y)` lives at
//! `c * W * H + x * H + y`, where `W` is the image width and `H` its height.

use image::Rgb32FImage;

/// Number of colour channels every sample carries
pub const CHANNELS: usize = 3;

/// Flat `(C, W, H)` float buffer for one image
#[derive(Clone, Debug, PartialEq)]
pub struct PixelTensor {
    data: Vec<f32>,
    columns: usize,
    rows: usize,
}

impl PixelTensor {
    /// Reorder an interleaved `(row, column, channel)` image into `(C, W, H)`
    pub fn from_image(img: &Rgb32FImage) -> Self {
        let (width, height) = img.dimensions();
        let (columns, rows) = (width as usize, height as usize);
        let mut data = vec![0.0f32; CHANNELS * columns * rows];

        for (x, y, pixel) in img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..CHANNELS {
                data[c * columns * rows + x * rows + y] = pixel[c];
            }
        }

        Self {
            data,
            columns,
            rows,
        }
    }

    /// Wrap an existing `(C, W, H)` buffer; `None` if the length disagrees
    pub fn from_raw(data: Vec<f32>, columns: usize, rows: usize) -> Option<Self> {
        (data.len() == CHANNELS * columns * rows).then_some(Self {
            data,
            columns,
            rows,
        })
    }

    /// `[channels, columns, rows]`
    pub fn shape(&self) -> [usize; 3] {
        [CHANNELS, self.columns, self.rows]
    }

    /// Value at channel `c`, column `x`, row `y`
    pub fn get(&self, c: usize, x: usize, y: usize) -> f32 {
        self.data[c * self.columns * self.rows + x * self.rows + y]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_layout_is_channel_column_row() {
        // 3 columns wide, 2 rows tall
        let img = Rgb32FImage::from_fn(3, 2, |x, y| {
            let v = (10 * x + y) as f32;
            Rgb([v, v + 100.0, v + 200.0])
        });

        let tensor = PixelTensor::from_image(&img);
        assert_eq!(tensor.shape(), [3, 3, 2]);

        for x in 0..3 {
            for y in 0..2 {
                let v = (10 * x + y) as f32;
                assert_eq!(tensor.get(0, x, y), v);
                assert_eq!(tensor.get(2, x, y), v + 200.0);
                assert_eq!(tensor.as_slice()[6 + x * 2 + y], v + 100.0);
            }
        }
    }

    #[test]
    fn test_from_raw_checks_length() {
        assert!(PixelTensor::from_raw(vec![0.0; 12], 2, 2).is_some());
        assert!(PixelTensor::from_raw(vec![0.0; 11], 2, 2).is_none());
    }
}
