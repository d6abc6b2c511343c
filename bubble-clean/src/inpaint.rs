//! Fast-marching inpainting (Telea 2004).
//!
//! Pixels under the mask are filled in order of their distance from the known
//! boundary. Each new pixel is a weighted first-order extrapolation from the
//! known pixels within `radius`, weighted by direction, distance and level-set
//! proximity. Pixels outside the mask are never written.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use anyhow::{anyhow, Result};
use image::{GrayImage, Rgb, RgbImage};

const UNREACHED: f32 = 1.0e6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    Known,
    Band,
    Inside,
}

/// Min-heap entry on arrival time
#[derive(Debug, Clone, Copy)]
struct Front {
    time: f32,
    index: usize,
}

impl PartialEq for Front {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Front {}

impl PartialOrd for Front {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Front {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.index.cmp(&self.index))
    }
}

struct Field {
    width: usize,
    height: usize,
    flags: Vec<Flag>,
    time: Vec<f32>,
    pixels: Vec<[f32; 3]>,
}

impl Field {
    fn index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    /// Flag at a possibly out-of-range coordinate; outside counts as unknown
    fn flag_at(&self, x: isize, y: isize) -> Flag {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return Flag::Inside;
        }
        self.flags[self.index(x as usize, y as usize)]
    }

    fn time_at(&self, x: isize, y: isize) -> f32 {
        self.time[self.index(x as usize, y as usize)]
    }

    fn neighbors(&self, x: usize, y: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        let (x, y) = (x as isize, y as isize);
        [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)]
            .into_iter()
            .filter(|&(nx, ny)| {
                nx >= 0 && ny >= 0 && (nx as usize) < self.width && (ny as usize) < self.height
            })
            .map(|(nx, ny)| (nx as usize, ny as usize))
    }

    /// Solve the eikonal equation |grad T| = 1 from two orthogonal neighbors
    fn solve(&self, x1: isize, y1: isize, x2: isize, y2: isize) -> f32 {
        let known1 = self.flag_at(x1, y1) != Flag::Inside;
        let known2 = self.flag_at(x2, y2) != Flag::Inside;

        match (known1, known2) {
            (true, true) => {
                let t1 = self.time_at(x1, y1);
                let t2 = self.time_at(x2, y2);
                let r = (2.0 - (t1 - t2) * (t1 - t2)).max(0.0).sqrt();
                let s = (t1 + t2 - r) * 0.5;
                if s >= t1 && s >= t2 {
                    s
                } else {
                    let s = s + r;
                    if s >= t1 && s >= t2 {
                        s
                    } else {
                        t1.min(t2) + 1.0
                    }
                }
            }
            (true, false) => self.time_at(x1, y1) + 1.0,
            (false, true) => self.time_at(x2, y2) + 1.0,
            (false, false) => UNREACHED,
        }
    }

    fn arrival_time(&self, x: usize, y: usize) -> f32 {
        let (x, y) = (x as isize, y as isize);
        self.solve(x - 1, y, x, y - 1)
            .min(self.solve(x + 1, y, x, y - 1))
            .min(self.solve(x - 1, y, x, y + 1))
            .min(self.solve(x + 1, y, x, y + 1))
    }

    /// Gradient of the arrival time at (x, y), one-sided where needed
    fn time_gradient(&self, x: usize, y: usize) -> (f32, f32) {
        let (xi, yi) = (x as isize, y as isize);
        let here = self.time_at(xi, yi);
        let axis = |ax: isize, ay: isize, bx: isize, by: isize| -> f32 {
            let a = self.flag_at(ax, ay) != Flag::Inside;
            let b = self.flag_at(bx, by) != Flag::Inside;
            match (a, b) {
                (true, true) => (self.time_at(ax, ay) - self.time_at(bx, by)) * 0.5,
                (true, false) => self.time_at(ax, ay) - here,
                (false, true) => here - self.time_at(bx, by),
                (false, false) => 0.0,
            }
        };
        (
            axis(xi + 1, yi, xi - 1, yi),
            axis(xi, yi + 1, xi, yi - 1),
        )
    }

    /// Per-channel image gradient at a known pixel, from known neighbors only
    fn image_gradient(&self, x: usize, y: usize, channel: usize) -> (f32, f32) {
        let (xi, yi) = (x as isize, y as isize);
        let here = self.pixels[self.index(x, y)][channel];
        let value = |px: isize, py: isize| self.pixels[self.index(px as usize, py as usize)][channel];
        let axis = |ax: isize, ay: isize, bx: isize, by: isize| -> f32 {
            let a = self.flag_at(ax, ay) != Flag::Inside;
            let b = self.flag_at(bx, by) != Flag::Inside;
            match (a, b) {
                (true, true) => (value(ax, ay) - value(bx, by)) * 0.5,
                (true, false) => value(ax, ay) - here,
                (false, true) => here - value(bx, by),
                (false, false) => 0.0,
            }
        };
        (
            axis(xi + 1, yi, xi - 1, yi),
            axis(xi, yi + 1, xi, yi - 1),
        )
    }

    /// Weighted first-order estimate of pixel (x, y) from known pixels nearby
    fn estimate(&self, x: usize, y: usize, radius: i64) -> Option<[f32; 3]> {
        let (grad_tx, grad_ty) = self.time_gradient(x, y);
        let t_here = self.time[self.index(x, y)];
        let radius_sq = radius * radius;

        let mut weight_sum = 0.0f32;
        let mut accum = [0.0f32; 3];

        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy > radius_sq || (dx == 0 && dy == 0) {
                    continue;
                }
                let qx = x as i64 + dx;
                let qy = y as i64 + dy;
                if self.flag_at(qx as isize, qy as isize) == Flag::Inside {
                    continue;
                }
                let (qx, qy) = (qx as usize, qy as usize);
                let q = self.index(qx, qy);

                // r points from the known pixel q to the pixel being filled
                let rx = -(dx as f32);
                let ry = -(dy as f32);
                let len_sq = rx * rx + ry * ry;

                let dst = 1.0 / (len_sq * len_sq.sqrt());
                let lev = 1.0 / (1.0 + (self.time[q] - t_here).abs());
                let mut dir = rx * grad_tx + ry * grad_ty;
                if dir.abs() <= 0.01 {
                    dir = 1.0e-6;
                }
                let weight = (dst * lev * dir).abs();

                for (channel, slot) in accum.iter_mut().enumerate() {
                    let (gx, gy) = self.image_gradient(qx, qy, channel);
                    let extrapolated = self.pixels[q][channel] + gx * rx + gy * ry;
                    *slot += weight * extrapolated;
                }
                weight_sum += weight;
            }
        }

        if weight_sum <= 0.0 || !weight_sum.is_finite() {
            return None;
        }
        Some(accum.map(|v| (v / weight_sum).clamp(0.0, 255.0)))
    }
}

/// Inpaint every non-zero pixel of `mask` from its surroundings.
///
/// Pixels with no known pixel reachable (for example a mask covering the
/// whole image) keep their original value.
pub fn inpaint_telea(image: &RgbImage, mask: &GrayImage, radius: u32) -> Result<RgbImage> {
    if image.dimensions() != mask.dimensions() {
        return Err(anyhow!(
            "Inpaint mask is {}x{} but image is {}x{}",
            mask.width(),
            mask.height(),
            image.width(),
            image.height()
        ));
    }
    if radius == 0 {
        return Err(anyhow!("Inpaint radius must be at least 1"));
    }

    let (width, height) = (image.width() as usize, image.height() as usize);
    let mut field = Field {
        width,
        height,
        flags: Vec::with_capacity(width * height),
        time: Vec::with_capacity(width * height),
        pixels: image
            .pixels()
            .map(|p| [p[0] as f32, p[1] as f32, p[2] as f32])
            .collect(),
    };

    for p in mask.pixels() {
        if p[0] > 0 {
            field.flags.push(Flag::Inside);
            field.time.push(UNREACHED);
        } else {
            field.flags.push(Flag::Known);
            field.time.push(0.0);
        }
    }

    let mut heap = BinaryHeap::new();
    for y in 0..height {
        for x in 0..width {
            let i = field.index(x, y);
            if field.flags[i] != Flag::Known {
                continue;
            }
            let touches_hole = field
                .neighbors(x, y)
                .any(|(nx, ny)| field.flags[field.index(nx, ny)] == Flag::Inside);
            if touches_hole {
                field.flags[i] = Flag::Band;
                heap.push(Front { time: 0.0, index: i });
            }
        }
    }

    let radius = radius as i64;
    let mut filled = 0usize;

    while let Some(Front { index, .. }) = heap.pop() {
        if field.flags[index] == Flag::Known {
            continue;
        }
        field.flags[index] = Flag::Known;
        let (x, y) = (index % width, index / width);

        let pending: Vec<(usize, usize)> = field
            .neighbors(x, y)
            .filter(|&(nx, ny)| field.flags[field.index(nx, ny)] == Flag::Inside)
            .collect();

        for (nx, ny) in pending {
            let n = field.index(nx, ny);
            let time = field.arrival_time(nx, ny);
            field.time[n] = time;

            if let Some(value) = field.estimate(nx, ny, radius) {
                field.pixels[n] = value;
                filled += 1;
            }

            field.flags[n] = Flag::Band;
            heap.push(Front { time, index: n });
        }
    }

    log::debug!("Inpainted {filled} pixel(s) with radius {radius}");

    let mut output = image.clone();
    for (i, (out, m)) in output.pixels_mut().zip(mask.pixels()).enumerate() {
        if m[0] > 0 {
            let [r, g, b] = field.pixels[i];
            *out = Rgb([r.round() as u8, g.round() as u8, b.round() as u8]);
        }
    }
    Ok(output)
}
