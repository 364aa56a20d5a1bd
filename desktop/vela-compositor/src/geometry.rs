//! Coordinate-space primitives shared by every engine.
//!
//! The compositor works in three spaces: buffer pixels (what the client
//! rendered), surface-local coordinates (after buffer transform and scale),
//! and global logical coordinates (where outputs and windows live). The
//! conversions between buffer and surface space go through a single pair of
//! helpers so the two directions cannot drift apart.

use serde::{Deserialize, Serialize};

/// A point in some coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Point<T> {
    pub x: T,
    pub y: T,
}

impl<T> Point<T> {
    pub const fn new(x: T, y: T) -> Self {
        Self { x, y }
    }
}

impl Point<i32> {
    pub fn to_f64(self) -> Point<f64> {
        Point::new(self.x as f64, self.y as f64)
    }
}

impl Point<f64> {
    /// Round towards the nearest logical pixel.
    pub fn to_i32_round(self) -> Point<i32> {
        Point::new(self.x.round() as i32, self.y.round() as i32)
    }
}

impl<T: std::ops::Add<Output = T>> std::ops::Add for Point<T> {
    type Output = Point<T>;
    fn add(self, other: Point<T>) -> Point<T> {
        Point::new(self.x + other.x, self.y + other.y)
    }
}

impl<T: std::ops::Sub<Output = T>> std::ops::Sub for Point<T> {
    type Output = Point<T>;
    fn sub(self, other: Point<T>) -> Point<T> {
        Point::new(self.x - other.x, self.y - other.y)
    }
}

/// A size in some coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Size<T> {
    pub w: T,
    pub h: T,
}

impl<T> Size<T> {
    pub const fn new(w: T, h: T) -> Self {
        Self { w, h }
    }
}

impl Size<i32> {
    pub fn is_empty(self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    pub fn to_f64(self) -> Size<f64> {
        Size::new(self.w as f64, self.h as f64)
    }
}

/// An axis-aligned rectangle, location plus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rectangle<T> {
    pub loc: Point<T>,
    pub size: Size<T>,
}

impl<T> Rectangle<T> {
    pub const fn new(loc: Point<T>, size: Size<T>) -> Self {
        Self { loc, size }
    }
}

impl Rectangle<i32> {
    pub fn from_coords(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self::new(Point::new(x, y), Size::new(w, h))
    }

    pub fn right(&self) -> i32 {
        self.loc.x + self.size.w
    }

    pub fn bottom(&self) -> i32 {
        self.loc.y + self.size.h
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    pub fn contains(&self, point: Point<i32>) -> bool {
        point.x >= self.loc.x
            && point.x < self.right()
            && point.y >= self.loc.y
            && point.y < self.bottom()
    }

    pub fn contains_f64(&self, point: Point<f64>) -> bool {
        point.x >= self.loc.x as f64
            && point.x < self.right() as f64
            && point.y >= self.loc.y as f64
            && point.y < self.bottom() as f64
    }

    pub fn contains_rect(&self, other: &Rectangle<i32>) -> bool {
        other.loc.x >= self.loc.x
            && other.loc.y >= self.loc.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn overlaps(&self, other: &Rectangle<i32>) -> bool {
        self.loc.x < other.right()
            && other.loc.x < self.right()
            && self.loc.y < other.bottom()
            && other.loc.y < self.bottom()
    }

    pub fn intersection(&self, other: &Rectangle<i32>) -> Option<Rectangle<i32>> {
        if !self.overlaps(other) {
            return None;
        }
        let x = self.loc.x.max(other.loc.x);
        let y = self.loc.y.max(other.loc.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        Some(Rectangle::from_coords(x, y, right - x, bottom - y))
    }

    /// Smallest rectangle covering both.
    pub fn merge(&self, other: &Rectangle<i32>) -> Rectangle<i32> {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.loc.x.min(other.loc.x);
        let y = self.loc.y.min(other.loc.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rectangle::from_coords(x, y, right - x, bottom - y)
    }

    pub fn translate(&self, by: Point<i32>) -> Rectangle<i32> {
        Rectangle::new(self.loc + by, self.size)
    }
}

/// Output and buffer transforms: the eight rotations/flips of the Wayland
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    #[default]
    Normal,
    Rotated90,
    Rotated180,
    Rotated270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}

impl Transform {
    pub const ALL: [Transform; 8] = [
        Transform::Normal,
        Transform::Rotated90,
        Transform::Rotated180,
        Transform::Rotated270,
        Transform::Flipped,
        Transform::Flipped90,
        Transform::Flipped180,
        Transform::Flipped270,
    ];

    /// Whether width and height swap under this transform.
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Transform::Rotated90
                | Transform::Rotated270
                | Transform::Flipped90
                | Transform::Flipped270
        )
    }

    pub fn transform_size(self, size: Size<i32>) -> Size<i32> {
        if self.swaps_dimensions() {
            Size::new(size.h, size.w)
        } else {
            size
        }
    }

    pub fn invert(self) -> Transform {
        match self {
            Transform::Rotated90 => Transform::Rotated270,
            Transform::Rotated270 => Transform::Rotated90,
            other => other,
        }
    }

    /// Map a point within an area of `size` through this transform. The
    /// result is a point in the transformed area (whose size may have its
    /// dimensions swapped).
    pub fn transform_point(self, point: Point<i32>, size: Size<i32>) -> Point<i32> {
        let Point { x, y } = point;
        let Size { w, h } = size;
        match self {
            Transform::Normal => Point::new(x, y),
            Transform::Rotated90 => Point::new(h - y, x),
            Transform::Rotated180 => Point::new(w - x, h - y),
            Transform::Rotated270 => Point::new(y, w - x),
            Transform::Flipped => Point::new(w - x, y),
            Transform::Flipped90 => Point::new(y, x),
            Transform::Flipped180 => Point::new(x, h - y),
            Transform::Flipped270 => Point::new(h - y, w - x),
        }
    }

    /// Map a rectangle within an area of `size` through this transform.
    pub fn transform_rect(self, rect: Rectangle<i32>, size: Size<i32>) -> Rectangle<i32> {
        let a = self.transform_point(rect.loc, size);
        let b = self.transform_point(
            Point::new(rect.right(), rect.bottom()),
            size,
        );
        let x = a.x.min(b.x);
        let y = a.y.min(b.y);
        Rectangle::from_coords(x, y, (a.x - b.x).abs(), (a.y - b.y).abs())
    }
}

/// Translate a damage rectangle from buffer pixels to surface-local
/// coordinates: apply the buffer transform first, then divide by the buffer
/// scale. `buffer_size` is the attached buffer's size in pixels.
pub fn buffer_to_surface_rect(
    rect: Rectangle<i32>,
    buffer_size: Size<i32>,
    transform: Transform,
    scale: i32,
) -> Rectangle<i32> {
    let transformed = transform.transform_rect(rect, buffer_size);
    let scale = scale.max(1);
    // Expand to the covering surface-local rectangle so fractional pixels
    // are never lost.
    let x = transformed.loc.x.div_euclid(scale);
    let y = transformed.loc.y.div_euclid(scale);
    let right = (transformed.right() + scale - 1).div_euclid(scale);
    let bottom = (transformed.bottom() + scale - 1).div_euclid(scale);
    Rectangle::from_coords(x, y, right - x, bottom - y)
}

/// The inverse composition: route a surface-local point into buffer pixels.
/// Multiplies by the scale first, then applies the inverted transform.
pub fn surface_to_buffer_point(
    point: Point<i32>,
    buffer_size: Size<i32>,
    transform: Transform,
    scale: i32,
) -> Point<i32> {
    let scale = scale.max(1);
    let scaled = Point::new(point.x * scale, point.y * scale);
    let surface_size = transform.transform_size(buffer_size);
    transform.invert().transform_point(scaled, surface_size)
}

/// A region: a union of rectangles in one coordinate space. Used for damage
/// accumulation and for the opaque/input region hints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rectangle<i32>>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rectangle<i32>) -> Self {
        let mut region = Self::new();
        region.add(rect);
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rectangle<i32>] {
        &self.rects
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn add(&mut self, rect: Rectangle<i32>) {
        if rect.is_empty() {
            return;
        }
        // Swallow rectangles already covered, and drop covered ones.
        if self.rects.iter().any(|r| r.contains_rect(&rect)) {
            return;
        }
        self.rects.retain(|r| !rect.contains_rect(r));
        self.rects.push(rect);
    }

    pub fn subtract(&mut self, rect: Rectangle<i32>) {
        if rect.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.rects.len());
        for r in self.rects.drain(..) {
            match r.intersection(&rect) {
                None => out.push(r),
                Some(cut) => {
                    // Up to four rectangles remain around the cut.
                    if cut.loc.y > r.loc.y {
                        out.push(Rectangle::from_coords(
                            r.loc.x,
                            r.loc.y,
                            r.size.w,
                            cut.loc.y - r.loc.y,
                        ));
                    }
                    if cut.bottom() < r.bottom() {
                        out.push(Rectangle::from_coords(
                            r.loc.x,
                            cut.bottom(),
                            r.size.w,
                            r.bottom() - cut.bottom(),
                        ));
                    }
                    if cut.loc.x > r.loc.x {
                        out.push(Rectangle::from_coords(
                            r.loc.x,
                            cut.loc.y,
                            cut.loc.x - r.loc.x,
                            cut.size.h,
                        ));
                    }
                    if cut.right() < r.right() {
                        out.push(Rectangle::from_coords(
                            cut.right(),
                            cut.loc.y,
                            r.right() - cut.right(),
                            cut.size.h,
                        ));
                    }
                }
            }
        }
        self.rects = out;
    }

    pub fn union(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add(*rect);
        }
    }

    pub fn contains(&self, point: Point<i32>) -> bool {
        self.rects.iter().any(|r| r.contains(point))
    }

    pub fn bounds(&self) -> Rectangle<i32> {
        self.rects
            .iter()
            .fold(Rectangle::default(), |acc, r| acc.merge(r))
    }

    /// Clip every rectangle against `bounds`, dropping what falls outside.
    pub fn clip_to(&mut self, bounds: Rectangle<i32>) {
        self.rects = self
            .rects
            .iter()
            .filter_map(|r| r.intersection(&bounds))
            .collect();
    }

    pub fn translate(&self, by: Point<i32>) -> Region {
        Region {
            rects: self.rects.iter().map(|r| r.translate(by)).collect(),
        }
    }

    /// Map every rectangle from buffer to surface coordinates.
    pub fn buffer_to_surface(
        &self,
        buffer_size: Size<i32>,
        transform: Transform,
        scale: i32,
    ) -> Region {
        let mut out = Region::new();
        for rect in &self.rects {
            out.add(buffer_to_surface_rect(*rect, buffer_size, transform, scale));
        }
        out
    }
}
