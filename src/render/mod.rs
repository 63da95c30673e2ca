//! Depth and normal image rendering
//!
//! [`render`] and its pool-reuse / in-place variants rasterize an implicit
//! solid into a [`DepthImage`] and a packed [`NormalImage`]; see the
//! [`heightmap`] internals for the subdivision algorithm.
mod heightmap;

pub use heightmap::{render, render_into, render_with_pool, TOP_FACE_NORMAL};

use std::marker::PhantomData;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Row-major pixel storage shared by the depth and normal outputs
///
/// Pixels are addressed either by flat index or by a `(row, column)` pair;
/// row 0 is the top of the image, and rows run along x.
pub struct Image<P> {
    data: Vec<P>,
    width: usize,
    height: usize,
}

impl<P: Default + Clone> Image<P> {
    /// Allocates a `width` by `height` image of default-valued pixels
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            data: vec![P::default(); width * height],
            width,
            height,
        }
    }
}

impl<P: Clone> Image<P> {
    /// Sets every pixel to the given value
    pub fn fill(&mut self, v: P) {
        self.data.fill(v);
    }
}

impl<P> Image<P> {
    /// Width in pixels
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> usize {
        self.height
    }

    /// Total pixel count
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` for a zero-sized image
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Visits every pixel in row-major order
    pub fn iter(&self) -> impl Iterator<Item = &P> + '_ {
        self.data.iter()
    }

    /// Visits every pixel mutably, in row-major order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut P> + '_ {
        self.data.iter_mut()
    }

    /// Converts a `(row, column)` pair into a flat index
    ///
    /// # Panics
    /// If the position lies outside the image
    fn decode_position(&self, pos: (usize, usize)) -> usize {
        let (row, col) = pos;
        assert!(
            row < self.height && col < self.width,
            "position ({row}, {col}) is outside a {}x{} image",
            self.width,
            self.height
        );
        row * self.width + col
    }

    /// Splits the image into windows over the given rectangles
    ///
    /// # Panics
    /// If a rectangle is out of bounds, or any two rectangles overlap
    pub(crate) fn windows(&mut self, rects: &[Rect]) -> Vec<ImageWindow<'_, P>> {
        for (i, r) in rects.iter().enumerate() {
            assert!(
                r.x + r.w <= self.width && r.y + r.h <= self.height,
                "window {r:?} is out of bounds"
            );
            for o in &rects[..i] {
                assert!(!r.intersects(o), "windows {r:?} and {o:?} overlap");
            }
        }
        let ptr = self.data.as_mut_ptr();
        rects
            .iter()
            .map(|&rect| ImageWindow {
                ptr,
                stride: self.width,
                rect,
                _image: PhantomData,
            })
            .collect()
    }
}

impl<P> std::ops::Index<usize> for Image<P> {
    type Output = P;
    fn index(&self, index: usize) -> &Self::Output {
        &self.data[index]
    }
}

impl<P> std::ops::IndexMut<usize> for Image<P> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl<P> std::ops::Index<(usize, usize)> for Image<P> {
    type Output = P;
    fn index(&self, pos: (usize, usize)) -> &Self::Output {
        let index = self.decode_position(pos);
        &self.data[index]
    }
}

impl<P> std::ops::IndexMut<(usize, usize)> for Image<P> {
    fn index_mut(&mut self, pos: (usize, usize)) -> &mut Self::Output {
        let index = self.decode_position(pos);
        &mut self.data[index]
    }
}

/// Single-channel depth image
///
/// `-inf` marks pixels that were never written; everything else is the
/// largest `z` at which the solid was present.
pub type DepthImage = Image<f32>;

/// Packed-normal image, `0xAA_ZZ_YY_XX` with alpha `0xFF` for written pixels
pub type NormalImage = Image<u32>;

/// An axis-aligned pixel rectangle
#[derive(Copy, Clone, Debug)]
pub(crate) struct Rect {
    pub x: usize,
    pub y: usize,
    pub w: usize,
    pub h: usize,
}

impl Rect {
    fn intersects(&self, o: &Rect) -> bool {
        self.x < o.x + o.w
            && o.x < self.x + self.w
            && self.y < o.y + o.h
            && o.y < self.y + self.h
    }

    fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x && x < self.x + self.w && y >= self.y && y < self.y + self.h
    }
}

/// Mutable access to one rectangle of an image shared across workers
///
/// Windows are addressed with absolute pixel coordinates.  They are created
/// in one batch by [`Image::windows`], which checks that the rectangles are
/// pairwise disjoint; each access is further checked (in debug builds) to
/// stay inside the window's own rectangle.
pub(crate) struct ImageWindow<'a, P> {
    ptr: *mut P,
    stride: usize,
    rect: Rect,
    _image: PhantomData<&'a mut P>,
}

// SAFETY: windows created by `Image::windows` cover pairwise disjoint
// rectangles and every access is confined to the window's own rectangle, so
// two windows never touch the same pixel.
unsafe impl<P: Send> Send for ImageWindow<'_, P> {}

impl<P: Copy> ImageWindow<'_, P> {
    pub fn get(&self, x: usize, y: usize) -> P {
        debug_assert!(
            self.rect.contains(x, y),
            "read at ({x}, {y}) outside window {:?}",
            self.rect
        );
        // SAFETY: the position is inside this window's rectangle, which is
        // inside the image
        unsafe { *self.ptr.add(y * self.stride + x) }
    }

    pub fn set(&mut self, x: usize, y: usize, v: P) {
        debug_assert!(
            self.rect.contains(x, y),
            "write at ({x}, {y}) outside window {:?}",
            self.rect
        );
        // SAFETY: as above, and no other window covers this pixel
        unsafe {
            *self.ptr.add(y * self.stride + x) = v;
        }
    }
}

/// Shared flag asking an in-progress render to stop early
///
/// Workers poll the flag between recursion steps, so cancellation is
/// cooperative: the render call still returns normally, with whatever
/// pixels were finished before the flag was seen.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a fresh, un-cancelled token
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    /// Requests cancellation; every clone of this token observes it
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_image_indexing() {
        let mut img = Image::<u32>::new(4, 2);
        img[(1, 3)] = 7;
        assert_eq!(img[7], 7);
        assert_eq!(img.iter().sum::<u32>(), 7);
    }

    #[test]
    fn test_windows_disjoint_access() {
        let mut img = Image::<f32>::new(4, 4);
        let rects = [
            Rect { x: 0, y: 0, w: 2, h: 4 },
            Rect { x: 2, y: 0, w: 2, h: 4 },
        ];
        let mut ws = img.windows(&rects);
        ws[0].set(1, 2, 1.0);
        ws[1].set(2, 0, 2.0);
        assert_eq!(ws[0].get(1, 2), 1.0);
        drop(ws);
        assert_eq!(img[(2, 1)], 1.0);
        assert_eq!(img[(0, 2)], 2.0);
    }

    #[test]
    #[should_panic(expected = "overlap")]
    fn test_windows_overlap() {
        let mut img = Image::<f32>::new(4, 4);
        let rects = [
            Rect { x: 0, y: 0, w: 3, h: 4 },
            Rect { x: 2, y: 0, w: 2, h: 4 },
        ];
        let _ = img.windows(&rects);
    }
}
