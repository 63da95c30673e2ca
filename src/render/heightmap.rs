//! Hierarchical heightmap rasterization
//!
//! The image plane is carved into one XY rectangle per worker; each worker
//! recursively subdivides its column of space, using interval evaluation to
//! prove regions empty or filled and batched pointwise evaluation for the
//! rest.  Regions are visited front-to-back (descending z), so most pixels
//! are written once and deeper regions are pruned against the depth image.
use crate::{
    context::{Context, Node},
    eval::Evaluator,
    render::{CancelToken, DepthImage, ImageWindow, NormalImage, Rect},
    voxels::{self, VoxelView, Voxels},
    Error,
};
use arrayvec::ArrayVec;
use nalgebra::{Matrix4, Point3};
use std::collections::VecDeque;

/// Packed normal written to every pixel whose depth lands exactly on the top
/// z plane
///
/// Such pixels may have been filled without a meaningful gradient, so their
/// normal is forced to point out of the image.  Downstream consumers match
/// on this exact literal; it is not the canonical encoding of (0, 0, +1).
pub const TOP_FACE_NORMAL: u32 = 0xFF7F7FFF;

////////////////////////////////////////////////////////////////////////////////

/// Queue of surface samples awaiting bulk gradient evaluation
///
/// Derivative evaluation is much more expensive than value evaluation, so
/// samples accumulate here until the evaluator's batch is full (or the
/// owning region is finished) and then run through one batched call.
struct NormalBatcher<'a, 'v, 'w> {
    eval: &'a mut Evaluator,
    view: &'a VoxelView<'v>,
    norm: &'a mut ImageWindow<'w, u32>,

    /// Absolute pixel coordinates of the queued samples, parallel to the
    /// evaluator's point slots
    queue: ArrayVec<(usize, usize), { Evaluator::N }>,
}

impl Drop for NormalBatcher<'_, '_, '_> {
    fn drop(&mut self) {
        debug_assert!(
            self.queue.is_empty(),
            "normal queue dropped while non-empty"
        );
    }
}

impl<'a, 'v, 'w> NormalBatcher<'a, 'v, 'w> {
    fn new(
        eval: &'a mut Evaluator,
        view: &'a VoxelView<'v>,
        norm: &'a mut ImageWindow<'w, u32>,
    ) -> Self {
        Self {
            eval,
            view,
            norm,
            queue: ArrayVec::new(),
        }
    }

    /// Enqueues the sample at voxel-local coordinates `(i, j)` with depth `z`
    fn push(&mut self, i: usize, j: usize, z: f32) {
        self.eval.set(
            Point3::new(self.view.pts[0][i], self.view.pts[1][j], z),
            self.queue.len(),
        );
        self.queue
            .push((self.view.corner.x + i, self.view.corner.y + j));

        if self.queue.is_full() {
            self.run();
        }
    }

    /// Empties the queue if it is non-empty
    fn flush(&mut self) {
        if !self.queue.is_empty() {
            self.run();
        }
    }

    fn run(&mut self) {
        let ds = self.eval.derivs(self.queue.len());
        for (g, &(x, y)) in ds.iter().zip(&self.queue) {
            let length =
                (g.dx.powi(2) + g.dy.powi(2) + g.dz.powi(2)).sqrt();

            // Scale each component into the 0-255 range.  A zero-length
            // gradient has no meaningful normal; the NaN arithmetic below
            // produces zero channels, which is accepted.
            let ix = (255.0 * (g.dx / (2.0 * length) + 0.5)) as u32;
            let iy = (255.0 * (g.dy / (2.0 * length) + 0.5)) as u32;
            let iz = (255.0 * (g.dz / (2.0 * length) + 0.5)) as u32;

            self.norm
                .set(x, y, (0xFF << 24) | (iz << 16) | (iy << 8) | ix);
        }
        self.queue.clear();
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Per-worker render state: one evaluator plus the worker's image windows
struct Worker<'a, 'img> {
    eval: &'a mut Evaluator,
    depth: ImageWindow<'img, f32>,
    norm: ImageWindow<'img, u32>,
    cancel: &'a CancelToken,

    /// Scratch copy of the batched values for one leaf region
    out: Vec<f32>,
    /// Columns enqueued by the flattening pass, in flattening order
    columns: Vec<(usize, usize)>,
}

impl Worker<'_, '_> {
    /// Recursively renders a view, pruning with interval evaluation
    ///
    /// Returns `false` if the render was cancelled, `true` otherwise.  The
    /// evaluator's push/pop scopes are balanced on both paths.
    fn recurse(&mut self, view: &VoxelView) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let size = view.size();
        let zmax = view.pts[2][size.z - 1];

        // If every pixel of the footprint is at or above this view's top
        // plane, nothing here can improve the image
        if (0..size.y).all(|j| {
            (0..size.x).all(|i| {
                self.depth.get(view.corner.x + i, view.corner.y + j) >= zmax
            })
        }) {
            return true;
        }

        // Below a certain size, render voxel-by-voxel
        if view.voxel_count() <= Evaluator::N {
            self.pixels(view);
            return true;
        }

        let out = self.eval.eval_interval(view.lower(), view.upper());
        if out.upper() < 0.0 {
            // Strictly negative: flood the footprint
            self.fill(view);
        } else if out.lower() <= 0.0 {
            // Ambiguous: subdivide, disabling nodes proven inert here
            self.eval.push();

            // The higher z half is `second`; render front-to-back
            let (first, second) = view.split();
            if !self.recurse(&second) {
                self.eval.pop();
                return false;
            }
            if !self.recurse(&first) {
                self.eval.pop();
                return false;
            }
            self.eval.pop();
        }
        true
    }

    /// Evaluates every voxel of a small view, writing front-most hits
    fn pixels(&mut self, view: &VoxelView) {
        let size = view.size();
        debug_assert!(view.voxel_count() <= Evaluator::N);
        let zmax = view.pts[2][size.z - 1];

        // Flatten the view in a fixed order: x outer, y middle, z inner and
        // descending.  The unflattening pass below must walk the exact same
        // lattice, so the accepted columns are recorded as we go.
        let mut index = 0;
        self.columns.clear();
        for i in 0..size.x {
            for j in 0..size.y {
                // Skip columns that are already deeper than this view
                if self.depth.get(view.corner.x + i, view.corner.y + j)
                    >= zmax
                {
                    continue;
                }
                for k in 0..size.z {
                    self.eval.set_raw(
                        Point3::new(
                            view.pts[0][i],
                            view.pts[1][j],
                            view.pts[2][size.z - 1 - k],
                        ),
                        index,
                    );
                    index += 1;
                }
                self.columns.push((i, j));
            }
        }
        self.eval.apply_transform(index);
        self.out.clear();
        self.out.extend_from_slice(self.eval.values(index));

        let mut nr = NormalBatcher::new(&mut *self.eval, view, &mut self.norm);

        // Unflatten results into the image, breaking out of a column as soon
        // as a voxel is filled (every remaining voxel is behind it)
        let mut index = 0;
        for &(i, j) in &self.columns {
            for k in 0..size.z {
                let v = self.out[index];
                index += 1;
                if v < 0.0 {
                    let z = view.pts[2][size.z - 1 - k];
                    let x = view.corner.x + i;
                    let y = view.corner.y + j;
                    if self.depth.get(x, y) < z {
                        self.depth.set(x, y, z);
                        nr.push(i, j, z);
                    }
                    // Skip the rest of this z column
                    index += size.z - 1 - k;
                    break;
                }
            }
        }
        nr.flush();
    }

    /// Floods a view proven entirely inside the solid with its top plane
    fn fill(&mut self, view: &VoxelView) {
        let size = view.size();
        let z = view.pts[2][size.z - 1];

        let mut nr = NormalBatcher::new(&mut *self.eval, view, &mut self.norm);
        for i in 0..size.x {
            for j in 0..size.y {
                let x = view.corner.x + i;
                let y = view.corner.y + j;
                if self.depth.get(x, y) < z {
                    self.depth.set(x, y, z);
                    nr.push(i, j, z);
                }
            }
        }
        nr.flush();
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Renders a tree into a fresh depth / normal image pair
///
/// This is the high-level entry point: it compiles one [`Evaluator`] per
/// worker, then delegates to [`render_with_pool`].
pub fn render(
    ctx: &Context,
    root: Node,
    voxels: &Voxels,
    cancel: &CancelToken,
    mat: Matrix4<f32>,
    workers: usize,
) -> Result<(DepthImage, NormalImage), Error> {
    let mut evals = (0..workers)
        .map(|_| Evaluator::new(ctx, root))
        .collect::<Result<Vec<_>, Error>>()?;
    render_with_pool(&mut evals, voxels, cancel, mat)
}

/// Renders using an existing evaluator pool
///
/// The pool determines the maximum worker count; building it once and
/// passing it here avoids recompiling tapes across frames.
pub fn render_with_pool(
    evals: &mut [Evaluator],
    voxels: &Voxels,
    cancel: &CancelToken,
    mat: Matrix4<f32>,
) -> Result<(DepthImage, NormalImage), Error> {
    let size = voxels.size();
    let mut depth = DepthImage::new(size.x, size.y);
    let mut norm = NormalImage::new(size.x, size.y);
    render_into(evals, voxels, cancel, mat, &mut depth, &mut norm)?;
    Ok((depth, norm))
}

/// Renders into caller-provided images
///
/// The images must match the grid's XY size, and are reset (depth to `-inf`,
/// normals to 0) before rendering.  If the render is cancelled the images
/// hold a partial result: depths are valid where written, and every written
/// pixel has a valid normal.
pub fn render_into(
    evals: &mut [Evaluator],
    voxels: &Voxels,
    cancel: &CancelToken,
    mat: Matrix4<f32>,
    depth: &mut DepthImage,
    norm: &mut NormalImage,
) -> Result<(), Error> {
    if evals.is_empty() {
        return Err(Error::EmptyPool);
    }
    let size = voxels.size();
    for (w, h) in [
        (depth.width(), depth.height()),
        (norm.width(), norm.height()),
    ] {
        if (w, h) != (size.x, size.y) {
            return Err(Error::BadImageSize(w, h, size.x, size.y));
        }
    }

    depth.fill(f32::NEG_INFINITY);
    norm.fill(0);

    // Build the worker regions by splitting on the XY axes only, so that
    // each worker owns a full column of space over a disjoint rectangle
    let mut views = VecDeque::new();
    views.push_back(voxels.view());
    while views.len() < evals.len() {
        let front = views.front().unwrap().size();
        if front.x.min(front.y) <= 1 {
            break;
        }
        let view = views.pop_front().unwrap();
        let (first, second) = view.split_masked(voxels::X | voxels::Y);
        views.push_back(first);
        views.push_back(second);
    }

    let rects = views
        .iter()
        .map(|v| {
            let s = v.size();
            Rect {
                x: v.corner.x,
                y: v.corner.y,
                w: s.x,
                h: s.y,
            }
        })
        .collect::<Vec<_>>();
    let depth_windows = depth.windows(&rects);
    let norm_windows = norm.windows(&rects);

    // One scoped thread per region; any surplus evaluators stay idle
    std::thread::scope(|s| {
        for (((view, eval), dw), nw) in views
            .iter()
            .zip(evals.iter_mut())
            .zip(depth_windows)
            .zip(norm_windows)
        {
            eval.set_point_matrix(mat);
            s.spawn(move || {
                let mut worker = Worker {
                    eval,
                    depth: dw,
                    norm: nw,
                    cancel,
                    out: Vec::with_capacity(Evaluator::N),
                    columns: Vec::with_capacity(Evaluator::N),
                };
                worker.recurse(view);
            });
        }
    });

    // Pixels on the top z plane get a fixed outward normal: their gradient
    // may have been computed with no surface crossing in range
    let ztop = *voxels.pts(voxels::Z).last().unwrap();
    for (d, n) in depth.iter().zip(norm.iter_mut()) {
        if *d == ztop {
            *n = TOP_FACE_NORMAL;
        }
    }
    Ok(())
}
