//! Voxel grids and region views
//!
//! A [`Voxels`] grid stores sorted sample positions along each axis; a
//! [`VoxelView`] is a borrowed sub-box of a grid, carrying its integer
//! offset within the image plane.  Views are subdivided by binary splits,
//! optionally restricted to a set of axes.
use crate::Error;
use nalgebra::Vector3;

/// A single axis, represented as a `u8` with one bit set
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Axis(u8);

/// The X axis
pub const X: Axis = Axis(1);
/// The Y axis
pub const Y: Axis = Axis(2);
/// The Z axis
pub const Z: Axis = Axis(4);

impl Axis {
    /// Builds an axis from a one-hot bitmask
    ///
    /// # Panics
    /// If the input does not have exactly one bit set in the 0-2 range
    pub fn new(i: u8) -> Self {
        assert!(
            i.count_ones() == 1 && i.trailing_zeros() < 3,
            "invalid axis {i:#b}"
        );
        Self(i)
    }

    /// Converts from a bitmask to an index
    pub fn index(self) -> usize {
        self.0.trailing_zeros() as usize
    }
}

/// A set of axes, used to restrict splitting
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AxisMask(u8);

impl AxisMask {
    /// The set of all three axes
    pub const ALL: AxisMask = AxisMask(0b111);

    /// Checks whether the given axis is in the set
    pub fn contains(self, a: Axis) -> bool {
        self.0 & a.0 != 0
    }
}

impl From<Axis> for AxisMask {
    fn from(a: Axis) -> Self {
        AxisMask(a.0)
    }
}

impl std::ops::BitOr<Axis> for Axis {
    type Output = AxisMask;
    fn bitor(self, rhs: Axis) -> AxisMask {
        AxisMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOr<Axis> for AxisMask {
    type Output = AxisMask;
    fn bitor(self, rhs: Axis) -> AxisMask {
        AxisMask(self.0 | rhs.0)
    }
}

/// A rectangular voxel grid
///
/// The grid stores strictly increasing sample positions along each axis;
/// samples are placed at voxel centers.
pub struct Voxels {
    pts: [Vec<f32>; 3],
}

impl Voxels {
    /// Builds a grid of `size` voxels spanning `lower` to `upper`
    ///
    /// Samples are placed at voxel centers, so the first and last positions
    /// sit half a voxel inside the bounds.
    pub fn new(
        lower: Vector3<f32>,
        upper: Vector3<f32>,
        size: Vector3<usize>,
    ) -> Result<Self, Error> {
        let mut pts: [Vec<f32>; 3] = Default::default();
        for (a, pts) in pts.iter_mut().enumerate() {
            if size[a] == 0 {
                return Err(Error::EmptyRegion);
            }
            let scale = (upper[a] - lower[a]) / size[a] as f32;
            *pts = (0..size[a])
                .map(|i| lower[a] + (i as f32 + 0.5) * scale)
                .collect();
        }
        Ok(Self { pts })
    }

    /// Builds a grid from explicit sample positions
    ///
    /// Each axis must be non-empty; positions must be strictly increasing.
    pub fn from_pts(
        x: Vec<f32>,
        y: Vec<f32>,
        z: Vec<f32>,
    ) -> Result<Self, Error> {
        let pts = [x, y, z];
        for pts in &pts {
            if pts.is_empty() {
                return Err(Error::EmptyRegion);
            }
            debug_assert!(
                pts.windows(2).all(|w| w[0] < w[1]),
                "sample positions must be strictly increasing"
            );
        }
        Ok(Self { pts })
    }

    /// Returns the number of voxels along each axis
    pub fn size(&self) -> Vector3<usize> {
        Vector3::new(self.pts[0].len(), self.pts[1].len(), self.pts[2].len())
    }

    /// Returns the sample positions along the given axis
    pub fn pts(&self, a: Axis) -> &[f32] {
        &self.pts[a.index()]
    }

    /// Returns a view covering the whole grid
    pub fn view(&self) -> VoxelView {
        VoxelView {
            corner: Vector3::new(0, 0, 0),
            pts: [&self.pts[0], &self.pts[1], &self.pts[2]],
        }
    }
}

/// A view of a rectangular subset of a [`Voxels`] grid
#[derive(Copy, Clone, Debug)]
pub struct VoxelView<'a> {
    /// Offset of this view within the image-plane grid
    pub corner: Vector3<usize>,
    /// Sample positions along each axis
    pub pts: [&'a [f32]; 3],
}

impl VoxelView<'_> {
    /// Returns the number of voxels along each axis
    pub fn size(&self) -> Vector3<usize> {
        Vector3::new(self.pts[0].len(), self.pts[1].len(), self.pts[2].len())
    }

    /// Returns the total number of voxels in the view
    pub fn voxel_count(&self) -> usize {
        self.pts.iter().map(|p| p.len()).product()
    }

    /// Returns the lowest sampled corner of the view
    pub fn lower(&self) -> Vector3<f32> {
        Vector3::new(self.pts[0][0], self.pts[1][0], self.pts[2][0])
    }

    /// Returns the highest sampled corner of the view
    pub fn upper(&self) -> Vector3<f32> {
        Vector3::new(
            *self.pts[0].last().unwrap(),
            *self.pts[1].last().unwrap(),
            *self.pts[2].last().unwrap(),
        )
    }

    /// Bisects the view on its largest axis
    ///
    /// The lower half of the chosen axis goes to the first output and the
    /// upper half to the second, so a z split leaves the higher-z half in
    /// the second output.
    pub fn split(self) -> (Self, Self) {
        self.split_masked(AxisMask::ALL)
    }

    /// Bisects the view on the largest axis within `mask`
    ///
    /// The two output views never overlap and together cover the input
    /// exactly.
    ///
    /// # Panics
    /// If every masked axis has extent 1
    pub fn split_masked(self, mask: AxisMask) -> (Self, Self) {
        let mut axis = 3;
        let mut best = 1;
        for a in 0..3 {
            if mask.0 & (1 << a) != 0 && self.pts[a].len() > best {
                best = self.pts[a].len();
                axis = a;
            }
        }
        assert!(axis < 3, "no splittable axis in {mask:?}");

        let mid = best / 2;
        let (lo, hi) = self.pts[axis].split_at(mid);
        let mut first = self;
        first.pts[axis] = lo;
        let mut second = self;
        second.pts[axis] = hi;
        second.corner[axis] += mid;
        (first, second)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_center_sampling() {
        let v = Voxels::new(
            Vector3::new(-1.0, -1.0, -1.0),
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(4, 4, 4),
        )
        .unwrap();
        assert_eq!(v.pts(Z), &[-0.75, -0.25, 0.25, 0.75]);
        assert_eq!(v.size(), Vector3::new(4, 4, 4));
    }

    #[test]
    fn test_empty_region() {
        let r = Voxels::new(
            Vector3::new(-1.0, -1.0, -1.0),
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(4, 0, 4),
        );
        assert!(matches!(r, Err(Error::EmptyRegion)));
        assert!(matches!(
            Voxels::from_pts(vec![], vec![0.0], vec![0.0]),
            Err(Error::EmptyRegion)
        ));
    }

    #[test]
    fn test_split_covers_parent() {
        let v = Voxels::new(
            Vector3::new(-1.0, -1.0, -1.0),
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(8, 4, 2),
        )
        .unwrap();
        let view = v.view();

        // The largest axis is x
        let (first, second) = view.split();
        assert_eq!(first.size(), Vector3::new(4, 4, 2));
        assert_eq!(second.size(), Vector3::new(4, 4, 2));
        assert_eq!(first.corner, Vector3::new(0, 0, 0));
        assert_eq!(second.corner, Vector3::new(4, 0, 0));
        assert_eq!(first.pts[0].last().unwrap(), &v.pts(X)[3]);
        assert_eq!(second.pts[0].first().unwrap(), &v.pts(X)[4]);

        // Shared axes are untouched
        assert_eq!(first.pts[2], second.pts[2]);
    }

    #[test]
    fn test_split_masked() {
        let v = Voxels::new(
            Vector3::new(-1.0, -1.0, -1.0),
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(2, 4, 8),
        )
        .unwrap();

        // z is the largest axis, but the mask excludes it
        let (first, second) = v.view().split_masked(X | Y);
        assert_eq!(first.size(), Vector3::new(2, 2, 8));
        assert_eq!(second.corner, Vector3::new(0, 2, 0));
    }

    #[test]
    fn test_split_ties_prefer_x() {
        let v = Voxels::new(
            Vector3::new(-1.0, -1.0, -1.0),
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(4, 4, 4),
        )
        .unwrap();
        let (_, second) = v.view().split_masked(X | Y);
        assert_eq!(second.corner, Vector3::new(2, 0, 0));
    }
}
