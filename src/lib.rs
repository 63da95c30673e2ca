//! Heightmap rasterization of implicit surfaces
//!
//! An implicit solid is a scalar function `f(x, y, z)` whose negative region
//! is filled space and whose zero level set is the surface.  This crate
//! rasterizes such a solid into a depth image (the greatest occupied `z` per
//! pixel) and a packed-normal image, using interval arithmetic to prune
//! empty or filled regions of a voxel grid and batched evaluation for the
//! rest.  Rendering is split across worker threads, each owning a disjoint
//! rectangle of the image plane.
//!
//! ```
//! use heightcast::{
//!     context::Context,
//!     render::{render, CancelToken},
//!     voxels::Voxels,
//! };
//! use nalgebra::{Matrix4, Vector3};
//!
//! // f = x^2 + y^2 + z^2 - 0.25, a sphere of radius 0.5
//! let mut ctx = Context::new();
//! let (x, y, z) = (ctx.x(), ctx.y(), ctx.z());
//! let x2 = ctx.square(x)?;
//! let y2 = ctx.square(y)?;
//! let z2 = ctx.square(z)?;
//! let sum = ctx.add(x2, y2)?;
//! let sum = ctx.add(sum, z2)?;
//! let r2 = ctx.constant(0.25);
//! let sphere = ctx.sub(sum, r2)?;
//!
//! let voxels = Voxels::new(
//!     Vector3::new(-1.0, -1.0, -1.0),
//!     Vector3::new(1.0, 1.0, 1.0),
//!     Vector3::new(32, 32, 32),
//! )?;
//! let (depth, norm) = render(
//!     &ctx,
//!     sphere,
//!     &voxels,
//!     &CancelToken::new(),
//!     Matrix4::identity(),
//!     4,
//! )?;
//!
//! // The sphere's apex is in the middle of the image, pointing up
//! assert!(depth[(16, 16)] > 0.4);
//! assert_eq!(norm[(16, 16)] >> 24, 0xFF);
//! # Ok::<(), heightcast::Error>(())
//! ```
pub mod context;
pub mod eval;
pub mod render;
pub mod types;
pub mod voxels;

mod error;
pub use error::Error;
