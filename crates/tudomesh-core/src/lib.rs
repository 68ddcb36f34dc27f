//! Geometric core of the map-fusion service: map model, feature extraction,
//! rotation-invariant ICP, the calibration store, and the live pose pipeline.
//!
//! Everything in this crate is synchronous and side-effect free except for
//! `calibration::Store::load`/`save`, which touch disk. Scheduling, the
//! message bus, HTTP, and rendering live in the `tudomesh` and
//! `tudomesh-render` crates and only call into this one.

pub mod calibration;
pub mod error;
pub mod features;
pub mod geometry;
pub mod icp;
pub mod map;
pub mod pose;
mod spatial_grid;

pub use error::CoreError;
