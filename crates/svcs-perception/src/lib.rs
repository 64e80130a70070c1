//! `svcs-perception` – per-frame perception policy.
//!
//! Turns raw probe input into the pieces the fusion engine needs before any
//! state is touched.
//!
//! # Modules
//!
//! - [`pose`] – [`pose_matrix`][pose::pose_matrix]: device orientation
//!   angles → flattened 4×4 pose matrix handed to the 3-D back-projector.
//! - [`sampling`] – [`SamplingPolicy`][sampling::SamplingPolicy]: stride
//!   rules deciding which frames run detection and semantic description.
//! - [`identity`] – [`IdentityResolver`][identity::IdentityResolver]: derives
//!   a stable [`ObjectKey`][svcs_types::ObjectKey] for every detection, from
//!   the tracker id or a spatial bucket.

pub mod identity;
pub mod pose;
pub mod sampling;

pub use identity::IdentityResolver;
pub use pose::{PoseMatrix, pose_matrix};
pub use sampling::{FrameDecision, SamplingPolicy};
