//! Simulated collaborators: a paced frame source and latency-bound stage work.
//!
//! These stand in for a camera and real per-frame processing when running
//! the pipeline from the command line or in tests.

mod frame_source;
mod transform;

pub use frame_source::{Frame, FrameSource};
pub use transform::{Operation, SimulatedTransform};
