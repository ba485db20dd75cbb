// Layer 3 - Aggregators
// Derived, presentation-facing views over processed state

pub mod depth_aggregator;

pub use depth_aggregator::{aggregate, DepthRow, DepthView, DEFAULT_DISPLAY_DEPTH};
