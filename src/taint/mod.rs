//! Forward and backward taint propagation, the two halves of the analysis
//! engine built on top of the frozen event store, the register
//! reconstructor, and the effective-address resolver.

pub mod backward;
pub mod forward;

pub use backward::{taint_backward, BackwardOptions, BackwardResult, TerminationTag};
pub use forward::{taint_forward, ForwardOptions, ForwardResult};
