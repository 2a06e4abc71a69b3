//! Resource sampling for running guest processes.

mod sampler;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use sampler::*;
