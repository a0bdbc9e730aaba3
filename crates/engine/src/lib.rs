//! The step-by-step PowerPC-32 execution engine: instruction decode, the
//! architectural register file, exception injection, and the main
//! fetch-decode-execute loop for one CPU.

pub mod decode;
mod exception;
mod exec;

pub use decode::{Decoder, Op};
pub use exception::Exception;
pub use exec::{Cpu, MAX_BREAKPOINTS, RunState, Stats, StepOutcome};
