//! Opal VM
//!
//! The execution engine: tagged reference-counted values, the array and
//! hash-mapping containers, the shared evaluation stack and call frames,
//! the bytecode dispatch loop, and the recovery-point unwind mechanism
//! backing exceptions.
//!
//! The engine is single-threaded; every heap value is `Rc`-owned and all
//! interpreter state lives in an explicit [`engine::Engine`] context, so
//! independent engines can coexist in one process.

pub mod array;
pub mod config;
pub mod engine;
pub mod errors;
pub mod mapping;
pub mod multiset;
pub mod natives;
pub mod object;
pub mod stack;
pub mod values;

pub use config::EngineConfig;
pub use engine::Engine;
pub use errors::{Control, FatalError, Raise};
pub use natives::{NativeOp, NativeRegistry};
pub use values::Value;
