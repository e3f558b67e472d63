//! Opal Core
//!
//! Shared types used across the compiler front end and the VM: the
//! module/bytecode format and the string interning table.

pub mod code;
pub mod strings;
