//! Engine limits.

/// Resource limits for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum operand-stack depth, in values.
    pub max_stack: usize,
    /// Maximum call-frame depth.
    pub max_call_depth: usize,
    /// Abort after this many dispatched instructions. `None` runs unbounded.
    pub instruction_limit: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_stack: 65536,
            max_call_depth: 256,
            instruction_limit: None,
        }
    }
}
