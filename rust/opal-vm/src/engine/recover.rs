//! Recovery points: the saved engine heights a raised error unwinds to.

use crate::engine::Engine;
use crate::errors::{Control, FatalError};
use crate::values::Value;

/// Everything a `CatchStart` saves. Unwinding truncates the engine back to
/// these heights; the values dropped on the way release their handles.
pub(crate) struct RecoveryPoint {
    /// Frame count when the guarded region was entered.
    pub frames: usize,
    /// Operand-stack height.
    pub stack: usize,
    /// Mark-stack height.
    pub marks: usize,
    /// Where control resumes with the thrown value pushed.
    pub handler: usize,
}

impl Engine {
    /// Unwind a raised value to the innermost recovery point above
    /// `base_depth` frames. `Ok` means control has been transferred to the
    /// handler; `Err` hands the raise (or a fatal condition) outward.
    pub(crate) fn handle_raise(&mut self, raised: Value, base_depth: usize) -> Result<(), Control> {
        let catchable = self
            .recovery
            .last()
            .is_some_and(|point| point.frames > base_depth);
        if !catchable {
            // No recovery point within this dispatch; record the trace
            // before dismantling the frames it describes.
            self.last_trace = self.backtrace();
            self.truncate_to(base_depth);
            return Err(Control::Raise(raised));
        }
        let point = self
            .recovery
            .pop()
            .ok_or_else(|| FatalError::Invariant("recovery chain emptied underfoot".to_string()))?;
        if point.frames > self.frames.len() {
            return Err(Control::Fatal(FatalError::Invariant(
                "recovery point above the live frames".to_string(),
            )));
        }
        self.frames.truncate(point.frames);
        self.stack.truncate(point.stack);
        self.stack.truncate_marks(point.marks);
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| FatalError::Invariant("recovery point with no frame".to_string()))?;
        frame.pc = point.handler;
        self.stack.push(raised)?;
        Ok(())
    }

    /// Drop frames, stack and marks back to `base_depth` frames, releasing
    /// every handle above it.
    pub(crate) fn truncate_to(&mut self, base_depth: usize) {
        while self.recovery.last().is_some_and(|p| p.frames > base_depth) {
            self.recovery.pop();
        }
        if let Some(frame) = self.frames.get(base_depth) {
            let floor = frame.locals_base;
            let marks = frame.saved_marks;
            self.frames.truncate(base_depth);
            self.stack.truncate(floor);
            self.stack.truncate_marks(marks);
        }
    }
}
