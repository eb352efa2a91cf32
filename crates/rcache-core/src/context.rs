//! Nesting depth of the patch layers wrapping one test.
//!
//! Every patch layer applied to a test enters the test's [`Context`] on the
//! way in and exits it on the way out. The context owns the test's call
//! stack and persists it exactly once, when the outermost layer exits.

use rcache_error::{RcacheError, Result};

use crate::hooks::{SharedCallStack, StackKey};

/// Depth counter for one test's chain of patch layers.
#[derive(Debug, Clone)]
pub struct Context {
    key: StackKey,
    depth: u32,
    stack: SharedCallStack,
}

impl Context {
    /// A context entered by its first layer.
    #[must_use]
    pub fn new(stack: SharedCallStack) -> Self {
        Self {
            key: stack.key(),
            depth: 1,
            stack,
        }
    }

    #[must_use]
    pub fn key(&self) -> &StackKey {
        &self.key
    }

    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    #[must_use]
    pub fn stack(&self) -> &SharedCallStack {
        &self.stack
    }

    /// One more nested layer.
    pub fn enter(&mut self) {
        self.depth += 1;
    }

    /// One layer done. Returns `true` when this was the outermost layer.
    ///
    /// Exiting a context that is already at depth zero is an error.
    pub fn exit(&mut self) -> Result<bool> {
        if self.depth == 0 {
            return Err(RcacheError::ContextUnderflow {
                key: self.key.to_string(),
            });
        }
        self.depth -= 1;
        Ok(self.depth == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_returns_to_zero_once() {
        let mut ctx = Context::new(SharedCallStack::new(StackKey::new("m", "t")));
        ctx.enter();
        ctx.enter();
        assert_eq!(ctx.depth(), 3);
        assert!(!ctx.exit().unwrap());
        assert!(!ctx.exit().unwrap());
        assert!(ctx.exit().unwrap());
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_underflow_is_reported() {
        let mut ctx = Context::new(SharedCallStack::new(StackKey::new("m", "t")));
        assert!(ctx.exit().unwrap());
        let err = ctx.exit().unwrap_err();
        assert!(matches!(err, RcacheError::ContextUnderflow { ref key } if key == "m.t"));
    }
}
