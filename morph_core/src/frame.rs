//! Execution frames.
//!
//! A frame is the optional context argument of `execute_with_frame`. Guards
//! that read the frame are treated as dynamic, like guards that read
//! arguments.

use crate::value::Value;

/// Local slots of one guest activation.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    slots: Vec<Value>,
}

impl Frame {
    /// Create a frame with `size` null slots.
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![Value::Null; size],
        }
    }

    /// Create a frame from existing slot values.
    pub fn from_slots(slots: Vec<Value>) -> Self {
        Self { slots }
    }

    /// Read a slot.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.slots.get(index)
    }

    /// Write a slot, growing the frame if needed.
    pub fn set(&mut self, index: usize, value: Value) {
        if index >= self.slots.len() {
            self.slots.resize(index + 1, Value::Null);
        }
        self.slots[index] = value;
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the frame has no slots.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_grows_on_set() {
        let mut frame = Frame::new(1);
        frame.set(3, Value::Int(9));
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.get(3), Some(&Value::Int(9)));
        assert_eq!(frame.get(1), Some(&Value::Null));
        assert_eq!(frame.get(4), None);
    }
}
