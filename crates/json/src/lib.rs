//! Nesting-aware streaming JSON writer.
//!
//! `JsonBuilder` is the only place raw JSON tokens are produced. It keeps an
//! explicit stack of open containers and rejects any token that would make
//! the document unbalanced, so a caller can never flush half a value.

use ljr_common::JournalError;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    Object { awaiting_value: bool, empty: bool },
    Array { empty: bool },
}

/// Snapshot of the builder position, used to drop a partially written value.
#[derive(Clone, Debug)]
pub struct Mark {
    len: usize,
    stack: Vec<Scope>,
    has_root: bool,
}

/// Append-only JSON text buffer with a container stack.
///
/// The buffer is reused across lines: `reset` clears it without releasing
/// its allocation.
#[derive(Debug, Default)]
pub struct JsonBuilder {
    buf: Vec<u8>,
    stack: Vec<Scope>,
    has_root: bool,
}

impl JsonBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            stack: Vec::new(),
            has_root: false,
        }
    }

    // -----------------------------------------------------------------------
    // Containers
    // -----------------------------------------------------------------------

    pub fn begin_object(&mut self) -> Result<(), JournalError> {
        self.before_value()?;
        self.buf.push(b'{');
        self.stack.push(Scope::Object {
            awaiting_value: false,
            empty: true,
        });
        Ok(())
    }

    pub fn end_object(&mut self) -> Result<(), JournalError> {
        match self.stack.last() {
            Some(Scope::Object {
                awaiting_value: false,
                ..
            }) => {
                self.stack.pop();
                self.buf.push(b'}');
                Ok(())
            }
            Some(Scope::Object { .. }) => Err(malformed("object closed after a dangling key")),
            Some(Scope::Array { .. }) => Err(malformed("end_object inside an array")),
            None => Err(malformed("end_object with no open container")),
        }
    }

    pub fn begin_array(&mut self) -> Result<(), JournalError> {
        self.before_value()?;
        self.buf.push(b'[');
        self.stack.push(Scope::Array { empty: true });
        Ok(())
    }

    pub fn end_array(&mut self) -> Result<(), JournalError> {
        match self.stack.last() {
            Some(Scope::Array { .. }) => {
                self.stack.pop();
                self.buf.push(b']');
                Ok(())
            }
            Some(Scope::Object { .. }) => Err(malformed("end_array inside an object")),
            None => Err(malformed("end_array with no open container")),
        }
    }

    pub fn key(&mut self, key: &str) -> Result<(), JournalError> {
        match self.stack.last_mut() {
            Some(Scope::Object {
                awaiting_value,
                empty,
            }) => {
                if *awaiting_value {
                    return Err(malformed("key written while a value is expected"));
                }
                let needs_comma = !*empty;
                *empty = false;
                *awaiting_value = true;
                if needs_comma {
                    self.buf.push(b',');
                }
                self.write_token(key)?;
                self.buf.push(b':');
                Ok(())
            }
            Some(Scope::Array { .. }) => Err(malformed("key written inside an array")),
            None => Err(malformed("key written outside any object")),
        }
    }

    // -----------------------------------------------------------------------
    // Scalars
    // -----------------------------------------------------------------------

    pub fn u64(&mut self, value: u64) -> Result<(), JournalError> {
        self.scalar(&value)
    }

    pub fn i64(&mut self, value: i64) -> Result<(), JournalError> {
        self.scalar(&value)
    }

    /// Non-finite values are written as `null`.
    pub fn f64(&mut self, value: f64) -> Result<(), JournalError> {
        self.scalar(&value)
    }

    pub fn bool(&mut self, value: bool) -> Result<(), JournalError> {
        self.scalar(&value)
    }

    pub fn string(&mut self, value: &str) -> Result<(), JournalError> {
        self.scalar(value)
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    /// True once exactly one top-level value has been fully closed.
    pub fn is_complete(&self) -> bool {
        self.has_root && self.stack.is_empty()
    }

    /// Number of currently open containers.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Clear the text and the container stack, keeping the allocation.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.stack.clear();
        self.has_root = false;
    }

    pub fn mark(&self) -> Mark {
        Mark {
            len: self.buf.len(),
            stack: self.stack.clone(),
            has_root: self.has_root,
        }
    }

    /// Drop everything written since `mark` was taken.
    pub fn rewind(&mut self, mark: Mark) {
        self.buf.truncate(mark.len);
        self.stack = mark.stack;
        self.has_root = mark.has_root;
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn before_value(&mut self) -> Result<(), JournalError> {
        match self.stack.last_mut() {
            None => {
                if self.has_root {
                    return Err(malformed("second top-level value"));
                }
                self.has_root = true;
            }
            Some(Scope::Object { awaiting_value, .. }) => {
                if !*awaiting_value {
                    return Err(malformed("object value written without a key"));
                }
                *awaiting_value = false;
            }
            Some(Scope::Array { empty }) => {
                if !*empty {
                    self.buf.push(b',');
                }
                *empty = false;
            }
        }
        Ok(())
    }

    fn scalar<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), JournalError> {
        self.before_value()?;
        self.write_token(value)
    }

    fn write_token<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), JournalError> {
        serde_json::to_writer(&mut self.buf, value).map_err(|_| malformed("unserializable scalar"))
    }
}

fn malformed(reason: &'static str) -> JournalError {
    JournalError::MalformedDocument { reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(b: &JsonBuilder) -> &str {
        std::str::from_utf8(b.as_bytes()).unwrap()
    }

    #[test]
    fn test_nested_document() {
        let mut b = JsonBuilder::new();
        b.begin_object().unwrap();
        b.key("frame").unwrap();
        b.begin_object().unwrap();
        b.key("ts").unwrap();
        b.u64(5).unwrap();
        b.key("echoes").unwrap();
        b.begin_array().unwrap();
        b.begin_array().unwrap();
        b.u64(1).unwrap();
        b.f64(100.0).unwrap();
        b.f64(0.5).unwrap();
        b.u64(0).unwrap();
        b.end_array().unwrap();
        b.end_array().unwrap();
        assert!(!b.is_complete());
        assert_eq!(b.depth(), 2);
        b.end_object().unwrap();
        b.end_object().unwrap();

        assert!(b.is_complete());
        assert_eq!(text(&b), r#"{"frame":{"ts":5,"echoes":[[1,100.0,0.5,0]]}}"#);
    }

    #[test]
    fn test_scalars() {
        let mut b = JsonBuilder::new();
        b.begin_array().unwrap();
        b.i64(-3).unwrap();
        b.u64(u64::MAX).unwrap();
        b.bool(true).unwrap();
        b.string("a \"quoted\"\nline").unwrap();
        b.f64(f64::NAN).unwrap();
        b.end_array().unwrap();

        let parsed: serde_json::Value = serde_json::from_slice(b.as_bytes()).unwrap();
        assert_eq!(parsed[0], -3);
        assert_eq!(parsed[1], u64::MAX);
        assert_eq!(parsed[2], true);
        assert_eq!(parsed[3], "a \"quoted\"\nline");
        assert!(parsed[4].is_null());
    }

    #[test]
    fn test_unbalanced_close_is_rejected() {
        let mut b = JsonBuilder::new();
        assert!(matches!(b.end_object(), Err(JournalError::MalformedDocument { .. })));

        b.begin_object().unwrap();
        assert!(matches!(b.end_array(), Err(JournalError::MalformedDocument { .. })));

        b.key("k").unwrap();
        assert!(matches!(b.end_object(), Err(JournalError::MalformedDocument { .. })));
        assert!(!b.is_complete());
    }

    #[test]
    fn test_key_rules() {
        let mut b = JsonBuilder::new();
        assert!(b.key("top").is_err());
        b.begin_array().unwrap();
        assert!(b.key("in-array").is_err());

        let mut b = JsonBuilder::new();
        b.begin_object().unwrap();
        assert!(b.u64(1).is_err());
        b.key("a").unwrap();
        assert!(b.key("b").is_err());
    }

    #[test]
    fn test_single_top_level_value() {
        let mut b = JsonBuilder::new();
        b.begin_object().unwrap();
        b.end_object().unwrap();
        assert!(b.is_complete());
        assert!(b.begin_object().is_err());
        assert!(b.u64(1).is_err());
    }

    #[test]
    fn test_reset_reuses_builder() {
        let mut b = JsonBuilder::with_capacity(64);
        b.begin_object().unwrap();
        b.key("x").unwrap();
        b.u64(1).unwrap();
        b.end_object().unwrap();
        b.reset();

        assert!(b.as_bytes().is_empty());
        assert!(!b.is_complete());
        b.begin_array().unwrap();
        b.end_array().unwrap();
        assert_eq!(text(&b), "[]");
    }

    #[test]
    fn test_rewind_drops_partial_value() {
        let mut b = JsonBuilder::new();
        b.begin_object().unwrap();
        b.key("ts").unwrap();
        b.u64(7).unwrap();
        let mark = b.mark();
        b.key("states").unwrap();
        b.begin_array().unwrap();
        b.u64(1).unwrap();
        b.rewind(mark);

        b.key("echoes").unwrap();
        b.begin_array().unwrap();
        b.end_array().unwrap();
        b.end_object().unwrap();
        assert_eq!(text(&b), r#"{"ts":7,"echoes":[]}"#);
    }
}
