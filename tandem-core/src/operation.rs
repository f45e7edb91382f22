//! Text operations and their inclusion transformation.
//!
//! Positions and lengths count Unicode scalar values, not bytes. An operation
//! transformed against a concurrent one yields the operation that has the same
//! intent on the document after the concurrent one was applied:
//!
//! ```text
//!   apply(apply(doc, a), b.transform(a, !p)) == apply(apply(doc, b), a.transform(b, p))
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    #[error("position {position} is outside a document of {len} chars")]
    OutOfBounds { position: usize, len: usize },
    #[error("unexpected timestamp: expected remote count {expected}, got {actual}")]
    UnexpectedTimestamp { expected: u32, actual: u32 },
}

/// A single edit of a text document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    NoOp,
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
    /// Two operations applied in sequence; the second is relative to the
    /// document produced by the first.
    Split(Box<Operation>, Box<Operation>),
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        if text.is_empty() {
            return Operation::NoOp;
        }
        Operation::Insert { position, text }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        if length == 0 {
            return Operation::NoOp;
        }
        Operation::Delete { position, length }
    }

    /// Sequence two operations, dropping no-ops.
    pub fn split(first: Operation, second: Operation) -> Self {
        match (first.is_noop(), second.is_noop()) {
            (true, true) => Operation::NoOp,
            (true, false) => second,
            (false, true) => first,
            (false, false) => Operation::Split(Box::new(first), Box::new(second)),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Operation::NoOp)
    }

    /// Apply this operation to `text` in place.
    pub fn apply(&self, text: &mut String) -> Result<(), OtError> {
        match self {
            Operation::NoOp => Ok(()),
            Operation::Insert { position, text: inserted } => {
                let at = byte_offset(text, *position)?;
                text.insert_str(at, inserted);
                Ok(())
            }
            Operation::Delete { position, length } => {
                let start = byte_offset(text, *position)?;
                let end = byte_offset(text, position + length)?;
                text.replace_range(start..end, "");
                Ok(())
            }
            Operation::Split(first, second) => {
                first.apply(text)?;
                second.apply(text)
            }
        }
    }

    /// Transform `self` so it applies after the concurrent `other`.
    ///
    /// `priority` decides ties between inserts at the same position: when
    /// true, `self` is placed before `other`'s text.
    pub fn transform(&self, other: &Operation, priority: bool) -> Operation {
        use Operation::*;

        match (self, other) {
            (NoOp, _) => NoOp,
            (_, NoOp) => self.clone(),
            (Split(first, second), _) => {
                let first_t = first.transform(other, priority);
                let other_t = other.transform(first, !priority);
                let second_t = second.transform(&other_t, priority);
                Operation::split(first_t, second_t)
            }
            (_, Split(first, second)) => self
                .transform(first, priority)
                .transform(second, priority),
            (Insert { position: p, text }, Insert { position: q, text: other_text }) => {
                if p < q || (p == q && priority) {
                    self.clone()
                } else {
                    Insert {
                        position: p + char_len(other_text),
                        text: text.clone(),
                    }
                }
            }
            (Insert { position: p, text }, Delete { position: q, length: n }) => {
                let position = if p <= q {
                    *p
                } else if *p >= q + n {
                    p - n
                } else {
                    *q
                };
                Insert {
                    position,
                    text: text.clone(),
                }
            }
            (Delete { position: p, length: n }, Insert { position: q, text }) => {
                let inserted = char_len(text);
                if *q >= p + n {
                    self.clone()
                } else if q <= p {
                    Delete {
                        position: p + inserted,
                        length: *n,
                    }
                } else {
                    let head = q - p;
                    Operation::split(
                        Operation::delete(*p, head),
                        Operation::delete(p + inserted, n - head),
                    )
                }
            }
            (Delete { position: p, length: n }, Delete { position: q, length: m }) => {
                let (start, end) = (*p, p + n);
                let (other_start, other_end) = (*q, q + m);
                if end <= other_start {
                    self.clone()
                } else if start >= other_end {
                    Delete {
                        position: p - m,
                        length: *n,
                    }
                } else {
                    let overlap = end.min(other_end) - start.max(other_start);
                    Operation::delete(start.min(other_start), n - overlap)
                }
            }
        }
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn byte_offset(text: &str, position: usize) -> Result<usize, OtError> {
    text.char_indices()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(text.len()))
        .nth(position)
        .ok_or(OtError::OutOfBounds {
            position,
            len: char_len(text),
        })
}
