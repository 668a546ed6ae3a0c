//! Core value types shared by the recorder, the evaluator and the stores
//!
//! # Key Types
//!
//! - **`UserOffset`**: bit position assigned to one user identity
//! - **`BitOp`**: set-algebra operator applied across bitmaps
//! - **`BitValue`**: the value written at a user's offset
//!
//! # Example
//!
//! ```rust
//! use bitesized::types::{BitOp, BitValue};
//!
//! let op: BitOp = "xor".parse().unwrap();
//! assert_eq!(op, BitOp::Xor);
//!
//! let value = BitValue::try_from(1u8).unwrap();
//! assert!(value.is_set());
//! ```

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bit position of a user inside every event bitmap
///
/// Offsets are allocated densely starting at 0 and are never reused.
pub type UserOffset = u64;

/// Set-algebra operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BitOp {
    /// Users present in every bitmap
    And,
    /// Users present in at least one bitmap
    Or,
    /// Users present in an odd number of bitmaps
    Xor,
    /// Complement of a single bitmap
    Not,
}

impl BitOp {
    /// Command name understood by the store (`BITOP <name> ...`)
    pub fn as_str(&self) -> &'static str {
        match self {
            BitOp::And => "AND",
            BitOp::Or => "OR",
            BitOp::Xor => "XOR",
            BitOp::Not => "NOT",
        }
    }

    /// Check that `count` source keys are acceptable for this operator
    pub fn check_arity(&self, count: usize) -> Result<(), Error> {
        match self {
            BitOp::Not if count != 1 => Err(Error::InvalidOperandCount {
                op: self.to_string(),
                expected: "exactly one",
                got: count,
            }),
            BitOp::And | BitOp::Or | BitOp::Xor if count == 0 => {
                Err(Error::InvalidOperandCount {
                    op: self.to_string(),
                    expected: "at least one",
                    got: count,
                })
            },
            _ => Ok(()),
        }
    }
}

impl fmt::Display for BitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BitOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AND" => Ok(BitOp::And),
            "OR" => Ok(BitOp::Or),
            "XOR" => Ok(BitOp::Xor),
            "NOT" => Ok(BitOp::Not),
            other => Err(Error::InvalidArgument(format!(
                "unknown operator '{}'",
                other
            ))),
        }
    }
}

/// Value written to a user's bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitValue {
    /// Bit cleared (0)
    Clear,
    /// Bit set (1)
    Set,
}

impl BitValue {
    /// True for [`BitValue::Set`]
    pub fn is_set(&self) -> bool {
        matches!(self, BitValue::Set)
    }

    /// Numeric form used on the wire
    pub fn as_u8(&self) -> u8 {
        match self {
            BitValue::Clear => 0,
            BitValue::Set => 1,
        }
    }
}

impl From<bool> for BitValue {
    fn from(b: bool) -> Self {
        if b {
            BitValue::Set
        } else {
            BitValue::Clear
        }
    }
}

impl TryFrom<u8> for BitValue {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(BitValue::Clear),
            1 => Ok(BitValue::Set),
            other => Err(Error::InvalidArgument(format!(
                "bit value must be 0 or 1, got {}",
                other
            ))),
        }
    }
}
