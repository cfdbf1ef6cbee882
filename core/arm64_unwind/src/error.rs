//! Error codes for the arm64_unwind crate
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
use core::fmt;

/// The error type for virtual unwind operations.
///
/// None of these are retryable. When a call returns an error the context it
/// was given must be treated as unreliable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Attempted to read past the end of a local byte buffer.
    OutOfBoundsRead {
        /// Position in the buffer that triggered the out-of-bounds access.
        index: usize,
    },

    /// The unwind descriptor uses a header version or chaining form this
    /// unwinder does not understand.
    UnsupportedVersion {
        /// The offending version bits.
        version: u32,
    },

    /// The opcode stream is malformed, references an out-of-range register,
    /// or uses a reserved encoding.
    InvalidSequence {
        /// The opcode byte being processed when the problem was found.
        opcode: u8,
        /// Static description of what was wrong.
        reason: &'static str,
    },

    /// A recognized custom-frame opcode that is disabled or not implemented.
    UnsupportedFeature {
        /// The opcode byte.
        opcode: u8,
        /// Name of the unsupported feature.
        feature: &'static str,
    },

    /// A stack read fell outside the declared bounds, was misaligned, or the
    /// memory accessor refused it.
    StackValidationFailure {
        /// First byte of the rejected span.
        address: u64,
        /// Size of the rejected span in bytes.
        size: u64,
    },

    /// The frame did not make progress (leaf with PC == LR, or a walk step
    /// that left both PC and SP unchanged).
    MalformedStack {
        /// Program counter at the time of the failure.
        pc: u64,
        /// Stack pointer at the time of the failure.
        sp: u64,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::OutOfBoundsRead { index } => write!(fmt, "Attempted to read past buffer bounds at index {index}"),
            Error::UnsupportedVersion { version } => write!(fmt, "Unsupported unwind data version {version}"),
            Error::InvalidSequence { opcode, reason } => {
                write!(fmt, "Invalid unwind sequence at opcode 0x{opcode:02X}: {reason}")
            }
            Error::UnsupportedFeature { opcode, feature } => {
                write!(fmt, "Unsupported unwind feature {feature} (opcode 0x{opcode:02X})")
            }
            Error::StackValidationFailure { address, size } => {
                write!(fmt, "Stack validation failed for {size} bytes at {address:016X}")
            }
            Error::MalformedStack { pc, sp } => {
                write!(fmt, "Malformed stack detected with PC: {pc:016X}, SP: {sp:016X}")
            }
        }
    }
}

/// A specialized result type for the arm64_unwind crate.
pub type UwResult<T> = Result<T, Error>;

impl Error {
    /// Shorthand for an [`Error::InvalidSequence`].
    pub(crate) const fn invalid(opcode: u8, reason: &'static str) -> Self {
        Error::InvalidSequence { opcode, reason }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::Error;

    fn assert_display(err: Error, expected: &str) {
        assert_eq!(format!("{err}"), expected);
    }

    #[test]
    fn out_of_bounds_read_display() {
        assert_display(Error::OutOfBoundsRead { index: 5 }, "Attempted to read past buffer bounds at index 5");
    }

    #[test]
    fn unsupported_version_display() {
        assert_display(Error::UnsupportedVersion { version: 2 }, "Unsupported unwind data version 2");
    }

    #[test]
    fn invalid_sequence_display() {
        assert_display(
            Error::invalid(0xE6, "dangling save_next"),
            "Invalid unwind sequence at opcode 0xE6: dangling save_next",
        );
    }

    #[test]
    fn unsupported_feature_display() {
        assert_display(
            Error::UnsupportedFeature { opcode: 0xEB, feature: "EC context" },
            "Unsupported unwind feature EC context (opcode 0xEB)",
        );
    }

    #[test]
    fn stack_validation_failure_display() {
        assert_display(
            Error::StackValidationFailure { address: 0x1000, size: 16 },
            "Stack validation failed for 16 bytes at 0000000000001000",
        );
    }

    #[test]
    fn malformed_stack_display() {
        assert_display(
            Error::MalformedStack { pc: 0x1234, sp: 0xABCD },
            "Malformed stack detected with PC: 0000000000001234, SP: 000000000000ABCD",
        );
    }
}
