//! Error types for the tkan-core library.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants
//! carry enough context (byte offsets, field numbers, message names) to
//! diagnose a bad payload, and [`Error::kind`] folds them down to the small
//! set of status kinds callers usually branch on.

use thiserror::Error;

/// Result type alias for tkan operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all tkan operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The arena's block allocator could not provide memory
    #[error("arena allocation of {requested} bytes failed")]
    OutOfMemory {
        /// Number of bytes requested when the allocator gave up
        requested: usize,
    },

    /// Input is not valid protobuf wire format
    #[error("malformed wire data at offset {offset}: {details}")]
    Malformed {
        /// Byte offset where the error occurred
        offset: usize,
        /// Detailed description of the issue
        details: String,
    },

    /// A `string` field carried bytes that are not valid UTF-8
    #[error("field {field} at offset {offset} is not valid UTF-8")]
    BadUtf8 {
        /// Number of the offending field
        field: u32,
        /// Byte offset of the payload
        offset: usize,
    },

    /// Submessage nesting exceeded the configured limit
    #[error("message nesting exceeds the maximum depth of {limit}")]
    MaxDepthExceeded {
        /// The configured limit
        limit: u32,
    },

    /// A required field was unset while required checking was enabled
    #[error("message '{message}' is missing required fields")]
    MissingRequired {
        /// Full name of the message type
        message: String,
    },

    /// The field type is not supported by this build
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// One of the arenas cannot take part in a fuse
    #[error("arena fuse refused: {reason}")]
    FuseRefused {
        /// Why the fuse was refused
        reason: &'static str,
    },

    /// The arena does not share a lifetime with the message it is used for
    #[error("arena is not fused with the arena owning the message")]
    ArenaMismatch,

    /// A message of one type was used where another was expected
    #[error("type mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch {
        /// Name of the expected message type
        expected: String,
        /// Name of the supplied message type
        found: String,
    },

    /// A field number was looked up that the message does not declare
    #[error("message '{message}' has no field {number}")]
    FieldNotFound {
        /// Full name of the message type
        message: String,
        /// The requested field number
        number: u32,
    },

    /// Invalid field number in descriptor
    #[error("invalid field number {number}: must be between 1 and {max}")]
    InvalidFieldNumber {
        /// The invalid field number
        number: u32,
        /// Maximum valid field number
        max: u32,
    },

    /// A schema could not be turned into mini tables
    #[error("invalid schema: {0}")]
    Schema(String),

    /// Failed to parse a serialized descriptor set
    #[error("failed to parse FileDescriptorSet: {0}")]
    DescriptorParse(#[from] prost::DecodeError),

    /// Failed to build descriptors with prost-reflect
    #[error("failed to build file descriptor: {0}")]
    DescriptorBuild(String),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Arena allocation failed
    OutOfMemory,
    /// Truncated or otherwise invalid wire data
    Malformed,
    /// Invalid UTF-8 in a `string` field
    BadUtf8,
    /// Nesting limit exceeded
    MaxDepthExceeded,
    /// Required field unset
    MissingRequired,
    /// Field type disabled in this build
    Unsupported,
    /// Misuse of the API or an invalid schema
    Usage,
}

impl Error {
    /// Creates a new allocation failure
    pub fn out_of_memory(requested: usize) -> Self {
        Self::OutOfMemory { requested }
    }

    /// Creates a new wire format error
    pub fn malformed(offset: usize, details: impl Into<String>) -> Self {
        Self::Malformed {
            offset,
            details: details.into(),
        }
    }

    /// Creates a new schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Creates a new descriptor build error
    pub fn descriptor_build(msg: impl Into<String>) -> Self {
        Self::DescriptorBuild(msg.into())
    }

    /// Creates a new missing-required error
    pub fn missing_required(message: impl Into<String>) -> Self {
        Self::MissingRequired {
            message: message.into(),
        }
    }

    /// Returns the status kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::Malformed { .. } => ErrorKind::Malformed,
            Self::BadUtf8 { .. } => ErrorKind::BadUtf8,
            Self::MaxDepthExceeded { .. } => ErrorKind::MaxDepthExceeded,
            Self::MissingRequired { .. } => ErrorKind::MissingRequired,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            _ => ErrorKind::Usage,
        }
    }

    /// Returns true if the error was caused by the input bytes rather than
    /// by the caller or the environment
    pub fn is_data_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Malformed
                | ErrorKind::BadUtf8
                | ErrorKind::MaxDepthExceeded
                | ErrorKind::MissingRequired
        )
    }
}
