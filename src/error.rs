use thiserror::Error;

macro_rules! image_format_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::ImageFormat {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::ImageFormat {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// - [`Error::InvalidInput`] - Rejected synchronously at construction (bad bytes, dead
///   process, architecture mismatch). Never retried.
/// - [`Error::ImageFormat`] - The file is not a mappable PE image (not a DLL, managed
///   image, or structurally malformed). Rejected at parse time, never later.
/// - [`Error::OutOfBounds`] - An out-of-bound read would have occurred while parsing.
/// - [`Error::Resolution`] - A dependency file, module, export, or internal symbol
///   could not be located. Fatal to the current mapping attempt.
/// - [`Error::RemoteOperation`] - A call into the foreign process failed; carries the
///   OS error code. Fatal to the current mapping attempt.
/// - [`Error::EntryPoint`] - The mapped image's entry point signalled failure.
/// - [`Error::Goblin`] / [`Error::FileError`] - Passthrough PE-header and filesystem
///   errors.
///
/// Any error raised during `map()` triggers a full rollback of the partially applied
/// foreign-process state; there are no automatic retries anywhere in the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Construction input was rejected before any foreign-process effect took place.
    #[error("Invalid input - {0}")]
    InvalidInput(String),

    /// The provided file is not a PE image this engine can map.
    ///
    /// The error includes the source location where the malformation was detected.
    #[error("Image format - {file}:{line}: {message}")]
    ImageFormat {
        /// The message to be printed for the ImageFormat error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the image.
    #[error("Out of bound read would have occurred!")]
    OutOfBounds,

    /// A module, export, dependency file, or loader-internal symbol was not found.
    #[error("Failed to resolve {0}")]
    Resolution(String),

    /// An operation inside the foreign process failed.
    #[error("Remote operation '{operation}' failed with OS error {code}")]
    RemoteOperation {
        /// The remote primitive or routine that failed
        operation: &'static str,
        /// The OS error code reported for the failure
        code: u32,
    },

    /// The DLL entry point returned `FALSE`.
    #[error("The DLL entry point signalled failure for {0}")]
    EntryPoint(String),

    /// Error while parsing the PE headers
    #[error("Error while parsing the PE headers: {0}")]
    Goblin(#[from] goblin::error::Error),

    /// Error while accessing the file system
    #[error("Error while accessing the file system: {0}")]
    FileError(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a [`Error::RemoteOperation`] with the given operation name and code.
    #[must_use]
    pub fn remote(operation: &'static str, code: u32) -> Self {
        Error::RemoteOperation { operation, code }
    }
}
