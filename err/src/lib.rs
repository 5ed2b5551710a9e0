//! Error types shared by every crate in the workspace.
//!
//! Every crate re-exports [`Error`] and [`Result`] from here rather than
//! defining its own error type, so a caller walking from a container down
//! through a partition into a file-system reader never has to match on more
//! than one error enum.

use std::fmt;

/// Where an error was raised, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub component: &'static str,
    pub detail: String,
    pub offset: Option<u64>,
}

impl ErrorContext {
    pub fn new(component: &'static str, detail: impl Into<String>) -> Self {
        Self {
            component,
            detail: detail.into(),
            offset: None,
        }
    }

    pub fn at(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.component, self.detail)?;
        if let Some(offset) = self.offset {
            write!(f, " (at offset {offset:#x})")?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad magic: {0}")]
    BadMagic(ErrorContext),
    #[error("truncated: {0}")]
    Truncated(ErrorContext),
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(ErrorContext),
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(ErrorContext),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(ErrorContext),
    #[error("corrupt structure: {0}")]
    CorruptStructure(ErrorContext),
    #[error("not found: {0}")]
    NotFound(ErrorContext),
    #[error("not writable: {0}")]
    NotWritable(ErrorContext),
    #[error("out of space: {0}")]
    OutOfSpace(ErrorContext),
    #[error("parent mismatch: {0}")]
    ParentMismatch(ErrorContext),
    #[error("non-contiguous volume: {0}")]
    NonContiguousVolume(ErrorContext),
    #[error("cancelled: {0}")]
    Cancelled(ErrorContext),
    #[error("read error: {0}")]
    ReadError(ErrorContext),
    #[error("not implemented: {0}")]
    Unimplemented(ErrorContext),
}

impl Error {
    pub fn context(&self) -> &ErrorContext {
        match self {
            Error::BadMagic(c)
            | Error::Truncated(c)
            | Error::ChecksumMismatch(c)
            | Error::UnsupportedFeature(c)
            | Error::UnsupportedVersion(c)
            | Error::CorruptStructure(c)
            | Error::NotFound(c)
            | Error::NotWritable(c)
            | Error::OutOfSpace(c)
            | Error::ParentMismatch(c)
            | Error::NonContiguousVolume(c)
            | Error::Cancelled(c)
            | Error::ReadError(c)
            | Error::Unimplemented(c) => c,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::ReadError(ErrorContext::new("io", err.to_string()))
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Shorthand for building a context at the call site, e.g.
/// `return Err(Error::BadMagic(ctx!("ntfs", "expected FILE0")))`.
#[macro_export]
macro_rules! ctx {
    ($component:expr, $($arg:tt)*) => {
        $crate::ErrorContext::new($component, format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_display_includes_offset() {
        let ctx = ErrorContext::new("ntfs", "bad fixup").at(0x1000);
        assert_eq!(format!("{ctx}"), "[ntfs] bad fixup (at offset 0x1000)");
    }

    #[test]
    fn context_display_without_offset() {
        let ctx = ErrorContext::new("gpt", "crc mismatch");
        assert_eq!(format!("{ctx}"), "[gpt] crc mismatch");
    }
}
