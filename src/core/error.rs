use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    Corrupt,
    Io,
    Permission,
    Busy,
    UnsupportedCard,
    Checksum,
    NoCard,
    NoData,
    UnresponsiveCard,
    TooLarge,
    ProtoMismatch,
    CommFailed,
    DeviceNotFound,
    NoDevices,
    InternalLimit,
    Api,
    NotShared,
    SharingViolation,
    Unsupported,
}

/// Coarse failure classes used by callers deciding whether to retry, reset or give up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    /// The ATR was malformed or unsupported; the card must be reset first.
    Parse,
    /// Block-level damage recovered locally by the T=1 engine.
    Protocol,
    /// Nothing usable came back; triggers the one-shot forced re-init.
    Comm,
    /// Registry, enumeration or device-control failure.
    Device,
    /// No free slot or handle, or a reference limit was reached.
    ResourceExhausted,
    Other,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::UnsupportedCard | ErrorKind::Checksum => ErrorCategory::Parse,
            ErrorKind::ProtoMismatch => ErrorCategory::Protocol,
            ErrorKind::CommFailed | ErrorKind::NoData | ErrorKind::UnresponsiveCard => {
                ErrorCategory::Comm
            }
            ErrorKind::NoCard
            | ErrorKind::DeviceNotFound
            | ErrorKind::NoDevices
            | ErrorKind::Api
            | ErrorKind::Io
            | ErrorKind::NotShared
            | ErrorKind::SharingViolation => ErrorCategory::Device,
            ErrorKind::InternalLimit | ErrorKind::TooLarge | ErrorKind::Busy => {
                ErrorCategory::ResourceExhausted
            }
            ErrorKind::Internal
            | ErrorKind::Usage
            | ErrorKind::NotFound
            | ErrorKind::Corrupt
            | ErrorKind::Permission
            | ErrorKind::Unsupported => ErrorCategory::Other,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    path: Option<PathBuf>,
    slot: Option<u32>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            path: None,
            slot: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_slot(mut self, slot: u32) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(slot) = self.slot {
            write!(f, " (slot: {slot})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Corrupt => 4,
        ErrorKind::Io => 5,
        ErrorKind::Permission => 6,
        ErrorKind::Busy => 7,
        ErrorKind::UnsupportedCard => 10,
        ErrorKind::Checksum => 11,
        ErrorKind::NoCard => 12,
        ErrorKind::NoData => 13,
        ErrorKind::UnresponsiveCard => 14,
        ErrorKind::TooLarge => 15,
        ErrorKind::ProtoMismatch => 16,
        ErrorKind::CommFailed => 17,
        ErrorKind::DeviceNotFound => 20,
        ErrorKind::NoDevices => 21,
        ErrorKind::InternalLimit => 22,
        ErrorKind::Api => 23,
        ErrorKind::NotShared => 24,
        ErrorKind::SharingViolation => 25,
        ErrorKind::Unsupported => 26,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorCategory, ErrorKind, to_exit_code};
    use std::collections::HashSet;
    use std::error::Error as _;

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::NotFound, 3),
            (ErrorKind::Corrupt, 4),
            (ErrorKind::Io, 5),
            (ErrorKind::UnsupportedCard, 10),
            (ErrorKind::Checksum, 11),
            (ErrorKind::CommFailed, 17),
            (ErrorKind::InternalLimit, 22),
            (ErrorKind::Unsupported, 26),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn exit_codes_are_unique() {
        let kinds = [
            ErrorKind::Internal,
            ErrorKind::Usage,
            ErrorKind::NotFound,
            ErrorKind::Corrupt,
            ErrorKind::Io,
            ErrorKind::Permission,
            ErrorKind::Busy,
            ErrorKind::UnsupportedCard,
            ErrorKind::Checksum,
            ErrorKind::NoCard,
            ErrorKind::NoData,
            ErrorKind::UnresponsiveCard,
            ErrorKind::TooLarge,
            ErrorKind::ProtoMismatch,
            ErrorKind::CommFailed,
            ErrorKind::DeviceNotFound,
            ErrorKind::NoDevices,
            ErrorKind::InternalLimit,
            ErrorKind::Api,
            ErrorKind::NotShared,
            ErrorKind::SharingViolation,
            ErrorKind::Unsupported,
        ];
        let codes: HashSet<i32> = kinds.iter().map(|kind| to_exit_code(*kind)).collect();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn categories_follow_recovery_policy() {
        assert_eq!(ErrorKind::Checksum.category(), ErrorCategory::Parse);
        assert_eq!(ErrorKind::CommFailed.category(), ErrorCategory::Comm);
        assert_eq!(ErrorKind::DeviceNotFound.category(), ErrorCategory::Device);
        assert_eq!(
            ErrorKind::InternalLimit.category(),
            ErrorCategory::ResourceExhausted
        );
    }

    #[test]
    fn display_includes_context() {
        let io = std::io::Error::other("boom");
        let err = Error::new(ErrorKind::DeviceNotFound)
            .with_message("slot is empty")
            .with_slot(3)
            .with_source(io);
        let text = err.to_string();
        assert!(text.starts_with("DeviceNotFound: slot is empty"));
        assert!(text.contains("(slot: 3)"));
        assert!(err.source().is_some());
        assert_eq!(err.slot(), Some(3));
    }
}
