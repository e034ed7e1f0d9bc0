use std::io;

use thiserror::Error;

/// Exit status codes sent back to the `scp` client; numbering follows the SFTP
/// status codes OpenSSH uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ScpStatus {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl ScpStatus {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ScpStatus::NoSuchFile,
            io::ErrorKind::PermissionDenied => ScpStatus::PermissionDenied,
            io::ErrorKind::UnexpectedEof => ScpStatus::Eof,
            io::ErrorKind::NotConnected => ScpStatus::NoConnection,
            io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => ScpStatus::ConnectionLost,
            _ => ScpStatus::Failure,
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ScpError {
    pub status: ScpStatus,
    pub message: String,
}

impl ScpError {
    pub fn new(status: ScpStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn no_such_file(path: &std::path::Path) -> Self {
        Self::new(
            ScpStatus::NoSuchFile,
            format!("{}: No such file or directory", path.display()),
        )
    }

    pub fn unsupported(what: &str) -> Self {
        Self::new(ScpStatus::OpUnsupported, format!("{what}: operation unsupported"))
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(ScpStatus::Failure, message)
    }

    pub fn bad_message(message: impl Into<String>) -> Self {
        Self::new(ScpStatus::BadMessage, message)
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(ScpStatus::ConnectionLost, message)
    }

    /// Attach the path being worked on to an I/O error.
    pub fn io_at(path: &std::path::Path, err: io::Error) -> Self {
        Self::new(ScpStatus::from_io(&err), format!("{}: {}", path.display(), err))
    }
}

impl From<io::Error> for ScpError {
    fn from(err: io::Error) -> Self {
        Self::new(ScpStatus::from_io(&err), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds_map_to_scp_codes() {
        let nf = io::Error::new(io::ErrorKind::NotFound, "gone");
        let pd = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let other = io::Error::new(io::ErrorKind::Other, "??");
        assert_eq!(ScpError::from(nf).status.code(), 2);
        assert_eq!(ScpError::from(pd).status.code(), 3);
        assert_eq!(ScpError::from(other).status.code(), 4);
        assert_eq!(ScpStatus::OpUnsupported.code(), 8);

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "short");
        let gone = io::Error::new(io::ErrorKind::NotConnected, "down");
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "rst");
        assert_eq!(ScpStatus::from_io(&eof).code(), 1);
        assert_eq!(ScpStatus::from_io(&gone).code(), 6);
        assert_eq!(ScpStatus::from_io(&reset).code(), 7);
    }
}
