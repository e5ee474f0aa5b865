use std::{fmt, io};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Portable error taxonomy.
///
/// Every asynchronous failure is mapped onto one of these codes before it
/// reaches a user callback; the raw OS error is preserved alongside in
/// [`Error`] for diagnostics. The set mirrors the classic event-loop error
/// space rather than `std::io::ErrorKind`, because callers dispatch on
/// conditions like [`ErrorCode::Eof`] and [`ErrorCode::AddrInUse`] that
/// `ErrorKind` folds together or lacks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    Eof,
    Access,
    Again,
    AddrInUse,
    AddrNotAvail,
    AfNoSupport,
    Already,
    BadFd,
    Busy,
    ConnAborted,
    ConnRefused,
    ConnReset,
    DestAddrRequired,
    Fault,
    HostUnreach,
    Interrupted,
    Invalid,
    IsConn,
    MFile,
    NetDown,
    NetUnreach,
    NFile,
    NoBufs,
    NoMem,
    NoNet,
    NoProtoOpt,
    NotConn,
    NotSock,
    NotSup,
    Pipe,
    Proto,
    ProtoNoSupport,
    ProtoType,
    TimedOut,
    Unknown,
}

impl ErrorCode {
    /// The conventional short name of the code, e.g. `"EADDRINUSE"`.
    pub fn as_str(self) -> &'static str {
        use ErrorCode::*;
        match self {
            Eof => "EOF",
            Access => "EACCES",
            Again => "EAGAIN",
            AddrInUse => "EADDRINUSE",
            AddrNotAvail => "EADDRNOTAVAIL",
            AfNoSupport => "EAFNOSUPPORT",
            Already => "EALREADY",
            BadFd => "EBADF",
            Busy => "EBUSY",
            ConnAborted => "ECONNABORTED",
            ConnRefused => "ECONNREFUSED",
            ConnReset => "ECONNRESET",
            DestAddrRequired => "EDESTADDRREQ",
            Fault => "EFAULT",
            HostUnreach => "EHOSTUNREACH",
            Interrupted => "EINTR",
            Invalid => "EINVAL",
            IsConn => "EISCONN",
            MFile => "EMFILE",
            NetDown => "ENETDOWN",
            NetUnreach => "ENETUNREACH",
            NFile => "ENFILE",
            NoBufs => "ENOBUFS",
            NoMem => "ENOMEM",
            NoNet => "ENONET",
            NoProtoOpt => "ENOPROTOOPT",
            NotConn => "ENOTCONN",
            NotSock => "ENOTSOCK",
            NotSup => "ENOTSUP",
            Pipe => "EPIPE",
            Proto => "EPROTO",
            ProtoNoSupport => "EPROTONOSUPPORT",
            ProtoType => "EPROTOTYPE",
            TimedOut => "ETIMEDOUT",
            Unknown => "UNKNOWN",
        }
    }

    fn description(self) -> &'static str {
        use ErrorCode::*;
        match self {
            Eof => "end of stream",
            Access => "permission denied",
            Again => "resource temporarily unavailable",
            AddrInUse => "address already in use",
            AddrNotAvail => "address not available",
            AfNoSupport => "address family not supported",
            Already => "operation already in progress",
            BadFd => "bad file descriptor",
            Busy => "resource busy",
            ConnAborted => "connection aborted",
            ConnRefused => "connection refused",
            ConnReset => "connection reset by peer",
            DestAddrRequired => "destination address required",
            Fault => "bad address in system call argument",
            HostUnreach => "host unreachable",
            Interrupted => "interrupted system call",
            Invalid => "invalid argument",
            IsConn => "socket is already connected",
            MFile => "too many open files",
            NetDown => "network is down",
            NetUnreach => "network unreachable",
            NFile => "file table overflow",
            NoBufs => "no buffer space available",
            NoMem => "not enough memory",
            NoNet => "machine is not on the network",
            NoProtoOpt => "protocol not available",
            NotConn => "socket is not connected",
            NotSock => "not a socket",
            NotSup => "operation not supported",
            Pipe => "broken pipe",
            Proto => "protocol error",
            ProtoNoSupport => "protocol not supported",
            ProtoType => "wrong protocol type for socket",
            TimedOut => "operation timed out",
            Unknown => "unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// An event-loop error: a portable [`ErrorCode`] plus the raw OS error
/// that produced it, when one did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Error {
    code: ErrorCode,
    raw_os: Option<i32>,
}

impl Error {
    pub(crate) const fn new(code: ErrorCode) -> Error {
        Error { code, raw_os: None }
    }

    /// Builds an error from a raw OS error code.
    pub fn from_raw_os_error(raw: i32) -> Error {
        Error {
            code: code_from_raw(raw),
            raw_os: Some(raw),
        }
    }

    /// The portable error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The raw OS error, preserved for diagnostics.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.raw_os
    }

    pub fn is_eof(&self) -> bool {
        self.code == ErrorCode::Eof
    }

    pub fn is_would_block(&self) -> bool {
        self.code == ErrorCode::Again
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw_os {
            Some(raw) => write!(
                fmt,
                "{}: {} (os error {})",
                self.code.as_str(),
                self.code.description(),
                raw
            ),
            None => write!(fmt, "{}: {}", self.code.as_str(), self.code.description()),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(raw) => Error::from_raw_os_error(raw),
            None => Error {
                code: match err.kind() {
                    io::ErrorKind::WouldBlock => ErrorCode::Again,
                    io::ErrorKind::Interrupted => ErrorCode::Interrupted,
                    io::ErrorKind::UnexpectedEof => ErrorCode::Eof,
                    io::ErrorKind::InvalidInput => ErrorCode::Invalid,
                    _ => ErrorCode::Unknown,
                },
                raw_os: None,
            },
        }
    }
}

#[cfg(unix)]
fn code_from_raw(raw: i32) -> ErrorCode {
    use ErrorCode::*;
    match raw {
        libc::EACCES => Access,
        libc::EAGAIN => Again,
        libc::EADDRINUSE => AddrInUse,
        libc::EADDRNOTAVAIL => AddrNotAvail,
        libc::EAFNOSUPPORT => AfNoSupport,
        libc::EALREADY => Already,
        libc::EBADF => BadFd,
        libc::EBUSY => Busy,
        libc::ECONNABORTED => ConnAborted,
        libc::ECONNREFUSED => ConnRefused,
        libc::ECONNRESET => ConnReset,
        libc::EDESTADDRREQ => DestAddrRequired,
        libc::EFAULT => Fault,
        libc::EHOSTUNREACH => HostUnreach,
        libc::EINTR => Interrupted,
        libc::EINVAL => Invalid,
        libc::EISCONN => IsConn,
        libc::EMFILE => MFile,
        libc::ENETDOWN => NetDown,
        libc::ENETUNREACH => NetUnreach,
        libc::ENFILE => NFile,
        libc::ENOBUFS => NoBufs,
        libc::ENOMEM => NoMem,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        libc::ENONET => NoNet,
        libc::ENOPROTOOPT => NoProtoOpt,
        libc::ENOTCONN => NotConn,
        libc::ENOTSOCK => NotSock,
        libc::ENOTSUP => NotSup,
        libc::EPIPE => Pipe,
        libc::EPROTO => Proto,
        libc::EPROTONOSUPPORT => ProtoNoSupport,
        libc::EPROTOTYPE => ProtoType,
        libc::ETIMEDOUT => TimedOut,
        _ => Unknown,
    }
}

#[cfg(not(unix))]
fn code_from_raw(_raw: i32) -> ErrorCode {
    ErrorCode::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_os_round_trip() {
        let err = Error::from_raw_os_error(libc::EADDRINUSE);
        assert_eq!(err.code(), ErrorCode::AddrInUse);
        assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
        assert_eq!(err.code().as_str(), "EADDRINUSE");
    }

    #[test]
    fn from_io_error() {
        let err: Error = io::Error::from_raw_os_error(libc::EAGAIN).into();
        assert!(err.is_would_block());

        let err: Error = io::Error::new(io::ErrorKind::WouldBlock, "synthetic").into();
        assert_eq!(err.code(), ErrorCode::Again);
        assert_eq!(err.raw_os_error(), None);
    }
}
