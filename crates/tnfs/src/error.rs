//! Local error taxonomy and its mapping onto TNFS result codes.
//!
//! Handlers raise the most specific [`Error`] they can; the dispatcher turns it into a
//! [`ResultCode`] with [`Error::code`]. Clients go the other way with `From<ResultCode>`.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::fcall::ResultCode;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    DirectoryNotEmpty,

    #[error("file exists")]
    AlreadyExists,

    #[error("access denied")]
    AccessDenied,

    #[error("operation not permitted")]
    NotPermitted,

    #[error("bad file handle")]
    BadHandle,

    #[error("end of file")]
    Eof,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not supported")]
    Unsupported,

    #[error("too many open handles")]
    TooManyHandles,

    #[error("entry does not fit in a single message")]
    NoBufferSpace,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cryptographic failure: {0}")]
    Crypto(String),

    #[error("server returned {0:?}")]
    Remote(ResultCode),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// The result code sent to the client for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::NotFound => ResultCode::Noent,
            Error::NotADirectory => ResultCode::Notdir,
            Error::IsADirectory => ResultCode::Isdir,
            Error::DirectoryNotEmpty => ResultCode::Notempty,
            Error::AlreadyExists => ResultCode::Exist,
            Error::AccessDenied => ResultCode::Acces,
            Error::NotPermitted | Error::AuthenticationFailed => ResultCode::Perm,
            Error::BadHandle => ResultCode::Badf,
            Error::Eof => ResultCode::Eof,
            Error::InvalidArgument(_) => ResultCode::Inval,
            Error::Unsupported => ResultCode::Nosys,
            Error::TooManyHandles => ResultCode::Mfile,
            Error::NoBufferSpace => ResultCode::Nobufs,
            Error::Protocol(_) => ResultCode::Proto,
            Error::Crypto(_) => ResultCode::Io,
            Error::Remote(code) => *code,
            Error::Io(e) => io_code(e),
        }
    }
}

fn io_code(e: &io::Error) -> ResultCode {
    if let Some(raw) = e.raw_os_error() {
        return From::from(Errno::from_raw(raw));
    }

    match e.kind() {
        io::ErrorKind::NotFound => ResultCode::Noent,
        io::ErrorKind::PermissionDenied => ResultCode::Acces,
        io::ErrorKind::AlreadyExists => ResultCode::Exist,
        io::ErrorKind::NotADirectory => ResultCode::Notdir,
        io::ErrorKind::IsADirectory => ResultCode::Isdir,
        io::ErrorKind::DirectoryNotEmpty => ResultCode::Notempty,
        io::ErrorKind::InvalidInput => ResultCode::Inval,
        io::ErrorKind::InvalidData => ResultCode::Proto,
        io::ErrorKind::UnexpectedEof => ResultCode::Eof,
        io::ErrorKind::Unsupported => ResultCode::Nosys,
        io::ErrorKind::StorageFull => ResultCode::Nospc,
        io::ErrorKind::ReadOnlyFilesystem => ResultCode::Rofs,
        _ => ResultCode::Io,
    }
}

impl From<Errno> for ResultCode {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EPERM => ResultCode::Perm,
            Errno::ENOENT => ResultCode::Noent,
            Errno::ENXIO => ResultCode::Nxio,
            Errno::E2BIG => ResultCode::TooBig,
            Errno::EBADF => ResultCode::Badf,
            Errno::EAGAIN => ResultCode::Again,
            Errno::ENOMEM => ResultCode::Nomem,
            Errno::EACCES => ResultCode::Acces,
            Errno::EBUSY => ResultCode::Busy,
            Errno::EEXIST => ResultCode::Exist,
            Errno::ENOTDIR => ResultCode::Notdir,
            Errno::EISDIR => ResultCode::Isdir,
            Errno::EINVAL => ResultCode::Inval,
            Errno::ENFILE => ResultCode::Nfile,
            Errno::EMFILE => ResultCode::Mfile,
            Errno::EFBIG => ResultCode::Fbig,
            Errno::ENOSPC => ResultCode::Nospc,
            Errno::ESPIPE => ResultCode::Spipe,
            Errno::EROFS => ResultCode::Rofs,
            Errno::ENAMETOOLONG => ResultCode::Nametoolong,
            Errno::ENOSYS | Errno::EOPNOTSUPP => ResultCode::Nosys,
            Errno::ENOTEMPTY => ResultCode::Notempty,
            Errno::ELOOP => ResultCode::Loop,
            Errno::EPROTO => ResultCode::Proto,
            Errno::EUSERS => ResultCode::Users,
            Errno::ENOBUFS => ResultCode::Nobufs,
            Errno::EALREADY => ResultCode::Already,
            Errno::ESTALE => ResultCode::Stale,
            _ => ResultCode::Io,
        }
    }
}

impl From<ResultCode> for Error {
    fn from(code: ResultCode) -> Self {
        match code {
            ResultCode::Noent => Error::NotFound,
            ResultCode::Notdir => Error::NotADirectory,
            ResultCode::Isdir => Error::IsADirectory,
            ResultCode::Notempty => Error::DirectoryNotEmpty,
            ResultCode::Exist => Error::AlreadyExists,
            ResultCode::Acces => Error::AccessDenied,
            ResultCode::Perm => Error::NotPermitted,
            ResultCode::Badf => Error::BadHandle,
            ResultCode::Eof => Error::Eof,
            ResultCode::Inval => Error::InvalidArgument("rejected by server".to_owned()),
            ResultCode::Nosys => Error::Unsupported,
            ResultCode::Mfile => Error::TooManyHandles,
            ResultCode::Nobufs => Error::NoBufferSpace,
            ResultCode::Proto => Error::Protocol("rejected by server".to_owned()),
            ResultCode::Io => Error::Io(io::Error::other("server I/O error")),
            other => Error::Remote(other),
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Io(errno.into())
    }
}
