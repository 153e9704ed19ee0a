//! Interfaces the protocol engine requires from its collaborators.
//!
//! A [`FileSystem`] is a mounted backend addressed with normalized absolute paths. An
//! [`Authenticator`] decides who may mount it. Neither knows anything about the wire.

use {
    crate::{
        error::Error,
        fcall::*,
        scram::{Mechanism, ScramPrincipal},
        utils::Result,
    },
    async_trait::async_trait,
    futures::stream::BoxStream,
    std::{collections::HashMap, io::SeekFrom, sync::Arc},
};

/// A single directory entry produced by [`FileSystem::list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub stat: Stat,
}

/// Lazy, forward-only listing of a directory.
///
/// The only way to restart a listing is to ask the backend for a new one.
pub type DirStream = BoxStream<'static, Result<DirEntryInfo>>;

/// Byte-stream access to an open file.
#[async_trait]
pub trait FileCursor: Send + Sync {
    /// Read up to `buf.len()` bytes; `Ok(0)` at end of file.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Move the cursor and return the new absolute position.
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64>;
}

/// File system backend served through a [`Mount`].
///
/// Every path is absolute, normalized and already confined to the backend, so
/// implementors never see `.` or `..` components.
///
/// # Error Handling
/// Return the most specific [`Error`] variant: `NotFound`, `NotADirectory`,
/// `IsADirectory`, `DirectoryNotEmpty`, `AlreadyExists`, `AccessDenied`. Anything else
/// travels as a generic I/O failure.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn open(&self, path: &str, flags: OpenFlags, mode: u16) -> Result<Box<dyn FileCursor>>;

    async fn list(&self, path: &str) -> Result<DirStream>;

    async fn stat(&self, path: &str) -> Result<Stat>;

    async fn mkdir(&self, path: &str) -> Result<()>;

    async fn rmdir(&self, path: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn unlink(&self, path: &str) -> Result<()>;

    async fn chmod(&self, path: &str, mode: u16) -> Result<()>;

    /// Free space below `path`, in kilobytes.
    async fn free(&self, path: &str) -> Result<u32>;

    /// Total capacity of the backend, in kilobytes.
    async fn size(&self) -> Result<u32>;
}

/// An authenticated identity bound to a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    pub fn anonymous() -> Principal {
        Principal {
            name: "anonymous".to_owned(),
        }
    }
}

/// Decides who may use a mount.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Plain `Mount` credentials. `Ok(None)` rejects the mount.
    async fn authenticate(
        &self,
        fs: &dyn FileSystem,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<Option<Principal>>;

    /// SCRAM credentials for `user`, never the password itself.
    ///
    /// Authenticators without SCRAM support keep the default; every SCRAM attempt
    /// against them then proceeds with a fake record and fails at the proof.
    async fn scram_principal(&self, _user: &str) -> Result<Option<ScramPrincipal>> {
        Ok(None)
    }
}

/// A backend exposed under a path, with an optional gatekeeper.
///
/// Without an authenticator every mount request is accepted anonymously.
pub struct Mount {
    pub path: String,
    pub fs: Arc<dyn FileSystem>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("path", &self.path)
            .field("authenticated", &self.authenticator.is_some())
            .finish()
    }
}

/// User table holding SCRAM credentials only.
///
/// Plain mount passwords are checked by deriving the stored key again and comparing.
#[derive(Clone, Debug, Default)]
pub struct PasswordAuthenticator {
    users: HashMap<String, ScramPrincipal>,
}

impl PasswordAuthenticator {
    pub fn new() -> PasswordAuthenticator {
        Default::default()
    }

    pub fn with_user(
        mut self,
        name: &str,
        password: &str,
        mechanism: Mechanism,
        iterations: u32,
    ) -> Result<PasswordAuthenticator> {
        self.add_user(name, password, mechanism, iterations)?;
        Ok(self)
    }

    pub fn add_user(
        &mut self,
        name: &str,
        password: &str,
        mechanism: Mechanism,
        iterations: u32,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid("empty user name"));
        }
        let principal = ScramPrincipal::from_password(name, password, mechanism, iterations)?;
        self.users.insert(name.to_owned(), principal);
        Ok(())
    }
}

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    async fn authenticate(
        &self,
        _fs: &dyn FileSystem,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<Option<Principal>> {
        let (Some(user), Some(password)) = (user, password) else {
            return Ok(None);
        };

        Ok(match self.users.get(user) {
            Some(principal) if principal.verify_password(password)? => Some(Principal {
                name: user.to_owned(),
            }),
            _ => None,
        })
    }

    async fn scram_principal(&self, user: &str) -> Result<Option<ScramPrincipal>> {
        Ok(self.users.get(user).cloned())
    }
}
