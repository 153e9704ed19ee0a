//! Per-connection state: mount binding, authentication, message size, byte transforms
//! and handle tables.

use {
    crate::{
        error::Error,
        fcall::*,
        fs::{Mount, Principal},
        handle::{DirHandle, FileHandle, HandleTable},
        scram::ScramServerState,
        utils::{self, Result},
    },
    bytes::BytesMut,
    log::info,
    rand::Rng,
    std::{
        collections::HashMap,
        sync::{
            Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock,
            atomic::{AtomicU16, Ordering},
        },
    },
    tokio::sync::Mutex,
};

/// A whole-frame byte transform.
///
/// Implementors must leave the connection id (the first two bytes) untouched.
pub trait ByteTransform: Send + Sync {
    fn apply(&self, frame: &mut BytesMut) -> Result<()>;
}

/// Ordered inbound (decrypt, then decode) and outbound (encode, then encrypt) transforms.
///
/// Outbound transforms run in installation order, inbound ones in reverse, so stacked
/// layers unwrap cleanly. Empty until a secure mount installs a cipher. Cloning is cheap
/// and yields a snapshot.
#[derive(Clone, Default)]
pub struct Pipeline {
    inbound: Vec<Arc<dyn ByteTransform>>,
    outbound: Vec<Arc<dyn ByteTransform>>,
    overhead: usize,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Default::default()
    }

    /// Add a transform pair; `overhead` is the most bytes the outbound side may add.
    pub fn install(
        &mut self,
        inbound: Arc<dyn ByteTransform>,
        outbound: Arc<dyn ByteTransform>,
        overhead: usize,
    ) {
        self.inbound.push(inbound);
        self.outbound.push(outbound);
        self.overhead += overhead;
    }

    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty() && self.outbound.is_empty()
    }

    pub fn overhead(&self) -> usize {
        self.overhead
    }

    pub fn decode(&self, frame: &mut BytesMut) -> Result<()> {
        self.inbound.iter().rev().try_for_each(|t| t.apply(frame))
    }

    pub fn encode(&self, frame: &mut BytesMut) -> Result<()> {
        self.outbound.iter().try_for_each(|t| t.apply(frame))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .field("overhead", &self.overhead)
            .finish()
    }
}

/// Where a session is attached: a shared mount and a normalized root inside it.
#[derive(Clone, Debug)]
pub struct MountPoint {
    pub mount: Arc<Mount>,
    pub root: String,
}

/// Authentication progress of a session
#[derive(Debug, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    /// Between `ClientFirst` and `ClientFinal`
    FirstSent(Box<ScramServerState>),
    Authenticated(Principal),
    Failed,
}

pub struct Session {
    id: u16,
    mount: RwLock<Option<MountPoint>>,
    auth: StdMutex<AuthState>,
    message_size: AtomicU16,
    pipeline: RwLock<Pipeline>,
    pub files: HandleTable<FileHandle>,
    pub dirs: HandleTable<DirHandle>,
    /// Held while a frame of this session is being handled
    pub(crate) serial: Mutex<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mount", &self.mount_point().map(|m| m.root))
            .field("message_size", &self.message_size())
            .finish()
    }
}

impl Session {
    fn new(id: u16, mount: Option<MountPoint>, pipeline: Pipeline, message_size: u16) -> Session {
        Session {
            id,
            mount: RwLock::new(mount),
            auth: Default::default(),
            message_size: AtomicU16::new(message_size),
            pipeline: RwLock::new(pipeline),
            files: HandleTable::new(),
            dirs: HandleTable::new(),
            serial: Mutex::new(()),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn mount_point(&self) -> Option<MountPoint> {
        self.mount
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Attach a session created without a mount (by a secure mount) to one.
    pub fn bind(&self, mount_point: MountPoint) {
        *self.mount.write().unwrap_or_else(PoisonError::into_inner) = Some(mount_point);
    }

    pub fn auth(&self) -> MutexGuard<'_, AuthState> {
        self.auth.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(*self.auth(), AuthState::Authenticated(_))
    }

    pub fn principal(&self) -> Option<Principal> {
        match *self.auth() {
            AuthState::Authenticated(ref p) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn message_size(&self) -> u16 {
        self.message_size.load(Ordering::SeqCst)
    }

    pub fn set_message_size(&self, size: u16) {
        self.message_size.store(size, Ordering::SeqCst)
    }

    /// Snapshot of the current transforms
    pub fn pipeline(&self) -> Pipeline {
        self.pipeline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn install(
        &self,
        inbound: Arc<dyn ByteTransform>,
        outbound: Arc<dyn ByteTransform>,
        overhead: usize,
    ) {
        self.pipeline
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .install(inbound, outbound, overhead)
    }

    /// Bytes left for a response payload after the header, the result code, `header`
    /// bytes of fixed response fields and cipher padding.
    pub fn payload_budget(&self, header: usize) -> usize {
        (self.message_size() as usize)
            .saturating_sub(HEADER_SIZE + RESULT_SIZE + header + self.pipeline().overhead())
    }

    /// Map a client path onto the backend, below the session root.
    pub fn resolve(&self, path: &str) -> Result<String> {
        let root = self.mount_point().ok_or(Error::NotPermitted)?.root;
        let path = utils::normalize_path(path).ok_or(Error::AccessDenied)?;
        Ok(utils::join_path(&root, &path))
    }

    /// Drop every open handle; returns how many there were.
    pub fn release_handles(&self) -> usize {
        self.files.clear() + self.dirs.clear()
    }
}

/// All live sessions of a server, keyed by connection id.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<u16, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        Default::default()
    }

    /// Register a new session under a random, unused, non-zero id.
    pub fn create(
        &self,
        mount: Option<MountPoint>,
        pipeline: Pipeline,
        message_size: u16,
    ) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.len() >= u16::MAX as usize {
            return Err(Error::Remote(ResultCode::Users));
        }

        let mut rng = rand::thread_rng();
        let id = loop {
            let id: u16 = rng.gen_range(1..=u16::MAX);
            if !sessions.contains_key(&id) {
                break id;
            }
        };

        let session = Arc::new(Session::new(id, mount, pipeline, message_size));
        sessions.insert(id, session.clone());
        info!("session {:#06x} opened ({} live)", id, sessions.len());
        Ok(session)
    }

    pub fn get(&self, id: u16) -> Option<Arc<Session>> {
        if id == NO_SESSION {
            return None;
        }
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Forget a session and release its handles.
    pub fn remove(&self, id: u16) -> Option<Arc<Session>> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)?;
        let released = session.release_handles();
        info!("session {:#06x} closed, {} handles released", id, released);
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::MemFs;
    use futures::StreamExt;

    struct Xor(u8);

    impl ByteTransform for Xor {
        fn apply(&self, frame: &mut BytesMut) -> Result<()> {
            frame.iter_mut().skip(2).for_each(|b| *b ^= self.0);
            Ok(())
        }
    }

    fn mount_point(root: &str) -> MountPoint {
        MountPoint {
            mount: Arc::new(Mount {
                path: "/".into(),
                fs: Arc::new(MemFs::new()),
                authenticator: None,
            }),
            root: root.into(),
        }
    }

    #[test]
    fn ids_are_unique_and_non_zero() {
        let table = SessionTable::new();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..500 {
            let session = table.create(None, Pipeline::new(), DEFAULT_MESSAGE_SIZE).unwrap();
            assert_ne!(session.id(), NO_SESSION);
            assert!(ids.insert(session.id()));
        }
        assert_eq!(table.len(), 500);
        assert!(table.get(NO_SESSION).is_none());
    }

    #[test]
    fn remove_releases_handles() {
        let table = SessionTable::new();
        let session = table.create(None, Pipeline::new(), DEFAULT_MESSAGE_SIZE).unwrap();
        let dir = DirHandle::new(
            "/".into(),
            Default::default(),
            futures::stream::empty::<Result<crate::fs::DirEntryInfo>>().boxed(),
        );
        session.dirs.insert(dir).unwrap();

        let removed = table.remove(session.id()).unwrap();
        assert!(removed.dirs.is_empty());
        assert!(table.get(session.id()).is_none());
        assert!(table.remove(session.id()).is_none());
    }

    #[test]
    fn paths_stay_below_root() {
        let session = Session::new(1, Some(mount_point("/games")), Pipeline::new(), 532);
        assert_eq!(session.resolve("/a/../b").unwrap(), "/games/b");
        assert_eq!(session.resolve("").unwrap(), "/games");
        assert!(matches!(session.resolve("/../etc"), Err(Error::AccessDenied)));

        let unbound = Session::new(2, None, Pipeline::new(), 532);
        assert!(matches!(unbound.resolve("/"), Err(Error::NotPermitted)));
    }

    #[test]
    fn pipeline_runs_in_order_and_snapshots() {
        let session = Session::new(3, None, Pipeline::new(), 532);
        let before = session.pipeline();
        session.install(Arc::new(Xor(0x0f)), Arc::new(Xor(0x0f)), 7);

        let mut frame = BytesMut::from(&[1u8, 2, 3, 4][..]);
        session.pipeline().encode(&mut frame).unwrap();
        assert_eq!(&frame[..], &[1, 2, 3 ^ 0x0f, 4 ^ 0x0f]);
        session.pipeline().decode(&mut frame).unwrap();
        assert_eq!(&frame[..], &[1, 2, 3, 4]);

        assert!(before.is_empty());
        assert_eq!(session.payload_budget(0), 532 - 5 - 7);
    }

    /// Appends its tag on the way out and strips it on the way in.
    struct Tag(u8, bool);

    impl ByteTransform for Tag {
        fn apply(&self, frame: &mut BytesMut) -> Result<()> {
            if self.1 {
                frame.extend_from_slice(&[self.0]);
                return Ok(());
            }
            match frame.last() {
                Some(&t) if t == self.0 => {
                    frame.truncate(frame.len() - 1);
                    Ok(())
                }
                _ => Err(Error::protocol("layer out of order")),
            }
        }
    }

    #[test]
    fn stacked_layers_unwrap_in_reverse() {
        let mut pipeline = Pipeline::new();
        pipeline.install(Arc::new(Tag(1, false)), Arc::new(Tag(1, true)), 1);
        pipeline.install(Arc::new(Tag(2, false)), Arc::new(Tag(2, true)), 1);

        let mut frame = BytesMut::from(&[0u8, 0, 9][..]);
        pipeline.encode(&mut frame).unwrap();
        assert_eq!(&frame[..], &[0, 0, 9, 1, 2]);
        pipeline.decode(&mut frame).unwrap();
        assert_eq!(&frame[..], &[0, 0, 9]);
        assert_eq!(pipeline.overhead(), 2);
    }

    #[test]
    fn authentication_state() {
        let session = Session::new(4, None, Pipeline::new(), 532);
        assert!(!session.is_authenticated());
        *session.auth() = AuthState::Authenticated(Principal::anonymous());
        assert!(session.is_authenticated());
        assert_eq!(session.principal(), Some(Principal::anonymous()));
    }
}
