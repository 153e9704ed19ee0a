//! In-memory file system backend.
//!
//! Used by tests and handy for serving scratch space. Nodes live in a flat ordered map
//! keyed by absolute path, so a directory's children are a contiguous key range.

use {
    crate::{
        error::Error,
        fcall::*,
        fs::{DirEntryInfo, DirStream, FileCursor, FileSystem},
        io_err,
        utils::{self, Result},
    },
    async_trait::async_trait,
    futures::stream::{self, StreamExt},
    std::{
        collections::BTreeMap,
        io::SeekFrom,
        sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
        time::{SystemTime, UNIX_EPOCH},
    },
};

const DEFAULT_CAPACITY_KB: u32 = 64 * 1024;
const DEFAULT_FILE_MODE: u16 = 0o644;
const DEFAULT_DIR_MODE: u16 = 0o755;

#[derive(Clone, Debug)]
enum Node {
    Dir { stat: Stat },
    File { stat: Stat, data: Vec<u8> },
}

impl Node {
    fn stat(&self) -> Stat {
        match self {
            Node::Dir { stat } => stat.clone(),
            Node::File { stat, data } => Stat {
                size: data.len().try_into().unwrap_or(u32::MAX),
                ..stat.clone()
            },
        }
    }

    fn stat_mut(&mut self) -> &mut Stat {
        match self {
            Node::Dir { stat } | Node::File { stat, .. } => stat,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self, Node::Dir { .. })
    }
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn stamped(mut stat: Stat) -> Stat {
    let t = now();
    stat.atime = t;
    stat.mtime = t;
    stat.ctime = t;
    stat
}

fn child_prefix(dir: &str) -> String {
    match dir {
        "/" => "/".to_owned(),
        d => format!("{}/", d),
    }
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    capacity: u64,
}

impl Tree {
    fn node(&self, path: &str) -> Result<&Node> {
        self.nodes.get(path).ok_or(Error::NotFound)
    }

    fn node_mut(&mut self, path: &str) -> Result<&mut Node> {
        self.nodes.get_mut(path).ok_or(Error::NotFound)
    }

    /// The parent of `path` must be an existing directory.
    fn check_parent(&self, path: &str) -> Result<()> {
        let (parent, name) = utils::split_path(path);
        if name.is_empty() {
            return Err(Error::AccessDenied);
        }
        match self.node(parent)? {
            Node::Dir { .. } => Ok(()),
            Node::File { .. } => Err(Error::NotADirectory),
        }
    }

    /// Keys strictly below `dir`, at any depth
    fn descendants<'a>(&'a self, dir: &str) -> impl Iterator<Item = &'a String> + 'a {
        let prefix = child_prefix(dir);
        self.nodes
            .range(prefix.clone()..)
            .map(|(k, _)| k)
            .take_while(move |k| k.starts_with(&prefix))
            .filter(|k| k.as_str() != "/")
    }

    fn children(&self, dir: &str) -> Vec<DirEntryInfo> {
        let prefix = child_prefix(dir);
        self.descendants(dir)
            .filter(|k| !k[prefix.len()..].contains('/'))
            .filter_map(|k| {
                Some(DirEntryInfo {
                    name: k[prefix.len()..].to_owned(),
                    stat: self.nodes.get(k)?.stat(),
                })
            })
            .collect()
    }

    fn used(&self) -> u64 {
        self.nodes
            .values()
            .map(|n| match n {
                Node::File { data, .. } => data.len() as u64,
                Node::Dir { .. } => 0,
            })
            .sum()
    }

    fn reserve(&self, extra: u64) -> Result<()> {
        if self.used() + extra > self.capacity {
            return Err(io_err!(StorageFull, "memory file system is full").into());
        }
        Ok(())
    }
}

/// A file system held entirely in memory.
#[derive(Clone, Debug)]
pub struct MemFs {
    tree: Arc<RwLock<Tree>>,
}

impl Default for MemFs {
    fn default() -> Self {
        MemFs::with_capacity(DEFAULT_CAPACITY_KB)
    }
}

impl MemFs {
    pub fn new() -> MemFs {
        Default::default()
    }

    pub fn with_capacity(kilobytes: u32) -> MemFs {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_owned(),
            Node::Dir {
                stat: stamped(Stat::directory(DEFAULT_DIR_MODE)),
            },
        );
        MemFs {
            tree: Arc::new(RwLock::new(Tree {
                nodes,
                capacity: kilobytes as u64 * 1024,
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tree> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cursor over a file of a [`MemFs`]; sees later changes made through other cursors.
struct MemFile {
    fs: MemFs,
    path: String,
    flags: OpenFlags,
    pos: u64,
}

#[async_trait]
impl FileCursor for MemFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.flags.readable() {
            return Err(Error::AccessDenied);
        }

        let tree = self.fs.read();
        let Node::File { data, .. } = tree.node(&self.path)? else {
            return Err(Error::IsADirectory);
        };
        let start = (self.pos as usize).min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        self.pos += count as u64;
        Ok(count)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.flags.writable() {
            return Err(Error::AccessDenied);
        }

        let mut tree = self.fs.write();
        let len = match tree.node(&self.path)? {
            Node::File { data, .. } => data.len(),
            Node::Dir { .. } => return Err(Error::IsADirectory),
        };
        if self.flags.contains(OpenFlags::APPEND) {
            self.pos = len as u64;
        }
        let start = self.pos as usize;
        let end = start + buf.len();
        tree.reserve(end.saturating_sub(len) as u64)?;

        if let Node::File { stat, data } = tree.node_mut(&self.path)? {
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(buf);
            stat.mtime = now();
        }
        self.pos = end as u64;
        Ok(buf.len())
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = match self.fs.read().node(&self.path)? {
            Node::File { data, .. } => data.len() as i64,
            Node::Dir { .. } => return Err(Error::IsADirectory),
        };
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => len + d,
        };
        if target < 0 {
            return Err(Error::invalid("seek before start of file"));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[async_trait]
impl FileSystem for MemFs {
    async fn open(&self, path: &str, flags: OpenFlags, mode: u16) -> Result<Box<dyn FileCursor>> {
        {
            let mut tree = self.write();
            match tree.nodes.get_mut(path) {
                Some(Node::Dir { .. }) => return Err(Error::IsADirectory),
                Some(Node::File { .. }) if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) => {
                    return Err(Error::AlreadyExists);
                }
                Some(Node::File { data, stat }) => {
                    if flags.contains(OpenFlags::TRUNCATE) && flags.writable() {
                        data.clear();
                        stat.mtime = now();
                    }
                }
                None if flags.contains(OpenFlags::CREATE) => {
                    tree.check_parent(path)?;
                    let perms = match mode & mode::PERMS {
                        0 => DEFAULT_FILE_MODE,
                        m => m,
                    };
                    tree.nodes.insert(
                        path.to_owned(),
                        Node::File {
                            stat: stamped(Stat::file(perms, 0)),
                            data: Vec::new(),
                        },
                    );
                }
                None => return Err(Error::NotFound),
            }
        }

        Ok(Box::new(MemFile {
            fs: self.clone(),
            path: path.to_owned(),
            flags,
            pos: 0,
        }))
    }

    async fn list(&self, path: &str) -> Result<DirStream> {
        let tree = self.read();
        if !tree.node(path)?.is_dir() {
            return Err(Error::NotADirectory);
        }
        Ok(stream::iter(tree.children(path).into_iter().map(Ok)).boxed())
    }

    async fn stat(&self, path: &str) -> Result<Stat> {
        Ok(self.read().node(path)?.stat())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let mut tree = self.write();
        if tree.nodes.contains_key(path) {
            return Err(Error::AlreadyExists);
        }
        tree.check_parent(path)?;
        tree.nodes.insert(
            path.to_owned(),
            Node::Dir {
                stat: stamped(Stat::directory(DEFAULT_DIR_MODE)),
            },
        );
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let mut tree = self.write();
        if path == "/" {
            return Err(Error::AccessDenied);
        }
        if !tree.node(path)?.is_dir() {
            return Err(Error::NotADirectory);
        }
        if tree.descendants(path).next().is_some() {
            return Err(Error::DirectoryNotEmpty);
        }
        tree.nodes.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut tree = self.write();
        if from == "/" || to == "/" {
            return Err(Error::AccessDenied);
        }
        let source_is_dir = tree.node(from)?.is_dir();
        if from == to {
            return Ok(());
        }
        if to.starts_with(&child_prefix(from)) {
            return Err(Error::invalid("cannot move a directory below itself"));
        }
        tree.check_parent(to)?;

        if let Ok(target) = tree.node(to) {
            match (source_is_dir, target.is_dir()) {
                (true, false) => return Err(Error::NotADirectory),
                (false, true) => return Err(Error::IsADirectory),
                (true, true) if tree.descendants(to).next().is_some() => {
                    return Err(Error::DirectoryNotEmpty);
                }
                _ => {}
            }
        }

        let moved: Vec<String> = tree.descendants(from).cloned().collect();
        if let Some(node) = tree.nodes.remove(from) {
            tree.nodes.insert(to.to_owned(), node);
        }
        for old in moved {
            if let Some(node) = tree.nodes.remove(&old) {
                tree.nodes.insert(format!("{}{}", to, &old[from.len()..]), node);
            }
        }
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let mut tree = self.write();
        if tree.node(path)?.is_dir() {
            return Err(Error::IsADirectory);
        }
        tree.nodes.remove(path);
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u16) -> Result<()> {
        let mut tree = self.write();
        let stat = tree.node_mut(path)?.stat_mut();
        stat.mode = (stat.mode & mode::S_IFMT) | (mode & mode::PERMS);
        stat.ctime = now();
        Ok(())
    }

    async fn free(&self, path: &str) -> Result<u32> {
        let tree = self.read();
        tree.node(path)?;
        Ok((tree.capacity.saturating_sub(tree.used()) / 1024) as u32)
    }

    async fn size(&self) -> Result<u32> {
        Ok((self.read().capacity / 1024) as u32)
    }
}
