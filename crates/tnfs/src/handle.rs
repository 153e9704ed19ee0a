//! Per-session tables of open file and directory cursors.

use {
    crate::{
        error::Error,
        fcall::*,
        fs::{DirEntryInfo, DirStream, FileCursor, FileSystem},
        utils::{self, Result},
    },
    futures::{
        future,
        stream::{self, StreamExt, TryStreamExt},
    },
    std::{
        cmp::Ordering,
        collections::HashMap,
        io::SeekFrom,
        sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
    },
    tokio::sync::Mutex,
};

/// Handles are one byte on the wire
pub type Handle = u8;

const CAPACITY: usize = Handle::MAX as usize + 1;

struct Slots<T> {
    next: Handle,
    map: HashMap<Handle, Arc<Mutex<T>>>,
}

/// Map from handles to cursors.
///
/// Allocation of a handle and its registration happen under one lock, so concurrent
/// requests on the same session never receive the same handle. Handles are issued from a
/// wrapping counter and skip values still in use.
pub struct HandleTable<T> {
    slots: StdMutex<Slots<T>>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        HandleTable {
            slots: StdMutex::new(Slots {
                next: 0,
                map: HashMap::new(),
            }),
        }
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> HandleTable<T> {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, value: T) -> Result<Handle> {
        let mut slots = self.lock();
        if slots.map.len() >= CAPACITY {
            return Err(Error::TooManyHandles);
        }

        loop {
            let handle = slots.next;
            slots.next = slots.next.wrapping_add(1);
            if !slots.map.contains_key(&handle) {
                slots.map.insert(handle, Arc::new(Mutex::new(value)));
                return Ok(handle);
            }
        }
    }

    pub fn get(&self, handle: Handle) -> Result<Arc<Mutex<T>>> {
        self.lock().map.get(&handle).cloned().ok_or(Error::BadHandle)
    }

    pub fn remove(&self, handle: Handle) -> Result<Arc<Mutex<T>>> {
        self.lock().map.remove(&handle).ok_or(Error::BadHandle)
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every handle; returns how many were open.
    pub fn clear(&self) -> usize {
        let mut slots = self.lock();
        let count = slots.map.len();
        slots.map.clear();
        count
    }
}

/// An open file with its reusable transfer buffer.
pub struct FileHandle {
    pub path: String,
    cursor: Box<dyn FileCursor>,
    buffer: Vec<u8>,
}

impl FileHandle {
    pub fn new(path: String, cursor: Box<dyn FileCursor>, buffer_size: usize) -> FileHandle {
        FileHandle {
            path,
            cursor,
            buffer: vec![0; buffer_size],
        }
    }

    /// Read at most `size` bytes; `Eof` once the file has nothing left.
    pub async fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        if self.buffer.len() < size {
            self.buffer.resize(size, 0);
        }

        let count = self.cursor.read(&mut self.buffer[..size]).await?;
        if count == 0 {
            return Err(Error::Eof);
        }
        Ok(self.buffer[..count].to_vec())
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < data.len() {
            match self.cursor.write(&data[written..]).await? {
                0 => break,
                n => written += n,
            }
        }
        Ok(written)
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.cursor.seek(pos).await
    }
}

/// Filtering and ordering of a directory listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListingOptions {
    pub options: DirOptions,
    pub sort: SortOptions,
    /// Zero means unlimited
    pub max_results: u16,
    /// Empty means everything
    pub pattern: String,
}

fn is_special(name: &str) -> bool {
    name == "." || name == ".."
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && !is_special(name)
}

impl ListingOptions {
    /// What `OpenDir` uses: every entry, in backend order.
    pub fn plain() -> ListingOptions {
        ListingOptions {
            options: DirOptions::NO_SKIP_HIDDEN | DirOptions::NO_SKIP_SPECIAL,
            sort: SortOptions::NONE,
            ..Default::default()
        }
    }

    fn accepts(&self, entry: &DirEntryInfo) -> bool {
        if is_special(&entry.name) && !self.options.contains(DirOptions::NO_SKIP_SPECIAL) {
            return false;
        }
        if is_hidden(&entry.name) && !self.options.contains(DirOptions::NO_SKIP_HIDDEN) {
            return false;
        }
        if self.pattern.is_empty()
            || (entry.stat.is_dir() && !self.options.contains(DirOptions::DIR_PATTERN))
        {
            return true;
        }
        utils::wildcard_match(&self.pattern, &entry.name)
    }

    fn compare(&self, a: &DirEntryInfo, b: &DirEntryInfo) -> Ordering {
        let group = if self.options.contains(DirOptions::NO_FOLDERS_FIRST) {
            Ordering::Equal
        } else {
            b.stat.is_dir().cmp(&a.stat.is_dir())
        };

        let order = if self.sort.contains(SortOptions::MODIFIED) {
            a.stat.mtime.cmp(&b.stat.mtime)
        } else if self.sort.contains(SortOptions::SIZE) {
            a.stat.size.cmp(&b.stat.size)
        } else if self.sort.contains(SortOptions::CASE) {
            a.name.cmp(&b.name)
        } else {
            a.name.to_lowercase().cmp(&b.name.to_lowercase())
        }
        .then_with(|| a.name.cmp(&b.name));

        group.then(if self.sort.contains(SortOptions::DESCENDING) {
            order.reverse()
        } else {
            order
        })
    }

    fn is_sorted(&self) -> bool {
        !self.sort.contains(SortOptions::NONE)
    }
}

/// Ask the backend for a listing and apply `opts` to it.
///
/// Unsorted listings stay lazy; sorting has to see every entry first.
pub async fn open_listing(fs: &dyn FileSystem, path: &str, opts: &ListingOptions) -> Result<DirStream> {
    let filter = opts.clone();
    let entries = fs
        .list(path)
        .await?
        .try_filter(move |entry| future::ready(filter.accepts(entry)));
    let limit = match opts.max_results {
        0 => usize::MAX,
        n => n as usize,
    };

    if !opts.is_sorted() {
        return Ok(entries.take(limit).boxed());
    }

    let mut all: Vec<DirEntryInfo> = entries.try_collect().await?;
    all.sort_by(|a, b| opts.compare(a, b));
    all.truncate(limit);
    Ok(stream::iter(all.into_iter().map(Ok)).boxed())
}

/// Wire form of a listing entry
pub fn wire_entry(info: &DirEntryInfo) -> DirEntry {
    let mut flags = EntryFlags::empty();
    flags.set(EntryFlags::DIR, info.stat.is_dir());
    flags.set(EntryFlags::HIDDEN, is_hidden(&info.name));
    flags.set(EntryFlags::SPECIAL, is_special(&info.name));

    DirEntry {
        flags,
        size: info.stat.size,
        mtime: info.stat.mtime,
        ctime: info.stat.ctime,
        name: info.name.clone(),
    }
}

/// An open directory listing.
///
/// An entry pulled to test whether it fits a response is kept in `pending` and emitted
/// first on the next call.
pub struct DirHandle {
    pub path: String,
    pub listing: ListingOptions,
    stream: DirStream,
    pending: Option<DirEntryInfo>,
    position: u32,
    exhausted: bool,
}

impl DirHandle {
    pub fn new(path: String, listing: ListingOptions, stream: DirStream) -> DirHandle {
        DirHandle {
            path,
            listing,
            stream,
            pending: None,
            position: 0,
            exhausted: false,
        }
    }

    /// Number of entries handed out so far
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Position as carried by `RReadDirX`, pinned at `u16::MAX` for long listings
    pub fn wire_position(&self) -> u16 {
        u16::try_from(self.position).unwrap_or(u16::MAX)
    }

    async fn pull(&mut self) -> Result<Option<DirEntryInfo>> {
        if let Some(entry) = self.pending.take() {
            return Ok(Some(entry));
        }
        if self.exhausted {
            return Ok(None);
        }

        match self.stream.next().await {
            Some(entry) => entry.map(Some),
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    fn push_back(&mut self, entry: DirEntryInfo) {
        self.pending = Some(entry);
    }

    /// True once the underlying listing has ended and nothing is held back.
    pub async fn at_end(&mut self) -> Result<bool> {
        if self.pending.is_none() && !self.exhausted {
            if let Some(entry) = self.pull().await? {
                self.push_back(entry);
            }
        }
        Ok(self.pending.is_none() && self.exhausted)
    }

    /// Next entry, `Eof` when the listing is over.
    pub async fn next_entry(&mut self) -> Result<DirEntryInfo> {
        let entry = self.pull().await?.ok_or(Error::Eof)?;
        self.position += 1;
        Ok(entry)
    }

    /// Collect up to `max_count` entries (zero for no limit) whose encoded size fits in
    /// `budget` bytes.
    ///
    /// The status carries `EOF` only when the listing is really exhausted.
    pub async fn read_page(&mut self, max_count: u8, budget: usize) -> Result<(Vec<DirEntry>, DirStatus)> {
        let limit = match max_count {
            0 => u8::MAX as usize,
            n => n as usize,
        };

        let mut entries = Vec::new();
        let mut used = 0;
        while entries.len() < limit {
            let Some(info) = self.pull().await? else {
                break;
            };
            let entry = wire_entry(&info);
            if used + entry.size() > budget {
                self.push_back(info);
                if entries.is_empty() {
                    return Err(Error::NoBufferSpace);
                }
                break;
            }
            used += entry.size();
            entries.push(entry);
            self.position += 1;
        }

        let status = if self.at_end().await? {
            DirStatus::EOF
        } else {
            DirStatus::empty()
        };
        Ok((entries, status))
    }

    /// Restart from a fresh listing and skip `position` entries.
    pub async fn rewind(&mut self, stream: DirStream, position: u32) -> Result<()> {
        self.stream = stream;
        self.pending = None;
        self.exhausted = false;
        self.position = 0;

        while self.position < position {
            match self.pull().await? {
                Some(_) => self.position += 1,
                None => break,
            }
        }
        Ok(())
    }
}
