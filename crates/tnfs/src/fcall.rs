//! TNFS protocol data types and constants.
//!
//! # Protocol
//! TNFS 1.2 with the secure mount and SCRAM extensions

use std::{fmt, mem::size_of};

use bitflags::bitflags;
use enum_primitive::*;

/// TNFS default port, both UDP and TCP
pub const TNFS_PORT: u16 = 16384;

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 2 };

/// Connection id used before a session exists
pub const NO_SESSION: u16 = 0;

/// conn[2] seq[1] cmd[1]
pub const HEADER_SIZE: usize = 4;

/// Result byte which follows the header in every response
pub const RESULT_SIZE: usize = 1;

/// count[1] status[1] dirpos[2] in front of `RReadDirX` entries
pub const READDIRX_HEADER_SIZE: usize = 4;

/// count[2] in front of `RRead` data
pub const READ_HEADER_SIZE: usize = 2;

/// Default maximum message size: 512 bytes of payload plus header room
pub const DEFAULT_MESSAGE_SIZE: u16 = 532;

/// Smallest message size a client may negotiate
pub const MIN_MESSAGE_SIZE: u16 = 64;

/// Default client retry interval suggested by the server, in milliseconds
pub const DEFAULT_RETRY_MS: u16 = 1000;

/// Bits of `Stat::mode`
pub mod mode {
    /// Mask for the file type bits
    pub const S_IFMT: u16 = 0o170000;
    /// Directory
    pub const S_IFDIR: u16 = 0o040000;
    /// Regular file
    pub const S_IFREG: u16 = 0o100000;
    /// Mask for permission bits
    pub const PERMS: u16 = 0o7777;
}

enum_from_primitive! {
    #[doc = "Command opcodes"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Command {
        // Session
        Mount           = 0x00,
        Umount          = 0x01,

        // Directories
        OpenDir         = 0x10,
        ReadDir         = 0x11,
        CloseDir        = 0x12,
        MkDir           = 0x13,
        RmDir           = 0x14,
        TellDir         = 0x15,
        SeekDir         = 0x16,
        OpenDirX        = 0x17,
        ReadDirX        = 0x18,

        // Files
        Read            = 0x21,
        Write           = 0x22,
        Close           = 0x23,
        Stat            = 0x24,
        Lseek           = 0x25,
        Unlink          = 0x26,
        Chmod           = 0x27,
        Rename          = 0x28,
        Open            = 0x29,

        // Devices
        Size            = 0x30,
        Free            = 0x31,

        // Extensions
        Capabilities    = 0x60,
        ClientFirst     = 0x61,
        ClientFinal     = 0x62,
        SecureMount     = 0x63,
        Sum             = 0x64,
        Copy            = 0x65,
        Mounts          = 0x66,
        PacketSize      = 0x67,
    }
}

impl Command {
    /// Commands which create or rebind a session as a side effect
    pub fn is_mount(&self) -> bool {
        matches!(
            *self,
            Command::Mount | Command::ClientFirst | Command::SecureMount
        )
    }
}

enum_from_primitive! {
    #[doc = "Result codes, the only failure vocabulary that crosses the wire"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum ResultCode {
        Success         = 0x00,
        Perm            = 0x01,
        Noent           = 0x02,
        Io              = 0x03,
        Nxio            = 0x04,
        TooBig          = 0x05,
        Badf            = 0x06,
        Again           = 0x07,
        Nomem           = 0x08,
        Acces           = 0x09,
        Busy            = 0x0A,
        Exist           = 0x0B,
        Notdir          = 0x0C,
        Isdir           = 0x0D,
        Inval           = 0x0E,
        Nfile           = 0x0F,
        Mfile           = 0x10,
        Fbig            = 0x11,
        Nospc           = 0x12,
        Spipe           = 0x13,
        Rofs            = 0x14,
        Nametoolong     = 0x15,
        Nosys           = 0x16,
        Notempty        = 0x17,
        Loop            = 0x18,
        Nodata          = 0x19,
        Nostr           = 0x1A,
        Proto           = 0x1B,
        Badfd           = 0x1C,
        Users           = 0x1D,
        Nobufs          = 0x1E,
        Already         = 0x1F,
        Stale           = 0x20,
        Eof             = 0x21,
    }
}

enum_from_primitive! {
    #[doc = "Origin of an `Lseek` offset"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum Whence {
        Set = 0,
        Cur = 1,
        End = 2,
    }
}

enum_from_primitive! {
    #[doc = "Digest algorithms offered by `Sum`"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum SumAlgorithm {
        Sha224 = 0,
        Sha256 = 1,
        Sha384 = 2,
        Sha512 = 3,
    }
}

bitflags! {
    /// Flags of `TOpen`
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct OpenFlags: u16 {
        const RDONLY    = 0x0001;
        const WRONLY    = 0x0002;
        const RDWR      = 0x0003;
        const APPEND    = 0x0008;
        const CREATE    = 0x0100;
        const TRUNCATE  = 0x0200;
        const EXCLUSIVE = 0x0400;
    }
}

impl OpenFlags {
    pub fn readable(&self) -> bool {
        self.contains(OpenFlags::RDONLY)
    }

    pub fn writable(&self) -> bool {
        self.contains(OpenFlags::WRONLY)
    }
}

bitflags! {
    /// Listing options of `TOpenDirX`
    ///
    /// All bits clear means: folders first, hidden and special entries skipped.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct DirOptions: u8 {
        const NO_FOLDERS_FIRST  = 0x01;
        const NO_SKIP_HIDDEN    = 0x02;
        const NO_SKIP_SPECIAL   = 0x04;
        #[doc = "The pattern applies to directories too"]
        const DIR_PATTERN       = 0x08;
    }
}

bitflags! {
    /// Sort options of `TOpenDirX`
    ///
    /// All bits clear means: sort by name, ignoring case, ascending.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct SortOptions: u8 {
        #[doc = "Keep backend order; the listing stays lazy"]
        const NONE          = 0x01;
        const CASE          = 0x02;
        const DESCENDING    = 0x04;
        const MODIFIED      = 0x08;
        const SIZE          = 0x10;
    }
}

bitflags! {
    /// Status byte of `RReadDirX`
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct DirStatus: u8 {
        const EOF = 0x01;
    }
}

bitflags! {
    /// Per entry flags of `RReadDirX`
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct EntryFlags: u8 {
        const DIR       = 0x01;
        const HIDDEN    = 0x02;
        const SPECIAL   = 0x04;
    }
}

bitflags! {
    /// Flags of `TCopy`
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct CopyFlags: u8 {
        const OVERWRITE = 0x01;
    }
}

/// Protocol version exchanged by `Mount`, encoded minor first
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

/// File attributes returned by `Stat`
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// File type and permission bits, see [`mode`]
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    /// Total size, in bytes
    pub size: u32,
    /// Seconds since the epoch
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// Owner name, may be empty
    pub uid_name: String,
    /// Group name, may be empty
    pub gid_name: String,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.mode & mode::S_IFMT == mode::S_IFDIR
    }

    pub fn directory(perms: u16) -> Stat {
        Stat {
            mode: mode::S_IFDIR | (perms & mode::PERMS),
            ..Default::default()
        }
    }

    pub fn file(perms: u16, size: u32) -> Stat {
        Stat {
            mode: mode::S_IFREG | (perms & mode::PERMS),
            size,
            ..Default::default()
        }
    }
}

/// Directory entry used in `RReadDirX`
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub flags: EntryFlags,
    pub size: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub name: String,
}

impl DirEntry {
    /// Encoded size of this entry, including the name terminator
    pub fn size(&self) -> usize {
        size_of::<u8>() + size_of::<u32>() * 3 + self.name.len() + 1
    }

    pub fn is_dir(&self) -> bool {
        self.flags.contains(EntryFlags::DIR)
    }
}

/// Data type used in `RRead`, `TWrite` and opaque key material
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

// File contents are never logged, only their size.
impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Data(<{} bytes>)", self.0.len())
    }
}

/// A data type encapsulating the various TNFS messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    /// Failure response; nothing but the code is on the wire
    RError {
        code: ResultCode,
    },

    // Session
    TMount {
        version: Version,
        path: String,
        user: String,
        password: String,
    },
    RMount {
        version: Version,
        retry: u16,
    },
    TUmount,
    RUmount,

    // Directories
    TOpenDir {
        path: String,
    },
    ROpenDir {
        handle: u8,
    },
    TReadDir {
        handle: u8,
    },
    RReadDir {
        name: String,
    },
    TCloseDir {
        handle: u8,
    },
    RCloseDir,
    TMkDir {
        path: String,
    },
    RMkDir,
    TRmDir {
        path: String,
    },
    RRmDir,
    TTellDir {
        handle: u8,
    },
    RTellDir {
        position: u32,
    },
    TSeekDir {
        handle: u8,
        position: u32,
    },
    RSeekDir,
    TOpenDirX {
        options: DirOptions,
        sort: SortOptions,
        max_results: u16,
        pattern: String,
        path: String,
    },
    ROpenDirX {
        handle: u8,
    },
    TReadDirX {
        handle: u8,
        count: u8,
    },
    RReadDirX {
        status: DirStatus,
        position: u16,
        entries: Vec<DirEntry>,
    },

    // Files
    TRead {
        handle: u8,
        size: u16,
    },
    RRead {
        data: Data,
    },
    TWrite {
        handle: u8,
        data: Data,
    },
    RWrite {
        count: u16,
    },
    TClose {
        handle: u8,
    },
    RClose,
    TStat {
        path: String,
    },
    RStat {
        stat: Stat,
    },
    TLseek {
        handle: u8,
        whence: Whence,
        offset: i32,
    },
    RLseek {
        position: u32,
    },
    TUnlink {
        path: String,
    },
    RUnlink,
    TChmod {
        mode: u16,
        path: String,
    },
    RChmod,
    TRename {
        from: String,
        to: String,
    },
    RRename,
    TOpen {
        flags: OpenFlags,
        mode: u16,
        path: String,
    },
    ROpen {
        handle: u8,
    },

    // Devices
    TSize,
    RSize {
        kilobytes: u32,
    },
    TFree,
    RFree {
        kilobytes: u32,
    },

    // Extensions
    TCapabilities,
    RCapabilities {
        mechanisms: Vec<String>,
        server_key: Data,
    },
    TClientFirst {
        path: String,
        message: String,
    },
    RClientFirst {
        message: String,
    },
    TClientFinal {
        message: String,
    },
    RClientFinal {
        message: String,
    },
    TSecureMount {
        public_key: Data,
        key_bits: u16,
        block_size: u16,
    },
    RSecureMount {
        public_key: Data,
        retry: u16,
    },
    TSum {
        algorithm: SumAlgorithm,
        path: String,
    },
    RSum {
        digest: String,
    },
    TCopy {
        from: String,
        to: String,
        flags: CopyFlags,
    },
    RCopy,
    TMounts,
    RMounts {
        mounts: Vec<String>,
    },
    TPacketSize {
        size: u16,
    },
    RPacketSize {
        size: u16,
    },
}

impl FCall {
    /// The command a message belongs to; `None` for `RError` which borrows its command
    /// from the request it answers.
    pub fn command(&self) -> Option<Command> {
        use crate::FCall::*;

        Some(match *self {
            RError { .. } => return None,
            TMount { .. } | RMount { .. } => Command::Mount,
            TUmount | RUmount => Command::Umount,
            TOpenDir { .. } | ROpenDir { .. } => Command::OpenDir,
            TReadDir { .. } | RReadDir { .. } => Command::ReadDir,
            TCloseDir { .. } | RCloseDir => Command::CloseDir,
            TMkDir { .. } | RMkDir => Command::MkDir,
            TRmDir { .. } | RRmDir => Command::RmDir,
            TTellDir { .. } | RTellDir { .. } => Command::TellDir,
            TSeekDir { .. } | RSeekDir => Command::SeekDir,
            TOpenDirX { .. } | ROpenDirX { .. } => Command::OpenDirX,
            TReadDirX { .. } | RReadDirX { .. } => Command::ReadDirX,
            TRead { .. } | RRead { .. } => Command::Read,
            TWrite { .. } | RWrite { .. } => Command::Write,
            TClose { .. } | RClose => Command::Close,
            TStat { .. } | RStat { .. } => Command::Stat,
            TLseek { .. } | RLseek { .. } => Command::Lseek,
            TUnlink { .. } | RUnlink => Command::Unlink,
            TChmod { .. } | RChmod => Command::Chmod,
            TRename { .. } | RRename => Command::Rename,
            TOpen { .. } | ROpen { .. } => Command::Open,
            TSize | RSize { .. } => Command::Size,
            TFree | RFree { .. } => Command::Free,
            TCapabilities | RCapabilities { .. } => Command::Capabilities,
            TClientFirst { .. } | RClientFirst { .. } => Command::ClientFirst,
            TClientFinal { .. } | RClientFinal { .. } => Command::ClientFinal,
            TSecureMount { .. } | RSecureMount { .. } => Command::SecureMount,
            TSum { .. } | RSum { .. } => Command::Sum,
            TCopy { .. } | RCopy => Command::Copy,
            TMounts | RMounts { .. } => Command::Mounts,
            TPacketSize { .. } | RPacketSize { .. } => Command::PacketSize,
        })
    }

    /// If the message is a response
    pub fn is_r(&self) -> bool {
        use crate::FCall::*;

        matches!(
            *self,
            RError { .. }
                | RMount { .. }
                | RUmount
                | ROpenDir { .. }
                | RReadDir { .. }
                | RCloseDir
                | RMkDir
                | RRmDir
                | RTellDir { .. }
                | RSeekDir
                | ROpenDirX { .. }
                | RReadDirX { .. }
                | RRead { .. }
                | RWrite { .. }
                | RClose
                | RStat { .. }
                | RLseek { .. }
                | RUnlink
                | RChmod
                | RRename
                | ROpen { .. }
                | RSize { .. }
                | RFree { .. }
                | RCapabilities { .. }
                | RClientFirst { .. }
                | RClientFinal { .. }
                | RSecureMount { .. }
                | RSum { .. }
                | RCopy
                | RMounts { .. }
                | RPacketSize { .. }
        )
    }

    /// Debug view that hides passwords and SCRAM messages.
    pub fn redacted(&self) -> Redacted<'_> {
        Redacted(self)
    }

    /// The result code a response carries
    pub fn result(&self) -> ResultCode {
        match *self {
            FCall::RError { code } => code,
            _ => ResultCode::Success,
        }
    }
}

struct Hidden(usize);

impl fmt::Debug for Hidden {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} bytes>", self.0)
    }
}

/// See [`FCall::redacted`].
pub struct Redacted<'a>(&'a FCall);

impl fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            FCall::TMount {
                version,
                path,
                user,
                password,
            } => f
                .debug_struct("TMount")
                .field("version", version)
                .field("path", path)
                .field("user", user)
                .field("password", &Hidden(password.len()))
                .finish(),
            FCall::TClientFirst { path, message } => f
                .debug_struct("TClientFirst")
                .field("path", path)
                .field("message", &Hidden(message.len()))
                .finish(),
            FCall::TClientFinal { message } => f
                .debug_struct("TClientFinal")
                .field("message", &Hidden(message.len()))
                .finish(),
            FCall::RClientFirst { message } => f
                .debug_struct("RClientFirst")
                .field("message", &Hidden(message.len()))
                .finish(),
            FCall::RClientFinal { message } => f
                .debug_struct("RClientFinal")
                .field("message", &Hidden(message.len()))
                .finish(),
            body => fmt::Debug::fmt(body, f),
        }
    }
}

/// Envelope for TNFS messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Session the message belongs to; sent in clear even on a secure session
    pub conn: u16,
    /// Chosen by the client; a resent request reuses its sequence number
    pub seq: u8,
    pub command: Command,
    pub body: FCall,
}

impl Msg {
    /// Build a request envelope, taking the command from the body.
    pub fn request(conn: u16, seq: u8, body: FCall) -> Option<Msg> {
        Some(Msg {
            conn,
            seq,
            command: body.command()?,
            body,
        })
    }
}
