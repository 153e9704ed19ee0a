//! Serialize/deserialize TNFS messages into/from binary.
//!
//! Integers are little-endian, strings are NUL terminated, blobs carry a 16-bit length
//! and lists an 8-bit count. Enumerations travel as a single ordinal byte and unknown
//! ordinals are rejected with `InvalidData`.

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::Shl;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for i32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_i32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.as_bytes().contains(&0) {
            return res!(io_err!(InvalidInput, "String contains a NUL byte"));
        }
        w.write_all(self.as_bytes())?;
        w.write_u8(0)?;
        Ok(self.len() + 1)
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        if size > u16::MAX as usize {
            return res!(io_err!(InvalidInput, "Data exceeds 65535 bytes"));
        }
        let bytes = (size as u16).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl Encodable for Version {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.minor << &self.major {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.mode
            << &self.uid
            << &self.gid
            << &self.size
            << &self.atime
            << &self.mtime
            << &self.ctime
            << &self.uid_name
            << &self.gid_name
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for DirEntry {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.flags.bits()
            << &self.size
            << &self.mtime
            << &self.ctime
            << &self.name
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > u8::MAX as usize {
            return res!(io_err!(InvalidInput, "List exceeds 255 elements"));
        }
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u8), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

macro_rules! ordinal {
    ($($typ:ident),*) => {
        $(
            impl Encodable for $typ {
                fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
                    (*self as u8).encode(w)
                }
            }

            impl Decodable for $typ {
                fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
                    let ordinal = r.read_u8()?;
                    $typ::from_u8(ordinal).ok_or_else(|| {
                        io_err!(InvalidData, format!("Invalid {} ordinal {}", stringify!($typ), ordinal))
                    })
                }
            }
        )*
    };
}

ordinal!(Whence, SumAlgorithm, ResultCode);

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let buf = Encoder::new(w) << &self.conn << &self.seq << &(self.command as u8);
        let buf = if self.body.is_r() {
            buf << &self.body.result()
        } else {
            buf
        };

        let buf = match self.body {
            RError { .. } => buf,

            TMount {
                ref version,
                ref path,
                ref user,
                ref password,
            } => buf << version << path << user << password,
            RMount {
                ref version,
                ref retry,
            } => buf << version << retry,
            TUmount | RUmount => buf,

            TOpenDir { ref path } => buf << path,
            ROpenDir { ref handle } => buf << handle,
            TReadDir { ref handle } => buf << handle,
            RReadDir { ref name } => buf << name,
            TCloseDir { ref handle } => buf << handle,
            RCloseDir => buf,
            TMkDir { ref path } => buf << path,
            RMkDir => buf,
            TRmDir { ref path } => buf << path,
            RRmDir => buf,
            TTellDir { ref handle } => buf << handle,
            RTellDir { ref position } => buf << position,
            TSeekDir {
                ref handle,
                ref position,
            } => buf << handle << position,
            RSeekDir => buf,
            TOpenDirX {
                ref options,
                ref sort,
                ref max_results,
                ref pattern,
                ref path,
            } => buf << &options.bits() << &sort.bits() << max_results << pattern << path,
            ROpenDirX { ref handle } => buf << handle,
            TReadDirX {
                ref handle,
                ref count,
            } => buf << handle << count,
            RReadDirX {
                ref status,
                ref position,
                ref entries,
            } => {
                if entries.len() > u8::MAX as usize {
                    return res!(io_err!(InvalidInput, "Too many directory entries"));
                }
                entries.iter().fold(
                    buf << &(entries.len() as u8) << &status.bits() << position,
                    |acc, e| acc << e,
                )
            }

            TRead {
                ref handle,
                ref size,
            } => buf << handle << size,
            RRead { ref data } => buf << data,
            TWrite {
                ref handle,
                ref data,
            } => buf << handle << data,
            RWrite { ref count } => buf << count,
            TClose { ref handle } => buf << handle,
            RClose => buf,
            TStat { ref path } => buf << path,
            RStat { ref stat } => buf << stat,
            TLseek {
                ref handle,
                ref whence,
                ref offset,
            } => buf << handle << whence << offset,
            RLseek { ref position } => buf << position,
            TUnlink { ref path } => buf << path,
            RUnlink => buf,
            TChmod { ref mode, ref path } => buf << mode << path,
            RChmod => buf,
            TRename { ref from, ref to } => buf << from << to,
            RRename => buf,
            TOpen {
                ref flags,
                ref mode,
                ref path,
            } => buf << &flags.bits() << mode << path,
            ROpen { ref handle } => buf << handle,

            TSize | TFree => buf,
            RSize { ref kilobytes } | RFree { ref kilobytes } => buf << kilobytes,

            TCapabilities => buf,
            RCapabilities {
                ref mechanisms,
                ref server_key,
            } => buf << mechanisms << server_key,
            TClientFirst {
                ref path,
                ref message,
            } => buf << path << message,
            RClientFirst { ref message }
            | TClientFinal { ref message }
            | RClientFinal { ref message } => buf << message,
            TSecureMount {
                ref public_key,
                ref key_bits,
                ref block_size,
            } => buf << public_key << key_bits << block_size,
            RSecureMount {
                ref public_key,
                ref retry,
            } => buf << public_key << retry,
            TSum {
                ref algorithm,
                ref path,
            } => buf << algorithm << path,
            RSum { ref digest } => buf << digest,
            TCopy {
                ref from,
                ref to,
                ref flags,
            } => buf << from << to << &flags.bits(),
            RCopy => buf,
            TMounts => buf,
            RMounts { ref mounts } => buf << mounts,
            TPacketSize { ref size } | RPacketSize { ref size } => buf << size,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for i32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i32::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let mut bytes = Vec::new();
        loop {
            match r.read_u8()? {
                0 => break,
                b => bytes.push(b),
            }
        }
        String::from_utf8(bytes).map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl Decodable for Version {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let minor = Decodable::decode(r)?;
        let major = Decodable::decode(r)?;
        Ok(Version { major, minor })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Stat {
            mode: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            size: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            ctime: Decodable::decode(r)?,
            uid_name: Decodable::decode(r)?,
            gid_name: Decodable::decode(r)?,
        })
    }
}

impl Decodable for DirEntry {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(DirEntry {
            flags: decode!(EntryFlags, *r),
            size: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            ctime: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
        })
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u8 = Decodable::decode(r)?;
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Clear-text part of every frame
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub conn: u16,
    pub seq: u8,
    /// Raw opcode; may not name a known [`Command`]
    pub command: u8,
}

impl Header {
    pub fn command(&self) -> Result<Command> {
        Command::from_u8(self.command)
            .ok_or_else(|| io_err!(InvalidData, format!("Unknown command {:#04x}", self.command)))
    }
}

impl Decodable for Header {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Header {
            conn: decode!(*r),
            seq: decode!(*r),
            command: decode!(*r),
        })
    }
}

/// Read the connection id of a frame without consuming anything else.
pub fn peek_conn(frame: &[u8]) -> Option<u16> {
    match frame {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

/// Decode the payload of a request for `command`.
pub fn read_request_body<R: ReadBytesExt>(command: Command, r: &mut R) -> Result<FCall> {
    use crate::Command::*;

    let mut buf = r;

    Ok(match command {
        Mount => FCall::TMount {
            version: decode!(buf),
            path: decode!(buf),
            user: decode!(buf),
            password: decode!(buf),
        },
        Umount => FCall::TUmount,
        OpenDir => FCall::TOpenDir { path: decode!(buf) },
        ReadDir => FCall::TReadDir {
            handle: decode!(buf),
        },
        CloseDir => FCall::TCloseDir {
            handle: decode!(buf),
        },
        MkDir => FCall::TMkDir { path: decode!(buf) },
        RmDir => FCall::TRmDir { path: decode!(buf) },
        TellDir => FCall::TTellDir {
            handle: decode!(buf),
        },
        SeekDir => FCall::TSeekDir {
            handle: decode!(buf),
            position: decode!(buf),
        },
        OpenDirX => FCall::TOpenDirX {
            options: decode!(DirOptions, buf),
            sort: decode!(SortOptions, buf),
            max_results: decode!(buf),
            pattern: decode!(buf),
            path: decode!(buf),
        },
        ReadDirX => FCall::TReadDirX {
            handle: decode!(buf),
            count: decode!(buf),
        },
        Read => FCall::TRead {
            handle: decode!(buf),
            size: decode!(buf),
        },
        Write => FCall::TWrite {
            handle: decode!(buf),
            data: decode!(buf),
        },
        Close => FCall::TClose {
            handle: decode!(buf),
        },
        Stat => FCall::TStat { path: decode!(buf) },
        Lseek => FCall::TLseek {
            handle: decode!(buf),
            whence: decode!(buf),
            offset: decode!(buf),
        },
        Unlink => FCall::TUnlink { path: decode!(buf) },
        Chmod => FCall::TChmod {
            mode: decode!(buf),
            path: decode!(buf),
        },
        Rename => FCall::TRename {
            from: decode!(buf),
            to: decode!(buf),
        },
        Open => FCall::TOpen {
            flags: decode!(OpenFlags, buf),
            mode: decode!(buf),
            path: decode!(buf),
        },
        Size => FCall::TSize,
        Free => FCall::TFree,
        Capabilities => FCall::TCapabilities,
        ClientFirst => FCall::TClientFirst {
            path: decode!(buf),
            message: decode!(buf),
        },
        ClientFinal => FCall::TClientFinal {
            message: decode!(buf),
        },
        SecureMount => FCall::TSecureMount {
            public_key: decode!(buf),
            key_bits: decode!(buf),
            block_size: decode!(buf),
        },
        Sum => FCall::TSum {
            algorithm: decode!(buf),
            path: decode!(buf),
        },
        Copy => FCall::TCopy {
            from: decode!(buf),
            to: decode!(buf),
            flags: decode!(CopyFlags, buf),
        },
        Mounts => FCall::TMounts,
        PacketSize => FCall::TPacketSize { size: decode!(buf) },
    })
}

/// Decode the result code and, on success only, the payload of a response for `command`.
///
/// A failure result stops right after the code: whatever follows is never read.
pub fn read_response_body<R: ReadBytesExt>(command: Command, r: &mut R) -> Result<FCall> {
    use crate::Command::*;

    let mut buf = r;

    let code: ResultCode = decode!(buf);
    if code != ResultCode::Success {
        return Ok(FCall::RError { code });
    }

    Ok(match command {
        Mount => FCall::RMount {
            version: decode!(buf),
            retry: decode!(buf),
        },
        Umount => FCall::RUmount,
        OpenDir => FCall::ROpenDir {
            handle: decode!(buf),
        },
        ReadDir => FCall::RReadDir { name: decode!(buf) },
        CloseDir => FCall::RCloseDir,
        MkDir => FCall::RMkDir,
        RmDir => FCall::RRmDir,
        TellDir => FCall::RTellDir {
            position: decode!(buf),
        },
        SeekDir => FCall::RSeekDir,
        OpenDirX => FCall::ROpenDirX {
            handle: decode!(buf),
        },
        ReadDirX => {
            let count: u8 = decode!(buf);
            let status = decode!(DirStatus, buf);
            let position = decode!(buf);
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                entries.push(decode!(buf));
            }
            FCall::RReadDirX {
                status,
                position,
                entries,
            }
        }
        Read => FCall::RRead { data: decode!(buf) },
        Write => FCall::RWrite {
            count: decode!(buf),
        },
        Close => FCall::RClose,
        Stat => FCall::RStat { stat: decode!(buf) },
        Lseek => FCall::RLseek {
            position: decode!(buf),
        },
        Unlink => FCall::RUnlink,
        Chmod => FCall::RChmod,
        Rename => FCall::RRename,
        Open => FCall::ROpen {
            handle: decode!(buf),
        },
        Size => FCall::RSize {
            kilobytes: decode!(buf),
        },
        Free => FCall::RFree {
            kilobytes: decode!(buf),
        },
        Capabilities => FCall::RCapabilities {
            mechanisms: decode!(buf),
            server_key: decode!(buf),
        },
        ClientFirst => FCall::RClientFirst {
            message: decode!(buf),
        },
        ClientFinal => FCall::RClientFinal {
            message: decode!(buf),
        },
        SecureMount => FCall::RSecureMount {
            public_key: decode!(buf),
            retry: decode!(buf),
        },
        Sum => FCall::RSum {
            digest: decode!(buf),
        },
        Copy => FCall::RCopy,
        Mounts => FCall::RMounts {
            mounts: decode!(buf),
        },
        PacketSize => FCall::RPacketSize { size: decode!(buf) },
    })
}

/// Helper function to read a TNFS request from a byte-oriented stream
pub fn read_request<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    let header: Header = Decodable::decode(r)?;
    let command = header.command()?;
    Ok(Msg {
        conn: header.conn,
        seq: header.seq,
        command,
        body: read_request_body(command, r)?,
    })
}

/// Helper function to read a TNFS response from a byte-oriented stream
pub fn read_response<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    let header: Header = Decodable::decode(r)?;
    let command = header.command()?;
    Ok(Msg {
        conn: header.conn,
        seq: header.seq,
        command,
        body: read_response_body(command, r)?,
    })
}

/// Helper function to write a TNFS message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

/// Write a bare failure response for a header whose command may be unknown.
pub fn write_error<W: WriteBytesExt>(w: &mut W, header: &Header, code: ResultCode) -> Result<usize> {
    match Encoder::new(w) << &header.conn << &header.seq << &header.command << &code {
        SResult(Ok(enc)) => Ok(enc.bytes_written()),
        SResult(Err(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::{collections::HashSet, io::Cursor};

    const COMMAND_COUNT: usize = 30;

    fn encode(msg: &Msg) -> Vec<u8> {
        let mut buf = Vec::new();
        write_msg(&mut buf, msg).unwrap();
        buf
    }

    fn request_roundtrip(body: FCall) {
        let msg = Msg::request(0xbeef, 7, body).unwrap();
        let decoded = read_request(&mut Cursor::new(encode(&msg))).unwrap();
        assert_eq!(msg, decoded);
    }

    fn response_roundtrip(body: FCall) {
        let msg = Msg::request(0x1234, 200, body).unwrap();
        let decoded = read_response(&mut Cursor::new(encode(&msg))).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn encoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut encoder = Vec::new();
        for i in 0..10 {
            (&(i as u8)).encode(&mut encoder).unwrap();
        }
        assert_eq!(expected, encoder);
    }

    #[test]
    fn header_layout() {
        let msg = Msg::request(0x0102, 0x03, FCall::TStat { path: "/a".into() }).unwrap();
        assert_eq!(encode(&msg), vec![0x02, 0x01, 0x03, 0x24, b'/', b'a', 0]);
    }

    fn covered(bodies: &[FCall]) -> usize {
        let commands: HashSet<Command> = bodies.iter().filter_map(FCall::command).collect();
        commands.len()
    }

    fn long_name() -> String {
        "n".repeat(255)
    }

    fn empty_entry() -> DirEntry {
        DirEntry {
            flags: EntryFlags::empty(),
            size: 0,
            mtime: 0,
            ctime: 0,
            name: String::new(),
        }
    }

    fn full_entry() -> DirEntry {
        DirEntry {
            flags: EntryFlags::all(),
            size: u32::MAX,
            mtime: u32::MAX,
            ctime: u32::MAX,
            name: long_name(),
        }
    }

    #[rustfmt::skip]
    fn requests() -> Vec<FCall> {
        use FCall::*;
        vec![
            TMount { version: Version { major: 0, minor: 0 }, path: String::new(), user: String::new(), password: String::new() },
            TMount { version: PROTOCOL_VERSION, path: "/games".into(), user: "alice".into(), password: long_name() },
            TUmount,
            TOpenDir { path: String::new() },
            TReadDir { handle: u8::MAX },
            TCloseDir { handle: 0 },
            TMkDir { path: "/a/b".into() },
            TRmDir { path: long_name() },
            TTellDir { handle: 1 },
            TSeekDir { handle: 0, position: 0 },
            TSeekDir { handle: u8::MAX, position: u32::MAX },
            TOpenDirX { options: DirOptions::empty(), sort: SortOptions::empty(), max_results: 0, pattern: String::new(), path: String::new() },
            TOpenDirX { options: DirOptions::all(), sort: SortOptions::all(), max_results: u16::MAX, pattern: "*.txt".into(), path: "/docs".into() },
            TReadDirX { handle: 0, count: 0 },
            TReadDirX { handle: u8::MAX, count: u8::MAX },
            TRead { handle: 0, size: 0 },
            TRead { handle: u8::MAX, size: u16::MAX },
            TWrite { handle: 0, data: Data(Vec::new()) },
            TWrite { handle: u8::MAX, data: Data(vec![0xa5; u16::MAX as usize]) },
            TClose { handle: 3 },
            TStat { path: "/".into() },
            TLseek { handle: 0, whence: Whence::Set, offset: 0 },
            TLseek { handle: u8::MAX, whence: Whence::End, offset: i32::MIN },
            TLseek { handle: 1, whence: Whence::Cur, offset: i32::MAX },
            TUnlink { path: String::new() },
            TChmod { mode: 0, path: String::new() },
            TChmod { mode: u16::MAX, path: "/f".into() },
            TRename { from: String::new(), to: String::new() },
            TRename { from: "/old".into(), to: long_name() },
            TOpen { flags: OpenFlags::empty(), mode: 0, path: String::new() },
            TOpen { flags: OpenFlags::all(), mode: u16::MAX, path: "/f".into() },
            TSize,
            TFree,
            TCapabilities,
            TClientFirst { path: String::new(), message: String::new() },
            TClientFirst { path: "/".into(), message: "n,,n=alice,r=abc".into() },
            TClientFinal { message: String::new() },
            TClientFinal { message: "c=biws,r=abcdef,p=cHJvb2Y=".into() },
            TSecureMount { public_key: Data(Vec::new()), key_bits: 0, block_size: 0 },
            TSecureMount { public_key: Data(vec![0xff; 1024]), key_bits: u16::MAX, block_size: u16::MAX },
            TSum { algorithm: SumAlgorithm::Sha224, path: String::new() },
            TSum { algorithm: SumAlgorithm::Sha512, path: "/f".into() },
            TCopy { from: String::new(), to: String::new(), flags: CopyFlags::empty() },
            TCopy { from: "/a".into(), to: "/b".into(), flags: CopyFlags::all() },
            TMounts,
            TPacketSize { size: 0 },
            TPacketSize { size: u16::MAX },
        ]
    }

    #[rustfmt::skip]
    fn responses() -> Vec<FCall> {
        use FCall::*;
        vec![
            RMount { version: Version { major: 0, minor: 0 }, retry: 0 },
            RMount { version: PROTOCOL_VERSION, retry: u16::MAX },
            RUmount,
            ROpenDir { handle: 0 },
            RReadDir { name: String::new() },
            RReadDir { name: long_name() },
            RCloseDir,
            RMkDir,
            RRmDir,
            RTellDir { position: 0 },
            RTellDir { position: u32::MAX },
            RSeekDir,
            ROpenDirX { handle: u8::MAX },
            RReadDirX { status: DirStatus::empty(), position: 0, entries: Vec::new() },
            RReadDirX { status: DirStatus::all(), position: u16::MAX, entries: vec![empty_entry(), full_entry()] },
            RRead { data: Data(Vec::new()) },
            RRead { data: Data(vec![7; u16::MAX as usize]) },
            RWrite { count: 0 },
            RWrite { count: u16::MAX },
            RClose,
            RStat { stat: Stat::default() },
            RStat {
                stat: Stat {
                    mode: u16::MAX,
                    uid: u16::MAX,
                    gid: u16::MAX,
                    size: u32::MAX,
                    atime: u32::MAX,
                    mtime: u32::MAX,
                    ctime: u32::MAX,
                    uid_name: "root".into(),
                    gid_name: long_name(),
                },
            },
            RLseek { position: 0 },
            RLseek { position: u32::MAX },
            RUnlink,
            RChmod,
            RRename,
            ROpen { handle: 0 },
            ROpen { handle: u8::MAX },
            RSize { kilobytes: 0 },
            RSize { kilobytes: u32::MAX },
            RFree { kilobytes: 0 },
            RFree { kilobytes: u32::MAX },
            RCapabilities { mechanisms: Vec::new(), server_key: Data(Vec::new()) },
            RCapabilities { mechanisms: vec![String::new(); u8::MAX as usize], server_key: Data(vec![0; 300]) },
            RClientFirst { message: String::new() },
            RClientFirst { message: "r=abcdef,s=c2FsdA==,i=4096".into() },
            RClientFinal { message: String::new() },
            RClientFinal { message: "v=c2lnbmF0dXJl".into() },
            RSecureMount { public_key: Data(Vec::new()), retry: 0 },
            RSecureMount { public_key: Data(vec![0x5a; 512]), retry: u16::MAX },
            RSum { digest: String::new() },
            RSum { digest: "ab".repeat(64) },
            RCopy,
            RMounts { mounts: Vec::new() },
            RMounts { mounts: vec!["/".into(), "/scratch".into()] },
            RPacketSize { size: 0 },
            RPacketSize { size: u16::MAX },
        ]
    }

    #[test]
    fn every_request_roundtrips() {
        let bodies = requests();
        assert_eq!(covered(&bodies), COMMAND_COUNT);
        assert!(bodies.iter().all(|b| !b.is_r()));
        for body in bodies {
            request_roundtrip(body);
        }
    }

    #[test]
    fn every_response_roundtrips() {
        let bodies = responses();
        assert_eq!(covered(&bodies), COMMAND_COUNT);
        assert!(bodies.iter().all(FCall::is_r));
        for body in bodies {
            response_roundtrip(body);
        }
    }

    #[test]
    fn failure_response_stops_after_code() {
        let mut frame = vec![0x01, 0x00, 0x05, Command::Stat as u8, ResultCode::Noent as u8];
        // Garbage where a stat body would be; far too short to decode as one.
        frame.extend_from_slice(&[0xff, 0xff, 0xff]);

        let mut cursor = Cursor::new(frame);
        let msg = read_response(&mut cursor).unwrap();
        assert_eq!(
            msg.body,
            FCall::RError {
                code: ResultCode::Noent
            }
        );
        assert_eq!(cursor.position(), 5);
    }

    #[test]
    fn out_of_range_ordinals_are_rejected() {
        let frame = vec![0, 0, 0, Command::Lseek as u8, 1, 9, 0, 0, 0, 0];
        let err = read_request(&mut Cursor::new(frame)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let frame = vec![0, 0, 0, Command::Stat as u8, 0x7f];
        assert!(read_response(&mut Cursor::new(frame)).is_err());

        let frame = vec![0, 0, 0, 0xee];
        assert!(read_request(&mut Cursor::new(frame)).is_err());
    }

    #[test]
    fn strings_reject_embedded_nul() {
        let mut buf = Vec::new();
        assert!("a\0b".to_owned().encode(&mut buf).is_err());
    }

    #[test]
    fn error_reply_keeps_raw_command() {
        let header = Header {
            conn: 9,
            seq: 1,
            command: 0xee,
        };
        let mut buf = Vec::new();
        write_error(&mut buf, &header, ResultCode::Nosys).unwrap();
        assert_eq!(buf, vec![9, 0, 1, 0xee, ResultCode::Nosys as u8]);
    }

    proptest! {
        #[test]
        fn string_fields_roundtrip(path in "[^\\x00]{0,64}", seq in any::<u8>()) {
            let msg = Msg::request(1, seq, FCall::TUnlink { path }).unwrap();
            let decoded = read_request(&mut Cursor::new(encode(&msg))).unwrap();
            prop_assert_eq!(msg, decoded);
        }

        #[test]
        fn data_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..1024)) {
            let msg = Msg::request(2, 0, FCall::RRead { data: Data(bytes) }).unwrap();
            let decoded = read_response(&mut Cursor::new(encode(&msg))).unwrap();
            prop_assert_eq!(msg, decoded);
        }
    }
}
