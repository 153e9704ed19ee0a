//! Asynchronous client side TNFS library.
//!
//! A [`Client`] speaks to a server through any [`Transport`]: UDP, TCP or, for tests and
//! embedding, an in-process [`Loopback`]. Requests are resent with the same sequence
//! number until an answer arrives or the attempts run out.

use {
    crate::{
        error::Error,
        fcall::*,
        handle::ListingOptions,
        io_err,
        scram::ScramClient,
        secure::{ClientHandshake, DhGroup, cipher_pair},
        serialize,
        session::Pipeline,
        srv::{Server, tcp_codec},
        utils::Result,
    },
    async_trait::async_trait,
    bytes::{BufMut, Bytes, BytesMut},
    futures::{sink::SinkExt, stream::StreamExt},
    log::debug,
    std::{
        collections::VecDeque,
        io::Cursor,
        net::{Ipv4Addr, Ipv6Addr, SocketAddr},
        sync::{Arc, Mutex as StdMutex, PoisonError},
        time::Duration,
    },
    tokio::{
        net::{
            TcpStream, UdpSocket,
            tcp::{OwnedReadHalf, OwnedWriteHalf},
        },
        sync::Mutex,
        time::{Instant, timeout},
    },
    tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
};

const DEFAULT_ATTEMPTS: u32 = 5;

/// Moves whole frames between a client and a server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Next inbound frame, `Ok(None)` if nothing arrived within `wait`.
    async fn recv(&self, wait: Duration) -> Result<Option<Bytes>>;
}

/// In-process transport that hands frames straight to a [`Server`].
pub struct Loopback {
    server: Arc<Server>,
    replies: StdMutex<VecDeque<Vec<u8>>>,
}

impl Loopback {
    pub fn new(server: Arc<Server>) -> Loopback {
        Loopback {
            server,
            replies: Default::default(),
        }
    }
}

#[async_trait]
impl Transport for Loopback {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        if let Some(reply) = self.server.handle_frame(frame).await {
            self.replies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(reply);
        }
        Ok(())
    }

    async fn recv(&self, _wait: Duration) -> Result<Option<Bytes>> {
        Ok(self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .map(Bytes::from))
    }
}

/// One datagram per message.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn connect(addr: SocketAddr) -> Result<UdpTransport> {
        let local = match addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(UdpTransport { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        self.socket.send(frame).await?;
        Ok(())
    }

    async fn recv(&self, wait: Duration) -> Result<Option<Bytes>> {
        let mut buf = vec![0; u16::MAX as usize + 1];
        match timeout(wait, self.socket.recv(&mut buf)).await {
            Ok(len) => {
                buf.truncate(len?);
                Ok(Some(buf.into()))
            }
            Err(_) => Ok(None),
        }
    }
}

/// Length prefixed messages over a TCP stream.
pub struct TcpTransport {
    reader: Mutex<FramedRead<OwnedReadHalf, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
}

impl TcpTransport {
    pub async fn connect(addr: SocketAddr) -> Result<TcpTransport> {
        let (readhalf, writehalf) = TcpStream::connect(addr).await?.into_split();
        Ok(TcpTransport {
            reader: Mutex::new(FramedRead::new(readhalf, tcp_codec())),
            writer: Mutex::new(FramedWrite::new(writehalf, tcp_codec())),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        self.writer
            .lock()
            .await
            .send(Bytes::copy_from_slice(frame))
            .await?;
        Ok(())
    }

    async fn recv(&self, wait: Duration) -> Result<Option<Bytes>> {
        let mut reader = self.reader.lock().await;
        match timeout(wait, reader.next()).await {
            Ok(Some(frame)) => Ok(Some(frame?.freeze())),
            Ok(None) => Err(io_err!(UnexpectedEof, "server closed the connection").into()),
            Err(_) => Ok(None),
        }
    }
}

/// What `Capabilities` reports
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub mechanisms: Vec<String>,
    pub server_key: Vec<u8>,
}

/// One page of an extended directory listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirPage {
    pub entries: Vec<DirEntry>,
    /// Position of the first entry of the page
    pub position: u16,
    pub eof: bool,
}

macro_rules! rpc {
    ($client:expr, $request:expr, $pat:pat => $out:expr) => {
        match $client.call($request).await? {
            $pat => Ok($out),
            other => Err(Error::protocol(format!("unexpected response {:?}", other))),
        }
    };
}

/// A TNFS client bound to one session at a time.
pub struct Client<T> {
    transport: T,
    conn: u16,
    seq: u8,
    pipeline: Pipeline,
    message_size: u16,
    retry: Duration,
    attempts: u32,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T) -> Client<T> {
        Client {
            transport,
            conn: NO_SESSION,
            seq: 0,
            pipeline: Pipeline::new(),
            message_size: DEFAULT_MESSAGE_SIZE,
            retry: Duration::from_millis(DEFAULT_RETRY_MS as u64),
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    /// Wait `retry` for each answer and send a request at most `attempts` times.
    pub fn with_retry(mut self, retry: Duration, attempts: u32) -> Client<T> {
        self.retry = retry;
        self.attempts = attempts.max(1);
        self
    }

    pub fn conn(&self) -> u16 {
        self.conn
    }

    pub fn message_size(&self) -> u16 {
        self.message_size
    }

    pub fn is_secure(&self) -> bool {
        !self.pipeline.is_empty()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send a request and wait for its answer; failure codes become [`Error`]s.
    pub async fn call(&mut self, body: FCall) -> Result<FCall> {
        let msg = Msg::request(self.conn, self.seq.wrapping_add(1), body)
            .ok_or_else(|| Error::protocol("not a request"))?;
        self.seq = msg.seq;
        debug!("\t→ {:#06x} {} {:?}", msg.conn, msg.seq, msg.body.redacted());

        let mut writer = BytesMut::with_capacity(self.message_size as usize).writer();
        serialize::write_msg(&mut writer, &msg)?;
        let mut frame = writer.into_inner();
        self.pipeline.encode(&mut frame)?;

        for attempt in 1..=self.attempts {
            self.transport.send(&frame).await?;

            let deadline = Instant::now() + self.retry;
            loop {
                let wait = deadline.saturating_duration_since(Instant::now());
                let Some(reply) = self.transport.recv(wait).await? else {
                    break;
                };
                match self.open_reply(&reply) {
                    Ok(response) if response.seq == msg.seq && response.command == msg.command => {
                        debug!(
                            "\t← {:#06x} {} {:?}",
                            response.conn,
                            response.seq,
                            response.body.redacted()
                        );
                        return self.accept(response);
                    }
                    Ok(stale) => debug!("ignoring stale response to seq {}", stale.seq),
                    Err(e) => debug!("ignoring undecodable response: {}", e),
                }
            }
            debug!("no answer to seq {} (attempt {}/{})", msg.seq, attempt, self.attempts);
        }

        Err(io_err!(TimedOut, "no response from server").into())
    }

    fn open_reply(&self, reply: &[u8]) -> Result<Msg> {
        let mut frame = BytesMut::from(reply);
        self.pipeline.decode(&mut frame)?;
        Ok(serialize::read_response(&mut Cursor::new(&frame[..]))?)
    }

    fn accept(&mut self, response: Msg) -> Result<FCall> {
        if let FCall::RError { code } = response.body {
            return Err(code.into());
        }
        if response.command.is_mount() {
            self.conn = response.conn;
        }
        Ok(response.body)
    }

    /// Bytes a request may carry after the header and `fixed` bytes of other fields.
    fn room(&self, fixed: usize) -> usize {
        (self.message_size as usize)
            .saturating_sub(HEADER_SIZE + fixed + self.pipeline.overhead())
            .max(1)
    }

    //
    // Session
    //

    pub async fn capabilities(&mut self) -> Result<Capabilities> {
        rpc!(self, FCall::TCapabilities,
            FCall::RCapabilities { mechanisms, server_key } => Capabilities {
                mechanisms,
                server_key: server_key.0,
            })
    }

    /// Run the key agreement and encrypt everything that follows.
    ///
    /// Leaves an unmounted session behind; follow with [`Client::mount`] or
    /// [`Client::authenticate`].
    pub async fn secure(&mut self, key_bits: u16, block_size: u16) -> Result<()> {
        let handshake = ClientHandshake::new(&DhGroup::default(), key_bits, block_size)?;
        let (public_key, retry) = rpc!(self,
            FCall::TSecureMount {
                public_key: Data(handshake.public_key()?),
                key_bits,
                block_size,
            },
            FCall::RSecureMount { public_key, retry } => (public_key, retry))?;

        let key = handshake.finish(&public_key.0)?;
        let pair = cipher_pair(&key, handshake.block_size())?;
        self.pipeline.install(pair.decrypt, pair.encrypt, pair.overhead);
        self.retry = Duration::from_millis(retry as u64);
        Ok(())
    }

    pub async fn mount(&mut self, path: &str, user: Option<&str>, password: Option<&str>) -> Result<Version> {
        let (version, retry) = rpc!(self,
            FCall::TMount {
                version: PROTOCOL_VERSION,
                path: path.to_owned(),
                user: user.unwrap_or_default().to_owned(),
                password: password.unwrap_or_default().to_owned(),
            },
            FCall::RMount { version, retry } => (version, retry))?;
        self.retry = Duration::from_millis(retry as u64);
        Ok(version)
    }

    /// Mount `path` through SCRAM and check the server's signature.
    ///
    /// With `channel_binding` the exchange is bound to the server key from `Capabilities`.
    pub async fn authenticate(
        &mut self,
        path: &str,
        user: &str,
        password: &str,
        channel_binding: bool,
    ) -> Result<()> {
        let binding = match channel_binding {
            true => Some(self.capabilities().await?.server_key),
            false => None,
        };
        let scram = ScramClient::new(user, password, binding.as_deref());

        let server_first = rpc!(self,
            FCall::TClientFirst {
                path: path.to_owned(),
                message: scram.client_first(),
            },
            FCall::RClientFirst { message } => message)?;
        let (client_final, verifier) = scram.client_final(&server_first)?;
        let server_final = rpc!(self,
            FCall::TClientFinal { message: client_final },
            FCall::RClientFinal { message } => message)?;

        verifier.verify(&server_final)
    }

    /// Close the session. The client falls back to a plain, session-less state.
    pub async fn umount(&mut self) -> Result<()> {
        rpc!(self, FCall::TUmount, FCall::RUmount => ())?;
        self.conn = NO_SESSION;
        self.pipeline = Pipeline::new();
        self.message_size = DEFAULT_MESSAGE_SIZE;
        Ok(())
    }

    /// Ask for a larger (or smaller) message size. Servers without support keep the
    /// default.
    pub async fn negotiate_packet_size(&mut self, size: u16) -> Result<u16> {
        match self.call(FCall::TPacketSize { size }).await {
            Ok(FCall::RPacketSize { size }) => self.message_size = size,
            Ok(other) => return Err(Error::protocol(format!("unexpected response {:?}", other))),
            Err(Error::Unsupported) => debug!("server cannot change the message size"),
            Err(e) => return Err(e),
        }
        Ok(self.message_size)
    }

    pub async fn mounts(&mut self) -> Result<Vec<String>> {
        rpc!(self, FCall::TMounts, FCall::RMounts { mounts } => mounts)
    }

    //
    // Directories
    //

    pub async fn opendir(&mut self, path: &str) -> Result<u8> {
        rpc!(self, FCall::TOpenDir { path: path.to_owned() }, FCall::ROpenDir { handle } => handle)
    }

    /// Next entry name, `None` once the listing is over.
    pub async fn readdir(&mut self, handle: u8) -> Result<Option<String>> {
        match self.call(FCall::TReadDir { handle }).await {
            Ok(FCall::RReadDir { name }) => Ok(Some(name)),
            Ok(other) => Err(Error::protocol(format!("unexpected response {:?}", other))),
            Err(Error::Eof) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn closedir(&mut self, handle: u8) -> Result<()> {
        rpc!(self, FCall::TCloseDir { handle }, FCall::RCloseDir => ())
    }

    pub async fn telldir(&mut self, handle: u8) -> Result<u32> {
        rpc!(self, FCall::TTellDir { handle }, FCall::RTellDir { position } => position)
    }

    pub async fn seekdir(&mut self, handle: u8, position: u32) -> Result<()> {
        rpc!(self, FCall::TSeekDir { handle, position }, FCall::RSeekDir => ())
    }

    pub async fn opendirx(&mut self, path: &str, listing: &ListingOptions) -> Result<u8> {
        rpc!(self,
            FCall::TOpenDirX {
                options: listing.options,
                sort: listing.sort,
                max_results: listing.max_results,
                pattern: listing.pattern.clone(),
                path: path.to_owned(),
            },
            FCall::ROpenDirX { handle } => handle)
    }

    /// Up to `count` entries (zero for as many as fit).
    pub async fn readdirx(&mut self, handle: u8, count: u8) -> Result<DirPage> {
        rpc!(self, FCall::TReadDirX { handle, count },
            FCall::RReadDirX { status, position, entries } => DirPage {
                entries,
                position,
                eof: status.contains(DirStatus::EOF),
            })
    }

    /// Whole listing of `path` through `OpenDirX`/`ReadDirX`.
    pub async fn list(&mut self, path: &str, listing: &ListingOptions) -> Result<Vec<DirEntry>> {
        let handle = self.opendirx(path, listing).await?;
        let mut entries = Vec::new();
        let result = loop {
            match self.readdirx(handle, 0).await {
                Ok(page) => {
                    entries.extend(page.entries);
                    if page.eof {
                        break Ok(entries);
                    }
                }
                Err(e) => break Err(e),
            }
        };
        self.closedir(handle).await?;
        result
    }

    pub async fn mkdir(&mut self, path: &str) -> Result<()> {
        rpc!(self, FCall::TMkDir { path: path.to_owned() }, FCall::RMkDir => ())
    }

    pub async fn rmdir(&mut self, path: &str) -> Result<()> {
        rpc!(self, FCall::TRmDir { path: path.to_owned() }, FCall::RRmDir => ())
    }

    //
    // Files
    //

    pub async fn open(&mut self, path: &str, flags: OpenFlags, mode: u16) -> Result<u8> {
        rpc!(self,
            FCall::TOpen { flags, mode, path: path.to_owned() },
            FCall::ROpen { handle } => handle)
    }

    /// Up to `size` bytes; empty at end of file.
    pub async fn read(&mut self, handle: u8, size: u16) -> Result<Vec<u8>> {
        match self.call(FCall::TRead { handle, size }).await {
            Ok(FCall::RRead { data }) => Ok(data.0),
            Ok(other) => Err(Error::protocol(format!("unexpected response {:?}", other))),
            Err(Error::Eof) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Read from the current position to the end of the file.
    pub async fn read_to_end(&mut self, handle: u8) -> Result<Vec<u8>> {
        let chunk = self.room(RESULT_SIZE + READ_HEADER_SIZE).min(u16::MAX as usize) as u16;
        let mut out = Vec::new();
        loop {
            let data = self.read(handle, chunk).await?;
            if data.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&data);
        }
    }

    /// Write all of `data`, split into messages that fit the negotiated size.
    pub async fn write(&mut self, handle: u8, data: &[u8]) -> Result<usize> {
        let chunk = self.room(1 + 2);
        let mut written = 0;
        for part in data.chunks(chunk) {
            let count = rpc!(self,
                FCall::TWrite { handle, data: Data(part.to_vec()) },
                FCall::RWrite { count } => count as usize)?;
            written += count;
            if count < part.len() {
                break;
            }
        }
        Ok(written)
    }

    pub async fn close(&mut self, handle: u8) -> Result<()> {
        rpc!(self, FCall::TClose { handle }, FCall::RClose => ())
    }

    pub async fn lseek(&mut self, handle: u8, whence: Whence, offset: i32) -> Result<u32> {
        rpc!(self, FCall::TLseek { handle, whence, offset }, FCall::RLseek { position } => position)
    }

    pub async fn stat(&mut self, path: &str) -> Result<Stat> {
        rpc!(self, FCall::TStat { path: path.to_owned() }, FCall::RStat { stat } => stat)
    }

    pub async fn unlink(&mut self, path: &str) -> Result<()> {
        rpc!(self, FCall::TUnlink { path: path.to_owned() }, FCall::RUnlink => ())
    }

    pub async fn chmod(&mut self, path: &str, mode: u16) -> Result<()> {
        rpc!(self, FCall::TChmod { mode, path: path.to_owned() }, FCall::RChmod => ())
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        rpc!(self,
            FCall::TRename { from: from.to_owned(), to: to.to_owned() },
            FCall::RRename => ())
    }

    //
    // Devices and extensions
    //

    pub async fn size(&mut self) -> Result<u32> {
        rpc!(self, FCall::TSize, FCall::RSize { kilobytes } => kilobytes)
    }

    pub async fn free(&mut self) -> Result<u32> {
        rpc!(self, FCall::TFree, FCall::RFree { kilobytes } => kilobytes)
    }

    pub async fn sum(&mut self, algorithm: SumAlgorithm, path: &str) -> Result<String> {
        rpc!(self,
            FCall::TSum { algorithm, path: path.to_owned() },
            FCall::RSum { digest } => digest)
    }

    pub async fn copy(&mut self, from: &str, to: &str, overwrite: bool) -> Result<()> {
        let flags = match overwrite {
            true => CopyFlags::OVERWRITE,
            false => CopyFlags::empty(),
        };
        rpc!(self,
            FCall::TCopy { from: from.to_owned(), to: to.to_owned(), flags },
            FCall::RCopy => ())
    }
}
