//! Asynchronous server side TNFS library.
//!
//! # Protocol
//! TNFS 1.2 over UDP (one message per datagram) or TCP (messages prefixed by a 16-bit
//! little-endian length).
//!
//! A [`Server`] owns the mounts, the live sessions and the command registry. Every inbound
//! frame goes through [`Server::handle_frame`], which is transport independent.

use {
    crate::{
        error::Error,
        fcall::*,
        fs::{Authenticator, FileSystem, Mount},
        handlers, io_err,
        scram::{DEFAULT_ITERATIONS, Mechanism},
        serialize::{self, Decodable, Header},
        session::{MountPoint, Pipeline, Session, SessionTable},
        utils::{self, Result},
    },
    bytes::{BufMut, Bytes, BytesMut},
    futures::{future::BoxFuture, sink::SinkExt, stream::StreamExt},
    log::{debug, error, info, warn},
    rand::RngCore,
    std::{
        collections::{BTreeMap, HashSet},
        io::Cursor,
        sync::{Arc, Mutex as StdMutex, PoisonError},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UdpSocket},
        sync::Mutex,
    },
    tokio_util::codec::length_delimited::LengthDelimitedCodec,
};

/// Largest datagram accepted by the UDP transport
const MAX_DATAGRAM: usize = u16::MAX as usize + 1;

/// Length of the server key announced by `Capabilities`
const SERVER_KEY_LEN: usize = 32;

/// Tunables of a [`Server`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Retry interval suggested to clients, in milliseconds
    pub retry_ms: u16,
    /// Message size of a fresh session
    pub default_message_size: u16,
    /// Upper bound for `PacketSize` negotiation
    pub max_message_size: u16,
    /// SCRAM mechanisms announced by `Capabilities`
    pub mechanisms: Vec<Mechanism>,
    /// Mechanism of the credentials stored on this server. Unknown users are
    /// challenged with it.
    pub scram_mechanism: Mechanism,
    /// Iteration count of the stored credentials, also used for unknown users
    pub iterations: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            retry_ms: DEFAULT_RETRY_MS,
            default_message_size: DEFAULT_MESSAGE_SIZE,
            max_message_size: u16::MAX,
            mechanisms: vec![Mechanism::Sha256, Mechanism::Sha512],
            scram_mechanism: Mechanism::Sha256,
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

/// Per-request state handed to a handler.
pub struct Ctx {
    /// Connection id the response is sent under
    pub conn: u16,
    /// Session of the request, if any
    pub session: Option<Arc<Session>>,
}

/// A command handler.
///
/// Handlers return a typed success response or the most specific [`Error`]; they never
/// build failure responses themselves.
pub type Handler = for<'a> fn(&'a Server, &'a mut Ctx, FCall) -> BoxFuture<'a, Result<FCall>>;

/// A registry entry: preconditions checked before the handler runs.
#[derive(Clone, Copy)]
pub struct Entry {
    pub needs_session: bool,
    pub needs_auth: bool,
    pub handler: Handler,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("needs_session", &self.needs_session)
            .field("needs_auth", &self.needs_auth)
            .finish()
    }
}

/// Mapping from opcodes to handlers, built once and injected into the server.
#[derive(Clone, Debug, Default)]
pub struct Commands {
    entries: BTreeMap<Command, Entry>,
}

impl Commands {
    /// An empty registry; every command is answered with `Nosys`.
    pub fn new() -> Commands {
        Default::default()
    }

    /// Every command this crate implements.
    pub fn standard() -> Commands {
        let mut commands = Commands::new();
        handlers::register(&mut commands);
        commands
    }

    /// Add or replace the entry of a command, returning the previous one.
    pub fn register(&mut self, command: Command, entry: Entry) -> Option<Entry> {
        self.entries.insert(command, entry)
    }

    pub fn unregister(&mut self, command: Command) -> Option<Entry> {
        self.entries.remove(&command)
    }

    pub fn get(&self, command: Command) -> Option<&Entry> {
        self.entries.get(&command)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A TNFS server: mounts, sessions and the command registry.
pub struct Server {
    config: ServerConfig,
    mounts: Vec<Arc<Mount>>,
    sessions: SessionTable,
    commands: Commands,
    server_key: Vec<u8>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        let mut server_key = vec![0; SERVER_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut server_key);

        Server {
            config,
            mounts: Vec::new(),
            sessions: SessionTable::new(),
            commands: Commands::standard(),
            server_key,
        }
    }

    /// Expose `fs` under `path`. A later mount with the same path replaces the earlier one.
    pub fn with_mount(
        mut self,
        path: &str,
        fs: Arc<dyn FileSystem>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Server {
        let path = utils::normalize_path(path).unwrap_or_else(|| "/".to_owned());
        self.mounts.retain(|m| m.path != path);
        info!("mount {} ({})", path, match authenticator {
            Some(_) => "authenticated",
            None => "anonymous",
        });
        self.mounts.push(Arc::new(Mount {
            path,
            fs,
            authenticator,
        }));
        self
    }

    /// Pin the server key instead of the random one, so channel bindings survive restarts.
    pub fn with_server_key(mut self, key: Vec<u8>) -> Server {
        self.server_key = key;
        self
    }

    pub fn with_commands(mut self, commands: Commands) -> Server {
        self.commands = commands;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn server_key(&self) -> &[u8] {
        &self.server_key
    }

    /// Paths of the configured mounts
    pub fn mounts(&self) -> impl Iterator<Item = &str> {
        self.mounts.iter().map(|m| m.path.as_str())
    }

    /// Pick the mount with the longest path covering `path`; the rest of `path` becomes
    /// the session root inside it.
    pub fn find_mount(&self, path: &str) -> Option<MountPoint> {
        let path = utils::normalize_path(path)?;
        self.mounts
            .iter()
            .filter_map(|m| {
                let rest = match m.path.as_str() {
                    "/" => path.as_str(),
                    p if p == path => "/",
                    p => path.strip_prefix(p).filter(|r| r.starts_with('/'))?,
                };
                Some((m, rest))
            })
            .max_by_key(|(m, _)| m.path.len())
            .map(|(m, rest)| MountPoint {
                mount: m.clone(),
                root: rest.to_owned(),
            })
    }

    /// Give a mount-type request its session.
    ///
    /// A session without a mount (left by a secure mount) is bound in place, so the
    /// cipher carries over. Otherwise a new session is created, inheriting the transforms
    /// of the session the request arrived on.
    pub fn attach(&self, ctx: &mut Ctx, mount: Option<MountPoint>) -> Result<Arc<Session>> {
        let session = match ctx.session.take() {
            Some(current) if current.mount_point().is_none() => {
                if let Some(mount) = mount {
                    current.bind(mount);
                }
                current
            }
            Some(current) => {
                self.sessions
                    .create(mount, current.pipeline(), current.message_size())?
            }
            None => self.sessions.create(
                mount,
                Pipeline::new(),
                self.config.default_message_size,
            )?,
        };

        ctx.conn = session.id();
        ctx.session = Some(session.clone());
        Ok(session)
    }

    /// Drop a session and everything it holds.
    pub fn close_session(&self, id: u16) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Handle one inbound frame and produce the response frame, if any.
    ///
    /// Frames too short to carry a header, or which the session cipher rejects, are
    /// dropped without an answer.
    pub async fn handle_frame(&self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < HEADER_SIZE {
            debug!("dropping runt frame of {} bytes", frame.len());
            return None;
        }

        let conn = serialize::peek_conn(frame)?;
        let session = self.sessions.get(conn);
        let pipeline = session.as_ref().map(|s| s.pipeline()).unwrap_or_default();

        let mut buf = BytesMut::from(frame);
        if let Err(e) = pipeline.decode(&mut buf) {
            warn!("session {:#06x}: undecodable frame: {}", conn, e);
            return None;
        }

        let mut reader = Cursor::new(&buf[..]);
        let header = match Header::decode(&mut reader) {
            Ok(header) => header,
            Err(e) => {
                warn!("session {:#06x}: bad header: {}", conn, e);
                return None;
            }
        };

        let reply = |code: ResultCode| self.error_frame(&header, code, &pipeline);

        let Ok(command) = header.command() else {
            debug!("\t← unknown command {:#04x}", header.command);
            return reply(ResultCode::Nosys);
        };
        let Some(entry) = self.commands.get(command).copied() else {
            debug!("\t← unregistered command {:?}", command);
            return reply(ResultCode::Nosys);
        };
        let body = match serialize::read_request_body(command, &mut reader) {
            Ok(body) => body,
            Err(e) => {
                warn!("{:?}: malformed request: {}", command, e);
                return reply(ResultCode::Proto);
            }
        };
        debug!("\t← {:#06x} {} {:?}", header.conn, header.seq, body.redacted());

        if entry.needs_session && session.is_none() {
            return reply(ResultCode::Perm);
        }
        if entry.needs_auth && !session.as_ref().is_some_and(|s| s.is_authenticated()) {
            return reply(ResultCode::Perm);
        }

        let serial = session.clone();
        let _guard = match serial {
            Some(ref s) => Some(s.serial.lock().await),
            None => None,
        };

        let mut ctx = Ctx { conn, session };
        let body = (entry.handler)(self, &mut ctx, body)
            .await
            .unwrap_or_else(|e| {
                match e {
                    Error::Io(_) | Error::Crypto(_) => error!("{:?}: {}", command, e),
                    _ => warn!("{:?}: {}", command, e),
                }
                FCall::RError { code: e.code() }
            });

        let response = Msg {
            conn: ctx.conn,
            seq: header.seq,
            command,
            body,
        };
        debug!("\t→ {:#06x} {} {:?}", response.conn, response.seq, response.body.redacted());

        let mut writer = BytesMut::with_capacity(self.config.default_message_size as usize).writer();
        if let Err(e) = serialize::write_msg(&mut writer, &response) {
            error!("Failed to serialize response for seq {}: {:?}", header.seq, e);
            return reply(ResultCode::Io);
        }
        self.seal(writer.into_inner(), &pipeline)
    }

    fn error_frame(&self, header: &Header, code: ResultCode, pipeline: &Pipeline) -> Option<Vec<u8>> {
        let mut writer = BytesMut::with_capacity(HEADER_SIZE + RESULT_SIZE).writer();
        if let Err(e) = serialize::write_error(&mut writer, header, code) {
            error!("Failed to serialize error response: {:?}", e);
            return None;
        }
        self.seal(writer.into_inner(), pipeline)
    }

    fn seal(&self, mut frame: BytesMut, pipeline: &Pipeline) -> Option<Vec<u8>> {
        match pipeline.encode(&mut frame) {
            Ok(()) => Some(frame.to_vec()),
            Err(e) => {
                error!("Failed to encrypt response: {}", e);
                None
            }
        }
    }
}

/// Serve datagrams from an already bound socket until an I/O error occurs.
pub async fn serve_udp(server: Arc<Server>, socket: UdpSocket) -> Result<()> {
    let socket = Arc::new(socket);
    let mut buf = vec![0; MAX_DATAGRAM];

    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let frame = buf[..len].to_vec();
        let (server, socket) = (server.clone(), socket.clone());

        tokio::spawn(async move {
            if let Some(reply) = server.handle_frame(&frame).await {
                if let Err(e) = socket.send_to(&reply, peer).await {
                    error!("Failed to send response to {}: {:?}", peer, e);
                }
            }
        });
    }
}

/// Framing of the TCP transport: a 16-bit little-endian length before each message.
pub fn tcp_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(2)
        .little_endian()
        .max_frame_length(MAX_DATAGRAM)
        .new_codec()
}

/// Serve one TCP stream. Sessions created through it are closed when it ends.
pub async fn dispatch<Reader, Writer>(server: Arc<Server>, reader: Reader, writer: Writer) -> Result<()>
where
    Reader: 'static + AsyncRead + Send + std::marker::Unpin,
    Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
{
    let mut framedread = tokio_util::codec::FramedRead::new(reader, tcp_codec());
    let framedwrite = Arc::new(Mutex::new(tokio_util::codec::FramedWrite::new(
        writer,
        tcp_codec(),
    )));
    let opened = Arc::new(StdMutex::new(HashSet::new()));

    while let Some(bytes) = framedread.next().await {
        let frame = bytes?;
        let server = server.clone();
        let framedwrite = framedwrite.clone();
        let opened = opened.clone();

        tokio::spawn(async move {
            let Some(reply) = server.handle_frame(&frame).await else {
                return;
            };
            if let Some(conn) = serialize::peek_conn(&reply).filter(|c| *c != NO_SESSION) {
                opened
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(conn);
            }

            let mut framedwrite_locked = framedwrite.lock().await;
            if let Err(e) = framedwrite_locked.send(Bytes::from(reply)).await {
                error!("Failed to send response: {:?}", e);
            }
        });
    }

    let opened: Vec<u16> = opened
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .collect();
    for conn in opened {
        server.close_session(conn);
    }
    Ok(())
}

/// Accept TCP connections from an already bound listener until an I/O error occurs.
pub async fn serve_tcp(server: Arc<Server>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let server = server.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            if let Err(e) = dispatch(server, readhalf, writehalf).await {
                error!("Error: {}: {:?}", e, e);
            }
            info!("closed: {:?}", peer);
        });
    }
}

async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }
    Ok(())
}

/// Serve on `addr`, given as `proto!host!port` with `udp` or `tcp`, until SIGTERM or
/// SIGINT.
pub async fn srv_async(server: Arc<Server>, addr: &str) -> Result<()> {
    let (proto, listen_addr) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    let serving = async {
        match proto {
            "udp" => {
                let socket = UdpSocket::bind(&listen_addr).await?;
                info!("listening on udp {}", socket.local_addr()?);
                serve_udp(server, socket).await
            }
            "tcp" => {
                let listener = TcpListener::bind(&listen_addr).await?;
                info!("listening on tcp {}", listener.local_addr()?);
                serve_tcp(server, listener).await
            }
            _ => Err(Error::from(io_err!(InvalidInput, "Protocol not supported"))),
        }
    };

    tokio::select! {
        res = serving => res,
        res = shutdown_signal() => {
            res?;
            info!("Server shutdown complete");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::MemFs;

    fn server() -> Server {
        Server::new(ServerConfig::default())
            .with_mount("/", Arc::new(MemFs::new()), None)
            .with_mount("/games/", Arc::new(MemFs::new()), None)
    }

    fn frame(conn: u16, body: FCall) -> Vec<u8> {
        let mut buf = Vec::new();
        serialize::write_msg(&mut buf, &Msg::request(conn, 7, body).unwrap()).unwrap();
        buf
    }

    fn decode(reply: &[u8]) -> Msg {
        serialize::read_response(&mut Cursor::new(reply)).unwrap()
    }

    #[test]
    fn longest_mount_wins() {
        let srv = server();
        let m = srv.find_mount("/games/arcade").unwrap();
        assert_eq!((m.mount.path.as_str(), m.root.as_str()), ("/games", "/arcade"));
        let m = srv.find_mount("/games").unwrap();
        assert_eq!(m.root, "/");
        let m = srv.find_mount("/gamesx").unwrap();
        assert_eq!((m.mount.path.as_str(), m.root.as_str()), ("/", "/gamesx"));
        assert!(srv.find_mount("/..").is_none());
        assert_eq!(srv.mounts().collect::<Vec<_>>(), vec!["/", "/games"]);
    }

    #[test]
    fn standard_registry_covers_every_command() {
        let commands = Commands::standard();
        assert_eq!(commands.len(), 30);
        let mount = commands.get(Command::Mount).unwrap();
        assert!(!mount.needs_session && !mount.needs_auth);
        let fin = commands.get(Command::ClientFinal).unwrap();
        assert!(fin.needs_session && !fin.needs_auth);
        let read = commands.get(Command::Read).unwrap();
        assert!(read.needs_session && read.needs_auth);
    }

    #[tokio::test]
    async fn runt_frames_are_dropped() {
        assert!(server().handle_frame(&[0, 0, 1]).await.is_none());
    }

    #[tokio::test]
    async fn unknown_command_is_nosys() {
        let reply = server().handle_frame(&[0, 0, 9, 0x7f]).await.unwrap();
        assert_eq!(reply, vec![0, 0, 9, 0x7f, ResultCode::Nosys as u8]);
    }

    #[tokio::test]
    async fn unregistered_command_is_nosys() {
        let mut commands = Commands::standard();
        commands.unregister(Command::Mounts);
        let srv = server().with_commands(commands);
        let reply = srv.handle_frame(&frame(0, FCall::TMounts)).await.unwrap();
        assert_eq!(decode(&reply).body.result(), ResultCode::Nosys);
    }

    #[tokio::test]
    async fn truncated_body_is_proto() {
        let mut buf = frame(0, FCall::TStat { path: "/x".into() });
        buf.pop();
        let reply = server().handle_frame(&buf).await.unwrap();
        assert_eq!(decode(&reply).body.result(), ResultCode::Proto);
    }

    #[tokio::test]
    async fn data_commands_need_a_session() {
        let srv = server();
        let reply = srv
            .handle_frame(&frame(0x1234, FCall::TStat { path: "/".into() }))
            .await
            .unwrap();
        let msg = decode(&reply);
        assert_eq!(msg.conn, 0x1234);
        assert_eq!(msg.seq, 7);
        assert_eq!(msg.body.result(), ResultCode::Perm);
        assert!(srv.sessions().is_empty());
    }

    #[tokio::test]
    async fn mount_then_umount() {
        let srv = server();
        let reply = srv
            .handle_frame(&frame(
                NO_SESSION,
                FCall::TMount {
                    version: PROTOCOL_VERSION,
                    path: "/".into(),
                    user: String::new(),
                    password: String::new(),
                },
            ))
            .await
            .unwrap();
        let msg = decode(&reply);
        assert_ne!(msg.conn, NO_SESSION);
        assert_eq!(
            msg.body,
            FCall::RMount {
                version: PROTOCOL_VERSION,
                retry: DEFAULT_RETRY_MS
            }
        );
        assert_eq!(srv.sessions().len(), 1);

        let reply = srv.handle_frame(&frame(msg.conn, FCall::TUmount)).await.unwrap();
        assert_eq!(decode(&reply).body, FCall::RUmount);
        assert!(srv.sessions().is_empty());

        let reply = srv.handle_frame(&frame(msg.conn, FCall::TUmount)).await.unwrap();
        assert_eq!(decode(&reply).body, FCall::RUmount);
    }
}
