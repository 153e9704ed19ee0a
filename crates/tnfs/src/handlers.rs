//! Command handlers and the standard registry.
//!
//! Each handler takes the decoded request and returns the typed response. Preconditions
//! (session present, session authenticated) are declared in [`register`] and checked by
//! the dispatcher before a handler runs.

use {
    crate::{
        error::Error,
        fcall::*,
        fs::{FileCursor, FileSystem, Principal},
        handle::{DirHandle, FileHandle, ListingOptions, open_listing},
        scram::{CHANNEL_BINDING, ChannelBinding, ClientFirst, ScramPrincipal, ScramServerState},
        secure,
        session::{AuthState, MountPoint, Session},
        srv::{Commands, Ctx, Entry, Server},
        utils::{self, Result},
    },
    futures::future::BoxFuture,
    log::{debug, info, warn},
    sha2::{Digest, Sha224, Sha256, Sha384, Sha512},
    std::{io::SeekFrom, sync::Arc},
};

/// Transfer size used by server side streaming (`Sum`, `Copy`)
const CHUNK_SIZE: usize = 8192;

macro_rules! entry {
    ($handler:ident, session: $session:expr, auth: $auth:expr) => {{
        fn call<'a>(srv: &'a Server, ctx: &'a mut Ctx, f: FCall) -> BoxFuture<'a, Result<FCall>> {
            Box::pin($handler(srv, ctx, f))
        }
        Entry {
            needs_session: $session,
            needs_auth: $auth,
            handler: call,
        }
    }};
}

macro_rules! expect {
    ($call:expr, $pat:pat) => {
        let $pat = $call else {
            return Err(Error::protocol("unexpected message"));
        };
    };
}

/// Register every standard command.
///
/// Mount-type commands and the session-less queries run without a session. `ClientFinal`
/// needs the session its `ClientFirst` created but, naturally, no authentication yet.
pub fn register(commands: &mut Commands) {
    use crate::Command::*;

    #[rustfmt::skip]
    let table = [
        (Mount,        entry!(mount,         session: false, auth: false)),
        (Umount,       entry!(umount,        session: false, auth: false)),
        (Capabilities, entry!(capabilities,  session: false, auth: false)),
        (ClientFirst,  entry!(client_first,  session: false, auth: false)),
        (SecureMount,  entry!(secure_mount,  session: false, auth: false)),
        (Mounts,       entry!(mounts,        session: false, auth: false)),
        (ClientFinal,  entry!(client_final,  session: true,  auth: false)),
        (OpenDir,      entry!(opendir,       session: true,  auth: true)),
        (ReadDir,      entry!(readdir,       session: true,  auth: true)),
        (CloseDir,     entry!(closedir,      session: true,  auth: true)),
        (MkDir,        entry!(mkdir,         session: true,  auth: true)),
        (RmDir,        entry!(rmdir,         session: true,  auth: true)),
        (TellDir,      entry!(telldir,       session: true,  auth: true)),
        (SeekDir,      entry!(seekdir,       session: true,  auth: true)),
        (OpenDirX,     entry!(opendirx,      session: true,  auth: true)),
        (ReadDirX,     entry!(readdirx,      session: true,  auth: true)),
        (Read,         entry!(read,          session: true,  auth: true)),
        (Write,        entry!(write,         session: true,  auth: true)),
        (Close,        entry!(close,         session: true,  auth: true)),
        (Stat,         entry!(stat,          session: true,  auth: true)),
        (Lseek,        entry!(lseek,         session: true,  auth: true)),
        (Unlink,       entry!(unlink,        session: true,  auth: true)),
        (Chmod,        entry!(chmod,         session: true,  auth: true)),
        (Rename,       entry!(rename,        session: true,  auth: true)),
        (Open,         entry!(open,          session: true,  auth: true)),
        (Size,         entry!(size,          session: true,  auth: true)),
        (Free,         entry!(free,          session: true,  auth: true)),
        (Sum,          entry!(sum,           session: true,  auth: true)),
        (Copy,         entry!(copy,          session: true,  auth: true)),
        (PacketSize,   entry!(packet_size,   session: true,  auth: true)),
    ];

    for (command, entry) in table {
        commands.register(command, entry);
    }
}

fn session(ctx: &Ctx) -> Result<Arc<Session>> {
    ctx.session.clone().ok_or(Error::NotPermitted)
}

fn backend(session: &Session) -> Result<Arc<dyn FileSystem>> {
    Ok(session.mount_point().ok_or(Error::NotPermitted)?.mount.fs.clone())
}

fn non_empty(s: &str) -> Option<&str> {
    Some(s).filter(|s| !s.is_empty())
}

/// Find the mount for a client path and make sure the session root is a directory.
async fn locate(srv: &Server, path: &str) -> Result<MountPoint> {
    let mount_point = srv.find_mount(path).ok_or(Error::NotFound)?;
    if !mount_point.mount.fs.stat(&mount_point.root).await?.is_dir() {
        return Err(Error::NotADirectory);
    }
    Ok(mount_point)
}

//
// Session
//

async fn mount(srv: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TMount { version, path, user, password });
    debug!("mount {:?} by client {}.{}", path, version.major, version.minor);

    let mount_point = locate(srv, &path).await?;
    let principal = match mount_point.mount.authenticator {
        None => Principal::anonymous(),
        Some(ref auth) => auth
            .authenticate(
                mount_point.mount.fs.as_ref(),
                non_empty(&user),
                non_empty(&password),
            )
            .await?
            .ok_or(Error::AuthenticationFailed)?,
    };

    let session = srv.attach(ctx, Some(mount_point))?;
    info!("session {:#06x} mounted {:?} as {}", session.id(), path, principal.name);
    *session.auth() = AuthState::Authenticated(principal);

    Ok(FCall::RMount {
        version: PROTOCOL_VERSION,
        retry: srv.config().retry_ms,
    })
}

async fn umount(srv: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TUmount);
    if let Some(session) = ctx.session.take() {
        srv.close_session(session.id());
    }
    Ok(FCall::RUmount)
}

//
// Directories
//

async fn open_dir_handle(ctx: &Ctx, path: &str, listing: ListingOptions) -> Result<u8> {
    let session = session(ctx)?;
    let path = session.resolve(path)?;
    let stream = open_listing(backend(&session)?.as_ref(), &path, &listing).await?;
    session.dirs.insert(DirHandle::new(path, listing, stream))
}

async fn opendir(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TOpenDir { path });
    let handle = open_dir_handle(ctx, &path, ListingOptions::plain()).await?;
    Ok(FCall::ROpenDir { handle })
}

async fn opendirx(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(
        call,
        FCall::TOpenDirX {
            options,
            sort,
            max_results,
            pattern,
            path,
        }
    );
    let listing = ListingOptions {
        options,
        sort,
        max_results,
        pattern,
    };
    let handle = open_dir_handle(ctx, &path, listing).await?;
    Ok(FCall::ROpenDirX { handle })
}

async fn readdir(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TReadDir { handle });
    let dir = session(ctx)?.dirs.get(handle)?;
    let entry = dir.lock().await.next_entry().await?;
    Ok(FCall::RReadDir { name: entry.name })
}

async fn readdirx(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TReadDirX { handle, count });
    let session = session(ctx)?;
    let budget = session.payload_budget(READDIRX_HEADER_SIZE);

    let dir = session.dirs.get(handle)?;
    let mut dir = dir.lock().await;
    let position = dir.wire_position();
    let (entries, status) = dir.read_page(count, budget).await?;

    Ok(FCall::RReadDirX {
        status,
        position,
        entries,
    })
}

async fn closedir(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TCloseDir { handle });
    session(ctx)?.dirs.remove(handle)?;
    Ok(FCall::RCloseDir)
}

async fn telldir(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TTellDir { handle });
    let dir = session(ctx)?.dirs.get(handle)?;
    let position = dir.lock().await.position();
    Ok(FCall::RTellDir { position })
}

async fn seekdir(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TSeekDir { handle, position });
    let session = session(ctx)?;
    let fs = backend(&session)?;

    let dir = session.dirs.get(handle)?;
    let mut dir = dir.lock().await;
    let stream = open_listing(fs.as_ref(), &dir.path, &dir.listing).await?;
    dir.rewind(stream, position).await?;
    Ok(FCall::RSeekDir)
}

async fn mkdir(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TMkDir { path });
    let session = session(ctx)?;
    backend(&session)?.mkdir(&session.resolve(&path)?).await?;
    Ok(FCall::RMkDir)
}

async fn rmdir(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TRmDir { path });
    let session = session(ctx)?;
    let target = session.resolve(&path)?;
    if utils::normalize_path(&path).as_deref() == Some("/") {
        return Err(Error::AccessDenied);
    }
    backend(&session)?.rmdir(&target).await?;
    Ok(FCall::RRmDir)
}

//
// Files
//

async fn open(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TOpen { flags, mode, path });
    let session = session(ctx)?;
    let path = session.resolve(&path)?;
    if !flags.readable() && !flags.writable() {
        return Err(Error::invalid("open without access mode"));
    }

    let cursor = backend(&session)?.open(&path, flags, mode).await?;
    let handle = session.files.insert(FileHandle::new(
        path,
        cursor,
        session.message_size() as usize,
    ))?;
    Ok(FCall::ROpen { handle })
}

async fn read(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TRead { handle, size });
    let session = session(ctx)?;
    let size = (size as usize).min(session.payload_budget(READ_HEADER_SIZE));

    let file = session.files.get(handle)?;
    let data = file.lock().await.read(size).await?;
    Ok(FCall::RRead { data: Data(data) })
}

async fn write(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TWrite { handle, data });
    let file = session(ctx)?.files.get(handle)?;
    let count = file.lock().await.write(&data.0).await?;
    Ok(FCall::RWrite {
        count: count as u16,
    })
}

async fn close(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TClose { handle });
    session(ctx)?.files.remove(handle)?;
    Ok(FCall::RClose)
}

async fn lseek(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TLseek { handle, whence, offset });
    let pos = match whence {
        Whence::Set => SeekFrom::Start(
            u64::try_from(offset).map_err(|_| Error::invalid("negative absolute offset"))?,
        ),
        Whence::Cur => SeekFrom::Current(offset as i64),
        Whence::End => SeekFrom::End(offset as i64),
    };

    let file = session(ctx)?.files.get(handle)?;
    let position = file.lock().await.seek(pos).await?;
    Ok(FCall::RLseek {
        position: u32::try_from(position).map_err(|_| Error::invalid("position out of range"))?,
    })
}

async fn stat(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TStat { path });
    let session = session(ctx)?;
    let stat = backend(&session)?.stat(&session.resolve(&path)?).await?;
    Ok(FCall::RStat { stat })
}

async fn unlink(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TUnlink { path });
    let session = session(ctx)?;
    backend(&session)?.unlink(&session.resolve(&path)?).await?;
    Ok(FCall::RUnlink)
}

async fn chmod(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TChmod { mode, path });
    let session = session(ctx)?;
    backend(&session)?
        .chmod(&session.resolve(&path)?, mode & mode::PERMS)
        .await?;
    Ok(FCall::RChmod)
}

async fn rename(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TRename { from, to });
    let session = session(ctx)?;
    let (from, to) = (session.resolve(&from)?, session.resolve(&to)?);
    backend(&session)?.rename(&from, &to).await?;
    Ok(FCall::RRename)
}

//
// Devices
//

async fn size(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TSize);
    let session = session(ctx)?;
    let kilobytes = backend(&session)?.size().await?;
    Ok(FCall::RSize { kilobytes })
}

async fn free(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TFree);
    let session = session(ctx)?;
    let kilobytes = backend(&session)?.free(&session.resolve("/")?).await?;
    Ok(FCall::RFree { kilobytes })
}

//
// Extensions
//

async fn capabilities(srv: &Server, _: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TCapabilities);
    let mechanisms = srv
        .config()
        .mechanisms
        .iter()
        .flat_map(|m| [m.name().to_owned(), m.plus_name()])
        .collect();
    Ok(FCall::RCapabilities {
        mechanisms,
        server_key: Data(srv.server_key().to_vec()),
    })
}

async fn mounts(srv: &Server, _: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TMounts);
    Ok(FCall::RMounts {
        mounts: srv.mounts().map(str::to_owned).collect(),
    })
}

async fn client_first(srv: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TClientFirst { path, message });
    let mount_point = locate(srv, &path).await?;

    let client_first = ClientFirst::parse(&message).map_err(|e| {
        debug!("rejecting client-first: {}", e);
        Error::AuthenticationFailed
    })?;
    match client_first.binding {
        ChannelBinding::None => {}
        ChannelBinding::Bound(ref name) if name == CHANNEL_BINDING => {}
        // The client thinks we cannot bind, yet we announced a binding type
        ChannelBinding::Unused | ChannelBinding::Bound(_) => {
            return Err(Error::AuthenticationFailed);
        }
    }

    let record = match mount_point.mount.authenticator {
        Some(ref auth) => auth.scram_principal(&client_first.user).await?,
        None => None,
    };
    let config = srv.config();
    let principal = record
        .filter(|p| config.mechanisms.contains(&p.mechanism))
        .unwrap_or_else(|| {
            ScramPrincipal::fake(&client_first.user, config.scram_mechanism, config.iterations)
        });

    let (state, server_first) = ScramServerState::start(client_first, principal);
    let session = srv.attach(ctx, Some(mount_point))?;
    debug!("session {:#06x}: SCRAM started for {}", session.id(), state.user());
    *session.auth() = AuthState::FirstSent(Box::new(state));

    Ok(FCall::RClientFirst {
        message: server_first,
    })
}

async fn client_final(srv: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TClientFinal { message });
    let session = session(ctx)?;

    let state = {
        let mut auth = session.auth();
        match std::mem::take(&mut *auth) {
            AuthState::FirstSent(state) => state,
            other => {
                *auth = other;
                return Err(Error::AuthenticationFailed);
            }
        }
    };
    let user = state.user().to_owned();

    match state.finish(&message, srv.server_key()) {
        Ok((principal, server_final)) => {
            info!("session {:#06x} authenticated as {}", session.id(), user);
            *session.auth() = AuthState::Authenticated(Principal {
                name: principal.name,
            });
            Ok(FCall::RClientFinal {
                message: server_final,
            })
        }
        Err(e) => {
            warn!("session {:#06x}: authentication of {} failed: {}", session.id(), user, e);
            *session.auth() = AuthState::Failed;
            srv.close_session(session.id());
            Err(Error::AuthenticationFailed)
        }
    }
}

async fn secure_mount(srv: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(
        call,
        FCall::TSecureMount {
            public_key,
            key_bits,
            block_size,
        }
    );

    let agreement = secure::server_agree(&public_key.0, key_bits, block_size)?;
    let pair = secure::cipher_pair(&agreement.key, block_size)?;

    let session = srv.attach(ctx, None)?;
    session.install(pair.decrypt, pair.encrypt, pair.overhead);
    info!(
        "session {:#06x} secured ({} bit key, {} byte blocks)",
        session.id(),
        key_bits,
        block_size
    );

    Ok(FCall::RSecureMount {
        public_key: Data(agreement.public_key),
        retry: srv.config().retry_ms,
    })
}

async fn digest<D: Digest + Send>(file: &mut dyn FileCursor) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0; CHUNK_SIZE];
    loop {
        match file.read(&mut buf).await? {
            0 => break,
            n => hasher.update(&buf[..n]),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn sum(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TSum { algorithm, path });
    let session = session(ctx)?;
    let mut file = backend(&session)?
        .open(&session.resolve(&path)?, OpenFlags::RDONLY, 0)
        .await?;

    let digest = match algorithm {
        SumAlgorithm::Sha224 => digest::<Sha224>(file.as_mut()).await?,
        SumAlgorithm::Sha256 => digest::<Sha256>(file.as_mut()).await?,
        SumAlgorithm::Sha384 => digest::<Sha384>(file.as_mut()).await?,
        SumAlgorithm::Sha512 => digest::<Sha512>(file.as_mut()).await?,
    };
    Ok(FCall::RSum { digest })
}

async fn copy(_: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TCopy { from, to, flags });
    let session = session(ctx)?;
    let fs = backend(&session)?;
    let (from, to) = (session.resolve(&from)?, session.resolve(&to)?);
    if from == to {
        return Err(Error::invalid("copy onto itself"));
    }

    let source = fs.stat(&from).await?;
    if source.is_dir() {
        return Err(Error::IsADirectory);
    }
    if !flags.contains(CopyFlags::OVERWRITE) && fs.stat(&to).await.is_ok() {
        return Err(Error::AlreadyExists);
    }

    let mut reader = fs.open(&from, OpenFlags::RDONLY, 0).await?;
    let mut writer = fs
        .open(
            &to,
            OpenFlags::WRONLY | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            source.mode & mode::PERMS,
        )
        .await?;

    let mut buf = vec![0; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let mut written = 0;
        while written < n {
            match writer.write(&buf[written..n]).await? {
                0 => return Err(Error::from(crate::io_err!(WriteZero, "copy stalled"))),
                w => written += w,
            }
        }
    }
    Ok(FCall::RCopy)
}

async fn packet_size(srv: &Server, ctx: &mut Ctx, call: FCall) -> Result<FCall> {
    expect!(call, FCall::TPacketSize { size });
    let session = session(ctx)?;
    let size = size.clamp(MIN_MESSAGE_SIZE, srv.config().max_message_size.max(MIN_MESSAGE_SIZE));
    session.set_message_size(size);
    debug!("session {:#06x}: message size {}", session.id(), size);
    Ok(FCall::RPacketSize { size })
}
