use {
    async_trait::async_trait,
    clap::Parser,
    futures::stream::StreamExt,
    log::{debug, info},
    std::{
        io::SeekFrom,
        os::unix::fs::{MetadataExt, PermissionsExt},
        path::PathBuf,
        sync::Arc,
    },
    tnfs::{
        fs::{Authenticator, DirEntryInfo, DirStream, FileCursor, FileSystem, PasswordAuthenticator},
        scram::{DEFAULT_ITERATIONS, Mechanism},
        srv::{Server, ServerConfig, srv_async},
        *,
    },
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    },
    tokio_stream::wrappers::ReadDirStream,
};

mod utils;
use crate::utils::*;

/// A directory of the local file system.
#[derive(Clone)]
struct LocalFs {
    realroot: PathBuf,
}

impl LocalFs {
    fn realpath(&self, path: &str) -> PathBuf {
        self.realroot.join(path.trim_start_matches('/'))
    }

    async fn statvfs(&self, path: PathBuf) -> Result<nix::sys::statvfs::Statvfs> {
        let vfs = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&path))
            .await
            .map_err(join_error)??;
        Ok(vfs)
    }
}

struct LocalFile {
    file: fs::File,
}

#[async_trait]
impl FileCursor for LocalFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let count = self.file.write(buf).await?;
        self.file.flush().await?;
        Ok(count)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file.seek(pos).await?)
    }
}

#[async_trait]
impl FileSystem for LocalFs {
    async fn open(&self, path: &str, flags: OpenFlags, mode: u16) -> Result<Box<dyn FileCursor>> {
        let realpath = self.realpath(path);
        if let Ok(attr) = fs::metadata(&realpath).await {
            if attr.is_dir() {
                return Err(Error::IsADirectory);
            }
        }

        let writable = flags.writable();
        let append = writable && flags.contains(OpenFlags::APPEND);
        let file = fs::OpenOptions::new()
            .read(flags.readable())
            .write(writable && !append)
            .append(append)
            .truncate(writable && !append && flags.contains(OpenFlags::TRUNCATE))
            .create(writable && flags.contains(OpenFlags::CREATE))
            .create_new(writable && flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE))
            .mode((mode & mode::PERMS) as u32)
            .open(&realpath)
            .await?;

        Ok(Box::new(LocalFile { file }))
    }

    async fn list(&self, path: &str) -> Result<DirStream> {
        let entries = ReadDirStream::new(fs::read_dir(self.realpath(path)).await?);

        Ok(entries
            .then(|entry| async move {
                let entry = entry?;
                // Follow symlinks, but keep dangling ones listed
                let attr = match fs::metadata(entry.path()).await {
                    Ok(attr) => attr,
                    Err(_) => entry.metadata().await?,
                };
                Ok::<_, Error>(DirEntryInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    stat: stat_from_attr(&attr),
                })
            })
            .boxed())
    }

    async fn stat(&self, path: &str) -> Result<Stat> {
        let attr = fs::metadata(self.realpath(path)).await?;
        let (uid, gid) = (attr.uid(), attr.gid());
        let (uid_name, gid_name) = tokio::task::spawn_blocking(move || owner_names(uid, gid))
            .await
            .map_err(join_error)?;

        Ok(Stat {
            uid_name,
            gid_name,
            ..stat_from_attr(&attr)
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        Ok(fs::create_dir(self.realpath(path)).await?)
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        Ok(fs::remove_dir(self.realpath(path)).await?)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        Ok(fs::rename(self.realpath(from), self.realpath(to)).await?)
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let realpath = self.realpath(path);
        if fs::symlink_metadata(&realpath).await?.is_dir() {
            return Err(Error::IsADirectory);
        }
        Ok(fs::remove_file(realpath).await?)
    }

    async fn chmod(&self, path: &str, mode: u16) -> Result<()> {
        let perms = PermissionsExt::from_mode((mode & mode::PERMS) as u32);
        Ok(fs::set_permissions(self.realpath(path), perms).await?)
    }

    async fn free(&self, path: &str) -> Result<u32> {
        let vfs = self.statvfs(self.realpath(path)).await?;
        Ok(kilobytes(
            vfs.blocks_available() as u64,
            vfs.fragment_size() as u64,
        ))
    }

    async fn size(&self) -> Result<u32> {
        let vfs = self.statvfs(self.realroot.clone()).await?;
        Ok(kilobytes(vfs.blocks() as u64, vfs.fragment_size() as u64))
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = udp | tcp
    address: String,

    /// Directory to export
    exportdir: PathBuf,

    /// Require a login, given as name:password (repeatable)
    #[arg(long = "user", value_name = "NAME:PASSWORD")]
    users: Vec<String>,

    /// Store user credentials for SCRAM-SHA-512 instead of SCRAM-SHA-256
    #[arg(long)]
    sha512: bool,

    /// PBKDF2 iterations for stored credentials
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: u32,

    /// Retry interval suggested to clients, in milliseconds
    #[arg(long, default_value_t = DEFAULT_RETRY_MS)]
    retry_ms: u16,

    /// Largest message size a client may negotiate
    #[arg(long, default_value_t = u16::MAX)]
    max_message_size: u16,

    /// File holding the server key used for channel binding (random if absent)
    #[arg(long)]
    server_key_file: Option<PathBuf>,
}

fn mechanism(cli: &Cli) -> Mechanism {
    match cli.sha512 {
        true => Mechanism::Sha512,
        false => Mechanism::Sha256,
    }
}

fn authenticator(cli: &Cli) -> Result<Option<Arc<dyn Authenticator>>> {
    if cli.users.is_empty() {
        return Ok(None);
    }

    let mut users = PasswordAuthenticator::new();
    for arg in &cli.users {
        let (name, password) = parse_user(arg)?;
        users.add_user(name, password, mechanism(cli), cli.iterations)?;
        info!("user {} registered for {}", name, mechanism(cli).name());
    }
    let users: Arc<dyn Authenticator> = Arc::new(users);
    Ok(Some(users))
}

async fn build_server(cli: &Cli) -> Result<Server> {
    let config = ServerConfig {
        retry_ms: cli.retry_ms,
        max_message_size: cli.max_message_size,
        scram_mechanism: mechanism(cli),
        iterations: cli.iterations,
        ..Default::default()
    };
    debug!("server config: {:?}", config);
    let backend = Arc::new(LocalFs {
        realroot: cli.exportdir.clone(),
    });

    let mut server = Server::new(config).with_mount("/", backend, authenticator(cli)?);
    if let Some(ref path) = cli.server_key_file {
        let key = fs::read(path).await?;
        if key.is_empty() {
            return res!(io_err!(InvalidData, "server key file is empty"));
        }
        server = server.with_server_key(key);
        info!("server key loaded from {}", path.display());
    }
    Ok(server)
}

async fn tnfsd_main(cli: Cli) -> Result<i32> {
    if !fs::try_exists(&cli.exportdir).await? {
        fs::create_dir_all(&cli.exportdir).await?;
    }
    if !fs::metadata(&cli.exportdir).await?.is_dir() {
        return res!(io_err!(Other, "export must be a directory"));
    }

    let server = build_server(&cli).await?;
    println!("[*] Exporting {}", cli.exportdir.display());
    if !cli.users.is_empty() {
        println!("[*] Logins required for {} user(s)", cli.users.len());
    }
    println!("[*] Ready to accept clients: {}", cli.address);
    srv_async(Arc::new(server), &cli.address).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = tnfsd_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
