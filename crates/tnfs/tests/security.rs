use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tnfs::{
    client::{Client, Loopback, Transport},
    fs::{Authenticator, PasswordAuthenticator, Principal},
    memfs::MemFs,
    scram::{Mechanism, ScramClient},
    secure::{ClientHandshake, DhGroup},
    srv::{Server, ServerConfig},
    *,
};

const ITERATIONS: u32 = 256;

fn users() -> Arc<dyn Authenticator> {
    Arc::new(
        PasswordAuthenticator::new()
            .with_user("alice", "wonderland", Mechanism::Sha256, ITERATIONS)
            .unwrap()
            .with_user("bob", "builder", Mechanism::Sha512, ITERATIONS)
            .unwrap(),
    )
}

fn guarded(config: ServerConfig) -> Arc<Server> {
    Arc::new(Server::new(config).with_mount("/", Arc::new(MemFs::new()), Some(users())))
}

fn open_server() -> Arc<Server> {
    Arc::new(Server::new(ServerConfig::default()).with_mount("/", Arc::new(MemFs::new()), None))
}

/// Loopback that keeps a copy of every frame in both directions.
struct Recording {
    inner: Loopback,
    frames: Mutex<Vec<Vec<u8>>>,
}

impl Recording {
    fn new(server: Arc<Server>) -> Recording {
        Recording {
            inner: Loopback::new(server),
            frames: Default::default(),
        }
    }

    fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for Recording {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        self.frames.lock().unwrap().push(frame.to_vec());
        self.inner.send(frame).await
    }

    async fn recv(&self, wait: Duration) -> Result<Option<Bytes>> {
        let frame = self.inner.recv(wait).await?;
        if let Some(ref frame) = frame {
            self.frames.lock().unwrap().push(frame.to_vec());
        }
        Ok(frame)
    }
}

async fn client_first(client: &mut Client<Loopback>, message: String) -> Result<String> {
    match client.call(FCall::TClientFirst { path: "/".into(), message }).await? {
        FCall::RClientFirst { message } => Ok(message),
        other => panic!("unexpected {:?}", other),
    }
}

async fn client_final(client: &mut Client<Loopback>, message: String) -> Result<String> {
    match client.call(FCall::TClientFinal { message }).await? {
        FCall::RClientFinal { message } => Ok(message),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn secure_channel_hides_payloads() {
    let server = open_server();
    let mut client = Client::new(Recording::new(server.clone()));
    client.secure(128, 64).await.unwrap();
    assert!(client.is_secure());
    client.mount("/", None, None).await.unwrap();
    assert_eq!(server.sessions().len(), 1);
    let conn = client.conn();

    let secret = b"attack at dawn and bring the floppy disks";
    let flags = OpenFlags::RDWR | OpenFlags::CREATE;
    let h = client.open("/plans.txt", flags, 0o600).await.unwrap();
    client.write(h, secret).await.unwrap();
    client.lseek(h, Whence::Set, 0).await.unwrap();
    assert_eq!(client.read_to_end(h).await.unwrap(), secret.to_vec());
    client.close(h).await.unwrap();

    let frames = client.transport().frames();
    // The key exchange itself travels in the clear
    assert_eq!(&frames[0][..2], &[0, 0]);
    for frame in &frames[1..] {
        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]), conn);
    }
    for frame in &frames[2..] {
        assert_eq!((frame.len() - 2) % 64, 0);
        assert!(!frame.windows(secret.len()).any(|w| w == secret));
        assert!(!frame.windows(9).any(|w| w == b"plans.txt"));
    }
}

#[tokio::test]
async fn repeated_secure_mount_stacks_ciphers() {
    let server = open_server();
    let mut client = Client::new(Loopback::new(server.clone()));
    client.secure(128, 8).await.unwrap();
    client.mount("/", None, None).await.unwrap();
    client.mkdir("/outer").await.unwrap();

    client.secure(256, 16).await.unwrap();
    client.mount("/", None, None).await.unwrap();
    assert!(client.stat("/outer").await.unwrap().is_dir());
    assert_eq!(server.sessions().len(), 2);
}

#[tokio::test]
async fn secure_mount_parameters_are_validated() {
    let server = open_server();
    let mut client = Client::new(Loopback::new(server.clone()));
    let key = ClientHandshake::new(&DhGroup::default(), 128, 64)
        .unwrap()
        .public_key()
        .unwrap();

    let cases = [
        (key.clone(), 100, 64),
        (key.clone(), 512, 64),
        (key.clone(), 128, 12),
        (key.clone(), 128, 1024),
        (b"junk".to_vec(), 128, 64),
        (Vec::new(), 128, 64),
    ];
    for (public_key, key_bits, block_size) in cases {
        let err = client
            .call(FCall::TSecureMount {
                public_key: Data(public_key),
                key_bits,
                block_size,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{:?}", err);
    }
    assert!(server.sessions().is_empty());
    assert!(!client.is_secure());
}

#[tokio::test]
async fn scram_login_with_each_mechanism() {
    let server = guarded(ServerConfig::default());
    for (user, password) in [("alice", "wonderland"), ("bob", "builder")] {
        for binding in [false, true] {
            let mut client = Client::new(Loopback::new(server.clone()));
            client.authenticate("/", user, password, binding).await.unwrap();
            assert!(client.stat("/").await.unwrap().is_dir());

            let session = server.sessions().get(client.conn()).unwrap();
            assert_eq!(
                session.principal(),
                Some(Principal {
                    name: user.to_owned()
                })
            );
        }
    }
}

#[tokio::test]
async fn scram_login_over_secure_channel() {
    let server = guarded(ServerConfig::default());
    let mut client = Client::new(Loopback::new(server.clone()));
    client.secure(192, 32).await.unwrap();
    client.authenticate("/", "alice", "wonderland", true).await.unwrap();
    client.mkdir("/private").await.unwrap();
    assert_eq!(server.sessions().len(), 1);
}

#[tokio::test]
async fn wrong_password_ends_the_session() {
    let server = guarded(ServerConfig::default());
    let mut client = Client::new(Loopback::new(server.clone()));
    let err = client
        .authenticate("/", "alice", "looking-glass", false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotPermitted));
    assert!(server.sessions().is_empty());
    assert!(matches!(client.stat("/").await, Err(Error::NotPermitted)));
}

#[tokio::test]
async fn unknown_user_gets_a_plausible_challenge() {
    let server = guarded(ServerConfig::default());
    let mut client = Client::new(Loopback::new(server.clone()));
    let scram = ScramClient::with_nonce("mallory", "guess", None, "fixed-client-nonce");

    let server_first = client_first(&mut client, scram.client_first()).await.unwrap();
    assert!(server_first.starts_with("r=fixed-client-nonce"));
    assert!(server_first.len() > "r=fixed-client-nonce".len());
    assert!(server_first.contains(",s=") && server_first.contains(",i="));

    let (last, _) = scram.client_final(&server_first).unwrap();
    assert!(matches!(
        client_final(&mut client, last).await,
        Err(Error::NotPermitted)
    ));
    assert!(server.sessions().is_empty());
}

#[tokio::test]
async fn unknown_user_challenge_matches_stored_parameters() {
    // Everything after the nonce and salt must look the same for real and unknown users.
    fn shape(server_first: &str) -> Vec<&str> {
        server_first
            .split(',')
            .filter(|attr| !attr.starts_with("r=") && !attr.starts_with("s="))
            .collect()
    }

    let config = ServerConfig {
        iterations: ITERATIONS,
        ..Default::default()
    };
    let server = guarded(config);

    let mut known = Client::new(Loopback::new(server.clone()));
    let scram = ScramClient::new("alice", "wonderland", None);
    let real = client_first(&mut known, scram.client_first()).await.unwrap();

    let mut unknown = Client::new(Loopback::new(server.clone()));
    let scram = ScramClient::new("mallory", "guess", None);
    let fake = client_first(&mut unknown, scram.client_first()).await.unwrap();

    assert_eq!(shape(&real), vec![format!("i={}", ITERATIONS).as_str()]);
    assert_eq!(shape(&real), shape(&fake));

    let config = ServerConfig {
        scram_mechanism: Mechanism::Sha512,
        iterations: ITERATIONS,
        ..Default::default()
    };
    let server = guarded(config);

    let mut known = Client::new(Loopback::new(server.clone()));
    let scram = ScramClient::new("bob", "builder", None);
    let real = client_first(&mut known, scram.client_first()).await.unwrap();

    let mut unknown = Client::new(Loopback::new(server.clone()));
    let scram = ScramClient::new("mallory", "guess", None);
    let fake = client_first(&mut unknown, scram.client_first()).await.unwrap();

    assert_eq!(shape(&real), shape(&fake));
    assert!(fake.ends_with(",h=SCRAM-SHA-512"));
}

#[tokio::test]
async fn tampered_nonce_is_rejected() {
    let server = guarded(ServerConfig::default());
    let mut client = Client::new(Loopback::new(server.clone()));
    let scram = ScramClient::new("alice", "wonderland", None);

    let server_first = client_first(&mut client, scram.client_first()).await.unwrap();
    let (last, _) = scram.client_final(&server_first).unwrap();
    let tampered = last.replacen(",r=", ",r=x", 1);
    assert!(matches!(
        client_final(&mut client, tampered).await,
        Err(Error::NotPermitted)
    ));
    assert!(server.sessions().is_empty());
}

#[tokio::test]
async fn wrong_binding_data_is_rejected() {
    let server = guarded(ServerConfig::default());
    let mut client = Client::new(Loopback::new(server.clone()));
    let scram = ScramClient::new("alice", "wonderland", Some(b"some other server"));

    let server_first = client_first(&mut client, scram.client_first()).await.unwrap();
    let (last, _) = scram.client_final(&server_first).unwrap();
    assert!(matches!(
        client_final(&mut client, last).await,
        Err(Error::NotPermitted)
    ));
}

#[tokio::test]
async fn no_data_access_until_handshake_completes() {
    let server = guarded(ServerConfig::default());
    let mut client = Client::new(Loopback::new(server.clone()));
    let scram = ScramClient::new("alice", "wonderland", None);

    let server_first = client_first(&mut client, scram.client_first()).await.unwrap();
    assert_ne!(client.conn(), NO_SESSION);
    assert!(matches!(client.stat("/").await, Err(Error::NotPermitted)));
    assert!(matches!(client.mkdir("/x").await, Err(Error::NotPermitted)));

    let (last, verifier) = scram.client_final(&server_first).unwrap();
    let server_final = client_final(&mut client, last).await.unwrap();
    verifier.verify(&server_final).unwrap();
    client.mkdir("/x").await.unwrap();
}

#[tokio::test]
async fn client_final_needs_a_pending_handshake() {
    let server = guarded(ServerConfig::default());
    let mut client = Client::new(Loopback::new(server.clone()));
    assert!(matches!(
        client_final(&mut client, "c=biws,r=abc,p=AAAA".into()).await,
        Err(Error::NotPermitted)
    ));

    client.mount("/", Some("alice"), Some("wonderland")).await.unwrap();
    assert!(matches!(
        client_final(&mut client, "c=biws,r=abc,p=AAAA".into()).await,
        Err(Error::NotPermitted)
    ));
    // A stray ClientFinal does not undo an earlier login
    assert!(client.stat("/").await.is_ok());
}

#[tokio::test]
async fn unsupported_binding_flags_are_rejected() {
    let server = guarded(ServerConfig::default());
    let mut client = Client::new(Loopback::new(server.clone()));
    for message in [
        "y,,n=alice,r=abcdefgh",
        "p=tls-unique,,n=alice,r=abcdefgh",
        "n,,r=abcdefgh",
        "garbage",
    ] {
        assert!(matches!(
            client_first(&mut client, message.to_owned()).await,
            Err(Error::NotPermitted)
        ));
    }
    assert!(server.sessions().is_empty());
}

#[tokio::test]
async fn mechanisms_can_be_withheld() {
    let config = ServerConfig {
        mechanisms: vec![Mechanism::Sha256],
        ..Default::default()
    };
    let server = guarded(config);

    let mut client = Client::new(Loopback::new(server.clone()));
    assert_eq!(
        client.capabilities().await.unwrap().mechanisms,
        vec!["SCRAM-SHA-256", "SCRAM-SHA-256-PLUS"]
    );
    assert!(matches!(
        client.authenticate("/", "bob", "builder", false).await,
        Err(Error::NotPermitted)
    ));
    client.authenticate("/", "alice", "wonderland", false).await.unwrap();
}

#[tokio::test]
async fn plain_mount_checks_credentials() {
    let server = guarded(ServerConfig::default());

    let mut alice = Client::new(Loopback::new(server.clone()));
    alice.mount("/", Some("alice"), Some("wonderland")).await.unwrap();
    let mut bob = Client::new(Loopback::new(server.clone()));
    bob.mount("/", Some("bob"), Some("builder")).await.unwrap();

    let mut intruder = Client::new(Loopback::new(server.clone()));
    for (user, password) in [
        (Some("alice"), Some("builder")),
        (Some("carol"), Some("wonderland")),
        (Some("alice"), None),
        (None, None),
    ] {
        assert!(matches!(
            intruder.mount("/", user, password).await,
            Err(Error::NotPermitted)
        ));
    }
    assert_eq!(server.sessions().len(), 2);
}

#[tokio::test]
async fn capabilities_announce_mechanisms_and_key() {
    let server = guarded(ServerConfig::default());
    let mut client = Client::new(Loopback::new(server.clone()));
    let caps = client.capabilities().await.unwrap();
    assert_eq!(
        caps.mechanisms,
        vec![
            "SCRAM-SHA-256",
            "SCRAM-SHA-256-PLUS",
            "SCRAM-SHA-512",
            "SCRAM-SHA-512-PLUS"
        ]
    );
    assert_eq!(caps.server_key.len(), 32);
    assert_eq!(caps.server_key, server.server_key());
    assert!(server.sessions().is_empty());
}

#[tokio::test]
async fn pinned_server_key_is_used_for_binding() {
    let key = vec![0x5a; 32];
    let server = Arc::new(
        Server::new(ServerConfig::default())
            .with_mount("/", Arc::new(MemFs::new()), Some(users()))
            .with_server_key(key.clone()),
    );
    let mut client = Client::new(Loopback::new(server.clone()));
    assert_eq!(client.capabilities().await.unwrap().server_key, key);
    client.authenticate("/", "bob", "builder", true).await.unwrap();

    let mut pinned = Client::new(Loopback::new(server.clone()));
    let scram = ScramClient::new("bob", "builder", Some(&key));
    let server_first = client_first(&mut pinned, scram.client_first()).await.unwrap();
    assert!(server_first.ends_with(",h=SCRAM-SHA-512"));
    let (last, verifier) = scram.client_final(&server_first).unwrap();
    verifier
        .verify(&client_final(&mut pinned, last).await.unwrap())
        .unwrap();
}
