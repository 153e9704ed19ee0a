use std::{sync::Arc, time::Duration};

use tnfs::{
    client::{Client, TcpTransport, UdpTransport},
    memfs::MemFs,
    srv::{Server, ServerConfig, serve_tcp, serve_udp, srv_async},
    *,
};
use tokio::net::{TcpListener, UdpSocket};

fn server() -> Arc<Server> {
    Arc::new(Server::new(ServerConfig::default()).with_mount("/", Arc::new(MemFs::new()), None))
}

async fn exercise<T: client::Transport>(client: &mut Client<T>, name: &str) {
    let data: Vec<u8> = (0..3000u32).map(|i| (i * 7) as u8).collect();
    let path = format!("/{}", name);

    let flags = OpenFlags::RDWR | OpenFlags::CREATE | OpenFlags::TRUNCATE;
    let h = client.open(&path, flags, 0o644).await.unwrap();
    assert_eq!(client.write(h, &data).await.unwrap(), data.len());
    assert_eq!(client.lseek(h, Whence::Set, 0).await.unwrap(), 0);
    assert_eq!(client.read_to_end(h).await.unwrap(), data);
    client.close(h).await.unwrap();

    assert_eq!(client.stat(&path).await.unwrap().size, 3000);
    let listing = client.list("/", &Default::default()).await.unwrap();
    assert!(listing.iter().any(|e| e.name == name));
}

#[tokio::test]
async fn udp_sessions() {
    let server = server();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let serving = tokio::spawn(serve_udp(server.clone(), socket));

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            tokio::spawn(async move {
                let transport = UdpTransport::connect(addr).await.unwrap();
                let mut client = Client::new(transport).with_retry(Duration::from_secs(2), 3);
                client.mount("/", None, None).await.unwrap();
                exercise(&mut client, &format!("udp-{}", i)).await;
                client.conn()
            })
        })
        .collect();

    let mut conns = Vec::new();
    for task in tasks {
        conns.push(task.await.unwrap());
    }
    conns.sort_unstable();
    conns.dedup();
    assert_eq!(conns.len(), 4);
    assert_eq!(server.sessions().len(), 4);

    let mut client = Client::new(UdpTransport::connect(addr).await.unwrap());
    client.mount("/", None, None).await.unwrap();
    client.umount().await.unwrap();
    assert_eq!(server.sessions().len(), 4);

    serving.abort();
}

#[tokio::test]
async fn tcp_sessions_end_with_the_stream() {
    let server = server();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = tokio::spawn(serve_tcp(server.clone(), listener));

    {
        let mut client = Client::new(TcpTransport::connect(addr).await.unwrap());
        client.secure(128, 16).await.unwrap();
        client.mount("/", None, None).await.unwrap();
        assert_eq!(client.negotiate_packet_size(8192).await.unwrap(), 8192);
        exercise(&mut client, "tcp").await;
        assert_eq!(server.sessions().len(), 1);
    }

    for _ in 0..200 {
        if server.sessions().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(server.sessions().is_empty());

    serving.abort();
}

#[tokio::test]
async fn bad_listen_address() {
    for addr in ["sctp!127.0.0.1!0", "udp:127.0.0.1:0", "tcp!nowhere.invalid!"] {
        assert!(srv_async(server(), addr).await.is_err(), "{}", addr);
    }
}
