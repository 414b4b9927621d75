use std::{net::SocketAddr, path::PathBuf, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use rand::{distributions::Alphanumeric, Rng};
use tokio::time::{timeout, Instant};
use tokio_util::codec::{Encoder, FramedRead};
use vcz_content::{
    check,
    config::Config,
    content::{
        storage::{DiskStorage, MemoryStorage, Storage},
        Content,
    },
    download::Download,
    error::Error,
    piece::Piece,
    swarm::PeerHandle,
    wire::{codec::MessageCodec, Message},
};

const CHUNK: u32 = 32768;
const FILES: [(&str, u64); 3] =
    [("dir/a.bin", 40_000), ("empty.bin", 0), ("b.bin", 60_000)];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .compact()
        .with_file(false)
        .without_time()
        .try_init();
}

fn random_dir() -> PathBuf {
    let mut rng = rand::thread_rng();
    let name: String =
        (0..20).map(|_| rng.sample(Alphanumeric) as char).collect();
    std::env::temp_dir().join(name)
}

fn data() -> Vec<u8> {
    let total: u64 = FILES.iter().map(|f| f.1).sum();
    (0..total).map(|i| (i * 7 % 256) as u8).collect()
}

fn hashes(data: &[u8]) -> Vec<u8> {
    data.chunks(CHUNK as usize)
        .flat_map(|c| sha1_smol::Sha1::from(c).digest().bytes())
        .collect()
}

fn content<S: Storage>(storage: S, root: impl Into<PathBuf>) -> Content<S> {
    let mut content = Content::new(storage, CHUNK);
    content.set_root_dir(root);
    for (path, size) in FILES {
        content.add_file(path, size);
    }
    content.set_complete_hash(hashes(&data()));
    content
}

/// Encode every message queued for `from` and hand them to `to`.
fn pump<A: Storage, B: Storage>(
    from: &mut Download<A>,
    from_handle: PeerHandle,
    to: &mut Download<B>,
    to_handle: PeerHandle,
    now: Instant,
) -> Result<usize, Error> {
    let msgs = from
        .peer_mut(from_handle)
        .ok_or(Error::PeerNotFound(from_handle))?
        .take_outbox();

    let n = msgs.len();
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::new();

    for msg in msgs {
        codec.encode(msg, &mut buf)?;
    }

    to.receive(to_handle, &buf, now)?;
    Ok(n)
}

#[tokio::test]
async fn framed_read() {
    let mut bytes = BytesMut::new();
    let mut codec = MessageCodec::default();
    codec.encode(Message::Unchoke, &mut bytes).unwrap();
    codec.encode(Message::KeepAlive, &mut bytes).unwrap();
    // unknown message id, skipped.
    bytes.put_slice(&[0, 0, 0, 3, 99, 1, 2]);
    codec
        .encode(
            Message::Piece(Piece::new(1, 0, 3), Bytes::from_static(&[1, 2, 3])),
            &mut bytes,
        )
        .unwrap();

    let mut framed = FramedRead::new(&bytes[..], MessageCodec::default());

    assert_eq!(framed.next().await.unwrap().unwrap(), Message::Unchoke);
    assert_eq!(framed.next().await.unwrap().unwrap(), Message::KeepAlive);
    assert_eq!(
        framed.next().await.unwrap().unwrap(),
        Message::Piece(Piece::new(1, 0, 3), Bytes::from_static(&[1, 2, 3]))
    );
    assert!(framed.next().await.is_none());
    assert_eq!(framed.decoder().reader().skipped(), 2);
}

#[tokio::test]
async fn framed_read_protocol_error() {
    // a piece message too short for its own header.
    let bytes = [0, 0, 0, 5, 7, 0, 0, 0, 0];
    let mut framed = FramedRead::new(&bytes[..], MessageCodec::default());

    let err = framed.next().await.unwrap().unwrap_err();
    assert!(err.is_protocol());
}

// Download every chunk from a seeder that keeps its files in memory into
// files on disk, then open the files again and check that they are complete.
#[tokio::test]
async fn download_to_disk() -> Result<(), Error> {
    init_tracing();

    let dir = random_dir();
    let dir_2 = dir.clone();
    let original_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic| {
        let _ = std::fs::remove_dir_all(&dir_2);
        original_hook(panic);
    }));

    let data = data();
    let config = Config::default();
    let now = Instant::now();
    let seeder_addr: SocketAddr = "127.0.0.1:51413".parse().unwrap();
    let leecher_addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();

    // seeder
    let mut storage = MemoryStorage::new();
    storage.put("seed/dir/a.bin", data[..40_000].to_vec());
    storage.put("seed/b.bin", data[40_000..].to_vec());

    let mut seed_content = content(storage, "seed");
    seed_content.open()?;
    assert_eq!(check::recheck(&mut seed_content)?, 4);
    let mut seeder = Download::new(seed_content, &config, now);

    // leecher
    let mut leech_content = content(DiskStorage, &dir);
    leech_content.set_allocate(true);
    leech_content.open()?;
    assert!(leech_content.is_correct_size()?);
    let mut done = leech_content.subscribe();
    let mut leecher = Download::new(leech_content, &config, now);

    let to_leecher = seeder.add_peer(leecher_addr);
    let to_seeder = leecher.add_peer(seeder_addr);

    // the leecher writes to disk with blocking calls.
    let (seeder, leecher) = tokio::task::spawn_blocking(move || {
        for _ in 0..100 {
            seeder.unchoke(to_leecher)?;
            pump(&mut seeder, to_leecher, &mut leecher, to_seeder, now)?;

            leecher.request_blocks(to_seeder, 4, now)?;
            pump(&mut leecher, to_seeder, &mut seeder, to_leecher, now)?;

            seeder.serve_requests(to_leecher)?;

            if leecher.is_done() {
                break;
            }
        }
        Ok::<_, Error>((seeder, leecher))
    })
    .await
    .expect("the download task panicked")?;

    timeout(Duration::from_secs(1), done.changed())
        .await
        .expect("the download did not complete")
        .expect("the content was dropped");
    assert!(*done.borrow());

    assert!(leecher.is_done());
    assert_eq!(leecher.counter().downloaded.total(), data.len() as u64);
    assert_eq!(leecher.counter().wasted.total(), 0);
    assert_eq!(seeder.swarm().availability().field(), &[0, 0, 0, 0]);
    assert_eq!(leecher.swarm().availability().field(), &[1, 1, 1, 1]);
    assert!(!leecher.peer(to_seeder).unwrap().state.am_interested);

    assert_eq!(std::fs::read(dir.join("dir/a.bin"))?, &data[..40_000]);
    assert_eq!(std::fs::read(dir.join("b.bin"))?, &data[40_000..]);
    assert!(dir.join("empty.bin").is_file());

    // the files survive a restart.
    drop(leecher);
    let mut content = content(DiskStorage, &dir);
    content.open()?;
    assert!(content.is_correct_size()?);
    assert_eq!(check::recheck(&mut content)?, 4);
    assert!(content.is_done());
    content.close();

    std::fs::remove_dir_all(dir)?;

    Ok(())
}
