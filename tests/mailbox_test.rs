//! Cross-endpoint mailbox traffic over a live reactor.

#![cfg(unix)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use sluice_core::{PollReactor, Reactor};
use sluice_mailbox::{Mailbox, MailboxReader, MailboxWriter};

fn reactor() -> Arc<dyn Reactor> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    PollReactor::new().expect("reactor")
}

fn unique(tag: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    format!(
        "it-{tag}-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

#[tokio::test]
async fn single_slot_backpressure() {
    let reactor = reactor();
    let mailbox = Mailbox::create(&reactor, &unique("bp"), 64).expect("create");
    let mut writer = mailbox.writer().expect("writer");
    let mut reader = mailbox.reader().expect("reader");

    writer.send(b"first").await.expect("first send");

    // The slot is full: a second send must not complete until the reader
    // drains it.
    let blocked = tokio::time::timeout(Duration::from_millis(50), writer.send(b"second")).await;
    assert!(blocked.is_err(), "send completed into a full slot");

    let mut buf = [0u8; 64];
    let n = reader.recv(&mut buf).await.expect("recv");
    assert_eq!(&buf[..n], b"first");

    tokio::time::timeout(Duration::from_secs(5), writer.send(b"second"))
        .await
        .expect("send after drain timed out")
        .expect("send after drain");
    let n = reader.recv(&mut buf).await.expect("recv second");
    assert_eq!(&buf[..n], b"second");

    drop(writer);
    drop(reader);
    mailbox.destroy().expect("destroy");
}

#[tokio::test]
async fn recv_waits_for_sender() {
    let reactor = reactor();
    let mailbox = Mailbox::create(&reactor, &unique("wait"), 128).expect("create");
    let mut writer = mailbox.writer().expect("writer");
    let mut reader = mailbox.reader().expect("reader");

    let receive = tokio::time::timeout(Duration::from_secs(5), async {
        let mut buf = [0u8; 128];
        let n = reader.recv(&mut buf).await.expect("recv");
        buf[..n].to_vec()
    });
    let send = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.send(b"delayed").await.expect("send");
    };

    let (received, ()) = tokio::join!(receive, send);
    assert_eq!(received.expect("recv timed out"), b"delayed");

    drop(writer);
    drop(reader);
    mailbox.destroy().expect("destroy");
}

#[tokio::test]
async fn repeated_cycles_with_varying_sizes() {
    let reactor = reactor();
    let mailbox = Mailbox::create(&reactor, &unique("cycle"), 256).expect("create");
    let mut writer = mailbox.writer().expect("writer");
    let mut reader = mailbox.reader().expect("reader");

    for round in 1..=50usize {
        let size = (round * 5) % 256 + 1;
        let payload: Vec<u8> = (0..size).map(|i| (i ^ round) as u8).collect();
        writer.send(&payload).await.expect("send");
        let mut buf = [0u8; 256];
        let n = reader.recv(&mut buf).await.expect("recv");
        assert_eq!(&buf[..n], &payload[..], "round {round}");
    }

    drop(writer);
    drop(reader);
    mailbox.destroy().expect("destroy");
}

#[tokio::test]
async fn unblocked_operations_complete_without_waiting() {
    let reactor = reactor();
    let mailbox = Mailbox::create(&reactor, &unique("sync"), 64).expect("create");
    let mut writer = mailbox.writer().expect("writer");
    let mut reader = mailbox.reader().expect("reader");

    // An empty slot: send resolves on the first poll, no reactor round
    // trip involved.
    writer
        .send(b"immediate")
        .now_or_never()
        .expect("send should not suspend")
        .expect("send");
    let mut buf = [0u8; 64];
    let n = reader
        .recv(&mut buf)
        .now_or_never()
        .expect("recv should not suspend")
        .expect("recv");
    assert_eq!(&buf[..n], b"immediate");

    drop(writer);
    drop(reader);
    mailbox.destroy().expect("destroy");
}

#[tokio::test]
async fn endpoints_attach_by_name_across_instances() {
    let reactor = reactor();
    let name = unique("name");
    let mailbox = Mailbox::create(&reactor, &name, 64).expect("create");

    // Fresh endpoints opened by name, not through the owner.
    let mut writer = MailboxWriter::open(&reactor, &name).expect("writer");
    let mut reader = MailboxReader::open(&reactor, &name).expect("reader");
    assert!(mailbox.writer_attached());
    assert!(mailbox.reader_attached());

    writer.send(b"by-name").await.expect("send");
    let mut buf = [0u8; 64];
    let n = reader.recv(&mut buf).await.expect("recv");
    assert_eq!(&buf[..n], b"by-name");

    writer.close().expect("close writer");
    reader.close().expect("close reader");
    assert!(!mailbox.writer_attached());
    assert!(!mailbox.reader_attached());
    mailbox.destroy().expect("destroy");
}
