//! End-to-end pipe transfers over a live reactor.

#![cfg(unix)]

use std::sync::Arc;

use sluice_core::{PollReactor, Reactor};
use sluice_pipe::{DuplexPipe, PipeOptions};

fn reactor() -> Arc<dyn Reactor> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    PollReactor::new().expect("reactor")
}

async fn read_exact(reader: &mut sluice_pipe::PipeReader, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = reader.read(&mut out[filled..]).await.expect("read");
        assert_ne!(n, 0, "unexpected end of stream at {filled}/{len}");
        filled += n;
    }
    out
}

#[tokio::test]
async fn roundtrip_boundary_sizes() {
    let reactor = reactor();
    for size in [1usize, 255, 256, 4096] {
        let pipe = DuplexPipe::create(&reactor).expect("pipe");
        let (reader, writer) = pipe.into_split();
        let (mut reader, mut writer) = (reader.unwrap(), writer.unwrap());

        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        // A zero-length write is a complete no-op and must not disturb
        // the stream.
        writer.write_all(&[]).await.expect("empty write");
        writer.write_all(&payload).await.expect("write");
        let echoed = read_exact(&mut reader, size).await;
        assert_eq!(echoed, payload, "size {size}");
    }
}

#[tokio::test]
async fn large_transfer_with_concurrent_drain() {
    let reactor = reactor();
    let pipe = DuplexPipe::create(&reactor).expect("pipe");
    let (reader, writer) = pipe.into_split();
    let (mut reader, mut writer) = (reader.unwrap(), writer.unwrap());

    // Far larger than any kernel pipe buffer, so the writer must suspend
    // until the reader drains; both directions progress concurrently.
    let payload: Vec<u8> = (0..1_048_576usize).map(|i| (i % 211) as u8).collect();
    let expected = payload.clone();

    let (write_result, echoed) = tokio::join!(
        async move {
            writer.write_all(&payload).await?;
            writer.close(true)
        },
        async move {
            let mut out = Vec::new();
            let mut chunk = [0u8; 65536];
            loop {
                let n = reader.read(&mut chunk).await.expect("read");
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&chunk[..n]);
            }
            out
        }
    );
    write_result.expect("write side");
    assert_eq!(echoed.len(), expected.len());
    assert_eq!(echoed, expected);
}

#[tokio::test]
async fn peer_close_reads_as_eof() {
    let reactor = reactor();
    let pipe = DuplexPipe::create(&reactor).expect("pipe");
    let (reader, writer) = pipe.into_split();
    let (mut reader, mut writer) = (reader.unwrap(), writer.unwrap());

    writer.write_all(b"tail").await.expect("write");

    // Close the writer while the reader is mid-stream; the pending data
    // must still arrive before the end-of-stream marker.
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(writer);
    });

    let mut buf = [0u8; 16];
    let n = reader.read(&mut buf).await.expect("data before eof");
    assert_eq!(&buf[..n], b"tail");
    let n = reader.read(&mut buf).await.expect("eof");
    assert_eq!(n, 0);
    // EOF is sticky, not an error.
    let n = reader.read(&mut buf).await.expect("eof again");
    assert_eq!(n, 0);
}

#[tokio::test]
async fn interactive_option_still_transfers() {
    let reactor = reactor();
    let options = PipeOptions {
        interactive: true,
        ..PipeOptions::default()
    };
    let mut pipe = DuplexPipe::create_with(&reactor, &options).expect("pipe");

    pipe.write_all(b"low latency").await.expect("write");
    let mut buf = [0u8; 32];
    let n = pipe.read(&mut buf).await.expect("read");
    assert_eq!(&buf[..n], b"low latency");
}
