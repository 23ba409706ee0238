//! Named single-slot IPC mailboxes.
//!
//! A mailbox is a named shared-memory slot holding at most one message.
//! [`Mailbox::create`] allocates and owns the slot; any process may then
//! attach a [`MailboxWriter`] or [`MailboxReader`] by name. `send` deposits
//! a message when the slot is empty and suspends otherwise; `recv` takes
//! the message and marks the slot empty again. That single slot is the
//! entire flow-control story: a writer can never get more than one message
//! ahead of the reader.
//!
//! The slot layout is a 12-byte header (capacity word, atomic length word,
//! atomic role-flags word) followed by exactly `capacity` payload bytes.
//! All cross-process header traffic goes through atomic views of the
//! mapped words. State transitions are announced through a named signal
//! object (a FIFO on POSIX, an auto-reset event on Windows) that waiters
//! watch through the reactor; because a wake can be stale, waiters always
//! re-check the header and re-arm.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::Poll;

use sluice_core::{Error, Reactor, Result};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(windows)]
mod win;
#[cfg(windows)]
use win as platform;

/// Bytes reserved at the front of the mapping: capacity, length, flags.
const HEADER_LEN: usize = 12;

const OFFSET_LEN: usize = 4;
const OFFSET_FLAGS: usize = 8;

const ROLE_READER: u32 = 0b01;
const ROLE_WRITER: u32 = 0b10;

/// Namespace prefix for every OS object a mailbox allocates.
const NAME_PREFIX: &str = "sluice-mbx-";

fn qualify(name: &str) -> Result<String> {
    let portable = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if !portable {
        return Err(Error::Contract(
            "mailbox names are non-empty and limited to [A-Za-z0-9._-]",
        ));
    }
    Ok(format!("{NAME_PREFIX}{name}"))
}

/// Typed view of the mapped slot. Only valid while the mapping that
/// produced `base` is alive; every holder keeps its `platform::Shared`
/// alongside the view.
struct Slot {
    base: *mut u8,
}

// The base pointer addresses a shared mapping whose header is only
// touched through atomics; payload access is serialized by the length
// word protocol.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

impl Slot {
    fn new(base: *mut u8) -> Self {
        Self { base }
    }

    /// One-time header initialization by the owner, before the name is
    /// published to any other process.
    fn init(&self, capacity: u32) {
        unsafe {
            (self.base as *mut u32).write(capacity);
        }
        self.len_word().store(0, Ordering::Release);
        self.flags().store(0, Ordering::Release);
    }

    fn capacity(&self) -> u32 {
        // Immutable after init; the creating process wrote it before any
        // opener could learn the name.
        unsafe { (self.base as *const u32).read() }
    }

    fn len_word(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.base.add(OFFSET_LEN) as *mut u32) }
    }

    fn flags(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.base.add(OFFSET_FLAGS) as *mut u32) }
    }

    /// Deposit a message into an empty slot and publish its length.
    fn store(&self, payload: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.base.add(HEADER_LEN),
                payload.len(),
            );
        }
        self.len_word().store(payload.len() as u32, Ordering::Release);
    }

    /// Take the message out of a full slot and mark it empty. Returns the
    /// bytes copied, truncated to `buf.len()`.
    fn take(&self, buf: &mut [u8]) -> usize {
        let len = self.len_word().load(Ordering::Acquire) as usize;
        let n = len.min(buf.len());
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(HEADER_LEN), buf.as_mut_ptr(), n);
        }
        self.len_word().store(0, Ordering::Release);
        n
    }
}

/// Owner handle for a named mailbox.
///
/// Creating the mailbox allocates the shared slot and its signal object;
/// [`Mailbox::destroy`] removes the name again, exactly once (enforced by
/// consuming `self`). The owner may also attach local endpoints through
/// [`Mailbox::reader`] / [`Mailbox::writer`].
pub struct Mailbox {
    reactor: Arc<dyn Reactor>,
    name: String,
    qualified: String,
    shared: platform::Shared,
    slot: Slot,
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Mailbox {
    /// Create the named slot with room for `capacity` payload bytes.
    ///
    /// `capacity` must exceed the 12-byte header reservation. Fails if the
    /// name already exists; on failure no OS object is left behind.
    pub fn create(reactor: &Arc<dyn Reactor>, name: &str, capacity: u32) -> Result<Self> {
        if capacity as usize <= HEADER_LEN {
            return Err(Error::Contract(
                "mailbox capacity must exceed the 12-byte header reservation",
            ));
        }
        let qualified = qualify(name)?;
        let shared = platform::Shared::create(&qualified, HEADER_LEN + capacity as usize)?;
        let slot = Slot::new(shared.base());
        slot.init(capacity);
        tracing::debug!(name, capacity, "mailbox created");
        Ok(Self {
            reactor: reactor.clone(),
            name: name.to_owned(),
            qualified,
            shared,
            slot,
        })
    }

    /// The caller-supplied (unprefixed) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.slot.capacity()
    }

    /// Whether a reader endpoint is currently attached.
    pub fn reader_attached(&self) -> bool {
        self.slot.flags().load(Ordering::Acquire) & ROLE_READER != 0
    }

    /// Whether a writer endpoint is currently attached.
    pub fn writer_attached(&self) -> bool {
        self.slot.flags().load(Ordering::Acquire) & ROLE_WRITER != 0
    }

    /// Attach a local reader endpoint.
    pub fn reader(&self) -> Result<MailboxReader> {
        MailboxReader::open(&self.reactor, &self.name)
    }

    /// Attach a local writer endpoint.
    pub fn writer(&self) -> Result<MailboxWriter> {
        MailboxWriter::open(&self.reactor, &self.name)
    }

    /// Remove the mailbox's name from the system.
    ///
    /// Endpoints already attached keep working against the orphaned slot;
    /// new opens fail. Consuming `self` makes a double unlink
    /// unrepresentable.
    pub fn destroy(self) -> Result<()> {
        platform::Shared::unlink(&self.qualified)?;
        tracing::debug!(name = %self.name, "mailbox destroyed");
        Ok(())
    }
}

/// Shared endpoint mechanics: attach by name, hold a role bit while open,
/// watch-and-recheck waiting.
struct Endpoint {
    reactor: Arc<dyn Reactor>,
    shared: platform::Shared,
    slot: Slot,
    role: u32,
    open: bool,
}

impl Endpoint {
    fn attach(reactor: &Arc<dyn Reactor>, name: &str, role: u32) -> Result<Self> {
        let qualified = qualify(name)?;
        let shared = platform::Shared::open(&qualified)?;
        shared.register(reactor.as_ref())?;
        let slot = Slot::new(shared.base());
        slot.flags().fetch_or(role, Ordering::AcqRel);
        Ok(Self {
            reactor: reactor.clone(),
            shared,
            slot,
            role,
            open: true,
        })
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.slot.flags().fetch_and(!self.role, Ordering::AcqRel);
            self.shared.unregister(self.reactor.as_ref())?;
        }
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// The receiving endpoint of a mailbox.
pub struct MailboxReader {
    inner: Endpoint,
}

impl std::fmt::Debug for MailboxReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxReader").finish_non_exhaustive()
    }
}

impl MailboxReader {
    /// Attach to an existing mailbox by name. Fails with a creation error
    /// if the mailbox has not been created (or was destroyed).
    pub fn open(reactor: &Arc<dyn Reactor>, name: &str) -> Result<Self> {
        let inner = Endpoint::attach(reactor, name, ROLE_READER)?;
        tracing::debug!(name, "mailbox reader attached");
        Ok(Self { inner })
    }

    /// Receive the next message, suspending while the slot is empty.
    ///
    /// Returns the number of bytes copied into `buf`; a message longer
    /// than `buf` is truncated. Taking the message empties the slot and
    /// signals any waiting writer.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let ep = &mut self.inner;
        if !ep.open {
            return Err(Error::Closed);
        }
        std::future::poll_fn(|cx| {
            let mut armed = false;
            loop {
                if ep.slot.len_word().load(Ordering::Acquire) > 0 {
                    let n = ep.slot.take(buf);
                    return Poll::Ready(ep.shared.notify().map(|()| n));
                }
                if armed {
                    return Poll::Pending;
                }
                // Stale signal bytes from earlier transitions must not
                // satisfy the next wait.
                ep.shared.drain();
                ep.shared.watch(ep.reactor.as_ref(), cx.waker());
                // A transition that landed before the waker parked would
                // otherwise be lost; re-check once.
                armed = true;
            }
        })
        .await
    }

    /// Detach: clear the role bit, stop watching, unmap. Never unlinks
    /// the name. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// The sending endpoint of a mailbox.
pub struct MailboxWriter {
    inner: Endpoint,
}

impl std::fmt::Debug for MailboxWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxWriter").finish_non_exhaustive()
    }
}

impl MailboxWriter {
    /// Attach to an existing mailbox by name. Fails with a creation error
    /// if the mailbox has not been created (or was destroyed).
    pub fn open(reactor: &Arc<dyn Reactor>, name: &str) -> Result<Self> {
        let inner = Endpoint::attach(reactor, name, ROLE_WRITER)?;
        tracing::debug!(name, "mailbox writer attached");
        Ok(Self { inner })
    }

    /// Deposit `payload`, suspending while the slot still holds the
    /// previous message.
    ///
    /// Completes synchronously when the slot is already empty. The payload
    /// must be non-empty (a zero length marks the slot empty) and no
    /// larger than the mailbox capacity.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let ep = &mut self.inner;
        if !ep.open {
            return Err(Error::Closed);
        }
        if payload.is_empty() {
            return Err(Error::Contract("mailbox messages must be non-empty"));
        }
        if payload.len() > ep.slot.capacity() as usize {
            return Err(Error::Contract("mailbox message exceeds slot capacity"));
        }
        std::future::poll_fn(|cx| {
            let mut armed = false;
            loop {
                if ep.slot.len_word().load(Ordering::Acquire) == 0 {
                    ep.slot.store(payload);
                    return Poll::Ready(ep.shared.notify());
                }
                if armed {
                    return Poll::Pending;
                }
                ep.shared.drain();
                ep.shared.watch(ep.reactor.as_ref(), cx.waker());
                armed = true;
            }
        })
        .await
    }

    /// Detach: clear the role bit, stop watching, unmap. Never unlinks
    /// the name. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::FutureExt;
    use sluice_core::testing::RecordingReactor;
    use std::sync::atomic::AtomicU64;

    fn reactor() -> Arc<dyn Reactor> {
        Arc::new(RecordingReactor::new())
    }

    fn unique(tag: &str) -> String {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        format!(
            "{tag}-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn capacity_must_exceed_header() {
        let reactor = reactor();
        for capacity in [0, 1, 12] {
            let err = Mailbox::create(&reactor, &unique("cap"), capacity).unwrap_err();
            assert!(matches!(err, Error::Contract(_)), "capacity {capacity}");
        }
    }

    #[test]
    fn rejects_unportable_names() {
        let reactor = reactor();
        for name in ["", "a/b", "spaced name"] {
            let err = Mailbox::create(&reactor, name, 64).unwrap_err();
            assert!(matches!(err, Error::Contract(_)), "name {name:?}");
        }
    }

    #[test]
    fn open_before_create_fails() {
        let reactor = reactor();
        let name = unique("absent");
        assert!(matches!(
            MailboxReader::open(&reactor, &name).unwrap_err(),
            Error::Creation { .. }
        ));
        assert!(matches!(
            MailboxWriter::open(&reactor, &name).unwrap_err(),
            Error::Creation { .. }
        ));
    }

    #[test]
    fn endpoints_hold_role_bits_while_open() {
        let reactor = reactor();
        let mailbox = Mailbox::create(&reactor, &unique("roles"), 64).unwrap();
        assert!(!mailbox.reader_attached());
        assert!(!mailbox.writer_attached());

        let mut reader = mailbox.reader().unwrap();
        let mut writer = mailbox.writer().unwrap();
        assert!(mailbox.reader_attached());
        assert!(mailbox.writer_attached());

        reader.close().unwrap();
        reader.close().unwrap();
        assert!(!mailbox.reader_attached());
        assert!(mailbox.writer_attached());

        drop(writer.close());
        assert!(!mailbox.writer_attached());
        mailbox.destroy().unwrap();
    }

    #[test]
    fn send_and_recv_complete_synchronously_when_unblocked() {
        let reactor = reactor();
        let mailbox = Mailbox::create(&reactor, &unique("sync"), 64).unwrap();
        let mut writer = mailbox.writer().unwrap();
        let mut reader = mailbox.reader().unwrap();

        writer.send(b"ping").await_ready().unwrap();
        let mut buf = [0u8; 16];
        let n = reader.recv(&mut buf).await_ready().unwrap();
        assert_eq!(&buf[..n], b"ping");

        mailbox.destroy().unwrap();
    }

    #[test]
    fn second_send_blocks_until_slot_drains() {
        let reactor = reactor();
        let mailbox = Mailbox::create(&reactor, &unique("full"), 64).unwrap();
        let mut writer = mailbox.writer().unwrap();
        let mut reader = mailbox.reader().unwrap();

        writer.send(b"one").await_ready().unwrap();
        // Slot still holds the first message.
        assert!(writer.send(b"two").now_or_never().is_none());

        let mut buf = [0u8; 16];
        let n = reader.recv(&mut buf).await_ready().unwrap();
        assert_eq!(&buf[..n], b"one");

        writer.send(b"two").await_ready().unwrap();
        let n = reader.recv(&mut buf).await_ready().unwrap();
        assert_eq!(&buf[..n], b"two");

        mailbox.destroy().unwrap();
    }

    #[test]
    fn oversized_and_empty_messages_are_contract_errors() {
        let reactor = reactor();
        let mailbox = Mailbox::create(&reactor, &unique("limits"), 16).unwrap();
        let mut writer = mailbox.writer().unwrap();

        let err = writer.send(&[0u8; 17]).await_ready().unwrap_err();
        assert!(matches!(err, Error::Contract(_)));
        let err = writer.send(b"").await_ready().unwrap_err();
        assert!(matches!(err, Error::Contract(_)));
        // The slot is untouched by the failed sends.
        writer.send(&[0u8; 16]).await_ready().unwrap();

        mailbox.destroy().unwrap();
    }

    #[test]
    fn recv_truncates_to_caller_buffer() {
        let reactor = reactor();
        let mailbox = Mailbox::create(&reactor, &unique("trunc"), 64).unwrap();
        let mut writer = mailbox.writer().unwrap();
        let mut reader = mailbox.reader().unwrap();

        writer.send(b"abcdef").await_ready().unwrap();
        let mut buf = [0u8; 4];
        let n = reader.recv(&mut buf).await_ready().unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"abcd");
        // The slot drained even though the tail was dropped.
        writer.send(b"next").await_ready().unwrap();

        mailbox.destroy().unwrap();
    }

    #[test]
    fn closed_endpoints_report_closed() {
        let reactor = reactor();
        let mailbox = Mailbox::create(&reactor, &unique("closed"), 64).unwrap();
        let mut writer = mailbox.writer().unwrap();
        let mut reader = mailbox.reader().unwrap();
        writer.close().unwrap();
        reader.close().unwrap();

        assert!(matches!(
            writer.send(b"x").await_ready().unwrap_err(),
            Error::Closed
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            reader.recv(&mut buf).await_ready().unwrap_err(),
            Error::Closed
        ));
        mailbox.destroy().unwrap();
    }

    #[test]
    fn destroy_invalidates_the_name() {
        let reactor = reactor();
        let name = unique("gone");
        let mailbox = Mailbox::create(&reactor, &name, 64).unwrap();
        mailbox.destroy().unwrap();
        assert!(MailboxReader::open(&reactor, &name).is_err());
    }

    /// Drive a future that must complete without a real event loop.
    trait AwaitReady: std::future::Future + Sized {
        fn await_ready(self) -> Self::Output {
            self.now_or_never()
                .expect("future should complete synchronously")
        }
    }

    impl<F: std::future::Future + Sized> AwaitReady for F {}
}
