//! # Local Byte-Stream Channel
//!
//! The reliable transport between the watchdog and the wrapped worker
//! process, built on paired named Unix domain sockets.
//!
//! One configured channel identifier produces two endpoint names by
//! appending fixed direction suffixes: `<name>-to-clients` carries
//! watchdog→worker traffic and `<name>-to-servers` carries worker→watchdog
//! traffic. The watchdog binds the server-facing ends ([`StreamChannel::host`]);
//! the worker connects as client ([`StreamChannel::connect`]), retrying
//! briefly to absorb the startup race where it launches before the watchdog
//! finishes binding.
//!
//! Each side runs one reader thread (read 4-byte length, read payload,
//! decode, dispatch, repeat) and one writer thread (drain the bounded FIFO
//! of sealed frames, write each verbatim, release the buffer). Messages
//! flushed by one producer are delivered in flush order per direction;
//! nothing is guaranteed across the two directions.

use crate::codec;
use crate::config::BusConfig;
use crate::distributor::PacketDistributor;
use crate::pool::{BufferHandle, BufferPool};
use crate::transport::run_writer_loop;
use crate::BusError;
use crossbeam::channel::{self, Sender};
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Suffix of the endpoint carrying watchdog→worker traffic.
pub const TO_CLIENTS_SUFFIX: &str = "-to-clients";
/// Suffix of the endpoint carrying worker→watchdog traffic.
pub const TO_SERVERS_SUFFIX: &str = "-to-servers";

/// Delay between connection attempts while the host is still binding.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Derives the two endpoint socket paths from one channel identifier.
fn endpoint_paths(config: &BusConfig) -> (PathBuf, PathBuf) {
    let to_clients = config
        .channel_dir
        .join(format!("{}{}", config.channel_name, TO_CLIENTS_SUFFIX));
    let to_servers = config
        .channel_dir
        .join(format!("{}{}", config.channel_name, TO_SERVERS_SUFFIX));
    (to_clients, to_servers)
}

/// A bidirectional framed-packet channel over paired Unix domain sockets.
///
/// Owns the two background threads for its side of the channel. Dropping the
/// channel (or calling [`close`](Self::close)) drains the writer, interrupts
/// the reader, and joins both threads.
#[derive(Debug)]
pub struct StreamChannel {
    sender: Sender<BufferHandle>,
    stop: Option<Sender<()>>,
    read_stream: UnixStream,
    write_stream: UnixStream,
    shutting_down: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    label: String,
}

impl StreamChannel {
    /// Binds both endpoints and waits for the worker to connect.
    ///
    /// Call this on the watchdog side after launching (or while launching)
    /// the worker: the listeners are bound before this blocks in accept, so
    /// the worker's connect cannot be lost to a startup race. Stale socket
    /// files from a previous run are removed first - the channel must
    /// survive worker restarts.
    pub fn host(
        config: &BusConfig,
        pool: BufferPool,
        distributor: Arc<PacketDistributor>,
    ) -> Result<Self, BusError> {
        let (to_clients, to_servers) = endpoint_paths(config);
        remove_stale_socket(&to_clients)?;
        remove_stale_socket(&to_servers)?;

        let outbound_listener = UnixListener::bind(&to_clients)?;
        let inbound_listener = UnixListener::bind(&to_servers)?;
        info!(
            channel = %config.channel_name,
            "Hosting stream channel, waiting for worker to connect"
        );

        let (write_stream, _) = outbound_listener.accept()?;
        let (read_stream, _) = inbound_listener.accept()?;
        debug!(channel = %config.channel_name, "Worker connected to both endpoints");

        Self::start(config, pool, distributor, read_stream, write_stream, "host")
    }

    /// Connects both endpoints as the worker-side client.
    ///
    /// Retries until the host's listeners appear or
    /// [`BusConfig::connect_timeout_ms`] elapses.
    pub fn connect(
        config: &BusConfig,
        pool: BufferPool,
        distributor: Arc<PacketDistributor>,
    ) -> Result<Self, BusError> {
        let (to_clients, to_servers) = endpoint_paths(config);
        let deadline = Instant::now() + Duration::from_millis(config.connect_timeout_ms);

        let read_stream = connect_with_retry(&to_clients, deadline)?;
        let write_stream = connect_with_retry(&to_servers, deadline)?;
        info!(channel = %config.channel_name, "Connected to hosted stream channel");

        Self::start(config, pool, distributor, read_stream, write_stream, "client")
    }

    fn start(
        config: &BusConfig,
        pool: BufferPool,
        distributor: Arc<PacketDistributor>,
        read_stream: UnixStream,
        write_stream: UnixStream,
        role: &str,
    ) -> Result<Self, BusError> {
        let label = format!("{}/{}", config.channel_name, role);
        let (sender, outgoing) = channel::bounded(config.writer_queue_depth);
        let (stop_tx, stop_rx) = channel::bounded(0);
        let shutting_down = Arc::new(AtomicBool::new(false));

        let reader = {
            let stream = read_stream.try_clone()?;
            let shutting_down = Arc::clone(&shutting_down);
            let label = label.clone();
            thread::Builder::new()
                .name(format!("{}-stream-reader", config.channel_name))
                .spawn(move || run_reader_loop(stream, pool, distributor, shutting_down, label))?
        };

        let writer = {
            let mut stream = write_stream.try_clone()?;
            let label = label.clone();
            thread::Builder::new()
                .name(format!("{}-stream-writer", config.channel_name))
                .spawn(move || {
                    run_writer_loop(outgoing, stop_rx, label, move |bytes| {
                        stream.write_all(bytes)
                    });
                })?
        };

        Ok(Self {
            sender,
            stop: Some(stop_tx),
            read_stream,
            write_stream,
            shutting_down,
            reader: Some(reader),
            writer: Some(writer),
            label,
        })
    }

    /// Returns a producer handle onto this channel's bounded writer FIFO.
    ///
    /// Sending blocks while the FIFO is full; queued frames are written in
    /// FIFO order and their buffers released afterwards.
    pub fn sender(&self) -> Sender<BufferHandle> {
        self.sender.clone()
    }

    /// Shuts the channel down: the writer drains already-queued frames and
    /// stops, the reader's blocking read is interrupted by shutting down the
    /// socket, and both threads are joined. Idempotent.
    pub fn close(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        // Dropping the stop sender asks the writer to drain-then-stop.
        self.stop = None;
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!(channel = %self.label, "Writer thread panicked during shutdown");
            }
        }

        // Now interrupt the reader's blocking read.
        let _ = self.write_stream.shutdown(Shutdown::Both);
        let _ = self.read_stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!(channel = %self.label, "Reader thread panicked during shutdown");
            }
        }
        debug!(channel = %self.label, "Stream channel closed");
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn remove_stale_socket(path: &PathBuf) -> Result<(), BusError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BusError::Io(e)),
    }
}

fn connect_with_retry(path: &PathBuf, deadline: Instant) -> Result<UnixStream, BusError> {
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                // Host not listening yet; benign while the watchdog is still
                // starting up.
                if Instant::now() >= deadline {
                    return Err(BusError::Io(e));
                }
                thread::sleep(CONNECT_RETRY_INTERVAL);
            }
        }
    }
}

/// Reader loop: read one frame, dispatch every sub-message, repeat.
///
/// Transport closure ends the loop with a single log line (swallowed here at
/// the thread boundary, not rethrown); protocol errors abort the loop loudly
/// because they indicate schema drift between the two processes.
fn run_reader_loop(
    mut stream: UnixStream,
    pool: BufferPool,
    distributor: Arc<PacketDistributor>,
    shutting_down: Arc<AtomicBool>,
    label: String,
) {
    loop {
        let handle = pool.checkout();
        match codec::read_frame(&mut stream, &handle) {
            Ok(()) => {
                if let Err(e) = distributor.dispatch_frame(handle) {
                    error!(channel = %label, error = %e, "Receive loop aborted: protocol error");
                    break;
                }
            }
            Err(BusError::TransportClosed) => {
                if shutting_down.load(Ordering::SeqCst) {
                    debug!(channel = %label, "Receive loop stopped by shutdown");
                } else {
                    info!(channel = %label, "Peer closed the stream channel");
                }
                break;
            }
            Err(BusError::Io(e)) => {
                if shutting_down.load(Ordering::SeqCst) {
                    debug!(channel = %label, "Receive loop stopped by shutdown");
                } else {
                    warn!(channel = %label, error = %e, "Receive loop ended: I/O fault");
                }
                break;
            }
            Err(e) => {
                error!(channel = %label, error = %e, "Receive loop aborted: protocol error");
                break;
            }
        }
    }
}
