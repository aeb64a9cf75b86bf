//! # Loopback Datagram Channel
//!
//! A secondary bus over loopback UDP, used where a full byte-stream session
//! is unwanted - typically between independently-launched tools exchanging
//! periodic health or metric snapshots.
//!
//! One socket per direction, bound to a configured loopback port pair. Each
//! outgoing frame is sent as one datagram with no outer length prefix (the
//! datagram boundary is authoritative); the inner structure is identical to
//! the stream format. Receive timeouts are expected and benign - they mean
//! "peer not up yet" - and are never logged as errors.
//!
//! UDP is unordered and lossy. This adapter must not be used where the
//! stream channel's reliability is required.

use crate::codec::{self, LENGTH_PREFIX_BYTES};
use crate::config::DatagramConfig;
use crate::distributor::PacketDistributor;
use crate::pool::{BufferHandle, BufferPool};
use crate::transport::run_writer_loop;
use crate::BusError;
use crossbeam::channel::{self, Sender};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A unidirectional-pair datagram bus endpoint.
///
/// Owns a receiver thread (blocking receive with a short timeout, decode,
/// dispatch) and a sender thread (drain the bounded FIFO, one datagram per
/// frame).
#[derive(Debug)]
pub struct DatagramChannel {
    sender: Sender<BufferHandle>,
    stop: Option<Sender<()>>,
    shutting_down: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    local_port: u16,
    label: String,
}

impl DatagramChannel {
    /// Binds the receive socket on `config.bind_port` (0 for an ephemeral
    /// port) and directs sends at `config.peer_port`, both on loopback.
    ///
    /// Socket buffers are sized to `config.socket_buffer_bytes`; a payload
    /// must fit a single datagram, bounded by that size.
    pub fn open(
        config: &DatagramConfig,
        pool: BufferPool,
        distributor: Arc<PacketDistributor>,
    ) -> Result<Self, BusError> {
        let recv_socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, config.bind_port))?;
        recv_socket.set_read_timeout(Some(Duration::from_millis(config.recv_timeout_ms)))?;
        socket2::SockRef::from(&recv_socket).set_recv_buffer_size(config.socket_buffer_bytes)?;
        let local_port = recv_socket.local_addr()?.port();

        let send_socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        socket2::SockRef::from(&send_socket).set_send_buffer_size(config.socket_buffer_bytes)?;
        let peer: SocketAddr = (Ipv4Addr::LOCALHOST, config.peer_port).into();

        let label = format!("datagram:{local_port}->{}", config.peer_port);
        info!(channel = %label, "Opened loopback datagram channel");

        let (sender, outgoing) = channel::bounded(config.writer_queue_depth);
        let (stop_tx, stop_rx) = channel::bounded(0);
        let shutting_down = Arc::new(AtomicBool::new(false));
        let max_datagram_bytes = config.max_datagram_bytes;

        let receiver = {
            let shutting_down = Arc::clone(&shutting_down);
            let label = label.clone();
            thread::Builder::new()
                .name(format!("datagram-receiver-{local_port}"))
                .spawn(move || {
                    run_receiver_loop(
                        recv_socket,
                        pool,
                        distributor,
                        shutting_down,
                        max_datagram_bytes,
                        label,
                    )
                })?
        };

        let writer = {
            let label = label.clone();
            let send_label = label.clone();
            thread::Builder::new()
                .name(format!("datagram-sender-{local_port}"))
                .spawn(move || {
                    run_writer_loop(outgoing, stop_rx, label, move |bytes| {
                        // Datagram boundaries replace the outer length
                        // prefix; send only the inner frame content. Send
                        // failures drop the frame - loss is this adapter's
                        // contract.
                        if let Err(e) = send_socket.send_to(&bytes[LENGTH_PREFIX_BYTES..], peer) {
                            debug!(channel = %send_label, error = %e, "Datagram send failed, frame dropped");
                        }
                        Ok(())
                    });
                })?
        };

        Ok(Self {
            sender,
            stop: Some(stop_tx),
            shutting_down,
            receiver: Some(receiver),
            writer: Some(writer),
            local_port,
            label,
        })
    }

    /// Returns a producer handle onto this channel's bounded sender FIFO.
    pub fn sender(&self) -> Sender<BufferHandle> {
        self.sender.clone()
    }

    /// The port the receive socket actually bound, useful when configured
    /// with port 0.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Shuts the channel down: drains the sender FIFO, stops both threads
    /// and joins them. The receiver notices the flag within one receive
    /// timeout. Idempotent.
    pub fn close(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.stop = None;
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!(channel = %self.label, "Sender thread panicked during shutdown");
            }
        }
        if let Some(receiver) = self.receiver.take() {
            if receiver.join().is_err() {
                warn!(channel = %self.label, "Receiver thread panicked during shutdown");
            }
        }
        debug!(channel = %self.label, "Datagram channel closed");
    }
}

impl Drop for DatagramChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receiver loop: block (with timeout) for one datagram, copy it into a
/// fresh checked-out buffer, decode and dispatch.
fn run_receiver_loop(
    socket: UdpSocket,
    pool: BufferPool,
    distributor: Arc<PacketDistributor>,
    shutting_down: Arc<AtomicBool>,
    max_datagram_bytes: usize,
    label: String,
) {
    while !shutting_down.load(Ordering::SeqCst) {
        let handle = pool.checkout();
        let received = {
            let mut buf = handle.bytes();
            buf.resize(max_datagram_bytes, 0);
            match socket.recv(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    true
                }
                // Timeouts mean "peer not up yet" and are expected; never
                // log them as errors.
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => false,
                Err(e) => {
                    if !shutting_down.load(Ordering::SeqCst) {
                        warn!(channel = %label, error = %e, "Receive loop ended: socket fault");
                    }
                    return;
                }
            }
        };
        if !received {
            continue;
        }

        if let Err(e) = distributor.dispatch_frame(handle) {
            error!(channel = %label, error = %e, "Receive loop aborted: protocol error");
            return;
        }
    }
    debug!(channel = %label, "Receive loop stopped by shutdown");
}
