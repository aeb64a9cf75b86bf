//! # Transport Adapters
//!
//! Two interchangeable carriers move framed packets between the watchdog and
//! its peers:
//!
//! - [`stream::StreamChannel`] - a paired named byte-stream channel (Unix
//!   domain sockets) connecting the watchdog and the wrapped worker process.
//!   Reliable and ordered per direction; the primary control path.
//! - [`datagram::DatagramChannel`] - a loopback UDP channel for
//!   independently-launched tools. Unordered and lossy; only appropriate for
//!   messages whose loss is tolerable or whose sender retries (periodic
//!   health and metric snapshots).
//!
//! ## Threading Model
//!
//! Strictly thread-per-direction: each adapter owns exactly one reader and
//! one writer thread for its lifetime. There is no thread pool and no async
//! suspension; the only blocking points are the writer's FIFO dequeue, the
//! reader's blocking read/receive, and the datagram receive timeout.
//! Application code publishing messages never blocks on I/O - it blocks, at
//! most briefly, when the bounded writer FIFO is full.
//!
//! ## Shutdown
//!
//! Closing an adapter asks the writer to drain-then-stop (already-queued
//! frames still go out) and interrupts the reader's blocking call, which
//! surfaces as the transport-closed condition and is swallowed at the thread
//! boundary - a graceful shutdown racing the peer's exit is not an error.

pub mod datagram;
pub mod stream;

use crate::pool::BufferHandle;
use crossbeam::channel::Receiver;
use std::io;
use tracing::{debug, warn};

/// Writer loop shared by both adapters.
///
/// Drains buffer handles from the bounded FIFO and hands each frame's bytes
/// to `write_frame`; the handle is released (dropped) after the write, which
/// is what returns the buffer to the pool. Dropping the paired stop sender
/// makes the loop drain whatever is already queued and then exit; a write
/// error stops it immediately.
pub(crate) fn run_writer_loop(
    outgoing: Receiver<BufferHandle>,
    stop: Receiver<()>,
    label: String,
    mut write_frame: impl FnMut(&[u8]) -> io::Result<()>,
) {
    loop {
        crossbeam::channel::select! {
            recv(outgoing) -> next => match next {
                Ok(handle) => {
                    if write_handle(&handle, &mut write_frame, &label).is_err() {
                        return;
                    }
                }
                // Every producer dropped its sender; nothing more can arrive.
                Err(_) => break,
            },
            recv(stop) -> _ => {
                // Drain-then-stop: flush frames that made it into the queue
                // before the shutdown request, then exit.
                while let Ok(handle) = outgoing.try_recv() {
                    if write_handle(&handle, &mut write_frame, &label).is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    debug!(channel = %label, "Writer thread drained and stopped");
}

fn write_handle(
    handle: &BufferHandle,
    write_frame: &mut impl FnMut(&[u8]) -> io::Result<()>,
    label: &str,
) -> Result<(), ()> {
    let bytes = handle.bytes();
    if let Err(e) = write_frame(&bytes) {
        warn!(channel = %label, error = %e, "Writer thread stopped: frame write failed");
        return Err(());
    }
    Ok(())
}
