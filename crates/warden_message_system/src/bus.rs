//! # Typed Pub/Sub Façade
//!
//! [`MessageBus`] binds the tag registry, the packet distributor and an
//! outgoing batch over one transport adapter into the API the rest of the
//! application sees: `publish`, `subscribe`, `request`, `flush`.
//!
//! A bus is an explicit value constructed once at startup and passed to
//! every publisher and subscriber - there are no ambient singletons. One bus
//! serves one direction-pair: the watchdog's bus and the worker's bus are
//! independent values on opposite ends of the same channel.
//!
//! Publishers never learn whether anyone is listening: a peer crash shows up
//! as the subscriber side going silent, not as an error raised on publish.

use crate::batch::OutgoingBatch;
use crate::config::BusConfig;
use crate::distributor::{PacketDistributor, TypedMessageHandler};
use crate::pool::{BufferHandle, BufferPool};
use crate::registry::MessageRegistry;
use crate::{BusError, BusMessage};
use crossbeam::channel::Sender;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// The typed publish/subscribe façade over one transport adapter.
#[derive(Debug)]
pub struct MessageBus {
    registry: Arc<MessageRegistry>,
    distributor: Arc<PacketDistributor>,
    batch: OutgoingBatch,
}

impl MessageBus {
    /// Assembles a bus from its parts.
    ///
    /// `sink` is a transport adapter's writer queue
    /// ([`StreamChannel::sender`](crate::StreamChannel::sender) or
    /// [`DatagramChannel::sender`](crate::DatagramChannel::sender));
    /// `distributor` must be the same one the adapter dispatches into, and
    /// `registry` must be built identically in both processes.
    pub fn new(
        registry: Arc<MessageRegistry>,
        distributor: Arc<PacketDistributor>,
        pool: BufferPool,
        sink: Sender<BufferHandle>,
        config: &BusConfig,
    ) -> Self {
        Self {
            registry,
            distributor,
            batch: OutgoingBatch::new(pool, sink, config.flush_threshold_bytes),
        }
    }

    /// Creates a publish token for message type `T`.
    ///
    /// Fails if `T` was never registered - publishing an unregistered type
    /// would be undecodable on the peer.
    pub fn publish<T: BusMessage>(&self) -> Result<PublishToken<'_, T>, BusError> {
        let tag = self.registry.tag_of::<T>()?;
        Ok(PublishToken {
            batch: &self.batch,
            tag,
            _phantom: PhantomData,
        })
    }

    /// Convenience for `publish::<T>()?.send(message)`.
    pub fn send<T: BusMessage>(&self, message: T) -> Result<(), BusError> {
        self.publish::<T>()?.send(message)
    }

    /// Registers `callback` as the single subscriber for message type `T`.
    ///
    /// The callback runs synchronously on the transport's reader thread.
    /// Dropping the returned [`Subscription`] unregisters it; the callback
    /// is guaranteed never to fire afterwards.
    pub fn subscribe<T, F>(&self, callback: F) -> Result<Subscription, BusError>
    where
        T: BusMessage,
        F: Fn(T) -> Result<(), BusError> + Send + Sync + 'static,
    {
        let tag = self.registry.tag_of::<T>()?;
        let handler = Arc::new(TypedMessageHandler::new(
            format!("subscription:{}", T::type_name()),
            callback,
        ));
        self.distributor.register(tag, handler)?;
        debug!(tag, message_type = T::type_name(), "Subscribed");
        Ok(Subscription {
            distributor: Arc::clone(&self.distributor),
            tag,
        })
    }

    /// Request/response layered over pure pub/sub.
    ///
    /// Subscribes for `T`, runs `trigger` (usually a publish of the request
    /// message), flushes, then waits for the first `T` the `converter`
    /// accepts - or the timeout. The temporary subscription is removed on
    /// every exit path: success, timeout or error.
    pub fn request<T, R, Trigger, Converter>(
        &self,
        trigger: Trigger,
        converter: Converter,
        timeout: Duration,
    ) -> Result<R, BusError>
    where
        T: BusMessage,
        R: Send + 'static,
        Trigger: FnOnce(&Self) -> Result<(), BusError>,
        Converter: Fn(T) -> Option<R> + Send + Sync + 'static,
    {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded::<R>(1);
        let subscription = self.subscribe(move |message: T| {
            if let Some(reply) = converter(message) {
                // Only the first accepted reply counts; later ones hit a
                // full (or disconnected) slot and are dropped.
                let _ = reply_tx.try_send(reply);
            }
            Ok(())
        })?;

        let outcome = (|| {
            trigger(self)?;
            self.flush()?;
            reply_rx
                .recv_timeout(timeout)
                .map_err(|_| BusError::Timeout(timeout))
        })();

        // RAII would handle this anyway; the explicit drop documents that
        // the subscription must not outlive the wait.
        drop(subscription);
        outcome
    }

    /// Forces the current outgoing batch onto the wire.
    pub fn flush(&self) -> Result<(), BusError> {
        self.batch.flush()
    }

    /// The registry this bus publishes and subscribes against.
    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    /// The distributor serving this bus's receive path.
    pub fn distributor(&self) -> &Arc<PacketDistributor> {
        &self.distributor
    }
}

/// A single-use token for publishing one message of type `T`.
///
/// [`send`](Self::send) consumes the token, so sending twice through one
/// token is a compile-time error rather than a runtime fault.
#[derive(Debug)]
pub struct PublishToken<'a, T: BusMessage> {
    batch: &'a OutgoingBatch,
    tag: u8,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: BusMessage> PublishToken<'_, T> {
    /// Finalizes `message` into the outgoing batch under `T`'s tag.
    ///
    /// The batch flushes on its own once it crosses the configured
    /// threshold; otherwise the message rides along with the next flush.
    pub fn send(self, message: T) -> Result<(), BusError> {
        self.batch.append(self.tag, &message)
    }

    /// The wire tag this token publishes under.
    pub fn tag(&self) -> u8 {
        self.tag
    }
}

/// A live subscription; dropping it unregisters the handler.
#[derive(Debug)]
pub struct Subscription {
    distributor: Arc<PacketDistributor>,
    tag: u8,
}

impl Subscription {
    /// The wire tag this subscription listens on.
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Explicitly ends the subscription (equivalent to dropping it).
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.distributor.unregister(self.tag);
        debug!(tag = self.tag, "Unsubscribed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::messages::{standard_registry, HealthPing, HealthPong};
    use crate::utils::current_timestamp;
    use crossbeam::channel;
    use std::sync::Mutex;
    use std::thread;

    fn make_bus() -> (MessageBus, channel::Receiver<BufferHandle>, BufferPool) {
        let pool = BufferPool::new(256);
        let (tx, rx) = channel::bounded(16);
        let bus = MessageBus::new(
            Arc::new(standard_registry().unwrap()),
            Arc::new(PacketDistributor::new()),
            pool.clone(),
            tx,
            &BusConfig::default(),
        );
        (bus, rx, pool)
    }

    /// Builds the inner frame for one message and dispatches it, simulating
    /// what a transport reader thread does on arrival.
    fn deliver<T: BusMessage>(bus: &MessageBus, pool: &BufferPool, message: &T) {
        let tag = bus.registry().tag_of::<T>().unwrap();
        let handle = pool.checkout();
        {
            let mut buf = handle.bytes();
            buf.extend_from_slice(&1u32.to_le_bytes());
            let payload = message.encode().unwrap();
            codec::write_varint(&mut buf, payload.len());
            buf.extend_from_slice(&payload);
            buf.push(tag);
        }
        bus.distributor().dispatch_frame(handle).unwrap();
    }

    #[test]
    fn test_publish_token_tags_messages_from_the_registry() {
        let (bus, rx, pool) = make_bus();
        let token = bus.publish::<HealthPing>().unwrap();
        assert_eq!(token.tag(), 1);
        token
            .send(HealthPing {
                sequence: 1,
                timestamp: current_timestamp(),
            })
            .unwrap();
        bus.flush().unwrap();

        let frame = rx.try_recv().expect("flush queued no frame");
        let receive = pool.checkout();
        let wire = frame.bytes().clone();
        let mut cursor = std::io::Cursor::new(wire);
        codec::read_frame(&mut cursor, &receive).unwrap();
        let tokens = codec::split_frame(&receive).unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].tag(), 1);
    }

    #[test]
    fn test_publishing_an_unregistered_type_fails() {
        #[derive(Debug, serde::Serialize, serde::Deserialize)]
        struct NotRegistered {
            value: u8,
        }
        let (bus, _rx, _pool) = make_bus();
        assert!(matches!(
            bus.publish::<NotRegistered>(),
            Err(BusError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn test_subscribe_delivers_typed_messages() {
        let (bus, _rx, pool) = make_bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = bus
            .subscribe(move |ping: HealthPing| {
                seen_clone.lock().unwrap().push(ping.sequence);
                Ok(())
            })
            .unwrap();

        deliver(
            &bus,
            &pool,
            &HealthPing {
                sequence: 99,
                timestamp: 0,
            },
        );
        assert_eq!(seen.lock().unwrap().as_slice(), &[99]);
    }

    #[test]
    fn test_disposed_subscription_never_fires() {
        let (bus, _rx, pool) = make_bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sub = bus
            .subscribe(move |ping: HealthPing| {
                seen_clone.lock().unwrap().push(ping.sequence);
                Ok(())
            })
            .unwrap();
        sub.unsubscribe();

        // Delivery now fails with an unregistered tag and, crucially, the
        // disposed callback does not run.
        let tag = bus.registry().tag_of::<HealthPing>().unwrap();
        let handle = pool.checkout();
        {
            let mut buf = handle.bytes();
            buf.extend_from_slice(&1u32.to_le_bytes());
            let payload = HealthPing {
                sequence: 1,
                timestamp: 0,
            }
            .encode()
            .unwrap();
            codec::write_varint(&mut buf, payload.len());
            buf.extend_from_slice(&payload);
            buf.push(tag);
        }
        assert!(bus.distributor().dispatch_frame(handle).is_err());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_second_subscriber_for_a_type_is_rejected() {
        let (bus, _rx, _pool) = make_bus();
        let _first = bus.subscribe(|_: HealthPing| Ok(())).unwrap();
        assert!(matches!(
            bus.subscribe(|_: HealthPing| Ok(())),
            Err(BusError::DuplicateHandler(1))
        ));
    }

    #[test]
    fn test_request_receives_matching_reply() {
        let (bus, _rx, pool) = make_bus();
        let bus = Arc::new(bus);

        // Simulate the peer answering the ping after a short delay.
        let responder = {
            let bus = Arc::clone(&bus);
            let pool = pool.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                deliver(
                    &bus,
                    &pool,
                    &HealthPong {
                        sequence: 5,
                        timestamp: 0,
                    },
                );
            })
        };

        let sequence = bus
            .request::<HealthPong, u64, _, _>(
                |bus| {
                    bus.send(HealthPing {
                        sequence: 5,
                        timestamp: 0,
                    })
                },
                |pong| Some(pong.sequence),
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(sequence, 5);
        responder.join().unwrap();

        // The temporary subscription is gone: registering a fresh pong
        // subscriber must succeed.
        assert!(bus.subscribe(|_: HealthPong| Ok(())).is_ok());
    }

    #[test]
    fn test_request_times_out_and_unsubscribes() {
        let (bus, _rx, _pool) = make_bus();
        let result = bus.request::<HealthPong, u64, _, _>(
            |_| Ok(()),
            |pong| Some(pong.sequence),
            Duration::from_millis(20),
        );
        assert!(matches!(result, Err(BusError::Timeout(_))));
        // Timed-out requests must not leak their handler.
        assert!(bus.subscribe(|_: HealthPong| Ok(())).is_ok());
    }

    #[test]
    fn test_converter_can_skip_non_matching_replies() {
        let (bus, _rx, pool) = make_bus();
        let bus = Arc::new(bus);

        let responder = {
            let bus = Arc::clone(&bus);
            let pool = pool.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                // Wrong sequence first; the converter rejects it.
                deliver(&bus, &pool, &HealthPong { sequence: 1, timestamp: 0 });
                thread::sleep(Duration::from_millis(20));
                deliver(&bus, &pool, &HealthPong { sequence: 2, timestamp: 0 });
            })
        };

        let got = bus
            .request::<HealthPong, u64, _, _>(
                |_| Ok(()),
                |pong| (pong.sequence == 2).then_some(pong.sequence),
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(got, 2);
        responder.join().unwrap();
    }
}
