use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::collector::{Collector, CollectorConfig};
use crate::config::SubstrateConfig;
use crate::link::LinkStatus;
use crate::stanza::Stanza;

/// Seam to the actual wire: the pipeline hands fully intercepted outbound stanzas to this.
pub trait Transport<M>: Send + Sync {
    fn send(&self, stanza: &M) -> anyhow::Result<()>;
}

/// Consumer of inbound push stanzas. All registered listeners see all stanzas, delivered
///  single-threaded in strict arrival order.
pub trait StanzaListener<M>: Send + Sync {
    fn process(&self, stanza: &M);
}

impl<M, F> StanzaListener<M> for F
where
    F: Fn(&M) + Send + Sync,
{
    fn process(&self, stanza: &M) {
        self(stanza)
    }
}

/// Runs synchronously on the sending thread before a stanza reaches the transport, and may
///  mutate the stanza. A slow interceptor therefore directly throttles senders - an
///  accepted trade-off favoring correctness over throughput.
pub trait StanzaInterceptor<M>: Send + Sync {
    fn intercept(&self, stanza: &mut M);
}

impl<M, F> StanzaInterceptor<M> for F
where
    F: Fn(&mut M) + Send + Sync,
{
    fn intercept(&self, stanza: &mut M) {
        self(stanza)
    }
}

enum DeliveryItem<M> {
    Stanza(M),
    Shutdown,
}

/// The thin layer between the transport and everything that consumes stanzas: inbound
///  stanzas are fed to every live collector and then delivered to push listeners on one
///  single-threaded, strictly arrival-ordered queue; outbound stanzas pass through the
///  interceptor chain before reaching the transport.
pub struct DispatchPipeline<M: Stanza> {
    link: Arc<LinkStatus>,
    transport: Arc<dyn Transport<M>>,
    reply_timeout: Duration,
    collectors: Mutex<Vec<Arc<Collector<M>>>>,
    listeners: Arc<Mutex<Vec<Arc<dyn StanzaListener<M>>>>>,
    interceptors: Mutex<Vec<Arc<dyn StanzaInterceptor<M>>>>,
    delivery_queue: Sender<DeliveryItem<M>>,
    delivery_worker: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Stanza> DispatchPipeline<M> {
    pub fn new(
        transport: Arc<dyn Transport<M>>,
        link: Arc<LinkStatus>,
        config: &SubstrateConfig,
    ) -> DispatchPipeline<M> {
        let (delivery_queue, inbound) = unbounded::<DeliveryItem<M>>();
        let listeners: Arc<Mutex<Vec<Arc<dyn StanzaListener<M>>>>> = Default::default();

        let worker_listeners = listeners.clone();
        let delivery_worker = thread::Builder::new()
            .name("stanza-io delivery".to_string())
            .spawn(move || {
                // a single consumer keeps inbound delivery strictly arrival-ordered for
                //  all listeners
                while let Ok(item) = inbound.recv() {
                    match item {
                        DeliveryItem::Stanza(stanza) => {
                            let listeners: Vec<_> = worker_listeners.lock().clone();
                            for listener in listeners {
                                listener.process(&stanza);
                            }
                        }
                        DeliveryItem::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn delivery worker thread");

        DispatchPipeline {
            link,
            transport,
            reply_timeout: config.reply_timeout,
            collectors: Mutex::new(Vec::new()),
            listeners,
            interceptors: Mutex::new(Vec::new()),
            delivery_queue,
            delivery_worker: Mutex::new(Some(delivery_worker)),
        }
    }

    pub fn link(&self) -> &Arc<LinkStatus> {
        &self.link
    }

    /// Builds a collector from the given configuration and registers it so it sees all
    ///  future inbound stanzas until it is cancelled.
    pub fn new_collector(&self, config: CollectorConfig<M>) -> Arc<Collector<M>> {
        let collector = config.build(self.link.clone(), self.reply_timeout);
        self.collectors.lock().push(collector.clone());
        collector
    }

    pub fn add_listener(&self, listener: Arc<dyn StanzaListener<M>>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn StanzaListener<M>>) -> bool {
        let mut listeners = self.listeners.lock();
        let len_before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != len_before
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn StanzaInterceptor<M>>) {
        self.interceptors.lock().push(interceptor);
    }

    /// Entry point for the transport: hands one decoded inbound stanza to all collectors
    ///  and enqueues it for ordered listener delivery.
    pub fn process_incoming(&self, stanza: M) {
        {
            let mut collectors = self.collectors.lock();
            collectors.retain(|collector| !collector.is_cancelled());
            for collector in collectors.iter() {
                collector.offer(&stanza);
            }
        }

        if self.delivery_queue.send(DeliveryItem::Stanza(stanza)).is_err() {
            warn!("delivery queue is shut down - dropping inbound stanza");
        }
    }

    /// Routes one outbound stanza through the interceptors, in registration order, then
    ///  hands it to the transport.
    pub fn send(&self, mut stanza: M) -> anyhow::Result<()> {
        let interceptors: Vec<_> = self.interceptors.lock().clone();
        for interceptor in interceptors {
            interceptor.intercept(&mut stanza);
        }
        self.transport.send(&stanza)
    }

    /// Stops the delivery worker after all already queued stanzas have been delivered.
    pub fn shutdown(&self) {
        let worker = self.delivery_worker.lock().take();
        if let Some(worker) = worker {
            trace!("shutting down delivery worker");
            let _ = self.delivery_queue.send(DeliveryItem::Shutdown);
            let _ = worker.join();
        }
    }

    #[cfg(test)]
    fn live_collector_count(&self) -> usize {
        self.collectors.lock().len()
    }
}

impl<M: Stanza> Drop for DispatchPipeline<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
