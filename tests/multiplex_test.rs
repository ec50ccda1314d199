//! Integration tests for keyed request multiplexing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

use imgpipe_core::context::{ImageRequest, RequestContext, RequestLevel};
use imgpipe_core::producers::{
    BitmapCacheKeyStrategy, ChannelConsumer, Consumer, ConsumerEvent, EncodedCacheKeyStrategy,
    KeyStrategy, Multiplexer, Producer,
};
use imgpipe_core::PipelineError;

type Started = (Arc<dyn Consumer<String>>, Arc<RequestContext>);

/// Holds every computation it starts so the test can drive it.
#[derive(Default)]
struct ManualProducer {
    started: Mutex<Vec<Started>>,
    count: AtomicUsize,
}

impl ManualProducer {
    fn computation(&self, index: usize) -> Started {
        self.started.lock()[index].clone()
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Producer<String> for ManualProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<String>>, context: Arc<RequestContext>) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.started.lock().push((consumer, context));
    }
}

/// Finishes inside `produce`.
struct ImmediateProducer;

impl Producer<String> for ImmediateProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<String>>, context: Arc<RequestContext>) {
        consumer.on_progress_update(1.0);
        consumer.on_new_result(&context.image_request().source, true);
    }
}

type Mux = Multiplexer<String, BitmapCacheKeyStrategy>;

fn setup() -> (Arc<ManualProducer>, Arc<Mux>) {
    let input = Arc::new(ManualProducer::default());
    let producer: Arc<dyn Producer<String>> = input.clone();
    (input, Arc::new(Multiplexer::new("bitmap", producer, BitmapCacheKeyStrategy)))
}

fn context(source: &str) -> Arc<RequestContext> {
    Arc::new(RequestContext::for_request(ImageRequest::new(source)))
}

fn consumer() -> (Arc<dyn Consumer<String>>, UnboundedReceiver<ConsumerEvent<String>>) {
    let (channel, rx) = ChannelConsumer::<String>::new();
    let consumer: Arc<dyn Consumer<String>> = channel;
    (consumer, rx)
}

fn key(ctx: &RequestContext) -> <BitmapCacheKeyStrategy as KeyStrategy<String>>::Key {
    KeyStrategy::<String>::key(&BitmapCacheKeyStrategy, ctx)
}

fn result(value: &str, is_last: bool) -> ConsumerEvent<String> {
    ConsumerEvent::Result {
        value: value.to_string(),
        is_last,
    }
}

#[test]
fn concurrent_requests_share_one_computation() {
    let (input, mux) = setup();
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let mux = mux.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let (consumer, rx) = consumer();
                barrier.wait();
                mux.produce(consumer, context("img://shared"));
                rx
            })
        })
        .collect();
    let mut receivers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(input.count(), 1);
    assert_eq!(mux.in_flight(), 1);
    assert_eq!(mux.consumer_count(&key(&context("img://shared"))), 8);

    let (forward, _) = input.computation(0);
    forward.on_new_result(&"decoded".to_string(), true);
    for rx in &mut receivers {
        assert_eq!(rx.try_recv().unwrap(), result("decoded", true));
        assert!(rx.try_recv().is_err());
    }
    assert_eq!(mux.in_flight(), 0);
}

#[test]
fn request_level_is_part_of_the_key() {
    let (input, mux) = setup();
    let full = context("img://1");
    let memory_only = Arc::new(RequestContext::for_request(
        ImageRequest::new("img://1")
            .with_lowest_permitted_request_level(RequestLevel::BitmapMemoryCache),
    ));
    let (a, _rx_a) = consumer();
    let (b, _rx_b) = consumer();
    mux.produce(a, full);
    mux.produce(b, memory_only);
    assert_eq!(input.count(), 2);
}

#[test]
fn failure_fans_out_to_every_consumer() {
    let (input, mux) = setup();
    let (a, mut rx_a) = consumer();
    let (b, mut rx_b) = consumer();
    mux.produce(a, context("img://1"));
    mux.produce(b, context("img://1"));

    let (forward, _) = input.computation(0);
    let error = PipelineError::Fetch("connection reset".into());
    forward.on_failure(&error);

    assert_eq!(rx_a.try_recv().unwrap(), ConsumerEvent::Failure(error.clone()));
    assert_eq!(rx_b.try_recv().unwrap(), ConsumerEvent::Failure(error));
    assert_eq!(mux.in_flight(), 0);
}

#[test]
fn one_cancellation_does_not_abort_others() {
    let (input, mux) = setup();
    let ctx_a = context("img://1");
    let (a, mut rx_a) = consumer();
    let (b, mut rx_b) = consumer();
    mux.produce(a, ctx_a.clone());
    mux.produce(b, context("img://1"));

    ctx_a.cancel();
    assert_eq!(rx_a.try_recv().unwrap(), ConsumerEvent::Cancellation);

    let (forward, delegate) = input.computation(0);
    assert!(!delegate.is_cancelled());
    forward.on_progress_update(0.5);
    forward.on_new_result(&"done".to_string(), true);

    assert!(rx_a.try_recv().is_err());
    assert_eq!(rx_b.try_recv().unwrap(), ConsumerEvent::Progress(0.5));
    assert_eq!(rx_b.try_recv().unwrap(), result("done", true));
}

#[test]
fn last_detach_cancels_and_next_request_starts_fresh() {
    let (input, mux) = setup();
    let ctx = context("img://1");
    let (a, mut rx_a) = consumer();
    mux.produce(a, ctx.clone());

    ctx.cancel();
    let (stale, delegate) = input.computation(0);
    assert!(delegate.is_cancelled());
    assert_eq!(rx_a.try_recv().unwrap(), ConsumerEvent::Cancellation);
    assert_eq!(mux.in_flight(), 0);

    let (b, mut rx_b) = consumer();
    mux.produce(b, context("img://1"));
    assert_eq!(input.count(), 2);

    stale.on_new_result(&"stale".to_string(), true);
    assert!(rx_b.try_recv().is_err());

    let (fresh, _) = input.computation(1);
    fresh.on_new_result(&"fresh".to_string(), true);
    assert_eq!(rx_b.try_recv().unwrap(), result("fresh", true));
}

#[test]
fn late_joiner_receives_latest_intermediate_result() {
    let (input, mux) = setup();
    let (a, mut rx_a) = consumer();
    mux.produce(a, context("img://1"));

    let (forward, _) = input.computation(0);
    forward.on_progress_update(0.25);
    forward.on_new_result(&"blurry".to_string(), false);
    assert_eq!(rx_a.try_recv().unwrap(), ConsumerEvent::Progress(0.25));
    assert_eq!(rx_a.try_recv().unwrap(), result("blurry", false));

    let (b, mut rx_b) = consumer();
    mux.produce(b, context("img://1"));
    assert_eq!(input.count(), 1);
    assert_eq!(rx_b.try_recv().unwrap(), ConsumerEvent::Progress(0.25));
    assert_eq!(rx_b.try_recv().unwrap(), result("blurry", false));

    forward.on_new_result(&"sharp".to_string(), true);
    assert_eq!(rx_a.try_recv().unwrap(), result("sharp", true));
    assert_eq!(rx_b.try_recv().unwrap(), result("sharp", true));
}

#[test]
fn underlying_cancellation_restarts_for_waiting_consumers() {
    let (input, mux) = setup();
    let (a, mut rx_a) = consumer();
    mux.produce(a, context("img://1"));

    let (first, _) = input.computation(0);
    first.on_cancellation();
    assert_eq!(input.count(), 2);
    assert!(rx_a.try_recv().is_err());

    let (second, _) = input.computation(1);
    second.on_new_result(&"retry".to_string(), true);
    assert_eq!(rx_a.try_recv().unwrap(), result("retry", true));
}

#[test]
fn synchronous_producer_completes_inside_produce() {
    let input: Arc<dyn Producer<String>> = Arc::new(ImmediateProducer);
    let mux = Multiplexer::new("encoded", input, EncodedCacheKeyStrategy);
    let (a, mut rx_a) = consumer();
    mux.produce(a, context("img://sync"));

    assert_eq!(rx_a.try_recv().unwrap(), ConsumerEvent::Progress(1.0));
    assert_eq!(rx_a.try_recv().unwrap(), result("img://sync", true));
    assert_eq!(mux.in_flight(), 0);
}

/// Issues a second request for the same key from inside the first result.
struct ReenteringConsumer {
    mux: Arc<Mux>,
    follow_up: Arc<dyn Consumer<String>>,
    fired: AtomicBool,
}

impl Consumer<String> for ReenteringConsumer {
    fn on_new_result(&self, _result: &String, is_last: bool) {
        if is_last && !self.fired.swap(true, Ordering::SeqCst) {
            self.mux.produce(self.follow_up.clone(), context("img://1"));
        }
    }

    fn on_failure(&self, _error: &PipelineError) {}

    fn on_cancellation(&self) {}
}

#[test]
fn consumer_may_reenter_during_delivery() {
    let (input, mux) = setup();
    let (follow_up, mut rx) = consumer();
    let reentering: Arc<dyn Consumer<String>> = Arc::new(ReenteringConsumer {
        mux: mux.clone(),
        follow_up,
        fired: AtomicBool::new(false),
    });
    mux.produce(reentering, context("img://1"));

    let (forward, _) = input.computation(0);
    forward.on_new_result(&"first".to_string(), true);
    assert_eq!(input.count(), 2);
    assert_eq!(mux.in_flight(), 1);

    let (second, _) = input.computation(1);
    second.on_new_result(&"second".to_string(), true);
    assert_eq!(rx.try_recv().unwrap(), result("second", true));
}

#[test]
fn cancelled_request_never_starts_a_computation() {
    let (input, mux) = setup();
    let ctx = context("img://1");
    ctx.cancel();

    let (a, mut rx_a) = consumer();
    mux.produce(a, ctx);

    assert_eq!(input.count(), 0);
    assert_eq!(mux.in_flight(), 0);
    assert_eq!(rx_a.try_recv().unwrap(), ConsumerEvent::Cancellation);
    assert!(rx_a.try_recv().is_err());
}

/// Requests another key of the same multiplexer on seeing `trigger`, after
/// meeting its twin on the other key.
struct ChainingConsumer {
    mux: Arc<Mux>,
    next: &'static str,
    rendezvous: Arc<Barrier>,
    follow_up: Arc<dyn Consumer<String>>,
}

impl Consumer<String> for ChainingConsumer {
    fn on_new_result(&self, result: &String, _is_last: bool) {
        if result == "trigger" {
            self.rendezvous.wait();
            self.mux.produce(self.follow_up.clone(), context(self.next));
        }
    }

    fn on_failure(&self, _error: &PipelineError) {}

    fn on_cancellation(&self) {}
}

#[test]
fn consumers_chaining_across_keys_do_not_block_each_other() {
    let (input, mux) = setup();
    let rendezvous = Arc::new(Barrier::new(2));
    let (follow_a, mut rx_follow_a) = consumer();
    let (follow_b, mut rx_follow_b) = consumer();
    let chain_a: Arc<dyn Consumer<String>> = Arc::new(ChainingConsumer {
        mux: mux.clone(),
        next: "img://b",
        rendezvous: rendezvous.clone(),
        follow_up: follow_b,
    });
    let chain_b: Arc<dyn Consumer<String>> = Arc::new(ChainingConsumer {
        mux: mux.clone(),
        next: "img://a",
        rendezvous,
        follow_up: follow_a,
    });
    mux.produce(chain_a, context("img://a"));
    mux.produce(chain_b, context("img://b"));

    let (forward_a, _) = input.computation(0);
    let (forward_b, _) = input.computation(1);
    forward_a.on_new_result(&"seed".to_string(), false);
    forward_b.on_new_result(&"seed".to_string(), false);

    let (done_tx, done_rx) = mpsc::channel();
    for forward in [forward_a.clone(), forward_b.clone()] {
        let done_tx = done_tx.clone();
        thread::spawn(move || {
            forward.on_new_result(&"trigger".to_string(), false);
            let _ = done_tx.send(());
        });
    }
    for _ in 0..2 {
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("chained delivery never returned");
    }

    assert_eq!(input.count(), 2);
    assert_eq!(mux.consumer_count(&key(&context("img://a"))), 2);
    assert_eq!(mux.consumer_count(&key(&context("img://b"))), 2);
    for rx in [&mut rx_follow_a, &mut rx_follow_b] {
        assert_eq!(rx.try_recv().unwrap(), ConsumerEvent::Progress(0.0));
        assert_eq!(rx.try_recv().unwrap(), result("trigger", false));
    }

    forward_a.on_new_result(&"done".to_string(), true);
    assert_eq!(rx_follow_a.try_recv().unwrap(), result("done", true));
}
