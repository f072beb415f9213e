use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{Builder, Scope, ScopedJoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use argh::FromArgs;
use nix::errno::Errno;

#[derive(Debug, FromArgs)]
/// Producers and consumers sharing the queue through its syscalls
#[argh(help_triggers("--help"))]
struct Args {
    /// number of producer threads
    #[argh(option, default = "2", arg_name = "int")]
    producers: usize,
    /// number of consumer threads
    #[argh(option, default = "2", arg_name = "int")]
    consumers: usize,
    /// values inserted by each producer
    #[argh(option, default = "10", arg_name = "int")]
    items: usize,
    /// pause after each insert, in milliseconds
    #[argh(option, default = "100", arg_name = "ms")]
    produce_delay: u64,
    /// pause after each remove, in milliseconds
    #[argh(option, default = "150", arg_name = "ms")]
    consume_delay: u64,
    /// interrupt blocked consumers every given milliseconds
    #[argh(option, arg_name = "ms")]
    interrupt_every: Option<u64>,
}

/// State shared by all threads of one run.
struct Shared {
    /// Values not yet claimed by a consumer.
    remaining: AtomicUsize,
    aborted: AtomicBool,
    done: AtomicBool,
}

impl Shared {
    fn new(total: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(total),
            aborted: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    /// Claims one value to dequeue. Fails once every value is claimed or the
    /// run is aborted.
    fn claim(&self) -> bool {
        !self.is_aborted()
            && self
                .remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Makes every consumer return, interrupting the queue until the blocked
    /// ones have woken up.
    fn abort<T>(&self, consumers: &[ScopedJoinHandle<'_, T>]) {
        self.aborted.store(true, Ordering::Release);
        while consumers.iter().any(|task| !task.is_finished()) {
            kqueue::global().interrupt();
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

pub fn main() -> Result<()> {
    let args = argh::from_env::<Args>();
    tracing_subscriber::fmt()
        .with_thread_names(true)
        .without_time()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let total = args
        .producers
        .checked_mul(args.items)
        .filter(|&n| i32::try_from(n).is_ok())
        .ok_or_else(|| anyhow!("too many values to produce"))?;
    if total != 0 && args.consumers == 0 {
        return Err(anyhow!("at least one consumer is required"));
    }
    let shared = Shared::new(total);

    tracing::info!(
        "started test, producers={}, consumers={}, items={}",
        args.producers,
        args.consumers,
        args.items
    );
    let (mut produced, mut consumed) = std::thread::scope(|cx| -> Result<_> {
        if let Some(ms) = args.interrupt_every {
            let (shared, period) = (&shared, Duration::from_millis(ms));
            Builder::new()
                .name("interrupter".into())
                .spawn_scoped(cx, move || interrupter(shared, period))
                .context("failed to spawn interrupter")?;
        }
        let ret = exchange(cx, &shared, &args);
        shared.done.store(true, Ordering::Release);
        ret
    })?;

    produced.sort_unstable();
    consumed.sort_unstable();
    if produced != consumed {
        return Err(anyhow!(
            "lost or duplicated values, produced={produced:?}, consumed={consumed:?}"
        ));
    }
    tracing::info!("finished test, transferred={}", consumed.len());
    Ok(())
}

/// Runs all producers and consumers, returning the values each side saw.
///
/// If a producer fails, the consumers are aborted and its error is returned.
fn exchange<'scope>(
    cx: &'scope Scope<'scope, '_>,
    shared: &'scope Shared,
    args: &Args,
) -> Result<(Vec<i32>, Vec<i32>)> {
    let items = args.items;
    let produce_delay = Duration::from_millis(args.produce_delay);
    let consume_delay = Duration::from_millis(args.consume_delay);

    let mut consumers = Vec::with_capacity(args.consumers);
    for c in 0..args.consumers {
        let task = Builder::new()
            .name(format!("consumer-{c}"))
            .spawn_scoped(cx, move || consume(shared, consume_delay));
        match task {
            Ok(task) => consumers.push(task),
            Err(e) => {
                shared.abort(&consumers);
                return Err(e).context("failed to spawn consumers");
            },
        }
    }
    let producers = (0..args.producers)
        .map(|p| {
            Builder::new()
                .name(format!("producer-{p}"))
                .spawn_scoped(cx, move || produce(p, items, produce_delay))
        })
        .collect::<Vec<_>>();

    let mut produced = vec![];
    let mut failure = None;
    for task in producers {
        let ret = match task {
            Ok(task) => task.join().map_err(|_| anyhow!("producer panicked")),
            Err(e) => Err(e).context("failed to spawn producer"),
        };
        match ret.and_then(|ret| ret) {
            Ok(vals) => produced.extend(vals),
            Err(e) => {
                failure.get_or_insert(e);
            },
        }
    }
    if let Some(e) = failure {
        tracing::error!("aborting consumers: {e:#}");
        shared.abort(&consumers);
        return Err(e);
    }

    let mut consumed = vec![];
    for task in consumers {
        consumed.extend(task.join().map_err(|_| anyhow!("consumer panicked"))??);
    }
    Ok((produced, consumed))
}

fn produce(p: usize, items: usize, delay: Duration) -> Result<Vec<i32>> {
    let mut produced = Vec::with_capacity(items);
    for i in 0..items {
        // Bounded by the total checked in `main`.
        let val = (p * items + i + 1) as i32;
        user::enqueue(val).with_context(|| format!("failed to enqueue {val}"))?;
        tracing::info!("enqueued {val}");
        produced.push(val);
        std::thread::sleep(jitter(delay));
    }
    Ok(produced)
}

fn consume(shared: &Shared, delay: Duration) -> Result<Vec<i32>> {
    let mut consumed = vec![];
    while shared.claim() {
        let val = loop {
            match user::dequeue() {
                Ok(val) => break val,
                Err(Errno::EINTR) if shared.is_aborted() => {
                    tracing::warn!("aborted, dequeued={}", consumed.len());
                    return Ok(consumed);
                },
                Err(e @ (Errno::EAGAIN | Errno::EINTR)) => tracing::warn!("retrying dequeue: {e}"),
                Err(e) => return Err(e).context("failed to dequeue"),
            }
        };
        tracing::info!("dequeued {val}");
        consumed.push(val);
        std::thread::sleep(jitter(delay));
    }
    Ok(consumed)
}

fn interrupter(shared: &Shared, period: Duration) {
    while !shared.done.load(Ordering::Acquire) {
        std::thread::sleep(period);
        kqueue::global().interrupt();
        tracing::debug!("interrupted waiting consumers");
    }
}

fn jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    Duration::from_millis(ms + fastrand::u64(0..=ms / 4))
}
