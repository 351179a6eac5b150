// ── Local statistics collector ──
//
// Byte and message totals come from the link counters: live ones for the
// open session plus an archive of every closed session. Rates are computed
// once per second by the session's stats task and published through
// `ArcSwap` so readers never block.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use scrutiny_api::LinkCounters;
use tokio::time::Instant;

use crate::model::LocalStatistics;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Rates {
    rx_data: f64,
    tx_data: f64,
    rx_messages: f64,
    tx_messages: f64,
}

struct Window {
    started: Instant,
    totals: LinkCounters,
}

pub(crate) struct StatsCollector {
    archived: Mutex<LinkCounters>,
    window: Mutex<Window>,
    rates: ArcSwap<Rates>,
    connect_count: AtomicU64,
    last_latency_us: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_samples: AtomicU64,
}

impl StatsCollector {
    pub(crate) fn new() -> Self {
        Self {
            archived: Mutex::new(LinkCounters::default()),
            window: Mutex::new(Window {
                started: Instant::now(),
                totals: LinkCounters::default(),
            }),
            rates: ArcSwap::from_pointee(Rates::default()),
            connect_count: AtomicU64::new(0),
            last_latency_us: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_connect(&self) {
        self.connect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_latency(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.last_latency_us.store(us, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(us, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a closed session's counters into the running totals.
    pub(crate) fn archive(&self, session: LinkCounters) {
        if let Ok(mut archived) = self.archived.lock() {
            *archived = add(*archived, session);
        }
    }

    fn totals(&self, live: Option<LinkCounters>) -> LinkCounters {
        let archived = self.archived.lock().map(|a| *a).unwrap_or_default();
        add(archived, live.unwrap_or_default())
    }

    /// Close the current rate window.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub(crate) fn tick(&self, live: Option<LinkCounters>) {
        let totals = self.totals(live);
        let Ok(mut window) = self.window.lock() else {
            return;
        };
        let elapsed = window.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let per_sec = |now: u64, before: u64| now.saturating_sub(before) as f64 / elapsed;
        self.rates.store(std::sync::Arc::new(Rates {
            rx_data: per_sec(totals.rx_bytes, window.totals.rx_bytes),
            tx_data: per_sec(totals.tx_bytes, window.totals.tx_bytes),
            rx_messages: per_sec(totals.rx_datagrams, window.totals.rx_datagrams),
            tx_messages: per_sec(totals.tx_datagrams, window.totals.tx_datagrams),
        }));
        *window = Window {
            started: Instant::now(),
            totals,
        };
    }

    /// Rates fall back to zero between sessions.
    pub(crate) fn reset_rates(&self) {
        self.rates.store(std::sync::Arc::new(Rates::default()));
    }

    /// Start measuring from scratch: rates, the rate window and request
    /// latency. Traffic totals and connect counts are cumulative and stay.
    pub(crate) fn reset(&self, live: Option<LinkCounters>) {
        let totals = self.totals(live);
        self.reset_rates();
        if let Ok(mut window) = self.window.lock() {
            *window = Window {
                started: Instant::now(),
                totals,
            };
        }
        self.last_latency_us.store(0, Ordering::Relaxed);
        self.latency_sum_us.store(0, Ordering::Relaxed);
        self.latency_samples.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, live: Option<LinkCounters>) -> LocalStatistics {
        let totals = self.totals(live);
        let rates = self.rates.load();
        let connect_count = self.connect_count.load(Ordering::Relaxed);
        let samples = self.latency_samples.load(Ordering::Relaxed);

        let (last_request_latency, average_request_latency) = if samples == 0 {
            (None, None)
        } else {
            let last = self.last_latency_us.load(Ordering::Relaxed);
            let avg = self.latency_sum_us.load(Ordering::Relaxed) / samples;
            (
                Some(Duration::from_micros(last)),
                Some(Duration::from_micros(avg)),
            )
        };

        LocalStatistics {
            rx_bytes: totals.rx_bytes,
            tx_bytes: totals.tx_bytes,
            rx_messages: totals.rx_datagrams,
            tx_messages: totals.tx_datagrams,
            rx_data_rate: rates.rx_data,
            tx_data_rate: rates.tx_data,
            rx_message_rate: rates.rx_messages,
            tx_message_rate: rates.tx_messages,
            last_request_latency,
            average_request_latency,
            connect_count,
            reconnect_count: connect_count.saturating_sub(1),
        }
    }
}

fn add(a: LinkCounters, b: LinkCounters) -> LinkCounters {
    LinkCounters {
        rx_bytes: a.rx_bytes + b.rx_bytes,
        tx_bytes: a.tx_bytes + b.tx_bytes,
        rx_datagrams: a.rx_datagrams + b.rx_datagrams,
        tx_datagrams: a.tx_datagrams + b.tx_datagrams,
    }
}
