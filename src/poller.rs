use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    error::{ConfigError, WidgetError},
    fetcher::Fetcher,
    live_channel::{handler, ChannelManager, Subscription},
    utils::{iso_from_ms, now_ms},
    widget::{live_value, merge_live_value, LiveSeries, Widget, WidgetConfig, WidgetKind},
};

/// What a widget currently shows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedSnapshot {
    pub payload: Option<JsonValue>,
    pub error: Option<String>,
    pub loading: bool,
    pub last_updated: Option<String>,
    pub generation: u64,
}

#[derive(Debug)]
pub struct FeedState {
    generation: u64,
    snapshot: FeedSnapshot,
    live: Option<LiveSeries>,
}

impl FeedState {
    pub fn new(live: Option<LiveSeries>) -> Self {
        Self {
            generation: 0,
            snapshot: FeedSnapshot::default(),
            live,
        }
    }

    /// Issues the next request generation.
    pub fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.snapshot.generation = self.generation;
        self.snapshot.loading = true;
        self.snapshot.error = None;
        self.generation
    }

    /// Applies a finished request. Returns false, changing nothing, when a
    /// newer request has been issued since.
    pub fn complete(&mut self, generation: u64, result: Result<JsonValue, String>) -> bool {
        if generation != self.generation {
            return false;
        }
        self.snapshot.loading = false;
        match result {
            Ok(payload) => {
                self.snapshot.payload = Some(payload);
                self.snapshot.error = None;
                self.snapshot.last_updated = iso_from_ms(now_ms());
            }
            // The previous payload stays visible next to the error.
            Err(msg) => self.snapshot.error = Some(msg),
        }
        true
    }

    /// Makes every outstanding request stale.
    pub fn invalidate(&mut self) {
        self.generation += 1;
        self.snapshot.loading = false;
    }

    pub fn set_error(&mut self, msg: impl Into<String>) {
        self.snapshot.loading = false;
        self.snapshot.error = Some(msg.into());
    }

    /// Folds a live frame in: charts append to their live series, cards and
    /// tables get the value merged into the payload under `live`.
    pub fn apply_live(&mut self, kind: WidgetKind, frame: &JsonValue, mapping_y: Option<&str>) -> bool {
        if kind == WidgetKind::Chart {
            return self.live.as_mut().map(|s| s.push_frame(frame)).unwrap_or(false);
        }
        let Some(value) = live_value(frame, mapping_y) else {
            return false;
        };
        let payload = self.snapshot.payload.get_or_insert(JsonValue::Null);
        merge_live_value(payload, value);
        true
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshot.clone()
    }

    pub fn live_series(&self) -> Option<&LiveSeries> {
        self.live.as_ref()
    }
}

/// Fetches a widget's configured URL.
pub async fn load_widget_data(fetcher: &Fetcher, config: &WidgetConfig) -> Result<JsonValue, WidgetError> {
    let url = config.api_url().ok_or(ConfigError::MissingApiUrl)?;
    Ok(fetcher.fetch_json(url).await?)
}

async fn fetch_into(fetcher: &Fetcher, state: &Mutex<FeedState>, widget_id: &str, config: &WidgetConfig) -> bool {
    let generation = state.lock().begin();
    let result = load_widget_data(fetcher, config).await.map_err(|e| {
        log::warn!("poller.fetch.error widget={} gen={} err={}", widget_id, generation, e);
        e.to_string()
    });
    let applied = state.lock().complete(generation, result);
    if !applied {
        log::debug!("poller.fetch.stale widget={} gen={}", widget_id, generation);
    }
    applied
}

async fn poll_loop(fetcher: Fetcher, state: Arc<Mutex<FeedState>>, widget: Widget) {
    let every = Duration::from_millis(widget.config.poll_interval_ms());
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let fetcher = fetcher.clone();
        let state = state.clone();
        let id = widget.id.clone();
        let config = widget.config.clone();
        tokio::spawn(async move {
            fetch_into(&fetcher, &state, &id, &config).await;
        });
    }
}

struct Feed {
    widget: Widget,
    state: Arc<Mutex<FeedState>>,
    task: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
}

impl Feed {
    fn close(self) {
        if let Some(task) = self.task {
            task.abort();
        }
        self.state.lock().invalidate();
        if let Some(sub) = self.subscription {
            sub.unsubscribe();
        }
    }
}

struct PollerInner {
    fetcher: Fetcher,
    channels: Arc<ChannelManager>,
    ws_url: String,
    live_cap: usize,
    polling_enabled: bool,
    feeds: Mutex<HashMap<String, Feed>>,
}

/// Registry of running widget feeds.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

impl Poller {
    pub fn new(
        fetcher: Fetcher,
        channels: Arc<ChannelManager>,
        ws_url: &str,
        live_cap: usize,
        polling_enabled: bool,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                fetcher,
                channels,
                ws_url: ws_url.to_string(),
                live_cap,
                polling_enabled,
                feeds: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.inner.fetcher
    }

    /// Starts (or restarts) the feed for `widget`. A widget without an API URL
    /// gets an error snapshot and no timer. Cards and charts also follow the
    /// live channel of their symbol.
    pub fn start(&self, widget: &Widget) {
        let inner = &self.inner;

        let live = (widget.kind == WidgetKind::Chart).then(|| LiveSeries::new(inner.live_cap));
        let state = Arc::new(Mutex::new(FeedState::new(live)));

        let task = match widget.config.api_url() {
            None => {
                state.lock().set_error(ConfigError::MissingApiUrl.to_string());
                None
            }
            Some(_) if inner.polling_enabled => Some(tokio::spawn(poll_loop(
                inner.fetcher.clone(),
                state.clone(),
                widget.clone(),
            ))),
            Some(_) => None,
        };

        let follows_live = matches!(widget.kind, WidgetKind::Card | WidgetKind::Chart);
        let subscription = widget.config.live_channel().filter(|_| follows_live).map(|channel| {
            let st = state.clone();
            let kind = widget.kind;
            let mapping_y = widget.config.mapping_y().map(str::to_string);
            inner.channels.subscribe(
                &inner.ws_url,
                &channel,
                handler(move |frame| {
                    st.lock().apply_live(kind, frame, mapping_y.as_deref());
                    Ok(())
                }),
            )
        });

        log::info!(
            "poller.start widget={} kind={:?} every_ms={} polling={} live={}",
            widget.id,
            widget.kind,
            widget.config.poll_interval_ms(),
            task.is_some(),
            subscription.as_ref().map(Subscription::channel).unwrap_or("-")
        );

        let replaced = inner.feeds.lock().insert(
            widget.id.clone(),
            Feed {
                widget: widget.clone(),
                state,
                task,
                subscription,
            },
        );
        if let Some(old) = replaced {
            old.close();
        }
    }

    pub fn stop(&self, widget_id: &str) -> bool {
        let removed = self.inner.feeds.lock().remove(widget_id);
        match removed {
            Some(feed) => {
                feed.close();
                log::info!("poller.stop widget={}", widget_id);
                true
            }
            None => false,
        }
    }

    /// Brings the running feeds in line with `widgets`: removed widgets stop,
    /// new or edited ones (re)start, unchanged ones keep running.
    pub fn sync(&self, widgets: &[Widget]) {
        let stale: Vec<String> = {
            let feeds = self.inner.feeds.lock();
            feeds
                .keys()
                .filter(|id| !widgets.iter().any(|w| &w.id == *id))
                .cloned()
                .collect()
        };
        for id in stale {
            self.stop(&id);
        }
        for w in widgets {
            let unchanged = self
                .inner
                .feeds
                .lock()
                .get(&w.id)
                .map(|f| f.widget.kind == w.kind && f.widget.config == w.config)
                .unwrap_or(false);
            if !unchanged {
                self.start(w);
            }
        }
    }

    /// Fetches now, waits for the result and returns the new snapshot.
    pub async fn refresh(&self, widget_id: &str) -> Option<FeedSnapshot> {
        let (state, config) = {
            let feeds = self.inner.feeds.lock();
            let feed = feeds.get(widget_id)?;
            (feed.state.clone(), feed.widget.config.clone())
        };
        fetch_into(&self.inner.fetcher, &state, widget_id, &config).await;
        let snap = state.lock().snapshot();
        Some(snap)
    }

    pub fn snapshot(&self, widget_id: &str) -> Option<FeedSnapshot> {
        let state = self.inner.feeds.lock().get(widget_id)?.state.clone();
        let snap = state.lock().snapshot();
        Some(snap)
    }

    pub fn live_series(&self, widget_id: &str) -> Option<LiveSeries> {
        let state = self.inner.feeds.lock().get(widget_id)?.state.clone();
        let live = state.lock().live_series().cloned();
        live
    }

    pub fn watched(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.feeds.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn shutdown(&self) {
        let drained: Vec<Feed> = self.inner.feeds.lock().drain().map(|(_, f)| f).collect();
        let n = drained.len();
        for feed in drained {
            feed.close();
        }
        log::info!("poller.shutdown feeds={}", n);
    }
}
