//! Live log stream consumer.
//!
//! Each poll replaces the buffer with the server's current window; nothing is
//! merged. [`LogMachine`] holds the buffer, the pause/filter toggles and the
//! viewport; [`LogConsumer`] runs the polling task around it.

use std::fmt;
use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use time::macros::format_description;
use time::Date;
use tokio::sync::watch;

use crate::gateway::{Failure, Gateway};
use crate::periodic::{FirstTick, PeriodicTask};
use crate::types::{LogEntry, LogLevel};

/// Which levels the next poll asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelFilter {
    #[default]
    All,
    Only(LogLevel),
}

impl LevelFilter {
    /// Query value for the backend; `None` means every level.
    pub fn level(self) -> Option<LogLevel> {
        match self {
            LevelFilter::All => None,
            LevelFilter::Only(level) => Some(level),
        }
    }

    pub fn admits(self, entry: &LogEntry) -> bool {
        match self {
            LevelFilter::All => true,
            LevelFilter::Only(level) => entry.level == level,
        }
    }
}

impl fmt::Display for LevelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelFilter::All => f.write_str("ALL"),
            LevelFilter::Only(level) => write!(f, "{level}"),
        }
    }
}

impl FromStr for LevelFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(LevelFilter::All);
        }
        s.parse::<LogLevel>().map(LevelFilter::Only)
    }
}

/// Bounded window over the buffer, in rows (one row per entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewport {
    offset: usize,
    height: usize,
    follow: bool,
}

impl Viewport {
    pub fn new(height: usize) -> Self {
        Self {
            offset: 0,
            height,
            follow: true,
        }
    }

    /// Index of the first visible row.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Whether buffer updates scroll to the new bottom.
    pub fn follows(&self) -> bool {
        self.follow
    }

    pub fn is_at_bottom(&self, content_len: usize) -> bool {
        self.offset.saturating_add(self.height) >= content_len
    }

    /// Offsets past the last full page are clamped to it.
    fn scrolled(&mut self, offset: usize, content_len: usize, threshold: usize) {
        self.offset = offset.min(content_len.saturating_sub(self.height));
        self.follow = self
            .offset
            .saturating_add(self.height)
            .saturating_add(threshold)
            >= content_len;
    }

    fn content_changed(&mut self, content_len: usize) {
        if self.follow {
            self.offset = content_len.saturating_sub(self.height);
        }
    }

    fn resized(&mut self, height: usize, content_len: usize) {
        self.height = height;
        self.content_changed(content_len);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Subscribe,
    Unsubscribe,
    Pause,
    Resume,
    Clear,
    SetFilter(LevelFilter),
    Polled {
        epoch: u64,
        filter: LevelFilter,
        entries: Vec<LogEntry>,
    },
    PollFailed {
        epoch: u64,
        failure: Failure,
    },
    Scrolled {
        offset: usize,
    },
    Resized {
        height: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEffect {
    StartPolling { epoch: u64, first: FirstTick },
    StopPolling,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogMachine {
    entries: Vec<LogEntry>,
    /// Filter the current buffer was fetched with.
    buffer_filter: LevelFilter,
    filter: LevelFilter,
    paused: bool,
    active: bool,
    loaded: bool,
    viewport: Viewport,
    threshold: usize,
    epoch: u64,
}

impl LogMachine {
    pub fn new(viewport_height: usize, scroll_threshold: usize) -> Self {
        Self {
            entries: Vec::new(),
            buffer_filter: LevelFilter::All,
            filter: LevelFilter::All,
            paused: false,
            active: false,
            loaded: false,
            viewport: Viewport::new(viewport_height),
            threshold: scroll_threshold,
            epoch: 0,
        }
    }

    /// Buffered entries, oldest first.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn filter(&self) -> LevelFilter {
        self.filter
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// True once a first poll has succeeded.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Polling is wanted: subscribed and not paused.
    pub fn is_live(&self) -> bool {
        self.active && !self.paused
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Rows currently inside the viewport.
    pub fn visible(&self) -> &[LogEntry] {
        let len = self.entries.len();
        let start = self.viewport.offset.min(len);
        let end = self.viewport.offset.saturating_add(self.viewport.height).min(len);
        &self.entries[start..end]
    }

    /// Buffered entries as `[timestamp] [level] message` lines.
    pub fn export(&self) -> String {
        self.entries
            .iter()
            .filter(|e| self.buffer_filter.admits(e))
            .map(|e| format!("[{}] [{}] {}", e.timestamp, e.level, e.message))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn handle(&mut self, event: LogEvent) -> Vec<LogEffect> {
        match event {
            LogEvent::Subscribe => {
                if self.active {
                    return Vec::new();
                }
                self.active = true;
                self.start_polling()
            }
            LogEvent::Unsubscribe => {
                if !self.active {
                    return Vec::new();
                }
                self.active = false;
                self.epoch += 1;
                vec![LogEffect::StopPolling]
            }
            LogEvent::Pause => {
                if self.paused {
                    return Vec::new();
                }
                self.paused = true;
                self.epoch += 1;
                if self.active {
                    vec![LogEffect::StopPolling]
                } else {
                    Vec::new()
                }
            }
            LogEvent::Resume => {
                if !self.paused {
                    return Vec::new();
                }
                self.paused = false;
                self.start_polling()
            }
            LogEvent::Clear => {
                self.entries.clear();
                self.viewport.content_changed(0);
                Vec::new()
            }
            LogEvent::SetFilter(filter) => {
                self.filter = filter;
                Vec::new()
            }
            LogEvent::Polled {
                epoch,
                filter,
                entries,
            } => {
                if epoch != self.epoch || !self.is_live() {
                    return Vec::new();
                }
                self.entries = entries;
                self.buffer_filter = filter;
                self.loaded = true;
                self.viewport.content_changed(self.entries.len());
                Vec::new()
            }
            // Transient: keep the previous buffer.
            LogEvent::PollFailed { .. } => Vec::new(),
            LogEvent::Scrolled { offset } => {
                self.viewport
                    .scrolled(offset, self.entries.len(), self.threshold);
                Vec::new()
            }
            LogEvent::Resized { height } => {
                self.viewport.resized(height, self.entries.len());
                Vec::new()
            }
        }
    }

    fn start_polling(&mut self) -> Vec<LogEffect> {
        if !self.is_live() {
            return Vec::new();
        }
        self.epoch += 1;
        vec![LogEffect::StartPolling {
            epoch: self.epoch,
            first: FirstTick::Immediate,
        }]
    }
}

/// `scanner-logs-YYYY-MM-DD.txt`
pub fn export_file_name(date: Date) -> String {
    let day = date
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| date.to_string());
    format!("scanner-logs-{day}.txt")
}

type SharedMachine = Arc<watch::Sender<LogMachine>>;

fn fold(state: &SharedMachine, event: LogEvent) -> Vec<LogEffect> {
    let mut out = Vec::new();
    state.send_if_modified(|machine| {
        let before = machine.clone();
        out = machine.handle(event);
        // Polls usually return the same window; observers are not woken then.
        *machine != before
    });
    out
}

async fn poll_once(gateway: &Gateway, state: &SharedMachine, epoch: u64) {
    let filter = state.borrow().filter;
    let event = match gateway.logs(filter.level()).await {
        Ok(entries) => LogEvent::Polled {
            epoch,
            filter,
            entries,
        },
        Err(failure) => {
            tracing::debug!(error = %failure, "log poll failed; keeping previous buffer");
            LogEvent::PollFailed { epoch, failure }
        }
    };
    fold(state, event);
}

/// Subscription over the remote log with pause/resume and a scroll-anchored
/// viewport.
pub struct LogConsumer {
    gateway: Gateway,
    state: SharedMachine,
    poll_interval: Duration,
    poller: Option<PeriodicTask>,
}

impl LogConsumer {
    pub fn new(
        gateway: Gateway,
        poll_interval: Duration,
        viewport_height: usize,
        scroll_threshold: usize,
    ) -> Self {
        let (state, _) = watch::channel(LogMachine::new(viewport_height, scroll_threshold));
        Self {
            gateway,
            state: Arc::new(state),
            poll_interval,
            poller: None,
        }
    }

    pub fn snapshot(&self) -> LogMachine {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LogMachine> {
        self.state.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(|p| !p.is_finished())
    }

    /// Begin polling (immediately, then on cadence) unless paused.
    pub fn start(&mut self) {
        self.dispatch(LogEvent::Subscribe);
    }

    /// End the subscription; an in-flight poll is discarded.
    pub fn stop(&mut self) {
        self.dispatch(LogEvent::Unsubscribe);
    }

    pub fn pause(&mut self) {
        self.dispatch(LogEvent::Pause);
    }

    pub fn resume(&mut self) {
        self.dispatch(LogEvent::Resume);
    }

    pub fn toggle_pause(&mut self) {
        if self.state.borrow().is_paused() {
            self.resume();
        } else {
            self.pause();
        }
    }

    /// Empty the local buffer only; polling carries on.
    pub fn clear(&mut self) {
        self.dispatch(LogEvent::Clear);
    }

    /// Takes effect on the next poll.
    pub fn set_level_filter(&mut self, filter: LevelFilter) {
        self.dispatch(LogEvent::SetFilter(filter));
    }

    pub fn on_scroll(&mut self, offset: usize) {
        self.dispatch(LogEvent::Scrolled { offset });
    }

    pub fn resize(&mut self, height: usize) {
        self.dispatch(LogEvent::Resized { height });
    }

    pub fn export(&self) -> String {
        self.state.borrow().export()
    }

    fn dispatch(&mut self, event: LogEvent) {
        for effect in fold(&self.state, event) {
            match effect {
                LogEffect::StartPolling { epoch, first } => self.spawn_poller(epoch, first),
                LogEffect::StopPolling => {
                    if let Some(poller) = self.poller.take() {
                        poller.cancel();
                    }
                }
            }
        }
    }

    fn spawn_poller(&mut self, epoch: u64, first: FirstTick) {
        let gateway = self.gateway.clone();
        let state = self.state.clone();
        self.poller = Some(PeriodicTask::spawn(
            "log-stream",
            self.poll_interval,
            first,
            move || {
                let gateway = gateway.clone();
                let state = state.clone();
                async move {
                    poll_once(&gateway, &state, epoch).await;
                    ControlFlow::Continue(())
                }
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize, level: LogLevel) -> LogEntry {
        LogEntry {
            timestamp: format!("2026-10-17T10:00:{n:02}Z"),
            level,
            message: format!("line {n}"),
            source: None,
        }
    }

    fn batch(range: std::ops::Range<usize>) -> Vec<LogEntry> {
        range.map(|n| entry(n, LogLevel::Info)).collect()
    }

    fn live(height: usize) -> LogMachine {
        let mut m = LogMachine::new(height, 2);
        m.handle(LogEvent::Subscribe);
        m
    }

    #[test]
    fn each_poll_replaces_the_buffer() {
        let mut m = live(10);
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..5) });
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(3..6) });
        assert_eq!(m.entries(), batch(3..6).as_slice());
    }

    #[test]
    fn paused_polls_are_discarded_and_buffer_kept() {
        let mut m = live(10);
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..12) });
        assert_eq!(m.handle(LogEvent::Pause), vec![LogEffect::StopPolling]);
        // A poll that was in flight when the pause happened.
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..20) });
        assert_eq!(m.entries().len(), 12);
        assert_eq!(
            m.handle(LogEvent::Resume),
            vec![LogEffect::StartPolling { epoch: 3, first: FirstTick::Immediate }]
        );
        assert_eq!(m.entries().len(), 12);
    }

    #[test]
    fn clear_keeps_polling_and_failures_keep_buffer() {
        let mut m = live(10);
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..4) });
        m.handle(LogEvent::PollFailed { epoch: 1, failure: Failure::Connection("down".into()) });
        assert_eq!(m.entries().len(), 4);
        assert!(m.handle(LogEvent::Clear).is_empty());
        assert!(m.entries().is_empty());
        assert!(m.is_live());
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..2) });
        assert_eq!(m.entries().len(), 2);
    }

    #[test]
    fn filter_change_applies_on_next_poll_only() {
        let mut m = live(10);
        let mixed = vec![entry(0, LogLevel::Info), entry(1, LogLevel::Error)];
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: mixed.clone() });
        m.handle(LogEvent::SetFilter(LevelFilter::Only(LogLevel::Error)));
        assert_eq!(m.entries(), mixed.as_slice());
        assert_eq!(m.export().lines().count(), 2);
    }

    #[test]
    fn export_format_and_post_filter() {
        let mut m = live(10);
        // Server ignored the level query; export still honours the filter used.
        let mixed = vec![entry(0, LogLevel::Warning), entry(1, LogLevel::Debug)];
        m.handle(LogEvent::Polled {
            epoch: 1,
            filter: LevelFilter::Only(LogLevel::Warning),
            entries: mixed,
        });
        assert_eq!(m.export(), "[2026-10-17T10:00:00Z] [WARNING] line 0");
    }

    #[test]
    fn viewport_follows_when_at_bottom() {
        let mut m = live(5);
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..8) });
        assert_eq!(m.viewport().offset(), 3);
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..20) });
        assert_eq!(m.viewport().offset(), 15);
        assert!(m.viewport().is_at_bottom(20));
        assert_eq!(m.visible(), &batch(15..20)[..]);
    }

    #[test]
    fn viewport_within_threshold_still_follows() {
        let mut m = live(5);
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..20) });
        m.handle(LogEvent::Scrolled { offset: 13 });
        assert!(m.viewport().follows());
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..25) });
        assert_eq!(m.viewport().offset(), 20);
    }

    #[test]
    fn viewport_holds_position_when_scrolled_up() {
        let mut m = live(5);
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..20) });
        m.handle(LogEvent::Scrolled { offset: 4 });
        assert!(!m.viewport().follows());
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..40) });
        assert_eq!(m.viewport().offset(), 4);
        // Scrolling back down re-arms following.
        m.handle(LogEvent::Scrolled { offset: 35 });
        assert!(m.viewport().follows());
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..45) });
        assert_eq!(m.viewport().offset(), 40);
    }

    #[test]
    fn scrolling_past_the_end_clamps_to_last_page() {
        let mut m = live(5);
        m.handle(LogEvent::Polled { epoch: 1, filter: LevelFilter::All, entries: batch(0..20) });
        m.handle(LogEvent::Scrolled { offset: 500 });
        assert_eq!(m.viewport().offset(), 15);
        assert!(m.viewport().follows());
        assert_eq!(m.visible(), &batch(15..20)[..]);

        m.handle(LogEvent::Scrolled { offset: usize::MAX });
        assert_eq!(m.viewport().offset(), 15);
        assert!(m.viewport().is_at_bottom(20));

        let mut empty = live(5);
        empty.handle(LogEvent::Scrolled { offset: usize::MAX });
        assert_eq!(empty.viewport().offset(), 0);
        assert!(empty.visible().is_empty());
    }

    #[test]
    fn level_filter_parsing() {
        assert_eq!("all".parse::<LevelFilter>(), Ok(LevelFilter::All));
        assert_eq!(
            "warning".parse::<LevelFilter>(),
            Ok(LevelFilter::Only(LogLevel::Warning))
        );
        assert!("verbose".parse::<LevelFilter>().is_err());
    }

    #[test]
    fn export_file_name_uses_iso_date() {
        let date = Date::from_calendar_date(2026, time::Month::October, 7).unwrap();
        assert_eq!(export_file_name(date), "scanner-logs-2026-10-07.txt");
    }
}
