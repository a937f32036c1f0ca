// Licensed under the Apache-2.0 license

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use log::{debug, log, Level};

use crate::engine::FlashOperationState;
use crate::error::FlashResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Position of the image being written, in allocation order.
    pub current_index: usize,
    pub total: usize,
    pub current_percent: u8,
    pub total_percent: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub state: FlashOperationState,
    pub result: FlashResult,
    /// `Warn` for non-fatal problems such as a verification mismatch.
    pub level: Level,
    pub message: String,
}

/// Events delivered through a `ChannelObserver`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    Progress(ProgressEvent),
    Status(StatusEvent),
}

/// Receives progress and status notifications. Called synchronously from the
/// worker thread, so implementations must return quickly.
pub trait FlashObserver: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
    fn on_status(&self, event: &StatusEvent);
}

/// Observer that only logs.
pub struct LogObserver;

impl FlashObserver for LogObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        debug!(
            "[{}/{}] {}% (total {}%) {}",
            event.current_index + 1,
            event.total,
            event.current_percent,
            event.total_percent,
            event.message
        );
    }

    fn on_status(&self, event: &StatusEvent) {
        log!(
            event.level,
            "{:?} ({}): {}",
            event.state,
            event.result,
            event.message
        );
    }
}

/// Forwards every notification into an mpsc channel.
pub struct ChannelObserver {
    tx: Mutex<Sender<FlashEvent>>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<FlashEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }

    fn send(&self, event: FlashEvent) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        // The receiver may be gone; notifications are best-effort
        let _ = tx.send(event);
    }
}

impl FlashObserver for ChannelObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        self.send(FlashEvent::Progress(event.clone()));
    }

    fn on_status(&self, event: &StatusEvent) {
        self.send(FlashEvent::Status(event.clone()));
    }
}
