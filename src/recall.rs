//! Layout recall hand-off.
//!
//! Backends call recall hooks from threads of their own. A hook never
//! touches handle state; it only queues a [`LayoutRecall`] for the server
//! loop, which asks the client to return the layout and later sees the
//! LAYOUTRETURN as an ordinary request.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::{IoMode, RecallHook};
use crate::pnfs::Segment;
use crate::wire::WireKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayoutRecall {
    pub key: WireKey,
    pub mode: IoMode,
    pub segment: Segment,
}

#[derive(Clone)]
pub struct RecallSender {
    tx: Sender<LayoutRecall>,
}

impl RecallSender {
    /// Queue a recall. Returns false once the receiving side is gone.
    pub fn notify_recall(&self, key: WireKey, mode: IoMode, segment: Segment) -> bool {
        debug!("recall {:?} layout on {}", mode, key.hex());
        match self.tx.send(LayoutRecall { key, mode, segment }) {
            Ok(()) => true,
            Err(_) => {
                warn!("recall for inode {} dropped: no receiver", key.inode);
                false
            }
        }
    }
}

pub struct RecallReceiver {
    rx: Receiver<LayoutRecall>,
}

impl RecallReceiver {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<LayoutRecall> {
        match self.rx.recv_timeout(timeout) {
            Ok(recall) => Some(recall),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<LayoutRecall> {
        match self.rx.try_recv() {
            Ok(recall) => Some(recall),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

pub fn channel() -> (RecallSender, RecallReceiver) {
    let (tx, rx) = mpsc::channel();
    (RecallSender { tx }, RecallReceiver { rx })
}

/// Hook installed with a backend hold on the object named by `key`.
pub(crate) fn hook(sender: Option<RecallSender>, key: WireKey) -> RecallHook {
    Arc::new(move |mode: IoMode| match sender {
        Some(ref tx) => tx.notify_recall(key, mode, Segment::whole_file(mode)),
        None => false,
    })
}
