// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator-requested shutdown.
//!
//! A shutdown request never interrupts a command that is already running.
//! Long-running loops check [`ShutdownSignal::is_requested`] before starting
//! new work, and sleeps race against [`ShutdownSignal::requested`].

use futures::StreamExt;
use libc::SIGINT;
use libc::SIGTERM;
use signal_hook_tokio::Signals;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> ShutdownSignal {
        ShutdownSignal::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> ShutdownSignal {
        let (tx, rx) = watch::channel(false);
        ShutdownSignal { tx: Arc::new(tx), rx }
    }

    /// Ask everything holding a clone of this signal to wind down.
    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once shutdown has been requested.
    pub async fn requested(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Requests shutdown when the process receives SIGINT or SIGTERM.
    ///
    /// The returned handle can be used to stop listening.
    pub fn listen_for_signals(
        &self,
        log: &Logger,
    ) -> Result<signal_hook_tokio::Handle, std::io::Error> {
        let signals = Signals::new([SIGINT, SIGTERM])?;
        let handle = signals.handle();
        let log = log.clone();
        let shutdown = self.clone();
        tokio::spawn(async move {
            let mut signals = signals.fuse();
            while let Some(signal) = signals.next().await {
                warn!(
                    log,
                    "caught signal, finishing in-flight work before exiting";
                    "signal" => signal,
                );
                shutdown.request();
            }
        });
        Ok(handle)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_wakes_waiters() {
        let shutdown = ShutdownSignal::new();
        assert!(!shutdown.is_requested());

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.requested().await })
        };
        shutdown.request();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter was not woken")
            .expect("waiter panicked");
        assert!(shutdown.is_requested());
    }
}
