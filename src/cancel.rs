// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Cancellation propagation for long-running operations. */

use {
    crate::error::{BuildError, Result},
    tokio::sync::watch,
};

/// A cancellation signal shared by all workers of a build.
///
/// Cloning is cheap; all clones observe the same signal. Long-running
/// operations call [CancelToken::check] at suspension points (fetches,
/// decompression, file writes) and bail with [BuildError::Cancelled].
#[derive(Clone, Debug)]
pub struct CancelToken {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        let (sender, receiver) = watch::channel(false);

        Self { sender, receiver }
    }
}

impl CancelToken {
    /// Construct a token that never fires.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every holder of this token.
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BuildError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();

        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}
