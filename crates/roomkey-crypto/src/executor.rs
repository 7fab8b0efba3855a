// Copyright 2025 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Spawning of long running work, like restoring a backup, on the tokio
//! runtime.
//!
//! A spawned task resolves to its value, or to a [`TaskError`] telling apart
//! a task that was cancelled from one that panicked.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};

use crate::error::TaskError;

/// A handle to a task running in the background.
///
/// Awaiting the handle waits for the task to finish. Dropping the handle
/// doesn't cancel the task, use [`BackgroundTask::abort()`] for that.
#[derive(Debug)]
pub struct BackgroundTask<T> {
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    /// Spawn the future on the current tokio runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self { handle: tokio::spawn(future) }
    }
}

impl<T> BackgroundTask<T> {
    /// Cancel the task, awaiting the handle afterwards yields
    /// [`TaskError::Cancelled`] unless the task already finished.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Has the task finished, either by completing or by being cancelled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl From<JoinError> for TaskError {
    fn from(error: JoinError) -> Self {
        if error.is_cancelled() {
            TaskError::Cancelled
        } else {
            TaskError::Panicked
        }
    }
}

impl<T> Future for BackgroundTask<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map_err(TaskError::from)
    }
}
