use std::future::{Future, pending};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::query::Qid;
use crate::settings::{SettingValue, Settings};
use crate::{Error, Result};

/// How an insert should be handed to the server's async insert queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncInsert {
    /// Wait for the server to flush the queued data before acknowledging.
    pub wait: bool,
}

/// Per-call state: deadline, cancellation, per-query settings and the async insert request.
///
/// Every blocking operation takes a `Context`. When the token fires or the deadline passes the
/// operation stops with [`Error::Cancelled`] or [`Error::DeadlineExceeded`] and the connection
/// that was running it is marked bad.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline:     Option<Instant>,
    cancel:       Option<CancellationToken>,
    async_insert: Option<AsyncInsert>,
    settings:     Settings,
    query_id:     Option<Qid>,
}

impl Context {
    pub fn new() -> Self { Self::default() }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self { self.with_deadline(Instant::now() + timeout) }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Routes `exec` through the async insert path.
    #[must_use]
    pub fn with_async_insert(mut self, wait: bool) -> Self {
        self.async_insert = Some(AsyncInsert { wait });
        self
    }

    #[must_use]
    pub fn with_setting<S>(mut self, name: impl Into<String>, setting: S) -> Self
    where
        SettingValue: From<S>,
    {
        self.settings.add_setting(name, setting);
        self
    }

    #[must_use]
    pub fn with_query_id(mut self, qid: impl Into<Qid>) -> Self {
        self.query_id = Some(qid.into());
        self
    }

    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    pub fn async_insert(&self) -> Option<AsyncInsert> { self.async_insert }

    pub fn settings(&self) -> &Settings { &self.settings }

    /// The query id to send, a fresh one unless set explicitly.
    pub fn query_id(&self) -> Qid { self.query_id.unwrap_or_default() }

    /// Fails immediately if the context is already done.
    ///
    /// # Errors
    /// [`Error::Cancelled`] or [`Error::DeadlineExceeded`].
    pub fn check(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        if self.deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Runs `fut` until it completes or the context is done, whichever comes first.
    pub(crate) async fn run<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        self.check()?;
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending().await,
            }
        };
        tokio::select! {
            biased;
            () = cancelled => Err(Error::Cancelled),
            () = expired => Err(Error::DeadlineExceeded),
            result = fut => result,
        }
    }
}
