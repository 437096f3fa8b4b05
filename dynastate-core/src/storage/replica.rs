use crate::{Result, StateError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Polls a set of regional replicas until they all report the same value.
///
/// A fetch answering `Ok(None)` means the replica has nothing yet and makes
/// the whole round incomplete. Errors abort polling immediately. Without a
/// deadline or cancellation token the loop never gives up.
#[derive(Debug, Clone)]
pub struct ReplicaConsistencyPoller {
    interval: Duration,
    deadline: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl ReplicaConsistencyPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            cancel: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn poll_until_agree<R, T, F, Fut>(&self, replicas: &[R], fetch: F) -> Result<T>
    where
        R: Clone,
        T: PartialEq,
        F: FnMut(R) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        self.poll_until_agree_by(replicas, fetch, |a, b| a == b)
            .await
    }

    /// Like [`poll_until_agree`](Self::poll_until_agree) with a custom notion
    /// of agreement. Returns the first replica's value once all agree.
    pub async fn poll_until_agree_by<R, T, F, Fut, S>(
        &self,
        replicas: &[R],
        fetch: F,
        same: S,
    ) -> Result<T>
    where
        R: Clone,
        F: FnMut(R) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
        S: Fn(&T, &T) -> bool,
    {
        if replicas.is_empty() {
            return Err(StateError::config("no replicas to poll"));
        }

        let polling = self.poll_forever(replicas, fetch, same);
        let bounded = async {
            match self.deadline {
                Some(limit) => match tokio::time::timeout(limit, polling).await {
                    Ok(result) => result,
                    Err(_) => Err(StateError::ReplicationTimeout(limit)),
                },
                None => polling.await,
            }
        };

        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(StateError::Cancelled),
                result = bounded => result,
            },
            None => bounded.await,
        }
    }

    async fn poll_forever<R, T, F, Fut, S>(&self, replicas: &[R], mut fetch: F, same: S) -> Result<T>
    where
        R: Clone,
        F: FnMut(R) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
        S: Fn(&T, &T) -> bool,
    {
        let mut rounds = 0u64;
        loop {
            rounds += 1;
            if let Some(value) = Self::round(replicas, &mut fetch, &same).await? {
                if rounds > 1 {
                    tracing::debug!("Replicas agreed after {} rounds", rounds);
                }
                return Ok(value);
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn round<R, T, F, Fut, S>(replicas: &[R], fetch: &mut F, same: &S) -> Result<Option<T>>
    where
        R: Clone,
        F: FnMut(R) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
        S: Fn(&T, &T) -> bool,
    {
        let mut first: Option<T> = None;
        let mut agreed = true;

        for replica in replicas {
            let Some(value) = fetch(replica.clone()).await? else {
                return Ok(None);
            };
            match &first {
                None => first = Some(value),
                Some(existing) => {
                    if !same(existing, &value) {
                        agreed = false;
                    }
                }
            }
        }

        Ok(if agreed { first } else { None })
    }
}
