// Test helpers shared across module tests

use tokio::sync::watch;

/// A value settled from outside the task that awaits it.
///
/// Any number of tasks may `wait`; the first `resolve` or `reject` wins and
/// later calls are ignored. Used to pause a transaction attempt at a chosen
/// point while another task performs an out-of-band write.
pub(crate) struct Deferred<T> {
    sender: watch::Sender<Option<Result<T, String>>>,
}

impl<T: Clone> Deferred<T> {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Deferred { sender }
    }

    pub(crate) fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    pub(crate) fn reject(&self, reason: impl Into<String>) {
        self.settle(Err(reason.into()));
    }

    fn settle(&self, outcome: Result<T, String>) {
        self.sender.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
    }

    /// Wait until settled. Returns immediately when already settled.
    pub(crate) async fn wait(&self) -> Result<T, String> {
        let mut receiver = self.sender.subscribe();
        let settled = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|e| e.to_string())?;
        settled.clone().unwrap_or_else(|| Err("deferred value missing".into()))
    }
}

/// Route `log` output through the test harness
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_resolve_wakes_every_waiter() {
        let deferred = Deferred::new();
        let waiters = async {
            let (a, b) = tokio::join!(deferred.wait(), deferred.wait());
            (a.unwrap(), b.unwrap())
        };
        let settle = async {
            tokio::task::yield_now().await;
            deferred.resolve(7);
        };

        let ((a, b), ()) = tokio::join!(waiters, settle);
        assert_eq!((a, b), (7, 7));
        assert_eq!(deferred.wait().await, Ok(7));
    }

    #[tokio::test]
    async fn test_first_settlement_wins() {
        let deferred: Deferred<u32> = Deferred::new();
        deferred.reject("boom");
        deferred.resolve(1);
        assert_eq!(deferred.wait().await, Err("boom".to_string()));
    }
}
