//! Runs one sync worker per account and fans the decision feed out to them.

use crate::api::rate_limit::{CallRateLimiter, RateLimitedApi};
use crate::api::EdgeApi;
use crate::config::AccountConfig;
use crate::decision::DecisionBatch;
use crate::feed::{DecisionFeed, FeedError};
use crate::metrics::Metrics;
use crate::worker::{SyncWorker, WorkerError};
use crate::zone_lock::ZoneLockTable;
use anyhow::{anyhow, bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Barrier};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Batches buffered per worker before the feed waits on it.
const WORKER_CHANNEL_CAPACITY: usize = 16;

/// Run every account worker until the feed is exhausted or anything fails.
///
/// `make_api` builds the remote client for an account; each one is wrapped
/// in its own rate limiter and counts its calls in `metrics`. The first
/// worker failure, worker panic or feed error stops every other task and is
/// returned.
pub async fn run<A, F, M>(
    accounts: &[AccountConfig],
    update_frequency: Duration,
    mut make_api: M,
    mut feed: F,
    metrics: &Metrics,
) -> Result<()>
where
    A: EdgeApi + 'static,
    F: DecisionFeed + 'static,
    M: FnMut(&AccountConfig) -> Result<A>,
{
    if accounts.is_empty() {
        bail!("No accounts to synchronize");
    }

    let locks = Arc::new(ZoneLockTable::new(
        accounts
            .iter()
            .flat_map(|a| a.zones.iter().map(|z| z.zone_id.clone())),
    ));
    let ready = Arc::new(Barrier::new(accounts.len()));

    let mut workers: JoinSet<(String, Result<(), WorkerError>)> = JoinSet::new();
    let mut senders = Vec::with_capacity(accounts.len());

    for account in accounts {
        let api = RateLimitedApi::new(
            make_api(account)?,
            CallRateLimiter::default(),
            metrics.api_calls(&account.id),
        );
        let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        senders.push(tx);

        let worker = SyncWorker::new(
            account.clone(),
            api,
            locks.clone(),
            rx,
            update_frequency,
            ready.clone(),
        );
        let account_id = worker.account_id().to_string();
        workers.spawn(async move { (account_id, worker.run().await) });
        info!(account_id = %account.id, zones = account.zones.len(), "Started account worker");
    }

    let mut feed_task = tokio::spawn(async move { broadcast(&mut feed, senders).await });
    let mut feed_done = false;

    loop {
        tokio::select! {
            joined = workers.join_next() => match joined {
                None => {
                    info!("All account workers stopped");
                    feed_task.abort();
                    return Ok(());
                }
                Some(Ok((account_id, Ok(())))) => {
                    info!(account_id = %account_id, "Account worker stopped");
                }
                Some(Ok((account_id, Err(e)))) => {
                    error!(account_id = %account_id, error = %e, "Account worker failed");
                    workers.abort_all();
                    feed_task.abort();
                    return Err(anyhow!("worker for account {} failed: {}", account_id, e));
                }
                Some(Err(e)) => {
                    error!(error = %e, "Account worker panicked");
                    workers.abort_all();
                    feed_task.abort();
                    return Err(anyhow!("account worker panicked: {}", e));
                }
            },
            result = &mut feed_task, if !feed_done => {
                feed_done = true;
                match result {
                    Ok(Ok(())) => debug!("Decision feed exhausted, waiting for workers"),
                    Ok(Err(e)) => {
                        error!(error = %e, "Decision feed failed");
                        workers.abort_all();
                        return Err(anyhow!("decision feed failed: {}", e));
                    }
                    Err(e) => {
                        workers.abort_all();
                        return Err(anyhow!("decision feed task failed: {}", e));
                    }
                }
            }
        }
    }
}

/// Forward every batch to every worker. Returns when the feed is exhausted,
/// dropping the senders so workers stop.
async fn broadcast<F: DecisionFeed>(
    feed: &mut F,
    mut senders: Vec<mpsc::Sender<Arc<DecisionBatch>>>,
) -> Result<(), FeedError> {
    while let Some(batch) = feed.next_batch().await? {
        if batch.is_empty() {
            continue;
        }

        let batch = Arc::new(batch);
        let mut open = Vec::with_capacity(senders.len());
        for tx in senders {
            if tx.send(batch.clone()).await.is_ok() {
                open.push(tx);
            } else {
                debug!("Worker channel closed, no longer forwarding to it");
            }
        }
        senders = open;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::MemoryApi;
    use crate::config::ZoneConfig;
    use crate::decision::{Action, Decision, Scope};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};

    struct ScriptedFeed {
        batches: VecDeque<DecisionBatch>,
        then: Ending,
    }

    enum Ending {
        Exhausted,
        Hang,
        Fail,
    }

    impl ScriptedFeed {
        fn new(batches: Vec<DecisionBatch>, then: Ending) -> Self {
            Self {
                batches: batches.into(),
                then,
            }
        }
    }

    #[async_trait]
    impl DecisionFeed for ScriptedFeed {
        async fn next_batch(&mut self) -> Result<Option<DecisionBatch>, FeedError> {
            if let Some(batch) = self.batches.pop_front() {
                return Ok(Some(batch));
            }
            match self.then {
                Ending::Exhausted => Ok(None),
                Ending::Hang => std::future::pending().await,
                Ending::Fail => Err(FeedError::Status {
                    status: 403,
                    body: "forbidden".to_string(),
                }),
            }
        }
    }

    fn account(id: &str, zone_id: &str, actions: &[Action]) -> AccountConfig {
        AccountConfig {
            id: id.to_string(),
            token: "tok".to_string(),
            ip_list_prefix: "crowdsec".to_string(),
            default_action: None,
            zones: vec![ZoneConfig {
                zone_id: zone_id.to_string(),
                actions: actions.to_vec(),
            }],
        }
    }

    fn apis(entries: &[(&str, MemoryApi)]) -> impl FnMut(&AccountConfig) -> Result<MemoryApi> {
        let apis: HashMap<String, MemoryApi> = entries
            .iter()
            .map(|(id, api)| (id.to_string(), api.clone()))
            .collect();
        move |account: &AccountConfig| {
            apis.get(&account.id)
                .cloned()
                .ok_or_else(|| anyhow!("no api for {}", account.id))
        }
    }

    fn ban(value: &str) -> DecisionBatch {
        DecisionBatch {
            new: vec![Arc::new(Decision::new(Scope::Ip, "ban", value, "test"))],
            expired: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_reach_every_account() {
        let first = MemoryApi::new().with_zone("z1", false);
        let second = MemoryApi::new().with_zone("z2", false);
        let accounts = vec![
            account("a1", "z1", &[Action::Block]),
            account("a2", "z2", &[Action::Block]),
        ];

        let feed = ScriptedFeed::new(vec![ban("1.2.3.4"), ban("5.6.7.8")], Ending::Exhausted);
        let metrics = Metrics::new().unwrap();
        run(
            &accounts,
            Duration::from_secs(10),
            apis(&[("a1", first.clone()), ("a2", second.clone())]),
            feed,
            &metrics,
        )
        .await
        .unwrap();

        for api in [&first, &second] {
            assert_eq!(api.list_ips("crowdsec_block"), vec!["1.2.3.4", "5.6.7.8"]);
        }
        assert_eq!(metrics.api_calls("a1").get(), first.calls().len() as u64);
        assert_eq!(metrics.api_calls("a2").get(), second.calls().len() as u64);
        assert_eq!(first.rules("z1")[0].filter.expression, "(ip.src in $crowdsec_block)");
        assert_eq!(second.rules("z2")[0].filter.expression, "(ip.src in $crowdsec_block)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_failure_stops_everything() {
        let healthy = MemoryApi::new().with_zone("z1", false);
        // The second credential can't see its zone.
        let broken = MemoryApi::new();
        let accounts = vec![
            account("a1", "z1", &[Action::Block]),
            account("a2", "z2", &[Action::Block]),
        ];

        let feed = ScriptedFeed::new(vec![], Ending::Hang);
        let err = run(
            &accounts,
            Duration::from_secs(10),
            apis(&[("a1", healthy), ("a2", broken)]),
            feed,
            &Metrics::new().unwrap(),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("a2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_failure_is_fatal() {
        let api = MemoryApi::new().with_zone("z1", false);
        let accounts = vec![account("a1", "z1", &[Action::Block])];

        let feed = ScriptedFeed::new(vec![ban("1.2.3.4")], Ending::Fail);
        let metrics = Metrics::new().unwrap();
        let err = run(&accounts, Duration::from_secs(10), apis(&[("a1", api)]), feed, &metrics)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("decision feed failed"));
    }

    #[tokio::test]
    async fn test_client_construction_failure() {
        let accounts = vec![account("a1", "z1", &[Action::Block])];
        let feed = ScriptedFeed::new(vec![], Ending::Exhausted);

        let metrics = Metrics::new().unwrap();
        let result = run(&accounts, Duration::from_secs(10), apis(&[]), feed, &metrics).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_no_accounts() {
        let feed = ScriptedFeed::new(vec![], Ending::Exhausted);
        let metrics = Metrics::new().unwrap();
        let result = run(&[], Duration::from_secs(10), apis(&[]), feed, &metrics).await;
        assert!(result.is_err());
    }
}
