use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use super::store::SqliteStore;
use super::{ExchangeRequest, ExchangeStatus, PaymentRecord, SettlementJob};
use crate::asset::{Asset, BTC_DECIMALS};
use crate::chain::{ChainObserver, PaymentClassification, PaymentStatus};
use crate::error::{Error, Result};
use crate::price::PriceOracle;

const DUE_JOBS_BATCH: u32 = 256;

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub poll_interval: Duration,
    pub watch_window: Duration,
    pub scheduler_tick: Duration,
    pub max_concurrent_polls: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            watch_window: Duration::from_secs(30 * 60),
            scheduler_tick: Duration::from_secs(1),
            max_concurrent_polls: 64,
        }
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or_else(|_| TimeDelta::days(365))
}

/// What the ledger needs to enqueue settlement for a new request.
#[derive(Debug, Clone)]
pub struct SettlementHandle {
    watch_window: TimeDelta,
    wakeup: Arc<Notify>,
}

impl SettlementHandle {
    pub fn job_for(&self, request_id: Uuid, now: DateTime<Utc>) -> SettlementJob {
        SettlementJob {
            request_id,
            next_poll_at: now,
            deadline: now + self.watch_window,
        }
    }

    /// Wakes the scheduler so a fresh job is picked up before the next tick.
    pub fn notify(&self) {
        self.wakeup.notify_one();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Finished,
}

/// Outcome of one deadline-bounded observation of a request's deposit.
#[derive(Debug)]
enum Poll {
    Done(Step),
    Confirmed(PaymentStatus),
}

/// Drives every open request from `pending` to a terminal status off the
/// durable `settlement_jobs` queue.
#[derive(Clone)]
pub struct SettlementOrchestrator {
    cfg: SettlementConfig,
    store: Arc<Mutex<SqliteStore>>,
    chain: ChainObserver,
    prices: PriceOracle,
    wakeup: Arc<Notify>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    permits: Arc<Semaphore>,
}

impl SettlementOrchestrator {
    pub fn new(
        cfg: SettlementConfig,
        store: Arc<Mutex<SqliteStore>>,
        chain: ChainObserver,
        prices: PriceOracle,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.max_concurrent_polls.max(1)));
        Self {
            cfg,
            store,
            chain,
            prices,
            wakeup: Arc::new(Notify::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits,
        }
    }

    pub fn handle(&self) -> SettlementHandle {
        SettlementHandle {
            watch_window: to_delta(self.cfg.watch_window),
            wakeup: self.wakeup.clone(),
        }
    }

    pub fn spawn(self, shutdown: impl Future<Output = ()> + Send + 'static) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Scheduler loop. Each wakeup runs its tick as a separate task so one
    /// slow poll never delays other requests. Ticks still running at
    /// shutdown are drained before returning.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.cfg.scheduler_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(
            poll_interval_secs = self.cfg.poll_interval.as_secs(),
            watch_window_secs = self.cfg.watch_window.as_secs(),
            "settlement scheduler started"
        );

        let mut ticks = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(in_flight = ticks.len(), "settlement scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.wakeup.notified() => {}
            }

            while ticks.try_join_next().is_some() {}
            let this = self.clone();
            ticks.spawn(async move {
                if let Err(err) = this.tick(Utc::now()).await {
                    tracing::warn!(error = %err, "settlement tick failed");
                }
            });
        }

        while let Some(res) = ticks.join_next().await {
            if let Err(err) = res {
                tracing::warn!(error = %err, "settlement tick join error");
            }
        }
        tracing::info!("settlement scheduler stopped");
    }

    /// Runs one poll step for every job due at `now` and waits for them.
    /// Jobs already being polled are skipped. Returns the number of steps
    /// run.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let jobs = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .due_jobs(now, DUE_JOBS_BATCH)?;

        let mut set = JoinSet::new();
        for job in jobs {
            let Some(guard) = InFlightGuard::claim(&self.in_flight, job.request_id) else {
                continue;
            };
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let this = self.clone();
            set.spawn(async move {
                let _guard = guard;
                let _permit = permit;
                this.poll_job(job, now).await;
            });
        }

        let mut ran = 0;
        while let Some(res) = set.join_next().await {
            match res {
                Ok(()) => ran += 1,
                Err(err) => tracing::warn!(error = %err, "settlement task join error"),
            }
        }
        Ok(ran)
    }

    async fn poll_job(&self, job: SettlementJob, now: DateTime<Utc>) {
        let id = job.request_id;
        if now >= job.deadline {
            self.expire(id);
            return;
        }

        // The watch window bounds observation only. A confirmed deposit is
        // finalized to completion or failure, never expired.
        let remaining = (job.deadline - now).to_std().unwrap_or(Duration::ZERO);
        let observed = match tokio::time::timeout(remaining, self.poll_once(id)).await {
            Ok(observed) => observed,
            Err(_) => {
                tracing::info!(request_id = %id, "watch window elapsed during poll");
                self.expire(id);
                return;
            }
        };
        let outcome = match observed {
            Ok(Poll::Done(step)) => Ok(step),
            Ok(Poll::Confirmed(payment)) => {
                self.finalize(id, &payment).await.map(|()| Step::Finished)
            }
            Err(err) => Err(err),
        };

        let result = match outcome {
            Ok(Step::Finished) => self.delete_job(id),
            Ok(Step::Continue) => self.reschedule(id, now + to_delta(self.cfg.poll_interval)),
            Err(Error::NotFound(what)) => {
                tracing::warn!(request_id = %id, what = %what, "dropping settlement job");
                self.delete_job(id)
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::warn!(request_id = %id, error = %err, "transient settlement error, will retry");
                } else {
                    tracing::error!(request_id = %id, error = %err, "settlement step failed, will retry");
                }
                self.reschedule(id, now + to_delta(self.cfg.poll_interval))
            }
        };
        if let Err(err) = result {
            tracing::warn!(request_id = %id, error = %err, "update settlement job");
        }
    }

    async fn poll_once(&self, id: Uuid) -> Result<Poll> {
        let request = self.load(id)?;
        if request.status.is_terminal() {
            return Ok(Poll::Done(Step::Finished));
        }
        if request.status == ExchangeStatus::Pending {
            self.transition(id, ExchangeStatus::Waiting)?;
        }

        let expected = request.expected_sats()?;
        let payment = self
            .chain
            .check_payment(&request.payment_address, expected)
            .await?;
        tracing::debug!(
            request_id = %id,
            classification = %payment.classification,
            confirmed_sats = payment.confirmed_sats,
            unconfirmed_sats = payment.unconfirmed_sats,
            "polled deposit"
        );

        match payment.classification {
            PaymentClassification::Pending => Ok(Poll::Done(Step::Continue)),
            PaymentClassification::Unconfirmed => {
                if request.status != ExchangeStatus::Processing {
                    self.transition(id, ExchangeStatus::Processing)?;
                }
                Ok(Poll::Done(Step::Continue))
            }
            PaymentClassification::Confirmed => Ok(Poll::Confirmed(payment)),
        }
    }

    /// Records the confirmed payment, re-prices at the current rate and
    /// completes the request. A no-op once the request is terminal.
    pub async fn finalize(&self, id: Uuid, payment: &PaymentStatus) -> Result<()> {
        let request = self.load(id)?;
        if request.status.is_terminal() {
            tracing::debug!(request_id = %id, status = %request.status, "already settled");
            return Ok(());
        }

        let record = PaymentRecord {
            id: Uuid::new_v4(),
            request_id: id,
            address: payment.address.clone(),
            amount_sats: payment.confirmed_sats,
            txid: payment.txid.clone(),
            confirmations: payment.confirmations,
            classification: PaymentClassification::Confirmed,
            detected_at: Utc::now(),
        };
        self.store
            .lock()
            .expect("store mutex poisoned")
            .insert_payment(&record)?;
        tracing::info!(
            request_id = %id,
            amount_sats = record.amount_sats,
            txid = ?record.txid,
            confirmations = record.confirmations,
            "payment confirmed"
        );

        self.transition(id, ExchangeStatus::Processing)?;

        let final_output = match self.final_output(&request).await {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(request_id = %id, error = %err, "re-pricing failed");
                self.transition(id, ExchangeStatus::Failed)?;
                return Ok(());
            }
        };
        let persisted = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .set_final_output(id, final_output, Utc::now());
        if let Err(err) = persisted {
            tracing::error!(request_id = %id, error = %format!("{err:#}"), "persist final output");
            self.transition(id, ExchangeStatus::Failed)?;
            return Ok(());
        }

        for out in &request.output_addresses {
            let share = (final_output * out.percentage / Decimal::ONE_HUNDRED)
                .round_dp_with_strategy(BTC_DECIMALS, RoundingStrategy::ToZero);
            tracing::info!(
                request_id = %id,
                destination = %out.address,
                amount = %share,
                currency = %request.output_currency,
                "distribution simulated"
            );
        }

        self.transition(id, ExchangeStatus::Completed)?;
        Ok(())
    }

    async fn final_output(&self, request: &ExchangeRequest) -> Result<Decimal> {
        let asset = request.output_currency;
        let gross = self
            .prices
            .convert_value(Asset::Btc, asset, request.btc_amount)
            .await?;
        Ok((gross * (Decimal::ONE - asset.fee_rate()))
            .round_dp_with_strategy(BTC_DECIMALS, RoundingStrategy::ToZero))
    }

    fn expire(&self, id: Uuid) {
        match self.transition(id, ExchangeStatus::Expired) {
            Ok(_) | Err(Error::InvalidTransition { .. }) | Err(Error::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(request_id = %id, error = %err, "mark expired");
                return;
            }
        }
        if let Err(err) = self.delete_job(id) {
            tracing::warn!(request_id = %id, error = %err, "delete expired job");
        }
    }

    fn load(&self, id: Uuid) -> Result<ExchangeRequest> {
        let request = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_request(id)?;
        request.ok_or_else(|| Error::NotFound(format!("exchange request {id}")))
    }

    fn transition(&self, id: Uuid, to: ExchangeStatus) -> Result<ExchangeStatus> {
        let from = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .update_status(id, to, Utc::now())?;
        if from != to {
            tracing::info!(request_id = %id, from = %from, to = %to, "exchange status changed");
        }
        Ok(from)
    }

    fn reschedule(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .reschedule_job(id, at)?;
        Ok(())
    }

    fn delete_job(&self, id: Uuid) -> Result<()> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .delete_job(id)?;
        Ok(())
    }
}

/// Marks a request as being polled; released on drop.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<Uuid>>>,
    id: Uuid,
}

impl InFlightGuard {
    fn claim(set: &Arc<Mutex<HashSet<Uuid>>>, id: Uuid) -> Option<Self> {
        let inserted = set.lock().expect("in-flight mutex poisoned").insert(id);
        inserted.then(|| Self {
            set: set.clone(),
            id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}
