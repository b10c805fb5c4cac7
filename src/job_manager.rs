use {super::*, tokio::time::Interval};

const TRIGGER_CAPACITY: usize = 64;
const JOB_BROADCAST_CAPACITY: usize = 16;

/// What caused a template refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    BlockFound,
    PubSub,
    Poll,
    Rebroadcast,
    Initial,
}

impl Trigger {
    fn force(self) -> bool {
        self == Self::Rebroadcast
    }

    fn restarts_timers(self) -> bool {
        matches!(self, Self::BlockFound | Self::PubSub)
    }
}

impl Display for Trigger {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BlockFound => "block found",
            Self::PubSub => "push notification",
            Self::Poll => "poll",
            Self::Rebroadcast => "rebroadcast",
            Self::Initial => "initial poll",
        })
    }
}

#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub pool_id: String,
    pub source: String,
    pub block_refresh_interval: Duration,
    pub job_rebroadcast_timeout: Duration,
    pub max_active_jobs: usize,
    pub zmq_endpoint: Option<String>,
    pub zmq_topic: String,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            pool_id: String::new(),
            source: String::new(),
            block_refresh_interval: Duration::from_secs(1),
            job_rebroadcast_timeout: Duration::from_secs(55),
            max_active_jobs: 4,
            zmq_endpoint: None,
            zmq_topic: zmq::DEFAULT_TOPIC.into(),
        }
    }
}

/// A job every live connection should now be working on.
#[derive(Debug)]
pub struct JobBroadcast<J> {
    pub job: Arc<J>,
    pub clean_jobs: bool,
}

impl<J> Clone for JobBroadcast<J> {
    fn clone(&self) -> Self {
        Self {
            job: self.job.clone(),
            clean_jobs: self.clean_jobs,
        }
    }
}

/// Turns upstream templates into jobs, keeps the recent ones around for
/// late submissions and routes shares to the family for validation.
pub struct JobManager<F: Family> {
    config: JobManagerConfig,
    family: Arc<F>,
    upstream: Arc<dyn Upstream<F>>,
    clock: Arc<dyn Clock>,
    jobs: Mutex<VecDeque<Arc<F::Job>>>,
    stats: Mutex<BlockchainStats>,
    sequence: AtomicU64,
    has_initial_template: AtomicBool,
    job_sender: broadcast::Sender<JobBroadcast<F::Job>>,
    trigger_sender: mpsc::Sender<Trigger>,
    trigger_receiver: Mutex<Option<mpsc::Receiver<Trigger>>>,
}

impl<F: Family> JobManager<F> {
    pub fn new(
        config: JobManagerConfig,
        family: Arc<F>,
        upstream: Arc<dyn Upstream<F>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        ensure!(config.max_active_jobs > 0, "max active jobs must be at least 1");

        let (job_sender, _) = broadcast::channel(JOB_BROADCAST_CAPACITY);
        let (trigger_sender, trigger_receiver) = mpsc::channel(TRIGGER_CAPACITY);

        Ok(Self {
            config,
            family,
            upstream,
            clock,
            jobs: Mutex::new(VecDeque::new()),
            stats: Mutex::new(BlockchainStats::default()),
            sequence: AtomicU64::new(0),
            has_initial_template: AtomicBool::new(false),
            job_sender,
            trigger_sender,
            trigger_receiver: Mutex::new(Some(trigger_receiver)),
        })
    }

    pub fn family(&self) -> &Arc<F> {
        &self.family
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream<F>> {
        &self.upstream
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn pool_id(&self) -> &str {
        &self.config.pool_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobBroadcast<F::Job>> {
        self.job_sender.subscribe()
    }

    pub fn current_job(&self) -> Option<Arc<F::Job>> {
        self.jobs.lock().front().cloned()
    }

    pub fn find_job(&self, id: &str) -> Option<Arc<F::Job>> {
        self.jobs.lock().iter().find(|job| job.id() == id).cloned()
    }

    /// Ids of the jobs still accepting shares, newest first.
    pub fn valid_job_ids(&self) -> Vec<String> {
        self.jobs
            .lock()
            .iter()
            .map(|job| job.id().to_string())
            .collect()
    }

    pub fn stats(&self) -> BlockchainStats {
        self.stats.lock().clone()
    }

    pub fn has_initial_template(&self) -> bool {
        self.has_initial_template.load(Ordering::Relaxed)
    }

    /// Queues a refresh. Fails only once the update loop is gone.
    pub async fn trigger(&self, trigger: Trigger) -> Result {
        self.trigger_sender
            .send(trigger)
            .await
            .map_err(|_| anyhow!("job manager update loop has stopped"))
    }

    /// Fetches a template and applies it. Returns whether it described a new block.
    pub async fn update(&self, trigger: Trigger) -> Result<bool> {
        let template = self
            .upstream
            .block_template()
            .await
            .context("failed to fetch block template")?;

        self.family.prepare(&template).await;

        self.apply_template(template, trigger.force(), trigger)
    }

    pub(crate) fn apply_template(
        &self,
        template: F::Template,
        force: bool,
        via: Trigger,
    ) -> Result<bool> {
        let current = self.current_job();

        let is_new = template.is_new(current.as_ref().map(|job| job.template().as_ref()));

        if !is_new && !force {
            return Ok(false);
        }

        let now = self.clock.now();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let job = Arc::new(self.family.create_job(
            Arc::new(template),
            self.family.job_id(sequence),
            now,
        )?);

        {
            let mut jobs = self.jobs.lock();
            jobs.push_front(job.clone());
            jobs.truncate(self.config.max_active_jobs);
        }

        if is_new {
            {
                let mut stats = self.stats.lock();
                self.family.update_stats(&job, &mut stats);
                stats.last_network_block_time = Some(now);
            }

            self.has_initial_template.store(true, Ordering::Relaxed);

            info!(
                "Detected new block {} via {via}, network difficulty {}",
                job.template().height(),
                job.network_difficulty()
            );
        } else {
            debug!(
                "Broadcasting job {} for block {} via {via}",
                job.id(),
                job.template().height()
            );
        }

        self.job_sender
            .send(JobBroadcast {
                job,
                clean_jobs: is_new,
            })
            .ok();

        Ok(is_new)
    }

    /// Starts the push listener and the update loop. Each trigger is handled
    /// to completion before the next one is taken.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let mut receiver = self
            .trigger_receiver
            .lock()
            .take()
            .context("job manager already started")?;

        if let Some(endpoint) = &self.config.zmq_endpoint {
            let subscription = Zmq::connect(endpoint, &self.config.zmq_topic).await?;
            spawn_push_listener(subscription, self.trigger_sender.clone(), cancel.clone());
        }

        info!("Spawning {} job manager task", F::NAME);

        let manager = self.clone();

        Ok(tokio::spawn(async move {
            let mut poll = optional_interval(manager.config.block_refresh_interval);
            let mut rebroadcast = optional_interval(manager.config.job_rebroadcast_timeout);
            let mut initial = if manager.config.block_refresh_interval.is_zero() {
                Some(new_interval(Duration::from_secs(1)))
            } else {
                None
            };

            if let Some(rebroadcast) = &mut rebroadcast {
                rebroadcast.reset();
            }

            loop {
                let trigger = tokio::select! {
                    _ = cancel.cancelled() => break,
                    trigger = receiver.recv() => match trigger {
                        Some(trigger) => trigger,
                        None => break,
                    },
                    _ = tick(&mut poll) => Trigger::Poll,
                    _ = tick(&mut rebroadcast) => Trigger::Rebroadcast,
                    _ = tick(&mut initial) => Trigger::Initial,
                };

                if trigger.restarts_timers() {
                    for interval in [&mut poll, &mut rebroadcast].into_iter().flatten() {
                        interval.reset();
                    }
                }

                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = manager.update(trigger) => result,
                };

                match result {
                    Ok(true) => {
                        if let Some(rebroadcast) = &mut rebroadcast {
                            rebroadcast.reset();
                        }
                    }
                    Ok(false) => {}
                    Err(err) => warn!("Failed to update {} job via {trigger}: {err:#}", F::NAME),
                }

                if manager.has_initial_template() {
                    initial = None;
                }
            }

            info!("Shutting down {} job manager", F::NAME);
        }))
    }

    /// Validates a submission against the job it names. Runs under the
    /// caller's context lock, so it never blocks on the network.
    pub fn process_submission(
        &self,
        context: &mut F::Context,
        params: &Value,
    ) -> Result<(Share, Option<F::Block>), ShareError> {
        let submission = self.family.parse_submission(context, params)?;

        let job = self
            .find_job(submission.job_id())
            .ok_or(ShareError::JobNotFound)?;

        let now = self.clock.now();

        let (mut share, block) = self
            .family
            .process_share(&job, context, &submission, now)?;

        share.pool_id = self.config.pool_id.clone();
        share.source = self.config.source.clone();
        share.miner = context.miner.clone().unwrap_or_default();
        share.worker = context.worker.clone().unwrap_or_default();
        share.user_agent = context.user_agent.clone().unwrap_or_default();
        share.created = now;

        Ok((share, block))
    }

    /// Hands a candidate block to the node. A rejection only clears the
    /// candidate flag.
    pub async fn submit_block(&self, share: &mut Share, block: &F::Block) {
        let hash = share.block_hash.clone().unwrap_or_default();

        info!(
            "Submitting block {} [{hash}] found by {}",
            share.block_height, share.miner
        );

        match self.upstream.submit_block(share, block).await {
            Ok(result) if result.accepted => {
                info!(
                    "Daemon accepted block {} [{hash}] submitted by {}",
                    share.block_height, share.miner
                );

                share.transaction_confirmation_data = result.confirmation;

                if self.trigger(Trigger::BlockFound).await.is_err() {
                    debug!("Block found while job manager is stopped");
                }
            }
            Ok(_) => {
                warn!(
                    "Daemon rejected block {} [{hash}] submitted by {}",
                    share.block_height, share.miner
                );
                share.is_block_candidate = false;
            }
            Err(err) => {
                warn!("Failed to submit block {} [{hash}]: {err:#}", share.block_height);
                share.is_block_candidate = false;
            }
        }
    }

    /// Validates a share from `connection` and submits the block it solves, if any.
    pub async fn submit_share(
        &self,
        connection: &StratumConnection,
        params: &Value,
    ) -> Result<Share, ShareError> {
        let (mut share, block) = {
            let mut context = connection
                .context_as::<F::Context>()
                .ok_or(ShareError::NotSubscribed)?;

            if !context.is_authorized {
                return Err(ShareError::Unauthorized);
            }

            if !context.is_subscribed {
                return Err(ShareError::NotSubscribed);
            }

            self.process_submission(&mut context, params)?
        };

        share.ip_address = connection.remote_address().ip().to_string();

        if share.is_block_candidate {
            match block {
                Some(block) => self.submit_block(&mut share, &block).await,
                None => share.is_block_candidate = false,
            }
        }

        Ok(share)
    }
}

fn spawn_push_listener(
    mut subscription: Zmq,
    triggers: mpsc::Sender<Trigger>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut last = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notification = subscription.recv() => match notification {
                    Ok(hash) => {
                        if last.as_ref() == Some(&hash) {
                            continue;
                        }

                        debug!("Block notification {hash} from {}", subscription.endpoint());

                        last = Some(hash);

                        if triggers.send(Trigger::PubSub).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("Failed to receive block notification: {err:#}"),
                },
            }
        }
    });
}

fn new_interval(period: Duration) -> Interval {
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

fn optional_interval(period: Duration) -> Option<Interval> {
    (!period.is_zero()).then(|| new_interval(period))
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
