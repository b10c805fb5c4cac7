use super::*;

pub(crate) mod bouncer;

#[derive(Debug, Clone, PartialEq)]
pub struct StratifierConfig {
    pub start_difficulty: f64,
    pub vardiff: Option<VardiffConfig>,
    pub bouncer: BouncerConfig,
    /// Workers silent for longer than this are disconnected at the next broadcast.
    pub client_timeout: Option<Duration>,
    /// How long a worker dropped by the bouncer stays banned.
    pub ban_duration: Duration,
    /// Ban applied to workers whose credentials are refused. `None` only disconnects.
    pub login_failure_ban: Option<Duration>,
}

impl Default for StratifierConfig {
    fn default() -> Self {
        Self {
            start_difficulty: 1.0,
            vardiff: None,
            bouncer: BouncerConfig::default(),
            client_timeout: None,
            ban_duration: Duration::from_secs(600),
            login_failure_ban: None,
        }
    }
}

enum DispatchError {
    Share(ShareError),
    Connection(ConnectionError),
}

impl From<ShareError> for DispatchError {
    fn from(error: ShareError) -> Self {
        Self::Share(error)
    }
}

impl From<ConnectionError> for DispatchError {
    fn from(error: ConnectionError) -> Self {
        Self::Connection(error)
    }
}

/// Pool-level request handler. Speaks the family's dialect to every
/// connection and fans job broadcasts out to them.
pub struct Stratifier<F: Family> {
    config: StratifierConfig,
    manager: Arc<JobManager<F>>,
    connections: Connections,
    bans: Arc<dyn BanManager>,
    events: mpsc::Sender<ShareEvent>,
}

impl<F: Family> Stratifier<F> {
    pub fn new(
        config: StratifierConfig,
        manager: Arc<JobManager<F>>,
        connections: Connections,
        bans: Arc<dyn BanManager>,
        events: mpsc::Sender<ShareEvent>,
    ) -> Self {
        Self {
            config,
            manager,
            connections,
            bans,
            events,
        }
    }

    pub fn manager(&self) -> &Arc<JobManager<F>> {
        &self.manager
    }

    /// Forwards every job broadcast to the live connections until cancelled.
    pub fn spawn_broadcaster(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let stratifier = self.clone();
        let mut jobs = self.manager.subscribe();

        tokio::spawn(async move {
            loop {
                let broadcast = tokio::select! {
                    _ = cancel.cancelled() => break,
                    broadcast = jobs.recv() => match broadcast {
                        Ok(broadcast) => broadcast,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Job broadcaster lagged, skipped {skipped} jobs");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                stratifier.broadcast(&broadcast).await;
            }

            debug!("Job broadcaster for {} stopped", stratifier.manager.pool_id());
        })
    }

    pub(crate) async fn broadcast(&self, broadcast: &JobBroadcast<F::Job>) {
        let connections = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<Arc<StratumConnection>>>();

        info!(
            "Broadcasting job {} to {} connections",
            broadcast.job.id(),
            connections.len()
        );

        let now = self.manager.clock().now();

        futures::future::join_all(connections.iter().map(|connection| async move {
            if !connection.is_alive() {
                return;
            }

            let idle = {
                let Some(context) = connection.context_as::<F::Context>() else {
                    return;
                };

                if !context.is_subscribed || !context.is_authorized {
                    return;
                }

                self.config.client_timeout.is_some_and(|client_timeout| {
                    (now - context.last_activity)
                        .to_std()
                        .is_ok_and(|idle| idle > client_timeout)
                })
            };

            if idle {
                info!("[{}] Booting zombie worker (idle timeout exceeded)", connection.id());
                connection.disconnect();
                return;
            }

            if let Err(err) = self
                .send_work(connection, &broadcast.job, false, broadcast.clean_jobs)
                .await
            {
                debug!("[{}] Failed to send job: {err}", connection.id());
            }
        }))
        .await;
    }

    /// Puts a connection on `job`, announcing its difficulty first when it
    /// changed or `announce_difficulty` is set.
    async fn send_work(
        &self,
        connection: &StratumConnection,
        job: &F::Job,
        announce_difficulty: bool,
        clean_jobs: bool,
    ) -> Result<(), ConnectionError> {
        let messages = {
            let Some(mut context) = connection.context_as::<F::Context>() else {
                return Ok(());
            };

            let difficulty_changed = context.apply_pending_difficulty() || announce_difficulty;

            if difficulty_changed {
                let difficulty = context.difficulty;
                if let Some(vardiff) = context.vardiff.as_mut() {
                    vardiff.reset(difficulty);
                }
            }

            self.manager
                .family()
                .work(job, &mut context, difficulty_changed, clean_jobs)
        };

        for message in messages {
            connection.send(message).await?;
        }

        Ok(())
    }

    fn with_context<T>(
        &self,
        connection: &StratumConnection,
        f: impl FnOnce(&mut F::Context) -> Result<T, ShareError>,
    ) -> Result<T, ShareError> {
        let mut context = connection
            .context_as::<F::Context>()
            .ok_or(ShareError::NotSubscribed)?;

        f(&mut context)
    }

    fn current_job(&self) -> Result<Arc<F::Job>, ShareError> {
        self.manager
            .current_job()
            .ok_or_else(|| ShareError::other("no work available"))
    }

    fn emit(&self, event: ShareEvent) {
        if let Err(err) = self.events.try_send(event) {
            warn!("Dropping share event: {err}");
        }
    }

    fn ban(&self, connection: &StratumConnection, duration: Duration) {
        let address = connection.remote_address().ip();
        info!("[{}] Banning {address} for {}s", connection.id(), duration.as_secs());
        self.bans.ban(address, duration);
    }

    async fn subscribe(
        &self,
        connection: &StratumConnection,
        request: &Request,
    ) -> Result<(), DispatchError> {
        let result = self.with_context(connection, |context| {
            let result = self
                .manager
                .family()
                .subscribe(context, connection.id(), &request.params)?;

            context.is_subscribed = true;
            context.user_agent = user_agent(&request.params);

            Ok(result)
        })?;

        connection.respond(request.id.clone(), result).await?;

        Ok(())
    }

    async fn configure(
        &self,
        connection: &StratumConnection,
        request: &Request,
    ) -> Result<(), DispatchError> {
        let result = self.with_context(connection, |context| {
            self.manager
                .family()
                .configure(context, &request.params)
                .ok_or_else(|| ShareError::other(format!("unsupported request {}", request.method)))
        })?;

        connection.respond(request.id.clone(), result).await?;

        Ok(())
    }

    /// Checks credentials and records the outcome on the worker context.
    /// Returns whether the worker may mine.
    async fn authorize_worker(
        &self,
        connection: &StratumConnection,
        authorize: &Authorize,
    ) -> Result<bool, ShareError> {
        let family = self.manager.family();
        let (miner, worker) = family.split_username(&authorize.username);

        let authorized = family.validate_miner(&miner)
            && match self.manager.upstream().validate_address(&miner).await {
                Ok(valid) => valid,
                Err(err) => {
                    warn!("Failed to validate miner address {miner}: {err:#}");
                    false
                }
            };

        self.with_context(connection, |context| {
            context.is_authorized = authorized;
            context.miner = Some(miner.clone());
            context.worker = Some(worker.clone());

            if !authorized {
                return Ok(());
            }

            if let Some(difficulty) = authorize.static_difficulty() {
                let accepted = match &context.vardiff {
                    Some(vardiff) => difficulty >= vardiff.config().min_difficulty,
                    None => difficulty > context.difficulty,
                };

                if accepted {
                    context.vardiff = None;
                    context.set_difficulty(difficulty);
                    info!(
                        "[{}] Static difficulty {difficulty} set by {miner}",
                        connection.id()
                    );
                }
            }

            Ok(())
        })?;

        if authorized {
            info!("[{}] Authorized worker {miner}.{worker}", connection.id());
        }

        Ok(authorized)
    }

    async fn refuse_login(
        &self,
        connection: &StratumConnection,
        id: Id,
        message: &str,
    ) -> Result<(), DispatchError> {
        info!(
            "[{}] Refusing login from {}",
            connection.id(),
            connection.remote_address()
        );

        connection
            .respond_error(id, StratumError::UnauthorizedWorker.with_message(message))
            .await?;

        if let Some(duration) = self.config.login_failure_ban {
            self.ban(connection, duration);
        }

        connection.disconnect();

        Ok(())
    }

    async fn authorize(
        &self,
        connection: &StratumConnection,
        request: &Request,
    ) -> Result<(), DispatchError> {
        let authorize = Authorize::from_params(&request.params)
            .ok_or_else(|| ShareError::other("invalid params"))?;

        if !self.authorize_worker(connection, &authorize).await? {
            return self
                .refuse_login(connection, request.id.clone(), "authorization failed")
                .await;
        }

        connection.respond(request.id.clone(), json!(true)).await?;

        if let Some(job) = self.manager.current_job() {
            self.send_work(connection, &job, true, true).await?;
        }

        Ok(())
    }

    async fn login(
        &self,
        connection: &StratumConnection,
        request: &Request,
    ) -> Result<(), DispatchError> {
        let (authorize, agent) = self.manager.family().login(&request.params)?;

        if !self.authorize_worker(connection, &authorize).await? {
            return self
                .refuse_login(connection, request.id.clone(), "invalid login")
                .await;
        }

        let job = self.current_job()?;

        let result = self.with_context(connection, |context| {
            context.is_subscribed = true;
            context.user_agent = agent;
            context.apply_pending_difficulty();

            Ok(json!({
                "id": connection.id(),
                "job": self.manager.family().job_result(&job, context),
                "status": "OK",
            }))
        })?;

        connection.respond(request.id.clone(), result).await?;

        Ok(())
    }

    async fn get_job(
        &self,
        connection: &StratumConnection,
        request: &Request,
    ) -> Result<(), DispatchError> {
        check_login_id(connection, &request.params)?;

        let job = self.current_job()?;

        let result = self.with_context(connection, |context| {
            if !context.is_authorized {
                return Err(ShareError::Unauthorized);
            }

            context.apply_pending_difficulty();

            Ok(self.manager.family().job_result(&job, context))
        })?;

        connection.respond(request.id.clone(), result).await?;

        Ok(())
    }

    async fn keep_alive(
        &self,
        connection: &StratumConnection,
        request: &Request,
    ) -> Result<(), DispatchError> {
        check_login_id(connection, &request.params)?;

        let now = self.manager.clock().now();
        self.with_context(connection, |context| {
            context.last_activity = now;
            Ok(())
        })?;

        connection
            .respond(request.id.clone(), json!({"status": "KEEPALIVED"}))
            .await?;

        Ok(())
    }

    async fn submit(
        &self,
        connection: &StratumConnection,
        request: &Request,
    ) -> Result<(), DispatchError> {
        let age = request.received.elapsed();

        if age > MAX_SHARE_AGE {
            warn!(
                "[{}] Dropping stale share submission ({}ms old)",
                connection.id(),
                age.as_millis()
            );
            return Ok(());
        }

        if F::DIALECT == Dialect::Login {
            check_login_id(connection, &request.params)?;
        }

        let now = self.manager.clock().now();
        self.with_context(connection, |context| {
            context.last_activity = now;
            Ok(())
        })?;

        match self.manager.submit_share(connection, &request.params).await {
            Ok(share) => {
                connection
                    .respond(request.id.clone(), self.manager.family().submit_result())
                    .await?;

                info!(
                    "[{}] Share accepted: D={}",
                    connection.id(),
                    share.difficulty * self.manager.family().share_multiplier()
                );

                let network_difficulty = self.manager.stats().network_difficulty;

                let retarget = self.with_context(connection, |context| {
                    context.stats.valid_shares += 1;
                    context.bouncer.accept();

                    let difficulty = context.difficulty;

                    Ok(context
                        .vardiff
                        .as_mut()
                        .and_then(|vardiff| vardiff.record_share(difficulty, network_difficulty)))
                })?;

                self.emit(ShareEvent::Accepted(share));

                if let Some(difficulty) = retarget {
                    self.retarget(connection, difficulty).await?;
                }

                Ok(())
            }
            Err(error) => {
                let (consequence, miner, worker, agent) = self
                    .with_context(connection, |context| {
                        context.stats.invalid_shares += 1;

                        Ok((
                            context.bouncer.reject(),
                            context.miner.clone(),
                            context.worker.clone(),
                            context.user_agent.clone(),
                        ))
                    })
                    .unwrap_or_default();

                info!(
                    "[{}] Share rejected: {error} [{}]",
                    connection.id(),
                    agent.as_deref().unwrap_or_default()
                );

                self.emit(ShareEvent::Rejected {
                    connection_id: connection.id().into(),
                    miner,
                    worker,
                    error: error.clone(),
                });

                match consequence {
                    Consequence::None => {}
                    Consequence::Warn => warn!(
                        "[{}] Worker {} keeps submitting invalid shares",
                        connection.id(),
                        connection.remote_address()
                    ),
                    Consequence::Drop => {
                        connection
                            .respond_error(request.id.clone(), error.to_json_rpc())
                            .await?;
                        self.ban(connection, self.config.ban_duration);
                        connection.disconnect();
                        return Ok(());
                    }
                }

                Err(error.into())
            }
        }
    }

    async fn retarget(
        &self,
        connection: &StratumConnection,
        difficulty: f64,
    ) -> Result<(), ConnectionError> {
        info!("[{}] Retargeting to difficulty {difficulty}", connection.id());

        if let Some(mut context) = connection.context_as::<F::Context>() {
            context.enqueue_new_difficulty(difficulty);
        }

        match self.manager.current_job() {
            Some(job) => self.send_work(connection, &job, false, false).await,
            None => Ok(()),
        }
    }

    async fn dispatch(
        &self,
        connection: &StratumConnection,
        request: &Request,
    ) -> Result<(), DispatchError> {
        let method = request
            .method
            .parse::<Method>()
            .ok()
            .filter(|method| F::DIALECT.supports(*method));

        match method {
            Some(Method::Subscribe) => self.subscribe(connection, request).await,
            Some(Method::Authorize) => self.authorize(connection, request).await,
            Some(Method::Submit | Method::LoginSubmit) => self.submit(connection, request).await,
            Some(Method::Configure) => self.configure(connection, request).await,
            Some(Method::ExtranonceSubscribe) => {
                connection.respond(request.id.clone(), json!(true)).await?;
                Ok(())
            }
            Some(Method::Login) => self.login(connection, request).await,
            Some(Method::GetJob) => self.get_job(connection, request).await,
            Some(Method::KeepAlive) => self.keep_alive(connection, request).await,
            _ => Err(ShareError::other(format!("unsupported request {}", request.method)).into()),
        }
    }
}

#[async_trait]
impl<F: Family> RequestHandler for Stratifier<F> {
    async fn on_connect(&self, connection: &Arc<StratumConnection>) {
        let base = WorkerContext::new(
            self.config.start_difficulty,
            self.config.vardiff,
            self.config.bouncer,
            self.manager.clock().now(),
        );

        connection.set_context(self.manager.family().create_context(base));

        debug!(
            "[{}] {} worker connected from {}",
            connection.id(),
            F::NAME,
            connection.remote_address()
        );
    }

    async fn on_request(
        &self,
        connection: &Arc<StratumConnection>,
        request: Request,
    ) -> Result<(), ConnectionError> {
        debug!("[{}] {} {}", connection.id(), request.method, request.params);

        match self.dispatch(connection, &request).await {
            Ok(()) => Ok(()),
            Err(DispatchError::Share(error)) => {
                connection
                    .respond_error(request.id, error.to_json_rpc())
                    .await
            }
            Err(DispatchError::Connection(error)) => Err(error),
        }
    }

    async fn on_disconnect(&self, connection: &Arc<StratumConnection>) {
        let stats = connection
            .context_as::<F::Context>()
            .map(|context| context.stats)
            .unwrap_or_default();

        debug!(
            "[{}] Worker disconnected after {} valid and {} invalid shares",
            connection.id(),
            stats.valid_shares,
            stats.invalid_shares
        );
    }
}

/// `getjob`, `submit` and `keepalived` must name the session `login` handed out.
fn check_login_id(connection: &StratumConnection, params: &Value) -> Result<(), ShareError> {
    match params.get("id").and_then(Value::as_str) {
        Some(id) if id == connection.id() => Ok(()),
        _ => Err(ShareError::InvalidRequest {
            message: "invalid login".into(),
        }),
    }
}
