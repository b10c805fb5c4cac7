use {super::*, pool_config::PoolConfig};

pub(crate) mod pool_config;

const SHARE_EVENT_CAPACITY: usize = 10_000;

#[derive(Parser, Debug)]
pub(crate) struct Pool {
    #[command(flatten)]
    pub(crate) config: PoolConfig,
}

impl Pool {
    pub(crate) async fn run(self, cancel: CancellationToken) -> Result {
        let config = self.config;

        info!("Starting {} pool {}", config.chain(), config.job_manager_config().pool_id);

        match config.family() {
            FamilyKind::Bitcoin => {
                let family = Bitcoin::new(config.bitcoin_config()?, config.extranonce_provider()?)?;
                let upstream = BitcoinUpstream::new(config.daemon()?);
                serve(&config, family, upstream, cancel).await
            }
            FamilyKind::Equihash => {
                let family = Equihash::new(
                    EquihashParams::zcash(),
                    &config.pool_address()?,
                    config.extranonce_provider()?,
                )?;
                let upstream = EquihashUpstream::new(config.daemon()?);
                serve(&config, family, upstream, cancel).await
            }
            FamilyKind::Ethereum => {
                let family = Ethereum::new(config.extranonce_provider()?)?;
                let upstream = EthereumUpstream::new(config.daemon()?);
                serve(&config, family, upstream, cancel).await
            }
            FamilyKind::Ergo => {
                let family = Ergo::new(config.extranonce_provider()?)?;
                let upstream = ErgoUpstream::new(config.daemon()?);
                serve(&config, family, upstream, cancel).await
            }
        }
    }
}

async fn serve<F: Family>(
    config: &PoolConfig,
    family: F,
    upstream: impl Upstream<F>,
    cancel: CancellationToken,
) -> Result {
    let manager = Arc::new(JobManager::new(
        config.job_manager_config(),
        Arc::new(family),
        Arc::new(upstream),
        Arc::new(SystemClock),
    )?);

    let connections = Connections::default();
    let bans: Arc<dyn BanManager> = Arc::new(MemoryBanManager::new());
    let (events, receiver) = mpsc::channel(SHARE_EVENT_CAPACITY);

    let stratifier = Arc::new(Stratifier::new(
        config.stratifier_config(),
        manager.clone(),
        connections.clone(),
        bans.clone(),
        events,
    ));

    let updates = manager.start(cancel.clone()).await?;

    info!("Waiting for the first {} block template", F::NAME);

    while !manager.has_initial_template() {
        tokio::select! {
            _ = cancel.cancelled() => {
                updates.await.ok();
                return Ok(());
            }
            _ = sleep(Duration::from_millis(250)) => {}
        }
    }

    let broadcaster = stratifier.spawn_broadcaster(cancel.clone());
    let share_log = tokio::spawn(log_share_events(receiver));

    let server = Arc::new(StratumServer::new(
        stratifier,
        bans,
        config.banning_config(),
        connections,
    ));

    let result = server.run(&config.endpoints()?, cancel.clone()).await;

    cancel.cancel();

    updates.await.ok();
    broadcaster.await.ok();
    share_log.await.ok();

    info!("Pool {} stopped", manager.pool_id());

    result
}

async fn log_share_events(mut receiver: mpsc::Receiver<ShareEvent>) {
    while let Some(event) = receiver.recv().await {
        match event {
            ShareEvent::Accepted(share) if share.is_block_candidate => info!(
                "Block {} found by {}.{}: {}",
                share.block_height,
                share.miner,
                share.worker,
                share.block_hash.as_deref().unwrap_or_default()
            ),
            ShareEvent::Accepted(share) => match serde_json::to_string(&share) {
                Ok(json) => debug!("Share {json}"),
                Err(err) => warn!("Failed to serialize share: {err}"),
            },
            ShareEvent::Rejected {
                connection_id,
                error,
                ..
            } => debug!("[{connection_id}] Rejected share: {error}"),
        }
    }
}
