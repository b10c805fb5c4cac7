use super::*;

pub(crate) const ADDRESS: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

pub(crate) fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_100, 0).unwrap()
}

pub(crate) fn bitcoin_template(height: u64, previous: u8) -> BitcoinTemplate {
    serde_json::from_value(json!({
        "version": 0x2000_0000u32,
        "previousblockhash": format!("{previous:02x}").repeat(32),
        "transactions": [],
        "coinbaseaux": {"flags": ""},
        "coinbasevalue": 625_000_000u64,
        "curtime": 1_700_000_000u32,
        "bits": "207fffff",
        "height": height,
    }))
    .unwrap()
}

pub(crate) fn bitcoin_upstream(height: u64) -> Arc<MemoryUpstream<Bitcoin>> {
    Arc::new(MemoryUpstream::new(bitcoin_template(height, 1)))
}

pub(crate) fn bitcoin_manager(
    upstream: Arc<MemoryUpstream<Bitcoin>>,
    clock: Arc<dyn Clock>,
) -> Arc<JobManager<Bitcoin>> {
    Arc::new(
        JobManager::new(
            JobManagerConfig {
                pool_id: "btc1".into(),
                source: "eu1".into(),
                block_refresh_interval: Duration::ZERO,
                job_rebroadcast_timeout: Duration::ZERO,
                ..Default::default()
            },
            Arc::new(bitcoin_family()),
            upstream,
            clock,
        )
        .unwrap(),
    )
}

pub(crate) fn bitcoin_family() -> Bitcoin {
    Bitcoin::new(
        BitcoinConfig {
            pool_address: ADDRESS.into(),
            ..Default::default()
        },
        ExtraNonceProvider::new(4, Some(1)).unwrap(),
    )
    .unwrap()
}

pub(crate) fn authorized_bitcoin_context(family: &Bitcoin, difficulty: f64) -> BitcoinContext {
    let mut context = family.create_context(WorkerContext::new(
        difficulty,
        None,
        BouncerConfig::default(),
        now(),
    ));

    family.subscribe(&mut context, "1", &json!([])).unwrap();

    context.is_subscribed = true;
    context.is_authorized = true;
    context.miner = Some(ADDRESS.into());
    context.worker = Some("rig".into());

    context
}
