use super::*;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum FamilyKind {
    #[default]
    Bitcoin,
    Equihash,
    Ethereum,
    Ergo,
}

impl FamilyKind {
    /// Width of the extranonce1 handed to each connection.
    pub(crate) fn extranonce_size(self) -> usize {
        match self {
            Self::Bitcoin | Self::Equihash => 4,
            Self::Ethereum | Self::Ergo => 2,
        }
    }
}

#[derive(Clone, Debug, Parser)]
pub(crate) struct PoolConfig {
    #[arg(long, value_enum, help = "Mine a chain of <FAMILY>.", default_value = "bitcoin")]
    family: FamilyKind,
    #[arg(long, help = "Name the mined <CHAIN> in logs.")]
    chain: Option<String>,
    #[arg(long, help = "Tag shares with <POOL_ID>.", default_value = "pool1")]
    pool_id: String,
    #[arg(long, help = "Tag shares with <CLUSTER> as their source.", default_value = "default")]
    cluster: String,
    #[arg(long, help = "Use <INSTANCE_ID> (0-15) for extranonce prefixes. Random if not set.")]
    instance_id: Option<u8>,
    #[arg(long, help = "Accept plain Stratum on <STRATUM>.", default_value = "0.0.0.0:3333")]
    stratum: Vec<SocketAddr>,
    #[arg(long, help = "Accept Stratum over TLS on <STRATUM_TLS>.")]
    stratum_tls: Vec<SocketAddr>,
    #[arg(long, help = "Load TLS certificate chain from <TLS_CERTIFICATE>.")]
    tls_certificate: Option<PathBuf>,
    #[arg(long, help = "Load TLS private key from <TLS_KEY>.")]
    tls_key: Option<PathBuf>,
    #[arg(long, help = "Accept PROXY protocol v1 headers.")]
    proxy_protocol: bool,
    #[arg(long, help = "Refuse connections without a PROXY protocol header.")]
    proxy_protocol_mandatory: bool,
    #[arg(long, help = "Accept PROXY protocol headers only from <PROXY_WHITELIST>.")]
    proxy_whitelist: Vec<IpAddr>,
    #[arg(
        long,
        help = "Connect to the node RPC at <RPC_URL>.",
        default_value = "http://127.0.0.1:8332"
    )]
    rpc_url: String,
    #[arg(long, help = "Authenticate to the node RPC as <RPC_USERNAME>.")]
    rpc_username: Option<String>,
    #[arg(
        long,
        env = "STRATA_RPC_PASSWORD",
        help = "Authenticate to the node RPC with <RPC_PASSWORD>."
    )]
    rpc_password: Option<String>,
    #[arg(long, help = "Give up on node RPC calls after <RPC_TIMEOUT> seconds.", default_value = "10")]
    rpc_timeout: u64,
    #[arg(long, help = "Subscribe to block notifications at <ZMQ_ENDPOINT>.")]
    zmq_endpoint: Option<String>,
    #[arg(long, help = "Subscribe to <ZMQ_TOPIC>.", default_value = zmq::DEFAULT_TOPIC)]
    zmq_topic: String,
    #[arg(
        long,
        help = "Poll for block templates every <BLOCK_REFRESH_INTERVAL> milliseconds. 0 disables polling.",
        default_value = "1000"
    )]
    block_refresh_interval: u64,
    #[arg(
        long,
        help = "Rebroadcast the current job after <JOB_REBROADCAST_TIMEOUT> seconds without a new block. 0 disables.",
        default_value = "55"
    )]
    job_rebroadcast_timeout: u64,
    #[arg(long, help = "Accept shares for the <MAX_ACTIVE_JOBS> newest jobs.", default_value = "4")]
    max_active_jobs: usize,
    #[arg(long, help = "Pay block rewards to <POOL_ADDRESS>.")]
    pool_address: Option<String>,
    #[arg(long, help = "Sign coinbase transactions with <COINBASE_STRING>.", default_value = "Strata")]
    coinbase_string: String,
    #[arg(long, help = "Attach <TX_COMMENT> to coinbase transactions.")]
    tx_comment: Option<String>,
    #[arg(long, help = "Build coinbase transactions with <COINBASE_TX_VERSION>.", default_value = "1")]
    coinbase_tx_version: u32,
    #[arg(long, help = "Leave template coinbase aux flags out of the coinbase.")]
    ignore_aux_flags: bool,
    #[arg(long, help = "Scale share difficulty by <SHARE_MULTIPLIER>.", default_value = "1")]
    share_multiplier: f64,
    #[arg(long, help = "Pay masternodes from template data.")]
    masternodes: bool,
    #[arg(long, help = "Pay the template payee.")]
    payee: bool,
    #[arg(long, help = "Pay the template founder reward.")]
    founder: bool,
    #[arg(long, help = "Pay the template developer reward.")]
    dev_reward: bool,
    #[arg(long, help = "Carry the template coinbase payload.")]
    coinbase_payload: bool,
    #[arg(long, help = "Give <START_DIFFICULTY> to new clients.", default_value = "1")]
    start_difficulty: f64,
    #[arg(long, help = "Retarget client difficulty from their share rate.")]
    vardiff: bool,
    #[arg(
        long,
        help = "Target <VARDIFF_TARGET_TIME> seconds between share submissions.",
        default_value = "15"
    )]
    vardiff_target_time: f64,
    #[arg(
        long,
        help = "Average the share submission rate over <VARDIFF_WINDOW> seconds.",
        default_value = "300"
    )]
    vardiff_window: f64,
    #[arg(long, help = "Never retarget below <VARDIFF_MIN>.", default_value = "0.01")]
    vardiff_min: f64,
    #[arg(long, help = "Never retarget above <VARDIFF_MAX>.")]
    vardiff_max: Option<f64>,
    #[arg(
        long,
        help = "Ban peers sending junk.",
        default_value = "true",
        action = ArgAction::Set
    )]
    ban_on_junk_receive: bool,
    #[arg(
        long,
        help = "Ban peers failing the TLS handshake.",
        default_value = "true",
        action = ArgAction::Set
    )]
    ban_on_invalid_tls_handshake: bool,
    #[arg(long, help = "Ban misbehaving peers for <BAN_DURATION> seconds.", default_value = "600")]
    ban_duration: u64,
    #[arg(long, help = "Ban peers with refused credentials for <LOGIN_FAILURE_BAN> seconds.")]
    login_failure_ban: Option<u64>,
    #[arg(
        long,
        help = "Warn after <REJECT_WARN_THRESHOLD> seconds of consecutive rejects.",
        default_value = "60"
    )]
    reject_warn_threshold: u64,
    #[arg(
        long,
        help = "Ban and disconnect after <REJECT_DROP_THRESHOLD> seconds of consecutive rejects.",
        default_value = "180"
    )]
    reject_drop_threshold: u64,
    #[arg(long, help = "Disconnect clients idle for <CLIENT_TIMEOUT> seconds.")]
    client_timeout: Option<u64>,
}

impl PoolConfig {
    pub(crate) fn family(&self) -> FamilyKind {
        self.family
    }

    pub(crate) fn chain(&self) -> String {
        self.chain
            .clone()
            .unwrap_or_else(|| format!("{:?}", self.family).to_lowercase())
    }

    pub(crate) fn pool_address(&self) -> Result<String> {
        self.pool_address
            .clone()
            .ok_or_else(|| anyhow!("--pool-address is required for {} pools", self.chain()))
    }

    pub(crate) fn extranonce_provider(&self) -> Result<ExtraNonceProvider> {
        ExtraNonceProvider::new(self.family.extranonce_size(), self.instance_id)
    }

    pub(crate) fn daemon(&self) -> Result<DaemonClient> {
        info!("Connecting to node RPC at {}", self.rpc_url);

        DaemonClient::new(
            &self.rpc_url,
            self.rpc_username.clone(),
            self.rpc_password.clone(),
            Duration::from_secs(self.rpc_timeout),
        )
    }

    pub(crate) fn bitcoin_config(&self) -> Result<BitcoinConfig> {
        Ok(BitcoinConfig {
            pool_address: self.pool_address()?,
            coinbase_string: self.coinbase_string.clone(),
            tx_comment: self.tx_comment.clone(),
            coinbase_tx_version: self.coinbase_tx_version,
            ignore_aux_flags: self.ignore_aux_flags,
            share_multiplier: self.share_multiplier,
            features: CoinFeatures {
                masternodes: self.masternodes,
                payee: self.payee,
                founder: self.founder,
                dev_reward: self.dev_reward,
                coinbase_payload: self.coinbase_payload,
            },
        })
    }

    pub(crate) fn job_manager_config(&self) -> JobManagerConfig {
        JobManagerConfig {
            pool_id: self.pool_id.clone(),
            source: self.cluster.clone(),
            block_refresh_interval: Duration::from_millis(self.block_refresh_interval),
            job_rebroadcast_timeout: Duration::from_secs(self.job_rebroadcast_timeout),
            max_active_jobs: self.max_active_jobs,
            zmq_endpoint: self.zmq_endpoint.clone(),
            zmq_topic: self.zmq_topic.clone(),
        }
    }

    pub(crate) fn stratifier_config(&self) -> StratifierConfig {
        StratifierConfig {
            start_difficulty: self.start_difficulty,
            vardiff: self.vardiff.then(|| VardiffConfig {
                target_time: Duration::from_secs_f64(self.vardiff_target_time),
                window: Duration::from_secs_f64(self.vardiff_window),
                min_difficulty: self.vardiff_min,
                max_difficulty: self.vardiff_max,
            }),
            bouncer: BouncerConfig {
                warn_after: Duration::from_secs(self.reject_warn_threshold),
                drop_after: Duration::from_secs(self.reject_drop_threshold),
            },
            client_timeout: self.client_timeout.map(Duration::from_secs),
            ban_duration: Duration::from_secs(self.ban_duration),
            login_failure_ban: self.login_failure_ban.map(Duration::from_secs),
        }
    }

    pub(crate) fn banning_config(&self) -> BanningConfig {
        BanningConfig {
            ban_on_junk_receive: self.ban_on_junk_receive,
            ban_on_invalid_tls_handshake: self.ban_on_invalid_tls_handshake,
            duration: Duration::from_secs(self.ban_duration),
        }
    }

    pub(crate) fn endpoints(&self) -> Result<Vec<StratumEndpoint>> {
        let proxy = ProxyProtocol {
            enabled: self.proxy_protocol || self.proxy_protocol_mandatory,
            mandatory: self.proxy_protocol_mandatory,
            whitelist: self.proxy_whitelist.clone(),
        };

        let mut endpoints = self
            .stratum
            .iter()
            .map(|address| StratumEndpoint {
                address: *address,
                tls: None,
                proxy: proxy.clone(),
            })
            .collect::<Vec<StratumEndpoint>>();

        if !self.stratum_tls.is_empty() {
            let tls = TlsConfig {
                certificate: self
                    .tls_certificate
                    .clone()
                    .context("--tls-certificate is required with --stratum-tls")?,
                key: self
                    .tls_key
                    .clone()
                    .context("--tls-key is required with --stratum-tls")?,
            };

            endpoints.extend(self.stratum_tls.iter().map(|address| StratumEndpoint {
                address: *address,
                tls: Some(tls.clone()),
                proxy: proxy.clone(),
            }));
        }

        ensure!(!endpoints.is_empty(), "no stratum endpoints configured");

        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    fn parse(args: &str) -> PoolConfig {
        match Arguments::try_parse_from(args.split_whitespace()).unwrap().subcommand {
            Subcommand::Pool(pool) => pool.config,
        }
    }

    #[test]
    fn defaults() {
        let config = parse("strata pool");

        assert_eq!(config.family(), FamilyKind::Bitcoin);
        assert_eq!(config.chain(), "bitcoin");
        assert!(config.pool_address().is_err());

        assert_eq!(
            config.endpoints().unwrap(),
            vec![StratumEndpoint::plain("0.0.0.0:3333".parse().unwrap())]
        );

        let manager = config.job_manager_config();
        assert_eq!(manager.pool_id, "pool1");
        assert_eq!(manager.source, "default");
        assert_eq!(manager.block_refresh_interval, Duration::from_secs(1));
        assert_eq!(manager.job_rebroadcast_timeout, Duration::from_secs(55));
        assert_eq!(manager.max_active_jobs, 4);
        assert_eq!(manager.zmq_endpoint, None);
        assert_eq!(manager.zmq_topic, "hashblock");

        assert_eq!(config.stratifier_config(), StratifierConfig::default());

        assert_eq!(
            config.banning_config(),
            BanningConfig {
                ban_on_junk_receive: true,
                ban_on_invalid_tls_handshake: true,
                duration: Duration::from_secs(600),
            }
        );
    }

    #[test]
    fn override_everything() {
        let config = parse(
            "strata pool \
             --family ergo \
             --pool-id erg1 \
             --cluster us1 \
             --stratum 0.0.0.0:4000 \
             --stratum 0.0.0.0:4001 \
             --stratum-tls 0.0.0.0:4443 \
             --tls-certificate cert.pem \
             --tls-key key.pem \
             --proxy-protocol-mandatory \
             --proxy-whitelist 10.0.0.1 \
             --zmq-endpoint tcp://127.0.0.1:28332 \
             --block-refresh-interval 0 \
             --max-active-jobs 8 \
             --start-difficulty 4 \
             --vardiff \
             --vardiff-min 2 \
             --vardiff-max 1024 \
             --ban-on-junk-receive false \
             --login-failure-ban 30 \
             --client-timeout 600",
        );

        assert_eq!(config.family(), FamilyKind::Ergo);
        assert_eq!(config.family().extranonce_size(), 2);

        let endpoints = config.endpoints().unwrap();
        assert_eq!(endpoints.len(), 3);
        assert_eq!(endpoints[0].tls, None);
        assert_eq!(
            endpoints[2].tls,
            Some(TlsConfig {
                certificate: "cert.pem".into(),
                key: "key.pem".into(),
            })
        );
        assert_eq!(
            endpoints[1].proxy,
            ProxyProtocol {
                enabled: true,
                mandatory: true,
                whitelist: vec!["10.0.0.1".parse().unwrap()],
            }
        );

        let manager = config.job_manager_config();
        assert_eq!(manager.pool_id, "erg1");
        assert_eq!(manager.source, "us1");
        assert_eq!(manager.block_refresh_interval, Duration::ZERO);
        assert_eq!(manager.max_active_jobs, 8);
        assert_eq!(manager.zmq_endpoint.as_deref(), Some("tcp://127.0.0.1:28332"));

        let stratifier = config.stratifier_config();
        assert_eq!(stratifier.start_difficulty, 4.0);
        assert_eq!(stratifier.vardiff.unwrap().min_difficulty, 2.0);
        assert_eq!(stratifier.vardiff.unwrap().max_difficulty, Some(1024.0));
        assert_eq!(stratifier.login_failure_ban, Some(Duration::from_secs(30)));
        assert_eq!(stratifier.client_timeout, Some(Duration::from_secs(600)));

        assert!(!config.banning_config().ban_on_junk_receive);
    }

    #[test]
    fn tls_endpoints_need_certificates() {
        assert!(
            parse("strata pool --stratum-tls 0.0.0.0:4443")
                .endpoints()
                .is_err()
        );
    }

    #[test]
    fn bitcoin_config() {
        let config = parse(
            "strata pool --pool-address bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4 \
             --coinbase-string hello --masternodes --share-multiplier 2",
        );

        let bitcoin = config.bitcoin_config().unwrap();
        assert_eq!(bitcoin.coinbase_string, "hello");
        assert_eq!(bitcoin.share_multiplier, 2.0);
        assert!(bitcoin.features.masternodes);
        assert!(!bitcoin.features.payee);
    }
}
