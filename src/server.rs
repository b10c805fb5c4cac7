use {
    super::*,
    rustls::pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
    std::{collections::HashMap, path::PathBuf},
    tokio_rustls::TlsAcceptor,
};

/// Live connections by connection id.
pub type Connections = Arc<DashMap<String, Arc<StratumConnection>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StratumEndpoint {
    pub address: SocketAddr,
    pub tls: Option<TlsConfig>,
    pub proxy: ProxyProtocol,
}

impl StratumEndpoint {
    pub fn plain(address: SocketAddr) -> Self {
        Self {
            address,
            tls: None,
            proxy: ProxyProtocol::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BanningConfig {
    pub ban_on_junk_receive: bool,
    pub ban_on_invalid_tls_handshake: bool,
    pub duration: Duration,
}

impl Default for BanningConfig {
    fn default() -> Self {
        Self {
            ban_on_junk_receive: true,
            ban_on_invalid_tls_handshake: true,
            duration: Duration::from_secs(600),
        }
    }
}

/// A bound endpoint waiting to be served.
pub struct Listener {
    endpoint: Arc<StratumEndpoint>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

pub struct StratumServer {
    handler: Arc<dyn RequestHandler>,
    bans: Arc<dyn BanManager>,
    banning: BanningConfig,
    connections: Connections,
    tls_acceptors: Mutex<HashMap<TlsConfig, TlsAcceptor>>,
    next_id: AtomicU64,
}

impl StratumServer {
    pub fn new(
        handler: Arc<dyn RequestHandler>,
        bans: Arc<dyn BanManager>,
        banning: BanningConfig,
        connections: Connections,
    ) -> Self {
        Self {
            handler,
            bans,
            banning,
            connections,
            tls_acceptors: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    pub async fn run(
        self: &Arc<Self>,
        endpoints: &[StratumEndpoint],
        cancel: CancellationToken,
    ) -> Result {
        let listeners = self.bind(endpoints).await?;
        self.serve(listeners, cancel).await;
        Ok(())
    }

    pub async fn bind(&self, endpoints: &[StratumEndpoint]) -> Result<Vec<Listener>> {
        let mut listeners = Vec::new();

        for endpoint in endpoints {
            let tls = endpoint
                .tls
                .as_ref()
                .map(|tls| self.tls_acceptor(tls))
                .transpose()?;

            let listener = TcpListener::bind(endpoint.address)
                .await
                .with_context(|| format!("failed to bind stratum endpoint {}", endpoint.address))?;

            info!(
                "Stratum listening on {}{}",
                listener.local_addr()?,
                if tls.is_some() { " (TLS)" } else { "" }
            );

            listeners.push(Listener {
                endpoint: Arc::new(endpoint.clone()),
                listener,
                tls,
            });
        }

        Ok(listeners)
    }

    /// Accepts on every listener until cancelled, one task per socket.
    pub async fn serve(self: &Arc<Self>, listeners: Vec<Listener>, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();

        for listener in listeners {
            tasks.spawn(self.clone().accept_loop(listener, cancel.clone()));
        }

        while tasks.join_next().await.is_some() {}

        info!("Stratum server stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener, cancel: CancellationToken) {
        let tasks = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.listener.accept() => accepted,
            };

            let (stream, remote) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Failed to accept connection on {}: {err}", listener.endpoint.address);
                    continue;
                }
            };

            if self.bans.is_banned(remote.ip()) {
                debug!("Disconnecting banned ip {}", remote.ip());
                continue;
            }

            tasks.spawn(self.clone().handle(
                stream,
                remote,
                listener.endpoint.clone(),
                listener.tls.clone(),
                cancel.clone(),
            ));
        }

        tasks.close();
        tasks.wait().await;
    }

    async fn handle(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        endpoint: Arc<StratumEndpoint>,
        tls: Option<TlsAcceptor>,
        cancel: CancellationToken,
    ) {
        stream.set_nodelay(true).ok();

        let local = stream.local_addr().unwrap_or(endpoint.address);

        let connection = StratumConnection::new(self.next_connection_id(), remote, local);

        debug!("Accepted connection from {remote} [{}]", connection.id());

        self.register(&connection);

        self.handler.on_connect(&connection).await;

        let result = connection
            .dispatch(stream, tls, &endpoint.proxy, self.handler.clone(), cancel)
            .await;

        match result {
            Ok(()) => debug!(
                "Connection {} [{}] closed",
                connection.remote_address(),
                connection.id()
            ),
            Err(err) => self.connection_error(&connection, &err),
        }

        self.handler.on_disconnect(&connection).await;

        self.unregister(&connection);
    }

    fn connection_error(&self, connection: &StratumConnection, err: &ConnectionError) {
        let address = connection.remote_address();

        if err.is_junk() {
            warn!("Connection {address} [{}] sent junk: {err}", connection.id());

            if self.banning.ban_on_junk_receive {
                self.bans.ban(address.ip(), self.banning.duration);
            }
        } else if err.is_tls() {
            warn!("Connection {address} [{}]: {err}", connection.id());

            if self.banning.ban_on_invalid_tls_handshake {
                self.bans.ban(address.ip(), self.banning.duration);
            }
        } else if matches!(err, ConnectionError::Io { .. }) {
            warn!("Connection {address} [{}] socket error: {err}", connection.id());
        } else {
            warn!("Connection {address} [{}] closed: {err}", connection.id());
        }
    }

    fn next_connection_id(&self) -> String {
        format!("{:08x}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn register(&self, connection: &Arc<StratumConnection>) {
        if self
            .connections
            .insert(connection.id().to_string(), connection.clone())
            .is_some()
        {
            error!("Connection id {} registered twice", connection.id());
        }
    }

    fn unregister(&self, connection: &StratumConnection) {
        if self.connections.remove(connection.id()).is_none() {
            error!("Connection {} was not registered", connection.id());
        }
    }

    fn tls_acceptor(&self, tls: &TlsConfig) -> Result<TlsAcceptor> {
        static RUSTLS_PROVIDER_INSTALLED: LazyLock<bool> = LazyLock::new(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .is_ok()
        });

        if let Some(acceptor) = self.tls_acceptors.lock().get(tls) {
            return Ok(acceptor.clone());
        }

        ensure! {
            *RUSTLS_PROVIDER_INSTALLED || rustls::crypto::CryptoProvider::get_default().is_some(),
            "failed to install rustls ring crypto provider",
        }

        let certificates = CertificateDer::pem_file_iter(&tls.certificate)
            .with_context(|| format!("failed to read certificate {}", tls.certificate.display()))?
            .collect::<Result<Vec<CertificateDer>, _>>()
            .with_context(|| format!("failed to parse certificate {}", tls.certificate.display()))?;

        let key = PrivateKeyDer::from_pem_file(&tls.key)
            .with_context(|| format!("failed to read private key {}", tls.key.display()))?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certificates, key)
            .context("invalid TLS certificate or key")?;

        let acceptor = TlsAcceptor::from(Arc::new(config));

        self.tls_acceptors
            .lock()
            .insert(tls.clone(), acceptor.clone());

        Ok(acceptor)
    }
}
