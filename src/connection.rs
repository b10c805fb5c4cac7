use {
    super::*,
    parking_lot::{MappedMutexGuard, MutexGuard},
    std::any::Any,
    tokio::io::{AsyncRead, AsyncWrite},
    tokio_rustls::TlsAcceptor,
    tokio_util::codec::LinesCodecError,
};

/// Why a connection ended abnormally. Every variant is fatal to the connection.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConnectionError {
    #[snafu(display("I/O error: {source}"))]
    Io { source: io::Error },
    #[snafu(display("TLS handshake failed: {source}"))]
    Tls { source: io::Error },
    #[snafu(display("line exceeds {MAX_MESSAGE_SIZE} bytes"))]
    Oversized,
    #[snafu(display("invalid JSON-RPC message: {source}"))]
    Json { source: serde_json::Error },
    #[snafu(display("message without request id"))]
    MissingId,
    #[snafu(display("PROXY protocol header from non-whitelisted peer {peer}"))]
    ProxyNotWhitelisted { peer: IpAddr },
    #[snafu(display("PROXY protocol header required"))]
    ProxyRequired,
    #[snafu(display("malformed PROXY protocol header `{header}`"))]
    ProxyMalformed { header: String },
    #[snafu(display("send queue stalled"))]
    Stalled,
    #[snafu(display("connection closed"))]
    Closed,
}

impl ConnectionError {
    /// The peer went away in one of the ways peers normally do.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io { source } => is_disconnect(source),
            _ => false,
        }
    }

    /// Garbage on the wire, as opposed to a transport failure.
    pub fn is_junk(&self) -> bool {
        matches!(
            self,
            Self::Oversized | Self::Json { .. } | Self::MissingId | Self::ProxyMalformed { .. }
        )
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    ) || matches!(error.raw_os_error(), Some(104 | 103 | 32 | 110 | 125))
}

impl From<LinesCodecError> for ConnectionError {
    fn from(error: LinesCodecError) -> Self {
        match error {
            LinesCodecError::MaxLineLengthExceeded => Self::Oversized,
            LinesCodecError::Io(source) => Self::Io { source },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyProtocol {
    pub enabled: bool,
    pub mandatory: bool,
    pub whitelist: Vec<IpAddr>,
}

/// A JSON-RPC request from a miner.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Id,
    pub method: String,
    pub params: Value,
    pub received: tokio::time::Instant,
}

/// Receives requests in the order they arrive on a connection.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn on_connect(&self, _connection: &Arc<StratumConnection>) {}

    async fn on_request(
        &self,
        connection: &Arc<StratumConnection>,
        request: Request,
    ) -> Result<(), ConnectionError>;

    async fn on_disconnect(&self, _connection: &Arc<StratumConnection>) {}
}

/// One miner socket. Outbound messages go through a bounded queue drained by
/// the task running [`StratumConnection::dispatch`].
pub struct StratumConnection {
    id: String,
    remote: Mutex<SocketAddr>,
    local: SocketAddr,
    sender: mpsc::Sender<Message>,
    receiver: Mutex<Option<mpsc::Receiver<Message>>>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    alive: AtomicBool,
    stalled: AtomicBool,
    close: CancellationToken,
}

impl Debug for StratumConnection {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("StratumConnection")
            .field("id", &self.id)
            .field("remote", &self.remote_address())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl StratumConnection {
    pub fn new(id: String, remote: SocketAddr, local: SocketAddr) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(SEND_QUEUE_CAPACITY);

        Arc::new(Self {
            id,
            remote: Mutex::new(remote),
            local,
            sender,
            receiver: Mutex::new(Some(receiver)),
            context: Mutex::new(None),
            alive: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            close: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The peer address, or the one a PROXY protocol header reported.
    pub fn remote_address(&self) -> SocketAddr {
        *self.remote.lock()
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn disconnect(&self) {
        self.close.cancel();
    }

    pub fn set_context<T: Any + Send>(&self, context: T) {
        *self.context.lock() = Some(Box::new(context));
    }

    pub fn context_as<T: Any + Send>(&self) -> Option<MappedMutexGuard<'_, T>> {
        MutexGuard::try_map(self.context.lock(), |context| {
            context.as_mut()?.downcast_mut::<T>()
        })
        .ok()
    }

    pub async fn respond(&self, id: Id, result: Value) -> Result<(), ConnectionError> {
        self.send(Message::response(id, result)).await
    }

    pub async fn respond_error(&self, id: Id, error: JsonRpcError) -> Result<(), ConnectionError> {
        self.send(Message::error(id, error)).await
    }

    pub async fn notify(
        &self,
        method: impl Into<String>,
        params: Value,
    ) -> Result<(), ConnectionError> {
        self.send(Message::notification(method, params)).await
    }

    pub async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        match timeout(SEND_TIMEOUT, self.sender.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                warn!("Send queue to {} [{}] stalled", self.remote_address(), self.id);
                self.stalled.store(true, Ordering::Relaxed);
                self.close.cancel();
                Err(ConnectionError::Stalled)
            }
        }
    }

    /// Serves the socket until EOF, a fatal error or cancellation. Normal
    /// disconnects count as completion.
    pub async fn dispatch<S>(
        self: &Arc<Self>,
        stream: S,
        tls: Option<TlsAcceptor>,
        proxy: &ProxyProtocol,
        handler: Arc<dyn RequestHandler>,
        cancel: CancellationToken,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let result = match tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => self.run(stream, proxy, handler.as_ref(), &cancel).await,
                Err(source) => Err(ConnectionError::Tls { source }),
            },
            None => self.run(stream, proxy, handler.as_ref(), &cancel).await,
        };

        self.alive.store(false, Ordering::Relaxed);
        self.close.cancel();

        match result {
            Err(err) if err.is_disconnect() => {
                debug!("Connection {} [{}] reset: {err}", self.remote_address(), self.id);
                Ok(())
            }
            result => result,
        }
    }

    async fn run<S>(
        self: &Arc<Self>,
        stream: S,
        proxy: &ProxyProtocol,
        handler: &dyn RequestHandler,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut receiver = self.receiver.lock().take().ok_or(ConnectionError::Closed)?;

        let (reader, writer) = tokio::io::split(stream);
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_MESSAGE_SIZE));
        let mut sink = FramedWrite::new(writer, LinesCodec::new());

        let result = {
            let receive = async {
                let mut first = true;

                while let Some(line) = lines.next().await {
                    let line = line?;
                    let line = line.trim();

                    if line.is_empty() {
                        continue;
                    }

                    if std::mem::take(&mut first) && self.proxy_header(line, proxy)? {
                        continue;
                    }

                    debug!("Received from {} [{}]: {line}", self.remote_address(), self.id);

                    handler.on_request(self, parse_request(line)?).await?;
                }

                Ok::<(), ConnectionError>(())
            };

            let send = async {
                while let Some(message) = receiver.recv().await {
                    write_message(&mut sink, &message).await?;
                }

                Ok::<(), ConnectionError>(())
            };

            tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                _ = self.close.cancelled() => {
                    if self.stalled.load(Ordering::Relaxed) {
                        return Err(ConnectionError::Stalled);
                    }
                    Ok(())
                }
                result = receive => result,
                result = send => return result,
            }
        };

        let flush = async {
            while let Ok(message) = receiver.try_recv() {
                write_message(&mut sink, &message).await?;
            }

            SinkExt::<String>::flush(&mut sink).await?;

            Ok::<(), ConnectionError>(())
        };

        match timeout(SEND_TIMEOUT, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(
                "Failed to flush responses to {} [{}]: {err}",
                self.remote_address(),
                self.id
            ),
            Err(_) => debug!(
                "Timed out flushing responses to {} [{}]",
                self.remote_address(),
                self.id
            ),
        }

        result
    }

    /// Consumes a PROXY protocol v1 header on the first line. Returns whether
    /// the line was one.
    fn proxy_header(&self, line: &str, proxy: &ProxyProtocol) -> Result<bool, ConnectionError> {
        if !proxy.enabled {
            return Ok(false);
        }

        let Some(header) = line.strip_prefix("PROXY ") else {
            if proxy.mandatory {
                return Err(ConnectionError::ProxyRequired);
            }
            return Ok(false);
        };

        let peer = self.remote_address().ip();

        if !proxy.whitelist.contains(&peer) {
            return Err(ConnectionError::ProxyNotWhitelisted { peer });
        }

        let malformed = || ConnectionError::ProxyMalformed {
            header: line.to_string(),
        };

        let parts = header.split_whitespace().collect::<Vec<&str>>();

        match parts.as_slice() {
            ["UNKNOWN", ..] => {}
            [_, source, _, port, _] => {
                let address = SocketAddr::new(
                    source.parse().map_err(|_| malformed())?,
                    port.parse().map_err(|_| malformed())?,
                );

                info!("Real-IP via PROXY protocol: {address} [{}]", self.id);

                *self.remote.lock() = address;
            }
            _ => return Err(malformed()),
        }

        Ok(true)
    }
}

async fn write_message<W>(
    sink: &mut FramedWrite<W, LinesCodec>,
    message: &Message,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let line = serde_json::to_string(message).map_err(|source| ConnectionError::Json { source })?;
    sink.send(line).await?;
    Ok(())
}

fn parse_request(line: &str) -> Result<Request, ConnectionError> {
    match serde_json::from_str::<Message>(line).map_err(|source| ConnectionError::Json { source })? {
        Message::Request { id, method, params } => Ok(Request {
            id,
            method,
            params,
            received: tokio::time::Instant::now(),
        }),
        Message::Notification { .. } | Message::Response { .. } => Err(ConnectionError::MissingId),
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        pretty_assertions::assert_eq,
        tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream},
    };

    #[derive(Default)]
    struct Echo {
        requests: Mutex<Vec<Request>>,
    }

    #[async_trait]
    impl RequestHandler for Echo {
        async fn on_request(
            &self,
            connection: &Arc<StratumConnection>,
            request: Request,
        ) -> Result<(), ConnectionError> {
            self.requests.lock().push(request.clone());

            if request.method == "refuse" {
                connection
                    .respond_error(request.id, StratumError::UnauthorizedWorker.with_message("refused"))
                    .await?;
                connection.disconnect();
                return Ok(());
            }

            if request.method == "unknown" {
                return connection
                    .respond_error(
                        request.id,
                        StratumError::Other.with_message(format!("unsupported request {}", request.method)),
                    )
                    .await;
            }

            connection.respond(request.id, json!(request.method)).await
        }
    }

    fn address(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn spawn(
        proxy: ProxyProtocol,
        peer: &str,
    ) -> (
        Arc<StratumConnection>,
        Arc<Echo>,
        DuplexStream,
        JoinHandle<Result<(), ConnectionError>>,
    ) {
        let (client, server) = tokio::io::duplex(128 * 1024);

        let connection = StratumConnection::new("1".into(), address(peer), address("127.0.0.1:3333"));
        let handler = Arc::new(Echo::default());

        let handle = {
            let connection = connection.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                connection
                    .dispatch(server, None, &proxy, handler, CancellationToken::new())
                    .await
            })
        };

        (connection, handler, client, handle)
    }

    #[tokio::test]
    async fn requests_are_answered_in_order() {
        let (connection, handler, client, handle) = spawn(ProxyProtocol::default(), "10.0.0.1:5000");

        let (reader, mut writer) = tokio::io::split(client);
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"id\":1,\"method\":\"a\",\"params\":[]}\n\n{\"id\":2,\"method\":\"unknown\",\"params\":[]}\n")
            .await
            .unwrap();

        assert_eq!(
            serde_json::from_str::<Value>(&lines.next_line().await.unwrap().unwrap()).unwrap(),
            json!({"id": 1, "result": "a", "error": null})
        );

        assert_eq!(
            serde_json::from_str::<Value>(&lines.next_line().await.unwrap().unwrap()).unwrap(),
            json!({"id": 2, "result": null, "error": [20, "unsupported request unknown", null]})
        );

        writer.shutdown().await.unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert!(!connection.is_alive());
        assert_eq!(handler.requests.lock().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn responses_queued_before_disconnect_are_delivered() {
        for _ in 0..50 {
            let (connection, _handler, client, handle) =
                spawn(ProxyProtocol::default(), "10.0.0.1:5000");

            let (reader, mut writer) = tokio::io::split(client);
            let mut lines = BufReader::new(reader).lines();

            writer
                .write_all(b"{\"id\":1,\"method\":\"refuse\",\"params\":[]}\n")
                .await
                .unwrap();

            assert_eq!(
                serde_json::from_str::<Value>(&lines.next_line().await.unwrap().unwrap()).unwrap(),
                json!({"id": 1, "result": null, "error": [24, "refused", null]})
            );

            assert!(handle.await.unwrap().is_ok());
            assert!(!connection.is_alive());
            assert_eq!(lines.next_line().await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn oversized_line_is_fatal() {
        let (connection, handler, mut client, handle) =
            spawn(ProxyProtocol::default(), "10.0.0.1:5000");

        let mut line = vec![b'a'; MAX_MESSAGE_SIZE + 1];
        line.push(b'\n');
        client.write_all(&line).await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Oversized), "{err}");
        assert!(err.is_junk());
        assert!(!connection.is_alive());
        assert!(handler.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_id_is_fatal() {
        let (_connection, handler, mut client, handle) =
            spawn(ProxyProtocol::default(), "10.0.0.1:5000");

        client
            .write_all(b"{\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();

        assert!(matches!(
            handle.await.unwrap().unwrap_err(),
            ConnectionError::MissingId
        ));
        assert!(handler.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn junk_is_fatal() {
        let (_connection, _handler, mut client, handle) =
            spawn(ProxyProtocol::default(), "10.0.0.1:5000");

        client.write_all(b"GET / HTTP/1.1\n").await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Json { .. }), "{err}");
    }

    #[tokio::test]
    async fn proxy_header_rewrites_remote_address() {
        let proxy = ProxyProtocol {
            enabled: true,
            mandatory: true,
            whitelist: vec!["10.0.0.1".parse().unwrap()],
        };

        let (connection, handler, mut client, handle) = spawn(proxy, "10.0.0.1:5000");

        client
            .write_all(b"PROXY TCP4 192.168.1.7 10.0.0.2 40000 3333\n{\"id\":1,\"method\":\"a\",\"params\":[]}\n")
            .await
            .unwrap();
        drop(client);

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(connection.remote_address(), address("192.168.1.7:40000"));
        assert_eq!(handler.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn proxy_header_violations() {
        #[track_caller]
        fn case(proxy: ProxyProtocol, peer: &'static str, line: &'static str) -> JoinHandle<Result<(), ConnectionError>> {
            let (_connection, _handler, mut client, handle) = spawn(proxy, peer);

            tokio::spawn(async move {
                client.write_all(line.as_bytes()).await.unwrap();
                client
            });

            handle
        }

        let proxy = ProxyProtocol {
            enabled: true,
            mandatory: true,
            whitelist: vec!["10.0.0.1".parse().unwrap()],
        };

        assert!(matches!(
            case(proxy.clone(), "10.0.0.9:5000", "PROXY TCP4 1.2.3.4 5.6.7.8 1 2\n")
                .await
                .unwrap()
                .unwrap_err(),
            ConnectionError::ProxyNotWhitelisted { .. }
        ));

        assert!(matches!(
            case(proxy.clone(), "10.0.0.1:5000", "{\"id\":1,\"method\":\"a\",\"params\":[]}\n")
                .await
                .unwrap()
                .unwrap_err(),
            ConnectionError::ProxyRequired
        ));

        assert!(matches!(
            case(proxy, "10.0.0.1:5000", "PROXY TCP4 nonsense\n")
                .await
                .unwrap()
                .unwrap_err(),
            ConnectionError::ProxyMalformed { .. }
        ));
    }

    #[tokio::test]
    async fn typed_context() {
        let connection = StratumConnection::new(
            "7".into(),
            address("10.0.0.1:5000"),
            address("127.0.0.1:3333"),
        );

        assert!(connection.context_as::<u32>().is_none());

        connection.set_context(5u32);
        *connection.context_as::<u32>().unwrap() += 1;

        assert_eq!(*connection.context_as::<u32>().unwrap(), 6);
        assert!(connection.context_as::<String>().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_send_queue() {
        let connection = StratumConnection::new(
            "7".into(),
            address("10.0.0.1:5000"),
            address("127.0.0.1:3333"),
        );

        for _ in 0..SEND_QUEUE_CAPACITY {
            connection.notify("mining.notify", json!([])).await.unwrap();
        }

        assert!(matches!(
            connection.notify("mining.notify", json!([])).await.unwrap_err(),
            ConnectionError::Stalled
        ));
    }

    #[test]
    fn disconnect_classification() {
        #[track_caller]
        fn case(error: io::Error, expected: bool) {
            assert_eq!(ConnectionError::Io { source: error }.is_disconnect(), expected);
        }

        case(io::Error::from(io::ErrorKind::ConnectionReset), true);
        case(io::Error::from(io::ErrorKind::BrokenPipe), true);
        case(io::Error::from_raw_os_error(104), true);
        case(io::Error::from_raw_os_error(125), true);
        case(io::Error::from(io::ErrorKind::PermissionDenied), false);

        assert!(!ConnectionError::Oversized.is_disconnect());
    }
}
