use super::*;

pub const DEFAULT_TOPIC: &str = "hashblock";

/// Block notifications pushed by the node over a ZMQ PUB socket.
pub struct Zmq {
    socket: SubSocket,
    endpoint: String,
    topic: String,
}

impl Zmq {
    pub async fn connect(endpoint: &str, topic: &str) -> Result<Self> {
        info!("Subscribing to {topic} on ZMQ endpoint {endpoint}");

        let socket = match timeout(Duration::from_secs(1), async {
            let mut socket = SubSocket::new();

            socket
                .connect(endpoint)
                .await
                .with_context(|| format!("failed to connect to ZMQ endpoint `{endpoint}`"))?;

            socket
                .subscribe(topic)
                .await
                .with_context(|| format!("failed to subscribe to {topic} on `{endpoint}`"))?;

            Ok::<_, Error>(socket)
        })
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => return Err(err),
            Err(_) => bail!(
                "timed out connecting to ZMQ endpoint `{endpoint}`, ensure the node publishes {topic} there"
            ),
        };

        Ok(Self {
            socket,
            endpoint: endpoint.into(),
            topic: topic.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Waits for the next notification and returns its body as hex.
    pub async fn recv(&mut self) -> Result<String> {
        let message = self.socket.recv().await?;

        let frames = (0..message.len())
            .filter_map(|i| message.get(i))
            .map(|frame| frame.as_ref())
            .collect::<Vec<&[u8]>>();

        parse_frames(&self.topic, &frames)
    }
}

fn parse_frames(topic: &str, frames: &[&[u8]]) -> Result<String> {
    ensure!(
        frames.len() >= 2,
        "{topic}: expected at least 2 frames, got {}",
        frames.len()
    );

    ensure!(frames[0] == topic.as_bytes(), "{topic}: wrong topic");

    let body = frames[1];

    ensure!(!body.is_empty(), "{topic}: empty body");

    if let Some(sequence_number) = frames.get(2) {
        ensure!(
            sequence_number.len() == 4,
            "{topic}: seq len {}",
            sequence_number.len()
        );
    }

    Ok(hex::encode(body))
}
