use {
    anyhow::{Context, Error, anyhow, bail, ensure},
    arguments::Arguments,
    async_trait::async_trait,
    bitcoin::{
        Amount, BlockHash,
        hashes::{Hash, sha256d},
    },
    byteorder::{BigEndian, ByteOrder, LittleEndian},
    chrono::{DateTime, Utc},
    clap::{ArgAction, Parser, ValueEnum},
    dashmap::{DashMap, DashSet},
    family::*,
    futures::{SinkExt, StreamExt},
    num_bigint::BigUint,
    num_traits::{Float, One, ToPrimitive, Zero},
    parking_lot::Mutex,
    rand::Rng,
    serde::{Deserialize, Deserializer, Serialize},
    serde_json::{Value, json},
    share_difficulty::{ShareDifficulty, credited_difficulty, target_difficulty},
    snafu::Snafu,
    std::{
        collections::{HashSet, VecDeque},
        env,
        fmt::{self, Debug, Display, Formatter},
        io,
        net::{IpAddr, SocketAddr},
        ops::{Deref, DerefMut},
        path::PathBuf,
        process,
        sync::{
            Arc, LazyLock,
            atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        },
        time::{Duration, Instant},
    },
    stratifier::bouncer::{Bouncer, Consequence},
    stratum::{
        Authorize, Configure, ConfigureResult, Id, JsonRpcError, MerkleNode, MerkleTree, Message,
        Method, Nbits, Notify, Ntime, PrevHash, SetDifficulty, StratumError, VERSION_ROLLING,
        Version,
    },
    subcommand::{Subcommand, pool::pool_config::FamilyKind},
    tokio::{
        net::{TcpListener, TcpStream},
        runtime::Runtime,
        sync::{broadcast, mpsc},
        task::{JoinHandle, JoinSet},
        time::{MissedTickBehavior, interval, sleep, timeout},
    },
    tokio_util::{
        codec::{FramedRead, FramedWrite, LinesCodec},
        sync::CancellationToken,
        task::TaskTracker,
    },
    tracing::{debug, error, info, warn},
    tracing_appender::non_blocking,
    tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt},
    zeromq::{Socket, SocketRecv, SubSocket},
    zmq::Zmq,
};

pub use {
    ban::{BanManager, MemoryBanManager},
    clock::{Clock, ManualClock, SystemClock},
    connection::{ConnectionError, ProxyProtocol, Request, RequestHandler, StratumConnection},
    daemon::DaemonClient,
    extranonce_provider::ExtraNonceProvider,
    family::{
        Bitcoin, BitcoinConfig, BitcoinTemplate, BlockchainStats, CoinFeatures, Cryptonote,
        CryptonoteConfig, CryptonoteHasher, Dialect, Equihash, EquihashParams, Ergo, Ethereum,
        Family, Job, SubmitResult, Template, Upstream,
    },
    job_manager::{JobBroadcast, JobManager, JobManagerConfig, Trigger},
    memory_upstream::MemoryUpstream,
    server::{BanningConfig, Connections, Listener, StratumEndpoint, StratumServer, TlsConfig},
    share::{Share, ShareEvent},
    share_error::ShareError,
    stratifier::{Stratifier, StratifierConfig, bouncer::BouncerConfig},
    vardiff::{Vardiff, VardiffConfig},
    worker_context::{ShareStats, WorkerContext},
};

mod arguments;
mod ban;
mod clock;
mod connection;
mod daemon;
mod extranonce_provider;
pub mod family;
mod job_manager;
mod logs;
mod memory_upstream;
mod server;
mod share;
mod share_difficulty;
mod share_error;
mod signal;
mod stratifier;
mod subcommand;
#[cfg(test)]
mod test_support;
mod vardiff;
mod worker_context;
mod zmq;

/// Longest request line a miner may send.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;
/// Outbound messages queued per connection before sends start waiting.
pub const SEND_QUEUE_CAPACITY: usize = 32;
/// How long a send may wait on a full queue before the connection counts as stalled.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Submissions older than this when their turn comes are dropped unanswered.
pub const MAX_SHARE_AGE: Duration = Duration::from_secs(6);

type Result<T = (), E = Error> = std::result::Result<T, E>;

pub fn main() {
    let _guard = logs::init();

    let args = Arguments::parse();

    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to create tokio runtime: {err}");
            process::exit(1);
        }
    };

    runtime.block_on(async {
        let cancel = signal::setup_signal_handler();

        match args.run(cancel).await {
            Err(err) => {
                eprintln!("error: {err}");

                for (i, cause) in err.chain().skip(1).enumerate() {
                    if i == 0 {
                        eprintln!();
                        eprintln!("because:");
                    }
                    eprintln!("- {cause}");
                }

                if env::var_os("RUST_BACKTRACE")
                    .map(|val| val == "1")
                    .unwrap_or_default()
                {
                    eprintln!();
                    eprintln!("{}", err.backtrace());
                }
                process::exit(1);
            }
            Ok(()) => {
                process::exit(0);
            }
        }
    });
}
