use {
    bitcoin::{
        BlockHash, CompactTarget, Target, TxMerkleNode, Txid, block,
        hashes::{Hash, sha256d},
    },
    byteorder::{BigEndian, ByteOrder, LittleEndian},
    derive_more::Display,
    serde::{
        Deserialize, Serialize, Serializer,
        de::{self, Deserializer},
        ser::{SerializeMap, SerializeSeq},
    },
    serde_json::Value,
    serde_with::{DeserializeFromStr, SerializeDisplay},
    snafu::{ResultExt, Snafu},
    std::{
        fmt::{self, Formatter},
        ops::{BitAnd, BitOr, Not},
        str::FromStr,
    },
};

pub use {
    authorize::Authorize,
    configure::{Configure, ConfigureResult, VERSION_ROLLING},
    error::{Error, JsonRpcError, Result, StratumError},
    merkle::{MerkleNode, MerkleTree},
    message::{Id, Message},
    method::{Method, UnknownMethod},
    nbits::Nbits,
    notify::Notify,
    ntime::Ntime,
    prevhash::PrevHash,
    set_difficulty::SetDifficulty,
    version::Version,
};

mod authorize;
mod configure;
mod error;
mod merkle;
mod message;
mod method;
mod nbits;
mod notify;
mod ntime;
mod prevhash;
mod set_difficulty;
mod version;
