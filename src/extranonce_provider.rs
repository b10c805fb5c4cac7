use super::*;

const ID_BITS: u32 = 4;

/// Hands out per-connection extranonce1 values. The top four bits hold the
/// instance id so several pool processes can share one upstream without
/// colliding, the rest is a counter.
#[derive(Debug)]
pub struct ExtraNonceProvider {
    bytes: usize,
    counter: Mutex<u64>,
    id: u8,
    id_shift: u32,
    nonce_max: u64,
}

impl ExtraNonceProvider {
    pub fn new(bytes: usize, instance_id: Option<u8>) -> Result<Self> {
        ensure!(
            (1..=8).contains(&bytes),
            "extranonce size {bytes} must be between 1 and 8 bytes"
        );

        let id_max = (1u8 << ID_BITS) - 1;

        let id = match instance_id {
            Some(id) => {
                ensure!(
                    id <= id_max,
                    "instance id {id} does not fit into {ID_BITS} bits (limit {id_max})"
                );
                id
            }
            None => rand::rng().random_range(1..=u8::MAX),
        } & id_max;

        let id_shift = bytes as u32 * 8 - ID_BITS;
        let nonce_max = (1u64 << id_shift) - 1;

        info!(
            "ExtraNonceProvider using {ID_BITS} bits for instance id, {id_shift} bits for {nonce_max} values, instance id = 0x{id:x}"
        );

        Ok(Self {
            bytes,
            counter: Mutex::new(0),
            id,
            id_shift,
            nonce_max,
        })
    }

    pub fn size(&self) -> usize {
        self.bytes
    }

    pub fn next(&self) -> String {
        let value = {
            let mut counter = self.counter.lock();

            *counter += 1;

            if *counter > self.nonce_max {
                warn!("ExtraNonceProvider range exhausted, rolling over to 0");
                *counter = 0;
            }

            (u64::from(self.id) << self.id_shift) | *counter
        };

        format!("{value:0width$x}", width = self.bytes * 2)
    }
}
