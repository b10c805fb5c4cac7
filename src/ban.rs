use super::*;

/// Decides which peers are refused before any protocol negotiation.
pub trait BanManager: Send + Sync + 'static {
    fn is_banned(&self, address: IpAddr) -> bool;

    fn ban(&self, address: IpAddr, duration: Duration);
}

/// Bans held in memory for the life of the process. Loopback peers are never banned.
#[derive(Debug, Default)]
pub struct MemoryBanManager {
    bans: DashMap<IpAddr, Instant>,
}

impl MemoryBanManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BanManager for MemoryBanManager {
    fn is_banned(&self, address: IpAddr) -> bool {
        let Some(until) = self.bans.get(&address).map(|until| *until) else {
            return false;
        };

        if until > Instant::now() {
            return true;
        }

        self.bans.remove_if(&address, |_, until| *until <= Instant::now());

        false
    }

    fn ban(&self, address: IpAddr, duration: Duration) {
        if address.is_loopback() {
            return;
        }

        info!("Banning {address} for {}s", duration.as_secs());

        self.bans.insert(address, Instant::now() + duration);
    }
}
