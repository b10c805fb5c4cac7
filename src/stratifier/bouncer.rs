use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Consequence {
    #[default]
    None,
    Warn,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BouncerConfig {
    pub warn_after: Duration,
    pub drop_after: Duration,
}

impl Default for BouncerConfig {
    fn default() -> Self {
        Self {
            warn_after: Duration::from_secs(60),
            drop_after: Duration::from_secs(180),
        }
    }
}

/// Escalates on an unbroken run of rejected shares. The clock starts at the
/// first reject of a run and any accepted share ends the run.
#[derive(Debug, Clone, Default)]
pub struct Bouncer {
    config: BouncerConfig,
    first_reject: Option<Instant>,
    consecutive_rejects: u32,
    current_consequence: Consequence,
}

impl Bouncer {
    pub fn new(config: BouncerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn reject(&mut self) -> Consequence {
        self.reject_at(Instant::now())
    }

    fn reject_at(&mut self, now: Instant) -> Consequence {
        self.consecutive_rejects += 1;

        let elapsed = now.saturating_duration_since(*self.first_reject.get_or_insert(now));

        let new_consequence = [
            (self.config.drop_after, Consequence::Drop),
            (self.config.warn_after, Consequence::Warn),
        ]
        .into_iter()
        .find(|(threshold, _)| elapsed >= *threshold)
        .map(|(_, consequence)| consequence)
        .unwrap_or(Consequence::None);

        if new_consequence > self.current_consequence {
            self.current_consequence = new_consequence;
            new_consequence
        } else {
            Consequence::None
        }
    }

    pub fn accept(&mut self) {
        *self = Self::new(self.config);
    }

    pub fn consecutive_rejects(&self) -> u32 {
        self.consecutive_rejects
    }

    pub fn reject_duration(&self) -> Option<Duration> {
        self.first_reject.map(|t| t.elapsed())
    }
}
