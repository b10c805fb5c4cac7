use super::*;

pub(crate) mod pool;

#[derive(Debug, Parser)]
pub(crate) enum Subcommand {
    #[command(about = "Run a Stratum mining pool")]
    Pool(pool::Pool),
}

impl Subcommand {
    pub(crate) async fn run(self, cancel: CancellationToken) -> Result {
        match self {
            Self::Pool(pool) => pool.run(cancel).await,
        }
    }
}
