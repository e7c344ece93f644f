#[macro_use]
pub mod macros;

pub mod config;
pub mod metainfo;
pub mod peer;
pub mod reactor;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod torrent_meta;
pub mod tracker;
pub mod util;

mod error;
#[cfg(test)]
mod testing;

use std::{future::Future, time::Duration};

pub use config::ClientConfig;
pub use error::{Error, ErrorKind, Result};
pub use reactor::{DownloadOutcome, Reactor};
pub use session::{download, Session};

pub trait WithTimeout<T, E> {
    fn with_timeout(
        self,
        name: &'static str,
        timeout: Duration,
    ) -> impl std::future::Future<Output = anyhow::Result<T>> + Send
    where
        Self: Future<Output = std::result::Result<T, E>>;
}

impl<F, T, E> WithTimeout<T, E> for F
where
    F: Future<Output = std::result::Result<T, E>> + Send,
    anyhow::Error: From<E>,
{
    async fn with_timeout(self, name: &'static str, timeout: Duration) -> anyhow::Result<T> {
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => Ok(result?),
            Err(elapsed) => {
                anyhow::bail!("'{}' task timed out: {}", name, elapsed);
            }
        }
    }
}
