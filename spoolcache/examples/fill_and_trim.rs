//! Populates a throwaway stream cache past its budget and trims it back,
//! with debug logging on so the trim decisions are visible.

use spoolcache::{ProviderStream, StreamCache};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()))
        .init();

    let dir = tempfile::tempdir()?;
    // 64 byte budget and no retention floor, so trimming has work to do
    let cache = StreamCache::new(dir.path(), 64, Duration::ZERO)?;

    for id in ["alpha", "beta", "gamma"] {
        let (entry, _reader) = cache
            .get_or_fill(id, || async {
                Ok((
                    "audio/mpeg".to_string(),
                    Box::new(std::io::Cursor::new(vec![0u8; 48])) as ProviderStream,
                ))
            })
            .await?;
        println!("cached `{}` ({} bytes)", entry.id, entry.size);
    }

    cache.trim().await?;
    println!("{} entries left after trimming", cache.db().count()?);

    Ok(())
}
