// Streams a snapshot archive from its URL: HTTP body → gzip decode → tar
// entries, one page at a time, then the link and delete phases. The archive
// is never fully resident; each entry is buffered alone.

use async_compression::tokio::bufread::GzipDecoder;
use futures::TryStreamExt;
use prometheus::IntCounter;
use reqwest::StatusCode;
use sqlx::PgConnection;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::dispatcher::PageDispatcher;
use crate::error::{IngestError, Result};

/// Fetch the snapshot at `url` and run the full ingest against the given
/// transaction connection: every page, then link resolution, then
/// differential deletion. `pages_processed` ticks once per dispatched entry.
pub async fn ingest_snapshot(
    client: &reqwest::Client,
    url: &str,
    conn: &mut PgConnection,
    dispatcher: &mut PageDispatcher,
    pages_processed: &IntCounter,
) -> Result<()> {
    info!(url, "Fetching snapshot");
    let response = client.get(url).send().await?;
    if response.status() != StatusCode::OK {
        return Err(IngestError::DownloadStatus(response.status()));
    }

    let body = StreamReader::new(
        response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    );
    let mut gzip = GzipDecoder::new(body);
    gzip.multiple_members(true);
    let mut archive = tokio_tar::Archive::new(gzip);

    let mut entries = archive.entries()?;
    while let Some(mut entry) = entries.try_next().await? {
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        debug!(page = %name, "Reading archive entry");

        let mut page = Vec::new();
        entry.read_to_end(&mut page).await?;
        dispatcher.process_page(conn, &name, &page).await?;
        pages_processed.inc();
    }

    dispatcher.resolve_links(conn).await?;
    dispatcher.archive_missing(conn).await?;
    Ok(())
}
