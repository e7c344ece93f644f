use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use url::Url;

const COMPACT_PEER_LENGTH: usize = 6;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Started,
    Stopped,
    Completed,
}

#[derive(Debug, Serialize)]
pub struct TrackerRequest {
    /// SHA1 hash of the info field in the MetaInfo struct
    #[serde(skip_serializing)]
    info_hash: [u8; 20],
    /// Unique client ID. Randomly generated
    #[serde(skip_serializing)]
    peer_id: [u8; 20],
    /// The port number the client is listening on
    port: u16,
    /// The total amount uploaded
    uploaded: u64,
    /// The total amount downloaded
    downloaded: u64,
    /// The number of bytes the client STILL has to download
    left: u64,
    /// States that the client accepts a compact response. Is always set to 1
    compact: u8,
    /// If omitted - this message is a message sent on a regular basis without any specific event
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<EventType>,
}

impl TrackerRequest {
    pub fn new(
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        port: u16,
        downloaded: u64,
        left: u64,
        event: Option<EventType>,
    ) -> Self {
        TrackerRequest {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded,
            left,
            compact: 1,
            event,
        }
    }

    pub fn into_query_params(self) -> anyhow::Result<String> {
        // Raw bytes have to be percent-encoded by hand: serde would either reject the arrays or
        // encode an already encoded string twice
        let info_hash = form_urlencoded::byte_serialize(&self.info_hash).collect::<String>();
        let peer_id = form_urlencoded::byte_serialize(&self.peer_id).collect::<String>();

        let mut serialized = serde_urlencoded::to_string(&self).context("failed to serialize the tracker request")?;

        serialized.push_str("&info_hash=");
        serialized.push_str(&info_hash);
        serialized.push_str("&peer_id=");
        serialized.push_str(&peer_id);

        Ok(serialized)
    }
}

#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
pub struct TrackerResponse {
    /// A human-readable error
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,
    /// Number of seconds to wait between regular requests
    pub interval: Option<u64>,
    /// List of peers
    #[serde_as(as = "Option<Bytes>")]
    pub peers: Option<Vec<u8>>,
}

impl TrackerResponse {
    /// Uses compact format as described in [BEP-23](https://www.bittorrent.org/beps/bep_0023.html).
    /// Duplicates are dropped, the order of first appearance is kept.
    pub fn get_peers(&self) -> anyhow::Result<Vec<SocketAddrV4>> {
        if let Some(reason) = &self.failure_reason {
            anyhow::bail!("tracker returned a failure: {}", reason);
        }

        let peers = self.peers.as_deref().context("peers are missing in the tracker response")?;
        anyhow::ensure!(
            peers.len() % COMPACT_PEER_LENGTH == 0,
            "compact peer list has a length of {} that isn't a multiple of {}",
            peers.len(),
            COMPACT_PEER_LENGTH
        );

        // Each peer is a 6-byte value: 4 bytes of IPv4 address and 2 bytes of big-endian port
        let mut peer_addrs: Vec<SocketAddrV4> = Vec::with_capacity(peers.len() / COMPACT_PEER_LENGTH);
        for chunk in peers.chunks_exact(COMPACT_PEER_LENGTH) {
            let ip = try_into!(&chunk[..4], [u8; 4])?;
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);

            let addr = SocketAddrV4::new(Ipv4Addr::from(ip), port);
            if !peer_addrs.contains(&addr) {
                peer_addrs.push(addr);
            }
        }

        Ok(peer_addrs)
    }
}

/// Builds the full announce URL for a request
pub fn params(url: &str, request: TrackerRequest) -> anyhow::Result<Url> {
    let mut url = Url::parse(url).context("tracker announce URL parsing")?;
    anyhow::ensure!(
        matches!(url.scheme(), "http" | "https"),
        "unsupported tracker protocol: {}",
        url.scheme()
    );

    let mut query = request.into_query_params()?;

    // NOTE: Some trackers include additional query params in the announce URL and
    // require them to be the first ones in the query
    if let Some(existing_query) = url.query() {
        query.insert_str(0, existing_query);
        query.insert(existing_query.len(), '&');
    }

    url.set_query(Some(&query));

    Ok(url)
}

#[tracing::instrument(err, skip(client, request))]
pub async fn announce(client: &reqwest::Client, url: &str, request: TrackerRequest) -> anyhow::Result<TrackerResponse> {
    let tracker_announce_url = params(url, request)?;

    let response = client
        .request(reqwest::Method::GET, tracker_announce_url)
        .header("User-Agent", "leechbit")
        .send()
        .await
        .context("sending request to the tracker")?;

    let response: TrackerResponse = serde_bencode::from_bytes(
        &response
            .bytes()
            .await
            .context("unable to get the tracker's response body")?,
    )
    .context("error while parsing the tracker's response")?;

    tracing::debug!(interval = ?response.interval, "tracker responded");

    Ok(response)
}
