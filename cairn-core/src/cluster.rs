use crate::{CairnError, NodeInfo, Result, validate_oid};
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use reqwest::StatusCode;
use std::pin::Pin;
use std::time::Duration;

pub const INTERNAL_PREFIX: &str = "/.cairn";

/// Body of a blob download from a peer.
pub type BlobBody = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// HTTP client for node-to-node calls.
#[derive(Clone)]
pub struct ClusterClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl ClusterClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|error| CairnError::Http(error.to_string()))?;
        Ok(Self { client, timeout })
    }

    pub fn blob_url(&self, node: &NodeInfo, oid: &str) -> Result<String> {
        validate_oid(oid)?;
        Ok(format!("{}{}/blob/{}", node.base_url(), INTERNAL_PREFIX, oid))
    }

    pub fn fetch_url(&self, node: &NodeInfo, oid: &str) -> Result<String> {
        validate_oid(oid)?;
        Ok(format!("{}{}/fetch/{}", node.base_url(), INTERNAL_PREFIX, oid))
    }

    pub fn mark_backup_url(&self, node: &NodeInfo, oid: &str) -> Result<String> {
        validate_oid(oid)?;
        Ok(format!(
            "{}{}/backup/mark/{}",
            node.base_url(),
            INTERNAL_PREFIX,
            oid
        ))
    }

    /// Asks `target` to pull `oid` from `source`.
    pub async fn request_fetch(&self, target: &NodeInfo, oid: &str, source: &NodeInfo) -> Result<()> {
        let response = self
            .client
            .post(self.fetch_url(target, oid)?)
            .query(&[
                ("from", source.node_id.as_str()),
                ("addr", source.address.as_str()),
            ])
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CairnError::PeerStatus {
                node: target.node_id.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Tells `target` which blob holds the latest backup. Only 204 counts as
    /// success.
    pub async fn mark_backup(&self, target: &NodeInfo, oid: &str) -> Result<()> {
        let response = self
            .client
            .post(self.mark_backup_url(target, oid)?)
            .timeout(self.timeout)
            .send()
            .await?;

        if response.status() != StatusCode::NO_CONTENT {
            return Err(CairnError::PeerStatus {
                node: target.node_id.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Downloads a blob from `source`. Waiting for the response head and for
    /// every body chunk is bounded by the internode timeout, so a peer that
    /// goes quiet mid-transfer fails the download instead of holding it.
    pub async fn fetch_blob(&self, source: &NodeInfo, oid: &str) -> Result<BlobBody> {
        let request = self.client.get(self.blob_url(source, oid)?).send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| {
                CairnError::Http(format!("{} did not answer for blob {}", source.node_id, oid))
            })??;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(CairnError::BlobNotFound(format!(
                    "{} on {}",
                    oid, source.node_id
                )));
            }
            status => {
                return Err(CairnError::PeerStatus {
                    node: source.node_id.clone(),
                    status: status.as_u16(),
                });
            }
        }

        let idle = self.timeout;
        let node_id = source.node_id.clone();
        let body = stream::unfold(Some(response), move |state| {
            let node_id = node_id.clone();
            async move {
                let mut response = state?;
                match tokio::time::timeout(idle, response.chunk()).await {
                    Ok(Ok(Some(chunk))) => Some((Ok(chunk), Some(response))),
                    Ok(Ok(None)) => None,
                    Ok(Err(error)) => Some((Err(CairnError::from(error)), None)),
                    Err(_) => Some((
                        Err(CairnError::Http(format!(
                            "{} stalled for {:?} while sending a blob",
                            node_id, idle
                        ))),
                        None,
                    )),
                }
            }
        });
        Ok(Box::pin(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = ClusterClient::new(Duration::from_secs(1)).unwrap();
        let node = NodeInfo::new("n1", "10.0.0.5:8484");

        assert_eq!(
            client.blob_url(&node, "abc123").unwrap(),
            "http://10.0.0.5:8484/.cairn/blob/abc123"
        );
        assert_eq!(
            client.mark_backup_url(&node, "abc123").unwrap(),
            "http://10.0.0.5:8484/.cairn/backup/mark/abc123"
        );
        assert!(client.fetch_url(&node, "../x").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_an_error() {
        let client = ClusterClient::new(Duration::from_millis(200)).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let target = NodeInfo::new("gone", address);
        let source = NodeInfo::new("me", "127.0.0.1:1");
        assert!(client.request_fetch(&target, "ab", &source).await.is_err());
        assert!(client.mark_backup(&target, "ab").await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_blob_download_times_out() {
        use futures_util::StreamExt;
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\nhalf")
                .await
                .unwrap();
            // keep the connection open without sending the rest
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = ClusterClient::new(Duration::from_millis(200)).unwrap();
        let source = NodeInfo::new("slow", address);
        let mut body = client.fetch_blob(&source, "ab").await.unwrap();

        let first = body.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"half");

        let started = std::time::Instant::now();
        let stalled = body.next().await.unwrap();
        assert!(matches!(stalled, Err(CairnError::Http(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(body.next().await.is_none());
    }
}
