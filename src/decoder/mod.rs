//! Payload decode service client
//!
//! Payload-bearing telemetry envelopes are POSTed as JSON to an external
//! service that assembles the PHYPayload from FRMPayload and the session keys.
//!
//! ## Contract:
//! - request: `{frmpayload_hex, dev_addr, apps_key, nwks_key, fcnt_up, frame_type, ack, class_b}`
//! - response: `{"phy_payload": ..}` on success, `{"error": ..}` on failure
//!
//! One request per envelope, no retry. Each call runs in its own task and
//! reports back on a channel, so several calls may be in flight at once.

pub mod types;

#[cfg(feature = "forward")]
pub use client::DecodeForwarder;

#[cfg(feature = "forward")]
mod client {
    use anyhow::{Context, Result};
    use reqwest::Client;
    use tokio::sync::mpsc;
    use tracing::{debug, info};

    use super::types::{DecodeOutcome, DecodeRequest, DecodeResponse, DecodeResult, PendingDecode};
    use crate::config::DecoderConfig;

    /// HTTP client for the decode service
    #[derive(Clone)]
    pub struct DecodeForwarder {
        url: String,
        http: Client,
    }

    impl DecodeForwarder {
        pub fn new(config: &DecoderConfig) -> Result<Self> {
            let http = Client::builder()
                .build()
                .context("failed to build decode service HTTP client")?;

            info!("Decode service client created for {}", config.url);

            Ok(Self {
                url: config.url.clone(),
                http,
            })
        }

        /// Issue one decode request and return the PHYPayload
        pub async fn decode(&self, request: &DecodeRequest) -> Result<String> {
            debug!(
                "POST {} (dev_addr={}, fcnt_up={:?}, frame_type={})",
                self.url, request.dev_addr, request.fcnt_up, request.frame_type
            );

            let resp = self
                .http
                .post(&self.url)
                .json(request)
                .send()
                .await
                .context("failed to send decode request")?;

            let status = resp.status();
            if !status.is_success() {
                let body_text = resp.text().await.unwrap_or_default();
                anyhow::bail!("decode service returned status {}: {}", status, body_text);
            }

            let body: DecodeResponse = resp
                .json()
                .await
                .context("decode service returned invalid JSON")?;
            body.into_result()
        }

        /// Run [`decode`](Self::decode) in a background task.
        ///
        /// The outcome (success or error string) is sent to `results` tagged
        /// with the request's sequence number.
        pub fn spawn(&self, pending: PendingDecode, results: mpsc::Sender<DecodeResult>) {
            let forwarder = self.clone();
            tokio::spawn(async move {
                let outcome = match forwarder.decode(&pending.request).await {
                    Ok(phy_payload) => DecodeOutcome::Decoded(phy_payload),
                    Err(e) => DecodeOutcome::Failed(format!("{:#}", e)),
                };
                let result = DecodeResult {
                    seq: pending.seq,
                    outcome,
                };
                if results.send(result).await.is_err() {
                    debug!("Decode result #{} dropped: session ended", pending.seq);
                }
            });
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::decoder::types::{DecodeRequest, PendingDecode};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        fn request() -> DecodeRequest {
            DecodeRequest {
                frmpayload_hex: "a1b2".to_string(),
                dev_addr: "260B1234".to_string(),
                apps_key: "00".repeat(16),
                nwks_key: "11".repeat(16),
                fcnt_up: Some(3),
                frame_type: 4,
                ack: 0,
                class_b: 0,
            }
        }

        /// Serve exactly one HTTP response and hand back the request body
        async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}/decode", listener.local_addr().unwrap());

            let handle = tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let request_body = loop {
                    let n = stream.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf).to_string();
                    if let Some(split) = text.find("\r\n\r\n") {
                        let content_length = text[..split]
                            .lines()
                            .find_map(|line| {
                                let (name, value) = line.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())
                                    .flatten()
                            })
                            .unwrap_or(0);
                        if buf.len() >= split + 4 + content_length {
                            break text[split + 4..].to_string();
                        }
                    }
                    if n == 0 {
                        break String::new();
                    }
                };

                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
                request_body
            });

            (url, handle)
        }

        fn config(url: String) -> DecoderConfig {
            DecoderConfig {
                url,
                apps_key: "00".repeat(16),
                nwks_key: "11".repeat(16),
                direct_class_b: false,
            }
        }

        #[tokio::test]
        async fn test_decode_success_posts_request() {
            let (url, server) = serve_once("200 OK", r#"{"phy_payload":"40341200"}"#).await;
            let forwarder = DecodeForwarder::new(&config(url)).unwrap();

            let phy = forwarder.decode(&request()).await.unwrap();
            assert_eq!(phy, "40341200");

            let sent: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
            assert_eq!(sent["frmpayload_hex"], "a1b2");
            assert_eq!(sent["dev_addr"], "260B1234");
            assert_eq!(sent["frame_type"].as_u64(), Some(4));
        }

        #[tokio::test]
        async fn test_error_field_is_failure() {
            let (url, _server) = serve_once("200 OK", r#"{"error":"MIC mismatch"}"#).await;
            let forwarder = DecodeForwarder::new(&config(url)).unwrap();

            let err = tokio_test::assert_err!(forwarder.decode(&request()).await);
            assert!(err.to_string().contains("MIC mismatch"));
        }

        #[tokio::test]
        async fn test_spawn_reports_http_failure() {
            let (url, _server) = serve_once("500 Internal Server Error", r#"{}"#).await;
            let forwarder = DecodeForwarder::new(&config(url)).unwrap();
            let (tx, mut rx) = mpsc::channel(1);

            forwarder.spawn(
                PendingDecode {
                    seq: 9,
                    request: request(),
                },
                tx,
            );

            let result = rx.recv().await.unwrap();
            assert_eq!(result.seq, 9);
            match result.outcome {
                DecodeOutcome::Failed(message) => assert!(message.contains("500")),
                other => panic!("Expected failure, got {:?}", other),
            }
        }
    }
}
