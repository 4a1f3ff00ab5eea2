//! Fanout over plain HTTP: every envelope is POSTed to each configured peer's
//! `/internal/bus` endpoint, which hands it to that peer's `ingest`.

use std::time::Duration;

use futures_util::future::{BoxFuture, join_all};
use tracing::{debug, warn};

use tandem_types::error::ChatError;
use tandem_types::events::BusEnvelope;

use crate::bus::{BusHandler, FanoutBus, SubscriptionId, TopicTable};

const PEER_TIMEOUT: Duration = Duration::from_secs(2);

pub const BUS_INGRESS_PATH: &str = "/internal/bus";

pub struct PeerHttpBus {
    client: reqwest::Client,
    peers: Vec<String>,
    secret: String,
    table: TopicTable,
}

impl PeerHttpBus {
    pub fn new(peers: Vec<String>, secret: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(PEER_TIMEOUT).build()?;
        let peers = peers
            .into_iter()
            .map(|p| p.trim().trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        Ok(Self {
            client,
            peers,
            secret,
            table: TopicTable::default(),
        })
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Constant-shape comparison of the bearer secret on inbound envelopes.
    pub fn accepts(&self, presented: &str) -> bool {
        let (a, b) = (presented.as_bytes(), self.secret.as_bytes());
        a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }

    async fn post(&self, peer: &str, envelope: &BusEnvelope) -> Result<(), String> {
        let url = format!("{}{}", peer, BUS_INGRESS_PATH);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.secret)
            .json(envelope)
            .send()
            .await
            .map_err(|e| format!("{}: {}", peer, e))?;

        if !res.status().is_success() {
            return Err(format!("{}: HTTP {}", peer, res.status()));
        }
        Ok(())
    }
}

impl FanoutBus for PeerHttpBus {
    fn publish(&self, envelope: BusEnvelope) -> BoxFuture<'_, Result<(), ChatError>> {
        Box::pin(async move {
            self.table.deliver(&envelope);

            let results = join_all(self.peers.iter().map(|peer| self.post(peer, &envelope))).await;
            let failures: Vec<String> = results.into_iter().filter_map(Result::err).collect();

            if failures.is_empty() {
                debug!("Envelope on {} sent to {} peers", envelope.topic, self.peers.len());
                return Ok(());
            }
            for failure in &failures {
                warn!("Bus publish failed: {}", failure);
            }
            Err(ChatError::TransientDeliveryFailure(format!(
                "{} of {} peers unreachable",
                failures.len(),
                self.peers.len()
            )))
        })
    }

    fn subscribe(&self, topic: &str, handler: BusHandler) -> SubscriptionId {
        self.table.subscribe(topic, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.table.unsubscribe(id)
    }

    fn ingest(&self, envelope: BusEnvelope) -> usize {
        self.table.deliver(&envelope)
    }

    fn kind(&self) -> &'static str {
        "peers"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tandem_types::events::{BusPayload, channel_topic};
    use uuid::Uuid;

    fn envelope(topic: &str) -> BusEnvelope {
        BusEnvelope {
            origin: Uuid::new_v4(),
            topic: topic.to_string(),
            payload: BusPayload::Revoke {
                channel_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            },
        }
    }

    #[test]
    fn peers_are_normalised() {
        let bus = PeerHttpBus::new(
            vec!["http://a:3000/".into(), " ".into(), " http://b:3000".into()],
            "s3cret".into(),
        )
        .unwrap();
        assert_eq!(bus.peers(), ["http://a:3000", "http://b:3000"]);
        assert_eq!(bus.kind(), "peers");
    }

    #[test]
    fn secret_check() {
        let bus = PeerHttpBus::new(vec![], "s3cret".into()).unwrap();
        assert!(bus.accepts("s3cret"));
        assert!(!bus.accepts("s3cre"));
        assert!(!bus.accepts("s3cres"));
    }

    #[tokio::test]
    async fn ingest_reaches_local_subscribers() {
        let bus = PeerHttpBus::new(vec![], "s3cret".into()).unwrap();
        let topic = channel_topic(Uuid::new_v4());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe(&topic, Arc::new(move |_: BusEnvelope| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(bus.ingest(envelope(&topic)), 1);
        assert_eq!(bus.ingest(envelope("channel:other")), 0);
        // No peers configured: publish only reaches this process.
        bus.publish(envelope(&topic)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_transient_failure() {
        // Port 9 (discard) on localhost refuses connections.
        let bus = PeerHttpBus::new(vec!["http://127.0.0.1:9".into()], "s3cret".into()).unwrap();
        let err = bus.publish(envelope("channel:x")).await.unwrap_err();
        assert!(matches!(err, ChatError::TransientDeliveryFailure(_)));
    }
}
