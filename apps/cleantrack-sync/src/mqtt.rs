use crate::config::Config;
use crate::error::SourceError;
use crate::ingest::{SnapshotSource, SnapshotStream};
use crate::model::Category;
use crate::records::{decode_snapshot, RecordBatch};
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone)]
pub struct MqttSnapshotSource {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    client_id: String,
    topic_prefix: String,
    keepalive: Duration,
}

impl MqttSnapshotSource {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            client_id: config.mqtt_client_id.clone(),
            topic_prefix: config.mqtt_topic_prefix.clone(),
            keepalive: config.mqtt_keepalive(),
        }
    }

    fn options(&self, category: Category) -> MqttOptions {
        let mut options = MqttOptions::new(
            format!("{}-{}", self.client_id, category.collection()),
            self.host.clone(),
            self.port,
        );
        options.set_keep_alive(self.keepalive);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

pub fn snapshot_topic(prefix: &str, category: Category) -> String {
    let prefix = prefix.trim().trim_end_matches('/');
    if prefix.is_empty() {
        format!("{}/snapshot", category.collection())
    } else {
        format!("{}/{}/snapshot", prefix, category.collection())
    }
}

impl SnapshotSource for MqttSnapshotSource {
    fn subscribe(&self, category: Category) -> BoxFuture<'static, Result<SnapshotStream, SourceError>> {
        let options = self.options(category);
        let topic = snapshot_topic(&self.topic_prefix, category);
        async move {
            let (client, mut eventloop) = AsyncClient::new(options, 32);
            client
                .subscribe(topic.clone(), QoS::AtLeastOnce)
                .await
                .map_err(|err| SourceError::Connection(err.to_string()))?;
            wait_for_connack(&mut eventloop).await?;
            tracing::info!(topic = %topic, "subscribed to snapshot feed");

            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(forward_snapshots(client, eventloop, topic, tx));
            Ok(ReceiverStream::new(rx).boxed())
        }
        .boxed()
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), SourceError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(err) => return Err(SourceError::Connection(err.to_string())),
        }
    }
}

async fn forward_snapshots(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topic: String,
    tx: mpsc::Sender<Result<RecordBatch, SourceError>>,
) {
    loop {
        let event = tokio::select! {
            _ = tx.closed() => break,
            event = eventloop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                if publish.topic != topic {
                    continue;
                }
                let mut payload = publish.payload.to_vec();
                match decode_snapshot(&mut payload) {
                    Ok(records) => {
                        if tx.send(Ok(records)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        // One bad push does not end the subscription; the next snapshot replaces it.
                        tracing::warn!(error=%err, topic = %publish.topic, "failed to decode snapshot payload");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error=%err, topic = %topic, "MQTT connection dropped");
                let _ = tx.send(Err(SourceError::Connection(err.to_string()))).await;
                break;
            }
        }
    }
    let _ = client.try_disconnect();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_topic_uses_collection_names() {
        assert_eq!(snapshot_topic("cleantrack", Category::Bin), "cleantrack/bins/snapshot");
        assert_eq!(snapshot_topic("site/a/", Category::Plant), "site/a/plants/snapshot");
        assert_eq!(snapshot_topic("  ", Category::Report), "reports/snapshot");
    }

    #[test]
    fn client_ids_are_unique_per_category() {
        let config = Config::default();
        let source = MqttSnapshotSource::from_config(&config);
        let bins = source.options(Category::Bin);
        let plants = source.options(Category::Plant);
        assert_ne!(bins.client_id(), plants.client_id());
        assert!(bins.client_id().ends_with("-bins"));
    }
}
