use std::sync::Arc;
use std::time::Duration;

use catalog_client::{Catalog, WorkerAdvertisement};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Periodically tells the catalog this controller is alive.
pub struct AdvertiseBeacon {
    catalog: Arc<dyn Catalog>,
    advertisement: WorkerAdvertisement,
    interval: Duration,
}

impl AdvertiseBeacon {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        controller_id: Uuid,
        public_endpoint: Option<String>,
        interval: Duration,
    ) -> Self {
        Self {
            catalog,
            advertisement: WorkerAdvertisement::for_current_process(controller_id, public_endpoint),
            interval,
        }
    }

    pub fn advertisement(&self) -> &WorkerAdvertisement {
        &self.advertisement
    }

    /// Advertise, sleep, repeat until shutdown. Failures are logged only.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            controller_id = %self.advertisement.controller_id,
            endpoint = ?self.advertisement.public_endpoint,
            interval_ms = self.interval.as_millis() as u64,
            "advertising controller"
        );
        let mut sent: u64 = 0;
        while !shutdown.is_cancelled() {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.catalog.advertise(&self.advertisement) => result,
            };
            match result {
                Ok(ack) => {
                    sent += 1;
                    debug!(sent, ack = %ack.body, "advertisement accepted");
                }
                Err(err) => warn!(error = %err, "advertisement failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!(sent, "advertising stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use catalog_client::{AdvertiseAck, AssetRecord, CatalogError, DownloadInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingCatalog {
        calls: AtomicUsize,
        shutdown_after: usize,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl Catalog for CountingCatalog {
        async fn get_asset(&self, _: &str, _: &str) -> Result<AssetRecord, CatalogError> {
            unreachable!("beacon only advertises")
        }

        async fn get_asset_by_name(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Option<AssetRecord>, CatalogError> {
            unreachable!("beacon only advertises")
        }

        async fn get_download_info(&self, _: &str) -> Result<DownloadInfo, CatalogError> {
            unreachable!("beacon only advertises")
        }

        async fn advertise(
            &self,
            _: &WorkerAdvertisement,
        ) -> Result<AdvertiseAck, CatalogError> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if calls >= self.shutdown_after {
                self.shutdown.cancel();
            }
            if calls == 1 {
                return Err(CatalogError::InvalidEndpoint("first call fails".into()));
            }
            Ok(AdvertiseAck::default())
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn keeps_advertising_through_failures_until_shutdown() {
        let shutdown = CancellationToken::new();
        let catalog = Arc::new(CountingCatalog {
            shutdown_after: 3,
            shutdown: shutdown.clone(),
            ..Default::default()
        });
        let beacon = AdvertiseBeacon::new(
            catalog.clone(),
            Uuid::new_v4(),
            Some("wss://worker.example:443".into()),
            Duration::from_millis(5),
        );
        assert_eq!(
            beacon.advertisement().public_endpoint.as_deref(),
            Some("wss://worker.example:443")
        );

        beacon.run(shutdown).await;
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 3);
    }

    #[test_timeout::tokio_timeout_test]
    async fn shutdown_interrupts_the_sleep() {
        let shutdown = CancellationToken::new();
        let catalog = Arc::new(CountingCatalog {
            shutdown_after: usize::MAX,
            ..Default::default()
        });
        let beacon = AdvertiseBeacon::new(catalog.clone(), Uuid::nil(), None, Duration::from_secs(3600));

        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        });
        beacon.run(shutdown).await;
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }
}
