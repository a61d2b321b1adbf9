//! Client glue: owns the sync core and feeds it provider notifications.

use std::sync::Arc;

use tokio::sync::mpsc;

use btc_keys::KeyDeriver;

use crate::config::Config;
use crate::error::Result;
use crate::provider::{Provider, ProviderNotification};
use crate::storage::{KeyValueStore, StoreHandle};
use crate::sync::SyncManager;

/// The wallet client.
///
/// Wires the provider's push notifications into the [`SyncManager`]. All
/// wallet operations are reached through [`WalletClient::manager`]; the
/// client only adds the notification pump.
pub struct WalletClient<P: Provider> {
    manager: SyncManager<P>,
    notifications: Option<mpsc::UnboundedReceiver<ProviderNotification>>,
}

impl<P: Provider> WalletClient<P> {
    /// Open the wallet against a provider and a storage backend.
    pub async fn open(
        config: Config,
        provider: Arc<P>,
        backend: Arc<dyn KeyValueStore>,
        deriver: KeyDeriver,
    ) -> Result<Self> {
        let notifications = provider.take_notifications();
        let store = StoreHandle::new(backend);
        let manager = SyncManager::open(config, provider, store, deriver).await?;
        Ok(Self {
            manager,
            notifications,
        })
    }

    pub fn manager(&self) -> &SyncManager<P> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut SyncManager<P> {
        &mut self.manager
    }

    /// Drain any queued notifications without blocking.
    pub async fn tick(&mut self) -> Result<()> {
        loop {
            let notification = match self.notifications.as_mut() {
                Some(rx) => match rx.try_recv() {
                    Ok(n) => n,
                    Err(_) => return Ok(()),
                },
                None => return Ok(()),
            };
            self.manager.handle_notification(notification).await?;
        }
    }

    /// Process notifications until the provider stream closes.
    pub async fn run(&mut self) -> Result<()> {
        let Some(mut rx) = self.notifications.take() else {
            return Ok(());
        };
        while let Some(notification) = rx.recv().await {
            if let Err(e) = self.manager.handle_notification(notification).await {
                tracing::error!("Notification handling failed: {}", e);
            }
        }
        Ok(())
    }
}
