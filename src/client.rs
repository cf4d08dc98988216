//! Account level entry point.

use crate::api::{self, DeviceInfoResponse, DeviceListResponse, DeviceRequest};
use crate::config::ClientConfig;
use crate::device::Device;
use crate::session::SessionManager;
use crate::transport::{Clock, Method, ReqwestTransport, SystemClock, Transport};
use crate::{Error, Result};
use futures::future::join_all;
use log::{error, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Client for one Agua IOT account.
///
/// Owns the session and every device of the account. Cloning is not
/// supported; share a `Client` behind an `Arc` instead.
#[derive(Debug)]
pub struct Client {
    session: Arc<SessionManager>,
    devices: Vec<Device>,
    cancel: CancellationToken,
}

impl Client {
    /// Creates a client talking HTTPS through `reqwest`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config.http_timeout)?;
        Ok(Self::with_transport(
            config,
            Arc::new(transport),
            Arc::new(SystemClock),
        ))
    }

    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            session: Arc::new(SessionManager::new(config, transport, clock)),
            devices: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Registers the app, logs in, discovers every device and reads it once.
    ///
    /// The first failing step aborts, leaving the device list empty.
    pub async fn connect(&mut self) -> Result<()> {
        self.devices.clear();
        self.session.register_app_id().await?;
        self.session.login().await?;
        let devices = self.fetch_devices().await?;
        for device in &devices {
            device.update_mapping().await?;
        }
        for device in &devices {
            device.update().await?;
        }
        info!("Connected with {} device(s)", devices.len());
        self.devices = devices;
        Ok(())
    }

    async fn fetch_devices(&self) -> Result<Vec<Device>> {
        let list: DeviceListResponse = self
            .session
            .call(Method::Post, api::API_PATH_DEVICE_LIST, &serde_json::Map::new())
            .await?;
        let mut devices = Vec::with_capacity(list.device.len());
        for entry in list.device {
            let info: DeviceInfoResponse = self
                .session
                .call(
                    Method::Post,
                    api::API_PATH_DEVICE_INFO,
                    &DeviceRequest {
                        id_device: &entry.id_device,
                        id_product: &entry.id_product,
                    },
                )
                .await?;
            let id_registers_map = info
                .device_info
                .into_iter()
                .next()
                .map(|info| info.id_registers_map)
                .ok_or_else(|| {
                    Error::Protocol(format!(
                        "No device info for device {} from {}",
                        entry.id_device,
                        self.session.url(api::API_PATH_DEVICE_INFO)
                    ))
                })?;
            devices.push(Device::new(
                entry,
                id_registers_map,
                Arc::clone(&self.session),
                self.cancel.child_token(),
            ));
        }
        Ok(devices)
    }

    /// Reads the buffer of every device concurrently.
    ///
    /// Every failure is logged with its device; the first one is returned.
    pub async fn update(&self) -> Result<()> {
        let results = join_all(self.devices.iter().map(|device| device.update())).await;
        let mut first = None;
        for (device, result) in self.devices.iter().zip(results) {
            if let Err(err) = result {
                error!("Update of device '{}' failed: {err}", device.name());
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Finds a device by `id_device`, `id` or name.
    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices
            .iter()
            .find(|device| device.id_device().matches(id) || device.id().matches(id))
            .or_else(|| self.devices.iter().find(|device| device.name() == id))
    }

    /// Cancels every poll in flight. Later polls fail immediately.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
