// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::collections::HashMap;
use std::sync::Arc;

use reframe_core::channel::OpenFuture;
use reframe_core::{normalize_interface, ChannelConfig, ChannelDriver, ChannelInfo, OpenError};

mod virtual_bus;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
mod socketcan_driver;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub use socketcan_driver::SocketCanDriver;
pub use virtual_bus::{VirtualBus, VirtualConnection, VIRTUAL_INTERFACE};

/// Channel drivers keyed by interface name.
///
/// The registry is itself a [`ChannelDriver`]: it dispatches `open` on the
/// interface part of the channel id and merges every driver's discovery.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn ChannelDriver>>,
}

impl DriverRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under a stable interface name (e.g. "socketcan").
    pub fn register_driver(&mut self, name: &str, driver: Arc<dyn ChannelDriver>) {
        self.drivers.insert(normalize_interface(name), driver);
    }

    pub fn is_driver_registered(&self, name: &str) -> bool {
        self.drivers.contains_key(&normalize_interface(name))
    }

    /// List registered interface names.
    pub fn registered_drivers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Channels reachable through any registered driver, sorted by id.
    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        let mut channels: Vec<ChannelInfo> = self
            .drivers
            .values()
            .flat_map(|driver| driver.discover())
            .collect();
        channels.sort_by_key(|info| info.channel_id.to_string());
        channels
    }
}

impl ChannelDriver for DriverRegistry {
    fn open<'a>(&'a self, config: &'a ChannelConfig) -> OpenFuture<'a> {
        let interface = &config.channel_id.interface;
        match self.drivers.get(&normalize_interface(interface)) {
            Some(driver) => driver.open(config),
            None => {
                let message = format!("unknown interface '{}'", interface);
                Box::pin(async move { Err(OpenError::DeviceNotFound(message)) })
            }
        }
    }

    fn discover(&self) -> Vec<ChannelInfo> {
        self.list_channels()
    }
}

/// Register all built-in drivers enabled by features on a registry.
///
/// The virtual driver is served by `bus`, so callers keep a handle for
/// injecting frames and faults.
pub fn register_builtin_drivers_on(registry: &mut DriverRegistry, bus: &VirtualBus) {
    registry.register_driver(VIRTUAL_INTERFACE, Arc::new(bus.clone()));
    #[cfg(all(feature = "socketcan", target_os = "linux"))]
    registry.register_driver("socketcan", Arc::new(SocketCanDriver::new()));
}
