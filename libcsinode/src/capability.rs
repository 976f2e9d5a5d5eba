//! Driver capability lookups.
//!
//! Whether a driver takes part in the attach protocol is published in its
//! cluster-scoped descriptor, which an external informer keeps cached. A
//! failed lookup is an error for the caller, never an implied default.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::error::CsiError;
use crate::store::DriverStore;

/// Answers capability questions about a driver.
#[derive(Clone)]
pub struct CapabilityGate {
    drivers: Arc<dyn DriverStore>,
}

impl CapabilityGate {
    pub fn new(drivers: Arc<dyn DriverStore>) -> Self {
        Self { drivers }
    }

    /// `true` when the driver needs an attachment record before publish.
    #[instrument(skip(self))]
    pub async fn is_attach_required(&self, driver: &str) -> Result<bool, CsiError> {
        let info = self
            .drivers
            .get_driver(driver)
            .await
            .inspect_err(|e| warn!(error = %e, "failed to get driver descriptor"))?;
        debug!(attach_required = info.attach_required, "driver capability");
        Ok(info.attach_required)
    }

    /// `true` when the driver wants pod identity in the publish context.
    pub async fn pod_info_on_mount(&self, driver: &str) -> Result<bool, CsiError> {
        Ok(self.drivers.get_driver(driver).await?.pod_info_on_mount)
    }
}
