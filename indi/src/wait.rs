//! Polling waits on property state
//!
//! These sit above the protocol engine: they only read the store at the
//! configured poll interval and never block message processing.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::client::IndiClient;
use crate::error::{IndiError, IndiResult};
use crate::value::PropertyState;
use crate::vector::Property;

impl IndiClient {
    /// Wait for a property to reach `expected`.
    ///
    /// Fails early with `PropertyAlert` if the property turns Alert while
    /// waiting for something else.
    pub async fn wait_for_property_state(
        &self,
        device: &str,
        property: &str,
        expected: PropertyState,
        timeout: Duration,
    ) -> IndiResult<()> {
        self.poll_state(device, property, timeout, |state| state == expected)
            .await
    }

    /// Wait for a property to settle on Ok or Idle
    pub async fn wait_for_property_not_busy(
        &self,
        device: &str,
        property: &str,
        timeout: Duration,
    ) -> IndiResult<()> {
        self.poll_state(device, property, timeout, |state| {
            matches!(state, PropertyState::Ok | PropertyState::Idle)
        })
        .await
    }

    /// Wait until the stored property satisfies `predicate` and return it
    pub async fn wait_until<F>(
        &self,
        device: &str,
        property: &str,
        timeout: Duration,
        mut predicate: F,
    ) -> IndiResult<Arc<Property>>
    where
        F: FnMut(&Property) -> bool,
    {
        let start = Instant::now();
        let poll_interval = self.config().property_poll_interval();
        let mut last_state = None;

        loop {
            if let Some(current) = self.property(device, property) {
                last_state = current.state();
                if predicate(&current) {
                    return Ok(current);
                }
            }

            if start.elapsed() >= timeout {
                return Err(IndiError::PropertyTimeout {
                    device: device.to_string(),
                    property: property.to_string(),
                    duration: timeout,
                    last_state,
                });
            }
            sleep(poll_interval).await;
        }
    }

    async fn poll_state(
        &self,
        device: &str,
        property: &str,
        timeout: Duration,
        mut done: impl FnMut(PropertyState) -> bool,
    ) -> IndiResult<()> {
        let mut alerted = false;
        let result = self
            .wait_until(device, property, timeout, |current| match current.state() {
                Some(state) if done(state) => true,
                Some(PropertyState::Alert) => {
                    alerted = true;
                    true
                }
                _ => false,
            })
            .await;

        match result {
            Ok(_) if alerted => Err(IndiError::PropertyAlert {
                device: device.to_string(),
                property: property.to_string(),
            }),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
