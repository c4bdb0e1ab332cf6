//! Runtime permission gate
//!
//! Scanning and advertising need platform permissions before the radio may
//! be used. The actual prompt is the platform's business; this module knows
//! which permissions each action needs and turns a refusal into an error
//! the session controller can surface.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Android API level that introduced the split Bluetooth permissions.
pub const ANDROID_S_API_LEVEL: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    AccessFineLocation,
    BluetoothScan,
    BluetoothAdvertise,
    BluetoothConnect,
}

impl Permission {
    /// The Android manifest name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::AccessFineLocation => "android.permission.ACCESS_FINE_LOCATION",
            Permission::BluetoothScan => "android.permission.BLUETOOTH_SCAN",
            Permission::BluetoothAdvertise => "android.permission.BLUETOOTH_ADVERTISE",
            Permission::BluetoothConnect => "android.permission.BLUETOOTH_CONNECT",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
    NeverAskAgain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "os", rename_all = "snake_case")]
pub enum Platform {
    Android { api_level: u32 },
    Ios,
    Desktop,
}

/// The user-facing actions that touch the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Scan,
    Advertise,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Scan => f.write_str("scan"),
            Action::Advertise => f.write_str("advertise"),
        }
    }
}

/// Permissions that must be granted before `action` on `platform`.
pub fn required_permissions(action: Action, platform: Platform) -> Vec<Permission> {
    let Platform::Android { api_level } = platform else {
        return Vec::new();
    };
    match action {
        Action::Scan => {
            let mut permissions = vec![Permission::AccessFineLocation];
            if api_level >= ANDROID_S_API_LEVEL {
                permissions.extend([
                    Permission::BluetoothScan,
                    Permission::BluetoothAdvertise,
                    Permission::BluetoothConnect,
                ]);
            }
            permissions
        }
        Action::Advertise => vec![Permission::BluetoothAdvertise],
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("Permission denied for {action}: {}", format_permissions(.denied))]
    Denied {
        action: Action,
        denied: Vec<Permission>,
    },

    #[error("Permission provider error: {0}")]
    Provider(String),
}

fn format_permissions(permissions: &[Permission]) -> String {
    permissions
        .iter()
        .map(Permission::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolves runtime permissions, typically by prompting the user.
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    async fn request(
        &self,
        permissions: &[Permission],
    ) -> Result<Vec<(Permission, PermissionStatus)>, PermissionError>;
}

/// Checks an action's permissions through a provider.
#[derive(Clone)]
pub struct PermissionGate {
    platform: Platform,
    provider: Arc<dyn PermissionProvider>,
}

impl PermissionGate {
    pub fn new(platform: Platform, provider: Arc<dyn PermissionProvider>) -> Self {
        Self { platform, provider }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Request whatever `action` needs; fail listing every permission not granted.
    pub async fn ensure(&self, action: Action) -> Result<(), PermissionError> {
        let required = required_permissions(action, self.platform);
        if required.is_empty() {
            return Ok(());
        }

        let results = self.provider.request(&required).await?;
        log::debug!("[permissions] {} request results: {:?}", action, results);

        let denied: Vec<Permission> = required
            .iter()
            .copied()
            .filter(|permission| {
                !results
                    .iter()
                    .any(|(p, status)| p == permission && *status == PermissionStatus::Granted)
            })
            .collect();

        if denied.is_empty() {
            Ok(())
        } else {
            log::warn!(
                "[permissions] {} denied: {}",
                action,
                format_permissions(&denied)
            );
            Err(PermissionError::Denied { action, denied })
        }
    }
}

/// A provider answering from a fixed set of granted permissions.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    granted: HashSet<Permission>,
}

impl StaticPermissions {
    pub fn granting(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            granted: permissions.into_iter().collect(),
        }
    }

    pub fn all() -> Self {
        Self::granting([
            Permission::AccessFineLocation,
            Permission::BluetoothScan,
            Permission::BluetoothAdvertise,
            Permission::BluetoothConnect,
        ])
    }

    pub fn none() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PermissionProvider for StaticPermissions {
    async fn request(
        &self,
        permissions: &[Permission],
    ) -> Result<Vec<(Permission, PermissionStatus)>, PermissionError> {
        Ok(permissions
            .iter()
            .map(|p| {
                let status = if self.granted.contains(p) {
                    PermissionStatus::Granted
                } else {
                    PermissionStatus::Denied
                };
                (*p, status)
            })
            .collect())
    }
}
