//! Radio-source identities: Wi-Fi access points and BLE beacons.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::errors::{PositioningError, Result};
use crate::geometry::Point;

/// A 6-byte IEEE 802 MAC address identifying a Wi-Fi access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Bssid([u8; 6]);

impl Bssid {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Parse the colon-separated hex form, e.g. `"aa:bb:cc:dd:ee:ff"`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = text.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| {
                PositioningError::InvalidArgument(format!("malformed BSSID: {text:?}"))
            })?;
            if part.len() != 2 {
                return Err(PositioningError::InvalidArgument(format!(
                    "malformed BSSID: {text:?}"
                )));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| {
                PositioningError::InvalidArgument(format!("malformed BSSID: {text:?}"))
            })?;
        }
        if parts.next().is_some() {
            return Err(PositioningError::InvalidArgument(format!(
                "malformed BSSID: {text:?}"
            )));
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for Bssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for Bssid {
    type Err = PositioningError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// One segment of a beacon identity (e.g. a proximity UUID, major or minor
/// field). Beacons are identified by an ordered list of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BeaconId(Vec<u8>);

impl BeaconId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A radio source observed by the receiver.
///
/// Equality and hashing consider the identity field only (BSSID or beacon
/// identifier list); the carrier frequency is an attribute, not part of the
/// identity.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RadioSource {
    /// A Wi-Fi access point identified by its BSSID.
    AccessPoint {
        bssid: Bssid,
        /// Human-readable network name, if advertised.
        ssid: Option<String>,
        frequency_hz: f64,
    },
    /// A BLE beacon identified by an ordered list of identifier segments.
    Beacon {
        identifiers: Vec<BeaconId>,
        frequency_hz: f64,
    },
}

impl RadioSource {
    /// Shorthand for an access point without an SSID.
    pub fn access_point(bssid: Bssid, frequency_hz: f64) -> Self {
        Self::AccessPoint {
            bssid,
            ssid: None,
            frequency_hz,
        }
    }

    pub fn beacon(identifiers: Vec<BeaconId>, frequency_hz: f64) -> Self {
        Self::Beacon {
            identifiers,
            frequency_hz,
        }
    }

    /// Carrier frequency in Hz.
    pub fn frequency_hz(&self) -> f64 {
        match self {
            Self::AccessPoint { frequency_hz, .. } | Self::Beacon { frequency_hz, .. } => {
                *frequency_hz
            }
        }
    }
}

impl PartialEq for RadioSource {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::AccessPoint { bssid: a, .. }, Self::AccessPoint { bssid: b, .. }) => a == b,
            (Self::Beacon { identifiers: a, .. }, Self::Beacon { identifiers: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Eq for RadioSource {}

impl Hash for RadioSource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::AccessPoint { bssid, .. } => {
                0u8.hash(state);
                bssid.hash(state);
            }
            Self::Beacon { identifiers, .. } => {
                1u8.hash(state);
                identifiers.hash(state);
            }
        }
    }
}

/// A radio source with a known position and known (or previously estimated)
/// transmission parameters, used to locate a receiver.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocatedSource {
    source: RadioSource,
    position: Point,
    transmitted_power_dbm: f64,
    path_loss_exponent: f64,
}

impl LocatedSource {
    pub fn new(
        source: RadioSource,
        position: Point,
        transmitted_power_dbm: f64,
        path_loss_exponent: f64,
    ) -> Result<Self> {
        if !transmitted_power_dbm.is_finite() {
            return Err(PositioningError::InvalidArgument(
                "transmitted power must be finite".into(),
            ));
        }
        if !path_loss_exponent.is_finite() || path_loss_exponent == 0.0 {
            return Err(PositioningError::InvalidArgument(
                "path-loss exponent must be finite and non-zero".into(),
            ));
        }
        Ok(Self {
            source,
            position,
            transmitted_power_dbm,
            path_loss_exponent,
        })
    }

    pub fn source(&self) -> &RadioSource {
        &self.source
    }

    pub fn position(&self) -> &Point {
        &self.position
    }

    pub fn transmitted_power_dbm(&self) -> f64 {
        self.transmitted_power_dbm
    }

    pub fn path_loss_exponent(&self) -> f64 {
        self.path_loss_exponent
    }
}
