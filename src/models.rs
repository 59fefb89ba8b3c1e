//! Shared models and types for lotserver
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Vehicle size classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Compact,
    Midsize,
    Suv,
}

impl Default for SizeClass {
    fn default() -> Self {
        Self::Midsize
    }
}

impl SizeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Midsize => "midsize",
            Self::Suv => "suv",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "compact" => Ok(Self::Compact),
            "midsize" => Ok(Self::Midsize),
            "suv" => Ok(Self::Suv),
            other => Err(Error::Validation(format!("unknown size class: {other}"))),
        }
    }

    /// Whether a vehicle of this class fits a space of `space` class
    pub fn fits(&self, space: SizeClass) -> bool {
        (*self as u8) <= (space as u8)
    }
}

/// Parking space status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceStatus {
    Free,
    Reserved,
    Occupied,
}

impl Default for SpaceStatus {
    fn default() -> Self {
        Self::Free
    }
}

impl SpaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Reserved => "reserved",
            Self::Occupied => "occupied",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(Self::Free),
            "reserved" => Ok(Self::Reserved),
            "occupied" => Ok(Self::Occupied),
            other => Err(Error::Validation(format!("unknown space status: {other}"))),
        }
    }
}

/// Vehicle visit lifecycle status (one VehicleEvent per visit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitStatus {
    Entrance,
    Parking,
    Exit,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entrance => "Entrance",
            Self::Parking => "Parking",
            Self::Exit => "Exit",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Entrance" => Ok(Self::Entrance),
            "Parking" => Ok(Self::Parking),
            "Exit" => Ok(Self::Exit),
            other => Err(Error::Validation(format!("unknown visit status: {other}"))),
        }
    }
}

/// Assignment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Assigned,
    Completed,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Completed => "completed",
        }
    }
}

/// Human-readable zone + slot identifier, e.g. "B3"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotLabel {
    pub zone: String,
    pub slot_number: u32,
}

impl SlotLabel {
    pub fn new(zone: impl Into<String>, slot_number: u32) -> Self {
        Self {
            zone: zone.into().to_uppercase(),
            slot_number,
        }
    }

    /// Parse "B3" into zone "B", slot 3
    pub fn parse(label: &str) -> Result<Self> {
        let label = label.trim();
        if label.len() < 2 {
            return Err(Error::Validation(format!("invalid slot label: {label:?}")));
        }
        let zone: String = label.chars().take(1).collect();
        if !zone.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(Error::Validation(format!("invalid slot label: {label:?}")));
        }
        let number = &label[1..];
        let slot_number: u32 = number
            .parse()
            .map_err(|_| Error::Validation(format!("invalid slot label: {label:?}")))?;
        Ok(Self::new(zone, slot_number))
    }

    pub fn label(&self) -> String {
        format!("{}{}", self.zone, self.slot_number)
    }
}

impl std::fmt::Display for SlotLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.zone, self.slot_number)
    }
}

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub db_connected: bool,
    pub edge_connected: bool,
    pub subscriber_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_label_parses_zone_and_number() {
        let label = SlotLabel::parse("B3").unwrap();
        assert_eq!(label.zone, "B");
        assert_eq!(label.slot_number, 3);
        assert_eq!(label.label(), "B3");
    }

    #[test]
    fn slot_label_uppercases_zone() {
        let label = SlotLabel::parse("b12").unwrap();
        assert_eq!(label.zone, "B");
        assert_eq!(label.slot_number, 12);
    }

    #[test]
    fn slot_label_rejects_garbage() {
        assert!(SlotLabel::parse("").is_err());
        assert!(SlotLabel::parse("B").is_err());
        assert!(SlotLabel::parse("3B").is_err());
        assert!(SlotLabel::parse("Bx").is_err());
    }

    #[test]
    fn size_class_fit_ordering() {
        assert!(SizeClass::Compact.fits(SizeClass::Suv));
        assert!(SizeClass::Midsize.fits(SizeClass::Midsize));
        assert!(!SizeClass::Suv.fits(SizeClass::Compact));
    }
}
