//! GPC reference numbers (`I.1.1`) and the static sector/subsector table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Sector {
    I,
    II,
    III,
    IV,
    V,
}

impl Sector {
    pub const ALL: [Sector; 5] = [Sector::I, Sector::II, Sector::III, Sector::IV, Sector::V];

    pub fn numeral(self) -> &'static str {
        match self {
            Sector::I => "I",
            Sector::II => "II",
            Sector::III => "III",
            Sector::IV => "IV",
            Sector::V => "V",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Sector::I => "Stationary Energy",
            Sector::II => "Transportation",
            Sector::III => "Waste",
            Sector::IV => "Industrial Processes and Product Uses",
            Sector::V => "Agriculture, Forestry and Other Land Use",
        }
    }

    fn subsector_names(self) -> &'static [&'static str] {
        match self {
            Sector::I => &[
                "Residential buildings",
                "Commercial and institutional buildings and facilities",
                "Manufacturing industries and construction",
                "Energy industries",
                "Agriculture, forestry and fishing activities",
                "Non-specified sources",
                "Fugitive emissions from mining, processing, storage, and transportation of coal",
                "Fugitive emissions from oil and natural gas systems",
            ],
            Sector::II => &[
                "On-road",
                "Railways",
                "Waterborne navigation",
                "Aviation",
                "Off-road",
            ],
            Sector::III => &[
                "Solid waste disposal",
                "Biological treatment of waste",
                "Incineration and open burning",
                "Wastewater treatment and discharge",
            ],
            Sector::IV => &["Industrial processes", "Product use"],
            Sector::V => &[
                "Livestock",
                "Land",
                "Aggregate sources and non-CO2 emission sources on land",
            ],
        }
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.numeral())
    }
}

impl FromStr for Sector {
    type Err = GpcParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sector::ALL
            .into_iter()
            .find(|sector| sector.numeral().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| GpcParseError::UnknownSector(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpcParseError {
    #[error("empty GPC reference number")]
    Empty,
    #[error("unknown GPC sector `{0}`")]
    UnknownSector(String),
    #[error("GPC reference `{0}` has no subsector {1}")]
    UnknownSubsector(String, String),
    #[error("GPC reference `{0}` has an invalid scope")]
    InvalidScope(String),
    #[error("malformed GPC reference number `{0}`")]
    Malformed(String),
}

/// `<sector>.<subsector>[.<scope>]`. Ordering follows sector, subsector, scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GpcReferenceNumber {
    sector: Sector,
    subsector: u8,
    scope: Option<u8>,
}

impl GpcReferenceNumber {
    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn subsector(&self) -> u8 {
        self.subsector
    }

    pub fn scope(&self) -> Option<u8> {
        self.scope
    }

    /// The subsector-level reference (`I.1` for `I.1.2`).
    pub fn subsector_reference(&self) -> GpcReferenceNumber {
        GpcReferenceNumber {
            scope: None,
            ..*self
        }
    }

    pub fn subsector_name(&self) -> &'static str {
        self.sector.subsector_names()[usize::from(self.subsector) - 1]
    }
}

impl fmt::Display for GpcReferenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Some(scope) => write!(f, "{}.{}.{}", self.sector, self.subsector, scope),
            None => write!(f, "{}.{}", self.sector, self.subsector),
        }
    }
}

impl FromStr for GpcReferenceNumber {
    type Err = GpcParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(GpcParseError::Empty);
        }
        let parts: Vec<&str> = trimmed.split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(GpcParseError::Malformed(trimmed.to_string()));
        }

        let sector: Sector = parts[0].parse()?;
        let subsector: u8 = parts[1]
            .parse()
            .map_err(|_| GpcParseError::Malformed(trimmed.to_string()))?;
        if subsector == 0 || usize::from(subsector) > sector.subsector_names().len() {
            return Err(GpcParseError::UnknownSubsector(
                trimmed.to_string(),
                parts[1].to_string(),
            ));
        }
        let scope = match parts.get(2) {
            Some(raw) => match raw.parse::<u8>() {
                Ok(scope @ 1..=3) => Some(scope),
                _ => return Err(GpcParseError::InvalidScope(trimmed.to_string())),
            },
            None => None,
        };

        Ok(Self {
            sector,
            subsector,
            scope,
        })
    }
}

impl TryFrom<String> for GpcReferenceNumber {
    type Error = GpcParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GpcReferenceNumber> for String {
    fn from(value: GpcReferenceNumber) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scope_level_references() {
        let gpc: GpcReferenceNumber = "II.1.3".parse().unwrap();
        assert_eq!(gpc.sector(), Sector::II);
        assert_eq!(gpc.subsector(), 1);
        assert_eq!(gpc.scope(), Some(3));
        assert_eq!(gpc.subsector_name(), "On-road");
        assert_eq!(gpc.subsector_reference().to_string(), "II.1");
        assert_eq!(gpc.to_string(), "II.1.3");
    }

    #[test]
    fn parses_subsector_level_references() {
        let gpc: GpcReferenceNumber = "V.2".parse().unwrap();
        assert_eq!(gpc.scope(), None);
        assert_eq!(gpc.sector().name(), "Agriculture, Forestry and Other Land Use");
    }

    #[test]
    fn rejects_bad_references() {
        assert_eq!("".parse::<GpcReferenceNumber>(), Err(GpcParseError::Empty));
        assert!(matches!(
            "VI.1.1".parse::<GpcReferenceNumber>(),
            Err(GpcParseError::UnknownSector(_))
        ));
        assert!(matches!(
            "IV.3.1".parse::<GpcReferenceNumber>(),
            Err(GpcParseError::UnknownSubsector(_, _))
        ));
        assert!(matches!(
            "I.1.4".parse::<GpcReferenceNumber>(),
            Err(GpcParseError::InvalidScope(_))
        ));
        assert!(matches!(
            "I".parse::<GpcReferenceNumber>(),
            Err(GpcParseError::Malformed(_))
        ));
    }

    #[test]
    fn ordering_follows_sector_then_subsector_then_scope() {
        let mut refs: Vec<GpcReferenceNumber> = ["II.1.1", "I.2.1", "I.1.2", "I.1.1", "I.1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        refs.sort();
        let rendered: Vec<String> = refs.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["I.1", "I.1.1", "I.1.2", "I.2.1", "II.1.1"]);
    }

    #[test]
    fn serde_uses_the_dotted_form() {
        let gpc: GpcReferenceNumber = serde_json::from_str("\"III.4.1\"").unwrap();
        assert_eq!(serde_json::to_string(&gpc).unwrap(), "\"III.4.1\"");
        assert!(serde_json::from_str::<GpcReferenceNumber>("\"X.1\"").is_err());
    }
}
