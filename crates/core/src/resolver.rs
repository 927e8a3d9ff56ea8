//! Locality Resolver
//!
//! Maps a free-text place name to exactly one province by asking the region
//! lookup service about every province at once. Each probe has its own
//! timeout; a probe that fails or times out is left out of the result
//! without affecting the others. The lookup service is authoritative: there
//! is no fallback scan.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};

/// Localities shorter than this are rejected without any lookup.
pub const MIN_LOCALITY_CHARS: usize = 3;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// A Polish voivodeship as known to the NFZ API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Province {
    pub code: &'static str,
    pub name: &'static str,
}

pub const PROVINCES: [Province; 16] = [
    Province { code: "01", name: "DOLNOŚLĄSKIE" },
    Province { code: "02", name: "KUJAWSKO-POMORSKIE" },
    Province { code: "03", name: "LUBELSKIE" },
    Province { code: "04", name: "LUBUSKIE" },
    Province { code: "05", name: "ŁÓDZKIE" },
    Province { code: "06", name: "MAŁOPOLSKIE" },
    Province { code: "07", name: "MAZOWIECKIE" },
    Province { code: "08", name: "OPOLSKIE" },
    Province { code: "09", name: "PODKARPACKIE" },
    Province { code: "10", name: "PODLASKIE" },
    Province { code: "11", name: "POMORSKIE" },
    Province { code: "12", name: "ŚLĄSKIE" },
    Province { code: "13", name: "ŚWIĘTOKRZYSKIE" },
    Province { code: "14", name: "WARMIŃSKO-MAZURSKIE" },
    Province { code: "15", name: "WIELKOPOLSKIE" },
    Province { code: "16", name: "ZACHODNIOPOMORSKIE" },
];

/// Looks up a province by its two-digit code or by its name (any case).
pub fn find_province(code_or_name: &str) -> Option<Province> {
    let needle = code_or_name.trim();
    PROVINCES
        .iter()
        .find(|p| p.code == needle || p.name.to_lowercase() == needle.to_lowercase())
        .copied()
}

/// Answers whether a locality exists within one province.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegionLookup: Send + Sync {
    async fn locality_exists(&self, locality: &str, region_code: &str) -> anyhow::Result<bool>;
}

/// One province that reported the locality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionMatch {
    pub code: String,
    pub name: String,
    pub found: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvinceResolution {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_name: Option<String>,
    pub message: String,
    /// Positive matches in province-code order.
    pub matches: Vec<RegionMatch>,
}

impl ProvinceResolution {
    fn not_found(message: String, matches: Vec<RegionMatch>) -> Self {
        Self {
            found: false,
            region_code: None,
            region_name: None,
            message,
            matches,
        }
    }
}

pub struct LocalityResolver {
    lookup: Arc<dyn RegionLookup>,
    provinces: Vec<Province>,
    timeout: Duration,
}

impl LocalityResolver {
    pub fn new(lookup: Arc<dyn RegionLookup>) -> Self {
        Self {
            lookup,
            provinces: PROVINCES.to_vec(),
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    /// Sets the deadline applied to each province probe.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[instrument(skip(self))]
    pub async fn resolve_province(&self, locality: &str) -> ProvinceResolution {
        let locality = locality.trim();
        if locality.chars().count() < MIN_LOCALITY_CHARS {
            debug!("Locality too short, skipping lookup");
            return ProvinceResolution::not_found(
                format!(
                    "The locality name '{locality}' is too short. Please provide at least {MIN_LOCALITY_CHARS} characters."
                ),
                Vec::new(),
            );
        }

        let probes = self.provinces.iter().map(|province| self.probe(locality, *province));
        let matches: Vec<RegionMatch> = join_all(probes)
            .await
            .into_iter()
            .flatten()
            .filter(|m| m.found)
            .collect();

        let resolution = decide(locality, matches);
        info!(
            found = resolution.found,
            region = ?resolution.region_code,
            matches = resolution.matches.len(),
            "Locality resolved"
        );
        resolution
    }

    /// Asks about one province. `None` means the probe gave no answer.
    async fn probe(&self, locality: &str, province: Province) -> Option<RegionMatch> {
        match tokio::time::timeout(
            self.timeout,
            self.lookup.locality_exists(locality, province.code),
        )
        .await
        {
            Ok(Ok(found)) => Some(RegionMatch {
                code: province.code.to_string(),
                name: province.name.to_string(),
                found,
            }),
            Ok(Err(e)) => {
                warn!(region = province.code, error = ?e, "Region lookup failed");
                None
            }
            Err(_) => {
                warn!(region = province.code, timeout = ?self.timeout, "Region lookup timed out");
                None
            }
        }
    }
}

fn decide(locality: &str, matches: Vec<RegionMatch>) -> ProvinceResolution {
    match matches.len() {
        0 => ProvinceResolution::not_found(
            format!("The locality '{locality}' was not found in any province."),
            matches,
        ),
        1 => {
            let code = matches[0].code.clone();
            let name = matches[0].name.clone();
            ProvinceResolution {
                found: true,
                message: format!("The locality '{locality}' is in the {name} province (code {code})."),
                region_code: Some(code),
                region_name: Some(name),
                matches,
            }
        }
        _ => {
            let listed = matches
                .iter()
                .map(|m| format!("{} ({})", m.name, m.code))
                .collect::<Vec<_>>()
                .join(", ");
            ProvinceResolution::not_found(
                format!(
                    "The locality '{locality}' exists in several provinces: {listed}. Ask the caller which one they mean."
                ),
                matches,
            )
        }
    }
}
