//! # Postal-Code Reference Enrichment
//!
//! Joins every policy against the geographic reference table keyed by
//! postal code. The join is a strict precondition of the whole pipeline:
//! a policy whose postal code does not resolve cannot be featurized, so an
//! unresolved code aborts the run rather than silently dropping rows.
//!
//! Two postal codes retired by the postal service are still present in
//! policy data; [`POSTAL_CORRECTIONS`] patches them into the reference with
//! the attributes of their replacement before the join.

use crate::data::{GeoTable, PolicyTable};
use ahash::AHashMap;
use thiserror::Error;

/// Retired postal codes and the codes that absorbed them. The retired code
/// is resolved with the replacement's coordinates, city and density.
pub const POSTAL_CORRECTIONS: [(&str, &str); 2] = [("07005", "07006"), ("17110", "17111")];

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error(
        "{count} policies reference postal codes absent from the geographic reference: {codes:?}. Enrichment must resolve every policy exactly once."
    )]
    UnresolvedPostalCodes { count: usize, codes: Vec<String> },
}

/// A policy table joined 1:1 with its geographic reference. All columns are
/// row-aligned with `policies`.
#[derive(Debug, Clone)]
pub struct EnrichedTable {
    pub policies: PolicyTable,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    pub city: Vec<String>,
    pub population: Vec<f64>,
    pub density: Vec<f64>,
}

impl EnrichedTable {
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Builds a new table holding the given rows, in the given order.
    pub fn take(&self, rows: &[usize]) -> EnrichedTable {
        fn pick<T: Clone>(source: &[T], rows: &[usize]) -> Vec<T> {
            rows.iter().map(|&i| source[i].clone()).collect()
        }
        let p = &self.policies;
        EnrichedTable {
            policies: PolicyTable {
                policy_id: pick(&p.policy_id, rows),
                user_id: pick(&p.user_id, rows),
                postal_code: pick(&p.postal_code, rows),
                region: pick(&p.region, rows),
                product: pick(&p.product, rows),
                payment_method: pick(&p.payment_method, rows),
                floor_area_sqft: pick(&p.floor_area_sqft, rows),
                coast_km: pick(&p.coast_km, rows),
                fire_station_rank: pick(&p.fire_station_rank, rows),
                prior_policies: pick(&p.prior_policies, rows),
                age: pick(&p.age, rows),
                has_alarm: pick(&p.has_alarm, rows),
                covers_electronics: pick(&p.covers_electronics, rows),
                claim: p.claim.as_ref().map(|c| pick(c, rows)),
            },
            latitude: pick(&self.latitude, rows),
            longitude: pick(&self.longitude, rows),
            city: pick(&self.city, rows),
            population: pick(&self.population, rows),
            density: pick(&self.density, rows),
        }
    }
}

/// Row of the reference lookup built from [`GeoTable`].
#[derive(Debug, Clone)]
struct GeoAttributes {
    latitude: f64,
    longitude: f64,
    city: String,
    population: f64,
    density: f64,
}

/// Joins the policy table against the geographic reference.
///
/// Every input row is preserved exactly once. Any unresolved postal code is
/// a fatal [`EnrichError::UnresolvedPostalCodes`].
pub fn enrich(policies: PolicyTable, geo: &GeoTable) -> Result<EnrichedTable, EnrichError> {
    let mut lookup: AHashMap<&str, GeoAttributes> = AHashMap::with_capacity(geo.len());
    for i in 0..geo.len() {
        lookup.insert(
            geo.postal_code[i].as_str(),
            GeoAttributes {
                latitude: geo.latitude[i],
                longitude: geo.longitude[i],
                city: geo.city[i].clone(),
                population: geo.population[i],
                density: geo.density[i],
            },
        );
    }

    // Patch retired codes with their replacement's attributes. A correction
    // only applies when the replacement itself is in the reference.
    for (retired, replacement) in POSTAL_CORRECTIONS {
        if lookup.contains_key(retired) {
            continue;
        }
        if let Some(attrs) = lookup.get(replacement) {
            let attrs = attrs.clone();
            log::debug!("Patching retired postal code {retired} with attributes of {replacement}");
            lookup.insert(retired, attrs);
        }
    }

    let n = policies.len();
    let mut latitude = Vec::with_capacity(n);
    let mut longitude = Vec::with_capacity(n);
    let mut city = Vec::with_capacity(n);
    let mut population = Vec::with_capacity(n);
    let mut density = Vec::with_capacity(n);
    let mut unresolved: Vec<String> = Vec::new();

    for code in &policies.postal_code {
        match lookup.get(code.as_str()) {
            Some(attrs) => {
                latitude.push(attrs.latitude);
                longitude.push(attrs.longitude);
                city.push(attrs.city.clone());
                population.push(attrs.population);
                density.push(attrs.density);
            }
            None => {
                if !unresolved.contains(code) {
                    unresolved.push(code.clone());
                }
            }
        }
    }

    if !unresolved.is_empty() {
        return Err(EnrichError::UnresolvedPostalCodes {
            count: n - latitude.len(),
            codes: unresolved,
        });
    }

    debug_assert_eq!(latitude.len(), n);
    log::info!("Enriched {n} policies against {} reference postal codes", geo.len());

    Ok(EnrichedTable {
        policies,
        latitude,
        longitude,
        city,
        population,
        density,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with_codes(codes: &[&str]) -> PolicyTable {
        let n = codes.len();
        PolicyTable {
            policy_id: (0..n).map(|i| format!("P{i}")).collect(),
            user_id: (0..n).map(|i| format!("U{i}")).collect(),
            postal_code: codes.iter().map(|c| c.to_string()).collect(),
            region: vec!["R1".to_string(); n],
            product: vec!["basic".to_string(); n],
            payment_method: vec![Some("card".to_string()); n],
            floor_area_sqft: vec![None; n],
            coast_km: vec![Some(10.0); n],
            fire_station_rank: vec![1.0; n],
            prior_policies: vec![0.0; n],
            age: vec![Some(40.0); n],
            has_alarm: vec![0.0; n],
            covers_electronics: vec![Some(1.0); n],
            claim: Some(vec![0.0; n]),
        }
    }

    fn geo_with_codes(codes: &[&str]) -> GeoTable {
        let n = codes.len();
        GeoTable {
            postal_code: codes.iter().map(|c| c.to_string()).collect(),
            latitude: (0..n).map(|i| 40.0 + i as f64).collect(),
            longitude: (0..n).map(|i| -3.0 - i as f64).collect(),
            city: (0..n).map(|i| format!("C{i}")).collect(),
            population: vec![10_000.0; n],
            density: vec![800.0; n],
        }
    }

    #[test]
    fn join_preserves_row_count() {
        let policies = policy_with_codes(&["28001", "28002", "28001"]);
        let geo = geo_with_codes(&["28001", "28002", "28003"]);
        let enriched = enrich(policies, &geo).unwrap();
        assert_eq!(enriched.len(), 3);
        assert_eq!(enriched.city, vec!["C0", "C1", "C0"]);
        assert_eq!(enriched.latitude, vec![40.0, 41.0, 40.0]);
    }

    #[test]
    fn unresolved_code_is_fatal() {
        let policies = policy_with_codes(&["28001", "99999"]);
        let geo = geo_with_codes(&["28001"]);
        let err = enrich(policies, &geo).unwrap_err();
        match err {
            EnrichError::UnresolvedPostalCodes { count, codes } => {
                assert_eq!(count, 1);
                assert_eq!(codes, vec!["99999".to_string()]);
            }
        }
    }

    #[test]
    fn retired_codes_resolve_to_replacement_attributes() {
        let (retired, replacement) = POSTAL_CORRECTIONS[0];
        let policies = policy_with_codes(&[retired]);
        let geo = geo_with_codes(&[replacement]);
        let enriched = enrich(policies, &geo).unwrap();
        assert_eq!(enriched.city, vec!["C0"]);
        assert_eq!(enriched.latitude, vec![40.0]);
    }

    #[test]
    fn take_reorders_and_filters_rows() {
        let policies = policy_with_codes(&["28001", "28002", "28003"]);
        let geo = geo_with_codes(&["28001", "28002", "28003"]);
        let enriched = enrich(policies, &geo).unwrap();
        let subset = enriched.take(&[2, 0]);
        assert_eq!(subset.len(), 2);
        assert_eq!(subset.policies.policy_id, vec!["P2", "P0"]);
        assert_eq!(subset.city, vec!["C2", "C0"]);
    }
}
