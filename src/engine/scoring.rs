use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::models::fleet::Vehicle;
use crate::models::order::PackageDetails;

const WEIGHT_WEIGHT: f64 = 0.40;
const VOLUME_WEIGHT: f64 = 0.40;
const DIMENSION_WEIGHT: f64 = 0.20;

/// Flat 2 minutes per km. A placeholder carried over for compatibility, not
/// a traffic-aware ETA model.
const MINUTES_PER_KM: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Utilization {
    pub weight: f64,
    pub volume: f64,
    pub dimension: f64,
}

impl Utilization {
    pub fn score(&self) -> f64 {
        (self.weight * WEIGHT_WEIGHT)
            + (self.volume * VOLUME_WEIGHT)
            + (self.dimension * DIMENSION_WEIGHT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub eligible: bool,
    pub rank: f64,
}

pub struct RankInput<'a> {
    pub package: &'a PackageDetails,
    pub vehicle: &'a Vehicle,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankOrder {
    LowerFirst,
    HigherFirst,
}

pub trait RankingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn order(&self) -> RankOrder;

    fn rank(&self, input: &RankInput<'_>) -> f64;

    /// `Less` when `a` should be offered before `b`.
    fn compare(&self, a: f64, b: f64) -> Ordering {
        match self.order() {
            RankOrder::LowerFirst => a.total_cmp(&b),
            RankOrder::HigherFirst => b.total_cmp(&a),
        }
    }
}

/// Closest driver first. Default for the sequential offer protocol.
pub struct DistanceStrategy;

impl RankingStrategy for DistanceStrategy {
    fn name(&self) -> &'static str {
        "distance"
    }

    fn order(&self) -> RankOrder {
        RankOrder::LowerFirst
    }

    fn rank(&self, input: &RankInput<'_>) -> f64 {
        input.distance_km
    }
}

/// Tightest-fitting vehicle first. Used by the instant matcher.
pub struct UtilizationStrategy;

impl RankingStrategy for UtilizationStrategy {
    fn name(&self) -> &'static str {
        "utilization"
    }

    fn order(&self) -> RankOrder {
        RankOrder::HigherFirst
    }

    fn rank(&self, input: &RankInput<'_>) -> f64 {
        utilization(input.package, input.vehicle).score()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingKind {
    Distance,
    Utilization,
}

impl RankingKind {
    pub fn strategy(&self) -> &'static dyn RankingStrategy {
        match self {
            RankingKind::Distance => &DistanceStrategy,
            RankingKind::Utilization => &UtilizationStrategy,
        }
    }
}

impl fmt::Display for RankingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.strategy().name())
    }
}

impl FromStr for RankingKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "distance" => Ok(RankingKind::Distance),
            "utilization" => Ok(RankingKind::Utilization),
            other => Err(format!(
                "unknown ranking strategy: {other}, expected distance or utilization"
            )),
        }
    }
}

pub fn is_eligible(package: &PackageDetails, vehicle: &Vehicle) -> bool {
    let fits = |wanted: Option<f64>, bound: f64| wanted.is_none_or(|value| value <= bound);

    vehicle.max_weight_kg >= package.weight_kg
        && fits(package.volume_m3, vehicle.max_volume_m3)
        && package
            .dimensions()
            .into_iter()
            .zip(vehicle.dimensions())
            .all(|(wanted, bound)| fits(wanted, bound))
}

pub fn utilization(package: &PackageDetails, vehicle: &Vehicle) -> Utilization {
    let dimension_ratios: Vec<f64> = package
        .dimensions()
        .into_iter()
        .zip(vehicle.dimensions())
        .filter_map(|(wanted, bound)| wanted.map(|value| ratio(value, bound)))
        .collect();

    let dimension = if dimension_ratios.is_empty() {
        0.0
    } else {
        dimension_ratios.iter().sum::<f64>() / dimension_ratios.len() as f64
    };

    Utilization {
        weight: ratio(package.weight_kg, vehicle.max_weight_kg),
        volume: package
            .volume_m3
            .map(|volume| ratio(volume, vehicle.max_volume_m3))
            .unwrap_or(0.0),
        dimension,
    }
}

pub fn estimated_arrival_min(distance_km: f64) -> u32 {
    (distance_km.max(0.0) * MINUTES_PER_KM).round() as u32
}

pub fn score(input: &RankInput<'_>, strategy: &dyn RankingStrategy) -> Score {
    Score {
        eligible: is_eligible(input.package, input.vehicle),
        rank: strategy.rank(input),
    }
}

fn ratio(wanted: f64, bound: f64) -> f64 {
    if bound > 0.0 { wanted / bound } else { 0.0 }
}
