use serde::Serialize;

use crate::geo::{GeoPoint, haversine_km, round_km};

const BASE_FARE: f64 = 50.0;
const PER_KM: f64 = 10.0;
const AVERAGE_SPEED_KMH: f64 = 30.0;
const HANDLING_MIN: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quote {
    pub distance_km: f64,
    pub estimated_time_min: u32,
    pub price: f64,
}

/// Price, trip distance and delivery time for a pickup/dropoff pair.
pub fn quote(pickup: &GeoPoint, dropoff: &GeoPoint, weight_kg: f64) -> Quote {
    let distance_km = round_km(haversine_km(pickup, dropoff));

    Quote {
        distance_km,
        estimated_time_min: estimated_time_min(distance_km),
        price: (BASE_FARE + PER_KM * distance_km + weight_surcharge(weight_kg)).ceil(),
    }
}

pub fn estimated_time_min(distance_km: f64) -> u32 {
    (distance_km / AVERAGE_SPEED_KMH * 60.0 + HANDLING_MIN).round() as u32
}

pub fn weight_surcharge(weight_kg: f64) -> f64 {
    match weight_kg {
        w if w <= 1.0 => 0.0,
        w if w <= 5.0 => 20.0,
        w if w <= 10.0 => 50.0,
        w if w <= 20.0 => 100.0,
        w => 100.0 + (w - 20.0) * 5.0,
    }
}
