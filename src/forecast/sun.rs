//! Sun altitude for solar-production estimation.
//!
//! A compact declination / hour-angle model (NOAA approximation). It ignores
//! refraction and elevation and is accurate to well under a degree, which is
//! plenty for scaling a PV forecast.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::f64::consts::PI;

/// Sun altitude above the horizon in radians at `t` for the given location.
/// Negative below the horizon.
pub fn solar_altitude(lat_deg: f64, lon_deg: f64, t: DateTime<Utc>) -> f64 {
    let hour = t.hour() as f64 + t.minute() as f64 / 60.0 + t.second() as f64 / 3600.0;
    let gamma = 2.0 * PI / 365.0 * (t.ordinal() as f64 - 1.0 + (hour - 12.0) / 24.0);

    let declination = 0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin()
        - 0.006758 * (2.0 * gamma).cos()
        + 0.000907 * (2.0 * gamma).sin()
        - 0.002697 * (3.0 * gamma).cos()
        + 0.00148 * (3.0 * gamma).sin();

    // Equation of time in minutes.
    let eqtime = 229.18
        * (0.000075 + 0.001868 * gamma.cos()
            - 0.032077 * gamma.sin()
            - 0.014615 * (2.0 * gamma).cos()
            - 0.040849 * (2.0 * gamma).sin());

    let true_solar_minutes = hour * 60.0 + eqtime + 4.0 * lon_deg;
    let hour_angle = (true_solar_minutes / 4.0 - 180.0).to_radians();

    let lat = lat_deg.to_radians();
    (lat.sin() * declination.sin() + lat.cos() * declination.cos() * hour_angle.cos()).asin()
}

/// Fraction of peak PV output attributable to sun geometry alone:
/// `max(0, sin altitude)`.
pub fn sun_factor(lat_deg: f64, lon_deg: f64, t: DateTime<Utc>) -> f64 {
    solar_altitude(lat_deg, lon_deg, t).sin().max(0.0)
}
