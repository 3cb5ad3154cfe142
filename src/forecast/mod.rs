pub mod sun;
pub mod weather;

pub use weather::{WeatherClient, WeatherPoint};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::Config;
use crate::domain::TimeSlot;
use crate::prices::store::truncate_to_hour;
use crate::prices::PriceDocument;
use sun::solar_altitude;
use weather::{point_for, symbol_has_snow};

/// Produces the sorted hour-resolution slot sequence the optimiser consumes,
/// fusing market prices, sun geometry, weather and the miner-derived load
/// estimate.
pub struct ForecastBuilder {
    latitude: f64,
    longitude: f64,
    pv_peak_kw: f64,
    import_operator_fee: f64,
    import_delivery_fee: f64,
    export_operator_fee: f64,
    price_limit: f64,
    miner_eco_power_w: f64,
    miner_standby_power_w: f64,
    base_load_kw: f64,
    horizon: u32,
}

impl ForecastBuilder {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            latitude: cfg.latitude,
            longitude: cfg.longitude,
            pv_peak_kw: cfg.pv_peak_power,
            import_operator_fee: cfg.import_operator_fee,
            import_delivery_fee: cfg.import_delivery_fee,
            export_operator_fee: cfg.export_operator_fee,
            price_limit: cfg.price_limit,
            miner_eco_power_w: cfg.miner_eco_power,
            miner_standby_power_w: cfg.miner_standby_power,
            base_load_kw: cfg.base_load,
            horizon: cfg.mpc_horizon_hours,
        }
    }

    /// Build slots for the horizon starting at the hour containing `now`.
    ///
    /// Slots without a price are dropped; a missing weather series degrades
    /// every slot to zero solar. The result is sorted by `hour` with each
    /// hour appearing at most once.
    pub fn build(
        &self,
        now: DateTime<Utc>,
        prices: Option<&PriceDocument>,
        weather: Option<&[WeatherPoint]>,
        current_pv_kw: f64,
        fleet_size: usize,
    ) -> Vec<TimeSlot> {
        let Some(doc) = prices else {
            warn!("no price document available, forecast is empty");
            return Vec::new();
        };
        if weather.is_none() {
            warn!("no weather forecast available, assuming zero solar");
        }

        let base = truncate_to_hour(now);
        let mut slots = Vec::with_capacity(self.horizon as usize);
        for i in 0..self.horizon {
            let timestamp = base + Duration::hours(i as i64);
            let Some(spot) = doc.hour_avg(timestamp) else {
                debug!(hour = i, %timestamp, "no market price for slot, dropping");
                continue;
            };

            // EUR/MWh -> EUR/kWh after fees; export may go negative.
            let import_price = (spot + self.import_operator_fee + self.import_delivery_fee) / 1000.0;
            let export_price = (spot - self.export_operator_fee) / 1000.0;

            let point = weather.and_then(|points| point_for(points, timestamp));
            let solar_forecast = self.solar_forecast(timestamp, i, point, current_pv_kw, weather.is_some());
            let load_forecast = self.load_forecast(spot, fleet_size);

            slots.push(TimeSlot {
                hour: i,
                timestamp,
                import_price,
                export_price,
                solar_forecast,
                load_forecast,
                cloud_coverage: point.map(|p| p.cloud_fraction).unwrap_or(0.0),
                weather_symbol: point.map(|p| p.symbol.clone()).unwrap_or_default(),
            });
        }
        slots
    }

    fn solar_forecast(
        &self,
        t: DateTime<Utc>,
        hour: u32,
        point: Option<&WeatherPoint>,
        current_pv_kw: f64,
        have_weather: bool,
    ) -> f64 {
        if !have_weather {
            return 0.0;
        }
        if let Some(p) = point {
            if symbol_has_snow(&p.symbol) {
                return 0.0;
            }
        }

        let sin_alt = solar_altitude(self.latitude, self.longitude, t).sin();
        if sin_alt <= 0.0 {
            // Before sunrise or after sunset.
            return 0.0;
        }

        // Panels still covered after snowfall: the plant reads dark while
        // geometry alone predicts real output.
        if hour == 1 && current_pv_kw < 0.1 && self.pv_peak_kw * sin_alt * 0.5 > 1.0 {
            debug!(%t, "PV dark despite clear-sky estimate, assuming snow cover");
            return 0.0;
        }

        let mut factor = sin_alt;
        if let Some(p) = point {
            factor *= 1.0 - 0.9 * p.cloud_fraction;
        }
        self.pv_peak_kw * factor.max(0.0)
    }

    /// Miner-policy load estimate: every miner runs Eco below the price
    /// limit, standby above it, plus the household base load.
    fn load_forecast(&self, spot: f64, fleet_size: usize) -> f64 {
        let per_miner_w = if spot <= self.price_limit {
            self.miner_eco_power_w
        } else {
            self.miner_standby_power_w
        };
        fleet_size as f64 * per_miner_w / 1000.0 + self.base_load_kw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::prices::{PricePoint, PriceSeries};
    use chrono::TimeZone;

    fn builder() -> ForecastBuilder {
        ForecastBuilder::from_config(&test_config())
    }

    fn noon() -> DateTime<Utc> {
        // 11:00 UTC is close to solar noon in Prague.
        Utc.with_ymd_and_hms(2025, 6, 21, 11, 0, 0).unwrap()
    }

    fn doc_with_prices(start: DateTime<Utc>, prices: &[f64]) -> PriceDocument {
        PriceDocument {
            interval_start: start,
            interval_end: start + Duration::hours(prices.len() as i64),
            series: vec![PriceSeries {
                start,
                end: start + Duration::hours(prices.len() as i64),
                resolution: Duration::minutes(60),
                points: prices
                    .iter()
                    .enumerate()
                    .map(|(i, &p)| PricePoint {
                        position: i as u32 + 1,
                        amount: p,
                    })
                    .collect(),
            }],
            cache_expiry: start + Duration::hours(24),
        }
    }

    fn clear_sky(start: DateTime<Utc>, hours: u32) -> Vec<WeatherPoint> {
        (0..hours)
            .map(|i| WeatherPoint {
                time: start + Duration::hours(i as i64),
                cloud_fraction: 0.0,
                symbol: "clearsky_day".to_string(),
            })
            .collect()
    }

    #[test]
    fn slots_are_sorted_with_unique_hours_and_adjusted_prices() {
        let start = noon();
        let doc = doc_with_prices(start, &[100.0; 36]);
        let weather = clear_sky(start, 36);
        let slots = builder().build(start, Some(&doc), Some(&weather), 3.0, 0);

        assert_eq!(slots.len(), 36);
        for window in slots.windows(2) {
            assert!(window[0].hour < window[1].hour);
        }
        // 100 EUR/MWh spot + 10 + 15 fees => 0.125 EUR/kWh import.
        assert!((slots[0].import_price - 0.125).abs() < 1e-12);
        // 100 - 5 => 0.095 EUR/kWh export.
        assert!((slots[0].export_price - 0.095).abs() < 1e-12);
    }

    #[test]
    fn missing_prices_drop_slots() {
        let start = noon();
        // Only 6 hours of prices for a 36 hour horizon.
        let doc = doc_with_prices(start, &[100.0; 6]);
        let weather = clear_sky(start, 36);
        let slots = builder().build(start, Some(&doc), Some(&weather), 3.0, 0);
        assert_eq!(slots.len(), 6);
        assert!(slots.iter().all(|s| s.hour < 6));
    }

    #[test]
    fn no_price_document_means_empty_forecast() {
        let slots = builder().build(noon(), None, None, 0.0, 0);
        assert!(slots.is_empty());
    }

    #[test]
    fn missing_weather_degrades_to_zero_solar() {
        let start = noon();
        let doc = doc_with_prices(start, &[100.0; 6]);
        let slots = builder().build(start, Some(&doc), None, 3.0, 0);
        assert!(slots.iter().all(|s| s.solar_forecast == 0.0));
        assert_eq!(slots.len(), 6);
    }

    #[test]
    fn clear_noon_produces_solar_and_night_does_not() {
        let start = noon();
        let doc = doc_with_prices(start, &[100.0; 24]);
        let weather = clear_sky(start, 24);
        let slots = builder().build(start, Some(&doc), Some(&weather), 3.0, 0);
        assert!(slots[0].solar_forecast > 5.0, "noon slot should be sunny");
        // 13 hours later it is midnight.
        assert_eq!(slots[13].solar_forecast, 0.0);
    }

    #[test]
    fn snow_symbol_forces_zero_solar() {
        let start = noon();
        let doc = doc_with_prices(start, &[100.0; 3]);
        let mut weather = clear_sky(start, 3);
        weather[0].symbol = "heavysnow".to_string();
        let slots = builder().build(start, Some(&doc), Some(&weather), 3.0, 0);
        assert_eq!(slots[0].solar_forecast, 0.0);
        assert!(slots[1].solar_forecast > 0.0);
    }

    #[test]
    fn dark_plant_under_clear_sky_flags_snow_cover_for_next_hour() {
        let start = noon();
        let doc = doc_with_prices(start, &[100.0; 3]);
        let weather = clear_sky(start, 3);
        // Plant reads dark although ~9.9 kW peak * sin(alt) * 0.5 >> 1 kW.
        let slots = builder().build(start, Some(&doc), Some(&weather), 0.0, 0);
        assert_eq!(slots[1].solar_forecast, 0.0);
        // Other hours are untouched by the snow-cover heuristic.
        assert!(slots[0].solar_forecast > 0.0);
        assert!(slots[2].solar_forecast > 0.0);
    }

    #[test]
    fn cloud_cover_attenuates_solar() {
        let start = noon();
        let doc = doc_with_prices(start, &[100.0; 1]);
        let clear = clear_sky(start, 1);
        let mut cloudy = clear_sky(start, 1);
        cloudy[0].cloud_fraction = 1.0;
        let b = builder();
        let clear_slot = &b.build(start, Some(&doc), Some(&clear), 3.0, 0)[0];
        let cloudy_slot = &b.build(start, Some(&doc), Some(&cloudy), 3.0, 0)[0];
        assert!((cloudy_slot.solar_forecast - clear_slot.solar_forecast * 0.1).abs() < 1e-9);
    }

    #[test]
    fn load_forecast_follows_the_price_limit() {
        let start = noon();
        // Limit in the test config is 60 EUR/MWh.
        let doc = doc_with_prices(start, &[50.0, 70.0]);
        let weather = clear_sky(start, 2);
        let slots = builder().build(start, Some(&doc), Some(&weather), 3.0, 2);
        // Below limit: 2 miners * 1500 W + 0.3 kW base.
        assert!((slots[0].load_forecast - 3.3).abs() < 1e-9);
        // Above limit: 2 miners * 40 W standby + base.
        assert!((slots[1].load_forecast - 0.38).abs() < 1e-9);
    }
}
