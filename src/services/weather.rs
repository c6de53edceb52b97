//! Forecast push.
//!
//! Numeric lists travel as consecutive big-endian `u16` values; temperatures
//! are in Kelvin.

use super::framing::ChannelWriter;
use super::{ServiceError, SyncContext};
use crate::domain::channels::{
    Channel, WEATHER_CHANNELS, WEATHER_CITY, WEATHER_IDS, WEATHER_MAX_TEMPS, WEATHER_MIN_TEMPS,
};
use crate::infrastructure::link::{DeviceLink, LinkError};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Forecast {
    pub city: String,
    /// Condition codes, one per day.
    pub condition_ids: Vec<u16>,
    pub min_temps_kelvin: Vec<u16>,
    pub max_temps_kelvin: Vec<u16>,
}

/// Big-endian `u16` values, back to back.
pub fn encode_u16_list(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// Celsius to whole Kelvin, saturating at the `u16` range.
pub fn celsius_to_kelvin(celsius: f32) -> u16 {
    (celsius + 273.15).round().clamp(0.0, f32::from(u16::MAX)) as u16
}

#[derive(Clone, Default)]
pub struct WeatherService {
    last: Arc<Mutex<Option<Forecast>>>,
    writer: Arc<ChannelWriter>,
}

impl WeatherService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels() -> &'static [Channel] {
        WEATHER_CHANNELS
    }

    /// Forecast the watch last accepted.
    pub fn last(&self) -> Option<Forecast> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Write all four channels; stops at the first failing write. The
    /// forecast is kept for reconnects only when every write succeeded.
    pub async fn push_forecast(
        &self,
        link: &dyn DeviceLink,
        forecast: &Forecast,
    ) -> Result<(), LinkError> {
        self.write_forecast(link, forecast).await?;
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(forecast.clone());
        Ok(())
    }

    async fn write_forecast(&self, link: &dyn DeviceLink, forecast: &Forecast) -> Result<(), LinkError> {
        let writer = &self.writer;
        writer
            .send(link, &WEATHER_CITY, forecast.city.as_bytes())
            .await?;
        writer
            .send(link, &WEATHER_IDS, &encode_u16_list(&forecast.condition_ids))
            .await?;
        writer
            .send(
                link,
                &WEATHER_MIN_TEMPS,
                &encode_u16_list(&forecast.min_temps_kelvin),
            )
            .await?;
        writer
            .send(
                link,
                &WEATHER_MAX_TEMPS,
                &encode_u16_list(&forecast.max_temps_kelvin),
            )
            .await
    }

    pub(super) async fn sync(&mut self, ctx: &SyncContext) -> Result<(), ServiceError> {
        self.writer.reset();
        if let Some(forecast) = self.last() {
            self.write_forecast(ctx.link.as_ref(), &forecast).await?;
            info!("Forecast for {} restored", forecast.city);
        }
        Ok(())
    }

    pub(super) fn unsync(&mut self) {}
}
