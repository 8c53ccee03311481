//! Three-day forecast lookups against the RapidAPI weather service.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::macros::format_description;
use time::Date;
use uuid::Uuid;

use crate::error::Result;

pub const DEFAULT_BASE_URL: &str = "https://weatherapi-com.p.rapidapi.com";
pub const DEFAULT_API_HOST: &str = "weatherapi-com.p.rapidapi.com";
const FORECAST_DAYS: &str = "3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastLocation {
    pub name: String,
    pub region: String,
    pub country: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forecast {
    pub id: Uuid,
    /// Calendar day, `YYYY-MM-DD`.
    pub date: String,
    pub max_temp_c: f64,
    pub min_temp_c: f64,
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherReport {
    pub location: ForecastLocation,
    pub forecasts: Vec<Forecast>,
}

#[derive(Deserialize)]
struct ApiResponse {
    location: ForecastLocation,
    forecast: ApiForecast,
}

#[derive(Deserialize)]
struct ApiForecast {
    forecastday: Vec<ApiDay>,
}

#[derive(Deserialize)]
struct ApiDay {
    date: String,
    day: ApiDayDetails,
}

#[derive(Deserialize)]
struct ApiDayDetails {
    maxtemp_c: f64,
    mintemp_c: f64,
    condition: ApiCondition,
}

#[derive(Deserialize)]
struct ApiCondition {
    text: String,
}

fn is_calendar_date(raw: &str) -> bool {
    Date::parse(raw, format_description!("[year]-[month]-[day]")).is_ok()
}

fn into_report(api: ApiResponse) -> WeatherReport {
    let forecasts = api
        .forecast
        .forecastday
        .into_iter()
        .filter_map(|day| {
            if !is_calendar_date(&day.date) {
                tracing::warn!(date = %day.date, "skipping forecast day with invalid date");
                return None;
            }
            Some(Forecast {
                id: Uuid::new_v4(),
                date: day.date,
                max_temp_c: day.day.maxtemp_c,
                min_temp_c: day.day.mintemp_c,
                condition: day.day.condition.text,
            })
        })
        .collect();
    WeatherReport {
        location: api.location,
        forecasts,
    }
}

/// Decode a raw forecast response body.
pub fn parse_report(body: &str) -> Result<WeatherReport> {
    Ok(into_report(serde_json::from_str(body)?))
}

#[derive(Clone)]
pub struct WeatherClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_host: String,
}

impl WeatherClient {
    pub fn new(base_url: &str, api_key: &str, api_host: &str) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_host: api_host.to_string(),
        })
    }

    pub async fn forecast(&self, city: &str) -> Result<WeatherReport> {
        let url = format!("{}/forecast.json", self.base_url);
        let api: ApiResponse = self
            .http
            .get(url)
            .query(&[("q", city), ("days", FORECAST_DAYS)])
            .header("X-RapidAPI-Key", &self.api_key)
            .header("X-RapidAPI-Host", &self.api_host)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let report = into_report(api);
        tracing::debug!(%city, days = report.forecasts.len(), "forecast fetched");
        Ok(report)
    }
}
