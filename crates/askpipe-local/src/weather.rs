//! Current-conditions lookup against OpenWeatherMap.
//!
//! A city miss (HTTP 404) is a terminal answer the caller may cache; every
//! other failure mode means the provider is unusable for this request and
//! the caller should fall back to a plain web search.

use serde::Deserialize;

use askpipe_core::{Error, Result};

const WEATHER_TIMEOUT_MS: u64 = 10_000;

fn openweather_api_key_from_env() -> Option<String> {
    std::env::var("ASKPIPE_OPENWEATHER_API_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("OPENWEATHER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
}

fn openweather_endpoint_from_env() -> Option<String> {
    std::env::var("ASKPIPE_OPENWEATHER_ENDPOINT")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// How a weather lookup ended. Only `Report` and `CityNotFound` carry text
/// suitable for the model context.
#[derive(Debug, Clone, PartialEq)]
pub enum WeatherOutcome {
    Report { text: String, source_url: String },
    CityNotFound { text: String },
    Unavailable { reason: String },
}

#[derive(Debug, Clone)]
pub struct OpenWeather {
    client: reqwest::Client,
    api_key: String,
}

impl OpenWeather {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = openweather_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured(
                "missing ASKPIPE_OPENWEATHER_API_KEY (or OPENWEATHER_API_KEY)".to_string(),
            )
        })?;
        Ok(Self { client, api_key })
    }

    fn endpoint() -> String {
        openweather_endpoint_from_env()
            .unwrap_or_else(|| "https://api.openweathermap.org/data/2.5/weather".to_string())
    }

    pub async fn current(&self, city: &str, timeout_ms: Option<u64>) -> WeatherOutcome {
        let timeout_ms = timeout_ms.unwrap_or(WEATHER_TIMEOUT_MS).clamp(1_000, 60_000);

        let resp = self
            .client
            .get(Self::endpoint())
            .query(&[
                ("q", city),
                ("appid", self.api_key.as_str()),
                ("units", "metric"),
            ])
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                return WeatherOutcome::Unavailable {
                    reason: format!("weather request failed: {e}"),
                }
            }
        };

        match resp.status().as_u16() {
            200 => {}
            404 => {
                return WeatherOutcome::CityNotFound {
                    text: format!(
                        "Weather query: '{city}'\nCity not found. Please check the spelling."
                    ),
                }
            }
            401 => {
                return WeatherOutcome::Unavailable {
                    reason: "invalid OpenWeather API key".to_string(),
                }
            }
            code => {
                return WeatherOutcome::Unavailable {
                    reason: format!("OpenWeather API error (status {code})"),
                }
            }
        }

        let payload: WeatherPayload = match resp.json().await {
            Ok(p) => p,
            Err(e) => {
                return WeatherOutcome::Unavailable {
                    reason: format!("weather response malformed: {e}"),
                }
            }
        };

        let Some(text) = format_report(&payload) else {
            return WeatherOutcome::Unavailable {
                reason: "weather response missing conditions".to_string(),
            };
        };

        let source_url = match payload.id {
            Some(id) => format!("https://openweathermap.org/city/{id}"),
            None => "https://openweathermap.org".to_string(),
        };

        WeatherOutcome::Report { text, source_url }
    }
}

#[derive(Debug, Deserialize)]
struct WeatherPayload {
    weather: Vec<WeatherCondition>,
    main: WeatherMain,
    wind: WeatherWind,
    sys: WeatherSys,
    name: String,
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WeatherCondition {
    main: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct WeatherMain {
    temp: f64,
    feels_like: f64,
    humidity: u32,
}

#[derive(Debug, Deserialize)]
struct WeatherWind {
    speed: f64,
}

#[derive(Debug, Deserialize)]
struct WeatherSys {
    country: String,
}

/// First letter upper, rest lower. Provider condition strings arrive in
/// mixed casing ("Clear", "clear sky", "CLEAR").
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

fn format_report(p: &WeatherPayload) -> Option<String> {
    let cond = p.weather.first()?;
    let temp = p.main.temp.round() as i64;
    let feels_like = p.main.feels_like.round() as i64;
    // Provider reports wind in m/s; present km/h.
    let wind_kmh = (p.wind.speed * 3.6).round() as i64;

    Some(format!(
        "Current Weather in {}, {}:\n\
         - Conditions: {} ({})\n\
         - Temperature: {temp}\u{b0}C (feels like {feels_like}\u{b0}C)\n\
         - Humidity: {}%\n\
         - Wind Speed: {wind_kmh} km/h",
        p.name,
        p.sys.country,
        capitalize(&cond.main),
        capitalize(&cond.description),
        p.main.humidity,
    ))
}
