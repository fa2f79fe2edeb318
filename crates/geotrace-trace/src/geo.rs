use async_trait::async_trait;
use geotrace_model::Location;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_GEO_URL: &str = "http://ip-api.com/json";

/// Resolves an address to an approximate location.
///
/// Lookups are best-effort: any failure is reported as `None` and never
/// retried.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn locate(&self, ip: &str) -> Option<Location>;
}

/// Client for an ip-api.com compatible JSON endpoint.
#[derive(Debug, Clone)]
pub struct IpApiLocator {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl IpApiLocator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn url_for(&self, ip: &str) -> String {
        format!("{}/{}", self.base_url, ip)
    }

    async fn fetch(&self, ip: &str) -> reqwest::Result<IpApiResponse> {
        self.client
            .get(self.url_for(ip))
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<IpApiResponse>()
            .await
    }
}

impl Default for IpApiLocator {
    fn default() -> Self {
        Self::new(DEFAULT_GEO_URL, Duration::from_secs(3))
    }
}

#[async_trait]
impl GeoLocator for IpApiLocator {
    async fn locate(&self, ip: &str) -> Option<Location> {
        match self.fetch(ip).await {
            Ok(response) => response.into_location(),
            Err(err) => {
                debug!(%ip, error = %err, "geolocation lookup failed");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

impl IpApiResponse {
    fn into_location(self) -> Option<Location> {
        if self.status != "success" {
            return None;
        }
        Some(Location {
            lat: self.lat?,
            lng: self.lon?,
            city: self.city.unwrap_or_default(),
            country: self.country.unwrap_or_default(),
        })
    }
}

/// Locator that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLocator;

#[async_trait]
impl GeoLocator for NoopLocator {
    async fn locate(&self, _ip: &str) -> Option<Location> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(body: &str) -> Option<Location> {
        serde_json::from_str::<IpApiResponse>(body)
            .ok()
            .and_then(IpApiResponse::into_location)
    }

    #[test]
    fn success_body_maps_to_location() {
        let body = r#"{"status":"success","country":"United States","city":"Mountain View","lat":37.4,"lon":-122.1,"query":"8.8.8.8"}"#;
        let location = decode(body).unwrap();
        assert_eq!(location.city, "Mountain View");
        assert_eq!(location.country, "United States");
        assert!((location.lng + 122.1).abs() < 1e-9);
    }

    #[test]
    fn fail_status_is_absent() {
        let body = r#"{"status":"fail","message":"private range","query":"10.0.0.1"}"#;
        assert!(decode(body).is_none());
    }

    #[test]
    fn missing_coordinates_are_absent() {
        assert!(decode(r#"{"status":"success","city":"Nowhere"}"#).is_none());
    }

    #[test]
    fn base_url_trailing_slash_is_ignored() {
        let locator = IpApiLocator::new("http://geo.test/json/", Duration::from_secs(1));
        assert_eq!(locator.url_for("1.1.1.1"), "http://geo.test/json/1.1.1.1");
    }

    #[tokio::test]
    async fn unreachable_service_is_absent() {
        let locator = IpApiLocator::new("http://127.0.0.1:9", Duration::from_millis(500));
        assert!(locator.locate("8.8.8.8").await.is_none());
    }
}
