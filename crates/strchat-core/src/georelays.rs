//! Nearest-relay lookup for geohash chats over a cached CSV dataset of
//! `host,lat,lon` rows.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

use crate::config::write_atomic;
use crate::error::ConfigError;

const CACHE_FILE: &str = "georelays_cache.csv";
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(20);
const EARTH_RADIUS_KM: f64 = 6371.0;

pub trait NearestRelays: Send + Sync {
    /// Up to `n` relay URLs closest to the point, nearest first.
    fn nearest(&self, lat: f64, lon: f64, n: usize) -> Vec<String>;
}

#[derive(Debug, thiserror::Error)]
pub enum GeoRelayError {
    #[error("fetch georelay dataset: {0}")]
    Http(#[from] reqwest::Error),
    #[error("georelay dataset server answered {0}")]
    Status(u16),
    #[error("parse georelay dataset: {0}")]
    Csv(#[from] csv::Error),
    #[error("georelay dataset has no usable rows")]
    Empty,
    #[error("write georelay cache: {0}")]
    Cache(#[from] ConfigError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeoRelay {
    pub url: String,
    pub lat: f64,
    pub lon: f64,
}

/// Parse the dataset. A leading header row (first column mentioning
/// "relay") is skipped, as are rows without numeric coordinates.
pub fn parse_csv(data: &str) -> Result<Vec<GeoRelay>, GeoRelayError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data.as_bytes());

    let mut relays = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() < 3 {
            continue;
        }
        let host_col = &record[0];
        if idx == 0 && host_col.to_lowercase().contains("relay") {
            continue;
        }
        let host = host_col
            .trim_start_matches("wss://")
            .trim_start_matches("ws://")
            .trim_end_matches('/');
        if host.is_empty() {
            continue;
        }
        let (Ok(lat), Ok(lon)) = (record[1].parse::<f64>(), record[2].parse::<f64>()) else {
            continue;
        };
        relays.push(GeoRelay {
            url: format!("wss://{host}"),
            lat,
            lon,
        });
    }
    Ok(relays)
}

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lon2 - lon1).to_radians();
    let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// In-memory copy of the dataset backed by a CSV cache file in the config
/// directory, refreshed over HTTP when older than a day.
pub struct GeoRelayDirectory {
    cache_path: PathBuf,
    dataset_url: String,
    relays: RwLock<Vec<GeoRelay>>,
    http: reqwest::Client,
}

impl GeoRelayDirectory {
    pub fn new(config_dir: &Path, dataset_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            cache_path: config_dir.join(CACHE_FILE),
            dataset_url: dataset_url.to_string(),
            relays: RwLock::new(Vec::new()),
            http,
        }
    }

    pub fn len(&self) -> usize {
        self.relays.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the cache file if present. Returns whether anything was loaded.
    pub fn load_cached(&self) -> bool {
        let Ok(raw) = std::fs::read_to_string(&self.cache_path) else {
            return false;
        };
        match parse_csv(&raw) {
            Ok(relays) if !relays.is_empty() => {
                tracing::debug!(count = relays.len(), "loaded georelay cache");
                *self.relays.write() = relays;
                true
            }
            Ok(_) => false,
            Err(err) => {
                tracing::warn!("georelay cache unreadable: {err}");
                false
            }
        }
    }

    pub fn cache_is_fresh(&self) -> bool {
        std::fs::metadata(&self.cache_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age < CACHE_TTL)
    }

    /// Download the dataset, replace the in-memory copy and rewrite the cache.
    pub async fn refresh(&self) -> Result<usize, GeoRelayError> {
        let resp = self.http.get(&self.dataset_url).send().await?;
        if !resp.status().is_success() {
            return Err(GeoRelayError::Status(resp.status().as_u16()));
        }
        let body = resp.text().await?;
        let relays = parse_csv(&body)?;
        if relays.is_empty() {
            return Err(GeoRelayError::Empty);
        }
        write_atomic(&self.cache_path, body.as_bytes())?;
        let count = relays.len();
        *self.relays.write() = relays;
        tracing::info!(count, "georelay dataset refreshed");
        Ok(count)
    }

    pub fn closest(&self, lat: f64, lon: f64, n: usize) -> Vec<String> {
        let relays = self.relays.read();
        let mut ranked: Vec<(f64, &GeoRelay)> = relays
            .iter()
            .map(|r| (haversine_km(lat, lon, r.lat, r.lon), r))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        ranked.into_iter().take(n).map(|(_, r)| r.url.clone()).collect()
    }
}

impl NearestRelays for GeoRelayDirectory {
    fn nearest(&self, lat: f64, lon: f64, n: usize) -> Vec<String> {
        self.closest(lat, lon, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strchat_test_utils::{CannedResponse, closed_port_url, spawn_one_shot_server};

    const SAMPLE: &str = "Relay URL,Latitude,Longitude\n\
        wss://oslo.example/,59.91,10.75\n\
        ws://paris.example,48.85,2.35\n\
        sydney.example,-33.87,151.21\n\
        broken.example,not,numbers\n";

    #[test]
    fn parses_rows_and_normalizes_hosts() {
        let relays = parse_csv(SAMPLE).unwrap();
        let urls: Vec<&str> = relays.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            ["wss://oslo.example", "wss://paris.example", "wss://sydney.example"]
        );
    }

    #[test]
    fn haversine_known_distance() {
        // Paris to London is roughly 344 km
        let d = haversine_km(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((d - 344.0).abs() < 5.0, "{d}");
        assert!(haversine_km(10.0, 10.0, 10.0, 10.0).abs() < 1e-9);
    }

    #[test]
    fn closest_orders_by_distance() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_FILE), SAMPLE).unwrap();
        let geo = GeoRelayDirectory::new(dir.path(), "http://unused");
        assert!(geo.load_cached());
        assert!(geo.cache_is_fresh());
        // Copenhagen: Oslo is nearer than Paris
        assert_eq!(
            geo.nearest(55.68, 12.57, 2),
            vec!["wss://oslo.example".to_string(), "wss://paris.example".to_string()]
        );
        assert_eq!(geo.nearest(-37.8, 144.9, 1), vec!["wss://sydney.example".to_string()]);
    }

    #[tokio::test]
    async fn refresh_downloads_and_writes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (base, rx) = spawn_one_shot_server(CannedResponse::csv(SAMPLE));
        let geo = GeoRelayDirectory::new(dir.path(), &format!("{base}/nostr_relays.csv"));
        assert!(geo.is_empty());

        assert_eq!(geo.refresh().await.unwrap(), 3);
        assert_eq!(geo.len(), 3);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(CACHE_FILE)).unwrap(),
            SAMPLE
        );
        let req = rx.recv().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/nostr_relays.csv");
    }

    #[tokio::test]
    async fn refresh_reports_http_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _rx) = spawn_one_shot_server(CannedResponse::status("500 Internal Server Error"));
        let geo = GeoRelayDirectory::new(dir.path(), &base);
        assert!(matches!(geo.refresh().await, Err(GeoRelayError::Status(500))));

        let geo = GeoRelayDirectory::new(dir.path(), &closed_port_url());
        assert!(matches!(geo.refresh().await, Err(GeoRelayError::Http(_))));
        assert!(!dir.path().join(CACHE_FILE).exists());
    }
}
