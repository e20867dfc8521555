//! Maps tools: search_places (Places text search) and get_directions (Routes).

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{Tool, ToolError};

const PLACES_TEXT_SEARCH_URL: &str = "https://places.googleapis.com/v1/places:searchText";
const PLACES_FIELD_MASK: &str =
    "places.displayName,places.formattedAddress,places.rating,places.priceLevel";
const ROUTES_COMPUTE_URL: &str = "https://routes.googleapis.com/directions/v2:computeRoutes";
const ROUTES_FIELD_MASK: &str =
    "routes.distanceMeters,routes.duration,routes.legs.distanceMeters,routes.legs.duration";

const DEFAULT_MAX_RESULTS: u64 = 3;
const MAX_RESULTS_CAP: u64 = 10;

const METERS_PER_MILE: f64 = 1609.344;
const FEET_PER_METER: f64 = 3.28084;

// ── Shared helpers ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct GoogleErrorBody {
    error: Option<GoogleError>,
}

#[derive(Deserialize)]
struct GoogleError {
    message: Option<String>,
}

/// Turn a non-2xx Google API response into an `Upstream` error, preferring
/// the structured `error.message` over raw body text.
async fn upstream_error(response: Response) -> ToolError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<GoogleErrorBody>(&body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.chars().take(300).collect());
    ToolError::Upstream { status, message }
}

fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::Input(format!("'{key}' must be a non-empty string")))
}

// ── SearchPlacesTool ────────────────────────────────────────────────

pub struct SearchPlacesTool {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl SearchPlacesTool {
    pub fn new(client: Client, api_key: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            endpoint: PLACES_TEXT_SEARCH_URL.to_string(),
        }
    }

    /// Point the tool at a different endpoint (local fakes, proxies).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Deserialize)]
struct PlacesResponse {
    #[serde(default)]
    places: Vec<PlaceItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceItem {
    display_name: Option<LocalizedText>,
    formatted_address: Option<String>,
    rating: Option<f64>,
    price_level: Option<Value>,
}

#[derive(Deserialize)]
struct LocalizedText {
    text: String,
}

#[async_trait]
impl Tool for SearchPlacesTool {
    fn name(&self) -> &str {
        "search_places"
    }

    fn description(&self) -> &str {
        "Search venues near a location. Returns name, address, rating and price level."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Venue type query, e.g. 'bowling alley'."
                },
                "location": {
                    "type": "string",
                    "description": "Area to search near, e.g. 'Boston, MA'."
                },
                "max_results": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_RESULTS_CAP,
                    "default": DEFAULT_MAX_RESULTS
                }
            },
            "required": ["query", "location"]
        })
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let query = required_str(args, "query")?;
        let location = args
            .get("location")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_RESULTS)
            .clamp(1, MAX_RESULTS_CAP) as usize;

        let text_query = if location.is_empty() {
            query.to_string()
        } else {
            format!("{query} near {location}")
        };

        debug!(query = %text_query, max_results, "Searching places");

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Goog-Api-Key", &self.api_key)
            .header("X-Goog-FieldMask", PLACES_FIELD_MASK)
            .json(&json!({ "textQuery": text_query }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        let data: PlacesResponse = response.json().await?;
        let places: Vec<Value> = data
            .places
            .into_iter()
            .take(max_results)
            .map(|p| {
                json!({
                    "name": p.display_name.map(|n| n.text),
                    "address": p.formatted_address,
                    "rating": p.rating,
                    "price_level": p.price_level,
                })
            })
            .collect();

        Ok(json!({ "places": places }))
    }
}

// ── DirectionsTool ──────────────────────────────────────────────────

pub struct DirectionsTool {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl DirectionsTool {
    pub fn new(client: Client, api_key: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            endpoint: ROUTES_COMPUTE_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Deserialize)]
struct RoutesResponse {
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Route {
    distance_meters: Option<f64>,
    duration: Option<String>,
    #[serde(default)]
    legs: Vec<Leg>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Leg {
    distance_meters: Option<f64>,
    duration: Option<String>,
}

/// Map the user-facing mode onto a Routes API travel mode. Unknown modes
/// fall back to driving.
fn travel_mode(mode: &str) -> (&'static str, &'static str) {
    match mode {
        "transit" => ("transit", "TRANSIT"),
        "walking" => ("walking", "WALK"),
        _ => ("driving", "DRIVE"),
    }
}

/// Parse a protobuf duration string such as `"754s"`.
fn duration_seconds(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('s').parse().ok()
}

/// `"12 min"`, `"2 hr"`, or `"1 hr 5 min"`. Rounds to the minute, minimum 1.
pub fn format_duration(seconds: f64) -> Option<String> {
    if seconds <= 0.0 {
        return None;
    }
    let minutes = ((seconds / 60.0).round() as u64).max(1);
    if minutes < 60 {
        return Some(format!("{minutes} min"));
    }
    let (hours, rem) = (minutes / 60, minutes % 60);
    Some(if rem == 0 {
        format!("{hours} hr")
    } else {
        format!("{hours} hr {rem} min")
    })
}

/// Miles with one decimal, or feet when under 0.2 miles.
pub fn format_distance(meters: f64) -> Option<String> {
    if meters <= 0.0 {
        return None;
    }
    let miles = meters / METERS_PER_MILE;
    if miles < 0.2 {
        let feet = ((meters * FEET_PER_METER).round() as u64).max(1);
        return Some(format!("{feet} ft"));
    }
    Some(format!("{miles:.1} mi"))
}

#[async_trait]
impl Tool for DirectionsTool {
    fn name(&self) -> &str {
        "get_directions"
    }

    fn description(&self) -> &str {
        "Get travel distance and duration between an origin and destination."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "origin": {
                    "type": "string",
                    "description": "Starting address or place."
                },
                "destination": {
                    "type": "string",
                    "description": "Destination address or place."
                },
                "mode": {
                    "type": "string",
                    "enum": ["driving", "transit", "walking"],
                    "description": "Travel mode."
                }
            },
            "required": ["origin", "destination"]
        })
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let origin = required_str(args, "origin")?;
        let destination = required_str(args, "destination")?;
        let (mode, travel) = travel_mode(args.get("mode").and_then(Value::as_str).unwrap_or_default());

        let mut body = json!({
            "origin": { "address": origin },
            "destination": { "address": destination },
            "travelMode": travel,
        });
        if travel == "DRIVE" {
            body["routingPreference"] = json!("TRAFFIC_AWARE");
        }

        debug!(origin, destination, mode, "Computing route");

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Goog-Api-Key", &self.api_key)
            .header("X-Goog-FieldMask", ROUTES_FIELD_MASK)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        let data: RoutesResponse = response.json().await?;
        let Some(route) = data.routes.into_iter().next() else {
            return Err(ToolError::Input(format!(
                "no {mode} route found from '{origin}' to '{destination}'"
            )));
        };

        // Prefer the first leg, falling back to route totals.
        let leg = route.legs.first();
        let distance_meters = leg
            .and_then(|l| l.distance_meters)
            .or(route.distance_meters);
        let duration_secs = leg
            .and_then(|l| l.duration.as_deref())
            .or(route.duration.as_deref())
            .and_then(duration_seconds);

        Ok(json!({
            "origin": origin,
            "destination": destination,
            "distance": distance_meters.and_then(format_distance),
            "duration": duration_secs.and_then(format_duration),
            "distance_meters": distance_meters,
            "duration_seconds": duration_secs,
            "mode": mode,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), None);
        assert_eq!(format_duration(10.0).as_deref(), Some("1 min"));
        assert_eq!(format_duration(754.0).as_deref(), Some("13 min"));
        assert_eq!(format_duration(3600.0).as_deref(), Some("1 hr"));
        assert_eq!(format_duration(3900.0).as_deref(), Some("1 hr 5 min"));
    }

    #[test]
    fn test_format_distance() {
        assert_eq!(format_distance(-1.0), None);
        assert_eq!(format_distance(100.0).as_deref(), Some("328 ft"));
        assert_eq!(format_distance(1609.344).as_deref(), Some("1.0 mi"));
        assert_eq!(format_distance(8046.72).as_deref(), Some("5.0 mi"));
    }

    #[test]
    fn test_duration_seconds_parsing() {
        assert_eq!(duration_seconds("754s"), Some(754.0));
        assert_eq!(duration_seconds("12.5s"), Some(12.5));
        assert_eq!(duration_seconds("soon"), None);
    }

    #[test]
    fn test_travel_mode_fallback() {
        assert_eq!(travel_mode("walking"), ("walking", "WALK"));
        assert_eq!(travel_mode("transit"), ("transit", "TRANSIT"));
        assert_eq!(travel_mode("hovercraft"), ("driving", "DRIVE"));
    }

    #[tokio::test]
    async fn test_search_places_against_fake_api() {
        let app = Router::new().route(
            "/search",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["x-goog-api-key"], "k");
                assert_eq!(headers["x-goog-fieldmask"], PLACES_FIELD_MASK);
                assert_eq!(body["textQuery"], "coffee near Times Square");
                Json(json!({
                    "places": [
                        {"displayName": {"text": "Joe"}, "formattedAddress": "1 Broadway",
                         "rating": 4.5, "priceLevel": "PRICE_LEVEL_MODERATE"},
                        {"displayName": {"text": "Blue"}, "formattedAddress": "2 Broadway"},
                        {"displayName": {"text": "Third"}}
                    ]
                }))
            }),
        );
        let base = spawn(app).await;
        let tool = SearchPlacesTool::new(Client::new(), "k").with_endpoint(format!("{base}/search"));

        let out = tool
            .execute(&args(json!({"query": "coffee", "location": "Times Square", "max_results": 2})))
            .await
            .unwrap();

        let places = out["places"].as_array().unwrap();
        assert_eq!(places.len(), 2);
        assert_eq!(places[0]["name"], "Joe");
        assert_eq!(places[0]["price_level"], "PRICE_LEVEL_MODERATE");
        assert_eq!(places[1]["rating"], Value::Null);
    }

    #[tokio::test]
    async fn test_search_places_upstream_error() {
        let app = Router::new().route(
            "/search",
            post(|| async {
                (
                    StatusCode::FORBIDDEN,
                    Json(json!({"error": {"message": "API key not valid"}})),
                )
            }),
        );
        let base = spawn(app).await;
        let tool = SearchPlacesTool::new(Client::new(), "bad").with_endpoint(format!("{base}/search"));

        let err = tool
            .execute(&args(json!({"query": "coffee", "location": "NYC"})))
            .await
            .unwrap_err();
        match err {
            ToolError::Upstream { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "API key not valid");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_directions_against_fake_api() {
        let app = Router::new().route(
            "/routes",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["travelMode"], "DRIVE");
                assert_eq!(body["routingPreference"], "TRAFFIC_AWARE");
                Json(json!({
                    "routes": [{
                        "distanceMeters": 9000,
                        "duration": "900s",
                        "legs": [{"distanceMeters": 8046.72, "duration": "754s"}]
                    }]
                }))
            }),
        );
        let base = spawn(app).await;
        let tool = DirectionsTool::new(Client::new(), "k").with_endpoint(format!("{base}/routes"));

        let out = tool
            .execute(&args(json!({"origin": "A", "destination": "B"})))
            .await
            .unwrap();

        assert_eq!(out["mode"], "driving");
        assert_eq!(out["distance"], "5.0 mi");
        assert_eq!(out["duration"], "13 min");
        assert_eq!(out["duration_seconds"], 754.0);
    }

    #[tokio::test]
    async fn test_directions_no_route() {
        let app = Router::new().route("/routes", post(|| async { Json(json!({})) }));
        let base = spawn(app).await;
        let tool = DirectionsTool::new(Client::new(), "k").with_endpoint(format!("{base}/routes"));

        let err = tool
            .execute(&args(json!({"origin": "A", "destination": "Atlantis", "mode": "walking"})))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("walking"));
    }
}
