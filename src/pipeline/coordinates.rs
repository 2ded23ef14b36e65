use serde_json::{Map, Value, json};

use crate::engine::api::{ApiRegistry, GEOCODING, is_success};
use crate::engine::context::ExecutionContext;
use crate::stats::as_f64;

/// Result keys that carry a facility location, with their
/// latitude/longitude/address columns, in lookup order.
const LOCATION_SOURCES: [(&str, &str, &str, &str); 3] = [
    ("lgu_facility", "cutr_facl_ycrd", "cutr_facl_xcrd", "cutr_facl_addr"),
    ("demographics", "cutr_facl_ycrd", "cutr_facl_xcrd", "cutr_facl_addr"),
    ("facility", "slta_ycrd", "slta_xcrd", "slta_addr"),
];

fn first_record(value: &Value) -> Option<&Map<String, Value>> {
    match value {
        Value::Array(rows) => rows.first()?.as_object(),
        Value::Object(record) => Some(record),
        _ => None,
    }
}

pub fn has_coordinates(ctx: &ExecutionContext) -> bool {
    ctx.has_seed("lat") && ctx.has_seed("lng")
}

/// Fills missing `lat`/`lng`/`address` seeds from the first record of a known
/// facility result. Seeds already set by the request win.
pub fn discover_from_results(ctx: &mut ExecutionContext) -> bool {
    for (key, lat_col, lng_col, addr_col) in LOCATION_SOURCES {
        let Some(record) = ctx.get(key).and_then(first_record) else {
            continue;
        };
        let lat = record.get(lat_col).and_then(as_f64);
        let lng = record.get(lng_col).and_then(as_f64);
        let address = record
            .get(addr_col)
            .and_then(Value::as_str)
            .filter(|a| !a.trim().is_empty())
            .map(str::to_string);

        if !ctx.has_seed("address")
            && let Some(address) = address
        {
            ctx.set_seed("address", Value::String(address));
        }
        if !has_coordinates(ctx)
            && let (Some(lat), Some(lng)) = (lat, lng)
        {
            tracing::info!(source = key, lat, lng, "Coordinates taken from query results");
            ctx.set_seed("lat", json!(lat));
            ctx.set_seed("lng", json!(lng));
        }
        if has_coordinates(ctx) {
            return true;
        }
    }
    has_coordinates(ctx)
}

fn location_of(value: &Value) -> Option<(f64, f64)> {
    [Some(value), value.get("location"), value.get("data")]
        .into_iter()
        .flatten()
        .find_map(|v| Some((v.get("lat").and_then(as_f64)?, v.get("lng").and_then(as_f64)?)))
}

/// Asks the registered geocoding backend for the `address` seed.
pub async fn geocode(apis: &ApiRegistry, ctx: &mut ExecutionContext) -> bool {
    if has_coordinates(ctx) {
        return true;
    }
    if !apis.contains(GEOCODING) {
        return false;
    }
    let Some(address) = ctx.seeds().get("address").and_then(Value::as_str).map(str::to_string) else {
        return false;
    };

    let mut params = Map::new();
    params.insert("address".to_string(), Value::String(address.clone()));
    let result = apis.call(GEOCODING, &params).await;
    match location_of(&result).filter(|_| is_success(&result)) {
        Some((lat, lng)) => {
            tracing::info!(%address, lat, lng, "Address geocoded");
            ctx.set_seed("lat", json!(lat));
            ctx.set_seed("lng", json!(lng));
            true
        }
        None => {
            tracing::warn!(%address, "Geocoding returned no location");
            false
        }
    }
}
