use indexmap::IndexMap;
use serde_json::{Map, Value};

use super::{
    AirQualityBlock, ChartBlock, ChartData, ChartType, ContentBlock, GeoPoint, ImageBlock,
    MapBlock, TableBlock,
};
use crate::bundles::{BundleCatalog, ResolvedPlan};
use crate::bundles::template::scalar_text;
use crate::engine::api::{ApiRun, is_success};
use crate::engine::context::ExecutionContext;
use crate::stats::demographics::DemographicsStats;
use crate::stats::review::ReviewStats;
use crate::stats::{StatKind, Stats, as_f64, decimal_text, round_to};

const DEFAULT_MAP_ZOOM: u32 = 15;
const MAX_MAP_ZOOM: f64 = 21.0;

const VISIT_HOURS: [(&str, &str); 6] = [
    ("06:00", "ct_06_rt"),
    ("09:00", "ct_09_rt"),
    ("12:00", "ct_12_rt"),
    ("15:00", "ct_15_rt"),
    ("18:00", "ct_18_rt"),
    ("21:00", "ct_21_rt"),
];

const WEEKDAYS: [(&str, &str); 7] = [
    ("Mon", "ct_week_01"),
    ("Tue", "ct_week_02"),
    ("Wed", "ct_week_03"),
    ("Thu", "ct_week_04"),
    ("Fri", "ct_week_05"),
    ("Sat", "ct_week_06"),
    ("Sun", "ct_week_07"),
];

const NO_DATA: &str = "No data available.";

fn config_str<'a>(config: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn chart_type(config: &Map<String, Value>, default: ChartType) -> ChartType {
    config_str(config, "type").map_or(default, ChartType::parse)
}

fn review_chart(stats: &ReviewStats, config: &Map<String, Value>) -> ContentBlock {
    let (labels, values): (Vec<String>, Vec<f64>) = (1..=5u8)
        .rev()
        .map(|stars| {
            let label = if stars == 1 {
                "1 star".to_string()
            } else {
                format!("{stars} stars")
            };
            let count = stats.bucket(stars).map_or(0, |b| b.count);
            (label, count as f64)
        })
        .unzip();

    ContentBlock::Chart(ChartBlock {
        id: None,
        chart_type: chart_type(config, ChartType::Bar),
        title: config_str(config, "title")
            .unwrap_or("Review rating distribution")
            .to_string(),
        data: ChartData { labels, values },
        description: stats.summary.clone(),
    })
}

fn demographics_charts(stats: &DemographicsStats, config: &Map<String, Value>) -> Vec<ContentBlock> {
    if !stats.has_data {
        return Vec::new();
    }
    let kind = chart_type(config, ChartType::Doughnut);
    let split: Vec<&str> = match config.get("split").and_then(Value::as_array) {
        Some(parts) => parts.iter().filter_map(Value::as_str).collect(),
        None => vec!["age", "gender"],
    };

    let mut blocks = Vec::new();
    for part in split {
        match part {
            "age" => {
                let Some(ages) = &stats.age_distribution else {
                    continue;
                };
                blocks.push(ContentBlock::Chart(ChartBlock {
                    id: None,
                    chart_type: kind,
                    title: "Visitors by age group".to_string(),
                    data: ChartData {
                        labels: ages.keys().cloned().collect(),
                        values: ages.values().copied().collect(),
                    },
                    description: stats.summary.clone(),
                }));
            }
            "gender" => {
                let Some(gender) = &stats.gender_distribution else {
                    continue;
                };
                let (male, female) = (decimal_text(gender.male), decimal_text(gender.female));
                let description = if gender.female > gender.male {
                    format!("Female visitors lead at {female}% against {male}% male.")
                } else if gender.male > gender.female {
                    format!("Male visitors lead at {male}% against {female}% female.")
                } else {
                    format!("Male and female visitors are even at {male}%.")
                };
                blocks.push(ContentBlock::Chart(ChartBlock {
                    id: None,
                    chart_type: kind,
                    title: "Visitors by gender".to_string(),
                    data: ChartData {
                        labels: vec!["Male".to_string(), "Female".to_string()],
                        values: vec![gender.male, gender.female],
                    },
                    description,
                }));
            }
            other => tracing::debug!(split = %other, "Unknown demographics split"),
        }
    }
    blocks
}

/// Block shapes built straight from a bundle's saved rows, selected by the
/// `transform` key of its block config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowTransform {
    MonthlyTable,
    VisitTime,
    Weekday,
}

impl RowTransform {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "monthly_table" => Some(RowTransform::MonthlyTable),
            "visit_time" => Some(RowTransform::VisitTime),
            "weekday" => Some(RowTransform::Weekday),
            _ => None,
        }
    }

    fn build(self, rows: &[Value], config: &Map<String, Value>) -> ContentBlock {
        match self {
            RowTransform::MonthlyTable => monthly_table(rows, config),
            RowTransform::VisitTime => {
                visit_time_chart(rows.first().and_then(Value::as_object), config)
            }
            RowTransform::Weekday => weekday_chart(rows.first().and_then(Value::as_object), config),
        }
    }
}

/// `202410` (number or text) as `2024-10`; empty values as `-`.
fn month_label(value: Option<&Value>) -> String {
    let text = value.map(scalar_text).unwrap_or_default();
    if text.is_empty() || text == "0" {
        return "-".to_string();
    }
    let year: String = text.chars().take(4).collect();
    let month: String = text.chars().skip(4).take(2).collect();
    format!("{year}-{month}")
}

/// Whole number with thousands separators: `320000` as `320,000`.
fn grouped(value: f64) -> String {
    let digits = (value.round_ties_even() as i64).to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn table_cell(value: Option<&Value>) -> String {
    match value {
        None => "0".to_string(),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v >= 1000.0 => grouped(v),
            _ => n.to_string(),
        },
        Some(other) => match scalar_text(other) {
            text if text.is_empty() || text == "false" => "-".to_string(),
            text => text,
        },
    }
}

fn monthly_table(rows: &[Value], config: &Map<String, Value>) -> ContentBlock {
    let month_column = config_str(config, "month_column").unwrap_or("cri_ym");
    let columns = string_list(config.get("columns")).unwrap_or_default();
    let labels = string_list(config.get("labels")).unwrap_or_else(|| columns.clone());

    let mut headers = vec!["Month".to_string()];
    headers.extend(labels);

    let rows: Vec<Vec<String>> = rows
        .iter()
        .filter_map(Value::as_object)
        .map(|record| {
            let mut row = vec![month_label(record.get(month_column))];
            row.extend(columns.iter().map(|c| table_cell(record.get(c))));
            row
        })
        .collect();
    let description = if rows.is_empty() {
        NO_DATA.to_string()
    } else {
        format!("{} months of data", rows.len())
    };

    ContentBlock::Table(TableBlock {
        id: None,
        title: config_str(config, "title").unwrap_or("Monthly overview").to_string(),
        headers,
        rows,
        description,
    })
}

fn rate(record: &Map<String, Value>, column: &str) -> f64 {
    round_to(record.get(column).and_then(as_f64).unwrap_or(0.0), 1)
}

fn rate_data(record: &Map<String, Value>, columns: &[(&str, &str)]) -> ChartData {
    let (labels, values) = columns
        .iter()
        .map(|&(label, column)| (label.to_string(), rate(record, column)))
        .unzip();
    ChartData { labels, values }
}

/// Label and value of the first maximum.
fn peak(data: &ChartData) -> Option<(&str, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &value) in data.values.iter().enumerate() {
        if best.is_none_or(|(_, top)| value > top) {
            best = Some((i, value));
        }
    }
    best.map(|(i, value)| (data.labels[i].as_str(), value))
}

fn empty_rate_chart(config: &Map<String, Value>, default_title: &str) -> ChartBlock {
    ChartBlock {
        id: None,
        chart_type: chart_type(config, ChartType::Bar),
        title: config_str(config, "title").unwrap_or(default_title).to_string(),
        data: ChartData::default(),
        description: NO_DATA.to_string(),
    }
}

fn visit_time_chart(record: Option<&Map<String, Value>>, config: &Map<String, Value>) -> ContentBlock {
    let mut chart = empty_rate_chart(config, "Visits by time of day");
    if let Some(record) = record {
        chart.data = rate_data(record, &VISIT_HOURS);
        if let Some((label, value)) = peak(&chart.data) {
            chart.description = format!(
                "{label} visits are the most common at {}%.",
                decimal_text(value)
            );
        }
    }
    ContentBlock::Chart(chart)
}

fn weekday_chart(record: Option<&Map<String, Value>>, config: &Map<String, Value>) -> ContentBlock {
    let mut chart = empty_rate_chart(config, "Visits by weekday");
    if let Some(record) = record {
        chart.data = rate_data(record, &WEEKDAYS);
        let (weekend, weekday) = (rate(record, "we_rt"), rate(record, "wk_rt"));
        let (we_text, wk_text) = (decimal_text(weekend), decimal_text(weekday));
        chart.description = if weekend > weekday {
            format!("Weekend visits ({we_text}%) outnumber weekdays ({wk_text}%).")
        } else {
            format!("Weekday visits ({wk_text}%) outnumber weekends ({we_text}%).")
        };
    }
    ContentBlock::Chart(chart)
}

/// Rows a transform reads: the config's `source` key, else the first step
/// the bundle saved. `None` when no row list was stored under that key.
fn transform_rows<'a>(
    plan: &ResolvedPlan,
    bundle: &str,
    config: &Map<String, Value>,
    ctx: &'a ExecutionContext,
) -> Option<&'a [Value]> {
    let key = match config_str(config, "source") {
        Some(source) => source.to_string(),
        None => plan.queries_for(bundle).next()?.spec.save_as.clone(),
    };
    ctx.get(&key)?.as_array().map(Vec::as_slice)
}

fn geo_point(value: &Value) -> Option<GeoPoint> {
    Some(GeoPoint {
        lat: value.get("lat").and_then(as_f64)?,
        lng: value.get("lng").and_then(as_f64)?,
    })
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().map(scalar_text).collect())
}

fn records_table(
    records: &[Value],
    config: &Map<String, Value>,
    title: String,
) -> Option<ContentBlock> {
    let first = records.first()?.as_object()?;
    let headers = string_list(config.get("columns")).unwrap_or_else(|| {
        first
            .iter()
            .filter(|(_, v)| !v.is_object() && !v.is_array())
            .map(|(k, _)| k.clone())
            .collect()
    });
    let rows = records
        .iter()
        .filter_map(Value::as_object)
        .map(|record| {
            headers
                .iter()
                .map(|h| record.get(h).map(scalar_text).unwrap_or_default())
                .collect()
        })
        .collect();

    Some(ContentBlock::Table(TableBlock {
        id: None,
        title,
        headers,
        rows,
        description: config_str(config, "description").unwrap_or_default().to_string(),
    }))
}

/// Block for one successful API payload, chosen by the shape of its data.
fn api_block(data: &Value, config: &Map<String, Value>, default_title: &str) -> Option<ContentBlock> {
    let outer = data.as_object()?;
    let payload = match outer.get("data") {
        Some(Value::Object(inner)) => inner,
        _ => outer,
    };
    let title = config_str(config, "title").unwrap_or(default_title).to_string();

    if let Some(center) = payload.get("center").and_then(geo_point) {
        return Some(ContentBlock::Map(MapBlock {
            id: None,
            title,
            center,
            zoom: payload
                .get("zoom")
                .and_then(as_f64)
                .filter(|z| z.is_finite())
                .map_or(DEFAULT_MAP_ZOOM, |z| z.round().clamp(0.0, MAX_MAP_ZOOM) as u32),
            markers: payload
                .get("markers")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        }));
    }

    if payload.contains_key("aqi") {
        let mut data = payload.clone();
        data.remove("success");
        return Some(ContentBlock::AirQuality(AirQualityBlock {
            id: None,
            title,
            data,
        }));
    }

    if let Some(url) = ["url", "static_map_url"]
        .into_iter()
        .find_map(|key| payload.get(key).and_then(Value::as_str))
    {
        return Some(ContentBlock::Image(ImageBlock {
            id: None,
            url: url.to_string(),
            alt: title,
            caption: config_str(config, "caption").unwrap_or_default().to_string(),
        }));
    }

    if let Some(places) = payload.get("places").and_then(Value::as_array) {
        return records_table(places, config, title);
    }

    if let (Some(headers), Some(rows)) = (
        string_list(payload.get("headers")),
        payload.get("rows").and_then(Value::as_array),
    ) {
        let rows = rows
            .iter()
            .filter_map(|row| string_list(Some(row)))
            .collect();
        return Some(ContentBlock::Table(TableBlock {
            id: None,
            title,
            headers,
            rows,
            description: config_str(config, "description").unwrap_or_default().to_string(),
        }));
    }

    None
}

fn api_config<'a>(
    catalog: &'a BundleCatalog,
    empty: &'a Map<String, Value>,
    name: &'a str,
) -> (&'a Map<String, Value>, &'a str) {
    match catalog.api_bundles.get(name) {
        Some(bundle) if !bundle.description.is_empty() => {
            (bundle.block.as_ref().unwrap_or(empty), bundle.description.as_str())
        }
        Some(bundle) => (bundle.block.as_ref().unwrap_or(empty), name),
        None => (empty, name),
    }
}

/// Derives data blocks from normalized stats, row transforms and API results,
/// in that order. Failed API results yield no block.
#[tracing::instrument(
    name = "blocks derive",
    skip_all,
    fields(blocks.count)
)]
pub fn derive_blocks(
    plan: &ResolvedPlan,
    stats: &IndexMap<StatKind, Stats>,
    catalog: &BundleCatalog,
    api_runs: &[ApiRun],
    ctx: &ExecutionContext,
) -> Vec<ContentBlock> {
    let empty = Map::new();
    let mut blocks = Vec::new();

    for (kind, stat) in stats {
        let config = plan
            .stat_owners
            .get(kind)
            .and_then(|bundle| plan.block_configs.get(bundle))
            .unwrap_or(&empty);
        match stat {
            Stats::Review(review) => blocks.push(review_chart(review, config)),
            Stats::Demographics(demo) => blocks.extend(demographics_charts(demo, config)),
        }
    }

    for (bundle, config) in &plan.block_configs {
        let Some(name) = config_str(config, "transform") else {
            continue;
        };
        let Some(transform) = RowTransform::parse(name) else {
            tracing::debug!(bundle = %bundle, transform = %name, "Unknown block transform");
            continue;
        };
        match transform_rows(plan, bundle, config, ctx) {
            Some(rows) => blocks.push(transform.build(rows, config)),
            None => tracing::debug!(bundle = %bundle, "Transform source missing, skipping"),
        }
    }

    for run in api_runs {
        let Some(value) = ctx.get(&run.save_as).filter(|v| is_success(v)) else {
            continue;
        };
        match value.get("api_results").and_then(Value::as_array) {
            Some(members) => {
                for member in members {
                    let name = member.get("bundle").and_then(Value::as_str).unwrap_or_default();
                    let Some(data) = member.get("data").filter(|d| is_success(d)) else {
                        continue;
                    };
                    let (config, title) = api_config(catalog, &empty, name);
                    blocks.extend(api_block(data, config, title));
                }
            }
            None => {
                let (config, title) = api_config(catalog, &empty, &run.bundle);
                blocks.extend(api_block(value, config, title));
            }
        }
    }

    tracing::Span::current().record("blocks.count", blocks.len());
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::compute_stats;
    use serde_json::json;

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_review_chart_labels_and_counts() {
        let rows = vec![
            json!({"sns_content_rating": 5}),
            json!({"sns_content_rating": 5}),
            json!({"sns_content_rating": 3}),
        ];
        let stats = crate::stats::review::review_stats(&rows);
        let ContentBlock::Chart(chart) = review_chart(&stats, &Map::new()) else {
            panic!("expected chart");
        };
        assert_eq!(chart.chart_type, ChartType::Bar);
        assert_eq!(chart.title, "Review rating distribution");
        assert_eq!(chart.data.labels[0], "5 stars");
        assert_eq!(chart.data.labels[4], "1 star");
        assert_eq!(chart.data.values, vec![2.0, 0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_review_chart_honours_block_config() {
        let stats = crate::stats::review::review_stats(&[]);
        let block = review_chart(&stats, &config(json!({"type": "line", "title": "Ratings"})));
        let ContentBlock::Chart(chart) = block else {
            panic!("expected chart");
        };
        assert_eq!(chart.chart_type, ChartType::Line);
        assert_eq!(chart.title, "Ratings");
    }

    #[test]
    fn test_demographics_split_and_missing_data() {
        let rows = vec![json!({"m_20": 10.0, "f_20": 20.0, "m_30": 5.0, "f_30": 5.0})];
        let stats = crate::stats::demographics::demographics_stats(&rows);

        let both = demographics_charts(&stats, &Map::new());
        assert_eq!(both.len(), 2);
        assert!(both.iter().all(ContentBlock::is_ratio_chart));

        let age_only = demographics_charts(&stats, &config(json!({"split": ["age"]})));
        assert_eq!(age_only.len(), 1);
        assert_eq!(age_only[0].title(), "Visitors by age group");

        let none = crate::stats::demographics::demographics_stats(&[]);
        assert!(demographics_charts(&none, &Map::new()).is_empty());
    }

    #[test]
    fn test_gender_description_keeps_decimal() {
        let rows = vec![json!({"m_20": 25.0, "f_20": 25.0})];
        let stats = crate::stats::demographics::demographics_stats(&rows);
        let charts = demographics_charts(&stats, &config(json!({"split": ["gender"]})));
        assert_eq!(charts[0].description(), "Male and female visitors are even at 25.0%.");
    }

    #[test]
    fn test_monthly_table_formats_months_and_numbers() {
        let rows = vec![
            json!({"cri_ym": 202410, "total": 320000, "rate": 12.5}),
            json!({"cri_ym": "202411", "total": 999, "rate": null}),
            json!({"cri_ym": null, "rate": ""}),
        ];
        let block = monthly_table(
            &rows,
            &config(json!({"columns": ["total", "rate"], "labels": ["Visitors", "Share"]})),
        );
        let ContentBlock::Table(table) = block else {
            panic!("expected table");
        };
        assert_eq!(table.title, "Monthly overview");
        assert_eq!(table.headers, vec!["Month", "Visitors", "Share"]);
        assert_eq!(table.rows[0], vec!["2024-10", "320,000", "12.5"]);
        assert_eq!(table.rows[1], vec!["2024-11", "999", "-"]);
        assert_eq!(table.rows[2], vec!["-", "0", "-"]);
        assert_eq!(table.description, "3 months of data");

        let ContentBlock::Table(empty) = monthly_table(&[], &Map::new()) else {
            panic!("expected table");
        };
        assert_eq!(empty.headers, vec!["Month"]);
        assert_eq!(empty.description, NO_DATA);
    }

    #[test]
    fn test_grouped_thousands() {
        assert_eq!(grouped(1000.0), "1,000");
        assert_eq!(grouped(1234567.4), "1,234,567");
        assert_eq!(grouped(100000.0), "100,000");
    }

    #[test]
    fn test_visit_time_chart_picks_first_peak() {
        let record = json!({"ct_06_rt": 5, "ct_12_rt": "30.04", "ct_18_rt": 30.0, "ct_21_rt": null});
        let ContentBlock::Chart(chart) =
            visit_time_chart(record.as_object(), &Map::new())
        else {
            panic!("expected chart");
        };
        assert_eq!(chart.chart_type, ChartType::Bar);
        assert_eq!(chart.data.labels.len(), 6);
        assert_eq!(chart.data.values, vec![5.0, 0.0, 30.0, 0.0, 30.0, 0.0]);
        assert_eq!(chart.description, "12:00 visits are the most common at 30.0%.");

        let ContentBlock::Chart(empty) = visit_time_chart(None, &Map::new()) else {
            panic!("expected chart");
        };
        assert!(empty.data.labels.is_empty());
        assert_eq!(empty.description, NO_DATA);
    }

    #[test]
    fn test_weekday_chart_compares_weekend_and_weekday() {
        let record = json!({
            "ct_week_01": 10, "ct_week_06": 25.55, "ct_week_07": 20,
            "we_rt": 45.55, "wk_rt": 54.45
        });
        let ContentBlock::Chart(chart) = weekday_chart(record.as_object(), &Map::new()) else {
            panic!("expected chart");
        };
        assert_eq!(chart.data.labels, vec!["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"]);
        assert_eq!(chart.data.values[0], 10.0);
        assert_eq!(chart.data.values[6], 20.0);
        assert!(chart.description.starts_with("Weekday visits"));

        let weekend = json!({"we_rt": 60, "wk_rt": 40});
        let ContentBlock::Chart(chart) = weekday_chart(weekend.as_object(), &Map::new()) else {
            panic!("expected chart");
        };
        assert_eq!(chart.description, "Weekend visits (60.0%) outnumber weekdays (40.0%).");
    }

    #[test]
    fn test_derive_blocks_runs_row_transforms() {
        let catalog = BundleCatalog::from_json(
            r#"{"bundles": {
                "monthly": {
                    "queries": [["filter", "facility_monthly", {"slta_cd": "A"}, 12, "monthly"]],
                    "block": {"transform": "monthly_table", "columns": ["visitor_cnt"]}
                },
                "hours": {
                    "queries": [["filter", "persona_metrics", {"slta_cd": "A"}, 1, "persona"]],
                    "block": {"transform": "visit_time"}
                },
                "days": {
                    "requires": ["hours"],
                    "queries": [],
                    "block": {"transform": "weekday", "source": "persona"}
                },
                "unknown": {
                    "queries": [["filter", "t", {}, 1, "other"]],
                    "block": {"transform": "sparkline"}
                }
            }}"#,
        )
        .unwrap();
        let names: Vec<String> = ["monthly", "days", "unknown"].map(String::from).to_vec();
        let plan = crate::bundles::resolve(&catalog, &names, &IndexMap::new());

        let mut ctx = ExecutionContext::default();
        ctx.store("monthly", json!([{"cri_ym": 202501, "visitor_cnt": 1500}]));
        ctx.store("persona", json!([{"ct_09_rt": 40, "we_rt": 30, "wk_rt": 70}]));
        ctx.store("other", json!([{"x": 1}]));

        let blocks = derive_blocks(&plan, &IndexMap::new(), &catalog, &[], &ctx);
        let titles: Vec<&str> = blocks.iter().map(ContentBlock::title).collect();
        assert_eq!(
            titles,
            vec!["Monthly overview", "Visits by time of day", "Visits by weekday"]
        );
        let ContentBlock::Table(table) = &blocks[0] else {
            panic!("expected table");
        };
        assert_eq!(table.rows[0], vec!["2025-01", "1,500"]);
    }

    #[test]
    fn test_transform_skipped_when_rows_missing() {
        let catalog = BundleCatalog::from_json(
            r#"{"bundles": {"hours": {
                "queries": [["filter", "persona_metrics", {}, 1, "persona"]],
                "block": {"transform": "visit_time"}
            }}}"#,
        )
        .unwrap();
        let plan = crate::bundles::resolve(&catalog, &["hours".to_string()], &IndexMap::new());
        let mut ctx = ExecutionContext::default();
        ctx.record_failure(
            "persona",
            json!({"success": false, "error": "timeout"}),
            "persona: timeout".to_string(),
        );
        assert!(derive_blocks(&plan, &IndexMap::new(), &catalog, &[], &ctx).is_empty());
    }

    #[test]
    fn test_map_zoom_is_clamped() {
        let zoom = |value: Value| match api_block(
            &json!({"success": true, "center": {"lat": 1.0, "lng": 2.0}, "zoom": value}),
            &Map::new(),
            "Location",
        ) {
            Some(ContentBlock::Map(map)) => map.zoom,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(zoom(json!(-3)), 0);
        assert_eq!(zoom(json!(15.6)), 16);
        assert_eq!(zoom(json!(40)), 21);
        assert_eq!(zoom(json!("12")), 12);
        assert_eq!(zoom(json!(null)), DEFAULT_MAP_ZOOM);
    }

    #[test]
    fn test_api_block_shapes() {
        let map = api_block(
            &json!({"success": true, "center": {"lat": 37.54, "lng": 127.04}, "zoom": 16}),
            &Map::new(),
            "Location",
        );
        assert!(matches!(map, Some(ContentBlock::Map(ref m)) if m.zoom == 16));

        let air = api_block(
            &json!({"success": true, "data": {"aqi": 42, "pm10": 30}}),
            &Map::new(),
            "Air",
        );
        let Some(ContentBlock::AirQuality(air)) = air else {
            panic!("expected air quality block");
        };
        assert_eq!(air.data.get("aqi"), Some(&json!(42)));

        let image = api_block(
            &json!({"success": true, "static_map_url": "https://maps.example/x.png"}),
            &Map::new(),
            "Static map",
        );
        assert!(matches!(image, Some(ContentBlock::Image(ref i)) if i.alt == "Static map"));

        let unknown = api_block(&json!({"success": true, "status": "ok"}), &Map::new(), "x");
        assert!(unknown.is_none());
    }

    #[test]
    fn test_places_table_uses_configured_columns() {
        let data = json!({
            "success": true,
            "places": [
                {"name": "Seoul Forest", "rating": 4.6, "geometry": {"lat": 1}},
                {"name": "Ttukseom", "rating": null}
            ]
        });
        let Some(ContentBlock::Table(table)) = api_block(&data, &Map::new(), "Nearby") else {
            panic!("expected table");
        };
        assert_eq!(table.headers, vec!["name", "rating"]);
        assert_eq!(table.rows[1], vec!["Ttukseom".to_string(), String::new()]);

        let Some(ContentBlock::Table(table)) =
            api_block(&data, &config(json!({"columns": ["name"]})), "Nearby")
        else {
            panic!("expected table");
        };
        assert_eq!(table.headers, vec!["name"]);
    }

    #[test]
    fn test_derive_blocks_skips_failed_api_results() {
        let catalog = BundleCatalog::from_json(r#"{"bundles": {}}"#).unwrap();
        let plan = ResolvedPlan::default();
        let mut ctx = ExecutionContext::default();
        ctx.store("reviews", json!([{"sns_content_rating": 4}]));
        ctx.store(
            "map",
            json!({"success": true, "center": {"lat": 37.5, "lng": 127.0}}),
        );
        ctx.record_failure(
            "air",
            json!({"success": false, "error": "timeout"}),
            "air: timeout".to_string(),
        );
        let stats = compute_stats(ctx.results(), &[StatKind::Review]);
        let runs = vec![
            ApiRun {
                bundle: "map".to_string(),
                save_as: "map".to_string(),
            },
            ApiRun {
                bundle: "air".to_string(),
                save_as: "air".to_string(),
            },
        ];

        let blocks = derive_blocks(&plan, &stats, &catalog, &runs, &ctx);
        let kinds: Vec<&str> = blocks.iter().map(ContentBlock::kind).collect();
        assert_eq!(kinds, vec!["chart", "map"]);
    }

    #[test]
    fn test_composite_results_yield_member_blocks() {
        let catalog = BundleCatalog::from_json(r#"{"bundles": {}}"#).unwrap();
        let mut ctx = ExecutionContext::default();
        ctx.store(
            "area",
            json!({
                "success": true,
                "api_results": [
                    {"bundle": "map", "data": {"success": true, "center": {"lat": 1.0, "lng": 2.0}}},
                    {"bundle": "air", "data": {"success": false, "error": "down"}},
                    {"bundle": "photo", "data": {"success": true, "url": "https://img.example/a.jpg"}}
                ]
            }),
        );
        let runs = vec![ApiRun {
            bundle: "area".to_string(),
            save_as: "area".to_string(),
        }];
        let blocks = derive_blocks(
            &ResolvedPlan::default(),
            &IndexMap::new(),
            &catalog,
            &runs,
            &ctx,
        );
        let kinds: Vec<&str> = blocks.iter().map(ContentBlock::kind).collect();
        assert_eq!(kinds, vec!["map", "image"]);
    }
}
