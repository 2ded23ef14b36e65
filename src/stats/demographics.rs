use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use super::{as_f64, decimal_text, round_to};

pub const AGE_GROUPS: [&str; 6] = ["20", "30", "40", "50", "60", "70"];

/// Known column-naming conventions of demographics sources, in detection
/// priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DemographicsSchema {
    /// Telecom visitor totals: `m_20`, `f_20`, ... already in percent.
    CarrierTotals,
    /// Card-member shares: `mrcno_pct_20_male`, ... as fractions.
    CardMembers,
    /// Persona shares: `persona_pct_20_male`, ... as fractions.
    Persona,
}

impl DemographicsSchema {
    pub const PRIORITY: [DemographicsSchema; 3] = [
        DemographicsSchema::CarrierTotals,
        DemographicsSchema::CardMembers,
        DemographicsSchema::Persona,
    ];

    pub fn signature(self) -> &'static str {
        match self {
            DemographicsSchema::CarrierTotals => "m_20",
            DemographicsSchema::CardMembers => "mrcno_pct_20_male",
            DemographicsSchema::Persona => "persona_pct_20_male",
        }
    }

    fn columns(self, age: &str) -> (String, String) {
        match self {
            DemographicsSchema::CarrierTotals => (format!("m_{age}"), format!("f_{age}")),
            DemographicsSchema::CardMembers => (
                format!("mrcno_pct_{age}_male"),
                format!("mrcno_pct_{age}_female"),
            ),
            DemographicsSchema::Persona => (
                format!("persona_pct_{age}_male"),
                format!("persona_pct_{age}_female"),
            ),
        }
    }

    fn scale(self) -> f64 {
        match self {
            DemographicsSchema::CarrierTotals => 1.0,
            DemographicsSchema::CardMembers | DemographicsSchema::Persona => 100.0,
        }
    }

    /// First schema whose signature column is present in `record`.
    pub fn detect(record: &serde_json::Map<String, Value>) -> Option<Self> {
        Self::PRIORITY
            .into_iter()
            .find(|schema| record.contains_key(schema.signature()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenderDistribution {
    pub male: f64,
    pub female: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DemographicsStats {
    pub has_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<DemographicsSchema>,
    /// Percent per age group, keyed `"20s"` .. `"70s"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_distribution: Option<IndexMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender_distribution: Option<GenderDistribution>,
    pub summary: String,
}

impl DemographicsStats {
    fn no_data(schema: Option<DemographicsSchema>, summary: &str) -> Self {
        Self {
            has_data: false,
            schema,
            age_distribution: None,
            gender_distribution: None,
            summary: summary.to_string(),
        }
    }
}

/// Age and gender shares from the first record.
pub fn demographics_stats(rows: &[Value]) -> DemographicsStats {
    let Some(record) = rows.first().and_then(Value::as_object) else {
        return DemographicsStats::no_data(None, "No demographics data available.");
    };

    let Some(schema) = DemographicsSchema::detect(record) else {
        let keys: Vec<&str> = record.keys().take(15).map(String::as_str).collect();
        tracing::warn!(?keys, "Unrecognized demographics schema");
        return DemographicsStats::no_data(None, "Demographics data format not recognized.");
    };
    tracing::debug!(?schema, "Demographics schema detected");

    let value_of = |column: &str| {
        record
            .get(column)
            .and_then(as_f64)
            .unwrap_or(0.0)
            * schema.scale()
    };

    let mut ages = IndexMap::new();
    let (mut male, mut female) = (0.0, 0.0);
    for age in AGE_GROUPS {
        let (male_col, female_col) = schema.columns(age);
        let (m, f) = (value_of(&male_col), value_of(&female_col));
        ages.insert(format!("{age}s"), round_to(m + f, 1));
        male += m;
        female += f;
    }

    if ages.values().all(|&v| v == 0.0) {
        return DemographicsStats::no_data(Some(schema), "Demographics data is empty.");
    }

    let (top_age, top_pct) = ages
        .iter()
        .fold(None::<(&String, f64)>, |best, (age, &pct)| match best {
            Some((_, best_pct)) if best_pct >= pct => best,
            _ => Some((age, pct)),
        })
        .map(|(age, pct)| (age.clone(), pct))
        .unwrap_or_default();

    let male = round_to(male, 1);
    let female = round_to(female, 1);
    let (male_text, female_text) = (decimal_text(male), decimal_text(female));
    let gender_summary = if female > male {
        format!("female {female_text}% > male {male_text}%")
    } else {
        format!("male {male_text}% > female {female_text}%")
    };
    let top_text = decimal_text(top_pct);

    DemographicsStats {
        has_data: true,
        schema: Some(schema),
        summary: format!("Main visitors: {top_age} ({top_text}%). {gender_summary}"),
        age_distribution: Some(ages),
        gender_distribution: Some(GenderDistribution { male, female }),
    }
}
