use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use super::{as_f64, decimal_text, round_to};

pub const RATING_COLUMN: &str = "sns_content_rating";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatingBucket {
    pub count: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewStats {
    pub total_reviews: usize,
    pub average_rating: f64,
    /// Keyed `"5"` down to `"1"`.
    pub rating_distribution: IndexMap<String, RatingBucket>,
    pub summary: String,
}

impl ReviewStats {
    pub fn bucket(&self, stars: u8) -> Option<&RatingBucket> {
        self.rating_distribution.get(&stars.to_string())
    }
}

/// Buckets ratings by rounding to the nearest star, halves to the even star.
/// Ratings that are not numeric or round outside 1..=5 are ignored.
pub fn review_stats(rows: &[Value]) -> ReviewStats {
    if rows.is_empty() {
        return ReviewStats {
            total_reviews: 0,
            average_rating: 0.0,
            rating_distribution: IndexMap::new(),
            summary: "No review data available.".to_string(),
        };
    }

    let mut counts = [0usize; 5];
    let mut total = 0usize;
    let mut sum = 0.0;
    for rating in rows
        .iter()
        .filter_map(|row| row.get(RATING_COLUMN))
        .filter_map(as_f64)
    {
        let stars = rating.round_ties_even();
        if (1.0..=5.0).contains(&stars) {
            counts[stars as usize - 1] += 1;
            total += 1;
            sum += rating;
        }
    }

    let average = if total > 0 {
        round_to(sum / total as f64, 2)
    } else {
        0.0
    };

    let mut distribution = IndexMap::new();
    let mut top: Option<(u8, usize)> = None;
    for stars in (1..=5u8).rev() {
        let count = counts[stars as usize - 1];
        let percent = if total > 0 {
            round_to(count as f64 / total as f64 * 100.0, 1)
        } else {
            0.0
        };
        distribution.insert(stars.to_string(), RatingBucket { count, percent });
        if top.is_none_or(|(_, best)| count > best) {
            top = Some((stars, count));
        }
    }

    let summary = match top {
        Some((stars, _)) if total > 0 => {
            let percent = decimal_text(distribution[&stars.to_string()].percent);
            let average = decimal_text(average);
            format!(
                "Average {average} stars over {total} reviews. {stars}-star reviews are the most common at {percent}%."
            )
        }
        _ => "No valid ratings found.".to_string(),
    };

    ReviewStats {
        total_reviews: total,
        average_rating: average,
        rating_distribution: distribution,
        summary,
    }
}
