use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest rating a report may carry.
pub const MAX_RATING: u8 = 100;

/// End-of-session performance report produced by the feedback service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackReport {
    pub rating: u8,
    pub summary: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatingBand {
    Excellent,
    VeryGood,
    Good,
    Fair,
    NeedsImprovement,
}

impl RatingBand {
    pub fn from_rating(rating: u8) -> Self {
        match rating {
            90.. => RatingBand::Excellent,
            80..=89 => RatingBand::VeryGood,
            60..=79 => RatingBand::Good,
            40..=59 => RatingBand::Fair,
            _ => RatingBand::NeedsImprovement,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RatingBand::Excellent => "Excellent",
            RatingBand::VeryGood => "Very Good",
            RatingBand::Good => "Good",
            RatingBand::Fair => "Fair",
            RatingBand::NeedsImprovement => "Needs Improvement",
        }
    }
}

impl FeedbackReport {
    /// Parses a feedback payload. Anything that is not the expected shape,
    /// including a rating above 100, is rejected.
    pub fn from_json(payload: &str) -> Result<Self, String> {
        let report: FeedbackReport =
            serde_json::from_str(payload).map_err(|e| format!("invalid feedback payload: {e}"))?;
        if report.rating > MAX_RATING {
            return Err(format!("rating {} is outside 0-{MAX_RATING}", report.rating));
        }
        Ok(report)
    }

    pub fn band(&self) -> RatingBand {
        RatingBand::from_rating(self.rating)
    }
}

impl fmt::Display for FeedbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Rating: {}/100 ({})", self.rating, self.band().label())?;
        writeln!(f, "{}", self.summary)?;
        for (title, items) in [
            ("Strengths", &self.strengths),
            ("Weaknesses", &self.weaknesses),
            ("Improvements", &self.improvements),
        ] {
            if items.is_empty() {
                continue;
            }
            writeln!(f, "\n{title}:")?;
            for item in items {
                writeln!(f, "  - {item}")?;
            }
        }
        Ok(())
    }
}
