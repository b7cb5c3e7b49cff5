use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RewardScore {
    pub similarity: f64,
    pub percent: f64,
}

impl RewardScore {
    pub const ZERO: RewardScore = RewardScore {
        similarity: 0.0,
        percent: 0.0,
    };

    pub fn log_message(&self) -> String {
        format!(
            "trial_reward:{}/percent:{}",
            self.similarity, self.percent
        )
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    similarity.is_finite().then_some(similarity)
}

pub fn percent_for(similarity: f64, min: f64, max: f64) -> f64 {
    if similarity < min {
        0.0
    } else if similarity > max {
        100.0
    } else {
        (similarity - min) / (max - min) * 100.0
    }
}

pub fn score(image: Option<&[f32]>, text: Option<&[f32]>, min: f64, max: f64) -> RewardScore {
    let (Some(image), Some(text)) = (image, text) else {
        return RewardScore::ZERO;
    };
    match cosine_similarity(image, text) {
        Some(similarity) => RewardScore {
            similarity,
            percent: percent_for(similarity, min, max),
        },
        None => RewardScore::ZERO,
    }
}
