use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("settings parse error: {0}")]
    Parse(String),
    #[error("invalid settings: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExperimentSettings {
    #[serde(rename = "googleMapsAPIKey")]
    pub google_maps_api_key: String,
    pub clip_text_model_path: String,
    pub clip_image_model_path: String,
    pub experimental_data_store_path: String,
    #[serde(rename = "azureAPIUrl")]
    pub azure_api_url: String,
    #[serde(rename = "azureAPIKey")]
    pub azure_api_key: String,
    #[serde(rename = "googleTTSAPIKey")]
    pub google_tts_api_key: String,
    pub run_info: Vec<RunInfo>,
    pub trial_info: TrialInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunInfo {
    pub city: String,
    pub latlng: LatLng,
    pub caption_target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TrialInfo {
    pub capture_interval_in_ms: u64,
    pub total_number_of_trials: u32,
    pub fixation_duration_in_ms: u64,
    pub fixation_jitter_ratio: f64,
    pub capture_preview_duration_in_ms: u64,
    pub multimodal_duration_in_ms: u64,
    pub speaking_rate: f64,
    // Key spelling matches existing settings files.
    #[serde(rename = "propabilityOfCaptionText")]
    pub probability_of_caption_text: f64,
    pub reward_duration_in_ms: u64,
    pub min_similarity_threshold: f64,
    pub max_similarity_threshold: f64,
}

impl Default for TrialInfo {
    fn default() -> Self {
        Self {
            capture_interval_in_ms: 20_000,
            total_number_of_trials: 8,
            fixation_duration_in_ms: 5_000,
            fixation_jitter_ratio: 0.2,
            capture_preview_duration_in_ms: 2_000,
            multimodal_duration_in_ms: 2_000,
            speaking_rate: 1.2,
            probability_of_caption_text: 0.5,
            reward_duration_in_ms: 2_000,
            min_similarity_threshold: 0.18,
            max_similarity_threshold: 0.28,
        }
    }
}

impl TrialInfo {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.total_number_of_trials == 0 {
            problems.push("trialInfo.totalNumberOfTrials must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.fixation_jitter_ratio) {
            problems.push(format!(
                "trialInfo.fixationJitterRatio must be within [0, 1] (found {})",
                self.fixation_jitter_ratio
            ));
        }
        if !(0.0..=1.0).contains(&self.probability_of_caption_text) {
            problems.push(format!(
                "trialInfo.propabilityOfCaptionText must be within [0, 1] (found {})",
                self.probability_of_caption_text
            ));
        }
        if self.speaking_rate.is_nan() || self.speaking_rate <= 0.0 {
            problems.push(format!(
                "trialInfo.speakingRate must be positive (found {})",
                self.speaking_rate
            ));
        }
        if self.min_similarity_threshold.partial_cmp(&self.max_similarity_threshold)
            != Some(std::cmp::Ordering::Less)
        {
            problems.push(format!(
                "trialInfo.minSimilarityThreshold ({}) must be below maxSimilarityThreshold ({})",
                self.min_similarity_threshold, self.max_similarity_threshold
            ));
        }
        if self.capture_interval_in_ms == 0 {
            problems.push("trialInfo.captureIntervalInMs must be positive".to_string());
        }
        problems
    }
}

impl ExperimentSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut problems = Vec::new();
        if self.experimental_data_store_path.trim().is_empty() {
            problems.push("experimentalDataStorePath is empty".to_string());
        }
        if self.run_info.is_empty() {
            problems.push("runInfo must list at least one run".to_string());
        }
        for (idx, run) in self.run_info.iter().enumerate() {
            if run.city.trim().is_empty() {
                problems.push(format!("runInfo[{}].city is empty", idx));
            }
            if run.caption_target.trim().is_empty() {
                problems.push(format!("runInfo[{}].captionTarget is empty", idx));
            }
        }
        problems.extend(self.trial_info.validate());
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Invalid(problems))
        }
    }

    pub fn data_root(&self) -> PathBuf {
        PathBuf::from(&self.experimental_data_store_path)
    }
}

pub fn parse_settings(raw: &str, yaml: bool) -> Result<ExperimentSettings, SettingsError> {
    let settings: ExperimentSettings = if yaml {
        serde_yaml::from_str(raw).map_err(|e| SettingsError::Parse(e.to_string()))?
    } else {
        serde_json::from_str(raw).map_err(|e| SettingsError::Parse(e.to_string()))?
    };
    settings.validate()?;
    Ok(settings)
}

pub fn load_settings(path: &Path) -> Result<ExperimentSettings, SettingsError> {
    let raw = fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let yaml = matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    );
    parse_settings(&raw, yaml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!({
            "googleMapsAPIKey": "maps",
            "clipTextModelPath": "/models/text.onnx",
            "clipImageModelPath": "/models/image.onnx",
            "experimentalDataStorePath": "/data",
            "azureAPIUrl": "https://cv.example/describe",
            "azureAPIKey": "azure",
            "googleTTSAPIKey": "tts",
            "runInfo": [
                { "city": "New York", "latlng": { "lat": 40.7, "lng": -74.0 }, "captionTarget": "a yellow taxi" },
                { "city": "Paris", "latlng": { "lat": 48.8, "lng": 2.3 }, "captionTarget": "a cafe terrace" }
            ],
            "trialInfo": {
                "captureIntervalInMs": 20000,
                "totalNumberOfTrials": 2,
                "fixationDurationInMs": 1000,
                "fixationJitterRatio": 0.0,
                "capturePreviewDurationInMs": 500,
                "multimodalDurationInMs": 500,
                "speakingRate": 1.2,
                "propabilityOfCaptionText": 1.0,
                "rewardDurationInMs": 500,
                "minSimilarityThreshold": 0.2,
                "maxSimilarityThreshold": 0.3
            }
        })
    }

    #[test]
    fn parses_complete_settings() {
        let settings = parse_settings(&sample().to_string(), false).expect("valid settings");
        assert_eq!(settings.run_info.len(), 2);
        assert_eq!(settings.run_info[0].caption_target, "a yellow taxi");
        assert_eq!(settings.trial_info.total_number_of_trials, 2);
        assert_eq!(settings.trial_info.probability_of_caption_text, 1.0);
        assert_eq!(settings.data_root(), PathBuf::from("/data"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut value = sample();
        value["trialInfo"]["extraKnob"] = json!(1);
        let err = parse_settings(&value.to_string(), false).expect_err("unknown field");
        assert!(matches!(err, SettingsError::Parse(_)), "{}", err);
        assert!(err.to_string().contains("extraKnob"), "{}", err);
    }

    #[test]
    fn rejects_missing_fields() {
        let mut value = sample();
        value
            .as_object_mut()
            .expect("object")
            .remove("azureAPIKey");
        let err = parse_settings(&value.to_string(), false).expect_err("missing field");
        assert!(err.to_string().contains("azureAPIKey"), "{}", err);
    }

    #[test]
    fn reports_every_semantic_violation() {
        let mut value = sample();
        value["runInfo"] = json!([]);
        value["trialInfo"]["totalNumberOfTrials"] = json!(0);
        value["trialInfo"]["minSimilarityThreshold"] = json!(0.4);
        let err = parse_settings(&value.to_string(), false).expect_err("invalid");
        match err {
            SettingsError::Invalid(problems) => {
                assert_eq!(problems.len(), 3, "{:?}", problems);
                assert!(problems.iter().any(|p| p.contains("runInfo")));
                assert!(problems.iter().any(|p| p.contains("totalNumberOfTrials")));
                assert!(problems.iter().any(|p| p.contains("minSimilarityThreshold")));
            }
            other => panic!("expected Invalid, got {}", other),
        }
    }

    #[test]
    fn accepts_yaml_settings() {
        let yaml = serde_yaml::to_string(&sample()).expect("yaml");
        let settings = parse_settings(&yaml, true).expect("yaml settings");
        assert_eq!(settings.run_info[1].city, "Paris");
    }

    #[test]
    fn default_trial_info_is_valid() {
        assert!(TrialInfo::default().validate().is_empty());
    }
}
