use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

use crate::error::ValidationError;

/// Where survey records are kept.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    File,
    /// Lost on restart.
    Memory,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: Backend,
    pub data_dir: PathBuf,
    pub utc_offset_minutes: i32,
    pub quota_bytes: usize,
    pub seed: Vec<Seed>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            storage: Backend::File,
            data_dir: PathBuf::from("data"),
            utc_offset_minutes: 0,
            quota_bytes: 5 * 1024 * 1024,
            seed: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Seed {
    pub path: PathBuf,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Survey {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub published: bool,
    /// Empty when the survey has no password of its own.
    #[serde(default)]
    pub password: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub questions: Vec<Question>,
}

impl Survey {
    pub fn password(&self) -> Option<&str> {
        if self.password.is_empty() {
            None
        } else {
            Some(&self.password)
        }
    }

    /// Checked by the builder before saving. The store itself accepts anything.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::MissingTitle);
        }

        if self.questions.is_empty() {
            return Err(ValidationError::NoQuestions);
        }

        match self
            .questions
            .iter()
            .position(|question| question.question.trim().is_empty())
        {
            Some(index) => Err(ValidationError::MissingQuestionText { index }),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Question {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub kind: QuestionKind,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub required: bool,
}

impl Question {
    pub fn new(id: String, kind: QuestionKind) -> Question {
        Question {
            id,
            kind,
            question: String::new(),
            required: false,
        }
    }

    /// Name of the form field carrying this question's answer.
    pub fn field_name(&self) -> String {
        format!("q_{}", self.id)
    }
}

/// The closed set of question types. Only choice questions carry options and
/// only rating questions carry a scale.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QuestionKind {
    Text,
    Textarea,
    MultipleChoice {
        #[serde(default)]
        options: Vec<String>,
    },
    Checkbox {
        #[serde(default)]
        options: Vec<String>,
    },
    Rating {
        #[serde(rename = "maxRating", default)]
        max_rating: RatingScale,
    },
    YesNo,
    Date,
}

impl QuestionKind {
    /// A kind as the builder creates it, with default options or scale.
    pub fn with_defaults(tag: QuestionType) -> QuestionKind {
        let default_options = || vec!["Option 1".to_string(), "Option 2".to_string()];

        match tag {
            QuestionType::Text => QuestionKind::Text,
            QuestionType::Textarea => QuestionKind::Textarea,
            QuestionType::MultipleChoice => QuestionKind::MultipleChoice {
                options: default_options(),
            },
            QuestionType::Checkbox => QuestionKind::Checkbox {
                options: default_options(),
            },
            QuestionType::Rating => QuestionKind::Rating {
                max_rating: RatingScale::default(),
            },
            QuestionType::YesNo => QuestionKind::YesNo,
            QuestionType::Date => QuestionKind::Date,
        }
    }

    pub fn options(&self) -> Option<&Vec<String>> {
        match self {
            QuestionKind::MultipleChoice { options } | QuestionKind::Checkbox { options } => {
                Some(options)
            }
            _ => None,
        }
    }

    pub fn options_mut(&mut self) -> Option<&mut Vec<String>> {
        match self {
            QuestionKind::MultipleChoice { options } | QuestionKind::Checkbox { options } => {
                Some(options)
            }
            _ => None,
        }
    }
}

/// Question type without its payload, as picked from the builder's toolbar.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum QuestionType {
    Text,
    Textarea,
    MultipleChoice,
    Checkbox,
    Rating,
    YesNo,
    Date,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "u8", into = "u8")]
pub enum RatingScale {
    Five,
    Ten,
}

impl RatingScale {
    pub fn max(self) -> u8 {
        match self {
            RatingScale::Five => 5,
            RatingScale::Ten => 10,
        }
    }
}

impl Default for RatingScale {
    fn default() -> RatingScale {
        RatingScale::Five
    }
}

impl TryFrom<u8> for RatingScale {
    type Error = String;

    fn try_from(max: u8) -> Result<RatingScale, String> {
        match max {
            5 => Ok(RatingScale::Five),
            10 => Ok(RatingScale::Ten),
            other => Err(format!("unsupported rating scale {}", other)),
        }
    }
}

impl From<RatingScale> for u8 {
    fn from(scale: RatingScale) -> u8 {
        scale.max()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Answer {
    Single(String),
    Multiple(Vec<String>),
}

impl Answer {
    /// Rendering used by tables and CSV cells.
    pub fn join(&self, separator: &str) -> String {
        match self {
            Answer::Single(value) => value.clone(),
            Answer::Multiple(values) => values.join(separator),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: String,
    pub survey_id: String,
    pub submitted_at: DateTime<Utc>,
    pub answers: BTreeMap<String, Answer>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn question(id: &str, kind: QuestionKind, text: &str) -> Question {
        Question {
            id: id.into(),
            kind,
            question: text.into(),
            required: false,
        }
    }

    fn survey(title: &str, questions: Vec<Question>) -> Survey {
        Survey {
            id: "s1".into(),
            title: title.into(),
            description: String::new(),
            published: false,
            password: String::new(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            questions,
        }
    }

    #[test]
    fn validate_accepts_complete_survey() {
        let s = survey("Feedback", vec![question("q1", QuestionKind::Text, "Name?")]);
        assert_eq!(s.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_blank_title() {
        let s = survey("   ", vec![question("q1", QuestionKind::Text, "Name?")]);
        assert_eq!(s.validate(), Err(ValidationError::MissingTitle));
    }

    #[test]
    fn validate_rejects_no_questions() {
        let s = survey("Feedback", vec![]);
        assert_eq!(s.validate(), Err(ValidationError::NoQuestions));
    }

    #[test]
    fn validate_reports_first_blank_question() {
        let s = survey(
            "Feedback",
            vec![
                question("q1", QuestionKind::Text, "Name?"),
                question("q2", QuestionKind::Date, " "),
                question("q3", QuestionKind::YesNo, ""),
            ],
        );
        assert_eq!(
            s.validate(),
            Err(ValidationError::MissingQuestionText { index: 1 })
        );
        assert_eq!(
            s.validate().unwrap_err().to_string(),
            "Question 2 is missing question text"
        );
    }

    #[test]
    fn question_json_uses_type_tag() {
        let json = r#"{"id":"q1","type":"rating","question":"How was it?","required":true,"maxRating":10}"#;
        let q: Question = serde_json::from_str(json).unwrap();
        assert_eq!(
            q.kind,
            QuestionKind::Rating {
                max_rating: RatingScale::Ten
            }
        );
        assert!(q.required);

        let value = serde_json::to_value(&q).unwrap();
        assert_eq!(value["type"], "rating");
        assert_eq!(value["maxRating"], 10);
        assert!(value.get("options").is_none());
    }

    #[test]
    fn question_json_without_id_or_scale() {
        let json = r#"{"type":"rating","question":"Score"}"#;
        let q: Question = serde_json::from_str(json).unwrap();
        assert_eq!(q.id, "");
        assert_eq!(
            q.kind,
            QuestionKind::Rating {
                max_rating: RatingScale::Five
            }
        );
        assert!(!q.required);
    }

    #[test]
    fn question_json_rejects_unknown_scale_and_type() {
        let bad_scale = r#"{"type":"rating","question":"Score","maxRating":7}"#;
        assert!(serde_json::from_str::<Question>(bad_scale).is_err());

        let bad_type = r#"{"type":"slider","question":"Score"}"#;
        assert!(serde_json::from_str::<Question>(bad_type).is_err());
    }

    #[test]
    fn choice_question_json_carries_options() {
        let json = r#"{"id":"q","type":"multipleChoice","question":"Pick","options":["A","B"]}"#;
        let q: Question = serde_json::from_str(json).unwrap();
        assert_eq!(q.kind.options().unwrap(), &vec!["A".to_string(), "B".to_string()]);
        assert!(matches!(q.kind, QuestionKind::MultipleChoice { .. }));
    }

    #[test]
    fn answers_round_trip_untagged() {
        let json = r#"{"id":"r","surveyId":"s","submittedAt":"2024-01-02T10:00:00Z","answers":{"a":"Yes","b":["x","y"]}}"#;
        let r: Response = serde_json::from_str(json).unwrap();
        assert_eq!(r.answers["a"], Answer::Single("Yes".into()));
        assert_eq!(
            r.answers["b"],
            Answer::Multiple(vec!["x".into(), "y".into()])
        );
        assert_eq!(r.answers["b"].join("; "), "x; y");
    }

    #[test]
    fn config_defaults_fill_missing_keys() {
        let config: Config = toml::from_str("utc_offset_minutes = 120").unwrap();
        assert_eq!(config.utc_offset_minutes, 120);
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.quota_bytes, 5 * 1024 * 1024);
        assert!(config.seed.is_empty());
    }
}
