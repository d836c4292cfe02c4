use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::models::{Answer, Question, QuestionKind, Response, Survey};

/// Inclusive range over submission days. Either end may be open.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DateFilter {
    #[serde(default, deserialize_with = "blank_as_none")]
    pub from: Option<NaiveDate>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub to: Option<NaiveDate>,
}

/// An unfilled date input arrives as `from=`, which leaves that end open.
fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(date) => date.parse().map(Some).map_err(de::Error::custom),
    }
}

impl DateFilter {
    pub fn is_empty(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }

    /// Responses whose calendar day, in `offset`, falls inside the range. The
    /// input is left as it is.
    pub fn apply<'a>(&self, responses: &'a [Response], offset: &FixedOffset) -> Vec<&'a Response> {
        if self.is_empty() {
            return responses.iter().collect();
        }

        responses
            .iter()
            .filter(|response| self.contains(calendar_date(&response.submitted_at, offset)))
            .collect()
    }
}

pub fn calendar_date(at: &DateTime<Utc>, offset: &FixedOffset) -> NaiveDate {
    at.with_timezone(offset).date_naive()
}

pub fn format_timestamp(at: &DateTime<Utc>, offset: &FixedOffset) -> String {
    at.with_timezone(offset)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Count {
    pub label: String,
    pub count: usize,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "chart", rename_all = "camelCase")]
pub enum Summary {
    /// Observed answers of a single-choice question, in first-seen order.
    Choice { counts: Vec<Count> },
    /// Declared options of a checkbox question, including unpicked ones.
    Options { counts: Vec<Count> },
    Rating {
        counts: Vec<Count>,
        average: f64,
        max: u8,
    },
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionSummary {
    pub question_id: String,
    pub label: String,
    pub summary: Summary,
}

fn increment(counts: &mut Vec<Count>, label: &str) {
    match counts.iter_mut().find(|count| count.label == label) {
        Some(count) => count.count += 1,
        None => counts.push(Count {
            label: label.into(),
            count: 1,
        }),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Text, long text and date questions have no summary.
pub fn summarize(question: &Question, responses: &[&Response]) -> Option<Summary> {
    let answers = responses
        .iter()
        .filter_map(|response| response.answers.get(&question.id));

    match &question.kind {
        QuestionKind::MultipleChoice { .. } | QuestionKind::YesNo => {
            let mut counts = Vec::new();
            for answer in answers {
                if let Answer::Single(value) = answer {
                    if !value.is_empty() {
                        increment(&mut counts, value);
                    }
                }
            }
            Some(Summary::Choice { counts })
        }
        QuestionKind::Checkbox { options } => {
            let mut counts: Vec<Count> = Vec::new();
            for option in options {
                if !counts.iter().any(|count| &count.label == option) {
                    counts.push(Count {
                        label: option.clone(),
                        count: 0,
                    });
                }
            }

            for answer in answers {
                if let Answer::Multiple(values) = answer {
                    for value in values {
                        if let Some(count) = counts.iter_mut().find(|count| &count.label == value) {
                            count.count += 1;
                        }
                    }
                }
            }
            Some(Summary::Options { counts })
        }
        QuestionKind::Rating { max_rating } => {
            let max = max_rating.max();
            let mut counts = (1..=max)
                .map(|value| Count {
                    label: value.to_string(),
                    count: 0,
                })
                .collect::<Vec<_>>();

            let ratings = answers
                .filter_map(|answer| match answer {
                    Answer::Single(value) => value.trim().parse::<u8>().ok(),
                    Answer::Multiple(_) => None,
                })
                .filter(|rating| (1..=max).contains(rating))
                .collect::<Vec<_>>();

            for rating in &ratings {
                counts[usize::from(*rating) - 1].count += 1;
            }

            let average = if ratings.is_empty() {
                0.0
            } else {
                let sum: u32 = ratings.iter().map(|&rating| u32::from(rating)).sum();
                round2(f64::from(sum) / ratings.len() as f64)
            };

            Some(Summary::Rating {
                counts,
                average,
                max,
            })
        }
        QuestionKind::Text | QuestionKind::Textarea | QuestionKind::Date => None,
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total: usize,
    pub first: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
    /// Only finished submissions are ever stored, so this is 100 whenever
    /// there is anything to report.
    pub completion_rate: Option<u8>,
}

pub fn stats(responses: &[&Response], offset: &FixedOffset) -> Stats {
    let first = responses.iter().map(|response| response.submitted_at).min();
    let latest = responses.iter().map(|response| response.submitted_at).max();

    Stats {
        total: responses.len(),
        first: first.map(|at| calendar_date(&at, offset)),
        latest: latest.map(|at| calendar_date(&at, offset)),
        completion_rate: if responses.is_empty() { None } else { Some(100) },
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ResponseTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

pub fn response_table(survey: &Survey, responses: &[&Response], offset: &FixedOffset) -> ResponseTable {
    let header = std::iter::once("Submitted At".to_string())
        .chain(
            survey
                .questions
                .iter()
                .enumerate()
                .map(|(index, question)| format!("{}. {}", index + 1, question.question)),
        )
        .collect();

    let rows = responses
        .iter()
        .map(|response| {
            std::iter::once(format_timestamp(&response.submitted_at, offset))
                .chain(survey.questions.iter().map(|question| {
                    match response.answers.get(&question.id) {
                        Some(Answer::Multiple(values)) => values.join(", "),
                        Some(Answer::Single(value)) if !value.is_empty() => value.clone(),
                        _ => "-".to_string(),
                    }
                }))
                .collect()
        })
        .collect();

    ResponseTable { header, rows }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsReport {
    pub survey_id: String,
    pub title: String,
    pub filter: DateFilter,
    pub stats: Stats,
    pub summaries: Vec<QuestionSummary>,
    pub table: ResponseTable,
}

impl AnalyticsReport {
    /// Recomputed from the full response set each time, so clearing the
    /// filter brings every response back.
    pub fn build(
        survey: &Survey,
        responses: &[Response],
        filter: DateFilter,
        offset: &FixedOffset,
    ) -> AnalyticsReport {
        let filtered = filter.apply(responses, offset);

        let summaries = if filtered.is_empty() {
            Vec::new()
        } else {
            survey
                .questions
                .iter()
                .enumerate()
                .filter_map(|(index, question)| {
                    summarize(question, &filtered).map(|summary| QuestionSummary {
                        question_id: question.id.clone(),
                        label: format!("{}. {}", index + 1, question.question),
                        summary,
                    })
                })
                .collect()
        };

        AnalyticsReport {
            survey_id: survey.id.clone(),
            title: survey.title.clone(),
            filter,
            stats: stats(&filtered, offset),
            summaries,
            table: response_table(survey, &filtered, offset),
        }
    }
}
